//! Per-group serialization: one handler at a time per group, parallel mode
//! opting out, and with-resource tasks entering the same queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use resling_core::{Handler, Service};
use resling_test::TestService;
use serde_json::json;
use tokio::sync::Semaphore;

/// Shared instrumentation for blocking handlers: counts concurrently
/// running handlers and parks them on a semaphore until released.
struct Gate {
    permits: Semaphore,
    active: AtomicUsize,
    max_active: AtomicUsize,
    started: AtomicUsize,
}

impl Gate {
    fn new() -> Arc<Gate> {
        Arc::new(Gate {
            permits: Semaphore::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
        })
    }

    async fn enter(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let permit = self.permits.acquire().await.expect("gate closed");
        permit.forget();
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_resource_requests_are_serialized() {
    let gate = Gate::new();
    let handler_gate = gate.clone();

    let svc = Service::new("test");
    svc.handle(
        "model",
        Handler::new().get_model(move |r: resling_core::GetRequest| {
            let gate = handler_gate.clone();
            async move {
                gate.enter().await;
                r.model(json!({ "ok": true }))
            }
        }),
    );
    let ts = TestService::start(svc).await;

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(ts.request("get.test.model", b"{}".as_slice()));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Only the first handler may have started; the rest wait in the group
    // queue.
    assert_eq!(gate.started.load(Ordering::SeqCst), 1);

    gate.release(3);
    for mut req in requests {
        let reply = req.response().await;
        assert_eq!(reply, json!({ "result": { "model": { "ok": true } } }));
    }
    assert_eq!(gate.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(gate.started.load(Ordering::SeqCst), 3);
    ts.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_resources_run_concurrently() {
    let gate = Gate::new();
    let handler_gate = gate.clone();

    let svc = Service::new("test");
    svc.handle(
        "model.$id",
        Handler::new().get_model(move |r: resling_core::GetRequest| {
            let gate = handler_gate.clone();
            async move {
                gate.enter().await;
                r.model(json!({}))
            }
        }),
    );
    let ts = TestService::start(svc).await;

    let mut requests = Vec::new();
    for i in 0..3 {
        requests.push(ts.request(&format!("get.test.model.{i}"), b"{}".as_slice()));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Each resource is its own group; all three handlers start.
    assert_eq!(gate.started.load(Ordering::SeqCst), 3);
    gate.release(3);
    for mut req in requests {
        req.response().await;
    }
    ts.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_template_serializes_across_resources() {
    let gate = Gate::new();
    let handler_gate = gate.clone();

    let svc = Service::new("test");
    svc.handle(
        "model.$id",
        Handler::new()
            .group("model")
            .get_model(move |r: resling_core::GetRequest| {
                let gate = handler_gate.clone();
                async move {
                    gate.enter().await;
                    r.model(json!({}))
                }
            }),
    );
    let ts = TestService::start(svc).await;

    let mut requests = Vec::new();
    for i in 0..3 {
        requests.push(ts.request(&format!("get.test.model.{i}"), b"{}".as_slice()));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Distinct resources, shared group: still one at a time.
    assert_eq!(gate.started.load(Ordering::SeqCst), 1);
    gate.release(3);
    for mut req in requests {
        req.response().await;
    }
    assert_eq!(gate.max_active.load(Ordering::SeqCst), 1);
    ts.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_handlers_bypass_the_group_queue() {
    let gate = Gate::new();
    let handler_gate = gate.clone();

    let svc = Service::new("test");
    svc.handle(
        "model",
        Handler::new()
            .parallel()
            .get_model(move |r: resling_core::GetRequest| {
                let gate = handler_gate.clone();
                async move {
                    gate.enter().await;
                    r.model(json!({}))
                }
            }),
    );
    let ts = TestService::start(svc).await;

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(ts.request("get.test.model", b"{}".as_slice()));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(gate.started.load(Ordering::SeqCst), 3);
    gate.release(3);
    for mut req in requests {
        req.response().await;
    }
    ts.stop().await;
}

// Deterministic on the current-thread runtime: workers pop and claim the
// group without yielding in between.
#[tokio::test]
async fn requests_in_one_group_execute_in_arrival_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = order.clone();

    let svc = Service::new("test");
    svc.handle(
        "model",
        Handler::new().call("mark", move |r: resling_core::CallRequest| {
            let sink = sink.clone();
            async move {
                let n: HashMap<String, i64> = r.parse_params()?;
                sink.lock().unwrap().push(n["n"]);
                r.ok(())
            }
        }),
    );
    let ts = TestService::start(svc).await;

    let mut requests = Vec::new();
    for n in 0..5 {
        requests.push(ts.request(
            "call.test.model.mark",
            serde_json::to_vec(&json!({ "params": { "n": n } })).unwrap(),
        ));
    }
    for mut req in requests {
        req.response().await;
    }
    assert_eq!(&*order.lock().unwrap(), &[0, 1, 2, 3, 4]);
    ts.stop().await;
}

// ── With-resource and with-group tasks ──────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn with_resource_emits_events_outside_requests() {
    let svc = Service::new("test");
    svc.handle(
        "model",
        Handler::model().get_model(|r: resling_core::GetRequest| async move {
            r.model(json!({}))
        }),
    );
    let ts = TestService::start(svc).await;

    ts.service()
        .with_resource("test.model", |r| async move {
            let mut values = HashMap::new();
            values.insert("foo".to_string(), json!("bar"));
            let _ = r.change_event(values).await;
        })
        .await
        .unwrap();

    let event = ts.bus.expect_published_on("event.test.model.change").await;
    assert_eq!(event.json(), json!({ "values": { "foo": "bar" } }));
    ts.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn with_resource_requires_a_matching_handler() {
    let svc = Service::new("test");
    svc.handle(
        "model",
        Handler::model().get_model(|r: resling_core::GetRequest| async move {
            r.model(json!({}))
        }),
    );
    let ts = TestService::start(svc).await;

    let err = ts
        .service()
        .with_resource("test.unknown", |_r| async move {})
        .await
        .unwrap_err();
    assert!(matches!(err, resling_core::ServiceError::NoHandler(_)));
    ts.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn with_resource_is_serialized_with_requests() {
    let gate = Gate::new();
    let handler_gate = gate.clone();

    let svc = Service::new("test");
    svc.handle(
        "model",
        Handler::new().get_model(move |r: resling_core::GetRequest| {
            let gate = handler_gate.clone();
            async move {
                gate.enter().await;
                r.model(json!({}))
            }
        }),
    );
    let ts = TestService::start(svc).await;

    // Park a get handler on the group.
    let mut req = ts.request("get.test.model", b"{}".as_slice());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(gate.started.load(Ordering::SeqCst), 1);

    // The injected task must wait for the handler to finish.
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_in = ran.clone();
    ts.service()
        .with_resource("test.model", move |_r| async move {
            ran_in.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    gate.release(1);
    req.response().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    ts.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn with_resource_from_own_handler_runs_inline() {
    let svc = Service::new("test");
    svc.handle(
        "model",
        Handler::model().call("touch", |r: resling_core::CallRequest| async move {
            let service = r.service();
            let marker = Arc::new(AtomicUsize::new(0));
            let marker_in = marker.clone();
            // Scheduling onto our own group would have to wait for this very
            // handler; it runs inline instead of deadlocking.
            service
                .with_resource("test.model", move |_r| async move {
                    marker_in.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .map_err(|e| resling_core::Error::internal(e.to_string()))?;
            r.ok(json!({ "ran": marker.load(Ordering::SeqCst) }))
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.call("test.model", "touch", &json!({})).await;
    assert_eq!(reply, json!({ "result": { "ran": 1 } }));
    ts.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn with_group_runs_under_the_named_group() {
    let gate = Gate::new();
    let handler_gate = gate.clone();

    let svc = Service::new("test");
    svc.handle(
        "model",
        Handler::new()
            .group("shared")
            .get_model(move |r: resling_core::GetRequest| {
                let gate = handler_gate.clone();
                async move {
                    gate.enter().await;
                    r.model(json!({}))
                }
            }),
    );
    let ts = TestService::start(svc).await;

    let mut req = ts.request("get.test.model", b"{}".as_slice());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_in = ran.clone();
    ts.service()
        .with_group("shared", move |_s| async move {
            ran_in.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    gate.release(1);
    req.response().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    ts.stop().await;
}
