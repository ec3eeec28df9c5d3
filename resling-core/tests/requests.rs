//! Request dispatch: response shapes, error propagation, pre-responses,
//! and the exactly-one-response guarantee.

use std::time::Duration;

use resling_core::{Error, Handler, Service};
use resling_test::{parse_pre_response, TestService};
use serde_json::json;

fn service(name: &str) -> Service {
    Service::new(name)
}

// ── Get requests ────────────────────────────────────────────────────────

#[tokio::test]
async fn get_model_with_path_param() {
    let svc = service("foo");
    svc.handle(
        "bar.$id",
        Handler::new().get_model(|r: resling_core::GetRequest| async move {
            let id = r.path_param("id").unwrap_or("").to_string();
            r.model(json!({ "msg": id }))
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.get("foo.bar.42").await;
    assert_eq!(reply, json!({ "result": { "model": { "msg": "42" } } }));
    ts.stop().await;
}

#[tokio::test]
async fn get_collection() {
    let svc = service("test");
    svc.handle(
        "collection",
        Handler::new().get_collection(|r: resling_core::GetRequest| async move {
            r.collection(json!(["a", "b"]))
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.get("test.collection").await;
    assert_eq!(reply, json!({ "result": { "collection": ["a", "b"] } }));
    ts.stop().await;
}

#[tokio::test]
async fn get_model_with_query() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::new().get_model(|r: resling_core::GetRequest| async move {
            let q = r.query().to_string();
            r.model_query(json!({ "q": q }), &q)
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts
        .request("get.test.model", br#"{"query":"limit=5"}"#.as_slice())
        .response()
        .await;
    assert_eq!(
        reply,
        json!({ "result": { "model": { "q": "limit=5" }, "query": "limit=5" } })
    );
    ts.stop().await;
}

#[tokio::test]
async fn get_without_handler_is_not_found() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::model().call("set", |r: resling_core::CallRequest| async move { r.ok(()) }),
    );
    // A second entry with a get hook, so the get subject is subscribed at
    // all and the request reaches the router.
    svc.handle(
        "other",
        Handler::new().get_model(|r: resling_core::GetRequest| async move {
            r.model(json!({}))
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.get("test.model").await;
    assert_eq!(reply["error"]["code"], "system.notFound");
    ts.stop().await;
}

#[tokio::test]
async fn root_resource_is_reachable_on_bare_subjects() {
    let svc = service("test");
    // The empty pattern serves the service's own top-level resource, whose
    // get and access subjects carry no trailing tokens.
    svc.handle(
        "",
        Handler::new()
            .access_granted()
            .get_model(|r: resling_core::GetRequest| async move {
                r.model(json!({ "root": true }))
            })
            .call("ping", |r: resling_core::CallRequest| async move {
                r.ok(json!("pong"))
            }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.get("test").await;
    assert_eq!(reply, json!({ "result": { "model": { "root": true } } }));

    let reply = ts.access("test", &json!({ "cid": "c1" })).await;
    assert_eq!(reply, json!({ "result": { "get": true, "call": "*" } }));

    let reply = ts.call("test", "ping", &json!({})).await;
    assert_eq!(reply, json!({ "result": "pong" }));
    ts.stop().await;
}

#[tokio::test]
async fn get_unknown_resource_is_not_found() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::new().get_model(|r: resling_core::GetRequest| async move {
            r.model(json!({}))
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.get("test.nothing.here").await;
    assert_eq!(reply["error"]["code"], "system.notFound");
    ts.stop().await;
}

// ── Call requests ───────────────────────────────────────────────────────

#[tokio::test]
async fn call_with_params() {
    #[derive(serde::Deserialize)]
    struct Params {
        count: i64,
    }

    let svc = service("test");
    svc.handle(
        "model",
        Handler::new().call("double", |r: resling_core::CallRequest| async move {
            let p: Params = r.parse_params()?;
            r.ok(json!({ "count": p.count * 2 }))
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts
        .call("test.model", "double", &json!({ "params": { "count": 21 } }))
        .await;
    assert_eq!(reply, json!({ "result": { "count": 42 } }));

    let reply = ts
        .call("test.model", "double", &json!({ "params": { "count": "x" } }))
        .await;
    assert_eq!(reply["error"]["code"], "system.invalidParams");
    ts.stop().await;
}

#[tokio::test]
async fn call_unknown_method_is_method_not_found() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::new().call("set", |r: resling_core::CallRequest| async move { r.ok(()) }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.call("test.model", "missing", &json!({})).await;
    assert_eq!(reply["error"]["code"], "system.methodNotFound");
    ts.stop().await;
}

#[tokio::test]
async fn call_responding_with_resource_reference() {
    let svc = service("test");
    svc.handle(
        "collection",
        Handler::collection().call("new", |r: resling_core::CallRequest| async move {
            r.resource("test.model.7")
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.call("test.collection", "new", &json!({})).await;
    assert_eq!(reply, json!({ "resource": { "rid": "test.model.7" } }));
    ts.stop().await;
}

#[tokio::test]
async fn legacy_new_handler_is_dispatched_for_new_method() {
    #[allow(deprecated)]
    let handler = Handler::collection().new_call(|r: resling_core::NewRequest| async move {
        r.new_resource("test.model.8")
    });
    let svc = service("test");
    svc.handle("collection", handler);
    let ts = TestService::start(svc).await;

    let reply = ts.call("test.collection", "new", &json!({})).await;
    assert_eq!(reply, json!({ "result": { "rid": "test.model.8" } }));
    ts.stop().await;
}

#[tokio::test]
async fn explicit_new_call_overrides_legacy_handler() {
    #[allow(deprecated)]
    let handler = Handler::collection()
        .new_call(|r: resling_core::NewRequest| async move { r.new_resource("test.legacy") })
        .call("new", |r: resling_core::CallRequest| async move {
            r.resource("test.modern")
        });
    let svc = service("test");
    svc.handle("collection", handler);
    let ts = TestService::start(svc).await;

    let reply = ts.call("test.collection", "new", &json!({})).await;
    assert_eq!(reply, json!({ "resource": { "rid": "test.modern" } }));
    ts.stop().await;
}

// ── Access and auth requests ────────────────────────────────────────────

#[tokio::test]
async fn access_granted_and_denied() {
    let svc = service("test");
    svc.handle("open", Handler::new().access_granted());
    svc.handle(
        "closed",
        Handler::new().access(|r: resling_core::AccessRequest| async move {
            r.access_denied()
        }),
    );
    svc.handle(
        "partial",
        Handler::new().access(|r: resling_core::AccessRequest| async move {
            r.access(true, "")
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.access("test.open", &json!({ "cid": "c1" })).await;
    assert_eq!(reply, json!({ "result": { "get": true, "call": "*" } }));

    let reply = ts.access("test.closed", &json!({ "cid": "c1" })).await;
    assert_eq!(reply["error"]["code"], "system.accessDenied");

    let reply = ts.access("test.partial", &json!({ "cid": "c1" })).await;
    assert_eq!(reply, json!({ "result": { "get": true } }));
    ts.stop().await;
}

#[tokio::test]
async fn access_token_decides() {
    #[derive(serde::Deserialize)]
    struct Token {
        role: String,
    }

    let svc = service("test");
    svc.handle(
        "admin",
        Handler::new().access(|r: resling_core::AccessRequest| async move {
            match r.parse_token::<Option<Token>>()? {
                Some(t) if t.role == "admin" => r.access_granted(),
                _ => r.access_denied(),
            }
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts
        .access("test.admin", &json!({ "cid": "c1", "token": { "role": "admin" } }))
        .await;
    assert_eq!(reply["result"]["get"], true);

    let reply = ts.access("test.admin", &json!({ "cid": "c1" })).await;
    assert_eq!(reply["error"]["code"], "system.accessDenied");
    ts.stop().await;
}

#[tokio::test]
async fn auth_method_dispatch() {
    let svc = service("test");
    svc.handle(
        "auth",
        Handler::new().auth("login", |r: resling_core::AuthRequest| async move {
            r.ok(json!({ "user": "alice" }))
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts
        .auth("test.auth", "login", &json!({ "cid": "c1" }))
        .await;
    assert_eq!(reply, json!({ "result": { "user": "alice" } }));

    let reply = ts.auth("test.auth", "logout", &json!({ "cid": "c1" })).await;
    assert_eq!(reply["error"]["code"], "system.methodNotFound");
    ts.stop().await;
}

// ── Error propagation and the exactly-one-response rule ────────────────

#[tokio::test]
async fn handler_error_becomes_response() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::new().call("fail", |_r: resling_core::CallRequest| async move {
            Err(Error::new("test.custom", "Deliberate").with_data(json!({ "n": 1 })))
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.call("test.model", "fail", &json!({})).await;
    assert_eq!(reply["error"]["code"], "test.custom");
    assert_eq!(reply["error"]["data"]["n"], 1);
    ts.stop().await;
}

#[tokio::test]
async fn handler_without_response_is_internal_error() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::new().call("noop", |_r: resling_core::CallRequest| async move { Ok(()) }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.call("test.model", "noop", &json!({})).await;
    assert_eq!(reply["error"]["code"], "system.internalError");
    ts.stop().await;
}

#[tokio::test]
async fn handler_panic_is_internal_error() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::new().call("boom", |_r: resling_core::CallRequest| async move {
            panic!("boom");
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.call("test.model", "boom", &json!({})).await;
    assert_eq!(reply["error"]["code"], "system.internalError");
    ts.stop().await;
}

#[tokio::test]
async fn handler_panic_with_error_payload_becomes_that_error() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::new().call("strict", |_r: resling_core::CallRequest| async move {
            std::panic::panic_any(Error::invalid_params("bad input"));
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.call("test.model", "strict", &json!({})).await;
    assert_eq!(reply["error"]["code"], "system.invalidParams");
    assert_eq!(reply["error"]["message"], "bad input");
    ts.stop().await;
}

#[tokio::test]
async fn double_response_keeps_first_reply() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::new().call("twice", |r: resling_core::CallRequest| async move {
            r.ok(json!("first"))?;
            // The second response is a programmer error; it panics, but the
            // first reply must stand.
            r.ok(json!("second"))
        }),
    );
    let ts = TestService::start(svc).await;

    let mut req = ts.request("call.test.model.twice", b"{}".as_slice());
    let reply = req.response().await;
    assert_eq!(reply, json!({ "result": "first" }));

    // Still exactly one reply: a follow-up request gets its own answer and
    // nothing stale.
    let reply = ts.call("test.model", "twice", &json!({})).await;
    assert_eq!(reply, json!({ "result": "first" }));
    ts.stop().await;
}

#[tokio::test]
async fn array_payload_is_rejected() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::new().get_model(|r: resling_core::GetRequest| async move {
            r.model(json!({}))
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts
        .request("get.test.model", b"[1,2,3]".as_slice())
        .response()
        .await;
    assert_eq!(reply["error"]["code"], "system.internalError");
    ts.stop().await;
}

#[tokio::test]
async fn empty_payload_is_accepted() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::new().get_model(|r: resling_core::GetRequest| async move {
            r.model(json!({ "ok": true }))
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.request("get.test.model", Vec::new()).response().await;
    assert_eq!(reply["result"]["model"]["ok"], true);
    ts.stop().await;
}

// ── Pre-responses ───────────────────────────────────────────────────────

#[tokio::test]
async fn timeout_pre_response_precedes_reply() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::new().call("slow", |r: resling_core::CallRequest| async move {
            r.timeout(Duration::from_secs(42));
            r.not_found()
        }),
    );
    let ts = TestService::start(svc).await;

    let mut req = ts.request("call.test.model.slow", b"{}".as_slice());
    let raw = req.next_raw().await;
    assert_eq!(&raw[..], b"timeout:\"42000\"");
    let pairs = parse_pre_response(&raw).unwrap();
    assert_eq!(pairs.get("timeout").unwrap(), "42000");

    let reply = req.response().await;
    assert_eq!(reply["error"]["code"], "system.notFound");
    ts.stop().await;
}

// ── HTTP meta ───────────────────────────────────────────────────────────

#[tokio::test]
async fn http_meta_is_attached_to_reply() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::new().call("redirect", |r: resling_core::CallRequest| async move {
            r.set_response_status(303);
            r.set_response_header("Location", "https://example.org/");
            r.ok(())
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts
        .call("test.model", "redirect", &json!({ "isHttp": true }))
        .await;
    assert_eq!(reply["result"], json!(null));
    assert_eq!(reply["meta"]["status"], 303);
    assert_eq!(reply["meta"]["header"]["Location"][0], "https://example.org/");
    ts.stop().await;
}

#[tokio::test]
async fn http_meta_without_http_origin_panics_into_internal_error() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::new().call("redirect", |r: resling_core::CallRequest| async move {
            r.set_response_status(303);
            r.ok(())
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.call("test.model", "redirect", &json!({})).await;
    assert_eq!(reply["error"]["code"], "system.internalError");
    ts.stop().await;
}

// ── Value helper ────────────────────────────────────────────────────────

#[tokio::test]
async fn call_reads_own_value() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::new()
            .get_model(|r: resling_core::GetRequest| async move {
                r.model(json!({ "count": 7 }))
            })
            .call("read", |r: resling_core::CallRequest| async move {
                let current: serde_json::Value = r.value().await?;
                r.ok(current)
            }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.call("test.model", "read", &json!({})).await;
    assert_eq!(reply, json!({ "result": { "count": 7 } }));
    // Nothing but the reply is published; the internal get is not.
    ts.stop().await;
}

#[tokio::test]
async fn value_without_get_handler_is_not_found() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::new().call("read", |r: resling_core::CallRequest| async move {
            let current: Result<serde_json::Value, Error> = r.value().await;
            match current {
                Err(e) => r.error(e),
                Ok(_) => r.ok(()),
            }
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.call("test.model", "read", &json!({})).await;
    assert_eq!(reply["error"]["code"], "system.notFound");
    ts.stop().await;
}

#[tokio::test]
async fn value_inside_get_handler_is_rejected() {
    let svc = service("test");
    svc.handle(
        "model",
        Handler::new().get_model(|r: resling_core::GetRequest| async move {
            match r.value::<serde_json::Value>().await {
                Err(e) => r.error(e),
                Ok(v) => r.model(v),
            }
        }),
    );
    let ts = TestService::start(svc).await;

    let reply = ts.get("test.model").await;
    assert_eq!(reply["error"]["code"], "system.internalError");
    ts.stop().await;
}
