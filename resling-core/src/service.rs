//! The service façade.
//!
//! A [`Service`] is a cheap-to-clone handle to shared state. Handlers are
//! registered before [`serve`](Service::serve); configuration is frozen once
//! serving starts, and mutating it afterwards panics. `serve` blocks until
//! [`shutdown`](Service::shutdown) is called from another task.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::Bus;
use crate::error::{Error, ServiceError};
use crate::event::EventInfo;
use crate::handler::Handler;
use crate::pattern;
use crate::request;
use crate::resource::Resource;
use crate::router::{Match, Router};
use crate::runtime::{self, GroupQueues, Task};

/// The RES protocol version this library implements.
pub const PROTOCOL_VERSION: &str = "1.2.3";

/// Default number of workers draining the inbound channel.
const DEFAULT_WORKER_COUNT: usize = 32;
/// Default capacity of the inbound channel.
const DEFAULT_IN_CHANNEL_SIZE: usize = 1024;
/// Default duration a query bucket accepts query requests.
const DEFAULT_QUERY_EVENT_DURATION: Duration = Duration::from_secs(3);

type OnServeFn = Arc<dyn Fn(&Service) + Send + Sync>;
type OnErrorFn = Arc<dyn Fn(&Service, &ServiceError) + Send + Sync>;

struct Options {
    worker_count: usize,
    in_channel_size: usize,
    query_event_duration: Duration,
    owned_resources: Option<Vec<String>>,
    owned_access: Option<Vec<String>>,
    on_serve: Option<OnServeFn>,
    on_error: Option<OnErrorFn>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            in_channel_size: DEFAULT_IN_CHANNEL_SIZE,
            query_event_duration: DEFAULT_QUERY_EVENT_DURATION,
            owned_resources: None,
            owned_access: None,
            on_serve: None,
            on_error: None,
        }
    }
}

pub(crate) struct ServiceInner {
    name: String,
    router: Router,
    started: AtomicBool,
    serving: AtomicBool,
    bus: std::sync::OnceLock<Arc<dyn Bus>>,
    opts: Mutex<Options>,
    queues: Arc<GroupQueues>,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

/// A RES service.
///
/// # Example
///
/// ```ignore
/// let service = Service::new("library");
/// service.handle(
///     "book.$id",
///     Handler::new()
///         .access_granted()
///         .get_model(|r: GetRequest| async move {
///             r.model(book_for(r.path_param("id")))
///         }),
/// );
/// service.serve(bus).await?;
/// ```
#[derive(Clone)]
pub struct Service {
    pub(crate) inner: Arc<ServiceInner>,
}

impl Service {
    /// Create a service owning the given name as its top-level resource
    /// prefix.
    ///
    /// # Panics
    ///
    /// Panics when the name is not a valid dotted identifier.
    pub fn new(name: &str) -> Service {
        if !pattern::valid_dotted(name) {
            panic!("invalid service name {:?}", name);
        }
        let (done, _) = watch::channel(false);
        let inner = Arc::new_cyclic(|weak: &Weak<ServiceInner>| {
            let router = Router::new(name);
            router.attach(weak.clone(), name.to_string());
            ServiceInner {
                name: name.to_string(),
                router,
                started: AtomicBool::new(false),
                serving: AtomicBool::new(false),
                bus: std::sync::OnceLock::new(),
                opts: Mutex::new(Options::default()),
                queues: GroupQueues::new(),
                cancel: CancellationToken::new(),
                done,
            }
        });
        Service { inner }
    }

    pub(crate) fn from_weak(weak: &Weak<ServiceInner>) -> Option<Service> {
        weak.upgrade().map(|inner| Service { inner })
    }

    /// The service name, which is also its top-level resource prefix.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The RES protocol version this library implements.
    pub fn protocol_version(&self) -> &'static str {
        PROTOCOL_VERSION
    }

    fn assert_not_started(&self, what: &str) {
        if self.inner.started.load(Ordering::SeqCst) {
            panic!("cannot {what} after the service has started");
        }
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Register a handler for a pattern below the service name.
    ///
    /// # Panics
    ///
    /// Panics on registration conflicts or after the service has started.
    pub fn handle(&self, pattern: &str, handler: Handler) {
        self.assert_not_started("register handlers");
        self.inner.router.handle(pattern, handler);
    }

    /// Mount a sub-router under a prefix below the service name.
    pub fn mount(&self, prefix: &str, sub: Router) {
        self.assert_not_started("mount routers");
        self.inner.router.mount(prefix, sub);
    }

    /// Build, register on, and mount a sub-router in one call.
    pub fn route<F: FnOnce(&Router)>(&self, pattern: &str, f: F) -> Router {
        self.assert_not_started("mount routers");
        self.inner.router.route(pattern, f)
    }

    /// Attach an event listener to a pattern below the service name.
    pub fn add_listener<F>(&self, pattern: &str, f: F)
    where
        F: Fn(&EventInfo) + Send + Sync + 'static,
    {
        self.assert_not_started("register listeners");
        self.inner.router.add_listener(pattern, f);
    }

    // ── Options ─────────────────────────────────────────────────────────

    /// Set the number of workers draining the inbound channel. Default 32.
    ///
    /// # Panics
    ///
    /// Panics on zero or after the service has started.
    pub fn set_worker_count(&self, count: usize) {
        self.assert_not_started("set worker count");
        if count == 0 {
            panic!("worker count must be at least one");
        }
        self.inner.opts.lock().unwrap().worker_count = count;
    }

    /// Set the capacity of the inbound channel. Default 1024.
    ///
    /// # Panics
    ///
    /// Panics on zero or after the service has started.
    pub fn set_in_channel_size(&self, size: usize) {
        self.assert_not_started("set inbound channel size");
        if size == 0 {
            panic!("inbound channel size must be at least one");
        }
        self.inner.opts.lock().unwrap().in_channel_size = size;
    }

    /// Set how long a query bucket accepts query requests. Default 3s,
    /// minimum 1s.
    ///
    /// # Panics
    ///
    /// Panics below one second or after the service has started.
    pub fn set_query_event_duration(&self, duration: Duration) {
        self.assert_not_started("set query event duration");
        if duration < Duration::from_secs(1) {
            panic!("query event duration must be at least one second");
        }
        self.inner.opts.lock().unwrap().query_event_duration = duration;
    }

    /// Set the resource and access patterns announced in `system.reset` on
    /// start. Defaults to the service name plus its full wildcard.
    pub fn set_owned_resources(&self, resources: Vec<String>, access: Vec<String>) {
        self.assert_not_started("set owned resources");
        let mut opts = self.inner.opts.lock().unwrap();
        opts.owned_resources = Some(resources);
        opts.owned_access = Some(access);
    }

    /// Set a hook invoked once all subscriptions are established.
    pub fn set_on_serve<F: Fn(&Service) + Send + Sync + 'static>(&self, f: F) {
        self.assert_not_started("set the on-serve hook");
        self.inner.opts.lock().unwrap().on_serve = Some(Arc::new(f));
    }

    /// Set a hook receiving asynchronous errors. Without one they go to the
    /// log.
    pub fn set_on_error<F: Fn(&Service, &ServiceError) + Send + Sync + 'static>(&self, f: F) {
        self.assert_not_started("set the on-error hook");
        self.inner.opts.lock().unwrap().on_error = Some(Arc::new(f));
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Subscribe, announce `system.reset`, and process requests until
    /// [`shutdown`](Service::shutdown).
    ///
    /// # Panics
    ///
    /// Panics when the service has already been started.
    pub async fn serve<B: Bus + 'static>(&self, bus: B) -> Result<(), ServiceError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            panic!("service already started");
        }
        let result = self.serve_inner(Arc::new(bus)).await;
        self.inner.serving.store(false, Ordering::SeqCst);
        // send_replace stores the value even with no receiver subscribed
        // yet, so a later shutdown still observes completion.
        self.inner.done.send_replace(true);
        result
    }

    async fn serve_inner(&self, bus: Arc<dyn Bus>) -> Result<(), ServiceError> {
        let _ = self.inner.bus.set(bus.clone());
        let (worker_count, in_channel_size, on_serve) = {
            let opts = self.inner.opts.lock().unwrap();
            (opts.worker_count, opts.in_channel_size, opts.on_serve.clone())
        };

        let (tx, rx) = mpsc::channel(in_channel_size);
        let mut subs = Vec::new();
        for subject in self.derive_subscriptions() {
            match bus.subscribe(&subject, tx.clone()) {
                Ok(sub) => subs.push(sub),
                Err(err) => {
                    for sub in subs {
                        sub.unsubscribe();
                    }
                    return Err(ServiceError::Bus(err));
                }
            }
        }
        drop(tx);

        self.inner.serving.store(true, Ordering::SeqCst);
        self.publish_owned_reset();
        let workers = runtime::spawn_workers(self.clone(), rx, worker_count);
        if let Some(hook) = on_serve {
            hook(self);
        }
        info!(service = %self.inner.name, workers = worker_count, "serving");

        self.inner.cancel.cancelled().await;

        // Closing every subscription drops the inbound senders; the workers
        // drain what is buffered and exit on channel close.
        for sub in subs {
            sub.unsubscribe();
        }
        for worker in workers {
            let _ = worker.await;
        }
        info!(service = %self.inner.name, "stopped");
        Ok(())
    }

    /// Stop the service: close the inbound channel, let workers drain their
    /// current tasks, and return once `serve` has finished.
    pub async fn shutdown(&self) {
        if !self.inner.started.load(Ordering::SeqCst) {
            warn!("shutdown called on a service that never started");
            return;
        }
        self.inner.cancel.cancel();
        let mut done = self.inner.done.subscribe();
        loop {
            if *done.borrow_and_update() {
                return;
            }
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    /// The minimum set of subjects covering every registered handler.
    ///
    /// Access and get subjects carry the bare resource ID, so the service's
    /// own top-level resource needs the bare subject next to the wildcard;
    /// call and auth subjects always end in a method token, which the
    /// wildcard covers on its own.
    fn derive_subscriptions(&self) -> Vec<String> {
        let router = &self.inner.router;
        let name = &self.inner.name;
        let mut subjects = Vec::new();
        if router.contains(&|h: &Handler| h.access.is_some()) {
            subjects.push(format!("access.{}", name));
            subjects.push(format!("access.{}.>", name));
        }
        if router.contains(&|h: &Handler| h.get.is_some()) {
            subjects.push(format!("get.{}", name));
            subjects.push(format!("get.{}.>", name));
        }
        if router.contains(&|h: &Handler| !h.calls.is_empty() || h.new_call.is_some()) {
            subjects.push(format!("call.{}.>", name));
        }
        if router.contains(&|h: &Handler| !h.auths.is_empty()) {
            subjects.push(format!("auth.{}.>", name));
        }
        subjects
    }

    fn default_owned(&self) -> (Vec<String>, Vec<String>) {
        let name = &self.inner.name;
        let resources = vec![name.clone(), format!("{}.>", name)];
        let access = if self.inner.router.contains(&|h: &Handler| h.access.is_some()) {
            resources.clone()
        } else {
            Vec::new()
        };
        (resources, access)
    }

    fn publish_owned_reset(&self) {
        let (resources, access) = {
            let opts = self.inner.opts.lock().unwrap();
            let (def_resources, def_access) = self.default_owned();
            (
                opts.owned_resources.clone().unwrap_or(def_resources),
                opts.owned_access.clone().unwrap_or(def_access),
            )
        };
        let resources: Vec<&str> = resources.iter().map(String::as_str).collect();
        let access: Vec<&str> = access.iter().map(String::as_str).collect();
        if let Err(err) = self.reset(&resources, &access) {
            warn!("failed to publish system.reset: {err}");
            self.report_error(&err);
        }
    }

    // ── Bus-facing operations ───────────────────────────────────────────

    /// Publish `system.reset`, telling gateways to refetch the given
    /// resources and access grants. Empty arrays are omitted; with both
    /// empty nothing is published.
    pub fn reset(&self, resources: &[&str], access: &[&str]) -> Result<(), ServiceError> {
        if resources.is_empty() && access.is_empty() {
            return Ok(());
        }
        let mut payload = serde_json::Map::new();
        if !resources.is_empty() {
            payload.insert(
                "resources".into(),
                serde_json::to_value(resources).unwrap_or_default(),
            );
        }
        if !access.is_empty() {
            payload.insert(
                "access".into(),
                serde_json::to_value(access).unwrap_or_default(),
            );
        }
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        self.publish_raw("system.reset", bytes)
    }

    /// Publish `system.reset` for the service's owned resource and access
    /// sets.
    pub fn reset_all(&self) -> Result<(), ServiceError> {
        let (resources, access) = self.default_owned();
        let resources: Vec<&str> = resources.iter().map(String::as_str).collect();
        let access: Vec<&str> = access.iter().map(String::as_str).collect();
        self.reset(&resources, &access)
    }

    /// Publish a token event for a client connection, replacing its access
    /// token. A `None`-like token (serializing to null) clears it.
    ///
    /// # Panics
    ///
    /// Panics when the connection ID is not a valid dotted identifier.
    pub fn token_event(&self, cid: &str, token: impl Serialize) -> Result<(), ServiceError> {
        if !pattern::valid_dotted(cid) {
            panic!("invalid connection ID {:?}", cid);
        }
        let bytes = serde_json::to_vec(&serde_json::json!({ "token": token }))
            .unwrap_or_default();
        self.publish_raw(&format!("conn.{}.token", cid), bytes)
    }

    /// Publish `system.tokenReset`, prompting re-authentication of the given
    /// token IDs against an auth subject. A no-op with no token IDs.
    pub fn token_reset(&self, subject: &str, tids: &[&str]) -> Result<(), ServiceError> {
        if tids.is_empty() {
            return Ok(());
        }
        let bytes = serde_json::to_vec(&serde_json::json!({
            "tids": tids,
            "subject": subject,
        }))
        .unwrap_or_default();
        self.publish_raw("system.tokenReset", bytes)
    }

    // ── With-resource task injection ────────────────────────────────────

    /// Run a task bound to a resource, serialized against handler
    /// executions for the resource's group.
    ///
    /// The task is scheduled and this method returns without waiting for
    /// it, except when called from within a task already holding the same
    /// group, in which case it runs inline to completion.
    pub async fn with_resource<F, Fut>(&self, rid: &str, f: F) -> Result<(), ServiceError>
    where
        F: FnOnce(Resource) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.inner.serving.load(Ordering::SeqCst) {
            return Err(ServiceError::NotServing);
        }
        let (name, query) = match rid.split_once('?') {
            Some((n, q)) => (n, q),
            None => (rid, ""),
        };
        let m = self
            .lookup(name)
            .ok_or_else(|| ServiceError::NoHandler(rid.to_string()))?;
        let resource =
            Resource::from_match(self.clone(), name.to_string(), query.to_string(), m);
        let group = resource.group().to_string();
        let label = rid.to_string();
        let task: Task = Box::pin(async move {
            if let Err(payload) = AssertUnwindSafe(f(resource)).catch_unwind().await {
                error!(
                    resource = %label,
                    "with-resource task panicked: {}",
                    request::panic_message(payload.as_ref())
                );
            }
        });
        self.schedule(group, task).await;
        Ok(())
    }

    /// Run a task bound to an arbitrary serialization group.
    pub async fn with_group<F, Fut>(&self, group: &str, f: F) -> Result<(), ServiceError>
    where
        F: FnOnce(Service) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.inner.serving.load(Ordering::SeqCst) {
            return Err(ServiceError::NotServing);
        }
        let service = self.clone();
        let label = group.to_string();
        let task: Task = Box::pin(async move {
            if let Err(payload) = AssertUnwindSafe(f(service)).catch_unwind().await {
                error!(
                    group = %label,
                    "with-group task panicked: {}",
                    request::panic_message(payload.as_ref())
                );
            }
        });
        self.schedule(group.to_string(), task).await;
        Ok(())
    }

    /// Enqueue a task on its group, or run it inline when the caller
    /// already holds that group (scheduling it would have to wait for the
    /// caller itself).
    async fn schedule(&self, group: String, task: Task) {
        if runtime::executing_group(&group) {
            task.await;
            return;
        }
        let queues = self.inner.queues.clone();
        tokio::spawn(async move { queues.run(group, task).await });
    }

    // ── Internal plumbing ───────────────────────────────────────────────

    pub(crate) fn lookup(&self, rid: &str) -> Option<Match> {
        self.inner.router.lookup(rid)
    }

    pub(crate) fn queues(&self) -> Arc<GroupQueues> {
        self.inner.queues.clone()
    }

    pub(crate) fn bus(&self) -> Option<Arc<dyn Bus>> {
        self.inner.bus.get().cloned()
    }

    pub(crate) fn query_event_duration(&self) -> Duration {
        self.inner.opts.lock().unwrap().query_event_duration
    }

    pub(crate) fn publish_raw(&self, subject: &str, payload: Vec<u8>) -> Result<(), ServiceError> {
        let bus = self.bus().ok_or(ServiceError::NotServing)?;
        bus.publish(subject, payload).map_err(ServiceError::Bus)
    }

    /// Route an asynchronous error to the on-error hook, or the log.
    pub(crate) fn report_error(&self, err: &ServiceError) {
        let hook = self.inner.opts.lock().unwrap().on_error.clone();
        match hook {
            Some(hook) => hook(self, err),
            None => error!(service = %self.inner.name, "{err}"),
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.inner.name)
            .field("serving", &self.inner.serving.load(Ordering::SeqCst))
            .finish()
    }
}

/// Reply `system.notFound` to a request that matched a subscription but no
/// handler.
pub(crate) fn reply_not_found(service: &Service, reply: &str) {
    let bytes = serde_json::to_vec(&serde_json::json!({ "error": Error::not_found() }))
        .unwrap_or_default();
    if let Err(err) = service.publish_raw(reply, bytes) {
        service.report_error(&err);
    }
}
