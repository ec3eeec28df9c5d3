//! The resource context handed to handlers and with-resource tasks.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

use crate::error::Error;
use crate::event::{self, EventInfo, ListenerFn};
use crate::handler::{Handler, ResourceType};
use crate::query::{self, QueryRequest};
use crate::request::{self, GetRequest};
use crate::router::Match;
use crate::service::Service;
use crate::types::ChangeValues;

pub(crate) struct ResourceInner {
    service: Service,
    /// Resource name without query.
    name: String,
    query: String,
    params: HashMap<String, String>,
    group: String,
    handler: Arc<Handler>,
    listeners: Vec<ListenerFn>,
    /// Set while the entry's get hook runs, to reject value re-entry.
    in_get: AtomicBool,
}

/// A resource as seen during a single request or with-resource task.
///
/// The service keeps no long-lived per-resource state; a `Resource` exists
/// only for the duration of the task that owns it. It exposes the matched
/// path parameters and query, and the event emitters that feed the
/// apply-listen-publish pipeline.
#[derive(Clone)]
pub struct Resource {
    inner: Arc<ResourceInner>,
}

impl Resource {
    pub(crate) fn from_match(service: Service, name: String, query: String, m: Match) -> Resource {
        Resource {
            inner: Arc::new(ResourceInner {
                service,
                name,
                query,
                params: m.params,
                group: m.group,
                handler: m.handler,
                listeners: m.listeners,
                in_get: AtomicBool::new(false),
            }),
        }
    }

    /// The service this resource belongs to.
    pub fn service(&self) -> Service {
        self.inner.service.clone()
    }

    /// The resource name, query excluded.
    pub fn resource_name(&self) -> &str {
        &self.inner.name
    }

    /// The query part of the resource ID, without the leading `?`. Empty for
    /// non-query resources.
    pub fn query(&self) -> &str {
        &self.inner.query
    }

    /// The full resource ID, query included.
    pub fn rid(&self) -> String {
        if self.inner.query.is_empty() {
            self.inner.name.clone()
        } else {
            format!("{}?{}", self.inner.name, self.inner.query)
        }
    }

    /// A path parameter captured by a pattern placeholder.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.inner.params.get(name).map(|s| s.as_str())
    }

    /// All captured path parameters.
    pub fn path_params(&self) -> &HashMap<String, String> {
        &self.inner.params
    }

    /// The serialization group this resource executes under.
    pub fn group(&self) -> &str {
        &self.inner.group
    }

    /// The declared type of the matched handler.
    pub fn resource_type(&self) -> ResourceType {
        self.inner.handler.typ
    }

    pub(crate) fn enter_get(&self) {
        self.inner.in_get.store(true, Ordering::SeqCst);
    }

    pub(crate) fn leave_get(&self) {
        self.inner.in_get.store(false, Ordering::SeqCst);
    }

    // ── Value helper ────────────────────────────────────────────────────

    /// Fetch the resource's current representation by invoking the entry's
    /// own get hook, without publishing anything.
    ///
    /// Fails with `system.notFound` when the entry has no get hook, and with
    /// `system.internalError` when called from inside a get hook.
    pub async fn value<T: DeserializeOwned>(&self) -> Result<T, Error> {
        if self.inner.in_get.load(Ordering::SeqCst) {
            return Err(Error::internal("value requested from within a get handler"));
        }
        let get = self.inner.handler.get.clone().ok_or_else(Error::not_found)?;
        let (req, slot) = GetRequest::capturing(self.clone());
        self.enter_get();
        let outcome = AssertUnwindSafe(get(req)).catch_unwind().await;
        self.leave_get();
        let captured = slot.lock().unwrap().take();
        match outcome {
            Err(payload) => Err(request::error_from_panic(payload)),
            Ok(Err(err)) => Err(err),
            Ok(Ok(())) => match captured {
                Some(Ok(value)) => {
                    serde_json::from_value(value).map_err(|e| Error::internal(e.to_string()))
                }
                Some(Err(err)) => Err(err),
                None => Err(Error::internal("no response from get handler")),
            },
        }
    }

    // ── Event emitters ──────────────────────────────────────────────────

    /// Emit a `change` event for the given property values. A deleted
    /// property maps to [`delete_action`](crate::types::delete_action).
    ///
    /// An empty change map is a no-op. When an apply hook is set it runs
    /// first; an apply error aborts the emission, and an empty reverse map
    /// swallows the publish.
    ///
    /// # Panics
    ///
    /// Panics when the handler is not model typed.
    pub async fn change_event(&self, values: ChangeValues) -> Result<(), Error> {
        if self.inner.handler.typ != ResourceType::Model {
            panic!(
                "change event on non-model resource {}",
                self.inner.name
            );
        }
        if values.is_empty() {
            return Ok(());
        }
        let mut old_values = None;
        if let Some(apply) = &self.inner.handler.apply_change {
            match apply(self.clone(), values.clone()).await? {
                Some(rev) if rev.is_empty() => return Ok(()),
                rev => old_values = rev,
            }
        }
        let mut info = EventInfo::new(self.clone(), "change");
        info.new_values = Some(values.clone());
        info.old_values = old_values;
        self.notify_listeners(&info);
        self.publish_event("change", serde_json::json!({ "values": values }));
        Ok(())
    }

    /// Emit an `add` event inserting `value` at `idx`.
    ///
    /// # Panics
    ///
    /// Panics when the handler is not collection typed.
    pub async fn add_event(&self, value: impl Serialize, idx: usize) -> Result<(), Error> {
        if self.inner.handler.typ != ResourceType::Collection {
            panic!("add event on non-collection resource {}", self.inner.name);
        }
        let value = serde_json::to_value(value).map_err(|e| Error::internal(e.to_string()))?;
        if let Some(apply) = &self.inner.handler.apply_add {
            apply(self.clone(), value.clone(), idx).await?;
        }
        let mut info = EventInfo::new(self.clone(), "add");
        info.value = Some(value.clone());
        info.idx = Some(idx);
        self.notify_listeners(&info);
        self.publish_event("add", serde_json::json!({ "value": value, "idx": idx }));
        Ok(())
    }

    /// Emit a `remove` event removing the element at `idx`.
    ///
    /// # Panics
    ///
    /// Panics when the handler is not collection typed.
    pub async fn remove_event(&self, idx: usize) -> Result<(), Error> {
        if self.inner.handler.typ != ResourceType::Collection {
            panic!("remove event on non-collection resource {}", self.inner.name);
        }
        let mut removed = None;
        if let Some(apply) = &self.inner.handler.apply_remove {
            removed = Some(apply(self.clone(), idx).await?);
        }
        let mut info = EventInfo::new(self.clone(), "remove");
        info.value = removed;
        info.idx = Some(idx);
        self.notify_listeners(&info);
        self.publish_event("remove", serde_json::json!({ "idx": idx }));
        Ok(())
    }

    /// Emit a `create` event carrying the new resource data.
    pub async fn create_event(&self, data: impl Serialize) -> Result<(), Error> {
        let data = serde_json::to_value(data).map_err(|e| Error::internal(e.to_string()))?;
        if let Some(apply) = &self.inner.handler.apply_create {
            apply(self.clone(), data.clone()).await?;
        }
        let mut info = EventInfo::new(self.clone(), "create");
        info.data = Some(data.clone());
        self.notify_listeners(&info);
        self.publish_event("create", serde_json::json!({ "data": data }));
        Ok(())
    }

    /// Emit a `delete` event.
    pub async fn delete_event(&self) -> Result<(), Error> {
        let mut data = None;
        if let Some(apply) = &self.inner.handler.apply_delete {
            data = apply(self.clone()).await?;
        }
        let mut info = EventInfo::new(self.clone(), "delete");
        info.data = data;
        self.notify_listeners(&info);
        self.publish_event("delete", serde_json::json!({}));
        Ok(())
    }

    /// Emit a `reaccess` event, telling the gateway to renew its access
    /// grants for this resource.
    pub fn reaccess_event(&self) {
        let info = EventInfo::new(self.clone(), "reaccess");
        self.notify_listeners(&info);
        self.publish_event_raw("reaccess", Vec::new());
    }

    /// Emit a custom event.
    ///
    /// # Panics
    ///
    /// Panics when the name is reserved by the protocol or not a valid
    /// subject token.
    pub fn event(&self, name: &str, payload: impl Serialize) {
        if event::reserved_event_name(name) {
            panic!("custom event uses reserved name {:?}", name);
        }
        if !crate::pattern::valid_token(name) {
            panic!("invalid event name {:?}", name);
        }
        let data = serde_json::to_value(payload).unwrap_or(Value::Null);
        let mut info = EventInfo::new(self.clone(), name);
        info.data = Some(data.clone());
        self.notify_listeners(&info);
        self.publish_event(name, data);
    }

    /// Emit a `query` event announcing a fresh inbox, then feed every query
    /// request arriving on it to `f` until the bucket deadline.
    ///
    /// The callback is invoked with `Some` for each query request, and once
    /// with `None` when the bucket expires, so it can release any state.
    pub fn query_event<F>(&self, f: F) -> Result<(), Error>
    where
        F: Fn(Option<&mut QueryRequest>) + Send + Sync + 'static,
    {
        query::start(self.clone(), Arc::new(f))
    }

    // ── Internal plumbing ───────────────────────────────────────────────

    fn notify_listeners(&self, info: &EventInfo) {
        for listener in &self.inner.listeners {
            if let Err(payload) =
                std::panic::catch_unwind(AssertUnwindSafe(|| listener(info)))
            {
                error!(
                    resource = %self.inner.name,
                    event = %info.name,
                    "event listener panicked: {}",
                    request::panic_message(payload.as_ref())
                );
            }
        }
    }

    fn publish_event(&self, event: &str, payload: Value) {
        let bytes = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                error!(resource = %self.inner.name, event, "failed to encode event: {e}");
                return;
            }
        };
        self.publish_event_raw(event, bytes);
    }

    fn publish_event_raw(&self, event: &str, payload: Vec<u8>) {
        let subject = format!("event.{}.{}", self.inner.name, event);
        if let Err(err) = self.inner.service.publish_raw(&subject, payload) {
            warn!(subject = %subject, "failed to publish event: {err}");
            self.inner.service.report_error(&err);
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.inner.name)
            .field("query", &self.inner.query)
            .field("group", &self.inner.group)
            .finish()
    }
}
