//! Query events and query buckets.
//!
//! When a handler emits a query event, the service allocates a transient
//! bucket keyed by a fresh inbox, publishes a single `query` event
//! announcing that inbox, and serves every query request arriving on it
//! until the bucket deadline. Each query request is answered with the
//! events, or terminal state, the handler's callback collects for that
//! particular query.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::bus::Message;
use crate::error::Error;
use crate::handler::ResourceType;
use crate::resource::Resource;

/// The handler-supplied callback serving one query bucket. Invoked with
/// `Some` for every incoming query request, and once with `None` when the
/// bucket expires.
pub(crate) type QueryCallback = Arc<dyn Fn(Option<&mut QueryRequest>) + Send + Sync>;

/// Capacity of the per-bucket inbox channel.
const QUERY_CHANNEL_SIZE: usize = 32;

enum Terminal {
    Model(Value),
    Collection(Value),
    Error(Error),
}

/// A single query request served from a query bucket.
///
/// The callback inspects [`query`](QueryRequest::query) and either collects
/// the mutation events that bring that query's view up to date, or responds
/// with a full model, collection, or error.
pub struct QueryRequest {
    resource: Resource,
    query: String,
    reply: String,
    events: Vec<(String, Value)>,
    terminal: Option<Terminal>,
}

impl QueryRequest {
    /// The query to collect events for.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// The resource the query event was emitted on.
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Collect a `change` event for this query's view.
    ///
    /// # Panics
    ///
    /// Panics when the handler is not model typed.
    pub fn change_event(&mut self, values: crate::types::ChangeValues) {
        if self.resource.resource_type() != ResourceType::Model {
            panic!(
                "change event on non-model resource {}",
                self.resource.resource_name()
            );
        }
        if values.is_empty() {
            return;
        }
        self.events
            .push(("change".to_string(), serde_json::json!({ "values": values })));
    }

    /// Collect an `add` event for this query's view.
    ///
    /// # Panics
    ///
    /// Panics when the handler is not collection typed.
    pub fn add_event(&mut self, value: impl serde::Serialize, idx: usize) {
        if self.resource.resource_type() != ResourceType::Collection {
            panic!(
                "add event on non-collection resource {}",
                self.resource.resource_name()
            );
        }
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.events
            .push(("add".to_string(), serde_json::json!({ "value": value, "idx": idx })));
    }

    /// Collect a `remove` event for this query's view.
    ///
    /// # Panics
    ///
    /// Panics when the handler is not collection typed.
    pub fn remove_event(&mut self, idx: usize) {
        if self.resource.resource_type() != ResourceType::Collection {
            panic!(
                "remove event on non-collection resource {}",
                self.resource.resource_name()
            );
        }
        self.events
            .push(("remove".to_string(), serde_json::json!({ "idx": idx })));
    }

    /// Respond with the query's full model instead of events.
    pub fn model(&mut self, model: impl serde::Serialize) {
        let value = serde_json::to_value(model).unwrap_or(Value::Null);
        self.terminal = Some(Terminal::Model(value));
    }

    /// Respond with the query's full collection instead of events.
    pub fn collection(&mut self, collection: impl serde::Serialize) {
        let value = serde_json::to_value(collection).unwrap_or(Value::Null);
        self.terminal = Some(Terminal::Collection(value));
    }

    /// Respond with an error.
    pub fn error(&mut self, err: Error) {
        self.terminal = Some(Terminal::Error(err));
    }

    /// Respond with `system.notFound`.
    pub fn not_found(&mut self) {
        self.error(Error::not_found());
    }

    /// Respond with `system.invalidQuery`.
    pub fn invalid_query(&mut self, message: impl Into<String>) {
        self.error(Error::invalid_query(message));
    }

    /// Extend the gateway's wait for this query reply. Extends only this
    /// reply's window, never the bucket deadline.
    pub fn timeout(&self, duration: std::time::Duration) {
        let ms = duration.as_millis();
        if ms > u32::MAX as u128 {
            panic!("timeout duration exceeds the protocol maximum");
        }
        let service = self.resource.service();
        let bytes = format!("timeout:\"{}\"", ms).into_bytes();
        if let Err(err) = service.publish_raw(&self.reply, bytes) {
            warn!(reply = %self.reply, "failed to publish pre-response: {err}");
            service.report_error(&err);
        }
    }

    fn into_reply(self) -> Value {
        match self.terminal {
            Some(Terminal::Error(err)) => serde_json::json!({ "error": err }),
            Some(Terminal::Model(m)) => serde_json::json!({ "result": { "model": m } }),
            Some(Terminal::Collection(c)) => {
                serde_json::json!({ "result": { "collection": c } })
            }
            None => {
                let events: Vec<Value> = self
                    .events
                    .into_iter()
                    .map(|(event, data)| serde_json::json!({ "event": event, "data": data }))
                    .collect();
                serde_json::json!({ "result": { "events": events } })
            }
        }
    }
}

#[derive(serde::Deserialize)]
struct QueryRequestDto {
    query: Option<String>,
}

/// Allocate a query bucket for the resource: announce a fresh inbox with a
/// `query` event and spawn the bucket task serving it until the deadline.
pub(crate) fn start(resource: Resource, callback: QueryCallback) -> Result<(), Error> {
    let service = resource.service();
    let bus = service
        .bus()
        .ok_or_else(|| Error::internal("query event on a service that is not serving"))?;
    let inbox = bus.new_inbox();
    let (tx, rx) = mpsc::channel(QUERY_CHANNEL_SIZE);
    let sub = bus
        .subscribe(&inbox, tx)
        .map_err(|e| Error::internal(format!("unable to subscribe query inbox: {e}")))?;

    let subject = format!("event.{}.query", resource.resource_name());
    let payload = serde_json::to_vec(&serde_json::json!({ "subject": inbox })).unwrap_or_default();
    if let Err(err) = service.publish_raw(&subject, payload) {
        sub.unsubscribe();
        return Err(Error::internal(format!("unable to publish query event: {e}", e = err)));
    }

    let duration = service.query_event_duration();
    tokio::spawn(run_bucket(resource, callback, rx, sub, duration));
    Ok(())
}

async fn run_bucket(
    resource: Resource,
    callback: QueryCallback,
    mut rx: mpsc::Receiver<Message>,
    sub: Box<dyn crate::bus::Subscription>,
    duration: std::time::Duration,
) {
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            msg = rx.recv() => match msg {
                Some(msg) => serve_query_request(&resource, &callback, msg),
                None => break,
            },
        }
    }
    // Expiration sentinel, letting the handler release any bucket state.
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        callback(None)
    })) {
        error!(
            resource = %resource.resource_name(),
            "query callback panicked on expiration: {}",
            crate::request::panic_message(payload.as_ref())
        );
    }
    sub.unsubscribe();
    debug!(resource = %resource.resource_name(), "query bucket expired");
}

fn serve_query_request(resource: &Resource, callback: &QueryCallback, msg: Message) {
    if msg.reply.is_empty() {
        warn!(
            resource = %resource.resource_name(),
            "query request without a reply subject dropped"
        );
        return;
    }
    let service = resource.service();
    let query = serde_json::from_slice::<QueryRequestDto>(&msg.payload)
        .ok()
        .and_then(|dto| dto.query)
        .unwrap_or_default();
    if query.is_empty() {
        let err = Error::internal("missing query in query request");
        let bytes = serde_json::to_vec(&serde_json::json!({ "error": err })).unwrap_or_default();
        if let Err(e) = service.publish_raw(&msg.reply, bytes) {
            service.report_error(&e);
        }
        return;
    }

    let mut req = QueryRequest {
        resource: resource.clone(),
        query,
        reply: msg.reply.clone(),
        events: Vec::new(),
        terminal: None,
    };
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        callback(Some(&mut req))
    }));
    let reply = match outcome {
        Ok(()) => req.into_reply(),
        Err(payload) => {
            let err = crate::request::error_from_panic(payload);
            error!(
                resource = %resource.resource_name(),
                "query callback panicked: {}",
                err.message
            );
            serde_json::json!({ "error": err })
        }
    };
    let bytes = serde_json::to_vec(&reply).unwrap_or_default();
    if let Err(e) = service.publish_raw(&msg.reply, bytes) {
        warn!(reply = %msg.reply, "failed to publish query reply: {e}");
        service.report_error(&e);
    }
}
