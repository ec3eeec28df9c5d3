//! Inbound request handling.
//!
//! Every bus message addressed to the service runs through the same state
//! machine: parse, construct a typed request, invoke the matching hook, and
//! publish exactly one terminal response. Handler panics are caught here and
//! never reach the worker; a panic payload that is an [`Error`] becomes the
//! response, anything else becomes `system.internalError`.

use std::any::Any;
use std::collections::HashMap;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::bus::Message;
use crate::error::Error;
use crate::handler::HandlerResult;
use crate::resource::Resource;
use crate::router::Match;
use crate::service::Service;
use crate::types::Ref;

/// The subscription timeout gateways wait for before giving up on a reply,
/// used as the initial request deadline.
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// The kind of request, parsed from the subject's first token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Access,
    Get,
    Call,
    Auth,
}

impl RequestKind {
    fn label(self) -> &'static str {
        match self {
            RequestKind::Access => "access",
            RequestKind::Get => "get",
            RequestKind::Call => "call",
            RequestKind::Auth => "auth",
        }
    }
}

/// A request subject split into its kind, resource name, and method.
#[derive(Debug)]
pub(crate) struct ParsedSubject {
    pub(crate) kind: RequestKind,
    pub(crate) rid: String,
    pub(crate) method: Option<String>,
}

/// Split a raw subject into kind, resource name, and call/auth method.
pub(crate) fn parse_subject(subject: &str) -> Option<ParsedSubject> {
    let (kind_token, rest) = subject.split_once('.')?;
    let kind = match kind_token {
        "access" => RequestKind::Access,
        "get" => RequestKind::Get,
        "call" => RequestKind::Call,
        "auth" => RequestKind::Auth,
        _ => return None,
    };
    match kind {
        RequestKind::Call | RequestKind::Auth => {
            let (rid, method) = rest.rsplit_once('.')?;
            if rid.is_empty() || method.is_empty() {
                return None;
            }
            Some(ParsedSubject {
                kind,
                rid: rid.to_string(),
                method: Some(method.to_string()),
            })
        }
        _ => {
            if rest.is_empty() {
                return None;
            }
            Some(ParsedSubject {
                kind,
                rid: rest.to_string(),
                method: None,
            })
        }
    }
}

/// The decoded request payload. Unknown fields are ignored; params and token
/// stay raw until a handler asks for them.
#[derive(Default, Debug, serde::Deserialize)]
struct RequestDto {
    cid: Option<String>,
    params: Option<Box<RawValue>>,
    token: Option<Box<RawValue>>,
    header: Option<HashMap<String, Vec<String>>>,
    host: Option<String>,
    #[serde(rename = "remoteAddr")]
    remote_addr: Option<String>,
    uri: Option<String>,
    query: Option<String>,
    #[serde(rename = "isHttp")]
    is_http: Option<bool>,
}

fn parse_payload(payload: &[u8]) -> Result<RequestDto, Error> {
    let trimmed: &[u8] = {
        let start = payload
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(payload.len());
        &payload[start..]
    };
    if trimmed.is_empty() {
        return Ok(RequestDto::default());
    }
    if trimmed[0] == b'[' {
        return Err(Error::internal("unable to parse request: array payload"));
    }
    serde_json::from_slice(trimmed)
        .map_err(|e| Error::internal(format!("unable to parse request: {e}")))
}

/// HTTP response metadata, set by handlers on HTTP-originated requests.
#[derive(Default)]
struct RespState {
    sent: bool,
    status: Option<u16>,
    header: Option<HashMap<String, Vec<String>>>,
}

impl RespState {
    fn take_meta(&mut self) -> Option<Value> {
        if self.status.is_none() && self.header.is_none() {
            return None;
        }
        let mut meta = serde_json::Map::new();
        if let Some(status) = self.status.take() {
            meta.insert("status".into(), status.into());
        }
        if let Some(header) = self.header.take() {
            meta.insert(
                "header".into(),
                serde_json::to_value(header).unwrap_or(Value::Null),
            );
        }
        Some(Value::Object(meta))
    }
}

/// Where the terminal response goes: the bus reply subject, or an in-process
/// capture slot for internal value requests.
enum Sink {
    Publish { reply: String },
    Capture(CaptureSlot),
}

pub(crate) type CaptureSlot = Arc<Mutex<Option<Result<Value, Error>>>>;

enum ReplyBody {
    Result(Value),
    Resource(String),
    Error(Error),
    Get {
        collection: bool,
        value: Value,
        query: Option<String>,
    },
}

pub(crate) struct RequestInner {
    resource: Resource,
    kind: RequestKind,
    method: Option<String>,
    cid: Option<String>,
    params: Option<Box<RawValue>>,
    token: Option<Box<RawValue>>,
    header: Option<HashMap<String, Vec<String>>>,
    host: Option<String>,
    remote_addr: Option<String>,
    uri: Option<String>,
    is_http: bool,
    sink: Sink,
    state: Mutex<RespState>,
    deadline: Mutex<Instant>,
}

impl RequestInner {
    fn send(&self, body: ReplyBody) -> HandlerResult {
        let meta = {
            let mut state = self.state.lock().unwrap();
            if state.sent {
                panic!(
                    "multiple responses to {} request for {}",
                    self.kind.label(),
                    self.resource.resource_name()
                );
            }
            state.sent = true;
            state.take_meta()
        };
        match &self.sink {
            Sink::Capture(slot) => {
                let captured = match body {
                    ReplyBody::Result(v) => Ok(v),
                    ReplyBody::Get { value, .. } => Ok(value),
                    ReplyBody::Error(e) => Err(e),
                    ReplyBody::Resource(_) => {
                        Err(Error::internal("unexpected resource response to value request"))
                    }
                };
                *slot.lock().unwrap() = Some(captured);
            }
            Sink::Publish { reply } => {
                let mut envelope = match body {
                    ReplyBody::Result(v) => serde_json::json!({ "result": v }),
                    ReplyBody::Resource(rid) => {
                        serde_json::json!({ "resource": { "rid": rid } })
                    }
                    ReplyBody::Error(e) => serde_json::json!({ "error": e }),
                    ReplyBody::Get {
                        collection,
                        value,
                        query,
                    } => {
                        let key = if collection { "collection" } else { "model" };
                        let mut result = serde_json::Map::new();
                        result.insert(key.into(), value);
                        if let Some(q) = query {
                            result.insert("query".into(), q.into());
                        }
                        serde_json::json!({ "result": result })
                    }
                };
                if let Some(meta) = meta {
                    envelope["meta"] = meta;
                }
                let bytes = serde_json::to_vec(&envelope).unwrap_or_default();
                let service = self.resource.service();
                if let Err(err) = service.publish_raw(reply, bytes) {
                    warn!(reply = %reply, "failed to publish response: {err}");
                    service.report_error(&err);
                }
            }
        }
        Ok(())
    }

    fn is_sent(&self) -> bool {
        self.state.lock().unwrap().sent
    }

    /// Send the pre-response extending the gateway's wait, and move the
    /// request deadline accordingly.
    fn timeout(&self, duration: Duration) {
        let ms = duration.as_millis();
        if ms > u32::MAX as u128 {
            panic!("timeout duration exceeds the protocol maximum");
        }
        if self.is_sent() {
            panic!(
                "timeout after response to {} request for {}",
                self.kind.label(),
                self.resource.resource_name()
            );
        }
        *self.deadline.lock().unwrap() = Instant::now() + duration;
        if let Sink::Publish { reply } = &self.sink {
            let bytes = format!("timeout:\"{}\"", ms).into_bytes();
            let service = self.resource.service();
            if let Err(err) = service.publish_raw(reply, bytes) {
                warn!(reply = %reply, "failed to publish pre-response: {err}");
                service.report_error(&err);
            }
        }
    }

    fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap()
    }

    fn cid(&self) -> &str {
        self.cid.as_deref().unwrap_or("")
    }

    fn raw_params(&self) -> Option<&str> {
        self.params.as_deref().map(RawValue::get)
    }

    fn raw_token(&self) -> Option<&str> {
        self.token.as_deref().map(RawValue::get)
    }

    fn parse_params<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_str(self.raw_params().unwrap_or("null"))
            .map_err(|e| Error::invalid_params(e.to_string()))
    }

    fn parse_token<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_str(self.raw_token().unwrap_or("null"))
            .map_err(|e| Error::internal(format!("unable to parse token: {e}")))
    }

    fn set_response_status(&self, status: u16) {
        if !self.is_http {
            panic!("response status set on a request that is not HTTP-originated");
        }
        self.state.lock().unwrap().status = Some(status);
    }

    fn set_response_header(&self, key: &str, value: &str) {
        if !self.is_http {
            panic!("response header set on a request that is not HTTP-originated");
        }
        self.state
            .lock()
            .unwrap()
            .header
            .get_or_insert_with(HashMap::new)
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
    }
}

macro_rules! request_view {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name {
            inner: Arc<RequestInner>,
        }

        impl Deref for $name {
            type Target = Resource;

            fn deref(&self) -> &Resource {
                &self.inner.resource
            }
        }

        impl $name {
            /// Respond with an error.
            pub fn error(&self, err: Error) -> HandlerResult {
                self.inner.send(ReplyBody::Error(err))
            }

            /// Respond with `system.notFound`.
            pub fn not_found(&self) -> HandlerResult {
                self.error(Error::not_found())
            }

            /// Extend the gateway's wait for this request.
            ///
            /// Emits a `timeout:"<ms>"` pre-response on the reply subject and
            /// resets the request deadline.
            ///
            /// # Panics
            ///
            /// Panics when the duration exceeds the protocol maximum or the
            /// request has already been responded to.
            pub fn timeout(&self, duration: Duration) {
                self.inner.timeout(duration);
            }

            /// The instant the gateway gives up waiting, as last extended.
            pub fn deadline(&self) -> Instant {
                self.inner.deadline()
            }
        }
    };
}

request_view! {
    /// An access request, asking whether a client connection may get a
    /// resource and which methods it may call.
    AccessRequest
}

request_view! {
    /// A get request for a resource's current representation.
    GetRequest
}

request_view! {
    /// A call request invoking a method on a resource.
    CallRequest
}

request_view! {
    /// An auth request invoking an authentication method on a resource.
    AuthRequest
}

request_view! {
    /// A legacy new-resource call, dispatched for the `new` method when no
    /// explicit call method is registered.
    NewRequest
}

impl AccessRequest {
    /// The requesting connection ID.
    pub fn cid(&self) -> &str {
        self.inner.cid()
    }

    /// The raw access token, or `None` when the connection has none.
    pub fn raw_token(&self) -> Option<&str> {
        self.inner.raw_token()
    }

    /// Decode the access token.
    pub fn parse_token<T: DeserializeOwned>(&self) -> Result<T, Error> {
        self.inner.parse_token()
    }

    /// Whether the request originates from an HTTP endpoint.
    pub fn is_http(&self) -> bool {
        self.inner.is_http
    }

    /// Respond with the client's access: `get` grants subscription, `call`
    /// is a comma-separated method list, `"*"` for all, empty for none.
    pub fn access(&self, get: bool, call: &str) -> HandlerResult {
        let mut result = serde_json::Map::new();
        result.insert("get".into(), get.into());
        if !call.is_empty() {
            result.insert("call".into(), call.into());
        }
        self.inner.send(ReplyBody::Result(Value::Object(result)))
    }

    /// Grant full access: `get: true, call: "*"`.
    pub fn access_granted(&self) -> HandlerResult {
        self.access(true, "*")
    }

    /// Respond with `system.accessDenied`.
    pub fn access_denied(&self) -> HandlerResult {
        self.error(Error::access_denied())
    }

    /// Set the HTTP response status. Panics unless the request is
    /// HTTP-originated.
    pub fn set_response_status(&self, status: u16) {
        self.inner.set_response_status(status);
    }

    /// Add an HTTP response header. Panics unless the request is
    /// HTTP-originated.
    pub fn set_response_header(&self, key: &str, value: &str) {
        self.inner.set_response_header(key, value);
    }
}

impl GetRequest {
    /// Respond with a model.
    ///
    /// # Panics
    ///
    /// Panics when the handler is collection typed.
    pub fn model(&self, model: impl Serialize) -> HandlerResult {
        self.model_query_inner(model, None)
    }

    /// Respond with a model for a query resource, echoing the normalized
    /// query.
    pub fn model_query(&self, model: impl Serialize, query: &str) -> HandlerResult {
        self.model_query_inner(model, Some(query.to_string()))
    }

    fn model_query_inner(&self, model: impl Serialize, query: Option<String>) -> HandlerResult {
        if self.resource_type() == crate::handler::ResourceType::Collection {
            panic!(
                "model response on collection resource {}",
                self.resource_name()
            );
        }
        let value = serde_json::to_value(model).map_err(|e| Error::internal(e.to_string()))?;
        self.inner.send(ReplyBody::Get {
            collection: false,
            value,
            query,
        })
    }

    /// Respond with a collection.
    ///
    /// # Panics
    ///
    /// Panics when the handler is model typed.
    pub fn collection(&self, collection: impl Serialize) -> HandlerResult {
        self.collection_query_inner(collection, None)
    }

    /// Respond with a collection for a query resource, echoing the
    /// normalized query.
    pub fn collection_query(&self, collection: impl Serialize, query: &str) -> HandlerResult {
        self.collection_query_inner(collection, Some(query.to_string()))
    }

    fn collection_query_inner(
        &self,
        collection: impl Serialize,
        query: Option<String>,
    ) -> HandlerResult {
        if self.resource_type() == crate::handler::ResourceType::Model {
            panic!(
                "collection response on model resource {}",
                self.resource_name()
            );
        }
        let value = serde_json::to_value(collection).map_err(|e| Error::internal(e.to_string()))?;
        self.inner.send(ReplyBody::Get {
            collection: true,
            value,
            query,
        })
    }

    /// Respond with `system.invalidQuery`.
    pub fn invalid_query(&self, message: impl Into<String>) -> HandlerResult {
        self.error(Error::invalid_query(message))
    }

    /// Create an internal get request whose response is captured instead of
    /// published, for the value helper.
    pub(crate) fn capturing(resource: Resource) -> (GetRequest, CaptureSlot) {
        let slot: CaptureSlot = Arc::new(Mutex::new(None));
        let inner = Arc::new(RequestInner {
            resource,
            kind: RequestKind::Get,
            method: None,
            cid: None,
            params: None,
            token: None,
            header: None,
            host: None,
            remote_addr: None,
            uri: None,
            is_http: false,
            sink: Sink::Capture(slot.clone()),
            state: Mutex::new(RespState::default()),
            deadline: Mutex::new(Instant::now() + DEFAULT_REQUEST_TIMEOUT),
        });
        (GetRequest { inner }, slot)
    }
}

macro_rules! method_request_accessors {
    ($name:ident) => {
        impl $name {
            /// The requesting connection ID.
            pub fn cid(&self) -> &str {
                self.inner.cid()
            }

            /// The invoked method.
            pub fn method(&self) -> &str {
                self.inner.method.as_deref().unwrap_or("")
            }

            /// The raw request parameters, or `None` when absent.
            pub fn raw_params(&self) -> Option<&str> {
                self.inner.raw_params()
            }

            /// Decode the request parameters. Fails with
            /// `system.invalidParams`.
            pub fn parse_params<T: DeserializeOwned>(&self) -> Result<T, Error> {
                self.inner.parse_params()
            }

            /// The raw access token, or `None` when the connection has none.
            pub fn raw_token(&self) -> Option<&str> {
                self.inner.raw_token()
            }

            /// Decode the access token.
            pub fn parse_token<T: DeserializeOwned>(&self) -> Result<T, Error> {
                self.inner.parse_token()
            }

            /// The HTTP request headers, when HTTP-originated.
            pub fn header(&self) -> Option<&HashMap<String, Vec<String>>> {
                self.inner.header.as_ref()
            }

            /// The HTTP host, when HTTP-originated.
            pub fn host(&self) -> &str {
                self.inner.host.as_deref().unwrap_or("")
            }

            /// The network address of the client, when HTTP-originated.
            pub fn remote_addr(&self) -> &str {
                self.inner.remote_addr.as_deref().unwrap_or("")
            }

            /// The unmodified request URI, when HTTP-originated.
            pub fn uri(&self) -> &str {
                self.inner.uri.as_deref().unwrap_or("")
            }

            /// Whether the request originates from an HTTP endpoint.
            pub fn is_http(&self) -> bool {
                self.inner.is_http
            }

            /// Set the HTTP response status. Panics unless the request is
            /// HTTP-originated.
            pub fn set_response_status(&self, status: u16) {
                self.inner.set_response_status(status);
            }

            /// Add an HTTP response header. Panics unless the request is
            /// HTTP-originated.
            pub fn set_response_header(&self, key: &str, value: &str) {
                self.inner.set_response_header(key, value);
            }

            /// Respond with `system.methodNotFound`.
            pub fn method_not_found(&self) -> HandlerResult {
                self.error(Error::method_not_found())
            }

            /// Respond with `system.invalidParams`.
            pub fn invalid_params(&self, message: impl Into<String>) -> HandlerResult {
                self.error(Error::invalid_params(message))
            }

            /// Respond with `system.invalidQuery`.
            pub fn invalid_query(&self, message: impl Into<String>) -> HandlerResult {
                self.error(Error::invalid_query(message))
            }
        }
    };
}

method_request_accessors!(CallRequest);
method_request_accessors!(AuthRequest);
method_request_accessors!(NewRequest);

impl CallRequest {
    /// Respond with a successful result. Use `()` for a null result.
    pub fn ok(&self, result: impl Serialize) -> HandlerResult {
        let value = serde_json::to_value(result).map_err(|e| Error::internal(e.to_string()))?;
        self.inner.send(ReplyBody::Result(value))
    }

    /// Respond with a reference to a resource, typically one created by the
    /// call.
    pub fn resource(&self, rid: impl Into<String>) -> HandlerResult {
        let rid = rid.into();
        if !Ref::new(rid.clone()).is_valid() {
            return Err(Error::internal(format!("invalid resource reference {:?}", rid)));
        }
        self.inner.send(ReplyBody::Resource(rid))
    }
}

impl AuthRequest {
    /// Respond with a successful result. Use `()` for a null result.
    pub fn ok(&self, result: impl Serialize) -> HandlerResult {
        let value = serde_json::to_value(result).map_err(|e| Error::internal(e.to_string()))?;
        self.inner.send(ReplyBody::Result(value))
    }

    /// Respond with a reference to a resource.
    pub fn resource(&self, rid: impl Into<String>) -> HandlerResult {
        let rid = rid.into();
        if !Ref::new(rid.clone()).is_valid() {
            return Err(Error::internal(format!("invalid resource reference {:?}", rid)));
        }
        self.inner.send(ReplyBody::Resource(rid))
    }

    /// Respond with `system.accessDenied`.
    pub fn access_denied(&self) -> HandlerResult {
        self.error(Error::access_denied())
    }

    /// Issue a connection token for the requesting client, then respond
    /// separately with one of the terminal methods.
    pub fn token_event(&self, token: impl Serialize) -> Result<(), crate::error::ServiceError> {
        self.service().token_event(self.cid(), token)
    }
}

impl NewRequest {
    /// Respond with the resource ID of the newly created resource, in the
    /// legacy result shape.
    pub fn new_resource(&self, rid: impl Into<String>) -> HandlerResult {
        let rid = rid.into();
        if !Ref::new(rid.clone()).is_valid() {
            return Err(Error::internal(format!("invalid resource reference {:?}", rid)));
        }
        self.inner
            .send(ReplyBody::Result(serde_json::json!({ "rid": rid })))
    }
}

// ── Execution ───────────────────────────────────────────────────────────

/// Publish an error reply outside any request context, for messages that
/// fail before a request can be constructed.
fn reply_error(service: &Service, reply: &str, err: &Error) {
    let bytes = serde_json::to_vec(&serde_json::json!({ "error": err })).unwrap_or_default();
    if let Err(e) = service.publish_raw(reply, bytes) {
        warn!(reply = %reply, "failed to publish error reply: {e}");
        service.report_error(&e);
    }
}

/// A human-readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(e) = payload.downcast_ref::<Error>() {
        e.to_string()
    } else {
        "unknown panic".to_string()
    }
}

/// Convert a caught panic payload into the error to respond with.
pub(crate) fn error_from_panic(payload: Box<dyn Any + Send>) -> Error {
    match payload.downcast::<Error>() {
        Ok(err) => *err,
        Err(payload) => Error::internal(panic_message(payload.as_ref())),
    }
}

/// Run one request end to end: parse the payload, invoke the matching hook,
/// and guarantee exactly one terminal response.
pub(crate) async fn execute(service: Service, parsed: ParsedSubject, m: Match, msg: Message) {
    if msg.reply.is_empty() {
        warn!(subject = %msg.subject, "request without a reply subject dropped");
        return;
    }
    let dto = match parse_payload(&msg.payload) {
        Ok(dto) => dto,
        Err(err) => {
            error!(subject = %msg.subject, "malformed request payload: {}", err.message);
            reply_error(&service, &msg.reply, &err);
            return;
        }
    };

    let handler = m.handler.clone();
    let resource = Resource::from_match(
        service.clone(),
        parsed.rid.clone(),
        dto.query.clone().unwrap_or_default(),
        m,
    );
    let inner = Arc::new(RequestInner {
        resource: resource.clone(),
        kind: parsed.kind,
        method: parsed.method.clone(),
        cid: dto.cid,
        params: dto.params,
        token: dto.token,
        header: dto.header,
        host: dto.host,
        remote_addr: dto.remote_addr,
        uri: dto.uri,
        is_http: dto.is_http.unwrap_or(false),
        sink: Sink::Publish {
            reply: msg.reply.clone(),
        },
        state: Mutex::new(RespState::default()),
        deadline: Mutex::new(Instant::now() + DEFAULT_REQUEST_TIMEOUT),
    });

    let fut: BoxFuture<'static, HandlerResult> = match parsed.kind {
        RequestKind::Access => match &handler.access {
            Some(hook) => hook(AccessRequest { inner: inner.clone() }),
            // Access may be answered by another service; stay silent.
            None => return,
        },
        RequestKind::Get => match &handler.get {
            Some(hook) => {
                resource.enter_get();
                hook(GetRequest { inner: inner.clone() })
            }
            None => {
                let _ = inner.send(ReplyBody::Error(Error::not_found()));
                return;
            }
        },
        RequestKind::Call => {
            let method = parsed.method.as_deref().unwrap_or("");
            if let Some(hook) = handler.calls.get(method) {
                hook(CallRequest { inner: inner.clone() })
            } else if method == "new" {
                match &handler.new_call {
                    Some(hook) => hook(NewRequest { inner: inner.clone() }),
                    None => {
                        let _ = inner.send(ReplyBody::Error(Error::method_not_found()));
                        return;
                    }
                }
            } else {
                let _ = inner.send(ReplyBody::Error(Error::method_not_found()));
                return;
            }
        }
        RequestKind::Auth => {
            let method = parsed.method.as_deref().unwrap_or("");
            match handler.auths.get(method) {
                Some(hook) => hook(AuthRequest { inner: inner.clone() }),
                None => {
                    let _ = inner.send(ReplyBody::Error(Error::method_not_found()));
                    return;
                }
            }
        }
    };

    let outcome = AssertUnwindSafe(fut).catch_unwind().await;
    if parsed.kind == RequestKind::Get {
        resource.leave_get();
    }
    finalize(&inner, outcome);
}

fn finalize(
    inner: &Arc<RequestInner>,
    outcome: Result<HandlerResult, Box<dyn Any + Send>>,
) {
    let rid = inner.resource.resource_name().to_string();
    match outcome {
        Ok(Ok(())) => {
            if !inner.is_sent() {
                error!(resource = %rid, "handler returned without responding");
                let _ = inner.send(ReplyBody::Error(Error::internal(
                    "no response from handler",
                )));
            }
        }
        Ok(Err(err)) => {
            if inner.is_sent() {
                error!(resource = %rid, "handler returned an error after responding: {err}");
            } else {
                let _ = inner.send(ReplyBody::Error(err));
            }
        }
        Err(payload) => {
            let err = error_from_panic(payload);
            if inner.is_sent() {
                error!(resource = %rid, "handler panicked after responding: {}", err.message);
            } else {
                error!(resource = %rid, "handler panicked: {}", err.message);
                let _ = inner.send(ReplyBody::Error(err));
            }
        }
    }
}
