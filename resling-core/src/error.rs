use serde::{Deserialize, Serialize};

/// Pre-defined error code for resource not found.
pub const CODE_NOT_FOUND: &str = "system.notFound";
/// Pre-defined error code for method not found.
pub const CODE_METHOD_NOT_FOUND: &str = "system.methodNotFound";
/// Pre-defined error code for invalid parameters.
pub const CODE_INVALID_PARAMS: &str = "system.invalidParams";
/// Pre-defined error code for an invalid query.
pub const CODE_INVALID_QUERY: &str = "system.invalidQuery";
/// Pre-defined error code for denied access.
pub const CODE_ACCESS_DENIED: &str = "system.accessDenied";
/// Pre-defined error code for a timed out request.
pub const CODE_TIMEOUT: &str = "system.timeout";
/// Pre-defined error code for an internal error.
pub const CODE_INTERNAL_ERROR: &str = "system.internalError";

/// A RES protocol error, sent to the gateway inside an error response.
///
/// The `code` is a dotted identifier (`system.notFound`, `myService.myError`),
/// `message` is human readable, and `data` carries optional structured detail.
///
/// Handlers return `Error` from their hook (or pass it to
/// [`error`](crate::request::CallRequest::error)) to produce an error
/// response. Panicking with an `Error` payload inside a handler has the same
/// effect; any other panic is turned into `system.internalError`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Error {
    /// Dotted error code identifier.
    pub code: String,
    /// Human readable message.
    pub message: String,
    /// Optional structured error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Error {
    /// Create a new error with a custom code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data to the error.
    pub fn with_data(mut self, data: impl Serialize) -> Self {
        self.data = Some(serde_json::to_value(data).unwrap_or(serde_json::Value::Null));
        self
    }

    /// `system.notFound` — the resource does not exist.
    pub fn not_found() -> Self {
        Self::new(CODE_NOT_FOUND, "Not found")
    }

    /// `system.methodNotFound` — the call or auth method is not registered.
    pub fn method_not_found() -> Self {
        Self::new(CODE_METHOD_NOT_FOUND, "Method not found")
    }

    /// `system.invalidParams` — the handler rejected the request parameters.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(CODE_INVALID_PARAMS, message)
    }

    /// `system.invalidQuery` — the handler rejected the resource query.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::new(CODE_INVALID_QUERY, message)
    }

    /// `system.accessDenied` — the access handler denied the client.
    pub fn access_denied() -> Self {
        Self::new(CODE_ACCESS_DENIED, "Access denied")
    }

    /// `system.timeout` — the request took too long to complete.
    pub fn timeout() -> Self {
        Self::new(CODE_TIMEOUT, "Request timeout")
    }

    /// `system.internalError` — something went wrong on the service side.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CODE_INTERNAL_ERROR, message)
    }

    /// Whether this error carries the given pre-defined code.
    pub fn is_code(&self, code: &str) -> bool {
        self.code == code
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::invalid_params(err.to_string())
    }
}

/// Infrastructure errors surfaced by the service lifecycle, as opposed to
/// protocol [`Error`]s sent to clients.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The bus rejected a publish or subscribe.
    #[error("bus error: {0}")]
    Bus(#[from] crate::bus::BusError),
    /// No registered handler matches the given resource name.
    #[error("no handler matches resource {0}")]
    NoHandler(String),
    /// The operation requires a running service.
    #[error("service is not serving")]
    NotServing,
    /// The inbound channel was full and a request had to be dropped.
    #[error("inbound channel full; dropped message on {0}")]
    ChannelFull(String),
}
