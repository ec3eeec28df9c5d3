//! The messaging capability consumed by a [`Service`](crate::Service).
//!
//! The service never talks to a broker directly; it is handed an
//! implementation of [`Bus`] at serve time. A production implementation wraps
//! a NATS client, while tests use the in-process mock from `resling-test`.

use bytes::Bytes;
use tokio::sync::mpsc;

/// A raw message delivered from, or published to, the bus.
#[derive(Debug, Clone)]
pub struct Message {
    /// The subject the message was published on.
    pub subject: String,
    /// The reply subject, empty when the message expects no reply.
    pub reply: String,
    /// The raw payload bytes.
    pub payload: Bytes,
}

impl Message {
    /// Create a message with no reply subject.
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: String::new(),
            payload: payload.into(),
        }
    }
}

/// Errors reported by a [`Bus`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The connection to the broker is gone.
    #[error("bus connection closed")]
    Closed,
    /// The subject is not valid for this operation.
    #[error("invalid subject: {0}")]
    InvalidSubject(String),
    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

/// Handle to an active subscription.
///
/// Dropping the sender passed to [`Bus::subscribe`] is the implementation's
/// responsibility on [`unsubscribe`](Subscription::unsubscribe); the service
/// relies on it to detect that no more messages will arrive.
pub trait Subscription: Send {
    /// Stop delivery and release the channel sender.
    fn unsubscribe(self: Box<Self>);
}

/// Publish/subscribe capability over a NATS-style transport.
///
/// Subjects are dot-delimited. Subscription subjects may use the NATS
/// wildcards `*` (one token) and `>` (one or more trailing tokens); matching
/// them is the implementation's concern.
pub trait Bus: Send + Sync {
    /// Publish a message without expecting a reply.
    fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Publish a message carrying a reply subject.
    fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        payload: Vec<u8>,
    ) -> Result<(), BusError>;

    /// Subscribe to a subject, delivering matching messages on `sender`.
    ///
    /// Implementations must use a non-blocking send and drop the message if
    /// the channel is full; the service logs dropped messages and the
    /// gateway's request timeout covers the loss.
    fn subscribe(
        &self,
        subject: &str,
        sender: mpsc::Sender<Message>,
    ) -> Result<Box<dyn Subscription>, BusError>;

    /// Return a fresh, unique inbox subject for a reply channel.
    fn new_inbox(&self) -> String;
}
