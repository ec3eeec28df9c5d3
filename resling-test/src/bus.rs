use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::Rng;
use resling_core::bus::{Bus, BusError, Message, Subscription};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::error;

use crate::WAIT_TIMEOUT;

/// A message recorded from the service side of the bus.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub subject: String,
    pub payload: Bytes,
}

impl PublishedMessage {
    /// The payload parsed as JSON. Panics on non-JSON payloads; use
    /// [`payload`](PublishedMessage::payload) for raw pre-responses.
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or_else(|e| {
            panic!(
                "payload on {} is not JSON ({}): {:?}",
                self.subject,
                e,
                String::from_utf8_lossy(&self.payload)
            )
        })
    }
}

struct SubEntry {
    id: u64,
    subject: String,
    sender: mpsc::Sender<Message>,
}

struct BusInner {
    subs: Mutex<Vec<SubEntry>>,
    published: Mutex<VecDeque<PublishedMessage>>,
    notify: Notify,
    next_id: AtomicU64,
    inbox_prefix: String,
}

/// An in-process bus with NATS-style wildcard subscriptions.
///
/// Everything the service publishes (replies, events, lifecycle messages)
/// is also recorded, in publish order, for assertion via
/// [`next_published`](MockBus::next_published).
#[derive(Clone)]
pub struct MockBus {
    inner: Arc<BusInner>,
}

impl MockBus {
    pub fn new() -> MockBus {
        let suffix: u32 = rand::thread_rng().gen();
        MockBus {
            inner: Arc::new(BusInner {
                subs: Mutex::new(Vec::new()),
                published: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                next_id: AtomicU64::new(1),
                inbox_prefix: format!("_INBOX.{:08x}", suffix),
            }),
        }
    }

    /// Route a message to matching subscriptions without recording it, as a
    /// gateway-side publish would.
    pub fn deliver(&self, msg: Message) {
        let subs = self.inner.subs.lock().unwrap();
        for sub in subs.iter() {
            if subject_matches(&sub.subject, &msg.subject) {
                if sub.sender.try_send(msg.clone()).is_err() {
                    error!(
                        subject = %msg.subject,
                        subscription = %sub.subject,
                        "inbound channel full or closed, dropping message"
                    );
                }
            }
        }
    }

    /// Send a request with a fresh inbox and return a [`Requester`] reading
    /// that inbox.
    pub fn request(&self, subject: &str, payload: impl Into<Vec<u8>>) -> Requester {
        let inbox = self.new_inbox();
        let (tx, rx) = mpsc::channel(16);
        let sub = self
            .subscribe(&inbox, tx)
            .expect("mock subscription cannot fail");
        self.deliver(Message {
            subject: subject.to_string(),
            reply: inbox.clone(),
            payload: Bytes::from(payload.into()),
        });
        Requester {
            inbox,
            rx,
            _sub: sub,
        }
    }

    /// Pop the next service-published message, waiting up to a second.
    pub async fn next_published(&self) -> PublishedMessage {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                if let Some(msg) = self.inner.published.lock().unwrap().pop_front() {
                    return msg;
                }
                self.inner.notify.notified().await;
            }
        })
        .await
        .expect("timed out waiting for a published message")
    }

    /// Pop messages until one on `subject` arrives, and return it.
    pub async fn expect_published_on(&self, subject: &str) -> PublishedMessage {
        loop {
            let msg = self.next_published().await;
            if msg.subject == subject {
                return msg;
            }
        }
    }

    /// Pop the next published message and assert its subject.
    pub async fn expect_published(&self, subject: &str) -> PublishedMessage {
        let msg = self.next_published().await;
        assert_eq!(msg.subject, subject, "unexpected publish order");
        msg
    }

    /// Snapshot of recorded messages not yet consumed.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.published.lock().unwrap().iter().cloned().collect()
    }

    /// Drop all recorded messages.
    pub fn clear_published(&self) {
        self.inner.published.lock().unwrap().clear();
    }

    /// Subjects of the currently active subscriptions.
    pub fn subscription_subjects(&self) -> Vec<String> {
        self.inner
            .subs
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.subject.clone())
            .collect()
    }

    fn record(&self, subject: &str, payload: &[u8]) {
        self.inner
            .published
            .lock()
            .unwrap()
            .push_back(PublishedMessage {
                subject: subject.to_string(),
                payload: Bytes::copy_from_slice(payload),
            });
        self.inner.notify.notify_one();
    }
}

impl Default for MockBus {
    fn default() -> Self {
        MockBus::new()
    }
}

impl Bus for MockBus {
    fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.record(subject, &payload);
        self.deliver(Message::new(subject, payload));
        Ok(())
    }

    fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        self.deliver(Message {
            subject: subject.to_string(),
            reply: reply.to_string(),
            payload: Bytes::from(payload),
        });
        Ok(())
    }

    fn subscribe(
        &self,
        subject: &str,
        sender: mpsc::Sender<Message>,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subs.lock().unwrap().push(SubEntry {
            id,
            subject: subject.to_string(),
            sender,
        });
        Ok(Box::new(MockSubscription {
            id,
            inner: self.inner.clone(),
        }))
    }

    fn new_inbox(&self) -> String {
        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{}.{}", self.inner.inbox_prefix, n)
    }
}

struct MockSubscription {
    id: u64,
    inner: Arc<BusInner>,
}

impl Subscription for MockSubscription {
    fn unsubscribe(self: Box<Self>) {
        self.inner.subs.lock().unwrap().retain(|s| s.id != self.id);
    }
}

/// Reads the reply subject of one request.
pub struct Requester {
    inbox: String,
    rx: mpsc::Receiver<Message>,
    _sub: Box<dyn Subscription>,
}

impl Requester {
    /// The inbox subject replies arrive on.
    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    /// The next raw message on the reply subject: a pre-response or the
    /// response itself.
    pub async fn next_raw(&mut self) -> Bytes {
        tokio::time::timeout(WAIT_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a reply")
            .expect("reply channel closed")
            .payload
    }

    /// The response envelope, skipping any pre-responses.
    pub async fn response(&mut self) -> Value {
        loop {
            let raw = self.next_raw().await;
            // Pre-responses are bare `key:"value"` streams, never JSON
            // objects.
            if raw.first() == Some(&b'{') {
                return serde_json::from_slice(&raw).unwrap_or_else(|e| {
                    panic!(
                        "response is not JSON ({e}): {:?}",
                        String::from_utf8_lossy(&raw)
                    )
                });
            }
        }
    }
}

/// NATS-style subject matching: `*` matches one token, a trailing `>`
/// matches one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            _ => return false,
        }
    }
}
