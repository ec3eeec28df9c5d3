//! Test utilities for resling services.
//!
//! [`MockBus`] is an in-process [`Bus`] implementation with NATS-style
//! wildcard matching and a log of everything the service publishes, so
//! tests can assert on bus traffic in order. [`TestService`] wraps a
//! [`Service`] served over a `MockBus` and drives requests against it
//! without a broker.

mod bus;
mod pre;

pub use bus::{MockBus, PublishedMessage, Requester};
pub use pre::parse_pre_response;

use resling_core::{Service, Message};
use serde_json::Value;

/// How long test helpers wait for bus traffic before panicking.
pub(crate) const WAIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// A service served over a [`MockBus`], ready to receive requests.
pub struct TestService {
    /// The bus the service is connected to.
    pub bus: MockBus,
    service: Service,
    serve_handle: tokio::task::JoinHandle<()>,
}

impl TestService {
    /// Serve `service` on a fresh [`MockBus`] and wait until it has
    /// announced itself with `system.reset`.
    pub async fn start(service: Service) -> TestService {
        let bus = MockBus::new();
        let serve_bus = bus.clone();
        let serve_service = service.clone();
        let serve_handle = tokio::spawn(async move {
            if let Err(err) = serve_service.serve(serve_bus).await {
                panic!("serve failed: {err}");
            }
        });
        bus.expect_published_on("system.reset").await;
        TestService {
            bus,
            service,
            serve_handle,
        }
    }

    /// The served service handle.
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Send a request and return a [`Requester`] for reading the reply
    /// subject.
    pub fn request(&self, subject: &str, payload: impl Into<Vec<u8>>) -> Requester {
        self.bus.request(subject, payload)
    }

    /// Send a get request with an empty payload and return the parsed
    /// response envelope.
    pub async fn get(&self, rid: &str) -> Value {
        self.request(&format!("get.{rid}"), b"{}".as_slice())
            .response()
            .await
    }

    /// Send a call request and return the parsed response envelope.
    pub async fn call(&self, rid: &str, method: &str, payload: &Value) -> Value {
        let bytes = serde_json::to_vec(payload).unwrap();
        self.request(&format!("call.{rid}.{method}"), bytes)
            .response()
            .await
    }

    /// Send an auth request and return the parsed response envelope.
    pub async fn auth(&self, rid: &str, method: &str, payload: &Value) -> Value {
        let bytes = serde_json::to_vec(payload).unwrap();
        self.request(&format!("auth.{rid}.{method}"), bytes)
            .response()
            .await
    }

    /// Send an access request and return the parsed response envelope.
    pub async fn access(&self, rid: &str, payload: &Value) -> Value {
        let bytes = serde_json::to_vec(payload).unwrap();
        self.request(&format!("access.{rid}"), bytes)
            .response()
            .await
    }

    /// Shut the service down and wait for serve to finish.
    pub async fn stop(self) {
        self.service.shutdown().await;
        let _ = self.serve_handle.await;
    }
}

/// Deliver a plain message (no reply expected) to the bus, as a gateway
/// would.
pub fn send(bus: &MockBus, subject: &str, payload: impl Into<Vec<u8>>) {
    let msg = Message::new(subject, payload.into());
    bus.deliver(msg);
}
