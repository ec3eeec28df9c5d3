//! Core runtime for building RES-protocol resource services over a
//! NATS-style publish/subscribe transport.
//!
//! Client gateways translate external sessions into RES requests on the
//! bus; this library sits on the service side. It routes `access`, `get`,
//! `call`, and `auth` requests to registered handlers through a pattern
//! trie, serializes everything touching the same resource group through a
//! per-group queue on a fixed worker pool, and pipes the events handlers
//! emit through apply hooks and listeners before publishing them back on
//! the bus — always before the request's own reply, so gateways see state
//! updates before acks.
//!
//! The transport itself is a capability: implement [`bus::Bus`] over your
//! broker connection, or use the in-process mock from `resling-test`.

pub mod bus;
pub mod error;
pub mod event;
pub mod handler;
pub mod query;
pub mod request;
pub mod resource;
pub mod router;
pub mod service;
pub mod types;

mod pattern;
mod runtime;

pub use bus::{Bus, BusError, Message, Subscription};
pub use error::{Error, ServiceError};
pub use event::EventInfo;
pub use handler::{Handler, HandlerResult, ResourceType};
pub use query::QueryRequest;
pub use request::{AccessRequest, AuthRequest, CallRequest, GetRequest, NewRequest};
pub use resource::Resource;
pub use router::Router;
pub use service::{Service, PROTOCOL_VERSION};
pub use types::{delete_action, ChangeValues, DataValue, Ref};
