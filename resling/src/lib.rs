//! resling — RES-protocol resource services for Rust.
//!
//! This facade crate re-exports `resling-core` at the top level. Enable the
//! `test-util` feature to pull in the `resling-test` harness for driving a
//! service without a broker.
//!
//! ```ignore
//! use resling::{Handler, Service};
//!
//! let service = Service::new("library");
//! service.handle(
//!     "book.$id",
//!     Handler::new()
//!         .access_granted()
//!         .get_model(|r: resling::GetRequest| async move {
//!             r.model(serde_json::json!({ "id": r.path_param("id") }))
//!         }),
//! );
//! ```

pub use resling_core::*;

#[cfg(feature = "test-util")]
pub use resling_test;
