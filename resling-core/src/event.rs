//! Event metadata passed to pattern-bound listeners.

use std::sync::Arc;

use serde_json::Value;

use crate::resource::Resource;
use crate::types::ChangeValues;

/// Event names with protocol meaning; custom events may not use them.
const RESERVED_EVENT_NAMES: &[&str] = &[
    "change",
    "add",
    "remove",
    "create",
    "delete",
    "patch",
    "reaccess",
    "unsubscribe",
    "query",
    "token",
    "reset",
];

/// Whether `name` is reserved by the protocol.
pub(crate) fn reserved_event_name(name: &str) -> bool {
    RESERVED_EVENT_NAMES.contains(&name)
}

/// An event as observed by a listener, before it is published.
///
/// Which optional fields are set depends on the event:
///
/// | Event    | Fields |
/// |----------|--------|
/// | `change` | `new_values`, and `old_values` when an apply hook provided them |
/// | `add`    | `value`, `idx` |
/// | `remove` | `idx`, and `value` when an apply hook returned the removed element |
/// | `create` | `data` |
/// | `delete` | `data` when an apply hook returned the deleted state |
/// | custom   | `data` |
pub struct EventInfo {
    /// The resource the event was emitted on.
    pub resource: Resource,
    /// The event name.
    pub name: String,
    /// Changed properties and their new values.
    pub new_values: Option<ChangeValues>,
    /// Previous values of the changed properties.
    pub old_values: Option<ChangeValues>,
    /// The added or removed element.
    pub value: Option<Value>,
    /// The index of an added or removed element.
    pub idx: Option<usize>,
    /// Event payload data.
    pub data: Option<Value>,
}

impl EventInfo {
    pub(crate) fn new(resource: Resource, name: impl Into<String>) -> Self {
        Self {
            resource,
            name: name.into(),
            new_values: None,
            old_values: None,
            value: None,
            idx: None,
            data: None,
        }
    }

    /// The name of the resource the event was emitted on.
    pub fn resource_name(&self) -> &str {
        self.resource.resource_name()
    }
}

/// A pattern-bound event listener. Listeners run inline on the emitting
/// worker, in registration order, and must not block.
pub type ListenerFn = Arc<dyn Fn(&EventInfo) + Send + Sync>;
