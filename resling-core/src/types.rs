//! Value types used in resource models, collections, and event payloads.

use std::collections::HashMap;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pattern;

/// The property map carried by a `change` event: property name to new value.
/// A deleted property maps to the [`delete_action`] sentinel.
pub type ChangeValues = HashMap<String, Value>;

/// A resource reference value, serialized as `{"rid": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ref(pub String);

impl Ref {
    /// Create a reference to the given resource ID.
    pub fn new(rid: impl Into<String>) -> Self {
        Ref(rid.into())
    }

    /// Whether the reference holds a valid resource ID, optionally followed
    /// by a query.
    pub fn is_valid(&self) -> bool {
        let name = self.0.split('?').next().unwrap_or("");
        pattern::valid_dotted(name)
    }

    /// The referenced resource ID.
    pub fn rid(&self) -> &str {
        &self.0
    }
}

impl Serialize for Ref {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("rid", &self.0)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Ref {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RefVisitor;

        impl<'de> Visitor<'de> for RefVisitor {
            type Value = Ref;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a resource reference object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Ref, A::Error> {
                let mut rid = None;
                while let Some(key) = map.next_key::<String>()? {
                    if key == "rid" {
                        rid = Some(map.next_value::<String>()?);
                    } else {
                        let _ = map.next_value::<serde::de::IgnoredAny>()?;
                    }
                }
                rid.map(Ref).ok_or_else(|| de::Error::missing_field("rid"))
            }
        }

        deserializer.deserialize_map(RefVisitor)
    }
}

/// The delete sentinel value, `{"action": "delete"}`, used inside a change
/// map to delete a model property.
pub fn delete_action() -> Value {
    serde_json::json!({"action": "delete"})
}

/// Wrapper marking a leaf value as data, serialized as `{"data": ...}`.
///
/// Arrays and objects appearing as a leaf value inside a model or change map
/// must be wrapped this way so gateways can tell them apart from references
/// and sentinels.
#[derive(Debug, Clone, PartialEq)]
pub struct DataValue<T>(pub T);

impl<T: Serialize> Serialize for DataValue<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("data", &self.0)?;
        map.end()
    }
}
