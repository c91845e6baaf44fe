//! Well-known protocol identifiers and the payload types both sides of the
//! registry-sync protocol exchange.
//!
//! These identifiers must match byte-for-byte between peers; a node built
//! against different names cannot interoperate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method every node hosts to answer registry-snapshot queries.
pub const SERVICES_METHOD: &str = "__services__";

/// Method every node hosts to run the authorization handshake.
pub const AUTHORIZE_METHOD: &str = "__authorize__";

/// Broadcast channel carrying registry updates for services added after a
/// peer connected. Payload: a [`Registry`] fragment keyed by service name.
pub const ADD_SERVICE_CHANNEL: &str = "__add_service__";

/// Broadcast channel carrying application-level service events. Payload:
/// a [`ServiceEvent`].
pub const SERVICE_EVENT_CHANNEL: &str = "__service_event__";

/// A registry snapshot or update: service descriptors keyed by name.
pub type Registry = HashMap<String, ServiceDescriptor>;

/// The published shape of a service, used to construct a remote proxy.
///
/// Immutable once published; re-publishing a descriptor under the same name
/// replaces the proxy's method set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Type tag of the service (defaults to `"service"`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Service name, unique within a registry.
    pub name: String,
    /// Method names. Order carries no meaning.
    pub methods: Vec<String>,
}

impl ServiceDescriptor {
    /// Whether the descriptor lists a method of this name.
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

/// Wrapper around every method result.
///
/// `kind` lets a generic transform on the consuming side disambiguate
/// heterogeneous payloads; it defaults to the runtime category of the
/// returned value (see [`value_kind`]) unless the registrant overrides it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Payload category or registrant-supplied override.
    #[serde(rename = "type")]
    pub kind: String,
    /// The method's return value.
    pub data: Value,
}

/// An application-level event as carried on the service-event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    /// Event name, re-emitted locally by the receiving proxy.
    pub name: String,
    /// Event payload.
    pub data: Value,
}

/// Runtime category of a JSON value, used as the default envelope kind.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn value_kind_covers_every_category() {
        assert_eq!(value_kind(&Value::Null), "null");
        assert_eq!(value_kind(&json!(true)), "boolean");
        assert_eq!(value_kind(&json!(5)), "number");
        assert_eq!(value_kind(&json!("hi")), "string");
        assert_eq!(value_kind(&json!([1, 2])), "array");
        assert_eq!(value_kind(&json!({"a": 1})), "object");
    }

    #[test]
    fn envelope_uses_type_on_the_wire() {
        let envelope = Envelope {
            kind: "number".into(),
            data: json!(5),
        };
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire, json!({"type": "number", "data": 5}));

        let back: Envelope = serde_json::from_value(wire).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn descriptor_round_trips_with_type_rename() {
        let descriptor = ServiceDescriptor {
            kind: "service".into(),
            name: "math".into(),
            methods: vec!["add".into(), "sub".into()],
        };
        let wire = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(wire["type"], json!("service"));
        assert!(descriptor.has_method("add"));
        assert!(!descriptor.has_method("mul"));

        let registry: Registry =
            serde_json::from_value(json!({"math": wire})).unwrap();
        assert_eq!(registry["math"], descriptor);
    }
}
