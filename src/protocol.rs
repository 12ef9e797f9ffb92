//! Messages exchanged between the replicator and its clients.
//!
//! Every message is one JSON text frame tagged by `type`. Operation batches and assignments
//! carry the revision they were computed against and the schema sum the sender validated
//! with, so receivers can detect stale messages.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{operation::Operation, schema::SchemaSum};

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Create or look up a replicant and subscribe to it.
    Declare {
        namespace: String,
        name: String,
        #[serde(default)]
        opts: DeclareOptions,
    },
    /// Replace the whole value.
    Assignment {
        namespace: String,
        name: String,
        #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        revision: u64,
        #[serde(default)]
        schema_sum: Option<SchemaSum>,
    },
    /// Apply a batch of operations.
    Operations {
        namespace: String,
        name: String,
        operations: Vec<Operation>,
        revision: u64,
        #[serde(default)]
        schema_sum: Option<SchemaSum>,
    },
}

/// Options a client may pass when declaring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclareOptions {
    /// Initial value when nothing is persisted yet.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    /// Whether the value is written to the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
    /// Milliseconds between the last change and the save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence_interval: Option<u64>,
}

/// Messages sent by the replicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Full snapshot, sent once per declare.
    Declared {
        namespace: String,
        name: String,
        #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        revision: u64,
        #[serde(default)]
        schema_sum: Option<SchemaSum>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
    },
    /// The whole value was replaced.
    Assignment {
        namespace: String,
        name: String,
        #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        revision: u64,
        #[serde(default)]
        schema_sum: Option<SchemaSum>,
    },
    /// A batch of operations was applied.
    Operations {
        namespace: String,
        name: String,
        operations: Vec<Operation>,
        revision: u64,
        #[serde(default)]
        schema_sum: Option<SchemaSum>,
    },
    /// A declare failed.
    DeclarationRejected {
        namespace: String,
        name: String,
        reason: String,
    },
    /// An operation batch was not applied.
    OperationsRejected {
        namespace: String,
        name: String,
        reason: String,
    },
    /// An assignment was not applied.
    AssignmentRejected {
        namespace: String,
        name: String,
        reason: String,
    },
}

impl ClientMessage {
    /// The `(namespace, name)` this message is about.
    pub fn target(&self) -> (&str, &str) {
        match self {
            ClientMessage::Declare {
                namespace, name, ..
            }
            | ClientMessage::Assignment {
                namespace, name, ..
            }
            | ClientMessage::Operations {
                namespace, name, ..
            } => (namespace, name),
        }
    }
}

impl ServerMessage {
    /// The `(namespace, name)` this message is about.
    pub fn target(&self) -> (&str, &str) {
        match self {
            ServerMessage::Declared {
                namespace, name, ..
            }
            | ServerMessage::Assignment {
                namespace, name, ..
            }
            | ServerMessage::Operations {
                namespace, name, ..
            }
            | ServerMessage::DeclarationRejected {
                namespace, name, ..
            }
            | ServerMessage::OperationsRejected {
                namespace, name, ..
            }
            | ServerMessage::AssignmentRejected {
                namespace, name, ..
            } => (namespace, name),
        }
    }
}

impl ServerMessage {
    /// The rejection answering a frame that names a replicant but does not decode.
    ///
    /// Only the `type`, `namespace` and `name` of `text` have to be readable. Returns `None`
    /// when even those are missing, such a frame cannot be answered.
    pub fn rejecting_invalid(text: &str, reason: String) -> Option<ServerMessage> {
        let msg = match serde_json::from_str(text).ok()? {
            Envelope::Declare { namespace, name } => ServerMessage::DeclarationRejected {
                namespace,
                name,
                reason,
            },
            Envelope::Assignment { namespace, name } => ServerMessage::AssignmentRejected {
                namespace,
                name,
                reason,
            },
            Envelope::Operations { namespace, name } => ServerMessage::OperationsRejected {
                namespace,
                name,
                reason,
            },
        };
        Some(msg)
    }
}

/// The addressing part of a [`ClientMessage`].
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Envelope {
    Declare { namespace: String, name: String },
    Assignment { namespace: String, name: String },
    Operations { namespace: String, name: String },
}

/// Distinguishes a present `null` from a missing field.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::operation::{ArrayMutation, OpKind};

    #[test]
    fn undecodable_frames_are_answered() {
        let sort_with_comparator = json!({
            "type": "operations",
            "namespace": "ns",
            "name": "list",
            "revision": 0,
            "operations": [
                { "path": "/", "method": "sort", "args": { "mutatorArgs": ["(a,b)=>a-b"] } }
            ]
        })
        .to_string();
        assert!(serde_json::from_str::<ClientMessage>(&sort_with_comparator).is_err());
        assert_eq!(
            ServerMessage::rejecting_invalid(&sort_with_comparator, "bad".into()),
            Some(ServerMessage::OperationsRejected {
                namespace: "ns".into(),
                name: "list".into(),
                reason: "bad".into(),
            })
        );

        let assignment = r#"{"type":"assignment","namespace":"ns","name":"v"}"#;
        assert!(matches!(
            ServerMessage::rejecting_invalid(assignment, "no revision".into()),
            Some(ServerMessage::AssignmentRejected { .. })
        ));
        let declare = r#"{"type":"declare","namespace":"ns","name":"v","opts":{"persistent":"yes"}}"#;
        assert!(matches!(
            ServerMessage::rejecting_invalid(declare, "bad opts".into()),
            Some(ServerMessage::DeclarationRejected { .. })
        ));

        for text in ["not json", r#"{"type":"subscribe","namespace":"ns","name":"v"}"#, r#"{"type":"operations"}"#] {
            assert_eq!(ServerMessage::rejecting_invalid(text, "bad".into()), None);
        }
    }

    #[test]
    fn declare_from_json() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "declare",
            "namespace": "ns",
            "name": "counter",
            "opts": { "defaultValue": 0, "persistent": false, "persistenceInterval": 50 }
        }))
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Declare {
                namespace: "ns".into(),
                name: "counter".into(),
                opts: DeclareOptions {
                    default_value: Some(json!(0)),
                    persistent: Some(false),
                    persistence_interval: Some(50),
                },
            }
        );

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"declare","namespace":"ns","name":"x"}"#).unwrap();
        assert_eq!(msg.target(), ("ns", "x"));
    }

    #[test]
    fn null_and_undefined_values_differ() {
        let null: ServerMessage = serde_json::from_value(json!({
            "type": "declared", "namespace": "ns", "name": "n", "value": null,
            "revision": 0, "schemaSum": null
        }))
        .unwrap();
        let undefined: ServerMessage = serde_json::from_value(json!({
            "type": "declared", "namespace": "ns", "name": "n", "revision": 0
        }))
        .unwrap();
        assert!(matches!(null, ServerMessage::Declared { value: Some(Value::Null), .. }));
        assert!(matches!(undefined, ServerMessage::Declared { value: None, .. }));
        assert_eq!(
            serde_json::to_value(&undefined).unwrap(),
            json!({ "type": "declared", "namespace": "ns", "name": "n", "revision": 0, "schemaSum": null })
        );
    }

    #[test]
    fn operations_wire_format() {
        let msg = ServerMessage::Operations {
            namespace: "ns".into(),
            name: "list".into(),
            operations: vec![Operation::new(
                "/",
                OpKind::Array(ArrayMutation::Push(vec![json!("arrPushOK")])),
            )],
            revision: 4,
            schema_sum: None,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "operations",
                "namespace": "ns",
                "name": "list",
                "operations": [{ "path": "/", "method": "push", "args": { "mutatorArgs": ["arrPushOK"] } }],
                "revision": 4,
                "schemaSum": null
            })
        );
    }
}
