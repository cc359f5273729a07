//! Protocol messages.
//!
//! Every frame is a JSON object tagged by its `"action"` field. Field names
//! use kebab-case on the wire (`version-new`, `version-known`, ...).

use crate::error::{ProtocolError, ProtocolResult};
use crate::version::{MasterVersion, SlaveVersion};
use json_patch::Patch;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Payload of an update: either a full snapshot or a diff.
///
/// On the wire this is exactly one of a `value` or a `patch` field. A `value`
/// of `null` or `false` is present and means "the producer has no value".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBody", into = "RawBody")]
pub enum ObjectBody {
    /// Full replacement value.
    Value(Value),
    /// RFC 6902 operations relative to the previous version.
    Patch(Patch),
}

impl ObjectBody {
    /// Returns true if this body carries a full value.
    pub fn is_value(&self) -> bool {
        matches!(self, ObjectBody::Value(_))
    }
}

#[derive(Serialize, Deserialize)]
struct RawBody {
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    patch: Option<Patch>,
}

/// Keeps an explicit `null` distinct from a missing field.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawBody> for ObjectBody {
    type Error = String;

    fn try_from(raw: RawBody) -> Result<Self, Self::Error> {
        match (raw.value, raw.patch) {
            (Some(value), None) => Ok(ObjectBody::Value(value)),
            (None, Some(patch)) => Ok(ObjectBody::Patch(patch)),
            (Some(_), Some(_)) => Err("both value and patch present".into()),
            (None, None) => Err("one of value or patch is required".into()),
        }
    }
}

impl From<ObjectBody> for RawBody {
    fn from(body: ObjectBody) -> Self {
        match body {
            ObjectBody::Value(value) => RawBody {
                value: Some(value),
                patch: None,
            },
            ObjectBody::Patch(patch) => RawBody {
                value: None,
                patch: Some(patch),
            },
        }
    }
}

/// An `object-update` pushed by the coordinator to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ObjectUpdate {
    /// Concrete object id.
    pub id: String,
    /// Version after applying this update.
    pub version_new: SlaveVersion,
    /// Version the patch applies to. Absent or zero means a full replacement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_old: Option<SlaveVersion>,
    /// Snapshot or diff.
    #[serde(flatten)]
    pub body: ObjectBody,
}

impl ObjectUpdate {
    /// Creates a full-value update.
    pub fn value(id: impl Into<String>, version_new: SlaveVersion, value: Value) -> Self {
        Self {
            id: id.into(),
            version_new,
            version_old: None,
            body: ObjectBody::Value(value),
        }
    }

    /// Creates an incremental update.
    pub fn patch(
        id: impl Into<String>,
        version_old: SlaveVersion,
        version_new: SlaveVersion,
        patch: Patch,
    ) -> Self {
        Self {
            id: id.into(),
            version_new,
            version_old: Some(version_old),
            body: ObjectBody::Patch(patch),
        }
    }

    /// Returns true if the update replaces content wholesale instead of
    /// building on the receiver's current version.
    pub fn is_replacement(&self) -> bool {
        self.body.is_value() || matches!(self.version_old, None | Some(0))
    }
}

/// An `object-patch` uploaded by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ObjectPatch {
    /// Concrete object id.
    pub id: String,
    /// Version being published.
    pub version_new: MasterVersion,
    /// Version the patch is relative to; only set alongside a patch body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_old: Option<MasterVersion>,
    /// Snapshot or diff.
    #[serde(flatten)]
    pub body: ObjectBody,
}

/// A message sent from the client to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Announces client options right after connecting.
    ClientOptionsSet {
        /// Free-form options.
        options: Map<String, Value>,
    },
    /// Subscribes to a pattern as a consumer.
    ObjectConsumerRegister {
        /// Subscription pattern.
        pattern: String,
        /// Version the client already holds.
        #[serde(rename = "version-known")]
        version_known: SlaveVersion,
    },
    /// Drops a consumer subscription.
    ObjectConsumerUnregister {
        /// Subscription pattern.
        pattern: String,
    },
    /// Offers a pattern as a producer.
    ObjectProducerRegister {
        /// Production pattern.
        pattern: String,
        /// Version the client currently publishes.
        #[serde(rename = "version-known")]
        version_known: MasterVersion,
    },
    /// Withdraws a producer registration.
    ObjectProducerUnregister {
        /// Production pattern.
        pattern: String,
    },
    /// Publishes a new version of a produced object.
    ObjectPatch(ObjectPatch),
}

impl ClientMessage {
    /// Encodes to a JSON text frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes from a JSON text frame.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        serde_json::from_str(text).map_err(|e| ProtocolError::malformed(e.to_string()))
    }

    /// Returns the wire action name.
    pub fn action(&self) -> &'static str {
        match self {
            ClientMessage::ClientOptionsSet { .. } => "client-options-set",
            ClientMessage::ObjectConsumerRegister { .. } => "object-consumer-register",
            ClientMessage::ObjectConsumerUnregister { .. } => "object-consumer-unregister",
            ClientMessage::ObjectProducerRegister { .. } => "object-producer-register",
            ClientMessage::ObjectProducerUnregister { .. } => "object-producer-unregister",
            ClientMessage::ObjectPatch(_) => "object-patch",
        }
    }
}

/// A message sent from the coordinator to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// New version of a consumed object.
    ObjectUpdate(ObjectUpdate),
    /// A consumed or produced object no longer exists.
    ObjectDestroy {
        /// Concrete object id.
        id: String,
    },
    /// Request to (re)supply a produced object's value.
    ObjectProduce {
        /// Concrete object id.
        id: String,
        /// Version the coordinator expects, if it has an opinion.
        #[serde(
            rename = "version-inferred",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        version_inferred: Option<MasterVersion>,
    },
}

impl ServerMessage {
    const ACTIONS: [&'static str; 3] = ["object-update", "object-destroy", "object-produce"];

    /// Decodes a JSON text frame.
    ///
    /// Unknown actions are reported as [`ProtocolError::UnsupportedAction`] so
    /// callers can tell a contract breach from a garbled frame.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::malformed(e.to_string()))?;
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::malformed("missing action"))?;
        if !Self::ACTIONS.contains(&action) {
            return Err(ProtocolError::UnsupportedAction(action.to_owned()));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::malformed(e.to_string()))
    }

    /// Encodes to a JSON text frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Returns the concrete object id the message refers to.
    pub fn id(&self) -> &str {
        match self {
            ServerMessage::ObjectUpdate(update) => &update.id,
            ServerMessage::ObjectDestroy { id } | ServerMessage::ObjectProduce { id, .. } => id,
        }
    }
}
