//! Inter-agent control message envelope.
//!
//! Wire format is JSON: a `header` with routing metadata and a
//! `payload` whose shape depends on `message_type`. Agents that publish
//! control messages and the registry that consumes them share these types.

use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Envelope header carried by every control message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    /// Unique id of this message.
    pub message_id: Uuid,

    /// Discriminator for the payload shape, e.g. "agent.register".
    pub message_type: String,

    /// Id of the sending agent.
    pub source_agent_id: String,

    /// Target agent, if the message is addressed rather than broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_agent_id: Option<String>,

    /// Correlates a response with its request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// When the message was produced.
    pub timestamp_utc: DateTime<Utc>,
}

/// A complete control message: header plus type-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub payload: Value,
}

impl Envelope {
    /// Build a new envelope with a fresh message id and the current time.
    pub fn new(
        message_type: impl Into<String>,
        source_agent_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            header: Header {
                message_id: Uuid::new_v4(),
                message_type: message_type.into(),
                source_agent_id: source_agent_id.into(),
                destination_agent_id: None,
                correlation_id: None,
                timestamp_utc: Utc::now(),
            },
            payload,
        }
    }

    /// Parse and validate an envelope from raw payload bytes.
    ///
    /// Serde enforces the required header fields; beyond that, an empty
    /// `message_type` or `source_agent_id` is unusable (dispatch and
    /// partition routing both key on them) and is rejected here.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        if envelope.header.message_type.is_empty() {
            return Err(Error::InvalidField {
                field: "message_type",
                reason: "must not be empty".to_string(),
            });
        }
        if envelope.header.source_agent_id.is_empty() {
            return Err(Error::InvalidField {
                field: "source_agent_id",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(envelope)
    }

    /// Serialize the envelope to wire bytes.
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// The closed set of control message kinds this system handles.
///
/// Wire `message_type` strings outside this set are a forward-compatibility
/// no-op: logged and dropped, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// An agent announcing itself and its capabilities.
    AgentRegister,
}

impl MessageKind {
    /// Resolve a wire `message_type` string, `None` for unknown kinds.
    pub fn from_type(message_type: &str) -> Option<Self> {
        match message_type {
            "agent.register" => Some(MessageKind::AgentRegister),
            _ => None,
        }
    }

    /// The wire `message_type` string for this kind.
    pub fn as_type(self) -> &'static str {
        match self {
            MessageKind::AgentRegister => "agent.register",
        }
    }
}

/// Payload of an `agent.register` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
}
