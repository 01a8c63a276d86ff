//! Telemetry record decoding and validation.
//!
//! A telemetry payload is a flat JSON object carrying a mandatory `id`
//! (the idempotency key) and a mandatory partition-key field named by the
//! stream's descriptor. All other fields are opaque domain attributes that
//! are persisted verbatim.
//!
//! Decoding failures are split into two kinds:
//! - a [`Rejection`] is deterministic and permanent (malformed bytes, a
//!   missing partition key); the record is skipped and never retried
//! - everything downstream of a successful decode is the sink's problem
//!
//! # Missing ids
//!
//! Older stream revisions emit records without an `id` field. The
//! [`MissingIdPolicy`] decides what happens: `Synthesize` (the default)
//! derives a deterministic id from the payload bytes so redelivery of the
//! same record maps to the same document; `Reject` drops the record.

use crate::stream::StreamDescriptor;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A decoded, validated telemetry record ready for the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    /// Stable idempotency key. Redelivery of the same logical event carries
    /// the same `record_id`.
    pub record_id: String,

    /// All payload fields, including `id` and the partition-key field.
    pub attributes: Map<String, Value>,

    /// Partition the record arrived on.
    pub partition: u32,

    /// Offset of the record within its partition.
    pub offset: u64,
}

/// Permanent, non-retryable decode failure. The record is skipped and the
/// partition continues.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("rejected: {reason}")]
pub struct Rejection {
    /// Why the record was rejected.
    pub reason: String,
}

impl Rejection {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// What to do with a payload that has no `id` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingIdPolicy {
    /// Derive a deterministic id from the payload bytes (SHA-256, lowercase
    /// hex). Redelivery of identical bytes produces the same id.
    #[default]
    Synthesize,

    /// Reject the record.
    Reject,
}

/// Decoder for one telemetry stream.
#[derive(Debug, Clone)]
pub struct TelemetryDecoder {
    partition_key_field: &'static str,
    missing_id: MissingIdPolicy,
}

impl TelemetryDecoder {
    /// Create a decoder for the given stream descriptor.
    pub fn new(descriptor: &StreamDescriptor, missing_id: MissingIdPolicy) -> Self {
        Self {
            partition_key_field: descriptor.partition_key_field(),
            missing_id,
        }
    }

    /// Decode and validate a raw payload.
    ///
    /// Returns the decoded event, or a [`Rejection`] describing why the
    /// record is permanently skipped.
    pub fn decode(
        &self,
        payload: &[u8],
        partition: u32,
        offset: u64,
    ) -> Result<DecodedEvent, Rejection> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| Rejection::new(format!("malformed JSON: {e}")))?;

        let Value::Object(mut attributes) = value else {
            return Err(Rejection::new("payload is not a JSON object"));
        };

        if !attributes.contains_key(self.partition_key_field) {
            return Err(Rejection::new(format!(
                "missing partition key field '{}'",
                self.partition_key_field
            )));
        }

        let record_id = match attributes.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::String(_)) => return Err(Rejection::new("empty 'id' field")),
            Some(_) => return Err(Rejection::new("'id' field must be a string")),
            None => match self.missing_id {
                MissingIdPolicy::Synthesize => {
                    let id = synthesize_id(payload);
                    attributes.insert("id".to_string(), Value::String(id.clone()));
                    id
                }
                MissingIdPolicy::Reject => {
                    return Err(Rejection::new("missing 'id' field"));
                }
            },
        };

        Ok(DecodedEvent {
            record_id,
            attributes,
            partition,
            offset,
        })
    }
}

/// Deterministic record id for payloads without one: lowercase hex SHA-256
/// over the raw payload bytes.
pub fn synthesize_id(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamType;

    fn scada_decoder(policy: MissingIdPolicy) -> TelemetryDecoder {
        TelemetryDecoder::new(&StreamType::Scada.descriptor(), policy)
    }

    #[test]
    fn test_decode_valid_record() {
        let decoder = scada_decoder(MissingIdPolicy::default());
        let payload = br#"{"id":"e1","MachineID":"M1","temperature":42.0}"#;

        let event = decoder.decode(payload, 0, 7).unwrap();
        assert_eq!(event.record_id, "e1");
        assert_eq!(event.partition, 0);
        assert_eq!(event.offset, 7);
        assert_eq!(event.attributes["MachineID"], "M1");
        assert_eq!(event.attributes["temperature"], 42.0);
    }

    #[test]
    fn test_decode_rejects_malformed_json() {
        let decoder = scada_decoder(MissingIdPolicy::default());
        let err = decoder.decode(b"not json at all", 0, 0).unwrap_err();
        assert!(err.reason.contains("malformed JSON"));
    }

    #[test]
    fn test_decode_rejects_non_object() {
        let decoder = scada_decoder(MissingIdPolicy::default());
        let err = decoder.decode(b"[1,2,3]", 0, 0).unwrap_err();
        assert!(err.reason.contains("not a JSON object"));
    }

    #[test]
    fn test_decode_rejects_missing_partition_key() {
        let decoder = scada_decoder(MissingIdPolicy::default());
        let err = decoder
            .decode(br#"{"id":"e1","temperature":42.0}"#, 0, 0)
            .unwrap_err();
        assert!(err.reason.contains("MachineID"));
    }

    #[test]
    fn test_decode_rejects_non_string_id() {
        let decoder = scada_decoder(MissingIdPolicy::default());
        let err = decoder
            .decode(br#"{"id":42,"MachineID":"M1"}"#, 0, 0)
            .unwrap_err();
        assert!(err.reason.contains("must be a string"));
    }

    #[test]
    fn test_missing_id_synthesized_deterministically() {
        let decoder = scada_decoder(MissingIdPolicy::Synthesize);
        let payload = br#"{"MachineID":"M1","temperature":42.0}"#;

        let first = decoder.decode(payload, 0, 0).unwrap();
        let second = decoder.decode(payload, 1, 9).unwrap();

        // Same bytes, same id, regardless of where the record arrived.
        assert_eq!(first.record_id, second.record_id);
        assert_eq!(first.record_id.len(), 64);
        assert_eq!(
            first.attributes["id"],
            Value::String(first.record_id.clone())
        );

        // Different bytes, different id.
        let other = decoder
            .decode(br#"{"MachineID":"M2","temperature":42.0}"#, 0, 0)
            .unwrap();
        assert_ne!(other.record_id, first.record_id);
    }

    #[test]
    fn test_missing_id_rejected_under_reject_policy() {
        let decoder = scada_decoder(MissingIdPolicy::Reject);
        let err = decoder
            .decode(br#"{"MachineID":"M1","temperature":42.0}"#, 0, 0)
            .unwrap_err();
        assert!(err.reason.contains("missing 'id'"));
    }
}
