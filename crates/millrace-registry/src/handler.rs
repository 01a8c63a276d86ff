//! Control-message handling.
//!
//! The registry daemon consumes the control topic through the same
//! partition consumer as the telemetry pipeline; [`ControlHandler`] is the
//! per-record stage. Dispatch is over the closed [`MessageKind`] set: a
//! wire `message_type` outside it is logged and dropped, which is the
//! forward-compatibility no-op, not an error.
//!
//! Registry mutations are in-memory and infallible, so this handler never
//! faults a partition; every record is either applied or skipped.

use crate::registry::{AgentRecord, AgentRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use millrace_core::{Envelope, Mailbox, MessageKind, RegisterPayload};
use millrace_ingest::{ProcessFault, ProcessOutcome, RawRecord, RecordHandler};
use serde::Serialize;
use std::sync::Arc;

/// Snapshot of the control consumer's most recent activity, published to
/// the status mailbox after every applied message.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStatus {
    /// Wire type of the last applied message.
    pub last_message_type: String,

    /// Agent that sent it.
    pub last_source_agent_id: String,

    /// Partition and offset it arrived at.
    pub partition: u32,
    pub offset: u64,

    /// When the registry applied it.
    pub applied_at_utc: DateTime<Utc>,
}

/// Applies control messages to the agent registry.
pub struct ControlHandler {
    registry: Arc<AgentRegistry>,
    status: Mailbox<ConsumerStatus>,
}

impl ControlHandler {
    pub fn new(registry: Arc<AgentRegistry>, status: Mailbox<ConsumerStatus>) -> Self {
        Self { registry, status }
    }

    fn apply_register(&self, envelope: &Envelope) -> Result<(), String> {
        let payload: RegisterPayload = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| format!("invalid register payload: {e}"))?;

        self.registry.register_or_update(AgentRecord {
            agent_id: payload.agent_id,
            agent_type: payload.agent_type,
            capabilities: payload.capabilities,
            last_seen_utc: envelope.header.timestamp_utc,
        });
        Ok(())
    }
}

#[async_trait]
impl RecordHandler for ControlHandler {
    fn name(&self) -> &'static str {
        "control"
    }

    async fn handle(&self, record: &RawRecord) -> Result<ProcessOutcome, ProcessFault> {
        let envelope = match Envelope::from_bytes(&record.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    partition = record.partition,
                    offset = record.offset,
                    "skipping malformed control message: {e}"
                );
                return Ok(ProcessOutcome::Skipped {
                    reason: format!("malformed envelope: {e}"),
                });
            }
        };

        let message_type = envelope.header.message_type.clone();
        let Some(kind) = MessageKind::from_type(&message_type) else {
            tracing::info!(
                message_type = %message_type,
                source = %envelope.header.source_agent_id,
                "unhandled message type, dropping"
            );
            counter!("registry_messages_total", "kind" => "unknown").increment(1);
            return Ok(ProcessOutcome::Skipped {
                reason: format!("unhandled message type '{message_type}'"),
            });
        };

        let applied = match kind {
            MessageKind::AgentRegister => self.apply_register(&envelope),
        };

        match applied {
            Ok(()) => {
                counter!("registry_messages_total", "kind" => kind.as_type()).increment(1);
                self.status.publish(ConsumerStatus {
                    last_message_type: message_type,
                    last_source_agent_id: envelope.header.source_agent_id,
                    partition: record.partition,
                    offset: record.offset,
                    applied_at_utc: Utc::now(),
                });
                Ok(ProcessOutcome::Committed)
            }
            Err(reason) => {
                tracing::warn!(
                    partition = record.partition,
                    offset = record.offset,
                    message_type = %kind.as_type(),
                    "skipping invalid control message: {reason}"
                );
                Ok(ProcessOutcome::Skipped { reason })
            }
        }
    }
}
