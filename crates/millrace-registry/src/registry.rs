//! Agent presence table.
//!
//! A TTL-less key/value table of known agents. Every registration message
//! upserts the whole record: the latest registration fully replaces the
//! previous capability set and timestamp (last-write-wins, no merging).
//!
//! Reads scan all entries, which is O(agent count) and fine at the scale
//! this system runs at (single digits to low hundreds of agents).

use chrono::{DateTime, Utc};
use metrics::gauge;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;

/// One registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Registry key.
    pub agent_id: String,

    /// Free-form agent classification, e.g. "data-query".
    pub agent_type: String,

    /// What the agent can do. Replaced wholesale on re-registration.
    pub capabilities: Vec<String>,

    /// When the agent last registered.
    pub last_seen_utc: DateTime<Utc>,
}

/// In-memory agent presence table.
///
/// The consuming daemon replays the control topic from earliest on every
/// start, so the table converges without durable storage of its own.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentRecord>>,
    updated: Notify,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert an agent record, replacing any previous registration.
    pub fn register_or_update(&self, record: AgentRecord) {
        let mut agents = self.agents.write();
        let replaced = agents.insert(record.agent_id.clone(), record).is_some();
        gauge!("registry_agents").set(agents.len() as f64);
        drop(agents);

        tracing::info!(replaced, "agent registered");
        self.updated.notify_waiters();
    }

    /// Fetch one agent by id.
    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.read().get(agent_id).cloned()
    }

    /// All known agents, ordered by id for stable output.
    pub fn list(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self.agents.read().values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Wait up to `timeout` for an agent to appear.
    ///
    /// An explicit completion signal in place of polling with a fixed
    /// sleep: returns as soon as the agent registers, or `None` once the
    /// deadline passes with the agent still unknown.
    pub async fn wait_for(&self, agent_id: &str, timeout: Duration) -> Option<AgentRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest first so a registration between the check
            // and the await is not missed.
            let updated = self.updated.notified();
            if let Some(record) = self.get(agent_id) {
                return Some(record);
            }
            if tokio::time::timeout_at(deadline, updated).await.is_err() {
                return self.get(agent_id);
            }
        }
    }
}
