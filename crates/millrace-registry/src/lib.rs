//! Millrace agent registry - presence table and control-message consumer.
//!
//! This crate provides the inter-agent registry: a daemon that consumes
//! typed control messages from the partitioned log, maintains an in-memory
//! presence table of registered agents, and serves a small read API.
//!
//! # Architecture
//!
//! - **ControlHandler**: applies control messages to the table, reusing the
//!   ingest crate's partition consumer
//! - **AgentRegistry**: last-write-wins presence table with an explicit
//!   wait-for-registration signal
//! - **MessagePublisher**: bounded-queue producer agents publish through
//! - **Routes**: `GET /health`, `GET /agents`, `GET /agents/{id}`,
//!   `GET /status`
//!
//! The daemon consumes from `earliest` with ephemeral checkpoints: the
//! table is rebuilt by replay on every start, so it needs no storage of
//! its own to converge.

mod error;
pub mod handler;
pub mod publisher;
pub mod registry;
mod routes;
mod state;

pub use self::error::ApiError;
pub use self::handler::{ConsumerStatus, ControlHandler};
pub use self::publisher::{BackpressurePolicy, MessagePublisher, PublishError, PublisherConfig};
pub use self::registry::{AgentRecord, AgentRegistry};
pub use self::routes::router;
pub use self::state::{AppState, Config};
