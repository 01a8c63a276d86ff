//! Core types, decoding, and shared utilities for the Millrace pipeline.
//!
//! This crate provides:
//! - Stream descriptors for the supported telemetry streams
//! - Telemetry record decoding and validation (with id synthesis)
//! - The inter-agent control message envelope
//! - A single-slot latest-value mailbox
//! - Prometheus metrics helpers
//! - Shared error types

mod envelope;
mod error;
pub mod mailbox;
pub mod metrics;
mod stream;
mod telemetry;

pub use envelope::{Envelope, Header, MessageKind, RegisterPayload};
pub use error::{Error, Result};
pub use mailbox::Mailbox;
pub use stream::{CompositeIndex, IndexOrder, IndexPath, StreamDescriptor, StreamType};
pub use telemetry::{DecodedEvent, MissingIdPolicy, Rejection, TelemetryDecoder, synthesize_id};
