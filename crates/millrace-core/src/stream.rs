//! Stream descriptors for the supported telemetry streams.
//!
//! Each stream type maps to a static [`StreamDescriptor`]: the transport
//! topic it is consumed from, the store collection it lands in, the
//! partition key path the collection is created with, and the composite
//! indexes the collection must carry before consumption starts.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sort order of a single path within a composite index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexOrder {
    Ascending,
    Descending,
}

/// One path within a composite index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPath {
    /// Document path, e.g. `/MachineID` or `/_ts`.
    pub path: String,

    /// Sort order for this path.
    pub order: IndexOrder,
}

/// An ordered composite index over two or more document paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeIndex {
    /// The ordered paths making up the index.
    pub paths: Vec<IndexPath>,
}

impl CompositeIndex {
    /// Build a composite index from `(path, order)` pairs.
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = (S, IndexOrder)>,
        S: Into<String>,
    {
        Self {
            paths: paths
                .into_iter()
                .map(|(path, order)| IndexPath {
                    path: path.into(),
                    order,
                })
                .collect(),
        }
    }
}

/// Static configuration for one telemetry stream.
///
/// Immutable; built once at startup from the [`StreamType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Stable identifier for logs and metrics (e.g. "scada").
    pub stream_id: &'static str,

    /// Transport topic the stream is consumed from.
    pub topic: &'static str,

    /// Store collection records are upserted into.
    pub collection: &'static str,

    /// Partition key path the collection is created with (e.g. "/MachineID").
    pub partition_key_path: &'static str,

    /// Composite indexes the collection must carry.
    pub required_composite_indexes: Vec<CompositeIndex>,
}

impl StreamDescriptor {
    /// The partition key path without its leading slash, as it appears as a
    /// field name in record payloads.
    pub fn partition_key_field(&self) -> &'static str {
        self.partition_key_path.trim_start_matches('/')
    }
}

/// The supported telemetry stream types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Scada,
    Plc,
    Gps,
}

impl StreamType {
    /// All supported stream types, in a stable order.
    pub fn all() -> [StreamType; 3] {
        [StreamType::Scada, StreamType::Plc, StreamType::Gps]
    }

    /// The descriptor for this stream type.
    pub fn descriptor(self) -> StreamDescriptor {
        match self {
            StreamType::Scada => StreamDescriptor {
                stream_id: "scada",
                topic: "scada-events",
                collection: "scada_events",
                partition_key_path: "/MachineID",
                required_composite_indexes: vec![CompositeIndex::new([
                    ("/MachineID", IndexOrder::Ascending),
                    ("/_ts", IndexOrder::Descending),
                ])],
            },
            StreamType::Plc => StreamDescriptor {
                stream_id: "plc",
                topic: "plc-events",
                collection: "plc_events",
                partition_key_path: "/plcId",
                required_composite_indexes: vec![CompositeIndex::new([
                    ("/plcId", IndexOrder::Ascending),
                    ("/_ts", IndexOrder::Descending),
                ])],
            },
            StreamType::Gps => StreamDescriptor {
                stream_id: "gps",
                topic: "gps-events",
                collection: "gps_events",
                partition_key_path: "/deviceId",
                required_composite_indexes: vec![CompositeIndex::new([
                    ("/deviceId", IndexOrder::Ascending),
                    ("/_ts", IndexOrder::Descending),
                ])],
            },
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptor().stream_id)
    }
}

impl FromStr for StreamType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scada" => Ok(StreamType::Scada),
            "plc" => Ok(StreamType::Plc),
            "gps" => Ok(StreamType::Gps),
            other => Err(Error::UnknownStreamType(other.to_string())),
        }
    }
}
