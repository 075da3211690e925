//! Canonical cache-record layout for the Kiln build cache.
//!
//! Turns the solver's in-memory cache graph, which may transiently contain
//! cycles and duplicate items, into the canonical `{Layers[], Records[]}`
//! form with deterministic ordering and stable indices, and parses that form
//! back. Every remote cache backend is a codec over this layout.

use kiln_core::Digest;
use thiserror::Error;

pub mod export;
pub mod graph;
pub mod marshal;
pub mod normalize;
pub mod types;

pub use export::Exporter;
pub use graph::{Item, ItemGraph, ItemId, Link};
pub use marshal::{marshal, parse};
pub use normalize::{normalize, Normalized};
pub use types::{CacheConfig, CacheInput, CacheLayer, CacheRecord, CacheResult};

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Error type for normalization and (de)serialization.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid {kind} index {index} (array length {len})")]
    InvalidIndex { kind: &'static str, index: i64, len: usize },

    #[error("layer {index} references parent {parent} at or after itself")]
    ForwardParent { index: usize, parent: i64 },

    #[error("invalid incomplete links for record {digest}")]
    IncompleteLinks { digest: Digest },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Normalize and marshal a graph into the canonical wire structure.
pub fn to_config(graph: &ItemGraph) -> Result<CacheConfig> {
    let normalized = normalize(graph)?;
    marshal(&normalized.graph)
}

/// Serialize a graph to canonical JSON bytes.
///
/// Equal graphs serialize to byte-identical output.
pub fn serialize(graph: &ItemGraph) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&to_config(graph)?)?)
}

/// Parse canonical JSON bytes back into an item graph.
pub fn deserialize(bytes: &[u8]) -> Result<ItemGraph> {
    let config: CacheConfig = serde_json::from_slice(bytes)?;
    parse(&config)
}
