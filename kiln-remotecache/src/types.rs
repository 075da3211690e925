//! The canonical cache-record wire layout.
//!
//! Every remote cache backend is a codec over this structure. Field names
//! and ordering are part of the format: serializing equal graphs must
//! produce byte-identical JSON.

use chrono::{DateTime, Utc};
use kiln_core::Digest;
use serde::{Deserialize, Serialize};

/// The exported cache graph: a layer array and a record array with stable,
/// 0-based cross-references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(rename = "Layers")]
    pub layers: Vec<CacheLayer>,
    #[serde(rename = "Records")]
    pub records: Vec<CacheRecord>,
}

/// One content-addressed blob in a layer chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLayer {
    #[serde(rename = "Blob")]
    pub blob: Digest,
    /// Index of the parent layer, or -1 for a root layer. Always points to
    /// a lower index.
    #[serde(rename = "ParentIndex")]
    pub parent_index: i64,
}

/// One cache record: a vertex digest plus its normalized input links and
/// observed results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    #[serde(rename = "Digest")]
    pub digest: Digest,
    /// One set of links per input slot, sorted by `LinkIndex`.
    #[serde(rename = "Inputs")]
    pub inputs: Vec<Vec<CacheInput>>,
    #[serde(rename = "Results")]
    pub results: Vec<CacheResult>,
}

/// One normalized link of an input slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInput {
    #[serde(rename = "Selector")]
    pub selector: String,
    /// Index of the parent record in the sibling `Records` array.
    #[serde(rename = "LinkIndex")]
    pub link_index: i64,
}

/// One result of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheResult {
    /// Index of the chain head in the sibling `Layers` array.
    #[serde(rename = "LayerIndex")]
    pub layer_index: i64,
    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
}
