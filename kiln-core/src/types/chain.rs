//! Layer chains and worker results.
//!
//! A layer chain is the ordered list of blob digests forming an image
//! filesystem, ancestor-first. Merge concatenates chains; diff strips a
//! prefix. The core never materializes chain content; blobs stay with the
//! worker.

use crate::digest::Digest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An ordered list of layer blob digests, ancestor-first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerChain {
    pub blobs: Vec<Digest>,
}

impl LayerChain {
    pub fn new(blobs: Vec<Digest>) -> Self {
        Self { blobs }
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Append `other`'s layers after this chain's layers.
    pub fn concat(&self, other: &LayerChain) -> LayerChain {
        let mut blobs = self.blobs.clone();
        blobs.extend(other.blobs.iter().cloned());
        LayerChain { blobs }
    }

    /// True if this chain is a (possibly equal) leading prefix of `other`.
    pub fn is_prefix_of(&self, other: &LayerChain) -> bool {
        if self.blobs.len() > other.blobs.len() {
            return false;
        }
        self.blobs.iter().zip(other.blobs.iter()).all(|(a, b)| a == b)
    }

    /// Layers of `self` that follow the `prefix` chain, or `None` if
    /// `prefix` is not a prefix of `self`. This is a prefix check on the
    /// chain, not a set difference.
    pub fn strip_prefix(&self, prefix: &LayerChain) -> Option<LayerChain> {
        if !prefix.is_prefix_of(self) {
            return None;
        }
        Some(LayerChain { blobs: self.blobs[prefix.blobs.len()..].to_vec() })
    }
}

/// The opaque descriptor set a worker returns for an executed op.
///
/// `id` is the worker's handle identity; equality of content does not imply
/// equality of handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub id: String,
    pub chain: LayerChain,
    pub created_at: DateTime<Utc>,
}

impl WorkerResult {
    pub fn new(id: impl Into<String>, chain: LayerChain) -> Self {
        Self { id: id.into(), chain, created_at: Utc::now() }
    }
}
