//! The two-level cache-key engine.
//!
//! Fast (structural) keys are computed recursively from the op digest, each
//! input's fast key and selector, and the output index; nothing is executed
//! and no wall-clock state leaks in. Slow (content) keys are computed after
//! the inputs are materialized, from the content digests of the selected
//! input subtrees; they let two structurally different vertices share a
//! result when their consumed content is equal.
//!
//! The engine itself is a pure function. The only state it carries is a
//! process-wide memo of content digests, sharded to keep lock contention per
//! key rather than per map.

use crate::digest::Digest;
use crate::error::{KilnError, Result};
use crate::types::{Op, Vertex};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

/// Field separator inside key preimages.
const SEP: &[u8] = b"\x1f";
/// Record separator between inputs.
const END: &[u8] = b"\x00";

/// Number of shards in the content-digest memo.
const MEMO_SHARDS: usize = 16;

/// Content digest of one selected input subtree, as reported by the worker
/// after materialization.
#[derive(Debug, Clone)]
pub struct SlowKeyPart {
    pub input: usize,
    pub selector: String,
    pub content: Digest,
}

/// Computes fast and slow cache keys.
pub struct CacheKeyEngine {
    // Memoized Worker::content_digest answers, keyed by (result id, selector).
    // `None` records a "slow key unavailable" answer so it is not retried.
    content_memo: Vec<Mutex<HashMap<(String, String), Option<Digest>>>>,
}

impl CacheKeyEngine {
    pub fn new() -> Self {
        Self { content_memo: (0..MEMO_SHARDS).map(|_| Mutex::new(HashMap::new())).collect() }
    }

    /// Compute the fast key of every vertex in the graph.
    ///
    /// Returns `InvalidGraph` for out-of-range input references and empty
    /// required slots, and `CycleDetected` if recursion revisits a vertex
    /// currently being keyed.
    pub fn fast_keys(&self, vertices: &[Vertex]) -> Result<Vec<Digest>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Gray,
            Black,
        }

        fn visit(
            index: usize,
            vertices: &[Vertex],
            marks: &mut [Mark],
            keys: &mut [Option<Digest>],
        ) -> Result<Digest> {
            match marks[index] {
                Mark::Black => {
                    return keys[index]
                        .clone()
                        .ok_or_else(|| KilnError::Internal("missing memoized fast key".into()));
                }
                Mark::Gray => {
                    return Err(KilnError::CycleDetected {
                        digest: vertices[index].digest.clone(),
                    });
                }
                Mark::White => {}
            }
            marks[index] = Mark::Gray;

            let vertex = &vertices[index];
            if let Some(required) = vertex.op.required_arity() {
                if vertex.inputs.len() != required {
                    return Err(KilnError::EmptyInputSlot {
                        digest: vertex.digest.clone(),
                        input: vertex.inputs.len(),
                    });
                }
            }
            if matches!(vertex.op, Op::Merge(_)) && vertex.inputs.is_empty() {
                return Err(KilnError::EmptyInputSlot { digest: vertex.digest.clone(), input: 0 });
            }

            let mut input_keys = Vec::with_capacity(vertex.inputs.len());
            for input in &vertex.inputs {
                if input.vertex >= vertices.len() {
                    return Err(KilnError::InvalidGraph {
                        reason: format!(
                            "input reference {} out of range for op {}",
                            input.vertex, vertex.digest
                        ),
                    });
                }
                input_keys.push(visit(input.vertex, vertices, marks, keys)?);
            }

            let key = fast_key_from_parts(vertex, &input_keys);
            marks[index] = Mark::Black;
            keys[index] = Some(key.clone());
            Ok(key)
        }

        let mut marks = vec![Mark::White; vertices.len()];
        let mut keys = vec![None; vertices.len()];
        for index in 0..vertices.len() {
            visit(index, vertices, &mut marks, &mut keys)?;
        }
        Ok(keys.into_iter().map(|k| k.unwrap_or_else(|| Digest::from_bytes(b""))).collect())
    }

    /// Slow key over the materialized content of the selected inputs.
    ///
    /// The op digest is deliberately absent: two vertices with different ops
    /// but equal consumed content produce colliding slow keys, which is what
    /// allows a content-level cache hit after a structural miss.
    pub fn slow_key(&self, parts: &[SlowKeyPart]) -> Digest {
        let mut buf: Vec<u8> = b"slow".to_vec();
        buf.extend_from_slice(END);
        for part in parts {
            buf.extend_from_slice(part.input.to_string().as_bytes());
            buf.extend_from_slice(SEP);
            buf.extend_from_slice(part.selector.as_bytes());
            buf.extend_from_slice(SEP);
            buf.extend_from_slice(part.content.as_ref());
            buf.extend_from_slice(END);
        }
        Digest::from_bytes(buf)
    }

    /// Memoized content-digest lookup. `Some(None)` means the worker already
    /// answered "unavailable" for this (result, selector) pair.
    pub fn cached_content(&self, result_id: &str, selector: &str) -> Option<Option<Digest>> {
        let shard = self.shard(result_id, selector);
        let memo = self.content_memo[shard].lock().unwrap_or_else(|e| e.into_inner());
        memo.get(&(result_id.to_string(), selector.to_string())).cloned()
    }

    /// Record a content-digest answer.
    pub fn record_content(&self, result_id: &str, selector: &str, content: Option<Digest>) {
        let shard = self.shard(result_id, selector);
        let mut memo = self.content_memo[shard].lock().unwrap_or_else(|e| e.into_inner());
        memo.insert((result_id.to_string(), selector.to_string()), content);
    }

    fn shard(&self, result_id: &str, selector: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        result_id.hash(&mut hasher);
        selector.hash(&mut hasher);
        (hasher.finish() as usize) % MEMO_SHARDS
    }
}

impl Default for CacheKeyEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// The stable identifier of one output of a keyed vertex.
pub fn output_key(digest: &Digest, index: usize) -> Digest {
    Digest::from_bytes(format!("{}@{}", digest, index))
}

/// Domains of the structural key layout.
///
/// Merge and diff keys are derived purely from their input keys in input
/// order; everything else mixes in the op digest and per-input selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDomain {
    Vertex,
    Merge,
    Diff,
}

impl KeyDomain {
    pub fn for_op(op: &Op) -> Self {
        match op {
            Op::Merge(_) => KeyDomain::Merge,
            Op::Diff(_) => KeyDomain::Diff,
            _ => KeyDomain::Vertex,
        }
    }
}

/// Compose a structural key from precomputed parts.
///
/// This is the one place the key layout is defined; cache import replays
/// wire records through the same function so replayed keys line up with the
/// keys a live solve would compute.
pub fn compose_key(
    domain: KeyDomain,
    op_digest: &Digest,
    inputs: &[(Digest, String, usize)],
) -> Digest {
    let mut buf: Vec<u8> = Vec::new();
    match domain {
        KeyDomain::Merge | KeyDomain::Diff => {
            let tag: &[u8] = if domain == KeyDomain::Merge { b"merge" } else { b"diff" };
            buf.extend_from_slice(tag);
            buf.extend_from_slice(END);
            for (key, _, _) in inputs {
                buf.extend_from_slice(key.as_ref());
                buf.extend_from_slice(END);
            }
        }
        KeyDomain::Vertex => {
            buf.extend_from_slice(b"vertex");
            buf.extend_from_slice(END);
            buf.extend_from_slice(op_digest.as_ref());
            buf.extend_from_slice(END);
            for (key, selector, output) in inputs {
                buf.extend_from_slice(key.as_ref());
                buf.extend_from_slice(SEP);
                buf.extend_from_slice(selector.as_bytes());
                buf.extend_from_slice(SEP);
                buf.extend_from_slice(output.to_string().as_bytes());
                buf.extend_from_slice(END);
            }
        }
    }
    Digest::from_bytes(buf)
}

fn fast_key_from_parts(vertex: &Vertex, input_keys: &[Digest]) -> Digest {
    let inputs: Vec<(Digest, String, usize)> = vertex
        .inputs
        .iter()
        .zip(input_keys)
        .map(|(input, key)| (key.clone(), input.selector.clone(), input.output))
        .collect();
    compose_key(KeyDomain::for_op(&vertex.op), &vertex.digest, &inputs)
}
