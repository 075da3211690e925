//! Export from and import into the cache store.
//!
//! Export walks the store's link graph backwards from a set of root keys,
//! rebuilds the item graph, and hands it to the codec. Import replays a
//! parsed configuration into the store, deriving each record's key through
//! the same structural layout a live solve uses so replayed entries line up
//! with future probes.

use crate::graph::{ItemGraph, ItemId};
use crate::types::CacheConfig;
use crate::{CodecError, Result};
use chrono::Utc;
use kiln_core::cachekey::{compose_key, KeyDomain};
use kiln_core::store::{CacheRecord as StoreRecord, CacheStore, NormalizedLink, StoredResult};
use kiln_core::types::op::{DiffOp, MergeOp, Op};
use kiln_core::Digest;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, info};

struct KeyInfo {
    vertex: Digest,
    result: Option<StoredResult>,
    backlinks: Vec<(NormalizedLink, Digest)>,
}

/// Walks the cache store into the canonical wire layout and back.
pub struct Exporter {
    store: CacheStore,
}

impl Exporter {
    pub fn new(store: CacheStore) -> Self {
        Self { store }
    }

    /// Export the records reachable from `roots` (terminal cache keys).
    pub async fn export(&self, roots: &[Digest]) -> Result<CacheConfig> {
        let mut pending: VecDeque<Digest> = roots.iter().cloned().collect();
        let mut visited: BTreeMap<Digest, KeyInfo> = BTreeMap::new();

        while let Some(key) = pending.pop_front() {
            if visited.contains_key(&key) {
                continue;
            }
            let records =
                self.store.load(&key).await.map_err(|e| CodecError::Store(e.to_string()))?;
            let Some(record) = records.into_iter().next() else {
                debug!(key = %key.short(), "Skipping key without record");
                continue;
            };
            let backlinks = self
                .store
                .walk_backlinks(&key)
                .await
                .map_err(|e| CodecError::Store(e.to_string()))?;
            for (_, parent) in &backlinks {
                if !visited.contains_key(parent) {
                    pending.push_back(parent.clone());
                }
            }
            // The newest result stands for the record on the wire.
            let result = record.results.into_iter().next();
            visited.insert(key, KeyInfo { vertex: record.vertex, result, backlinks });
        }

        let mut graph = ItemGraph::new();
        let mut ids: HashMap<Digest, ItemId> = HashMap::new();
        for (key, info) in &visited {
            let arity = info.backlinks.iter().map(|(link, _)| link.input + 1).max().unwrap_or(0);
            let id = graph.add(info.vertex.clone(), arity);
            if let Some(result) = &info.result {
                graph.set_result(id, result.chain.clone(), result.created_at);
            }
            ids.insert(key.clone(), id);
        }
        for (key, info) in &visited {
            let child = ids[key];
            for (link, parent) in &info.backlinks {
                if let Some(parent_id) = ids.get(parent) {
                    graph.add_link(child, link.input, *parent_id, link.selector.clone());
                }
            }
        }

        info!(keys = visited.len(), "Exporting cache records");
        crate::to_config(&graph)
    }

    /// Replay a configuration into the store. Returns the number of records
    /// imported.
    pub async fn import(&self, config: &CacheConfig) -> Result<usize> {
        let parsed = crate::parse(config)?;
        let normalized = crate::normalize(&parsed)?;
        let graph = normalized.graph;

        let merge_digest = Op::Merge(MergeOp::default()).digest();
        let diff_digest = Op::Diff(DiffOp::default()).digest();
        let mut keys: Vec<Option<Digest>> = vec![None; graph.len()];
        for id in graph.ids() {
            resolve_key(&graph, id, &merge_digest, &diff_digest, &mut keys)?;
        }

        // Records first, then links, so a crash mid-import leaves only
        // orphan links for the next open to prune.
        let mut imported = 0;
        for id in graph.ids() {
            let key = required_key(&keys, id)?;
            let item = graph.get(id);
            let results = match &item.result {
                Some(chain) => vec![StoredResult {
                    result_id: format!("import-{}", key.short()),
                    chain: chain.clone(),
                    created_at: item.result_time,
                }],
                None => Vec::new(),
            };
            let record =
                StoreRecord { vertex: item.digest.clone(), results, created_at: Utc::now() };
            self.store.save(&key, &record).await.map_err(|e| CodecError::Store(e.to_string()))?;
            imported += 1;
        }

        for id in graph.ids() {
            let child_key = required_key(&keys, id)?;
            let item = graph.get(id);
            for (slot, links) in item.links.iter().enumerate() {
                for link in links {
                    let parent_key = required_key(&keys, link.src)?;
                    let nlink = NormalizedLink {
                        vertex: item.digest.clone(),
                        input: slot,
                        selector: link.selector.clone(),
                    };
                    self.store
                        .add_link(&parent_key, &nlink, &child_key)
                        .await
                        .map_err(|e| CodecError::Store(e.to_string()))?;
                }
            }
        }

        info!(imported, "Imported cache records");
        Ok(imported)
    }
}

/// Derive the live cache key of a normalized item, bottom-up.
///
/// When deduplication merged several parents into one slot, the smallest
/// (key, selector) pair stands in for the slot.
fn resolve_key(
    graph: &ItemGraph,
    id: ItemId,
    merge_digest: &Digest,
    diff_digest: &Digest,
    keys: &mut Vec<Option<Digest>>,
) -> Result<Digest> {
    if let Some(key) = &keys[id.index()] {
        return Ok(key.clone());
    }

    let item = graph.get(id);
    let mut inputs = Vec::with_capacity(item.links.len());
    for slot in &item.links {
        let mut candidates = Vec::with_capacity(slot.len());
        for link in slot {
            let key = resolve_key(graph, link.src, merge_digest, diff_digest, keys)?;
            candidates.push((key, link.selector.clone()));
        }
        candidates.sort();
        let (key, selector) = candidates.into_iter().next().ok_or_else(|| {
            CodecError::IncompleteLinks { digest: item.digest.clone() }
        })?;
        inputs.push((key, selector, 0usize));
    }

    let domain = if item.digest == *merge_digest {
        KeyDomain::Merge
    } else if item.digest == *diff_digest {
        KeyDomain::Diff
    } else {
        KeyDomain::Vertex
    };
    let key = compose_key(domain, &item.digest, &inputs);
    keys[id.index()] = Some(key.clone());
    Ok(key)
}

fn required_key(keys: &[Option<Digest>], id: ItemId) -> Result<Digest> {
    keys[id.index()]
        .clone()
        .ok_or_else(|| CodecError::Internal("missing derived key for item".into()))
}
