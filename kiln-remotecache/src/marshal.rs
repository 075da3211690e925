//! Marshalling between item graphs and the canonical wire structure.
//!
//! Layer chains are emitted with structural sharing (a shared prefix is one
//! set of layers), records are emitted in a post-order walk, and the whole
//! structure is then sorted into the canonical total order with every index
//! rewritten. An index that does not resolve is a serialization bug and
//! fails closed.

use crate::graph::{ItemGraph, ItemId};
use crate::types::{CacheConfig, CacheInput, CacheLayer, CacheRecord, CacheResult};
use crate::{CodecError, Result};
use kiln_core::LayerChain;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct MarshalState {
    layers: Vec<CacheLayer>,
    chains_by_id: HashMap<String, usize>,
    records: Vec<CacheRecord>,
    records_by_item: HashMap<ItemId, Option<usize>>,
    in_progress: HashSet<ItemId>,
}

/// Marshal a loop-free graph into the sorted canonical structure.
///
/// Items with an empty input slot (possible after loop removal) are skipped
/// together with everything that only links through them; an empty slot
/// would be an invalid record on the wire.
pub fn marshal(graph: &ItemGraph) -> Result<CacheConfig> {
    let mut state = MarshalState::default();
    for id in graph.ids() {
        marshal_item(graph, id, &mut state)?;
    }

    let mut config = CacheConfig { layers: state.layers, records: state.records };
    sort_config(&mut config)?;
    Ok(config)
}

fn marshal_item(graph: &ItemGraph, id: ItemId, state: &mut MarshalState) -> Result<Option<usize>> {
    if let Some(&existing) = state.records_by_item.get(&id) {
        return Ok(existing);
    }
    if !state.in_progress.insert(id) {
        return Err(CodecError::Internal(format!(
            "cycle reached marshalling, graph was not normalized: {}",
            graph.get(id).digest
        )));
    }

    let item = graph.get(id);
    let mut inputs = Vec::with_capacity(item.links.len());
    let mut complete = true;
    for slot in &item.links {
        let mut wire_slot = Vec::new();
        for link in slot {
            if let Some(index) = marshal_item(graph, link.src, state)? {
                wire_slot
                    .push(CacheInput { selector: link.selector.clone(), link_index: index as i64 });
            }
        }
        if wire_slot.is_empty() {
            complete = false;
            break;
        }
        inputs.push(wire_slot);
    }
    state.in_progress.remove(&id);

    if !complete {
        state.records_by_item.insert(id, None);
        return Ok(None);
    }

    let mut results = Vec::new();
    if let Some(chain) = &item.result {
        if !chain.is_empty() {
            let layer_index = marshal_chain(chain, state);
            results.push(CacheResult { layer_index: layer_index as i64, created_at: item.result_time });
        }
    }

    let index = state.records.len();
    state.records.push(CacheRecord { digest: item.digest.clone(), inputs, results });
    state.records_by_item.insert(id, Some(index));
    Ok(Some(index))
}

/// Emit the layers of a chain, sharing any prefix already emitted. Returns
/// the index of the chain's head layer.
fn marshal_chain(chain: &LayerChain, state: &mut MarshalState) -> usize {
    let mut parent: i64 = -1;
    let mut chain_id = String::new();
    let mut index = 0;
    for blob in &chain.blobs {
        chain_id.push_str(blob.as_str());
        if let Some(&existing) = state.chains_by_id.get(&chain_id) {
            index = existing;
            parent = existing as i64;
            continue;
        }
        index = state.layers.len();
        state.layers.push(CacheLayer { blob: blob.clone(), parent_index: parent });
        state.chains_by_id.insert(chain_id.clone(), index);
        parent = index as i64;
    }
    index
}

/// Sort layers and records into the canonical total order and rewrite every
/// cross-reference to the new positions.
///
/// Layers sort by chain depth first so a parent always lands on a lower
/// index than its children, then by blob digest and parent index. Records
/// sort by vertex digest, input arity, then each slot's (selector, parent
/// digest) pairs; each slot is finally ordered by `LinkIndex`.
pub(crate) fn sort_config(config: &mut CacheConfig) -> Result<()> {
    let layer_count = config.layers.len();
    let record_count = config.records.len();

    // Validate before sorting; a dangling index must never survive into the
    // output.
    for (index, layer) in config.layers.iter().enumerate() {
        match layer.parent_index {
            -1 => {}
            p if p >= 0 && (p as usize) < index => {}
            p => return Err(CodecError::ForwardParent { index, parent: p }),
        }
    }
    for record in &config.records {
        for slot in &record.inputs {
            for input in slot {
                if input.link_index < 0 || input.link_index as usize >= record_count {
                    return Err(CodecError::InvalidIndex {
                        kind: "link",
                        index: input.link_index,
                        len: record_count,
                    });
                }
            }
        }
        for result in &record.results {
            if result.layer_index < 0 || result.layer_index as usize >= layer_count {
                return Err(CodecError::InvalidIndex {
                    kind: "layer",
                    index: result.layer_index,
                    len: layer_count,
                });
            }
        }
    }

    let mut depth = vec![0usize; layer_count];
    for index in 0..layer_count {
        let parent = config.layers[index].parent_index;
        if parent >= 0 {
            depth[index] = depth[parent as usize] + 1;
        }
    }

    let mut layer_order: Vec<usize> = (0..layer_count).collect();
    layer_order.sort_by(|&a, &b| {
        depth[a]
            .cmp(&depth[b])
            .then_with(|| config.layers[a].blob.cmp(&config.layers[b].blob))
            .then_with(|| config.layers[a].parent_index.cmp(&config.layers[b].parent_index))
    });
    let mut layer_new = vec![0usize; layer_count];
    for (new, &old) in layer_order.iter().enumerate() {
        layer_new[old] = new;
    }

    let layers: Vec<CacheLayer> = layer_order
        .iter()
        .map(|&old| {
            let mut layer = config.layers[old].clone();
            if layer.parent_index != -1 {
                layer.parent_index = layer_new[layer.parent_index as usize] as i64;
            }
            layer
        })
        .collect();

    let originals = config.records.clone();
    let mut record_order: Vec<usize> = (0..record_count).collect();
    record_order.sort_by(|&a, &b| compare_records(&originals, a, b));
    let mut record_new = vec![0usize; record_count];
    for (new, &old) in record_order.iter().enumerate() {
        record_new[old] = new;
    }

    let records: Vec<CacheRecord> = record_order
        .iter()
        .map(|&old| {
            let mut record = originals[old].clone();
            for result in &mut record.results {
                result.layer_index = layer_new[result.layer_index as usize] as i64;
            }
            for slot in &mut record.inputs {
                for input in slot.iter_mut() {
                    input.link_index = record_new[input.link_index as usize] as i64;
                }
                slot.sort_by_key(|input| input.link_index);
            }
            record
        })
        .collect();

    config.layers = layers;
    config.records = records;
    Ok(())
}

fn compare_records(records: &[CacheRecord], a: usize, b: usize) -> Ordering {
    let ra = &records[a];
    let rb = &records[b];

    ra.digest
        .cmp(&rb.digest)
        .then_with(|| ra.inputs.len().cmp(&rb.inputs.len()))
        .then_with(|| {
            for (sa, sb) in ra.inputs.iter().zip(&rb.inputs) {
                let by_len = sa.len().cmp(&sb.len());
                if by_len != Ordering::Equal {
                    return by_len;
                }
                for (ia, ib) in sa.iter().zip(sb) {
                    let by_selector = ia.selector.cmp(&ib.selector);
                    if by_selector != Ordering::Equal {
                        return by_selector;
                    }
                    let da = &records[ia.link_index as usize].digest;
                    let db = &records[ib.link_index as usize].digest;
                    let by_digest = da.cmp(db);
                    if by_digest != Ordering::Equal {
                        return by_digest;
                    }
                }
            }
            Ordering::Equal
        })
}

/// Parse the wire structure back into an item graph.
///
/// Fails closed on any out-of-range index and on layer parents that do not
/// point to a strictly lower index.
pub fn parse(config: &CacheConfig) -> Result<ItemGraph> {
    let layer_count = config.layers.len();
    let record_count = config.records.len();

    let mut chains: Vec<LayerChain> = Vec::with_capacity(layer_count);
    for (index, layer) in config.layers.iter().enumerate() {
        let chain = match layer.parent_index {
            -1 => LayerChain::new(vec![layer.blob.clone()]),
            p if p >= 0 && (p as usize) < index => {
                let mut chain = chains[p as usize].clone();
                chain.blobs.push(layer.blob.clone());
                chain
            }
            p => return Err(CodecError::ForwardParent { index, parent: p }),
        };
        chains.push(chain);
    }

    let mut graph = ItemGraph::new();
    let ids: Vec<ItemId> = config
        .records
        .iter()
        .map(|record| graph.add(record.digest.clone(), record.inputs.len()))
        .collect();

    for (index, record) in config.records.iter().enumerate() {
        for (slot, inputs) in record.inputs.iter().enumerate() {
            for input in inputs {
                if input.link_index < 0 || input.link_index as usize >= record_count {
                    return Err(CodecError::InvalidIndex {
                        kind: "link",
                        index: input.link_index,
                        len: record_count,
                    });
                }
                graph.add_link(
                    ids[index],
                    slot,
                    ids[input.link_index as usize],
                    input.selector.clone(),
                );
            }
        }

        if let Some(result) = record.results.iter().max_by_key(|result| result.created_at) {
            if result.layer_index < 0 || result.layer_index as usize >= layer_count {
                return Err(CodecError::InvalidIndex {
                    kind: "layer",
                    index: result.layer_index,
                    len: layer_count,
                });
            }
            graph.set_result(ids[index], chains[result.layer_index as usize].clone(), result.created_at);
        }
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use kiln_core::Digest;

    fn digest(name: &str) -> Digest {
        Digest::from_bytes(name.as_bytes())
    }

    fn sample_graph() -> ItemGraph {
        let mut g = ItemGraph::new();
        let base = g.add(digest("base"), 0);
        let build = g.add(digest("build"), 1);
        g.add_link(build, 0, base, "/src");
        g.set_result(
            base,
            LayerChain::new(vec![digest("l0")]),
            Utc.timestamp_opt(100, 0).unwrap(),
        );
        g.set_result(
            build,
            LayerChain::new(vec![digest("l0"), digest("l1")]),
            Utc.timestamp_opt(200, 0).unwrap(),
        );
        g
    }

    #[test]
    fn test_chain_prefix_sharing() {
        let config = marshal(&sample_graph()).unwrap();
        // Two chains share the l0 prefix: two layers total, not three.
        assert_eq!(config.layers.len(), 2);
        assert_eq!(config.records.len(), 2);
    }

    #[test]
    fn test_layer_parents_point_backwards() {
        let config = marshal(&sample_graph()).unwrap();
        for (i, layer) in config.layers.iter().enumerate() {
            assert!(layer.parent_index == -1 || (layer.parent_index as usize) < i);
        }
    }

    #[test]
    fn test_inputs_sorted_by_link_index() {
        let mut g = ItemGraph::new();
        let a = g.add(digest("zz-base"), 0);
        let b = g.add(digest("aa-base"), 0);
        let top = g.add(digest("merge"), 1);
        g.add_link(top, 0, a, "");
        g.add_link(top, 0, b, "");

        let config = marshal(&g).unwrap();
        let top_record =
            config.records.iter().find(|r| r.digest == digest("merge")).unwrap();
        let indices: Vec<i64> = top_record.inputs[0].iter().map(|i| i.link_index).collect();
        let mut sorted = indices.clone();
        sorted.sort();
        assert_eq!(indices, sorted);
    }

    #[test]
    fn test_round_trip_preserves_structure() {
        let bytes = crate::serialize(&sample_graph()).unwrap();
        let parsed = crate::deserialize(&bytes).unwrap();
        let again = crate::serialize(&parsed).unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn test_serialization_deterministic_under_permutation() {
        // Same graph, items inserted in a different order.
        let mut g = ItemGraph::new();
        let build = g.add(digest("build"), 1);
        let base = g.add(digest("base"), 0);
        g.add_link(build, 0, base, "/src");
        g.set_result(
            base,
            LayerChain::new(vec![digest("l0")]),
            Utc.timestamp_opt(100, 0).unwrap(),
        );
        g.set_result(
            build,
            LayerChain::new(vec![digest("l0"), digest("l1")]),
            Utc.timestamp_opt(200, 0).unwrap(),
        );

        assert_eq!(crate::serialize(&sample_graph()).unwrap(), crate::serialize(&g).unwrap());
    }

    #[test]
    fn test_parse_rejects_bad_link_index() {
        let config = CacheConfig {
            layers: vec![],
            records: vec![CacheRecord {
                digest: digest("op"),
                inputs: vec![vec![CacheInput { selector: String::new(), link_index: 5 }]],
                results: vec![],
            }],
        };
        assert!(matches!(parse(&config), Err(CodecError::InvalidIndex { kind: "link", .. })));
    }

    #[test]
    fn test_parse_rejects_forward_parent() {
        let config = CacheConfig {
            layers: vec![
                CacheLayer { blob: digest("a"), parent_index: 1 },
                CacheLayer { blob: digest("b"), parent_index: -1 },
            ],
            records: vec![],
        };
        assert!(matches!(parse(&config), Err(CodecError::ForwardParent { .. })));
    }

    #[test]
    fn test_sort_config_rejects_bad_layer_index() {
        let mut config = CacheConfig {
            layers: vec![CacheLayer { blob: digest("a"), parent_index: -1 }],
            records: vec![CacheRecord {
                digest: digest("op"),
                inputs: vec![],
                results: vec![CacheResult {
                    layer_index: 7,
                    created_at: Utc.timestamp_opt(0, 0).unwrap(),
                }],
            }],
        };
        assert!(matches!(
            sort_config(&mut config),
            Err(CodecError::InvalidIndex { kind: "layer", .. })
        ));
    }

    #[test]
    fn test_marshal_skips_items_with_emptied_slot() {
        let mut g = ItemGraph::new();
        let base = g.add(digest("base"), 0);
        let ok = g.add(digest("ok"), 1);
        g.add_link(ok, 0, base, "");
        // Arity 1 but no links at all: not representable on the wire.
        let broken = g.add(digest("broken"), 1);
        let dependent = g.add(digest("dependent"), 1);
        g.add_link(dependent, 0, broken, "");

        let config = marshal(&g).unwrap();
        let digests: Vec<&Digest> = config.records.iter().map(|r| &r.digest).collect();
        assert!(digests.contains(&&digest("base")));
        assert!(digests.contains(&&digest("ok")));
        assert!(!digests.contains(&&digest("broken")));
        assert!(!digests.contains(&&digest("dependent")));
    }
}
