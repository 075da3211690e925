//! Graph normalization: loop removal and deduplication by matching.
//!
//! The in-memory cache graph admits transient cycles because items are
//! added incrementally before their inputs are fully keyed, and it admits
//! duplicate items because equivalent sub-graphs are discovered through
//! different jobs. Normalization removes the loops, merges equivalent
//! items, and leaves a graph whose marshalled form is canonical.

use crate::graph::{ItemGraph, ItemId, Link};
use crate::{CodecError, Result};
use chrono::{DateTime, Utc};
use kiln_core::{Digest, LayerChain};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// A normalized graph plus diagnostics from the loop-removal pass.
#[derive(Debug)]
pub struct Normalized {
    pub graph: ItemGraph,
    /// Number of links dropped to break cycles.
    pub dropped_links: usize,
}

/// Normalize a graph: break loops, then deduplicate equivalent items.
///
/// A slot that is empty in the input graph (as opposed to emptied by loop
/// removal) is an invalid record and fails closed.
pub fn normalize(graph: &ItemGraph) -> Result<Normalized> {
    for id in graph.ids() {
        let item = graph.get(id);
        if !item.links.is_empty() && item.links.iter().any(|slot| slot.is_empty()) {
            return Err(CodecError::IncompleteLinks { digest: item.digest.clone() });
        }
    }

    let mut work = graph.clone();
    let dropped_links = remove_loops(&mut work);
    let graph = dedup(&work)?;
    Ok(Normalized { graph, dropped_links })
}

const WHITE: u8 = 0;
const GRAY: u8 = 1;
const BLACK: u8 = 2;

/// Break cycles by dropping individual links.
///
/// DFS over child edges starting from items with no outgoing links; a link
/// that would revisit an item on the current path is dropped, with a
/// diagnostic. Roots and children are visited in a total order (vertex
/// digest, then arena index) so the dropped link is the same on every run.
fn remove_loops(graph: &mut ItemGraph) -> usize {
    let mut color = vec![WHITE; graph.len()];
    let mut dropped = 0;

    let mut roots = graph.roots();
    sort_by_identity(graph, &mut roots);
    for root in roots {
        check_loops(graph, root, &mut color, &mut dropped);
    }

    // Pure cycles are unreachable from any base item; walk the leftovers in
    // the same order so they terminate too.
    let mut rest: Vec<ItemId> = graph.ids().filter(|id| color[id.index()] == WHITE).collect();
    sort_by_identity(graph, &mut rest);
    for id in rest {
        if color[id.index()] == WHITE {
            check_loops(graph, id, &mut color, &mut dropped);
        }
    }

    dropped
}

fn check_loops(graph: &mut ItemGraph, node: ItemId, color: &mut Vec<u8>, dropped: &mut usize) {
    color[node.index()] = GRAY;

    let mut children = graph.children(node);
    sort_by_identity(graph, &mut children);

    for child in children {
        match color[child.index()] {
            GRAY => {
                // Back edge onto the current path: drop the child's links to
                // this node, not the whole item.
                let removed = drop_links(graph, child, node);
                if removed > 0 {
                    warn!(
                        parent = %graph.get(node).digest.short(),
                        child = %graph.get(child).digest.short(),
                        removed,
                        "Dropped looping cache link"
                    );
                    *dropped += removed;
                }
            }
            WHITE => check_loops(graph, child, color, dropped),
            // A black child is a cross edge, not a loop.
            _ => {}
        }
    }

    color[node.index()] = BLACK;
}

fn drop_links(graph: &mut ItemGraph, child: ItemId, parent: ItemId) -> usize {
    let item = graph.get_mut(child);
    let mut removed = 0;
    for slot in &mut item.links {
        let before = slot.len();
        slot.retain(|link| link.src != parent);
        removed += before - slot.len();
    }
    removed
}

fn sort_by_identity(graph: &ItemGraph, ids: &mut [ItemId]) {
    ids.sort_by(|a, b| {
        graph.get(*a).digest.cmp(&graph.get(*b).digest).then_with(|| a.cmp(b))
    });
}

/// Normalized-link key used to find equivalent items: same consuming vertex
/// digest, same input slot, same selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NLink {
    digest: Digest,
    input: usize,
    selector: String,
}

/// An item being assembled under its canonical identity.
#[derive(Debug, Clone)]
struct CanonItem {
    digest: Digest,
    links: Vec<BTreeSet<(Digest, String)>>,
    result: Option<LayerChain>,
    result_time: DateTime<Utc>,
}

#[derive(Default)]
struct DedupState {
    /// Original item -> canonical identity; `None` marks a dropped item.
    added: HashMap<ItemId, Option<Digest>>,
    /// Canonical identity -> item under construction. Ordered so the output
    /// graph is rebuilt deterministically.
    by_key: BTreeMap<Digest, CanonItem>,
    /// Reverse index: canonical source -> (nlink -> canonical children).
    links: HashMap<Digest, HashMap<NLink, BTreeSet<Digest>>>,
    /// Counter for fresh deterministic identities.
    next: usize,
}

/// Merge equivalent items, assuming `graph` is loop-free.
fn dedup(graph: &ItemGraph) -> Result<ItemGraph> {
    let mut state = DedupState::default();
    for id in graph.ids() {
        normalize_item(graph, id, &mut state)?;
    }

    let mut out = ItemGraph::new();
    let mut ids_by_key: HashMap<Digest, ItemId> = HashMap::new();
    for (key, canon) in &state.by_key {
        let id = out.add(canon.digest.clone(), canon.links.len());
        if let Some(chain) = &canon.result {
            out.set_result(id, chain.clone(), canon.result_time);
        }
        ids_by_key.insert(key.clone(), id);
    }
    for (key, canon) in &state.by_key {
        let child = ids_by_key[key];
        for (slot, links) in canon.links.iter().enumerate() {
            for (src_key, selector) in links {
                let src = ids_by_key.get(src_key).ok_or_else(|| {
                    CodecError::Internal(format!("unresolved canonical link source {}", src_key))
                })?;
                out.add_link(child, slot, *src, selector.clone());
            }
        }
    }
    Ok(out)
}

fn normalize_item(graph: &ItemGraph, id: ItemId, state: &mut DedupState) -> Result<Option<Digest>> {
    if let Some(existing) = state.added.get(&id) {
        return Ok(existing.clone());
    }

    let item = graph.get(id);

    // Base items dedup directly on their vertex digest.
    if item.links.is_empty() {
        let key = item.digest.clone();
        match state.by_key.get_mut(&key) {
            Some(canon) => {
                if canon.result.is_none() {
                    canon.result = item.result.clone();
                    canon.result_time = item.result_time;
                }
            }
            None => {
                state.by_key.insert(
                    key.clone(),
                    CanonItem {
                        digest: item.digest.clone(),
                        links: Vec::new(),
                        result: item.result.clone(),
                        result_time: item.result_time,
                    },
                );
            }
        }
        state.added.insert(id, Some(key.clone()));
        return Ok(Some(key));
    }

    // Resolve each link to its canonical source first, in a total order
    // (selector, source vertex digest, arena index) so fresh identities are
    // assigned reproducibly. A dropped source drops the link; a slot with
    // every link dropped drops this item.
    let mut resolved: Vec<Vec<(Digest, String)>> = Vec::with_capacity(item.links.len());
    for slot in &item.links {
        let mut ordered: Vec<&Link> = slot.iter().collect();
        ordered.sort_by(|a, b| {
            a.selector
                .cmp(&b.selector)
                .then_with(|| graph.get(a.src).digest.cmp(&graph.get(b.src).digest))
                .then_with(|| a.src.cmp(&b.src))
        });

        let mut out_links = Vec::new();
        for link in ordered {
            match normalize_item(graph, link.src, state)? {
                Some(src_key) => out_links.push((src_key, link.selector.clone())),
                None => {}
            }
        }
        if out_links.is_empty() {
            warn!(digest = %item.digest.short(), "Dropping record with emptied input slot");
            state.added.insert(id, None);
            return Ok(None);
        }
        resolved.push(out_links);
    }

    // An existing item is equivalent if it is already linked from our
    // sources under the same normalized links: union the candidates of the
    // first slot, intersect with every further link's candidates.
    let mut matches: BTreeSet<Digest> = BTreeSet::new();
    for (input, out_links) in resolved.iter().enumerate() {
        for (src_key, selector) in out_links {
            let nl =
                NLink { digest: item.digest.clone(), input, selector: selector.clone() };
            let candidates = state
                .links
                .get(src_key)
                .and_then(|by_link| by_link.get(&nl))
                .cloned()
                .unwrap_or_default();
            if input == 0 {
                matches.extend(candidates);
            } else {
                matches.retain(|candidate| candidates.contains(candidate));
            }
        }
    }

    let key = match matches.first() {
        // Lexicographically smallest match is the canonical identity.
        Some(smallest) => smallest.clone(),
        None => {
            // No equivalent item; mint a deterministic fresh identity.
            state.next += 1;
            let key = Digest::from_bytes(state.next.to_string());
            state.by_key.insert(
                key.clone(),
                CanonItem {
                    digest: item.digest.clone(),
                    links: vec![BTreeSet::new(); resolved.len()],
                    result: None,
                    result_time: item.result_time,
                },
            );
            key
        }
    };
    state.added.insert(id, Some(key.clone()));

    {
        let canon = state
            .by_key
            .get_mut(&key)
            .ok_or_else(|| CodecError::Internal("matched canonical item missing".into()))?;
        if canon.links.len() < resolved.len() {
            canon.links.resize(resolved.len(), BTreeSet::new());
        }
        for (input, out_links) in resolved.iter().enumerate() {
            for (src_key, selector) in out_links {
                canon.links[input].insert((src_key.clone(), selector.clone()));
            }
        }
        if canon.result.is_none() {
            canon.result = item.result.clone();
            canon.result_time = item.result_time;
        }
    }

    for (input, out_links) in resolved.iter().enumerate() {
        for (src_key, selector) in out_links {
            let nl = NLink { digest: item.digest.clone(), input, selector: selector.clone() };
            state
                .links
                .entry(src_key.clone())
                .or_default()
                .entry(nl)
                .or_default()
                .insert(key.clone());
        }
    }

    Ok(Some(key))
}
