//! Arena representation of the in-memory cache graph.
//!
//! Items live in a vector and links carry indices rather than ownership
//! edges, so the graph tolerates the transient cycles that appear while
//! records are accumulated incrementally. Loop removal and deduplication
//! happen in the normalizer.

use chrono::{DateTime, Utc};
use kiln_core::{Digest, LayerChain};

/// Index of an item within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(usize);

impl ItemId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A directed edge to a parent item at a specific selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub src: ItemId,
    pub selector: String,
}

/// One node of the cache graph.
#[derive(Debug, Clone)]
pub struct Item {
    /// Vertex digest this item proves work for.
    pub digest: Digest,
    /// One link set per input slot.
    pub links: Vec<Vec<Link>>,
    pub result: Option<LayerChain>,
    pub result_time: DateTime<Utc>,
}

/// The arena.
#[derive(Debug, Clone, Default)]
pub struct ItemGraph {
    items: Vec<Item>,
}

impl ItemGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an item with `arity` empty input slots.
    pub fn add(&mut self, digest: Digest, arity: usize) -> ItemId {
        let id = ItemId(self.items.len());
        self.items.push(Item {
            digest,
            links: vec![Vec::new(); arity],
            result: None,
            result_time: Utc::now(),
        });
        id
    }

    /// Link `child`'s input slot to `src`. Duplicate links collapse; slots
    /// grow on demand.
    pub fn add_link(&mut self, child: ItemId, input: usize, src: ItemId, selector: impl Into<String>) {
        let item = &mut self.items[child.0];
        if item.links.len() <= input {
            item.links.resize(input + 1, Vec::new());
        }
        let link = Link { src, selector: selector.into() };
        if !item.links[input].contains(&link) {
            item.links[input].push(link);
        }
    }

    pub fn set_result(&mut self, id: ItemId, chain: LayerChain, created_at: DateTime<Utc>) {
        let item = &mut self.items[id.0];
        item.result = Some(chain);
        item.result_time = created_at;
    }

    pub fn get(&self, id: ItemId) -> &Item {
        &self.items[id.0]
    }

    pub(crate) fn get_mut(&mut self, id: ItemId) -> &mut Item {
        &mut self.items[id.0]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ItemId> {
        (0..self.items.len()).map(ItemId)
    }

    /// Items that link to `parent`, in index order.
    pub fn children(&self, parent: ItemId) -> Vec<ItemId> {
        self.ids()
            .filter(|id| {
                self.items[id.0]
                    .links
                    .iter()
                    .any(|slot| slot.iter().any(|link| link.src == parent))
            })
            .collect()
    }

    /// Items with no outgoing links: the base items the loop-removal DFS
    /// starts from.
    pub fn roots(&self) -> Vec<ItemId> {
        self.ids()
            .filter(|id| self.items[id.0].links.iter().all(|slot| slot.is_empty()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(name: &str) -> Digest {
        Digest::from_bytes(name.as_bytes())
    }

    #[test]
    fn test_add_and_link() {
        let mut graph = ItemGraph::new();
        let base = graph.add(digest("base"), 0);
        let child = graph.add(digest("child"), 1);

        graph.add_link(child, 0, base, "/src");
        // Duplicate collapses.
        graph.add_link(child, 0, base, "/src");
        // Different selector is a distinct link.
        graph.add_link(child, 0, base, "/etc");

        assert_eq!(graph.get(child).links[0].len(), 2);
        assert_eq!(graph.roots(), vec![base]);
        assert_eq!(graph.children(base), vec![child]);
    }

    #[test]
    fn test_cycles_are_representable() {
        let mut graph = ItemGraph::new();
        let a = graph.add(digest("a"), 1);
        let b = graph.add(digest("b"), 1);

        graph.add_link(a, 0, b, "");
        graph.add_link(b, 0, a, "");

        // No root; both items link out.
        assert!(graph.roots().is_empty());
        assert_eq!(graph.children(a), vec![b]);
        assert_eq!(graph.children(b), vec![a]);
    }
}
