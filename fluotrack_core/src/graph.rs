//! Undirected graphs over cells (intra-frame) and vertices (inter-frame).
//!
//! [`Graph`] is a small adjacency-set graph keyed by node id. Edges are
//! stored once under the ordered key pair, so "edge between a and b" is a
//! single map lookup in either direction.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// GENERIC GRAPH
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct NodeEntry<K, N> {
    data: N,
    adjacent: BTreeSet<K>,
}

/// Undirected graph with per-node and per-edge payloads.
///
/// Self loops are rejected. Removing a node drops its incident edges.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph<K, N, E> {
    nodes: BTreeMap<K, NodeEntry<K, N>>,
    edges: BTreeMap<(K, K), E>,
}

impl<K: Ord + Copy, N, E> Default for Graph<K, N, E> {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn ordered<K: Ord>(a: K, b: K) -> (K, K) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl<K: Ord + Copy, N, E> Graph<K, N, E> {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
    }

    pub fn contains_node(&self, key: K) -> bool {
        self.nodes.contains_key(&key)
    }

    pub fn node(&self, key: K) -> Option<&N> {
        self.nodes.get(&key).map(|n| &n.data)
    }

    pub fn node_mut(&mut self, key: K) -> Option<&mut N> {
        self.nodes.get_mut(&key).map(|n| &mut n.data)
    }

    /// Inserts a node. Returns false and keeps the old payload if present.
    pub fn add_node(&mut self, key: K, data: N) -> bool {
        if self.nodes.contains_key(&key) {
            return false;
        }
        self.nodes.insert(
            key,
            NodeEntry {
                data,
                adjacent: BTreeSet::new(),
            },
        );
        true
    }

    /// Returns the node payload, inserting `make()` if absent.
    pub fn ensure_node(&mut self, key: K, make: impl FnOnce() -> N) -> &mut N {
        &mut self
            .nodes
            .entry(key)
            .or_insert_with(|| NodeEntry {
                data: make(),
                adjacent: BTreeSet::new(),
            })
            .data
    }

    /// Removes a node and every edge touching it.
    pub fn remove_node(&mut self, key: K) -> Option<N> {
        let entry = self.nodes.remove(&key)?;
        for other in entry.adjacent {
            self.edges.remove(&ordered(key, other));
            if let Some(n) = self.nodes.get_mut(&other) {
                n.adjacent.remove(&key);
            }
        }
        Some(entry.data)
    }

    pub fn edge(&self, a: K, b: K) -> Option<&E> {
        self.edges.get(&ordered(a, b))
    }

    pub fn edge_mut(&mut self, a: K, b: K) -> Option<&mut E> {
        self.edges.get_mut(&ordered(a, b))
    }

    /// Inserts or replaces the edge between two existing nodes.
    ///
    /// Returns false if either endpoint is missing or `a == b`.
    pub fn set_edge(&mut self, a: K, b: K, data: E) -> bool {
        if a == b || !self.nodes.contains_key(&a) || !self.nodes.contains_key(&b) {
            return false;
        }
        self.edges.insert(ordered(a, b), data);
        if let Some(n) = self.nodes.get_mut(&a) {
            n.adjacent.insert(b);
        }
        if let Some(n) = self.nodes.get_mut(&b) {
            n.adjacent.insert(a);
        }
        true
    }

    pub fn remove_edge(&mut self, a: K, b: K) -> Option<E> {
        let data = self.edges.remove(&ordered(a, b))?;
        if let Some(n) = self.nodes.get_mut(&a) {
            n.adjacent.remove(&b);
        }
        if let Some(n) = self.nodes.get_mut(&b) {
            n.adjacent.remove(&a);
        }
        Some(data)
    }

    /// Adjacent node keys, in key order.
    pub fn neighbors(&self, key: K) -> impl Iterator<Item = K> + '_ {
        self.nodes
            .get(&key)
            .into_iter()
            .flat_map(|n| n.adjacent.iter().copied())
    }

    pub fn degree(&self, key: K) -> usize {
        self.nodes.get(&key).map_or(0, |n| n.adjacent.len())
    }

    /// Nodes in key order.
    pub fn nodes(&self) -> impl Iterator<Item = (K, &N)> + '_ {
        self.nodes.iter().map(|(k, n)| (*k, &n.data))
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = (K, &mut N)> + '_ {
        self.nodes.iter_mut().map(|(k, n)| (*k, &mut n.data))
    }

    /// Edges under their ordered key pair.
    pub fn edges(&self) -> impl Iterator<Item = ((K, K), &E)> + '_ {
        self.edges.iter().map(|(k, e)| (*k, e))
    }

    pub fn edges_mut(&mut self) -> impl Iterator<Item = ((K, K), &mut E)> + '_ {
        self.edges.iter_mut().map(|(k, e)| (*k, e))
    }

    /// Renames every node with `f`, moving edges along.
    ///
    /// `f` must be injective over the current keys.
    pub fn rekey(&mut self, f: impl Fn(K) -> K) {
        let nodes = std::mem::take(&mut self.nodes);
        let edges = std::mem::take(&mut self.edges);
        self.nodes = nodes
            .into_iter()
            .map(|(k, n)| {
                (
                    f(k),
                    NodeEntry {
                        data: n.data,
                        adjacent: n.adjacent.into_iter().map(&f).collect(),
                    },
                )
            })
            .collect();
        self.edges = edges
            .into_iter()
            .map(|((a, b), e)| (ordered(f(a), f(b)), e))
            .collect();
    }

    /// Folds node `from` into node `into`.
    ///
    /// Edges of `from` are moved onto `into`; where `into` already has an
    /// edge to the same neighbor, `merge_edge` combines them. The edge
    /// between the two, if any, is dropped. `merge_node` folds the payloads.
    /// Returns false if either node is missing.
    pub fn merge_node(
        &mut self,
        from: K,
        into: K,
        mut merge_node: impl FnMut(&mut N, N),
        mut merge_edge: impl FnMut(&mut E, E),
    ) -> bool {
        if from == into || !self.nodes.contains_key(&into) {
            return false;
        }
        let neighbors: Vec<K> = match self.nodes.get(&from) {
            Some(n) => n.adjacent.iter().copied().collect(),
            None => return false,
        };
        for other in neighbors {
            let Some(e) = self.remove_edge(from, other) else { continue };
            if other == into {
                continue;
            }
            if let Some(existing) = self.edge_mut(into, other) {
                merge_edge(existing, e);
            } else {
                self.set_edge(into, other, e);
            }
        }
        if let Some(data) = self.remove_node(from) {
            if let Some(target) = self.node_mut(into) {
                merge_node(target, data);
            }
        }
        true
    }
}

// ============================================================================
// INTRA-FRAME CONTACT GRAPH
// ============================================================================

/// Contact between two cells of the same frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ContactEdge {
    /// Adjacent voxel pairs
    pub size_ui: u32,
    /// Intensity-weighted contact
    pub size_d: f64,
    /// Distance in voxel units
    pub dist_v: f64,
    /// Distance in physical units
    pub dist_s: f64,
}

/// Contact graph among the cells of one frame, keyed by cell id.
pub type IntraGraph = Graph<u32, (), ContactEdge>;

// ============================================================================
// INTER-FRAME LINK GRAPH
// ============================================================================

/// A vertex in an inter-frame graph: the vertex id plus its frame.
///
/// Ordering is by frame first, so an ordered edge key always lists the
/// earlier frame's vertex first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    pub frame: usize,
    pub id: u32,
}

impl NodeKey {
    pub fn new(frame: usize, id: u32) -> Self {
        Self { frame, id }
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.frame)
    }
}

/// Node payload: how often this vertex's links were flipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InterNode {
    pub count: u32,
}

/// Link state of an inter-frame edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LinkState {
    #[default]
    Unlinked,
    /// Set by the automatic passes
    Linked,
    /// Set by the user; immune to automatic changes
    Forced,
    Reserved,
}

impl LinkState {
    pub fn as_u32(self) -> u32 {
        match self {
            LinkState::Unlinked => 0,
            LinkState::Linked => 1,
            LinkState::Forced => 2,
            LinkState::Reserved => 3,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(LinkState::Unlinked),
            1 => Some(LinkState::Linked),
            2 => Some(LinkState::Forced),
            3 => Some(LinkState::Reserved),
            _ => None,
        }
    }

    /// Soft or forced.
    pub fn is_linked(self) -> bool {
        matches!(self, LinkState::Linked | LinkState::Forced)
    }

    /// States the automatic passes may change.
    pub fn is_automatic(self) -> bool {
        matches!(self, LinkState::Unlinked | LinkState::Linked)
    }
}

/// Correspondence between vertices of two adjacent frames.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LinkEdge {
    /// Overlapping voxels
    pub size_ui: u32,
    /// Overlap weighted by the lower of the two intensities
    pub size_d: f64,
    /// Centroid distance
    pub dist: f64,
    pub link: LinkState,
    /// Automatic link flips
    pub count: u32,
}

/// A level of the uncertainty histogram and how many vertices sit on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncertainBin {
    pub level: u32,
    pub count: u32,
}

/// Link graph between frames `index` and `index + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct InterGraph {
    /// Earlier of the two frames
    pub index: usize,

    /// Relaxation passes run on this graph
    pub counter: u32,

    /// Major uncertainty bin last seen from each side
    pub major_bins: [Option<UncertainBin>; 2],

    pub graph: Graph<NodeKey, InterNode, LinkEdge>,
}

impl InterGraph {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            counter: 0,
            major_bins: [None, None],
            graph: Graph::new(),
        }
    }

    /// Count of incident edges that are soft- or force-linked.
    pub fn linked_valence(&self, key: NodeKey) -> usize {
        self.linked_neighbors(key).len()
    }

    /// Neighbors reached through linked edges.
    pub fn linked_neighbors(&self, key: NodeKey) -> Vec<NodeKey> {
        self.graph
            .neighbors(key)
            .filter(|&n| {
                self.graph
                    .edge(key, n)
                    .is_some_and(|e| e.link.is_linked())
            })
            .collect()
    }

    /// Flip count of a node (0 if absent).
    pub fn node_count(&self, key: NodeKey) -> u32 {
        self.graph.node(key).map_or(0, |n| n.count)
    }

    /// Resets every pass and flip counter.
    pub fn clear_counters(&mut self) {
        self.counter = 0;
        self.major_bins = [None, None];
        for (_, n) in self.graph.nodes_mut() {
            n.count = 0;
        }
        for (_, e) in self.graph.edges_mut() {
            e.count = 0;
        }
    }

    /// Carries link decisions of `previous` over a freshly measured graph.
    ///
    /// Overlap stays as measured. Pass counter, flip counts and link states
    /// of surviving edges come from `previous`. Forced edges survive even
    /// without overlap, keeping the larger of the two overlaps.
    pub fn carry_decisions(&mut self, previous: InterGraph) {
        self.counter = previous.counter;
        self.major_bins = previous.major_bins;
        for ((a, b), old) in previous.graph.edges() {
            if let Some(edge) = self.graph.edge_mut(a, b) {
                edge.link = old.link;
                edge.count = old.count;
                if old.link == LinkState::Forced && old.size_d > edge.size_d {
                    edge.size_ui = edge.size_ui.max(old.size_ui);
                    edge.size_d = old.size_d;
                }
            } else if old.link == LinkState::Forced {
                for k in [a, b] {
                    self.graph.ensure_node(k, InterNode::default);
                }
                self.graph.set_edge(a, b, *old);
            }
        }
        for (k, node) in previous.graph.nodes() {
            if let Some(n) = self.graph.node_mut(k) {
                n.count = node.count;
            }
        }
    }

    /// Automatic transition of edge `a`-`b` to `state`.
    ///
    /// No-op when the edge is missing, already in `state`, or not under
    /// automatic control. Otherwise bumps the edge's and both endpoints'
    /// flip counts by one.
    pub fn set_auto_link(&mut self, a: NodeKey, b: NodeKey, state: LinkState) -> bool {
        let Some(edge) = self.graph.edge_mut(a, b) else {
            return false;
        };
        if edge.link == state || !edge.link.is_automatic() {
            return false;
        }
        edge.link = state;
        edge.count += 1;
        for k in [a, b] {
            if let Some(n) = self.graph.node_mut(k) {
                n.count += 1;
            }
        }
        true
    }

    pub fn link_edge(&mut self, a: NodeKey, b: NodeKey) -> bool {
        self.set_auto_link(a, b, LinkState::Linked)
    }

    pub fn unlink_edge(&mut self, a: NodeKey, b: NodeKey) -> bool {
        self.set_auto_link(a, b, LinkState::Unlinked)
    }

    /// Forces edge `a`-`b`, creating nodes and edge as needed.
    ///
    /// Overlap and distance come from `edge`; an existing edge keeps its
    /// overlap where that is larger. Link and counts are reset to a
    /// deliberate decision.
    pub fn force(&mut self, a: NodeKey, b: NodeKey, edge: LinkEdge) {
        for k in [a, b] {
            self.graph.ensure_node(k, InterNode::default).count = 0;
        }
        let forced = LinkEdge {
            link: LinkState::Forced,
            count: 0,
            ..edge
        };
        if let Some(existing) = self.graph.edge_mut(a, b) {
            existing.size_ui = existing.size_ui.max(forced.size_ui);
            existing.size_d = existing.size_d.max(forced.size_d);
            existing.link = LinkState::Forced;
            existing.count = 0;
        } else {
            self.graph.set_edge(a, b, forced);
        }
    }

    /// User unlink of `a`-`b`. Fails if either node is absent.
    pub fn sever(&mut self, a: NodeKey, b: NodeKey) -> bool {
        if !self.graph.contains_node(a) || !self.graph.contains_node(b) {
            return false;
        }
        for k in [a, b] {
            if let Some(n) = self.graph.node_mut(k) {
                n.count = 0;
            }
        }
        if let Some(edge) = self.graph.edge_mut(a, b) {
            edge.link = LinkState::Unlinked;
            edge.count = 0;
        }
        true
    }

    /// Clears every soft link of `key` and resets its count. Forced links
    /// stay. Fails if `key` is absent.
    pub fn isolate(&mut self, key: NodeKey) -> bool {
        let Some(node) = self.graph.node_mut(key) else {
            return false;
        };
        node.count = 0;
        let neighbors: Vec<NodeKey> = self.graph.neighbors(key).collect();
        for n in neighbors {
            if let Some(edge) = self.graph.edge_mut(key, n) {
                if edge.link == LinkState::Linked {
                    edge.link = LinkState::Unlinked;
                    edge.count = 0;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn line_graph() -> Graph<u32, u32, u32> {
        let mut g = Graph::new();
        for k in 1..=4 {
            g.add_node(k, k * 10);
        }
        g.set_edge(1, 2, 12);
        g.set_edge(2, 3, 23);
        g.set_edge(3, 4, 34);
        g
    }

    #[test]
    fn test_edge_lookup_is_symmetric() {
        let g = line_graph();
        assert_eq!(g.edge(2, 1), Some(&12));
        assert_eq!(g.edge(1, 2), Some(&12));
        assert_eq!(g.edge(1, 3), None);
        assert_eq!(g.neighbors(2).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_set_edge_requires_nodes() {
        let mut g = line_graph();
        assert!(!g.set_edge(1, 9, 0));
        assert!(!g.set_edge(1, 1, 0));
        assert_eq!(g.edge_count(), 3);
    }

    #[test]
    fn test_remove_node_drops_incident_edges() {
        let mut g = line_graph();
        assert_eq!(g.remove_node(2), Some(20));
        assert_eq!(g.edge_count(), 1);
        assert_eq!(g.degree(1), 0);
        assert_eq!(g.degree(3), 1);
    }

    #[test]
    fn test_merge_node_combines_edges() {
        let mut g = line_graph();
        g.set_edge(1, 3, 13);
        // fold 2 into 3: edge 1-2 merges with 1-3, edge 2-3 is dropped
        assert!(g.merge_node(2, 3, |a, b| *a += b, |a, b| *a += b));
        assert!(!g.contains_node(2));
        assert_eq!(g.node(3), Some(&50));
        assert_eq!(g.edge(1, 3), Some(&25));
        assert_eq!(g.edge_count(), 2);
    }

    #[test]
    fn test_rekey_swaps_ids() {
        let mut g = line_graph();
        g.rekey(|k| match k {
            1 => 2,
            2 => 1,
            k => k,
        });
        assert_eq!(g.node(1), Some(&20));
        assert_eq!(g.edge(1, 3), Some(&23));
        assert_eq!(g.edge(2, 1), Some(&12));
    }

    #[test]
    fn test_node_key_orders_by_frame() {
        let early = NodeKey::new(0, 900);
        let late = NodeKey::new(1, 5);
        assert!(early < late);
    }

    #[test]
    fn test_linked_valence() {
        let mut ig = InterGraph::new(0);
        let a = NodeKey::new(0, 1);
        let b = NodeKey::new(1, 1);
        let c = NodeKey::new(1, 2);
        for k in [a, b, c] {
            ig.graph.add_node(k, InterNode::default());
        }
        ig.graph.set_edge(a, b, LinkEdge { link: LinkState::Linked, ..Default::default() });
        ig.graph.set_edge(a, c, LinkEdge { link: LinkState::Unlinked, ..Default::default() });
        assert_eq!(ig.linked_valence(a), 1);
        assert_eq!(ig.linked_neighbors(a), vec![b]);
        assert_eq!(ig.linked_valence(c), 0);
    }

    #[test]
    fn test_link_state_codes() {
        for v in 0..4 {
            assert_eq!(LinkState::from_u32(v).unwrap().as_u32(), v);
        }
        assert!(LinkState::from_u32(4).is_none());
        assert!(!LinkState::Forced.is_automatic());
    }

    fn pair_graph(link: LinkState) -> (InterGraph, NodeKey, NodeKey) {
        let mut ig = InterGraph::new(0);
        let a = NodeKey::new(0, 1);
        let b = NodeKey::new(1, 1);
        ig.graph.add_node(a, InterNode::default());
        ig.graph.add_node(b, InterNode::default());
        ig.graph.set_edge(a, b, LinkEdge { link, ..Default::default() });
        (ig, a, b)
    }

    #[test]
    fn test_auto_link_counts_each_flip_once() {
        let (mut ig, a, b) = pair_graph(LinkState::Linked);
        assert!(!ig.link_edge(a, b));
        assert_eq!(ig.graph.edge(a, b).unwrap().count, 0);

        assert!(ig.unlink_edge(a, b));
        assert!(ig.link_edge(a, b));
        assert_eq!(ig.graph.edge(a, b).unwrap().count, 2);
        assert_eq!(ig.node_count(a), 2);
        assert_eq!(ig.node_count(b), 2);
    }

    #[test]
    fn test_forced_edge_immune_to_auto() {
        let (mut ig, a, b) = pair_graph(LinkState::Forced);
        assert!(!ig.unlink_edge(a, b));
        assert_eq!(ig.graph.edge(a, b).unwrap().link, LinkState::Forced);
        assert!(ig.isolate(a));
        assert_eq!(ig.graph.edge(a, b).unwrap().link, LinkState::Forced);
    }

    #[test]
    fn test_force_and_sever_reset_counts() {
        let (mut ig, a, b) = pair_graph(LinkState::Linked);
        ig.unlink_edge(a, b);
        ig.force(a, b, LinkEdge { size_ui: 9, ..Default::default() });
        let e = ig.graph.edge(a, b).unwrap();
        assert_eq!(e.link, LinkState::Forced);
        assert_eq!(e.count, 0);
        assert_eq!(e.size_ui, 9);
        assert_eq!(ig.node_count(a), 0);
        // a weaker force keeps the stronger overlap
        ig.force(a, b, LinkEdge { size_ui: 4, ..Default::default() });
        assert_eq!(ig.graph.edge(a, b).unwrap().size_ui, 9);

        // force creates missing nodes, sever does not
        let c = NodeKey::new(1, 9);
        assert!(!ig.sever(a, c));
        ig.force(a, c, LinkEdge::default());
        assert!(ig.sever(a, c));
        assert_eq!(ig.graph.edge(a, c).unwrap().link, LinkState::Unlinked);
    }

    #[test]
    fn test_carry_decisions_over_fresh_overlap() {
        let (mut old, a, b) = pair_graph(LinkState::Linked);
        old.unlink_edge(a, b);
        let c = NodeKey::new(1, 9);
        old.force(a, c, LinkEdge { size_ui: 30, size_d: 30.0, ..Default::default() });
        old.counter = 7;

        let mut fresh = InterGraph::new(0);
        fresh.graph.add_node(a, InterNode::default());
        fresh.graph.add_node(b, InterNode::default());
        let measured = LinkEdge { size_ui: 12, size_d: 12.0, link: LinkState::Linked, ..Default::default() };
        fresh.graph.set_edge(a, b, measured);

        fresh.carry_decisions(old);
        assert_eq!(fresh.counter, 7);
        let e = fresh.graph.edge(a, b).unwrap();
        assert_eq!(e.link, LinkState::Unlinked);
        assert_eq!(e.count, 1);
        assert_eq!(e.size_ui, 12);
        assert_eq!(fresh.node_count(b), 1);
        // no overlap left, the forced edge still stands
        let f = fresh.graph.edge(a, c).unwrap();
        assert_eq!(f.link, LinkState::Forced);
        assert_eq!(f.size_ui, 30);
    }

    proptest! {
        #[test]
        fn test_adjacency_matches_edges(pairs in proptest::collection::vec((0u32..12, 0u32..12), 0..40),
                                        removed in 0u32..12) {
            let mut g: Graph<u32, (), ()> = Graph::new();
            for k in 0..12 {
                g.add_node(k, ());
            }
            for (a, b) in pairs {
                g.set_edge(a, b, ());
            }
            g.remove_node(removed);

            let degree_sum: usize = g.nodes().map(|(k, _)| g.degree(k)).sum();
            prop_assert_eq!(degree_sum, 2 * g.edge_count());
            for ((a, b), _) in g.edges() {
                prop_assert!(a != removed && b != removed);
                prop_assert!(g.neighbors(a).any(|n| n == b));
            }
        }
    }
}
