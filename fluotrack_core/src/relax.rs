//! Per-vertex relaxation of an inter-frame link graph.
//!
//! `process_frames(f1, f2)` visits every vertex of `f1` and tries to bring
//! its linked valence to one:
//! - **Orphans** (valence 0) link their strongest overlap, plus any overlap
//!   of similar weight, or else the nearest orphan of similar size
//! - **Congested** vertices (valence > 1) drop links whose overlap is not
//!   similar to the best one, then try alternating paths, then flip counts
//! - Whatever is still congested falls through to merge/split resolution,
//!   gated by the uncertainty histogram of the vertices' flip counts
//!
//! Every automatic change goes through [`InterGraph::link_edge`] or
//! [`InterGraph::unlink_edge`], so forced links never move.

use crate::error::TrackError;
use crate::graph::{InterGraph, InterNode, LinkEdge, LinkState, NodeKey, UncertainBin};
use crate::processor::{similar_count, PassState, TrackMapProcessor};
use fluotrack_env::VolumeCache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

// ============================================================================
// GRAPH QUERIES
// ============================================================================

/// An incident edge seen from one endpoint.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EdgeRef {
    pub other: NodeKey,
    pub edge: LinkEdge,
}

/// All incident edges of `key`, and the linked subset.
pub(crate) fn incident_edges(ig: &InterGraph, key: NodeKey) -> (Vec<EdgeRef>, Vec<EdgeRef>) {
    let all: Vec<EdgeRef> = ig
        .graph
        .neighbors(key)
        .filter_map(|other| ig.graph.edge(key, other).map(|&edge| EdgeRef { other, edge }))
        .collect();
    let linked = all.iter().copied().filter(|e| e.edge.link.is_linked()).collect();
    (all, linked)
}

/// Neighbors whose edge is linked or has flipped at least `min_count` times.
pub(crate) fn uncertain_neighbors(ig: &InterGraph, key: NodeKey, min_count: u32) -> Vec<NodeKey> {
    incident_edges(ig, key)
        .0
        .into_iter()
        .filter(|e| e.edge.link.is_linked() || e.edge.count >= min_count)
        .map(|e| e.other)
        .collect()
}

/// Dense histogram of the flip counts of `vertices` (frame `frame`) in `ig`.
///
/// Bin `i` holds the number of vertices with count `i`; vertices without a
/// node are skipped. Empty when no vertex has a node.
pub fn uncertain_histogram<I>(ig: &InterGraph, frame: usize, vertices: I) -> Vec<UncertainBin>
where
    I: IntoIterator<Item = u32>,
{
    let mut counts: BTreeMap<u32, u32> = BTreeMap::new();
    for id in vertices {
        if let Some(node) = ig.graph.node(NodeKey::new(frame, id)) {
            *counts.entry(node.count).or_default() += 1;
        }
    }
    let Some(&max) = counts.keys().next_back() else {
        return Vec::new();
    };
    (0..=max)
        .map(|level| UncertainBin {
            level,
            count: counts.get(&level).copied().unwrap_or(0),
        })
        .collect()
}

// ============================================================================
// ALTERNATING PATHS
// ============================================================================

/// One step of an alternating path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathVert {
    pub vert: NodeKey,
    /// An edge leaves this step towards the next one
    pub edge_valid: bool,
    /// Overlap weight of that edge
    pub edge_value: f64,
    /// Best weight reachable from here, filled by the max-match pass
    pub max_value: f64,
    pub link: LinkState,
}

pub type AlterPath = Vec<PathVert>;

fn extend_path(
    ig: &InterGraph,
    v: NodeKey,
    path: &mut AlterPath,
    visited: &mut BTreeSet<NodeKey>,
    level: usize,
    depth: usize,
) -> bool {
    if !ig.graph.contains_node(v) {
        return false;
    }
    visited.insert(v);
    path.push(PathVert {
        vert: v,
        edge_valid: false,
        edge_value: 0.0,
        max_value: 0.0,
        link: LinkState::Unlinked,
    });
    if depth >= level {
        return true;
    }
    let next = ig.graph.neighbors(v).find(|n| !visited.contains(n));
    if let Some(n) = next {
        if let (Some(edge), Some(back)) = (ig.graph.edge(v, n), path.last_mut()) {
            back.edge_valid = true;
            back.edge_value = edge.size_d;
            back.link = edge.link;
        }
        return extend_path(ig, n, path, visited, level, depth + 1);
    }
    path.len() > 1
}

/// Vertex-disjoint paths fanning out from `start`, each at most `level`
/// edges long.
///
/// Each path starts at `start` and greedily walks to the first unvisited
/// neighbor until the depth limit or a dead end.
pub fn alternating_paths(ig: &InterGraph, start: NodeKey, level: usize) -> Vec<AlterPath> {
    let mut visited = BTreeSet::new();
    let mut paths = Vec::new();
    loop {
        let mut path = AlterPath::new();
        if !extend_path(ig, start, &mut path, &mut visited, level, 0) {
            break;
        }
        paths.push(path);
    }
    paths
}

#[derive(Debug, Clone, Copy, Default)]
struct PathMemo {
    value: f64,
    valid: bool,
}

/// Fills `max_value` along the paths at depth `depth` and returns the
/// combined best weight of that layer, skipping vertex `exclude`.
///
/// A step's value is its own edge weight plus the best weight of the next
/// layer without the vertex it leads to.
fn path_max(
    paths: &mut [AlterPath],
    depth: usize,
    exclude: Option<NodeKey>,
    memo: &mut BTreeMap<NodeKey, PathMemo>,
) -> f64 {
    let mut result = 0.0;
    let mut visited = BTreeSet::new();
    for pi in 0..paths.len() {
        if depth >= paths[pi].len() {
            continue;
        }
        let vert = paths[pi][depth].vert;
        if Some(vert) == exclude {
            continue;
        }
        let known = memo.get(&vert).copied().unwrap_or_default();
        if !visited.contains(&vert) && known.valid {
            result += known.value;
            visited.insert(vert);
            continue;
        }

        let step = paths[pi][depth];
        let mut value = step.edge_value;
        if step.edge_valid && depth + 1 < paths[pi].len() {
            let next = paths[pi][depth + 1].vert;
            value += path_max(paths, depth + 1, Some(next), memo);
        }
        paths[pi][depth].max_value = value;

        let entry = memo.entry(vert).or_default();
        if visited.insert(vert) {
            result += value;
            entry.value = value;
        } else if value > entry.value {
            result += value - entry.value;
            entry.value = value;
        }
    }
    for path in paths.iter() {
        if let Some(step) = path.get(depth) {
            if visited.contains(&step.vert) {
                memo.entry(step.vert).or_default().valid = true;
            }
        }
    }
    result
}

/// Unlinks the first edge of `path`.
fn unlink_path(ig: &mut InterGraph, path: &AlterPath) -> bool {
    match (path.first(), path.get(1)) {
        (Some(a), Some(b)) => ig.unlink_edge(a.vert, b.vert),
        _ => false,
    }
}

fn sort_by_size(edges: &mut [EdgeRef]) {
    edges.sort_by(|a, b| b.edge.size_d.total_cmp(&a.edge.size_d));
}

// ============================================================================
// RELAXATION
// ============================================================================

impl<C> TrackMapProcessor<C>
where
    C: VolumeCache,
{
    /// One relaxation pass over the vertices of `f1`, against `f2`.
    ///
    /// Bumps the pair graph's pass counter.
    pub fn process_frames(&mut self, f1: usize, f2: usize) -> Result<(), TrackError> {
        self.check_linked_pair(f1, f2)?;
        let gi = f1.min(f2);
        self.pass = PassState {
            frame1: f1,
            frame2: f2,
            count_min: 0,
            major_converge: false,
        };
        if self.config.merge || self.config.split {
            let (converge, count_min) = self.get_segment(f1, gi);
            self.pass.major_converge = converge;
            self.pass.count_min = count_min;
        }

        let ids: Vec<u32> = self.map.frames[f1].vertices.keys().copied().collect();
        let mut changed = 0usize;
        for id in ids {
            // merges and splits may have removed it
            if !self.map.frames[f1].vertices.contains_key(&id) {
                continue;
            }
            if self.process_vertex(id, gi)? {
                changed += 1;
            }
        }
        if let Some(ig) = self.map.inter.get_mut(gi) {
            ig.counter += 1;
        }
        debug!(
            "Processed frame {} against {}: {} vertices acted on",
            f1, f2, changed
        );
        Ok(())
    }

    /// Relaxes one vertex of the current pass. Returns true if it acted.
    pub(crate) fn process_vertex(&mut self, vid: u32, gi: usize) -> Result<bool, TrackError> {
        let v0 = NodeKey::new(self.pass.frame1, vid);
        let (count, counter) = {
            let ig = &self.map.inter[gi];
            (ig.node_count(v0), ig.counter)
        };
        let calc_sim = self.get_random(count, counter);
        let (all, linked) = incident_edges(&self.map.inter[gi], v0);

        if linked.is_empty() {
            let linked_any = self.link_edge_size(gi, v0, all, calc_sim);
            return Ok(linked_any || self.link_orphans(gi, vid));
        }
        if linked.len() == 1 {
            return Ok(false);
        }

        let PassState {
            count_min,
            major_converge,
            ..
        } = self.pass;
        let mut result = false;
        if calc_sim || !major_converge || count_min == 0 {
            result = self.unlink_edge_size(gi, v0, linked.clone(), calc_sim);
            if !result {
                result = self.unlink_alter_path(gi, v0, calc_sim);
            }
        }
        if !result && !calc_sim && !major_converge && count_min == 0 {
            result = self.unlink_edge_count(gi, v0, linked.clone());
        }
        if !result {
            let neighbors: Vec<NodeKey> = linked.iter().map(|e| e.other).collect();
            result = self.unlink_segment(gi, v0, &neighbors, calc_sim, count_min < count, count_min)?;
        }
        Ok(result)
    }

    /// Links the strongest candidate edge and any of similar weight.
    ///
    /// After the first passes, when similarity is computed, an edge that
    /// flipped no more often than the one before it in weight order is
    /// preferred instead.
    fn link_edge_size(&mut self, gi: usize, v0: NodeKey, mut edges: Vec<EdgeRef>, calc_sim: bool) -> bool {
        if edges.is_empty() {
            return false;
        }
        sort_by_size(&mut edges);
        let config = &self.config;
        let ig = &mut self.map.inter[gi];

        if ig.counter > 1 && calc_sim {
            let mut count_prv = edges[0].edge.count;
            for e in &edges[1..] {
                if e.edge.count <= count_prv {
                    ig.link_edge(v0, e.other);
                    return true;
                }
                count_prv = e.edge.count;
            }
        }
        ig.link_edge(v0, edges[0].other);
        for e in &edges[1..] {
            if config.similar_edges(&edges[0].edge, &e.edge) {
                ig.link_edge(v0, e.other);
            }
        }
        true
    }

    /// Soft-links vertex `vid` of the current frame to the nearest orphan
    /// of the other frame, if their sizes are similar and their dilated
    /// bounds touch.
    fn link_orphans(&mut self, gi: usize, vid: u32) -> bool {
        let PassState { frame1, frame2, .. } = self.pass;
        let ig = &self.map.inter[gi];
        let Some(vertex) = self.map.frames[frame1].vertices.get(&vid) else {
            return false;
        };

        let mut nearest: Option<(f64, u32)> = None;
        for other in self.map.frames[frame2].vertices.values() {
            if ig.linked_valence(NodeKey::new(frame2, other.id)) > 0 {
                continue;
            }
            let d = vertex.distance(other);
            if nearest.map_or(true, |(best, _)| d < best) {
                nearest = Some((d, other.id));
            }
        }
        let Some((dist, oid)) = nearest else {
            return false;
        };
        let Some(other) = self.map.frames[frame2].vertices.get(&oid) else {
            return false;
        };
        if !self.config.similar(vertex.size_d, other.size_d) {
            return false;
        }
        if !vertex.bbox.dilated(1.0).intersects(&other.bbox.dilated(1.0)) {
            return false;
        }

        let k0 = NodeKey::new(frame1, vid);
        let k1 = NodeKey::new(frame2, oid);
        let ig = &mut self.map.inter[gi];
        for k in [k0, k1] {
            if let Some(n) = ig.graph.node_mut(k) {
                n.count += 1;
            } else {
                ig.graph.add_node(k, InterNode { count: 1 });
            }
        }
        if let Some(edge) = ig.graph.edge_mut(k0, k1) {
            edge.count += 1;
            if edge.link == LinkState::Unlinked {
                edge.link = LinkState::Linked;
            }
        } else {
            ig.graph.set_edge(
                k0,
                k1,
                LinkEdge {
                    dist,
                    link: LinkState::Linked,
                    count: 1,
                    ..Default::default()
                },
            );
        }
        debug!("Linked orphans {} and {}", k0, k1);
        true
    }

    /// Keeps the strongest linked edges and unlinks from the first one
    /// whose weight is not similar to the best. True only if some edge was
    /// actually unlinked; forced edges never are.
    fn unlink_edge_size(&mut self, gi: usize, v0: NodeKey, mut edges: Vec<EdgeRef>, calc_sim: bool) -> bool {
        if edges.len() < 2 || !calc_sim {
            return false;
        }
        sort_by_size(&mut edges);
        let cut = (1..edges.len()).find(|&i| !self.config.similar_edges(&edges[0].edge, &edges[i].edge));
        let Some(cut) = cut else {
            return false;
        };
        let ig = &mut self.map.inter[gi];
        let mut unlinked = false;
        for e in &edges[cut..] {
            unlinked |= ig.unlink_edge(v0, e.other);
        }
        unlinked
    }

    /// Unlinks the runner-up edge if it flipped less often than the top one.
    fn unlink_edge_count(&mut self, gi: usize, v0: NodeKey, mut edges: Vec<EdgeRef>) -> bool {
        if edges.len() < 2 {
            return false;
        }
        edges.sort_by(|a, b| b.edge.count.cmp(&a.edge.count));
        edges[1].edge.count < edges[0].edge.count && self.map.inter[gi].unlink_edge(v0, edges[1].other)
    }

    /// Disambiguates through alternating paths.
    ///
    /// Paths are ranked by their best reachable weight; the weaker ones are
    /// unlinked when they are not similar to the best. Failing that, linked
    /// paths whose second vertex is already taken are unlinked, unless all
    /// of them are.
    fn unlink_alter_path(&mut self, gi: usize, v0: NodeKey, calc_sim: bool) -> bool {
        let level = if calc_sim {
            self.config.level_thresh
        } else {
            self.config.level_thresh + 1
        };
        let mut paths = alternating_paths(&self.map.inter[gi], v0, level);
        if paths.len() < 2 {
            return false;
        }

        let mut memo = BTreeMap::new();
        path_max(&mut paths, 0, None, &mut memo);
        paths.sort_by(|a, b| b[0].max_value.total_cmp(&a[0].max_value));

        let config = &self.config;
        let ig = &mut self.map.inter[gi];
        let best = paths[0][0].max_value;
        let cut = (1..paths.len()).find(|&pi| !calc_sim || !config.similar(best, paths[pi][0].max_value));
        if let Some(cut) = cut {
            let mut unlinked = false;
            for path in &paths[cut..] {
                unlinked |= unlink_path(ig, path);
            }
            return unlinked;
        }

        // connectivity
        let mut links = 0;
        let mut taken = Vec::new();
        for (pi, path) in paths.iter().enumerate() {
            if !path[0].edge_valid || path[0].link != LinkState::Linked || path.len() < 2 {
                continue;
            }
            links += 1;
            let v1 = path[1].vert;
            let busy = ig.graph.neighbors(v1).any(|n| {
                n != v0 && ig.graph.edge(v1, n).is_some_and(|e| e.link.is_linked())
            });
            if busy {
                taken.push(pi);
            }
        }
        if taken.len() < links {
            let mut unlinked = false;
            for pi in taken {
                unlinked |= unlink_path(ig, &paths[pi]);
            }
            return unlinked;
        }
        false
    }

    /// Finds the flip-count threshold separating settled from uncertain
    /// vertices of `frame` in graph `gi`.
    ///
    /// Looks for a first histogram peak, then a later peak separated from it
    /// by a valley clearly lower than the later peak; the valley's level is
    /// the threshold. Returns whether the first peak matches the one seen
    /// on the previous pass from this side, and the threshold (0 if none).
    pub(crate) fn get_segment(&mut self, frame: usize, gi: usize) -> (bool, u32) {
        let ig = &self.map.inter[gi];
        if ig.counter < 6 {
            return (false, 0);
        }
        let hist = uncertain_histogram(ig, frame, self.map.frames[frame].vertices.keys().copied());

        let mut idx_max = 0;
        let mut count_max = 0;
        for (i, bin) in hist.iter().enumerate() {
            if bin.count > count_max {
                count_max = bin.count;
                idx_max = i;
            }
        }
        if count_max == 0 {
            return (false, 0);
        }
        let major = hist[idx_max];

        let count_thresh = loop {
            let mut peak2: Option<usize> = None;
            let mut count_max2 = 0;
            for i in idx_max + 1..hist.len() {
                if hist[i].count <= hist[i - 1].count {
                    continue;
                }
                if hist[i].count > count_max2 {
                    count_max2 = hist[i].count;
                    peak2 = Some(i);
                }
            }
            let Some(idx_max2) = peak2 else {
                return (false, 0);
            };

            let mut count_min = count_max;
            let mut valley = None;
            for i in idx_max + 1..idx_max2 {
                if hist[i].count < count_min {
                    count_min = hist[i].count;
                    valley = Some(i);
                }
            }
            match valley {
                Some(v) if !similar_count(count_max2, count_min) => break hist[v].level,
                _ => idx_max = idx_max2,
            }
        };

        let ig = &mut self.map.inter[gi];
        let side = usize::from(frame != ig.index);
        let converge = ig.major_bins[side] == Some(major);
        ig.major_bins[side] = Some(major);
        (converge, count_thresh)
    }

    /// Last resort for a congested vertex: merge its neighbors or split it.
    fn unlink_segment(
        &mut self,
        gi: usize,
        v0: NodeKey,
        linked: &[NodeKey],
        calc_sim: bool,
        segment: bool,
        seg_count_min: u32,
    ) -> Result<bool, TrackError> {
        let (merge, split) = (self.config.merge, self.config.split);
        if !merge && !split {
            return Ok(false);
        }
        let major_converge = self.pass.major_converge;
        if !major_converge && !segment {
            return Ok(false);
        }
        let neighbors = if major_converge && !segment {
            if !calc_sim {
                return Ok(false);
            }
            linked.to_vec()
        } else {
            uncertain_neighbors(&self.map.inter[gi], v0, seg_count_min)
        };

        let mut result = false;
        if merge {
            result = self.merge_edges(&neighbors)?;
        }
        if !result && split {
            result = self.split_vertex(v0, neighbors.len())?;
        }
        Ok(result)
    }
}
