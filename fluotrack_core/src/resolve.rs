//! Merge and split resolution.
//!
//! Right after two frames are linked, `resolve_graph` looks at the cells
//! each vertex overlaps in the other frame and merges the ones in strong
//! contact into one vertex. During relaxation, `merge_edges` and
//! `split_vertex` use the clustering backends to decide whether a
//! congested vertex's neighbors are one blob, or the vertex is two.

use crate::cell::Cell;
use crate::error::TrackError;
use crate::graph::{ContactEdge, InterGraph, NodeKey};
use crate::consistent::new_cell_id;
use crate::processor::TrackMapProcessor;
use crate::track_map::FrameData;
use fluotrack_env::{ClusterPoint, EnvError, Partition, VolumeCache};
use nalgebra::Point3;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// A voxel as a clustering point, with its current label and linear index.
pub(crate) type VoxelSample = (ClusterPoint, u32, usize);

// ============================================================================
// CELL GROUPING
// ============================================================================

/// Contact covers more than `thresh` of either cell.
fn strong_contact(edge: &ContactEdge, c1: &Cell, c2: &Cell, thresh: f64) -> bool {
    let ratio = |c: &Cell| {
        if c.size_ui == 0 {
            0.0
        } else {
            edge.size_d / f64::from(c.size_ui)
        }
    };
    ratio(c1) > thresh || ratio(c2) > thresh
}

fn add_single(bins: &mut Vec<Vec<u32>>, cell: u32) -> bool {
    if bins.iter().any(|b| b.contains(&cell)) {
        return false;
    }
    bins.push(vec![cell]);
    true
}

/// A cell may join a bin only if it is at least three times the size of
/// every member other than `anchor`.
fn dominates_bin(frame: &FrameData, cell: u32, bin: &[u32], anchor: u32) -> bool {
    let Some(size) = frame.cells.get(&cell).map(|c| f64::from(c.size_ui)) else {
        return false;
    };
    bin.iter()
        .filter(|&&c| c != anchor)
        .filter_map(|c| frame.cells.get(c))
        .all(|member| size >= f64::from(member.size_ui) * 3.0)
}

fn add_pair(bins: &mut Vec<Vec<u32>>, frame: &FrameData, c1: u32, c2: u32) -> bool {
    for bin in bins.iter_mut() {
        let (has1, has2) = (bin.contains(&c1), bin.contains(&c2));
        match (has1, has2) {
            (true, true) => return true,
            (true, false) => {
                if dominates_bin(frame, c2, bin, c1) {
                    bin.push(c2);
                    return true;
                }
                return false;
            }
            (false, true) => {
                if dominates_bin(frame, c1, bin, c2) {
                    bin.push(c1);
                    return true;
                }
                return false;
            }
            (false, false) => {}
        }
    }
    bins.push(vec![c1, c2]);
    true
}

/// Partitions `cells` into bins of cells that should share a vertex.
///
/// Cells in strong contact with each other are binned together; every
/// other cell gets a bin of its own. Returns the bins and whether any
/// pair was grouped.
pub(crate) fn group_cells(cells: &[u32], frame: &FrameData, contact_thresh: f64) -> (Vec<Vec<u32>>, bool) {
    let mut bins: Vec<Vec<u32>> = Vec::new();
    let mut grouped = false;
    for &cid in cells {
        let Some(cell) = frame.cells.get(&cid) else {
            continue;
        };
        if !frame.intra.contains_node(cid) {
            add_single(&mut bins, cid);
            continue;
        }
        let mut added = false;
        for other in frame.intra.neighbors(cid) {
            if !cells.contains(&other) {
                continue;
            }
            let (Some(edge), Some(other_cell)) = (frame.intra.edge(cid, other), frame.cells.get(&other)) else {
                continue;
            };
            if edge.size_ui == 0 {
                continue;
            }
            if strong_contact(edge, cell, other_cell, contact_thresh) {
                added = add_pair(&mut bins, frame, cid, other);
                grouped |= added;
            }
        }
        if !added {
            add_single(&mut bins, cid);
        }
    }
    (bins, grouped)
}

/// Folds vertex `from` into `into` within one link graph.
///
/// Edges move over, summing overlap and counts where `into` already has
/// an edge to the same neighbor. The node count is added once, or zeroed
/// with `reset`.
pub(crate) fn relink_inter_graph(ig: &mut InterGraph, from: NodeKey, into: NodeKey, reset: bool) -> bool {
    if !ig.graph.contains_node(from) {
        return false;
    }
    ig.graph.ensure_node(into, Default::default);
    ig.graph.merge_node(
        from,
        into,
        |node, old| {
            if reset {
                node.count = 0;
            } else {
                node.count += old.count;
            }
        },
        |edge, old| {
            edge.size_ui += old.size_ui;
            edge.size_d += old.size_d;
            edge.count += old.count;
        },
    )
}

impl<C> TrackMapProcessor<C>
where
    C: VolumeCache,
{
    /// Merges cells of `f2` that a vertex of `f1` overlaps and that are in
    /// strong contact with each other.
    pub fn resolve_graph(&mut self, f1: usize, f2: usize) -> Result<(), TrackError> {
        self.check_linked_pair(f1, f2)?;
        let gi = f1.min(f2);
        let ids: Vec<u32> = self.map.frames[f1].vertices.keys().copied().collect();
        let mut merged = 0;

        for vid in ids {
            let key = NodeKey::new(f1, vid);
            let ig = &self.map.inter[gi];
            if !ig.graph.contains_node(key) {
                continue;
            }
            let frame2 = &self.map.frames[f2];
            let mut cells = Vec::new();
            for n in ig.graph.neighbors(key) {
                if let Some(v) = frame2.vertices.get(&n.id) {
                    cells.extend(v.cells.iter().copied());
                }
            }
            let (bins, grouped) = group_cells(&cells, frame2, self.config.contact_thresh);
            if !grouped {
                continue;
            }
            for bin in bins {
                if self.merge_cells(f2, &bin) {
                    merged += 1;
                }
            }
        }
        if merged > 0 {
            debug!("Resolved frame {} against {}: {} merges", f2, f1, merged);
        }
        Ok(())
    }

    /// Moves every cell of `bin` into the vertex of its first cell.
    ///
    /// Absorbed vertices are folded into the keeper in both adjacent link
    /// graphs and removed. Returns false for bins of fewer than two cells.
    pub(crate) fn merge_cells(&mut self, frame: usize, bin: &[u32]) -> bool {
        if bin.len() < 2 || frame >= self.map.frame_count() {
            return false;
        }
        let data = &self.map.frames[frame];
        let Some(keeper) = bin.iter().find_map(|c| data.cells.get(c).and_then(|c| c.vertex)) else {
            return false;
        };
        let into = NodeKey::new(frame, keeper);

        let mut absorbed = BTreeSet::new();
        for cid in bin {
            let Some(vid) = self.map.frames[frame].cells.get(cid).and_then(|c| c.vertex) else {
                continue;
            };
            if vid == keeper || absorbed.contains(&vid) {
                continue;
            }
            let Some(vertex) = self.map.frames[frame].vertices.remove(&vid) else {
                continue;
            };
            let from = NodeKey::new(frame, vid);
            for gi in self.map.adjacent_graphs(frame) {
                relink_inter_graph(&mut self.map.inter[gi], from, into, false);
            }
            let data = &mut self.map.frames[frame];
            for c in &vertex.cells {
                if let Some(cell) = data.cells.get_mut(c) {
                    cell.vertex = Some(keeper);
                }
            }
            if let Some(v0) = data.vertices.get_mut(&keeper) {
                v0.cells.extend(vertex.cells.iter().copied());
            }
            absorbed.insert(vid);
        }
        self.map.frames[frame].update_vertex(keeper);
        !absorbed.is_empty()
    }

    /// Merges the vertices behind `neighbors` (all in one frame) if their
    /// voxels form a single dense cluster.
    pub(crate) fn merge_edges(&mut self, neighbors: &[NodeKey]) -> Result<bool, TrackError> {
        if neighbors.len() < 2 {
            return Ok(false);
        }
        let frame = neighbors[0].frame;
        let data = &self.map.frames[frame];
        let cells: Vec<u32> = neighbors
            .iter()
            .filter_map(|n| data.vertices.get(&n.id))
            .flat_map(|v| v.cells.iter().copied())
            .collect();
        if cells.is_empty() || !self.cluster_cells_merge(&cells, frame)? {
            return Ok(false);
        }
        self.merge_cells(frame, &cells);
        info!("Merged {} vertices in frame {}", neighbors.len(), frame);
        Ok(true)
    }

    /// Splits vertex `key` into `clnum` vertices by clustering its voxels.
    ///
    /// A vertex is only ever split once. The new cells replace the old ones
    /// in the map and the label buffer, and are linked to both neighbor
    /// frames.
    pub fn split_vertex(&mut self, key: NodeKey, clnum: usize) -> Result<bool, TrackError> {
        let frame = key.frame;
        if clnum < 2 {
            return Ok(false);
        }
        let Some(vertex) = self.map.frames.get_mut(frame).and_then(|d| d.vertices.get_mut(&key.id)) else {
            return Ok(false);
        };
        if vertex.split {
            return Ok(false);
        }
        vertex.split = true;
        let old_cells: Vec<u32> = vertex.cells.iter().copied().collect();

        let Some(new_cells) = self.cluster_cells_split(&old_cells, frame, clnum)? else {
            return Ok(false);
        };
        let ids: Vec<u32> = new_cells.iter().map(|c| c.id).collect();
        self.remove_cells(frame, &old_cells)?;
        self.add_cells(frame, new_cells)?;
        if frame > 0 {
            self.link_added_cells(&ids, frame, frame - 1)?;
        }
        self.link_added_cells(&ids, frame, frame + 1)?;
        info!("Split vertex {} into {:?}", key, ids);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Cell list edits
    // ------------------------------------------------------------------

    /// Adds cells to `frame`, each with its own vertex. Ids already used by
    /// a cell or vertex of the frame are skipped. Returns how many were
    /// added.
    pub fn add_cells(&mut self, frame: usize, cells: Vec<Cell>) -> Result<usize, TrackError> {
        self.check_frame(frame)?;
        let data = &mut self.map.frames[frame];
        let mut added = 0;
        for cell in cells {
            if cell.id == 0 || data.cells.contains_key(&cell.id) || data.vertices.contains_key(&cell.id) {
                continue;
            }
            data.insert_cell_with_vertex(frame, cell);
            added += 1;
        }
        self.map.touch();
        Ok(added)
    }

    /// Removes cells from `frame` along with their contacts. A vertex left
    /// without cells is removed from the frame and from both link graphs.
    pub fn remove_cells(&mut self, frame: usize, ids: &[u32]) -> Result<usize, TrackError> {
        self.check_frame(frame)?;
        let mut removed = 0;
        let mut emptied = Vec::new();
        {
            let data = &mut self.map.frames[frame];
            for id in ids {
                let Some(cell) = data.cells.remove(id) else {
                    continue;
                };
                data.intra.remove_node(*id);
                removed += 1;
                let Some(vid) = cell.vertex else { continue };
                if let Some(v) = data.vertices.get_mut(&vid) {
                    v.cells.remove(id);
                    if v.cells.is_empty() {
                        data.vertices.remove(&vid);
                        emptied.push(vid);
                    } else {
                        data.update_vertex(vid);
                    }
                }
            }
        }
        for vid in emptied {
            for gi in self.map.adjacent_graphs(frame) {
                self.map.inter[gi].graph.remove_node(NodeKey::new(frame, vid));
            }
        }
        self.map.touch();
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Clustering glue
    // ------------------------------------------------------------------

    /// Samples of every voxel of `cells` in `frame`, paired with the label
    /// they carry and their linear index.
    pub(crate) fn cell_points(
        &mut self,
        frame: usize,
        cells: &[u32],
        spacing: [f64; 3],
    ) -> Result<Vec<VoxelSample>, TrackError> {
        self.cache.load(frame)?;
        let view = self.cache.frame(frame).ok_or(EnvError::CacheMiss(frame))?;
        let dims = self.map.info.dims;
        let scale = self.map.info.scale;
        let data = &self.map.frames[frame];
        let mut points = Vec::new();
        for &cid in cells {
            let Some(cell) = data.cells.get(&cid) else { continue };
            let Some((lo, hi)) = cell.bbox.voxel_range([dims.nx, dims.ny, dims.nz]) else {
                continue;
            };
            for k in lo[2]..=hi[2] {
                for j in lo[1]..=hi[1] {
                    for i in lo[0]..=hi[0] {
                        let index = dims.index(i, j, k);
                        if view.labels.get(index) != Some(&cid) {
                            continue;
                        }
                        let value = view.intensity.value(index, scale);
                        let voxel = [i as u32, j as u32, k as u32];
                        points.push((ClusterPoint::new(voxel, spacing, value), cid, index));
                    }
                }
            }
        }
        Ok(points)
    }

    /// True when the voxels of `cells` form exactly one dense cluster.
    fn cluster_cells_merge(&mut self, cells: &[u32], frame: usize) -> Result<bool, TrackError> {
        let samples = self.cell_points(frame, cells, [1.0; 3])?;
        if samples.is_empty() {
            return Ok(false);
        }
        let points: Vec<ClusterPoint> = samples.iter().map(|s| s.0).collect();
        match self.merge_clusterer.cluster(&points, None) {
            Ok(partition) => Ok(partition.clusters == 1),
            Err(EnvError::Clustering(msg)) => {
                debug!("Merge check in frame {} skipped: {}", frame, msg);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Clusters the voxels of `cells` into `clnum` new cells and writes
    /// their ids into the label buffer. Returns `None` when the split is
    /// not confident.
    fn cluster_cells_split(
        &mut self,
        cells: &[u32],
        frame: usize,
        clnum: usize,
    ) -> Result<Option<Vec<Cell>>, TrackError> {
        let spacing = self.map.info.spacing;
        let samples = self.cell_points(frame, cells, spacing)?;
        let points: Vec<ClusterPoint> = samples.iter().map(|s| s.0).collect();
        let partition = match self.split_clusterer.cluster(&points, Some(clnum)) {
            Ok(p) if p.clusters >= 2 => p,
            Ok(_) => return Ok(None),
            Err(EnvError::Clustering(msg)) => {
                debug!("Split in frame {} skipped: {}", frame, msg);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        self.apply_partition(frame, cells, &samples, &partition)
    }

    /// Turns a partition of `samples` into new cells of `frame` and
    /// rewrites the label buffer. Unassigned voxels are cleared.
    ///
    /// Each cluster keeps the id of the old cell contributing most of its
    /// voxels when that id is still free, otherwise takes a fresh one.
    pub(crate) fn apply_partition(
        &mut self,
        frame: usize,
        cells: &[u32],
        samples: &[VoxelSample],
        partition: &Partition,
    ) -> Result<Option<Vec<Cell>>, TrackError> {
        let mut taken: BTreeSet<u32> = self.map.frames[frame]
            .cells
            .keys()
            .copied()
            .filter(|id| !cells.contains(id))
            .collect();
        let mut ids = Vec::with_capacity(partition.clusters);
        for c in 0..partition.clusters {
            let mut votes: BTreeMap<u32, usize> = BTreeMap::new();
            for i in partition.members(c) {
                *votes.entry(samples[i].1).or_default() += 1;
            }
            let Some((&base, _)) = votes.iter().max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0))) else {
                return Ok(None);
            };
            let id = if taken.contains(&base) {
                match new_cell_id(base, true, |id| taken.contains(&id)) {
                    Some(id) => id,
                    None => return Ok(None),
                }
            } else {
                base
            };
            taken.insert(id);
            ids.push(id);
        }

        let scale = self.map.info.scale;
        let mut new_cells: Vec<Cell> = ids.iter().map(|&id| Cell::new(id)).collect();
        let view = self.cache.frame_mut(frame).ok_or(EnvError::CacheMiss(frame))?;
        for ((point, _, index), label) in samples.iter().zip(&partition.labels) {
            match label {
                Some(c) => {
                    view.labels[*index] = ids[*c];
                    let [i, j, k] = point.voxel;
                    let p = Point3::new(f64::from(i), f64::from(j), f64::from(k));
                    new_cells[*c].inc(p, view.intensity.value(*index, scale));
                }
                None => view.labels[*index] = 0,
            }
        }
        self.cache.mark_modified(frame);
        Ok(Some(new_cells))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{InterNode, LinkEdge, LinkState};
    use crate::processor::TrackConfig;
    use crate::test_support::{
        block_frame, linked_processor, processor_with_config, set_inter_edge, synthetic_cell, synthetic_processor, Frame,
    };
    use fluotrack_env::InMemoryCache;

    #[test]
    fn test_group_cells_needs_strong_contact() {
        let mut proc = synthetic_processor(&[&[(1, [0.0; 3], 100), (2, [5.0, 0.0, 0.0], 100), (3, [20.0, 0.0, 0.0], 100)]]);
        let data = &mut proc.map.frames[0];
        data.intra.set_edge(1, 2, ContactEdge { size_ui: 90, size_d: 80.0, ..Default::default() });
        data.intra.set_edge(2, 3, ContactEdge { size_ui: 10, size_d: 8.0, ..Default::default() });

        let (bins, grouped) = group_cells(&[1, 2, 3], &proc.map.frames[0], 0.6);
        assert!(grouped);
        assert_eq!(bins, vec![vec![1, 2], vec![3]]);
    }

    #[test]
    fn test_bin_joins_only_dominant_cell() {
        let mut proc = synthetic_processor(&[&[(1, [0.0; 3], 100), (2, [5.0, 0.0, 0.0], 100), (3, [9.0, 0.0, 0.0], 1000)]]);
        let data = &mut proc.map.frames[0];
        for (a, b) in [(1, 2), (2, 3)] {
            data.intra.set_edge(a, b, ContactEdge { size_ui: 90, size_d: 90.0, ..Default::default() });
        }
        let (bins, _) = group_cells(&[1, 2, 3], &proc.map.frames[0], 0.6);
        // cell 3 is 10x cell 1, so it may join the bin anchored on 2
        assert_eq!(bins, vec![vec![1, 2, 3]]);

        proc.map.frames[0].cells.get_mut(&3).unwrap().size_ui = 200;
        let (bins, _) = group_cells(&[1, 2, 3], &proc.map.frames[0], 0.6);
        assert_eq!(bins, vec![vec![1, 2], vec![3]]);
    }

    #[test]
    fn test_relink_sums_shared_edges() {
        let mut ig = InterGraph::new(0);
        let (a, b, n) = (NodeKey::new(1, 1), NodeKey::new(1, 2), NodeKey::new(0, 9));
        ig.graph.add_node(a, InterNode { count: 2 });
        ig.graph.add_node(b, InterNode { count: 3 });
        ig.graph.add_node(n, InterNode::default());
        let edge = LinkEdge { size_ui: 10, size_d: 5.0, link: LinkState::Linked, count: 1, ..Default::default() };
        ig.graph.set_edge(a, n, edge);
        ig.graph.set_edge(b, n, edge);

        assert!(relink_inter_graph(&mut ig, b, a, false));
        assert!(!ig.graph.contains_node(b));
        assert_eq!(ig.node_count(a), 5);
        let merged = ig.graph.edge(a, n).unwrap();
        assert_eq!(merged.size_ui, 20);
        assert_eq!(merged.count, 2);

        assert!(!relink_inter_graph(&mut ig, b, a, true));
    }

    #[test]
    fn test_merge_cells_folds_vertices() {
        let mut proc = synthetic_processor(&[
            &[(1, [0.0; 3], 100)],
            &[(10, [0.0; 3], 100), (11, [5.0, 0.0, 0.0], 50)],
        ]);
        set_inter_edge(&mut proc, 0, 1, 10, 60.0, LinkState::Linked);
        set_inter_edge(&mut proc, 0, 1, 11, 40.0, LinkState::Linked);

        assert!(proc.merge_cells(1, &[10, 11]));
        let data = proc.map().frame(1).unwrap();
        assert!(data.vertex(11).is_none());
        let v = data.vertex(10).unwrap();
        assert_eq!(v.cells.iter().copied().collect::<Vec<_>>(), vec![10, 11]);
        assert_eq!(v.size_ui, 150);
        assert_eq!(data.cell(11).unwrap().vertex, Some(10));

        let ig = &proc.map().inter[0];
        assert_eq!(ig.linked_valence(NodeKey::new(0, 1)), 1);
        assert_eq!(ig.graph.edge(NodeKey::new(0, 1), NodeKey::new(1, 10)).unwrap().size_d, 100.0);
        assert!(!proc.merge_cells(1, &[10]));
    }

    #[test]
    fn test_resolve_graph_merges_touching_cells() {
        // one cell in frame 0 covering two bright, tightly touching halves
        let f0 = block_frame(&[(1, [2, 2, 2], 6)], 250);
        let f1 = block_frame(&[(5, [2, 2, 2], 6), (6, [5, 2, 2], 3)], 250);
        let mut proc = linked_processor(vec![f0, f1]);
        assert_eq!(proc.map().inter[0].linked_valence(NodeKey::new(0, 1)), 2);

        proc.resolve_graph(0, 1).unwrap();
        let data = proc.map().frame(1).unwrap();
        assert_eq!(data.vertices().len(), 1);
        assert_eq!(data.vertex_of_cell(6).unwrap().id, 5);
        assert_eq!(proc.map().inter[0].linked_valence(NodeKey::new(0, 1)), 1);
    }

    #[test]
    fn test_remove_and_add_cells() {
        let mut proc = synthetic_processor(&[&[(1, [0.0; 3], 100)], &[(10, [0.0; 3], 100)]]);
        set_inter_edge(&mut proc, 0, 1, 10, 60.0, LinkState::Linked);

        assert_eq!(proc.remove_cells(1, &[10, 99]).unwrap(), 1);
        assert!(proc.map().frame(1).unwrap().vertex(10).is_none());
        assert!(!proc.map().inter[0].graph.contains_node(NodeKey::new(1, 10)));

        let added = proc
            .add_cells(1, vec![synthetic_cell(12, [0.0; 3], 80), synthetic_cell(1, [4.0; 3], 30)])
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(proc.add_cells(1, vec![Cell::new(12)]).unwrap(), 0);
        assert!(proc.remove_cells(5, &[1]).is_err());
    }

    #[test]
    fn test_split_vertex_separates_blobs() {
        let config = TrackConfig {
            split: true,
            ..Default::default()
        };
        let f0 = block_frame(&[(1, [1, 1, 1], 4), (2, [11, 1, 1], 4)], 200);
        let f1 = block_frame(&[(3, [1, 1, 1], 4), (4, [11, 1, 1], 4)], 200);
        let mut proc = processor_with_config(vec![f0, f1], config);
        proc.initialize_frame(0).unwrap();
        proc.initialize_frame(1).unwrap();
        proc.link_frames(0, 1).unwrap();
        // pretend 3 and 4 were wrongly merged into one vertex
        assert!(proc.merge_cells(1, &[3, 4]));
        let before = proc.map().frame(1).unwrap().vertex(3).unwrap().cells.clone();

        assert!(proc.split_vertex(NodeKey::new(1, 3), 2).unwrap());
        let data = proc.map().frame(1).unwrap();
        assert_eq!(data.vertices().len(), 2);
        let after: BTreeSet<u32> = data.vertices().values().flat_map(|v| v.cells.iter().copied()).collect();
        assert_eq!(after, before);

        let ig = &proc.map().inter[0];
        assert_eq!(ig.linked_neighbors(NodeKey::new(0, 1)), vec![NodeKey::new(1, 3)]);
        assert_eq!(ig.linked_neighbors(NodeKey::new(0, 2)), vec![NodeKey::new(1, 4)]);
    }

    #[test]
    fn test_split_vertex_runs_once() {
        let mut proc = synthetic_processor(&[&[(1, [4.0; 3], 100)]]);
        assert!(!proc.split_vertex(NodeKey::new(0, 1), 1).unwrap());
        proc.map.frames[0].vertices.get_mut(&1).unwrap().split = true;
        assert!(!proc.split_vertex(NodeKey::new(0, 1), 2).unwrap());
        assert!(!proc.split_vertex(NodeKey::new(0, 9), 2).unwrap());
    }

    fn merge_split_processor(f0: Frame, f1: Frame, merge: bool, split: bool) -> TrackMapProcessor<InMemoryCache> {
        let config = TrackConfig {
            merge,
            split,
            ..Default::default()
        };
        let mut proc = processor_with_config(vec![f0, f1], config);
        proc.initialize_frame(0).unwrap();
        proc.initialize_frame(1).unwrap();
        proc.link_frames(0, 1).unwrap();
        proc
    }

    #[test]
    fn test_relaxation_merges_fragmented_cell() {
        // equal halves, so neither overlap outweighs the other
        let f0 = block_frame(&[(1, [2, 2, 2], 3), (1, [5, 2, 2], 3)], 200);
        let f1 = block_frame(&[(5, [2, 2, 2], 3), (6, [5, 2, 2], 3)], 200);
        let mut proc = merge_split_processor(f0, f1, true, false);
        let v = NodeKey::new(0, 1);
        assert_eq!(proc.map().inter[0].linked_valence(v), 2);
        proc.map.inter[0].graph.node_mut(v).unwrap().count = 1;

        proc.process_frames(0, 1).unwrap();
        let data = proc.map().frame(1).unwrap();
        assert_eq!(data.vertices().len(), 1);
        assert_eq!(data.vertex_of_cell(6).unwrap().id, 5);
        assert_eq!(data.vertex(5).unwrap().size_ui, 54);
        let ig = &proc.map().inter[0];
        assert_eq!(ig.linked_neighbors(v), vec![NodeKey::new(1, 5)]);
        assert_eq!(ig.graph.edge(v, NodeKey::new(1, 5)).unwrap().size_ui, 54);
    }

    #[test]
    fn test_relaxation_needs_flips_to_merge() {
        let f0 = block_frame(&[(1, [2, 2, 2], 3), (1, [5, 2, 2], 3)], 200);
        let f1 = block_frame(&[(5, [2, 2, 2], 3), (6, [5, 2, 2], 3)], 200);
        let mut proc = merge_split_processor(f0, f1, true, false);

        // a vertex that never flipped is not uncertain yet
        proc.process_frames(0, 1).unwrap();
        assert_eq!(proc.map().frame(1).unwrap().vertices().len(), 2);
        assert_eq!(proc.map().inter[0].linked_valence(NodeKey::new(0, 1)), 2);
    }

    #[test]
    fn test_relaxation_splits_when_merge_fails() {
        // one label over two separate blobs, each matching its own cell
        let f0 = block_frame(&[(1, [1, 1, 1], 4), (1, [11, 1, 1], 4)], 200);
        let f1 = block_frame(&[(3, [1, 1, 1], 4), (4, [11, 1, 1], 4)], 200);
        let mut proc = merge_split_processor(f0, f1, true, true);
        let v = NodeKey::new(0, 1);
        assert_eq!(proc.map().inter[0].linked_valence(v), 2);
        proc.map.inter[0].graph.node_mut(v).unwrap().count = 1;

        proc.process_frames(0, 1).unwrap();
        // the blobs are apart, so frame 1 keeps both cells
        assert_eq!(proc.map().frame(1).unwrap().vertices().len(), 2);

        let data = proc.map().frame(0).unwrap();
        assert_eq!(data.vertices().len(), 2);
        assert!(data.vertices().values().all(|v| v.size_ui == 64));
        let ig = &proc.map().inter[0];
        let mut targets: Vec<NodeKey> = data
            .vertices()
            .keys()
            .map(|&id| {
                let linked = ig.linked_neighbors(NodeKey::new(0, id));
                assert_eq!(linked.len(), 1);
                linked[0]
            })
            .collect();
        targets.sort();
        assert_eq!(targets, vec![NodeKey::new(1, 3), NodeKey::new(1, 4)]);
        assert_eq!(ig.counter, 1);
    }
}

