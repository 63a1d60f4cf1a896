//! User-driven edits.
//!
//! Forced links, unlinks and isolation work on vertices or on the
//! vertices owning a list of cells. Cell edits (combine, rename, segment)
//! keep the label buffer in step with the map.

use crate::clustering::KMeans;
use crate::consistent::largest_cell;
use crate::error::TrackError;
use crate::graph::{InterGraph, LinkEdge, NodeKey};
use crate::processor::TrackMapProcessor;
use crate::resolve::relink_inter_graph;
use fluotrack_env::{ClusterPoint, EnvError, NullProgress, PointClusterer, VolumeCache};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

impl<C> TrackMapProcessor<C>
where
    C: VolumeCache,
{
    /// Link graph for an adjacent pair, created when it is the next one
    /// missing.
    fn graph_for_edit(&mut self, f1: usize, f2: usize) -> Result<&mut InterGraph, TrackError> {
        self.check_pair(f1, f2)?;
        let index = f1.min(f2);
        if index == self.map.inter.len() {
            self.map.inter.push(InterGraph::new(index));
        }
        self.map.inter.get_mut(index).ok_or(TrackError::MissingGraph(index))
    }

    /// Vertices owning `cells` in `frame`, without repeats.
    fn vertices_of_cells(&self, frame: usize, cells: &[u32]) -> BTreeSet<u32> {
        let data = &self.map.frames[frame];
        cells
            .iter()
            .filter_map(|&c| data.vertex_of_cell(c))
            .map(|v| v.id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Vertex edits
    // ------------------------------------------------------------------

    /// Force-links vertex `v1` of `f1` to vertex `v2` of `f2`.
    ///
    /// The edge weighs as much as the larger vertex, so relaxation ranks it
    /// with the strongest overlaps. Automatic passes never undo it.
    pub fn force_vertices(&mut self, f1: usize, v1: u32, f2: usize, v2: u32) -> Result<bool, TrackError> {
        self.check_pair(f1, f2)?;
        let (Some(a), Some(b)) = (self.map.frames[f1].vertex(v1), self.map.frames[f2].vertex(v2)) else {
            return Ok(false);
        };
        let edge = LinkEdge {
            size_ui: a.size_ui.max(b.size_ui),
            size_d: a.size_d.max(b.size_d),
            dist: a.distance(b),
            ..Default::default()
        };
        self.graph_for_edit(f1, f2)?
            .force(NodeKey::new(f1, v1), NodeKey::new(f2, v2), edge);
        self.map.touch();
        Ok(true)
    }

    /// Sets the edge between two vertices to unlinked, forced or not.
    pub fn unlink_vertices(&mut self, f1: usize, v1: u32, f2: usize, v2: u32) -> Result<bool, TrackError> {
        self.check_linked_pair(f1, f2)?;
        let severed = self
            .map
            .inter_between_mut(f1, f2)
            .is_some_and(|ig| ig.sever(NodeKey::new(f1, v1), NodeKey::new(f2, v2)));
        if severed {
            self.map.touch();
        }
        Ok(severed)
    }

    /// Drops the soft links of a vertex toward both neighbor frames.
    pub fn isolate_vertex(&mut self, frame: usize, vid: u32) -> Result<bool, TrackError> {
        self.check_frame(frame)?;
        let key = NodeKey::new(frame, vid);
        let mut isolated = false;
        for gi in self.map.adjacent_graphs(frame) {
            isolated |= self.map.inter[gi].isolate(key);
        }
        Ok(isolated)
    }

    // ------------------------------------------------------------------
    // Cell-list edits
    // ------------------------------------------------------------------

    /// Force-links every vertex owning `cells1` in `f1` to every vertex
    /// owning `cells2` in `f2`.
    ///
    /// With `exclusive`, their other soft links in this pair are dropped
    /// first. Returns false when either side has no vertex.
    pub fn link_cells(
        &mut self,
        f1: usize,
        cells1: &[u32],
        f2: usize,
        cells2: &[u32],
        exclusive: bool,
    ) -> Result<bool, TrackError> {
        self.check_pair(f1, f2)?;
        let list1 = self.vertices_of_cells(f1, cells1);
        let list2 = self.vertices_of_cells(f2, cells2);
        if list1.is_empty() || list2.is_empty() {
            return Ok(false);
        }
        if exclusive {
            let ig = self.graph_for_edit(f1, f2)?;
            for &v in &list1 {
                ig.isolate(NodeKey::new(f1, v));
            }
            for &v in &list2 {
                ig.isolate(NodeKey::new(f2, v));
            }
        }
        for &v1 in &list1 {
            for &v2 in &list2 {
                self.force_vertices(f1, v1, f2, v2)?;
            }
        }
        info!("Linked {:?}@{} to {:?}@{}", list1, f1, list2, f2);
        Ok(true)
    }

    /// Isolates the vertices owning `cells` in `frame`.
    pub fn isolate_cells(&mut self, frame: usize, cells: &[u32]) -> Result<bool, TrackError> {
        self.check_frame(frame)?;
        let list = self.vertices_of_cells(frame, cells);
        if list.is_empty() {
            return Ok(false);
        }
        for vid in list {
            self.isolate_vertex(frame, vid)?;
        }
        Ok(true)
    }

    /// Unlinks every vertex owning `cells1` in `f1` from every vertex
    /// owning `cells2` in `f2`.
    pub fn unlink_cells(&mut self, f1: usize, cells1: &[u32], f2: usize, cells2: &[u32]) -> Result<bool, TrackError> {
        self.check_linked_pair(f1, f2)?;
        let list1 = self.vertices_of_cells(f1, cells1);
        let list2 = self.vertices_of_cells(f2, cells2);
        if list1.is_empty() || list2.is_empty() {
            return Ok(false);
        }
        for &v1 in &list1 {
            for &v2 in &list2 {
                self.unlink_vertices(f1, v1, f2, v2)?;
            }
        }
        Ok(true)
    }

    /// Folds `cells` into cell `keep`.
    ///
    /// The absorbed cells disappear from the map, their voxels are
    /// relabeled `keep`, and contacts move onto `keep`. A vertex left
    /// empty is folded into `keep`'s vertex in both link graphs with its
    /// flip count reset.
    pub fn combine_cells(&mut self, frame: usize, keep: u32, cells: &[u32]) -> Result<bool, TrackError> {
        self.check_frame(frame)?;
        let Some(vertex0) = self.map.frames[frame].cell(keep).map(|c| c.vertex) else {
            return Ok(false);
        };
        let absorbed: BTreeSet<u32> = cells
            .iter()
            .copied()
            .filter(|&c| c != keep && self.map.frames[frame].cells.contains_key(&c))
            .collect();
        if absorbed.is_empty() {
            return Ok(false);
        }

        self.cache.load(frame)?;
        let view = self.cache.frame_mut(frame).ok_or(EnvError::CacheMiss(frame))?;
        for label in view.labels.iter_mut() {
            if absorbed.contains(label) {
                *label = keep;
            }
        }
        self.cache.mark_modified(frame);

        let mut emptied = Vec::new();
        let data = &mut self.map.frames[frame];
        for &cid in &absorbed {
            let Some(cell) = data.cells.remove(&cid) else { continue };
            if let Some(c0) = data.cells.get_mut(&keep) {
                c0.absorb(&cell);
            }
            data.intra.merge_node(
                cid,
                keep,
                |_, _| {},
                |e, old| {
                    e.size_ui += old.size_ui;
                    e.size_d += old.size_d;
                },
            );
            data.intra.remove_node(cid);
            let Some(vid) = cell.vertex else { continue };
            if Some(vid) == vertex0 {
                if let Some(v) = data.vertices.get_mut(&vid) {
                    v.cells.remove(&cid);
                }
                continue;
            }
            if let Some(v) = data.vertices.get_mut(&vid) {
                v.cells.remove(&cid);
                if v.cells.is_empty() {
                    data.vertices.remove(&vid);
                    emptied.push(vid);
                } else {
                    data.update_vertex(vid);
                }
            }
        }
        if let Some(v0) = vertex0 {
            for vid in emptied {
                for gi in self.map.adjacent_graphs(frame) {
                    relink_inter_graph(&mut self.map.inter[gi], NodeKey::new(frame, vid), NodeKey::new(frame, v0), true);
                }
            }
            self.map.frames[frame].update_vertex(v0);
        }
        self.map.touch();
        debug!("Combined {:?} into cell {} in frame {}", absorbed, keep, frame);
        Ok(true)
    }

    /// Renames cell `old` to `new` in the map and the label buffer. The
    /// owning vertex is renamed too when it was named after `old`.
    pub fn replace_cell_id(&mut self, frame: usize, old: u32, new: u32) -> Result<bool, TrackError> {
        self.check_frame(frame)?;
        let data = &self.map.frames[frame];
        if new == 0 || !data.cells.contains_key(&old) || data.cells.contains_key(&new) {
            return Ok(false);
        }
        let mut vertex_map = BTreeMap::new();
        if data.vertex_of_cell(old).is_some_and(|v| v.id == old) && !data.vertices.contains_key(&new) {
            vertex_map.insert(old, new);
        }
        self.remap_frame(frame, &BTreeMap::from([(old, new)]), &vertex_map)?;
        Ok(true)
    }

    /// Names every vertex after its largest cell.
    pub fn reset_vertex_ids(&mut self) -> Result<(), TrackError> {
        for frame in 0..self.map.frame_count() {
            let data = &self.map.frames[frame];
            let vertex_map: BTreeMap<u32, u32> = data
                .vertices
                .values()
                .filter_map(|v| largest_cell(data, &v.cells).map(|c| (v.id, c)))
                .filter(|(a, b)| a != b)
                .collect();
            if !vertex_map.is_empty() {
                self.remap_frame(frame, &BTreeMap::new(), &vertex_map)?;
            }
        }
        Ok(())
    }

    /// Resets the pass and flip counters of every link graph.
    pub fn clear_counters(&mut self) {
        for ig in &mut self.map.inter {
            ig.clear_counters();
        }
    }

    /// Re-segments `cells` of `frame` into `clnum` cells with k-means,
    /// links the results to both neighbor frames and refines around
    /// `frame`.
    pub fn segment_cells(&mut self, frame: usize, cells: &[u32], clnum: usize) -> Result<bool, TrackError> {
        self.check_frame(frame)?;
        if clnum < 2 || cells.is_empty() {
            return Ok(false);
        }
        let spacing = self.map.info.spacing;
        let samples = self.cell_points(frame, cells, spacing)?;
        let points: Vec<ClusterPoint> = samples.iter().map(|s| s.0).collect();
        let mut kmeans = KMeans::new(self.config.cluster.max_iter, self.config.cluster.tolerance);
        let partition = match kmeans.cluster(&points, Some(clnum)) {
            Ok(p) => p,
            Err(EnvError::Clustering(msg)) => {
                debug!("Segmenting frame {} skipped: {}", frame, msg);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let Some(new_cells) = self.apply_partition(frame, cells, &samples, &partition)? else {
            return Ok(false);
        };

        let ids: Vec<u32> = new_cells.iter().map(|c| c.id).collect();
        self.remove_cells(frame, cells)?;
        self.add_cells(frame, new_cells)?;
        if frame > 0 {
            self.link_added_cells(&ids, frame, frame - 1)?;
        }
        self.link_added_cells(&ids, frame, frame + 1)?;
        info!("Segmented {:?} in frame {} into {:?}", cells, frame, ids);
        self.refine_map(Some(frame), &mut NullProgress)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::LinkState;
    use crate::test_support::{block_frame, linked_processor, set_inter_edge, synthetic_processor};

    fn two_by_two() -> TrackMapProcessor<fluotrack_env::InMemoryCache> {
        let mut proc = synthetic_processor(&[
            &[(1, [2.0; 3], 100), (2, [10.0; 3], 100)],
            &[(3, [2.0; 3], 100), (4, [10.0; 3], 100)],
        ]);
        set_inter_edge(&mut proc, 0, 1, 3, 50.0, LinkState::Linked);
        set_inter_edge(&mut proc, 0, 2, 4, 50.0, LinkState::Linked);
        proc
    }

    #[test]
    fn test_force_vertices_survives_relaxation() {
        let mut proc = two_by_two();
        assert!(proc.force_vertices(0, 1, 1, 4).unwrap());
        let ig = &proc.map().inter[0];
        let edge = ig.graph.edge(NodeKey::new(0, 1), NodeKey::new(1, 4)).unwrap();
        assert_eq!(edge.link, LinkState::Forced);
        assert!(edge.dist > 13.0);

        for _ in 0..3 {
            proc.process_frames(0, 1).unwrap();
            proc.process_frames(1, 0).unwrap();
        }
        let ig = &proc.map().inter[0];
        assert_eq!(ig.graph.edge(NodeKey::new(0, 1), NodeKey::new(1, 4)).unwrap().link, LinkState::Forced);
        assert!(!proc.force_vertices(0, 1, 1, 99).unwrap());
        assert!(proc.force_vertices(0, 1, 2, 4).is_err());
    }

    #[test]
    fn test_unlink_and_isolate() {
        let mut proc = two_by_two();
        assert!(proc.unlink_vertices(0, 1, 1, 3).unwrap());
        assert_eq!(proc.map().inter[0].linked_valence(NodeKey::new(0, 1)), 0);

        assert!(proc.isolate_vertex(1, 4).unwrap());
        assert_eq!(proc.map().inter[0].linked_valence(NodeKey::new(0, 2)), 0);
        assert!(!proc.isolate_vertex(1, 99).unwrap());
    }

    #[test]
    fn test_link_cells_exclusive() {
        let mut proc = two_by_two();
        assert!(proc.link_cells(0, &[1], 1, &[4], true).unwrap());
        let ig = &proc.map().inter[0];
        assert_eq!(ig.linked_neighbors(NodeKey::new(0, 1)), vec![NodeKey::new(1, 4)]);
        // the soft link 2-4 was dropped, 1-3 too
        assert_eq!(ig.linked_valence(NodeKey::new(0, 2)), 0);
        assert_eq!(ig.linked_valence(NodeKey::new(1, 3)), 0);

        assert!(!proc.link_cells(0, &[99], 1, &[4], false).unwrap());
    }

    #[test]
    fn test_link_cells_creates_missing_graph() {
        let mut proc = synthetic_processor(&[&[(1, [2.0; 3], 100)], &[(3, [2.0; 3], 100)]]);
        proc.map.inter.clear();
        assert!(proc.link_cells(1, &[3], 0, &[1], false).unwrap());
        assert_eq!(proc.map().linked_vertices(0, 1, 1), vec![3]);
    }

    #[test]
    fn test_unlink_and_isolate_cells() {
        let mut proc = two_by_two();
        assert!(proc.unlink_cells(0, &[1, 2], 1, &[3]).unwrap());
        assert_eq!(proc.map().inter[0].linked_valence(NodeKey::new(1, 3)), 0);
        assert!(proc.isolate_cells(1, &[4]).unwrap());
        assert_eq!(proc.map().inter[0].linked_valence(NodeKey::new(1, 4)), 0);
        assert!(!proc.isolate_cells(1, &[]).unwrap());
    }

    #[test]
    fn test_combine_cells_relabels_and_relinks() {
        let f0 = block_frame(&[(1, [1, 1, 1], 4), (2, [9, 1, 1], 4)], 200);
        let f1 = block_frame(&[(3, [1, 1, 1], 4), (4, [9, 1, 1], 4)], 200);
        let mut proc = linked_processor(vec![f0, f1]);

        assert!(proc.combine_cells(1, 3, &[4]).unwrap());
        let data = proc.map().frame(1).unwrap();
        assert!(data.cell(4).is_none());
        assert_eq!(data.cell(3).unwrap().size_ui, 128);
        assert_eq!(data.vertices().len(), 1);
        assert_eq!(data.vertex(3).unwrap().size_ui, 128);

        let mut linked = proc.map().inter[0].linked_neighbors(NodeKey::new(1, 3));
        linked.sort();
        assert_eq!(linked, vec![NodeKey::new(0, 1), NodeKey::new(0, 2)]);
        assert_eq!(proc.map().inter[0].node_count(NodeKey::new(1, 3)), 0);

        let labels = proc.cache().frame(1).unwrap().labels;
        assert!(!labels.contains(&4));
        assert!(!proc.combine_cells(1, 3, &[3]).unwrap());
    }

    #[test]
    fn test_replace_cell_id_renames_vertex() {
        let mut proc = two_by_two();
        assert!(proc.replace_cell_id(1, 3, 30).unwrap());
        let data = proc.map().frame(1).unwrap();
        assert!(data.cell(3).is_none());
        assert_eq!(data.vertex_of_cell(30).unwrap().id, 30);
        assert_eq!(proc.map().linked_vertices(0, 1, 1), vec![30]);
        assert!(!proc.replace_cell_id(1, 30, 4).unwrap());
        assert!(!proc.replace_cell_id(1, 99, 5).unwrap());
    }

    #[test]
    fn test_reset_vertex_ids() {
        let mut proc = two_by_two();
        // vertex 3 ends up holding the larger cell 4
        proc.map.frames[1].cells.get_mut(&4).unwrap().size_ui = 300;
        assert!(proc.merge_cells(1, &[3, 4]));
        proc.reset_vertex_ids().unwrap();
        let data = proc.map().frame(1).unwrap();
        assert_eq!(data.vertex_of_cell(3).unwrap().id, 4);
        assert!(proc.map().inter[0].graph.contains_node(NodeKey::new(1, 4)));
        assert!(!proc.map().inter[0].graph.contains_node(NodeKey::new(1, 3)));
    }

    #[test]
    fn test_clear_counters() {
        let mut proc = two_by_two();
        proc.map.inter[0].counter = 9;
        proc.map.inter[0].link_edge(NodeKey::new(0, 1), NodeKey::new(1, 4));
        proc.clear_counters();
        let ig = &proc.map().inter[0];
        assert_eq!(ig.counter, 0);
        assert!(ig.graph.nodes().all(|(_, n)| n.count == 0));
    }

    #[test]
    fn test_segment_cells_splits_labels() {
        // one label covering two separate blocks
        let f0 = block_frame(&[(1, [1, 1, 1], 4), (1, [11, 1, 1], 4)], 200);
        let f1 = block_frame(&[(2, [1, 1, 1], 4), (3, [11, 1, 1], 4)], 200);
        let mut proc = linked_processor(vec![f0, f1]);
        assert_eq!(proc.map().frame(0).unwrap().cells().len(), 1);

        assert!(proc.segment_cells(0, &[1], 2).unwrap());
        let data = proc.map().frame(0).unwrap();
        assert_eq!(data.cells().len(), 2);
        assert!(data.cells().values().all(|c| c.size_ui == 64));
        assert!(!proc.segment_cells(0, &[1], 1).unwrap());
    }
}
