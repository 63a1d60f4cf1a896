//! Consistent ids.
//!
//! Once linking has settled, ids are rewritten so that a vertex is named
//! after its largest cell and linked vertices share one id across frames.
//! Every rename goes through `remap_frame`, which keeps the label buffer,
//! cells, vertices, contact graph and both link graphs in step.

use crate::error::TrackError;
use crate::graph::{IntraGraph, NodeKey};
use crate::processor::TrackMapProcessor;
use crate::track_map::FrameData;
use fluotrack_env::{EnvError, VolumeCache};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Stride between candidate ids, so a replacement id keeps the low byte
/// pattern of the one it stands in for.
const ID_STRIDE: u32 = 253;

/// Picks a free id derived from `id`.
///
/// Starts at `id` (or `id + 253` with `inc`) and steps by 253 until
/// `taken` says no. On overflow the search restarts once from
/// `id % 253`. Returns `None` when no id is found; 0 is never returned.
pub fn new_cell_id(id: u32, inc: bool, taken: impl Fn(u32) -> bool) -> Option<u32> {
    let mut wrapped = false;
    let mut candidate = if inc {
        match id.checked_add(ID_STRIDE) {
            Some(c) => c,
            None => {
                wrapped = true;
                id % ID_STRIDE
            }
        }
    } else {
        id
    };
    loop {
        if candidate != 0 && !taken(candidate) {
            return Some(candidate);
        }
        candidate = match candidate.checked_add(ID_STRIDE) {
            Some(c) => c,
            None if wrapped => return None,
            None => {
                wrapped = true;
                id % ID_STRIDE
            }
        };
    }
}

/// Member with the most voxels, lowest id on ties.
pub(crate) fn largest_cell(frame: &FrameData, cells: &BTreeSet<u32>) -> Option<u32> {
    cells
        .iter()
        .filter_map(|c| frame.cells.get(c))
        .max_by(|a, b| a.size_ui.cmp(&b.size_ui).then(b.id.cmp(&a.id)))
        .map(|c| c.id)
}

fn mapped(map: &BTreeMap<u32, u32>, id: u32) -> u32 {
    map.get(&id).copied().unwrap_or(id)
}

impl<C> TrackMapProcessor<C>
where
    C: VolumeCache,
{
    /// Renames cells and vertices of `frame`. Ids missing from a map are
    /// kept.
    ///
    /// Cells mapped onto the same id are fused, as are vertices. The label
    /// buffer is only touched when some cell id actually changes.
    pub(crate) fn remap_frame(
        &mut self,
        frame: usize,
        cell_map: &BTreeMap<u32, u32>,
        vertex_map: &BTreeMap<u32, u32>,
    ) -> Result<(), TrackError> {
        self.check_frame(frame)?;
        let cell_map: BTreeMap<u32, u32> = cell_map.iter().filter(|(a, b)| a != b).map(|(&a, &b)| (a, b)).collect();
        let vertex_map: BTreeMap<u32, u32> =
            vertex_map.iter().filter(|(a, b)| a != b).map(|(&a, &b)| (a, b)).collect();

        if !cell_map.is_empty() {
            self.cache.load(frame)?;
            let view = self.cache.frame_mut(frame).ok_or(EnvError::CacheMiss(frame))?;
            for label in view.labels.iter_mut() {
                if let Some(&id) = cell_map.get(label) {
                    *label = id;
                }
            }
            self.cache.mark_modified(frame);
        }

        let data = std::mem::take(&mut self.map.frames[frame]);

        let mut remapped = FrameData::default();
        for (_, mut cell) in data.cells {
            cell.id = mapped(&cell_map, cell.id);
            cell.vertex = cell.vertex.map(|v| mapped(&vertex_map, v));
            match remapped.cells.get_mut(&cell.id) {
                Some(existing) => existing.absorb(&cell),
                None => {
                    remapped.cells.insert(cell.id, cell);
                }
            }
        }
        for (_, mut vertex) in data.vertices {
            vertex.id = mapped(&vertex_map, vertex.id);
            vertex.cells = vertex.cells.iter().map(|&c| mapped(&cell_map, c)).collect();
            match remapped.vertices.get_mut(&vertex.id) {
                Some(existing) => existing.cells.extend(vertex.cells),
                None => {
                    remapped.vertices.insert(vertex.id, vertex);
                }
            }
        }
        remapped.intra = remap_intra(&data.intra, &cell_map);
        let ids: Vec<u32> = remapped.vertices.keys().copied().collect();
        for vid in ids {
            remapped.update_vertex(vid);
        }
        self.map.frames[frame] = remapped;

        if !vertex_map.is_empty() {
            for gi in self.map.adjacent_graphs(frame) {
                self.map.inter[gi].graph.rekey(|k| {
                    if k.frame == frame {
                        NodeKey::new(frame, mapped(&vertex_map, k.id))
                    } else {
                        k
                    }
                });
            }
        }
        self.map.touch();
        Ok(())
    }

    /// Collapses every vertex of `frame` onto its largest cell: the other
    /// members are relabeled to that cell's id and fused into it.
    pub fn make_consistent(&mut self, frame: usize) -> Result<(), TrackError> {
        self.check_frame(frame)?;
        let data = &self.map.frames[frame];
        let mut cell_map = BTreeMap::new();
        let mut vertex_map = BTreeMap::new();
        for v in data.vertices.values() {
            let Some(keep) = largest_cell(data, &v.cells) else {
                continue;
            };
            if v.cells.len() == 1 && v.id == keep {
                continue;
            }
            vertex_map.insert(v.id, keep);
            for &c in &v.cells {
                cell_map.insert(c, keep);
            }
        }
        if vertex_map.is_empty() {
            return Ok(());
        }
        debug!("Collapsing {} vertices of frame {}", vertex_map.len(), frame);
        self.remap_frame(frame, &cell_map, &vertex_map)
    }

    /// Id in `f1` the vertex `vid` of `f2` is linked to, if any.
    fn tracked_id(&self, f2: usize, f1: usize, vid: u32) -> Option<u32> {
        let ig = self.map.inter_between(f1, f2)?;
        ig.linked_neighbors(NodeKey::new(f2, vid)).first().map(|k| k.id)
    }

    /// Carries ids from `f1` into `f2` along links.
    ///
    /// `f2` is collapsed first. Each vertex then takes the id of the
    /// vertex it is linked to in `f1`; when several claim the same id the
    /// largest wins and the others take a fresh id next to it. Vertices
    /// without a link keep their id if still free.
    pub fn make_consistent_pair(&mut self, f1: usize, f2: usize) -> Result<(), TrackError> {
        self.check_pair(f1, f2)?;
        self.make_consistent(f2)?;

        let data = &self.map.frames[f2];
        let mut order: Vec<(u32, u32)> = data.vertices.values().map(|v| (v.id, v.size_ui)).collect();
        order.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut assigned: BTreeMap<u32, u32> = BTreeMap::new();
        let mut used: BTreeSet<u32> = BTreeSet::new();
        let mut pending = Vec::new();
        for &(vid, _) in &order {
            match self.tracked_id(f2, f1, vid) {
                Some(id) if !used.contains(&id) => {
                    used.insert(id);
                    assigned.insert(vid, id);
                }
                tracked => pending.push((vid, tracked)),
            }
        }
        for (vid, tracked) in pending {
            let id = match tracked {
                Some(base) => new_cell_id(base, false, |id| used.contains(&id)),
                None if !used.contains(&vid) => Some(vid),
                None => new_cell_id(vid, true, |id| used.contains(&id)),
            };
            let Some(id) = id else {
                // out of ids: keep the vertex as is
                used.insert(vid);
                assigned.insert(vid, vid);
                continue;
            };
            used.insert(id);
            assigned.insert(vid, id);
        }

        // after collapsing, each vertex holds exactly the cell it is named after
        let changed = assigned.iter().filter(|(a, b)| a != b).count();
        if changed == 0 {
            return Ok(());
        }
        info!("Frame {}: {} ids carried over from frame {}", f2, changed, f1);
        self.remap_frame(f2, &assigned, &assigned)
    }
}

fn remap_intra(intra: &IntraGraph, cell_map: &BTreeMap<u32, u32>) -> IntraGraph {
    let mut out = IntraGraph::new();
    for (id, _) in intra.nodes() {
        out.add_node(mapped(cell_map, id), ());
    }
    for ((a, b), edge) in intra.edges() {
        let (a, b) = (mapped(cell_map, a), mapped(cell_map, b));
        if a == b {
            continue;
        }
        match out.edge_mut(a, b) {
            Some(existing) => {
                existing.size_ui += edge.size_ui;
                existing.size_d += edge.size_d;
            }
            None => {
                out.set_edge(a, b, *edge);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::LinkState;
    use crate::test_support::{block_frame, linked_processor, set_inter_edge, synthetic_processor};
    use proptest::prelude::*;

    #[test]
    fn test_new_cell_id_steps_by_stride() {
        assert_eq!(new_cell_id(100, false, |_| false), Some(100));
        assert_eq!(new_cell_id(100, true, |_| false), Some(353));
        assert_eq!(new_cell_id(100, false, |id| id == 100 || id == 353), Some(606));
    }

    #[test]
    fn test_new_cell_id_wraps_once() {
        let near_max = u32::MAX - 10;
        let id = new_cell_id(near_max, true, |_| false).unwrap();
        assert_eq!(id, near_max % 253);
        assert_eq!(new_cell_id(5, false, |_| true), None);
        assert_eq!(new_cell_id(0, false, |_| false), Some(253));
    }

    proptest! {
        #[test]
        fn test_new_cell_id_is_free(id in 1u32..u32::MAX, inc in any::<bool>(), blocked in 0u32..4) {
            let taken = |c: u32| c % 253 == id % 253 && (c / 253) % 4 < blocked;
            if let Some(c) = new_cell_id(id, inc, taken) {
                prop_assert!(c != 0);
                prop_assert!(!taken(c));
                prop_assert_eq!(c % 253, id % 253);
            }
        }
    }

    #[test]
    fn test_make_consistent_collapses_onto_largest() {
        let f0 = block_frame(&[(5, [2, 2, 2], 6), (6, [5, 2, 2], 3)], 250);
        let f1 = block_frame(&[(9, [2, 2, 2], 6)], 250);
        let mut proc = linked_processor(vec![f0, f1]);
        // fold 5 into the vertex of 6 so the vertex is not named after its largest cell
        assert!(proc.merge_cells(0, &[6, 5]));
        assert_eq!(proc.map().frame(0).unwrap().vertex_of_cell(5).unwrap().id, 6);

        proc.make_consistent(0).unwrap();
        let data = proc.map().frame(0).unwrap();
        assert_eq!(data.cells().len(), 1);
        let v = data.vertex(5).unwrap();
        assert_eq!(v.size_ui, 216);
        let labels = proc.cache().frame(0).unwrap().labels;
        assert!(labels.iter().all(|&l| l == 0 || l == 5));
        assert_eq!(proc.map().inter[0].linked_neighbors(NodeKey::new(0, 5)), vec![NodeKey::new(1, 9)]);
        assert_eq!(proc.map().frame(0).unwrap().intra().edge_count(), 0);
    }

    #[test]
    fn test_pair_carries_ids_and_swaps() {
        // 1 -> 2 and 2 -> 1 across the frames: a swap that must not collide
        let mut proc = synthetic_processor(&[
            &[(1, [2.0; 3], 100), (2, [10.0; 3], 100)],
            &[(2, [2.0; 3], 100), (1, [10.0; 3], 100)],
        ]);
        set_inter_edge(&mut proc, 0, 1, 2, 50.0, LinkState::Linked);
        set_inter_edge(&mut proc, 0, 2, 1, 50.0, LinkState::Linked);

        proc.make_consistent_pair(0, 1).unwrap();
        let data = proc.map().frame(1).unwrap();
        assert_eq!(data.vertex(1).unwrap().center.x, 2.0);
        assert_eq!(data.vertex(2).unwrap().center.x, 10.0);
        let ig = &proc.map().inter[0];
        assert_eq!(ig.linked_neighbors(NodeKey::new(0, 1)), vec![NodeKey::new(1, 1)]);
        assert_eq!(ig.linked_neighbors(NodeKey::new(0, 2)), vec![NodeKey::new(1, 2)]);
    }

    #[test]
    fn test_pair_conflict_goes_to_larger() {
        let mut proc = synthetic_processor(&[
            &[(1, [2.0; 3], 100)],
            &[(7, [1.0; 3], 60), (8, [3.0; 3], 90)],
        ]);
        set_inter_edge(&mut proc, 0, 1, 7, 30.0, LinkState::Linked);
        set_inter_edge(&mut proc, 0, 1, 8, 30.0, LinkState::Linked);

        proc.make_consistent_pair(0, 1).unwrap();
        let data = proc.map().frame(1).unwrap();
        assert_eq!(data.vertex(1).unwrap().size_ui, 90);
        assert_eq!(data.vertex(254).unwrap().size_ui, 60);
    }

    #[test]
    fn test_unlinked_vertex_keeps_free_id() {
        let mut proc = synthetic_processor(&[&[(1, [2.0; 3], 100)], &[(4, [2.0; 3], 100), (1, [9.0; 3], 50)]]);
        set_inter_edge(&mut proc, 0, 1, 4, 30.0, LinkState::Linked);

        proc.make_consistent_pair(0, 1).unwrap();
        let data = proc.map().frame(1).unwrap();
        assert_eq!(data.vertex(1).unwrap().size_ui, 100);
        // the unlinked cell lost its id to the tracked one
        assert_eq!(data.vertex(254).unwrap().size_ui, 50);
        assert!(data.vertex(4).is_none());
    }
}
