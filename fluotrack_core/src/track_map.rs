//! The track map: per-frame cells, vertices and contact graphs, plus the
//! link graphs between consecutive frames.

use crate::cell::{Cell, Vertex};
use crate::graph::{InterGraph, IntraGraph, NodeKey};
use fluotrack_env::{BitDepth, VolumeDims};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Frame-global volume parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub dims: VolumeDims,
    pub bits: BitDepth,
    /// Scale applied to 16-bit intensities
    pub scale: f64,
    /// Physical voxel size along x, y, z
    pub spacing: [f64; 3],
}

impl Default for VolumeInfo {
    fn default() -> Self {
        Self {
            dims: VolumeDims::default(),
            bits: BitDepth::Eight,
            scale: 1.0,
            spacing: [1.0; 3],
        }
    }
}

/// Everything the map holds for one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameData {
    pub(crate) cells: BTreeMap<u32, Cell>,
    pub(crate) vertices: BTreeMap<u32, Vertex>,
    pub(crate) intra: IntraGraph,
}

impl FrameData {
    pub fn cells(&self) -> &BTreeMap<u32, Cell> {
        &self.cells
    }

    pub fn vertices(&self) -> &BTreeMap<u32, Vertex> {
        &self.vertices
    }

    pub fn intra(&self) -> &IntraGraph {
        &self.intra
    }

    pub fn cell(&self, id: u32) -> Option<&Cell> {
        self.cells.get(&id)
    }

    pub fn vertex(&self, id: u32) -> Option<&Vertex> {
        self.vertices.get(&id)
    }

    /// Vertex owning cell `id`, if both still exist.
    pub fn vertex_of_cell(&self, id: u32) -> Option<&Vertex> {
        let vid = self.cells.get(&id)?.vertex?;
        self.vertices.get(&vid)
    }

    /// Recomputes vertex `vid` from its member cells.
    pub(crate) fn update_vertex(&mut self, vid: u32) {
        let FrameData { cells, vertices, .. } = self;
        if let Some(v) = vertices.get_mut(&vid) {
            v.update(|id| cells.get(&id));
        }
    }

    /// Inserts a cell with a fresh single-cell vertex.
    pub(crate) fn insert_cell_with_vertex(&mut self, frame: usize, mut cell: Cell) {
        cell.vertex = Some(cell.id);
        let vertex = Vertex::from_cell(frame, &cell);
        self.intra.add_node(cell.id, ());
        self.vertices.insert(vertex.id, vertex);
        self.cells.insert(cell.id, cell);
    }
}

/// The aggregate tracking state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackMap {
    /// Monotonic operation counter, persisted with the map
    pub(crate) counter: u32,
    pub(crate) info: VolumeInfo,
    pub(crate) frames: Vec<FrameData>,
    /// `inter[f]` links frames `f` and `f + 1`
    pub(crate) inter: Vec<InterGraph>,
}

impl TrackMap {
    pub fn new(info: VolumeInfo) -> Self {
        Self {
            info,
            ..Default::default()
        }
    }

    pub fn info(&self) -> &VolumeInfo {
        &self.info
    }

    pub fn set_info(&mut self, info: VolumeInfo) {
        self.info = info;
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn frame(&self, f: usize) -> Option<&FrameData> {
        self.frames.get(f)
    }

    pub fn frames(&self) -> &[FrameData] {
        &self.frames
    }

    pub fn inter_graphs(&self) -> &[InterGraph] {
        &self.inter
    }

    /// Graph linking `f` and `f + 1`.
    pub fn inter_graph(&self, f: usize) -> Option<&InterGraph> {
        self.inter.get(f)
    }

    /// Graph linking two adjacent frames, in either order.
    pub fn inter_between(&self, f1: usize, f2: usize) -> Option<&InterGraph> {
        if f1.abs_diff(f2) != 1 {
            return None;
        }
        self.inter.get(f1.min(f2))
    }

    pub(crate) fn inter_between_mut(&mut self, f1: usize, f2: usize) -> Option<&mut InterGraph> {
        if f1.abs_diff(f2) != 1 {
            return None;
        }
        self.inter.get_mut(f1.min(f2))
    }

    /// Indices of the link graphs touching `frame`.
    pub(crate) fn adjacent_graphs(&self, frame: usize) -> Vec<usize> {
        let mut out = Vec::with_capacity(2);
        if frame > 0 && frame - 1 < self.inter.len() {
            out.push(frame - 1);
        }
        if frame < self.inter.len() {
            out.push(frame);
        }
        out
    }

    /// Appends an empty frame and returns its index.
    pub fn extend_frame_num(&mut self) -> usize {
        self.frames.push(FrameData::default());
        self.frames.len() - 1
    }

    /// Drops every frame and graph. Volume info is kept.
    pub fn clear(&mut self) {
        self.counter = 0;
        self.frames.clear();
        self.inter.clear();
    }

    /// Bumps the operation counter.
    pub(crate) fn touch(&mut self) {
        self.counter = self.counter.wrapping_add(1);
    }

    /// Vertex id owning cell `cell` in `frame`.
    pub fn vertex_id_of_cell(&self, frame: usize, cell: u32) -> Option<u32> {
        self.frames.get(frame)?.vertex_of_cell(cell).map(|v| v.id)
    }

    /// Vertices in `other` linked (soft or forced) to vertex `vid` in `frame`.
    pub fn linked_vertices(&self, frame: usize, vid: u32, other: usize) -> Vec<u32> {
        let Some(ig) = self.inter_between(frame, other) else {
            return Vec::new();
        };
        ig.linked_neighbors(NodeKey::new(frame, vid))
            .into_iter()
            .map(|k| k.id)
            .collect()
    }

    /// Total cells across all frames.
    pub fn cell_total(&self) -> usize {
        self.frames.iter().map(|f| f.cells.len()).sum()
    }

    /// Total vertices across all frames.
    pub fn vertex_total(&self) -> usize {
        self.frames.iter().map(|f| f.vertices.len()).sum()
    }

    /// True when every frame pair has its link graph.
    pub fn is_consistent(&self) -> bool {
        !self.frames.is_empty() && self.inter.len() + 1 == self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{InterNode, LinkEdge, LinkState};
    use nalgebra::Point3;

    fn cell(id: u32, x: f64) -> Cell {
        let mut c = Cell::new(id);
        c.inc(Point3::new(x, 0.0, 0.0), 1.0);
        c
    }

    #[test]
    fn test_extend_and_clear_keeps_info() {
        let info = VolumeInfo {
            dims: VolumeDims::new(4, 4, 4),
            ..Default::default()
        };
        let mut map = TrackMap::new(info);
        assert_eq!(map.extend_frame_num(), 0);
        assert_eq!(map.extend_frame_num(), 1);
        assert_eq!(map.frame_count(), 2);
        assert!(!map.is_consistent());

        map.clear();
        assert_eq!(map.frame_count(), 0);
        assert_eq!(map.info().dims, VolumeDims::new(4, 4, 4));
    }

    #[test]
    fn test_vertex_of_cell_tolerates_removed_vertex() {
        let mut map = TrackMap::default();
        let f = map.extend_frame_num();
        map.frames[f].insert_cell_with_vertex(f, cell(5, 1.0));
        assert_eq!(map.vertex_id_of_cell(0, 5), Some(5));

        map.frames[f].vertices.remove(&5);
        assert_eq!(map.vertex_id_of_cell(0, 5), None);
        assert_eq!(map.vertex_id_of_cell(0, 6), None);
    }

    #[test]
    fn test_linked_vertices() {
        let mut map = TrackMap::default();
        map.extend_frame_num();
        map.extend_frame_num();
        let mut ig = InterGraph::new(0);
        let a = NodeKey::new(0, 1);
        let b = NodeKey::new(1, 7);
        ig.graph.add_node(a, InterNode::default());
        ig.graph.add_node(b, InterNode::default());
        ig.graph.set_edge(a, b, LinkEdge { link: LinkState::Forced, ..Default::default() });
        map.inter.push(ig);

        assert!(map.is_consistent());
        assert_eq!(map.linked_vertices(0, 1, 1), vec![7]);
        assert_eq!(map.linked_vertices(1, 7, 0), vec![1]);
        assert!(map.linked_vertices(0, 1, 2).is_empty());
    }
}
