//! Frame initialization and inter-frame linking.
//!
//! - `initialize_frame` scans one labeled volume into cells, prunes small
//!   ones (also from the label buffer), detects contacts and creates one
//!   vertex per cell
//! - `link_frames` overlays two frames and accumulates overlap edges
//!   between their vertices
//! - `link_added_cells` does the same for a handful of new cells only

use crate::cell::{Cell, Vertex};
use crate::error::TrackError;
use crate::graph::{ContactEdge, InterGraph, InterNode, LinkEdge, LinkState, NodeKey};
use crate::processor::TrackMapProcessor;
use crate::track_map::FrameData;
use fluotrack_env::{EnvError, FrameView, VolumeCache, VolumeDims};
use nalgebra::Point3;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Linear indices of the six face neighbors of `(i, j, k)`.
///
/// `None` marks a side that falls off the grid.
fn face_neighbors(dims: &VolumeDims, i: usize, j: usize, k: usize) -> [Option<usize>; 6] {
    let index = dims.index(i, j, k);
    let plane = dims.nx * dims.ny;
    [
        (i > 0).then(|| index - 1),
        (i + 1 < dims.nx).then(|| index + 1),
        (j > 0).then(|| index - dims.nx),
        (j + 1 < dims.ny).then(|| index + dims.nx),
        (k > 0).then(|| index - plane),
        (k + 1 < dims.nz).then(|| index + plane),
    ]
}

fn check_shape(view: &FrameView<'_>, dims: &VolumeDims) -> Result<(), EnvError> {
    let expected = dims.voxel_count();
    for actual in [view.labels.len(), view.intensity.len()] {
        if actual != expected {
            return Err(EnvError::ShapeMismatch { expected, actual });
        }
    }
    Ok(())
}

/// Adds one overlapping voxel to the edge between `v1` and `v2`.
///
/// New nodes and edges start with a count of one; a new edge is soft
/// linked. Repeat visits only grow the overlap.
pub(crate) fn accumulate_overlap(ig: &mut InterGraph, v1: &Vertex, v2: &Vertex, value: f64) {
    let k1 = NodeKey::new(v1.frame, v1.id);
    let k2 = NodeKey::new(v2.frame, v2.id);
    for k in [k1, k2] {
        ig.graph.ensure_node(k, || InterNode { count: 1 });
    }
    if let Some(edge) = ig.graph.edge_mut(k1, k2) {
        edge.size_ui += 1;
        edge.size_d += value;
    } else {
        ig.graph.set_edge(
            k1,
            k2,
            LinkEdge {
                size_ui: 1,
                size_d: value,
                dist: v1.distance(v2),
                link: LinkState::Linked,
                count: 1,
            },
        );
    }
}

impl<C> TrackMapProcessor<C>
where
    C: VolumeCache,
{
    /// Builds cells, contacts and vertices for `frame` and appends it.
    ///
    /// Frames must be initialized in order. Labels of pruned cells are
    /// zeroed in the cache and the frame is marked modified. Nothing is
    /// appended if the buffers cannot be loaded or have the wrong shape.
    pub fn initialize_frame(&mut self, frame: usize) -> Result<(), TrackError> {
        let expected = self.map.frame_count();
        if frame != expected {
            return Err(TrackError::NonSequentialFrame { expected, actual: frame });
        }
        let frames = self.cache.frame_count();
        if frame >= frames {
            return Err(TrackError::invalid_frame(frame, frames));
        }

        let dims = self.map.info.dims;
        let scale = self.map.info.scale;
        let thresh = self.config.size_thresh;
        self.cache.load(frame)?;

        // cells
        let mut cells: BTreeMap<u32, Cell> = BTreeMap::new();
        {
            let view = self.cache.frame(frame).ok_or(EnvError::CacheMiss(frame))?;
            check_shape(&view, &dims)?;
            for (index, &label) in view.labels.iter().enumerate() {
                if label == 0 {
                    continue;
                }
                let (i, j, k) = dims.coords(index);
                let p = Point3::new(i as f64, j as f64, k as f64);
                cells
                    .entry(label)
                    .or_insert_with(|| Cell::new(label))
                    .inc(p, view.intensity.value(index, scale));
            }
        }
        let before = cells.len();
        cells.retain(|_, c| f64::from(c.size_ui) >= thresh);
        let pruned = before - cells.len();

        if pruned > 0 {
            let labels = self
                .cache
                .frame_mut(frame)
                .ok_or(EnvError::CacheMiss(frame))?
                .labels;
            for label in labels.iter_mut() {
                if *label != 0 && !cells.contains_key(&*label) {
                    *label = 0;
                }
            }
            self.cache.mark_modified(frame);
        }

        // contacts and external voxels
        let mut contacts: BTreeMap<(u32, u32), ContactEdge> = BTreeMap::new();
        {
            let view = self.cache.frame(frame).ok_or(EnvError::CacheMiss(frame))?;
            for (index, &id) in view.labels.iter().enumerate() {
                if id == 0 {
                    continue;
                }
                let value = view.intensity.value(index, scale);
                let (i, j, k) = dims.coords(index);
                let mut external = false;
                for n in face_neighbors(&dims, i, j, k) {
                    let Some(n) = n else {
                        external = true;
                        continue;
                    };
                    let other = view.labels[n];
                    if other == 0 {
                        external = true;
                    } else if other != id {
                        let contact = value.min(view.intensity.value(n, scale));
                        if contact > self.config.contact_thresh && cells.contains_key(&other) {
                            let e = contacts.entry((id.min(other), id.max(other))).or_default();
                            e.size_ui += 1;
                            e.size_d += contact;
                        }
                    }
                }
                if external {
                    if let Some(cell) = cells.get_mut(&id) {
                        cell.inc_external(value);
                    }
                }
            }
        }

        let mut data = FrameData::default();
        for (_, cell) in cells {
            data.insert_cell_with_vertex(frame, cell);
        }
        for ((a, b), edge) in contacts {
            data.intra.set_edge(a, b, edge);
        }
        info!(
            "Frame {} initialized: {} cells ({} pruned), {} contacts",
            frame,
            data.cells.len(),
            pruned,
            data.intra.edge_count()
        );
        self.map.frames.push(data);
        Ok(())
    }

    /// Builds the link graph between two adjacent initialized frames.
    ///
    /// Every voxel labeled in both frames adds to the edge between the two
    /// owning vertices, weighted by the lower of the two intensities.
    /// Vertices below the size threshold are skipped. Re-linking a pair
    /// measures overlap afresh but keeps the existing graph's link states,
    /// flip counts, pass counter and forced links.
    pub fn link_frames(&mut self, f1: usize, f2: usize) -> Result<(), TrackError> {
        self.check_pair(f1, f2)?;
        let index = f1.min(f2);
        if index > self.map.inter.len() {
            return Err(TrackError::NonSequentialFrame {
                expected: self.map.inter.len(),
                actual: index,
            });
        }

        self.cache.load(f1)?;
        self.cache.protect(f1);
        let graph = self.overlap_graph(f1, f2, index);
        self.cache.unprotect(f1);
        let mut graph = graph?;

        if let Some(previous) = self.map.inter.get(index) {
            let mut previous = previous.clone();
            let frames = &self.map.frames;
            let gone: Vec<NodeKey> = previous
                .graph
                .nodes()
                .map(|(k, _)| k)
                .filter(|k| frames.get(k.frame).and_then(|f| f.vertex(k.id)).is_none())
                .collect();
            for k in gone {
                previous.graph.remove_node(k);
            }
            graph.carry_decisions(previous);
        }

        debug!(
            "Frames {} and {} linked: {} vertices, {} edges",
            f1,
            f2,
            graph.graph.node_count(),
            graph.graph.edge_count()
        );
        if index == self.map.inter.len() {
            self.map.inter.push(graph);
        } else {
            self.map.inter[index] = graph;
        }
        Ok(())
    }

    fn overlap_graph(&mut self, f1: usize, f2: usize, index: usize) -> Result<InterGraph, TrackError> {
        self.cache.load(f2)?;
        let dims = self.map.info.dims;
        let scale = self.map.info.scale;
        let thresh = self.config.size_thresh;
        let view1 = self.cache.frame(f1).ok_or(EnvError::CacheMiss(f1))?;
        let view2 = self.cache.frame(f2).ok_or(EnvError::CacheMiss(f2))?;
        check_shape(&view1, &dims)?;
        check_shape(&view2, &dims)?;
        let (frame1, frame2) = (&self.map.frames[f1], &self.map.frames[f2]);

        let mut graph = InterGraph::new(index);
        for index in 0..dims.voxel_count() {
            let (l1, l2) = (view1.labels[index], view2.labels[index]);
            if l1 == 0 || l2 == 0 {
                continue;
            }
            let (Some(v1), Some(v2)) = (frame1.vertex_of_cell(l1), frame2.vertex_of_cell(l2)) else {
                continue;
            };
            if f64::from(v1.size_ui) < thresh || f64::from(v2.size_ui) < thresh {
                continue;
            }
            let value = view1
                .intensity
                .value(index, scale)
                .min(view2.intensity.value(index, scale));
            accumulate_overlap(&mut graph, v1, v2, value);
        }
        Ok(graph)
    }

    /// Links newly added cells of `f1` into the existing graph with `f2`.
    ///
    /// Only voxels inside each cell's bounding box are visited. Cells whose
    /// vertex already has edges in the graph are skipped. The graph's pass
    /// counter is reset when anything was added. Returns false when nothing
    /// was, or when `f2` is not a linked neighbor of `f1`.
    pub fn link_added_cells(&mut self, cells: &[u32], f1: usize, f2: usize) -> Result<bool, TrackError> {
        self.check_frame(f1)?;
        if f2 >= self.map.frame_count() || f1.abs_diff(f2) != 1 || self.map.inter_between(f1, f2).is_none() {
            return Ok(false);
        }

        self.cache.load(f1)?;
        self.cache.protect(f1);
        let result = self.overlap_cells(cells, f1, f2);
        self.cache.unprotect(f1);
        let added = result?;
        if added == 0 {
            return Ok(false);
        }

        if let Some(ig) = self.map.inter_between_mut(f1, f2) {
            ig.counter = 0;
        }
        Ok(true)
    }

    fn overlap_cells(&mut self, cells: &[u32], f1: usize, f2: usize) -> Result<usize, TrackError> {
        self.cache.load(f2)?;
        let dims = self.map.info.dims;
        let scale = self.map.info.scale;
        let thresh = self.config.size_thresh;
        let view1 = self.cache.frame(f1).ok_or(EnvError::CacheMiss(f1))?;
        let view2 = self.cache.frame(f2).ok_or(EnvError::CacheMiss(f2))?;
        check_shape(&view1, &dims)?;
        check_shape(&view2, &dims)?;

        let lo = f1.min(f2);
        let (frames, inter) = (&self.map.frames, &mut self.map.inter);
        let (frame1, frame2) = (&frames[f1], &frames[f2]);
        let graph = &mut inter[lo];

        // vertices already in the graph keep the overlap they have
        let linked: BTreeSet<u32> = cells
            .iter()
            .filter_map(|&cid| frame1.vertex_of_cell(cid))
            .filter(|v| graph.graph.degree(NodeKey::new(f1, v.id)) > 0)
            .map(|v| v.id)
            .collect();

        let mut added = 0;
        for &cid in cells {
            let Some(cell) = frame1.cell(cid) else { continue };
            if cell.vertex.is_some_and(|v| linked.contains(&v)) {
                debug!("Cell {} of frame {} is already linked toward {}", cid, f1, f2);
                continue;
            }
            let Some((lo_v, hi_v)) = cell.bbox.voxel_range([dims.nx, dims.ny, dims.nz]) else {
                continue;
            };
            for k in lo_v[2]..=hi_v[2] {
                for j in lo_v[1]..=hi_v[1] {
                    for i in lo_v[0]..=hi_v[0] {
                        let index = dims.index(i, j, k);
                        let l2 = view2.labels[index];
                        if view1.labels[index] != cid || l2 == 0 {
                            continue;
                        }
                        let (Some(v1), Some(v2)) = (frame1.vertex_of_cell(cid), frame2.vertex_of_cell(l2)) else {
                            continue;
                        };
                        if f64::from(v1.size_ui) < thresh || f64::from(v2.size_ui) < thresh {
                            continue;
                        }
                        let value = view1
                            .intensity
                            .value(index, scale)
                            .min(view2.intensity.value(index, scale));
                        accumulate_overlap(graph, v1, v2, value);
                        added += 1;
                    }
                }
            }
        }
        Ok(added)
    }
}
