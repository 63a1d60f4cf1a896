//! Fixtures shared by the unit tests.

use crate::cell::{BoundingBox, Cell};
use crate::graph::{InterGraph, InterNode, LinkEdge, LinkState, NodeKey};
use crate::processor::{TrackConfig, TrackMapProcessor};
use fluotrack_env::{BitDepth, InMemoryCache, IntensityBuffer, VolumeDims};
use nalgebra::{Point3, Vector3};

pub(crate) const DIMS: VolumeDims = VolumeDims { nx: 16, ny: 16, nz: 8 };

pub(crate) type Frame = (IntensityBuffer, Vec<u32>);

/// A frame of cubes: `(label, min corner, edge length)`, later cubes
/// overwriting earlier ones, all at one 8-bit intensity.
pub(crate) fn block_frame(blocks: &[(u32, [usize; 3], usize)], intensity: u8) -> Frame {
    let mut data = vec![0u8; DIMS.voxel_count()];
    let mut labels = vec![0u32; DIMS.voxel_count()];
    for &(id, [x, y, z], n) in blocks {
        for k in z..(z + n).min(DIMS.nz) {
            for j in y..(y + n).min(DIMS.ny) {
                for i in x..(x + n).min(DIMS.nx) {
                    let index = DIMS.index(i, j, k);
                    data[index] = intensity;
                    labels[index] = id;
                }
            }
        }
    }
    (IntensityBuffer::U8(data), labels)
}

pub(crate) fn cache_with_frames(frames: Vec<Frame>) -> InMemoryCache {
    let mut cache = InMemoryCache::new(DIMS, BitDepth::Eight);
    for (data, labels) in frames {
        cache.push_frame(data, labels).unwrap();
    }
    cache
}

pub(crate) fn processor_with_frames(frames: Vec<Frame>) -> TrackMapProcessor<InMemoryCache> {
    TrackMapProcessor::with_defaults(cache_with_frames(frames))
}

pub(crate) fn processor_with_config(
    frames: Vec<Frame>,
    config: TrackConfig,
) -> TrackMapProcessor<InMemoryCache> {
    TrackMapProcessor::new(cache_with_frames(frames), config)
}

/// Initializes every frame and links consecutive pairs, without any
/// resolution or relaxation.
pub(crate) fn linked_processor(frames: Vec<Frame>) -> TrackMapProcessor<InMemoryCache> {
    let n = frames.len();
    let mut proc = processor_with_frames(frames);
    for f in 0..n {
        proc.initialize_frame(f).unwrap();
        if f > 0 {
            proc.link_frames(f - 1, f).unwrap();
        }
    }
    proc
}

/// A cube-shaped cell of `size` voxels centered at `center`, without
/// voxels behind it.
pub(crate) fn synthetic_cell(id: u32, center: [f64; 3], size: u32) -> Cell {
    let mut cell = Cell::new(id);
    cell.size_ui = size;
    cell.size_d = f64::from(size);
    cell.center = Point3::from(center);
    let half = Vector3::repeat(f64::from(size).cbrt() / 2.0);
    cell.bbox = BoundingBox::new(cell.center - half, cell.center + half);
    cell
}

/// A processor whose map is built directly from synthetic cells, one
/// vertex per cell and empty link graphs between frames. The cache holds
/// blank frames.
pub(crate) fn synthetic_processor(frames: &[&[(u32, [f64; 3], u32)]]) -> TrackMapProcessor<InMemoryCache> {
    let mut proc = processor_with_frames(vec![block_frame(&[], 0); frames.len()]);
    for cells in frames {
        let f = proc.map.extend_frame_num();
        for &(id, center, size) in cells.iter() {
            proc.map.frames[f].insert_cell_with_vertex(f, synthetic_cell(id, center, size));
        }
        if f > 0 {
            proc.map.inter.push(InterGraph::new(f - 1));
        }
    }
    proc
}

/// Sets the edge between vertex `a` of frame `f` and vertex `b` of frame
/// `f + 1`, adding nodes with zero counts as needed.
pub(crate) fn set_inter_edge(
    proc: &mut TrackMapProcessor<InMemoryCache>,
    f: usize,
    a: u32,
    b: u32,
    size_d: f64,
    link: LinkState,
) {
    let ka = NodeKey::new(f, a);
    let kb = NodeKey::new(f + 1, b);
    let ig = &mut proc.map.inter[f];
    ig.graph.ensure_node(ka, InterNode::default);
    ig.graph.ensure_node(kb, InterNode::default);
    ig.graph.set_edge(
        ka,
        kb,
        LinkEdge {
            size_ui: size_d as u32,
            size_d,
            link,
            ..Default::default()
        },
    );
}
