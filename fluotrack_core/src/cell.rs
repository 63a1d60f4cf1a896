//! Cells and vertices: the per-frame entities of the track map.
//!
//! - A [`Cell`] is one labeled voxel blob in one frame
//! - A [`Vertex`] groups one or more cells into a tracking unit
//!
//! Both live in id-keyed maps owned by their frame. Back-references
//! (`Cell::vertex`, `Vertex::cells`) are ids, and every lookup through them
//! tolerates the target having been removed.

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============================================================================
// BOUNDING BOX
// ============================================================================

/// Axis-aligned box in voxel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoundingBox {
    /// A box containing nothing.
    pub fn empty() -> Self {
        Self {
            min: Point3::new(f64::MAX, f64::MAX, f64::MAX),
            max: Point3::new(f64::MIN, f64::MIN, f64::MIN),
        }
    }

    pub fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        Self { min, max }
    }

    /// Returns true once at least one point was added.
    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    /// Grows the box to contain `p`.
    pub fn extend_point(&mut self, p: &Point3<f64>) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    /// Grows the box to contain `other`.
    pub fn extend(&mut self, other: &BoundingBox) {
        if other.is_valid() {
            self.extend_point(&other.min);
            self.extend_point(&other.max);
        }
    }

    /// Side lengths.
    pub fn extent(&self) -> Vector3<f64> {
        if self.is_valid() {
            self.max - self.min
        } else {
            Vector3::zeros()
        }
    }

    /// Inclusive overlap test.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.is_valid()
            && other.is_valid()
            && self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Copy grown on every side by `factor / 2` of its extent.
    pub fn dilated(&self, factor: f64) -> Self {
        if !self.is_valid() {
            return *self;
        }
        let half = self.extent() * (factor * 0.5);
        Self {
            min: self.min - half,
            max: self.max + half,
        }
    }

    /// Inclusive voxel index range, clamped to a grid of `size` voxels.
    pub fn voxel_range(&self, size: [usize; 3]) -> Option<([usize; 3], [usize; 3])> {
        if !self.is_valid() || size.iter().any(|&s| s == 0) {
            return None;
        }
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        for a in 0..3 {
            let min = self.min[a].floor().max(0.0);
            let max = self.max[a].ceil().min((size[a] - 1) as f64);
            if max < min {
                return None;
            }
            lo[a] = min as usize;
            hi[a] = max as usize;
        }
        Some((lo, hi))
    }
}

// ============================================================================
// CELL
// ============================================================================

/// One connected voxel blob carrying a single label in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    /// Label value, unique within the frame (never 0)
    pub id: u32,

    /// Brick the cell was found in (0 for single-brick volumes)
    pub brick_id: u32,

    /// Voxel count
    pub size_ui: u32,

    /// Intensity-weighted voxel count
    pub size_d: f64,

    /// Voxels touching the frame boundary or background
    pub ext_ui: u32,

    /// Intensity sum of those voxels
    pub ext_d: f64,

    /// Voxel-space centroid
    pub center: Point3<f64>,

    /// Voxel-space bounds
    pub bbox: BoundingBox,

    /// Id of the owning vertex, if any
    pub vertex: Option<u32>,
}

impl Cell {
    /// Creates an empty cell.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            brick_id: 0,
            size_ui: 0,
            size_d: 0.0,
            ext_ui: 0,
            ext_d: 0.0,
            center: Point3::origin(),
            bbox: BoundingBox::empty(),
            vertex: None,
        }
    }

    /// Adds one voxel at `p` with normalized intensity `value`.
    pub fn inc(&mut self, p: Point3<f64>, value: f64) {
        self.size_ui += 1;
        self.size_d += value;
        self.center += (p - self.center) / self.size_ui as f64;
        self.bbox.extend_point(&p);
    }

    /// Counts one external-contact voxel.
    pub fn inc_external(&mut self, value: f64) {
        self.ext_ui += 1;
        self.ext_d += value;
    }

    /// Folds `other`'s statistics into this cell.
    pub fn absorb(&mut self, other: &Cell) {
        let total = self.size_ui + other.size_ui;
        if total > 0 {
            let w = other.size_ui as f64 / total as f64;
            self.center += (other.center - self.center) * w;
        }
        self.size_ui = total;
        self.size_d += other.size_d;
        self.ext_ui += other.ext_ui;
        self.ext_d += other.ext_d;
        self.bbox.extend(&other.bbox);
    }
}

// ============================================================================
// VERTEX
// ============================================================================

/// A tracking unit in one frame, aggregating one or more cells.
///
/// Size, centroid and bounds are derived from the member cells and must be
/// refreshed with [`Vertex::update`] after any membership change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    /// Id, always one of the member cells' ids
    pub id: u32,

    /// Frame the vertex lives in
    pub frame: usize,

    pub size_ui: u32,
    pub size_d: f64,
    pub center: Point3<f64>,
    pub bbox: BoundingBox,

    /// Member cell ids
    pub cells: BTreeSet<u32>,

    /// Set once a split was attempted
    pub split: bool,
}

impl Vertex {
    /// Creates a vertex holding a single cell.
    pub fn from_cell(frame: usize, cell: &Cell) -> Self {
        let mut cells = BTreeSet::new();
        cells.insert(cell.id);
        Self {
            id: cell.id,
            frame,
            size_ui: cell.size_ui,
            size_d: cell.size_d,
            center: cell.center,
            bbox: cell.bbox,
            cells,
            split: false,
        }
    }

    /// Creates a vertex with no members (filled by the importer).
    pub fn empty(frame: usize, id: u32) -> Self {
        Self {
            id,
            frame,
            size_ui: 0,
            size_d: 0.0,
            center: Point3::origin(),
            bbox: BoundingBox::empty(),
            cells: BTreeSet::new(),
            split: false,
        }
    }

    /// Recomputes the aggregate from the current members.
    ///
    /// `lookup` resolves a cell id; ids it cannot resolve are dropped.
    pub fn update<'a, F>(&mut self, lookup: F)
    where
        F: Fn(u32) -> Option<&'a Cell>,
    {
        let mut size_ui = 0u32;
        let mut size_d = 0.0;
        let mut sum = Vector3::zeros();
        let mut bbox = BoundingBox::empty();
        let mut alive = BTreeSet::new();

        for &cid in &self.cells {
            let Some(cell) = lookup(cid) else { continue };
            size_ui += cell.size_ui;
            size_d += cell.size_d;
            sum += cell.center.coords * cell.size_ui as f64;
            bbox.extend(&cell.bbox);
            alive.insert(cid);
        }

        self.cells = alive;
        self.size_ui = size_ui;
        self.size_d = size_d;
        if size_ui > 0 {
            self.center = Point3::from(sum / size_ui as f64);
        }
        self.bbox = bbox;
    }

    /// Straight-line distance between centroids.
    pub fn distance(&self, other: &Vertex) -> f64 {
        (self.center - other.center).norm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn block_cell(id: u32, origin: f64, n: usize) -> Cell {
        let mut cell = Cell::new(id);
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    let p = Point3::new(origin + i as f64, origin + j as f64, origin + k as f64);
                    cell.inc(p, 0.5);
                }
            }
        }
        cell
    }

    #[test]
    fn test_cell_incremental_centroid() {
        let cell = block_cell(7, 10.0, 3);
        assert_eq!(cell.size_ui, 27);
        assert_relative_eq!(cell.size_d, 13.5, epsilon = 1e-9);
        assert_relative_eq!(cell.center.x, 11.0, epsilon = 1e-9);
        assert_relative_eq!(cell.center.z, 11.0, epsilon = 1e-9);
        assert_eq!(cell.bbox.min, Point3::new(10.0, 10.0, 10.0));
        assert_eq!(cell.bbox.max, Point3::new(12.0, 12.0, 12.0));
    }

    #[test]
    fn test_cell_absorb_weights_center() {
        let mut a = block_cell(1, 0.0, 2);
        let b = block_cell(2, 10.0, 2);
        a.absorb(&b);
        assert_eq!(a.size_ui, 16);
        assert_relative_eq!(a.center.x, 5.5, epsilon = 1e-9);
        assert_eq!(a.bbox.max, Point3::new(11.0, 11.0, 11.0));
    }

    #[test]
    fn test_bbox_dilation_and_intersection() {
        let a = BoundingBox::new(Point3::new(0.0, 0.0, 0.0), Point3::new(4.0, 4.0, 4.0));
        let b = BoundingBox::new(Point3::new(5.0, 0.0, 0.0), Point3::new(9.0, 4.0, 4.0));
        assert!(!a.intersects(&b));
        // each side grows by half the extent
        let da = a.dilated(1.0);
        assert_eq!(da.min, Point3::new(-2.0, -2.0, -2.0));
        assert!(da.intersects(&b));
        assert!(!BoundingBox::empty().intersects(&a));
    }

    #[test]
    fn test_bbox_voxel_range_clamps() {
        let b = BoundingBox::new(Point3::new(-3.0, 1.0, 2.0), Point3::new(2.0, 9.0, 2.0));
        let (lo, hi) = b.voxel_range([4, 4, 4]).unwrap();
        assert_eq!(lo, [0, 1, 2]);
        assert_eq!(hi, [2, 3, 2]);
        assert!(BoundingBox::empty().voxel_range([4, 4, 4]).is_none());
    }

    #[test]
    fn test_vertex_update_drops_missing_cells() {
        let mut cells = BTreeMap::new();
        cells.insert(1, block_cell(1, 0.0, 2));
        cells.insert(2, block_cell(2, 4.0, 2));

        let mut v = Vertex::from_cell(0, &cells[&1]);
        v.cells.insert(2);
        v.cells.insert(99);
        v.update(|id| cells.get(&id));

        assert_eq!(v.cells.len(), 2);
        assert_eq!(v.size_ui, 16);
        assert_relative_eq!(v.center.x, 2.5, epsilon = 1e-9);
        assert_eq!(v.bbox.max, Point3::new(5.0, 5.0, 5.0));
    }
}
