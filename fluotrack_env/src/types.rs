//! Common voxel types shared by the cache, the tracker and the simulator.

use serde::{Deserialize, Serialize};

/// Dimensions of one frame's voxel grid.
///
/// Voxels are addressed x-fastest: `index = nx*ny*k + nx*j + i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VolumeDims {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
}

impl VolumeDims {
    /// Creates a new grid description.
    pub fn new(nx: usize, ny: usize, nz: usize) -> Self {
        Self { nx, ny, nz }
    }

    /// Total number of voxels in one frame.
    pub fn voxel_count(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    /// Linear index of voxel `(i, j, k)`.
    #[inline]
    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        self.nx * self.ny * k + self.nx * j + i
    }

    /// Inverse of [`VolumeDims::index`].
    #[inline]
    pub fn coords(&self, index: usize) -> (usize, usize, usize) {
        let plane = self.nx * self.ny;
        let k = index / plane;
        let rem = index % plane;
        (rem % self.nx, rem / self.nx, k)
    }

    /// Returns true if `(i, j, k)` lies inside the grid.
    pub fn contains(&self, i: i64, j: i64, k: i64) -> bool {
        i >= 0
            && j >= 0
            && k >= 0
            && (i as usize) < self.nx
            && (j as usize) < self.ny
            && (k as usize) < self.nz
    }
}

impl std::fmt::Display for VolumeDims {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.nx, self.ny, self.nz)
    }
}

/// Storage depth of the intensity channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BitDepth {
    #[default]
    Eight,
    Sixteen,
}

impl BitDepth {
    /// Number of bits per intensity sample.
    pub fn bits(&self) -> u8 {
        match self {
            BitDepth::Eight => 8,
            BitDepth::Sixteen => 16,
        }
    }

    /// Parses a bit count (8 or 16).
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            8 => Some(BitDepth::Eight),
            16 => Some(BitDepth::Sixteen),
            _ => None,
        }
    }
}

/// Borrowed intensity samples of one frame.
#[derive(Debug, Clone, Copy)]
pub enum Intensity<'a> {
    U8(&'a [u8]),
    U16(&'a [u16]),
}

impl<'a> Intensity<'a> {
    /// Number of samples.
    pub fn len(&self) -> usize {
        match self {
            Intensity::U8(d) => d.len(),
            Intensity::U16(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bit_depth(&self) -> BitDepth {
        match self {
            Intensity::U8(_) => BitDepth::Eight,
            Intensity::U16(_) => BitDepth::Sixteen,
        }
    }

    /// Normalized intensity at `index`.
    ///
    /// 8-bit samples map to `v / 255`; 16-bit samples to `v * scale / 65535`.
    #[inline]
    pub fn value(&self, index: usize, scale: f64) -> f64 {
        match self {
            Intensity::U8(d) => d[index] as f64 / 255.0,
            Intensity::U16(d) => d[index] as f64 * scale / 65535.0,
        }
    }
}

/// Owned intensity channel, as held by a cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IntensityBuffer {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

impl IntensityBuffer {
    /// Zero-filled buffer of the given depth.
    pub fn zeros(bits: BitDepth, len: usize) -> Self {
        match bits {
            BitDepth::Eight => IntensityBuffer::U8(vec![0; len]),
            BitDepth::Sixteen => IntensityBuffer::U16(vec![0; len]),
        }
    }

    pub fn len(&self) -> usize {
        self.view().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrows the samples.
    pub fn view(&self) -> Intensity<'_> {
        match self {
            IntensityBuffer::U8(d) => Intensity::U8(d),
            IntensityBuffer::U16(d) => Intensity::U16(d),
        }
    }
}

/// Read-only access to one resident frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub intensity: Intensity<'a>,
    pub labels: &'a [u32],
}

/// Access to one resident frame with a writable label channel.
///
/// Label edits made through this view must be reported with
/// `VolumeCache::mark_modified` so the cache persists them.
#[derive(Debug)]
pub struct FrameViewMut<'a> {
    pub intensity: Intensity<'a>,
    pub labels: &'a mut [u32],
}

impl<'a> FrameViewMut<'a> {
    /// Reborrows as a read-only view.
    pub fn as_view(&self) -> FrameView<'_> {
        FrameView {
            intensity: self.intensity,
            labels: &*self.labels,
        }
    }
}

/// Eviction and persistence policy for a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HandleFlags {
    /// Keep the intensity channel resident.
    pub data: bool,
    /// Keep the label channel resident.
    pub label: bool,
    /// Write modified labels back on eviction and flush.
    pub save_label: bool,
    /// Only evict frames that are not protected.
    pub time_cond: bool,
}

impl HandleFlags {
    /// Policy used while tracking: both channels, labels saved on eviction.
    pub fn tracking() -> Self {
        Self {
            data: true,
            label: true,
            save_label: true,
            time_cond: true,
        }
    }
}
