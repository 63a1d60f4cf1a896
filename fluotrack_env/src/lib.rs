//! FluoTrack Environment Abstraction Layer
//!
//! The tracking engine works on labeled 4D microscopy data it does not own.
//! This crate defines the seams to everything outside the engine:
//! - Voxel buffers (`VolumeCache`), with pinning and dirty-label write-back
//! - Point clustering (`PointClusterer`) for merge and split decisions
//! - Progress reporting (`ProgressObserver`)
//!
//! `InMemoryCache` is a complete cache used by the simulator and tests.
//!
//! # Example
//!
//! ```ignore
//! use fluotrack_env::{InMemoryCache, VolumeCache, VolumeDims, BitDepth};
//!
//! let mut cache = InMemoryCache::new(VolumeDims::new(64, 64, 16), BitDepth::Eight);
//! cache.push_frame(intensity, labels)?;
//! let view = cache.get_frame_buffers(0)?;
//! ```

mod cache;
mod cluster;
mod error;
mod memory;
mod progress;
mod types;

pub use cache::VolumeCache;
pub use cluster::{ClusterPoint, Partition, PointClusterer};
pub use error::EnvError;
pub use memory::{CacheStats, InMemoryCache};
pub use progress::{NullProgress, ProgressObserver};
pub use types::{
    BitDepth, FrameView, FrameViewMut, HandleFlags, Intensity, IntensityBuffer, VolumeDims,
};
