//! Volume cache trait consumed by the tracking engine.

use crate::{BitDepth, EnvError, FrameView, FrameViewMut, HandleFlags, VolumeDims};

/// Source of per-frame intensity and label buffers.
///
/// The tracker never owns voxel data. It asks the cache to make a frame
/// resident, borrows its buffers for the duration of one operation, and
/// reports label edits back so they are persisted.
///
/// # Implementations
///
/// - **In memory**: `InMemoryCache` - backing store plus bounded resident set
/// - **Production**: a disk-backed time-series reader (not part of this crate)
///
/// # Pinning
///
/// Operations that touch two frames load the first, `protect` it, load the
/// second, then `unprotect` the first when done. A protected frame must not
/// be evicted by the second `load`.
pub trait VolumeCache {
    /// Grid dimensions shared by every frame.
    fn dims(&self) -> VolumeDims;

    /// Storage depth of the intensity channel.
    fn bit_depth(&self) -> BitDepth;

    /// Intensity scale applied to 16-bit samples.
    fn scale(&self) -> f64;

    /// Physical voxel spacing along x, y, z.
    fn spacing(&self) -> [f64; 3];

    /// Number of frames in the time series.
    fn frame_count(&self) -> usize;

    /// Makes `frame` resident, evicting others if needed.
    fn load(&mut self, frame: usize) -> Result<(), EnvError>;

    /// Buffers of a resident frame, or `None` if it is not resident.
    fn frame(&self, frame: usize) -> Option<FrameView<'_>>;

    /// Buffers of a resident frame with writable labels.
    fn frame_mut(&mut self, frame: usize) -> Option<FrameViewMut<'_>>;

    /// Pins `frame` against eviction.
    fn protect(&mut self, frame: usize);

    /// Releases a pin taken with [`VolumeCache::protect`].
    fn unprotect(&mut self, frame: usize);

    /// Flags the label buffer of `frame` for persistence.
    fn mark_modified(&mut self, frame: usize);

    /// Sets the eviction/persistence policy.
    fn set_handle_flags(&mut self, flags: HandleFlags);

    /// Sets the maximum number of resident frames (0 = unbounded).
    fn set_capacity(&mut self, frames: usize);

    /// Loads `frame` and returns its buffers.
    fn get_frame_buffers(&mut self, frame: usize) -> Result<FrameView<'_>, EnvError> {
        self.load(frame)?;
        self.frame(frame).ok_or(EnvError::CacheMiss(frame))
    }
}
