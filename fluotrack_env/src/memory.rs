//! In-memory implementation of [`VolumeCache`].

use crate::{
    BitDepth, EnvError, FrameView, FrameViewMut, HandleFlags, IntensityBuffer, VolumeCache,
    VolumeDims,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Counters describing cache traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Frames copied from the backing store into the resident set
    pub loads: u64,

    /// Frames dropped from the resident set
    pub evictions: u64,

    /// Modified label buffers written back to the backing store
    pub saves: u64,
}

/// One frame in the backing store.
#[derive(Debug, Clone)]
struct StoredFrame {
    intensity: IntensityBuffer,
    labels: Vec<u32>,
}

/// One frame in the resident set.
#[derive(Debug)]
struct ResidentFrame {
    intensity: IntensityBuffer,
    labels: Vec<u32>,
    modified: bool,
    protected: bool,
    last_used: u64,
}

/// Cache backed by owned buffers.
///
/// Frames live in a backing store and are copied into a bounded resident
/// set on `load`. Eviction picks the least recently used unprotected frame
/// and writes its labels back when they were marked modified.
pub struct InMemoryCache {
    dims: VolumeDims,
    bits: BitDepth,
    scale: f64,
    spacing: [f64; 3],
    store: Vec<StoredFrame>,
    resident: BTreeMap<usize, ResidentFrame>,
    capacity: usize,
    flags: HandleFlags,
    clock: u64,
    stats: CacheStats,
}

impl InMemoryCache {
    /// Creates an empty cache for frames of the given shape.
    pub fn new(dims: VolumeDims, bits: BitDepth) -> Self {
        Self {
            dims,
            bits,
            scale: 1.0,
            spacing: [1.0; 3],
            store: Vec::new(),
            resident: BTreeMap::new(),
            capacity: 0,
            flags: HandleFlags::tracking(),
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    /// Sets the 16-bit intensity scale.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Sets the voxel spacing.
    pub fn with_spacing(mut self, spacing: [f64; 3]) -> Self {
        self.spacing = spacing;
        self
    }

    /// Sets the resident-set capacity.
    pub fn with_capacity(mut self, frames: usize) -> Self {
        self.capacity = frames;
        self
    }

    /// Appends a frame to the backing store and returns its index.
    pub fn push_frame(
        &mut self,
        intensity: IntensityBuffer,
        labels: Vec<u32>,
    ) -> Result<usize, EnvError> {
        let expected = self.dims.voxel_count();
        if intensity.len() != expected {
            return Err(EnvError::ShapeMismatch { expected, actual: intensity.len() });
        }
        if labels.len() != expected {
            return Err(EnvError::ShapeMismatch { expected, actual: labels.len() });
        }
        if intensity.view().bit_depth() != self.bits {
            return Err(EnvError::ShapeMismatch {
                expected: self.bits.bits() as usize,
                actual: intensity.view().bit_depth().bits() as usize,
            });
        }
        self.store.push(StoredFrame { intensity, labels });
        Ok(self.store.len() - 1)
    }

    /// Labels as persisted in the backing store.
    ///
    /// Edits to a resident frame show up here only after eviction or
    /// [`InMemoryCache::flush`].
    pub fn stored_labels(&self, frame: usize) -> Option<&[u32]> {
        self.store.get(frame).map(|f| f.labels.as_slice())
    }

    /// Writes every modified resident frame back to the store, when the
    /// handle flags save labels.
    pub fn flush(&mut self) {
        let save_label = self.flags.save_label;
        for (&frame, res) in self.resident.iter_mut() {
            if write_back(&mut self.store, &mut self.stats, save_label, frame, res) {
                res.modified = false;
            }
        }
    }

    /// Number of frames currently resident.
    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    /// Returns true if `frame` is resident.
    pub fn is_resident(&self, frame: usize) -> bool {
        self.resident.contains_key(&frame)
    }

    /// Traffic counters.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn evict_one(&mut self) -> bool {
        let honor_pins = self.flags.time_cond;
        let victim = self
            .resident
            .iter()
            .filter(|(_, r)| !(honor_pins && r.protected))
            .min_by_key(|(_, r)| r.last_used)
            .map(|(&f, _)| f);

        let Some(frame) = victim else {
            return false;
        };
        if let Some(res) = self.resident.remove(&frame) {
            write_back(&mut self.store, &mut self.stats, self.flags.save_label, frame, &res);
            self.stats.evictions += 1;
            debug!("Evicted frame {}", frame);
        }
        true
    }
}

/// Copies the labels of a modified resident frame into the store. Returns
/// true if they were saved.
fn write_back(
    store: &mut [StoredFrame],
    stats: &mut CacheStats,
    save_label: bool,
    frame: usize,
    res: &ResidentFrame,
) -> bool {
    if !res.modified || !save_label {
        return false;
    }
    let Some(stored) = store.get_mut(frame) else {
        return false;
    };
    stored.labels.copy_from_slice(&res.labels);
    stats.saves += 1;
    true
}

impl VolumeCache for InMemoryCache {
    fn dims(&self) -> VolumeDims {
        self.dims
    }

    fn bit_depth(&self) -> BitDepth {
        self.bits
    }

    fn scale(&self) -> f64 {
        self.scale
    }

    fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    fn frame_count(&self) -> usize {
        self.store.len()
    }

    fn load(&mut self, frame: usize) -> Result<(), EnvError> {
        if frame >= self.store.len() {
            return Err(EnvError::out_of_range(frame, self.store.len()));
        }
        self.clock += 1;
        let now = self.clock;
        if let Some(res) = self.resident.get_mut(&frame) {
            res.last_used = now;
            return Ok(());
        }

        while self.capacity > 0 && self.resident.len() >= self.capacity {
            if !self.evict_one() {
                warn!(
                    "All {} resident frames are protected, exceeding capacity {}",
                    self.resident.len(),
                    self.capacity
                );
                break;
            }
        }

        let stored = &self.store[frame];
        self.resident.insert(
            frame,
            ResidentFrame {
                intensity: stored.intensity.clone(),
                labels: stored.labels.clone(),
                modified: false,
                protected: false,
                last_used: now,
            },
        );
        self.stats.loads += 1;
        Ok(())
    }

    fn frame(&self, frame: usize) -> Option<FrameView<'_>> {
        self.resident.get(&frame).map(|r| FrameView {
            intensity: r.intensity.view(),
            labels: &r.labels,
        })
    }

    fn frame_mut(&mut self, frame: usize) -> Option<FrameViewMut<'_>> {
        self.resident.get_mut(&frame).map(|r| FrameViewMut {
            intensity: r.intensity.view(),
            labels: &mut r.labels,
        })
    }

    fn protect(&mut self, frame: usize) {
        if let Some(res) = self.resident.get_mut(&frame) {
            res.protected = true;
        }
    }

    fn unprotect(&mut self, frame: usize) {
        if let Some(res) = self.resident.get_mut(&frame) {
            res.protected = false;
        }
    }

    fn mark_modified(&mut self, frame: usize) {
        if let Some(res) = self.resident.get_mut(&frame) {
            res.modified = true;
        }
    }

    fn set_handle_flags(&mut self, flags: HandleFlags) {
        self.flags = flags;
    }

    fn set_capacity(&mut self, frames: usize) {
        self.capacity = frames;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cache_with_frames(n: usize) -> InMemoryCache {
        let dims = VolumeDims::new(2, 2, 1);
        let mut cache = InMemoryCache::new(dims, BitDepth::Eight);
        for f in 0..n {
            cache
                .push_frame(IntensityBuffer::U8(vec![200; 4]), vec![f as u32 + 1; 4])
                .unwrap();
        }
        cache
    }

    #[test]
    fn test_push_frame_rejects_bad_shape() {
        let mut cache = InMemoryCache::new(VolumeDims::new(2, 2, 1), BitDepth::Eight);
        let err = cache
            .push_frame(IntensityBuffer::U8(vec![0; 3]), vec![0; 4])
            .unwrap_err();
        assert_eq!(err, EnvError::ShapeMismatch { expected: 4, actual: 3 });
    }

    #[test]
    fn test_load_out_of_range() {
        let mut cache = cache_with_frames(1);
        assert!(matches!(
            cache.load(3),
            Err(EnvError::FrameOutOfRange { frame: 3, frames: 1 })
        ));
    }

    #[test]
    fn test_lru_eviction_skips_protected() {
        let mut cache = cache_with_frames(3).with_capacity(2);
        cache.load(0).unwrap();
        cache.protect(0);
        cache.load(1).unwrap();
        cache.load(2).unwrap();

        assert!(cache.is_resident(0));
        assert!(!cache.is_resident(1));
        assert!(cache.is_resident(2));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_modified_labels_written_back_on_eviction() {
        let mut cache = cache_with_frames(2).with_capacity(1);
        cache.load(0).unwrap();
        cache.frame_mut(0).unwrap().labels[0] = 0;
        cache.mark_modified(0);
        cache.load(1).unwrap();

        assert_eq!(cache.stored_labels(0).unwrap()[0], 0);
        assert_eq!(cache.stats().saves, 1);
    }

    #[test]
    fn test_unmodified_labels_not_saved() {
        let mut cache = cache_with_frames(2).with_capacity(1);
        cache.load(0).unwrap();
        cache.frame_mut(0).unwrap().labels[0] = 9;
        cache.load(1).unwrap();

        assert_eq!(cache.stored_labels(0).unwrap()[0], 1);
        assert_eq!(cache.stats().saves, 0);
    }

    #[test]
    fn test_flush_follows_save_flag() {
        let mut cache = cache_with_frames(1);
        cache.set_handle_flags(HandleFlags {
            save_label: false,
            ..HandleFlags::tracking()
        });
        cache.load(0).unwrap();
        cache.frame_mut(0).unwrap().labels[0] = 7;
        cache.mark_modified(0);

        cache.flush();
        assert_eq!(cache.stored_labels(0).unwrap()[0], 1);
        assert_eq!(cache.stats().saves, 0);

        cache.set_handle_flags(HandleFlags::tracking());
        cache.flush();
        assert_eq!(cache.stored_labels(0).unwrap()[0], 7);
        assert_eq!(cache.stats().saves, 1);
        cache.flush();
        assert_eq!(cache.stats().saves, 1);
    }

    #[test]
    fn test_eviction_follows_save_flag() {
        let mut cache = cache_with_frames(2).with_capacity(1);
        cache.set_handle_flags(HandleFlags {
            save_label: false,
            ..HandleFlags::tracking()
        });
        cache.load(0).unwrap();
        cache.frame_mut(0).unwrap().labels[0] = 7;
        cache.mark_modified(0);
        cache.load(1).unwrap();

        assert_eq!(cache.stored_labels(0).unwrap()[0], 1);
        assert_eq!(cache.stats().saves, 0);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_get_frame_buffers_loads() {
        let mut cache = cache_with_frames(2);
        let view = cache.get_frame_buffers(1).unwrap();
        assert_eq!(view.labels, &[2, 2, 2, 2]);
        assert_eq!(cache.stats().loads, 1);
    }

    proptest! {
        #[test]
        fn test_resident_set_respects_capacity_and_pins(
            capacity in 1usize..4,
            loads in prop::collection::vec(0usize..6, 1..40),
        ) {
            let mut cache = cache_with_frames(6).with_capacity(capacity);
            cache.load(0).unwrap();
            cache.protect(0);
            for f in loads {
                cache.load(f).unwrap();
                prop_assert!(cache.is_resident(0));
                prop_assert!(cache.resident_count() <= capacity.max(2));
                prop_assert!(cache.is_resident(f));
            }
        }
    }
}
