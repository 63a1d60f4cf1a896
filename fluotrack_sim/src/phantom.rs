//! Synthetic labeled volumes.
//!
//! A `Phantom` is a stack of frames, each a list of box-shaped blobs with a
//! label and a ground-truth track. Rendering fills an `InMemoryCache` with
//! 8-bit intensities (plus seeded Gaussian noise) and the matching labels.

use fluotrack_env::{BitDepth, EnvError, InMemoryCache, IntensityBuffer, VolumeDims};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// A labeled box in one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    /// Label written into the volume
    pub id: u32,

    /// Ground-truth lineage the blob belongs to
    pub track: u32,

    /// Lower corner (voxels)
    pub min: [usize; 3],

    /// Extent along x, y, z (voxels)
    pub size: [usize; 3],

    /// Mean 8-bit intensity
    pub intensity: u8,
}

impl Blob {
    /// A cube of edge `edge` at `min`.
    pub fn cube(id: u32, track: u32, min: [usize; 3], edge: usize, intensity: u8) -> Self {
        Self {
            id,
            track,
            min,
            size: [edge; 3],
            intensity,
        }
    }

    /// Voxel at the middle of the box.
    pub fn center(&self) -> [usize; 3] {
        [
            self.min[0] + self.size[0] / 2,
            self.min[1] + self.size[1] / 2,
            self.min[2] + self.size[2] / 2,
        ]
    }

    pub fn voxel_count(&self) -> usize {
        self.size.iter().product()
    }
}

/// Frames of blobs plus the settings needed to render them.
#[derive(Debug, Clone)]
pub struct Phantom {
    dims: VolumeDims,
    seed: u64,
    /// Standard deviation of the intensity noise (default: 0)
    noise_std: f64,
    frames: Vec<Vec<Blob>>,
}

impl Phantom {
    pub fn new(dims: VolumeDims, seed: u64) -> Self {
        Self {
            dims,
            seed,
            noise_std: 0.0,
            frames: Vec::new(),
        }
    }

    /// Sets the intensity noise. Negative values disable it.
    pub fn with_noise(mut self, std: f64) -> Self {
        self.noise_std = std.max(0.0);
        self
    }

    /// Appends a frame and returns its index. Later blobs overwrite earlier
    /// ones where they overlap.
    pub fn push_frame(&mut self, blobs: Vec<Blob>) -> usize {
        self.frames.push(blobs);
        self.frames.len() - 1
    }

    pub fn dims(&self) -> VolumeDims {
        self.dims
    }

    pub fn frames(&self) -> &[Vec<Blob>] {
        &self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Pairs of blobs on the same track in consecutive frames, with the
    /// earlier frame's index.
    pub fn truth_pairs(&self) -> Vec<(usize, &Blob, &Blob)> {
        let mut pairs = Vec::new();
        for (f, window) in self.frames.windows(2).enumerate() {
            for a in &window[0] {
                if let Some(b) = window[1].iter().find(|b| b.track == a.track) {
                    pairs.push((f, a, b));
                }
            }
        }
        pairs
    }

    /// Renders every frame into a fresh cache.
    pub fn render(&self) -> Result<InMemoryCache, EnvError> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let noise = Normal::new(0.0, self.noise_std).ok();
        let mut cache = InMemoryCache::new(self.dims, BitDepth::Eight);

        for blobs in &self.frames {
            let mut data = vec![0u8; self.dims.voxel_count()];
            let mut labels = vec![0u32; self.dims.voxel_count()];
            for blob in blobs {
                let hi = [
                    (blob.min[0] + blob.size[0]).min(self.dims.nx),
                    (blob.min[1] + blob.size[1]).min(self.dims.ny),
                    (blob.min[2] + blob.size[2]).min(self.dims.nz),
                ];
                for k in blob.min[2]..hi[2] {
                    for j in blob.min[1]..hi[1] {
                        for i in blob.min[0]..hi[0] {
                            let index = self.dims.index(i, j, k);
                            let jitter = noise.as_ref().map_or(0.0, |n| n.sample(&mut rng));
                            data[index] = (f64::from(blob.intensity) + jitter).round().clamp(1.0, 255.0) as u8;
                            labels[index] = blob.id;
                        }
                    }
                }
            }
            cache.push_frame(IntensityBuffer::U8(data), labels)?;
        }
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluotrack_env::VolumeCache;

    fn two_frames() -> Phantom {
        let mut phantom = Phantom::new(VolumeDims::new(12, 12, 6), 7).with_noise(10.0);
        phantom.push_frame(vec![Blob::cube(1, 1, [1, 1, 1], 3, 200), Blob::cube(2, 2, [7, 7, 1], 3, 200)]);
        phantom.push_frame(vec![Blob::cube(5, 2, [7, 6, 1], 3, 200)]);
        phantom
    }

    #[test]
    fn test_render_labels_match_blobs() {
        let phantom = two_frames();
        let mut cache = phantom.render().unwrap();
        assert_eq!(cache.frame_count(), 2);

        let dims = phantom.dims();
        let view = cache.get_frame_buffers(0).unwrap();
        let ones = view.labels.iter().filter(|&&l| l == 1).count();
        assert_eq!(ones, 27);
        assert_eq!(view.labels[dims.index(8, 8, 2)], 2);
        assert_eq!(view.labels[dims.index(0, 0, 0)], 0);
        assert_eq!(view.intensity.value(dims.index(0, 0, 0), 1.0), 0.0);
        assert!(view.intensity.value(dims.index(2, 2, 2), 1.0) > 0.0);
    }

    #[test]
    fn test_render_is_seeded() {
        let a = two_frames().render().unwrap();
        let b = two_frames().render().unwrap();
        let c = {
            let mut p = Phantom::new(VolumeDims::new(12, 12, 6), 8).with_noise(10.0);
            p.frames = two_frames().frames;
            p.render().unwrap()
        };
        let values = |mut cache: InMemoryCache| {
            let view = cache.get_frame_buffers(0).unwrap();
            (0..view.labels.len()).map(|i| view.intensity.value(i, 1.0)).collect::<Vec<f64>>()
        };
        let va = values(a);
        assert_eq!(va, values(b));
        assert_ne!(va, values(c));
    }

    #[test]
    fn test_truth_pairs_follow_tracks() {
        let phantom = two_frames();
        let pairs = phantom.truth_pairs();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, 0);
        assert_eq!((pairs[0].1.id, pairs[0].2.id), (2, 5));
    }

    #[test]
    fn test_blob_center() {
        let blob = Blob::cube(1, 1, [2, 4, 6], 5, 100);
        assert_eq!(blob.center(), [4, 6, 8]);
        assert_eq!(blob.voxel_count(), 125);
    }
}
