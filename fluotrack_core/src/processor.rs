//! The tracking driver.
//!
//! [`TrackMapProcessor`] owns a [`TrackMap`] and the volume cache it is
//! built from. Its passes are spread over several modules:
//! - `initialize`: frame scanning, contact detection, inter-frame linking
//! - `relax`: per-vertex relaxation (`process_frames`)
//! - `resolve`: cell grouping, merges and splits
//! - `consistent`: id propagation across frames
//! - `edit`: user-driven link and cell edits
//!
//! This module holds the configuration, the shared primitives, and the two
//! top-level loops [`TrackMapProcessor::gen_map`] and
//! [`TrackMapProcessor::refine_map`].

use crate::clustering::{Dbscan, KmeansEm};
use crate::error::TrackError;
use crate::graph::LinkEdge;
use crate::track_map::{TrackMap, VolumeInfo};
use fluotrack_env::{HandleFlags, PointClusterer, ProgressObserver, VolumeCache};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Parameters of the clustering backends used by merge and split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// DBSCAN neighborhood radius in voxels (default: 1.8)
    pub eps: f64,

    /// DBSCAN core-point neighbor count (default: 3)
    pub min_points: usize,

    /// Iteration cap for k-means and EM (default: 25)
    pub max_iter: usize,

    /// Relative change below which k-means and EM stop (default: 1e-3)
    pub tolerance: f64,

    /// Mean membership probability an EM split must reach (default: 0.9)
    pub prob_tol: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            eps: 1.8,
            min_points: 3,
            max_iter: 25,
            tolerance: 1e-3,
            prob_tol: 0.9,
        }
    }
}

/// Tracking parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    /// Minimum voxel count to keep a cell or link a vertex (default: 25)
    pub size_thresh: f64,

    /// Minimum intensity for a contact to count (default: 0.6)
    pub contact_thresh: f64,

    /// Relative difference below which two sizes are similar (default: 0.2)
    pub similar_thresh: f64,

    /// Alternating-path depth when similarity is computed (default: 2)
    pub level_thresh: usize,

    /// Try merging uncertain neighbors (default: false)
    pub merge: bool,

    /// Try splitting uncertain vertices (default: false)
    pub split: bool,

    /// Global refinement passes after linking (default: 3)
    pub track_iterations: usize,

    /// Unify ids along links when done (default: true)
    pub consistent_color: bool,

    /// Seed of the relaxation's random schedule (default: 0)
    pub seed: u64,

    pub cluster: ClusterConfig,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            size_thresh: 25.0,
            contact_thresh: 0.6,
            similar_thresh: 0.2,
            level_thresh: 2,
            merge: false,
            split: false,
            track_iterations: 3,
            consistent_color: true,
            seed: 0,
            cluster: ClusterConfig::default(),
        }
    }
}

impl TrackConfig {
    /// Loads a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TrackError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TrackError::config(format!("{}: {}", path.as_ref().display(), e)))?;
        serde_json::from_str(&text).map_err(|e| TrackError::config(e.to_string()))
    }

    /// Relative difference of two non-negative magnitudes is below the
    /// similarity threshold. False when both are zero.
    pub fn similar(&self, a: f64, b: f64) -> bool {
        let max = a.max(b);
        max > 0.0 && (a - b).abs() / max < self.similar_thresh
    }

    /// Overlap weights are similar, or distances when both weights are zero.
    pub fn similar_edges(&self, e1: &LinkEdge, e2: &LinkEdge) -> bool {
        if e1.size_d > 0.0 || e2.size_d > 0.0 {
            self.similar(e1.size_d, e2.size_d)
        } else if e1.dist > 0.0 || e2.dist > 0.0 {
            self.similar(e1.dist, e2.dist)
        } else {
            true
        }
    }
}

/// Flip counts are close enough to belong to the same histogram mode.
pub(crate) fn similar_count(c1: u32, c2: u32) -> bool {
    let max = c1.max(c2);
    max > 0 && f64::from(c1.abs_diff(c2)) / f64::from(max) < 0.65
}

// ============================================================================
// PROCESSOR
// ============================================================================

/// State of the frame pair being relaxed.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PassState {
    /// Frame whose vertices are visited
    pub frame1: usize,
    /// Frame on the other side of the link graph
    pub frame2: usize,
    /// Flip count above which a vertex counts as uncertain
    pub count_min: u32,
    /// The uncertainty histogram's major mode has settled
    pub major_converge: bool,
}

/// Builds and refines a [`TrackMap`] from the frames of a volume cache.
///
/// Generic over the cache so the same engine runs against the in-memory
/// cache in tests and the simulator, or a disk-backed reader.
pub struct TrackMapProcessor<C>
where
    C: VolumeCache,
{
    pub(crate) map: TrackMap,
    pub(crate) cache: C,
    pub(crate) config: TrackConfig,
    pub(crate) rng: ChaCha8Rng,
    /// Density clusterer deciding whether neighbors form one blob
    pub(crate) merge_clusterer: Box<dyn PointClusterer>,
    /// Partitioning clusterer used to split a vertex
    pub(crate) split_clusterer: Box<dyn PointClusterer>,
    pub(crate) pass: PassState,
}

impl<C> TrackMapProcessor<C>
where
    C: VolumeCache,
{
    /// Creates a processor with an empty map sized after `cache`.
    pub fn new(cache: C, config: TrackConfig) -> Self {
        let info = VolumeInfo {
            dims: cache.dims(),
            bits: cache.bit_depth(),
            scale: cache.scale(),
            spacing: cache.spacing(),
        };
        let merge_clusterer: Box<dyn PointClusterer> = Box::new(Dbscan::new(
            config.cluster.eps,
            config.cluster.min_points,
            config.size_thresh.max(1.0) as usize,
        ));
        let split_clusterer: Box<dyn PointClusterer> = Box::new(KmeansEm::new(config.cluster));
        Self {
            map: TrackMap::new(info),
            cache,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            merge_clusterer,
            split_clusterer,
            pass: PassState::default(),
        }
    }

    /// Creates a processor with the default configuration.
    pub fn with_defaults(cache: C) -> Self {
        Self::new(cache, TrackConfig::default())
    }

    /// Replaces the merge clusterer.
    pub fn with_merge_clusterer(mut self, clusterer: Box<dyn PointClusterer>) -> Self {
        self.merge_clusterer = clusterer;
        self
    }

    /// Replaces the split clusterer.
    pub fn with_split_clusterer(mut self, clusterer: Box<dyn PointClusterer>) -> Self {
        self.split_clusterer = clusterer;
        self
    }

    /// Starts from an existing map, e.g. one loaded with the codec.
    pub fn with_map(mut self, map: TrackMap) -> Self {
        self.map = map;
        self
    }

    pub fn map(&self) -> &TrackMap {
        &self.map
    }

    /// Swaps in a new map and returns the old one.
    pub fn replace_map(&mut self, map: TrackMap) -> TrackMap {
        std::mem::replace(&mut self.map, map)
    }

    pub fn into_map(self) -> TrackMap {
        self.map
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut C {
        &mut self.cache
    }

    pub fn config(&self) -> &TrackConfig {
        &self.config
    }

    /// Updates the configuration. The random schedule is reseeded.
    pub fn set_config(&mut self, config: TrackConfig) {
        self.rng = ChaCha8Rng::seed_from_u64(config.seed);
        self.config = config;
    }

    // ------------------------------------------------------------------
    // Shared checks and primitives
    // ------------------------------------------------------------------

    pub(crate) fn check_frame(&self, frame: usize) -> Result<(), TrackError> {
        let frames = self.map.frame_count();
        if frame >= frames {
            return Err(TrackError::invalid_frame(frame, frames));
        }
        Ok(())
    }

    /// Both frames exist, differ, and are adjacent.
    pub(crate) fn check_pair(&self, f1: usize, f2: usize) -> Result<(), TrackError> {
        self.check_frame(f1)?;
        self.check_frame(f2)?;
        if f1 == f2 {
            return Err(TrackError::SameFrame(f1));
        }
        if f1.abs_diff(f2) != 1 {
            return Err(TrackError::NotAdjacent { f1, f2 });
        }
        Ok(())
    }

    /// Like [`Self::check_pair`], and the pair's link graph exists.
    pub(crate) fn check_linked_pair(&self, f1: usize, f2: usize) -> Result<(), TrackError> {
        self.check_pair(f1, f2)?;
        if self.map.inter_between(f1, f2).is_none() {
            return Err(TrackError::MissingGraph(f1.min(f2)));
        }
        Ok(())
    }

    /// Decides whether similarity is computed for a vertex this pass.
    ///
    /// Always true for the first four passes over a graph. Afterwards a
    /// vertex with flip count `count` is checked when
    /// `count < counter / 2 + uniform(0, counter)`, so vertices that flip
    /// rarely relative to the pass count are checked less often.
    pub(crate) fn get_random(&mut self, count: u32, counter: u32) -> bool {
        if counter < 4 {
            return true;
        }
        let r = counter / 2 + self.rng.gen_range(0..counter);
        count < r
    }

    /// Points the cache at the tracking policy.
    fn prepare_cache(&mut self) {
        self.cache.set_handle_flags(HandleFlags::tracking());
        self.cache.set_capacity(4);
    }

    // ------------------------------------------------------------------
    // Top-level loops
    // ------------------------------------------------------------------

    /// Builds the whole map from the cache.
    ///
    /// Initializes and links each frame in turn, resolving contacts and
    /// relaxing the two most recent pairs as it goes, then runs
    /// `track_iterations` global passes and the consistent-id pass.
    pub fn gen_map(&mut self, progress: &mut dyn ProgressObserver) -> Result<(), TrackError> {
        let frames = self.cache.frame_count();
        let ticks = ((self.config.track_iterations + 2) * frames.max(1)) as u64;
        let mut tick = 0u64;
        let percent = |t: u64| (100 * t / ticks).min(100) as u32;

        info!("Generating track map over {} frames", frames);
        progress.on_info("Generating track map.");
        self.prepare_cache();
        self.map.clear();

        for i in 0..frames {
            self.initialize_frame(i)?;
            progress.on_info(&format!("Time point {} initialized.", i));
            progress.on_progress(percent(tick), "Generating track map.");
            tick += 1;

            if i < 1 {
                continue;
            }
            self.link_frames(i - 1, i)?;
            self.resolve_graph(i - 1, i)?;
            self.resolve_graph(i, i - 1)?;
            progress.on_info(&format!("Time point {} linked.", i));

            if i < 2 {
                continue;
            }
            self.process_frames(i - 2, i - 1)?;
            self.process_frames(i - 1, i - 2)?;
        }
        if frames >= 2 {
            self.process_frames(frames - 2, frames - 1)?;
            self.process_frames(frames - 1, frames - 2)?;
        }

        for iteration in 0..self.config.track_iterations {
            for f in 1..frames {
                self.process_frames(f - 1, f)?;
                self.process_frames(f, f - 1)?;
                progress.on_progress(percent(tick), "Refining track map.");
                tick += 1;
            }
            debug!("Refinement iteration {} done", iteration);
        }

        if self.config.consistent_color && frames > 0 {
            self.make_consistent(0)?;
            for f in 1..frames {
                progress.on_info(&format!("Set colors for frame {}", f));
                progress.on_progress(percent(tick), "Unifying ids.");
                tick += 1;
                self.make_consistent_pair(f - 1, f)?;
            }
        }

        progress.on_progress(100, "Track map done.");
        info!(
            "Track map done: {} vertices, {} link graphs",
            self.map.vertex_total(),
            self.map.inter.len()
        );
        Ok(())
    }

    /// Re-runs relaxation on an existing map.
    ///
    /// With `frame = None` every pair is refined and the consistent-id pass
    /// covers all frames. With `Some(t)` only the pairs touching `t` are
    /// refined and ids are propagated from `t - 1` into `t`.
    pub fn refine_map(
        &mut self,
        frame: Option<usize>,
        progress: &mut dyn ProgressObserver,
    ) -> Result<(), TrackError> {
        let frames = self.map.frame_count();
        let (start, end) = match frame {
            Some(t) => {
                self.check_frame(t)?;
                (t, t)
            }
            None => (0, frames.saturating_sub(1)),
        };
        match frame {
            Some(t) => progress.on_info(&format!("Refining track map at time point {}", t)),
            None => progress.on_info("Refining track map for all time points."),
        }
        self.prepare_cache();

        let iterations = self.config.track_iterations.max(1);
        for iteration in 0..self.config.track_iterations {
            // pairs (i, i + 1) for i in start - 1 ..= end
            for i in start.saturating_sub(1)..=end {
                if i + 1 >= frames {
                    continue;
                }
                self.process_frames(i, i + 1)?;
                self.process_frames(i + 1, i)?;
            }
            progress.on_progress(
                (100 * (iteration + 1) / iterations) as u32,
                "Refining track map.",
            );
        }

        if self.config.consistent_color && frames > 0 {
            match frame {
                None => {
                    self.make_consistent(0)?;
                    for f in 1..frames {
                        self.make_consistent_pair(f - 1, f)?;
                    }
                }
                Some(t) if t > 0 => self.make_consistent_pair(t - 1, t)?,
                Some(_) => self.make_consistent(0)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluotrack_env::{BitDepth, InMemoryCache, VolumeDims};

    #[test]
    fn test_config_defaults() {
        let config = TrackConfig::default();
        assert_eq!(config.size_thresh, 25.0);
        assert_eq!(config.level_thresh, 2);
        assert!(config.consistent_color);
        assert!(!config.merge && !config.split);
        assert_eq!(config.cluster.min_points, 3);
    }

    #[test]
    fn test_config_partial_json() {
        let config: TrackConfig =
            serde_json::from_str(r#"{"split": true, "cluster": {"eps": 2.5}}"#).unwrap();
        assert!(config.split);
        assert_eq!(config.cluster.eps, 2.5);
        assert_eq!(config.cluster.max_iter, 25);
        assert_eq!(config.similar_thresh, 0.2);
    }

    #[test]
    fn test_config_missing_file() {
        let err = TrackConfig::from_json_file("/nonexistent/fluotrack.json").unwrap_err();
        assert!(matches!(err, TrackError::Config(_)));
    }

    #[test]
    fn test_similarity() {
        let config = TrackConfig::default();
        assert!(config.similar(100.0, 90.0));
        assert!(!config.similar(100.0, 70.0));
        assert!(!config.similar(0.0, 0.0));

        let a = LinkEdge { size_d: 0.0, dist: 4.0, ..Default::default() };
        let b = LinkEdge { size_d: 0.0, dist: 4.2, ..Default::default() };
        assert!(config.similar_edges(&a, &b));
        assert!(config.similar_edges(&LinkEdge::default(), &LinkEdge::default()));

        assert!(similar_count(10, 6));
        assert!(!similar_count(10, 2));
        assert!(!similar_count(0, 0));
    }

    #[test]
    fn test_get_random_early_passes_always_check() {
        let cache = InMemoryCache::new(VolumeDims::new(2, 2, 2), BitDepth::Eight);
        let mut proc = TrackMapProcessor::with_defaults(cache);
        for count in [0, 5, 1000] {
            assert!(proc.get_random(count, 3));
        }
        // count at or above 1.5x the pass counter is never checked
        for _ in 0..50 {
            assert!(!proc.get_random(30, 20));
            assert!(proc.get_random(9, 20));
        }
    }

    #[test]
    fn test_get_random_is_reproducible() {
        let draw = |seed: u64| {
            let cache = InMemoryCache::new(VolumeDims::new(2, 2, 2), BitDepth::Eight);
            let config = TrackConfig { seed, ..Default::default() };
            let mut proc = TrackMapProcessor::new(cache, config);
            (0..64).map(|i| proc.get_random(i % 16, 12)).collect::<Vec<_>>()
        };
        assert_eq!(draw(7), draw(7));
    }

    #[test]
    fn test_pair_checks() {
        let cache = InMemoryCache::new(VolumeDims::new(2, 2, 2), BitDepth::Eight);
        let mut proc = TrackMapProcessor::with_defaults(cache);
        proc.map.extend_frame_num();
        proc.map.extend_frame_num();
        proc.map.extend_frame_num();
        assert_eq!(proc.check_pair(1, 1), Err(TrackError::SameFrame(1)));
        assert_eq!(proc.check_pair(0, 2), Err(TrackError::NotAdjacent { f1: 0, f2: 2 }));
        assert!(matches!(proc.check_pair(2, 3), Err(TrackError::InvalidFrame { .. })));
        assert_eq!(proc.check_linked_pair(1, 0), Err(TrackError::MissingGraph(0)));
    }
}
