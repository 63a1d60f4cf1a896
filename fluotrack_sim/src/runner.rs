//! Scenario runner - renders a phantom, tracks it, checks the outcome.

use crate::error::SimError;
use crate::phantom::Phantom;
use crate::scenarios::{self, ScenarioId};

use fluotrack_core::{decode_map, encode_map, LinkState, MapSummary, NodeKey, TrackConfig, TrackMapProcessor};
use fluotrack_env::{InMemoryCache, VolumeCache};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Processor type every scenario runs.
pub type SimProcessor = TrackMapProcessor<InMemoryCache>;

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Frames in the phantom
    pub frames: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Totals over the final map
    pub summary: MapSummary,

    /// Share of ground-truth successions found as links
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_recall: Option<f64>,

    /// Share of ground-truth successions carrying the same label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_consistency: Option<f64>,

    /// Links that join different ground-truth tracks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub false_links: Option<usize>,

    /// Size of the binary track map
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_bytes: Option<usize>,

    /// Frames loaded into the resident set
    pub cache_loads: u64,

    /// Label buffers written back
    pub cache_saves: u64,
}

/// A finished scenario together with the processor it ran on.
pub struct ScenarioRun {
    pub result: ScenarioResult,
    pub processor: SimProcessor,
}

/// Collects failed expectations.
#[derive(Debug, Default)]
struct Checks {
    failures: Vec<String>,
}

impl Checks {
    fn expect(&mut self, ok: bool, what: impl FnOnce() -> String) {
        if !ok {
            self.failures.push(what());
        }
    }

    fn reason(&self) -> Option<String> {
        (!self.failures.is_empty()).then(|| self.failures.join("; "))
    }
}

/// Debug-logs tracker progress.
fn log_progress(percent: u32, status: &str) {
    debug!("{:>3}% {}", percent, status);
}

/// Label under voxel `at` of `frame`, read back through the cache.
fn label_at(proc: &mut SimProcessor, frame: usize, at: [usize; 3]) -> Result<u32, SimError> {
    let dims = proc.map().info().dims;
    let view = proc.cache_mut().get_frame_buffers(frame)?;
    Ok(view.labels[dims.index(at[0], at[1], at[2])])
}

/// Ground-truth agreement of the tracked map.
#[derive(Debug, Clone, Copy, PartialEq)]
struct TruthScore {
    recall: f64,
    consistency: f64,
    false_links: usize,
}

/// Scores links and labels against the phantom's tracks, sampling each
/// blob at its center voxel.
fn score_against_truth(proc: &mut SimProcessor, phantom: &Phantom) -> Result<TruthScore, SimError> {
    let pairs = phantom.truth_pairs();
    let mut found = 0usize;
    let mut same_label = 0usize;
    for &(f, a, b) in &pairs {
        let la = label_at(proc, f, a.center())?;
        let lb = label_at(proc, f + 1, b.center())?;
        if la != 0 && la == lb {
            same_label += 1;
        }
        let map = proc.map();
        let (Some(va), Some(vb)) = (map.vertex_id_of_cell(f, la), map.vertex_id_of_cell(f + 1, lb)) else {
            continue;
        };
        if map.linked_vertices(f, va, f + 1).contains(&vb) {
            found += 1;
        }
    }
    let summary = proc.map().summary();
    let total = pairs.len().max(1) as f64;
    Ok(TruthScore {
        recall: if pairs.is_empty() { 1.0 } else { found as f64 / total },
        consistency: if pairs.is_empty() { 1.0 } else { same_label as f64 / total },
        false_links: (summary.linked + summary.forced).saturating_sub(found),
    })
}

/// Runs tracking scenarios.
pub struct ScenarioRunner {
    /// Seed of the phantom noise, the walks and the tracker
    seed: u64,

    /// Frame count override; scenarios pick their own when unset
    frames: Option<usize>,

    /// Tracker configuration
    config: TrackConfig,

    /// Intensity noise standard deviation (8-bit units)
    noise_std: f64,

    /// Cells in the drifting scenarios
    tracks: usize,
}

impl ScenarioRunner {
    /// Creates a new scenario runner with the default tracker config.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            frames: None,
            config: TrackConfig {
                seed,
                ..Default::default()
            },
            noise_std: 4.0,
            tracks: 6,
        }
    }

    /// Sets the frame count. Scenarios needing more frames ignore it.
    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Sets the number of global refinement passes.
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.config.track_iterations = iterations;
        self
    }

    /// Replaces the tracker config. The runner's seed still drives it.
    pub fn with_config(mut self, config: TrackConfig) -> Self {
        self.config = TrackConfig {
            seed: self.seed,
            ..config
        };
        self
    }

    /// Sets the intensity noise.
    pub fn with_noise(mut self, std: f64) -> Self {
        self.noise_std = std;
        self
    }

    /// Sets the number of drifting cells.
    pub fn with_tracks(mut self, tracks: usize) -> Self {
        self.tracks = tracks.max(1);
        self
    }

    pub fn config(&self) -> &TrackConfig {
        &self.config
    }

    /// Runs a scenario and returns the result. Errors become failures.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        match self.run_scenario(scenario) {
            Ok(run) => run.result,
            Err(e) => {
                warn!("Scenario {} aborted: {}", scenario, e);
                ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    frames: 0,
                    failure_reason: Some(e.to_string()),
                    metrics: ScenarioMetrics::default(),
                }
            }
        }
    }

    /// Runs a scenario and hands back the processor with the final map.
    pub fn run_scenario(&self, scenario: ScenarioId) -> Result<ScenarioRun, SimError> {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        match scenario {
            ScenarioId::IsolatedCell => self.run_isolated_cell(),
            ScenarioId::AmbiguousSwap => self.run_ambiguous_swap(),
            ScenarioId::CellSplit => self.run_cell_split(),
            ScenarioId::DriftingCells => self.run_drifting_cells(),
            ScenarioId::RoundTrip => self.run_round_trip(),
        }
    }

    fn frame_count(&self, scenario: ScenarioId, default: usize) -> usize {
        self.frames.unwrap_or(default).max(scenario.min_frames())
    }

    fn processor(&self, phantom: &Phantom, config: TrackConfig) -> Result<SimProcessor, SimError> {
        Ok(TrackMapProcessor::new(phantom.render()?, config))
    }

    fn finish(
        &self,
        scenario: ScenarioId,
        processor: SimProcessor,
        checks: Checks,
        mut metrics: ScenarioMetrics,
    ) -> ScenarioRun {
        let stats = processor.cache().stats();
        metrics.summary = processor.map().summary();
        metrics.cache_loads = stats.loads;
        metrics.cache_saves = stats.saves;
        let failure_reason = checks.reason();
        ScenarioRun {
            result: ScenarioResult {
                scenario,
                seed: self.seed,
                passed: failure_reason.is_none(),
                frames: processor.map().frame_count(),
                failure_reason,
                metrics,
            },
            processor,
        }
    }

    /// One cell relabeled every frame. Consecutive vertices must be soft
    /// linked and, with id unification on, carry the first frame's label.
    fn run_isolated_cell(&self) -> Result<ScenarioRun, SimError> {
        let scenario = ScenarioId::IsolatedCell;
        let frames = self.frame_count(scenario, 3);
        let phantom = scenarios::isolated_cell(frames, self.seed, self.noise_std);
        let mut proc = self.processor(&phantom, self.config.clone())?;
        proc.gen_map(&mut log_progress)?;

        let center = phantom.frames()[0][0].center();
        let labels = (0..frames)
            .map(|f| label_at(&mut proc, f, center))
            .collect::<Result<Vec<u32>, SimError>>()?;

        let mut checks = Checks::default();
        let map = proc.map();
        for f in 0..frames - 1 {
            let link = map
                .inter_graph(f)
                .and_then(|ig| ig.graph.edge(NodeKey::new(f, labels[f]), NodeKey::new(f + 1, labels[f + 1])))
                .map(|e| e.link);
            checks.expect(link == Some(LinkState::Linked), || {
                format!("frames {}-{} link is {:?}", f, f + 1, link)
            });
        }
        if self.config.consistent_color {
            checks.expect(labels.iter().all(|&l| l == 100), || format!("labels {:?}, want 100", labels));
            let ids: Vec<u32> = map.frames().iter().flat_map(|d| d.cells().keys().copied()).collect();
            checks.expect(ids.iter().all(|&id| id == 100), || format!("cell ids {:?}", ids));
        }
        Ok(self.finish(scenario, proc, checks, ScenarioMetrics::default()))
    }

    /// Two columns each overlapping both bars of the next frame. Linking
    /// leaves both with two soft links; relaxation must bring each to one.
    fn run_ambiguous_swap(&self) -> Result<ScenarioRun, SimError> {
        let scenario = ScenarioId::AmbiguousSwap;
        let phantom = scenarios::ambiguous_swap(self.seed, self.noise_std);
        let mut proc = self.processor(&phantom, self.config.clone())?;
        proc.initialize_frame(0)?;
        proc.initialize_frame(1)?;
        proc.link_frames(0, 1)?;

        let columns: Vec<u32> = phantom.frames()[0].iter().map(|b| b.id).collect();
        let valence = |proc: &SimProcessor| -> Vec<usize> {
            columns
                .iter()
                .map(|&id| proc.map().inter_graph(0).map_or(0, |ig| ig.linked_valence(NodeKey::new(0, id))))
                .collect()
        };

        let mut checks = Checks::default();
        let before = valence(&proc);
        checks.expect(before.iter().all(|&v| v == 2), || format!("initial valence {:?}", before));

        proc.refine_map(None, &mut log_progress)?;
        let after = valence(&proc);
        debug!("Valence {:?} -> {:?}", before, after);
        checks.expect(after.iter().all(|&v| v <= 1), || format!("valence {:?} after relaxation", after));
        checks.expect(after.iter().zip(&before).all(|(a, b)| a < b), || {
            format!("valence {:?} did not drop from {:?}", after, before)
        });

        let score = score_against_truth(&mut proc, &phantom)?;
        let metrics = ScenarioMetrics {
            link_recall: Some(score.recall),
            false_links: Some(score.false_links),
            ..Default::default()
        };
        Ok(self.finish(scenario, proc, checks, metrics))
    }

    /// Fuses the middle frame's two distant cells into one vertex, splits
    /// it again and checks both halves are relinked on both sides.
    fn run_cell_split(&self) -> Result<ScenarioRun, SimError> {
        let scenario = ScenarioId::CellSplit;
        let frames = self.frame_count(scenario, 3);
        let phantom = scenarios::cell_split(frames, self.seed, self.noise_std);
        let config = TrackConfig {
            split: true,
            ..self.config.clone()
        };
        let mut proc = self.processor(&phantom, config)?;
        for f in 0..frames {
            proc.initialize_frame(f)?;
            if f > 0 {
                proc.link_frames(f - 1, f)?;
            }
        }

        let mid = frames / 2;
        let (keep, other) = (phantom.frames()[mid][0].id, phantom.frames()[mid][1].id);
        let fused_key = NodeKey::new(mid, keep);
        let mut checks = Checks::default();
        checks.expect(proc.combine_cells(mid, keep, &[other])?, || "cells not combined".to_string());

        let fused_size = proc
            .map()
            .frame(mid)
            .and_then(|d| d.vertex(keep))
            .map_or(0, |v| v.size_ui);
        let graphs = [mid - 1, mid];
        for gi in graphs {
            let valence = proc.map().inter_graph(gi).map_or(0, |ig| ig.linked_valence(fused_key));
            checks.expect(valence == 2, || format!("fused vertex has {} links in graph {}", valence, gi));
        }

        let split = proc.split_vertex(fused_key, 2)?;
        checks.expect(split, || "split declined".to_string());

        let data = &proc.map().frames()[mid];
        let halves: Vec<(u32, u32)> = data.vertices().values().map(|v| (v.id, v.size_ui)).collect();
        checks.expect(halves.len() == 2, || format!("split produced {:?}", halves));
        let total: u32 = halves.iter().map(|&(_, s)| s).sum();
        checks.expect(total == fused_size, || format!("split sizes {} != fused {}", total, fused_size));
        for &(id, _) in &halves {
            for gi in graphs {
                let valence = proc
                    .map()
                    .inter_graph(gi)
                    .map_or(0, |ig| ig.linked_valence(NodeKey::new(mid, id)));
                checks.expect(valence == 1, || format!("half {} has {} links in graph {}", id, valence, gi));
            }
        }

        proc.refine_map(None, &mut log_progress)?;
        let score = score_against_truth(&mut proc, &phantom)?;
        checks.expect(score.recall == 1.0, || format!("link recall {:.2}", score.recall));
        if self.config.consistent_color {
            checks.expect(score.consistency == 1.0, || format!("id consistency {:.2}", score.consistency));
        }
        let metrics = ScenarioMetrics {
            link_recall: Some(score.recall),
            id_consistency: Some(score.consistency),
            false_links: Some(score.false_links),
            ..Default::default()
        };
        Ok(self.finish(scenario, proc, checks, metrics))
    }

    fn drifting_map(&self, scenario: ScenarioId) -> Result<(Phantom, SimProcessor), SimError> {
        let frames = self.frame_count(scenario, 5);
        let phantom = scenarios::drifting_cells(frames, self.tracks, self.seed, self.noise_std);
        let mut proc = self.processor(&phantom, self.config.clone())?;
        proc.gen_map(&mut log_progress)?;
        Ok((phantom, proc))
    }

    /// Every true succession must be linked, nothing else, and labels
    /// must agree along each track.
    fn run_drifting_cells(&self) -> Result<ScenarioRun, SimError> {
        let scenario = ScenarioId::DriftingCells;
        let (phantom, mut proc) = self.drifting_map(scenario)?;
        let score = score_against_truth(&mut proc, &phantom)?;

        let mut checks = Checks::default();
        checks.expect(score.recall == 1.0, || format!("link recall {:.2}", score.recall));
        checks.expect(score.false_links == 0, || format!("{} false links", score.false_links));
        if self.config.consistent_color {
            checks.expect(score.consistency == 1.0, || format!("id consistency {:.2}", score.consistency));
        }
        let metrics = ScenarioMetrics {
            link_recall: Some(score.recall),
            id_consistency: Some(score.consistency),
            false_links: Some(score.false_links),
            ..Default::default()
        };
        Ok(self.finish(scenario, proc, checks, metrics))
    }

    /// Encodes the drifting map, decodes it and compares.
    fn run_round_trip(&self) -> Result<ScenarioRun, SimError> {
        let scenario = ScenarioId::RoundTrip;
        let (_, proc) = self.drifting_map(scenario)?;
        let original = proc.map();
        let bytes = encode_map(original)?;
        let decoded = decode_map(&bytes, *original.info())?;

        let mut checks = Checks::default();
        checks.expect(decoded.frames() == original.frames(), || "frames differ".to_string());
        checks.expect(decoded.counter() == original.counter(), || "counter differs".to_string());
        checks.expect(decoded.inter_graphs().len() == original.inter_graphs().len(), || {
            "link graph count differs".to_string()
        });
        for (a, b) in original.inter_graphs().iter().zip(decoded.inter_graphs()) {
            checks.expect(a.index == b.index && a.counter == b.counter && a.graph == b.graph, || {
                format!("link graph {} differs", a.index)
            });
        }
        checks.expect(encode_map(&decoded)? == bytes, || "re-encoding differs".to_string());

        let metrics = ScenarioMetrics {
            encoded_bytes: Some(bytes.len()),
            ..Default::default()
        };
        Ok(self.finish(scenario, proc, checks, metrics))
    }
}
