//! Tracking scenarios and the phantoms behind them.

use crate::phantom::{Blob, Phantom};
use fluotrack_env::VolumeDims;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// One static cell relabeled every frame
    IsolatedCell,

    /// Two cells whose footprints overlap both successors
    AmbiguousSwap,

    /// Two separate cells wrongly fused into one vertex
    CellSplit,

    /// Many cells drifting on random walks
    DriftingCells,

    /// Drifting cells written to the binary format and read back
    RoundTrip,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::IsolatedCell,
            ScenarioId::AmbiguousSwap,
            ScenarioId::CellSplit,
            ScenarioId::DriftingCells,
            ScenarioId::RoundTrip,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::IsolatedCell => "isolated_cell",
            ScenarioId::AmbiguousSwap => "ambiguous_swap",
            ScenarioId::CellSplit => "cell_split",
            ScenarioId::DriftingCells => "drifting_cells",
            ScenarioId::RoundTrip => "round_trip",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::IsolatedCell => "5x5x5 cell labeled 100, 200, 300.. must link and end as 100 everywhere",
            ScenarioId::AmbiguousSwap => "two cells each overlapping both successors; relaxation must cut valence to 1",
            ScenarioId::CellSplit => "fused vertex of two distant blobs must split and relink both ways",
            ScenarioId::DriftingCells => "seeded random walks; every true link kept and ids unified",
            ScenarioId::RoundTrip => "binary export then import reproduces the map",
        }
    }

    /// Fewest frames the scenario needs.
    pub fn min_frames(&self) -> usize {
        match self {
            ScenarioId::AmbiguousSwap => 2,
            ScenarioId::IsolatedCell | ScenarioId::CellSplit => 3,
            ScenarioId::DriftingCells | ScenarioId::RoundTrip => 2,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "isolated_cell" | "isolated" => Ok(ScenarioId::IsolatedCell),
            "ambiguous_swap" | "swap" => Ok(ScenarioId::AmbiguousSwap),
            "cell_split" | "split" => Ok(ScenarioId::CellSplit),
            "drifting_cells" | "drift" => Ok(ScenarioId::DriftingCells),
            "round_trip" | "roundtrip" => Ok(ScenarioId::RoundTrip),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

// ============================================================================
// PHANTOMS
// ============================================================================

/// Intensity of every scenario blob, well above the contact threshold.
pub const CELL_INTENSITY: u8 = 200;

/// Corner of the isolated cell.
pub const ISOLATED_MIN: [usize; 3] = [5, 5, 1];

/// One 5x5x5 cell at the same place in every frame, labeled `100 * (f + 1)`.
pub fn isolated_cell(frames: usize, seed: u64, noise: f64) -> Phantom {
    let mut phantom = Phantom::new(VolumeDims::new(16, 16, 8), seed).with_noise(noise);
    for f in 0..frames {
        let id = 100 * (f as u32 + 1);
        phantom.push_frame(vec![Blob::cube(id, 1, ISOLATED_MIN, 5, CELL_INTENSITY)]);
    }
    phantom
}

/// Frame 0: columns 1 and 2, side by side.
/// Frame 1: bars 3 and 4, each reaching over both columns. Bar 3 sits
/// mostly over column 1 and bar 4 mostly over column 2.
///
/// Both columns start with two soft links; the weaker one of each is
/// clearly weaker, so one round of relaxation settles the pair.
pub fn ambiguous_swap(seed: u64, noise: f64) -> Phantom {
    let mut phantom = Phantom::new(VolumeDims::new(16, 16, 8), seed).with_noise(noise);
    let column = |id: u32, x: usize| Blob {
        id,
        track: id,
        min: [x, 4, 2],
        size: [4, 8, 4],
        intensity: CELL_INTENSITY,
    };
    let bar = |id: u32, track: u32, min: [usize; 2], size: [usize; 2]| Blob {
        id,
        track,
        min: [min[0], min[1], 2],
        size: [size[0], size[1], 4],
        intensity: CELL_INTENSITY,
    };
    phantom.push_frame(vec![column(1, 2), column(2, 10)]);
    phantom.push_frame(vec![bar(3, 1, [2, 3], [10, 4]), bar(4, 2, [4, 8], [10, 4])]);
    phantom
}

/// Two cubes far apart along x in every frame; the middle frame's pair is
/// what gets fused.
pub fn cell_split(frames: usize, seed: u64, noise: f64) -> Phantom {
    let mut phantom = Phantom::new(VolumeDims::new(40, 12, 8), seed).with_noise(noise);
    for f in 0..frames {
        let base = 10 * f as u32;
        phantom.push_frame(vec![
            Blob::cube(base + 1, 1, [2, 3, 2], 5, CELL_INTENSITY),
            Blob::cube(base + 2, 2, [31, 3, 2], 5, CELL_INTENSITY),
        ]);
    }
    phantom
}

/// Side of the square slot each drifting cell lives in.
const SLOT: usize = 16;
/// Farthest a drifting cell strays from its start, per axis.
const MAX_DRIFT: i64 = 4;

/// `tracks` cubes on a grid of slots, each taking a seeded random walk of
/// at most one voxel per axis per frame. Labels change every frame.
pub fn drifting_cells(frames: usize, tracks: usize, seed: u64, noise: f64) -> Phantom {
    let per_row = ((tracks as f64).sqrt().ceil() as usize).max(1);
    let rows = tracks.div_ceil(per_row).max(1);
    let dims = VolumeDims::new(per_row * SLOT, rows * SLOT, 10);
    let mut phantom = Phantom::new(dims, seed).with_noise(noise);

    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15));
    let mut offsets = vec![[0i64; 2]; tracks];
    let edges: Vec<usize> = (0..tracks).map(|_| rng.gen_range(4..=5)).collect();

    for f in 0..frames {
        let mut blobs = Vec::with_capacity(tracks);
        for (t, offset) in offsets.iter_mut().enumerate() {
            if f > 0 {
                for axis in offset.iter_mut() {
                    *axis = (*axis + rng.gen_range(-1..=1)).clamp(-MAX_DRIFT, MAX_DRIFT);
                }
            }
            let slot = [(t % per_row) * SLOT, (t / per_row) * SLOT];
            let min = [
                (slot[0] as i64 + 5 + offset[0]) as usize,
                (slot[1] as i64 + 5 + offset[1]) as usize,
                2,
            ];
            let id = (f * tracks + t + 1) as u32;
            blobs.push(Blob::cube(id, t as u32 + 1, min, edges[t], CELL_INTENSITY));
        }
        phantom.push_frame(blobs);
    }
    phantom
}
