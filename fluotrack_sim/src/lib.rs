//! FluoTrack Simulation Harness
//!
//! Deterministic phantom volumes for exercising the tracking engine end to
//! end. Every run is reproducible from one 64-bit seed:
//! - **Phantoms**: labeled box-shaped cells with seeded intensity noise
//! - **Scenarios**: named situations with known ground truth
//! - **Runner**: tracks a scenario and checks the map against that truth
//!
//! # Usage
//!
//! ```ignore
//! use fluotrack_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let runner = ScenarioRunner::new(42).with_frames(6);
//! let result = runner.run(ScenarioId::DriftingCells);
//! assert!(result.passed);
//! ```

mod error;
mod exporter;
mod phantom;
mod runner;
pub mod scenarios;

pub use error::SimError;
pub use exporter::{CellRecord, FrameRecord, LinkRecord, TrackExport};
pub use phantom::{Blob, Phantom};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRun, ScenarioRunner, SimProcessor};
