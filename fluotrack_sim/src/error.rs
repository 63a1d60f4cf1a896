//! Errors raised by the simulator.

use fluotrack_core::{CodecError, TrackError};
use fluotrack_env::EnvError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tracking failed: {0}")]
    Track(#[from] TrackError),

    #[error("Track map file: {0}")]
    Codec(#[from] CodecError),

    #[error("Volume error: {0}")]
    Env(#[from] EnvError),

    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),
}
