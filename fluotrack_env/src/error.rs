//! Error types for the FluoTrack environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvError {
    /// Frame buffers are not resident and could not be loaded
    #[error("Cache miss for frame {0}")]
    CacheMiss(usize),

    /// Frame index outside the cached time series
    #[error("Frame {frame} out of range (frames: {frames})")]
    FrameOutOfRange { frame: usize, frames: usize },

    /// Buffer length does not match the volume dimensions
    #[error("Shape mismatch: expected {expected} voxels, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Clustering backend could not produce a partition
    #[error("Clustering error: {0}")]
    Clustering(String),
}

impl EnvError {
    /// Creates an out-of-range error.
    pub fn out_of_range(frame: usize, frames: usize) -> Self {
        Self::FrameOutOfRange { frame, frames }
    }

    /// Creates a clustering error.
    pub fn clustering(msg: impl Into<String>) -> Self {
        Self::Clustering(msg.into())
    }
}
