//! Error types for the tracking engine.

use fluotrack_env::EnvError;
use thiserror::Error;

/// Errors returned by [`crate::TrackMapProcessor`] operations.
///
/// Every variant is raised before any map state is touched, so a failed
/// call leaves the map as it was.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackError {
    /// Frame index past the end of the map or the cache
    #[error("Invalid frame {frame} (frames: {frames})")]
    InvalidFrame { frame: usize, frames: usize },

    /// A two-frame operation was given the same frame twice
    #[error("Frame {0} paired with itself")]
    SameFrame(usize),

    /// A two-frame operation was given frames that are not neighbors
    #[error("Frames {f1} and {f2} are not adjacent")]
    NotAdjacent { f1: usize, f2: usize },

    /// Frames must be initialized in order
    #[error("Expected frame {expected}, got {actual}")]
    NonSequentialFrame { expected: usize, actual: usize },

    /// The link graph for a frame pair was never built
    #[error("No link graph for frames {0} and {}", .0 + 1)]
    MissingGraph(usize),

    /// Configuration could not be loaded
    #[error("Config error: {0}")]
    Config(String),

    /// The volume cache or a clustering backend failed
    #[error(transparent)]
    Env(#[from] EnvError),
}

impl TrackError {
    /// Creates an invalid-frame error.
    pub fn invalid_frame(frame: usize, frames: usize) -> Self {
        Self::InvalidFrame { frame, frames }
    }

    /// Creates a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            TrackError::invalid_frame(5, 3).to_string(),
            "Invalid frame 5 (frames: 3)"
        );
        assert_eq!(
            TrackError::MissingGraph(2).to_string(),
            "No link graph for frames 2 and 3"
        );
        let env: TrackError = EnvError::CacheMiss(4).into();
        assert_eq!(env.to_string(), "Cache miss for frame 4");
    }
}
