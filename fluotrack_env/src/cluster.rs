//! Point-clustering seam used by merge and split resolution.

use crate::EnvError;
use serde::{Deserialize, Serialize};

/// One voxel sample handed to a clusterer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterPoint {
    /// Voxel coordinates in the frame grid
    pub voxel: [u32; 3],

    /// Physical position (voxel coordinates times spacing)
    pub position: [f64; 3],

    /// Normalized intensity
    pub intensity: f64,
}

impl ClusterPoint {
    /// Creates a sample at `voxel` scaled by `spacing`.
    pub fn new(voxel: [u32; 3], spacing: [f64; 3], intensity: f64) -> Self {
        Self {
            voxel,
            position: [
                voxel[0] as f64 * spacing[0],
                voxel[1] as f64 * spacing[1],
                voxel[2] as f64 * spacing[2],
            ],
            intensity,
        }
    }
}

/// Result of clustering a point set.
///
/// `labels[i]` is the cluster of point `i`, or `None` for noise.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Partition {
    pub labels: Vec<Option<usize>>,
    pub clusters: usize,
}

impl Partition {
    /// Indices of the points assigned to `cluster`.
    pub fn members(&self, cluster: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter_map(|(i, l)| (*l == Some(cluster)).then_some(i))
            .collect()
    }

    /// Number of points assigned to `cluster`.
    pub fn size(&self, cluster: usize) -> usize {
        self.labels.iter().filter(|l| **l == Some(cluster)).count()
    }
}

/// A point-clustering backend.
///
/// # Implementations
///
/// - **Density based**: called with `target = None`, returns however many
///   clusters the density criterion finds
/// - **Partitioning**: called with `target = Some(k)`, returns at most `k`
pub trait PointClusterer {
    /// Clusters `points`.
    fn cluster(
        &mut self,
        points: &[ClusterPoint],
        target: Option<usize>,
    ) -> Result<Partition, EnvError>;
}
