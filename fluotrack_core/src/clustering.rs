//! Clustering backends behind [`PointClusterer`].
//!
//! - [`Dbscan`]: density clustering over a spatial hash, used to decide
//!   whether a group of cells forms a single blob
//! - [`KMeans`]: deterministic Lloyd iterations with farthest-point seeding
//! - [`ExpectationMax`]: 3-D Gaussian mixture refinement of a hard
//!   assignment, accepted only when memberships are confident
//! - [`KmeansEm`]: k-means seeding followed by EM, used to split a vertex
//!
//! Partitioning backends report a failed or unconfident fit as
//! [`EnvError::Clustering`]; callers treat that as "no action".

use crate::processor::ClusterConfig;
use fluotrack_env::{ClusterPoint, EnvError, Partition, PointClusterer};
use nalgebra::{Matrix3, Vector3};
use std::collections::HashMap;

fn position(p: &ClusterPoint) -> Vector3<f64> {
    Vector3::new(p.position[0], p.position[1], p.position[2])
}

// ============================================================================
// DBSCAN
// ============================================================================

type GridKey = [i64; 3];

/// Uniform grid of point indices with cell size `eps`.
struct SpatialHash {
    cells: HashMap<GridKey, Vec<usize>>,
    cell_size: f64,
}

impl SpatialHash {
    fn build(points: &[ClusterPoint], cell_size: f64) -> Self {
        let mut cells: HashMap<GridKey, Vec<usize>> = HashMap::new();
        for (i, p) in points.iter().enumerate() {
            cells.entry(Self::key(p, cell_size)).or_default().push(i);
        }
        Self { cells, cell_size }
    }

    fn key(p: &ClusterPoint, cell_size: f64) -> GridKey {
        [
            (p.position[0] / cell_size).floor() as i64,
            (p.position[1] / cell_size).floor() as i64,
            (p.position[2] / cell_size).floor() as i64,
        ]
    }

    /// Indices of points within `radius` of point `i`, including `i`.
    fn within(&self, points: &[ClusterPoint], i: usize, radius: f64) -> Vec<usize> {
        let center = position(&points[i]);
        let [x, y, z] = Self::key(&points[i], self.cell_size);
        let r2 = radius * radius;
        let mut found = Vec::new();
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let Some(bucket) = self.cells.get(&[x + dx, y + dy, z + dz]) else {
                        continue;
                    };
                    found.extend(
                        bucket
                            .iter()
                            .copied()
                            .filter(|&j| (position(&points[j]) - center).norm_squared() <= r2),
                    );
                }
            }
        }
        found
    }
}

/// Density-based clustering.
///
/// A point with at least `min_points` neighbors within `eps` (itself
/// included) is a core point; clusters grow from core points. Clusters
/// with fewer than `min_size` points are returned as noise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dbscan {
    pub eps: f64,
    pub min_points: usize,
    pub min_size: usize,
}

impl Dbscan {
    pub fn new(eps: f64, min_points: usize, min_size: usize) -> Self {
        Self {
            eps,
            min_points,
            min_size,
        }
    }
}

impl PointClusterer for Dbscan {
    fn cluster(
        &mut self,
        points: &[ClusterPoint],
        _target: Option<usize>,
    ) -> Result<Partition, EnvError> {
        if self.eps <= 0.0 {
            return Err(EnvError::clustering("DBSCAN radius must be positive"));
        }
        let hash = SpatialHash::build(points, self.eps);
        let mut labels: Vec<Option<usize>> = vec![None; points.len()];
        let mut visited = vec![false; points.len()];
        let mut clusters = 0usize;

        for i in 0..points.len() {
            if visited[i] {
                continue;
            }
            visited[i] = true;
            let seeds = hash.within(points, i, self.eps);
            if seeds.len() < self.min_points {
                continue;
            }
            let id = clusters;
            clusters += 1;
            labels[i] = Some(id);

            let mut queue = seeds;
            while let Some(j) = queue.pop() {
                if labels[j].is_none() {
                    labels[j] = Some(id);
                }
                if visited[j] {
                    continue;
                }
                visited[j] = true;
                let reach = hash.within(points, j, self.eps);
                if reach.len() >= self.min_points {
                    queue.extend(reach);
                }
            }
        }

        // dissolve small clusters, renumber the rest
        let mut sizes = vec![0usize; clusters];
        for id in labels.iter().flatten() {
            sizes[*id] += 1;
        }
        let mut remap = vec![None; clusters];
        let mut kept = 0;
        for (id, &size) in sizes.iter().enumerate() {
            if size >= self.min_size.max(1) {
                remap[id] = Some(kept);
                kept += 1;
            }
        }
        for label in labels.iter_mut() {
            *label = label.and_then(|id| remap[id]);
        }
        Ok(Partition {
            labels,
            clusters: kept,
        })
    }
}

// ============================================================================
// K-MEANS
// ============================================================================

/// Lloyd's algorithm with farthest-point seeding.
///
/// Seeding starts from the point farthest from the centroid and keeps
/// adding the point farthest from every chosen seed, so results do not
/// depend on any random state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KMeans {
    pub max_iter: usize,
    /// Largest center shift, in position units, that counts as settled
    pub tolerance: f64,
}

impl KMeans {
    pub fn new(max_iter: usize, tolerance: f64) -> Self {
        Self {
            max_iter,
            tolerance,
        }
    }

    fn seed(pts: &[Vector3<f64>], k: usize) -> Vec<Vector3<f64>> {
        let mean = pts.iter().sum::<Vector3<f64>>() / pts.len() as f64;
        let farthest_from = |dist: &dyn Fn(&Vector3<f64>) -> f64| {
            pts.iter()
                .copied()
                .max_by(|a, b| dist(a).total_cmp(&dist(b)))
                .unwrap_or(mean)
        };
        let mut centers = vec![farthest_from(&|p| (p - mean).norm_squared())];
        while centers.len() < k {
            let next = farthest_from(&|p| {
                centers
                    .iter()
                    .map(|c| (p - c).norm_squared())
                    .fold(f64::MAX, f64::min)
            });
            centers.push(next);
        }
        centers
    }

    fn nearest(centers: &[Vector3<f64>], p: &Vector3<f64>) -> usize {
        let mut best = 0;
        let mut best_d = f64::MAX;
        for (c, center) in centers.iter().enumerate() {
            let d = (p - center).norm_squared();
            if d < best_d {
                best_d = d;
                best = c;
            }
        }
        best
    }

    /// Hard assignment of `points` to `k` clusters.
    pub fn assign(&self, points: &[ClusterPoint], k: usize) -> Result<Vec<usize>, EnvError> {
        if k == 0 || points.len() < k {
            return Err(EnvError::clustering(format!(
                "cannot form {} clusters from {} points",
                k,
                points.len()
            )));
        }
        let pts: Vec<Vector3<f64>> = points.iter().map(position).collect();
        let mut centers = Self::seed(&pts, k);
        let mut assignment = vec![0usize; pts.len()];

        for _ in 0..self.max_iter.max(1) {
            for (a, p) in assignment.iter_mut().zip(&pts) {
                *a = Self::nearest(&centers, p);
            }
            let mut sums = vec![Vector3::zeros(); k];
            let mut counts = vec![0usize; k];
            for (&a, p) in assignment.iter().zip(&pts) {
                sums[a] += p;
                counts[a] += 1;
            }
            let mut shift: f64 = 0.0;
            for c in 0..k {
                // empty clusters keep their center
                if counts[c] == 0 {
                    continue;
                }
                let center = sums[c] / counts[c] as f64;
                shift = shift.max((center - centers[c]).norm());
                centers[c] = center;
            }
            if shift <= self.tolerance {
                break;
            }
        }
        for (a, p) in assignment.iter_mut().zip(&pts) {
            *a = Self::nearest(&centers, p);
        }
        Ok(assignment)
    }
}

impl PointClusterer for KMeans {
    fn cluster(
        &mut self,
        points: &[ClusterPoint],
        target: Option<usize>,
    ) -> Result<Partition, EnvError> {
        let k = target.ok_or_else(|| EnvError::clustering("k-means needs a cluster count"))?;
        let assignment = self.assign(points, k)?;
        Ok(compact(assignment.into_iter().map(Some).collect()))
    }
}

/// Renumbers labels to `0..n` in order of first appearance.
fn compact(labels: Vec<Option<usize>>) -> Partition {
    let mut remap: HashMap<usize, usize> = HashMap::new();
    let labels = labels
        .into_iter()
        .map(|l| {
            l.map(|id| {
                let next = remap.len();
                *remap.entry(id).or_insert(next)
            })
        })
        .collect();
    Partition {
        labels,
        clusters: remap.len(),
    }
}

// ============================================================================
// EXPECTATION MAXIMIZATION
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Component {
    tau: f64,
    mean: Vector3<f64>,
    cov: Matrix3<f64>,
}

impl Component {
    /// Gaussian density at `p`. A singular covariance is widened to at
    /// least 0.5 on the diagonal first.
    fn density(&self, p: &Vector3<f64>) -> f64 {
        let mut cov = self.cov;
        if cov.determinant().abs() < f64::EPSILON {
            for a in 0..3 {
                cov[(a, a)] = cov[(a, a)].max(0.5);
            }
        }
        let Some(inv) = cov.try_inverse() else {
            return 0.0;
        };
        let det = cov.determinant();
        if det <= 0.0 {
            return 0.0;
        }
        let d = p - self.mean;
        let m = (d.transpose() * inv * d)[(0, 0)];
        let norm = (2.0 * std::f64::consts::PI).powf(1.5) * det.sqrt();
        (-0.5 * m).exp() / norm
    }
}

/// Gaussian mixture refinement of an initial hard assignment.
///
/// Points are weighted by intensity in the M-step. Iterates until the
/// relative change of the log-likelihood drops to `tolerance`. The fit is
/// accepted when the mean of each point's highest membership probability
/// exceeds `prob_tol`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpectationMax {
    pub max_iter: usize,
    pub tolerance: f64,
    pub prob_tol: f64,
}

impl ExpectationMax {
    pub fn new(max_iter: usize, tolerance: f64, prob_tol: f64) -> Self {
        Self {
            max_iter,
            tolerance,
            prob_tol,
        }
    }

    /// Per-cluster intensity-weighted mean and diagonal covariance.
    fn init(pts: &[Vector3<f64>], weights: &[f64], assignment: &[usize], k: usize) -> Vec<Component> {
        let n = pts.len() as f64;
        (0..k)
            .map(|c| {
                let members = assignment.iter().enumerate().filter(|&(_, &a)| a == c).map(|(i, _)| i);
                let mut wsum = 0.0;
                let mut count = 0usize;
                let mut mean = Vector3::zeros();
                for i in members.clone() {
                    wsum += weights[i];
                    count += 1;
                    mean += pts[i] * weights[i];
                }
                if wsum > 0.0 {
                    mean /= wsum;
                }
                let mut var = Vector3::zeros();
                for i in members {
                    let d = pts[i] - mean;
                    var += d.component_mul(&d) * weights[i];
                }
                if wsum > 0.0 {
                    var /= wsum;
                }
                Component {
                    tau: count as f64 / n,
                    mean,
                    cov: Matrix3::from_diagonal(&var),
                }
            })
            .collect()
    }

    /// Refines `assignment` (values in `0..k`) into a confident partition.
    pub fn refine(&self, points: &[ClusterPoint], assignment: &[usize], k: usize) -> Result<Partition, EnvError> {
        if k == 0 || points.is_empty() || assignment.len() != points.len() {
            return Err(EnvError::clustering("EM needs a non-empty initial assignment"));
        }
        let pts: Vec<Vector3<f64>> = points.iter().map(position).collect();
        // zero-intensity samples still carry a little weight
        let weights: Vec<f64> = points.iter().map(|p| p.intensity.max(1e-6)).collect();
        let mut comps = Self::init(&pts, &weights, assignment, k);
        let mut resp = vec![vec![0.0; k]; pts.len()];
        let mut likelihood_prev: Option<f64> = None;

        for _ in 0..self.max_iter.max(1) {
            // E-step
            let mut likelihood = 0.0;
            for (i, p) in pts.iter().enumerate() {
                let mut total = 0.0;
                for (c, comp) in comps.iter().enumerate() {
                    resp[i][c] = comp.tau * comp.density(p);
                    total += resp[i][c];
                }
                if total > 0.0 {
                    for r in resp[i].iter_mut() {
                        *r /= total;
                    }
                    likelihood += total.ln();
                } else {
                    // unreachable by every component: keep the prior
                    for (c, r) in resp[i].iter_mut().enumerate() {
                        *r = if assignment[i] == c { 1.0 } else { 0.0 };
                    }
                }
            }

            // M-step
            for (c, comp) in comps.iter_mut().enumerate() {
                let mut rsum = 0.0;
                let mut wsum = 0.0;
                let mut mean = Vector3::zeros();
                for (i, p) in pts.iter().enumerate() {
                    let w = resp[i][c] * weights[i];
                    rsum += resp[i][c];
                    wsum += w;
                    mean += p * w;
                }
                comp.tau = rsum / pts.len() as f64;
                if wsum <= 0.0 {
                    continue;
                }
                mean /= wsum;
                let mut cov = Matrix3::zeros();
                for (i, p) in pts.iter().enumerate() {
                    let d = p - mean;
                    cov += d * d.transpose() * (resp[i][c] * weights[i]);
                }
                comp.mean = mean;
                comp.cov = cov / wsum;
            }

            if let Some(prev) = likelihood_prev {
                if (likelihood - prev).abs() <= self.tolerance * prev.abs() {
                    break;
                }
            }
            likelihood_prev = Some(likelihood);
        }

        let mut confidence = 0.0;
        let mut labels = Vec::with_capacity(pts.len());
        for r in &resp {
            let (best, p) = r
                .iter()
                .copied()
                .enumerate()
                .fold((0, f64::MIN), |acc, (c, p)| if p > acc.1 { (c, p) } else { acc });
            confidence += p;
            labels.push(Some(best));
        }
        confidence /= pts.len() as f64;
        if confidence <= self.prob_tol {
            return Err(EnvError::clustering(format!(
                "EM membership {:.3} below {:.3}",
                confidence, self.prob_tol
            )));
        }
        Ok(compact(labels))
    }
}

/// K-means seeding refined by EM.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KmeansEm {
    pub kmeans: KMeans,
    pub em: ExpectationMax,
}

impl KmeansEm {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            kmeans: KMeans::new(config.max_iter, config.tolerance),
            em: ExpectationMax::new(config.max_iter, config.tolerance, config.prob_tol),
        }
    }
}

impl PointClusterer for KmeansEm {
    fn cluster(
        &mut self,
        points: &[ClusterPoint],
        target: Option<usize>,
    ) -> Result<Partition, EnvError> {
        let k = target.ok_or_else(|| EnvError::clustering("k-means/EM needs a cluster count"))?;
        let assignment = self.kmeans.assign(points, k)?;
        self.em.refine(points, &assignment, k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn blob(origin: [u32; 3], n: u32) -> Vec<ClusterPoint> {
        let mut pts = Vec::new();
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    pts.push(ClusterPoint::new(
                        [origin[0] + i, origin[1] + j, origin[2] + k],
                        [1.0; 3],
                        0.8,
                    ));
                }
            }
        }
        pts
    }

    fn two_blobs() -> Vec<ClusterPoint> {
        let mut pts = blob([0, 0, 0], 3);
        pts.extend(blob([20, 0, 0], 3));
        pts
    }

    #[test]
    fn test_dbscan_touching_blobs_are_one() {
        let mut pts = blob([0, 0, 0], 3);
        pts.extend(blob([3, 0, 0], 3));
        let p = Dbscan::new(1.8, 3, 5).cluster(&pts, None).unwrap();
        assert_eq!(p.clusters, 1);
        assert!(p.labels.iter().all(|l| *l == Some(0)));
    }

    #[test]
    fn test_dbscan_separate_blobs() {
        let p = Dbscan::new(1.8, 3, 5).cluster(&two_blobs(), None).unwrap();
        assert_eq!(p.clusters, 2);
        assert_eq!(p.size(0), 27);
        assert_eq!(p.size(1), 27);
    }

    #[test]
    fn test_dbscan_drops_small_clusters() {
        let mut pts = blob([0, 0, 0], 3);
        pts.extend(blob([20, 0, 0], 2));
        let p = Dbscan::new(1.8, 3, 10).cluster(&pts, None).unwrap();
        assert_eq!(p.clusters, 1);
        assert_eq!(p.labels.iter().filter(|l| l.is_none()).count(), 8);
    }

    #[test]
    fn test_kmeans_is_deterministic() {
        let pts = two_blobs();
        let km = KMeans::new(25, 1e-3);
        let a = km.assign(&pts, 2).unwrap();
        assert_eq!(a, km.assign(&pts, 2).unwrap());
        assert!(a[..27].iter().all(|&c| c == a[0]));
        assert!(a[27..].iter().all(|&c| c == a[27]));
        assert_ne!(a[0], a[27]);
    }

    #[test]
    fn test_kmeans_needs_enough_points() {
        let pts = blob([0, 0, 0], 1);
        assert!(KMeans::new(25, 1e-3).assign(&pts, 2).is_err());
        assert!(KMeans::new(25, 1e-3).cluster(&pts, None).is_err());
    }

    #[test]
    fn test_em_component_density_handles_flat_cluster() {
        let comp = Component {
            tau: 1.0,
            mean: Vector3::zeros(),
            cov: Matrix3::zeros(),
        };
        // widened to 0.5 on the diagonal
        let expected = 1.0 / ((2.0 * std::f64::consts::PI).powf(1.5) * 0.125f64.sqrt());
        assert_relative_eq!(comp.density(&Vector3::zeros()), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_kmeans_em_splits_separated_blobs() {
        let mut km_em = KmeansEm::new(ClusterConfig::default());
        let p = km_em.cluster(&two_blobs(), Some(2)).unwrap();
        assert_eq!(p.clusters, 2);
        assert_eq!(p.size(0), 27);
        assert_eq!(p.size(1), 27);
    }

    #[test]
    fn test_em_rejects_unconfident_split() {
        // one uniform blob cut in two has blurry memberships at the seam
        let pts = blob([0, 0, 0], 4);
        let assignment: Vec<usize> = pts.iter().map(|p| usize::from(p.voxel[0] >= 2)).collect();
        let em = ExpectationMax::new(25, 1e-3, 0.999);
        assert!(em.refine(&pts, &assignment, 2).is_err());
    }
}
