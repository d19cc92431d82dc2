use log::{debug, trace};
use nalgebra::{Matrix2, Matrix3, Point2, SMatrix, Vector3};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::index::sample;
use serde::{Deserialize, Serialize};

use crate::error::SolverFailureReason;

const SAMPLE_SIZE: usize = 4;
/// Sine of the smallest angle tolerated between sample points.
const COLLINEAR_SIN: f64 = 1e-3;
const REFINE_ROUNDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomographyParams {
    /// Inlier tolerance on the forward transfer error, in pixels.
    pub reprojection_threshold: f64,
    pub max_iterations: usize,
    /// Target probability that at least one all-inlier sample was drawn.
    pub confidence: f64,
    /// Inlier floor as a fraction of the correspondences.
    pub min_inlier_ratio: f64,
    /// Absolute inlier floor.
    pub min_inliers: usize,
    /// Fixed RNG seed; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for HomographyParams {
    fn default() -> Self {
        Self {
            reprojection_threshold: 5.0,
            max_iterations: 2000,
            confidence: 0.995,
            min_inlier_ratio: 0.2,
            min_inliers: 6,
            seed: None,
        }
    }
}

impl HomographyParams {
    /// Inliers required to accept a model over `n` correspondences.
    pub fn inlier_floor(&self, n: usize) -> usize {
        let ratio_floor = (self.min_inlier_ratio.clamp(0.0, 1.0) * n as f64).ceil() as usize;
        self.min_inliers.max(SAMPLE_SIZE).max(ratio_floor)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HomographyEstimate {
    /// Maps source pixels to destination pixels, scaled so `h[(2, 2)] == 1`.
    pub matrix: Matrix3<f64>,
    pub inliers: Vec<usize>,
    pub mean_reprojection_error: f64,
}

pub struct HomographyRansac {
    params: HomographyParams,
}

impl HomographyRansac {
    pub fn new(params: HomographyParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &HomographyParams {
        &self.params
    }

    /// Robustly fits `dst ~ H * src`.
    pub fn estimate(
        &self,
        src: &[Point2<f64>],
        dst: &[Point2<f64>],
    ) -> Result<HomographyEstimate, SolverFailureReason> {
        let n = src.len().min(dst.len());
        let floor = self.params.inlier_floor(n);
        debug!(target: "mural_core::homography", "estimating homography from {n} correspondences (floor {floor})");

        if n < floor {
            return Err(SolverFailureReason::TooFewCorrespondences {
                found: n,
                required: floor,
            });
        }
        if is_degenerate_set(src) || is_degenerate_set(dst) {
            debug!(target: "mural_core::homography", "correspondence set is degenerate");
            return Err(SolverFailureReason::DegenerateConfiguration);
        }

        let threshold = self.params.reprojection_threshold.max(f64::EPSILON);
        let mut rng = match self.params.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };

        let mut best_inliers: Vec<usize> = Vec::new();
        let mut best_h: Option<Matrix3<f64>> = None;
        let mut max_iterations = self.params.max_iterations.max(1);
        let mut iteration = 0usize;
        while iteration < max_iterations {
            iteration += 1;
            let picks = sample(&mut rng, n, SAMPLE_SIZE).into_vec();
            let s_src: Vec<_> = picks.iter().map(|&i| src[i]).collect();
            let s_dst: Vec<_> = picks.iter().map(|&i| dst[i]).collect();
            if has_collinear_triple(&s_src) || has_collinear_triple(&s_dst) {
                continue;
            }
            let Some(h) = estimate_homography_dlt(&s_src, &s_dst) else {
                continue;
            };
            if !preserves_orientation(&h, &s_src) {
                continue;
            }

            let inliers = collect_inliers(&h, &src[..n], &dst[..n], threshold);
            if inliers.len() > best_inliers.len() {
                let ratio = inliers.len() as f64 / n as f64;
                max_iterations = max_iterations.min(adaptive_iterations(
                    ratio,
                    SAMPLE_SIZE,
                    self.params.confidence,
                ));
                trace!(
                    target: "mural_core::homography",
                    "iteration {iteration}: {} inliers, budget now {max_iterations}",
                    inliers.len()
                );
                best_inliers = inliers;
                best_h = Some(h);
            }
        }

        let Some(mut h) = best_h else {
            return Err(SolverFailureReason::DegenerateConfiguration);
        };
        if best_inliers.len() < floor {
            debug!(
                target: "mural_core::homography",
                "best consensus {} after {iteration} iterations is below floor {floor}",
                best_inliers.len()
            );
            return Err(SolverFailureReason::InlierFloorNotReached {
                inliers: best_inliers.len(),
                required: floor,
            });
        }

        // Least-squares refit on the consensus set.
        for _ in 0..REFINE_ROUNDS {
            let in_src: Vec<_> = best_inliers.iter().map(|&i| src[i]).collect();
            let in_dst: Vec<_> = best_inliers.iter().map(|&i| dst[i]).collect();
            let Some(refined) = estimate_homography_dlt(&in_src, &in_dst) else {
                break;
            };
            let inliers = collect_inliers(&refined, &src[..n], &dst[..n], threshold);
            if inliers.len() < best_inliers.len() {
                break;
            }
            let converged = inliers == best_inliers;
            h = refined;
            best_inliers = inliers;
            if converged {
                break;
            }
        }

        let in_src: Vec<_> = best_inliers.iter().map(|&i| src[i]).collect();
        if !h.iter().all(|v| v.is_finite()) || !preserves_orientation(&h, &in_src) {
            return Err(SolverFailureReason::DegenerateConfiguration);
        }

        let mean_error = best_inliers
            .iter()
            .map(|&i| transfer_error(&h, &src[i], &dst[i]))
            .sum::<f64>()
            / best_inliers.len() as f64;

        debug!(
            target: "mural_core::homography",
            "homography accepted: {}/{} inliers, mean error {:.3}px after {} iterations",
            best_inliers.len(),
            n,
            mean_error,
            iteration
        );

        Ok(HomographyEstimate {
            matrix: h,
            inliers: best_inliers,
            mean_reprojection_error: mean_error,
        })
    }
}

/// Maps a point through `h`. `None` when it lands on the line at infinity.
pub fn project(h: &Matrix3<f64>, p: &Point2<f64>) -> Option<Point2<f64>> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    if v.z.abs() < 1e-12 {
        return None;
    }
    Some(Point2::new(v.x / v.z, v.y / v.z))
}

/// Forward transfer error `|H * src - dst|` in destination pixels.
pub fn transfer_error(h: &Matrix3<f64>, src: &Point2<f64>, dst: &Point2<f64>) -> f64 {
    match project(h, src) {
        Some(p) => (p - dst).norm(),
        None => f64::INFINITY,
    }
}

fn collect_inliers(
    h: &Matrix3<f64>,
    src: &[Point2<f64>],
    dst: &[Point2<f64>],
    threshold: f64,
) -> Vec<usize> {
    src.iter()
        .zip(dst)
        .enumerate()
        .filter(|(_, (s, d))| transfer_error(h, s, d) < threshold)
        .map(|(i, _)| i)
        .collect()
}

/// Normalized direct linear transform over four or more correspondences.
pub fn estimate_homography_dlt(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    if src.len() < SAMPLE_SIZE || src.len() != dst.len() {
        return None;
    }
    let (src_n, t_src) = normalize_points(src)?;
    let (dst_n, t_dst) = normalize_points(dst)?;

    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (p, q) in src_n.iter().zip(&dst_n) {
        let (x, y) = (p.x, p.y);
        let (xp, yp) = (q.x, q.y);
        let row1 = SMatrix::<f64, 1, 9>::from_row_slice(&[-x, -y, -1.0, 0.0, 0.0, 0.0, x * xp, y * xp, xp]);
        let row2 = SMatrix::<f64, 1, 9>::from_row_slice(&[0.0, 0.0, 0.0, -x, -y, -1.0, x * yp, y * yp, yp]);
        ata += row1.transpose() * row1 + row2.transpose() * row2;
    }

    let eigen = ata.symmetric_eigen();
    let (min_idx, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let v = eigen.eigenvectors.column(min_idx);
    let h_norm = Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]);

    let h = t_dst.try_inverse()? * h_norm * t_src;
    let scale = h[(2, 2)];
    if scale.abs() < 1e-12 || !scale.is_finite() {
        return None;
    }
    Some(h / scale)
}

/// Hartley normalization: centroid to origin, mean distance `sqrt(2)`.
fn normalize_points(points: &[Point2<f64>]) -> Option<(Vec<Point2<f64>>, Matrix3<f64>)> {
    let n = points.len() as f64;
    let centroid = points.iter().fold(nalgebra::Vector2::zeros(), |acc, p| acc + p.coords) / n;
    let mean_dist = points.iter().map(|p| (p.coords - centroid).norm()).sum::<f64>() / n;
    if mean_dist < 1e-10 {
        return None;
    }
    let scale = std::f64::consts::SQRT_2 / mean_dist;
    let normalized = points
        .iter()
        .map(|p| Point2::from((p.coords - centroid) * scale))
        .collect();
    let t = Matrix3::new(
        scale,
        0.0,
        -centroid.x * scale,
        0.0,
        scale,
        -centroid.y * scale,
        0.0,
        0.0,
        1.0,
    );
    Some((normalized, t))
}

/// RANSAC iterations needed to draw an all-inlier sample with `confidence`.
pub fn adaptive_iterations(inlier_ratio: f64, sample_size: usize, confidence: f64) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let w_n = inlier_ratio.powi(sample_size as i32);
    let log_outlier = (1.0 - w_n).ln();
    if log_outlier >= 0.0 {
        return usize::MAX;
    }
    let log_conf = (1.0 - confidence.clamp(0.0, 1.0 - 1e-12)).ln();
    (log_conf / log_outlier).ceil().max(1.0) as usize
}

fn has_collinear_triple(points: &[Point2<f64>]) -> bool {
    let n = points.len();
    for i in 0..n {
        for j in i + 1..n {
            for k in j + 1..n {
                let ab = points[j] - points[i];
                let ac = points[k] - points[i];
                let norms = ab.norm() * ac.norm();
                let cross = ab.x * ac.y - ab.y * ac.x;
                if norms < 1e-12 || cross.abs() <= COLLINEAR_SIN * norms {
                    return true;
                }
            }
        }
    }
    false
}

/// Whole-set degeneracy: zero extent, or every point on one line.
fn is_degenerate_set(points: &[Point2<f64>]) -> bool {
    if points.len() < SAMPLE_SIZE {
        return true;
    }
    let n = points.len() as f64;
    let centroid = points.iter().fold(nalgebra::Vector2::zeros(), |acc, p| acc + p.coords) / n;
    let mut cov = Matrix2::zeros();
    for p in points {
        let d = p.coords - centroid;
        cov += d * d.transpose();
    }
    let eigen = cov.symmetric_eigen();
    let max = eigen.eigenvalues.max();
    let min = eigen.eigenvalues.min();
    max < 1e-9 || min <= 1e-9 * max
}

/// Rejects mirrored maps and maps that send some of `points` across the
/// line at infinity.
fn preserves_orientation(h: &Matrix3<f64>, points: &[Point2<f64>]) -> bool {
    let det = h.determinant();
    if !det.is_finite() || det.abs() < 1e-12 {
        return false;
    }
    points.iter().all(|p| {
        let w = h[(2, 0)] * p.x + h[(2, 1)] * p.y + h[(2, 2)];
        w * det > 0.0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};

    fn truth() -> Matrix3<f64> {
        Matrix3::new(0.95, 0.08, 12.0, -0.05, 1.02, -7.0, 1.5e-4, -8e-5, 1.0)
    }

    fn correspondences(rng: &mut SmallRng, n: usize, h: &Matrix3<f64>) -> (Vec<Point2<f64>>, Vec<Point2<f64>>) {
        let src: Vec<_> = (0..n)
            .map(|_| Point2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0)))
            .collect();
        let dst = src
            .iter()
            .map(|p| {
                let q = project(h, p).unwrap();
                Point2::new(q.x + rng.gen_range(-0.5..0.5), q.y + rng.gen_range(-0.5..0.5))
            })
            .collect();
        (src, dst)
    }

    #[test]
    fn dlt_recovers_exact_homography() {
        let h = truth();
        let src = [
            Point2::new(0.0, 0.0),
            Point2::new(100.0, 0.0),
            Point2::new(100.0, 80.0),
            Point2::new(0.0, 80.0),
            Point2::new(40.0, 30.0),
        ];
        let dst: Vec<_> = src.iter().map(|p| project(&h, p).unwrap()).collect();
        let estimated = estimate_homography_dlt(&src, &dst).unwrap();
        assert_relative_eq!(estimated, h, epsilon = 1e-6);
    }

    #[test]
    fn ransac_rejects_outliers() {
        let mut rng = SmallRng::seed_from_u64(42);
        let h = truth();
        let (mut src, mut dst) = correspondences(&mut rng, 120, &h);
        for _ in 0..60 {
            src.push(Point2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0)));
            dst.push(Point2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0)));
        }

        let ransac = HomographyRansac::new(HomographyParams {
            seed: Some(9),
            ..HomographyParams::default()
        });
        let estimate = ransac.estimate(&src, &dst).unwrap();
        assert!(estimate.inliers.len() >= 115);
        assert!(estimate.mean_reprojection_error < 1.0);

        for corner in [Point2::new(0.0, 0.0), Point2::new(640.0, 480.0)] {
            let a = project(&estimate.matrix, &corner).unwrap();
            let b = project(&h, &corner).unwrap();
            assert!((a - b).norm() < 2.0);
        }
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let mut rng = SmallRng::seed_from_u64(1);
        let (src, dst) = correspondences(&mut rng, 50, &truth());
        let ransac = HomographyRansac::new(HomographyParams {
            seed: Some(123),
            ..HomographyParams::default()
        });
        assert_eq!(ransac.estimate(&src, &dst), ransac.estimate(&src, &dst));
    }

    #[test]
    fn collinear_points_are_degenerate() {
        let src: Vec<_> = (0..30).map(|i| Point2::new(i as f64 * 3.0, i as f64 * 2.0)).collect();
        let dst = src.clone();
        let err = HomographyRansac::new(HomographyParams::default())
            .estimate(&src, &dst)
            .unwrap_err();
        assert_eq!(err, SolverFailureReason::DegenerateConfiguration);
    }

    #[test]
    fn too_few_correspondences() {
        let src = vec![Point2::new(0.0, 0.0), Point2::new(1.0, 0.0), Point2::new(0.0, 1.0)];
        let err = HomographyRansac::new(HomographyParams::default())
            .estimate(&src, &src)
            .unwrap_err();
        assert!(matches!(err, SolverFailureReason::TooFewCorrespondences { found: 3, .. }));
    }

    #[test]
    fn random_pairs_do_not_reach_the_floor() {
        let mut rng = SmallRng::seed_from_u64(77);
        let src: Vec<_> = (0..100)
            .map(|_| Point2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0)))
            .collect();
        let dst: Vec<_> = (0..100)
            .map(|_| Point2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0)))
            .collect();
        let err = HomographyRansac::new(HomographyParams {
            seed: Some(5),
            ..HomographyParams::default()
        })
        .estimate(&src, &dst)
        .unwrap_err();
        assert!(matches!(err, SolverFailureReason::InlierFloorNotReached { .. }));
    }

    #[test]
    fn mirrored_map_is_rejected() {
        let mirror = Matrix3::new(-1.0, 0.0, 640.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        let mut rng = SmallRng::seed_from_u64(3);
        let (src, dst) = correspondences(&mut rng, 40, &mirror);
        assert!(HomographyRansac::new(HomographyParams::default())
            .estimate(&src, &dst)
            .is_err());
    }

    #[test]
    fn adaptive_iteration_budget() {
        assert_eq!(adaptive_iterations(1.0, 4, 0.995), 1);
        assert!(adaptive_iterations(0.5, 4, 0.995) > adaptive_iterations(0.9, 4, 0.995));
        assert_eq!(adaptive_iterations(0.0, 4, 0.995), usize::MAX);
    }
}
