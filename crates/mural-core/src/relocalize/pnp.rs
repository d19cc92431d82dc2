use crate::error::SolverFailureReason;
use crate::math::se3::{self, TransformSE3, Twist};
use crate::math::utils::{nearest_rotation, skew_symmetric};
use crate::relocalize::homography::estimate_homography_dlt;
use log::{debug, trace, warn};
use nalgebra::{
    DMatrix, Matrix2x3, Matrix2x6, Matrix3, Matrix3x4, Point2, Point3, Rotation3, SMatrix,
    SVector, Translation3, UnitQuaternion, Vector2, Vector3,
};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::index::sample;
use serde::{Deserialize, Serialize};

/// Fewest correspondences PnP will attempt.
pub const MIN_PNP_CORRESPONDENCES: usize = 6;
/// Points whose out-of-plane spread is below this fraction of their in-plane
/// spread are initialised with the planar solver.
const PLANARITY_RATIO: f64 = 0.05;
const REFINE_ITERATIONS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct PnPObservation {
    pub world_xyz: Point3<f64>,
    /// Observation on the normalized image plane (z = 1).
    pub norm_xy: Vector2<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PnPRansacParams {
    pub iterations: usize,
    /// Inlier tolerance on the normalized image plane.
    pub threshold: f64,
    pub min_inliers: usize,
    pub min_inlier_ratio: f64,
    pub seed: Option<u64>,
}

impl Default for PnPRansacParams {
    fn default() -> Self {
        Self {
            iterations: 256,
            threshold: 1e-2,
            min_inliers: 6,
            min_inlier_ratio: 0.2,
            seed: None,
        }
    }
}

impl PnPRansacParams {
    pub fn inlier_floor(&self, n: usize) -> usize {
        let ratio_floor = (self.min_inlier_ratio.clamp(0.0, 1.0) * n as f64).ceil() as usize;
        self.min_inliers.max(MIN_PNP_CORRESPONDENCES).max(ratio_floor)
    }
}

/// Result of PnP estimation.
///
/// pose_cw: world→camera, consistent with x = K [R|t] X_world.
#[derive(Debug, Clone, PartialEq)]
pub struct PnPResult {
    pub pose_cw: TransformSE3,
    pub inliers: Vec<usize>,
    /// Mean inlier error on the normalized image plane.
    pub average_reprojection_error: f64,
}

pub struct PnPRansac {
    params: PnPRansacParams,
}

impl PnPRansac {
    pub fn new(params: PnPRansacParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &PnPRansacParams {
        &self.params
    }

    /// Estimate pose_cw (world→camera) from 2D-3D correspondences.
    pub fn estimate(&self, observations: &[PnPObservation]) -> Result<PnPResult, SolverFailureReason> {
        debug!(target: "mural_core::pnp", "Starting PnP estimation with {} observations", observations.len());

        let n = observations.len();
        if n < MIN_PNP_CORRESPONDENCES {
            warn!(target: "mural_core::pnp", "Insufficient observations for PnP: {} < {}", n, MIN_PNP_CORRESPONDENCES);
            return Err(SolverFailureReason::TooFewCorrespondences {
                found: n,
                required: MIN_PNP_CORRESPONDENCES,
            });
        }
        let floor = self.params.inlier_floor(n);
        if n < floor {
            return Err(SolverFailureReason::TooFewCorrespondences {
                found: n,
                required: floor,
            });
        }
        if classify_structure(observations.iter().map(|o| o.world_xyz)) == Structure::Degenerate {
            debug!(target: "mural_core::pnp", "world points are coincident or collinear");
            return Err(SolverFailureReason::DegenerateConfiguration);
        }

        let mut rng = match self.params.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let threshold = self.params.threshold.max(f64::EPSILON);
        let sample_size = n.min(8).max(MIN_PNP_CORRESPONDENCES);
        trace!(target: "mural_core::pnp", "Using sample size {} for RANSAC", sample_size);

        let mut best_inliers: Vec<usize> = Vec::new();
        let mut best_pose = None;
        for _ in 0..self.params.iterations.max(1) {
            let picks = sample(&mut rng, n, sample_size);
            let subset: Vec<_> = picks.into_iter().map(|i| observations[i]).collect();
            let Some(candidate) = solve_pose(&subset) else {
                continue;
            };

            let inliers = collect_inliers(observations, &candidate, threshold);
            if inliers.len() > best_inliers.len() {
                best_inliers = inliers;
                best_pose = Some(candidate);
                if best_inliers.len() == n {
                    break;
                }
            }
        }

        let Some(mut pose_cw) = best_pose else {
            return Err(SolverFailureReason::DegenerateConfiguration);
        };
        if best_inliers.len() < floor {
            debug!(
                target: "mural_core::pnp",
                "best consensus {} below floor {}",
                best_inliers.len(),
                floor
            );
            return Err(SolverFailureReason::InlierFloorNotReached {
                inliers: best_inliers.len(),
                required: floor,
            });
        }

        // Refine on the full consensus, then re-score once with the refined pose.
        let inlier_observations: Vec<_> = best_inliers.iter().map(|&i| observations[i]).collect();
        pose_cw = refine_pose(pose_cw, &inlier_observations, REFINE_ITERATIONS);
        let mut inliers = collect_inliers(observations, &pose_cw, threshold);
        if inliers.len() > best_inliers.len() {
            let widened: Vec<_> = inliers.iter().map(|&i| observations[i]).collect();
            pose_cw = refine_pose(pose_cw, &widened, REFINE_ITERATIONS);
            inliers = collect_inliers(observations, &pose_cw, threshold);
        }

        if inliers.len() < floor {
            return Err(SolverFailureReason::InlierFloorNotReached {
                inliers: inliers.len(),
                required: floor,
            });
        }
        let average = inliers
            .iter()
            .map(|&i| reprojection_error(&pose_cw, &observations[i]))
            .sum::<f64>()
            / inliers.len() as f64;

        let inlier_ratio = inliers.len() as f64 / n as f64;
        debug!(target: "mural_core::pnp", "PnP estimation completed: {} inliers ({:.1}%), avg error: {:.5}",
               inliers.len(), inlier_ratio * 100.0, average);
        if inlier_ratio < 0.5 {
            warn!(target: "mural_core::pnp", "Low inlier ratio: {:.1}% may indicate poor pose estimate", inlier_ratio * 100.0);
        }

        Ok(PnPResult {
            pose_cw,
            inliers,
            average_reprojection_error: average,
        })
    }
}

fn collect_inliers(observations: &[PnPObservation], pose_cw: &TransformSE3, threshold: f64) -> Vec<usize> {
    observations
        .iter()
        .enumerate()
        .filter(|(_, obs)| reprojection_error(pose_cw, obs) < threshold)
        .map(|(idx, _)| idx)
        .collect()
}

/// Reprojection error for a pose_cw mapping world→camera. Points behind the
/// camera never count as inliers.
fn reprojection_error(pose_cw: &TransformSE3, obs: &PnPObservation) -> f64 {
    let cam_xyz = pose_cw.transform_point(&obs.world_xyz);
    if cam_xyz.z <= 0.0 {
        return f64::MAX;
    }
    let projected = Vector2::new(cam_xyz.x / cam_xyz.z, cam_xyz.y / cam_xyz.z);
    (projected - obs.norm_xy).norm()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Structure {
    Degenerate,
    Planar,
    General,
}

struct PlaneFrame {
    centroid: Vector3<f64>,
    /// Columns: in-plane axes e1, e2 and the normal.
    basis: Matrix3<f64>,
}

fn principal_axes(points: impl Iterator<Item = Point3<f64>>) -> Option<(PlaneFrame, Vector3<f64>)> {
    let points: Vec<_> = points.collect();
    if points.is_empty() {
        return None;
    }
    let centroid = points.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / points.len() as f64;
    let mut cov = Matrix3::zeros();
    for p in &points {
        let d = p.coords - centroid;
        cov += d * d.transpose();
    }
    let eigen = cov.symmetric_eigen();
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
    let e1 = eigen.eigenvectors.column(order[0]).into_owned();
    let e2 = eigen.eigenvectors.column(order[1]).into_owned();
    let normal = e1.cross(&e2);
    let variances = Vector3::new(
        eigen.eigenvalues[order[0]].max(0.0),
        eigen.eigenvalues[order[1]].max(0.0),
        eigen.eigenvalues[order[2]].max(0.0),
    );
    Some((
        PlaneFrame {
            centroid,
            basis: Matrix3::from_columns(&[e1, e2, normal]),
        },
        variances,
    ))
}

fn classify_structure(points: impl Iterator<Item = Point3<f64>>) -> Structure {
    let Some((_, variances)) = principal_axes(points) else {
        return Structure::Degenerate;
    };
    let (s1, s2, s3) = (variances[0].sqrt(), variances[1].sqrt(), variances[2].sqrt());
    if s1 < 1e-9 || s2 < 1e-6 * s1 {
        Structure::Degenerate
    } else if s3 < PLANARITY_RATIO * s2 {
        Structure::Planar
    } else {
        Structure::General
    }
}

/// Minimal-sample solver: planar homography decomposition for (near-)planar
/// structure, 12-parameter DLT otherwise.
fn solve_pose(observations: &[PnPObservation]) -> Option<TransformSE3> {
    let pose = match classify_structure(observations.iter().map(|o| o.world_xyz)) {
        Structure::Degenerate => return None,
        Structure::Planar => solve_pnp_planar(observations)?,
        Structure::General => solve_pnp_linear(observations)?,
    };
    Some(refine_pose(pose, observations, 3))
}

/// Pose from a plane-to-image homography: with plane coordinates `(a, b)`,
/// `H ~ [r1 r2 t]`.
fn solve_pnp_planar(observations: &[PnPObservation]) -> Option<TransformSE3> {
    if observations.len() < 4 {
        return None;
    }
    let (frame, _) = principal_axes(observations.iter().map(|o| o.world_xyz))?;
    let plane: Vec<_> = observations
        .iter()
        .map(|o| {
            let d = frame.basis.transpose() * (o.world_xyz.coords - frame.centroid);
            Point2::new(d.x, d.y)
        })
        .collect();
    let image: Vec<_> = observations
        .iter()
        .map(|o| Point2::new(o.norm_xy.x, o.norm_xy.y))
        .collect();
    let h = estimate_homography_dlt(&plane, &image)?;

    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();
    let norm = 0.5 * (h1.norm() + h2.norm());
    if norm < 1e-12 {
        return None;
    }
    // The plane origin (centroid) must land in front of the camera.
    let lambda = if h3.z >= 0.0 { 1.0 / norm } else { -1.0 / norm };
    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let r_plane = nearest_rotation(&Matrix3::from_columns(&[r1, r2, r3]))?;
    let t_plane = h3 * lambda;

    // X_cam = R_p * B^T * (X - c) + t
    let rotation = r_plane * frame.basis.transpose();
    let translation = t_plane - rotation * frame.centroid;
    Some(TransformSE3::from_parts(
        Translation3::from(translation),
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation)),
    ))
}

fn solve_pnp_linear(observations: &[PnPObservation]) -> Option<TransformSE3> {
    if observations.len() < MIN_PNP_CORRESPONDENCES {
        return None;
    }

    let mut a = DMatrix::<f64>::zeros(observations.len() * 2, 12);
    for (i, obs) in observations.iter().enumerate() {
        let p = obs.world_xyz.coords;
        let x = obs.norm_xy.x;
        let y = obs.norm_xy.y;
        let row = i * 2;

        a[(row, 0)] = p.x;
        a[(row, 1)] = p.y;
        a[(row, 2)] = p.z;
        a[(row, 3)] = 1.0;
        a[(row, 8)] = -x * p.x;
        a[(row, 9)] = -x * p.y;
        a[(row, 10)] = -x * p.z;
        a[(row, 11)] = -x;

        a[(row + 1, 4)] = p.x;
        a[(row + 1, 5)] = p.y;
        a[(row + 1, 6)] = p.z;
        a[(row + 1, 7)] = 1.0;
        a[(row + 1, 8)] = -y * p.x;
        a[(row + 1, 9)] = -y * p.y;
        a[(row + 1, 10)] = -y * p.z;
        a[(row + 1, 11)] = -y;
    }

    // Null vector of A via the 12x12 normal matrix; A itself may be wide.
    let ata = a.transpose() * &a;
    let eigen = ata.symmetric_eigen();
    let (min_idx, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let p_vec = eigen.eigenvectors.column(min_idx);

    let mut p = Matrix3x4::zeros();
    for row in 0..3 {
        for col in 0..4 {
            p[(row, col)] = p_vec[row * 4 + col];
        }
    }

    let r_temp = p.fixed_view::<3, 3>(0, 0).into_owned();
    let scale = (r_temp.column(0).norm() + r_temp.column(1).norm() + r_temp.column(2).norm()) / 3.0;
    if scale.abs() < 1e-9 {
        return None;
    }
    let (mut r_temp, mut t) = (r_temp, p.column(3) / scale);
    if r_temp.determinant() < 0.0 {
        r_temp = -r_temp;
        t = -t;
    }
    let r = nearest_rotation(&r_temp)?;

    Some(TransformSE3::from_parts(
        Translation3::new(t[0], t[1], t[2]),
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r)),
    ))
}

/// Nonlinear refinement of pose_cw (world→camera) using Gauss-Newton.
fn refine_pose(mut pose_cw: TransformSE3, observations: &[PnPObservation], iterations: usize) -> TransformSE3 {
    for _ in 0..iterations {
        let mut jtj = SMatrix::<f64, 6, 6>::zeros();
        let mut jtr = SVector::<f64, 6>::zeros();
        let mut valid_samples = 0usize;

        for obs in observations {
            let cam_xyz = pose_cw.transform_point(&obs.world_xyz);
            if cam_xyz.z <= 0.0 {
                continue;
            }
            valid_samples += 1;

            let proj = Vector2::new(cam_xyz.x / cam_xyz.z, cam_xyz.y / cam_xyz.z);
            let residual = proj - obs.norm_xy;

            let z_inv = 1.0 / cam_xyz.z;
            let jac_proj = Matrix2x3::new(
                z_inv,
                0.0,
                -cam_xyz.x * z_inv * z_inv,
                0.0,
                z_inv,
                -cam_xyz.y * z_inv * z_inv,
            );
            let jac_rot = jac_proj * (-skew_symmetric(&cam_xyz.coords));

            let mut jac = Matrix2x6::zeros();
            jac.fixed_view_mut::<2, 3>(0, 0).copy_from(&jac_proj);
            jac.fixed_view_mut::<2, 3>(0, 3).copy_from(&jac_rot);

            let jac_t = jac.transpose();
            jtj += jac_t * jac;
            jtr += jac_t * residual;
        }

        if valid_samples < MIN_PNP_CORRESPONDENCES.min(observations.len()) {
            break;
        }

        let Some(delta) = jtj.full_piv_lu().solve(&(-jtr)) else {
            break;
        };
        if !delta.iter().all(|v| v.is_finite()) {
            break;
        }
        pose_cw = se3::exp(&Twist::from_stacked(&delta)) * pose_cw;
        if delta.norm() < 1e-10 {
            break;
        }
    }
    pose_cw
}
