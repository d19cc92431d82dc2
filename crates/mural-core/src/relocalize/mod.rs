//! Relocalization pipeline: match live features against a fingerprint and
//! solve for the reference surface's placement in the live frame.

pub mod homography;
pub mod pnp;

use image::GrayImage;
use log::{debug, info};
use nalgebra::{Matrix3, Point2};
use serde::{Deserialize, Serialize};

use crate::codec::{FeatureCodec, FeatureSet, OrbCodec, OrbConfig};
use crate::error::{RelocalizationError, SolverFailureReason};
use crate::fingerprint::Fingerprint;
use crate::img::DepthMap;
use crate::matcher::{DescriptorMatch, HammingMatcher, MatcherConfig};
use crate::math::se3::TransformSE3;
use crate::math::{CameraIntrinsics, ImagePoint};

pub use homography::{HomographyEstimate, HomographyParams, HomographyRansac};
pub use pnp::{MIN_PNP_CORRESPONDENCES, PnPObservation, PnPRansac, PnPRansacParams, PnPResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransformModel {
    /// Maps reference-image pixels to live-frame pixels.
    Homography(Matrix3<f64>),
    /// World→camera pose of the live frame, world being the reference camera frame.
    Pose(TransformSE3),
}

/// A solved placement of the reference surface in a live frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub model: TransformModel,
    pub inlier_count: usize,
    pub correspondence_count: usize,
    pub mean_reprojection_error_px: f64,
}

impl Transform {
    pub fn homography(&self) -> Option<&Matrix3<f64>> {
        match &self.model {
            TransformModel::Homography(h) => Some(h),
            TransformModel::Pose(_) => None,
        }
    }

    pub fn pose_cw(&self) -> Option<&TransformSE3> {
        match &self.model {
            TransformModel::Pose(pose) => Some(pose),
            TransformModel::Homography(_) => None,
        }
    }

    /// Fraction of correspondences that agreed with the model.
    pub fn confidence(&self) -> f64 {
        if self.correspondence_count == 0 {
            0.0
        } else {
            self.inlier_count as f64 / self.correspondence_count as f64
        }
    }

    /// Live-frame positions of the reference image corners, clockwise from
    /// the top-left. Homography transforms only.
    pub fn project_corners(&self, width: u32, height: u32) -> Option<[Point2<f64>; 4]> {
        let h = self.homography()?;
        let (w, hh) = (width as f64, height as f64);
        let corners = [
            Point2::new(0.0, 0.0),
            Point2::new(w, 0.0),
            Point2::new(w, hh),
            Point2::new(0.0, hh),
        ];
        Some([
            homography::project(h, &corners[0])?,
            homography::project(h, &corners[1])?,
            homography::project(h, &corners[2])?,
            homography::project(h, &corners[3])?,
        ])
    }

    /// Row-major 4x4 pose matrix. Pose transforms only.
    pub fn pose_matrix(&self) -> Option<[f32; 16]> {
        let m = self.pose_cw()?.to_homogeneous().transpose();
        let mut out = [0f32; 16];
        for (dst, src) in out.iter_mut().zip(m.iter()) {
            *dst = *src as f32;
        }
        Some(out)
    }
}

/// Pose solver settings expressed in pixels; converted to the normalized
/// image plane with the live intrinsics at solve time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseConfig {
    pub reprojection_threshold_px: f64,
    pub iterations: usize,
    pub min_inliers: usize,
    pub min_inlier_ratio: f64,
    /// Stored points closer than this (metres) are ignored.
    pub min_depth_m: f32,
    pub seed: Option<u64>,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            reprojection_threshold_px: 8.0,
            iterations: 256,
            min_inliers: MIN_PNP_CORRESPONDENCES,
            min_inlier_ratio: 0.2,
            min_depth_m: 0.1,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocalizerConfig {
    pub orb: OrbConfig,
    pub homography_matcher: MatcherConfig,
    pub pose_matcher: MatcherConfig,
    pub homography: HomographyParams,
    pub pose: PoseConfig,
}

impl Default for RelocalizerConfig {
    fn default() -> Self {
        Self {
            orb: OrbConfig::default(),
            homography_matcher: MatcherConfig::default(),
            pose_matcher: MatcherConfig {
                min_matches: 10,
                ..MatcherConfig::default()
            },
            homography: HomographyParams::default(),
            pose: PoseConfig::default(),
        }
    }
}

/// Stateless relocalization engine. Shareable across threads.
pub struct Relocalizer {
    config: RelocalizerConfig,
    codec: OrbCodec,
    homography_matcher: HammingMatcher,
    pose_matcher: HammingMatcher,
    homography: HomographyRansac,
}

impl Relocalizer {
    pub fn new(config: RelocalizerConfig) -> Self {
        crate::runtime::initialize();
        Self {
            codec: OrbCodec::new(config.orb),
            homography_matcher: HammingMatcher::new(config.homography_matcher),
            pose_matcher: HammingMatcher::new(config.pose_matcher),
            homography: HomographyRansac::new(config.homography),
            config,
        }
    }

    pub fn config(&self) -> &RelocalizerConfig {
        &self.config
    }

    pub fn codec(&self) -> &OrbCodec {
        &self.codec
    }

    pub fn extract(&self, image: &GrayImage, mask: Option<&GrayImage>) -> FeatureSet {
        self.codec.extract(image, mask)
    }

    pub fn generate_fingerprint(
        &self,
        image: &GrayImage,
        mask: Option<&GrayImage>,
        depth: Option<&DepthMap>,
        intrinsics: Option<&CameraIntrinsics>,
    ) -> Fingerprint {
        let fingerprint = Fingerprint::generate(&self.codec, image, mask, depth, intrinsics);
        info!(
            target: "mural_core::fingerprint",
            "generated fingerprint: {} keypoints, {} with world points",
            fingerprint.len(),
            fingerprint.valid_world_point_count()
        );
        fingerprint
    }

    /// Homography from the reference image to `frame`.
    pub fn relocalize(&self, frame: &GrayImage, fingerprint: &Fingerprint) -> Result<Transform, RelocalizationError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(RelocalizationError::DegenerateInput);
        }
        let live = self.extract(frame, None);
        self.solve_homography(&live, fingerprint)
    }

    /// Pose of `frame`'s camera relative to the reference camera.
    pub fn relocalize_with_pose(
        &self,
        frame: &GrayImage,
        fingerprint: &Fingerprint,
        intrinsics: &CameraIntrinsics,
    ) -> Result<Transform, RelocalizationError> {
        if frame.width() == 0 || frame.height() == 0 || !intrinsics.is_valid() {
            return Err(RelocalizationError::DegenerateInput);
        }
        let live = self.extract(frame, None);
        let intrinsics = intrinsics.scaled_to(frame.width(), frame.height());
        self.solve_pose(&live, fingerprint, &intrinsics)
    }

    pub fn solve_homography(
        &self,
        live: &FeatureSet,
        fingerprint: &Fingerprint,
    ) -> Result<Transform, RelocalizationError> {
        let matches = self.homography_matcher.match_features(live, fingerprint)?;
        let (src, dst) = pixel_pairs(&matches, live, fingerprint);
        let estimate = self.homography.estimate(&src, &dst)?;

        debug!(
            target: "mural_core::homography",
            "relocalized with {} / {} inliers",
            estimate.inliers.len(),
            matches.len()
        );
        Ok(Transform {
            model: TransformModel::Homography(estimate.matrix),
            inlier_count: estimate.inliers.len(),
            correspondence_count: matches.len(),
            mean_reprojection_error_px: estimate.mean_reprojection_error,
        })
    }

    pub fn solve_pose(
        &self,
        live: &FeatureSet,
        fingerprint: &Fingerprint,
        intrinsics: &CameraIntrinsics,
    ) -> Result<Transform, RelocalizationError> {
        // Without any usable 3D data there is nothing to solve.
        if fingerprint.valid_world_point_count() < MIN_PNP_CORRESPONDENCES {
            return Err(SolverFailureReason::TooFewCorrespondences {
                found: fingerprint.valid_world_point_count(),
                required: MIN_PNP_CORRESPONDENCES,
            }
            .into());
        }

        let matches = self.pose_matcher.match_features(live, fingerprint)?;
        let observations = self.pose_observations(live, fingerprint, &matches, intrinsics);
        self.estimate_pose(&observations, intrinsics)
    }

    /// Pose when the matched stored features carry enough world points,
    /// homography otherwise.
    pub fn relocalize_auto(
        &self,
        frame: &GrayImage,
        fingerprint: &Fingerprint,
        intrinsics: Option<&CameraIntrinsics>,
    ) -> Result<Transform, RelocalizationError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(RelocalizationError::DegenerateInput);
        }
        let live = self.extract(frame, None);
        let intrinsics = intrinsics
            .filter(|k| k.is_valid())
            .map(|k| k.scaled_to(frame.width(), frame.height()));
        self.solve_auto(&live, fingerprint, intrinsics.as_ref())
    }

    pub fn solve_auto(
        &self,
        live: &FeatureSet,
        fingerprint: &Fingerprint,
        intrinsics: Option<&CameraIntrinsics>,
    ) -> Result<Transform, RelocalizationError> {
        if let Some(intrinsics) = intrinsics
            && fingerprint.has_world_points()
            && let Ok(matches) = self.pose_matcher.match_features(live, fingerprint)
        {
            let observations = self.pose_observations(live, fingerprint, &matches, intrinsics);
            if observations.len() >= MIN_PNP_CORRESPONDENCES {
                return self.estimate_pose(&observations, intrinsics);
            }
            debug!(
                target: "mural_core::pnp",
                "only {} matched features carry depth; solving a homography instead",
                observations.len()
            );
        }
        self.solve_homography(live, fingerprint)
    }

    fn pose_observations(
        &self,
        live: &FeatureSet,
        fingerprint: &Fingerprint,
        matches: &[DescriptorMatch],
        intrinsics: &CameraIntrinsics,
    ) -> Vec<PnPObservation> {
        let min_depth = self.config.pose.min_depth_m;
        let observations: Vec<PnPObservation> = matches
            .iter()
            .filter_map(|m| {
                let world = fingerprint.world_point(m.stored_idx)?;
                if world.z <= min_depth {
                    return None;
                }
                let kp = live.get(m.live_idx)?.keypoint;
                Some(PnPObservation {
                    world_xyz: world.cast::<f64>(),
                    norm_xy: intrinsics.normalize_pixel(&ImagePoint::new(kp.x as f64, kp.y as f64)),
                })
            })
            .collect();
        debug!(
            target: "mural_core::pnp",
            "{} of {} matches carry usable depth",
            observations.len(),
            matches.len()
        );
        observations
    }

    fn estimate_pose(
        &self,
        observations: &[PnPObservation],
        intrinsics: &CameraIntrinsics,
    ) -> Result<Transform, RelocalizationError> {
        let cfg = &self.config.pose;
        let focal = intrinsics.mean_focal();
        let pnp = PnPRansac::new(PnPRansacParams {
            iterations: cfg.iterations,
            threshold: cfg.reprojection_threshold_px / focal,
            min_inliers: cfg.min_inliers,
            min_inlier_ratio: cfg.min_inlier_ratio,
            seed: cfg.seed,
        });
        let result = pnp.estimate(observations)?;

        Ok(Transform {
            model: TransformModel::Pose(result.pose_cw),
            inlier_count: result.inliers.len(),
            correspondence_count: observations.len(),
            mean_reprojection_error_px: result.average_reprojection_error * focal,
        })
    }
}

impl Default for Relocalizer {
    fn default() -> Self {
        Self::new(RelocalizerConfig::default())
    }
}

fn pixel_pairs(
    matches: &[DescriptorMatch],
    live: &FeatureSet,
    fingerprint: &Fingerprint,
) -> (Vec<Point2<f64>>, Vec<Point2<f64>>) {
    let stored = fingerprint.entries();
    matches
        .iter()
        .filter_map(|m| {
            let s = stored.get(m.stored_idx)?.keypoint;
            let l = live.get(m.live_idx)?.keypoint;
            Some((
                Point2::new(s.x as f64, s.y as f64),
                Point2::new(l.x as f64, l.y as f64),
            ))
        })
        .unzip()
}
