use std::path::Path;

use mural_core::relocalize::MIN_PNP_CORRESPONDENCES;
use mural_core::RelocalizerConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which geometric model an attempt solves for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveMode {
    /// Pose when the fingerprint has world points and intrinsics are known,
    /// homography otherwise.
    #[default]
    Auto,
    Homography,
    Pose,
}

/// Relocalization session policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Minimum time between the starts of two attempts.
    pub min_attempt_interval_ms: u64,
    /// Consecutive successful attempts in `Placed` before locking on its own.
    /// `None` leaves locking to the caller.
    pub auto_lock_after: Option<u32>,
    /// Transforms with a larger mean reprojection error are not accepted.
    pub max_mean_reprojection_error_px: f64,
    /// Transforms with fewer inliers are not accepted.
    pub min_accepted_inliers: usize,
    pub mode: SolveMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_attempt_interval_ms: 1500,
            auto_lock_after: Some(3),
            max_mean_reprojection_error_px: 4.0,
            min_accepted_inliers: 12,
            mode: SolveMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub relocalizer: RelocalizerConfig,
    pub session: SessionConfig,
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let orb = &self.relocalizer.orb;
        if orb.max_features == 0 {
            return invalid("orb.max_features must be positive");
        }
        if orb.levels == 0 {
            return invalid("orb.levels must be at least 1");
        }
        if !(orb.scale_factor > 1.0) {
            return invalid("orb.scale_factor must be greater than 1");
        }
        if orb.grid_cell == 0 {
            return invalid("orb.grid_cell must be positive");
        }

        for (name, matcher) in [
            ("homography_matcher", &self.relocalizer.homography_matcher),
            ("pose_matcher", &self.relocalizer.pose_matcher),
        ] {
            if !(matcher.distance_multiplier >= 1.0) {
                return invalid(format!("{name}.distance_multiplier must be at least 1"));
            }
            if let Some(ratio) = matcher.ratio_threshold {
                if !(ratio > 0.0 && ratio <= 1.0) {
                    return invalid(format!("{name}.ratio_threshold must lie in (0, 1]"));
                }
            }
        }

        let homography = &self.relocalizer.homography;
        if !(homography.reprojection_threshold > 0.0) {
            return invalid("homography.reprojection_threshold must be positive");
        }
        if !(homography.confidence > 0.0 && homography.confidence < 1.0) {
            return invalid("homography.confidence must lie in (0, 1)");
        }
        if homography.max_iterations == 0 {
            return invalid("homography.max_iterations must be positive");
        }

        let pose = &self.relocalizer.pose;
        if !(pose.reprojection_threshold_px > 0.0) {
            return invalid("pose.reprojection_threshold_px must be positive");
        }
        if pose.iterations == 0 {
            return invalid("pose.iterations must be positive");
        }
        if pose.min_inliers < MIN_PNP_CORRESPONDENCES {
            return invalid(format!(
                "pose.min_inliers must be at least {MIN_PNP_CORRESPONDENCES}"
            ));
        }

        let session = &self.session;
        if !(session.max_mean_reprojection_error_px > 0.0) {
            return invalid("session.max_mean_reprojection_error_px must be positive");
        }
        if session.auto_lock_after == Some(0) {
            return invalid("session.auto_lock_after must be positive when set");
        }
        Ok(())
    }
}

fn invalid<T>(message: impl Into<String>) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(message.into()))
}
