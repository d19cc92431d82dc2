use crate::img::PyramidLevel;
use image::GrayImage;
use nalgebra::Vector2;

pub mod fast_seed;
pub use fast_seed::{FastDetectorConfig, FastDetectorType, FastSeeder, FastSeederConfig};

pub mod utils;

#[derive(Debug, Clone, Copy)]
pub struct FeatureGridConfig {
    pub cell_size: usize,
    pub max_features: usize,
    pub response_threshold: f32,
    pub per_cell_cap: usize,
    pub nms_radius_px: f32,
    /// Pixels at each image edge where no corner is accepted.
    pub border: usize,
}

impl Default for FeatureGridConfig {
    fn default() -> Self {
        Self {
            cell_size: 32,
            max_features: 500,
            response_threshold: 0.0,
            per_cell_cap: 16,
            nms_radius_px: 3.0,
            border: 19,
        }
    }
}

/// Corner candidate on a single pyramid level, in that level's pixel space.
#[derive(Debug, Clone, Copy)]
pub struct FeatureSeed {
    pub level: usize,
    pub level_scale: f32,
    pub px_uv: Vector2<f32>,
    pub score: f32,
}

pub trait FeatureSeederTrait {
    /// Detects corners on `level`. When a mask is supplied (base-image
    /// resolution), candidates on zero mask pixels are discarded before the
    /// feature budget is applied.
    fn seed(&self, level: &PyramidLevel, mask: Option<&GrayImage>) -> Vec<FeatureSeed>;
}
