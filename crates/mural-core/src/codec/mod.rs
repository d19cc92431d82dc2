//! Feature codec: oriented FAST corners with rotated binary descriptors over
//! a scale pyramid.

pub mod orb;
pub mod seed;

use image::GrayImage;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::img::build_pyramid;
use orb::{DescriptorExtractor, OrbDescriptor};
use seed::{FastDetectorConfig, FastSeeder, FastSeederConfig, FeatureGridConfig, FeatureSeederTrait};

/// Bytes per binary descriptor (256 intensity tests).
pub const DESCRIPTOR_BYTES: usize = 32;

/// A detected feature location in base-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Diameter of the described patch, in base-image pixels.
    pub size: f32,
    /// Orientation in degrees, `[0, 360)`.
    pub angle: f32,
    pub response: f32,
    /// Pyramid level the feature was detected on.
    pub octave: i32,
    pub class_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of differing bits.
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0
            .chunks_exact(8)
            .zip(other.0.chunks_exact(8))
            .map(|(a, b)| {
                let a = u64::from_le_bytes(a.try_into().unwrap_or([0; 8]));
                let b = u64::from_le_bytes(b.try_into().unwrap_or([0; 8]));
                (a ^ b).count_ones()
            })
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feature {
    pub keypoint: Keypoint,
    pub descriptor: Descriptor,
}

/// Keypoints and descriptors of one image, index-aligned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSet {
    features: Vec<Feature>,
}

impl FeatureSet {
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn as_slice(&self) -> &[Feature] {
        &self.features
    }

    pub fn get(&self, idx: usize) -> Option<&Feature> {
        self.features.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter()
    }

    pub fn into_vec(self) -> Vec<Feature> {
        self.features
    }
}

pub trait FeatureCodec: Send + Sync {
    /// Extracts features from a grayscale image. Non-zero `mask` pixels mark
    /// where features may be placed; a mask whose size differs from the image
    /// yields no features.
    fn extract(&self, image: &GrayImage, mask: Option<&GrayImage>) -> FeatureSet;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrbConfig {
    pub max_features: usize,
    pub levels: usize,
    pub scale_factor: f32,
    pub fast_threshold: f32,
    pub patch_radius: usize,
    pub edge_border: usize,
    pub grid_cell: usize,
    pub per_cell_cap: usize,
    pub nms_radius_px: f32,
    pub descriptor_blur_sigma: f32,
}

impl Default for OrbConfig {
    fn default() -> Self {
        Self {
            max_features: 500,
            levels: 8,
            scale_factor: 1.2,
            fast_threshold: 20.0,
            patch_radius: orb::DEFAULT_PATCH_RADIUS,
            edge_border: 19,
            grid_cell: 32,
            per_cell_cap: 16,
            nms_radius_px: 3.0,
            descriptor_blur_sigma: 2.0,
        }
    }
}

/// ORB-style [`FeatureCodec`]. Deterministic: the same image and mask always
/// produce the same features in the same order.
#[derive(Debug, Clone)]
pub struct OrbCodec {
    config: OrbConfig,
    descriptor: OrbDescriptor,
}

impl OrbCodec {
    pub fn new(config: OrbConfig) -> Self {
        Self {
            descriptor: OrbDescriptor::new(config.patch_radius),
            config,
        }
    }

    pub fn config(&self) -> &OrbConfig {
        &self.config
    }

    fn seeder_for(&self, budget: usize) -> FastSeeder {
        FastSeeder::new(FastSeederConfig {
            grid: FeatureGridConfig {
                cell_size: self.config.grid_cell,
                max_features: budget,
                response_threshold: 0.0,
                per_cell_cap: self.config.per_cell_cap,
                nms_radius_px: self.config.nms_radius_px,
                border: self.config.edge_border.max(self.config.patch_radius),
            },
            detector: FastDetectorConfig {
                intensity_threshold: self.config.fast_threshold,
                ..FastDetectorConfig::default()
            },
        })
    }
}

impl Default for OrbCodec {
    fn default() -> Self {
        Self::new(OrbConfig::default())
    }
}

impl FeatureCodec for OrbCodec {
    fn extract(&self, image: &GrayImage, mask: Option<&GrayImage>) -> FeatureSet {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            debug!(target: "mural_core::codec", "empty image, no features");
            return FeatureSet::default();
        }
        if let Some(mask) = mask
            && mask.dimensions() != image.dimensions()
        {
            warn!(
                target: "mural_core::codec",
                "mask {}x{} does not match image {}x{}; extracting nothing",
                mask.width(),
                mask.height(),
                width,
                height
            );
            return FeatureSet::default();
        }

        let border = self.config.edge_border.max(self.config.patch_radius) as u32;
        let pyramid = build_pyramid(
            image,
            self.config.levels,
            self.config.scale_factor,
            self.config.descriptor_blur_sigma,
            2 * border + 1,
        );
        let budgets = level_budgets(
            self.config.max_features,
            pyramid.levels().len(),
            self.config.scale_factor,
        );

        let mut features = Vec::with_capacity(self.config.max_features);
        for (level, budget) in pyramid.levels().iter().zip(budgets) {
            if budget == 0 {
                continue;
            }
            let seeds = self.seeder_for(budget).seed(level, mask);
            let size = (2 * self.descriptor.patch_radius() + 1) as f32 / level.scale;
            for described in self.descriptor.describe(level, &seeds) {
                let (x, y) = level.to_base(described.seed.px_uv.x, described.seed.px_uv.y);
                features.push(Feature {
                    keypoint: Keypoint {
                        x,
                        y,
                        size,
                        angle: wrap_degrees(described.angle.to_degrees()),
                        response: described.seed.score,
                        octave: level.octave as i32,
                        class_id: -1,
                    },
                    descriptor: described.descriptor,
                });
            }
        }

        debug!(
            target: "mural_core::codec",
            "extracted {} features from {}x{} over {} levels",
            features.len(),
            width,
            height,
            pyramid.levels().len()
        );
        FeatureSet::new(features)
    }
}

fn wrap_degrees(deg: f32) -> f32 {
    let wrapped = deg.rem_euclid(360.0);
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}

/// Splits a feature budget across levels in proportion to level area,
/// geometric in `1 / scale_factor`. The remainder goes to the last level.
fn level_budgets(total: usize, levels: usize, scale_factor: f32) -> Vec<usize> {
    if levels == 0 {
        return Vec::new();
    }
    let inv = 1.0 / scale_factor.max(1.0 + f32::EPSILON);
    let first = if (1.0 - inv.powi(levels as i32)).abs() < f32::EPSILON {
        total as f32 / levels as f32
    } else {
        total as f32 * (1.0 - inv) / (1.0 - inv.powi(levels as i32))
    };

    let mut budgets = Vec::with_capacity(levels);
    let mut assigned = 0usize;
    let mut desired = first;
    for _ in 0..levels - 1 {
        let n = (desired.round() as usize).min(total - assigned);
        budgets.push(n);
        assigned += n;
        desired *= inv;
    }
    budgets.push(total - assigned);
    budgets
}
