use std::sync::OnceLock;

use super::{DESCRIPTOR_BYTES, Descriptor};
use crate::codec::seed::FeatureSeed;
use crate::img::PyramidLevel;
use crate::img::image_utils::bilinear_sample;

const ORB_TESTS: usize = DESCRIPTOR_BYTES * 8;
pub const DEFAULT_PATCH_RADIUS: usize = 15;
const PATTERN_SEED: u64 = 0x6d75_7261_6c5f_6f72;

/// A seed with its intensity-centroid orientation and binary descriptor.
#[derive(Debug, Clone, Copy)]
pub struct DescribedSeed {
    pub seed: FeatureSeed,
    /// Orientation in radians, `(-pi, pi]`.
    pub angle: f32,
    pub descriptor: Descriptor,
}

pub trait DescriptorExtractor {
    fn describe(&self, level: &PyramidLevel, seeds: &[FeatureSeed]) -> Vec<DescribedSeed>;
}

/// Oriented FAST and Rotated BRIEF descriptor extractor.
///
/// 256 point-pair intensity tests are drawn once from an isotropic Gaussian
/// over the patch. For each keypoint the pairs are steered by the
/// intensity-centroid angle and compared on the smoothed level image, giving
/// a 32-byte string compared by Hamming distance.
#[derive(Debug, Clone)]
pub struct OrbDescriptor {
    patch_radius: usize,
}

impl OrbDescriptor {
    pub fn new(patch_radius: usize) -> Self {
        Self {
            patch_radius: patch_radius.max(3),
        }
    }

    pub fn patch_radius(&self) -> usize {
        self.patch_radius
    }

    fn describe_seed(&self, level: &PyramidLevel, seed: &FeatureSeed) -> DescribedSeed {
        let cx = seed.px_uv.x;
        let cy = seed.px_uv.y;
        let angle = compute_orientation(level, cx as isize, cy as isize, self.patch_radius as isize);
        let scale = self.patch_radius as f32 / DEFAULT_PATCH_RADIUS as f32;
        let descriptor = build_descriptor(level, cx, cy, angle, scale, pattern_cache());
        DescribedSeed {
            seed: *seed,
            angle,
            descriptor,
        }
    }
}

impl Default for OrbDescriptor {
    fn default() -> Self {
        Self::new(DEFAULT_PATCH_RADIUS)
    }
}

impl DescriptorExtractor for OrbDescriptor {
    fn describe(&self, level: &PyramidLevel, seeds: &[FeatureSeed]) -> Vec<DescribedSeed> {
        seeds.iter().map(|seed| self.describe_seed(level, seed)).collect()
    }
}

#[derive(Clone, Copy)]
struct PatternPair {
    p1: (f32, f32),
    p2: (f32, f32),
}

fn pattern_cache() -> &'static [PatternPair] {
    static CACHE: OnceLock<Vec<PatternPair>> = OnceLock::new();
    CACHE
        .get_or_init(|| generate_pattern(ORB_TESTS, DEFAULT_PATCH_RADIUS as f32))
        .as_slice()
}

/// Builds the shared sampling pattern and returns its size.
pub(crate) fn warm_pattern_cache() -> usize {
    pattern_cache().len()
}

fn generate_pattern(count: usize, radius: f32) -> Vec<PatternPair> {
    let mut rng = XorShift64::new(PATTERN_SEED);
    // sigma^2 = S^2 / 25 for an S x S patch.
    let sigma = (2.0 * radius + 1.0) / 5.0;
    let mut pairs = Vec::with_capacity(count);
    while pairs.len() < count {
        let p1 = gaussian_point(&mut rng, sigma, radius);
        let p2 = gaussian_point(&mut rng, sigma, radius);
        if p1 != p2 {
            pairs.push(PatternPair { p1, p2 });
        }
    }
    pairs
}

fn gaussian_point(rng: &mut XorShift64, sigma: f32, radius: f32) -> (f32, f32) {
    loop {
        // Box-Muller
        let u1 = rng.next_f32().max(f32::MIN_POSITIVE);
        let u2 = rng.next_f32();
        let r = (-2.0 * u1.ln()).sqrt() * sigma;
        let theta = std::f32::consts::TAU * u2;
        let x = (r * theta.cos()).round();
        let y = (r * theta.sin()).round();
        if x * x + y * y <= radius * radius {
            return (x, y);
        }
    }
}

fn compute_orientation(level: &PyramidLevel, cx: isize, cy: isize, radius: isize) -> f32 {
    let image = &level.image;
    let w = image.width() as isize;
    let h = image.height() as isize;
    let r2 = radius * radius;
    let mut m01 = 0.0f32;
    let mut m10 = 0.0f32;
    for dy in -radius..=radius {
        let y = (cy + dy).clamp(0, h - 1) as u32;
        for dx in -radius..=radius {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let x = (cx + dx).clamp(0, w - 1) as u32;
            let intensity = image.get_pixel(x, y).0[0] as f32;
            m10 += dx as f32 * intensity;
            m01 += dy as f32 * intensity;
        }
    }

    if m10.abs() < f32::EPSILON && m01.abs() < f32::EPSILON {
        0.0
    } else {
        m01.atan2(m10)
    }
}

fn build_descriptor(
    level: &PyramidLevel,
    cx: f32,
    cy: f32,
    angle: f32,
    scale: f32,
    pattern: &[PatternPair],
) -> Descriptor {
    let (sin_theta, cos_theta) = angle.sin_cos();
    let mut bytes = [0u8; DESCRIPTOR_BYTES];
    for (i, pair) in pattern.iter().enumerate() {
        let (x1, y1) = rotate_point(pair.p1, cos_theta, sin_theta, scale, cx, cy);
        let (x2, y2) = rotate_point(pair.p2, cos_theta, sin_theta, scale, cx, cy);

        let v1 = bilinear_sample(&level.smoothed, x1, y1);
        let v2 = bilinear_sample(&level.smoothed, x2, y2);

        if v1 < v2 {
            bytes[i / 8] |= 1 << (i & 7);
        }
    }
    Descriptor(bytes)
}

fn rotate_point(
    (px, py): (f32, f32),
    cos_theta: f32,
    sin_theta: f32,
    scale: f32,
    cx: f32,
    cy: f32,
) -> (f32, f32) {
    let px = px * scale;
    let py = py * scale;
    (
        cos_theta * px - sin_theta * py + cx,
        sin_theta * px + cos_theta * py + cy,
    )
}

/// Fixed-seed generator so the sampling pattern is identical across runs and builds.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn next_f32(&mut self) -> f32 {
        let bits = self.next_u64() >> 40;
        bits as f32 / (1u64 << 24) as f32
    }
}
