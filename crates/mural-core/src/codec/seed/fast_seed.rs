use super::{FeatureGridConfig, FeatureSeed, FeatureSeederTrait};
use crate::codec::seed::utils::radius_nms;
use crate::img::PyramidLevel;
use crate::img::image_utils::mask_allows;
use image::GrayImage;
use log::{debug, trace};
use nalgebra::Vector2;

/// Bresenham circle of radius 3, clockwise from 12 o'clock.
const CIRCLE_OFFSETS: [(isize, isize); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];
const CIRCLE_RADIUS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastDetectorType {
    Type7_12,
    Type9_16,
}

impl FastDetectorType {
    #[inline]
    fn contiguous_arc_length(self) -> usize {
        match self {
            Self::Type7_12 => 7,
            Self::Type9_16 => 9,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FastDetectorConfig {
    pub intensity_threshold: f32,
    pub nonmax_suppression: bool,
    pub detector_type: FastDetectorType,
}

impl Default for FastDetectorConfig {
    fn default() -> Self {
        Self {
            intensity_threshold: 20.0,
            nonmax_suppression: true,
            detector_type: FastDetectorType::Type9_16,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FastSeederConfig {
    pub grid: FeatureGridConfig,
    pub detector: FastDetectorConfig,
}

#[derive(Debug, Clone)]
pub struct FastSeeder {
    config: FastSeederConfig,
    arc_length: usize,
}

impl FastSeeder {
    pub fn new(config: FastSeederConfig) -> Self {
        let mut detector = config.detector;
        detector.intensity_threshold = detector.intensity_threshold.max(1.0);
        let arc_length = detector.detector_type.contiguous_arc_length();

        trace!(
            target: "mural_core::codec",
            "FAST seeder config: threshold {:.1}, nonmax {}, arc length {}",
            detector.intensity_threshold,
            detector.nonmax_suppression,
            arc_length
        );

        Self {
            config: FastSeederConfig {
                grid: config.grid,
                detector,
            },
            arc_length,
        }
    }
}

impl FeatureSeederTrait for FastSeeder {
    fn seed(&self, level: &PyramidLevel, mask: Option<&GrayImage>) -> Vec<FeatureSeed> {
        let width = level.width();
        let height = level.height();
        let grid_cfg = self.config.grid;
        let detector_cfg = self.config.detector;

        let max_features = grid_cfg.max_features;
        if max_features == 0 {
            return Vec::new();
        }
        let cell = grid_cfg.cell_size.max(4);
        let per_cell_cap = grid_cfg.per_cell_cap.max(1);
        let nms_radius = grid_cfg.nms_radius_px.max(0.0);
        let border = grid_cfg.border.max(CIRCLE_RADIUS);

        if width <= border * 2 || height <= border * 2 {
            return Vec::new();
        }

        let x_lo = border;
        let x_hi = width - border;
        let y_lo = border;
        let y_hi = height - border;

        let cells_x = (x_hi - x_lo).div_ceil(cell);
        let cells_y = (y_hi - y_lo).div_ceil(cell);

        let pixels = level.image.as_raw();
        let mut score_map = vec![0.0f32; width * height];
        let mut candidates: Vec<Candidate> = Vec::new();

        for y in y_lo..y_hi {
            for x in x_lo..x_hi {
                if let Some(score) = fast_corner_score(
                    pixels,
                    width,
                    x,
                    y,
                    detector_cfg.intensity_threshold,
                    self.arc_length,
                ) {
                    score_map[y * width + x] = score;
                    candidates.push(Candidate { x, y, score });
                }
            }
        }

        trace!(
            target: "mural_core::codec",
            "FAST detected {} raw corners above threshold {:.1}",
            candidates.len(),
            detector_cfg.intensity_threshold
        );

        if candidates.is_empty() {
            debug!(
                target: "mural_core::codec",
                "FAST seeding in {}x{} (level {}) → 0 (raw)",
                width, height, level.octave
            );
            return Vec::new();
        }

        let candidates = if detector_cfg.nonmax_suppression {
            apply_nonmax_suppression(&candidates, &score_map, width, height)
        } else {
            candidates
        };

        let mut buckets: Vec<Vec<FeatureSeed>> =
            vec![Vec::with_capacity(per_cell_cap); cells_x * cells_y];

        for candidate in candidates {
            if candidate.score < grid_cfg.response_threshold {
                continue;
            }
            if let Some(mask) = mask {
                let (bx, by) = level.to_base(candidate.x as f32, candidate.y as f32);
                if !mask_allows(mask, bx, by) {
                    continue;
                }
            }

            let cx = (candidate.x - x_lo) / cell;
            let cy = (candidate.y - y_lo) / cell;
            let bucket = &mut buckets[cy * cells_x + cx];
            insert_sorted(
                bucket,
                FeatureSeed {
                    level: level.octave,
                    level_scale: level.scale,
                    px_uv: Vector2::new(candidate.x as f32, candidate.y as f32),
                    score: candidate.score,
                },
            );

            if bucket.len() > per_cell_cap {
                bucket.pop();
            }
        }

        let mut seeds: Vec<FeatureSeed> = buckets.into_iter().flatten().collect();
        if seeds.is_empty() {
            debug!(
                target: "mural_core::codec",
                "FAST seeding in {}x{} (level {}) → 0 (grid/mask filtered)",
                width, height, level.octave
            );
            return seeds;
        }

        // Stable sort keeps scan order among equal scores.
        seeds.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut seeds = if nms_radius > 0.0 {
            radius_nms(seeds, nms_radius, max_features)
        } else {
            seeds
        };
        seeds.truncate(max_features);

        debug!(
            target: "mural_core::codec",
            "FAST seeding in {}x{} (level {}, cell {}, K {}, NMS {:.1}px) → {} (max {})",
            width,
            height,
            level.octave,
            cell,
            per_cell_cap,
            nms_radius,
            seeds.len(),
            max_features
        );

        seeds
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    x: usize,
    y: usize,
    score: f32,
}

#[inline]
fn pixel_at(pixels: &[u8], width: usize, x: usize, y: usize, offset: (isize, isize)) -> f32 {
    let px = (x as isize + offset.0) as usize;
    let py = (y as isize + offset.1) as usize;
    pixels[py * width + px] as f32
}

/// Segment-test score: the largest summed contrast over a contiguous arc of
/// at least `arc_length` circle pixels that are all brighter or all darker
/// than the centre by `threshold`. Caller guarantees a 3 px margin.
fn fast_corner_score(
    pixels: &[u8],
    width: usize,
    x: usize,
    y: usize,
    threshold: f32,
    arc_length: usize,
) -> Option<f32> {
    let center = pixels[y * width + x] as f32;
    let high = center + threshold;
    let low = center - threshold;

    // Quick rejection on the four compass points.
    let mut brighter = 0;
    let mut darker = 0;
    for idx in [0usize, 4, 8, 12] {
        let sample = pixel_at(pixels, width, x, y, CIRCLE_OFFSETS[idx]);
        if sample > high {
            brighter += 1;
        } else if sample < low {
            darker += 1;
        }
    }
    let min_compass = if arc_length >= 9 { 2 } else { 1 };
    if brighter < min_compass && darker < min_compass {
        return None;
    }

    let mut circle_vals = [0.0f32; 16];
    let mut classes = [0i8; 32];
    for (i, &offset) in CIRCLE_OFFSETS.iter().enumerate() {
        let val = pixel_at(pixels, width, x, y, offset);
        circle_vals[i] = val;
        classes[i] = if val > high {
            1
        } else if val < low {
            -1
        } else {
            0
        };
        classes[i + 16] = classes[i];
    }

    let mut best: Option<f32> = None;
    let mut idx = 0usize;
    while idx < 16 {
        let class = classes[idx];
        if class == 0 {
            idx += 1;
            continue;
        }
        let mut len = 0usize;
        let mut sum = 0.0f32;
        while len < 16 && classes[idx + len] == class {
            let val = circle_vals[(idx + len) % 16];
            sum += if class > 0 { val - center } else { center - val };
            len += 1;
        }
        if len >= arc_length {
            best = Some(best.map_or(sum, |b| b.max(sum)));
        }
        idx += len;
    }

    best
}

fn apply_nonmax_suppression(
    candidates: &[Candidate],
    score_map: &[f32],
    width: usize,
    height: usize,
) -> Vec<Candidate> {
    candidates
        .iter()
        .filter(|c| {
            let x_min = c.x.saturating_sub(1);
            let x_max = (c.x + 1).min(width - 1);
            let y_min = c.y.saturating_sub(1);
            let y_max = (c.y + 1).min(height - 1);
            (y_min..=y_max).all(|ny| {
                (x_min..=x_max).all(|nx| {
                    let neighbour = score_map[ny * width + nx];
                    // Ties resolve towards the earlier pixel in scan order.
                    neighbour < c.score
                        || (nx == c.x && ny == c.y)
                        || (neighbour == c.score && (ny, nx) > (c.y, c.x))
                })
            })
        })
        .copied()
        .collect()
}

fn insert_sorted(bucket: &mut Vec<FeatureSeed>, seed: FeatureSeed) {
    let insert_pos = bucket
        .iter()
        .position(|existing| existing.score < seed.score)
        .unwrap_or(bucket.len());
    bucket.insert(insert_pos, seed);
}
