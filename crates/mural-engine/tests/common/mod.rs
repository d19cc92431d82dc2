#![allow(dead_code)]

use image::{GrayImage, Luma};
use imageproc::geometric_transformations::{Interpolation, Projection, warp as warp_projective};
use mural_core::codec::{Feature, FeatureSet};
use mural_core::{CameraIntrinsics, DepthMap, Fingerprint};
use nalgebra::{Matrix3, Point2, Rotation3, Vector3};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

pub const SIZE: u32 = 512;

/// Piecewise-constant scene of overlapping rectangles over a slow gradient.
pub fn textured_image(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut img = GrayImage::from_fn(width, height, |x, y| Luma([(90 + (x + y) / 16 % 24) as u8]));
    for _ in 0..240 {
        let w = rng.gen_range(10..56u32).min(width - 1);
        let h = rng.gen_range(10..56u32).min(height - 1);
        let x0 = rng.gen_range(0..width - w);
        let y0 = rng.gen_range(0..height - h);
        let value: u8 = rng.gen_range(0..=255);
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                img.put_pixel(x, y, Luma([value]));
            }
        }
    }
    img
}

/// Renders `src` through homography `h` (source to destination pixels) on a
/// canvas of the same size. Uncovered pixels are black.
pub fn warp(src: &GrayImage, h: &Matrix3<f64>) -> GrayImage {
    let row_major: Vec<f32> = h.transpose().iter().map(|&v| v as f32).collect();
    let mut matrix = [0.0f32; 9];
    matrix.copy_from_slice(&row_major);
    let projection = Projection::from_matrix(matrix).expect("invertible homography");
    warp_projective(src, &projection, Interpolation::Bilinear, Luma([0]))
}

/// Rotation by `degrees` and uniform `scale` about the image centre.
pub fn similarity_about_centre(width: u32, height: u32, degrees: f64, scale: f64) -> Matrix3<f64> {
    let (cx, cy) = (width as f64 / 2.0, height as f64 / 2.0);
    let (s, c) = degrees.to_radians().sin_cos();
    let to_origin = Matrix3::new(1.0, 0.0, -cx, 0.0, 1.0, -cy, 0.0, 0.0, 1.0);
    let back = Matrix3::new(1.0, 0.0, cx, 0.0, 1.0, cy, 0.0, 0.0, 1.0);
    let rotate = Matrix3::new(scale * c, -scale * s, 0.0, scale * s, scale * c, 0.0, 0.0, 0.0, 1.0);
    back * rotate * to_origin
}

pub fn apply(h: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    Point2::new(v.x / v.z, v.y / v.z)
}

/// Largest distance between where `expected` and `actual` send the corners
/// of a `width`×`height` image.
pub fn max_corner_error(expected: &Matrix3<f64>, actual: &[Point2<f64>; 4], width: u32, height: u32) -> f64 {
    let (w, h) = (width as f64, height as f64);
    let corners = [
        Point2::new(0.0, 0.0),
        Point2::new(w, 0.0),
        Point2::new(w, h),
        Point2::new(0.0, h),
    ];
    corners
        .iter()
        .zip(actual)
        .map(|(c, a)| (apply(expected, c) - a).norm())
        .fold(0.0, f64::max)
}

/// Image-to-image homography induced by the plane `z = depth` of the
/// reference camera for a second camera at `rotation`, `translation`.
pub fn plane_induced_homography(
    k: &Matrix3<f64>,
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
    depth: f64,
) -> Matrix3<f64> {
    let normal = Vector3::z();
    let euclidean = rotation.matrix() + translation * normal.transpose() / depth;
    let k_inv = k.try_inverse().expect("invertible intrinsics");
    k * euclidean * k_inv
}

pub fn wall_intrinsics() -> CameraIntrinsics {
    CameraIntrinsics::new(500.0, 500.0, 256.0, 256.0, SIZE, SIZE)
}

/// Flat 2 m depth over the whole reference, at half resolution.
pub fn wall_depth() -> DepthMap {
    DepthMap::new(SIZE / 2, SIZE / 2, vec![2000; (SIZE as usize / 2).pow(2)]).expect("depth size")
}

/// Copy of `fp` in which only the first `keep` entries retain a world point.
pub fn keep_world_points(fp: &Fingerprint, keep: usize) -> Fingerprint {
    let features = FeatureSet::new(
        fp.entries()
            .iter()
            .map(|e| Feature {
                keypoint: e.keypoint,
                descriptor: e.descriptor,
            })
            .collect(),
    );
    let points = (0..fp.len())
        .map(|i| if i < keep { fp.world_point(i) } else { None })
        .collect();
    Fingerprint::with_world_points(features, points).expect("one point per entry")
}
