mod common;

use approx::assert_relative_eq;
use common::{
    SIZE, keep_world_points, max_corner_error, plane_induced_homography, similarity_about_centre, textured_image,
    wall_depth, wall_intrinsics, warp,
};
use mural_engine::{
    CameraIntrinsics, Engine, EngineConfig, Fingerprint, generate_fingerprint, relocalize,
    relocalize_with_pose,
};
use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

fn seeded_engine() -> Engine {
    let mut config = EngineConfig::default();
    config.relocalizer.homography.seed = Some(11);
    config.relocalizer.pose.seed = Some(11);
    Engine::new(config).unwrap()
}

fn intrinsics() -> CameraIntrinsics {
    wall_intrinsics()
}

#[test]
fn reference_image_has_enough_keypoints() {
    let reference = textured_image(SIZE, SIZE, 1);
    let fp = generate_fingerprint(&reference, None, None, None);
    assert!(fp.len() >= 150, "only {} keypoints", fp.len());
    assert!(!fp.has_world_points());
}

#[test]
fn recovers_known_homography() {
    let engine = seeded_engine();
    let reference = textured_image(SIZE, SIZE, 1);
    let fp = engine.generate_fingerprint(&reference, None, None, None);

    let h = Matrix3::new(0.96, 0.04, 14.0, -0.03, 1.01, 9.0, 2.0e-5, 1.0e-5, 1.0);
    let live = warp(&reference, &h);
    let transform = engine.relocalize(&live, &fp).expect("homography recovered");

    assert!(transform.inlier_count >= 20, "{} inliers", transform.inlier_count);
    let corners = transform.project_corners(SIZE, SIZE).unwrap();
    let err = max_corner_error(&h, &corners, SIZE, SIZE);
    assert!(err < 3.0, "corner error {err}px");
}

#[test]
fn recovers_rotation_and_scale() {
    let engine = seeded_engine();
    let reference = textured_image(SIZE, SIZE, 2);
    let fp = engine.generate_fingerprint(&reference, None, None, None);

    let h = similarity_about_centre(SIZE, SIZE, 15.0, 0.9);
    let live = warp(&reference, &h);
    let transform = engine.relocalize(&live, &fp).expect("homography recovered");

    assert!(transform.inlier_count >= 20, "{} inliers", transform.inlier_count);
    let corners = transform.project_corners(SIZE, SIZE).unwrap();
    let err = max_corner_error(&h, &corners, SIZE, SIZE);
    assert!(err < 4.0, "corner error {err}px");
}

#[test]
fn unrelated_frame_is_not_placed() {
    let engine = seeded_engine();
    let fp = engine.generate_fingerprint(&textured_image(SIZE, SIZE, 3), None, None, None);
    for seed in [101, 202, 303] {
        let other = textured_image(SIZE, SIZE, seed);
        if let Some(t) = engine.relocalize(&other, &fp) {
            assert!(t.inlier_count < 20, "seed {seed}: {} inliers", t.inlier_count);
        }
    }
}

#[test]
fn empty_frame_yields_none() {
    let reference = textured_image(SIZE, SIZE, 4);
    let fp = generate_fingerprint(&reference, None, None, None);
    assert!(relocalize(&image::GrayImage::new(0, 0), &fp).is_none());
    assert!(relocalize(&reference, &Fingerprint::default()).is_none());
}

#[test]
fn mask_excludes_background() {
    let reference = textured_image(SIZE, SIZE, 5);
    let mask = image::GrayImage::from_fn(SIZE, SIZE, |x, _| image::Luma([if x < SIZE / 2 { 255 } else { 0 }]));
    let fp = generate_fingerprint(&reference, Some(&mask), None, None);
    assert!(!fp.is_empty());
    assert!(fp.keypoints().all(|kp| kp.x < (SIZE / 2) as f32 + 1.0));
}

fn wall_fingerprint(engine: &Engine, reference: &image::GrayImage) -> Fingerprint {
    engine.generate_fingerprint(reference, None, Some(&wall_depth()), Some(&intrinsics()))
}

#[test]
fn recovers_pose_of_planar_wall() {
    let engine = seeded_engine();
    let reference = textured_image(SIZE, SIZE, 6);
    let fp = wall_fingerprint(&engine, &reference);
    assert!(fp.has_world_points());
    assert_eq!(fp.valid_world_point_count(), fp.len());
    for i in 0..fp.len() {
        assert_relative_eq!(fp.world_point(i).unwrap().z, 2.0, epsilon = 1e-5);
    }

    let k = Matrix3::new(500.0, 0.0, 256.0, 0.0, 500.0, 256.0, 0.0, 0.0, 1.0);
    let rotation = Rotation3::from_euler_angles(0.02, 0.08, -0.03);
    let translation = Vector3::new(0.12, -0.05, 0.1);
    let h = plane_induced_homography(&k, &rotation, &translation, 2.0);
    let live = warp(&reference, &h);

    let transform = engine
        .relocalize_with_pose(&live, &fp, &intrinsics())
        .expect("pose recovered");
    let pose = transform.pose_cw().unwrap();
    assert!(transform.inlier_count >= 6);
    let angle = pose.rotation.angle_to(&UnitQuaternion::from_rotation_matrix(&rotation));
    assert!(angle < 0.03, "rotation error {angle} rad");
    let t_err = (pose.translation.vector - translation).norm();
    assert!(t_err < 0.05, "translation error {t_err} m");
    assert!(transform.pose_matrix().is_some());
}

#[test]
fn pose_needs_six_world_points() {
    let engine = seeded_engine();
    let reference = textured_image(SIZE, SIZE, 7);
    let full = wall_fingerprint(&engine, &reference);
    let sparse = keep_world_points(&full, 5);
    assert_eq!(sparse.valid_world_point_count(), 5);

    for _ in 0..3 {
        assert!(relocalize_with_pose(&reference, &sparse, &intrinsics()).is_none());
    }
    assert!(relocalize_with_pose(&reference, &full, &intrinsics()).is_some());
}

#[test]
fn auto_mode_counts_depth_on_matched_features() {
    let engine = seeded_engine();
    let reference = textured_image(SIZE, SIZE, 8);
    let full = wall_fingerprint(&engine, &reference);
    let relocalizer = engine.relocalizer();

    // Three world points out of hundreds still mark the fingerprint as
    // depth-bearing, but cannot support a pose.
    let sparse = keep_world_points(&full, 3);
    assert!(sparse.has_world_points());
    let transform = relocalizer
        .relocalize_auto(&reference, &sparse, Some(&intrinsics()))
        .expect("homography fallback");
    assert!(transform.homography().is_some());

    let transform = relocalizer
        .relocalize_auto(&reference, &full, Some(&intrinsics()))
        .expect("pose recovered");
    assert!(transform.pose_cw().is_some());

    let transform = relocalizer
        .relocalize_auto(&reference, &full, None)
        .expect("homography without intrinsics");
    assert!(transform.homography().is_some());
}

#[test]
fn synthetic_warp_maps_source_to_destination() {
    let mut src = image::GrayImage::new(16, 16);
    src.put_pixel(4, 5, image::Luma([200]));
    let h = Matrix3::new(1.0, 0.0, 3.0, 0.0, 1.0, 2.0, 0.0, 0.0, 1.0);
    let out = warp(&src, &h);
    assert_eq!(out.dimensions(), (16, 16));
    assert_eq!(out.get_pixel(7, 7).0[0], 200);
    assert_eq!(out.get_pixel(4, 5).0[0], 0);
}
