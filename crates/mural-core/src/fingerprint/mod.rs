//! Reference-surface fingerprint: features of a reference image plus,
//! optionally, the 3D point behind each feature.

pub mod record;
pub mod store;

use image::GrayImage;
use log::debug;
use nalgebra::Point3;

use crate::codec::{DESCRIPTOR_BYTES, Descriptor, Feature, FeatureSet, Keypoint};
use crate::error::{CorruptReason, RelocalizationError};
use crate::img::DepthMap;
use crate::math::{CameraIntrinsics, ImagePoint};

pub use record::{decode_record, encode_record};
pub use store::{deserialize, serialize};

/// Descriptor element type code for unsigned bytes (matches the CV_8U tag).
pub const ELEMENT_TYPE_U8: i32 = 0;

/// One stored feature. The world point is `None` where depth was unavailable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FingerprintEntry {
    pub keypoint: Keypoint,
    pub descriptor: Descriptor,
    pub world_point: Option<Point3<f32>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fingerprint {
    entries: Vec<FingerprintEntry>,
    has_world_points: bool,
}

impl Fingerprint {
    /// Fingerprint without 3D data.
    pub fn from_features(features: FeatureSet) -> Self {
        let entries = features
            .into_vec()
            .into_iter()
            .map(|Feature { keypoint, descriptor }| FingerprintEntry {
                keypoint,
                descriptor,
                world_point: None,
            })
            .collect();
        Self {
            entries,
            has_world_points: false,
        }
    }

    /// Fingerprint with one optional world point per feature. Points with
    /// non-positive or non-finite depth are stored as missing.
    pub fn with_world_points(
        features: FeatureSet,
        points: Vec<Option<Point3<f32>>>,
    ) -> Result<Self, RelocalizationError> {
        if points.len() != features.len() {
            return Err(CorruptReason::WorldPointCount {
                points: points.len(),
                keypoints: features.len(),
            }
            .into());
        }
        let entries: Vec<_> = features
            .into_vec()
            .into_iter()
            .zip(points)
            .map(|(feature, point)| FingerprintEntry {
                keypoint: feature.keypoint,
                descriptor: feature.descriptor,
                world_point: point.filter(is_valid_world_point),
            })
            .collect();
        let has_world_points = !entries.is_empty();
        Ok(Self {
            entries,
            has_world_points,
        })
    }

    /// Extracts features with `codec` and, when both depth and intrinsics are
    /// supplied, back-projects each keypoint through the depth map.
    pub fn generate(
        codec: &dyn crate::codec::FeatureCodec,
        image: &GrayImage,
        mask: Option<&GrayImage>,
        depth: Option<&DepthMap>,
        intrinsics: Option<&CameraIntrinsics>,
    ) -> Self {
        let features = codec.extract(image, mask);
        let (Some(depth), Some(intrinsics)) = (depth, intrinsics) else {
            return Self::from_features(features);
        };
        if !intrinsics.is_valid() {
            debug!(target: "mural_core::fingerprint", "invalid intrinsics; storing 2D fingerprint");
            return Self::from_features(features);
        }

        let (width, height) = image.dimensions();
        let intrinsics = intrinsics.scaled_to(width, height);
        let points: Vec<_> = features
            .iter()
            .map(|f| {
                let z = depth.depth_at(f.keypoint.x, f.keypoint.y, width, height)?;
                let p = intrinsics.back_project(
                    &ImagePoint::new(f.keypoint.x as f64, f.keypoint.y as f64),
                    z as f64,
                );
                Some(Point3::new(p.x as f32, p.y as f32, p.z as f32))
            })
            .collect();
        let valid = points.iter().flatten().count();
        debug!(
            target: "mural_core::fingerprint",
            "back-projected {valid}/{} keypoints through depth",
            points.len()
        );
        // Lengths agree by construction.
        Self::with_world_points(features, points).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_world_points(&self) -> bool {
        self.has_world_points
    }

    pub fn entries(&self) -> &[FingerprintEntry] {
        &self.entries
    }

    pub fn keypoints(&self) -> impl Iterator<Item = &Keypoint> {
        self.entries.iter().map(|e| &e.keypoint)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.entries.iter().map(|e| &e.descriptor)
    }

    pub fn world_point(&self, idx: usize) -> Option<Point3<f32>> {
        self.entries.get(idx).and_then(|e| e.world_point)
    }

    pub fn valid_world_point_count(&self) -> usize {
        self.entries.iter().filter(|e| e.world_point.is_some()).count()
    }

    /// Descriptor matrix shape `(rows, cols, element type)`.
    pub fn descriptor_shape(&self) -> (usize, usize, i32) {
        let cols = if self.entries.is_empty() { 0 } else { DESCRIPTOR_BYTES };
        (self.entries.len(), cols, ELEMENT_TYPE_U8)
    }

    pub(crate) fn from_entries(entries: Vec<FingerprintEntry>, has_world_points: bool) -> Self {
        let has_world_points = has_world_points && !entries.is_empty();
        Self {
            entries,
            has_world_points,
        }
    }
}

/// A stored point is usable only with finite coordinates and positive depth.
pub fn is_valid_world_point(p: &Point3<f32>) -> bool {
    p.x.is_finite() && p.y.is_finite() && p.z.is_finite() && p.z > 0.0
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn keypoint(i: usize) -> Keypoint {
        Keypoint {
            x: 10.0 + i as f32 * 3.5,
            y: 200.0 - i as f32,
            size: 31.0 * (1.0 + (i % 3) as f32 * 0.2),
            angle: (i as f32 * 37.0) % 360.0,
            response: 15.0 + i as f32,
            octave: (i % 4) as i32,
            class_id: -1,
        }
    }

    pub fn descriptor(i: usize) -> Descriptor {
        let mut bytes = [0u8; DESCRIPTOR_BYTES];
        for (j, b) in bytes.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(31).wrapping_add(j as u8 * 7);
        }
        Descriptor(bytes)
    }

    pub fn features(n: usize) -> FeatureSet {
        FeatureSet::new(
            (0..n)
                .map(|i| Feature {
                    keypoint: keypoint(i),
                    descriptor: descriptor(i),
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::features;
    use super::*;
    use approx::assert_relative_eq;

    struct FixedCodec(FeatureSet);

    impl crate::codec::FeatureCodec for FixedCodec {
        fn extract(&self, _image: &GrayImage, _mask: Option<&GrayImage>) -> FeatureSet {
            self.0.clone()
        }
    }

    #[test]
    fn world_point_count_must_match() {
        let err = Fingerprint::with_world_points(features(3), vec![None; 2]).unwrap_err();
        assert!(matches!(
            err,
            RelocalizationError::CorruptFingerprint(CorruptReason::WorldPointCount { .. })
        ));
    }

    #[test]
    fn invalid_points_become_missing() {
        let fp = Fingerprint::with_world_points(
            features(3),
            vec![
                Some(Point3::new(0.0, 0.0, 1.0)),
                Some(Point3::new(0.0, 0.0, 0.0)),
                Some(Point3::new(f32::NAN, 0.0, 1.0)),
            ],
        )
        .unwrap();
        assert!(fp.has_world_points());
        assert_eq!(fp.valid_world_point_count(), 1);
        assert!(fp.world_point(1).is_none());
    }

    #[test]
    fn generate_back_projects_through_depth() {
        let mut feats = features(2).into_vec();
        feats[0].keypoint.x = 60.0;
        feats[0].keypoint.y = 40.0;
        feats[1].keypoint.x = 10.0;
        feats[1].keypoint.y = 10.0;
        let codec = FixedCodec(FeatureSet::new(feats));

        // Depth at half resolution: valid on the right half only.
        let depth = DepthMap::new(
            50,
            50,
            (0..2500).map(|i| if i % 50 >= 25 { 2000 } else { 0 }).collect(),
        )
        .unwrap();
        let intrinsics = CameraIntrinsics::new(100.0, 100.0, 50.0, 50.0, 100, 100);
        let image = GrayImage::new(100, 100);

        let fp = Fingerprint::generate(&codec, &image, None, Some(&depth), Some(&intrinsics));
        assert!(fp.has_world_points());
        let p = fp.world_point(0).unwrap();
        assert_relative_eq!(p.z, 2.0);
        assert_relative_eq!(p.x, 0.2, epsilon = 1e-6);
        assert_relative_eq!(p.y, -0.2, epsilon = 1e-6);
        assert!(fp.world_point(1).is_none());
    }

    #[test]
    fn generate_without_depth_is_two_dimensional() {
        let codec = FixedCodec(features(4));
        let fp = Fingerprint::generate(&codec, &GrayImage::new(10, 10), None, None, None);
        assert_eq!(fp.len(), 4);
        assert!(!fp.has_world_points());
        assert_eq!(fp.descriptor_shape(), (4, DESCRIPTOR_BYTES, ELEMENT_TYPE_U8));
    }
}
