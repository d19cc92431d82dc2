//! Flat binary layout of a fingerprint.
//!
//! All fields are little-endian:
//!
//! ```text
//! i32 rows | i32 cols | i32 element type | i32 keypoint count
//! rows * cols descriptor bytes
//! count * 7 f32: x, y, size, angle, response, octave, class_id
//! optional count * 3 f32: world x, y, z (zeros where missing)
//! ```
//!
//! The world-point block is present exactly when the bytes after the
//! keypoint block number `12 * count`. Any other remainder is corrupt.

use log::debug;
use nalgebra::Point3;

use super::{ELEMENT_TYPE_U8, Fingerprint, FingerprintEntry, is_valid_world_point};
use crate::codec::{DESCRIPTOR_BYTES, Descriptor, Keypoint};
use crate::error::{CorruptReason, RelocalizationError};

const HEADER_BYTES: usize = 4 * 4;
const KEYPOINT_FIELDS: usize = 7;
const KEYPOINT_BYTES: usize = KEYPOINT_FIELDS * 4;
const WORLD_POINT_BYTES: usize = 3 * 4;

pub fn serialize(fingerprint: &Fingerprint) -> Vec<u8> {
    let (rows, cols, element_type) = fingerprint.descriptor_shape();
    let count = fingerprint.len();
    let world_bytes = if fingerprint.has_world_points() {
        count * WORLD_POINT_BYTES
    } else {
        0
    };
    let mut out =
        Vec::with_capacity(HEADER_BYTES + rows * cols + count * KEYPOINT_BYTES + world_bytes);

    for field in [rows as i32, cols as i32, element_type, count as i32] {
        out.extend_from_slice(&field.to_le_bytes());
    }
    for descriptor in fingerprint.descriptors() {
        out.extend_from_slice(descriptor.as_bytes());
    }
    for kp in fingerprint.keypoints() {
        for value in [
            kp.x,
            kp.y,
            kp.size,
            kp.angle,
            kp.response,
            kp.octave as f32,
            kp.class_id as f32,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    if fingerprint.has_world_points() {
        for entry in fingerprint.entries() {
            let p = entry.world_point.unwrap_or_else(Point3::origin);
            for value in [p.x, p.y, p.z] {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
    }
    out
}

/// Parses the flat layout, inferring whether world points are present.
pub fn deserialize(bytes: &[u8]) -> Result<Fingerprint, RelocalizationError> {
    deserialize_with_layout(bytes, None)
}

/// Parses the flat layout. When `has_world_points` is known from sibling
/// metadata, the buffer must agree with it.
pub fn deserialize_with_layout(
    bytes: &[u8],
    has_world_points: Option<bool>,
) -> Result<Fingerprint, RelocalizationError> {
    let corrupt = |reason: CorruptReason| -> RelocalizationError {
        debug!(target: "mural_core::fingerprint", "rejecting fingerprint: {reason}");
        reason.into()
    };

    if bytes.len() < HEADER_BYTES {
        return Err(corrupt(CorruptReason::Truncated {
            expected: HEADER_BYTES,
            actual: bytes.len(),
        }));
    }
    let mut reader = Reader::new(bytes);
    let rows = reader.i32()?;
    let cols = reader.i32()?;
    let element_type = reader.i32()?;
    let count = reader.i32()?;

    if rows < 0 || cols < 0 || count < 0 {
        return Err(corrupt(CorruptReason::HeaderMismatch("negative dimension")));
    }
    let (rows, cols, count) = (rows as usize, cols as usize, count as usize);
    if element_type != ELEMENT_TYPE_U8 {
        return Err(corrupt(CorruptReason::UnsupportedElementType(element_type)));
    }
    if rows != count {
        return Err(corrupt(CorruptReason::HeaderMismatch(
            "descriptor rows differ from keypoint count",
        )));
    }
    // An empty descriptor matrix is written 0 columns wide.
    let expected_cols = if rows == 0 { 0 } else { DESCRIPTOR_BYTES };
    if cols != expected_cols {
        return Err(corrupt(CorruptReason::HeaderMismatch("descriptor width")));
    }

    let body = count
        .checked_mul(DESCRIPTOR_BYTES + KEYPOINT_BYTES)
        .and_then(|n| n.checked_add(HEADER_BYTES))
        .ok_or_else(|| corrupt(CorruptReason::HeaderMismatch("dimensions overflow")))?;
    if bytes.len() < body {
        return Err(corrupt(CorruptReason::Truncated {
            expected: body,
            actual: bytes.len(),
        }));
    }

    let remainder = bytes.len() - body;
    let world_block = count * WORLD_POINT_BYTES;
    let world_present = match (remainder, has_world_points) {
        (0, None | Some(false)) => false,
        (r, None | Some(true)) if count > 0 && r == world_block => true,
        (0, Some(true)) if count == 0 => false,
        (0, Some(true)) => {
            return Err(corrupt(CorruptReason::Truncated {
                expected: body + world_block,
                actual: bytes.len(),
            }));
        }
        (r, _) => return Err(corrupt(CorruptReason::TrailingBytes(r))),
    };

    let mut descriptors = Vec::with_capacity(count);
    for _ in 0..count {
        let mut d = [0u8; DESCRIPTOR_BYTES];
        d.copy_from_slice(reader.take(DESCRIPTOR_BYTES)?);
        descriptors.push(Descriptor(d));
    }

    let mut keypoints = Vec::with_capacity(count);
    for idx in 0..count {
        let mut f = [0f32; KEYPOINT_FIELDS];
        for value in f.iter_mut() {
            *value = reader.f32()?;
        }
        if f.iter().any(|v| !v.is_finite()) {
            return Err(corrupt(CorruptReason::NonFiniteKeypoint(idx)));
        }
        keypoints.push(Keypoint {
            x: f[0],
            y: f[1],
            size: f[2],
            angle: f[3],
            response: f[4],
            octave: f[5] as i32,
            class_id: f[6] as i32,
        });
    }

    let mut points = vec![None; count];
    if world_present {
        for slot in points.iter_mut() {
            let p = Point3::new(reader.f32()?, reader.f32()?, reader.f32()?);
            *slot = Some(p).filter(is_valid_world_point);
        }
    }

    let entries = keypoints
        .into_iter()
        .zip(descriptors)
        .zip(points)
        .map(|((keypoint, descriptor), world_point)| FingerprintEntry {
            keypoint,
            descriptor,
            world_point,
        })
        .collect();
    Ok(Fingerprint::from_entries(entries, world_present))
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], RelocalizationError> {
        let end = self.offset + n;
        let slice = self.bytes.get(self.offset..end).ok_or(CorruptReason::Truncated {
            expected: end,
            actual: self.bytes.len(),
        })?;
        self.offset = end;
        Ok(slice)
    }

    fn array4(&mut self) -> Result<[u8; 4], RelocalizationError> {
        let s = self.take(4)?;
        Ok([s[0], s[1], s[2], s[3]])
    }

    fn i32(&mut self) -> Result<i32, RelocalizationError> {
        Ok(i32::from_le_bytes(self.array4()?))
    }

    fn f32(&mut self) -> Result<f32, RelocalizationError> {
        Ok(f32::from_le_bytes(self.array4()?))
    }
}
