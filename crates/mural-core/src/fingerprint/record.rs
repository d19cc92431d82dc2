//! Self-describing storage envelope around the flat fingerprint layout.
//!
//! ```text
//! b"MURALFP1" | u16 version | u32 payload length | u32 crc32 | bincode payload
//! ```
//!
//! The payload records whether world points are present, so the flat buffer
//! inside is decoded against an explicit layout instead of inferring it.

use crc32fast::Hasher;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::Fingerprint;
use super::store::{deserialize_with_layout, serialize};
use crate::error::{CorruptReason, RelocalizationError};

const RECORD_MAGIC: &[u8; 8] = b"MURALFP1";
const RECORD_VERSION: u16 = 1;
const PREFIX_BYTES: usize = RECORD_MAGIC.len() + 2 + 4 + 4;

#[derive(Debug, Serialize, Deserialize)]
struct RecordPayload {
    version: u16,
    has_world_points: bool,
    keypoint_count: u32,
    fingerprint: Vec<u8>,
}

pub fn encode_record(fingerprint: &Fingerprint) -> Result<Vec<u8>, RelocalizationError> {
    let payload = RecordPayload {
        version: RECORD_VERSION,
        has_world_points: fingerprint.has_world_points(),
        keypoint_count: fingerprint.len() as u32,
        fingerprint: serialize(fingerprint),
    };
    let payload_bytes = bincode::serialize(&payload)
        .map_err(|err| CorruptReason::Envelope(err.to_string()))?;

    let mut hasher = Hasher::new();
    hasher.update(&payload_bytes);
    let checksum = hasher.finalize();

    let mut buffer = Vec::with_capacity(PREFIX_BYTES + payload_bytes.len());
    buffer.extend_from_slice(RECORD_MAGIC);
    buffer.extend_from_slice(&RECORD_VERSION.to_le_bytes());
    buffer.extend_from_slice(&(payload_bytes.len() as u32).to_le_bytes());
    buffer.extend_from_slice(&checksum.to_le_bytes());
    buffer.extend_from_slice(&payload_bytes);

    info!(
        target: "mural_core::fingerprint",
        "encoded fingerprint record: {} keypoints, world points {}, {} bytes",
        fingerprint.len(),
        fingerprint.has_world_points(),
        buffer.len()
    );
    Ok(buffer)
}

pub fn decode_record(bytes: &[u8]) -> Result<Fingerprint, RelocalizationError> {
    if bytes.len() < PREFIX_BYTES {
        return Err(CorruptReason::Truncated {
            expected: PREFIX_BYTES,
            actual: bytes.len(),
        }
        .into());
    }

    let (magic, remainder) = bytes.split_at(RECORD_MAGIC.len());
    if magic != RECORD_MAGIC {
        return Err(CorruptReason::BadMagic.into());
    }

    let (version_bytes, remainder) = remainder.split_at(2);
    let version = u16::from_le_bytes([version_bytes[0], version_bytes[1]]);
    if version != RECORD_VERSION {
        return Err(CorruptReason::UnsupportedVersion(version).into());
    }

    let (length_bytes, remainder) = remainder.split_at(4);
    let payload_len = u32::from_le_bytes([
        length_bytes[0],
        length_bytes[1],
        length_bytes[2],
        length_bytes[3],
    ]) as usize;

    let (checksum_bytes, payload_bytes) = remainder.split_at(4);
    let expected = u32::from_le_bytes([
        checksum_bytes[0],
        checksum_bytes[1],
        checksum_bytes[2],
        checksum_bytes[3],
    ]);

    if payload_bytes.len() < payload_len {
        return Err(CorruptReason::Truncated {
            expected: PREFIX_BYTES + payload_len,
            actual: bytes.len(),
        }
        .into());
    }
    if payload_bytes.len() > payload_len {
        return Err(CorruptReason::TrailingBytes(payload_bytes.len() - payload_len).into());
    }

    let mut hasher = Hasher::new();
    hasher.update(payload_bytes);
    let actual = hasher.finalize();
    if actual != expected {
        warn!(target: "mural_core::fingerprint", "fingerprint record checksum mismatch");
        return Err(CorruptReason::ChecksumMismatch { expected, actual }.into());
    }

    let payload: RecordPayload = bincode::deserialize(payload_bytes)
        .map_err(|err| CorruptReason::Envelope(err.to_string()))?;
    if payload.version != RECORD_VERSION {
        return Err(CorruptReason::UnsupportedVersion(payload.version).into());
    }

    let fingerprint = deserialize_with_layout(&payload.fingerprint, Some(payload.has_world_points))?;
    if fingerprint.len() != payload.keypoint_count as usize {
        return Err(CorruptReason::HeaderMismatch("record keypoint count").into());
    }
    Ok(fingerprint)
}
