//! Host-facing surface of the relocalization core: fingerprint generation and
//! storage, one-shot relocalization, and long-lived [`RelocalizationSession`]s.

pub mod clock;
pub mod config;
pub mod logging;
pub mod session;

use std::sync::{Arc, OnceLock};

use image::GrayImage;
use mural_core::fingerprint::{self, decode_record, encode_record};
use mural_core::matcher::PROGRESS_GOOD_DISTANCE;
use tracing::debug;

pub use clock::{Clock, SystemClock};
pub use config::{ConfigError, EngineConfig, SessionConfig, SolveMode};
pub use logging::init_logging;
pub use mural_core::{
    CameraIntrinsics, DepthMap, Fingerprint, RelocalizationError, Relocalizer, RelocalizerConfig, Transform,
    TransformModel,
};
pub use session::{AttemptReport, DropReason, RelocalizationSession, RelocalizationState, Submission};

/// A configured relocalizer shared by every session it opens.
pub struct Engine {
    config: EngineConfig,
    relocalizer: Arc<Relocalizer>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            relocalizer: Arc::new(Relocalizer::new(config.relocalizer)),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn relocalizer(&self) -> &Relocalizer {
        &self.relocalizer
    }

    pub fn generate_fingerprint(
        &self,
        image: &GrayImage,
        mask: Option<&GrayImage>,
        depth: Option<&DepthMap>,
        intrinsics: Option<&CameraIntrinsics>,
    ) -> Fingerprint {
        self.relocalizer.generate_fingerprint(image, mask, depth, intrinsics)
    }

    pub fn relocalize(&self, frame: &GrayImage, fingerprint: &Fingerprint) -> Option<Transform> {
        log_failure(self.relocalizer.relocalize(frame, fingerprint))
    }

    pub fn relocalize_with_pose(
        &self,
        frame: &GrayImage,
        fingerprint: &Fingerprint,
        intrinsics: &CameraIntrinsics,
    ) -> Option<Transform> {
        log_failure(self.relocalizer.relocalize_with_pose(frame, fingerprint, intrinsics))
    }

    /// Opens a session for one project's fingerprint.
    pub fn open_session(&self, fingerprint: Arc<Fingerprint>) -> RelocalizationSession {
        RelocalizationSession::new(Arc::clone(&self.relocalizer), fingerprint, self.config.session)
    }

    pub fn open_session_with_clock<C: Clock>(
        &self,
        fingerprint: Arc<Fingerprint>,
        clock: C,
    ) -> RelocalizationSession<C> {
        RelocalizationSession::with_clock(Arc::clone(&self.relocalizer), fingerprint, self.config.session, clock)
    }
}

fn default_relocalizer() -> &'static Relocalizer {
    static RELOCALIZER: OnceLock<Relocalizer> = OnceLock::new();
    RELOCALIZER.get_or_init(Relocalizer::default)
}

fn log_failure(result: Result<Transform, RelocalizationError>) -> Option<Transform> {
    result
        .map_err(|err| debug!("relocalization produced no transform: {err}"))
        .ok()
}

pub fn generate_fingerprint(
    image: &GrayImage,
    mask: Option<&GrayImage>,
    depth: Option<&DepthMap>,
    intrinsics: Option<&CameraIntrinsics>,
) -> Fingerprint {
    default_relocalizer().generate_fingerprint(image, mask, depth, intrinsics)
}

/// Homography from the reference image into `frame`, or `None`.
pub fn relocalize(frame: &GrayImage, fingerprint: &Fingerprint) -> Option<Transform> {
    log_failure(default_relocalizer().relocalize(frame, fingerprint))
}

/// Camera pose of `frame` relative to the reference capture, or `None`.
pub fn relocalize_with_pose(
    frame: &GrayImage,
    fingerprint: &Fingerprint,
    intrinsics: &CameraIntrinsics,
) -> Option<Transform> {
    log_failure(default_relocalizer().relocalize_with_pose(frame, fingerprint, intrinsics))
}

pub fn serialize_fingerprint(fingerprint: &Fingerprint) -> Vec<u8> {
    fingerprint::serialize(fingerprint)
}

pub fn deserialize_fingerprint(bytes: &[u8]) -> Result<Fingerprint, RelocalizationError> {
    fingerprint::deserialize(bytes)
}

/// Checksummed record carrying the world-point flag alongside the raw layout.
pub fn encode_fingerprint_record(fingerprint: &Fingerprint) -> Result<Vec<u8>, RelocalizationError> {
    encode_record(fingerprint)
}

pub fn decode_fingerprint_record(bytes: &[u8]) -> Result<Fingerprint, RelocalizationError> {
    decode_record(bytes)
}

/// Fraction of stored keypoints that currently find a good match in `frame`.
pub fn match_progress(frame: &GrayImage, fingerprint: &Fingerprint) -> f32 {
    let live = default_relocalizer().extract(frame, None);
    mural_core::match_progress(&live, fingerprint, PROGRESS_GOOD_DISTANCE)
}
