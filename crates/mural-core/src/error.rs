use thiserror::Error;

/// Why a geometric solver declined to produce a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SolverFailureReason {
    #[error("too few correspondences ({found} < {required})")]
    TooFewCorrespondences { found: usize, required: usize },

    #[error("correspondences are degenerate (collinear, coincident or zero extent)")]
    DegenerateConfiguration,

    #[error("consensus too small ({inliers} inliers < {required})")]
    InlierFloorNotReached { inliers: usize, required: usize },

    #[error("estimate rejected by acceptance threshold")]
    AcceptanceThreshold,
}

/// Why a stored fingerprint could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorruptReason {
    #[error("truncated buffer (need {expected} bytes, got {actual})")]
    Truncated { expected: usize, actual: usize },

    #[error("inconsistent header: {0}")]
    HeaderMismatch(&'static str),

    #[error("unsupported descriptor element type {0}")]
    UnsupportedElementType(i32),

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("non-finite keypoint field at index {0}")]
    NonFiniteKeypoint(usize),

    #[error("record magic is missing")]
    BadMagic,

    #[error("unsupported record version {0}")]
    UnsupportedVersion(u16),

    #[error("checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("record envelope: {0}")]
    Envelope(String),

    #[error("world point count {points} does not match keypoint count {keypoints}")]
    WorldPointCount { points: usize, keypoints: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelocalizationError {
    #[error("input image is empty or malformed")]
    DegenerateInput,

    #[error("insufficient descriptor matches ({found} < {required})")]
    InsufficientMatches { found: usize, required: usize },

    #[error("geometric solver failed: {0}")]
    SolverFailure(#[from] SolverFailureReason),

    #[error("corrupt fingerprint: {0}")]
    CorruptFingerprint(#[from] CorruptReason),
}

pub type Result<T> = std::result::Result<T, RelocalizationError>;
