pub mod codec;
pub mod error;
pub mod fingerprint;
pub mod img;
pub mod matcher;
pub mod math;
pub mod relocalize;
pub mod runtime;

pub use codec::{Descriptor, Feature, FeatureCodec, FeatureSet, Keypoint, OrbCodec, OrbConfig};
pub use error::{CorruptReason, RelocalizationError, SolverFailureReason};
pub use fingerprint::{Fingerprint, FingerprintEntry};
pub use img::DepthMap;
pub use matcher::{HammingMatcher, MatcherConfig, match_progress};
pub use math::CameraIntrinsics;
pub use relocalize::{Relocalizer, RelocalizerConfig, Transform, TransformModel};
