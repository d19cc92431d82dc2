pub mod projection;
pub mod se3;
pub mod utils;

pub use projection::{CameraIntrinsics, ImagePoint};
pub use se3::{TransformSE3, Twist};
