pub mod depth;
pub mod image_utils;
pub mod pyramid;

pub use depth::DepthMap;
pub use image_utils::bilinear_sample;
pub use pyramid::{Pyramid, PyramidLevel, build_pyramid};
