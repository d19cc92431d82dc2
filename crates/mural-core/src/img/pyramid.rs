use image::GrayImage;
use image::imageops::{FilterType, resize};
use imageproc::filter::gaussian_blur_f32;
use log::{debug, trace};

/// One scale of an image pyramid.
///
/// `image` is the resampled luma used for corner detection and orientation;
/// `smoothed` is a blurred copy for binary intensity tests, which are
/// sensitive to pixel noise.
#[derive(Debug, Clone)]
pub struct PyramidLevel {
    pub octave: usize,
    /// Size of this level relative to the base image (`<= 1`).
    pub scale: f32,
    pub image: GrayImage,
    pub smoothed: GrayImage,
}

impl PyramidLevel {
    /// Maps a pixel-centre coordinate on this level to base image coordinates.
    pub fn to_base(&self, x: f32, y: f32) -> (f32, f32) {
        ((x + 0.5) / self.scale - 0.5, (y + 0.5) / self.scale - 0.5)
    }

    pub fn width(&self) -> usize {
        self.image.width() as usize
    }

    pub fn height(&self) -> usize {
        self.image.height() as usize
    }
}

#[derive(Debug, Clone)]
pub struct Pyramid {
    levels: Vec<PyramidLevel>,
}

impl Pyramid {
    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }
}

/// Builds a pyramid with a fractional scale step between levels.
///
/// Every level is resampled straight from the base image, so no blur
/// accumulates across levels. Building stops early once a level would be
/// smaller than `min_side` pixels.
pub fn build_pyramid(
    base: &GrayImage,
    levels: usize,
    scale_factor: f32,
    smoothing_sigma: f32,
    min_side: u32,
) -> Pyramid {
    let levels = levels.max(1);
    let scale_factor = if scale_factor.is_finite() && scale_factor > 1.0 {
        scale_factor
    } else {
        2.0
    };

    debug!(
        target: "mural_core::codec",
        "Building {}-level pyramid (factor {:.2}) from {}x{} image",
        levels,
        scale_factor,
        base.width(),
        base.height()
    );

    let mut out = Vec::with_capacity(levels);
    for octave in 0..levels {
        let scale = scale_factor.powi(-(octave as i32));
        let width = (base.width() as f32 * scale).round() as u32;
        let height = (base.height() as f32 * scale).round() as u32;
        if width < min_side.max(1) || height < min_side.max(1) {
            trace!(target: "mural_core::codec", "Stopping pyramid at level {octave} ({width}x{height})");
            break;
        }

        let image = if octave == 0 {
            base.clone()
        } else {
            resize(base, width, height, FilterType::Triangle)
        };
        let smoothed = if smoothing_sigma > 0.0 {
            gaussian_blur_f32(&image, smoothing_sigma)
        } else {
            image.clone()
        };

        out.push(PyramidLevel {
            octave,
            scale: width as f32 / base.width() as f32,
            image,
            smoothed,
        });
    }

    Pyramid { levels: out }
}
