use log::debug;

/// Readings at or above this many millimetres are treated as invalid.
pub const MAX_VALID_DEPTH_MM: u16 = 5000;

/// Dense 16-bit depth image in millimetres. Zero means "no reading".
///
/// Depth sensors usually run at a lower resolution than the colour camera,
/// so lookups take coordinates in the colour image's pixel space and rescale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthMap {
    width: u32,
    height: u32,
    millimetres: Vec<u16>,
}

impl DepthMap {
    pub fn new(width: u32, height: u32, millimetres: Vec<u16>) -> Option<Self> {
        if width == 0 || height == 0 || millimetres.len() != width as usize * height as usize {
            debug!(
                target: "mural_core::fingerprint",
                "rejecting depth map: {}x{} with {} samples",
                width,
                height,
                millimetres.len()
            );
            return None;
        }
        Some(Self {
            width,
            height,
            millimetres,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw reading at depth pixel `(x, y)`, `None` outside the map.
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.millimetres.get(y as usize * self.width as usize + x as usize).copied()
    }

    /// Samples the depth under image pixel `(u, v)` of an `image_width`×`image_height`
    /// image. Returns metres when the reading lies in `(0, MAX_VALID_DEPTH_MM)`.
    pub fn depth_at(&self, u: f32, v: f32, image_width: u32, image_height: u32) -> Option<f32> {
        if image_width == 0 || image_height == 0 || !u.is_finite() || !v.is_finite() {
            return None;
        }
        let dx = (u * self.width as f32 / image_width as f32) as i64;
        let dy = (v * self.height as f32 / image_height as f32) as i64;
        let dx = dx.clamp(0, self.width as i64 - 1) as u32;
        let dy = dy.clamp(0, self.height as i64 - 1) as u32;
        let mm = self.get(dx, dy)?;
        (mm > 0 && mm < MAX_VALID_DEPTH_MM).then(|| mm as f32 * 0.001)
    }
}
