use nalgebra::{Point3, Vector2};
use serde::{Deserialize, Serialize};

/// A 2D pixel coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImagePoint {
    pub u: f64,
    pub v: f64,
}

impl ImagePoint {
    pub fn new(u: f64, v: f64) -> Self {
        Self { u, v }
    }
}

/// Pinhole intrinsics of the camera that produced an image. Distortion is
/// assumed to be corrected upstream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub skew: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            skew: 0.0,
            width,
            height,
        }
    }

    pub fn with_skew(mut self, skew: f64) -> Self {
        self.skew = skew;
        self
    }

    /// Focal lengths must be finite and positive for any projection to be meaningful.
    pub fn is_valid(&self) -> bool {
        self.fx.is_finite()
            && self.fy.is_finite()
            && self.fx > 0.0
            && self.fy > 0.0
            && self.cx.is_finite()
            && self.cy.is_finite()
            && self.skew.is_finite()
    }

    pub fn mean_focal(&self) -> f64 {
        0.5 * (self.fx + self.fy)
    }

    /// Rescales the intrinsics to an image of a different resolution.
    pub fn scaled_to(&self, width: u32, height: u32) -> Self {
        if (width == self.width && height == self.height) || self.width == 0 || self.height == 0 {
            return *self;
        }
        let sx = width as f64 / self.width as f64;
        let sy = height as f64 / self.height as f64;
        Self {
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: self.cx * sx,
            cy: self.cy * sy,
            skew: self.skew * sx,
            width,
            height,
        }
    }

    /// Projects a camera-frame point. `None` when the point is on or behind the image plane.
    pub fn project_point(&self, point_cam: &Point3<f64>) -> Option<ImagePoint> {
        if point_cam.z <= 0.0 {
            return None;
        }
        let x = point_cam.x / point_cam.z;
        let y = point_cam.y / point_cam.z;
        Some(ImagePoint {
            u: self.fx * x + self.skew * y + self.cx,
            v: self.fy * y + self.cy,
        })
    }

    /// Pixel to normalized image coordinates on the z = 1 plane.
    pub fn normalize_pixel(&self, pixel: &ImagePoint) -> Vector2<f64> {
        let y_n = (pixel.v - self.cy) / self.fy;
        let x_n = (pixel.u - self.cx - self.skew * y_n) / self.fx;
        Vector2::new(x_n, y_n)
    }

    /// Back-projects a pixel with metric depth into camera coordinates.
    pub fn back_project(&self, pixel: &ImagePoint, depth: f64) -> Point3<f64> {
        let n = self.normalize_pixel(pixel);
        Point3::new(n.x * depth, n.y * depth, depth)
    }
}
