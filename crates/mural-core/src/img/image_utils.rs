use image::GrayImage;

/// Bilinear luma lookup with edge clamping.
pub fn bilinear_sample(img: &GrayImage, x: f32, y: f32) -> f32 {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }
    let x = x.clamp(0.0, (w - 1) as f32);
    let y = y.clamp(0.0, (h - 1) as f32);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let dx = x - x0 as f32;
    let dy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0).0[0] as f32;
    let p10 = img.get_pixel(x1, y0).0[0] as f32;
    let p01 = img.get_pixel(x0, y1).0[0] as f32;
    let p11 = img.get_pixel(x1, y1).0[0] as f32;

    let top = p00 + dx * (p10 - p00);
    let bot = p01 + dx * (p11 - p01);
    top + dy * (bot - top)
}

/// Whether a mask allows features at base-image position `(x, y)`.
/// Non-zero mask pixels mark allowed regions.
pub fn mask_allows(mask: &GrayImage, x: f32, y: f32) -> bool {
    let (w, h) = mask.dimensions();
    if w == 0 || h == 0 || !x.is_finite() || !y.is_finite() {
        return false;
    }
    let px = (x.round().max(0.0) as u32).min(w - 1);
    let py = (y.round().max(0.0) as u32).min(h - 1);
    mask.get_pixel(px, py).0[0] != 0
}
