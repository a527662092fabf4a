//! Shared backend preprocessing: resize, center-crop, scale, normalize.

use image::{RgbImage, imageops};
use ndarray::{Array3, Array4, Axis};

/// Per-backend preprocessing constants.
#[derive(Debug, Clone, Copy)]
pub struct PreprocessSpec {
    /// Square input side length the model expects.
    pub side: u32,
    /// Per-channel mean, on the [0, 1] scale.
    pub mean: [f32; 3],
    /// Per-channel standard deviation, on the [0, 1] scale.
    pub std: [f32; 3],
}

/// Produces the NCHW input tensor for a backend.
///
/// The raster is resized so its shorter edge equals `side` (Lanczos),
/// center-cropped to `side` x `side`, scaled to [0, 1], and normalized
/// per channel.
pub fn to_input_tensor(raster: &RgbImage, spec: &PreprocessSpec) -> Array4<f32> {
    let side = spec.side;
    let (w, h) = raster.dimensions();
    let scale = side as f32 / w.min(h).max(1) as f32;
    let new_w = ((w as f32 * scale).round() as u32).max(side);
    let new_h = ((h as f32 * scale).round() as u32).max(side);
    let resized = imageops::resize(raster, new_w, new_h, imageops::FilterType::Lanczos3);
    let x0 = (new_w - side) / 2;
    let y0 = (new_h - side) / 2;
    let square = imageops::crop_imm(&resized, x0, y0, side, side).to_image();

    let mut array = Array3::<f32>::zeros((3, side as usize, side as usize));
    for (x, y, pixel) in square.enumerate_pixels() {
        for c in 0..3 {
            let v = pixel[c] as f32 / 255.0;
            array[[c, y as usize, x as usize]] = (v - spec.mean[c]) / spec.std[c];
        }
    }
    array.insert_axis(Axis(0))
}
