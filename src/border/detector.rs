//! Two-stage border detection: circle voting first, ellipse fit as the
//! fallback. A negative result is not an error; callers encode the full
//! image when nothing clears the floor.

use crate::border::shape::{Border, DetectorParams};
use crate::border::{circle, ellipse};
use image::{GrayImage, RgbImage, imageops};
use log::debug;

/// Integer BT.601 luminance, matching the weights JPEG decoders use.
fn luminance(raster: &RgbImage) -> GrayImage {
    let mut data = Vec::with_capacity((raster.width() * raster.height()) as usize);
    for pixel in raster.pixels() {
        let y = (77 * pixel[0] as u32 + 150 * pixel[1] as u32 + 29 * pixel[2] as u32) >> 8;
        data.push(y as u8);
    }
    GrayImage::from_raw(raster.width(), raster.height(), data).expect("luminance buffer size")
}

/// Locates the disc outline in a raster, best effort.
pub fn detect(raster: &RgbImage, params: &DetectorParams) -> Option<Border> {
    if raster.width() < 8 || raster.height() < 8 {
        return None;
    }
    let gray = luminance(raster);
    let blurred = imageops::blur(&gray, params.blur_sigma);

    if let Some(border) = circle::detect_circle(&blurred, params) {
        debug!("border: circle detected with confidence {:.3}", border.confidence());
        return Some(border);
    }
    match ellipse::detect_ellipse(&blurred, params) {
        Some(border) => {
            debug!("border: ellipse fallback with confidence {:.3}", border.confidence());
            Some(border)
        }
        None => {
            debug!("border: no detection above floor, using full image");
            None
        }
    }
}
