//! Border-driven crop and background suppression.

use crate::border::Border;
use image::{Rgb, RgbImage, imageops};

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// Applies a detected border to a raster before encoding.
///
/// The raster is cropped to the border's bounding box and every pixel
/// outside the border shape is replaced with opaque white, so the encoder
/// sees the disc itself over the same white padding it would synthesize
/// anyway. Without a border the input is returned unchanged.
pub fn apply_border(raster: &RgbImage, border: Option<&Border>) -> RgbImage {
    let Some(border) = border else {
        return raster.clone();
    };
    let (x0, y0, w, h) = border.bounding_box(raster.width(), raster.height());
    let mut cropped = imageops::crop_imm(raster, x0, y0, w, h).to_image();
    for (x, y, pixel) in cropped.enumerate_pixels_mut() {
        // `contains` works in original-image coordinates.
        if !border.contains((x0 + x) as f32, (y0 + y) as f32) {
            *pixel = WHITE;
        }
    }
    cropped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkered(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 { Rgb([40, 40, 40]) } else { Rgb([200, 200, 200]) }
        })
    }

    #[test]
    fn no_border_is_identity() {
        let img = checkered(16, 16);
        assert_eq!(apply_border(&img, None), img);
    }

    #[test]
    fn crops_to_circle_bbox_and_whitens_corners() {
        let img = checkered(100, 100);
        let border = Border::Circle { cx: 50.0, cy: 50.0, radius: 20.0, confidence: 1.0 };
        let out = apply_border(&img, Some(&border));
        let (w, h) = out.dimensions();
        assert!(w >= 40 && w <= 42, "width {w}");
        assert!(h >= 40 && h <= 42, "height {h}");
        // Corners of the bbox are outside the circle.
        assert_eq!(out.get_pixel(0, 0), &WHITE);
        assert_eq!(out.get_pixel(w - 1, h - 1), &WHITE);
        // The center pixel keeps its original value.
        let center = out.get_pixel(w / 2, h / 2);
        assert_ne!(center, &WHITE);
    }

    #[test]
    fn masked_raster_keeps_interior_values() {
        let img = checkered(60, 60);
        let border = Border::Circle { cx: 30.0, cy: 30.0, radius: 15.0, confidence: 1.0 };
        let out = apply_border(&img, Some(&border));
        let (x0, y0, _, _) = border.bounding_box(60, 60);
        // A pixel well inside the circle maps back to its source pixel.
        let inside = out.get_pixel(30 - x0, 30 - y0);
        assert_eq!(inside, img.get_pixel(30, 30));
    }
}
