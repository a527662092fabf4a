//! Input validation and normalization: raw upload bytes in, oriented RGB
//! raster out.

use crate::{MatchError, Result};
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, RgbImage};
use log::debug;
use std::io::Cursor;

/// A decoded, metadata-corrected RGB raster plus the format it arrived in.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub raster: RgbImage,
    pub format: ImageFormat,
}

impl NormalizedImage {
    /// File extension used when persisting the original bytes.
    pub fn extension(&self) -> &'static str {
        match self.format {
            ImageFormat::Png => "png",
            _ => "jpg",
        }
    }
}

fn format_for_content_type(content_type: &str) -> Option<ImageFormat> {
    match content_type {
        "image/png" => Some(ImageFormat::Png),
        "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
        _ => None,
    }
}

/// Validates and decodes upload bytes into an RGB raster.
///
/// The orientation hint in embedded metadata is applied so the top of the
/// visible scene is row 0; all other metadata is discarded. Alpha, if
/// present, is composited over opaque white. Resolution is preserved.
pub fn normalize(bytes: &[u8], content_type: Option<&str>, max_bytes: usize) -> Result<NormalizedImage> {
    if bytes.len() > max_bytes {
        return Err(MatchError::Oversize { actual: bytes.len(), limit: max_bytes });
    }

    let format = image::guess_format(bytes)
        .map_err(|_| MatchError::UnsupportedFormat("unrecognized image data".into()))?;
    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
        return Err(MatchError::UnsupportedFormat(format!("{format:?}")));
    }
    if let Some(claimed) = content_type {
        match format_for_content_type(claimed) {
            Some(f) if f == format => {}
            Some(_) => {
                return Err(MatchError::UnsupportedFormat(format!(
                    "content type {claimed} does not match {format:?} data"
                )));
            }
            None => return Err(MatchError::UnsupportedFormat(claimed.to_string())),
        }
    }

    let reader = ImageReader::with_format(Cursor::new(bytes), format);
    let mut decoder = reader
        .into_decoder()
        .map_err(|e| MatchError::Undecodable(e.to_string()))?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut decoded =
        DynamicImage::from_decoder(decoder).map_err(|e| MatchError::Undecodable(e.to_string()))?;
    decoded.apply_orientation(orientation);

    let raster = flatten_to_rgb(decoded);
    debug!(
        "normalized {} bytes of {:?} into {}x{} raster",
        bytes.len(),
        format,
        raster.width(),
        raster.height()
    );
    Ok(NormalizedImage { raster, format })
}

/// Converts to RGB, compositing any alpha channel over opaque white.
fn flatten_to_rgb(decoded: DynamicImage) -> RgbImage {
    if !decoded.color().has_alpha() {
        return decoded.to_rgb8();
    }
    let rgba = decoded.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let a = pixel[3] as u16;
        let blend = |c: u8| -> u8 { ((c as u16 * a + 255 * (255 - a) + 127) / 255) as u8 };
        out.put_pixel(x, y, image::Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    out
}
