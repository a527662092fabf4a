//! CLIP image-tower backend.

use crate::encoder::onnx::OnnxSession;
use crate::encoder::preprocess::{PreprocessSpec, to_input_tensor};
use crate::encoder::types::{Embedding, ImageEncoder};
use crate::Result;
use image::RgbImage;
use std::path::Path;

pub const CLIP_ENCODER_NAME: &str = "clip";
const CLIP_DIMENSION: usize = 512;

/// CLIP's published preprocessing constants (ViT-B family).
const CLIP_SPEC: PreprocessSpec = PreprocessSpec {
    side: 224,
    mean: [0.48145466, 0.4578275, 0.40821073],
    std: [0.26862954, 0.26130258, 0.27577711],
};

/// The image tower of a CLIP-family vision-language model in ONNX form.
/// Only the image side is loaded; text inputs are not supported.
pub struct ClipEncoder {
    session: OnnxSession,
}

impl ClipEncoder {
    pub fn load(model_path: &Path) -> Result<Self> {
        Ok(Self { session: OnnxSession::load(model_path, "pixel_values")? })
    }
}

impl ImageEncoder for ClipEncoder {
    fn name(&self) -> &str {
        CLIP_ENCODER_NAME
    }

    fn dimension(&self) -> usize {
        CLIP_DIMENSION
    }

    fn embed(&self, raster: &RgbImage) -> Result<Embedding> {
        let tensor = to_input_tensor(raster, &CLIP_SPEC);
        let raw = self.session.run(tensor, CLIP_DIMENSION)?;
        Ok(Embedding::from_raw(raw))
    }
}
