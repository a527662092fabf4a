//! DINOv2 self-supervised backend.

use crate::config::Dinov2Variant;
use crate::encoder::onnx::OnnxSession;
use crate::encoder::preprocess::{PreprocessSpec, to_input_tensor};
use crate::encoder::types::{Embedding, ImageEncoder};
use crate::Result;
use image::RgbImage;
use std::path::Path;

pub const DINOV2_ENCODER_NAME: &str = "dinov2";

/// ImageNet constants, which DINOv2 trains against.
const DINOV2_SPEC: PreprocessSpec = PreprocessSpec {
    side: 224,
    mean: [0.485, 0.456, 0.406],
    std: [0.229, 0.224, 0.225],
};

/// A DINOv2 vision transformer in ONNX form. The export is expected to
/// emit the pooled class-token feature as its first output; the variant
/// fixes its dimension (384 / 768 / 1024).
pub struct Dinov2Encoder {
    session: OnnxSession,
    dimension: usize,
}

impl Dinov2Encoder {
    pub fn load(model_path: &Path, variant: Dinov2Variant) -> Result<Self> {
        Ok(Self {
            session: OnnxSession::load(model_path, "pixel_values")?,
            dimension: variant.dimension(),
        })
    }
}

impl ImageEncoder for Dinov2Encoder {
    fn name(&self) -> &str {
        DINOV2_ENCODER_NAME
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, raster: &RgbImage) -> Result<Embedding> {
        let tensor = to_input_tensor(raster, &DINOV2_SPEC);
        let raw = self.session.run(tensor, self.dimension)?;
        Ok(Embedding::from_raw(raw))
    }
}
