//! Runtime configuration for the identification pipeline.

use crate::{MatchError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Which embedding backend the registry should instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    #[default]
    Clip,
    Dinov2,
}

/// DINOv2 model variant; selects the native embedding dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Dinov2Variant {
    Small,
    #[default]
    Base,
    Large,
}

impl Dinov2Variant {
    pub fn dimension(&self) -> usize {
        match self {
            Dinov2Variant::Small => 384,
            Dinov2Variant::Base => 768,
            Dinov2Variant::Large => 1024,
        }
    }
}

/// All knobs the matcher honors. Unknown encoder names, empty roots and
/// out-of-range floors are fatal at startup, not at request time.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Active embedding backend.
    pub encoder_type: EncoderKind,
    /// Base directory of the per-disc file layout.
    pub upload_root: PathBuf,
    /// SQLite database path (`:memory:` is accepted).
    pub store_url: String,
    /// Inputs larger than this many bytes are rejected before decoding.
    pub max_image_bytes: usize,
    /// Default number of discs returned by a search.
    pub default_top_k: usize,
    /// Default similarity floor; results below it are never returned.
    pub min_similarity: f32,
    /// Border detections below this confidence are discarded.
    pub border_confidence_floor: f32,
    /// When false the border detector and mask transform are skipped.
    pub border_enabled: bool,
    /// First-stage candidate factor: the store is asked for k * oversample
    /// rows before per-disc aggregation.
    pub oversample: usize,
    /// Below this many rows per encoder the store scans linearly instead of
    /// probing the approximate index.
    pub linear_scan_threshold: usize,
    /// Coarse cluster count of the approximate index.
    pub ivf_nlist: usize,
    /// Clusters probed per approximate query.
    pub ivf_nprobe: usize,
    /// Path to the CLIP image-tower ONNX model.
    pub clip_model_path: PathBuf,
    /// Path to the DINOv2 ONNX model.
    pub dinov2_model_path: PathBuf,
    /// DINOv2 variant the model file contains.
    pub dinov2_variant: Dinov2Variant,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            encoder_type: EncoderKind::Clip,
            upload_root: PathBuf::from("uploads"),
            store_url: "discs.sqlite".to_string(),
            max_image_bytes: 10 * 1024 * 1024,
            default_top_k: 5,
            min_similarity: 0.5,
            border_confidence_floor: 0.35,
            border_enabled: true,
            oversample: 3,
            linear_scan_threshold: 5_000,
            ivf_nlist: 64,
            ivf_nprobe: 8,
            clip_model_path: PathBuf::from("models/clip_vision.onnx"),
            dinov2_model_path: PathBuf::from("models/dinov2.onnx"),
            dinov2_variant: Dinov2Variant::Base,
        }
    }
}

impl Config {
    /// Loads a configuration from a JSON file. Missing fields fall back to
    /// their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&data)
            .map_err(|e| MatchError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation. The matcher refuses to serve on any failure here.
    pub fn validate(&self) -> Result<()> {
        if self.upload_root.as_os_str().is_empty() {
            return Err(MatchError::Config("upload_root must not be empty".into()));
        }
        if self.store_url.is_empty() {
            return Err(MatchError::Config("store_url must not be empty".into()));
        }
        if self.default_top_k == 0 {
            return Err(MatchError::Config("default_top_k must be at least 1".into()));
        }
        if self.oversample == 0 {
            return Err(MatchError::Config("oversample must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.min_similarity) {
            return Err(MatchError::Config("min_similarity must be in [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.border_confidence_floor) {
            return Err(MatchError::Config(
                "border_confidence_floor must be in [0, 1]".into(),
            ));
        }
        if self.ivf_nlist == 0 || self.ivf_nprobe == 0 {
            return Err(MatchError::Config("ivf_nlist and ivf_nprobe must be nonzero".into()));
        }
        Ok(())
    }
}
