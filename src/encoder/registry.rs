//! Single-active-encoder selection, lazily constructed and cached.

use crate::config::{Config, EncoderKind};
use crate::encoder::clip::ClipEncoder;
use crate::encoder::dinov2::Dinov2Encoder;
use crate::encoder::types::ImageEncoder;
use crate::Result;
use log::info;
use std::sync::{Arc, OnceLock};

/// Constructs the configured backend on first use and caches it for the
/// registry's lifetime. Model loading takes seconds; everything after the
/// first call is a cheap clone of the cached handle.
///
/// Tests bypass model loading entirely by building the registry around a
/// fake encoder with [`EncoderRegistry::with_encoder`] before first use.
pub struct EncoderRegistry {
    kind: EncoderKind,
    config: Config,
    active: OnceLock<Arc<dyn ImageEncoder>>,
}

impl EncoderRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            kind: config.encoder_type,
            config: config.clone(),
            active: OnceLock::new(),
        }
    }

    /// A registry pre-seeded with an already-built encoder. The configured
    /// backend kind is ignored; `active()` always returns this instance.
    pub fn with_encoder(encoder: Arc<dyn ImageEncoder>) -> Self {
        let active = OnceLock::new();
        let _ = active.set(encoder);
        Self { kind: EncoderKind::Clip, config: Config::default(), active }
    }

    /// Returns the active encoder, constructing it on the first call.
    pub fn active(&self) -> Result<Arc<dyn ImageEncoder>> {
        if let Some(encoder) = self.active.get() {
            return Ok(encoder.clone());
        }
        let built: Arc<dyn ImageEncoder> = match self.kind {
            EncoderKind::Clip => Arc::new(ClipEncoder::load(&self.config.clip_model_path)?),
            EncoderKind::Dinov2 => Arc::new(Dinov2Encoder::load(
                &self.config.dinov2_model_path,
                self.config.dinov2_variant,
            )?),
        };
        info!("encoder '{}' constructed (dimension {})", built.name(), built.dimension());
        // A concurrent caller may have won the race; keep whichever landed.
        let _ = self.active.set(built);
        Ok(self.active.get().expect("encoder cache was just filled").clone())
    }
}
