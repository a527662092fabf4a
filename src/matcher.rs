//! The identification pipeline orchestrator.
//!
//! One `Matcher` serves every request handler concurrently: it holds the
//! active encoder (via the registry), the vector store, and the file
//! layout, and carries no per-request state.

use crate::border::{Border, DetectorParams, detector};
use crate::config::Config;
use crate::encoder::registry::EncoderRegistry;
use crate::encoder::types::{Embedding, ImageEncoder};
use crate::image::mask;
use crate::image::normalize::{self, NormalizedImage};
use crate::storage::StorageLayout;
use crate::store::sqlite::{StoreParams, VectorStore};
use crate::store::types::{Disc, DiscFilter, DiscImage, DiscStatus, NewDisc, UploadStatus};
use crate::{MatchError, Result};
use image::RgbImage;
use log::{debug, info, warn};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A per-operation time ceiling, checked between pipeline stages.
/// Inference itself is not preempted; the deadline is re-checked around it.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Deadline(None)
    }

    pub fn within(budget: Duration) -> Self {
        Deadline(Some(Instant::now() + budget))
    }

    pub fn at(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    pub fn check(&self) -> Result<()> {
        match self.0 {
            Some(limit) if Instant::now() > limit => Err(MatchError::Timeout),
            _ => Ok(()),
        }
    }
}

/// One ranked search result: a disc, its best-matching image, and the
/// similarity that image achieved.
#[derive(Debug, Clone)]
pub struct Match {
    pub disc_id: i64,
    pub similarity: f32,
    pub representative_image_id: i64,
    pub encoder: String,
    pub disc: Disc,
}

struct PipelineOutput {
    normalized: NormalizedImage,
    border: Option<Border>,
    encoder_input: RgbImage,
    embedding: Embedding,
    encoder: Arc<dyn ImageEncoder>,
}

pub struct Matcher {
    config: Config,
    registry: EncoderRegistry,
    store: Arc<VectorStore>,
    layout: StorageLayout,
    detector_params: DetectorParams,
}

impl Matcher {
    /// Builds a matcher from configuration. Configuration problems are
    /// fatal here; nothing is lazily mis-served later.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let registry = EncoderRegistry::new(&config);
        Self::assemble(config, registry)
    }

    /// Builds a matcher around an injected encoder registry; tests use
    /// this to avoid model artifacts.
    pub fn with_registry(config: Config, registry: EncoderRegistry) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, registry)
    }

    fn assemble(config: Config, registry: EncoderRegistry) -> Result<Self> {
        let store = VectorStore::open(
            &config.store_url,
            StoreParams {
                dimension: crate::encoder::types::EMBEDDING_WIDTH,
                linear_scan_threshold: config.linear_scan_threshold,
                ivf_nlist: config.ivf_nlist,
                ivf_nprobe: config.ivf_nprobe,
            },
        )?;
        let layout = StorageLayout::new(&config.upload_root);
        let detector_params = DetectorParams {
            confidence_floor: config.border_confidence_floor,
            ..DetectorParams::default()
        };
        Ok(Self { config, registry, store: Arc::new(store), layout, detector_params })
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Constructs the active encoder eagerly and runs one tiny probe so
    /// the first real request does not pay model-load latency.
    pub fn warm_up(&self) -> Result<()> {
        let encoder = self.registry.active()?;
        let probe = RgbImage::from_pixel(8, 8, image::Rgb([255, 255, 255]));
        let _ = encoder.embed(&probe)?;
        info!("encoder '{}' warmed up", encoder.name());
        Ok(())
    }

    // ---- registration lifecycle --------------------------------------

    /// Registers a photograph. Without `attach_to` a new disc row is
    /// created in pending state; with it the image is attached to the
    /// existing disc. Returns (disc_id, image_id).
    ///
    /// On any failure every file written is removed and a disc row this
    /// call created is deleted again.
    pub fn register(
        &self,
        bytes: &[u8],
        content_type: Option<&str>,
        metadata: &NewDisc,
        attach_to: Option<i64>,
        deadline: &Deadline,
    ) -> Result<(i64, i64)> {
        let pipeline = self.run_pipeline(bytes, content_type, deadline)?;
        let padded = pipeline.embedding.padded(self.store.dimension())?;

        let (disc_id, created) = match attach_to {
            Some(id) => {
                self.store.get_disc(id)?;
                (id, false)
            }
            None => (self.store.create_disc(metadata)?, true),
        };

        deadline.check().inspect_err(|_| self.rollback_disc(disc_id, created, &[]))?;

        let ext = pipeline.normalized.extension();
        let written: RefCell<Vec<PathBuf>> = RefCell::new(Vec::new());
        let result = self.store.insert_image(
            disc_id,
            pipeline.encoder.name(),
            &padded,
            pipeline.border.as_ref(),
            |image_id| {
                self.layout.ensure_disc_dir(disc_id)?;
                let original = self.layout.original_path(disc_id, image_id, ext);
                std::fs::write(&original, bytes)?;
                written.borrow_mut().push(original.clone());

                let cropped = if pipeline.border.is_some() {
                    let path = self.layout.cropped_path(disc_id, image_id, ext);
                    save_raster(&pipeline.encoder_input, &path)?;
                    written.borrow_mut().push(path.clone());
                    Some(path.to_string_lossy().into_owned())
                } else {
                    None
                };
                Ok((original.to_string_lossy().into_owned(), cropped))
            },
        );

        match result {
            Ok(image_id) => {
                info!(
                    "registered image {image_id} for disc {disc_id} under '{}'{}",
                    pipeline.encoder.name(),
                    if created { " (new disc)" } else { "" }
                );
                Ok((disc_id, image_id))
            }
            Err(e) => {
                self.rollback_disc(disc_id, created, &written.into_inner());
                Err(e)
            }
        }
    }

    /// Attaches another photograph to an existing disc.
    pub fn add_image_to_disc(
        &self,
        disc_id: i64,
        bytes: &[u8],
        content_type: Option<&str>,
        deadline: &Deadline,
    ) -> Result<i64> {
        self.register(bytes, content_type, &NewDisc::default(), Some(disc_id), deadline)
            .map(|(_, image_id)| image_id)
    }

    fn rollback_disc(&self, disc_id: i64, created: bool, written: &[PathBuf]) {
        warn!("rolling back registration for disc {disc_id}");
        for path in written {
            StorageLayout::remove_file_quietly(path);
        }
        if created {
            if let Err(e) = self.store.delete_disc(disc_id) {
                warn!("rollback could not delete disc {disc_id}: {e}");
            }
            if let Err(e) = self.layout.remove_disc_dir(disc_id) {
                warn!("rollback could not remove directory of disc {disc_id}: {e}");
            }
        }
    }

    /// Marks a pending disc's upload complete, making it searchable.
    /// Idempotent when already confirmed.
    pub fn confirm(&self, disc_id: i64, deadline: &Deadline) -> Result<()> {
        deadline.check()?;
        retry_store(|| self.store.confirm_upload(disc_id))
    }

    /// Abandons a pending upload: the disc row, its image rows, and its
    /// subtree all go away. A no-op for identities that no longer exist.
    pub fn cancel(&self, disc_id: i64, deadline: &Deadline) -> Result<()> {
        deadline.check()?;
        let disc = match self.store.get_disc(disc_id) {
            Ok(disc) => disc,
            Err(MatchError::UnknownDisc(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if disc.upload_status == UploadStatus::Success {
            return Err(MatchError::InvalidTransition(format!(
                "disc {disc_id} is already confirmed; cancel only applies while pending"
            )));
        }
        self.store.delete_disc(disc_id)?;
        self.layout.remove_disc_dir(disc_id)?;
        info!("cancelled pending disc {disc_id}");
        Ok(())
    }

    // ---- search -------------------------------------------------------

    /// Ranks registered discs by visual similarity to the query image.
    ///
    /// The store is asked for an oversampled candidate set under the
    /// active encoder; candidates are then optionally status-filtered,
    /// grouped per disc keeping each disc's best image, and the top `k`
    /// groups are returned in descending similarity order (ties to the
    /// lower disc id).
    pub fn find_matches(
        &self,
        bytes: &[u8],
        content_type: Option<&str>,
        k: Option<usize>,
        min_similarity: Option<f32>,
        status_filter: Option<DiscStatus>,
        deadline: &Deadline,
    ) -> Result<Vec<Match>> {
        let pipeline = self.run_pipeline(bytes, content_type, deadline)?;
        let padded = pipeline.embedding.padded(self.store.dimension())?;

        let k = k.unwrap_or(self.config.default_top_k).max(1);
        let min_similarity = min_similarity.unwrap_or(self.config.min_similarity);
        let candidates = k * self.config.oversample;

        deadline.check()?;
        let hits = retry_store(|| {
            self.store.top_k(&padded, pipeline.encoder.name(), candidates, min_similarity)
        })?;
        debug!("search: {} candidate rows before aggregation", hits.len());

        // Fetch each candidate disc once; apply the status filter.
        let mut discs: HashMap<i64, Disc> = HashMap::new();
        for hit in &hits {
            if let std::collections::hash_map::Entry::Vacant(entry) = discs.entry(hit.disc_id) {
                entry.insert(self.store.get_disc(hit.disc_id)?);
            }
        }

        // Group by disc. Hits arrive ordered by similarity descending with
        // ties on the lower image id, so the first hit seen for a disc is
        // its best image.
        let mut matches: Vec<Match> = Vec::new();
        let mut seen: HashSet<i64> = HashSet::new();
        for hit in hits {
            let disc = &discs[&hit.disc_id];
            if let Some(wanted) = status_filter {
                if disc.status != wanted {
                    continue;
                }
            }
            if !seen.insert(hit.disc_id) {
                continue;
            }
            matches.push(Match {
                disc_id: hit.disc_id,
                similarity: hit.similarity,
                representative_image_id: hit.image_id,
                encoder: pipeline.encoder.name().to_string(),
                disc: disc.clone(),
            });
        }

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.disc_id.cmp(&b.disc_id))
        });
        matches.truncate(k);
        deadline.check()?;
        Ok(matches)
    }

    // ---- service surface ---------------------------------------------

    pub fn get_disc(&self, disc_id: i64) -> Result<Disc> {
        self.store.get_disc(disc_id)
    }

    pub fn get_image(&self, image_id: i64) -> Result<DiscImage> {
        self.store.get_image(image_id)
    }

    pub fn list_discs(&self, filter: DiscFilter) -> Result<Vec<Disc>> {
        self.store.list_discs(filter)
    }

    pub fn update_status(&self, disc_id: i64, status: DiscStatus) -> Result<()> {
        self.store.update_disc_status(disc_id, status)
    }

    /// Deletes a disc regardless of lifecycle state, with its rows and
    /// its on-disk subtree.
    pub fn delete_disc(&self, disc_id: i64, deadline: &Deadline) -> Result<()> {
        deadline.check()?;
        if !self.store.delete_disc(disc_id)? {
            return Err(MatchError::UnknownDisc(disc_id));
        }
        self.layout.remove_disc_dir(disc_id)?;
        Ok(())
    }

    /// Replaces an image's border record, regenerating the cropped
    /// artifact and the embedding from the stored original so the row
    /// stays reproducible. Requires the active encoder to be the one the
    /// row was embedded under.
    pub fn update_border(
        &self,
        image_id: i64,
        border: Option<Border>,
        deadline: &Deadline,
    ) -> Result<()> {
        deadline.check()?;
        let image = self.store.get_image(image_id)?;
        let encoder = self.registry.active()?;
        if encoder.name() != image.encoder {
            return Err(MatchError::EncoderMismatch {
                recorded: image.encoder,
                active: encoder.name().to_string(),
            });
        }

        let bytes = std::fs::read(&image.original_path)?;
        let normalized = normalize::normalize(&bytes, None, self.config.max_image_bytes)?;
        let encoder_input = mask::apply_border(&normalized.raster, border.as_ref());
        deadline.check()?;
        let embedding = embed_with_retry(encoder.as_ref(), &encoder_input)?;
        if embedding.is_degenerate() {
            return Err(MatchError::DegenerateEmbedding);
        }
        let padded = embedding.padded(self.store.dimension())?;

        let new_cropped = if border.is_some() {
            let path =
                self.layout.cropped_path(image.disc_id, image_id, normalized.extension());
            save_raster(&encoder_input, &path)?;
            Some(path.to_string_lossy().into_owned())
        } else {
            None
        };
        self.store.update_image_border(image_id, border.as_ref(), &padded, new_cropped.as_deref())?;

        // A cleared border leaves no cropped artifact behind.
        if new_cropped.is_none() {
            if let Some(old) = image.cropped_path {
                StorageLayout::remove_file_quietly(std::path::Path::new(&old));
            }
        }
        Ok(())
    }

    // ---- pipeline -----------------------------------------------------

    fn run_pipeline(
        &self,
        bytes: &[u8],
        content_type: Option<&str>,
        deadline: &Deadline,
    ) -> Result<PipelineOutput> {
        deadline.check()?;
        let normalized = normalize::normalize(bytes, content_type, self.config.max_image_bytes)?;
        deadline.check()?;

        let border = if self.config.border_enabled {
            detector::detect(&normalized.raster, &self.detector_params)
        } else {
            None
        };
        let encoder_input = mask::apply_border(&normalized.raster, border.as_ref());
        deadline.check()?;

        let encoder = self.registry.active()?;
        let embedding = embed_with_retry(encoder.as_ref(), &encoder_input)?;
        if embedding.is_degenerate() {
            return Err(MatchError::DegenerateEmbedding);
        }
        deadline.check()?;

        Ok(PipelineOutput { normalized, border, encoder_input, embedding, encoder })
    }
}

/// One automatic retry for a failed inference; the second failure
/// surfaces.
fn embed_with_retry(encoder: &dyn ImageEncoder, raster: &RgbImage) -> Result<Embedding> {
    match encoder.embed(raster) {
        Ok(embedding) => Ok(embedding),
        Err(e) if e.is_transient() => {
            warn!("encoder '{}' failed once, retrying: {e}", encoder.name());
            encoder.embed(raster)
        }
        Err(e) => Err(e),
    }
}

/// One automatic retry for a busy/locked store.
fn retry_store<T>(op: impl Fn() -> Result<T>) -> Result<T> {
    match op() {
        Err(e) if e.is_transient() => {
            warn!("store operation failed once, retrying: {e}");
            op()
        }
        result => result,
    }
}

fn save_raster(raster: &RgbImage, path: &std::path::Path) -> Result<()> {
    raster
        .save(path)
        .map_err(|e| MatchError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
}
