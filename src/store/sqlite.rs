//! The persistent vector store: two SQLite tables plus a per-encoder
//! in-memory similarity index.
//!
//! Embeddings are stored as fixed-width little-endian BLOBs and every row
//! records the encoder that produced it, so queries can never compare
//! vectors across encoders. Visibility is gated on the owning disc's
//! upload state inside the store itself.

use crate::border::Border;
use crate::store::blob;
use crate::store::index::{Hit, IndexEntry, IvfIndex, top_k_linear};
use crate::store::types::{Disc, DiscFilter, DiscImage, DiscStatus, NewDisc, UploadStatus};
use crate::{MatchError, Result};
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Store tuning; `dimension` is the single physical vector width every
/// row must have.
#[derive(Debug, Clone, Copy)]
pub struct StoreParams {
    pub dimension: usize,
    /// Below this many visible rows per encoder, queries scan linearly.
    pub linear_scan_threshold: usize,
    pub ivf_nlist: usize,
    pub ivf_nprobe: usize,
}

impl Default for StoreParams {
    fn default() -> Self {
        Self {
            dimension: crate::encoder::types::EMBEDDING_WIDTH,
            linear_scan_threshold: 5_000,
            ivf_nlist: 64,
            ivf_nprobe: 8,
        }
    }
}

pub struct VectorStore {
    conn: Mutex<Connection>,
    params: StoreParams,
    /// Per-encoder ANN index, tagged with the generation it was built at.
    indexes: Mutex<HashMap<String, (u64, IvfIndex)>>,
    /// Bumped on any mutation that can change query results.
    generation: AtomicU64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS discs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_name TEXT NOT NULL,
    owner_contact TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'registered',
    upload_status TEXT NOT NULL DEFAULT 'pending',
    model_name TEXT,
    color TEXT,
    notes TEXT,
    location TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS disc_images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    disc_id INTEGER NOT NULL REFERENCES discs(id) ON DELETE CASCADE,
    encoder TEXT NOT NULL,
    embedding BLOB NOT NULL,
    original_path TEXT NOT NULL,
    cropped_path TEXT,
    border TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_disc_images_encoder ON disc_images(encoder);
CREATE INDEX IF NOT EXISTS idx_disc_images_disc ON disc_images(disc_id);
";

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn json_err(e: serde_json::Error) -> MatchError {
    MatchError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl VectorStore {
    /// Opens (creating if needed) the store at `url`, a SQLite path or
    /// `:memory:`.
    pub fn open(url: &str, params: StoreParams) -> Result<Self> {
        let conn = Connection::open(url)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        info!("vector store opened at {url} (dimension {})", params.dimension);
        Ok(Self {
            conn: Mutex::new(conn),
            params,
            indexes: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn dimension(&self) -> usize {
        self.params.dimension
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn check_dimension(&self, len: usize) -> Result<()> {
        if len != self.params.dimension {
            return Err(MatchError::InvalidDimension {
                expected: self.params.dimension,
                actual: len,
            });
        }
        Ok(())
    }

    // ---- disc rows ----------------------------------------------------

    pub fn create_disc(&self, new: &NewDisc) -> Result<i64> {
        let now = Utc::now().timestamp();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO discs (owner_name, owner_contact, status, upload_status,
                                model_name, color, notes, location, created_at, updated_at)
             VALUES (?1, ?2, 'registered', 'pending', ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                new.owner_name,
                new.owner_contact,
                new.model_name,
                new.color,
                new.notes,
                new.location,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_disc(&self, disc_id: i64) -> Result<Disc> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, owner_name, owner_contact, status, upload_status,
                    model_name, color, notes, location, created_at, updated_at
             FROM discs WHERE id = ?1",
            [disc_id],
            row_to_disc,
        )
        .optional()?
        .ok_or(MatchError::UnknownDisc(disc_id))
    }

    pub fn list_discs(&self, filter: DiscFilter) -> Result<Vec<Disc>> {
        let upload = filter.upload_status.unwrap_or(UploadStatus::Success);
        let conn = self.lock();
        let mut out = Vec::new();
        match filter.status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT id, owner_name, owner_contact, status, upload_status,
                            model_name, color, notes, location, created_at, updated_at
                     FROM discs WHERE upload_status = ?1 AND status = ?2 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![upload.as_str(), status.as_str()], row_to_disc)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, owner_name, owner_contact, status, upload_status,
                            model_name, color, notes, location, created_at, updated_at
                     FROM discs WHERE upload_status = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![upload.as_str()], row_to_disc)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub fn update_disc_status(&self, disc_id: i64, status: DiscStatus) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE discs SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, disc_id],
        )?;
        if changed == 0 {
            return Err(MatchError::UnknownDisc(disc_id));
        }
        Ok(())
    }

    /// Transitions pending -> success. Idempotent when already confirmed.
    pub fn confirm_upload(&self, disc_id: i64) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE discs SET upload_status = 'success', updated_at = ?1 WHERE id = ?2",
            params![now, disc_id],
        )?;
        drop(conn);
        if changed == 0 {
            return Err(MatchError::UnknownDisc(disc_id));
        }
        self.bump();
        Ok(())
    }

    /// Deletes a disc; image rows follow via the cascade. Returns whether
    /// the disc existed.
    pub fn delete_disc(&self, disc_id: i64) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute("DELETE FROM discs WHERE id = ?1", [disc_id])?;
        drop(conn);
        self.bump();
        Ok(changed > 0)
    }

    // ---- image rows ---------------------------------------------------

    /// Inserts an image row and its files as one unit.
    ///
    /// The row is created inside a transaction, `write_files` runs with
    /// the allocated image id and returns the (original, cropped) paths it
    /// wrote, and only then does the row commit. A failure in
    /// `write_files` rolls the row back; a commit failure leaves the
    /// caller to remove the files it reported.
    pub fn insert_image<F>(
        &self,
        disc_id: i64,
        encoder: &str,
        embedding: &[f32],
        border: Option<&Border>,
        write_files: F,
    ) -> Result<i64>
    where
        F: FnOnce(i64) -> Result<(String, Option<String>)>,
    {
        self.check_dimension(embedding.len())?;
        let border_json = border.map(serde_json::to_string).transpose().map_err(json_err)?;
        let now = Utc::now().timestamp();

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let exists: bool = tx
            .query_row("SELECT 1 FROM discs WHERE id = ?1", [disc_id], |_| Ok(true))
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(MatchError::UnknownDisc(disc_id));
        }
        tx.execute(
            "INSERT INTO disc_images (disc_id, encoder, embedding, original_path,
                                      cropped_path, border, created_at)
             VALUES (?1, ?2, ?3, '', NULL, ?4, ?5)",
            params![disc_id, encoder, blob::encode(embedding), border_json, now],
        )?;
        let image_id = tx.last_insert_rowid();

        let (original_path, cropped_path) = write_files(image_id)?;
        tx.execute(
            "UPDATE disc_images SET original_path = ?1, cropped_path = ?2 WHERE id = ?3",
            params![original_path, cropped_path, image_id],
        )?;
        tx.commit()?;
        drop(conn);
        self.bump();
        debug!("image {image_id} inserted for disc {disc_id} under encoder '{encoder}'");
        Ok(image_id)
    }

    pub fn get_image(&self, image_id: i64) -> Result<DiscImage> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, disc_id, encoder, original_path, cropped_path, border, created_at
             FROM disc_images WHERE id = ?1",
            [image_id],
            row_to_image,
        )
        .optional()?
        .ok_or(MatchError::UnknownImage(image_id))
    }

    pub fn images_for_disc(&self, disc_id: i64) -> Result<Vec<DiscImage>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, disc_id, encoder, original_path, cropped_path, border, created_at
             FROM disc_images WHERE disc_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([disc_id], row_to_image)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Rewrites an image row's border, embedding, and cropped path in one
    /// statement; used when a border is corrected after the fact.
    pub fn update_image_border(
        &self,
        image_id: i64,
        border: Option<&Border>,
        embedding: &[f32],
        cropped_path: Option<&str>,
    ) -> Result<()> {
        self.check_dimension(embedding.len())?;
        let border_json = border.map(serde_json::to_string).transpose().map_err(json_err)?;
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE disc_images SET border = ?1, embedding = ?2, cropped_path = ?3 WHERE id = ?4",
            params![border_json, blob::encode(embedding), cropped_path, image_id],
        )?;
        drop(conn);
        if changed == 0 {
            return Err(MatchError::UnknownImage(image_id));
        }
        self.bump();
        Ok(())
    }

    pub fn count_images(&self, encoder: &str) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM disc_images WHERE encoder = ?1",
            [encoder],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ---- retrieval ----------------------------------------------------

    fn load_visible(&self, encoder: &str) -> Result<Vec<IndexEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT di.id, di.disc_id, di.embedding
             FROM disc_images di JOIN discs d ON d.id = di.disc_id
             WHERE di.encoder = ?1 AND d.upload_status = 'success'
             ORDER BY di.id",
        )?;
        let rows = stmt.query_map([encoder], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, Vec<u8>>(2)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (image_id, disc_id, bytes) = row?;
            out.push(IndexEntry {
                image_id,
                disc_id,
                embedding: blob::decode(&bytes, self.params.dimension)?,
            });
        }
        Ok(out)
    }

    /// Top-k image rows under one encoder by cosine similarity, gated on
    /// upload state, floored at `min_similarity`, ties broken by lower
    /// image id.
    pub fn top_k(
        &self,
        query: &[f32],
        encoder: &str,
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<Hit>> {
        self.check_dimension(query.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let visible = self.load_visible(encoder)?;
        if visible.len() < self.params.linear_scan_threshold {
            return Ok(top_k_linear(&visible, query, k, min_similarity));
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let mut indexes = self.indexes.lock().unwrap_or_else(|e| e.into_inner());
        let entry = indexes.entry(encoder.to_string());
        let (_, index) = match entry {
            std::collections::hash_map::Entry::Occupied(mut o) => {
                if o.get().0 != generation {
                    debug!("rebuilding stale IVF index for encoder '{encoder}'");
                    o.insert((
                        generation,
                        IvfIndex::build(visible, self.params.ivf_nlist, self.params.dimension),
                    ));
                }
                o.into_mut()
            }
            std::collections::hash_map::Entry::Vacant(v) => v.insert((
                generation,
                IvfIndex::build(visible, self.params.ivf_nlist, self.params.dimension),
            )),
        };
        Ok(index.search(query, k, min_similarity, self.params.ivf_nprobe))
    }

    /// Drops and rebuilds the cached index for one encoder.
    pub fn reindex(&self, encoder: &str) -> Result<()> {
        let visible = self.load_visible(encoder)?;
        let generation = self.generation.load(Ordering::SeqCst);
        let index = IvfIndex::build(visible, self.params.ivf_nlist, self.params.dimension);
        let mut indexes = self.indexes.lock().unwrap_or_else(|e| e.into_inner());
        indexes.insert(encoder.to_string(), (generation, index));
        Ok(())
    }
}

fn row_to_disc(row: &rusqlite::Row<'_>) -> rusqlite::Result<Disc> {
    let status_str: String = row.get(3)?;
    let upload_str: String = row.get(4)?;
    Ok(Disc {
        id: row.get(0)?,
        owner_name: row.get(1)?,
        owner_contact: row.get(2)?,
        status: DiscStatus::from_str(&status_str).unwrap_or(DiscStatus::Registered),
        upload_status: UploadStatus::from_str(&upload_str).unwrap_or(UploadStatus::Pending),
        model_name: row.get(5)?,
        color: row.get(6)?,
        notes: row.get(7)?,
        location: row.get(8)?,
        created_at: timestamp(row.get(9)?),
        updated_at: timestamp(row.get(10)?),
    })
}

fn row_to_image(row: &rusqlite::Row<'_>) -> rusqlite::Result<DiscImage> {
    let border_json: Option<String> = row.get(5)?;
    let border = border_json.and_then(|json| serde_json::from_str::<Border>(&json).ok());
    Ok(DiscImage {
        id: row.get(0)?,
        disc_id: row.get(1)?,
        encoder: row.get(2)?,
        original_path: row.get(3)?,
        cropped_path: row.get(4)?,
        border,
        created_at: timestamp(row.get(6)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> VectorStore {
        let params = StoreParams { dimension: 4, ..StoreParams::default() };
        VectorStore::open(":memory:", params).unwrap()
    }

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut v {
            *x /= norm;
        }
        v
    }

    fn insert(store: &VectorStore, disc_id: i64, encoder: &str, v: Vec<f32>) -> i64 {
        store
            .insert_image(disc_id, encoder, &unit(v), None, |image_id| {
                Ok((format!("{disc_id}/original-{image_id}.png"), None))
            })
            .unwrap()
    }

    #[test]
    fn disc_crud_round_trip() {
        let store = memory_store();
        let id = store
            .create_disc(&NewDisc::new("Robin", "robin@example.com").with_color("orange"))
            .unwrap();
        let disc = store.get_disc(id).unwrap();
        assert_eq!(disc.owner_name, "Robin");
        assert_eq!(disc.status, DiscStatus::Registered);
        assert_eq!(disc.upload_status, UploadStatus::Pending);

        store.update_disc_status(id, DiscStatus::Stolen).unwrap();
        assert_eq!(store.get_disc(id).unwrap().status, DiscStatus::Stolen);

        assert!(matches!(store.get_disc(999), Err(MatchError::UnknownDisc(999))));
    }

    #[test]
    fn confirm_is_idempotent_and_gates_search() {
        let store = memory_store();
        let id = store.create_disc(&NewDisc::new("A", "a@x")).unwrap();
        insert(&store, id, "clip", vec![1.0, 0.0, 0.0, 0.0]);

        // Pending discs are invisible.
        let hits = store.top_k(&unit(vec![1.0, 0.0, 0.0, 0.0]), "clip", 5, 0.0).unwrap();
        assert!(hits.is_empty());

        store.confirm_upload(id).unwrap();
        store.confirm_upload(id).unwrap();
        let hits = store.top_k(&unit(vec![1.0, 0.0, 0.0, 0.0]), "clip", 5, 0.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].disc_id, id);
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);

        assert!(matches!(store.confirm_upload(999), Err(MatchError::UnknownDisc(999))));
    }

    #[test]
    fn encoder_partitions_never_mix() {
        let store = memory_store();
        let id = store.create_disc(&NewDisc::new("A", "a@x")).unwrap();
        insert(&store, id, "clip", vec![1.0, 0.0, 0.0, 0.0]);
        store.confirm_upload(id).unwrap();

        let hits = store.top_k(&unit(vec![1.0, 0.0, 0.0, 0.0]), "dinov2", 5, 0.0).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn cascade_delete_removes_image_rows() {
        let store = memory_store();
        let id = store.create_disc(&NewDisc::new("A", "a@x")).unwrap();
        let image_id = insert(&store, id, "clip", vec![0.0, 1.0, 0.0, 0.0]);
        store.confirm_upload(id).unwrap();

        assert!(store.delete_disc(id).unwrap());
        assert!(!store.delete_disc(id).unwrap());
        assert!(matches!(store.get_image(image_id), Err(MatchError::UnknownImage(_))));
        assert_eq!(store.count_images("clip").unwrap(), 0);
    }

    #[test]
    fn insert_rejects_bad_dimension_and_unknown_disc() {
        let store = memory_store();
        let id = store.create_disc(&NewDisc::new("A", "a@x")).unwrap();
        let err = store
            .insert_image(id, "clip", &[1.0, 0.0], None, |_| Ok((String::new(), None)))
            .unwrap_err();
        assert!(matches!(err, MatchError::InvalidDimension { .. }));

        let err = store
            .insert_image(999, "clip", &unit(vec![1.0, 0.0, 0.0, 0.0]), None, |_| {
                Ok((String::new(), None))
            })
            .unwrap_err();
        assert!(matches!(err, MatchError::UnknownDisc(999)));
    }

    #[test]
    fn failed_file_write_rolls_back_row() {
        let store = memory_store();
        let id = store.create_disc(&NewDisc::new("A", "a@x")).unwrap();
        let err = store
            .insert_image(id, "clip", &unit(vec![1.0, 1.0, 0.0, 0.0]), None, |_| {
                Err(MatchError::Io(std::io::Error::other("disk full")))
            })
            .unwrap_err();
        assert!(matches!(err, MatchError::Io(_)));
        assert_eq!(store.count_images("clip").unwrap(), 0);
    }

    #[test]
    fn border_column_round_trips() {
        let store = memory_store();
        let id = store.create_disc(&NewDisc::new("A", "a@x")).unwrap();
        let border = Border::Circle { cx: 10.0, cy: 12.0, radius: 7.5, confidence: 0.8 };
        let image_id = store
            .insert_image(id, "clip", &unit(vec![1.0, 0.0, 1.0, 0.0]), Some(&border), |iid| {
                Ok((format!("{id}/original-{iid}.png"), Some(format!("{id}/cropped-{iid}.png"))))
            })
            .unwrap();
        let image = store.get_image(image_id).unwrap();
        assert_eq!(image.border, Some(border));
        assert!(image.cropped_path.is_some());
        assert_eq!(image.encoder, "clip");
    }

    #[test]
    fn update_border_rewrites_row() {
        let store = memory_store();
        let id = store.create_disc(&NewDisc::new("A", "a@x")).unwrap();
        let image_id = insert(&store, id, "clip", vec![1.0, 0.0, 0.0, 0.0]);
        store.confirm_upload(id).unwrap();

        let border = Border::Circle { cx: 5.0, cy: 5.0, radius: 4.0, confidence: 0.9 };
        store
            .update_image_border(
                image_id,
                Some(&border),
                &unit(vec![0.0, 0.0, 1.0, 0.0]),
                Some("1/cropped-1.png"),
            )
            .unwrap();
        let image = store.get_image(image_id).unwrap();
        assert_eq!(image.border, Some(border));

        let hits = store.top_k(&unit(vec![0.0, 0.0, 1.0, 0.0]), "clip", 1, 0.5).unwrap();
        assert_eq!(hits[0].image_id, image_id);

        assert!(matches!(
            store.update_image_border(999, None, &unit(vec![1.0, 0.0, 0.0, 0.0]), None),
            Err(MatchError::UnknownImage(999))
        ));
    }

    #[test]
    fn ann_path_engages_above_threshold() {
        let params = StoreParams { dimension: 4, linear_scan_threshold: 10, ivf_nlist: 4, ivf_nprobe: 4 };
        let store = VectorStore::open(":memory:", params).unwrap();
        let mut target_image = 0;
        for i in 0..24i64 {
            let id = store.create_disc(&NewDisc::new("A", "a@x")).unwrap();
            let angle = i as f32 * 0.26;
            let image_id = insert(&store, id, "clip", vec![angle.cos(), angle.sin(), 0.3, 0.1]);
            store.confirm_upload(id).unwrap();
            if i == 11 {
                target_image = image_id;
            }
        }
        let target = store.get_image(target_image).unwrap();
        let angle = 11f32 * 0.26;
        let query = unit(vec![angle.cos(), angle.sin(), 0.3, 0.1]);
        let hits = store.top_k(&query, "clip", 3, 0.0).unwrap();
        assert_eq!(hits[0].image_id, target.id);
        assert!((hits[0].similarity - 1.0).abs() < 1e-4);
    }
}
