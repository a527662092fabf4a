//! Deterministic on-disk layout: every disc owns one subtree under the
//! upload root, so deleting a disc is deleting its directory.

use crate::Result;
use log::warn;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn disc_dir(&self, disc_id: i64) -> PathBuf {
        self.root.join(disc_id.to_string())
    }

    pub fn original_path(&self, disc_id: i64, image_id: i64, ext: &str) -> PathBuf {
        self.disc_dir(disc_id).join(format!("original-{image_id}.{ext}"))
    }

    pub fn cropped_path(&self, disc_id: i64, image_id: i64, ext: &str) -> PathBuf {
        self.disc_dir(disc_id).join(format!("cropped-{image_id}.{ext}"))
    }

    pub fn ensure_disc_dir(&self, disc_id: i64) -> Result<()> {
        fs::create_dir_all(self.disc_dir(disc_id))?;
        Ok(())
    }

    /// Removes a disc's whole subtree. Missing directories are fine.
    pub fn remove_disc_dir(&self, disc_id: i64) -> Result<()> {
        let dir = self.disc_dir(disc_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort single-file removal used during rollback.
    pub fn remove_file_quietly(path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove {} during rollback: {e}", path.display());
            }
        }
    }
}
