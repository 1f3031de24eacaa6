//! Local storage backend for layers, caches and rootfs trees.
//!
//! On-disk layout under the data directory:
//!
//! ```text
//! layers/<sha256>.tar      content-addressed layer archives
//! cache/deps/<key>/        dependency layer cache entries
//! images/catalog.json      image catalog
//! rootfs/<image-id>/       materialized root filesystems
//! tmp/                     staging area (same filesystem, for atomic renames)
//! ```

use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};
use berth_common::types::Sha256Hash;

use crate::layer::Layer;

/// Manages local storage of layers and derived trees.
#[derive(Debug, Clone)]
pub struct StorageBackend {
    /// Root directory for all stored data.
    root: PathBuf,
}

impl StorageBackend {
    /// Opens or initializes the storage backend at the given root.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tracing::debug!(path = %root.display(), "opening storage backend");
        let storage = Self { root };
        for dir in [
            storage.layers_dir(),
            storage.deps_cache_dir(),
            storage.rootfs_root(),
            storage.tmp_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| BerthError::io(&dir, e))?;
        }
        Ok(storage)
    }

    /// Returns the root storage path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory holding layer archives.
    #[must_use]
    pub fn layers_dir(&self) -> PathBuf {
        self.root.join("layers")
    }

    /// Returns the path to a layer archive given its hash.
    #[must_use]
    pub fn layer_path(&self, hash: &Sha256Hash) -> PathBuf {
        self.layers_dir().join(format!("{}.tar", hash.as_hex()))
    }

    /// Checks whether a layer exists in the local store.
    #[must_use]
    pub fn has_layer(&self, hash: &Sha256Hash) -> bool {
        self.layer_path(hash).exists()
    }

    /// Returns the dependency cache directory.
    #[must_use]
    pub fn deps_cache_dir(&self) -> PathBuf {
        self.root.join("cache").join("deps")
    }

    /// Returns the directory under which images are materialized.
    #[must_use]
    pub fn rootfs_root(&self) -> PathBuf {
        self.root.join("rootfs")
    }

    /// Returns the staging directory.
    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Creates a fresh staging directory, removed when dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn staging(&self, prefix: &str) -> Result<tempfile::TempDir> {
        let tmp = self.tmp_dir();
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&tmp)
            .map_err(|e| BerthError::io(&tmp, e))
    }

    /// Moves a packed archive into the content-addressed layer store.
    ///
    /// If a layer with the same hash is already stored the archive is
    /// discarded, since the bytes are identical.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be moved.
    pub fn commit_layer(&self, archive: &Path, layer: &Layer) -> Result<PathBuf> {
        let dest = self.layer_path(&layer.hash);
        if dest.exists() {
            tracing::debug!(hash = %layer.hash, "layer already stored");
            let _ = std::fs::remove_file(archive);
            return Ok(dest);
        }
        std::fs::rename(archive, &dest).map_err(|e| BerthError::io(&dest, e))?;
        tracing::debug!(hash = %layer.hash, "layer stored");
        Ok(dest)
    }

    /// Copies an archive into the layer store, leaving the original in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be copied.
    pub fn import_layer(&self, archive: &Path, layer: &Layer) -> Result<PathBuf> {
        let dest = self.layer_path(&layer.hash);
        if dest.exists() {
            return Ok(dest);
        }
        let tmp = self.tmp_dir();
        let staged = tempfile::NamedTempFile::new_in(&tmp).map_err(|e| BerthError::io(&tmp, e))?;
        let _ = std::fs::copy(archive, staged.path()).map_err(|e| BerthError::io(archive, e))?;
        let _ = staged
            .persist(&dest)
            .map_err(|e| BerthError::io(&dest, e.error))?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(s: &str) -> Sha256Hash {
        crate::hash::hash_bytes(s.as_bytes())
    }

    #[test]
    fn storage_open_creates_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageBackend::open(dir.path()).expect("open");
        assert_eq!(storage.root(), dir.path());
        assert!(storage.layers_dir().is_dir());
        assert!(storage.deps_cache_dir().is_dir());
        assert!(storage.tmp_dir().is_dir());
    }

    #[test]
    fn storage_layer_path_includes_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageBackend::open(dir.path()).expect("open");
        let hash = hash_of("abc");
        let path = storage.layer_path(&hash);
        assert!(path.ends_with(format!("layers/{}.tar", hash.as_hex())));
    }

    #[test]
    fn storage_has_layer_false_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageBackend::open(dir.path()).expect("open");
        assert!(!storage.has_layer(&hash_of("nonexistent")));
    }

    #[test]
    fn commit_layer_moves_archive_and_dedupes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageBackend::open(dir.path()).expect("open");
        let layer = Layer {
            hash: hash_of("payload"),
            size_bytes: 7,
        };

        let first = dir.path().join("first.tar");
        std::fs::write(&first, "payload").expect("write");
        let stored = storage.commit_layer(&first, &layer).expect("commit");
        assert!(stored.exists());
        assert!(!first.exists());

        let second = dir.path().join("second.tar");
        std::fs::write(&second, "payload").expect("write");
        let again = storage.commit_layer(&second, &layer).expect("commit again");
        assert_eq!(stored, again);
        assert!(!second.exists());
    }

    #[test]
    fn staging_dirs_live_under_tmp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageBackend::open(dir.path()).expect("open");
        let staging = storage.staging("build-").expect("staging");
        assert!(staging.path().starts_with(storage.tmp_dir()));
    }
}
