//! Run-time materialization of an image's root filesystem.
//!
//! Layers are extracted bottom to top into `rootfs/<image-id>/`. The tree is
//! staged and renamed into place with a completion marker, so a present
//! marker means the rootfs is complete and can be shared read-only.

use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};

use crate::layer::extract_layer;
use crate::registry::Image;
use crate::storage::StorageBackend;

const COMPLETE_MARKER: &str = ".berth-complete";

/// Returns where the image's rootfs lives.
#[must_use]
pub fn rootfs_path(storage: &StorageBackend, image: &Image) -> PathBuf {
    storage.rootfs_root().join(image.id.as_str())
}

/// Returns whether the rootfs at `path` was fully materialized.
#[must_use]
pub fn is_complete(path: &Path) -> bool {
    path.join(COMPLETE_MARKER).is_file()
}

/// Materializes the image, reusing a complete rootfs.
///
/// # Errors
///
/// Returns an error if a layer is missing, fails verification or cannot be
/// extracted.
pub fn materialize(storage: &StorageBackend, image: &Image) -> Result<PathBuf> {
    let dest = rootfs_path(storage, image);
    if is_complete(&dest) {
        tracing::debug!(image = %image.id.short(), "reusing materialized rootfs");
        return Ok(dest);
    }

    tracing::info!(image = %image.id.short(), "materializing rootfs");
    let staging = storage.staging("rootfs-")?;
    let tree = staging.path().join("tree");
    std::fs::create_dir_all(&tree).map_err(|e| BerthError::io(&tree, e))?;

    for layer in &image.config.layers {
        let archive = storage.layer_path(&layer.digest);
        if !archive.is_file() {
            return Err(BerthError::NotFound {
                kind: "layer",
                id: layer.digest.to_string(),
            });
        }
        let extracted = extract_layer(&archive, &tree.join(&layer.target))?;
        if extracted.hash != layer.digest {
            return Err(BerthError::HashMismatch {
                resource: archive.display().to_string(),
                expected: layer.digest.as_hex().to_string(),
                actual: extracted.hash.as_hex().to_string(),
            });
        }
        tracing::debug!(kind = %layer.kind, digest = %layer.digest.short(), "layer applied");
    }

    let marker = tree.join(COMPLETE_MARKER);
    std::fs::write(&marker, image.id.as_str()).map_err(|e| BerthError::io(&marker, e))?;

    if dest.exists() {
        std::fs::remove_dir_all(&dest).map_err(|e| BerthError::io(&dest, e))?;
    }
    if let Err(e) = std::fs::rename(&tree, &dest) {
        // Another run may have completed the same image first.
        if is_complete(&dest) {
            return Ok(dest);
        }
        return Err(BerthError::io(&dest, e));
    }
    Ok(dest)
}

/// Deletes the materialized rootfs of an image, if present.
///
/// # Errors
///
/// Returns an error if the directory cannot be removed.
pub fn remove(storage: &StorageBackend, image: &Image) -> Result<()> {
    let path = rootfs_path(storage, image);
    if path.exists() {
        std::fs::remove_dir_all(&path).map_err(|e| BerthError::io(&path, e))?;
        tracing::debug!(image = %image.id.short(), "rootfs removed");
    }
    Ok(())
}
