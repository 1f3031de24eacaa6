//! Filesystem layer management.
//!
//! Every image is composed of ordered layers. A layer is a tar archive,
//! content-addressed by its SHA-256 hash. Packing is deterministic: entries
//! are sorted by name and carry zeroed timestamps and ownership, so the same
//! tree always yields a bit-identical archive.

use std::io::Write;
use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};
use berth_common::types::Sha256Hash;
use serde::{Deserialize, Serialize};

/// Role of a layer inside an image, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    /// Base runtime filesystem.
    Base,
    /// Resolved dependencies.
    Dependencies,
    /// Application source tree.
    Source,
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base => write!(f, "base"),
            Self::Dependencies => write!(f, "deps"),
            Self::Source => write!(f, "source"),
        }
    }
}

/// A single filesystem layer archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    /// Content-addressed hash of the archive.
    pub hash: Sha256Hash,
    /// Size of the archive in bytes.
    pub size_bytes: u64,
}

/// Extracts a tar archive to the target directory.
///
/// Supports both plain `.tar` and gzip-compressed `.tar.gz` / `.tgz` archives.
///
/// # Errors
///
/// Returns an error if extraction or hash computation fails.
pub fn extract_layer(archive_path: &Path, target: &Path) -> Result<Layer> {
    tracing::debug!(
        archive = %archive_path.display(),
        target = %target.display(),
        "extracting layer"
    );

    std::fs::create_dir_all(target).map_err(|e| BerthError::io(target, e))?;

    let file = std::fs::File::open(archive_path).map_err(|e| BerthError::io(archive_path, e))?;
    let size_bytes = file
        .metadata()
        .map_err(|e| BerthError::io(archive_path, e))?
        .len();

    if is_gzip_archive(archive_path) {
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        archive.unpack(target).map_err(|e| BerthError::io(target, e))?;
    } else {
        let mut archive = tar::Archive::new(file);
        archive.unpack(target).map_err(|e| BerthError::io(target, e))?;
    }

    let hash = crate::hash::hash_file(archive_path)?;
    tracing::debug!(hash = %hash, size = size_bytes, "layer extracted");

    Ok(Layer { hash, size_bytes })
}

/// Packs a directory tree into a deterministic tar archive.
///
/// `include` receives each path relative to `src` and whether it is a
/// directory; returning `false` skips the entry (and everything below a
/// skipped directory).
///
/// # Errors
///
/// Returns an error if the tree cannot be walked or the archive written.
pub fn pack_dir<F>(src: &Path, archive_path: &Path, include: F) -> Result<Layer>
where
    F: Fn(&Path, bool) -> bool,
{
    tracing::debug!(
        src = %src.display(),
        archive = %archive_path.display(),
        "packing layer"
    );

    let file = std::fs::File::create(archive_path).map_err(|e| BerthError::io(archive_path, e))?;
    let mut builder = tar::Builder::new(std::io::BufWriter::new(file));
    builder.follow_symlinks(false);

    append_tree(&mut builder, src, Path::new(""), &include)?;

    let mut writer = builder
        .into_inner()
        .map_err(|e| BerthError::io(archive_path, e))?;
    writer.flush().map_err(|e| BerthError::io(archive_path, e))?;
    drop(writer);

    let size_bytes = std::fs::metadata(archive_path)
        .map_err(|e| BerthError::io(archive_path, e))?
        .len();
    let hash = crate::hash::hash_file(archive_path)?;
    tracing::debug!(hash = %hash, size = size_bytes, "layer packed");
    Ok(Layer { hash, size_bytes })
}

fn append_tree<W, F>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    rel: &Path,
    include: &F,
) -> Result<()>
where
    W: Write,
    F: Fn(&Path, bool) -> bool,
{
    let dir = root.join(rel);
    let mut entries = std::fs::read_dir(&dir)
        .map_err(|e| BerthError::io(&dir, e))?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| BerthError::io(&dir, e))?;
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let path = entry.path();
        let rel_path: PathBuf = rel.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| BerthError::io(&path, e))?;
        if !include(&rel_path, file_type.is_dir()) {
            continue;
        }

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        if file_type.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder
                .append_data(&mut header, &rel_path, std::io::empty())
                .map_err(|e| BerthError::io(&path, e))?;
            append_tree(builder, root, &rel_path, include)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(&path).map_err(|e| BerthError::io(&path, e))?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            builder
                .append_link(&mut header, &rel_path, &target)
                .map_err(|e| BerthError::io(&path, e))?;
        } else if file_type.is_file() {
            let metadata = entry.metadata().map_err(|e| BerthError::io(&path, e))?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(normalized_mode(&metadata));
            header.set_size(metadata.len());
            let file = std::fs::File::open(&path).map_err(|e| BerthError::io(&path, e))?;
            builder
                .append_data(&mut header, &rel_path, file)
                .map_err(|e| BerthError::io(&path, e))?;
        } else {
            tracing::debug!(path = %path.display(), "skipping special file");
        }
    }
    Ok(())
}

#[cfg(unix)]
fn normalized_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    if metadata.permissions().mode() & 0o111 == 0 {
        0o644
    } else {
        0o755
    }
}

#[cfg(not(unix))]
const fn normalized_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

/// Determines whether the archive is gzip-compressed based on extension.
fn is_gzip_archive(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("tgz"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_tar(dir: &Path) -> PathBuf {
        let tar_path = dir.join("test.tar");
        let file = std::fs::File::create(&tar_path).expect("failed to create tar file");
        let mut builder = tar::Builder::new(file);
        let data = b"hello from layer";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "hello.txt", &data[..])
            .expect("failed to append data");
        builder.finish().expect("failed to finish tar");
        tar_path
    }

    fn create_test_tar_gz(dir: &Path) -> PathBuf {
        let tar_gz_path = dir.join("test.tar.gz");
        let file = std::fs::File::create(&tar_gz_path).expect("failed to create tar.gz");
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let data = b"hello from gzipped layer";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "gzhello.txt", &data[..])
            .expect("failed to append data");
        let encoder = builder.into_inner().expect("failed to finish encoder");
        let _ = encoder.finish().expect("failed to finish gzip");
        tar_gz_path
    }

    fn sample_tree(root: &Path) {
        std::fs::create_dir_all(root.join("pkg/sub")).expect("mkdir");
        std::fs::write(root.join("pkg/__init__.py"), "").expect("write");
        std::fs::write(root.join("pkg/sub/mod.py"), "X = 1\n").expect("write");
        std::fs::write(root.join("app.py"), "def create_app():\n    pass\n").expect("write");
    }

    #[test]
    fn extract_plain_tar_creates_expected_files() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let tar_path = create_test_tar(dir.path());
        let target = dir.path().join("extracted");

        let layer = extract_layer(&tar_path, &target).expect("extract failed");
        assert!(target.join("hello.txt").exists());
        assert!(layer.size_bytes > 0);

        let content = std::fs::read_to_string(target.join("hello.txt")).expect("read failed");
        assert_eq!(content, "hello from layer");
    }

    #[test]
    fn extract_gzip_tar_creates_expected_files() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let tar_gz_path = create_test_tar_gz(dir.path());
        let target = dir.path().join("extracted_gz");

        let layer = extract_layer(&tar_gz_path, &target).expect("extract failed");
        assert!(target.join("gzhello.txt").exists());
        assert!(layer.size_bytes > 0);
    }

    #[test]
    fn extract_nonexistent_archive_returns_error() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let result = extract_layer(&dir.path().join("missing.tar"), &dir.path().join("out"));
        assert!(result.is_err());
    }

    #[test]
    fn pack_same_tree_twice_is_bit_identical() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tree = dir.path().join("tree");
        sample_tree(&tree);

        let a = pack_dir(&tree, &dir.path().join("a.tar"), |_, _| true).expect("pack a");
        // Touch a file so its mtime changes; content stays the same.
        std::fs::write(tree.join("app.py"), "def create_app():\n    pass\n").expect("rewrite");
        let b = pack_dir(&tree, &dir.path().join("b.tar"), |_, _| true).expect("pack b");

        assert_eq!(a, b);
        let bytes_a = std::fs::read(dir.path().join("a.tar")).expect("read a");
        let bytes_b = std::fs::read(dir.path().join("b.tar")).expect("read b");
        assert_eq!(bytes_a, bytes_b);
    }

    #[test]
    fn pack_content_change_changes_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tree = dir.path().join("tree");
        sample_tree(&tree);

        let a = pack_dir(&tree, &dir.path().join("a.tar"), |_, _| true).expect("pack a");
        std::fs::write(tree.join("pkg/sub/mod.py"), "X = 2\n").expect("rewrite");
        let b = pack_dir(&tree, &dir.path().join("b.tar"), |_, _| true).expect("pack b");
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn pack_filter_skips_directories_and_their_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tree = dir.path().join("tree");
        sample_tree(&tree);

        let archive = dir.path().join("filtered.tar");
        let _ = pack_dir(&tree, &archive, |rel, _| !rel.starts_with("pkg")).expect("pack");

        let out = dir.path().join("out");
        let _ = extract_layer(&archive, &out).expect("extract");
        assert!(out.join("app.py").exists());
        assert!(!out.join("pkg").exists());
    }

    #[test]
    fn pack_then_extract_preserves_nested_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tree = dir.path().join("tree");
        sample_tree(&tree);

        let archive = dir.path().join("layer.tar");
        let _ = pack_dir(&tree, &archive, |_, _| true).expect("pack");
        let out = dir.path().join("out");
        let _ = extract_layer(&archive, &out).expect("extract");
        let content = std::fs::read_to_string(out.join("pkg/sub/mod.py")).expect("read");
        assert_eq!(content, "X = 1\n");
    }

    #[test]
    fn is_gzip_archive_detects_extensions() {
        assert!(is_gzip_archive(Path::new("layer.tar.gz")));
        assert!(is_gzip_archive(Path::new("layer.tgz")));
        assert!(!is_gzip_archive(Path::new("layer.tar")));
        assert!(!is_gzip_archive(Path::new("layer.zip")));
    }
}
