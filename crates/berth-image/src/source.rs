//! Image source protocol handlers.
//!
//! Supports `file://` (local directory), `tar://` (archive), bare paths and
//! remote `https://` archives pinned with a `#sha256=<hex>` fragment.

use std::path::{Path, PathBuf};

use berth_common::constants::IGNORE_FILE;
use berth_common::error::{BerthError, Result};
use berth_common::types::Sha256Hash;
use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::layer::{Layer, extract_layer, pack_dir};
use crate::storage::StorageBackend;

/// Paths never copied into a source layer.
const DEFAULT_EXCLUDES: [&str; 5] = [".git/", "__pycache__/", "*.pyc", ".env", ".berth/"];

/// Supported image source protocols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Local directory (`file:///path/to/tree` or a bare directory path).
    Directory(PathBuf),
    /// Local archive (`tar:///path/to/tree.tar[.gz]` or a bare file path).
    Archive(PathBuf),
    /// Remote archive, verified before use.
    Remote {
        /// URL of the archive.
        url: String,
        /// Expected SHA-256 hash of the downloaded bytes.
        sha256: Sha256Hash,
    },
}

/// Resolves a source URI into an `ImageSource`.
///
/// # Errors
///
/// Returns an error if the scheme is unsupported, a local path does not exist,
/// or a remote URI has no `#sha256=` pin.
pub fn resolve_source(uri: &str) -> Result<ImageSource> {
    if let Some(path_str) = uri.strip_prefix("file://") {
        let path = PathBuf::from(path_str);
        if !path.is_dir() {
            return Err(BerthError::NotFound {
                kind: "source directory",
                id: path_str.to_string(),
            });
        }
        tracing::debug!(path = %path.display(), "resolved file:// source");
        Ok(ImageSource::Directory(path))
    } else if let Some(path_str) = uri.strip_prefix("tar://") {
        let path = PathBuf::from(path_str);
        if !path.is_file() {
            return Err(BerthError::NotFound {
                kind: "tar archive",
                id: path_str.to_string(),
            });
        }
        tracing::debug!(path = %path.display(), "resolved tar:// source");
        Ok(ImageSource::Archive(path))
    } else if uri.starts_with("https://") || uri.starts_with("http://") {
        let (url, fragment) = uri.split_once('#').ok_or_else(|| BerthError::Config {
            message: format!("remote source must be pinned with #sha256=<hex>: {uri}"),
        })?;
        let hex = fragment
            .strip_prefix("sha256=")
            .ok_or_else(|| BerthError::Config {
                message: format!("unsupported source fragment `{fragment}`"),
            })?;
        tracing::debug!(url, "resolved remote source");
        Ok(ImageSource::Remote {
            url: url.to_string(),
            sha256: Sha256Hash::from_hex(hex)?,
        })
    } else if uri.contains("://") {
        Err(BerthError::Config {
            message: format!("unsupported image source URI scheme: {uri}"),
        })
    } else {
        let path = PathBuf::from(uri);
        if path.is_dir() {
            Ok(ImageSource::Directory(path))
        } else if path.is_file() {
            Ok(ImageSource::Archive(path))
        } else {
            Err(BerthError::NotFound {
                kind: "source path",
                id: uri.to_string(),
            })
        }
    }
}

/// Which paths to leave out when packing a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreRules {
    /// Pack everything.
    None,
    /// Default excludes plus the tree's `.berthignore`.
    Source,
}

/// A readable directory tree for an image source.
///
/// Archives and remote sources are unpacked into a staging directory that
/// lives as long as this value.
#[derive(Debug)]
pub struct SourceTree {
    root: PathBuf,
    _staging: Option<tempfile::TempDir>,
}

impl SourceTree {
    /// Makes the source available as a directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read, downloaded, verified or
    /// extracted.
    pub fn open(source: &ImageSource, storage: &StorageBackend) -> Result<Self> {
        match source {
            ImageSource::Directory(path) => {
                let _ = std::fs::read_dir(path).map_err(|e| BerthError::io(path, e))?;
                Ok(Self {
                    root: path.clone(),
                    _staging: None,
                })
            }
            ImageSource::Archive(path) => {
                let staging = storage.staging("src-")?;
                let root = staging.path().join("tree");
                let _ = extract_layer(path, &root)?;
                Ok(Self {
                    root,
                    _staging: Some(staging),
                })
            }
            ImageSource::Remote { url, sha256 } => {
                let staging = storage.staging("remote-")?;
                let archive = download(url, sha256, staging.path())?;
                let root = staging.path().join("tree");
                let _ = extract_layer(&archive, &root)?;
                Ok(Self {
                    root,
                    _staging: Some(staging),
                })
            }
        }
    }

    /// Returns the tree root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Packs the tree deterministically and stores it as a layer.
    ///
    /// # Errors
    ///
    /// Returns an error if ignore rules are invalid or packing fails.
    pub fn pack(&self, storage: &StorageBackend, rules: IgnoreRules) -> Result<Layer> {
        let matcher = match rules {
            IgnoreRules::None => None,
            IgnoreRules::Source => Some(source_ignores(&self.root)?),
        };
        let staging = storage.staging("pack-")?;
        let archive = staging.path().join("layer.tar");
        let layer = pack_dir(&self.root, &archive, |rel, is_dir| {
            matcher
                .as_ref()
                .is_none_or(|m| !m.matched(rel, is_dir).is_ignore())
        })?;
        let _ = storage.commit_layer(&archive, &layer)?;
        Ok(layer)
    }
}

/// Builds the ignore matcher for a source tree.
///
/// # Errors
///
/// Returns an error if `.berthignore` cannot be parsed.
pub fn source_ignores(root: &Path) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in DEFAULT_EXCLUDES {
        let _ = builder
            .add_line(None, pattern)
            .map_err(|e| BerthError::Config {
                message: format!("invalid exclude pattern `{pattern}`: {e}"),
            })?;
    }
    let ignore_file = root.join(IGNORE_FILE);
    if ignore_file.is_file() {
        if let Some(e) = builder.add(&ignore_file) {
            return Err(BerthError::Config {
                message: format!("invalid {}: {e}", ignore_file.display()),
            });
        }
    }
    builder.build().map_err(|e| BerthError::Config {
        message: format!("invalid ignore rules: {e}"),
    })
}

fn download(url: &str, expected: &Sha256Hash, dir: &Path) -> Result<PathBuf> {
    tracing::info!(url, "downloading remote source");
    let fetch_err = |e: reqwest::Error| BerthError::Config {
        message: format!("GET {url}: {e}"),
    };
    let response = reqwest::blocking::get(url).map_err(fetch_err)?;
    if !response.status().is_success() {
        return Err(BerthError::Config {
            message: format!("GET {url}: HTTP {}", response.status()),
        });
    }
    let bytes = response.bytes().map_err(fetch_err)?;
    let name = if url.ends_with(".gz") || url.ends_with(".tgz") {
        "source.tar.gz"
    } else {
        "source.tar"
    };
    let path = dir.join(name);
    std::fs::write(&path, &bytes).map_err(|e| BerthError::io(&path, e))?;
    crate::hash::validate_hash(&path, expected)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_tree(root: &Path) {
        std::fs::create_dir_all(root.join("pkg/__pycache__")).expect("mkdir");
        std::fs::create_dir_all(root.join(".git/objects")).expect("mkdir");
        std::fs::write(root.join("app.py"), "def create_app():\n    pass\n").expect("write");
        std::fs::write(root.join("pkg/__init__.py"), "").expect("write");
        std::fs::write(root.join("pkg/__pycache__/x.cpython-312.pyc"), "bytecode").expect("write");
        std::fs::write(root.join("pkg/stale.pyc"), "bytecode").expect("write");
        std::fs::write(root.join(".git/HEAD"), "ref").expect("write");
        std::fs::write(root.join(".env"), "SECRET=1").expect("write");
        std::fs::write(root.join("notes.log"), "log").expect("write");
    }

    #[test]
    fn resolve_file_source_existing_dir_returns_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uri = format!("file://{}", dir.path().display());
        let source = resolve_source(&uri).expect("resolve");
        assert!(matches!(source, ImageSource::Directory(_)));
    }

    #[test]
    fn resolve_tar_and_bare_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tar_path = dir.path().join("base.tar");
        std::fs::write(&tar_path, b"fake tar").expect("write");
        let uri = format!("tar://{}", tar_path.display());
        assert!(matches!(resolve_source(&uri).expect("tar"), ImageSource::Archive(_)));

        let bare = tar_path.display().to_string();
        assert!(matches!(resolve_source(&bare).expect("bare"), ImageSource::Archive(_)));
        let bare_dir = dir.path().display().to_string();
        assert!(matches!(resolve_source(&bare_dir).expect("dir"), ImageSource::Directory(_)));
    }

    #[test]
    fn resolve_remote_requires_sha256_pin() {
        assert!(resolve_source("https://example.com/base.tar.gz").is_err());
        let pinned = format!("https://example.com/base.tar.gz#sha256={}", "a".repeat(64));
        let source = resolve_source(&pinned).expect("resolve");
        match source {
            ImageSource::Remote { url, .. } => assert_eq!(url, "https://example.com/base.tar.gz"),
            other => panic!("unexpected source: {other:?}"),
        }
    }

    #[test]
    fn resolve_unknown_scheme_or_missing_path_fails() {
        assert!(resolve_source("ftp://example.com/image").is_err());
        assert!(resolve_source("file:///nonexistent/path").is_err());
        assert!(resolve_source("/nonexistent/berth/source").is_err());
    }

    #[test]
    fn source_pack_applies_default_excludes_and_berthignore() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageBackend::open(dir.path().join("data")).expect("storage");
        let src = dir.path().join("src");
        app_tree(&src);
        std::fs::write(src.join(IGNORE_FILE), "*.log\n").expect("write ignore");

        let tree = SourceTree::open(&ImageSource::Directory(src), &storage).expect("open");
        let layer = tree.pack(&storage, IgnoreRules::Source).expect("pack");

        let out = dir.path().join("out");
        let _ = extract_layer(&storage.layer_path(&layer.hash), &out).expect("extract");
        assert!(out.join("app.py").exists());
        assert!(out.join("pkg/__init__.py").exists());
        assert!(!out.join("pkg/__pycache__").exists());
        assert!(!out.join("pkg/stale.pyc").exists());
        assert!(!out.join(".git").exists());
        assert!(!out.join(".env").exists());
        assert!(!out.join("notes.log").exists());
    }

    #[test]
    fn ignored_files_do_not_change_layer_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageBackend::open(dir.path().join("data")).expect("storage");
        let src = dir.path().join("src");
        app_tree(&src);
        let source = ImageSource::Directory(src.clone());

        let a = SourceTree::open(&source, &storage)
            .expect("open")
            .pack(&storage, IgnoreRules::Source)
            .expect("pack a");
        std::fs::write(src.join("pkg/other.pyc"), "more bytecode").expect("write");
        let b = SourceTree::open(&source, &storage)
            .expect("open")
            .pack(&storage, IgnoreRules::Source)
            .expect("pack b");
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn archive_source_is_unpacked_and_repacked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageBackend::open(dir.path().join("data")).expect("storage");
        let src = dir.path().join("src");
        app_tree(&src);
        let archive = dir.path().join("base.tar");
        let _ = pack_dir(&src, &archive, |_, _| true).expect("pack");

        let tree = SourceTree::open(&ImageSource::Archive(archive), &storage).expect("open");
        assert!(tree.root().join("app.py").is_file());
        let layer = tree.pack(&storage, IgnoreRules::None).expect("repack");
        assert!(storage.has_layer(&layer.hash));
    }
}
