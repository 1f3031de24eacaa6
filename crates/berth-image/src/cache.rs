//! Content-addressed dependency layer cache.
//!
//! Entries live under `cache/deps/<key>/`, where `<key>` is the SHA-256 of
//! the manifest bytes. An entry directory is renamed into place only once
//! `layer.tar` and `layer.json` are complete, so its presence means it is
//! usable and readers never take the lock.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};
use berth_common::types::Sha256Hash;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::index::{PackageIndex, dependency_error};
use crate::layer::{Layer, extract_layer, pack_dir};
use crate::manifest::DependencyManifest;
use crate::storage::StorageBackend;

const LAYER_FILE: &str = "layer.tar";
const META_FILE: &str = "layer.json";

/// Metadata stored beside a cached dependency layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Manifest content key.
    pub key: Sha256Hash,
    /// The packed layer.
    pub layer: Layer,
    /// Resolved packages as `name==version`, in manifest order.
    pub packages: Vec<String>,
    /// When the entry was built.
    pub created_at: DateTime<Utc>,
}

/// A dependency layer ready to be applied to an image.
#[derive(Debug, Clone)]
pub struct DependencyLayer {
    /// Cache metadata.
    pub entry: CacheEntry,
    /// Path to the layer archive inside the cache.
    pub archive: PathBuf,
    /// Whether the layer was reused instead of built.
    pub hit: bool,
}

impl DependencyLayer {
    /// Returns the manifest content key.
    #[must_use]
    pub const fn key(&self) -> &Sha256Hash {
        &self.entry.key
    }
}

/// Dependency layer cache rooted in the storage backend.
#[derive(Debug, Clone)]
pub struct DependencyCache {
    dir: PathBuf,
    storage: StorageBackend,
}

impl DependencyCache {
    /// Creates a cache over the given storage.
    #[must_use]
    pub fn new(storage: &StorageBackend) -> Self {
        Self {
            dir: storage.deps_cache_dir(),
            storage: storage.clone(),
        }
    }

    /// Returns the directory of the entry for `key`.
    #[must_use]
    pub fn entry_dir(&self, key: &Sha256Hash) -> PathBuf {
        self.dir.join(key.as_hex())
    }

    fn lock_path(&self, key: &Sha256Hash) -> PathBuf {
        self.dir.join(format!("{}.lock", key.as_hex()))
    }

    /// Returns the completed entry for `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry metadata cannot be read.
    pub fn lookup(&self, key: &Sha256Hash) -> Result<Option<DependencyLayer>> {
        let dir = self.entry_dir(key);
        let meta = dir.join(META_FILE);
        if !meta.is_file() {
            return Ok(None);
        }
        let entry = read_entry(&meta)?;
        Ok(Some(DependencyLayer {
            entry,
            archive: dir.join(LAYER_FILE),
            hit: true,
        }))
    }

    /// Returns the cached layer for the manifest, building it on a miss.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::DependencyResolution` naming the first entry that
    /// cannot be resolved, fetched or installed.
    pub fn get_or_build(
        &self,
        manifest: &DependencyManifest,
        index: &dyn PackageIndex,
    ) -> Result<DependencyLayer> {
        let key = manifest.content_key();
        if let Some(hit) = self.lookup(&key)? {
            tracing::info!(key = %key.short(), "dependency layer cache hit");
            return Ok(hit);
        }

        let lock_path = self.lock_path(&key);
        let lock_file = File::create(&lock_path).map_err(|e| BerthError::io(&lock_path, e))?;
        FileExt::lock_exclusive(&lock_file).map_err(|e| BerthError::io(&lock_path, e))?;

        let result = match self.lookup(&key) {
            Ok(Some(hit)) => {
                tracing::info!(key = %key.short(), "dependency layer built concurrently");
                Ok(hit)
            }
            Ok(None) => self.build(&key, manifest, index),
            Err(e) => Err(e),
        };

        let _ = FileExt::unlock(&lock_file);
        result
    }

    fn build(
        &self,
        key: &Sha256Hash,
        manifest: &DependencyManifest,
        index: &dyn PackageIndex,
    ) -> Result<DependencyLayer> {
        tracing::info!(
            key = %key.short(),
            packages = manifest.requirements().len(),
            "building dependency layer"
        );
        let staging = self.storage.staging("deps-")?;
        let tree = staging.path().join("tree");
        let downloads = staging.path().join("downloads");
        let entry_dir = staging.path().join("entry");
        for dir in [&tree, &downloads, &entry_dir] {
            std::fs::create_dir_all(dir).map_err(|e| BerthError::io(dir, e))?;
        }

        let mut packages = Vec::with_capacity(manifest.requirements().len());
        for requirement in manifest.requirements() {
            let package = index.resolve(requirement)?;
            let as_resolution = |e: BerthError| match e {
                e @ BerthError::DependencyResolution { .. } => e,
                other => dependency_error(requirement, &other.to_string()),
            };
            let archive = index.fetch(&package, &downloads).map_err(as_resolution)?;
            let _ = extract_layer(&archive, &tree).map_err(as_resolution)?;
            tracing::debug!(package = %package.pin(), "installed package");
            packages.push(package.pin());
        }

        let _ = crate::loader::install(&tree)?;
        let layer = pack_dir(&tree, &entry_dir.join(LAYER_FILE), |_, _| true)?;
        let entry = CacheEntry {
            key: key.clone(),
            layer,
            packages,
            created_at: Utc::now(),
        };
        let meta = entry_dir.join(META_FILE);
        let json = serde_json::to_vec_pretty(&entry)?;
        std::fs::write(&meta, json).map_err(|e| BerthError::io(&meta, e))?;

        let dest = self.entry_dir(key);
        if dest.exists() {
            std::fs::remove_dir_all(&dest).map_err(|e| BerthError::io(&dest, e))?;
        }
        std::fs::rename(&entry_dir, &dest).map_err(|e| BerthError::io(&dest, e))?;
        tracing::info!(key = %key.short(), layer = %entry.layer.hash, "dependency layer cached");

        Ok(DependencyLayer {
            archive: dest.join(LAYER_FILE),
            entry,
            hit: false,
        })
    }

    /// Lists completed cache entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be read.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        let read = std::fs::read_dir(&self.dir).map_err(|e| BerthError::io(&self.dir, e))?;
        for item in read {
            let item = item.map_err(|e| BerthError::io(&self.dir, e))?;
            let meta = item.path().join(META_FILE);
            if meta.is_file() {
                entries.push(read_entry(&meta)?);
            }
        }
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    /// Removes every entry whose key is not in `keep`.
    ///
    /// Returns the keys that were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry cannot be removed.
    pub fn prune(&self, keep: &HashSet<Sha256Hash>) -> Result<Vec<Sha256Hash>> {
        let mut removed = Vec::new();
        for entry in self.entries()? {
            if keep.contains(&entry.key) {
                continue;
            }
            let dir = self.entry_dir(&entry.key);
            std::fs::remove_dir_all(&dir).map_err(|e| BerthError::io(&dir, e))?;
            let _ = std::fs::remove_file(self.lock_path(&entry.key));
            tracing::info!(key = %entry.key.short(), "pruned dependency layer");
            removed.push(entry.key);
        }
        Ok(removed)
    }
}

fn read_entry(path: &Path) -> Result<CacheEntry> {
    let content = std::fs::read_to_string(path).map_err(|e| BerthError::io(path, e))?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::LocalIndex;

    /// Publishes a one-file package archive into a local index.
    fn publish(index_root: &Path, name: &str, version: &str, module: &str) {
        let dir = index_root.join(name);
        std::fs::create_dir_all(&dir).expect("mkdir");
        let file = File::create(dir.join(format!("{version}.tar"))).expect("create");
        let mut builder = tar::Builder::new(file);
        let body = format!("__version__ = \"{version}\"\n");
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{module}/__init__.py"), body.as_bytes())
            .expect("append");
        builder.finish().expect("finish");
    }

    fn setup() -> (tempfile::TempDir, DependencyCache, LocalIndex) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageBackend::open(dir.path().join("data")).expect("storage");
        let index_root = dir.path().join("index");
        publish(&index_root, "flask", "3.0", "flask");
        publish(&index_root, "flask", "2.3", "flask");
        publish(&index_root, "itsdangerous", "2.1.2", "itsdangerous");
        (dir, DependencyCache::new(&storage), LocalIndex::new(index_root))
    }

    #[test]
    fn same_manifest_twice_hits_cache_with_identical_layer() {
        let (_dir, cache, index) = setup();
        let manifest = DependencyManifest::parse("flask==3.0\nitsdangerous\n").expect("parse");

        let first = cache.get_or_build(&manifest, &index).expect("build");
        assert!(!first.hit);
        assert_eq!(first.entry.packages, vec!["flask==3.0", "itsdangerous==2.1.2"]);

        let second = cache.get_or_build(&manifest, &index).expect("hit");
        assert!(second.hit);
        assert_eq!(first.key(), second.key());
        assert_eq!(first.entry.layer, second.entry.layer);
    }

    #[test]
    fn rebuilt_entry_is_bit_identical() {
        let (_dir, cache, index) = setup();
        let manifest = DependencyManifest::parse("flask==3.0\n").expect("parse");
        let first = cache.get_or_build(&manifest, &index).expect("build");
        let bytes = std::fs::read(&first.archive).expect("read");

        let removed = cache.prune(&HashSet::new()).expect("prune");
        assert_eq!(removed, vec![first.key().clone()]);

        let rebuilt = cache.get_or_build(&manifest, &index).expect("rebuild");
        assert!(!rebuilt.hit);
        assert_eq!(std::fs::read(&rebuilt.archive).expect("read"), bytes);
    }

    #[test]
    fn concurrent_builds_of_one_manifest_share_a_single_entry() {
        let (_dir, cache, index) = setup();
        let manifest = DependencyManifest::parse("flask==3.0\nitsdangerous\n").expect("parse");
        let barrier = std::sync::Barrier::new(2);

        let results: Vec<DependencyLayer> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        let _ = barrier.wait();
                        cache.get_or_build(&manifest, &index).expect("get_or_build")
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("join")).collect()
        });

        assert_eq!(results.iter().filter(|r| !r.hit).count(), 1);
        assert_eq!(results.iter().filter(|r| r.hit).count(), 1);
        assert_eq!(results[0].key(), results[1].key());
        assert_eq!(
            std::fs::read(&results[0].archive).expect("read"),
            std::fs::read(&results[1].archive).expect("read")
        );
        assert_eq!(cache.entries().expect("entries").len(), 1);
    }

    #[test]
    fn layer_ships_the_worker_loader() {
        let (_dir, cache, index) = setup();
        let manifest = DependencyManifest::parse("flask==3.0\n").expect("parse");
        let layer = cache.get_or_build(&manifest, &index).expect("build");

        let mut archive = tar::Archive::new(File::open(&layer.archive).expect("open"));
        let paths: Vec<PathBuf> = archive
            .entries()
            .expect("entries")
            .map(|e| e.expect("entry").path().expect("path").into_owned())
            .collect();
        assert!(paths.contains(&PathBuf::from("berth_worker.py")), "{paths:?}");
        assert!(paths.contains(&PathBuf::from("flask/__init__.py")), "{paths:?}");
    }

    #[test]
    fn changed_manifest_builds_new_entry() {
        let (_dir, cache, index) = setup();
        let a = cache
            .get_or_build(&DependencyManifest::parse("flask==3.0\n").expect("parse"), &index)
            .expect("a");
        let b = cache
            .get_or_build(&DependencyManifest::parse("flask==2.3\n").expect("parse"), &index)
            .expect("b");
        assert_ne!(a.key(), b.key());
        assert_ne!(a.entry.layer.hash, b.entry.layer.hash);
        assert_eq!(cache.entries().expect("entries").len(), 2);
    }

    #[test]
    fn unresolvable_entry_fails_and_leaves_no_entry() {
        let (_dir, cache, index) = setup();
        let manifest = DependencyManifest::parse("flask==3.0\nmissing-pkg>=1\n").expect("parse");
        let err = cache.get_or_build(&manifest, &index).expect_err("should fail");
        match err {
            BerthError::DependencyResolution { entry, .. } => assert_eq!(entry, "missing-pkg>=1"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(cache.lookup(&manifest.content_key()).expect("lookup").is_none());
    }

    #[test]
    fn corrupt_package_is_dependency_error() {
        let (dir, cache, index) = setup();
        let pkg_dir = dir.path().join("index/broken");
        std::fs::create_dir_all(&pkg_dir).expect("mkdir");
        std::fs::write(pkg_dir.join("1.0.tar.gz"), b"not gzip").expect("write");

        let manifest = DependencyManifest::parse("broken==1.0\n").expect("parse");
        let err = cache.get_or_build(&manifest, &index).expect_err("corrupt");
        assert!(matches!(err, BerthError::DependencyResolution { .. }));
    }

    #[test]
    fn prune_keeps_referenced_keys() {
        let (_dir, cache, index) = setup();
        let keep = cache
            .get_or_build(&DependencyManifest::parse("flask==3.0\n").expect("parse"), &index)
            .expect("keep");
        let drop = cache
            .get_or_build(&DependencyManifest::parse("flask==2.3\n").expect("parse"), &index)
            .expect("drop");

        let removed = cache
            .prune(&HashSet::from([keep.key().clone()]))
            .expect("prune");
        assert_eq!(removed, vec![drop.key().clone()]);
        assert!(cache.lookup(keep.key()).expect("lookup").is_some());
        assert!(cache.lookup(drop.key()).expect("lookup").is_none());
    }

    #[test]
    fn empty_manifest_yields_empty_layer() {
        let (_dir, cache, index) = setup();
        let layer = cache
            .get_or_build(&DependencyManifest::parse("# nothing\n").expect("parse"), &index)
            .expect("build");
        assert!(layer.entry.packages.is_empty());
        assert!(layer.archive.is_file());
    }
}
