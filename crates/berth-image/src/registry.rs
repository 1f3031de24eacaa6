//! Local image catalog management.
//!
//! Maintains an index of assembled images and their layer compositions in
//! `images/catalog.json`. Image names are unique: registering an image under
//! an existing name replaces the older record.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};
use berth_common::types::{ImageId, Sha256Hash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entrypoint::EntryPoint;
use crate::layer::LayerKind;

/// One layer of an image, in application order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRef {
    /// Role of the layer.
    pub kind: LayerKind,
    /// Digest of the stored archive.
    pub digest: Sha256Hash,
    /// Archive size in bytes.
    pub size_bytes: u64,
    /// Extraction target relative to the rootfs (empty for `/`).
    pub target: String,
}

/// The content-defining part of an image. Its digest is the image id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Layers, bottom to top.
    pub layers: Vec<LayerRef>,
    /// Key of the dependency cache entry used for the dependency layer.
    pub dependency_key: Sha256Hash,
    /// Start command.
    pub entry_point: EntryPoint,
    /// Default environment.
    pub env: BTreeMap<String, String>,
    /// Port the service listens on inside its network.
    pub exposed_port: u16,
}

impl ImageConfig {
    /// Computes the image id from the canonical JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized.
    pub fn id(&self) -> Result<ImageId> {
        let canonical = serde_json::to_vec(self)?;
        Ok(ImageId::new(crate::hash::hash_bytes(&canonical).as_hex()))
    }
}

/// An assembled, immutable image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Content-derived identifier.
    pub id: ImageId,
    /// Human-readable name.
    pub name: String,
    /// Image content.
    #[serde(flatten)]
    pub config: ImageConfig,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Image {
    /// Returns the total size of all layers.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.config.layers.iter().map(|l| l.size_bytes).sum()
    }

    /// Returns the layer of the given kind.
    #[must_use]
    pub fn layer(&self, kind: LayerKind) -> Option<&LayerRef> {
        self.config.layers.iter().find(|l| l.kind == kind)
    }
}

/// Image catalog backed by a JSON file.
#[derive(Debug)]
pub struct ImageCatalog {
    catalog_path: PathBuf,
}

impl ImageCatalog {
    /// Opens or creates an image catalog under the given data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog directory cannot be created.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("images");
        std::fs::create_dir_all(&dir).map_err(|e| BerthError::io(&dir, e))?;
        Ok(Self {
            catalog_path: dir.join("catalog.json"),
        })
    }

    /// Lists all images in the catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog file cannot be read or parsed.
    pub fn list(&self) -> Result<Vec<Image>> {
        if !self.catalog_path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.catalog_path)
            .map_err(|e| BerthError::io(&self.catalog_path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Registers an image, replacing any image with the same name.
    ///
    /// Returns the replaced image, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read or written.
    pub fn register(&self, image: Image) -> Result<Option<Image>> {
        let mut images = self.list()?;
        let replaced = images
            .iter()
            .position(|i| i.name == image.name)
            .map(|pos| images.remove(pos));
        tracing::info!(image = %image.id.short(), name = %image.name, "image registered");
        images.push(image);
        self.write_images(&images)?;
        Ok(replaced)
    }

    /// Finds an image by name, full id or id prefix.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::NotFound` if nothing matches.
    pub fn get(&self, reference: &str) -> Result<Image> {
        let images = self.list()?;
        images
            .iter()
            .find(|i| i.name == reference || i.id.as_str() == reference)
            .or_else(|| {
                let mut prefixed = images
                    .iter()
                    .filter(|i| reference.len() >= 4 && i.id.as_str().starts_with(reference));
                match (prefixed.next(), prefixed.next()) {
                    (Some(only), None) => Some(only),
                    _ => None,
                }
            })
            .cloned()
            .ok_or_else(|| BerthError::NotFound {
                kind: "image",
                id: reference.to_string(),
            })
    }

    /// Removes an image by name or id.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::NotFound` if no image matches.
    pub fn remove(&self, reference: &str) -> Result<Image> {
        let target = self.get(reference)?;
        let mut images = self.list()?;
        images.retain(|i| i.id != target.id || i.name != target.name);
        self.write_images(&images)?;
        tracing::info!(image = %target.id.short(), name = %target.name, "image removed");
        Ok(target)
    }

    fn write_images(&self, images: &[Image]) -> Result<()> {
        let json = serde_json::to_vec_pretty(images)?;
        let dir = self
            .catalog_path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        let mut staged =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| BerthError::io(dir, e))?;
        staged
            .write_all(&json)
            .map_err(|e| BerthError::io(&self.catalog_path, e))?;
        let _ = staged
            .persist(&self.catalog_path)
            .map_err(|e| BerthError::io(&self.catalog_path, e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entrypoint::FactoryRef;

    fn make_image(name: &str, port: u16) -> Image {
        let factory: FactoryRef = "app:create_app".parse().expect("factory");
        let config = ImageConfig {
            layers: vec![LayerRef {
                kind: LayerKind::Source,
                digest: crate::hash::hash_bytes(name.as_bytes()),
                size_bytes: 1024,
                target: "app".into(),
            }],
            dependency_key: crate::hash::hash_bytes(b"flask==3.0\n"),
            entry_point: EntryPoint::supervised(factory),
            env: BTreeMap::new(),
            exposed_port: port,
        };
        Image {
            id: config.id().expect("id"),
            name: name.into(),
            config,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn catalog_empty_on_first_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = ImageCatalog::open(dir.path()).expect("open");
        assert!(catalog.list().expect("list").is_empty());
    }

    #[test]
    fn register_and_get_by_name_id_and_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = ImageCatalog::open(dir.path()).expect("open");
        let image = make_image("web", 5000);
        assert!(catalog.register(image.clone()).expect("register").is_none());

        assert_eq!(catalog.get("web").expect("by name"), image);
        assert_eq!(catalog.get(image.id.as_str()).expect("by id"), image);
        assert_eq!(catalog.get(image.id.short()).expect("by prefix"), image);
        assert!(catalog.get("missing").is_err());
    }

    #[test]
    fn register_same_name_replaces_older_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = ImageCatalog::open(dir.path()).expect("open");
        let old = make_image("web", 5000);
        let new = make_image("web", 8000);
        let _ = catalog.register(old.clone()).expect("register");
        let replaced = catalog.register(new.clone()).expect("register");

        assert_eq!(replaced, Some(old));
        let images = catalog.list().expect("list");
        assert_eq!(images, vec![new]);
    }

    #[test]
    fn remove_existing_and_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = ImageCatalog::open(dir.path()).expect("open");
        let _ = catalog.register(make_image("web", 5000)).expect("register");
        let _ = catalog.register(make_image("worker", 5000)).expect("register");

        let removed = catalog.remove("web").expect("remove");
        assert_eq!(removed.name, "web");
        assert_eq!(catalog.list().expect("list").len(), 1);
        assert!(matches!(
            catalog.remove("web").expect_err("gone"),
            BerthError::NotFound { .. }
        ));
    }

    #[test]
    fn image_id_is_content_derived_and_ignores_timestamp() {
        let a = make_image("a", 5000);
        let b = make_image("a", 5000);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, make_image("a", 5001).id);
    }
}
