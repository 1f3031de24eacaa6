//! Image assembly.
//!
//! Composes an image from three layers applied in a fixed order: the base
//! runtime, the cached dependency layer and a snapshot of the source tree.
//! The entry point is validated against the source snapshot and recorded in
//! the image before it is committed to the catalog.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use berth_common::constants::{DEFAULT_CONTAINER_PORT, DEPS_TARGET};
use berth_common::error::{BerthError, Result};
use chrono::Utc;

use crate::cache::DependencyCache;
use crate::entrypoint::EntryPoint;
use crate::index::PackageIndex;
use crate::layer::{Layer, LayerKind};
use crate::manifest::DependencyManifest;
use crate::registry::{Image, ImageCatalog, ImageConfig, LayerRef};
use crate::source::{IgnoreRules, SourceTree, resolve_source};
use crate::storage::StorageBackend;

/// Build pipeline stage, reported in `BerthError::Build`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    /// Base runtime layer.
    Base,
    /// Dependency layer.
    Dependencies,
    /// Source snapshot layer.
    Source,
    /// Entry point validation.
    EntryPoint,
    /// Catalog registration.
    Commit,
}

impl BuildStage {
    /// Returns the stage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Dependencies => "deps",
            Self::Source => "source",
            Self::EntryPoint => "entrypoint",
            Self::Commit => "commit",
        }
    }

    /// Wraps an error as a failure of this stage.
    ///
    /// Dependency resolution, entry point and build errors keep their kind.
    #[must_use]
    pub fn fail(self, err: BerthError) -> BerthError {
        match err {
            e @ (BerthError::DependencyResolution { .. }
            | BerthError::EntryPoint { .. }
            | BerthError::Build { .. }) => e,
            other => BerthError::Build {
                stage: self.as_str(),
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs of one image build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Image name.
    pub name: String,
    /// Base runtime source URI.
    pub base: String,
    /// Dependency manifest path.
    pub manifest: PathBuf,
    /// Application source URI.
    pub source: String,
    /// Start command.
    pub entry_point: EntryPoint,
    /// Default environment recorded in the image.
    pub env: BTreeMap<String, String>,
    /// Port the service listens on.
    pub exposed_port: u16,
}

impl BuildRequest {
    /// Creates a request with an empty environment and the default port.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        base: impl Into<String>,
        manifest: impl Into<PathBuf>,
        source: impl Into<String>,
        entry_point: EntryPoint,
    ) -> Self {
        Self {
            name: name.into(),
            base: base.into(),
            manifest: manifest.into(),
            source: source.into(),
            entry_point,
            env: BTreeMap::new(),
            exposed_port: DEFAULT_CONTAINER_PORT,
        }
    }
}

/// Outcome of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    /// The committed image.
    pub image: Image,
    /// Whether the dependency layer came from the cache.
    pub dependency_cache_hit: bool,
    /// Older image of the same name that was replaced.
    pub replaced: Option<Image>,
}

/// Builds images into the local store.
#[derive(Debug)]
pub struct ImageAssembler {
    storage: StorageBackend,
    cache: DependencyCache,
    catalog: ImageCatalog,
    index: Box<dyn PackageIndex>,
}

impl ImageAssembler {
    /// Creates an assembler over the given storage and package index.
    ///
    /// # Errors
    ///
    /// Returns an error if the image catalog cannot be opened.
    pub fn new(storage: StorageBackend, index: Box<dyn PackageIndex>) -> Result<Self> {
        let catalog = ImageCatalog::open(storage.root())?;
        Ok(Self {
            cache: DependencyCache::new(&storage),
            storage,
            catalog,
            index,
        })
    }

    /// Returns the image catalog.
    #[must_use]
    pub const fn catalog(&self) -> &ImageCatalog {
        &self.catalog
    }

    /// Returns the dependency cache.
    #[must_use]
    pub const fn cache(&self) -> &DependencyCache {
        &self.cache
    }

    /// Runs the build pipeline: base → deps → source → entrypoint → commit.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::DependencyResolution` for manifest problems,
    /// `BerthError::EntryPoint` when the entry point is missing from the
    /// source, and `BerthError::Build` naming the failing stage otherwise.
    pub fn build(&self, request: &BuildRequest) -> Result<BuildReport> {
        tracing::info!(image = %request.name, "building image");

        let stage = BuildStage::Base;
        tracing::info!(stage = %stage, base = %request.base, "applying layer");
        let base = self.base_layer(&request.base).map_err(|e| stage.fail(e))?;

        let stage = BuildStage::Dependencies;
        tracing::info!(stage = %stage, manifest = %request.manifest.display(), "applying layer");
        let manifest = DependencyManifest::from_file(&request.manifest).map_err(|e| stage.fail(e))?;
        let deps = self
            .cache
            .get_or_build(&manifest, self.index.as_ref())
            .map_err(|e| stage.fail(e))?;
        let _ = self
            .storage
            .import_layer(&deps.archive, &deps.entry.layer)
            .map_err(|e| stage.fail(e))?;

        let stage = BuildStage::Source;
        tracing::info!(stage = %stage, source = %request.source, "applying layer");
        let tree = resolve_source(&request.source)
            .and_then(|src| SourceTree::open(&src, &self.storage))
            .map_err(|e| stage.fail(e))?;
        let source = tree
            .pack(&self.storage, IgnoreRules::Source)
            .map_err(|e| stage.fail(e))?;

        let stage = BuildStage::EntryPoint;
        tracing::info!(stage = %stage, entry_point = %request.entry_point, "validating");
        request
            .entry_point
            .validate_source(tree.root())
            .map_err(|e| stage.fail(e))?;

        let stage = BuildStage::Commit;
        let config = ImageConfig {
            layers: vec![
                layer_ref(LayerKind::Base, &base, ""),
                layer_ref(LayerKind::Dependencies, &deps.entry.layer, DEPS_TARGET),
                layer_ref(LayerKind::Source, &source, &request.entry_point.workdir),
            ],
            dependency_key: deps.key().clone(),
            entry_point: request.entry_point.clone(),
            env: request.env.clone(),
            exposed_port: request.exposed_port,
        };
        let image = Image {
            id: config.id().map_err(|e| stage.fail(e))?,
            name: request.name.clone(),
            config,
            created_at: Utc::now(),
        };
        let replaced = self
            .catalog
            .register(image.clone())
            .map_err(|e| stage.fail(e))?;

        tracing::info!(
            image = %image.id.short(),
            name = %image.name,
            deps_cache_hit = deps.hit,
            "image built"
        );
        Ok(BuildReport {
            image,
            dependency_cache_hit: deps.hit,
            replaced,
        })
    }

    fn base_layer(&self, uri: &str) -> Result<Layer> {
        let source = resolve_source(uri)?;
        SourceTree::open(&source, &self.storage)?.pack(&self.storage, IgnoreRules::None)
    }
}

fn layer_ref(kind: LayerKind, layer: &Layer, target: &str) -> LayerRef {
    LayerRef {
        kind,
        digest: layer.hash.clone(),
        size_bytes: layer.size_bytes,
        target: target.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::entrypoint::FactoryRef;
    use crate::index::LocalIndex;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        assembler: ImageAssembler,
    }

    fn publish(index_root: &Path, name: &str, version: &str) {
        let pkg = index_root.join(name);
        std::fs::create_dir_all(&pkg).expect("mkdir");
        let tree = index_root.join(format!(".{name}-{version}"));
        std::fs::create_dir_all(tree.join(name)).expect("mkdir");
        std::fs::write(tree.join(name).join("__init__.py"), version).expect("write");
        let _ = crate::layer::pack_dir(&tree, &pkg.join(format!("{version}.tar")), |_, _| true)
            .expect("pack");
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        let index_root = root.join("index");
        publish(&index_root, "flask", "3.0");

        std::fs::create_dir_all(root.join("base/usr/bin")).expect("mkdir");
        std::fs::write(root.join("base/usr/bin/python3"), "#!/bin/sh\n").expect("write");
        std::fs::create_dir_all(root.join("src")).expect("mkdir");
        std::fs::write(root.join("src/app.py"), "def create_app():\n    return None\n")
            .expect("write");
        std::fs::write(root.join("requirements.txt"), "flask==3.0\n").expect("write");

        let storage = StorageBackend::open(root.join("data")).expect("storage");
        let assembler =
            ImageAssembler::new(storage, Box::new(LocalIndex::new(index_root))).expect("assembler");
        Fixture {
            _dir: dir,
            root,
            assembler,
        }
    }

    fn request(root: &Path) -> BuildRequest {
        let factory: FactoryRef = "app:create_app".parse().expect("factory");
        BuildRequest::new(
            "web",
            format!("file://{}", root.join("base").display()),
            root.join("requirements.txt"),
            format!("file://{}", root.join("src").display()),
            EntryPoint::supervised(factory),
        )
    }

    #[test]
    fn build_produces_ordered_layers_and_registers_image() {
        let fx = fixture();
        let report = fx.assembler.build(&request(&fx.root)).expect("build");
        let kinds: Vec<_> = report.image.config.layers.iter().map(|l| l.kind).collect();
        assert_eq!(
            kinds,
            vec![LayerKind::Base, LayerKind::Dependencies, LayerKind::Source]
        );
        assert!(!report.dependency_cache_hit);
        assert_eq!(report.image.config.layers[1].target, DEPS_TARGET);
        assert_eq!(report.image.config.layers[2].target, "app");
        assert_eq!(fx.assembler.catalog().get("web").expect("get"), report.image);
    }

    #[test]
    fn source_change_keeps_dependency_layer() {
        let fx = fixture();
        let first = fx.assembler.build(&request(&fx.root)).expect("first");
        std::fs::write(
            fx.root.join("src/app.py"),
            "def create_app():\n    return 'changed'\n",
        )
        .expect("write");
        let second = fx.assembler.build(&request(&fx.root)).expect("second");

        assert!(second.dependency_cache_hit);
        assert_eq!(first.image.config.dependency_key, second.image.config.dependency_key);
        assert_eq!(
            first.image.layer(LayerKind::Dependencies),
            second.image.layer(LayerKind::Dependencies)
        );
        assert_eq!(
            first.image.layer(LayerKind::Base),
            second.image.layer(LayerKind::Base)
        );
        assert_ne!(
            first.image.layer(LayerKind::Source),
            second.image.layer(LayerKind::Source)
        );
        assert_ne!(first.image.id, second.image.id);
        assert_eq!(second.replaced.map(|i| i.id), Some(first.image.id));
    }

    #[test]
    fn unresolvable_dependency_names_entry() {
        let fx = fixture();
        std::fs::write(fx.root.join("requirements.txt"), "flask==3.0\nrequests>=2\n")
            .expect("write");
        let err = fx.assembler.build(&request(&fx.root)).expect_err("unresolvable");
        let msg = err.to_string();
        assert!(msg.contains("stage deps"), "{msg}");
        match err {
            BerthError::DependencyResolution { entry, .. } => assert_eq!(entry, "requests>=2"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(fx.assembler.catalog().list().expect("list").is_empty());
    }

    #[test]
    fn unreadable_source_is_build_error_at_source_stage() {
        let fx = fixture();
        let mut req = request(&fx.root);
        req.source = fx.root.join("missing-src").display().to_string();
        match fx.assembler.build(&req).expect_err("missing source") {
            BerthError::Build { stage, .. } => assert_eq!(stage, "source"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_manifest_is_build_error_at_deps_stage() {
        let fx = fixture();
        let mut req = request(&fx.root);
        req.manifest = fx.root.join("nope.txt");
        match fx.assembler.build(&req).expect_err("missing manifest") {
            BerthError::Build { stage, .. } => assert_eq!(stage, "deps"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_factory_module_is_entry_point_error() {
        let fx = fixture();
        let mut req = request(&fx.root);
        req.entry_point = EntryPoint::supervised("wsgi:create_app".parse().expect("factory"));
        let err = fx.assembler.build(&req).expect_err("missing module");
        assert!(matches!(err, BerthError::EntryPoint { .. }));
    }
}
