//! Abstract Syntax Tree for `.berth` service files.

use std::collections::BTreeMap;

/// Root node of a parsed `.berth` file.
#[derive(Debug, Clone, Default)]
pub struct ServiceFile {
    /// Service blocks, in file order.
    pub services: Vec<ServiceDecl>,
}

/// A `SERVICE` block.
#[derive(Debug, Clone, Default)]
pub struct ServiceDecl {
    /// Service name.
    pub name: String,
    /// Reference to an already built image.
    pub image: Option<String>,
    /// Inline build instructions.
    pub build: Option<BuildDecl>,
    /// Start command override.
    pub command: Vec<String>,
    /// Container port.
    pub port: Option<i64>,
    /// Published port mappings (`"host:container"`).
    pub publish: Vec<String>,
    /// External networks to join.
    pub networks: Vec<String>,
    /// Restart policy.
    pub restart: Option<String>,
    /// Environment file path.
    pub env_file: Option<String>,
    /// Inline environment.
    pub env: BTreeMap<String, String>,
    /// Worker count.
    pub workers: Option<i64>,
}

/// A nested `build = { ... }` block.
#[derive(Debug, Clone, Default)]
pub struct BuildDecl {
    /// Base runtime source.
    pub base: Option<String>,
    /// Dependency manifest path.
    pub manifest: Option<String>,
    /// Application source.
    pub source: Option<String>,
    /// Explicit mode: `"direct"` or `"supervised"`.
    pub entrypoint: Option<String>,
    /// Main script (direct mode).
    pub script: Option<String>,
    /// Factory reference (supervised mode).
    pub factory: Option<String>,
    /// Interpreter invocation override.
    pub interpreter: Vec<String>,
    /// Loader invocation override.
    pub loader: Vec<String>,
    /// Working directory inside the rootfs.
    pub workdir: Option<String>,
}
