//! Unified error types for the berth workspace.
//!
//! The pipeline taxonomy (`DependencyResolution`, `Build`, `EntryPoint`,
//! `NetworkAttachment`, `WorkerCrash`) lives next to the ambient variants so
//! every crate reports failures through one enum.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BerthError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A hash validation failed.
    #[error("hash mismatch for {resource}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Resource that failed validation.
        resource: String,
        /// Expected hash value.
        expected: String,
        /// Actual computed hash value.
        actual: String,
    },

    /// A manifest entry could not be resolved or installed.
    ///
    /// Fatal at build time and never retried: the manifest must be fixed.
    /// Resolution only runs in the `deps` build stage, which the message names.
    #[error("dependency resolution failed at stage deps for `{entry}`: {reason}")]
    DependencyResolution {
        /// The manifest entry (as written) that failed.
        entry: String,
        /// Why resolution or installation failed.
        reason: String,
    },

    /// A build stage failed to produce its layer.
    #[error("build failed at stage {stage}: {message}")]
    Build {
        /// Name of the failing stage (`base`, `deps`, `source`, `entrypoint`, `commit`).
        stage: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// The service entry point could not be resolved.
    #[error("entry point error: {message}")]
    EntryPoint {
        /// Description of the resolution failure.
        message: String,
    },

    /// The service could not join its network or publish its ports.
    #[error("network attachment failed for `{network}`: {message}")]
    NetworkAttachment {
        /// Network the service tried to join.
        network: String,
        /// Description of the failure.
        message: String,
    },

    /// The worker pool went down and the restart policy gave up.
    #[error("worker {worker} crashed ({status}) after {attempts} restart attempt(s)")]
    WorkerCrash {
        /// Slot index of the last crashed worker.
        worker: usize,
        /// Human-readable exit status.
        status: String,
        /// Consecutive restart attempts made before giving up.
        attempts: u32,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl BerthError {
    /// Wraps an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns whether the error happened at build time.
    ///
    /// Build-time errors describe deterministic misconfiguration and are
    /// never retried.
    #[must_use]
    pub const fn is_build_time(&self) -> bool {
        matches!(self, Self::DependencyResolution { .. } | Self::Build { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BerthError>;
