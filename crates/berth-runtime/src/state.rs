//! Persistent state management.
//!
//! Maintains a local JSON index of running services, enabling daemon-less
//! `ps` and `stop`.

use std::fs::File;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;

use berth_common::error::{BerthError, Result};
use berth_common::types::{ImageId, InstanceId, ServiceState};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

/// Persistent record of a running service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Service instance identifier.
    pub instance: InstanceId,
    /// Service name.
    pub service: String,
    /// Image the service runs.
    pub image: ImageId,
    /// PID of the supervising process.
    pub pid: u32,
    /// Address the service socket is bound on.
    pub bind: SocketAddr,
    /// Host addresses the service is published on.
    pub published: Vec<SocketAddr>,
    /// Joined network, if any.
    pub network: Option<String>,
    /// Last recorded state.
    pub state: ServiceState,
    /// Number of workers.
    pub workers: usize,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
}

impl StateEntry {
    /// Returns whether the supervising process still exists.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        i32::try_from(self.pid).is_ok_and(|pid| {
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
        })
    }
}

/// Loads the state index from disk. A missing file is an empty index.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_state(path: &Path) -> Result<Vec<StateEntry>> {
    tracing::debug!(path = %path.display(), "loading state index");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path).map_err(|e| BerthError::io(path, e))?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&content)?)
}

/// Persists the state index to disk atomically.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_state(path: &Path, entries: &[StateEntry]) -> Result<()> {
    tracing::debug!(path = %path.display(), entries = entries.len(), "saving state index");
    let dir = path
        .parent()
        .ok_or_else(|| BerthError::io(path, std::io::Error::other("no parent directory")))?;
    std::fs::create_dir_all(dir).map_err(|e| BerthError::io(dir, e))?;
    let json = serde_json::to_vec_pretty(entries)?;
    let mut staged = tempfile::NamedTempFile::new_in(dir).map_err(|e| BerthError::io(dir, e))?;
    staged.write_all(&json).map_err(|e| BerthError::io(path, e))?;
    let _ = staged.persist(path).map_err(|e| BerthError::io(path, e.error))?;
    Ok(())
}

/// Applies `f` to the index under an exclusive lock and saves the result.
///
/// # Errors
///
/// Returns an error if the index cannot be locked, read or written.
pub fn update_state<T>(path: &Path, f: impl FnOnce(&mut Vec<StateEntry>) -> T) -> Result<T> {
    let lock_path = path.with_extension("lock");
    if let Some(dir) = lock_path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| BerthError::io(dir, e))?;
    }
    let lock = File::create(&lock_path).map_err(|e| BerthError::io(&lock_path, e))?;
    FileExt::lock_exclusive(&lock).map_err(|e| BerthError::io(&lock_path, e))?;
    let result = load_state(path).and_then(|mut entries| {
        let out = f(&mut entries);
        save_state(path, &entries).map(|()| out)
    });
    let _ = FileExt::unlock(&lock);
    result
}

/// Inserts or replaces the entry for the same instance.
///
/// # Errors
///
/// Returns an error if the index cannot be updated.
pub fn upsert(path: &Path, entry: StateEntry) -> Result<()> {
    update_state(path, |entries| {
        entries.retain(|e| e.instance != entry.instance);
        entries.push(entry);
    })
}

/// Updates the recorded state of an instance, if present.
///
/// # Errors
///
/// Returns an error if the index cannot be updated.
pub fn set_state(path: &Path, instance: &InstanceId, state: ServiceState) -> Result<()> {
    update_state(path, |entries| {
        for entry in entries.iter_mut().filter(|e| &e.instance == instance) {
            entry.state = state;
        }
    })
}

/// Removes an instance from the index, returning its entry.
///
/// # Errors
///
/// Returns an error if the index cannot be updated.
pub fn remove(path: &Path, instance: &InstanceId) -> Result<Option<StateEntry>> {
    update_state(path, |entries| {
        let pos = entries.iter().position(|e| &e.instance == instance)?;
        Some(entries.remove(pos))
    })
}

/// Drops entries whose supervising process has gone away.
///
/// # Errors
///
/// Returns an error if the index cannot be updated.
pub fn prune_stale(path: &Path) -> Result<Vec<StateEntry>> {
    update_state(path, |entries| {
        let (live, stale): (Vec<_>, Vec<_>) = entries.drain(..).partition(StateEntry::is_alive);
        *entries = live;
        stale
    })
}
