//! Network attachment.
//!
//! Networks are defined by the surrounding infrastructure in
//! `networks/catalog.json`; berth never creates them, it only joins them.
//! Joining records the service in `networks/<name>/members.json` under an
//! exclusive file lock, and leaving removes the record.

use std::fs::File;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};
use berth_common::types::InstanceId;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

/// A pre-existing shared network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Network name.
    pub name: String,
    /// Address attached services bind on.
    #[serde(default = "unspecified")]
    pub address: IpAddr,
    /// Driver label, informational only.
    #[serde(default = "default_driver")]
    pub driver: String,
}

const fn unspecified() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_driver() -> String {
    "host".into()
}

/// A service instance joined to a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Service instance.
    pub instance: InstanceId,
    /// Service name.
    pub service: String,
    /// Address the service listens on.
    pub address: SocketAddr,
    /// Supervisor process id.
    pub pid: u32,
    /// When the service joined.
    pub attached_at: DateTime<Utc>,
}

/// Read-only view of the network catalog plus membership bookkeeping.
#[derive(Debug, Clone)]
pub struct NetworkCatalog {
    root: PathBuf,
}

impl NetworkCatalog {
    /// Opens the catalog under `data_dir`. A missing catalog has no networks.
    #[must_use]
    pub fn open(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("networks"),
        }
    }

    /// Returns the catalog file path.
    #[must_use]
    pub fn catalog_path(&self) -> PathBuf {
        self.root.join("catalog.json")
    }

    fn members_path(&self, network: &str) -> PathBuf {
        self.root.join(network).join("members.json")
    }

    /// Lists the declared networks.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog exists but cannot be read or parsed.
    pub fn list(&self) -> Result<Vec<Network>> {
        let path = self.catalog_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| BerthError::io(&path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Looks a network up by name.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::NetworkAttachment` if no such network exists.
    pub fn get(&self, name: &str) -> Result<Network> {
        self.list()?
            .into_iter()
            .find(|n| n.name == name)
            .ok_or_else(|| BerthError::NetworkAttachment {
                network: name.to_string(),
                message: "network does not exist; berth only joins pre-existing networks".into(),
            })
    }

    /// Lists the members of a network.
    ///
    /// # Errors
    ///
    /// Returns an error if the membership file cannot be read or parsed.
    pub fn members(&self, network: &str) -> Result<Vec<Member>> {
        read_members(&self.members_path(network))
    }

    /// Joins `member` to the named network.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::NetworkAttachment` if the network does not exist,
    /// or an I/O error if the membership cannot be recorded.
    pub fn attach(&self, network: &str, member: Member) -> Result<Attachment> {
        let network = self.get(network)?;
        let path = self.members_path(&network.name);
        let instance = member.instance.clone();
        update_members(&path, |members| {
            members.retain(|m| m.instance != member.instance);
            members.push(member);
        })?;
        tracing::info!(network = %network.name, instance = %instance, "joined network");
        Ok(Attachment {
            network,
            members_path: path,
            instance,
        })
    }
}

/// A live membership, removed by [`Attachment::detach`].
#[derive(Debug)]
pub struct Attachment {
    network: Network,
    members_path: PathBuf,
    instance: InstanceId,
}

impl Attachment {
    /// Returns the joined network.
    #[must_use]
    pub const fn network(&self) -> &Network {
        &self.network
    }

    /// Leaves the network.
    ///
    /// # Errors
    ///
    /// Returns an error if the membership file cannot be updated.
    pub fn detach(self) -> Result<()> {
        update_members(&self.members_path, |members| {
            members.retain(|m| m.instance != self.instance);
        })?;
        tracing::info!(network = %self.network.name, instance = %self.instance, "left network");
        Ok(())
    }
}

fn read_members(path: &Path) -> Result<Vec<Member>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path).map_err(|e| BerthError::io(path, e))?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&content)?)
}

/// Read-modify-write of a membership file under an exclusive lock.
fn update_members(path: &Path, f: impl FnOnce(&mut Vec<Member>)) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| BerthError::io(path, std::io::Error::other("no parent directory")))?;
    std::fs::create_dir_all(dir).map_err(|e| BerthError::io(dir, e))?;
    let lock_path = dir.join("members.lock");
    let lock = File::create(&lock_path).map_err(|e| BerthError::io(&lock_path, e))?;
    FileExt::lock_exclusive(&lock).map_err(|e| BerthError::io(&lock_path, e))?;

    let result = rewrite_members(path, dir, f);
    let _ = FileExt::unlock(&lock);
    result
}

fn rewrite_members(path: &Path, dir: &Path, f: impl FnOnce(&mut Vec<Member>)) -> Result<()> {
    let mut members = read_members(path)?;
    f(&mut members);
    let json = serde_json::to_vec_pretty(&members)?;
    let mut staged = tempfile::NamedTempFile::new_in(dir).map_err(|e| BerthError::io(dir, e))?;
    staged.write_all(&json).map_err(|e| BerthError::io(path, e))?;
    let _ = staged.persist(path).map_err(|e| BerthError::io(path, e.error))?;
    Ok(())
}
