//! System-wide constants and default paths.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default base directory for berth data on Linux with root access.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/berth";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "BERTH_DATA_DIR";

/// Returns the data directory, preferring `$BERTH_DATA_DIR`, then
/// `$HOME/.berth`, falling back to `/var/lib/berth`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        let user_dir = PathBuf::from(home).join(".berth");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Returns the state index path inside a data directory.
#[must_use]
pub fn state_file(data_dir: &Path) -> PathBuf {
    data_dir.join("state.json")
}

/// Returns the optional configuration file path inside a data directory.
#[must_use]
pub fn config_file(data_dir: &Path) -> PathBuf {
    data_dir.join("config.json")
}

/// Container port the service listens on by convention.
pub const DEFAULT_CONTAINER_PORT: u16 = 5000;

/// Host port published for the container port by convention.
pub const DEFAULT_HOST_PORT: u16 = 5000;

/// Environment variable carrying the inherited listening socket descriptor.
pub const LISTEN_FD_ENV: &str = "BERTH_LISTEN_FD";

/// Environment variable carrying the worker slot index.
pub const WORKER_ID_ENV: &str = "BERTH_WORKER_ID";

/// Environment variable carrying the factory reference in supervised mode.
pub const FACTORY_ENV: &str = "BERTH_FACTORY";

/// Exit code a worker uses when the application fails to load.
pub const APP_LOAD_ERROR_EXIT_CODE: i32 = 4;

/// Rootfs-relative directory the dependency layer is installed into.
pub const DEPS_TARGET: &str = "opt/berth/deps";

/// Default rootfs-relative working directory holding the source layer.
pub const DEFAULT_WORKDIR: &str = "app";

/// Name of the per-source ignore file.
pub const IGNORE_FILE: &str = ".berthignore";

/// File extension for service definition files.
pub const SERVICE_EXTENSION: &str = ".berth";

/// Default service definition file name.
pub const DEFAULT_SERVICE_FILE: &str = "service.berth";

/// SHA-256 digest length in hex characters.
pub const SHA256_HEX_LENGTH: usize = 64;

/// Application name used in CLI output and state files.
pub const APP_NAME: &str = "berth";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "berth";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_and_config_live_in_data_dir() {
        let dir = Path::new("/srv/berth");
        assert_eq!(state_file(dir), PathBuf::from("/srv/berth/state.json"));
        assert_eq!(config_file(dir), PathBuf::from("/srv/berth/config.json"));
    }

    #[test]
    fn convention_ports_match() {
        assert_eq!(DEFAULT_CONTAINER_PORT, DEFAULT_HOST_PORT);
    }
}
