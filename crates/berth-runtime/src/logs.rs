//! Per-service log files.
//!
//! Worker stdout and stderr are appended to `<data_dir>/logs/<service>.log`
//! alongside the supervisor's lifecycle lines.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};

/// Returns the log file path for a service.
#[must_use]
pub fn log_path(data_dir: &Path, service: &str) -> PathBuf {
    data_dir.join("logs").join(format!("{service}.log"))
}

/// Reads a service's logs from disk.
///
/// Returns an empty string if the log file does not exist yet.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_logs(data_dir: &Path, service: &str) -> Result<String> {
    let path = log_path(data_dir, service);
    if !path.exists() {
        return Ok(String::new());
    }
    std::fs::read_to_string(&path).map_err(|e| BerthError::io(path, e))
}

/// Opens a log file for appending, creating it and its directory.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created.
pub fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BerthError::io(parent, e))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| BerthError::io(path, e))
}

/// Appends a timestamped supervisor line to a log file.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or written.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = open_append(path)?;
    let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
    writeln!(file, "{stamp} [berth] {line}").map_err(|e| BerthError::io(path, e))
}

/// Appends a supervisor line to a service's log.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created or written.
pub fn append_log(data_dir: &Path, service: &str, line: &str) -> Result<()> {
    append_line(&log_path(data_dir, service), line)
}

/// Returns the last `lines` lines of `content`.
#[must_use]
pub fn tail(content: &str, lines: usize) -> &str {
    if lines == 0 {
        return "";
    }
    let mut seen = 0;
    for (idx, _) in content.trim_end_matches('\n').rmatch_indices('\n') {
        seen += 1;
        if seen == lines {
            return &content[idx + 1..];
        }
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_is_constructed_correctly() {
        let p = log_path(Path::new("/var/lib/berth"), "images");
        assert_eq!(p, PathBuf::from("/var/lib/berth/logs/images.log"));
    }

    #[test]
    fn read_logs_missing_file_returns_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let content = read_logs(dir.path(), "nonexistent").expect("should succeed");
        assert!(content.is_empty());
    }

    #[test]
    fn append_and_read_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        append_log(dir.path(), "web", "worker 0 started").expect("append 1");
        append_log(dir.path(), "web", "worker 0 crashed").expect("append 2");

        let content = read_logs(dir.path(), "web").expect("read");
        assert!(content.contains("[berth] worker 0 started"));
        assert!(content.contains("[berth] worker 0 crashed"));
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn separate_services_have_separate_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        append_log(dir.path(), "a", "from a").expect("append a");
        append_log(dir.path(), "b", "from b").expect("append b");

        let a_logs = read_logs(dir.path(), "a").expect("read a");
        assert!(a_logs.contains("from a"));
        assert!(!a_logs.contains("from b"));
    }

    #[test]
    fn tail_returns_last_lines() {
        let content = "one\ntwo\nthree\n";
        assert_eq!(tail(content, 2), "two\nthree\n");
        assert_eq!(tail(content, 10), content);
        assert_eq!(tail(content, 0), "");
    }
}
