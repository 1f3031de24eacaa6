//! Package index protocol handlers.
//!
//! Supports a `file://` directory index and an `http(s)://` JSON index.
//! Remote downloads are always checksum-verified; local archives are
//! verified when a `.sha256` sidecar is present.

use std::path::{Path, PathBuf};
use std::time::Duration;

use berth_common::error::{BerthError, Result};
use berth_common::types::Sha256Hash;
use serde::Deserialize;

use crate::manifest::{Requirement, Version, normalize_name};

const ARCHIVE_EXTENSIONS: [&str; 3] = [".tar.gz", ".tgz", ".tar"];
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Where a resolved package archive can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageLocation {
    /// An archive on the local filesystem.
    Local(PathBuf),
    /// An archive behind an HTTP(S) URL.
    Remote(String),
}

/// A concrete package version chosen for a requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    /// Normalized package name.
    pub name: String,
    /// Chosen version.
    pub version: Version,
    /// Archive location.
    pub location: PackageLocation,
    /// Expected archive checksum, when the index publishes one.
    pub sha256: Option<Sha256Hash>,
}

impl ResolvedPackage {
    /// Returns `name==version`.
    #[must_use]
    pub fn pin(&self) -> String {
        format!("{}=={}", self.name, self.version)
    }
}

/// A source of installable packages.
pub trait PackageIndex: Send + Sync + std::fmt::Debug {
    /// Lists every available version of a package (normalized name).
    ///
    /// An unknown package yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be queried.
    fn versions(&self, name: &str) -> Result<Vec<ResolvedPackage>>;

    /// Makes the package archive available locally and verifies its checksum.
    ///
    /// `scratch` is a directory the implementation may download into.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be fetched or fails verification.
    fn fetch(&self, package: &ResolvedPackage, scratch: &Path) -> Result<PathBuf>;

    /// Picks the highest version satisfying the requirement.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::DependencyResolution` if no version matches.
    fn resolve(&self, requirement: &Requirement) -> Result<ResolvedPackage> {
        let name = requirement.normalized_name();
        let candidates = self
            .versions(&name)
            .map_err(|e| dependency_error(requirement, &e.to_string()))?;
        if candidates.is_empty() {
            return Err(dependency_error(requirement, "package not found in index"));
        }
        candidates
            .into_iter()
            .filter(|p| requirement.accepts(&p.version))
            .max_by(|a, b| a.version.cmp(&b.version))
            .ok_or_else(|| dependency_error(requirement, "no version satisfies the constraint"))
    }
}

/// Builds the resolution error for a manifest entry.
#[must_use]
pub fn dependency_error(requirement: &Requirement, reason: &str) -> BerthError {
    BerthError::DependencyResolution {
        entry: requirement.to_string(),
        reason: reason.to_string(),
    }
}

/// Opens a package index from its URI.
///
/// # Errors
///
/// Returns an error if the scheme is unsupported or a local index is missing.
pub fn open_index(uri: &str) -> Result<Box<dyn PackageIndex>> {
    if let Some(path_str) = uri.strip_prefix("file://") {
        let path = PathBuf::from(path_str);
        if !path.is_dir() {
            return Err(BerthError::NotFound {
                kind: "package index",
                id: path_str.to_string(),
            });
        }
        tracing::debug!(path = %path.display(), "opened local package index");
        Ok(Box::new(LocalIndex::new(path)))
    } else if uri.starts_with("https://") || uri.starts_with("http://") {
        tracing::debug!(url = uri, "opened remote package index");
        Ok(Box::new(HttpIndex::new(uri)?))
    } else {
        Err(BerthError::Config {
            message: format!("unsupported package index URI scheme: {uri}"),
        })
    }
}

/// Directory index: `<root>/<name>/<version>.tar.gz` plus optional
/// `<version>.sha256` sidecars.
#[derive(Debug, Clone)]
pub struct LocalIndex {
    root: PathBuf,
}

impl LocalIndex {
    /// Creates an index rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PackageIndex for LocalIndex {
    fn versions(&self, name: &str) -> Result<Vec<ResolvedPackage>> {
        let dir = self.root.join(normalize_name(name));
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| BerthError::io(&dir, e))? {
            let entry = entry.map_err(|e| BerthError::io(&dir, e))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(version) = ARCHIVE_EXTENSIONS
                .iter()
                .find_map(|ext| file_name.strip_suffix(ext))
            else {
                continue;
            };
            let sidecar = dir.join(format!("{version}.sha256"));
            let sha256 = if sidecar.exists() {
                let text =
                    std::fs::read_to_string(&sidecar).map_err(|e| BerthError::io(&sidecar, e))?;
                let hex = text.split_whitespace().next().unwrap_or_default();
                Some(Sha256Hash::from_hex(hex)?)
            } else {
                None
            };
            found.push(ResolvedPackage {
                name: normalize_name(name),
                version: Version::new(version),
                location: PackageLocation::Local(entry.path()),
                sha256,
            });
        }
        Ok(found)
    }

    fn fetch(&self, package: &ResolvedPackage, _scratch: &Path) -> Result<PathBuf> {
        let PackageLocation::Local(path) = &package.location else {
            return Err(BerthError::Config {
                message: format!("local index cannot fetch {}", package.pin()),
            });
        };
        if let Some(expected) = &package.sha256 {
            crate::hash::validate_hash(path, expected)?;
        }
        Ok(path.clone())
    }
}

#[derive(Debug, Deserialize)]
struct IndexDocument {
    versions: Vec<IndexVersion>,
}

#[derive(Debug, Deserialize)]
struct IndexVersion {
    version: String,
    url: String,
    sha256: String,
}

/// Remote index: `GET <base>/<name>/index.json`.
#[derive(Debug)]
pub struct HttpIndex {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpIndex {
    /// Creates a client for the index at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| BerthError::Config {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn get(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let response = self.client.get(url).send().map_err(|e| BerthError::Config {
            message: format!("GET {url}: {e}"),
        })?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(BerthError::Config {
                message: format!("GET {url}: HTTP {}", response.status()),
            });
        }
        let bytes = response.bytes().map_err(|e| BerthError::Config {
            message: format!("GET {url}: {e}"),
        })?;
        Ok(Some(bytes.to_vec()))
    }
}

impl PackageIndex for HttpIndex {
    fn versions(&self, name: &str) -> Result<Vec<ResolvedPackage>> {
        let name = normalize_name(name);
        let url = format!("{}/{name}/index.json", self.base_url);
        let Some(body) = self.get(&url)? else {
            return Ok(Vec::new());
        };
        let doc: IndexDocument = serde_json::from_slice(&body)?;
        doc.versions
            .into_iter()
            .map(|v| {
                let url = if v.url.starts_with("http://") || v.url.starts_with("https://") {
                    v.url
                } else {
                    format!("{}/{name}/{}", self.base_url, v.url)
                };
                Ok(ResolvedPackage {
                    name: name.clone(),
                    version: Version::new(v.version),
                    location: PackageLocation::Remote(url),
                    sha256: Some(Sha256Hash::from_hex(v.sha256)?),
                })
            })
            .collect()
    }

    fn fetch(&self, package: &ResolvedPackage, scratch: &Path) -> Result<PathBuf> {
        let PackageLocation::Remote(url) = &package.location else {
            return Err(BerthError::Config {
                message: format!("remote index cannot fetch {}", package.pin()),
            });
        };
        let expected = package.sha256.as_ref().ok_or_else(|| BerthError::Config {
            message: format!("remote package {} has no checksum", package.pin()),
        })?;
        let bytes = self.get(url)?.ok_or_else(|| BerthError::NotFound {
            kind: "package archive",
            id: url.clone(),
        })?;

        let ext = ARCHIVE_EXTENSIONS
            .iter()
            .find(|ext| url.ends_with(*ext))
            .copied()
            .unwrap_or(".tar.gz");
        let dest = scratch.join(format!("{}-{}{ext}", package.name, package.version));
        std::fs::write(&dest, &bytes).map_err(|e| BerthError::io(&dest, e))?;
        crate::hash::validate_hash(&dest, expected)?;
        tracing::debug!(package = %package.pin(), url = %url, "downloaded package");
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    use super::*;
    use crate::manifest::DependencyManifest;

    fn requirement(line: &str) -> Requirement {
        DependencyManifest::parse(line).expect("parse").requirements()[0].clone()
    }

    fn publish(root: &Path, name: &str, version: &str, body: &[u8]) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join(format!("{version}.tar"));
        std::fs::write(&path, body).expect("write");
        path
    }

    #[test]
    fn local_index_resolves_highest_matching_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _ = publish(dir.path(), "flask", "2.3.3", b"a");
        let _ = publish(dir.path(), "flask", "3.0", b"b");
        let _ = publish(dir.path(), "flask", "3.0.3", b"c");
        let index = LocalIndex::new(dir.path());

        let pinned = index.resolve(&requirement("flask==3.0")).expect("resolve");
        assert_eq!(pinned.version.as_str(), "3.0");

        let newest = index.resolve(&requirement("Flask>=3.0")).expect("resolve");
        assert_eq!(newest.version.as_str(), "3.0.3");

        let any = index.resolve(&requirement("flask")).expect("resolve");
        assert_eq!(any.version.as_str(), "3.0.3");
    }

    #[test]
    fn local_index_unknown_package_is_dependency_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = LocalIndex::new(dir.path());
        let err = index.resolve(&requirement("nope==1.0")).expect_err("missing");
        match err {
            BerthError::DependencyResolution { entry, .. } => assert_eq!(entry, "nope==1.0"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn local_index_unsatisfiable_constraint_is_dependency_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _ = publish(dir.path(), "flask", "2.0", b"a");
        let index = LocalIndex::new(dir.path());
        let err = index.resolve(&requirement("flask>=3")).expect_err("too old");
        assert!(matches!(err, BerthError::DependencyResolution { .. }));
    }

    #[test]
    fn local_index_verifies_sidecar_checksum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _ = publish(dir.path(), "flask", "3.0", b"archive bytes");
        let good = crate::hash::hash_bytes(b"archive bytes");
        std::fs::write(
            dir.path().join("flask/3.0.sha256"),
            format!("{}  3.0.tar\n", good.as_hex()),
        )
        .expect("write sidecar");
        let index = LocalIndex::new(dir.path());
        let pkg = index.resolve(&requirement("flask==3.0")).expect("resolve");
        assert!(index.fetch(&pkg, dir.path()).is_ok());

        std::fs::write(dir.path().join("flask/3.0.tar"), b"tampered").expect("tamper");
        let err = index.fetch(&pkg, dir.path()).expect_err("mismatch");
        assert!(matches!(err, BerthError::HashMismatch { .. }));
    }

    #[test]
    fn open_index_rejects_unknown_scheme() {
        assert!(open_index("ftp://example.com/simple").is_err());
    }

    #[test]
    fn open_index_missing_local_dir_is_not_found() {
        let err = open_index("file:///nonexistent/berth/index").expect_err("missing");
        assert!(matches!(err, BerthError::NotFound { .. }));
    }

    /// Serves canned responses keyed by request path, one connection each.
    fn serve(routes: Vec<(String, Vec<u8>)>, connections: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let _ = std::thread::spawn(move || {
            for stream in listener.incoming().take(connections) {
                let mut stream = stream.expect("accept");
                let mut reader = BufReader::new(stream.try_clone().expect("clone"));
                let mut request_line = String::new();
                let _ = reader.read_line(&mut request_line).expect("read");
                loop {
                    let mut header = String::new();
                    let _ = reader.read_line(&mut header).expect("header");
                    if header == "\r\n" || header.is_empty() {
                        break;
                    }
                }
                let path = request_line.split_whitespace().nth(1).unwrap_or("/");
                let (status, body) = routes
                    .iter()
                    .find(|(p, _)| p == path)
                    .map_or(("404 Not Found", Vec::new()), |(_, b)| ("200 OK", b.clone()));
                let head = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                stream.write_all(head.as_bytes()).expect("write head");
                stream.write_all(&body).expect("write body");
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn http_index_resolves_and_fetches_with_checksum() {
        let archive = b"remote archive".to_vec();
        let sha = crate::hash::hash_bytes(&archive);
        let index_json = format!(
            r#"{{"versions":[{{"version":"3.0","url":"flask-3.0.tar.gz","sha256":"{}"}},{{"version":"2.0","url":"flask-2.0.tar.gz","sha256":"{}"}}]}}"#,
            sha.as_hex(),
            sha.as_hex()
        );
        let base = serve(
            vec![
                ("/flask/index.json".into(), index_json.into_bytes()),
                ("/flask/flask-3.0.tar.gz".into(), archive),
            ],
            2,
        );

        let index = HttpIndex::new(&base).expect("client");
        let pkg = index.resolve(&requirement("flask==3.0")).expect("resolve");
        assert_eq!(pkg.location, PackageLocation::Remote(format!("{base}/flask/flask-3.0.tar.gz")));

        let scratch = tempfile::tempdir().expect("tempdir");
        let path = index.fetch(&pkg, scratch.path()).expect("fetch");
        assert_eq!(std::fs::read(path).expect("read"), b"remote archive");
    }

    #[test]
    fn http_index_unknown_package_is_empty() {
        let base = serve(Vec::new(), 1);
        let index = HttpIndex::new(&base).expect("client");
        assert!(index.versions("missing").expect("versions").is_empty());
    }
}
