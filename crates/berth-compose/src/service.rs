//! Typed service definitions.
//!
//! A [`ServiceDefinition`] is the validated, immutable form of a `SERVICE`
//! block: which image to run (or how to build it), the port it listens on,
//! the external networks it joins, how to publish it, its restart policy and
//! its environment.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use berth_common::constants::DEFAULT_CONTAINER_PORT;
use berth_common::error::{BerthError, Result};
use berth_image::assembler::BuildRequest;
use berth_image::entrypoint::{EntryPoint, FactoryRef};
use serde::{Deserialize, Serialize};

use crate::parser::ast::{BuildDecl, ServiceDecl};

/// Service-level restart policy as written in a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RestartSpec {
    /// Restart unconditionally, without a retry bound.
    #[default]
    Always,
    /// Never restart.
    No,
    /// Restart only after a crash, optionally bounded.
    OnFailure {
        /// Maximum consecutive restarts, unbounded when absent.
        max_retries: Option<u32>,
    },
    /// Like `Always`; there is no manual-stop state to honour.
    UnlessStopped,
}

impl FromStr for RestartSpec {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "always" => Ok(Self::Always),
            "no" | "never" => Ok(Self::No),
            "on-failure" => Ok(Self::OnFailure { max_retries: None }),
            "unless-stopped" => Ok(Self::UnlessStopped),
            other => {
                let n = other
                    .strip_prefix("on-failure:")
                    .and_then(|n| n.parse::<u32>().ok())
                    .ok_or_else(|| BerthError::Config {
                        message: format!(
                            "invalid restart policy `{other}` (expected always, no, on-failure[:N] or unless-stopped)"
                        ),
                    })?;
                Ok(Self::OnFailure {
                    max_retries: Some(n),
                })
            }
        }
    }
}

impl fmt::Display for RestartSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("always"),
            Self::No => f.write_str("no"),
            Self::OnFailure { max_retries: None } => f.write_str("on-failure"),
            Self::OnFailure {
                max_retries: Some(n),
            } => write!(f, "on-failure:{n}"),
            Self::UnlessStopped => f.write_str("unless-stopped"),
        }
    }
}

/// A host → container port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host address to publish on; all addresses when absent.
    pub host_ip: Option<IpAddr>,
    /// Host port.
    pub host_port: u16,
    /// Container port.
    pub container_port: u16,
}

impl PortMapping {
    /// Publishes `port` on the same host port.
    #[must_use]
    pub const fn identity(port: u16) -> Self {
        Self {
            host_ip: None,
            host_port: port,
            container_port: port,
        }
    }
}

impl FromStr for PortMapping {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| BerthError::Config {
            message: format!("invalid port mapping `{s}`: {reason}"),
        };
        let spec = s.trim();
        let spec = match spec.split_once('/') {
            Some((ports, "tcp")) => ports,
            Some(_) => return Err(invalid("only tcp is supported")),
            None => spec,
        };
        let port = |p: &str| p.parse::<u16>().map_err(|_| invalid("bad port number"));

        let (host_ip, rest) = if let Some(bracketed) = spec.strip_prefix('[') {
            let (ip, rest) = bracketed
                .split_once("]:")
                .ok_or_else(|| invalid("unterminated IPv6 address"))?;
            (Some(ip), rest)
        } else if spec.matches(':').count() == 2 {
            let (ip, rest) = spec
                .split_once(':')
                .ok_or_else(|| invalid("bad address"))?;
            (Some(ip), rest)
        } else {
            (None, spec)
        };

        let (host_port, container_port) = match rest.split_once(':') {
            Some((host, container)) => (port(host)?, port(container)?),
            None => {
                let p = port(rest)?;
                (p, p)
            }
        };
        let host_ip = host_ip
            .map(|ip| ip.parse::<IpAddr>().map_err(|_| invalid("bad host address")))
            .transpose()?;
        if container_port == 0 {
            return Err(invalid("container port must not be 0"));
        }
        Ok(Self {
            host_ip,
            host_port,
            container_port,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host_ip {
            Some(IpAddr::V6(ip)) => write!(f, "[{ip}]:")?,
            Some(IpAddr::V4(ip)) => write!(f, "{ip}:")?,
            None => {}
        }
        write!(f, "{}:{}", self.host_port, self.container_port)
    }
}

/// How to build the service's image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    /// Base runtime source URI.
    pub base: String,
    /// Dependency manifest.
    pub manifest: PathBuf,
    /// Application source URI.
    pub source: String,
    /// Start command recorded in the image.
    pub entry_point: EntryPoint,
}

/// The image a service runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// An image already in the catalog.
    Named(String),
    /// An image built from source under the service name.
    Build(BuildSpec),
}

/// A validated service definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// Service name.
    pub name: String,
    /// Image to run.
    pub image: ImageRef,
    /// Start command override.
    pub command: Option<Vec<String>>,
    /// Port the service listens on.
    pub port: u16,
    /// Host publications of the port.
    pub publish: Vec<PortMapping>,
    /// External networks to join, in order.
    pub networks: Vec<String>,
    /// Restart policy.
    pub restart: RestartSpec,
    /// Environment file merged at start.
    pub env_file: Option<PathBuf>,
    /// Inline environment.
    pub env: BTreeMap<String, String>,
    /// Worker count; the configured default when absent.
    pub workers: Option<usize>,
}

impl ServiceDefinition {
    /// Converts a validated declaration, resolving relative paths against
    /// `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be converted.
    pub fn from_decl(decl: &ServiceDecl, base_dir: &Path) -> Result<Self> {
        let image = match (&decl.image, &decl.build) {
            (Some(name), None) => ImageRef::Named(name.clone()),
            (None, Some(build)) => ImageRef::Build(build_spec(build, base_dir)?),
            _ => {
                return Err(BerthError::Config {
                    message: format!("service `{}` needs exactly one of image or build", decl.name),
                });
            }
        };
        let port = match decl.port {
            Some(p) => u16::try_from(p).map_err(|_| BerthError::Config {
                message: format!("port value out of range: {p}"),
            })?,
            None => DEFAULT_CONTAINER_PORT,
        };
        let publish = if decl.publish.is_empty() {
            vec![PortMapping::identity(port)]
        } else {
            decl.publish
                .iter()
                .map(|p| p.parse())
                .collect::<Result<Vec<_>>>()?
        };
        let workers = decl
            .workers
            .map(|w| {
                usize::try_from(w).map_err(|_| BerthError::Config {
                    message: format!("workers value out of range: {w}"),
                })
            })
            .transpose()?;

        Ok(Self {
            name: decl.name.clone(),
            image,
            command: (!decl.command.is_empty()).then(|| decl.command.clone()),
            port,
            publish,
            networks: decl.networks.clone(),
            restart: decl
                .restart
                .as_deref()
                .map(str::parse::<RestartSpec>)
                .transpose()?
                .unwrap_or_default(),
            env_file: decl.env_file.as_ref().map(|p| base_dir.join(p)),
            env: decl.env.clone(),
            workers,
        })
    }

    /// Returns the catalog name of the image this service runs.
    #[must_use]
    pub fn image_name(&self) -> &str {
        match &self.image {
            ImageRef::Named(name) => name,
            ImageRef::Build(_) => &self.name,
        }
    }

    /// Returns the build request, for services built from source.
    #[must_use]
    pub fn build_request(&self) -> Option<BuildRequest> {
        match &self.image {
            ImageRef::Named(_) => None,
            ImageRef::Build(spec) => {
                let mut request = BuildRequest::new(
                    self.name.clone(),
                    spec.base.clone(),
                    spec.manifest.clone(),
                    spec.source.clone(),
                    spec.entry_point.clone(),
                );
                request.exposed_port = self.port;
                Some(request)
            }
        }
    }

    /// Returns the primary network, whose address the service binds on.
    #[must_use]
    pub fn network(&self) -> Option<&str> {
        self.networks.first().map(String::as_str)
    }
}

fn build_spec(build: &BuildDecl, base_dir: &Path) -> Result<BuildSpec> {
    let required = |value: &Option<String>, key: &str| {
        value.clone().ok_or_else(|| BerthError::Config {
            message: format!("build block is missing `{key}`"),
        })
    };
    let base = resolve_uri(&required(&build.base, "base")?, base_dir);
    let source = resolve_uri(&required(&build.source, "source")?, base_dir);
    let manifest = base_dir.join(required(&build.manifest, "manifest")?);

    let mut entry_point = match (&build.script, &build.factory) {
        (Some(script), None) => EntryPoint::direct(script.clone()),
        (None, Some(factory)) => EntryPoint::supervised(factory.parse::<FactoryRef>()?),
        _ => {
            return Err(BerthError::EntryPoint {
                message: "build block needs exactly one of script or factory".into(),
            });
        }
    };
    if !build.interpreter.is_empty() {
        entry_point.interpreter.clone_from(&build.interpreter);
    }
    if !build.loader.is_empty() {
        entry_point.loader.clone_from(&build.loader);
    }
    if let Some(workdir) = &build.workdir {
        entry_point.workdir = workdir.trim_matches('/').to_string();
    }

    Ok(BuildSpec {
        base,
        manifest,
        source,
        entry_point,
    })
}

/// Anchors relative local sources at `base_dir`; remote URIs pass through.
fn resolve_uri(uri: &str, base_dir: &Path) -> String {
    for scheme in ["file://", "tar://"] {
        if let Some(path) = uri.strip_prefix(scheme) {
            return format!("{scheme}{}", base_dir.join(path).display());
        }
    }
    if uri.contains("://") {
        uri.to_string()
    } else {
        base_dir.join(uri).display().to_string()
    }
}

/// Parses and validates `.berth` text into service definitions.
///
/// # Errors
///
/// Returns an error if the text fails to parse or validate.
pub fn parse_services(text: &str, base_dir: &Path) -> Result<Vec<ServiceDefinition>> {
    let file = crate::parser::parse_berth(text)?;
    file.services
        .iter()
        .map(|decl| ServiceDefinition::from_decl(decl, base_dir))
        .collect()
}

/// Loads service definitions from a `.berth` file.
///
/// Relative paths inside the file are resolved against its directory.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_services(path: &Path) -> Result<Vec<ServiceDefinition>> {
    tracing::debug!(path = %path.display(), "loading service definitions");
    let text = std::fs::read_to_string(path).map_err(|e| BerthError::io(path, e))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_services(&text, base_dir)
}

/// Picks a service by name, or the only service when `name` is absent.
///
/// # Errors
///
/// Returns `BerthError::NotFound` if no service matches, or a config error if
/// the choice is ambiguous.
pub fn select_service(
    services: Vec<ServiceDefinition>,
    name: Option<&str>,
) -> Result<ServiceDefinition> {
    match name {
        Some(name) => services
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| BerthError::NotFound {
                kind: "service",
                id: name.to_string(),
            }),
        None => {
            let mut iter = services.into_iter();
            match (iter.next(), iter.next()) {
                (Some(only), None) => Ok(only),
                (None, _) => Err(BerthError::Config {
                    message: "no SERVICE blocks defined".into(),
                }),
                (Some(_), Some(_)) => Err(BerthError::Config {
                    message: "several services defined; name one".into(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use berth_image::entrypoint::EntryPointMode;

    use super::*;

    #[test]
    fn restart_spec_parses_all_forms() {
        assert_eq!("always".parse::<RestartSpec>().expect("always"), RestartSpec::Always);
        assert_eq!("no".parse::<RestartSpec>().expect("no"), RestartSpec::No);
        assert_eq!(
            "on-failure:3".parse::<RestartSpec>().expect("bounded"),
            RestartSpec::OnFailure {
                max_retries: Some(3)
            }
        );
        assert_eq!(
            "unless-stopped".parse::<RestartSpec>().expect("unless"),
            RestartSpec::UnlessStopped
        );
        assert!("sometimes".parse::<RestartSpec>().is_err());
        assert!("on-failure:x".parse::<RestartSpec>().is_err());
        assert_eq!(RestartSpec::OnFailure { max_retries: Some(2) }.to_string(), "on-failure:2");
    }

    #[test]
    fn port_mapping_forms() {
        let m: PortMapping = "5000:5000".parse().expect("pair");
        assert_eq!(m, PortMapping::identity(5000));
        let m: PortMapping = "127.0.0.1:8086:5000/tcp".parse().expect("ip");
        assert_eq!(m.host_ip, Some("127.0.0.1".parse().expect("ip")));
        assert_eq!((m.host_port, m.container_port), (8086, 5000));
        let m: PortMapping = "[::1]:8080:5000".parse().expect("v6");
        assert_eq!(m.to_string(), "[::1]:8080:5000");
        assert_eq!("5000".parse::<PortMapping>().expect("single"), PortMapping::identity(5000));

        assert!("5000:5000/udp".parse::<PortMapping>().is_err());
        assert!("70000:5000".parse::<PortMapping>().is_err());
        assert!("host:80:5000".parse::<PortMapping>().is_err());
    }

    #[test]
    fn build_service_resolves_paths_and_entry_point() {
        let text = r#"SERVICE web {
    build = {
        base = "runtime.tar.gz"
        manifest = "requirements.txt"
        source = "file://src"
        factory = "app:create_app()"
    }
    network = "net0"
    env_file = ".env"
}"#;
        let defs = parse_services(text, Path::new("/srv/web")).expect("parse");
        let web = &defs[0];
        let ImageRef::Build(spec) = &web.image else {
            panic!("expected build image");
        };
        assert_eq!(spec.base, "/srv/web/runtime.tar.gz");
        assert_eq!(spec.source, "file:///srv/web/src");
        assert_eq!(spec.manifest, PathBuf::from("/srv/web/requirements.txt"));
        assert!(matches!(spec.entry_point.mode, EntryPointMode::Supervised { .. }));
        assert_eq!(web.port, 5000);
        assert_eq!(web.publish, vec![PortMapping::identity(5000)]);
        assert_eq!(web.network(), Some("net0"));
        assert_eq!(web.restart, RestartSpec::Always);
        assert_eq!(web.env_file, Some(PathBuf::from("/srv/web/.env")));
        assert_eq!(web.image_name(), "web");

        let request = web.build_request().expect("request");
        assert_eq!(request.name, "web");
        assert_eq!(request.exposed_port, 5000);
    }

    #[test]
    fn named_image_service_has_no_build_request() {
        let defs = parse_services(
            r#"SERVICE api { image = "images" restart = "on-failure:5" workers = 3 }"#,
            Path::new("."),
        )
        .expect("parse");
        assert_eq!(defs[0].image_name(), "images");
        assert!(defs[0].build_request().is_none());
        assert_eq!(defs[0].workers, Some(3));
    }

    #[test]
    fn load_services_reads_relative_to_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("service.berth");
        std::fs::write(&path, r#"SERVICE web { image = "web" env_file = "prod.env" }"#)
            .expect("write");
        let defs = load_services(&path).expect("load");
        assert_eq!(defs[0].env_file, Some(dir.path().join("prod.env")));
    }

    #[test]
    fn select_service_by_name_or_single() {
        let defs = parse_services(
            r#"SERVICE a { image = "a" } SERVICE b { image = "b" }"#,
            Path::new("."),
        )
        .expect("parse");
        assert_eq!(select_service(defs.clone(), Some("b")).expect("b").name, "b");
        assert!(select_service(defs.clone(), None).is_err());
        assert!(select_service(defs, Some("c")).is_err());
    }
}
