//! Conversion of `docker-compose.yml` services into `.berth` definitions.
//!
//! Only what maps onto a berth service is carried over: the build context,
//! published ports, external networks, restart policy, env files and inline
//! environment. Networks must be declared `external: true`, since berth only
//! joins networks that already exist.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;

use berth_common::constants::DEFAULT_CONTAINER_PORT;
use berth_common::error::{BerthError, Result};
use serde::Deserialize;

use crate::service::{PortMapping, RestartSpec};

/// Options that docker-compose files cannot express.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Base runtime source for built services.
    pub base: String,
    /// Manifest file name inside the build context.
    pub manifest: String,
    /// Factory used when the command does not reveal one.
    pub default_factory: String,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            base: "file:///opt/berth/runtimes/python3".into(),
            manifest: "requirements.txt".into(),
            default_factory: "app:create_app".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ComposeFile {
    #[serde(default)]
    services: BTreeMap<String, ComposeService>,
    #[serde(default)]
    networks: BTreeMap<String, Option<ComposeNetwork>>,
}

#[derive(Debug, Default, Deserialize)]
struct ComposeService {
    image: Option<String>,
    build: Option<BuildField>,
    command: Option<StringOrList>,
    #[serde(default)]
    ports: Vec<PortField>,
    networks: Option<NetworksField>,
    restart: Option<String>,
    env_file: Option<StringOrList>,
    environment: Option<EnvironmentField>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BuildField {
    Context(String),
    Detailed { context: Option<String> },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }

    fn words(self) -> Vec<String> {
        match self {
            Self::One(s) => s.split_whitespace().map(ToString::to_string).collect(),
            Self::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortField {
    Number(u16),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NetworksField {
    List(Vec<String>),
    Map(BTreeMap<String, Option<serde_yaml::Value>>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EnvironmentField {
    List(Vec<String>),
    Map(BTreeMap<String, Option<serde_yaml::Value>>),
}

#[derive(Debug, Default, Deserialize)]
struct ComposeNetwork {
    #[serde(default)]
    external: Option<serde_yaml::Value>,
    name: Option<String>,
}

impl ComposeNetwork {
    fn is_external(&self) -> bool {
        match &self.external {
            Some(serde_yaml::Value::Bool(b)) => *b,
            Some(serde_yaml::Value::Mapping(_)) => true,
            _ => false,
        }
    }
}

/// Converts docker-compose YAML text into `.berth` text.
///
/// # Errors
///
/// Returns an error if the YAML is invalid, a service uses a non-external
/// network, or a value has no berth equivalent.
pub fn convert_compose(yaml: &str, options: &ConvertOptions) -> Result<String> {
    let file: ComposeFile = serde_yaml::from_str(yaml).map_err(|e| BerthError::Config {
        message: format!("invalid docker-compose file: {e}"),
    })?;
    if file.services.is_empty() {
        return Err(BerthError::Config {
            message: "docker-compose file defines no services".into(),
        });
    }

    let mut out = String::from("# Converted from docker-compose by berth convert\n");
    for (name, service) in file.services {
        tracing::debug!(service = %name, "converting service");
        out.push('\n');
        render_service(&mut out, &name, service, &file.networks, options)?;
    }
    Ok(out)
}

/// Converts a docker-compose file into `.berth` text.
///
/// # Errors
///
/// Returns an error if the file cannot be read or converted.
pub fn convert_file(path: &Path, options: &ConvertOptions) -> Result<String> {
    let yaml = std::fs::read_to_string(path).map_err(|e| BerthError::io(path, e))?;
    convert_compose(&yaml, options)
}

fn render_service(
    out: &mut String,
    name: &str,
    service: ComposeService,
    declared: &BTreeMap<String, Option<ComposeNetwork>>,
    options: &ConvertOptions,
) -> Result<()> {
    let svc_err = |message: String| BerthError::Config {
        message: format!("service \"{name}\": {message}"),
    };
    let ident = sanitize_identifier(name);
    let _ = writeln!(out, "SERVICE {ident} {{");

    let command = service.command.map(StringOrList::words);
    match (service.build, service.image) {
        (Some(build), _) => {
            let context = match build {
                BuildField::Context(c) => c,
                BuildField::Detailed { context } => context.unwrap_or_else(|| ".".into()),
            };
            let _ = writeln!(out, "    build = {{");
            let _ = writeln!(out, "        base = {}", quote(&options.base));
            let manifest = Path::new(&context).join(&options.manifest);
            let _ = writeln!(out, "        manifest = {}", quote(&manifest.display().to_string()));
            let _ = writeln!(out, "        source = {}", quote(&context));
            match command.as_deref().and_then(script_in) {
                Some(script) => {
                    let _ = writeln!(out, "        script = {}", quote(&script));
                }
                None => {
                    let factory = command
                        .as_deref()
                        .and_then(factory_in)
                        .unwrap_or_else(|| options.default_factory.clone());
                    let _ = writeln!(out, "        factory = {}", quote(&factory));
                }
            }
            let _ = writeln!(out, "    }}");
        }
        (None, Some(image)) => {
            let _ = writeln!(out, "    image = {}", quote(&image));
            if let Some(cmd) = &command {
                let _ = writeln!(out, "    command = {}", list(cmd));
            }
        }
        (None, None) => return Err(svc_err("has neither build nor image".into())),
    }

    let mut publish = Vec::new();
    for port in service.ports {
        let text = match port {
            PortField::Number(n) => n.to_string(),
            PortField::Text(t) => t,
        };
        let mapping: PortMapping = text.parse()?;
        publish.push(mapping);
    }
    let container_port = publish
        .first()
        .map_or(DEFAULT_CONTAINER_PORT, |m| m.container_port);
    if publish.iter().any(|m| m.container_port != container_port) {
        return Err(svc_err("publishes more than one container port".into()));
    }
    let _ = writeln!(out, "    port = {container_port}");
    if !publish.is_empty() {
        let items: Vec<String> = publish.iter().map(ToString::to_string).collect();
        let _ = writeln!(out, "    publish = {}", list(&items));
    }

    let networks = match service.networks {
        Some(NetworksField::List(list)) => list,
        Some(NetworksField::Map(map)) => map.into_keys().collect(),
        None => Vec::new(),
    };
    let mut resolved = Vec::with_capacity(networks.len());
    for network in networks {
        let decl = declared.get(&network).and_then(Option::as_ref);
        match decl {
            Some(d) if d.is_external() => {
                resolved.push(d.name.clone().unwrap_or(network));
            }
            _ => {
                return Err(svc_err(format!(
                    "network \"{network}\" must be declared with external: true"
                )));
            }
        }
    }
    match resolved.as_slice() {
        [] => {}
        [one] => {
            let _ = writeln!(out, "    network = {}", quote(one));
        }
        many => {
            let _ = writeln!(out, "    networks = {}", list(many));
        }
    }

    if let Some(restart) = service.restart {
        let spec: RestartSpec = restart.parse()?;
        let _ = writeln!(out, "    restart = {}", quote(&spec.to_string()));
    }

    if let Some(env_files) = service.env_file {
        let mut files = env_files.into_vec();
        if files.len() > 1 {
            tracing::warn!(service = %name, "only the first env_file is used");
        }
        if let Some(first) = files.drain(..).next() {
            let _ = writeln!(out, "    env_file = {}", quote(&first));
        }
    }

    let env = service.environment.map(environment_pairs).unwrap_or_default();
    if !env.is_empty() {
        let _ = writeln!(out, "    env = {{");
        for (key, value) in env {
            let _ = writeln!(out, "        {key} = {}", quote(&value));
        }
        let _ = writeln!(out, "    }}");
    }

    let _ = writeln!(out, "}}");
    Ok(())
}

fn environment_pairs(field: EnvironmentField) -> BTreeMap<String, String> {
    match field {
        EnvironmentField::List(items) => items
            .into_iter()
            .filter_map(|item| {
                item.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect(),
        EnvironmentField::Map(map) => map
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    Some(serde_yaml::Value::String(s)) => s,
                    Some(serde_yaml::Value::Number(n)) => n.to_string(),
                    Some(serde_yaml::Value::Bool(b)) => b.to_string(),
                    _ => String::new(),
                };
                (k, value)
            })
            .collect(),
    }
}

/// Finds a `module:callable` token, as passed to WSGI-style servers.
fn factory_in(command: &[String]) -> Option<String> {
    command
        .iter()
        .filter(|word| !word.starts_with('-') && !word.contains('/'))
        .find_map(|word| {
            word.trim_matches(|c| c == '"' || c == '\'')
                .parse::<berth_image::entrypoint::FactoryRef>()
                .ok()
                .map(|f| f.to_string())
        })
}

/// Finds a `*.py` script run directly by the interpreter.
fn script_in(command: &[String]) -> Option<String> {
    let (program, rest) = command.split_first()?;
    if !program.starts_with("python") {
        return None;
    }
    rest.iter().find(|w| w.ends_with(".py")).cloned()
}

fn sanitize_identifier(name: &str) -> String {
    let mut ident: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if !ident.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        ident.insert(0, '_');
    }
    ident
}

fn quote(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n");
    format!("\"{escaped}\"")
}

fn list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|i| quote(i)).collect();
    format!("[{}]", quoted.join(", "))
}
