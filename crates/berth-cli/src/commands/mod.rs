//! CLI command definitions and dispatch.

pub mod build;
pub mod cache;
pub mod convert;
pub mod images;
pub mod logs;
pub mod networks;
pub mod ps;
pub mod run;
pub mod stop;

use std::path::{Path, PathBuf};

use anyhow::Context;
use berth_common::config::BerthConfig;
use berth_compose::service::{ServiceDefinition, load_services, select_service};
use berth_runtime::engine::Engine;
use clap::{Parser, Subcommand, ValueEnum};

/// berth — build and supervise Python web services without a daemon.
#[derive(Parser, Debug)]
#[command(name = "berth", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Data directory holding images, caches, state and logs.
    #[arg(long, global = true, env = berth_common::constants::DATA_DIR_ENV)]
    pub data_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build a service image from a .berth file.
    Build(build::BuildArgs),
    /// Start a service and supervise it in the foreground.
    Run(run::RunArgs),
    /// List running services.
    Ps(ps::PsArgs),
    /// Stop running services.
    Stop(stop::StopArgs),
    /// View service logs.
    Logs(logs::LogsArgs),
    /// Manage the local image catalog.
    Images(images::ImagesArgs),
    /// List the networks services can join.
    Networks(networks::NetworksArgs),
    /// Inspect or prune the dependency layer cache.
    Cache(cache::CacheArgs),
    /// Convert a docker-compose.yml to .berth format.
    Convert(convert::ConvertArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let data_dir = cli.data_dir;
    match cli.command {
        Command::Build(args) => build::execute(&open_engine(data_dir)?, &args),
        Command::Run(args) => run::execute(&open_engine(data_dir)?, &args),
        Command::Ps(args) => ps::execute(&open_engine(data_dir)?, &args),
        Command::Stop(args) => stop::execute(&open_engine(data_dir)?, &args),
        Command::Logs(args) => logs::execute(&open_engine(data_dir)?, &args),
        Command::Images(args) => images::execute(&open_engine(data_dir)?, &args),
        Command::Networks(args) => networks::execute(&open_engine(data_dir)?, &args),
        Command::Cache(args) => cache::execute(&open_engine(data_dir)?, &args),
        Command::Convert(args) => convert::execute(&args),
    }
}

fn open_engine(data_dir: Option<PathBuf>) -> anyhow::Result<Engine> {
    let data_dir = data_dir.unwrap_or_else(|| berth_common::constants::data_dir().clone());
    let config = BerthConfig::load_from_data_dir(&data_dir)
        .with_context(|| format!("loading configuration from {}", data_dir.display()))?;
    Ok(Engine::new(config)?)
}

/// Loads the named service, or the only one, from a .berth file.
fn load_service(file: &Path, service: Option<&str>) -> anyhow::Result<ServiceDefinition> {
    if !file.exists() {
        anyhow::bail!(
            "service file not found: {}\nCreate a .berth file or pass its path: berth run <file>",
            file.display()
        );
    }
    let services = load_services(file)?;
    Ok(select_service(services, service)?)
}
