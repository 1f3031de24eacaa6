//! `berth build` — Build a service image from a .berth file.

use std::path::PathBuf;
use std::time::Instant;

use berth_compose::service::ServiceDefinition;
use berth_runtime::engine::Engine;
use clap::Args;

use crate::output::format_bytes;

/// Arguments for the `build` command.
#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Path to the .berth service file.
    #[arg(default_value = berth_common::constants::DEFAULT_SERVICE_FILE)]
    pub file: PathBuf,

    /// Service to build when the file defines several.
    #[arg(short, long)]
    pub service: Option<String>,
}

/// Executes the `build` command.
///
/// # Errors
///
/// Returns an error if parsing or image building fails.
pub fn execute(engine: &Engine, args: &BuildArgs) -> anyhow::Result<()> {
    let def = super::load_service(&args.file, args.service.as_deref())?;
    build_and_report(engine, &def)
}

/// Builds the service image and prints a summary.
pub(crate) fn build_and_report(engine: &Engine, def: &ServiceDefinition) -> anyhow::Result<()> {
    let started = Instant::now();
    eprintln!("  Building {}...", def.name);
    let report = engine.build(def)?;
    let image = &report.image;
    let cache = if report.dependency_cache_hit {
        "dependency layer reused"
    } else {
        "dependency layer built"
    };
    eprintln!(
        "  Built {} [{}] {} in {:.1}s ({cache})",
        image.name,
        image.id.short(),
        format_bytes(image.size_bytes()),
        started.elapsed().as_secs_f64()
    );
    if let Some(old) = report.replaced {
        eprintln!("  Replaced image {}", old.id.short());
    }
    Ok(())
}
