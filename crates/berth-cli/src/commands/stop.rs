//! `berth stop` — Stop running services.

use berth_runtime::engine::Engine;
use clap::Args;

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Service names or instance ids to stop. If empty, stops all.
    pub services: Vec<String>,
}

/// Executes the `stop` command.
///
/// Signals each supervising process; it stops its workers, unpublishes the
/// ports and leaves its networks before exiting.
///
/// # Errors
///
/// Returns an error if a named service is not running.
pub fn execute(engine: &Engine, args: &StopArgs) -> anyhow::Result<()> {
    let targets: Vec<String> = if args.services.is_empty() {
        engine.list()?.into_iter().map(|s| s.instance.to_string()).collect()
    } else {
        args.services.clone()
    };
    if targets.is_empty() {
        println!("No services running.");
        return Ok(());
    }
    for target in &targets {
        let entry = engine.stop(target)?;
        println!("Stopping {} [{}]", entry.service, entry.instance.short());
    }
    Ok(())
}
