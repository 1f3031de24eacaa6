//! `berth ps` — List running services.

use berth_runtime::engine::Engine;
use clap::Args;

use crate::output::format_uptime;

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Print the state index as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `ps` command.
///
/// # Errors
///
/// Returns an error if the state index cannot be read.
pub fn execute(engine: &Engine, args: &PsArgs) -> anyhow::Result<()> {
    let services = engine.list()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&services)?);
        return Ok(());
    }
    if services.is_empty() {
        println!("No services running.");
        return Ok(());
    }

    println!(
        "{:<14} {:<15} {:<11} {:<8} {:<8} {:<22} {:<10}",
        "INSTANCE", "SERVICE", "STATE", "WORKERS", "PID", "ADDRESS", "UPTIME"
    );
    let now = chrono::Utc::now();
    for s in &services {
        println!(
            "{:<14} {:<15} {:<11} {:<8} {:<8} {:<22} {:<10}",
            s.instance.short(),
            s.service,
            s.state.to_string(),
            s.workers,
            s.pid,
            s.bind.to_string(),
            format_uptime(now - s.started_at)
        );
    }
    Ok(())
}
