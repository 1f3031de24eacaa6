//! `berth cache` — Inspect or prune the dependency layer cache.

use berth_runtime::engine::Engine;
use clap::Args;

use crate::output::format_bytes;

/// Arguments for the `cache` command.
#[derive(Args, Debug)]
pub struct CacheArgs {
    /// Remove entries no image refers to.
    #[arg(long)]
    pub prune: bool,
}

/// Executes the `cache` command.
///
/// # Errors
///
/// Returns an error if the cache cannot be read or pruned.
pub fn execute(engine: &Engine, args: &CacheArgs) -> anyhow::Result<()> {
    if args.prune {
        let removed = engine.prune_cache()?;
        println!("Pruned {} cache entr{}.", removed.len(), if removed.len() == 1 { "y" } else { "ies" });
        return Ok(());
    }

    let entries = engine.cache().entries()?;
    if entries.is_empty() {
        println!("Dependency cache is empty.");
        return Ok(());
    }
    println!("{:<14} {:<10} {:<10} {:<40}", "KEY", "SIZE", "PACKAGES", "PINS");
    for entry in &entries {
        println!(
            "{:<14} {:<10} {:<10} {:<40}",
            entry.key.short(),
            format_bytes(entry.layer.size_bytes),
            entry.packages.len(),
            entry.packages.join(" ")
        );
    }
    Ok(())
}
