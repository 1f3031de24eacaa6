//! `berth networks` — List the networks services can join.

use berth_runtime::engine::Engine;
use clap::Args;

/// Arguments for the `networks` command.
#[derive(Args, Debug)]
pub struct NetworksArgs {
    /// Also list the services joined to each network.
    #[arg(short, long)]
    pub members: bool,
}

/// Executes the `networks` command.
///
/// # Errors
///
/// Returns an error if the catalog or membership files cannot be read.
pub fn execute(engine: &Engine, args: &NetworksArgs) -> anyhow::Result<()> {
    let catalog = engine.networks();
    let networks = catalog.list()?;
    if networks.is_empty() {
        println!("No networks declared in {}.", catalog.catalog_path().display());
        return Ok(());
    }
    println!("{:<20} {:<16} {:<10} {:<8}", "NAME", "ADDRESS", "DRIVER", "MEMBERS");
    for network in &networks {
        let members = catalog.members(&network.name)?;
        println!(
            "{:<20} {:<16} {:<10} {:<8}",
            network.name,
            network.address.to_string(),
            network.driver,
            members.len()
        );
        if args.members {
            for m in &members {
                println!("  - {} [{}] {}", m.service, m.instance.short(), m.address);
            }
        }
    }
    Ok(())
}
