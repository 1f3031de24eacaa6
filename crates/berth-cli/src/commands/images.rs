//! `berth images` — Manage the local image catalog.

use berth_runtime::engine::Engine;
use clap::Args;

use crate::output::format_bytes;

/// Arguments for the `images` command.
#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Remove an image by name or id.
    #[arg(long)]
    pub remove: Option<String>,
}

/// Executes the `images` command.
///
/// # Errors
///
/// Returns an error if catalog operations fail.
pub fn execute(engine: &Engine, args: &ImagesArgs) -> anyhow::Result<()> {
    if let Some(reference) = &args.remove {
        let image = engine.remove_image(reference)?;
        println!("Removed {} [{}]", image.name, image.id.short());
        return Ok(());
    }

    let images = engine.catalog().list()?;
    if images.is_empty() {
        println!("No images.");
        return Ok(());
    }
    println!(
        "{:<14} {:<20} {:<8} {:<12} {:<28} {:<20}",
        "IMAGE ID", "NAME", "LAYERS", "SIZE", "ENTRY POINT", "CREATED"
    );
    for image in &images {
        println!(
            "{:<14} {:<20} {:<8} {:<12} {:<28} {:<20}",
            image.id.short(),
            image.name,
            image.config.layers.len(),
            format_bytes(image.size_bytes()),
            image.config.entry_point.to_string(),
            image.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
