//! `berth convert` — Convert a docker-compose.yml to `.berth` format.

use std::path::PathBuf;

use berth_compose::compose_import::{ConvertOptions, convert_file};
use clap::Args;

/// Arguments for the `convert` subcommand.
#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// Path to the docker-compose.yml file.
    #[arg(default_value = "docker-compose.yml")]
    pub file: PathBuf,

    /// Write output to a file instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Base runtime source for services built from a context.
    #[arg(long)]
    pub base: Option<String>,

    /// Factory used when a service command does not name one.
    #[arg(long)]
    pub factory: Option<String>,
}

/// Executes the `convert` command.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or written.
pub fn execute(args: &ConvertArgs) -> anyhow::Result<()> {
    let input = &args.file;
    tracing::info!(path = %input.display(), "converting docker-compose file");
    if !input.exists() {
        anyhow::bail!("file not found: {}", input.display());
    }

    let mut options = ConvertOptions::default();
    if let Some(base) = &args.base {
        options.base.clone_from(base);
    }
    if let Some(factory) = &args.factory {
        options.default_factory.clone_from(factory);
    }
    let berth_output = convert_file(input, &options)?;

    if let Some(out_path) = &args.output {
        std::fs::write(out_path, &berth_output)?;
        println!("Converted {} -> {}", input.display(), out_path.display());
        println!("Services: {}", berth_output.matches("SERVICE ").count());
    } else {
        print!("{berth_output}");
    }
    Ok(())
}
