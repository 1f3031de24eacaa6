//! `berth logs` — View service logs.

use std::io::{Read, Seek, SeekFrom};
use std::time::Duration;

use berth_runtime::engine::Engine;
use berth_runtime::logs::{log_path, tail};
use clap::Args;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Service name.
    pub service: String,

    /// Only show the last N lines.
    #[arg(short = 'n', long)]
    pub tail: Option<usize>,

    /// Follow log output.
    #[arg(short, long)]
    pub follow: bool,
}

/// Executes the `logs` command.
///
/// # Errors
///
/// Returns an error if the log file cannot be read.
pub fn execute(engine: &Engine, args: &LogsArgs) -> anyhow::Result<()> {
    let logs = engine.logs(&args.service)?;
    if logs.is_empty() && !args.follow {
        println!("No logs available for service: {}", args.service);
        return Ok(());
    }
    let shown = args.tail.map_or(logs.as_str(), |n| tail(&logs, n));
    print!("{shown}");

    if args.follow {
        follow(&log_path(engine.data_dir(), &args.service), logs.len() as u64)?;
    }
    Ok(())
}

fn follow(path: &std::path::Path, mut offset: u64) -> anyhow::Result<()> {
    loop {
        std::thread::sleep(Duration::from_millis(250));
        let Ok(mut file) = std::fs::File::open(path) else {
            continue;
        };
        let len = file.metadata()?.len();
        if len < offset {
            offset = 0;
        }
        if len == offset {
            continue;
        }
        let _ = file.seek(SeekFrom::Start(offset))?;
        let mut chunk = String::new();
        let _ = file.read_to_string(&mut chunk)?;
        offset = len;
        print!("{chunk}");
    }
}
