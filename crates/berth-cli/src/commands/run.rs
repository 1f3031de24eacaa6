//! `berth run` — Start a service and supervise it in the foreground.

use std::path::PathBuf;
use std::time::Instant;

use berth_common::types::ServiceState;
use berth_runtime::engine::{Engine, RunningService};
use clap::Args;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the .berth service file.
    #[arg(default_value = berth_common::constants::DEFAULT_SERVICE_FILE)]
    pub file: PathBuf,

    /// Service to run when the file defines several.
    #[arg(short, long)]
    pub service: Option<String>,

    /// Rebuild the image before starting.
    #[arg(long)]
    pub build: bool,

    /// Override the number of workers.
    #[arg(short, long)]
    pub workers: Option<usize>,
}

const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

/// Executes the `run` command.
///
/// # Errors
///
/// Returns an error if the build fails, the service cannot start, or the
/// worker pool fails while running.
pub fn execute(engine: &Engine, args: &RunArgs) -> anyhow::Result<()> {
    let total_start = Instant::now();
    let mut def = super::load_service(&args.file, args.service.as_deref())?;
    if args.workers.is_some() {
        def.workers = args.workers;
    }

    eprintln!();
    eprintln!("  {BOLD}berth{RESET} {DIM}v{}{RESET}", env!("CARGO_PKG_VERSION"));
    eprintln!();

    let missing = engine.catalog().get(def.image_name()).is_err();
    if def.build_request().is_some() && (args.build || missing) {
        super::build::build_and_report(engine, &def)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let running = engine.start(&def).await?;
        report_started(&running, total_start);
        let _ = tokio::spawn(report_transitions(running.subscribe(), running.name().to_string()));
        running.run_until(shutdown_signal()).await?;
        eprintln!("  {GREEN}Service stopped.{RESET}");
        Ok::<(), anyhow::Error>(())
    })
}

fn report_started(running: &RunningService, total_start: Instant) {
    eprintln!(
        "  {GREEN}{BOLD}Started {}{RESET} {DIM}[{}]{RESET} in {:.1}s",
        running.name(),
        running.instance().short(),
        total_start.elapsed().as_secs_f64()
    );
    eprintln!("    listening on {CYAN}{}{RESET}", running.bind_addr());
    for addr in running.published_addrs() {
        eprintln!("    published at {CYAN}{BOLD}http://{addr}{RESET}");
    }
    eprintln!();
    eprintln!("  Press {BOLD}Ctrl+C{RESET} to stop the service...");
}

async fn report_transitions(
    mut status: tokio::sync::watch::Receiver<berth_runtime::supervisor::ServiceStatus>,
    name: String,
) {
    let mut last = ServiceState::Starting;
    while status.changed().await.is_ok() {
        let snapshot = status.borrow_and_update().clone();
        if snapshot.state != last {
            last = snapshot.state;
            eprintln!(
                "  {DIM}{name}: {} ({} of {} workers running, {} restarts){RESET}",
                snapshot.state,
                snapshot.running_workers(),
                snapshot.workers.len(),
                snapshot.restarts
            );
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                let _ = sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    eprintln!();
    eprintln!("  Stopping service...");
}
