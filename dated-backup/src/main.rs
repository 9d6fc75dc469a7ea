//! Dated Backup - Main entry point
//!
//! One invocation performs one run: snapshot, upload, prune. Scheduling is
//! left to cron or a systemd timer.

use anyhow::Result;
use clap::Parser;
use dated_backup::daemon::shutdown::ShutdownCoordinator;
use dated_backup::orchestrator::report::{EXIT_CONFIG, EXIT_SUCCESS};
use dated_backup::orchestrator::{exit_code, RunOutcome};
use dated_backup::transfer::progress::format_bytes;
use dated_backup::{utils, BackupOrchestrator, Config};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration and list expired local generations, changing nothing
    #[arg(long)]
    dry_run: bool,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    // Initialize logging
    if let Err(e) = utils::logger::init(&config.log, args.log_level.as_deref()) {
        eprintln!("Failed to initialize logging: {:#}", e);
        std::process::exit(EXIT_CONFIG);
    }

    tracing::info!(
        "Starting dated-backup v{} (config: {})",
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );

    let shutdown_coordinator = ShutdownCoordinator::new();
    let orchestrator = BackupOrchestrator::from_config(config, shutdown_coordinator.token());

    if args.dry_run {
        let code = match orchestrator.plan().await {
            Ok(plan) => {
                if args.json {
                    println!("{}", serde_json::to_string_pretty(&plan)?);
                } else {
                    println!(
                        "Generation for this run: {} ({})",
                        plan.generation,
                        format_bytes(plan.source_bytes)
                    );
                    if plan.local_expired.is_empty() {
                        println!("No local generations would be pruned");
                    }
                    for id in &plan.local_expired {
                        println!("Would prune local generation {}", id);
                    }
                }
                EXIT_SUCCESS
            }
            Err(e) => {
                tracing::error!(error = %e, "Dry run failed");
                EXIT_CONFIG
            }
        };
        std::process::exit(code);
    }

    // Signals cancel the run; it stops at its next checkpoint
    let signal_handle = tokio::spawn(async move {
        shutdown_coordinator.wait_for_signal().await;
    });

    let outcome = orchestrator.run().await;
    signal_handle.abort();

    if args.json {
        print_json(&outcome)?;
    }

    std::process::exit(exit_code(&outcome));
}

fn print_json(outcome: &RunOutcome) -> Result<()> {
    let value = match outcome {
        Ok(report) => serde_json::json!({
            "status": report.status(),
            "report": report,
        }),
        Err(failure) => serde_json::json!({
            "status": "failed",
            "stage": failure.stage,
            "error": failure.cause.to_string(),
        }),
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
