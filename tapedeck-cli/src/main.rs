//! TapeDeck CLI — start and control a session run.
//!
//! Commands:
//! - `start <config.toml>` — run the configured session(s). While running,
//!   the process accepts control commands on stdin: `pause`, `resume`,
//!   `status`, `stop`.
//! - `check <config.toml>` — validate a config and print its run id.
//!
//! Failures exit non-zero with a one-line diagnostic named by the error
//! taxonomy; detail goes to the structured log (`RUST_LOG` controls level).

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tapedeck_core::calendar::TradingCalendar;
use tapedeck_runner::{CsvRepository, Session, SessionConfig, SessionHandle};

#[derive(Parser)]
#[command(name = "tapedeck", about = "Equities session orchestrator", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a session from a TOML config.
    Start {
        /// Path to the session config.
        config: PathBuf,
        /// Root directory of the CSV bar repository.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Where to write the end-of-run JSON report.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Validate a config without running it.
    Check {
        /// Path to the session config.
        config: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let exit = match cli.command {
        Command::Start { config, data_dir, report } => start(config, data_dir, report),
        Command::Check { config } => check(config),
    };
    std::process::exit(exit);
}

fn check(config_path: PathBuf) -> i32 {
    match SessionConfig::load(&config_path) {
        Ok(config) => {
            println!("ok: {} ({})", config.session_name, &config.run_id()[..12]);
            0
        }
        Err(e) => {
            eprintln!("ConfigError: {e}");
            1
        }
    }
}

fn start(config_path: PathBuf, data_dir: PathBuf, report_path: Option<PathBuf>) -> i32 {
    let config = match SessionConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ConfigError: {e}");
            return 1;
        }
    };

    let repository = Arc::new(CsvRepository::new(data_dir));
    let calendar = Arc::new(TradingCalendar::us_equities());
    let session = match Session::new(config, repository, calendar) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("{}: {e}", e.taxonomy());
            return 1;
        }
    };

    let handle = session.handle();
    spawn_control_loop(handle);

    match session.run() {
        Ok(summary) => {
            info!(
                sessions = summary.sessions.len(),
                run_id = %&summary.run_id[..12],
                "run finished"
            );
            if let Some(path) = report_path {
                match serde_json::to_string_pretty(&summary) {
                    Ok(json) => {
                        if let Err(e) = std::fs::write(&path, json) {
                            error!(path = %path.display(), error = %e, "report write failed");
                            return 1;
                        }
                        info!(path = %path.display(), "report written");
                    }
                    Err(e) => {
                        error!(error = %e, "report serialization failed");
                        return 1;
                    }
                }
            }
            0
        }
        Err(e) => {
            eprintln!("{}: {e}", e.taxonomy());
            1
        }
    }
}

/// Control-plane thread: one command per stdin line. Exits with the process
/// (daemon read on a closed stdin just ends the loop).
fn spawn_control_loop(handle: SessionHandle) {
    std::thread::Builder::new()
        .name("tapedeck-control".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match line.trim() {
                    "pause" => handle.pause(),
                    "resume" => handle.resume(),
                    "stop" => {
                        handle.stop();
                        break;
                    }
                    "status" => {
                        let status = handle.status();
                        println!(
                            "phase={:?} date={} now={} active={} symbols={}",
                            status.phase,
                            status.session_date,
                            status.virtual_now,
                            status.active,
                            status.symbol_count
                        );
                    }
                    "" => {}
                    other => eprintln!("unknown command: {other} (pause|resume|status|stop)"),
                }
            }
        })
        .expect("spawn control thread");
}
