//! PostgreSQL Backup Tool
//!
//! Dumps every database on a server into a verified, atomically published `.sql.gz` file

// pgbackup/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

use clap::Parser;
use config::{AppConfig, CliOverrides, DEFAULT_CONFIG_FILE, load_backup_config};
use errors::FatalError;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use utils::logging::{FALLBACK_LOG_FILE, init_logging, resolve_log_destination};

/// Exit status when the run is stopped by SIGINT or SIGTERM.
const INTERRUPTED_EXIT_CODE: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "pgbackup")]
#[command(about = "Back up every database on a PostgreSQL server into compressed, verified dumps")]
struct Args {
    /// Path to config.json (optional when the default file is absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory that receives the finished backups
    #[arg(long)]
    backup_dir: Option<PathBuf>,

    /// Preferred log file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Root under which the per-run workspace is created
    #[arg(long)]
    temp_dir: Option<PathBuf>,
}

fn load_app_config(args: &Args) -> Result<AppConfig, FatalError> {
    let (config_path, required) = match &args.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    let mut app_config =
        AppConfig::load_from_json(&config_path, required).map_err(FatalError::Config)?;
    app_config.apply_overrides(&CliOverrides {
        backup_dir: args.backup_dir.clone(),
        log_file: args.log_file.clone(),
        temp_dir: args.temp_dir.clone(),
    });
    Ok(app_config)
}

/// Resolves once SIGINT or SIGTERM arrives.
async fn interrupted() -> &'static str {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

/// Main entry point for the backup tool
fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("❌ Error: failed to start async runtime: {}", e);
            return ExitCode::from(2);
        }
    };
    let code = runtime.block_on(run_app(args));
    // A codec call still running on the blocking pool after an interrupt must not hold up exit.
    runtime.shutdown_background();
    code
}

async fn run_app(args: Args) -> ExitCode {

    let app_config = match load_app_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Error: {}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let destination =
        match resolve_log_destination(&app_config.log_file(), Path::new(FALLBACK_LOG_FILE)) {
            Ok(destination) => destination,
            Err(e) => {
                eprintln!("❌ Error: {}", e);
                return ExitCode::from(e.exit_code());
            }
        };
    let log_path = destination.path.clone();
    let preferred_error = destination.preferred_error.clone();
    if let Err(e) = init_logging(destination) {
        eprintln!("❌ Error: {}", e);
        return ExitCode::from(e.exit_code());
    }
    if let Some(reason) = preferred_error {
        warn!("Preferred log destination unusable ({}), logging to {}", reason, log_path.display());
    }

    let backup_config = match load_backup_config(&app_config.raw_json_config) {
        Ok(config) => config,
        Err(e) => {
            let fatal = FatalError::Config(e);
            error!("{}", fatal);
            return ExitCode::from(fatal.exit_code());
        }
    };
    info!(
        "Backing up to {} (workspace root {})",
        backup_config.local_backup_path.display(),
        backup_config.temp_dump_root.display()
    );

    tokio::select! {
        result = backup::run_backup_flow(&backup_config) => match result {
            Ok(summary) => {
                if summary.failed > 0 {
                    error!(
                        "Backup run {} completed with failures: {} succeeded, {} failed",
                        summary.run_id, summary.succeeded, summary.failed
                    );
                } else {
                    info!(
                        "🎉 Backup run {} completed: {} database(s) backed up",
                        summary.run_id, summary.succeeded
                    );
                }
                info!(
                    "{} file(s) stamped {} published to {}",
                    summary.published.len(),
                    summary.timestamp,
                    backup_config.local_backup_path.display()
                );
                for path in &summary.published {
                    debug!("Published {}", path.display());
                }
                debug!("Workspace {} released", summary.workspace.display());
                ExitCode::from(summary.exit_code())
            }
            Err(e) => {
                error!("Backup aborted: {}", e);
                ExitCode::from(e.exit_code())
            }
        },
        signal = interrupted() => {
            warn!("Received {}, aborting backup run", signal);
            ExitCode::from(INTERRUPTED_EXIT_CODE)
        }
    }
}
