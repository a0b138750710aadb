// pgbackup/src/utils/logging.rs
use chrono::Local;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::errors::FatalError;

pub const DEFAULT_LOG_FILE: &str = "/var/log/pg_backup.log";
pub const FALLBACK_LOG_FILE: &str = "./pg_backup.log";

/// `{timestamp} [{LEVEL}] {message}`, one line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "{} [{}] ",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// The append-only file log records go to.
#[derive(Debug)]
pub struct LogDestination {
    pub path: PathBuf,
    pub file: File,
    /// Set when the preferred path was unusable.
    pub preferred_error: Option<String>,
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Opens `preferred` for appending, or `fallback` when that fails.
pub fn resolve_log_destination(
    preferred: &Path,
    fallback: &Path,
) -> Result<LogDestination, FatalError> {
    let preferred_err = match open_append(preferred) {
        Ok(file) => {
            return Ok(LogDestination {
                path: preferred.to_path_buf(),
                file,
                preferred_error: None,
            });
        }
        Err(e) => e,
    };

    match open_append(fallback) {
        Ok(file) => Ok(LogDestination {
            path: fallback.to_path_buf(),
            file,
            preferred_error: Some(format!("{}: {}", preferred.display(), preferred_err)),
        }),
        Err(fallback_err) => Err(FatalError::LogDestination(format!(
            "{}: {}; {}: {}",
            preferred.display(),
            preferred_err,
            fallback.display(),
            fallback_err
        ))),
    }
}

/// Installs the global subscriber: the log file plus a stderr mirror.
pub fn init_logging(destination: LogDestination) -> Result<(), FatalError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(LineFormat)
                .with_ansi(false)
                .with_writer(Mutex::new(destination.file)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(LineFormat)
                .with_ansi(false)
                .with_writer(io::stderr),
        )
        .try_init()
        .map_err(|e| FatalError::LogDestination(e.to_string()))
}
