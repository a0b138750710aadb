pub mod logging;
pub mod naming;
pub mod storage;

use anyhow::{Context, Result};
use std::path::PathBuf;
use which::which;

/// Finds a PostgreSQL client executable in the system PATH.
pub fn find_client_executable(name: &str) -> Result<PathBuf> {
    which(name).with_context(|| {
        format!(
            "{} executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.",
            name
        )
    })
}
