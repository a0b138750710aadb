// pgbackup/src/utils/naming.rs
use regex::Regex;
use std::sync::OnceLock;

use crate::errors::{StageError, StageKind};

/// Why a database is left out of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionReason {
    /// `template0` / `template1`.
    Template,
    /// The `postgres` maintenance database.
    Maintenance,
}

impl ExclusionReason {
    pub fn describe(&self) -> &'static str {
        match self {
            ExclusionReason::Template => "template database",
            ExclusionReason::Maintenance => "maintenance database",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseClass {
    Eligible,
    Excluded(ExclusionReason),
}

fn system_database_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(template[01]|postgres)$").expect("system database pattern is a valid regex")
    })
}

/// Decides whether a database takes part in the run. Matching is exact and case sensitive.
pub fn classify(db_name: &str) -> DatabaseClass {
    if !system_database_pattern().is_match(db_name) {
        return DatabaseClass::Eligible;
    }
    if db_name == "postgres" {
        DatabaseClass::Excluded(ExclusionReason::Maintenance)
    } else {
        DatabaseClass::Excluded(ExclusionReason::Template)
    }
}

/// Maps a database name onto the `[A-Za-z0-9_.-]` alphabet.
///
/// Spaces and path separators become underscores first, everything else outside
/// the alphabet is dropped.
pub fn safe_name(raw_name: &str) -> String {
    raw_name
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' => '_',
            other => other,
        })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect()
}

/// `{safe_name}_{timestamp}`, rejecting names that sanitize to nothing usable.
pub fn artifact_base_name(raw_name: &str, timestamp: &str) -> Result<String, StageError> {
    let sanitized = safe_name(raw_name);
    if sanitized.chars().all(|c| c == '.') {
        return Err(StageError::new(
            StageKind::Validation,
            format!(
                "database name {:?} has no filesystem-safe characters",
                raw_name
            ),
        ));
    }
    Ok(format!("{}_{}", sanitized, timestamp))
}

pub fn published_file_name(base_name: &str) -> String {
    format!("{}.sql.gz", base_name)
}

/// Hidden sibling used while a publish is in flight.
pub fn hidden_file_name(file_name: &str) -> String {
    format!(".{}.partial", file_name)
}
