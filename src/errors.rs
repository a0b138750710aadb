use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage a per-database failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Validation,
    Dump,
    Compress,
    Verify,
    Space,
    Publish,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Validation => "validation",
            StageKind::Dump => "dump",
            StageKind::Compress => "compress",
            StageKind::Verify => "verify",
            StageKind::Space => "space check",
            StageKind::Publish => "publish",
        };
        f.write_str(name)
    }
}

/// A recoverable failure scoped to one database.
#[derive(Error, Debug)]
#[error("{kind} failed: {detail}")]
pub struct StageError {
    pub kind: StageKind,
    pub detail: String,
}

impl StageError {
    pub fn new(kind: StageKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Aborts the whole run. Each variant carries its process exit code.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("Configuration error: {0:#}")]
    Config(anyhow::Error),

    #[error("Required tool not found: {0:#}")]
    MissingTool(anyhow::Error),

    #[error("No writable log destination: {0}")]
    LogDestination(String),

    #[error("Backup directory {path} is unusable: {source}")]
    BackupDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not create workspace under {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Insufficient free space on {path}: {available_kb} KB available, {required_kb} KB required")]
    InsufficientSpace {
        path: PathBuf,
        available_kb: u64,
        required_kb: u64,
    },

    #[error("Failed to enumerate databases: {0:#}")]
    Enumeration(anyhow::Error),
}

impl FatalError {
    pub fn exit_code(&self) -> u8 {
        match self {
            FatalError::Config(_)
            | FatalError::MissingTool(_)
            | FatalError::LogDestination(_)
            | FatalError::BackupDir { .. }
            | FatalError::Workspace { .. } => 2,
            FatalError::InsufficientSpace { .. } => 3,
            FatalError::Enumeration(_) => 4,
        }
    }
}
