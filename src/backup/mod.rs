pub(crate) mod archive;  // gzip codec, compress and integrity stages
pub(crate) mod db_dump;  // pg_dump invocation and database enumeration
mod logic;
pub(crate) mod publish;  // two-step rename into the backup directory

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::BackupConfig;
use crate::errors::FatalError;
use crate::utils::storage::FsProbe;
use archive::GzipCodec;
use db_dump::{PgCatalog, PgDumpProducer};

pub use logic::RunSummary;

/// Pipeline position of a staged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStage {
    Raw,
    Compressed,
    Final,
}

/// One database's backup file at a given stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub database: String,
    pub stage: ArtifactStage,
    pub path: PathBuf,
}

impl Artifact {
    pub fn new(database: impl Into<String>, stage: ArtifactStage, path: PathBuf) -> Self {
        Self {
            database: database.into(),
            stage,
            path,
        }
    }
}

/// Public entry point for the backup process.
/// Wires the PostgreSQL, gzip and filesystem collaborators into the orchestrator.
pub async fn run_backup_flow(backup_config: &BackupConfig) -> Result<RunSummary, FatalError> {
    let producer = PgDumpProducer::locate(&backup_config.source_db_url)
        .map_err(FatalError::MissingTool)?;
    let catalog = PgCatalog::new(&backup_config.source_db_url).map_err(FatalError::Config)?;
    let probe = FsProbe;

    let collaborators = logic::Collaborators {
        catalog: &catalog,
        producer: &producer,
        codec: Arc::new(GzipCodec::new(backup_config.compression_level)),
        probe: &probe,
    };
    logic::perform_backup_orchestration(backup_config, &collaborators).await
}
