// pgbackup/src/backup/logic.rs
use chrono::{DateTime, Local};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{Builder as TempFileBuilder, TempDir};
use tracing::{debug, error, info, warn};

use super::archive::{compress_stage, verify_stage, Codec};
use super::db_dump::{dump_stage, DatabaseCatalog, DumpProducer};
use super::publish::publish;
use crate::config::BackupConfig;
use crate::errors::{FatalError, StageError, StageKind};
use crate::utils::naming::{artifact_base_name, classify, published_file_name, DatabaseClass};
use crate::utils::storage::{ensure_backup_dir, remove_quietly, StorageProbe, KB_PER_MB};

/// External capabilities the run is driven through.
pub struct Collaborators<'a> {
    pub catalog: &'a dyn DatabaseCatalog,
    pub producer: &'a dyn DumpProducer,
    pub codec: Arc<dyn Codec>,
    pub probe: &'a dyn StorageProbe,
}

/// Where a single database currently is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Dumping,
    Compressing,
    Verifying,
    SpaceChecking,
    Publishing,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Dumping => "dumping",
            PipelineState::Compressing => "compressing",
            PipelineState::Verifying => "verifying",
            PipelineState::SpaceChecking => "space checking",
            PipelineState::Publishing => "publishing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeTally {
    pub succeeded: usize,
    pub failed: usize,
}

impl OutcomeTally {
    fn record(&mut self, outcome: &Result<PathBuf, StageError>) {
        match outcome {
            Ok(_) => self.succeeded += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// What a finished run reports back to the caller.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub timestamp: String,
    pub workspace: PathBuf,
    pub succeeded: usize,
    pub failed: usize,
    pub published: Vec<PathBuf>,
}

impl RunSummary {
    /// 0 when every attempted database was published, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.failed > 0 { 1 } else { 0 }
    }
}

/// State of one run. Owns the workspace; dropping the context removes it.
struct RunContext {
    run_id: String,
    started_at: DateTime<Local>,
    timestamp: String,
    workspace: TempDir,
    backup_dir: PathBuf,
    per_db_min_kb: u64,
    tally: OutcomeTally,
    published: Vec<PathBuf>,
}

impl RunContext {
    fn acquire(backup_config: &BackupConfig) -> Result<Self, FatalError> {
        let started_at = Local::now();
        let timestamp = started_at.format("%Y%m%d_%H%M%S").to_string();
        let run_id = format!("{}_{}", std::process::id(), timestamp);

        let root = &backup_config.temp_dump_root;
        let workspace = fs::create_dir_all(root)
            .and_then(|_| {
                TempFileBuilder::new()
                    .prefix(&format!("pg_backup_{}_", run_id))
                    .tempdir_in(root)
            })
            .map_err(|source| FatalError::Workspace {
                path: root.clone(),
                source,
            })?;
        info!("📂 Workspace created at: {}", workspace.path().display());

        Ok(Self {
            run_id,
            started_at,
            timestamp,
            workspace,
            backup_dir: backup_config.local_backup_path.clone(),
            per_db_min_kb: backup_config.min_free_space_per_db_mb.saturating_mul(KB_PER_MB),
            tally: OutcomeTally::default(),
            published: Vec::new(),
        })
    }

    fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    /// Removes the workspace and reports the run.
    fn finish(self) -> RunSummary {
        let workspace = self.workspace.path().to_path_buf();
        match self.workspace.close() {
            Ok(()) => debug!("Workspace {} removed", workspace.display()),
            Err(e) => warn!("Could not fully remove workspace {}: {}", workspace.display(), e),
        }

        let elapsed = Local::now().signed_duration_since(self.started_at);
        info!(
            "Run {} finished in {}s: {} succeeded, {} failed",
            self.run_id,
            elapsed.num_seconds(),
            self.tally.succeeded,
            self.tally.failed
        );

        RunSummary {
            run_id: self.run_id,
            timestamp: self.timestamp,
            workspace,
            succeeded: self.tally.succeeded,
            failed: self.tally.failed,
            published: self.published,
        }
    }
}

fn require_space(
    probe: &dyn StorageProbe,
    path: &Path,
    required_kb: u64,
) -> Result<(), FatalError> {
    let available_kb = probe.free_space_kb(path);
    debug!("{} KB free on {}", available_kb, path.display());
    if available_kb < required_kb {
        return Err(FatalError::InsufficientSpace {
            path: path.to_path_buf(),
            available_kb,
            required_kb,
        });
    }
    Ok(())
}

fn enter(db_name: &str, state: PipelineState) {
    debug!("{}: {}", db_name, state);
}

/// Drives one database from dump to publish. Each stage cleans up after itself on failure.
async fn process_database(
    ctx: &RunContext,
    deps: &Collaborators<'_>,
    db_name: &str,
) -> Result<PathBuf, StageError> {
    let base_name = artifact_base_name(db_name, &ctx.timestamp)?;

    enter(db_name, PipelineState::Dumping);
    let raw = dump_stage(deps.producer, ctx.workspace(), db_name, &base_name).await?;

    enter(db_name, PipelineState::Compressing);
    let compressed = compress_stage(&deps.codec, raw).await?;

    enter(db_name, PipelineState::Verifying);
    let verified = verify_stage(&deps.codec, compressed).await?;

    enter(db_name, PipelineState::SpaceChecking);
    let available_kb = deps.probe.free_space_kb(&ctx.backup_dir);
    if available_kb < ctx.per_db_min_kb {
        remove_quietly(&verified.path);
        return Err(StageError::new(
            StageKind::Space,
            format!(
                "{} KB free in {}, {} KB required",
                available_kb,
                ctx.backup_dir.display(),
                ctx.per_db_min_kb
            ),
        ));
    }

    enter(db_name, PipelineState::Publishing);
    let final_path = ctx.backup_dir.join(published_file_name(&base_name));
    let published = publish(verified, &final_path)?;
    Ok(published.path)
}

/// Checks run preconditions, then backs up every eligible database in turn.
///
/// Only precondition failures are returned as errors; per-database failures end up
/// in the summary's tally.
pub async fn perform_backup_orchestration(
    backup_config: &BackupConfig,
    deps: &Collaborators<'_>,
) -> Result<RunSummary, FatalError> {
    let backup_dir = &backup_config.local_backup_path;
    ensure_backup_dir(backup_dir).map_err(|source| FatalError::BackupDir {
        path: backup_dir.clone(),
        source,
    })?;

    let mut ctx = RunContext::acquire(backup_config)?;
    info!("🚀 Starting backup run {}", ctx.run_id);

    let startup_min_kb = backup_config.min_free_space_mb.saturating_mul(KB_PER_MB);
    require_space(deps.probe, ctx.workspace(), startup_min_kb)?;
    require_space(deps.probe, backup_dir, startup_min_kb)?;

    let databases = match &backup_config.databases_to_backup {
        Some(dbs) => {
            info!("Using database_list from configuration: {:?}", dbs);
            dbs.clone()
        }
        None => deps
            .catalog
            .list_databases()
            .await
            .map_err(FatalError::Enumeration)?,
    };

    let mut attempted = 0usize;
    for db_name in &databases {
        if let DatabaseClass::Excluded(reason) = classify(db_name) {
            info!("Skipping {}: {}", reason.describe(), db_name);
            continue;
        }
        attempted += 1;

        info!("🔍 Backing up database: {}", db_name);
        let outcome = process_database(&ctx, deps, db_name).await;
        ctx.tally.record(&outcome);
        match outcome {
            Ok(path) => {
                info!("✅ Backup of {} succeeded: {}", db_name, path.display());
                ctx.published.push(path);
            }
            Err(e) => error!("❌ Backup of {} failed during {}: {}", db_name, e.kind, e.detail),
        }
    }

    if attempted == 0 {
        warn!("No eligible databases found; nothing was backed up");
    }

    Ok(ctx.finish())
}
