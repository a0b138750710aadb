// pgbackup/src/backup/db_dump.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Connection, PgConnection, Row};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{Artifact, ArtifactStage};
use crate::errors::{StageError, StageKind};
use crate::utils::find_client_executable;
use crate::utils::storage::remove_quietly;

/// Lists the databases present on the source server.
#[async_trait]
pub trait DatabaseCatalog: Send + Sync {
    async fn list_databases(&self) -> Result<Vec<String>>;
}

/// Produces a logical SQL dump of one database.
#[async_trait]
pub trait DumpProducer: Send + Sync {
    /// Writes the dump to `raw_path` and diagnostics to `diagnostics_path`.
    /// Returns whether the producer terminated normally.
    async fn dump(&self, db_name: &str, raw_path: &Path, diagnostics_path: &Path) -> io::Result<bool>;
}

/// Database URL whose single path segment is `db_name`, escaped so `%` and `/` stay literal.
fn database_url(base_url: &Url, db_name: &str) -> Result<Url> {
    let mut url = base_url.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Database URL cannot carry a database name: {}", base_url.scheme()))?
        .clear()
        .push(db_name);
    Ok(url)
}

pub struct PgDumpProducer {
    pg_dump_path: PathBuf,
    base_url: Url,
}

impl PgDumpProducer {
    /// Fails when pg_dump is not in PATH.
    pub fn locate(source_db_url: &Url) -> Result<Self> {
        let pg_dump_path = find_client_executable("pg_dump")?;
        info!("Found pg_dump executable at: {}", pg_dump_path.display());
        Ok(Self {
            pg_dump_path,
            base_url: source_db_url.clone(),
        })
    }

    // Plain SQL without ownership or grants, so the dump restores onto differently provisioned servers.
    fn command_args(&self, db_name: &str) -> Result<Vec<OsString>> {
        Ok(vec![
            "--format=plain".into(),
            "--no-owner".into(),
            "--no-privileges".into(),
            "--dbname".into(),
            database_url(&self.base_url, db_name)?.as_str().into(),
        ])
    }
}

#[async_trait]
impl DumpProducer for PgDumpProducer {
    async fn dump(&self, db_name: &str, raw_path: &Path, diagnostics_path: &Path) -> io::Result<bool> {
        let args = self
            .command_args(db_name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{:#}", e)))?;
        let stdout = File::create(raw_path)?;
        let stderr = File::create(diagnostics_path)?;

        let status = Command::new(&self.pg_dump_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .status()
            .await?;

        debug!("pg_dump for {} exited with {}", db_name, status);
        Ok(status.success())
    }
}

/// Enumerates databases through the server's maintenance database.
pub struct PgCatalog {
    admin_url: Url,
}

impl PgCatalog {
    pub fn new(source_db_url: &Url) -> Result<Self> {
        let admin_url = match source_db_url.path() {
            "" | "/" => database_url(source_db_url, "postgres")?,
            _ => source_db_url.clone(),
        };
        Ok(Self { admin_url })
    }
}

#[async_trait]
impl DatabaseCatalog for PgCatalog {
    async fn list_databases(&self) -> Result<Vec<String>> {
        info!("Fetching list of databases...");
        let mut conn = PgConnection::connect(self.admin_url.as_str())
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to {}{} for listing databases",
                    self.admin_url.host_str().unwrap_or("localhost"),
                    self.admin_url.path()
                )
            })?;

        let rows = sqlx::query(
            "SELECT datname FROM pg_database WHERE datistemplate = false AND datallowconn = true ORDER BY datname;",
        )
        .fetch_all(&mut conn)
        .await
        .context("Failed to fetch database list from pg_database")?;

        let db_names: Vec<String> = rows
            .iter()
            .map(|row| row.try_get("datname"))
            .collect::<Result<_, _>>()
            .context("Failed to get 'datname' from row when fetching database list")?;

        if let Err(e) = conn.close().await {
            debug!("Closing catalog connection failed: {}", e);
        }

        info!("Found databases: {:?}", db_names);
        Ok(db_names)
    }
}

/// Last two non-blank diagnostic lines, whitespace collapsed. `unknown` when there are none.
pub fn summarize_diagnostics(text: &str) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let tail = &lines[lines.len().saturating_sub(2)..];
    let summary = tail
        .iter()
        .flat_map(|line| line.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ");
    if summary.is_empty() {
        "unknown".to_string()
    } else {
        summary
    }
}

fn read_diagnostics(path: &Path) -> String {
    fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Runs the producer for one database into the workspace.
pub async fn dump_stage(
    producer: &dyn DumpProducer,
    workspace: &Path,
    db_name: &str,
    base_name: &str,
) -> Result<Artifact, StageError> {
    let raw_path = workspace.join(format!("{}.sql", base_name));
    let diagnostics_path = workspace.join(format!("{}.stderr", base_name));

    info!("Dumping {} to {}", db_name, raw_path.display());
    let outcome = producer.dump(db_name, &raw_path, &diagnostics_path).await;
    let diagnostics = read_diagnostics(&diagnostics_path);
    remove_quietly(&diagnostics_path);

    match outcome {
        Ok(true) => {
            if !diagnostics.trim().is_empty() {
                warn!(
                    "pg_dump reported diagnostics for {}: {}",
                    db_name,
                    summarize_diagnostics(&diagnostics)
                );
            }
            Ok(Artifact::new(db_name, ArtifactStage::Raw, raw_path))
        }
        Ok(false) => {
            remove_quietly(&raw_path);
            let reason = summarize_diagnostics(&diagnostics);
            error!("pg_dump failed for {}: {}", db_name, reason);
            Err(StageError::new(StageKind::Dump, reason))
        }
        Err(e) => {
            remove_quietly(&raw_path);
            error!("Could not run pg_dump for {}: {}", db_name, e);
            Err(StageError::new(StageKind::Dump, e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedProducer {
        stdout: &'static str,
        stderr: &'static str,
        success: bool,
    }

    #[async_trait]
    impl DumpProducer for ScriptedProducer {
        async fn dump(&self, _db_name: &str, raw_path: &Path, diagnostics_path: &Path) -> io::Result<bool> {
            fs::write(raw_path, self.stdout)?;
            fs::write(diagnostics_path, self.stderr)?;
            Ok(self.success)
        }
    }

    struct UnspawnableProducer;

    #[async_trait]
    impl DumpProducer for UnspawnableProducer {
        async fn dump(&self, _db_name: &str, _raw_path: &Path, _diagnostics_path: &Path) -> io::Result<bool> {
            Err(io::Error::new(io::ErrorKind::NotFound, "pg_dump vanished"))
        }
    }

    #[test]
    fn test_summarize_diagnostics() {
        let stderr = "pg_dump: detail one\n\npg_dump: error: connection to server failed\n   FATAL:   database \"gone\"    does not exist  \n\n";
        assert_eq!(
            summarize_diagnostics(stderr),
            "pg_dump: error: connection to server failed FATAL: database \"gone\" does not exist"
        );
        assert_eq!(summarize_diagnostics("single\tline "), "single line");
        assert_eq!(summarize_diagnostics(""), "unknown");
        assert_eq!(summarize_diagnostics(" \n\t\n"), "unknown");
    }

    #[test]
    fn test_database_url_replaces_path() {
        let base = Url::parse("postgres://backup:pw@db.internal:5432/postgres?sslmode=require").unwrap();
        let url = database_url(&base, "billing").unwrap();
        assert_eq!(url.path(), "/billing");
        assert_eq!(url.query(), Some("sslmode=require"));
        assert_eq!(url.port(), Some(5432));

        let spaced = database_url(&base, "my db").unwrap();
        assert_eq!(spaced.path(), "/my%20db");
    }

    #[test]
    fn test_database_url_keeps_percent_and_slash_literal() {
        let base = Url::parse("postgres://localhost:5432").unwrap();

        let literal = database_url(&base, "a%20b").unwrap();
        let spaced = database_url(&base, "a b").unwrap();
        assert_ne!(literal, spaced);
        assert_eq!(literal.path(), "/a%2520b");

        let slashed = database_url(&base, "team/reports").unwrap();
        assert_eq!(slashed.path(), "/team%2Freports");
        assert_eq!(slashed.path_segments().unwrap().count(), 1);
    }

    #[test]
    fn test_database_url_rejects_opaque_url() {
        let opaque = Url::parse("postgres:localhost").unwrap();
        assert!(database_url(&opaque, "billing").is_err());
        assert!(PgCatalog::new(&opaque).is_err());
    }

    #[test]
    fn test_pg_dump_arguments_strip_ownership() {
        let producer = PgDumpProducer {
            pg_dump_path: PathBuf::from("/usr/bin/pg_dump"),
            base_url: Url::parse("postgres://localhost:5432/postgres").unwrap(),
        };
        let args = producer.command_args("billing").unwrap();
        let args: Vec<&str> = args.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            args,
            vec![
                "--format=plain",
                "--no-owner",
                "--no-privileges",
                "--dbname",
                "postgres://localhost:5432/billing"
            ]
        );
    }

    #[test]
    fn test_catalog_uses_maintenance_database() {
        let bare = PgCatalog::new(&Url::parse("postgres://localhost:5432").unwrap()).unwrap();
        assert_eq!(bare.admin_url.path(), "/postgres");

        let explicit = PgCatalog::new(&Url::parse("postgres://localhost:5432/admin").unwrap()).unwrap();
        assert_eq!(explicit.admin_url.path(), "/admin");
    }

    #[tokio::test]
    async fn test_dump_stage_success_keeps_raw_only() {
        let workspace = tempfile::tempdir().unwrap();
        let producer = ScriptedProducer {
            stdout: "CREATE TABLE t (id int);\n",
            stderr: "pg_dump: warning: something minor\n",
            success: true,
        };

        let artifact = dump_stage(&producer, workspace.path(), "app", "app_20261016_020000")
            .await
            .unwrap();

        assert_eq!(artifact.stage, ArtifactStage::Raw);
        assert_eq!(artifact.database, "app");
        assert_eq!(artifact.path, workspace.path().join("app_20261016_020000.sql"));
        assert_eq!(fs::read_to_string(&artifact.path).unwrap(), "CREATE TABLE t (id int);\n");
        assert_eq!(fs::read_dir(workspace.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_dump_stage_failure_cleans_up() {
        let workspace = tempfile::tempdir().unwrap();
        let producer = ScriptedProducer {
            stdout: "-- partial output",
            stderr: "pg_dump: error: query failed\npg_dump: detail: permission denied for table t\n",
            success: false,
        };

        let err = dump_stage(&producer, workspace.path(), "app", "app_20261016_020000")
            .await
            .unwrap_err();

        assert_eq!(err.kind, StageKind::Dump);
        assert_eq!(
            err.detail,
            "pg_dump: error: query failed pg_dump: detail: permission denied for table t"
        );
        assert_eq!(fs::read_dir(workspace.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_dump_stage_spawn_error() {
        let workspace = tempfile::tempdir().unwrap();
        let err = dump_stage(&UnspawnableProducer, workspace.path(), "app", "app_ts")
            .await
            .unwrap_err();
        assert_eq!(err.kind, StageKind::Dump);
        assert!(err.detail.contains("pg_dump vanished"));
        assert_eq!(fs::read_dir(workspace.path()).unwrap().count(), 0);
    }
}
