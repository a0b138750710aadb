// pgbackup/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

use crate::utils::logging::DEFAULT_LOG_FILE;
use crate::utils::storage::KB_PER_MB;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_MIN_FREE_SPACE_MB: u64 = 100;
pub const DEFAULT_MIN_FREE_SPACE_PER_DB_MB: u64 = 10;
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub source_database_url: Option<String>,
    pub local_backup_dir: Option<PathBuf>,
    pub temp_dump_root: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub database_list: Option<serde_json::Value>,
    pub compression_level: Option<u32>,
    pub min_free_space_mb: Option<u64>,
    pub min_free_space_per_db_mb: Option<u64>,
}

/// Values supplied on the command line; they win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub backup_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub source_db_url: Url,
    /// Explicit list; `None` means enumerate the server.
    pub databases_to_backup: Option<Vec<String>>,
    pub local_backup_path: PathBuf,
    pub temp_dump_root: PathBuf,
    pub compression_level: u32,
    pub min_free_space_mb: u64,
    pub min_free_space_per_db_mb: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub raw_json_config: RawJsonConfig,
}

impl AppConfig {
    /// Reads `config_path`. A missing file is tolerated only when `required` is false.
    pub fn load_from_json(config_path: &Path, required: bool) -> Result<Self> {
        if !required && !config_path.exists() {
            return Ok(AppConfig {
                raw_json_config: RawJsonConfig::default(),
            });
        }

        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        Ok(AppConfig { raw_json_config })
    }

    /// Applies `SOURCE_DATABASE_URL`, `LOCAL_BACKUP_DIR`, `TEMP_DUMP_ROOT` and
    /// `BACKUP_LOG_FILE`, then the command-line values.
    pub fn apply_overrides(&mut self, cli: &CliOverrides) {
        self.apply_env_with(|key| env::var(key).ok().filter(|v| !v.trim().is_empty()));
        self.apply_cli(cli);
    }

    fn apply_cli(&mut self, cli: &CliOverrides) {
        let raw = &mut self.raw_json_config;
        if let Some(dir) = &cli.backup_dir {
            raw.local_backup_dir = Some(dir.clone());
        }
        if let Some(file) = &cli.log_file {
            raw.log_file = Some(file.clone());
        }
        if let Some(dir) = &cli.temp_dir {
            raw.temp_dump_root = Some(dir.clone());
        }
    }

    fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let raw = &mut self.raw_json_config;
        if let Some(url) = lookup("SOURCE_DATABASE_URL") {
            raw.source_database_url = Some(url);
        }
        if let Some(dir) = lookup("LOCAL_BACKUP_DIR") {
            raw.local_backup_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup("TEMP_DUMP_ROOT") {
            raw.temp_dump_root = Some(PathBuf::from(dir));
        }
        if let Some(file) = lookup("BACKUP_LOG_FILE") {
            raw.log_file = Some(PathBuf::from(file));
        }
    }

    pub fn log_file(&self) -> PathBuf {
        self.raw_json_config
            .log_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE))
    }
}

pub fn load_backup_config(raw_config: &RawJsonConfig) -> Result<BackupConfig> {
    let source_db_url = raw_config
        .source_database_url
        .as_ref()
        .context("source_database_url must be set in config.json or SOURCE_DATABASE_URL")?;
    let source_db_url = Url::parse(source_db_url)
        .context("source_database_url is not a valid PostgreSQL URL")?;

    let local_backup_path = raw_config
        .local_backup_dir
        .as_ref()
        .context("local_backup_dir must be set in config.json or LOCAL_BACKUP_DIR")?
        .clone();

    if local_backup_path.to_string_lossy().is_empty() {
        return Err(anyhow::anyhow!(
            "local_backup_dir cannot be empty in config.json."
        ));
    }

    let compression_level = raw_config
        .compression_level
        .unwrap_or(DEFAULT_COMPRESSION_LEVEL);
    if compression_level > 9 {
        return Err(anyhow::anyhow!(
            "compression_level must be between 0 and 9, got {}",
            compression_level
        ));
    }

    let min_free_space_mb = space_threshold(
        "min_free_space_mb",
        raw_config.min_free_space_mb,
        DEFAULT_MIN_FREE_SPACE_MB,
    )?;
    let min_free_space_per_db_mb = space_threshold(
        "min_free_space_per_db_mb",
        raw_config.min_free_space_per_db_mb,
        DEFAULT_MIN_FREE_SPACE_PER_DB_MB,
    )?;

    Ok(BackupConfig {
        source_db_url,
        databases_to_backup: parse_database_list(&raw_config.database_list)?,
        local_backup_path,
        temp_dump_root: raw_config
            .temp_dump_root
            .clone()
            .unwrap_or_else(env::temp_dir),
        compression_level,
        min_free_space_mb,
        min_free_space_per_db_mb,
    })
}

/// Threshold in MB; must still fit in a `u64` once converted to KB.
fn space_threshold(field: &str, value: Option<u64>, default: u64) -> Result<u64> {
    let mb = value.unwrap_or(default);
    if mb.checked_mul(KB_PER_MB).is_none() {
        return Err(anyhow::anyhow!(
            "{} is too large: {} MB cannot be expressed in KB",
            field,
            mb
        ));
    }
    Ok(mb)
}

/// Parses the database_list configuration.
/// Accepts `["db1", "db2"]` or a `{"source_db": "target_db"}` mapping, whose keys are used.
fn parse_database_list(database_list: &Option<serde_json::Value>) -> Result<Option<Vec<String>>> {
    match database_list {
        Some(value) => {
            if value.is_array() {
                let databases: Vec<String> = serde_json::from_value(value.clone())
                    .context("Failed to parse database_list as array")?;
                Ok(Some(databases))
            } else if value.is_object() {
                let mapping: HashMap<String, String> = serde_json::from_value(value.clone())
                    .context("Failed to parse database_list as mapping object")?;
                let mut source_databases: Vec<String> = mapping.into_keys().collect();
                source_databases.sort();
                Ok(Some(source_databases))
            } else {
                Err(anyhow::anyhow!("database_list must be either an array of database names or a mapping object"))
            }
        }
        None => Ok(None),
    }
}
