// pgbackup/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{Artifact, ArtifactStage};
use crate::errors::{StageError, StageKind};
use crate::utils::storage::remove_quietly;

/// Stream transform applied to raw dumps, plus its structural check.
pub trait Codec: Send + Sync {
    /// Compresses `src` into `dest`. The error chain is the codec's diagnostic output.
    fn compress(&self, src: &Path, dest: &Path) -> Result<()>;

    /// True when `path` is a complete, well-formed compressed stream.
    fn verify(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct GzipCodec {
    level: u32,
}

impl GzipCodec {
    pub fn new(level: u32) -> Self {
        Self { level }
    }
}

impl Codec for GzipCodec {
    fn compress(&self, src: &Path, dest: &Path) -> Result<()> {
        let mut input = File::open(src)
            .with_context(|| format!("Failed to open raw dump: {}", src.display()))?;
        let output = File::create(dest)
            .with_context(|| format!("Failed to create compressed file: {}", dest.display()))?;

        let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::new(self.level));
        io::copy(&mut input, &mut encoder)
            .with_context(|| format!("Failed to compress {}", src.display()))?;

        let writer = encoder.finish().with_context(|| {
            format!("Failed to finish Gzip encoding for: {}", dest.display())
        })?;
        let file = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .with_context(|| format!("Failed to flush compressed file: {}", dest.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync compressed file: {}", dest.display()))?;
        Ok(())
    }

    fn verify(&self, path: &Path) -> bool {
        match check_gzip_stream(path) {
            Ok(()) => true,
            Err(e) => {
                warn!("Integrity check failed for {}: {}", path.display(), e);
                false
            }
        }
    }
}

// Decodes into a sink; the CRC and length trailer of every member are checked on the way.
fn check_gzip_stream(path: &Path) -> io::Result<()> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "file is empty"));
    }
    let mut decoder = MultiGzDecoder::new(BufReader::new(file));
    io::copy(&mut decoder, &mut io::sink())?;
    Ok(())
}

fn compressed_path(raw_path: &Path) -> PathBuf {
    let mut name = raw_path.as_os_str().to_os_string();
    name.push(".gz");
    PathBuf::from(name)
}

/// Compresses a raw artifact and drops the raw file. On failure neither file survives.
///
/// The codec runs on the blocking pool so the run stays responsive to signals.
pub async fn compress_stage(codec: &Arc<dyn Codec>, raw: Artifact) -> Result<Artifact, StageError> {
    let dest = compressed_path(&raw.path);
    info!("Compressing {} to {}", raw.path.display(), dest.display());

    let worker = Arc::clone(codec);
    let (src, out) = (raw.path.clone(), dest.clone());
    let result = tokio::task::spawn_blocking(move || worker.compress(&src, &out))
        .await
        .map_err(|e| anyhow::anyhow!("compression task aborted: {}", e))
        .and_then(|r| r);

    match result {
        Ok(()) => {
            remove_quietly(&raw.path);
            Ok(Artifact::new(raw.database, ArtifactStage::Compressed, dest))
        }
        Err(e) => {
            remove_quietly(&raw.path);
            remove_quietly(&dest);
            error!("Compression failed for {}: {:#}", raw.database, e);
            Err(StageError::new(StageKind::Compress, format!("{:#}", e)))
        }
    }
}

/// Lets an artifact through only if the codec vouches for it; otherwise deletes it.
pub async fn verify_stage(codec: &Arc<dyn Codec>, artifact: Artifact) -> Result<Artifact, StageError> {
    let worker = Arc::clone(codec);
    let path = artifact.path.clone();
    let valid = match tokio::task::spawn_blocking(move || worker.verify(&path)).await {
        Ok(valid) => valid,
        Err(e) => {
            warn!("Integrity check task for {} aborted: {}", artifact.path.display(), e);
            false
        }
    };

    if valid {
        info!("✓ Integrity check passed for {}", artifact.path.display());
        return Ok(artifact);
    }
    remove_quietly(&artifact.path);
    error!("Integrity check failed for {}, artifact discarded", artifact.database);
    Err(StageError::new(
        StageKind::Verify,
        format!("{} is not a valid gzip stream", artifact.path.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::fs;
    use std::io::Read;

    const DUMP: &str = "--\n-- PostgreSQL database dump\n--\nCREATE TABLE accounts (id integer, name text);\nCOPY accounts (id, name) FROM stdin;\n1\talice\n2\tbob\n\\.\n";

    fn raw_artifact(dir: &Path, contents: &str) -> Artifact {
        let path = dir.join("app_20261016_020000.sql");
        fs::write(&path, contents).unwrap();
        Artifact::new("app", ArtifactStage::Raw, path)
    }

    struct BrokenCodec;

    fn gzip(level: u32) -> Arc<dyn Codec> {
        Arc::new(GzipCodec::new(level))
    }

    impl Codec for BrokenCodec {
        fn compress(&self, _src: &Path, dest: &Path) -> Result<()> {
            fs::write(dest, b"\x1f\x8b partial")?;
            Err(anyhow::anyhow!("disk quota exceeded"))
        }

        fn verify(&self, _path: &Path) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_compress_stage_replaces_raw_with_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_artifact(dir.path(), DUMP);
        let raw_path = raw.path.clone();

        let compressed = compress_stage(&gzip(6), raw).await.unwrap();

        assert_eq!(compressed.stage, ArtifactStage::Compressed);
        assert_eq!(compressed.path, dir.path().join("app_20261016_020000.sql.gz"));
        assert!(!raw_path.exists());

        let mut decoded = String::new();
        GzDecoder::new(File::open(&compressed.path).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, DUMP);
    }

    #[tokio::test]
    async fn test_compress_stage_failure_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_artifact(dir.path(), DUMP);

        let err = compress_stage(&(Arc::new(BrokenCodec) as Arc<dyn Codec>), raw)
            .await
            .unwrap_err();
        assert_eq!(err.kind, StageKind::Compress);
        assert!(err.detail.contains("disk quota exceeded"));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_compress_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Artifact::new("app", ArtifactStage::Raw, dir.path().join("missing.sql"));
        let err = compress_stage(&gzip(6), missing).await.unwrap_err();
        assert_eq!(err.kind, StageKind::Compress);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_verify_accepts_valid_and_empty_dump() {
        let dir = tempfile::tempdir().unwrap();
        let codec = gzip(9);

        let compressed = compress_stage(&codec, raw_artifact(dir.path(), DUMP)).await.unwrap();
        assert!(codec.verify(&compressed.path));

        let empty_dir = tempfile::tempdir().unwrap();
        let empty = compress_stage(&codec, raw_artifact(empty_dir.path(), "")).await.unwrap();
        assert!(codec.verify(&empty.path));
    }

    #[tokio::test]
    async fn test_verify_rejects_truncated_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let codec = gzip(6);
        let compressed = compress_stage(&codec, raw_artifact(dir.path(), &DUMP.repeat(50)))
            .await
            .unwrap();

        let bytes = fs::read(&compressed.path).unwrap();
        let truncated = dir.path().join("truncated.sql.gz");
        fs::write(&truncated, &bytes[..bytes.len() / 2]).unwrap();
        assert!(!codec.verify(&truncated));

        let no_trailer = dir.path().join("no_trailer.sql.gz");
        fs::write(&no_trailer, &bytes[..bytes.len() - 4]).unwrap();
        assert!(!codec.verify(&no_trailer));

        let garbage = dir.path().join("garbage.sql.gz");
        fs::write(&garbage, b"this is plain text, not gzip").unwrap();
        assert!(!codec.verify(&garbage));

        let empty = dir.path().join("empty.sql.gz");
        fs::write(&empty, b"").unwrap();
        assert!(!codec.verify(&empty));

        assert!(!codec.verify(&dir.path().join("missing.sql.gz")));
    }

    #[tokio::test]
    async fn test_verify_stage_discards_bad_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app_20261016_020000.sql.gz");
        fs::write(&path, b"corrupt").unwrap();
        let artifact = Artifact::new("app", ArtifactStage::Compressed, path.clone());

        let err = verify_stage(&gzip(6), artifact).await.unwrap_err();
        assert_eq!(err.kind, StageKind::Verify);
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_codec_runs_off_the_async_thread() {
        struct SlowCodec(std::time::Duration);

        impl Codec for SlowCodec {
            fn compress(&self, src: &Path, dest: &Path) -> Result<()> {
                std::thread::sleep(self.0);
                GzipCodec::new(1).compress(src, dest)
            }

            fn verify(&self, _path: &Path) -> bool {
                true
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let codec: Arc<dyn Codec> = Arc::new(SlowCodec(std::time::Duration::from_millis(500)));
        let stage = compress_stage(&codec, raw_artifact(dir.path(), DUMP));

        // A timer on the same single-threaded runtime must still fire while the codec works.
        let outcome = tokio::time::timeout(std::time::Duration::from_millis(50), stage).await;
        assert!(outcome.is_err());
    }
}
