// pgbackup/src/backup/publish.rs
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use super::{Artifact, ArtifactStage};
use crate::errors::{StageError, StageKind};
use crate::utils::naming::hidden_file_name;
use crate::utils::storage::remove_quietly;

fn hidden_sibling(final_path: &Path) -> io::Result<PathBuf> {
    let file_name = final_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no usable file name", final_path.display()),
            )
        })?;
    Ok(final_path.with_file_name(hidden_file_name(file_name)))
}

fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// Moves `src` next to `final_path` under its hidden name and returns that path.
///
/// A rename when source and target share a filesystem, otherwise copy, fsync and
/// remove the source. Nothing appears at `final_path` during this step.
pub fn stage_hidden(src: &Path, final_path: &Path) -> io::Result<PathBuf> {
    let hidden = hidden_sibling(final_path)?;
    match fs::rename(src, &hidden) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            debug!("{} is on another filesystem, copying instead", hidden.display());
            let copied = fs::copy(src, &hidden).and_then(|_| File::open(&hidden)?.sync_all());
            if let Err(copy_err) = copied {
                remove_quietly(&hidden);
                return Err(copy_err);
            }
            remove_quietly(src);
        }
        Err(e) => return Err(e),
    }
    Ok(hidden)
}

/// Same-directory rename from the hidden name to the public one.
pub fn promote(hidden: &Path, final_path: &Path) -> io::Result<()> {
    fs::rename(hidden, final_path)?;
    if let Some(parent) = final_path.parent() {
        sync_dir(parent);
    }
    Ok(())
}

/// Lands a verified artifact at `final_path` without ever exposing a partial file there.
///
/// An existing file at `final_path` is never replaced. On failure the workspace copy and
/// any hidden leftover are removed.
pub fn publish(artifact: Artifact, final_path: &Path) -> Result<Artifact, StageError> {
    if fs::symlink_metadata(final_path).is_ok() {
        remove_quietly(&artifact.path);
        error!("Refusing to overwrite existing backup {}", final_path.display());
        return Err(StageError::new(
            StageKind::Publish,
            format!("{} already exists", final_path.display()),
        ));
    }

    let hidden = match stage_hidden(&artifact.path, final_path) {
        Ok(hidden) => hidden,
        Err(e) => {
            remove_quietly(&artifact.path);
            if let Ok(hidden) = hidden_sibling(final_path) {
                remove_quietly(&hidden);
            }
            error!(
                "Could not move {} into {}: {}",
                artifact.path.display(),
                final_path.display(),
                e
            );
            return Err(StageError::new(StageKind::Publish, e.to_string()));
        }
    };

    if let Err(e) = promote(&hidden, final_path) {
        remove_quietly(&hidden);
        error!("Could not publish {}: {}", final_path.display(), e);
        return Err(StageError::new(StageKind::Publish, e.to_string()));
    }

    info!("✓ Published {}", final_path.display());
    Ok(Artifact::new(
        artifact.database,
        ArtifactStage::Final,
        final_path.to_path_buf(),
    ))
}
