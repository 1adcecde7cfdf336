//! Finalize: put a processed file in place of its source.
//!
//! The result is first copied next to the source, so the swap itself is two
//! renames on one filesystem. The source survives as `<name>.orig.<timestamp>`
//! until the swap has succeeded.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur while replacing a source file.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// The result could not be staged next to the source
    #[error("Failed to stage result next to {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to back up {path}: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The staged result could not be moved into place; the source was restored
    #[error("Failed to move result into {path}: {source}")]
    Swap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete backup {path}: {source}")]
    DeleteBackup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// `<name>.orig.<unix seconds>` next to `original`
pub fn backup_path(original: &Path) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut backup = original.as_os_str().to_owned();
    backup.push(format!(".orig.{}", timestamp));
    PathBuf::from(backup)
}

fn staging_path(original: &Path) -> PathBuf {
    let mut staged = original.as_os_str().to_owned();
    staged.push(".partial");
    PathBuf::from(staged)
}

/// Replace `original` with `result`.
///
/// Returns the backup path when `keep_original` is set. On any failure the
/// source is left at its original path.
pub fn replace_source(
    original: &Path,
    result: &Path,
    keep_original: bool,
) -> Result<Option<PathBuf>, ReplaceError> {
    let staged = staging_path(original);
    fs::copy(result, &staged).map_err(|source| {
        let _ = fs::remove_file(&staged);
        ReplaceError::Stage {
            path: original.to_path_buf(),
            source,
        }
    })?;

    let backup = backup_path(original);
    if let Err(source) = fs::rename(original, &backup) {
        let _ = fs::remove_file(&staged);
        return Err(ReplaceError::Backup {
            path: original.to_path_buf(),
            source,
        });
    }

    if let Err(source) = fs::rename(&staged, original) {
        let _ = fs::rename(&backup, original);
        let _ = fs::remove_file(&staged);
        return Err(ReplaceError::Swap {
            path: original.to_path_buf(),
            source,
        });
    }
    tracing::debug!(path = %original.display(), "Replaced source");

    if keep_original {
        Ok(Some(backup))
    } else {
        fs::remove_file(&backup).map_err(|source| ReplaceError::DeleteBackup {
            path: backup.clone(),
            source,
        })?;
        Ok(None)
    }
}
