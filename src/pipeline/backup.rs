//! Destination snapshots.
//!
//! Before the first attempt touches anything, an existing destination file
//! is copied into an exclusive directory under the scratch root. On success
//! the copy is discarded; on exhaustion, cancellation or a failed commit it
//! is written back byte for byte.
//!
//! Restore goes through a sibling temp file and a rename, so the destination
//! is never observed half-written.

use crate::error::ConvertError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupState {
    Held,
    Restored,
    Discarded,
}

/// A saved copy of a destination's pre-existing content.
#[derive(Debug)]
pub struct Backup {
    pub original: PathBuf,
    pub snapshot: PathBuf,
    pub created_at: DateTime<Utc>,
    pub state: BackupState,
    // Holds the snapshot; removed when the backup is dropped.
    dir: TempDir,
}

impl Backup {
    /// Keep the snapshot on disk past this backup's lifetime and return
    /// its path.
    pub fn keep(self) -> PathBuf {
        let _ = self.dir.keep();
        self.snapshot
    }
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Copy `destination` aside if it exists.
    ///
    /// Returns `Ok(None)` when there is nothing to protect.
    pub async fn snapshot(&self, destination: &Path) -> Result<Option<Backup>, ConvertError> {
        let meta = match tokio::fs::metadata(destination).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConvertError::BackupFailed {
                    path: destination.to_path_buf(),
                    source: e,
                })
            }
        };
        if meta.is_dir() {
            return Err(ConvertError::InvalidDestination {
                path: destination.to_path_buf(),
                reason: "destination is a directory".into(),
            });
        }

        let fail = |e: io::Error| ConvertError::BackupFailed {
            path: destination.to_path_buf(),
            source: e,
        };
        let dir = tempfile::Builder::new()
            .prefix("backup-")
            .tempdir_in(&self.root)
            .map_err(fail)?;
        let name = destination
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "destination".into());
        let snapshot = dir.path().join(name);
        tokio::fs::copy(destination, &snapshot).await.map_err(fail)?;

        debug!(
            "Backed up {} to {}",
            destination.display(),
            snapshot.display()
        );
        Ok(Some(Backup {
            original: destination.to_path_buf(),
            snapshot,
            created_at: Utc::now(),
            state: BackupState::Held,
            dir,
        }))
    }

    /// Put the snapshot back over the original path.
    ///
    /// Not retried. On failure the backup stays [`BackupState::Held`]; call
    /// [`Backup::keep`] to leave the snapshot for manual recovery.
    pub async fn restore(&self, backup: &mut Backup) -> io::Result<()> {
        if backup.state != BackupState::Held {
            return Ok(());
        }
        replace_atomically(&backup.snapshot, &backup.original).await?;
        backup.state = BackupState::Restored;
        info!("Restored {} from backup", backup.original.display());
        Ok(())
    }

    /// Drop the snapshot after a successful conversion.
    pub fn discard(&self, mut backup: Backup) {
        backup.state = BackupState::Discarded;
        debug!("Discarded backup of {}", backup.original.display());
    }
}

/// Copy `from` to a temp file next to `to`, then rename it over `to`.
pub(crate) async fn replace_atomically(from: &Path, to: &Path) -> io::Result<()> {
    let parent = match to.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = to
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()));

    if let Err(e) = tokio::fs::copy(from, &tmp).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, to).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}
