//! File snapshots taken before mutating steps.
//!
//! A [`Snapshot`] is resolved exactly once: [`Snapshot::rollback`] and
//! [`Snapshot::discard`] both consume it. It holds the path lock for its
//! file until then, so mutating steps from concurrent tasks touching the same
//! path run one at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempPath;
use tokio::sync::OwnedMutexGuard;

/// What the snapshot captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Nothing to restore.
    None,
    /// The file existed and was copied to a backup.
    ExistingFile,
    /// The file did not exist; rollback deletes whatever the step created.
    NewFile,
}

/// Saved filesystem state for one in-flight step.
#[derive(Debug)]
pub struct Snapshot {
    kind: SnapshotKind,
    original_path: Option<PathBuf>,
    backup: Option<TempPath>,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl Snapshot {
    /// A snapshot for a step that touches no file.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            kind: SnapshotKind::None,
            original_path: None,
            backup: None,
            _guard: None,
        }
    }

    /// Capture the current state of `path`.
    ///
    /// Backups go to `backup_dir`, or the system temp dir when unset.
    ///
    /// # Errors
    ///
    /// Returns error if the backup cannot be written.
    pub async fn capture(
        path: &Path,
        backup_dir: Option<&Path>,
        guard: Option<OwnedMutexGuard<()>>,
    ) -> std::io::Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Self {
                kind: SnapshotKind::NewFile,
                original_path: Some(path.to_path_buf()),
                backup: None,
                _guard: guard,
            });
        }

        let dir = backup_dir.map_or_else(std::env::temp_dir, Path::to_path_buf);
        tokio::fs::create_dir_all(&dir).await?;
        let backup = tempfile::Builder::new()
            .prefix("waypoint-snapshot-")
            .tempfile_in(&dir)?
            .into_temp_path();
        tokio::fs::copy(path, &backup).await?;

        tracing::debug!(path = %path.display(), backup = %backup.display(), "Snapshot captured");

        Ok(Self {
            kind: SnapshotKind::ExistingFile,
            original_path: Some(path.to_path_buf()),
            backup: Some(backup),
            _guard: guard,
        })
    }

    /// What was captured.
    #[must_use]
    pub const fn kind(&self) -> SnapshotKind {
        self.kind
    }

    /// The file this snapshot protects.
    #[must_use]
    pub fn original_path(&self) -> Option<&Path> {
        self.original_path.as_deref()
    }

    /// Where the backup copy lives.
    #[must_use]
    pub fn backup_path(&self) -> Option<&Path> {
        self.backup.as_deref()
    }

    /// Restore the captured state.
    ///
    /// # Errors
    ///
    /// Returns error if the original cannot be restored or removed.
    pub async fn rollback(self) -> std::io::Result<()> {
        match (self.kind, &self.original_path, &self.backup) {
            (SnapshotKind::ExistingFile, Some(original), Some(backup)) => {
                tokio::fs::copy(backup, original).await?;
                tracing::debug!(path = %original.display(), "Snapshot restored");
            }
            (SnapshotKind::NewFile, Some(original), _) => {
                match tokio::fs::remove_file(original).await {
                    Ok(()) => tracing::debug!(path = %original.display(), "Created file removed"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
            _ => {}
        }
        self.discard()
    }

    /// Drop the backup, keeping the current state.
    ///
    /// # Errors
    ///
    /// Returns error if the backup file cannot be deleted.
    pub fn discard(self) -> std::io::Result<()> {
        match self.backup {
            Some(backup) => backup.close(),
            None => Ok(()),
        }
    }
}

/// Per-path async locks held by in-flight snapshots.
#[derive(Debug, Default)]
pub struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl PathLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `path`.
    pub async fn lock(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Entries nobody holds or waits on can go.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(path.to_path_buf()).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of paths currently locked or awaited.
    #[must_use]
    pub fn len(&self) -> usize {
        match self.locks.lock() {
            Ok(guard) => guard.values().filter(|l| Arc::strong_count(l) > 1).count(),
            Err(poisoned) => poisoned
                .into_inner()
                .values()
                .filter(|l| Arc::strong_count(l) > 1)
                .count(),
        }
    }

    /// Whether no path is locked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
