// Partition Retention
//
// Retires orphaned partition directories. Quarantine moves them to
// `<dest_dir>/<database>/<table>/<id>` for later reclaim; delete removes
// them in place. Retiring an absent partition is a no-op.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ReaperConfig;
use crate::liveness::{LivenessError, LivenessGuard};
use crate::state::{PartitionId, TableRef};

/// What to do with an orphaned partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionMode {
    Quarantine { dest_dir: PathBuf },
    Delete,
}

/// Result of retiring one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RetireOutcome {
    /// Nothing on disk; an earlier sweep or another actor removed it.
    AlreadyAbsent,

    /// A liveness check reported the partition in use. Retried next sweep.
    Busy { check: String, reason: String },

    /// Dry run: the partition would have been retired.
    WouldRetire { path: PathBuf },

    Quarantined { to: PathBuf },

    Deleted,
}

impl RetireOutcome {
    /// The partition directory was moved or removed by this call.
    pub fn is_retired(&self) -> bool {
        matches!(self, RetireOutcome::Quarantined { .. } | RetireOutcome::Deleted)
    }
}

/// A partition could not be retired. Scoped to that partition only.
#[derive(Debug, thiserror::Error)]
#[error("failed to {action} {}: {source}", path.display())]
pub struct RetentionFailure {
    pub path: PathBuf,
    pub action: &'static str,
    #[source]
    pub source: io::Error,
}

impl RetentionFailure {
    fn new(path: impl Into<PathBuf>, action: &'static str, source: io::Error) -> Self {
        Self {
            path: path.into(),
            action,
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetentionExecutor {
    node_dir: PathBuf,
    mode: RetentionMode,
    dry_run: bool,
    guard: Arc<LivenessGuard>,
}

impl RetentionExecutor {
    pub fn new(node_dir: impl Into<PathBuf>, mode: RetentionMode, guard: LivenessGuard) -> Self {
        Self {
            node_dir: node_dir.into(),
            mode,
            dry_run: false,
            guard: Arc::new(guard),
        }
    }

    pub fn from_config(config: &ReaperConfig, guard: LivenessGuard) -> Self {
        let mode = if config.quarantine {
            RetentionMode::Quarantine {
                dest_dir: config.dest_dir.clone(),
            }
        } else {
            RetentionMode::Delete
        };
        Self::new(&config.node_dir, mode, guard).with_dry_run(config.dry_run)
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn mode(&self) -> &RetentionMode {
        &self.mode
    }

    pub fn partition_dir(&self, table: &TableRef, id: PartitionId) -> PathBuf {
        self.node_dir
            .join(&table.database)
            .join(&table.table)
            .join(id.dir_name())
    }

    /// Retire one partition of `table`.
    pub fn retire(
        &self,
        table: &TableRef,
        id: PartitionId,
    ) -> Result<RetireOutcome, RetentionFailure> {
        let source = self.partition_dir(table, id);

        match fs::symlink_metadata(&source) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(RetireOutcome::AlreadyAbsent)
            }
            Err(err) => return Err(RetentionFailure::new(source, "inspect", err)),
            Ok(meta) if !meta.is_dir() => {
                return Err(RetentionFailure::new(
                    source,
                    "inspect",
                    io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
                ))
            }
            Ok(_) => {}
        }

        match self.guard.evaluate(&source) {
            Ok(()) => {}
            Err(LivenessError::Busy { check, reason }) => {
                warn!(%table, partition = %id, check, %reason, "partition in use, leaving it");
                return Ok(RetireOutcome::Busy {
                    check: check.to_string(),
                    reason,
                });
            }
            Err(LivenessError::CheckFailed { source: err, .. }) => {
                return Err(RetentionFailure::new(source, "verify liveness of", err));
            }
        }

        if self.dry_run {
            info!(%table, partition = %id, path = %source.display(), "would retire partition");
            return Ok(RetireOutcome::WouldRetire { path: source });
        }

        match &self.mode {
            RetentionMode::Quarantine { dest_dir } => {
                let to = quarantine(&source, dest_dir, table, id)?;
                info!(%table, partition = %id, to = %to.display(), "quarantined partition");
                Ok(RetireOutcome::Quarantined { to })
            }
            RetentionMode::Delete => {
                fs::remove_dir_all(&source)
                    .map_err(|e| RetentionFailure::new(&source, "delete", e))?;
                info!(%table, partition = %id, path = %source.display(), "deleted partition");
                Ok(RetireOutcome::Deleted)
            }
        }
    }
}

/// Move `source` under the table's quarantine directory.
///
/// An earlier quarantined copy of the same partition is never overwritten;
/// the new one gets a unique suffix instead.
fn quarantine(
    source: &Path,
    dest_dir: &Path,
    table: &TableRef,
    id: PartitionId,
) -> Result<PathBuf, RetentionFailure> {
    let table_dir = dest_dir.join(&table.database).join(&table.table);
    fs::create_dir_all(&table_dir)
        .map_err(|e| RetentionFailure::new(&table_dir, "create quarantine directory", e))?;

    let mut target = table_dir.join(id.dir_name());
    if fs::symlink_metadata(&target).is_ok() {
        target = table_dir.join(format!("{id}.{}", Uuid::new_v4().simple()));
    }

    move_dir(source, &target).map_err(|e| RetentionFailure::new(source, "move", e))?;
    Ok(target)
}

fn move_dir(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => copy_then_remove(from, to),
        Err(err) => Err(err),
    }
}

/// Cross-device move.
///
/// The copy is built under a hidden staging name next to `to` and renamed
/// into place only once complete, so an interrupted copy never shows up as
/// a quarantined partition. The source is renamed to a hidden sibling
/// before removal so a partially removed source is never swept again.
fn copy_then_remove(from: &Path, to: &Path) -> io::Result<()> {
    let staging = hidden_sibling(to, "partial");
    if let Err(err) = copy_dir_all(from, &staging).and_then(|()| fs::rename(&staging, to)) {
        discard(&staging);
        return Err(err);
    }

    let retiring = hidden_sibling(from, "retiring");
    fs::rename(from, &retiring)?;
    fs::remove_dir_all(&retiring).inspect_err(|err| {
        warn!(path = %retiring.display(), error = %err, "copied partition source left behind");
    })
}

fn hidden_sibling(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{tag}-{}", Uuid::new_v4().simple()))
}

fn discard(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to discard partial copy"),
    }
}

fn copy_dir_all(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = to.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            copy_symlink(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(from)?, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to).map(|_| ())
}
