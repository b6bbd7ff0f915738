// Local Partition Inventory
//
// Walks the node data root, laid out as
// `<node_dir>/<database>/<table>/<partition_id>/`, and lists what is
// physically present. Read-only.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::state::{PartitionId, TableRef};

/// A directory under the node root could not be listed.
#[derive(Debug, thiserror::Error)]
#[error("failed to list {}: {source}", path.display())]
pub struct ScanError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl ScanError {
    /// The directory vanished, usually because of a concurrent cleanup.
    pub fn is_not_found(&self) -> bool {
        self.source.kind() == io::ErrorKind::NotFound
    }
}

/// Lists databases, tables and partitions under one node data root.
#[derive(Debug, Clone)]
pub struct InventoryScanner {
    node_dir: PathBuf,
}

impl InventoryScanner {
    pub fn new(node_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_dir: node_dir.into(),
        }
    }

    pub fn node_dir(&self) -> &Path {
        &self.node_dir
    }

    /// Database directories directly under the node root.
    pub fn list_databases(&self) -> Result<BTreeSet<String>, ScanError> {
        let databases = subdirectories(&self.node_dir)?;
        debug!(?databases, "local databases");
        Ok(databases)
    }

    /// Table directories of one database.
    pub fn list_tables(&self, database: &str) -> Result<BTreeSet<String>, ScanError> {
        let tables = subdirectories(&self.node_dir.join(database))?;
        debug!(database, ?tables, "local tables");
        Ok(tables)
    }

    /// Partition directories of one table.
    ///
    /// Entries whose names are not canonical partition ids are ignored.
    pub fn list_partitions(&self, table: &TableRef) -> Result<BTreeSet<PartitionId>, ScanError> {
        let dir = self.node_dir.join(&table.database).join(&table.table);
        let partitions: BTreeSet<PartitionId> = subdirectories(&dir)?
            .iter()
            .filter_map(|name| PartitionId::from_dir_name(name))
            .collect();
        debug!(%table, ?partitions, "local partitions");
        Ok(partitions)
    }
}

/// Names of the real directories directly under `path`.
///
/// Files and symbolic links are skipped so nothing downstream ever follows
/// a link out of the data root.
fn subdirectories(path: &Path) -> Result<BTreeSet<String>, ScanError> {
    let scan_error = |source| ScanError {
        path: path.to_path_buf(),
        source,
    };

    let mut names = BTreeSet::new();
    for entry in fs::read_dir(path).map_err(scan_error)? {
        let entry = entry.map_err(scan_error)?;
        let file_type = entry.file_type().map_err(scan_error)?;
        if !file_type.is_dir() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => {
                names.insert(name);
            }
            Err(raw) => warn!(parent = %path.display(), name = ?raw, "skipping non UTF-8 entry"),
        }
    }
    Ok(names)
}
