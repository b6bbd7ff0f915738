// Partition Model
//
// Names the things a sweep reasons about: tables, partition ids, the
// authoritative assignment reported for a table and the terminal state
// a table reaches within one sweep.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod reconcile;

/// Identifier of a partition, unique within its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// Parse a partition directory name.
    ///
    /// Only the canonical decimal form is accepted, so that the id always
    /// maps back to the directory it was read from: `"007"`, `"+7"` and
    /// `"7a"` are all rejected.
    pub fn from_dir_name(name: &str) -> Option<Self> {
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if name.len() > 1 && name.starts_with('0') {
            return None;
        }
        name.parse().ok().map(PartitionId)
    }

    /// Directory name backing this partition.
    pub fn dir_name(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A table, addressed by database and table name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub database: String,
    pub table: String,
}

impl TableRef {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.database, self.table)
    }
}

/// Stable identifier for one sweep, carried through logs and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SweepId(pub Uuid);

impl SweepId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SweepId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SweepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Partitions the metadata service assigns to this node for one table.
///
/// A value of this type only exists after a successful metadata query.
/// Query failures are reported as `QueryFailure` and never collapse into
/// an empty assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnlineAssignment {
    ids: BTreeSet<PartitionId>,
}

impl OnlineAssignment {
    pub fn new(ids: impl IntoIterator<Item = PartitionId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    pub fn ids(&self) -> &BTreeSet<PartitionId> {
        &self.ids
    }

    pub fn contains(&self, id: PartitionId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when the service successfully reported zero partitions.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Terminal state of a table within one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableOutcome {
    /// The metadata query failed; nothing was touched.
    SkippedNoMetadata,

    /// Neither the service nor the disk knows any partition.
    SkippedEmpty,

    /// Local partitions were compared with the assignment and orphans retired.
    Reconciled,
}

impl TableOutcome {
    /// Classify a table from its query result and local partition set.
    pub fn classify(online: Option<&OnlineAssignment>, local: &BTreeSet<PartitionId>) -> Self {
        match online {
            None => TableOutcome::SkippedNoMetadata,
            Some(online) if online.is_empty() && local.is_empty() => TableOutcome::SkippedEmpty,
            Some(_) => TableOutcome::Reconciled,
        }
    }
}
