// Partition Reconciliation
//
// Compares the partitions found on disk with the partitions the
// metadata service assigns to this node. Pure and side-effect free.

use std::collections::BTreeSet;

use crate::state::{OnlineAssignment, PartitionId};

/// Partitions present locally but absent from the online assignment.
///
/// Taking an `OnlineAssignment` means this can only run after the metadata
/// query for the table succeeded.
pub fn reconcile(local: &BTreeSet<PartitionId>, online: &OnlineAssignment) -> BTreeSet<PartitionId> {
    local
        .iter()
        .filter(|id| !online.contains(**id))
        .copied()
        .collect()
}

/// Partitions assigned to this node that are not on disk yet.
///
/// Reported for visibility only; the sweep never acts on them.
pub fn missing_locally(
    local: &BTreeSet<PartitionId>,
    online: &OnlineAssignment,
) -> BTreeSet<PartitionId> {
    online.ids().difference(local).copied().collect()
}
