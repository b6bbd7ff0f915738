// Reaper Kernel
//
// Partition garbage collection for storage nodes: reconcile the partition
// directories on local disk with the assignment reported by the metadata
// service, then quarantine or delete the orphans.

pub mod adapters;
pub mod config;
pub mod inventory;
pub mod liveness;
pub mod retention;
pub mod state;
pub mod sweep;
