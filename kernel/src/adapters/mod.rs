// External Adapters
//
// Read-only views of systems outside the node.

pub mod metadata;
