//! Cluster membership, write replication, and hinted handoff.

pub mod hinted_handoff;
pub mod node_registry;
pub mod replication;

pub use hinted_handoff::{HandoffConfig, HandoffRecord, HintedHandoff};
pub use node_registry::{DataNodeRegistry, NodeStatus};
pub use replication::{ReplicationConfig, Replicator};

use std::sync::atomic::{AtomicU64, Ordering};

/// This node's data-node id, shared across the write, query, and CQ
/// paths. Zero until the node registers itself with the cluster.
#[derive(Debug, Default)]
pub struct NodeIdentity(AtomicU64);

impl NodeIdentity {
    pub fn set(&self, id: u64) {
        self.0.store(id, Ordering::Release);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}
