//! Data-node registry: the authoritative member set plus runtime liveness.
//!
//! Membership itself lives in the catalog (ids are assigned by the
//! metastore and never reused); this registry layers a liveness overlay on
//! top, fed by replication successes and failures.

use crate::meta::{DataNode, MetaStore};
use crate::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Runtime status of a data node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Node is reachable (or has never been observed failing)
    Up,
    /// Node failed its most recent replication attempt
    Down,
}

#[derive(Debug, Clone)]
struct NodeHealth {
    status: NodeStatus,
    since: Instant,
}

/// Tracks peer data nodes.
pub struct DataNodeRegistry {
    meta: Arc<MetaStore>,
    health: DashMap<u64, NodeHealth>,
}

impl DataNodeRegistry {
    pub fn new(meta: Arc<MetaStore>) -> Self {
        Self {
            meta,
            health: DashMap::new(),
        }
    }

    /// All registered nodes, in id order.
    pub fn all(&self) -> Vec<DataNode> {
        self.meta.data_nodes()
    }

    pub fn by_id(&self, id: u64) -> Option<DataNode> {
        self.meta.read(|c| c.data_nodes.get(&id).cloned())
    }

    pub fn by_url(&self, url: &str) -> Option<DataNode> {
        self.meta.read(|c| c.data_node_by_url(url).cloned())
    }

    /// Register a node by URL. Duplicate URLs and empty URLs are
    /// rejected; ids come from the metastore counter and are never
    /// reused after removal.
    pub async fn register(&self, url: &str) -> Result<DataNode> {
        let node = self.meta.create_data_node(url).await?;
        info!(id = node.id, url = node.url.as_str(), "registered data node");
        Ok(node)
    }

    /// Remove a node. Replicas it owned are rebalanced onto the
    /// remaining members by the catalog transition.
    pub async fn unregister(&self, id: u64) -> Result<()> {
        self.meta.delete_data_node(id).await?;
        self.health.remove(&id);
        info!(id, "unregistered data node");
        Ok(())
    }

    /// Ids of nodes currently considered live.
    pub fn live_ids(&self) -> Vec<u64> {
        self.all()
            .into_iter()
            .filter(|n| self.status(n.id) == NodeStatus::Up)
            .map(|n| n.id)
            .collect()
    }

    pub fn status(&self, id: u64) -> NodeStatus {
        self.health
            .get(&id)
            .map(|h| h.status)
            .unwrap_or(NodeStatus::Up)
    }

    /// Record a failed delivery to a node.
    pub fn mark_down(&self, id: u64) {
        let prev = self.status(id);
        self.health.insert(
            id,
            NodeHealth {
                status: NodeStatus::Down,
                since: Instant::now(),
            },
        );
        if prev != NodeStatus::Down {
            warn!(id, "data node marked down");
        }
    }

    /// Record a successful delivery to a node.
    pub fn mark_up(&self, id: u64) {
        let prev = self.status(id);
        self.health.insert(
            id,
            NodeHealth {
                status: NodeStatus::Up,
                since: Instant::now(),
            },
        );
        if prev == NodeStatus::Down {
            info!(id, "data node recovered");
        }
    }

    /// How long the node has held its current status.
    pub fn status_age(&self, id: u64) -> Option<std::time::Duration> {
        self.health.get(&id).map(|h| h.since.elapsed())
    }
}
