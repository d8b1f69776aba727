//! Write replication: local shard writes plus fan-out to peer owners.
//!
//! The coordinator writes its own replica first, then posts the batch to
//! the remaining owners. A write acknowledges once `W` owners have it;
//! owners that fail are repaired asynchronously through the hinted
//! handoff queue.

use crate::cluster::{DataNodeRegistry, HandoffRecord, HintedHandoff, NodeIdentity};
use crate::store::{ShardStore, StoredPoint};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Replication policy.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Acks required before a write returns success.
    pub write_quorum: usize,
    /// Per-peer request timeout.
    pub request_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            write_quorum: 1,
            request_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Replicator {
    registry: Arc<DataNodeRegistry>,
    store: Arc<dyn ShardStore>,
    handoff: Arc<HintedHandoff>,
    client: reqwest::Client,
    identity: Arc<NodeIdentity>,
    config: ReplicationConfig,
}

impl Replicator {
    pub fn new(
        registry: Arc<DataNodeRegistry>,
        store: Arc<dyn ShardStore>,
        handoff: Arc<HintedHandoff>,
        identity: Arc<NodeIdentity>,
        config: ReplicationConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            registry,
            store,
            handoff,
            client,
            identity,
            config,
        }
    }

    pub fn set_local_node_id(&self, id: u64) {
        self.identity.set(id);
    }

    pub fn local_node_id(&self) -> u64 {
        self.identity.get()
    }

    /// Replicate one shard's batch onto its owner set.
    ///
    /// Returns once `W` owners acknowledged. Remaining deliveries finish
    /// in the background; failures are deferred to the handoff queue.
    pub async fn replicate(
        &self,
        shard_id: u64,
        owners: &[u64],
        points: Vec<StoredPoint>,
    ) -> Result<()> {
        let local = self.local_node_id();
        let mut acks = 0usize;

        // An empty owner set means no data nodes are registered: the
        // write lives on this node alone.
        if owners.is_empty() || owners.contains(&local) {
            self.store.write(shard_id, &points).await?;
            acks += 1;
        }

        let remotes: Vec<u64> = owners.iter().copied().filter(|id| *id != local).collect();
        let (tx, mut rx) = mpsc::channel::<bool>(remotes.len().max(1));
        let mut inflight = 0usize;
        for node_id in remotes {
            let Some(node) = self.registry.by_id(node_id) else {
                debug!(node_id, "skipping replication to unknown node");
                continue;
            };
            inflight += 1;
            let client = self.client.clone();
            let registry = Arc::clone(&self.registry);
            let handoff = Arc::clone(&self.handoff);
            let points = points.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let url = format!("{}/shards/{}/write", node.url, shard_id);
                let ok = match client.post(&url).json(&points).send().await {
                    Ok(resp) if resp.status().is_success() => true,
                    Ok(resp) => {
                        warn!(node_id, status = %resp.status(), "peer rejected replica write");
                        false
                    }
                    Err(e) => {
                        debug!(node_id, error = %e, "peer replica write failed");
                        false
                    }
                };
                if ok {
                    registry.mark_up(node_id);
                } else {
                    registry.mark_down(node_id);
                    if let Err(e) = handoff.enqueue(node_id, &HandoffRecord { shard_id, points }) {
                        warn!(node_id, error = %e, "handoff enqueue failed; replica write lost");
                    }
                }
                let _ = tx.send(ok).await;
            });
        }
        drop(tx);

        while acks < self.config.write_quorum && inflight > 0 {
            match rx.recv().await {
                Some(true) => acks += 1,
                Some(false) => {}
                None => break,
            }
            inflight -= 1;
        }

        if acks >= self.config.write_quorum.min(owners.len().max(1)) {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "write quorum not reached: {acks} of {}",
                self.config.write_quorum
            )))
        }
    }
}
