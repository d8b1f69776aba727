//! Server assembly: wires the broker, metastore, registry, shard router,
//! write and query pipelines, and background tasks into one node.

use crate::broker::{Broker, HttpBroker, LocalBroker};
use crate::clock::MonotonicClock;
use crate::cluster::{
    DataNodeRegistry, HandoffConfig, HintedHandoff, NodeIdentity, ReplicationConfig, Replicator,
};
use crate::config::Config;
use crate::cq::CqRunner;
use crate::meta::{DataNode, MetaStore};
use crate::query::QueryExecutor;
use crate::sharding::ShardRouter;
use crate::store::{MemShardStore, ShardStore};
use crate::write::WritePipeline;
use crate::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Version string advertised in the `X-Influxdb-Version` header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One Meridian node: broker leadership (when bootstrapping a cluster),
/// the replicated catalog, shard storage, and the write/query pipelines.
pub struct Server {
    pub config: Config,
    pub meta: Arc<MetaStore>,
    pub registry: Arc<DataNodeRegistry>,
    pub store: Arc<dyn ShardStore>,
    pub router: Arc<ShardRouter>,
    pub replicator: Arc<Replicator>,
    pub pipeline: Arc<WritePipeline>,
    pub executor: Arc<QueryExecutor>,
    pub handoff: Arc<HintedHandoff>,
    pub identity: Arc<NodeIdentity>,
    pub clock: Arc<MonotonicClock>,
    pub cq: Arc<CqRunner>,
    local_broker: Option<Arc<LocalBroker>>,
    leader_url: Option<String>,
    cancel: CancellationToken,
}

impl Server {
    /// Open a node from configuration. An empty `join-urls` list
    /// bootstraps a new cluster with this node as the broker leader;
    /// otherwise the node follows the given leader.
    pub async fn open(config: Config) -> Result<Arc<Self>> {
        let cancel = CancellationToken::new();

        let mut local_broker = None;
        let mut leader_url = None;
        let broker: Arc<dyn Broker> = match config.initialization.join_urls.first() {
            None => {
                let broker = Arc::new(LocalBroker::open(&config.broker.dir)?);
                local_broker = Some(broker.clone());
                info!(dir = config.broker.dir.as_str(), "bootstrapped broker leader");
                broker
            }
            Some(url) => {
                let url = url.trim_end_matches('/').to_string();
                info!(leader = url.as_str(), "joining existing cluster");
                leader_url = Some(url.clone());
                Arc::new(HttpBroker::new(url))
            }
        };

        let meta = MetaStore::new(broker);
        meta.start(cancel.child_token()).await?;

        let registry = Arc::new(DataNodeRegistry::new(meta.clone()));
        let store: Arc<dyn ShardStore> = Arc::new(MemShardStore::new());
        let handoff = Arc::new(HintedHandoff::new(HandoffConfig {
            dir: Path::new(&config.cluster.dir).join("handoff"),
            ..Default::default()
        })?);
        handoff.start(registry.clone(), cancel.child_token());

        let identity = Arc::new(NodeIdentity::default());
        let clock = Arc::new(MonotonicClock::new());
        let replicator = Arc::new(Replicator::new(
            registry.clone(),
            store.clone(),
            handoff.clone(),
            identity.clone(),
            ReplicationConfig::default(),
        ));
        let router = Arc::new(ShardRouter::new(
            meta.clone(),
            registry.clone(),
            clock.clone(),
            config.data.write_skew_window,
        ));
        let pipeline = Arc::new(WritePipeline::new(
            meta.clone(),
            router.clone(),
            replicator.clone(),
            clock.clone(),
        ));
        let executor = Arc::new(QueryExecutor::new(
            meta.clone(),
            router.clone(),
            store.clone(),
            registry.clone(),
            identity.clone(),
        ));
        let cq = Arc::new(CqRunner::new(
            meta.clone(),
            executor.clone(),
            pipeline.clone(),
            identity.clone(),
            clock.clone(),
        ));
        cq.clone().start(cancel.child_token());

        let server = Arc::new(Self {
            config,
            meta,
            registry,
            store,
            router,
            replicator,
            pipeline,
            executor,
            handoff,
            identity,
            clock,
            cq,
            local_broker,
            leader_url,
            cancel,
        });

        // Adopt the node id if this server's advertised URL is already
        // registered (a restart after joining).
        if let Some(url) = server.config.data.advertise_url.clone() {
            if let Some(node) = server.registry.by_url(&url) {
                server.adopt_identity(&node);
            }
        }

        server.start_retention_enforcement();
        Ok(server)
    }

    /// This node's data-node id; zero until it registers.
    pub fn id(&self) -> u64 {
        self.identity.get()
    }

    /// Index of the last applied catalog entry.
    pub fn index(&self) -> u64 {
        self.meta.applied_index()
    }

    pub fn is_leader(&self) -> bool {
        self.local_broker.is_some()
    }

    pub fn local_broker(&self) -> Option<&Arc<LocalBroker>> {
        self.local_broker.as_ref()
    }

    pub fn leader_url(&self) -> Option<&str> {
        self.leader_url.as_deref()
    }

    pub fn auth_required(&self) -> bool {
        self.config.authentication.enabled
    }

    /// Take this node's cluster identity from a registered data node.
    pub fn adopt_identity(&self, node: &DataNode) {
        info!(id = node.id, url = node.url.as_str(), "adopted data node identity");
        self.identity.set(node.id);
    }

    /// Whether a freshly registered node is this server.
    pub fn is_self(&self, node: &DataNode) -> bool {
        self.config
            .data
            .advertise_url
            .as_deref()
            .map(|u| u.trim_end_matches('/') == node.url.trim_end_matches('/'))
            .unwrap_or(false)
    }

    /// Provision the broker side of a new data node. With a streaming
    /// broker there is nothing to allocate, but a follower must confirm
    /// the leader is reachable so registration can fail fast.
    pub async fn create_broker_replica(&self, node_id: u64) -> Result<()> {
        if self.local_broker.is_some() {
            return Ok(());
        }
        let Some(leader) = self.leader_url.as_deref() else {
            return Err(Error::BrokerUnavailable("no leader configured".into()));
        };
        let url = format!("{leader}/ping");
        let resp = reqwest::Client::new()
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::BrokerUnavailable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::BrokerUnavailable(format!(
                "leader rejected replica for node {node_id}: {}",
                resp.status()
            )))
        }
    }

    fn start_retention_enforcement(self: &Arc<Self>) {
        let server = Arc::clone(self);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let period = server.config.data.retention_check_period;
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // the immediate first tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let now = server.clock.now_nanos();
                match server.meta.purge_expired_shard_groups(now).await {
                    Ok(shards) => {
                        for shard_id in shards {
                            if let Err(e) = server.store.drop_shard(shard_id).await {
                                warn!(shard_id, error = %e, "dropping expired shard failed");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "retention enforcement failed"),
                }
            }
        });
    }

    /// Stop background tasks.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
