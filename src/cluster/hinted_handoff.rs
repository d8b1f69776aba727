//! Hinted handoff: deferred replication to unreachable shard owners.
//!
//! Each target node gets one append-only queue file of framed records.
//! A single writer appends, a single drainer replays in order and
//! truncates the file once the peer has acknowledged everything. Replica
//! application is idempotent, so redelivery after a crash is harmless.

use crate::cluster::DataNodeRegistry;
use crate::store::StoredPoint;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAGIC: &[u8; 4] = b"MHHQ";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 4 + 4;

/// Handoff queue configuration.
#[derive(Debug, Clone)]
pub struct HandoffConfig {
    /// Directory for per-node queue files.
    pub dir: PathBuf,
    /// First retry delay after a failed delivery.
    pub retry_interval: Duration,
    /// Retry delay cap.
    pub retry_max_interval: Duration,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/meridian/cluster/handoff"),
            retry_interval: Duration::from_millis(100),
            retry_max_interval: Duration::from_secs(30),
        }
    }
}

/// One deferred shard write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub shard_id: u64,
    pub points: Vec<StoredPoint>,
}

struct NodeQueue {
    lock: Mutex<()>,
    backoff: Mutex<Duration>,
}

/// Persistent per-node handoff queues.
pub struct HintedHandoff {
    config: HandoffConfig,
    queues: DashMap<u64, Arc<NodeQueue>>,
}

impl HintedHandoff {
    pub fn new(config: HandoffConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        Ok(Self {
            config,
            queues: DashMap::new(),
        })
    }

    fn queue(&self, node_id: u64) -> Arc<NodeQueue> {
        self.queues
            .entry(node_id)
            .or_insert_with(|| {
                Arc::new(NodeQueue {
                    lock: Mutex::new(()),
                    backoff: Mutex::new(self.config.retry_interval),
                })
            })
            .clone()
    }

    fn node_path(&self, node_id: u64) -> PathBuf {
        self.config.dir.join(format!("node-{node_id}.hh"))
    }

    /// Append a record to a node's queue.
    pub fn enqueue(&self, node_id: u64, record: &HandoffRecord) -> Result<()> {
        let queue = self.queue(node_id);
        let _guard = queue.lock.lock();
        let payload = serde_json::to_vec(record)?;
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(MAGIC);
        frame.push(VERSION);
        frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.node_path(node_id))?;
        file.write_all(&frame)?;
        file.sync_data()?;
        debug!(node_id, shard_id = record.shard_id, "write deferred to handoff queue");
        Ok(())
    }

    /// Records queued for a node, in enqueue order.
    pub fn read_records(&self, node_id: u64) -> Result<Vec<HandoffRecord>> {
        let queue = self.queue(node_id);
        let _guard = queue.lock.lock();
        self.read_records_locked(node_id)
    }

    fn read_records_locked(&self, node_id: u64) -> Result<Vec<HandoffRecord>> {
        let path = self.node_path(node_id);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset + HEADER_LEN <= data.len() {
            if &data[offset..offset + 4] != MAGIC || data[offset + 4] != VERSION {
                warn!(node_id, offset, "corrupt handoff frame header; truncating tail");
                break;
            }
            let crc = u32::from_be_bytes(data[offset + 5..offset + 9].try_into().unwrap());
            let len = u32::from_be_bytes(data[offset + 9..offset + 13].try_into().unwrap()) as usize;
            let start = offset + HEADER_LEN;
            let Some(payload) = data.get(start..start + len) else {
                warn!(node_id, offset, "truncated handoff frame; will retry after next append");
                break;
            };
            if crc32fast::hash(payload) != crc {
                warn!(node_id, offset, "handoff frame checksum mismatch; truncating tail");
                break;
            }
            match serde_json::from_slice(payload) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(node_id, offset, error = %e, "undecodable handoff frame; truncating tail");
                    break;
                }
            }
            offset = start + len;
        }
        Ok(records)
    }

    /// Number of records queued for a node.
    pub fn pending(&self, node_id: u64) -> Result<usize> {
        Ok(self.read_records(node_id)?.len())
    }

    /// Node ids with a non-empty queue.
    pub fn queued_nodes(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.config.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name
                .strip_prefix("node-")
                .and_then(|s| s.strip_suffix(".hh"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                if entry.metadata()?.len() > 0 {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Deliver a node's queue to its URL. On full success the queue file
    /// is truncated; on the first failure the remainder stays queued.
    pub async fn drain_node(
        &self,
        node_id: u64,
        base_url: &str,
        client: &reqwest::Client,
    ) -> Result<usize> {
        let records = self.read_records(node_id)?;
        if records.is_empty() {
            return Ok(0);
        }
        let total = records.len();
        for record in &records {
            let url = format!("{base_url}/shards/{}/write", record.shard_id);
            let resp = client
                .post(&url)
                .json(&record.points)
                .send()
                .await
                .map_err(|e| Error::Internal(format!("handoff delivery: {e}")))?;
            if !resp.status().is_success() {
                return Err(Error::Internal(format!(
                    "handoff delivery rejected: {}",
                    resp.status()
                )));
            }
        }
        let queue = self.queue(node_id);
        let _guard = queue.lock.lock();
        // Replays between read and truncate are tolerated: replica writes
        // are idempotent, and concurrent enqueues serialize on this lock.
        let appended = self.read_records_locked(node_id)?;
        if appended.len() > total {
            let keep = &appended[total..];
            std::fs::remove_file(self.node_path(node_id))?;
            drop(_guard);
            for record in keep {
                self.enqueue(node_id, record)?;
            }
        } else {
            std::fs::remove_file(self.node_path(node_id))?;
        }
        info!(node_id, drained = total, "handoff queue drained");
        Ok(total)
    }

    /// Run the drain loop until cancelled. Each node retries on an
    /// exponential backoff from `retry_interval` up to
    /// `retry_max_interval`.
    pub fn start(
        self: &Arc<Self>,
        registry: Arc<DataNodeRegistry>,
        cancel: CancellationToken,
    ) {
        let handoff = Arc::clone(self);
        let client = reqwest::Client::new();
        tokio::spawn(async move {
            let mut next_attempt: std::collections::HashMap<u64, tokio::time::Instant> =
                std::collections::HashMap::new();
            let tick = handoff.config.retry_interval;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(tick) => {}
                }
                let nodes = match handoff.queued_nodes() {
                    Ok(nodes) => nodes,
                    Err(e) => {
                        warn!(error = %e, "cannot list handoff queues");
                        continue;
                    }
                };
                let now = tokio::time::Instant::now();
                for node_id in nodes {
                    if next_attempt.get(&node_id).map(|t| now < *t).unwrap_or(false) {
                        continue;
                    }
                    let Some(node) = registry.by_id(node_id) else {
                        // Node left the cluster; its replicas were
                        // rebalanced, drop the queue.
                        info!(node_id, "dropping handoff queue for removed node");
                        let _ = std::fs::remove_file(handoff.node_path(node_id));
                        continue;
                    };
                    match handoff.drain_node(node_id, &node.url, &client).await {
                        Ok(_) => {
                            registry.mark_up(node_id);
                            *handoff.queue(node_id).backoff.lock() =
                                handoff.config.retry_interval;
                            next_attempt.remove(&node_id);
                        }
                        Err(e) => {
                            registry.mark_down(node_id);
                            let queue = handoff.queue(node_id);
                            let mut backoff = queue.backoff.lock();
                            debug!(node_id, error = %e, backoff = ?*backoff, "handoff retry failed");
                            next_attempt.insert(node_id, now + *backoff);
                            *backoff = (*backoff * 2).min(handoff.config.retry_max_interval);
                        }
                    }
                }
            }
        });
    }
}
