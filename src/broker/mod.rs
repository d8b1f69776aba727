//! Broker client: ordering of catalog proposals and streaming of
//! committed log entries.
//!
//! The broker assigns each accepted proposal a monotonically increasing
//! index. Subscribers replay the committed log from any starting index and
//! then follow the live tail; for any two proposals P1 accepted before P2,
//! every subscriber observes P1 first.

use crate::meta::{LogEntry, Proposal};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Capacity of a subscriber channel; slow consumers block the tail task,
/// they never skip entries.
const STREAM_BUFFER: usize = 256;

/// Deadline for locating a leader before a proposal fails.
const JOIN_DEADLINE: Duration = Duration::from_secs(30);

/// Orders proposals and streams committed entries.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Submit a proposal; returns its assigned log index once committed.
    async fn propose(&self, proposal: Proposal) -> Result<u64>;

    /// Stream committed entries starting at `from_index` (1-based,
    /// inclusive), then follow the live tail.
    async fn stream(&self, from_index: u64) -> Result<mpsc::Receiver<LogEntry>>;

    /// Index of the most recently committed entry known to this client.
    fn current_index(&self) -> u64;
}

/// The in-process broker held by the cluster leader. Entries are appended
/// to a JSON-lines file under the broker directory and replayed on open.
pub struct LocalBroker {
    log: Mutex<Vec<LogEntry>>,
    tail: broadcast::Sender<LogEntry>,
    path: Option<PathBuf>,
}

impl LocalBroker {
    /// An ephemeral broker with no backing file.
    pub fn new() -> Self {
        let (tail, _) = broadcast::channel(STREAM_BUFFER);
        Self {
            log: Mutex::new(Vec::new()),
            tail,
            path: None,
        }
    }

    /// Open the broker log under `dir`, replaying any existing entries.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("log.jsonl");
        let mut log = Vec::new();
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            for (lineno, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LogEntry = serde_json::from_str(line).map_err(|e| {
                    Error::Internal(format!(
                        "corrupt broker log at {}:{}: {e}",
                        path.display(),
                        lineno + 1
                    ))
                })?;
                log.push(entry);
            }
        }
        debug!(entries = log.len(), path = %path.display(), "opened broker log");
        let (tail, _) = broadcast::channel(STREAM_BUFFER);
        Ok(Self {
            log: Mutex::new(log),
            tail,
            path: Some(path),
        })
    }

    /// All committed entries with index >= `from_index`.
    pub fn entries_from(&self, from_index: u64) -> Vec<LogEntry> {
        let log = self.log.lock();
        let start = (from_index.saturating_sub(1)) as usize;
        log.get(start.min(log.len())..)
            .unwrap_or_default()
            .to_vec()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn propose(&self, proposal: Proposal) -> Result<u64> {
        let entry = {
            let mut log = self.log.lock();
            let index = log.len() as u64 + 1;
            let entry = LogEntry { index, proposal };
            if let Some(path) = &self.path {
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                serde_json::to_writer(&mut file, &entry)?;
                file.write_all(b"\n")?;
                file.sync_data()?;
            }
            log.push(entry.clone());
            entry
        };
        let index = entry.index;
        // No receivers is fine: subscribers replay from the log.
        let _ = self.tail.send(entry);
        Ok(index)
    }

    async fn stream(&self, from_index: u64) -> Result<mpsc::Receiver<LogEntry>> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        // Subscribe under the lock so no entry falls between the backlog
        // snapshot and the live tail.
        let (backlog, mut tail) = {
            let log = self.log.lock();
            let start = (from_index.saturating_sub(1)) as usize;
            let backlog: Vec<LogEntry> = log
                .get(start.min(log.len())..)
                .unwrap_or_default()
                .to_vec();
            (backlog, self.tail.subscribe())
        };
        tokio::spawn(async move {
            let mut next = from_index;
            for entry in backlog {
                next = entry.index + 1;
                if tx.send(entry).await.is_err() {
                    return;
                }
            }
            loop {
                match tail.recv().await {
                    Ok(entry) => {
                        if entry.index < next {
                            continue; // already delivered from the backlog
                        }
                        next = entry.index + 1;
                        if tx.send(entry).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "broker subscriber lagged; resubscribe required");
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(rx)
    }

    fn current_index(&self) -> u64 {
        self.log.lock().len() as u64
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ProposeResponse {
    index: u64,
}

/// A broker client for follower nodes: proposals are posted to the
/// current leader over HTTP, committed entries are pulled from its
/// streaming endpoint.
pub struct HttpBroker {
    client: reqwest::Client,
    leader_url: Mutex<String>,
    seen_index: AtomicU64,
}

impl HttpBroker {
    pub fn new(leader_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            leader_url: Mutex::new(leader_url.into()),
            seen_index: AtomicU64::new(0),
        }
    }

    fn leader(&self) -> String {
        self.leader_url.lock().clone()
    }

    fn observe(&self, index: u64) {
        self.seen_index.fetch_max(index, Ordering::AcqRel);
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn propose(&self, proposal: Proposal) -> Result<u64> {
        let deadline = tokio::time::Instant::now() + JOIN_DEADLINE;
        let mut backoff = Duration::from_millis(100);
        loop {
            let url = format!("{}/broker/propose", self.leader());
            let result = self.client.post(&url).json(&proposal).send().await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    let body: ProposeResponse = resp
                        .json()
                        .await
                        .map_err(|e| Error::BrokerUnavailable(e.to_string()))?;
                    self.observe(body.index);
                    return Ok(body.index);
                }
                Ok(resp) if resp.status().is_redirection() => {
                    // Not the leader; follow its hint and retry.
                    if let Some(loc) = resp
                        .headers()
                        .get(reqwest::header::LOCATION)
                        .and_then(|v| v.to_str().ok())
                    {
                        let base = loc.trim_end_matches("/broker/propose").to_string();
                        *self.leader_url.lock() = base;
                        continue;
                    }
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Err(Error::BrokerUnavailable(format!("{status}: {text}")));
                }
                Err(e) => {
                    debug!(error = %e, "proposal attempt failed");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::UnableToJoin);
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    }

    async fn stream(&self, from_index: u64) -> Result<mpsc::Receiver<LogEntry>> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let client = self.client.clone();
        let leader = self.leader();
        tokio::spawn(async move {
            let mut next = from_index;
            let mut backoff = Duration::from_millis(100);
            loop {
                let url = format!("{leader}/broker/stream?from={next}");
                match client.get(&url).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        match resp.json::<Vec<LogEntry>>().await {
                            Ok(entries) => {
                                backoff = Duration::from_millis(100);
                                let got_any = !entries.is_empty();
                                for entry in entries {
                                    if entry.index < next {
                                        continue;
                                    }
                                    next = entry.index + 1;
                                    if tx.send(entry).await.is_err() {
                                        return;
                                    }
                                }
                                if !got_any {
                                    tokio::time::sleep(Duration::from_millis(250)).await;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "bad broker stream payload");
                                tokio::time::sleep(backoff).await;
                                backoff = (backoff * 2).min(Duration::from_secs(30));
                            }
                        }
                    }
                    Ok(resp) => {
                        warn!(status = %resp.status(), "broker stream rejected");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(30));
                    }
                    Err(e) => {
                        debug!(error = %e, "broker stream disconnected");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(30));
                    }
                }
            }
        });
        Ok(rx)
    }

    fn current_index(&self) -> u64 {
        self.seen_index.load(Ordering::Acquire)
    }
}
