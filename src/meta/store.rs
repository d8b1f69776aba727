//! The metastore: a replicated catalog driven by the broker log.
//!
//! Reads take a shared lock over the in-memory catalog. Mutations are
//! proposed to the broker, and a single apply task folds committed entries
//! into the catalog in index order. A proposal helper returns only after
//! its own entry has been applied locally, so a caller observes its write.

use crate::broker::Broker;
use crate::meta::{
    cq_lease_key, shard_group_duration_for, validate_username, Catalog, ContinuousQuery, DataNode,
    LogEntry, Privilege, Proposal,
};
use crate::points::{series_key, FieldType, FieldValue, Tags};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Deadline for a proposal to be ordered and applied locally.
const PROPOSAL_DEADLINE: Duration = Duration::from_secs(30);

/// Snapshot framing: magic, version, CRC32 (BE), payload length (BE).
const SNAPSHOT_MAGIC: &[u8; 4] = b"MSNP";
const SNAPSHOT_VERSION: u8 = 1;
const SNAPSHOT_HEADER_LEN: usize = 4 + 1 + 4 + 8;

pub struct MetaStore {
    catalog: RwLock<Catalog>,
    broker: Arc<dyn Broker>,
    applied_tx: watch::Sender<u64>,
    applied_rx: watch::Receiver<u64>,
}

impl MetaStore {
    pub fn new(broker: Arc<dyn Broker>) -> Arc<Self> {
        let (applied_tx, applied_rx) = watch::channel(0);
        Arc::new(Self {
            catalog: RwLock::new(Catalog::default()),
            broker,
            applied_tx,
            applied_rx,
        })
    }

    /// Start the apply task: replay committed entries from the last
    /// applied index and then follow the live tail.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let from = self.applied_index() + 1;
        let mut stream = self.broker.stream(from).await?;
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("metastore apply task stopped");
                        return;
                    }
                    entry = stream.recv() => {
                        match entry {
                            Some(entry) => store.apply(&entry),
                            None => {
                                error!("broker stream ended; metastore is frozen");
                                return;
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Fold one committed entry into the catalog.
    pub fn apply(&self, entry: &LogEntry) {
        {
            let mut catalog = self.catalog.write();
            catalog.apply(entry);
        }
        let _ = self.applied_tx.send(entry.index);
        debug!(index = entry.index, "applied log entry");
    }

    /// Run a closure against a consistent snapshot view of the catalog.
    pub fn read<R>(&self, f: impl FnOnce(&Catalog) -> R) -> R {
        f(&self.catalog.read())
    }

    pub fn applied_index(&self) -> u64 {
        self.catalog.read().applied_index
    }

    pub fn user_count(&self) -> usize {
        self.catalog.read().user_count()
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.catalog.read().database_exists(name)
    }

    pub fn user(&self, name: &str) -> Option<crate::meta::User> {
        self.catalog.read().users.get(name).cloned()
    }

    pub fn data_nodes(&self) -> Vec<DataNode> {
        self.catalog.read().data_nodes.values().cloned().collect()
    }

    async fn propose_and_wait(&self, proposal: Proposal) -> Result<u64> {
        let index = self.broker.propose(proposal).await?;
        self.wait_for_index(index).await?;
        Ok(index)
    }

    /// Block until the apply task has folded `index` into the catalog.
    pub async fn wait_for_index(&self, index: u64) -> Result<()> {
        let mut rx = self.applied_rx.clone();
        let wait = async {
            loop {
                if *rx.borrow() >= index {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(Error::Internal("metastore apply task gone".into()));
                }
            }
        };
        tokio::time::timeout(PROPOSAL_DEADLINE, wait)
            .await
            .map_err(|_| Error::BrokerUnavailable("proposal apply timed out".into()))?
    }

    // Databases

    pub async fn create_database(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::DatabaseNameRequired);
        }
        if self.database_exists(name) {
            return Err(Error::DatabaseExists);
        }
        self.propose_and_wait(Proposal::CreateDatabase { name: name.to_string() })
            .await?;
        Ok(())
    }

    /// Drop a database, returning the ids of the shards it referenced so
    /// the caller can release their storage.
    pub async fn drop_database(&self, name: &str) -> Result<Vec<u64>> {
        let shard_ids = self.read(|c| c.database(name).map(|db| db.shard_ids()))?;
        self.propose_and_wait(Proposal::DropDatabase { name: name.to_string() })
            .await?;
        Ok(shard_ids)
    }

    // Retention policies

    pub async fn create_retention_policy(
        &self,
        database: &str,
        name: &str,
        duration: i64,
        replica_n: u32,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(Error::RetentionPolicyNameRequired);
        }
        if replica_n == 0 {
            return Err(Error::InvalidQuery(
                "replication factor must be at least 1".into(),
            ));
        }
        self.read(|c| {
            let db = c.database(database)?;
            if db.policies.contains_key(name) {
                return Err(Error::RetentionPolicyExists);
            }
            Ok(())
        })?;
        self.propose_and_wait(Proposal::CreateRetentionPolicy {
            database: database.to_string(),
            name: name.to_string(),
            duration,
            replica_n,
            shard_group_duration: shard_group_duration_for(duration),
        })
        .await?;
        Ok(())
    }

    pub async fn drop_retention_policy(&self, database: &str, name: &str) -> Result<()> {
        self.read(|c| {
            let db = c.database(database)?;
            if !db.policies.contains_key(name) {
                return Err(Error::RetentionPolicyNotFound);
            }
            Ok(())
        })?;
        self.propose_and_wait(Proposal::DropRetentionPolicy {
            database: database.to_string(),
            name: name.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn set_default_retention_policy(&self, database: &str, name: &str) -> Result<()> {
        self.read(|c| {
            let db = c.database(database)?;
            if !db.policies.contains_key(name) {
                return Err(Error::RetentionPolicyNotFound);
            }
            Ok(())
        })?;
        self.propose_and_wait(Proposal::SetDefaultRetentionPolicy {
            database: database.to_string(),
            name: name.to_string(),
        })
        .await?;
        Ok(())
    }

    // Users

    /// Create a user. The first user in the cluster becomes an admin so a
    /// fresh deployment can be bootstrapped.
    pub async fn create_user(&self, name: &str, password: &str) -> Result<()> {
        validate_username(name)?;
        if self.user(name).is_some() {
            return Err(Error::UserExists);
        }
        let admin = self.user_count() == 0;
        let hash = crate::auth::hash_password(password);
        self.propose_and_wait(Proposal::CreateUser {
            name: name.to_string(),
            hash,
            admin,
        })
        .await?;
        Ok(())
    }

    pub async fn update_user_password(&self, name: &str, password: &str) -> Result<()> {
        if self.user(name).is_none() {
            return Err(Error::UserNotFound);
        }
        let hash = crate::auth::hash_password(password);
        self.propose_and_wait(Proposal::UpdateUserPassword {
            name: name.to_string(),
            hash,
        })
        .await?;
        Ok(())
    }

    pub async fn delete_user(&self, name: &str) -> Result<()> {
        if self.user(name).is_none() {
            return Err(Error::UserNotFound);
        }
        self.propose_and_wait(Proposal::DeleteUser { name: name.to_string() })
            .await?;
        Ok(())
    }

    pub async fn set_privilege(
        &self,
        name: &str,
        database: &str,
        privilege: Option<Privilege>,
    ) -> Result<()> {
        if self.user(name).is_none() {
            return Err(Error::UserNotFound);
        }
        self.propose_and_wait(Proposal::SetPrivilege {
            name: name.to_string(),
            database: database.to_string(),
            privilege,
        })
        .await?;
        Ok(())
    }

    // Data nodes

    pub async fn create_data_node(&self, url: &str) -> Result<DataNode> {
        if url.is_empty() {
            return Err(Error::DataNodeUrlRequired);
        }
        if self.read(|c| c.data_node_by_url(url).is_some()) {
            return Err(Error::DataNodeExists);
        }
        self.propose_and_wait(Proposal::CreateDataNode { url: url.to_string() })
            .await?;
        self.read(|c| c.data_node_by_url(url).cloned())
            .ok_or_else(|| Error::Internal("data node missing after apply".into()))
    }

    pub async fn delete_data_node(&self, id: u64) -> Result<()> {
        if !self.read(|c| c.data_nodes.contains_key(&id)) {
            return Err(Error::DataNodeNotFound);
        }
        self.propose_and_wait(Proposal::DeleteDataNode { id }).await?;
        Ok(())
    }

    // Shard groups

    /// Ensure a shard group exists for the window containing `timestamp`,
    /// creating one with owners drawn from `live_nodes` when absent.
    pub async fn create_shard_group(
        &self,
        database: &str,
        policy: &str,
        timestamp: i64,
        live_nodes: &[u64],
    ) -> Result<()> {
        let shard_owners = self.read(|c| -> Result<Option<Vec<Vec<u64>>>> {
            let db = c.database(database)?;
            let rp = db.policy(policy)?;
            if rp.shard_group_containing(timestamp).is_some() {
                return Ok(None);
            }
            let replica_n = rp.replica_n as usize;
            let shard_n = if live_nodes.is_empty() {
                1
            } else {
                (live_nodes.len() / replica_n).max(1)
            };
            let mut counts = c.shard_counts();
            counts.retain(|id, _| live_nodes.contains(id));
            let mut owner_sets = Vec::with_capacity(shard_n);
            for _ in 0..shard_n {
                let mut owners: Vec<u64> = Vec::with_capacity(replica_n);
                for _ in 0..replica_n.min(live_nodes.len()) {
                    let next = counts
                        .iter()
                        .filter(|(id, _)| !owners.contains(*id))
                        .min_by_key(|(id, count)| (**count, **id))
                        .map(|(id, _)| *id);
                    match next {
                        Some(id) => {
                            owners.push(id);
                            *counts.entry(id).or_insert(0) += 1;
                        }
                        None => break,
                    }
                }
                owners.sort_unstable();
                owner_sets.push(owners);
            }
            Ok(Some(owner_sets))
        })?;
        let Some(shard_owners) = shard_owners else {
            return Ok(()); // window already covered
        };
        self.propose_and_wait(Proposal::CreateShardGroup {
            database: database.to_string(),
            policy: policy.to_string(),
            timestamp,
            shard_owners,
        })
        .await?;
        Ok(())
    }

    /// Drop shard groups older than their policy's retention cutoff,
    /// returning the shard ids that were released.
    pub async fn purge_expired_shard_groups(&self, now: i64) -> Result<Vec<u64>> {
        let expired: Vec<u64> = self.read(|c| {
            c.databases
                .values()
                .flat_map(|db| db.policies.values())
                .filter(|rp| rp.duration > 0)
                .flat_map(|rp| {
                    let cutoff = now - rp.duration;
                    rp.shard_groups
                        .iter()
                        .filter(move |g| g.end_time <= cutoff)
                        .flat_map(|g| g.shards.iter().map(|s| s.id))
                })
                .collect()
        });
        if expired.is_empty() {
            return Ok(Vec::new());
        }
        self.propose_and_wait(Proposal::DropExpiredShardGroups { now })
            .await?;
        Ok(expired)
    }

    // Series

    /// Assign an id to a new series. Fails if the series already exists.
    pub async fn create_series(
        &self,
        database: &str,
        measurement: &str,
        tags: &Tags,
        values: &BTreeMap<String, FieldValue>,
    ) -> Result<u64> {
        let key = series_key(measurement, tags);
        if self
            .read(|c| c.database(database).map(|db| db.series_by_key.contains_key(&key)))?
        {
            return Err(Error::SeriesExists);
        }
        self.create_series_if_not_exists(database, measurement, tags, values)
            .await
    }

    /// Idempotent series creation used by the write path. Validates the
    /// point's schema against the measurement and returns the series id.
    pub async fn create_series_if_not_exists(
        &self,
        database: &str,
        measurement: &str,
        tags: &Tags,
        values: &BTreeMap<String, FieldValue>,
    ) -> Result<u64> {
        if measurement.is_empty() {
            return Err(Error::MeasurementNameRequired);
        }
        if values.is_empty() {
            return Err(Error::ValuesRequired);
        }
        for key in values.keys() {
            if tags.contains_key(key) {
                return Err(Error::TagFieldKeyConflict(key.clone()));
            }
        }
        let key = series_key(measurement, tags);
        let (existing, new_fields) = self.read(|c| -> Result<(Option<u64>, BTreeMap<String, FieldType>)> {
            let db = c.database(database)?;
            let new_fields = match db.measurements.get(measurement) {
                Some(m) => m.check_fields(values)?,
                None => values
                    .iter()
                    .map(|(k, v)| (k.clone(), v.field_type()))
                    .collect(),
            };
            Ok((db.series_by_key.get(&key).copied(), new_fields))
        })?;
        if let (Some(id), true) = (existing, new_fields.is_empty()) {
            return Ok(id);
        }
        self.propose_and_wait(Proposal::CreateSeries {
            database: database.to_string(),
            measurement: measurement.to_string(),
            tags: tags.clone(),
            field_types: new_fields,
        })
        .await?;
        self.read(|c| {
            c.database(database)?
                .series_by_key
                .get(&key)
                .copied()
                .ok_or(Error::SeriesNotFound)
        })
    }

    // Continuous queries

    pub async fn create_continuous_query(&self, cq: ContinuousQuery) -> Result<()> {
        self.read(|c| {
            let db = c.database(&cq.database)?;
            if db.continuous_queries.contains_key(&cq.name) {
                return Err(Error::ContinuousQueryExists);
            }
            Ok(())
        })?;
        self.propose_and_wait(Proposal::CreateContinuousQuery {
            database: cq.database,
            name: cq.name,
            query: cq.query,
            target_measurement: cq.target_measurement,
            interval: cq.interval,
        })
        .await?;
        Ok(())
    }

    pub async fn drop_continuous_query(&self, database: &str, name: &str) -> Result<()> {
        self.read(|c| {
            let db = c.database(database)?;
            if !db.continuous_queries.contains_key(name) {
                return Err(Error::ContinuousQueryNotFound);
            }
            Ok(())
        })?;
        self.propose_and_wait(Proposal::DropContinuousQuery {
            database: database.to_string(),
            name: name.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn set_cq_last_run(&self, database: &str, name: &str, last_run: i64) -> Result<()> {
        self.propose_and_wait(Proposal::SetCqLastRun {
            database: database.to_string(),
            name: name.to_string(),
            last_run,
        })
        .await?;
        Ok(())
    }

    /// Try to take the lease for a continuous query. Returns whether this
    /// node holds it after the attempt.
    pub async fn acquire_cq_lease(
        &self,
        database: &str,
        name: &str,
        node_id: u64,
        now: i64,
        ttl: Duration,
    ) -> Result<bool> {
        let key = cq_lease_key(database, name);
        self.propose_and_wait(Proposal::AcquireCqLease {
            key: key.clone(),
            node_id,
            now,
            expires: now + ttl.as_nanos() as i64,
        })
        .await?;
        Ok(self.read(|c| {
            c.cq_leases
                .get(&key)
                .map(|l| l.holder == node_id)
                .unwrap_or(false)
        }))
    }

    pub async fn release_cq_lease(&self, database: &str, name: &str, node_id: u64) -> Result<()> {
        self.propose_and_wait(Proposal::ReleaseCqLease {
            key: cq_lease_key(database, name),
            node_id,
        })
        .await?;
        Ok(())
    }

    // Snapshot / restore

    /// Serialize the whole catalog as a self-describing binary blob.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let payload = self.read(|c| serde_json::to_vec(c))?;
        let crc = crc32fast::hash(&payload);
        let mut out = Vec::with_capacity(SNAPSHOT_HEADER_LEN + payload.len());
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.push(SNAPSHOT_VERSION);
        out.extend_from_slice(&crc.to_be_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Replace the catalog with a snapshot produced by [`snapshot`].
    ///
    /// [`snapshot`]: MetaStore::snapshot
    pub fn restore(&self, data: &[u8]) -> Result<()> {
        if data.len() < SNAPSHOT_HEADER_LEN {
            return Err(Error::InvalidSnapshot("truncated header".into()));
        }
        if &data[..4] != SNAPSHOT_MAGIC {
            return Err(Error::InvalidSnapshot("bad magic".into()));
        }
        if data[4] != SNAPSHOT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported version {}",
                data[4]
            )));
        }
        let crc = u32::from_be_bytes(data[5..9].try_into().unwrap());
        let len = u64::from_be_bytes(data[9..17].try_into().unwrap()) as usize;
        let payload = data
            .get(SNAPSHOT_HEADER_LEN..SNAPSHOT_HEADER_LEN + len)
            .ok_or_else(|| Error::InvalidSnapshot("truncated payload".into()))?;
        if crc32fast::hash(payload) != crc {
            return Err(Error::InvalidSnapshot("checksum mismatch".into()));
        }
        let catalog: Catalog =
            serde_json::from_slice(payload).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        let index = catalog.applied_index;
        *self.catalog.write() = catalog;
        let _ = self.applied_tx.send(index);
        info!(index, "catalog restored from snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;

    async fn started_store() -> Arc<MetaStore> {
        let broker: Arc<dyn Broker> = Arc::new(LocalBroker::new());
        let store = MetaStore::new(broker);
        store.start(CancellationToken::new()).await.unwrap();
        store
    }

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn values(pairs: &[(&str, f64)]) -> BTreeMap<String, FieldValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::F64(*v)))
            .collect()
    }

    #[tokio::test]
    async fn database_lifecycle() {
        let store = started_store().await;
        store.create_database("metrics").await.unwrap();
        assert!(store.database_exists("metrics"));
        assert!(matches!(
            store.create_database("metrics").await,
            Err(Error::DatabaseExists)
        ));
        assert!(matches!(
            store.create_database("").await,
            Err(Error::DatabaseNameRequired)
        ));
        store.drop_database("metrics").await.unwrap();
        assert!(!store.database_exists("metrics"));
        assert!(matches!(
            store.drop_database("metrics").await,
            Err(Error::DatabaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn first_user_is_admin() {
        let store = started_store().await;
        store.create_user("root", "secret").await.unwrap();
        store.create_user("reader", "pw").await.unwrap();
        assert!(store.user("root").unwrap().is_admin());
        assert!(!store.user("reader").unwrap().is_admin());
        assert!(matches!(
            store.create_user("root", "again").await,
            Err(Error::UserExists)
        ));
    }

    #[tokio::test]
    async fn series_creation_is_idempotent_and_strict_create_fails() {
        let store = started_store().await;
        store.create_database("metrics").await.unwrap();
        let t = tags(&[("host", "a")]);
        let v = values(&[("value", 1.0)]);
        let id1 = store
            .create_series_if_not_exists("metrics", "cpu", &t, &v)
            .await
            .unwrap();
        let id2 = store
            .create_series_if_not_exists("metrics", "cpu", &t, &v)
            .await
            .unwrap();
        assert_eq!(id1, id2);
        assert!(matches!(
            store.create_series("metrics", "cpu", &t, &v).await,
            Err(Error::SeriesExists)
        ));
    }

    #[tokio::test]
    async fn tag_field_collision_is_rejected() {
        let store = started_store().await;
        store.create_database("metrics").await.unwrap();
        let t = tags(&[("value", "oops")]);
        let v = values(&[("value", 1.0)]);
        let err = store
            .create_series_if_not_exists("metrics", "cpu", &t, &v)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("must be distinct"));
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let store = started_store().await;
        store.create_database("metrics").await.unwrap();
        store.create_user("root", "secret").await.unwrap();
        store
            .create_retention_policy("metrics", "weekly", 0, 1)
            .await
            .unwrap();
        let blob = store.snapshot().unwrap();

        let other = started_store().await;
        other.restore(&blob).unwrap();
        assert!(other.database_exists("metrics"));
        assert!(other.user("root").is_some());
        assert_eq!(other.applied_index(), store.applied_index());
    }

    #[tokio::test]
    async fn restore_rejects_corruption() {
        let store = started_store().await;
        store.create_database("metrics").await.unwrap();
        let mut blob = store.snapshot().unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(matches!(
            store.restore(&blob),
            Err(Error::InvalidSnapshot(_))
        ));
        assert!(matches!(
            store.restore(b"bogus"),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[tokio::test]
    async fn applied_index_is_monotonic() {
        let store = started_store().await;
        let mut last = store.applied_index();
        for i in 0..5 {
            store.create_database(&format!("db{i}")).await.unwrap();
            let index = store.applied_index();
            assert!(index > last);
            last = index;
        }
    }

    #[tokio::test]
    async fn shard_group_owner_assignment_balances_load() {
        let store = started_store().await;
        store.create_database("metrics").await.unwrap();
        store
            .create_retention_policy("metrics", "default", 0, 1)
            .await
            .unwrap();
        let n1 = store.create_data_node("http://a:8086").await.unwrap();
        let n2 = store.create_data_node("http://b:8086").await.unwrap();
        let live = vec![n1.id, n2.id];
        store
            .create_shard_group("metrics", "default", 0, &live)
            .await
            .unwrap();
        let owners: Vec<Vec<u64>> = store.read(|c| {
            c.database("metrics").unwrap().policy("default").unwrap().shard_groups[0]
                .shards
                .iter()
                .map(|s| s.owner_ids.clone())
                .collect()
        });
        // replicaN=1 over two live nodes: two shards, one owner each.
        assert_eq!(owners.len(), 2);
        assert_eq!(owners[0].len(), 1);
        assert_ne!(owners[0], owners[1], "owners must spread across nodes");
    }
}
