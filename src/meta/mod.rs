//! Catalog metadata: databases, retention policies, users, shards,
//! continuous queries, and data nodes.
//!
//! The catalog is a deterministic state machine. All mutation flows
//! through [`Proposal`] records ordered by the broker log; readers take a
//! consistent snapshot view. Nothing in this module performs I/O.

mod proposal;
mod store;

pub use proposal::{LogEntry, Proposal};
pub use store::MetaStore;

use crate::points::{series_key, FieldType, Tags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Upper bound on distinct fields per measurement.
pub const MAX_FIELDS_PER_MEASUREMENT: usize = 255;

/// Access level a user holds on a database (or `"*"` for the cluster).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    Read,
    Write,
    All,
}

impl Privilege {
    pub fn grants_read(&self) -> bool {
        matches!(self, Privilege::Read | Privilege::All)
    }

    pub fn grants_write(&self) -> bool {
        matches!(self, Privilege::Write | Privilege::All)
    }
}

/// A database user. Cluster admins hold `All` on `"*"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    /// `salt$hex(sha256(salt || password))`
    pub hash: String,
    #[serde(default)]
    pub privileges: BTreeMap<String, Privilege>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.privileges
            .get("*")
            .map(|p| p.grants_read() && p.grants_write())
            .unwrap_or(false)
    }

    /// Whether this user may read from `database`.
    pub fn can_read(&self, database: &str) -> bool {
        self.is_admin()
            || self
                .privileges
                .get(database)
                .map(Privilege::grants_read)
                .unwrap_or(false)
    }

    /// Whether this user may write to `database`.
    pub fn can_write(&self, database: &str) -> bool {
        self.is_admin()
            || self
                .privileges
                .get(database)
                .map(Privilege::grants_write)
                .unwrap_or(false)
    }
}

/// Usernames must be printable ASCII without whitespace, `:` or `/`.
pub fn validate_username(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::UsernameRequired);
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_graphic() && c != ':' && c != '/');
    if !ok {
        return Err(crate::Error::InvalidUsername);
    }
    Ok(())
}

/// A peer that stores shard replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataNode {
    pub id: u64,
    pub url: String,
}

/// A horizontal partition of a shard group, replicated onto `owner_ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: u64,
    pub owner_ids: Vec<u64>,
}

/// The set of shards covering one time window of a retention policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroup {
    pub id: u64,
    /// Inclusive start, nanoseconds.
    pub start_time: i64,
    /// Exclusive end, nanoseconds.
    pub end_time: i64,
    pub shards: Vec<Shard>,
}

impl ShardGroup {
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start_time && timestamp < self.end_time
    }

    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start_time < end && self.end_time > start
    }

    /// Stable shard selection by series-key hash.
    pub fn shard_for(&self, series_hash: u64) -> &Shard {
        let idx = (series_hash % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }
}

/// Per-database rule controlling data lifetime and replication factor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub name: String,
    /// Nanoseconds of history to keep; zero keeps data forever.
    pub duration: i64,
    pub replica_n: u32,
    /// Width of each shard group window, nanoseconds.
    pub shard_group_duration: i64,
    #[serde(default)]
    pub shard_groups: Vec<ShardGroup>,
}

impl RetentionPolicy {
    pub fn shard_group_containing(&self, timestamp: i64) -> Option<&ShardGroup> {
        self.shard_groups.iter().find(|g| g.contains(timestamp))
    }

    /// The half-open window `[start, end)` the timestamp falls in.
    pub fn window_for(&self, timestamp: i64) -> (i64, i64) {
        let d = self.shard_group_duration;
        let start = timestamp.div_euclid(d) * d;
        (start, start + d)
    }
}

const NANOS_PER_HOUR: i64 = 3_600_000_000_000;
const NANOS_PER_DAY: i64 = 24 * NANOS_PER_HOUR;

/// Default shard-group window for a retention duration: short-lived data
/// gets hourly groups, long-lived data weekly ones.
pub fn shard_group_duration_for(retention: i64) -> i64 {
    if retention > 0 && retention <= 2 * NANOS_PER_DAY {
        NANOS_PER_HOUR
    } else if retention > 0 && retention <= 180 * NANOS_PER_DAY {
        NANOS_PER_DAY
    } else {
        7 * NANOS_PER_DAY
    }
}

/// The field schema observed for a measurement so far. Fields are
/// append-only; a conflicting type for an existing name is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldType>,
}

impl Measurement {
    /// Validate a point's field types against the schema, returning the
    /// fields that would be newly created.
    pub fn check_fields(
        &self,
        values: &BTreeMap<String, crate::points::FieldValue>,
    ) -> crate::Result<BTreeMap<String, FieldType>> {
        let mut new_fields = BTreeMap::new();
        for (name, value) in values {
            let ft = value.field_type();
            match self.fields.get(name) {
                Some(existing) if *existing != ft => {
                    return Err(crate::Error::FieldTypeConflict(format!(
                        "field {name:?} is {existing}, got {ft}"
                    )));
                }
                Some(_) => {}
                None => {
                    new_fields.insert(name.clone(), ft);
                }
            }
        }
        if self.fields.len() + new_fields.len() > MAX_FIELDS_PER_MEASUREMENT {
            return Err(crate::Error::FieldOverflow);
        }
        Ok(new_fields)
    }
}

/// A stream of points sharing a measurement name and tag set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub id: u64,
    pub measurement: String,
    pub tags: Tags,
}

/// A saved query re-executed on an interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuousQuery {
    pub name: String,
    pub database: String,
    pub query: String,
    pub target_measurement: String,
    /// Nanoseconds between runs.
    pub interval: i64,
    /// End of the last materialized window, nanoseconds.
    #[serde(default)]
    pub last_run: i64,
}

/// A lease granting one node the right to run a continuous query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CqLease {
    pub holder: u64,
    pub expires: i64,
}

/// A database and everything scoped to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    #[serde(default)]
    pub policies: BTreeMap<String, RetentionPolicy>,
    #[serde(default)]
    pub default_retention_policy: Option<String>,
    #[serde(default)]
    pub measurements: BTreeMap<String, Measurement>,
    #[serde(default)]
    pub series_by_key: BTreeMap<String, u64>,
    #[serde(default)]
    pub series: BTreeMap<u64, SeriesInfo>,
    #[serde(default)]
    pub continuous_queries: BTreeMap<String, ContinuousQuery>,
}

impl DatabaseInfo {
    /// Resolve a policy name, falling back to the database default when
    /// the name is empty.
    pub fn policy(&self, name: &str) -> crate::Result<&RetentionPolicy> {
        let name = if name.is_empty() {
            self.default_retention_policy
                .as_deref()
                .ok_or(crate::Error::DefaultRetentionPolicyNotFound)?
        } else {
            name
        };
        self.policies
            .get(name)
            .ok_or(crate::Error::RetentionPolicyNotFound)
    }

    /// All shard ids in this database.
    pub fn shard_ids(&self) -> Vec<u64> {
        self.policies
            .values()
            .flat_map(|p| p.shard_groups.iter())
            .flat_map(|g| g.shards.iter().map(|s| s.id))
            .collect()
    }
}

/// The replicated catalog. Mutated only via [`Catalog::apply`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub databases: BTreeMap<String, DatabaseInfo>,
    pub users: BTreeMap<String, User>,
    pub data_nodes: BTreeMap<u64, DataNode>,
    pub cq_leases: BTreeMap<String, CqLease>,
    pub max_node_id: u64,
    pub max_shard_group_id: u64,
    pub max_shard_id: u64,
    pub max_series_id: u64,
    /// Index of the last applied log entry.
    pub applied_index: u64,
}

impl Catalog {
    pub fn database(&self, name: &str) -> crate::Result<&DatabaseInfo> {
        self.databases
            .get(name)
            .ok_or_else(|| crate::Error::DatabaseNotFound(name.to_string()))
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.databases.contains_key(name)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn data_node_by_url(&self, url: &str) -> Option<&DataNode> {
        self.data_nodes.values().find(|n| n.url == url)
    }

    /// Number of shard replicas owned by each node.
    pub fn shard_counts(&self) -> BTreeMap<u64, usize> {
        let mut counts: BTreeMap<u64, usize> =
            self.data_nodes.keys().map(|id| (*id, 0)).collect();
        for db in self.databases.values() {
            for policy in db.policies.values() {
                for group in &policy.shard_groups {
                    for shard in &group.shards {
                        for owner in &shard.owner_ids {
                            *counts.entry(*owner).or_insert(0) += 1;
                        }
                    }
                }
            }
        }
        counts
    }

    /// Choose `n` owners, least-loaded first, ties broken by ascending
    /// node id. `exclude` is removed from consideration.
    pub fn select_owners(&self, n: usize, exclude: &[u64]) -> Vec<u64> {
        let counts = self.shard_counts();
        let mut candidates: Vec<(usize, u64)> = counts
            .into_iter()
            .filter(|(id, _)| !exclude.contains(id))
            .map(|(id, count)| (count, id))
            .collect();
        candidates.sort();
        candidates.into_iter().take(n).map(|(_, id)| id).collect()
    }

    /// Apply a committed log entry. Idempotent: entries at or below
    /// `applied_index`, and entries whose effect is already present, are
    /// no-ops.
    pub fn apply(&mut self, entry: &LogEntry) {
        if entry.index <= self.applied_index {
            return;
        }
        self.apply_proposal(&entry.proposal);
        self.applied_index = entry.index;
    }

    fn apply_proposal(&mut self, proposal: &Proposal) {
        match proposal {
            Proposal::CreateDatabase { name } => {
                if name.is_empty() || self.databases.contains_key(name) {
                    return;
                }
                self.databases.insert(
                    name.clone(),
                    DatabaseInfo {
                        name: name.clone(),
                        ..Default::default()
                    },
                );
            }
            Proposal::DropDatabase { name } => {
                // Cascades policies, shards, series and CQs with the entry.
                self.databases.remove(name);
            }
            Proposal::CreateRetentionPolicy {
                database,
                name,
                duration,
                replica_n,
                shard_group_duration,
            } => {
                let Some(db) = self.databases.get_mut(database) else {
                    return;
                };
                if name.is_empty() || *replica_n == 0 || db.policies.contains_key(name) {
                    return;
                }
                db.policies.insert(
                    name.clone(),
                    RetentionPolicy {
                        name: name.clone(),
                        duration: *duration,
                        replica_n: *replica_n,
                        shard_group_duration: *shard_group_duration,
                        shard_groups: Vec::new(),
                    },
                );
                if db.default_retention_policy.is_none() {
                    db.default_retention_policy = Some(name.clone());
                }
            }
            Proposal::DropRetentionPolicy { database, name } => {
                let Some(db) = self.databases.get_mut(database) else {
                    return;
                };
                db.policies.remove(name);
                if db.default_retention_policy.as_deref() == Some(name) {
                    db.default_retention_policy = None;
                }
            }
            Proposal::SetDefaultRetentionPolicy { database, name } => {
                let Some(db) = self.databases.get_mut(database) else {
                    return;
                };
                if db.policies.contains_key(name) {
                    db.default_retention_policy = Some(name.clone());
                }
            }
            Proposal::CreateUser { name, hash, admin } => {
                if self.users.contains_key(name) || validate_username(name).is_err() {
                    return;
                }
                let mut privileges = BTreeMap::new();
                if *admin {
                    privileges.insert("*".to_string(), Privilege::All);
                }
                self.users.insert(
                    name.clone(),
                    User {
                        name: name.clone(),
                        hash: hash.clone(),
                        privileges,
                    },
                );
            }
            Proposal::UpdateUserPassword { name, hash } => {
                if let Some(user) = self.users.get_mut(name) {
                    user.hash = hash.clone();
                }
            }
            Proposal::DeleteUser { name } => {
                self.users.remove(name);
            }
            Proposal::SetPrivilege {
                name,
                database,
                privilege,
            } => {
                let Some(user) = self.users.get_mut(name) else {
                    return;
                };
                match privilege {
                    Some(p) => {
                        user.privileges.insert(database.clone(), *p);
                    }
                    None => {
                        user.privileges.remove(database);
                    }
                }
            }
            Proposal::CreateDataNode { url } => {
                if url.is_empty() || self.data_nodes.values().any(|n| n.url == *url) {
                    return;
                }
                self.max_node_id += 1;
                let id = self.max_node_id;
                self.data_nodes.insert(id, DataNode { id, url: url.clone() });
            }
            Proposal::DeleteDataNode { id } => {
                if self.data_nodes.remove(id).is_none() {
                    return;
                }
                self.rebalance_after_removal(*id);
            }
            Proposal::CreateShardGroup {
                database,
                policy,
                timestamp,
                shard_owners,
            } => {
                // ids are assigned here, so owner sets must come from the
                // proposer; this keeps apply deterministic across replicas.
                let mut next_group_id = self.max_shard_group_id;
                let mut next_shard_id = self.max_shard_id;
                let Some(db) = self.databases.get_mut(database) else {
                    return;
                };
                let Some(rp) = db.policies.get_mut(policy) else {
                    return;
                };
                if rp.shard_group_containing(*timestamp).is_some() {
                    return;
                }
                let (start_time, end_time) = rp.window_for(*timestamp);
                next_group_id += 1;
                let mut shards = Vec::with_capacity(shard_owners.len().max(1));
                let unowned = vec![Vec::new()];
                let owner_sets: &[Vec<u64>] = if shard_owners.is_empty() {
                    &unowned
                } else {
                    shard_owners
                };
                for owners in owner_sets {
                    next_shard_id += 1;
                    shards.push(Shard {
                        id: next_shard_id,
                        owner_ids: owners.clone(),
                    });
                }
                rp.shard_groups.push(ShardGroup {
                    id: next_group_id,
                    start_time,
                    end_time,
                    shards,
                });
                rp.shard_groups.sort_by_key(|g| g.start_time);
                self.max_shard_group_id = next_group_id;
                self.max_shard_id = next_shard_id;
            }
            Proposal::CreateSeries {
                database,
                measurement,
                tags,
                field_types,
            } => {
                let mut next_series_id = self.max_series_id;
                let Some(db) = self.databases.get_mut(database) else {
                    return;
                };
                let m = db
                    .measurements
                    .entry(measurement.clone())
                    .or_insert_with(|| Measurement {
                        name: measurement.clone(),
                        fields: BTreeMap::new(),
                    });
                for (field, ft) in field_types {
                    match m.fields.get(field) {
                        Some(existing) if existing != ft => {
                            // Propose-time validation rejects this; a replay
                            // race can still surface it here. First writer
                            // wins, the later type is dropped.
                            warn!(
                                measurement = measurement.as_str(),
                                field = field.as_str(),
                                "conflicting field type dropped during apply"
                            );
                        }
                        Some(_) => {}
                        None if m.fields.len() >= MAX_FIELDS_PER_MEASUREMENT => {
                            warn!(
                                measurement = measurement.as_str(),
                                "field overflow during apply"
                            );
                        }
                        None => {
                            m.fields.insert(field.clone(), *ft);
                        }
                    }
                }
                let key = series_key(measurement, tags);
                if db.series_by_key.contains_key(&key) {
                    return;
                }
                next_series_id += 1;
                db.series_by_key.insert(key, next_series_id);
                db.series.insert(
                    next_series_id,
                    SeriesInfo {
                        id: next_series_id,
                        measurement: measurement.clone(),
                        tags: tags.clone(),
                    },
                );
                self.max_series_id = next_series_id;
            }
            Proposal::DropExpiredShardGroups { now } => {
                for db in self.databases.values_mut() {
                    for policy in db.policies.values_mut() {
                        if policy.duration <= 0 {
                            continue;
                        }
                        let cutoff = now - policy.duration;
                        policy.shard_groups.retain(|g| g.end_time > cutoff);
                    }
                }
            }
            Proposal::CreateContinuousQuery {
                database,
                name,
                query,
                target_measurement,
                interval,
            } => {
                let Some(db) = self.databases.get_mut(database) else {
                    return;
                };
                if db.continuous_queries.contains_key(name) {
                    return;
                }
                db.continuous_queries.insert(
                    name.clone(),
                    ContinuousQuery {
                        name: name.clone(),
                        database: database.clone(),
                        query: query.clone(),
                        target_measurement: target_measurement.clone(),
                        interval: *interval,
                        last_run: 0,
                    },
                );
            }
            Proposal::DropContinuousQuery { database, name } => {
                if let Some(db) = self.databases.get_mut(database) {
                    db.continuous_queries.remove(name);
                }
                self.cq_leases.remove(&cq_lease_key(database, name));
            }
            Proposal::SetCqLastRun {
                database,
                name,
                last_run,
            } => {
                if let Some(db) = self.databases.get_mut(database) {
                    if let Some(cq) = db.continuous_queries.get_mut(name) {
                        if *last_run > cq.last_run {
                            cq.last_run = *last_run;
                        }
                    }
                }
            }
            Proposal::AcquireCqLease {
                key,
                node_id,
                now,
                expires,
            } => {
                match self.cq_leases.get(key) {
                    Some(lease) if lease.holder != *node_id && lease.expires > *now => {
                        // Held by someone else; the proposer observes this
                        // by reading the catalog after apply.
                    }
                    _ => {
                        self.cq_leases.insert(
                            key.clone(),
                            CqLease {
                                holder: *node_id,
                                expires: *expires,
                            },
                        );
                    }
                }
            }
            Proposal::ReleaseCqLease { key, node_id } => {
                if let Some(lease) = self.cq_leases.get(key) {
                    if lease.holder == *node_id {
                        self.cq_leases.remove(key);
                    }
                }
            }
        }
    }

    /// Shrink owner sets after a node removal, then top underreplicated
    /// shards back up from the remaining nodes.
    fn rebalance_after_removal(&mut self, removed: u64) {
        let remaining = self.data_nodes.len();
        let mut counts = self.shard_counts();
        // Stale owner references (the node being removed included) must
        // not be candidates for the top-up.
        let members: std::collections::BTreeSet<u64> = self.data_nodes.keys().copied().collect();
        counts.retain(|id, _| members.contains(id));
        let mut db_names: Vec<String> = self.databases.keys().cloned().collect();
        for db_name in db_names.drain(..) {
            let Some(db) = self.databases.get_mut(&db_name) else {
                continue;
            };
            for policy in db.policies.values_mut() {
                let want = policy.replica_n as usize;
                for group in &mut policy.shard_groups {
                    for shard in &mut group.shards {
                        shard.owner_ids.retain(|id| *id != removed);
                        let target = want.min(remaining);
                        while shard.owner_ids.len() < target {
                            let next = counts
                                .iter()
                                .filter(|(id, _)| !shard.owner_ids.contains(*id))
                                .min_by_key(|(id, count)| (**count, **id))
                                .map(|(id, _)| *id);
                            match next {
                                Some(id) => {
                                    shard.owner_ids.push(id);
                                    *counts.entry(id).or_insert(0) += 1;
                                }
                                None => break,
                            }
                        }
                        shard.owner_ids.sort_unstable();
                    }
                }
            }
        }
    }
}

/// Key for a continuous-query lease.
pub fn cq_lease_key(database: &str, name: &str) -> String {
    format!("{database}/{name}")
}
