//! Typed proposal records ordered by the broker log.
//!
//! Every catalog mutation is expressed as a `Proposal`, serialized to JSON,
//! assigned an index by the broker, and applied in index order on every
//! node. Applying any entry twice is a no-op.

use crate::meta::Privilege;
use crate::points::{FieldType, Tags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A state-change proposal against the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Proposal {
    CreateDatabase {
        name: String,
    },
    DropDatabase {
        name: String,
    },
    CreateRetentionPolicy {
        database: String,
        name: String,
        /// Nanoseconds; zero means infinite retention.
        duration: i64,
        replica_n: u32,
        shard_group_duration: i64,
    },
    DropRetentionPolicy {
        database: String,
        name: String,
    },
    SetDefaultRetentionPolicy {
        database: String,
        name: String,
    },
    CreateUser {
        name: String,
        /// Salted password hash, never the cleartext.
        hash: String,
        admin: bool,
    },
    UpdateUserPassword {
        name: String,
        hash: String,
    },
    DeleteUser {
        name: String,
    },
    SetPrivilege {
        name: String,
        database: String,
        /// `None` revokes.
        privilege: Option<Privilege>,
    },
    CreateDataNode {
        url: String,
    },
    DeleteDataNode {
        id: u64,
    },
    /// Created by the shard router when a write lands in a window with no
    /// group. The proposer picks the owner sets (it knows node liveness);
    /// apply assigns ids and inserts, so replicas stay deterministic.
    CreateShardGroup {
        database: String,
        policy: String,
        timestamp: i64,
        shard_owners: Vec<Vec<u64>>,
    },
    CreateSeries {
        database: String,
        measurement: String,
        tags: Tags,
        field_types: BTreeMap<String, FieldType>,
    },
    /// Retention enforcement: drop shard groups that ended before their
    /// policy's cutoff. Carries the proposer's clock for determinism.
    DropExpiredShardGroups {
        now: i64,
    },
    CreateContinuousQuery {
        database: String,
        name: String,
        query: String,
        target_measurement: String,
        /// Nanoseconds between materializations.
        interval: i64,
    },
    DropContinuousQuery {
        database: String,
        name: String,
    },
    SetCqLastRun {
        database: String,
        name: String,
        last_run: i64,
    },
    /// Lease acquisition carries the proposer's clock so apply stays a
    /// pure function of the log.
    AcquireCqLease {
        key: String,
        node_id: u64,
        now: i64,
        expires: i64,
    },
    ReleaseCqLease {
        key: String,
        node_id: u64,
    },
}

/// A committed log entry: a proposal plus its assigned index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    #[serde(flatten)]
    pub proposal: Proposal,
}
