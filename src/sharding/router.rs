//! Shard router.
//!
//! A point maps to exactly one shard per (database, policy): its timestamp
//! picks the shard group window, and the FNV-1a hash of its canonical
//! series key picks the shard within the group. Owner sets are fixed when
//! the group is created and only change on node removal.

use crate::clock::MonotonicClock;
use crate::cluster::DataNodeRegistry;
use crate::meta::MetaStore;
use crate::points::series_id_hash;
use crate::store::TimeRange;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A shard with its replica owner set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedShard {
    pub shard_id: u64,
    pub group_id: u64,
    pub owner_ids: Vec<u64>,
}

pub struct ShardRouter {
    meta: Arc<MetaStore>,
    registry: Arc<DataNodeRegistry>,
    clock: Arc<MonotonicClock>,
    /// Writes further than this ahead of the server clock are rejected.
    write_skew_window: Duration,
}

impl ShardRouter {
    pub fn new(
        meta: Arc<MetaStore>,
        registry: Arc<DataNodeRegistry>,
        clock: Arc<MonotonicClock>,
        write_skew_window: Duration,
    ) -> Self {
        Self {
            meta,
            registry,
            clock,
            write_skew_window,
        }
    }

    /// Resolve a policy name (possibly empty, meaning the database
    /// default) to its concrete name.
    pub fn resolve_policy(&self, database: &str, policy: &str) -> Result<String> {
        self.meta.read(|c| {
            let db = c.database(database)?;
            Ok(db.policy(policy)?.name.clone())
        })
    }

    /// Route one point to its shard, creating the shard group for the
    /// window if it does not exist yet.
    pub async fn route_write(
        &self,
        database: &str,
        policy: &str,
        series_key: &str,
        timestamp: i64,
    ) -> Result<RoutedShard> {
        let policy = self.resolve_policy(database, policy)?;
        self.check_time_bounds(database, &policy, timestamp)?;

        if self.lookup(database, &policy, series_key, timestamp)?.is_none() {
            let live = self.registry.live_ids();
            debug!(
                database,
                policy = policy.as_str(),
                timestamp,
                live = live.len(),
                "creating shard group"
            );
            self.meta
                .create_shard_group(database, &policy, timestamp, &live)
                .await?;
        }

        self.lookup(database, &policy, series_key, timestamp)?
            .ok_or(Error::ShardNotFound)
    }

    /// The shard set covering a time range, for query scatter.
    pub fn shards_for_range(
        &self,
        database: &str,
        policy: &str,
        range: TimeRange,
    ) -> Result<Vec<RoutedShard>> {
        self.meta.read(|c| {
            let db = c.database(database)?;
            let rp = db.policy(policy)?;
            Ok(rp
                .shard_groups
                .iter()
                .filter(|g| g.overlaps(range.start, range.end))
                .flat_map(|g| {
                    g.shards.iter().map(|s| RoutedShard {
                        shard_id: s.id,
                        group_id: g.id,
                        owner_ids: s.owner_ids.clone(),
                    })
                })
                .collect())
        })
    }

    fn lookup(
        &self,
        database: &str,
        policy: &str,
        series_key: &str,
        timestamp: i64,
    ) -> Result<Option<RoutedShard>> {
        let hash = series_id_hash(series_key);
        self.meta.read(|c| {
            let db = c.database(database)?;
            let rp = db.policy(policy)?;
            Ok(rp.shard_group_containing(timestamp).map(|group| {
                let shard = group.shard_for(hash);
                RoutedShard {
                    shard_id: shard.id,
                    group_id: group.id,
                    owner_ids: shard.owner_ids.clone(),
                }
            }))
        })
    }

    fn check_time_bounds(&self, database: &str, policy: &str, timestamp: i64) -> Result<()> {
        let now = self.clock.now_nanos();
        let retention = self.meta.read(|c| -> Result<i64> {
            let db = c.database(database)?;
            Ok(db.policy(policy)?.duration)
        })?;
        if retention > 0 && timestamp < now - retention {
            return Err(Error::RetentionExceeded);
        }
        if timestamp > now + self.write_skew_window.as_nanos() as i64 {
            return Err(Error::TimestampTooFarInFuture);
        }
        Ok(())
    }
}
