//! Storage contract for shard-local point data.
//!
//! The on-disk engine is external to this crate; the server consumes it
//! through [`ShardStore`]. The in-memory [`MemShardStore`] implements the
//! same contract for single-node deployments and tests.

use crate::points::{FieldValue, Tags};
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A point bound to its series, as handed to a shard replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPoint {
    pub series_id: u64,
    pub series_key: String,
    pub name: String,
    #[serde(default)]
    pub tags: Tags,
    pub timestamp: i64,
    pub values: BTreeMap<String, FieldValue>,
}

/// Half-open time range `[start, end)` in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// The full representable range.
    pub fn all() -> Self {
        Self {
            start: i64::MIN,
            end: i64::MAX,
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

/// Shard-local point storage.
///
/// Writes must be idempotent: redelivering a point overwrites the same
/// (series, timestamp, field) cells, so the last write wins.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Append a batch of points to a shard replica.
    async fn write(&self, shard_id: u64, points: &[StoredPoint]) -> Result<()>;

    /// Scan a shard for one measurement over a time range. Results come
    /// back ordered by (timestamp, series key).
    async fn scan(
        &self,
        shard_id: u64,
        measurement: &str,
        range: TimeRange,
    ) -> Result<Vec<StoredPoint>>;

    /// Number of stored rows in a shard.
    async fn row_count(&self, shard_id: u64) -> Result<u64>;

    /// Release all data for a shard.
    async fn drop_shard(&self, shard_id: u64) -> Result<()>;
}

#[derive(Default)]
struct ShardData {
    /// (timestamp, series key) -> merged field cells. The key order gives
    /// scans the deterministic (time, series) ordering for free.
    rows: BTreeMap<(i64, String), BTreeMap<String, FieldValue>>,
    /// series key -> identity of the series, for reconstructing points.
    series: BTreeMap<String, (u64, String, Tags)>,
}

/// In-memory shard storage.
pub struct MemShardStore {
    shards: DashMap<u64, Arc<RwLock<ShardData>>>,
}

impl MemShardStore {
    pub fn new() -> Self {
        Self {
            shards: DashMap::new(),
        }
    }

    fn shard(&self, shard_id: u64) -> Arc<RwLock<ShardData>> {
        self.shards
            .entry(shard_id)
            .or_insert_with(|| Arc::new(RwLock::new(ShardData::default())))
            .clone()
    }

    /// Ids of shards holding any data.
    pub fn shard_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.shards.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for MemShardStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShardStore for MemShardStore {
    async fn write(&self, shard_id: u64, points: &[StoredPoint]) -> Result<()> {
        let shard = self.shard(shard_id);
        let mut data = shard.write();
        for point in points {
            data.series.entry(point.series_key.clone()).or_insert_with(|| {
                (point.series_id, point.name.clone(), point.tags.clone())
            });
            let cells = data
                .rows
                .entry((point.timestamp, point.series_key.clone()))
                .or_default();
            for (field, value) in &point.values {
                // Last write wins per (series, timestamp, field).
                cells.insert(field.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn scan(
        &self,
        shard_id: u64,
        measurement: &str,
        range: TimeRange,
    ) -> Result<Vec<StoredPoint>> {
        let Some(shard) = self.shards.get(&shard_id).map(|e| e.clone()) else {
            return Ok(Vec::new());
        };
        let data = shard.read();
        let mut out = Vec::new();
        let lower = (range.start, String::new());
        for ((timestamp, series_key), cells) in data.rows.range(lower..) {
            if *timestamp >= range.end {
                break;
            }
            let Some((series_id, name, tags)) = data.series.get(series_key) else {
                continue;
            };
            if name != measurement {
                continue;
            }
            out.push(StoredPoint {
                series_id: *series_id,
                series_key: series_key.clone(),
                name: name.clone(),
                tags: tags.clone(),
                timestamp: *timestamp,
                values: cells.clone(),
            });
        }
        Ok(out)
    }

    async fn row_count(&self, shard_id: u64) -> Result<u64> {
        Ok(self
            .shards
            .get(&shard_id)
            .map(|s| s.read().rows.len() as u64)
            .unwrap_or(0))
    }

    async fn drop_shard(&self, shard_id: u64) -> Result<()> {
        self.shards.remove(&shard_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ts: i64, host: &str, value: f64) -> StoredPoint {
        let tags: Tags = [("host".to_string(), host.to_string())].into_iter().collect();
        StoredPoint {
            series_id: 1,
            series_key: format!("cpu,host={host}"),
            name: "cpu".into(),
            tags,
            timestamp: ts,
            values: [("value".to_string(), FieldValue::F64(value))]
                .into_iter()
                .collect(),
        }
    }

    #[tokio::test]
    async fn scan_is_ordered_and_range_bounded() {
        let store = MemShardStore::new();
        store
            .write(1, &[point(30, "b", 3.0), point(10, "a", 1.0), point(20, "a", 2.0)])
            .await
            .unwrap();

        let rows = store.scan(1, "cpu", TimeRange::new(10, 30)).await.unwrap();
        let times: Vec<i64> = rows.iter().map(|p| p.timestamp).collect();
        assert_eq!(times, vec![10, 20], "end of range is exclusive");
    }

    #[tokio::test]
    async fn same_timestamp_orders_by_series_key() {
        let store = MemShardStore::new();
        store
            .write(1, &[point(10, "b", 2.0), point(10, "a", 1.0)])
            .await
            .unwrap();
        let rows = store.scan(1, "cpu", TimeRange::all()).await.unwrap();
        assert_eq!(rows[0].series_key, "cpu,host=a");
        assert_eq!(rows[1].series_key, "cpu,host=b");
    }

    #[tokio::test]
    async fn duplicate_delivery_is_last_write_wins() {
        let store = MemShardStore::new();
        store.write(1, &[point(10, "a", 1.0)]).await.unwrap();
        store.write(1, &[point(10, "a", 2.0)]).await.unwrap();

        let rows = store.scan(1, "cpu", TimeRange::all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values["value"], FieldValue::F64(2.0));
        assert_eq!(store.row_count(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fields_merge_within_a_row() {
        let store = MemShardStore::new();
        let mut p1 = point(10, "a", 1.0);
        let mut p2 = point(10, "a", 1.0);
        p1.values = [("user".to_string(), FieldValue::F64(0.4))].into_iter().collect();
        p2.values = [("system".to_string(), FieldValue::F64(0.2))].into_iter().collect();
        store.write(1, &[p1]).await.unwrap();
        store.write(1, &[p2]).await.unwrap();

        let rows = store.scan(1, "cpu", TimeRange::all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values.len(), 2);
    }

    #[tokio::test]
    async fn drop_shard_releases_data() {
        let store = MemShardStore::new();
        store.write(1, &[point(10, "a", 1.0)]).await.unwrap();
        store.drop_shard(1).await.unwrap();
        assert_eq!(store.row_count(1).await.unwrap(), 0);
        assert!(store.scan(1, "cpu", TimeRange::all()).await.unwrap().is_empty());
    }
}
