//! The write pipeline: authorize, normalize, route, replicate.

use crate::clock::MonotonicClock;
use crate::cluster::Replicator;
use crate::meta::{MetaStore, User};
use crate::sharding::ShardRouter;
use crate::store::StoredPoint;
use crate::write::{normalize_batch, BatchPoints};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct WritePipeline {
    meta: Arc<MetaStore>,
    router: Arc<ShardRouter>,
    replicator: Arc<Replicator>,
    clock: Arc<MonotonicClock>,
}

impl WritePipeline {
    pub fn new(
        meta: Arc<MetaStore>,
        router: Arc<ShardRouter>,
        replicator: Arc<Replicator>,
        clock: Arc<MonotonicClock>,
    ) -> Self {
        Self {
            meta,
            router,
            replicator,
            clock,
        }
    }

    /// Write a batch on behalf of `user` (`None` means an anonymous
    /// principal admitted by the auth layer: auth disabled or zero-user
    /// bootstrap). Returns the number of points written.
    ///
    /// A denied write fails before any point is routed or stored.
    pub async fn write(&self, user: Option<&User>, bp: &BatchPoints) -> Result<usize> {
        if bp.database.is_empty() {
            return Err(Error::DatabaseRequired);
        }
        if !self.meta.database_exists(&bp.database) {
            return Err(Error::DatabaseNotFound(bp.database.clone()));
        }
        if let Some(user) = user {
            if !user.can_write(&bp.database) {
                return Err(Error::Unauthorized {
                    user: user.name.clone(),
                    privilege: "write",
                    database: bp.database.clone(),
                });
            }
        }

        let points = normalize_batch(bp, self.clock.now_nanos())?;
        let count = points.len();

        // Route every point before writing anything: validation failures
        // anywhere in the batch abort it whole.
        let mut by_shard: BTreeMap<u64, (Vec<u64>, Vec<StoredPoint>)> = BTreeMap::new();
        for point in points {
            let series_id = self
                .meta
                .create_series_if_not_exists(&bp.database, &point.name, &point.tags, &point.values)
                .await?;
            let series_key = point.series_key();
            let routed = self
                .router
                .route_write(&bp.database, &bp.retention_policy, &series_key, point.timestamp)
                .await?;
            let entry = by_shard
                .entry(routed.shard_id)
                .or_insert_with(|| (routed.owner_ids.clone(), Vec::new()));
            entry.1.push(StoredPoint {
                series_id,
                series_key,
                name: point.name,
                tags: point.tags,
                timestamp: point.timestamp,
                values: point.values,
            });
        }

        for (shard_id, (owners, shard_points)) in by_shard {
            debug!(
                database = bp.database.as_str(),
                shard_id,
                points = shard_points.len(),
                "replicating shard batch"
            );
            self.replicator
                .replicate(shard_id, &owners, shard_points)
                .await?;
        }
        crate::telemetry::record_points_written(&bp.database, count as u64);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, LocalBroker};
    use crate::cluster::{DataNodeRegistry, HandoffConfig, HintedHandoff, ReplicationConfig};
    use crate::store::{MemShardStore, ShardStore, TimeRange};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        _dir: tempfile::TempDir,
        meta: Arc<MetaStore>,
        store: Arc<MemShardStore>,
        pipeline: WritePipeline,
    }

    async fn fixture() -> Fixture {
        let broker: Arc<dyn Broker> = Arc::new(LocalBroker::new());
        let meta = MetaStore::new(broker);
        meta.start(CancellationToken::new()).await.unwrap();
        meta.create_database("metrics").await.unwrap();
        meta.create_retention_policy("metrics", "default", 0, 1)
            .await
            .unwrap();
        let registry = Arc::new(DataNodeRegistry::new(meta.clone()));
        let store = Arc::new(MemShardStore::new());
        let dir = tempfile::tempdir().unwrap();
        let handoff = Arc::new(
            HintedHandoff::new(HandoffConfig {
                dir: dir.path().to_path_buf(),
                ..Default::default()
            })
            .unwrap(),
        );
        let replicator = Arc::new(Replicator::new(
            registry.clone(),
            store.clone() as Arc<dyn ShardStore>,
            handoff,
            Arc::new(crate::cluster::NodeIdentity::default()),
            ReplicationConfig::default(),
        ));
        let clock = Arc::new(MonotonicClock::new());
        let router = Arc::new(ShardRouter::new(
            meta.clone(),
            registry,
            clock.clone(),
            Duration::from_secs(300),
        ));
        let pipeline = WritePipeline::new(meta.clone(), router, replicator, clock);
        Fixture {
            _dir: dir,
            meta,
            store,
            pipeline,
        }
    }

    fn batch(json: &str) -> BatchPoints {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn write_lands_in_storage() {
        let f = fixture().await;
        let bp = batch(
            r#"{"database":"metrics","points":[
                {"name":"cpu","tags":{"host":"a"},"timestamp":1000,"values":{"value":0.5}}]}"#,
        );
        assert_eq!(f.pipeline.write(None, &bp).await.unwrap(), 1);
        let shard_ids = f.store.shard_ids();
        assert_eq!(shard_ids.len(), 1);
        let rows = f
            .store
            .scan(shard_ids[0], "cpu", TimeRange::all())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tags["host"], "a");
    }

    #[tokio::test]
    async fn missing_and_unknown_database() {
        let f = fixture().await;
        let bp = batch(r#"{"points":[]}"#);
        assert!(matches!(
            f.pipeline.write(None, &bp).await,
            Err(Error::DatabaseRequired)
        ));
        let bp = batch(r#"{"database":"nope","points":[]}"#);
        assert!(matches!(
            f.pipeline.write(None, &bp).await,
            Err(Error::DatabaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unauthorized_write_is_atomic() {
        let f = fixture().await;
        f.meta.create_user("root", "secret").await.unwrap();
        f.meta.create_user("reader", "pw").await.unwrap();
        let reader = f.meta.user("reader").unwrap();
        let bp = batch(
            r#"{"database":"metrics","points":[
                {"name":"cpu","timestamp":1000,"values":{"value":1.0}}]}"#,
        );
        let err = f.pipeline.write(Some(&reader), &bp).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));
        assert!(f.store.shard_ids().is_empty(), "denied write must not store data");
    }

    #[tokio::test]
    async fn conflicting_field_type_rejects_batch() {
        let f = fixture().await;
        let bp = batch(
            r#"{"database":"metrics","points":[
                {"name":"cpu","timestamp":1000,"values":{"value":1.5}}]}"#,
        );
        f.pipeline.write(None, &bp).await.unwrap();

        let bp = batch(
            r#"{"database":"metrics","points":[
                {"name":"cpu","timestamp":2000,"values":{"value":true}}]}"#,
        );
        let err = f.pipeline.write(None, &bp).await.unwrap_err();
        assert!(err.to_string().starts_with("field type conflict"));
    }

    #[tokio::test]
    async fn same_series_same_timestamp_is_lww() {
        let f = fixture().await;
        for value in ["1.0", "2.0"] {
            let bp = batch(&format!(
                r#"{{"database":"metrics","points":[
                    {{"name":"cpu","tags":{{"host":"a"}},"timestamp":1000,"values":{{"v":{value}}}}}]}}"#,
            ));
            f.pipeline.write(None, &bp).await.unwrap();
        }
        let shard_ids = f.store.shard_ids();
        let rows = f
            .store
            .scan(shard_ids[0], "cpu", TimeRange::all())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values["v"], crate::points::FieldValue::F64(2.0));
    }

    #[tokio::test]
    async fn batch_tags_reach_storage() {
        let f = fixture().await;
        let bp = batch(
            r#"{"database":"metrics","tags":{"host":"a"},"points":[
                {"name":"cpu","timestamp":1000,"values":{"v":1.0}}]}"#,
        );
        f.pipeline.write(None, &bp).await.unwrap();
        let shard_ids = f.store.shard_ids();
        let rows = f
            .store
            .scan(shard_ids[0], "cpu", TimeRange::all())
            .await
            .unwrap();
        assert_eq!(rows[0].tags["host"], "a");
    }
}
