//! Continuous-query runner.
//!
//! A periodic task re-executes each saved query over the most recently
//! completed interval and writes the result set into the target
//! measurement. A metastore lease keyed by continuous query makes sure
//! only one node runs each query; `last_run` advances through a proposal
//! so a lease takeover never re-materializes a finished window.

use crate::clock::MonotonicClock;
use crate::cluster::NodeIdentity;
use crate::meta::{ContinuousQuery, MetaStore};
use crate::query::{parse_query, QueryExecutor, Statement};
use crate::write::{BatchPoint, BatchPoints, WireTimestamp, WritePipeline};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the runner looks for due continuous queries.
const TICK: Duration = Duration::from_secs(1);

/// Lease TTL; a crashed holder's queries resume after this long.
const LEASE_TTL: Duration = Duration::from_secs(30);

pub struct CqRunner {
    meta: Arc<MetaStore>,
    executor: Arc<QueryExecutor>,
    pipeline: Arc<WritePipeline>,
    identity: Arc<NodeIdentity>,
    clock: Arc<MonotonicClock>,
}

impl CqRunner {
    pub fn new(
        meta: Arc<MetaStore>,
        executor: Arc<QueryExecutor>,
        pipeline: Arc<WritePipeline>,
        identity: Arc<NodeIdentity>,
        clock: Arc<MonotonicClock>,
    ) -> Self {
        Self {
            meta,
            executor,
            pipeline,
            identity,
            clock,
        }
    }

    /// Spawn the periodic runner.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("continuous-query runner stopped");
                        return;
                    }
                    _ = interval.tick() => {}
                }
                if let Err(e) = self.process().await {
                    warn!(error = %e, "continuous-query pass failed");
                }
            }
        });
    }

    /// Run every continuous query whose next interval boundary has
    /// elapsed. Returns how many queries materialized a window.
    pub async fn process(&self) -> Result<usize> {
        let queries: Vec<ContinuousQuery> = self.meta.read(|c| {
            c.databases
                .values()
                .flat_map(|db| db.continuous_queries.values().cloned())
                .collect()
        });
        let mut ran = 0usize;
        for cq in queries {
            if self.process_one(&cq).await? {
                ran += 1;
            }
        }
        Ok(ran)
    }

    async fn process_one(&self, cq: &ContinuousQuery) -> Result<bool> {
        if cq.interval <= 0 {
            return Ok(false);
        }
        let now = self.clock.now_nanos();
        let window_end = now.div_euclid(cq.interval) * cq.interval;
        if cq.last_run >= window_end {
            return Ok(false);
        }
        let window_start = window_end - cq.interval;

        let node_id = self.identity.get();
        let acquired = self
            .meta
            .acquire_cq_lease(&cq.database, &cq.name, node_id, now, LEASE_TTL)
            .await?;
        if !acquired {
            debug!(cq = cq.name.as_str(), "lease held elsewhere, skipping");
            return Ok(false);
        }

        let result = self.materialize(cq, window_start, window_end).await;
        let _ = self
            .meta
            .release_cq_lease(&cq.database, &cq.name, node_id)
            .await;
        result?;

        self.meta
            .set_cq_last_run(&cq.database, &cq.name, window_end)
            .await?;
        Ok(true)
    }

    async fn materialize(&self, cq: &ContinuousQuery, start: i64, end: i64) -> Result<()> {
        let mut statements = parse_query(&cq.query)?;
        let Some(Statement::Select(mut select)) = statements.pop() else {
            return Err(Error::InvalidQuery(format!(
                "continuous query {:?} is not a SELECT",
                cq.name
            )));
        };
        select.start = Some(start);
        select.end = Some(end);

        let rows = self.executor.run_select(&cq.database, &select).await?;
        if rows.is_empty() {
            return Ok(());
        }

        let points: Vec<BatchPoint> = rows
            .into_iter()
            .map(|row| BatchPoint {
                name: cq.target_measurement.clone(),
                tags: row.tags,
                timestamp: Some(WireTimestamp::Epoch(row.timestamp)),
                precision: String::new(),
                values: row.values.into_iter().collect(),
            })
            .collect();
        let count = points.len();
        let batch = BatchPoints {
            database: cq.database.clone(),
            points,
            ..Default::default()
        };
        self.pipeline.write(None, &batch).await?;
        info!(
            cq = cq.name.as_str(),
            target = cq.target_measurement.as_str(),
            points = count,
            "continuous query materialized window"
        );
        Ok(())
    }
}
