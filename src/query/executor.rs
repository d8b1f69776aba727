//! Statement execution: dispatch to shards, catalog operations, and
//! deterministic result merging.

use crate::cluster::{DataNodeRegistry, NodeIdentity, NodeStatus};
use crate::meta::{ContinuousQuery, MetaStore, Privilege, User};
use crate::points::Tags;
use crate::query::{
    parse_query, Results, SelectStatement, SeriesResult, ShardQueryRequest, Statement,
    StatementResult,
};
use crate::sharding::{RoutedShard, ShardRouter};
use crate::store::{ShardStore, StoredPoint, TimeRange};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

pub struct QueryExecutor {
    meta: Arc<MetaStore>,
    router: Arc<ShardRouter>,
    store: Arc<dyn ShardStore>,
    registry: Arc<DataNodeRegistry>,
    identity: Arc<NodeIdentity>,
    client: reqwest::Client,
}

impl QueryExecutor {
    pub fn new(
        meta: Arc<MetaStore>,
        router: Arc<ShardRouter>,
        store: Arc<dyn ShardStore>,
        registry: Arc<DataNodeRegistry>,
        identity: Arc<NodeIdentity>,
    ) -> Self {
        Self {
            meta,
            router,
            store,
            registry,
            identity,
            client: reqwest::Client::new(),
        }
    }

    /// Execute a statement list. Statements run in declared order; after
    /// the first failure every remaining statement reports `not executed`.
    ///
    /// Returns `Err` only when the query text itself cannot be parsed.
    pub async fn execute(
        &self,
        text: &str,
        default_db: &str,
        user: Option<&User>,
    ) -> Result<Results> {
        let statements = parse_query(text)?;
        let mut results = Vec::with_capacity(statements.len());
        let mut failed = false;
        for statement in &statements {
            if failed {
                results.push(StatementResult::from_error(&Error::NotExecuted));
                continue;
            }
            match self.execute_statement(statement, default_db, user).await {
                Ok(result) => results.push(result),
                // Authorization failures abort the whole query so the
                // HTTP boundary can answer with its status code.
                Err(e) if e.kind() == crate::ErrorKind::Authorization => return Err(e),
                Err(e) => {
                    debug!(error = %e, "statement failed");
                    failed = true;
                    results.push(StatementResult::from_error(&e));
                }
            }
        }
        Ok(Results {
            results,
            error: None,
        })
    }

    async fn execute_statement(
        &self,
        statement: &Statement,
        default_db: &str,
        user: Option<&User>,
    ) -> Result<StatementResult> {
        match statement {
            Statement::Select(select) => {
                let db = require_db(default_db)?;
                require_read(user, db)?;
                let rows = self.run_select(db, select).await?;
                Ok(StatementResult::with_series(series_from_rows(select, &rows)))
            }
            Statement::CreateDatabase { name } => {
                require_admin(user)?;
                self.meta.create_database(name).await?;
                Ok(StatementResult::ok())
            }
            Statement::DropDatabase { name } => {
                require_admin(user)?;
                let shard_ids = self.meta.drop_database(name).await?;
                for shard_id in shard_ids {
                    self.store.drop_shard(shard_id).await?;
                }
                Ok(StatementResult::ok())
            }
            Statement::ShowDatabases => {
                require_admin(user)?;
                let names: Vec<String> = self.meta.read(|c| c.databases.keys().cloned().collect());
                Ok(StatementResult::with_series(vec![SeriesResult {
                    name: "databases".into(),
                    tags: Tags::new(),
                    columns: vec!["name".into()],
                    values: names.into_iter().map(|n| vec![n.into()]).collect(),
                }]))
            }
            Statement::CreateRetentionPolicy {
                name,
                database,
                duration,
                replica_n,
                default,
            } => {
                require_admin(user)?;
                self.meta
                    .create_retention_policy(database, name, *duration, *replica_n)
                    .await?;
                if *default {
                    self.meta.set_default_retention_policy(database, name).await?;
                }
                Ok(StatementResult::ok())
            }
            Statement::DropRetentionPolicy { name, database } => {
                require_admin(user)?;
                self.meta.drop_retention_policy(database, name).await?;
                Ok(StatementResult::ok())
            }
            Statement::ShowRetentionPolicies { database } => {
                require_read(user, database)?;
                let rows = self.meta.read(|c| {
                    let db = c.database(database)?;
                    Ok::<_, Error>(
                        db.policies
                            .values()
                            .map(|rp| {
                                vec![
                                    rp.name.clone().into(),
                                    rp.duration.into(),
                                    rp.replica_n.into(),
                                    (db.default_retention_policy.as_deref()
                                        == Some(rp.name.as_str()))
                                    .into(),
                                ]
                            })
                            .collect::<Vec<Vec<serde_json::Value>>>(),
                    )
                })?;
                Ok(StatementResult::with_series(vec![SeriesResult {
                    name: "retention policies".into(),
                    tags: Tags::new(),
                    columns: vec![
                        "name".into(),
                        "duration".into(),
                        "replicaN".into(),
                        "default".into(),
                    ],
                    values: rows,
                }]))
            }
            Statement::CreateUser { name, password } => {
                require_admin(user)?;
                self.meta.create_user(name, password).await?;
                Ok(StatementResult::ok())
            }
            Statement::DropUser { name } => {
                require_admin(user)?;
                self.meta.delete_user(name).await?;
                Ok(StatementResult::ok())
            }
            Statement::ShowUsers => {
                require_admin(user)?;
                let rows: Vec<Vec<serde_json::Value>> = self.meta.read(|c| {
                    c.users
                        .values()
                        .map(|u| vec![u.name.clone().into(), u.is_admin().into()])
                        .collect()
                });
                Ok(StatementResult::with_series(vec![SeriesResult {
                    name: "users".into(),
                    tags: Tags::new(),
                    columns: vec!["user".into(), "admin".into()],
                    values: rows,
                }]))
            }
            Statement::Grant {
                privilege,
                database,
                user: grantee,
            } => {
                require_admin(user)?;
                let db = database.as_deref().unwrap_or("*");
                self.meta
                    .set_privilege(grantee, db, Some(*privilege))
                    .await?;
                Ok(StatementResult::ok())
            }
            Statement::Revoke {
                privilege: _,
                database,
                user: grantee,
            } => {
                require_admin(user)?;
                let db = database.as_deref().unwrap_or("*");
                self.meta.set_privilege(grantee, db, None).await?;
                Ok(StatementResult::ok())
            }
            Statement::ShowMeasurements => {
                let db = require_db(default_db)?;
                require_read(user, db)?;
                let names: Vec<String> = self.meta.read(|c| {
                    Ok::<_, Error>(c.database(db)?.measurements.keys().cloned().collect())
                })?;
                Ok(StatementResult::with_series(vec![SeriesResult {
                    name: "measurements".into(),
                    tags: Tags::new(),
                    columns: vec!["name".into()],
                    values: names.into_iter().map(|n| vec![n.into()]).collect(),
                }]))
            }
            Statement::ShowSeries => {
                let db = require_db(default_db)?;
                require_read(user, db)?;
                let rows: Vec<Vec<serde_json::Value>> = self.meta.read(|c| {
                    Ok::<_, Error>(
                        c.database(db)?
                            .series_by_key
                            .iter()
                            .map(|(key, id)| vec![(*id).into(), key.clone().into()])
                            .collect(),
                    )
                })?;
                Ok(StatementResult::with_series(vec![SeriesResult {
                    name: "series".into(),
                    tags: Tags::new(),
                    columns: vec!["id".into(), "key".into()],
                    values: rows,
                }]))
            }
            Statement::CreateContinuousQuery {
                name,
                database,
                query,
                target_measurement,
                interval,
            } => {
                require_admin(user)?;
                self.meta
                    .create_continuous_query(ContinuousQuery {
                        name: name.clone(),
                        database: database.clone(),
                        query: query.clone(),
                        target_measurement: target_measurement.clone(),
                        interval: *interval,
                        last_run: 0,
                    })
                    .await?;
                Ok(StatementResult::ok())
            }
            Statement::DropContinuousQuery { name, database } => {
                require_admin(user)?;
                self.meta.drop_continuous_query(database, name).await?;
                Ok(StatementResult::ok())
            }
            Statement::ShowContinuousQueries => {
                require_admin(user)?;
                let series: Vec<SeriesResult> = self.meta.read(|c| {
                    c.databases
                        .values()
                        .map(|db| SeriesResult {
                            name: db.name.clone(),
                            tags: Tags::new(),
                            columns: vec!["name".into(), "query".into()],
                            values: db
                                .continuous_queries
                                .values()
                                .map(|cq| vec![cq.name.clone().into(), cq.query.clone().into()])
                                .collect(),
                        })
                        .collect()
                });
                Ok(StatementResult::with_series(series))
            }
        }
    }

    /// Run a SELECT: resolve the shard set, scan local replicas, fetch
    /// remote ones, and merge rows by (timestamp, series key).
    pub async fn run_select(
        &self,
        database: &str,
        select: &SelectStatement,
    ) -> Result<Vec<StoredPoint>> {
        let known = self.meta.read(|c| {
            Ok::<_, Error>(
                c.database(database)?
                    .measurements
                    .contains_key(&select.measurement),
            )
        })?;
        if !known {
            return Err(Error::MeasurementNotFound);
        }

        let policy = self.router.resolve_policy(database, "")?;
        let range = TimeRange::new(
            select.start.unwrap_or(i64::MIN),
            select.end.unwrap_or(i64::MAX),
        );
        let shards = self.router.shards_for_range(database, &policy, range)?;
        let local = self.identity.get();

        let mut rows = Vec::new();
        for shard in shards {
            let local_replica = shard.owner_ids.is_empty() || shard.owner_ids.contains(&local);
            if local_replica {
                rows.extend(
                    self.store
                        .scan(shard.shard_id, &select.measurement, range)
                        .await?,
                );
            } else {
                rows.extend(
                    self.fetch_remote(&shard, &select.measurement, range)
                        .await?,
                );
            }
        }
        rows.sort_by(|a, b| {
            (a.timestamp, &a.series_key).cmp(&(b.timestamp, &b.series_key))
        });
        Ok(rows)
    }

    async fn fetch_remote(
        &self,
        shard: &RoutedShard,
        measurement: &str,
        range: TimeRange,
    ) -> Result<Vec<StoredPoint>> {
        // Prefer an owner currently believed live.
        let owner = shard
            .owner_ids
            .iter()
            .find(|id| self.registry.status(**id) == NodeStatus::Up)
            .or_else(|| shard.owner_ids.first())
            .copied()
            .ok_or(Error::ShardNotFound)?;
        let node = self
            .registry
            .by_id(owner)
            .ok_or(Error::DataNodeNotFound)?;
        let url = format!("{}/shards/{}/query", node.url, shard.shard_id);
        let request = ShardQueryRequest {
            measurement: measurement.to_string(),
            range,
        };
        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("shard query to node {owner}: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Internal(format!(
                "shard query to node {owner} returned {}",
                resp.status()
            )));
        }
        resp.json::<Vec<StoredPoint>>()
            .await
            .map_err(|e| Error::Internal(format!("bad shard query payload: {e}")))
    }
}

fn require_db(default_db: &str) -> Result<&str> {
    if default_db.is_empty() {
        Err(Error::DatabaseRequired)
    } else {
        Ok(default_db)
    }
}

fn require_admin(user: Option<&User>) -> Result<()> {
    match user {
        None => Ok(()),
        Some(u) if u.is_admin() => Ok(()),
        Some(u) => Err(Error::Unauthorized {
            user: u.name.clone(),
            privilege: "administer",
            database: "*".into(),
        }),
    }
}

fn require_read(user: Option<&User>, database: &str) -> Result<()> {
    match user {
        None => Ok(()),
        Some(u) if u.can_read(database) => Ok(()),
        Some(u) => Err(Error::Unauthorized {
            user: u.name.clone(),
            privilege: "read",
            database: database.to_string(),
        }),
    }
}

/// Group merged rows into per-series results with a `time` column first.
fn series_from_rows(select: &SelectStatement, rows: &[StoredPoint]) -> Vec<SeriesResult> {
    let fields: Vec<String> = if select.fields.is_empty() {
        let mut union = BTreeSet::new();
        for row in rows {
            union.extend(row.values.keys().cloned());
        }
        union.into_iter().collect()
    } else {
        select.fields.clone()
    };

    let mut columns = Vec::with_capacity(fields.len() + 1);
    columns.push("time".to_string());
    columns.extend(fields.iter().cloned());

    let mut by_series: BTreeMap<&str, (&Tags, Vec<&StoredPoint>)> = BTreeMap::new();
    for row in rows {
        by_series
            .entry(&row.series_key)
            .or_insert_with(|| (&row.tags, Vec::new()))
            .1
            .push(row);
    }

    by_series
        .into_values()
        .map(|(tags, series_rows)| {
            let values = series_rows
                .iter()
                .take(select.limit.unwrap_or(usize::MAX))
                .map(|row| {
                    let mut out: Vec<serde_json::Value> =
                        Vec::with_capacity(fields.len() + 1);
                    out.push(row.timestamp.into());
                    for field in &fields {
                        out.push(
                            row.values
                                .get(field)
                                .map(|v| v.as_json())
                                .unwrap_or(serde_json::Value::Null),
                        );
                    }
                    out
                })
                .collect();
            SeriesResult {
                name: select.measurement.clone(),
                tags: tags.clone(),
                columns: columns.clone(),
                values,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::FieldValue;

    fn row(ts: i64, host: &str, value: f64) -> StoredPoint {
        StoredPoint {
            series_id: 1,
            series_key: format!("cpu,host={host}"),
            name: "cpu".into(),
            tags: [("host".to_string(), host.to_string())].into_iter().collect(),
            timestamp: ts,
            values: [("value".to_string(), FieldValue::F64(value))]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn rows_group_into_series_with_time_column() {
        let select = SelectStatement {
            measurement: "cpu".into(),
            ..Default::default()
        };
        let rows = vec![row(1, "a", 0.1), row(2, "a", 0.2), row(1, "b", 0.3)];
        let series = series_from_rows(&select, &rows);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].columns, vec!["time", "value"]);
        assert_eq!(series[0].tags["host"], "a");
        assert_eq!(series[0].values.len(), 2);
        assert_eq!(series[1].tags["host"], "b");
    }

    #[test]
    fn missing_fields_render_null() {
        let select = SelectStatement {
            fields: vec!["value".into(), "absent".into()],
            measurement: "cpu".into(),
            ..Default::default()
        };
        let series = series_from_rows(&select, &[row(1, "a", 0.5)]);
        assert_eq!(series[0].values[0][1], serde_json::json!(0.5));
        assert_eq!(series[0].values[0][2], serde_json::Value::Null);
    }

    #[test]
    fn limit_applies_per_series() {
        let select = SelectStatement {
            measurement: "cpu".into(),
            limit: Some(1),
            ..Default::default()
        };
        let rows = vec![row(1, "a", 0.1), row(2, "a", 0.2), row(1, "b", 0.3)];
        let series = series_from_rows(&select, &rows);
        assert!(series.iter().all(|s| s.values.len() == 1));
    }
}
