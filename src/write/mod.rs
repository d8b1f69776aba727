//! Write ingestion: batch decoding, normalization, and the pipeline that
//! turns client batches into replicated shard writes.

mod pipeline;

pub use pipeline::WritePipeline;

use crate::clock::Precision;
use crate::points::{FieldValue, Point, Tags};
use crate::{Error, Result};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A timestamp as it appears on the wire: either an epoch integer at the
/// batch precision or an RFC3339 string. Serde tries variants in order,
/// so the numeric interpretation wins when both could apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Epoch(i64),
    Rfc3339(String),
}

impl WireTimestamp {
    /// Resolve to nanoseconds since the epoch.
    fn to_nanos(&self, precision: Precision) -> Result<i64> {
        match self {
            WireTimestamp::Epoch(epoch) => Ok(precision.epoch_to_nanos(*epoch)),
            WireTimestamp::Rfc3339(s) => {
                let parsed = DateTime::parse_from_rfc3339(s)
                    .map_err(|e| Error::InvalidQuery(format!("bad timestamp {s:?}: {e}")))?;
                parsed
                    .timestamp_nanos_opt()
                    .ok_or_else(|| Error::InvalidQuery(format!("timestamp {s:?} out of range")))
            }
        }
    }
}

/// One point inside a batch, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchPoint {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<WireTimestamp>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub precision: String,
    #[serde(default)]
    pub values: BTreeMap<String, FieldValue>,
}

/// A batched write envelope. Top-level tags, timestamp, and precision are
/// defaults folded into each point during normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPoints {
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub retention_policy: String,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<WireTimestamp>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub precision: String,
    #[serde(default)]
    pub points: Vec<BatchPoint>,
}

/// Fold batch-level defaults into each point and validate the result.
///
/// Rules, in order: a point without a timestamp inherits the batch
/// timestamp, else `now`; the point (or batch) precision scales numeric
/// timestamps and truncates all of them; batch tags fill in tag keys the
/// point does not set; finally the point must carry a measurement name
/// and at least one value.
pub fn normalize_batch(bp: &BatchPoints, now_nanos: i64) -> Result<Vec<Point>> {
    let batch_precision = Precision::parse(&bp.precision)?;
    let batch_nanos = match &bp.timestamp {
        Some(ts) => Some(ts.to_nanos(batch_precision)?),
        None => None,
    };

    let mut points = Vec::with_capacity(bp.points.len());
    for p in &bp.points {
        let precision = if p.precision.is_empty() {
            batch_precision
        } else {
            Precision::parse(&p.precision)?
        };

        let nanos = match &p.timestamp {
            Some(ts) => ts.to_nanos(precision)?,
            None => batch_nanos.unwrap_or(now_nanos),
        };
        let nanos = precision.truncate_nanos(nanos);

        let mut tags = p.tags.clone();
        for (k, v) in &bp.tags {
            let missing = tags.get(k).map(|t| t.is_empty()).unwrap_or(true);
            if missing {
                tags.insert(k.clone(), v.clone());
            }
        }

        if p.name.is_empty() {
            return Err(Error::MeasurementNameRequired);
        }
        if p.values.is_empty() {
            return Err(Error::ValuesRequired);
        }

        points.push(Point {
            name: p.name.clone(),
            tags,
            timestamp: nanos,
            values: p.values.clone(),
        });
    }
    Ok(points)
}
