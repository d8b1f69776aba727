//! Query pipeline: statement parsing, dispatch, and result merging.

mod executor;
mod parser;

pub use executor::QueryExecutor;
pub use parser::{parse_query, SelectStatement, Statement};

use crate::points::Tags;
use crate::store::TimeRange;
use serde::{Deserialize, Serialize};

/// One series of rows in a statement result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesResult {
    pub name: String,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,
    pub columns: Vec<String>,
    pub values: Vec<Vec<serde_json::Value>>,
}

/// The outcome of a single statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub series: Vec<SeriesResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatementResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_series(series: Vec<SeriesResult>) -> Self {
        Self {
            series,
            error: None,
        }
    }

    pub fn from_error(err: &crate::Error) -> Self {
        Self {
            series: Vec::new(),
            error: Some(err.to_string()),
        }
    }
}

/// The response envelope: one result per statement, or a top-level error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Results {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<StatementResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Results {
    pub fn from_error(message: impl Into<String>) -> Self {
        Self {
            results: Vec::new(),
            error: Some(message.into()),
        }
    }

    /// The first error anywhere in the response, if any.
    pub fn first_error(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or_else(|| self.results.iter().find_map(|r| r.error.as_deref()))
    }
}

/// Body of the internal shard scatter request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardQueryRequest {
    pub measurement: String,
    pub range: TimeRange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_shape() {
        let results = Results::from_error("database not found: \"x\"");
        let json = serde_json::to_string(&results).unwrap();
        assert_eq!(json, r#"{"error":"database not found: \"x\""}"#);
    }

    #[test]
    fn statement_errors_are_nested() {
        let results = Results {
            results: vec![
                StatementResult::ok(),
                StatementResult::from_error(&crate::Error::NotExecuted),
            ],
            error: None,
        };
        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(json["results"][1]["error"], "not executed");
        assert_eq!(results.first_error(), Some("not executed"));
    }
}
