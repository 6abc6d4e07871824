//! Warehouse access: the executor seam the rest of the system talks SQL
//! through, plus result aggregation and concept resolution on top of it.

pub mod aggregate;
pub mod concepts;
pub mod databricks;

use std::collections::VecDeque;

use async_trait::async_trait;
use serde_json::Value;

pub use aggregate::{
    AggregateError, AgeStats, Aggregator, CohortResult, DatabaseSummary, Demographics, SavedCohort,
};
pub use concepts::{
    ConceptResolver, ConceptSearchRequest, StaticConceptResolver, WarehouseConceptResolver,
};
pub use databricks::{DatabricksConfig, DatabricksExecutor};

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Failure from the warehouse, carrying the warehouse-native message
/// verbatim. Never silently swallowed by callers.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("warehouse query failed: {message}")]
pub struct QueryExecutionError {
    pub message: String,
}

impl QueryExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait WarehouseExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, QueryExecutionError>;

    /// First column of the first row, or `None` for an empty result.
    async fn execute_scalar(&self, sql: &str) -> Result<Option<Value>, QueryExecutionError> {
        let rows = self.execute(sql).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.values().next().cloned()))
    }
}

/// Warehouse results arrive as JSON; numeric columns may come back as
/// numbers or as decimal strings depending on the transport.
pub fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse::<i64>().ok().or_else(|| {
            s.parse::<f64>().ok().map(|f| f as i64)
        }),
        _ => None,
    }
}

pub fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

/// Escape a string for inlining as a SQL literal.
pub fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}

/// Build a row from column/value pairs. Test and stub helper.
pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Scripted executor for tests: returns queued responses in order and
/// records every statement it was asked to run.
#[derive(Default)]
pub struct StubExecutor {
    responses: std::sync::Mutex<VecDeque<Result<Vec<Row>, QueryExecutionError>>>,
    seen: std::sync::Mutex<Vec<String>>,
}

impl StubExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_rows(&self, rows: Vec<Row>) {
        self.responses.lock().unwrap().push_back(Ok(rows));
    }

    pub fn push_count(&self, count: i64) {
        self.push_rows(vec![row(&[("cnt", Value::from(count))])]);
    }

    pub fn push_error(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(QueryExecutionError::new(message)));
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl WarehouseExecutor for StubExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, QueryExecutionError> {
        self.seen.lock().unwrap().push(sql.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}
