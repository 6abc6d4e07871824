//! Databricks SQL Statement Execution API client.
//!
//! Statements are submitted with a server-side wait; if the warehouse is
//! still working when the wait elapses, the statement id is polled until it
//! reaches a terminal state.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{QueryExecutionError, Row, WarehouseExecutor};

#[derive(Debug, Clone)]
pub struct DatabricksConfig {
    /// Workspace base URL, e.g. `https://adb-123.azuredatabricks.net`.
    pub host: String,
    pub token: String,
    pub warehouse_id: String,
    /// Interval between status polls for long-running statements.
    pub poll_interval: Duration,
}

impl DatabricksConfig {
    pub fn new(
        host: impl Into<String>,
        token: impl Into<String>,
        warehouse_id: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            token: token.into(),
            warehouse_id: warehouse_id.into(),
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabricksExecutor {
    client: reqwest::Client,
    config: DatabricksConfig,
}

impl DatabricksExecutor {
    pub fn new(config: DatabricksConfig) -> Self {
        let mut config = config;
        config.host = config.host.trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            config,
        }
    }

    async fn submit(&self, sql: &str) -> Result<StatementResponse, QueryExecutionError> {
        let url = format!("{}/api/2.0/sql/statements", self.config.host);
        let payload = StatementRequest {
            statement: sql.to_string(),
            warehouse_id: self.config.warehouse_id.clone(),
            wait_timeout: "30s".to_string(),
            format: "JSON_ARRAY".to_string(),
            disposition: "INLINE".to_string(),
        };

        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.config.token)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;
        parse_statement_response(resp).await
    }

    async fn poll(&self, statement_id: &str) -> Result<StatementResponse, QueryExecutionError> {
        let url = format!(
            "{}/api/2.0/sql/statements/{statement_id}",
            self.config.host
        );
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(transport_error)?;
        parse_statement_response(resp).await
    }
}

#[async_trait]
impl WarehouseExecutor for DatabricksExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, QueryExecutionError> {
        debug!(statement = %sql, "executing warehouse statement");
        let mut response = self.submit(sql).await?;

        while matches!(response.status.state.as_str(), "PENDING" | "RUNNING") {
            tokio::time::sleep(self.config.poll_interval).await;
            response = self.poll(&response.statement_id).await?;
        }

        match response.status.state.as_str() {
            "SUCCEEDED" => Ok(rows_from_response(&response)),
            "FAILED" | "CANCELED" | "CLOSED" => {
                let message = response
                    .status
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| format!("statement {}", response.status.state));
                Err(QueryExecutionError::new(message))
            }
            other => Err(QueryExecutionError::new(format!(
                "unexpected statement state {other}"
            ))),
        }
    }
}

fn transport_error(err: reqwest::Error) -> QueryExecutionError {
    QueryExecutionError::new(err.to_string())
}

async fn parse_statement_response(
    resp: reqwest::Response,
) -> Result<StatementResponse, QueryExecutionError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(QueryExecutionError::new(format!(
            "warehouse api error ({status}): {body}"
        )));
    }
    resp.json::<StatementResponse>()
        .await
        .map_err(transport_error)
}

fn rows_from_response(response: &StatementResponse) -> Vec<Row> {
    let columns: Vec<String> = response
        .manifest
        .as_ref()
        .map(|m| m.schema.columns.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default();

    let data = response
        .result
        .as_ref()
        .map(|r| r.data_array.as_slice())
        .unwrap_or_default();

    data.iter()
        .map(|values| {
            columns
                .iter()
                .cloned()
                .zip(values.iter().cloned())
                .collect::<Row>()
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct StatementRequest {
    pub statement: String,
    pub warehouse_id: String,
    pub wait_timeout: String,
    pub format: String,
    pub disposition: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StatementResponse {
    pub statement_id: String,
    pub status: StatementStatus,
    #[serde(default)]
    pub manifest: Option<StatementManifest>,
    #[serde(default)]
    pub result: Option<StatementResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StatementStatus {
    pub state: String,
    #[serde(default)]
    pub error: Option<StatementError>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StatementError {
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StatementManifest {
    pub schema: StatementSchema,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StatementSchema {
    pub columns: Vec<StatementColumn>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StatementColumn {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StatementResult {
    #[serde(default)]
    pub data_array: Vec<Vec<Value>>,
}
