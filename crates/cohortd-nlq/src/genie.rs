//! Databricks Genie conversation API client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{QueryService, ServiceError, TurnSnapshot, TurnStart, TurnStatus};

#[derive(Debug, Clone)]
pub struct GenieConfig {
    /// Workspace base URL, e.g. `https://adb-123.azuredatabricks.net`.
    pub host: String,
    pub token: String,
    pub space_id: String,
}

impl GenieConfig {
    pub fn new(
        host: impl Into<String>,
        token: impl Into<String>,
        space_id: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            token: token.into(),
            space_id: space_id.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenieClient {
    client: reqwest::Client,
    config: GenieConfig,
}

impl GenieClient {
    pub fn new(config: GenieConfig) -> Self {
        let mut config = config;
        config.host = config.host.trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            config,
        }
    }

    fn space_url(&self, suffix: &str) -> String {
        format!(
            "{}/api/2.0/genie/spaces/{}{suffix}",
            self.config.host, self.config.space_id
        )
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
    ) -> Result<T, ServiceError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(transport_error)?;
        decode_response(resp).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        body: &impl Serialize,
    ) -> Result<T, ServiceError> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.config.token)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        decode_response(resp).await
    }

    /// Row count for a completed query, from the statement manifest. A
    /// missing count is tolerated; callers re-execute the SQL anyway.
    async fn fetch_result_count(&self, session_id: &str, message_id: &str) -> Option<i64> {
        let url = self.space_url(&format!(
            "/conversations/{session_id}/messages/{message_id}/query-result"
        ));
        match self.get_json::<ApiQueryResult>(url).await {
            Ok(result) => result
                .statement_response
                .and_then(|s| s.manifest)
                .and_then(|m| m.total_row_count),
            Err(e) => {
                warn!(session_id, message_id, error = %e, "query-result fetch failed");
                None
            }
        }
    }
}

#[async_trait]
impl QueryService for GenieClient {
    async fn start_turn(&self, text: &str) -> Result<TurnStart, ServiceError> {
        let url = self.space_url("/start-conversation");
        let resp: ApiStartResponse = self
            .post_json(url, &ApiMessageRequest { content: text })
            .await?;
        debug!(conversation = %resp.conversation_id, "started genie conversation");
        Ok(TurnStart {
            session_id: resp.conversation_id,
            message_id: resp.message_id,
        })
    }

    async fn continue_turn(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<String, ServiceError> {
        let url = self.space_url(&format!("/conversations/{session_id}/messages"));
        let resp: ApiMessage = self
            .post_json(url, &ApiMessageRequest { content: text })
            .await?;
        Ok(resp.id)
    }

    async fn turn_status(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<TurnSnapshot, ServiceError> {
        let url = self.space_url(&format!(
            "/conversations/{session_id}/messages/{message_id}"
        ));
        let message: ApiMessage = self.get_json(url).await?;

        let status = match TurnStatus::parse(&message.status) {
            Some(status) => status,
            None => {
                debug!(raw = %message.status, "unknown turn status, treating as in-flight");
                TurnStatus::Executing
            }
        };

        let sql = message
            .attachments
            .iter()
            .find_map(|a| a.query.as_ref())
            .map(|q| q.query.clone());
        let text = {
            let parts: Vec<&str> = message
                .attachments
                .iter()
                .filter_map(|a| a.text.as_ref())
                .map(|t| t.content.as_str())
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        };
        let suggestions: Vec<String> = message
            .attachments
            .iter()
            .filter_map(|a| a.suggested_questions.clone())
            .flatten()
            .collect();

        let result_count = if status == TurnStatus::Completed && sql.is_some() {
            self.fetch_result_count(session_id, message_id).await
        } else {
            None
        };

        Ok(TurnSnapshot {
            status,
            text,
            sql,
            result_count,
            suggestions,
            failure_reason: message.error.map(|e| e.message),
        })
    }
}

fn transport_error(err: reqwest::Error) -> ServiceError {
    ServiceError::Unavailable(err.to_string())
}

async fn decode_response<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, ServiceError> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        // Bad or missing token is a configuration problem; callers degrade
        // to fallback the same way they would for an unreachable host.
        let body = resp.text().await.unwrap_or_default();
        return Err(ServiceError::Unavailable(format!(
            "auth rejected ({status}): {body}"
        )));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ServiceError::Api {
            status: status.as_u16(),
            message: body,
        });
    }
    resp.json::<T>().await.map_err(|e| ServiceError::Api {
        status: status.as_u16(),
        message: format!("malformed response: {e}"),
    })
}

#[derive(Debug, Clone, Serialize)]
struct ApiMessageRequest<'a> {
    content: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiStartResponse {
    conversation_id: String,
    message_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiMessage {
    #[serde(alias = "message_id")]
    id: String,
    status: String,
    #[serde(default)]
    attachments: Vec<ApiAttachment>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiAttachment {
    #[serde(default)]
    text: Option<ApiText>,
    #[serde(default)]
    query: Option<ApiQuery>,
    #[serde(default)]
    suggested_questions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiText {
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiQuery {
    query: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiQueryResult {
    #[serde(default)]
    statement_response: Option<ApiStatementResponse>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiStatementResponse {
    #[serde(default)]
    manifest: Option<ApiManifest>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiManifest {
    #[serde(default)]
    total_row_count: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GenieClient {
        GenieClient::new(GenieConfig::new(server.uri(), "dapi-test", "space-1"))
    }

    #[tokio::test]
    async fn start_turn_captures_assigned_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/genie/spaces/space-1/start-conversation"))
            .and(body_json(serde_json::json!({"content": "how many diabetics?"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "conversation_id": "conv-1",
                "message_id": "msg-1",
                "conversation": {"id": "conv-1"},
                "message": {"id": "msg-1", "status": "SUBMITTED"}
            })))
            .mount(&server)
            .await;

        let start = client(&server).start_turn("how many diabetics?").await.unwrap();
        assert_eq!(
            start,
            TurnStart {
                session_id: "conv-1".into(),
                message_id: "msg-1".into()
            }
        );
    }

    #[tokio::test]
    async fn continue_turn_posts_to_conversation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(
                "/api/2.0/genie/spaces/space-1/conversations/conv-1/messages",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg-2",
                "status": "SUBMITTED"
            })))
            .mount(&server)
            .await;

        let message_id = client(&server)
            .continue_turn("conv-1", "of those, women only")
            .await
            .unwrap();
        assert_eq!(message_id, "msg-2");
    }

    #[tokio::test]
    async fn in_flight_status_has_no_sql() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/api/2.0/genie/spaces/space-1/conversations/conv-1/messages/msg-1",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg-1",
                "status": "EXECUTING_QUERY"
            })))
            .mount(&server)
            .await;

        let snapshot = client(&server).turn_status("conv-1", "msg-1").await.unwrap();
        assert_eq!(snapshot.status, TurnStatus::ExecutingQuery);
        assert!(snapshot.sql.is_none());
        assert!(snapshot.result_count.is_none());
    }

    #[tokio::test]
    async fn completed_status_extracts_sql_text_and_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/api/2.0/genie/spaces/space-1/conversations/conv-1/messages/msg-1",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg-1",
                "status": "COMPLETED",
                "attachments": [
                    {"text": {"content": "There are 1204 matching patients."}},
                    {"query": {"query": "SELECT person_id FROM omop.person"}},
                    {"suggested_questions": ["break down by gender?"]}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(
                "/api/2.0/genie/spaces/space-1/conversations/conv-1/messages/msg-1/query-result",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "statement_response": {"manifest": {"total_row_count": 1204}}
            })))
            .mount(&server)
            .await;

        let snapshot = client(&server).turn_status("conv-1", "msg-1").await.unwrap();
        assert_eq!(snapshot.status, TurnStatus::Completed);
        assert_eq!(
            snapshot.sql.as_deref(),
            Some("SELECT person_id FROM omop.person")
        );
        assert_eq!(
            snapshot.text.as_deref(),
            Some("There are 1204 matching patients.")
        );
        assert_eq!(snapshot.result_count, Some(1204));
        assert_eq!(snapshot.suggestions, vec!["break down by gender?"]);
    }

    #[tokio::test]
    async fn missing_query_result_leaves_count_unset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/api/2.0/genie/spaces/space-1/conversations/conv-1/messages/msg-1",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg-1",
                "status": "COMPLETED",
                "attachments": [{"query": {"query": "SELECT 1"}}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(
                "/api/2.0/genie/spaces/space-1/conversations/conv-1/messages/msg-1/query-result",
            ))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let snapshot = client(&server).turn_status("conv-1", "msg-1").await.unwrap();
        assert_eq!(snapshot.status, TurnStatus::Completed);
        assert_eq!(snapshot.result_count, None);
    }

    #[tokio::test]
    async fn failed_status_carries_reason() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/api/2.0/genie/spaces/space-1/conversations/conv-1/messages/msg-1",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg-1",
                "status": "FAILED",
                "error": {"message": "query generation failed"}
            })))
            .mount(&server)
            .await;

        let snapshot = client(&server).turn_status("conv-1", "msg-1").await.unwrap();
        assert_eq!(snapshot.status, TurnStatus::Failed);
        assert_eq!(
            snapshot.failure_reason.as_deref(),
            Some("query generation failed")
        );
    }

    #[tokio::test]
    async fn unknown_status_is_treated_as_in_flight() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/api/2.0/genie/spaces/space-1/conversations/conv-1/messages/msg-1",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg-1",
                "status": "PREPARING_STATEMENT"
            })))
            .mount(&server)
            .await;

        let snapshot = client(&server).turn_status("conv-1", "msg-1").await.unwrap();
        assert!(!snapshot.status.is_terminal());
    }

    #[tokio::test]
    async fn auth_rejection_maps_to_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/genie/spaces/space-1/start-conversation"))
            .respond_with(ResponseTemplate::new(403).set_body_string("permission denied"))
            .mount(&server)
            .await;

        let err = client(&server).start_turn("q").await.unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));
        assert!(err.to_string().contains("permission denied"));
    }

    #[tokio::test]
    async fn server_error_maps_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/genie/spaces/space-1/start-conversation"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
            .mount(&server)
            .await;

        let err = client(&server).start_turn("q").await.unwrap_err();
        assert_eq!(
            err,
            ServiceError::Api {
                status: 500,
                message: "internal error".into()
            }
        );
    }

    #[tokio::test]
    async fn unreachable_host_maps_to_unavailable() {
        let client = GenieClient::new(GenieConfig::new(
            "http://127.0.0.1:1",
            "dapi-test",
            "space-1",
        ));
        let err = client.start_turn("q").await.unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));
    }
}
