//! Natural-language-to-SQL turns against an external AI query service.
//!
//! `QueryService` is the seam: `GenieClient` is the HTTP implementation,
//! `StubQueryService` a scripted one for tests. `TurnRunner` drives a single
//! turn from submission to a terminal state with bounded polling.

pub mod genie;
pub mod turn;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use genie::{GenieClient, GenieConfig};
pub use turn::{TurnError, TurnOutcome, TurnPolicy, TurnRunner, TurnTracker};

/// Lifecycle state of one in-flight exchange. The service reports
/// intermediate states in whatever order it likes; the runner only
/// distinguishes in-flight from terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnStatus {
    Submitted,
    QueryingHistory,
    ExecutingQuery,
    Executing,
    FetchingMetadata,
    Compiling,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl TurnStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }

    /// Parse a service-reported status string. Unknown strings map to
    /// `None`; callers treat them as still in flight.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUBMITTED" => Some(Self::Submitted),
            "QUERYING_HISTORY" => Some(Self::QueryingHistory),
            "EXECUTING_QUERY" => Some(Self::ExecutingQuery),
            "EXECUTING" => Some(Self::Executing),
            "FETCHING_METADATA" => Some(Self::FetchingMetadata),
            "COMPILING" => Some(Self::Compiling),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" | "CANCELED" => Some(Self::Cancelled),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Point-in-time view of a turn as reported by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnSnapshot {
    pub status: TurnStatus,
    /// Narrative answer text, present on completed turns.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub result_count: Option<i64>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl TurnSnapshot {
    pub fn in_flight(status: TurnStatus) -> Self {
        Self {
            status,
            text: None,
            sql: None,
            result_count: None,
            suggestions: Vec::new(),
            failure_reason: None,
        }
    }

    pub fn completed(sql: &str, result_count: i64, suggestions: &[&str]) -> Self {
        Self {
            status: TurnStatus::Completed,
            text: None,
            sql: Some(sql.to_string()),
            result_count: Some(result_count),
            suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
            failure_reason: None,
        }
    }

    pub fn failed(status: TurnStatus, reason: &str) -> Self {
        Self {
            status,
            text: None,
            sql: None,
            result_count: None,
            suggestions: Vec::new(),
            failure_reason: Some(reason.to_string()),
        }
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }
}

/// Ids assigned by the service when a new conversation is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnStart {
    pub session_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Network failure or misconfiguration; callers degrade to the
    /// deterministic fallback path.
    #[error("ai query service unavailable: {0}")]
    Unavailable(String),
    #[error("ai query service error ({status}): {message}")]
    Api { status: u16, message: String },
}

#[async_trait]
pub trait QueryService: Send + Sync {
    async fn start_turn(&self, text: &str) -> Result<TurnStart, ServiceError>;
    async fn continue_turn(&self, session_id: &str, text: &str)
        -> Result<String, ServiceError>;
    async fn turn_status(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<TurnSnapshot, ServiceError>;
}

/// Scripted service for tests: returns queued status snapshots in order,
/// repeating the last one once the script is exhausted.
pub struct StubQueryService {
    session_id: String,
    script: std::sync::Mutex<VecDeque<TurnSnapshot>>,
    last: std::sync::Mutex<Option<TurnSnapshot>>,
    submitted: std::sync::Mutex<Vec<String>>,
    message_counter: AtomicUsize,
    status_calls: AtomicUsize,
    unavailable: bool,
}

impl StubQueryService {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            script: std::sync::Mutex::new(VecDeque::new()),
            last: std::sync::Mutex::new(None),
            submitted: std::sync::Mutex::new(Vec::new()),
            message_counter: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            unavailable: false,
        }
    }

    /// Every call fails with `ServiceError::Unavailable`.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new("unreachable")
        }
    }

    pub fn push_status(&self, snapshot: TurnSnapshot) {
        self.script.lock().unwrap().push_back(snapshot);
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    fn next_message_id(&self) -> String {
        let n = self.message_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("msg-{n}")
    }
}

#[async_trait]
impl QueryService for StubQueryService {
    async fn start_turn(&self, text: &str) -> Result<TurnStart, ServiceError> {
        if self.unavailable {
            return Err(ServiceError::Unavailable("connection refused".into()));
        }
        self.submitted.lock().unwrap().push(text.to_string());
        Ok(TurnStart {
            session_id: self.session_id.clone(),
            message_id: self.next_message_id(),
        })
    }

    async fn continue_turn(
        &self,
        _session_id: &str,
        text: &str,
    ) -> Result<String, ServiceError> {
        if self.unavailable {
            return Err(ServiceError::Unavailable("connection refused".into()));
        }
        self.submitted.lock().unwrap().push(text.to_string());
        Ok(self.next_message_id())
    }

    async fn turn_status(
        &self,
        _session_id: &str,
        _message_id: &str,
    ) -> Result<TurnSnapshot, ServiceError> {
        if self.unavailable {
            return Err(ServiceError::Unavailable("connection refused".into()));
        }
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        match script.pop_front() {
            Some(snapshot) => {
                *self.last.lock().unwrap() = Some(snapshot.clone());
                Ok(snapshot)
            }
            None => {
                let last = self.last.lock().unwrap();
                Ok(last
                    .clone()
                    .unwrap_or_else(|| TurnSnapshot::in_flight(TurnStatus::Submitted)))
            }
        }
    }
}
