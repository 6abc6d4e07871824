//! Single-turn state machine: submit, poll with growing intervals, stop at
//! a terminal state or when the wall-clock budget runs out.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{QueryService, ServiceError, TurnStatus};

/// Polling schedule for one turn. Intervals double from `poll_initial` up to
/// `poll_max`; the whole turn is abandoned after `budget`.
#[derive(Debug, Clone, Copy)]
pub struct TurnPolicy {
    pub poll_initial: Duration,
    pub poll_max: Duration,
    pub budget: Duration,
}

impl Default for TurnPolicy {
    fn default() -> Self {
        Self {
            poll_initial: Duration::from_secs(2),
            poll_max: Duration::from_secs(10),
            budget: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("turn failed: {reason}")]
    Failed { reason: String },
    #[error("turn cancelled: {reason}")]
    Cancelled { reason: String },
    #[error("conversation expired: {reason}")]
    Expired { reason: String },
    #[error("turn timed out after {waited_secs}s")]
    TimedOut { waited_secs: u64 },
    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub session_id: String,
    pub message_id: String,
    pub text: Option<String>,
    pub sql: Option<String>,
    pub result_count: Option<i64>,
    pub suggestions: Vec<String>,
}

/// Queryable progress side-channel keyed by `session_id:message_id`. Entries
/// live only while the turn is in flight.
#[derive(Clone, Default)]
pub struct TurnTracker {
    inner: Arc<RwLock<HashMap<String, TurnStatus>>>,
}

impl TurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, session_id: &str, message_id: &str) -> Option<TurnStatus> {
        self.inner
            .read()
            .ok()?
            .get(&key(session_id, message_id))
            .copied()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or(0)
    }

    fn update(&self, key: &str, status: TurnStatus) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(key.to_string(), status);
        }
    }

    fn clear(&self, key: &str) {
        if let Ok(mut map) = self.inner.write() {
            map.remove(key);
        }
    }
}

fn key(session_id: &str, message_id: &str) -> String {
    format!("{session_id}:{message_id}")
}

pub struct TurnRunner {
    service: Arc<dyn QueryService>,
    policy: TurnPolicy,
    tracker: TurnTracker,
}

impl TurnRunner {
    pub fn new(service: Arc<dyn QueryService>, policy: TurnPolicy) -> Self {
        Self {
            service,
            policy,
            tracker: TurnTracker::new(),
        }
    }

    pub fn tracker(&self) -> TurnTracker {
        self.tracker.clone()
    }

    /// Drive one turn to resolution. With no `session_id` a new conversation
    /// is started; otherwise the text continues the given one. Terminal
    /// failures are not retried here; retry is a caller decision.
    pub async fn run_turn(
        &self,
        session_id: Option<&str>,
        text: &str,
    ) -> Result<TurnOutcome, TurnError> {
        let started = Instant::now();

        let (session_id, message_id) = match session_id {
            None => {
                let start = self.service.start_turn(text).await?;
                (start.session_id, start.message_id)
            }
            Some(existing) => {
                let message_id = self.service.continue_turn(existing, text).await?;
                (existing.to_string(), message_id)
            }
        };

        let turn_key = key(&session_id, &message_id);
        self.tracker.update(&turn_key, TurnStatus::Submitted);

        let result = self
            .poll_until_terminal(&session_id, &message_id, &turn_key, started)
            .await;
        self.tracker.clear(&turn_key);
        result
    }

    async fn poll_until_terminal(
        &self,
        session_id: &str,
        message_id: &str,
        turn_key: &str,
        started: Instant,
    ) -> Result<TurnOutcome, TurnError> {
        let mut interval = self.policy.poll_initial;

        loop {
            let elapsed = started.elapsed();
            if elapsed >= self.policy.budget {
                warn!(session_id, message_id, "turn exceeded wall-clock budget");
                return Err(TurnError::TimedOut {
                    waited_secs: elapsed.as_secs(),
                });
            }

            tokio::time::sleep(interval.min(self.policy.budget - elapsed)).await;

            let snapshot = self.service.turn_status(session_id, message_id).await?;
            debug!(session_id, message_id, status = ?snapshot.status, "turn status");
            self.tracker.update(turn_key, snapshot.status);

            if snapshot.status.is_terminal() {
                let reason = |fallback: &str| {
                    snapshot
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| fallback.to_string())
                };
                return match snapshot.status {
                    TurnStatus::Completed => Ok(TurnOutcome {
                        session_id: session_id.to_string(),
                        message_id: message_id.to_string(),
                        text: snapshot.text,
                        sql: snapshot.sql,
                        result_count: snapshot.result_count,
                        suggestions: snapshot.suggestions,
                    }),
                    TurnStatus::Failed => Err(TurnError::Failed {
                        reason: reason("service reported failure"),
                    }),
                    TurnStatus::Cancelled => Err(TurnError::Cancelled {
                        reason: reason("turn was cancelled"),
                    }),
                    TurnStatus::Expired => Err(TurnError::Expired {
                        reason: reason("conversation expired"),
                    }),
                    _ => unreachable!("non-terminal status after is_terminal check"),
                };
            }

            interval = (interval * 2).min(self.policy.poll_max);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StubQueryService, TurnSnapshot};

    fn fast_policy() -> TurnPolicy {
        TurnPolicy {
            poll_initial: Duration::from_millis(2),
            poll_max: Duration::from_millis(10),
            budget: Duration::from_millis(80),
        }
    }

    #[tokio::test]
    async fn completed_turn_returns_outcome() {
        let stub = Arc::new(StubQueryService::new("sess-1"));
        stub.push_status(TurnSnapshot::in_flight(TurnStatus::QueryingHistory));
        stub.push_status(TurnSnapshot::in_flight(TurnStatus::ExecutingQuery));
        stub.push_status(TurnSnapshot::completed(
            "SELECT person_id FROM person",
            42,
            &["break down by age?"],
        ));

        let runner = TurnRunner::new(stub, fast_policy());
        let outcome = runner.run_turn(None, "how many patients?").await.unwrap();

        assert_eq!(outcome.session_id, "sess-1");
        assert_eq!(outcome.message_id, "msg-1");
        assert_eq!(outcome.sql.as_deref(), Some("SELECT person_id FROM person"));
        assert_eq!(outcome.result_count, Some(42));
        assert_eq!(outcome.suggestions, vec!["break down by age?"]);
    }

    #[tokio::test]
    async fn continuation_reuses_session_id() {
        let stub = Arc::new(StubQueryService::new("sess-9"));
        stub.push_status(TurnSnapshot::completed("SELECT 1", 1, &[]));

        let runner = TurnRunner::new(stub.clone(), fast_policy());
        let outcome = runner
            .run_turn(Some("sess-9"), "and on insulin?")
            .await
            .unwrap();

        assert_eq!(outcome.session_id, "sess-9");
        assert_eq!(stub.submitted(), vec!["and on insulin?"]);
    }

    #[tokio::test]
    async fn failed_turn_carries_service_reason() {
        let stub = Arc::new(StubQueryService::new("sess-1"));
        stub.push_status(TurnSnapshot::failed(
            TurnStatus::Failed,
            "could not resolve table reference",
        ));

        let runner = TurnRunner::new(stub, fast_policy());
        let err = runner.run_turn(None, "bad question").await.unwrap_err();
        assert_eq!(
            err,
            TurnError::Failed {
                reason: "could not resolve table reference".into()
            }
        );
    }

    #[tokio::test]
    async fn cancelled_and_expired_are_distinct() {
        let stub = Arc::new(StubQueryService::new("sess-1"));
        stub.push_status(TurnSnapshot::failed(TurnStatus::Cancelled, "user cancelled"));
        let runner = TurnRunner::new(stub, fast_policy());
        assert!(matches!(
            runner.run_turn(None, "q").await.unwrap_err(),
            TurnError::Cancelled { .. }
        ));

        let stub = Arc::new(StubQueryService::new("sess-2"));
        stub.push_status(TurnSnapshot::failed(TurnStatus::Expired, "too old"));
        let runner = TurnRunner::new(stub, fast_policy());
        assert!(matches!(
            runner.run_turn(None, "q").await.unwrap_err(),
            TurnError::Expired { .. }
        ));
    }

    #[tokio::test]
    async fn stuck_turn_times_out_within_budget() {
        let stub = Arc::new(StubQueryService::new("sess-1"));
        // Script never reaches a terminal state; the stub keeps reporting
        // EXECUTING_QUERY forever.
        stub.push_status(TurnSnapshot::in_flight(TurnStatus::ExecutingQuery));

        let runner = TurnRunner::new(stub, fast_policy());
        let started = std::time::Instant::now();
        let err = runner.run_turn(None, "slow question").await.unwrap_err();

        assert!(matches!(err, TurnError::TimedOut { .. }));
        // Budget is 80ms; allow generous scheduling slack.
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn unavailable_service_propagates_as_service_error() {
        let stub = Arc::new(StubQueryService::unavailable());
        let runner = TurnRunner::new(stub, fast_policy());
        let err = runner.run_turn(None, "q").await.unwrap_err();
        assert!(matches!(
            err,
            TurnError::Service(ServiceError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn tracker_exposes_progress_and_drops_resolved_turns() {
        let stub = Arc::new(StubQueryService::new("sess-1"));
        stub.push_status(TurnSnapshot::in_flight(TurnStatus::ExecutingQuery));
        stub.push_status(TurnSnapshot::completed("SELECT 1", 1, &[]));

        let runner = TurnRunner::new(stub, fast_policy());
        let tracker = runner.tracker();
        let outcome = runner.run_turn(None, "q").await.unwrap();

        // Once resolved, the side-channel entry is gone.
        assert_eq!(tracker.status(&outcome.session_id, &outcome.message_id), None);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn polling_backs_off_instead_of_busy_looping() {
        // Intervals grow 2, 4, 8, 10, 10... ms; within the 80ms budget that
        // allows roughly ten polls. A busy loop would record hundreds.
        let stub = Arc::new(StubQueryService::new("sess-1"));
        stub.push_status(TurnSnapshot::in_flight(TurnStatus::Executing));

        let runner = TurnRunner::new(stub.clone(), fast_policy());
        let err = runner.run_turn(None, "q").await.unwrap_err();

        assert!(matches!(err, TurnError::TimedOut { .. }));
        assert!(stub.status_calls() >= 3);
        assert!(stub.status_calls() <= 15, "polled {}", stub.status_calls());
    }
}
