//! Conversation orchestration: multi-turn session state over the AI query
//! service, with live re-execution of generated SQL and a deterministic
//! keyword fallback when the service cannot answer.

pub mod fallback;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use cohortd_compiler::{compile, CompileError, CompilerConfig};
use cohortd_nlq::{TurnRunner, TurnTracker};
use cohortd_schema::{AnswerSource, CohortAnswer, ConversationMessage, ConversationSession};
use cohortd_warehouse::{Aggregator, QueryExecutionError};

pub use fallback::{MatchedDefinition, RuleMatcher};

/// Keyed store for conversation sessions. The in-memory implementation is
/// the single-instance deployment shape; this trait is the seam for a
/// shared store.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Option<ConversationSession>;
    async fn upsert(&self, session: ConversationSession);
    async fn remove(&self, session_id: &str) -> bool;
    async fn list(&self) -> Vec<ConversationSession>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: tokio::sync::RwLock<HashMap<String, ConversationSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Option<ConversationSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn upsert(&self, session: ConversationSession) {
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session);
    }

    async fn remove(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    async fn list(&self) -> Vec<ConversationSession> {
        let mut sessions: Vec<ConversationSession> =
            self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        sessions
    }
}

/// At-most-one in-flight turn per session. The guard releases on drop, so an
/// abandoned ask cannot wedge its session.
#[derive(Clone, Default)]
struct InFlightLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

struct InFlightGuard {
    held: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InFlightLocks {
    fn try_acquire(&self, key: &str) -> Option<InFlightGuard> {
        let mut held = self.held.lock().unwrap();
        if held.insert(key.to_string()) {
            Some(InFlightGuard {
                held: self.held.clone(),
                key: key.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.key);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AskError {
    /// A prior turn for this session has not resolved yet; retry after it
    /// does. Interleaving would break message ordering.
    #[error("a turn is already in flight for session {session_id}")]
    TurnInFlight { session_id: String },
    #[error(transparent)]
    Warehouse(#[from] QueryExecutionError),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Result of one conversational ask: the answer plus a snapshot of the
/// session after the turn was recorded.
#[derive(Debug, Clone)]
pub struct Ask {
    pub answer: CohortAnswer,
    pub session: ConversationSession,
}

pub struct Orchestrator {
    runner: TurnRunner,
    store: Arc<dyn SessionStore>,
    aggregator: Arc<Aggregator>,
    matcher: RuleMatcher,
    compiler: CompilerConfig,
    locks: InFlightLocks,
}

impl Orchestrator {
    pub fn new(
        runner: TurnRunner,
        store: Arc<dyn SessionStore>,
        aggregator: Arc<Aggregator>,
        matcher: RuleMatcher,
        compiler: CompilerConfig,
    ) -> Self {
        Self {
            runner,
            store,
            aggregator,
            matcher,
            compiler,
            locks: InFlightLocks::default(),
        }
    }

    /// Progress side-channel for in-flight turns.
    pub fn tracker(&self) -> TurnTracker {
        self.runner.tracker()
    }

    /// Run one conversational turn. Without a session id a new conversation
    /// is started; with one, the text continues it. Service failures degrade
    /// to the keyword fallback; warehouse failures surface verbatim.
    pub async fn ask(&self, session_id: Option<&str>, text: &str) -> Result<Ask, AskError> {
        let _guard = match session_id {
            Some(sid) => Some(self.locks.try_acquire(sid).ok_or_else(|| {
                AskError::TurnInFlight {
                    session_id: sid.to_string(),
                }
            })?),
            // A brand-new conversation has no id yet, so nothing can race it.
            None => None,
        };

        match self.runner.run_turn(session_id, text).await {
            Ok(outcome) => {
                // Re-execute the generated SQL so the count reflects live
                // data rather than the service's cached estimate.
                let live_count = match &outcome.sql {
                    Some(sql) => Some(self.aggregator.count_for_sql(sql).await?),
                    None => outcome.result_count,
                };

                let answer_text = outcome.text.clone().unwrap_or_else(|| match live_count {
                    Some(n) => format!("{n} matching patients."),
                    None => "The service completed without a result.".to_string(),
                });

                let answer = CohortAnswer {
                    text: answer_text,
                    sql: outcome.sql.clone(),
                    result_count: live_count,
                    suggested_questions: outcome.suggestions.clone(),
                    source: AnswerSource::Service,
                    degraded_reason: None,
                    low_confidence: false,
                };

                let session = self
                    .record_turn(&outcome.session_id, text, &answer)
                    .await;
                Ok(Ask { answer, session })
            }
            Err(err) => {
                warn!(error = %err, "turn failed, degrading to keyword fallback");
                self.fallback_ask(session_id, text, err.to_string()).await
            }
        }
    }

    /// Deterministic fallback path: keyword-match the text into a criteria
    /// tree, compile it, and count against the warehouse.
    async fn fallback_ask(
        &self,
        session_id: Option<&str>,
        text: &str,
        reason: String,
    ) -> Result<Ask, AskError> {
        let matched = self.matcher.match_text(text).await;
        let sql = compile(&matched.definition, &self.compiler)?;
        let count = self.aggregator.preview_count(&matched.definition).await
            .map_err(|e| match e {
                cohortd_warehouse::AggregateError::Warehouse(w) => AskError::Warehouse(w),
                cohortd_warehouse::AggregateError::Compile(c) => AskError::Compile(c),
            })?;

        let answer_text = if matched.low_confidence {
            format!("No clinical terms recognized; whole population counts {count} patients.")
        } else {
            format!(
                "Matched clinical terms: {}. {count} patients match.",
                matched.matched_terms.join(", ")
            )
        };

        let answer = CohortAnswer {
            text: answer_text,
            sql: Some(sql),
            result_count: Some(count),
            suggested_questions: Vec::new(),
            source: AnswerSource::Fallback,
            degraded_reason: Some(reason),
            low_confidence: matched.low_confidence,
        };

        // Fallback-only conversations never reached the service, so they
        // get a locally assigned session id.
        let session_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("local-{}", Uuid::new_v4()));
        let session = self.record_turn(&session_id, text, &answer).await;
        Ok(Ask { answer, session })
    }

    /// Append the completed user/assistant pair. Turns are recorded whole
    /// and only after every fallible step has succeeded, so an abandoned or
    /// failed ask leaves the transcript untouched.
    async fn record_turn(
        &self,
        session_id: &str,
        user_text: &str,
        answer: &CohortAnswer,
    ) -> ConversationSession {
        let mut session = self
            .store
            .get(session_id)
            .await
            .unwrap_or_else(|| ConversationSession::new(session_id));

        let mut assistant = ConversationMessage::assistant(&answer.text);
        assistant.sql_generated = answer.sql.clone();
        assistant.result_count = answer.result_count;
        assistant.suggested_questions = answer.suggested_questions.clone();

        session.append_turn(ConversationMessage::user(user_text), assistant);
        self.store.upsert(session.clone()).await;
        info!(
            session_id,
            messages = session.messages.len(),
            source = ?answer.source,
            "recorded conversation turn"
        );
        session
    }

    /// Discard a session entirely. Returns false when it did not exist.
    pub async fn reset(&self, session_id: &str) -> bool {
        self.store.remove(session_id).await
    }

    pub async fn session(&self, session_id: &str) -> Option<ConversationSession> {
        self.store.get(session_id).await
    }

    pub async fn sessions(&self) -> Vec<ConversationSession> {
        self.store.list().await
    }
}
