use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The clinical event family a criteria node filters on. Determines the
/// backing OMOP table and which optional fields apply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CriteriaKind {
    Condition,
    Drug,
    Procedure,
    Visit,
    Observation,
    Age,
    Gender,
}

impl CriteriaKind {
    /// Kinds that match events by OMOP concept id. Age is the only kind
    /// driven purely by a numeric range.
    pub fn is_concept_filterable(&self) -> bool {
        !matches!(self, Self::Age)
    }

    pub fn is_temporal_filterable(&self) -> bool {
        matches!(
            self,
            Self::Condition | Self::Drug | Self::Procedure | Self::Visit | Self::Observation
        )
    }

    pub fn is_value_filterable(&self) -> bool {
        matches!(self, Self::Observation | Self::Age)
    }

    /// Kinds where `min_occurrences` is meaningful (event tables, not the
    /// person registry).
    pub fn is_count_filterable(&self) -> bool {
        self.is_temporal_filterable()
    }
}

/// Half-open date interval `[start, end)`. Either bound may be absent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateRange {
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

/// Inclusive numeric interval `[min, max]`. Either bound may be absent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ValueRange {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

fn default_min_occurrences() -> u32 {
    1
}

/// One atomic inclusion/exclusion condition. A single concrete type with a
/// kind discriminator; the compiler switches on `kind` to pick the backing
/// table and the applicable filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriteriaNode {
    pub id: String,
    pub kind: CriteriaKind,
    /// OMOP concept ids; OR semantics within one node.
    #[serde(default)]
    pub concept_ids: Vec<i64>,
    /// Display names for the concepts, no computational role.
    #[serde(default)]
    pub concept_names: Vec<String>,
    /// Node matches only if the qualifying event recurs at least this often.
    #[serde(default = "default_min_occurrences")]
    pub min_occurrences: u32,
    #[serde(default)]
    pub date_range: Option<DateRange>,
    #[serde(default)]
    pub value_range: Option<ValueRange>,
    #[serde(default)]
    pub is_exclusion: bool,
}

impl CriteriaNode {
    pub fn new(id: impl Into<String>, kind: CriteriaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            concept_ids: Vec::new(),
            concept_names: Vec::new(),
            min_occurrences: 1,
            date_range: None,
            value_range: None,
            is_exclusion: false,
        }
    }

    pub fn with_concepts(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.concept_ids = ids.into_iter().collect();
        self
    }

    pub fn with_min_occurrences(mut self, n: u32) -> Self {
        self.min_occurrences = n;
        self
    }

    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    pub fn with_value_range(mut self, range: ValueRange) -> Self {
        self.value_range = Some(range);
        self
    }

    pub fn exclusion(mut self) -> Self {
        self.is_exclusion = true;
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.kind.is_concept_filterable() && self.concept_ids.is_empty() {
            return Err(ValidationError::EmptyConceptSet {
                node_id: self.id.clone(),
            });
        }
        if self.min_occurrences == 0 {
            return Err(ValidationError::ZeroOccurrences {
                node_id: self.id.clone(),
            });
        }
        if let Some(range) = &self.date_range {
            if let (Some(start), Some(end)) = (range.start, range.end) {
                if start >= end {
                    return Err(ValidationError::InvertedDateRange {
                        node_id: self.id.clone(),
                        start,
                        end,
                    });
                }
            }
        }
        if let Some(range) = &self.value_range {
            if let (Some(min), Some(max)) = (range.min, range.max) {
                if min > max {
                    return Err(ValidationError::InvertedValueRange {
                        node_id: self.id.clone(),
                        min,
                        max,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Named set of inclusion/exclusion criteria describing a patient
/// population. Immutable once handed to the compiler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CohortDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inclusion_criteria: Vec<CriteriaNode>,
    #[serde(default)]
    pub exclusion_criteria: Vec<CriteriaNode>,
}

impl CohortDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn criteria(&self) -> impl Iterator<Item = &CriteriaNode> + '_ {
        self.inclusion_criteria
            .iter()
            .chain(self.exclusion_criteria.iter())
    }

    /// Structural validation. Inclusion criteria must be non-empty; every
    /// node must be well-formed; node ids must be unique across both lists.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.inclusion_criteria.is_empty() {
            return Err(ValidationError::NoInclusionCriteria);
        }
        let mut seen = std::collections::HashSet::new();
        for node in self.criteria() {
            node.validate()?;
            if !seen.insert(node.id.as_str()) {
                return Err(ValidationError::DuplicateNodeId {
                    node_id: node.id.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("cohort definition has no inclusion criteria")]
    NoInclusionCriteria,
    #[error("criteria node {node_id} has an empty concept set")]
    EmptyConceptSet { node_id: String },
    #[error("criteria node {node_id} requires min_occurrences >= 1")]
    ZeroOccurrences { node_id: String },
    #[error("criteria node {node_id} has inverted date range {start}..{end}")]
    InvertedDateRange {
        node_id: String,
        start: NaiveDate,
        end: NaiveDate,
    },
    #[error("criteria node {node_id} has inverted value range {min}..{max}")]
    InvertedValueRange { node_id: String, min: f64, max: f64 },
    #[error("duplicate criteria node id {node_id}")]
    DuplicateNodeId { node_id: String },
}

/// OMOP vocabulary concept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Concept {
    pub concept_id: i64,
    pub concept_name: String,
    pub domain_id: String,
    pub vocabulary_id: String,
    pub concept_class_id: String,
    #[serde(default)]
    pub standard_concept: Option<String>,
    pub concept_code: String,
}

/// Resolved concept reference as returned by concept search; a lighter
/// shape than the full `Concept` row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConceptRef {
    pub concept_id: i64,
    pub concept_name: String,
    pub domain_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub message_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sql_generated: Option<String>,
    #[serde(default)]
    pub result_count: Option<i64>,
    #[serde(default)]
    pub suggested_questions: Vec<String>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            sql_generated: None,
            result_count: None,
            suggested_questions: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            ..Self::user(content)
        }
    }
}

/// Ordered, append-only transcript of one conversation with the AI query
/// service. Messages alternate user/assistant; the list only grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub session_id: String,
    pub messages: Vec<ConversationMessage>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
            created_at: now,
            last_active: now,
        }
    }

    /// Append a completed user/assistant pair. Turns are only ever recorded
    /// whole, so a reader never observes an orphan message.
    pub fn append_turn(&mut self, user: ConversationMessage, assistant: ConversationMessage) {
        debug_assert_eq!(user.role, Role::User);
        debug_assert_eq!(assistant.role, Role::Assistant);
        self.messages.push(user);
        self.messages.push(assistant);
        self.last_active = Utc::now();
    }

    pub fn turn_count(&self) -> usize {
        self.messages.len() / 2
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerSource {
    /// Produced by the external AI query service.
    Service,
    /// Produced by the deterministic keyword fallback.
    Fallback,
}

/// Outcome of one conversational ask, from either the service or the
/// fallback path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortAnswer {
    pub text: String,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub result_count: Option<i64>,
    #[serde(default)]
    pub suggested_questions: Vec<String>,
    pub source: AnswerSource,
    /// Original failure reason when the service path degraded to fallback.
    #[serde(default)]
    pub degraded_reason: Option<String>,
    /// True when the fallback matched no clinical terms and returned the
    /// whole-population definition.
    #[serde(default)]
    pub low_confidence: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition_node(id: &str) -> CriteriaNode {
        CriteriaNode::new(id, CriteriaKind::Condition).with_concepts([201826])
    }

    #[test]
    fn kind_capabilities() {
        assert!(CriteriaKind::Condition.is_concept_filterable());
        assert!(CriteriaKind::Gender.is_concept_filterable());
        assert!(!CriteriaKind::Age.is_concept_filterable());
        assert!(CriteriaKind::Observation.is_value_filterable());
        assert!(CriteriaKind::Age.is_value_filterable());
        assert!(!CriteriaKind::Gender.is_count_filterable());
        assert!(CriteriaKind::Drug.is_count_filterable());
    }

    #[test]
    fn validate_requires_inclusion_criteria() {
        let def = CohortDefinition::new("empty");
        assert_eq!(def.validate(), Err(ValidationError::NoInclusionCriteria));
    }

    #[test]
    fn validate_rejects_empty_concept_set() {
        let mut def = CohortDefinition::new("c");
        def.inclusion_criteria
            .push(CriteriaNode::new("n1", CriteriaKind::Drug));
        assert!(matches!(
            def.validate(),
            Err(ValidationError::EmptyConceptSet { node_id }) if node_id == "n1"
        ));
    }

    #[test]
    fn validate_allows_age_without_concepts() {
        let mut def = CohortDefinition::new("c");
        def.inclusion_criteria.push(
            CriteriaNode::new("age", CriteriaKind::Age).with_value_range(ValueRange {
                min: Some(18.0),
                max: Some(65.0),
            }),
        );
        assert!(def.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_occurrences() {
        let mut def = CohortDefinition::new("c");
        def.inclusion_criteria
            .push(condition_node("n1").with_min_occurrences(0));
        assert!(matches!(
            def.validate(),
            Err(ValidationError::ZeroOccurrences { .. })
        ));
    }

    #[test]
    fn validate_rejects_inverted_date_range() {
        let mut def = CohortDefinition::new("c");
        def.inclusion_criteria
            .push(condition_node("n1").with_date_range(DateRange {
                start: NaiveDate::from_ymd_opt(2024, 6, 1),
                end: NaiveDate::from_ymd_opt(2024, 1, 1),
            }));
        assert!(matches!(
            def.validate(),
            Err(ValidationError::InvertedDateRange { .. })
        ));
    }

    #[test]
    fn validate_accepts_open_ended_date_range() {
        let mut def = CohortDefinition::new("c");
        def.inclusion_criteria
            .push(condition_node("n1").with_date_range(DateRange {
                start: NaiveDate::from_ymd_opt(2024, 1, 1),
                end: None,
            }));
        assert!(def.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let mut def = CohortDefinition::new("c");
        def.inclusion_criteria.push(condition_node("n1"));
        def.exclusion_criteria.push(condition_node("n1").exclusion());
        assert!(matches!(
            def.validate(),
            Err(ValidationError::DuplicateNodeId { node_id }) if node_id == "n1"
        ));
    }

    #[test]
    fn criteria_node_serde_defaults() {
        let raw = r#"{"id":"n1","kind":"condition","concept_ids":[201826]}"#;
        let node: CriteriaNode = serde_json::from_str(raw).unwrap();
        assert_eq!(node.min_occurrences, 1);
        assert!(!node.is_exclusion);
        assert!(node.date_range.is_none());
        assert!(node.value_range.is_none());
    }

    #[test]
    fn cohort_definition_serde_roundtrip() {
        let mut def = CohortDefinition::new("t2dm on metformin");
        def.description = "type 2 diabetics exposed to metformin".into();
        def.inclusion_criteria.push(condition_node("inc-1"));
        def.exclusion_criteria.push(
            CriteriaNode::new("exc-1", CriteriaKind::Condition)
                .with_concepts([443454])
                .exclusion(),
        );

        let json = serde_json::to_string(&def).unwrap();
        let parsed: CohortDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "t2dm on metformin");
        assert_eq!(parsed.inclusion_criteria.len(), 1);
        assert_eq!(parsed.exclusion_criteria.len(), 1);
        assert!(parsed.exclusion_criteria[0].is_exclusion);
    }

    #[test]
    fn append_turn_keeps_pairs_ordered() {
        let mut session = ConversationSession::new("s1");
        session.append_turn(
            ConversationMessage::user("how many diabetics?"),
            ConversationMessage::assistant("1,204 patients"),
        );
        session.append_turn(
            ConversationMessage::user("of those, on insulin?"),
            ConversationMessage::assistant("312 patients"),
        );

        assert_eq!(session.messages.len(), 4);
        assert_eq!(session.turn_count(), 2);
        let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
    }

    #[test]
    fn conversation_message_serde_roundtrip() {
        let mut msg = ConversationMessage::assistant("7 patients");
        msg.sql_generated = Some("SELECT person_id FROM person".into());
        msg.result_count = Some(7);
        msg.suggested_questions = vec!["break down by gender?".into()];

        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ConversationMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.role, Role::Assistant);
        assert_eq!(parsed.result_count, Some(7));
        assert_eq!(parsed.suggested_questions.len(), 1);
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError::EmptyConceptSet {
            node_id: "n9".into(),
        };
        assert!(err.to_string().contains("n9"));
        assert!(err.to_string().contains("empty concept set"));
    }
}
