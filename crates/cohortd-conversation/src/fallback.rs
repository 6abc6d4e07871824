//! Deterministic keyword fallback: maps free text to a cohort definition
//! when the AI query service cannot be used. Produces inclusion criteria
//! only, and never fails — unmatched text yields a whole-population
//! definition flagged low-confidence.

use std::sync::Arc;

use regex::Regex;
use tracing::warn;

use cohortd_schema::{CohortDefinition, CriteriaKind, CriteriaNode};
use cohortd_warehouse::ConceptResolver;

/// Concepts resolved per matched keyword.
const RESOLVE_LIMIT: usize = 3;

struct KeywordRule {
    pattern: Regex,
    /// Canonical term handed to the concept resolver.
    term: &'static str,
    domain: &'static str,
    kind: CriteriaKind,
}

fn rule(pattern: &str, term: &'static str, domain: &'static str, kind: CriteriaKind) -> KeywordRule {
    KeywordRule {
        pattern: Regex::new(&format!("(?i)\\b(?:{pattern})\\b")).expect("valid keyword pattern"),
        term,
        domain,
        kind,
    }
}

fn builtin_rules() -> Vec<KeywordRule> {
    use CriteriaKind::{Condition, Drug, Procedure, Visit};
    vec![
        // conditions
        rule("diabetes|diabetic", "diabetes", "Condition", Condition),
        rule(
            "hypertension|hypertensive|high blood pressure",
            "hypertension",
            "Condition",
            Condition,
        ),
        rule("heart failure|chf", "heart failure", "Condition", Condition),
        rule("stroke|cerebrovascular accident", "stroke", "Condition", Condition),
        rule("asthma|asthmatic", "asthma", "Condition", Condition),
        rule("copd|chronic obstructive", "copd", "Condition", Condition),
        rule("depression|depressive", "depression", "Condition", Condition),
        rule(
            "atrial fibrillation|afib",
            "atrial fibrillation",
            "Condition",
            Condition,
        ),
        rule(
            "chronic kidney disease|ckd",
            "chronic kidney disease",
            "Condition",
            Condition,
        ),
        rule(
            "myocardial infarction|heart attack",
            "myocardial infarction",
            "Condition",
            Condition,
        ),
        rule("pneumonia", "pneumonia", "Condition", Condition),
        // drugs
        rule("metformin", "metformin", "Drug", Drug),
        rule("insulin", "insulin", "Drug", Drug),
        rule(
            "statin|atorvastatin|simvastatin|rosuvastatin",
            "statin",
            "Drug",
            Drug,
        ),
        rule("furosemide|lasix", "furosemide", "Drug", Drug),
        rule("lisinopril", "lisinopril", "Drug", Drug),
        rule("warfarin", "warfarin", "Drug", Drug),
        rule("aspirin", "aspirin", "Drug", Drug),
        // event-type cues
        rule("surgery|surgical|operation", "surgical procedure", "Procedure", Procedure),
        rule(
            "er visit|emergency room|emergency department|emergency visit",
            "emergency room visit",
            "Visit",
            Visit,
        ),
    ]
}

#[derive(Debug, Clone)]
pub struct MatchedDefinition {
    pub definition: CohortDefinition,
    pub matched_terms: Vec<String>,
    /// True when nothing was recognized and the definition is the
    /// whole-population placeholder.
    pub low_confidence: bool,
}

pub struct RuleMatcher {
    resolver: Arc<dyn ConceptResolver>,
    rules: Vec<KeywordRule>,
}

impl RuleMatcher {
    pub fn new(resolver: Arc<dyn ConceptResolver>) -> Self {
        Self {
            resolver,
            rules: builtin_rules(),
        }
    }

    /// Scan `text` for known clinical keywords, resolving each hit into one
    /// inclusion criteria node. Rules are applied in a fixed order, so the
    /// result is deterministic for a given text and resolver state.
    pub async fn match_text(&self, text: &str) -> MatchedDefinition {
        let mut definition = CohortDefinition::new(cohort_name(text));
        definition.description = format!("keyword fallback for: {text}");
        let mut matched_terms = Vec::new();

        for rule in &self.rules {
            if !rule.pattern.is_match(text) {
                continue;
            }
            let refs = match self
                .resolver
                .search(rule.term, Some(rule.domain), RESOLVE_LIMIT)
                .await
            {
                Ok(refs) => refs,
                Err(e) => {
                    warn!(term = rule.term, error = %e, "concept resolution failed, skipping term");
                    continue;
                }
            };
            if refs.is_empty() {
                continue;
            }

            let mut node = CriteriaNode::new(format!("kw-{}", slug(rule.term)), rule.kind)
                .with_concepts(refs.iter().map(|r| r.concept_id));
            node.concept_names = refs.iter().map(|r| r.concept_name.clone()).collect();
            definition.inclusion_criteria.push(node);
            matched_terms.push(rule.term.to_string());
        }

        if definition.inclusion_criteria.is_empty() {
            // Whole-population placeholder: an unconstrained age node
            // matches every patient in the registry.
            definition
                .inclusion_criteria
                .push(CriteriaNode::new("whole-population", CriteriaKind::Age));
            return MatchedDefinition {
                definition,
                matched_terms,
                low_confidence: true,
            };
        }

        MatchedDefinition {
            definition,
            matched_terms,
            low_confidence: false,
        }
    }
}

fn slug(term: &str) -> String {
    term.replace(' ', "-")
}

fn cohort_name(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= 60 {
        format!("fallback: {trimmed}")
    } else {
        let head: String = trimmed.chars().take(60).collect();
        format!("fallback: {head}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohortd_schema::ConceptRef;
    use cohortd_warehouse::StaticConceptResolver;

    fn cref(id: i64, name: &str, domain: &str) -> ConceptRef {
        ConceptRef {
            concept_id: id,
            concept_name: name.into(),
            domain_id: domain.into(),
        }
    }

    fn resolver() -> Arc<StaticConceptResolver> {
        Arc::new(
            StaticConceptResolver::new()
                .with_entry(
                    "diabetes",
                    vec![cref(201826, "Type 2 diabetes mellitus", "Condition")],
                )
                .with_entry("metformin", vec![cref(1503297, "metformin", "Drug")])
                .with_entry(
                    "stroke",
                    vec![cref(443454, "Cerebral infarction", "Condition")],
                ),
        )
    }

    #[tokio::test]
    async fn matches_condition_and_drug_keywords() {
        let matcher = RuleMatcher::new(resolver());
        let matched = matcher
            .match_text("patients with diabetes taking metformin")
            .await;

        assert!(!matched.low_confidence);
        assert_eq!(matched.matched_terms, vec!["diabetes", "metformin"]);
        let def = &matched.definition;
        assert_eq!(def.inclusion_criteria.len(), 2);
        assert!(def.exclusion_criteria.is_empty());
        assert_eq!(def.inclusion_criteria[0].kind, CriteriaKind::Condition);
        assert_eq!(def.inclusion_criteria[0].concept_ids, vec![201826]);
        assert_eq!(def.inclusion_criteria[1].kind, CriteriaKind::Drug);
        assert_eq!(def.inclusion_criteria[1].concept_ids, vec![1503297]);
        assert!(def.validate().is_ok());
    }

    #[tokio::test]
    async fn matching_is_case_insensitive_and_word_bounded() {
        let matcher = RuleMatcher::new(resolver());
        let matched = matcher.match_text("DIABETIC population").await;
        assert_eq!(matched.matched_terms, vec!["diabetes"]);

        // "prediabetes" must not hit the word-bounded pattern.
        let unmatched = matcher.match_text("prediabetesx screening").await;
        assert!(unmatched.low_confidence);
    }

    #[tokio::test]
    async fn unmatched_text_returns_whole_population_low_confidence() {
        let matcher = RuleMatcher::new(resolver());
        let matched = matcher.match_text("show me something interesting").await;

        assert!(matched.low_confidence);
        assert!(matched.matched_terms.is_empty());
        let def = &matched.definition;
        assert_eq!(def.inclusion_criteria.len(), 1);
        assert_eq!(def.inclusion_criteria[0].id, "whole-population");
        assert_eq!(def.inclusion_criteria[0].kind, CriteriaKind::Age);
        assert!(def.validate().is_ok());
    }

    #[tokio::test]
    async fn unresolvable_terms_are_skipped() {
        // "asthma" matches a rule but the resolver knows nothing about it.
        let matcher = RuleMatcher::new(resolver());
        let matched = matcher.match_text("asthma and diabetes").await;

        assert_eq!(matched.matched_terms, vec!["diabetes"]);
        assert_eq!(matched.definition.inclusion_criteria.len(), 1);
    }

    #[tokio::test]
    async fn same_text_yields_equivalent_definition() {
        let matcher = RuleMatcher::new(resolver());
        let first = matcher.match_text("stroke after metformin").await;
        let second = matcher.match_text("stroke after metformin").await;

        assert_eq!(first.matched_terms, second.matched_terms);
        let ids = |m: &MatchedDefinition| {
            m.definition
                .inclusion_criteria
                .iter()
                .map(|n| (n.id.clone(), n.concept_ids.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&first), ids(&second));
    }

    #[tokio::test]
    async fn never_produces_exclusions() {
        let matcher = RuleMatcher::new(resolver());
        let matched = matcher
            .match_text("diabetes but exclude stroke patients")
            .await;

        // Both terms land as inclusions; the fallback path has no notion of
        // exclusion semantics.
        assert_eq!(matched.definition.exclusion_criteria.len(), 0);
        assert_eq!(matched.definition.inclusion_criteria.len(), 2);
    }
}
