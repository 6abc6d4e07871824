//! Concept resolution against the OMOP vocabulary tables.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cohortd_compiler::CompilerConfig;
use cohortd_schema::{Concept, ConceptRef};

use crate::{escape_literal, value_to_i64, QueryExecutionError, Row, WarehouseExecutor};

const MAX_SEARCH_LIMIT: usize = 100;
const DEFAULT_SEARCH_LIMIT: usize = 20;

/// Maps free text to standardized vocabulary concepts. Consumed by the
/// fallback rule matcher and the criteria-building API.
#[async_trait]
pub trait ConceptResolver: Send + Sync {
    async fn search(
        &self,
        query: &str,
        domain_hint: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ConceptRef>, QueryExecutionError>;

    async fn concept_by_id(&self, concept_id: i64)
        -> Result<Option<Concept>, QueryExecutionError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConceptSearchRequest {
    pub query: String,
    #[serde(default)]
    pub domain_id: Option<String>,
    #[serde(default)]
    pub vocabulary_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub struct WarehouseConceptResolver {
    executor: Arc<dyn WarehouseExecutor>,
    compiler: CompilerConfig,
}

impl WarehouseConceptResolver {
    pub fn new(executor: Arc<dyn WarehouseExecutor>, compiler: CompilerConfig) -> Self {
        Self { executor, compiler }
    }

    /// Name-prefix concept search with optional domain/vocabulary filters.
    /// Invalidated concepts are excluded.
    pub async fn search_concepts(
        &self,
        request: &ConceptSearchRequest,
    ) -> Result<Vec<Concept>, QueryExecutionError> {
        let limit = request
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT);

        let mut sql = format!(
            "SELECT concept_id, concept_name, domain_id, vocabulary_id, \
             concept_class_id, standard_concept, concept_code\n\
             FROM {}\n\
             WHERE LOWER(concept_name) LIKE LOWER('{}%')",
            self.compiler.table("concept"),
            escape_literal(&request.query),
        );
        if let Some(domain) = &request.domain_id {
            sql.push_str(&format!("\n  AND domain_id = '{}'", escape_literal(domain)));
        }
        if let Some(vocabulary) = &request.vocabulary_id {
            sql.push_str(&format!(
                "\n  AND vocabulary_id = '{}'",
                escape_literal(vocabulary)
            ));
        }
        sql.push_str("\n  AND invalid_reason IS NULL");
        sql.push_str(&format!("\nORDER BY concept_name\nLIMIT {limit}"));

        let rows = self.executor.execute(&sql).await?;
        Ok(rows.iter().filter_map(concept_from_row).collect())
    }
}

#[async_trait]
impl ConceptResolver for WarehouseConceptResolver {
    async fn search(
        &self,
        query: &str,
        domain_hint: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ConceptRef>, QueryExecutionError> {
        let request = ConceptSearchRequest {
            query: query.to_string(),
            domain_id: domain_hint.map(str::to_string),
            vocabulary_id: None,
            limit: Some(limit),
        };
        let concepts = self.search_concepts(&request).await?;
        Ok(concepts
            .into_iter()
            .map(|c| ConceptRef {
                concept_id: c.concept_id,
                concept_name: c.concept_name,
                domain_id: c.domain_id,
            })
            .collect())
    }

    async fn concept_by_id(
        &self,
        concept_id: i64,
    ) -> Result<Option<Concept>, QueryExecutionError> {
        let sql = format!(
            "SELECT concept_id, concept_name, domain_id, vocabulary_id, \
             concept_class_id, standard_concept, concept_code\n\
             FROM {}\n\
             WHERE concept_id = {concept_id}",
            self.compiler.table("concept"),
        );
        let rows = self.executor.execute(&sql).await?;
        Ok(rows.first().and_then(concept_from_row))
    }
}

fn concept_from_row(row: &Row) -> Option<Concept> {
    Some(Concept {
        concept_id: row.get("concept_id").and_then(value_to_i64)?,
        concept_name: row.get("concept_name")?.as_str()?.to_string(),
        domain_id: row.get("domain_id")?.as_str()?.to_string(),
        vocabulary_id: row.get("vocabulary_id")?.as_str()?.to_string(),
        concept_class_id: row.get("concept_class_id")?.as_str()?.to_string(),
        standard_concept: row
            .get("standard_concept")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        concept_code: row.get("concept_code")?.as_str()?.to_string(),
    })
}

/// Fixed-table resolver keyed by lowercased term. Used in tests and by the
/// fallback path when no warehouse is configured.
#[derive(Default)]
pub struct StaticConceptResolver {
    entries: HashMap<String, Vec<ConceptRef>>,
}

impl StaticConceptResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, term: &str, refs: Vec<ConceptRef>) -> Self {
        self.entries.insert(term.to_lowercase(), refs);
        self
    }
}

#[async_trait]
impl ConceptResolver for StaticConceptResolver {
    async fn search(
        &self,
        query: &str,
        _domain_hint: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ConceptRef>, QueryExecutionError> {
        let mut refs = self
            .entries
            .get(&query.to_lowercase())
            .cloned()
            .unwrap_or_default();
        refs.truncate(limit);
        Ok(refs)
    }

    async fn concept_by_id(
        &self,
        concept_id: i64,
    ) -> Result<Option<Concept>, QueryExecutionError> {
        let found = self
            .entries
            .values()
            .flatten()
            .find(|r| r.concept_id == concept_id)
            .map(|r| Concept {
                concept_id: r.concept_id,
                concept_name: r.concept_name.clone(),
                domain_id: r.domain_id.clone(),
                vocabulary_id: "SNOMED".to_string(),
                concept_class_id: "Clinical Finding".to_string(),
                standard_concept: Some("S".to_string()),
                concept_code: r.concept_id.to_string(),
            });
        Ok(found)
    }
}
