//! Result aggregation: executes compiled cohort SQL and derives counts,
//! samples, and demographic summaries from the matching patients.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use cohortd_compiler::{compile, compile_count, CompileError, CompilerConfig};
use cohortd_schema::CohortDefinition;

use crate::{escape_literal, value_to_f64, value_to_i64, QueryExecutionError, WarehouseExecutor};

/// Demographics are computed over at most this many patients.
const DEMOGRAPHICS_CAP: usize = 1000;
const SAMPLE_SIZE: usize = 10;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AggregateError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Warehouse(#[from] QueryExecutionError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenderCount {
    pub gender: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgeCount {
    pub age: i64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgeStats {
    pub mean: f64,
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Demographics {
    pub gender_distribution: Vec<GenderCount>,
    pub age_distribution: Vec<AgeCount>,
    pub age_stats: Option<AgeStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortResult {
    pub definition: CohortDefinition,
    pub patient_count: i64,
    pub execution_time_seconds: f64,
    pub demographics: Option<Demographics>,
    pub sample_patient_ids: Vec<i64>,
    pub sql_query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseSummary {
    pub total_patients: i64,
    pub unique_conditions: i64,
    pub unique_drugs: i64,
    pub unique_procedures: i64,
    pub total_visits: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedCohort {
    pub cohort_definition_id: i64,
    pub name: String,
    pub description: String,
    pub initiation_date: chrono::NaiveDate,
}

pub struct Aggregator {
    executor: Arc<dyn WarehouseExecutor>,
    compiler: CompilerConfig,
}

impl Aggregator {
    pub fn new(executor: Arc<dyn WarehouseExecutor>, compiler: CompilerConfig) -> Self {
        Self { executor, compiler }
    }

    /// Compile, execute, and summarize a cohort definition.
    pub async fn build_cohort(
        &self,
        definition: &CohortDefinition,
    ) -> Result<CohortResult, AggregateError> {
        let started = Instant::now();
        let sql = compile(definition, &self.compiler)?;

        let rows = self.executor.execute(&sql).await?;
        let person_ids: Vec<i64> = rows
            .iter()
            .filter_map(|row| row.values().next().and_then(value_to_i64))
            .collect();

        let demographics = if person_ids.is_empty() {
            None
        } else {
            let capped = &person_ids[..person_ids.len().min(DEMOGRAPHICS_CAP)];
            Some(self.demographics_summary(capped).await?)
        };

        info!(
            cohort = %definition.name,
            patients = person_ids.len(),
            "built cohort"
        );

        Ok(CohortResult {
            definition: definition.clone(),
            patient_count: person_ids.len() as i64,
            execution_time_seconds: started.elapsed().as_secs_f64(),
            demographics,
            sample_patient_ids: person_ids.iter().take(SAMPLE_SIZE).copied().collect(),
            sql_query: sql,
        })
    }

    /// Count-only execution of a definition, for interactive previews.
    pub async fn preview_count(
        &self,
        definition: &CohortDefinition,
    ) -> Result<i64, AggregateError> {
        let sql = compile_count(definition, &self.compiler)?;
        let value = self.executor.execute_scalar(&sql).await?;
        Ok(value.as_ref().and_then(value_to_i64).unwrap_or(0))
    }

    /// Count the rows an arbitrary SELECT would return. Used to re-execute
    /// service-generated SQL so reported counts reflect live data.
    pub async fn count_for_sql(&self, sql: &str) -> Result<i64, QueryExecutionError> {
        let inner = sql.trim().trim_end_matches(';');
        let count_sql = format!("SELECT COUNT(*) AS cnt FROM (\n{inner}\n) generated");
        let value = self.executor.execute_scalar(&count_sql).await?;
        Ok(value.as_ref().and_then(value_to_i64).unwrap_or(0))
    }

    pub async fn demographics_summary(
        &self,
        person_ids: &[i64],
    ) -> Result<Demographics, QueryExecutionError> {
        let ids = person_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        let gender_sql = format!(
            "SELECT c.concept_name AS gender, COUNT(*) AS count\n\
             FROM {person} p\n\
             JOIN {concept} c ON p.gender_concept_id = c.concept_id\n\
             WHERE p.person_id IN ({ids})\n\
             GROUP BY c.concept_name",
            person = self.compiler.table("person"),
            concept = self.compiler.table("concept"),
        );

        let age_sql = format!(
            "SELECT FLOOR(DATEDIFF(CURRENT_DATE(), CONCAT(year_of_birth, '-', \
             LPAD(COALESCE(month_of_birth, 1), 2, '0'), '-', \
             LPAD(COALESCE(day_of_birth, 1), 2, '0'))) / 365.25) AS age, COUNT(*) AS count\n\
             FROM {person}\n\
             WHERE person_id IN ({ids})\n\
             GROUP BY age\n\
             ORDER BY age",
            person = self.compiler.table("person"),
        );

        let gender_distribution = self
            .executor
            .execute(&gender_sql)
            .await?
            .iter()
            .filter_map(|row| {
                Some(GenderCount {
                    gender: row.get("gender")?.as_str()?.to_string(),
                    count: row.get("count").and_then(value_to_i64)?,
                })
            })
            .collect();

        let age_distribution: Vec<AgeCount> = self
            .executor
            .execute(&age_sql)
            .await?
            .iter()
            .filter_map(|row| {
                Some(AgeCount {
                    age: row.get("age").and_then(value_to_i64)?,
                    count: row.get("count").and_then(value_to_i64)?,
                })
            })
            .collect();

        Ok(Demographics {
            age_stats: age_stats(&age_distribution),
            gender_distribution,
            age_distribution,
        })
    }

    /// Row/patient counts across the core OMOP tables.
    pub async fn stats_summary(&self) -> Result<DatabaseSummary, QueryExecutionError> {
        let scalar = |sql: String| async move {
            let value = self.executor.execute_scalar(&sql).await?;
            Ok::<i64, QueryExecutionError>(value.as_ref().and_then(value_to_i64).unwrap_or(0))
        };

        Ok(DatabaseSummary {
            total_patients: scalar(format!(
                "SELECT COUNT(*) FROM {}",
                self.compiler.table("person")
            ))
            .await?,
            unique_conditions: scalar(format!(
                "SELECT COUNT(DISTINCT condition_concept_id) FROM {}",
                self.compiler.table("condition_occurrence")
            ))
            .await?,
            unique_drugs: scalar(format!(
                "SELECT COUNT(DISTINCT drug_concept_id) FROM {}",
                self.compiler.table("drug_exposure")
            ))
            .await?,
            unique_procedures: scalar(format!(
                "SELECT COUNT(DISTINCT procedure_concept_id) FROM {}",
                self.compiler.table("procedure_occurrence")
            ))
            .await?,
            total_visits: scalar(format!(
                "SELECT COUNT(*) FROM {}",
                self.compiler.table("visit_occurrence")
            ))
            .await?,
        })
    }

    /// Register a compiled cohort in the warehouse's cohort_definition
    /// table; returns the assigned id and initiation date.
    pub async fn save_cohort(
        &self,
        name: &str,
        description: &str,
        sql: &str,
    ) -> Result<SavedCohort, QueryExecutionError> {
        let table = self.compiler.table("cohort_definition");
        let next_id = self
            .executor
            .execute_scalar(&format!(
                "SELECT COALESCE(MAX(cohort_definition_id), 0) + 1 FROM {table}"
            ))
            .await?
            .as_ref()
            .and_then(value_to_i64)
            .unwrap_or(1);

        let initiation_date = chrono::Utc::now().date_naive();
        let insert = format!(
            "INSERT INTO {table} (cohort_definition_id, cohort_definition_name, \
             cohort_definition_description, cohort_definition_syntax, cohort_initiation_date) \
             VALUES ({next_id}, '{}', '{}', '{}', '{initiation_date}')",
            escape_literal(name),
            escape_literal(description),
            escape_literal(sql),
        );
        self.executor.execute(&insert).await?;

        Ok(SavedCohort {
            cohort_definition_id: next_id,
            name: name.to_string(),
            description: description.to_string(),
            initiation_date,
        })
    }
}

fn age_stats(distribution: &[AgeCount]) -> Option<AgeStats> {
    if distribution.is_empty() {
        return None;
    }
    let total: i64 = distribution.iter().map(|a| a.count).sum();
    if total == 0 {
        return None;
    }
    let weighted: i64 = distribution.iter().map(|a| a.age * a.count).sum();
    Some(AgeStats {
        mean: weighted as f64 / total as f64,
        min: distribution.iter().map(|a| a.age).min().unwrap_or(0),
        max: distribution.iter().map(|a| a.age).max().unwrap_or(0),
    })
}
