//! Cohort Query Compiler: turns a `CohortDefinition` into a single SQL
//! statement over the OMOP CDM schema.
//!
//! Every criteria node compiles to its own named CTE selecting matching
//! person ids; the final statement combines them with set algebra —
//! inclusion criteria are conjunctive (INTERSECT), exclusion criteria are
//! each subtracted independently (one EXCEPT per node). Pure function; the
//! compiler never talks to the warehouse.

use cohortd_schema::{CohortDefinition, CriteriaKind, CriteriaNode, ValidationError};

#[derive(Debug, Clone, Default)]
pub struct CompilerConfig {
    /// Fully qualified schema prefix, e.g. `hive_metastore.omop_cdm`.
    /// `None` emits unqualified table names.
    pub schema: Option<String>,
}

impl CompilerConfig {
    pub fn with_schema(schema: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
        }
    }

    /// Schema-qualified table name, or the bare name when no schema is set.
    pub fn table(&self, name: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{name}"),
            None => name.to_string(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum CompileError {
    #[error("invalid cohort definition: {0}")]
    Invalid(#[from] ValidationError),
}

/// Compile a cohort definition into one executable SELECT returning the
/// distinct matching person ids.
pub fn compile(def: &CohortDefinition, cfg: &CompilerConfig) -> Result<String, CompileError> {
    def.validate()?;

    let mut ctes = vec![format!(
        "base_population AS (\n  SELECT DISTINCT person_id\n  FROM {}\n)",
        cfg.table("person")
    )];

    let mut selects = vec!["SELECT person_id FROM base_population".to_string()];
    let mut counter = 0usize;

    for node in &def.inclusion_criteria {
        counter += 1;
        let name = format!("inclusion_{counter}");
        ctes.push(format!("{name} AS (\n{}\n)", node_subquery(node, cfg)));
        selects.push(format!("INTERSECT\nSELECT person_id FROM {name}"));
    }

    // Each exclusion is subtracted on its own; a patient matching any one
    // exclusion node is removed.
    for node in &def.exclusion_criteria {
        counter += 1;
        let name = format!("exclusion_{counter}");
        ctes.push(format!("{name} AS (\n{}\n)", node_subquery(node, cfg)));
        selects.push(format!("EXCEPT\nSELECT person_id FROM {name}"));
    }

    Ok(format!(
        "WITH {}\n{}",
        ctes.join(",\n"),
        selects.join("\n")
    ))
}

/// Compile to a single-row `COUNT(*)` statement for fast previews.
pub fn compile_count(def: &CohortDefinition, cfg: &CompilerConfig) -> Result<String, CompileError> {
    let sql = compile(def, cfg)?;
    Ok(format!("SELECT COUNT(*) AS cnt FROM (\n{sql}\n) cohort"))
}

/// The event table and its columns backing one criteria kind.
struct Backing {
    table: &'static str,
    concept_column: &'static str,
    date_column: Option<&'static str>,
}

fn backing(kind: CriteriaKind) -> Backing {
    match kind {
        CriteriaKind::Condition => Backing {
            table: "condition_occurrence",
            concept_column: "condition_concept_id",
            date_column: Some("condition_start_date"),
        },
        CriteriaKind::Drug => Backing {
            table: "drug_exposure",
            concept_column: "drug_concept_id",
            date_column: Some("drug_exposure_start_date"),
        },
        CriteriaKind::Procedure => Backing {
            table: "procedure_occurrence",
            concept_column: "procedure_concept_id",
            date_column: Some("procedure_date"),
        },
        CriteriaKind::Visit => Backing {
            table: "visit_occurrence",
            concept_column: "visit_concept_id",
            date_column: Some("visit_start_date"),
        },
        CriteriaKind::Observation => Backing {
            table: "observation",
            concept_column: "observation_concept_id",
            date_column: Some("observation_date"),
        },
        CriteriaKind::Gender => Backing {
            table: "person",
            concept_column: "gender_concept_id",
            date_column: None,
        },
        CriteriaKind::Age => Backing {
            table: "person",
            concept_column: "",
            date_column: None,
        },
    }
}

fn node_subquery(node: &CriteriaNode, cfg: &CompilerConfig) -> String {
    if node.kind == CriteriaKind::Age {
        return age_subquery(node, cfg);
    }

    let backing = backing(node.kind);
    let mut predicates = vec![concept_predicate(node, &backing, cfg)];

    if let (Some(range), Some(date_column)) = (&node.date_range, backing.date_column) {
        if let Some(start) = range.start {
            predicates.push(format!("{date_column} >= '{start}'"));
        }
        if let Some(end) = range.end {
            predicates.push(format!("{date_column} < '{end}'"));
        }
    }

    if node.kind == CriteriaKind::Observation {
        if let Some(range) = &node.value_range {
            if let Some(min) = range.min {
                predicates.push(format!("value_as_number >= {min}"));
            }
            if let Some(max) = range.max {
                predicates.push(format!("value_as_number <= {max}"));
            }
        }
    }

    let sql = format!(
        "  SELECT person_id\n  FROM {}\n  WHERE {}",
        cfg.table(backing.table),
        predicates.join("\n    AND ")
    );

    if node.min_occurrences > 1 && node.kind.is_count_filterable() {
        return format!(
            "  SELECT person_id\n  FROM (\n{sql}\n  ) events\n  GROUP BY person_id\n  HAVING COUNT(*) >= {}",
            node.min_occurrences
        );
    }

    sql
}

/// Concept matching expands to descendants through `concept_ancestor`, so a
/// node carrying an ancestor concept also matches events coded to any of
/// its children. Gender concepts are matched directly.
fn concept_predicate(node: &CriteriaNode, backing: &Backing, cfg: &CompilerConfig) -> String {
    let ids = node
        .concept_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    if node.kind == CriteriaKind::Gender {
        return format!("{} IN ({ids})", backing.concept_column);
    }

    format!(
        "{} IN (\n    SELECT descendant_concept_id\n    FROM {}\n    WHERE ancestor_concept_id IN ({ids})\n  )",
        backing.concept_column,
        cfg.table("concept_ancestor")
    )
}

/// Age at query time, derived from year/month/day of birth with missing
/// month/day defaulting to January 1st.
fn age_subquery(node: &CriteriaNode, cfg: &CompilerConfig) -> String {
    let age_expr = "FLOOR(DATEDIFF(CURRENT_DATE(), CONCAT(year_of_birth, '-', \
         LPAD(COALESCE(month_of_birth, 1), 2, '0'), '-', \
         LPAD(COALESCE(day_of_birth, 1), 2, '0'))) / 365.25)";

    let mut predicates = Vec::new();
    if let Some(range) = &node.value_range {
        if let Some(min) = range.min {
            predicates.push(format!("{age_expr} >= {min}"));
        }
        if let Some(max) = range.max {
            predicates.push(format!("{age_expr} <= {max}"));
        }
    }
    if predicates.is_empty() {
        // An unconstrained age node matches everyone.
        predicates.push("1 = 1".to_string());
    }

    format!(
        "  SELECT person_id\n  FROM {}\n  WHERE {}",
        cfg.table("person"),
        predicates.join("\n    AND ")
    )
}
