//! YAML configuration for the cohortd binary.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub warehouse: WarehouseSettings,
    /// Absent when no AI query service is provisioned; every
    /// conversational ask then takes the keyword fallback path.
    #[serde(default)]
    pub genie: Option<GenieSettings>,
    #[serde(default)]
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WarehouseSettings {
    pub host: String,
    pub token: String,
    pub warehouse_id: String,
    #[serde(default = "default_catalog")]
    pub catalog: String,
    #[serde(default = "default_schema")]
    pub schema: String,
}

impl WarehouseSettings {
    pub fn full_schema(&self) -> String {
        format!("{}.{}", self.catalog, self.schema)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenieSettings {
    pub space_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_catalog() -> String {
    "hive_metastore".to_string()
}

fn default_schema() -> String {
    "omop_cdm".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }
}
