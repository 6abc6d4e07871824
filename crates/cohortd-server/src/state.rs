use std::sync::Arc;

use cohortd_compiler::CompilerConfig;
use cohortd_conversation::Orchestrator;
use cohortd_warehouse::{Aggregator, WarehouseConceptResolver};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub aggregator: Arc<Aggregator>,
    pub concepts: Arc<WarehouseConceptResolver>,
    pub compiler: CompilerConfig,
}
