use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;

use cohortd_compiler::{compile, compile_count, CompilerConfig};
use cohortd_conversation::{InMemorySessionStore, Orchestrator, RuleMatcher};
use cohortd_nlq::{
    GenieClient, GenieConfig, QueryService, StubQueryService, TurnPolicy, TurnRunner,
};
use cohortd_schema::CohortDefinition;
use cohortd_server::AppState;
use cohortd_warehouse::{
    Aggregator, ConceptResolver, DatabricksConfig, DatabricksExecutor, WarehouseConceptResolver,
    WarehouseExecutor,
};
use config::Config;

#[derive(Parser)]
#[command(name = "cohortd", version, about = "OMOP cohort builder and conversational query backend")]
struct Cli {
    #[arg(
        long,
        default_value = "cohortd.yaml",
        help = "Path to the YAML config file"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Start the HTTP API server")]
    Serve {
        #[arg(long, help = "Override the configured port")]
        port: Option<u16>,
    },
    #[command(about = "Compile a cohort definition file to SQL and print it")]
    Compile {
        #[arg(help = "Cohort definition file (YAML or JSON)")]
        file: PathBuf,
        #[arg(long, help = "Emit the count-only preview statement")]
        count: bool,
    },
    #[command(about = "Ask a natural-language question about the patient population")]
    Ask {
        #[arg(help = "Question text")]
        text: String,
        #[arg(long, help = "Continue an existing conversation")]
        session: Option<String>,
    },
    #[command(about = "Validate the config file")]
    Validate,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_state(config: &Config) -> AppState {
    let compiler = CompilerConfig::with_schema(config.warehouse.full_schema());

    let executor: Arc<dyn WarehouseExecutor> =
        Arc::new(DatabricksExecutor::new(DatabricksConfig::new(
            &config.warehouse.host,
            &config.warehouse.token,
            &config.warehouse.warehouse_id,
        )));
    let aggregator = Arc::new(Aggregator::new(executor.clone(), compiler.clone()));
    let concepts = Arc::new(WarehouseConceptResolver::new(
        executor.clone(),
        compiler.clone(),
    ));

    let service: Arc<dyn QueryService> = match &config.genie {
        Some(genie) => Arc::new(GenieClient::new(GenieConfig::new(
            &config.warehouse.host,
            &config.warehouse.token,
            &genie.space_id,
        ))),
        None => {
            tracing::warn!("no genie space configured; conversational asks will use the keyword fallback");
            Arc::new(StubQueryService::unavailable())
        }
    };

    let resolver: Arc<dyn ConceptResolver> = concepts.clone();
    let orchestrator = Arc::new(Orchestrator::new(
        TurnRunner::new(service, TurnPolicy::default()),
        Arc::new(InMemorySessionStore::new()),
        aggregator.clone(),
        RuleMatcher::new(resolver),
        compiler.clone(),
    ));

    AppState {
        orchestrator,
        aggregator,
        concepts,
        compiler,
    }
}

fn load_definition(path: &PathBuf) -> Result<CohortDefinition> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading definition file {}", path.display()))?;
    let definition: CohortDefinition = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing definition file {}", path.display()))?;
    Ok(definition)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            let config = Config::load(&cli.config)?;
            let port = port.unwrap_or(config.server.port);
            let state = build_state(&config);
            cohortd_server::serve(state, port, &config.server.cors_origins).await
        }
        Commands::Compile { file, count } => {
            let config = Config::load(&cli.config)?;
            let compiler = CompilerConfig::with_schema(config.warehouse.full_schema());
            let definition = load_definition(&file)?;
            let sql = if count {
                compile_count(&definition, &compiler)?
            } else {
                compile(&definition, &compiler)?
            };
            println!("{sql}");
            Ok(())
        }
        Commands::Ask { text, session } => {
            let config = Config::load(&cli.config)?;
            let state = build_state(&config);
            let ask = state
                .orchestrator
                .ask(session.as_deref(), &text)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;

            println!("session: {}", ask.session.session_id);
            println!("{}", ask.answer.text);
            if let Some(sql) = &ask.answer.sql {
                println!("\nsql:\n{sql}");
            }
            if let Some(reason) = &ask.answer.degraded_reason {
                println!("\n(degraded: {reason})");
            }
            for question in &ask.answer.suggested_questions {
                println!("suggested: {question}");
            }
            Ok(())
        }
        Commands::Validate => {
            let config = Config::load(&cli.config)?;
            println!(
                "config ok: warehouse={} schema={} genie={}",
                config.warehouse.host,
                config.warehouse.full_schema(),
                config
                    .genie
                    .as_ref()
                    .map(|g| g.space_id.as_str())
                    .unwrap_or("(not configured)")
            );
            Ok(())
        }
    }
}
