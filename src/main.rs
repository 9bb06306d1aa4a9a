use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

use raidx::evaluator::compliance::{default_ruleset, Ruleset};
use raidx::ingest::sample_transaction;
use raidx::stores::memory::EdgeRecord;
use raidx::stores::{
    Classifier, GraphStore, JsonlResultStore, LogisticModel, MemoryConfigStore, MemoryGraphStore,
    OfflineGraphStore, ResultStore, UnconfiguredModel,
};
use raidx::{load_config, Collaborators, Config, Orchestrator, TransactionRequest};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Score one transaction or a JSON array of transactions
    Score {
        /// Transaction request file; the built-in sample is used when omitted
        #[arg(long)]
        file: Option<PathBuf>,
        /// JSON array of {from, to, timestamp} edges backing the graph store
        #[arg(long)]
        graph: Option<PathBuf>,
        /// Compliance ruleset to serve from the config store
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Logistic model weights
        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// Look up a stored verdict
    Status {
        transaction_id: String,
    },
    /// Print the built-in compliance ruleset
    Rules,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    let config = load_config().context("loading configuration failed")?;

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level())
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Score { file, graph, rules, model }) => {
            score(&config, file, graph, rules, model).await?;
        }
        Some(Commands::Status { transaction_id }) => {
            let store = JsonlResultStore::open(&config.results_path)?;
            match store.get(&transaction_id).await? {
                Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                None => {
                    warn!(transaction_id = %transaction_id, path = %store.path().display(), "No verdict stored");
                }
            }
        }
        Some(Commands::Rules) => {
            println!("{}", serde_json::to_string_pretty(&default_ruleset())?);
        }
        None => {
            info!("No command specified. Use --help for available commands.");
        }
    }

    Ok(())
}

async fn score(
    config: &Config,
    file: Option<PathBuf>,
    graph: Option<PathBuf>,
    rules: Option<PathBuf>,
    model: Option<PathBuf>,
) -> Result<()> {
    info!("Starting RAID-X v{}", env!("CARGO_PKG_VERSION"));

    let requests = match file {
        Some(path) => read_requests(&path)?,
        None => vec![sample_transaction()],
    };

    let config_store = Arc::new(MemoryConfigStore::new());
    if let Some(path) = rules {
        let ruleset: Ruleset = read_json(&path)?;
        config_store.set_ruleset(&config.rule_namespace, ruleset).await;
    }

    let graph_store: Arc<dyn GraphStore> = match graph {
        Some(path) => {
            let edges: Vec<EdgeRecord> = read_json(&path)?;
            let store = MemoryGraphStore::from_edges(edges).await;
            info!(addresses = store.address_count().await, "Graph store loaded");
            Arc::new(store)
        }
        None => {
            warn!("No graph supplied, graph analysis will run on fallbacks");
            Arc::new(OfflineGraphStore)
        }
    };

    let classifier: Arc<dyn Classifier> = match model {
        Some(path) => Arc::new(
            LogisticModel::load(&path).with_context(|| format!("loading model {}", path.display()))?,
        ),
        None => Arc::new(UnconfiguredModel),
    };

    let result_store: Arc<dyn ResultStore> = Arc::new(JsonlResultStore::open(&config.results_path)?);

    let orchestrator = Orchestrator::new(
        config,
        Collaborators {
            config_store,
            graph_store,
            classifier,
            result_store,
        },
    )?;

    let mut run_ids = Vec::new();
    for request in requests {
        let id = request.id.clone();
        match orchestrator.submit_request(request).await {
            Ok(run_id) => run_ids.push(run_id),
            Err(e) => error!(transaction_id = %id, error = %e, "Transaction rejected"),
        }
    }

    let statuses = join_all(run_ids.iter().map(|run_id| orchestrator.wait(run_id))).await;
    let statuses: Vec<_> = statuses.into_iter().flatten().collect();
    println!("{}", serde_json::to_string_pretty(&statuses)?);

    let system = orchestrator.system_status();
    info!(runs = system.runs, by_state = ?system.runs_by_state, "Scoring finished");

    Ok(())
}

/// Accepts either a single request object or an array of them.
fn read_requests(path: &Path) -> Result<Vec<TransactionRequest>> {
    let value: serde_json::Value = read_json(path)?;
    let requests = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        other => vec![serde_json::from_value(other)?],
    };
    Ok(requests)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
