//! Command-line interface for finagent
//!
//! Runs an analysis request through the coordination engine using the
//! offline demo agents.
//!
//! # Usage
//!
//! ```bash
//! # Full pipeline for two tickers
//! cargo run -p finagent-cli -- --ticker AAPL --ticker MSFT
//!
//! # Only technical analysis (ingestion is added automatically)
//! cargo run -p finagent-cli -- --ticker TSLA --task technical
//!
//! # Free-text query, JSON output
//! cargo run -p finagent-cli -- --query "Should I buy NVDA given its valuation?" --json
//! ```

mod demo;

use anyhow::{Context as _, bail};
use clap::Parser;
use finagent_core::Capability;
use finagent_orchestrator::{AnalysisRequest, CoordinationEngine, OrchestratorConfig};
use finagent_utils::{Settings, init_tracing_with};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "finagent")]
#[command(about = "Multi-agent financial analysis", long_about = None)]
struct Args {
    /// Ticker symbol to analyze (repeatable)
    #[arg(short, long = "ticker")]
    tickers: Vec<String>,

    /// Capability to run instead of the full pipeline (repeatable)
    #[arg(long = "task")]
    tasks: Vec<Capability>,

    /// Free-text query; tickers and tasks are inferred from it
    #[arg(short, long, conflicts_with_all = ["tickers", "tasks"])]
    query: Option<String>,

    /// Request deadline in seconds
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Orchestrator config file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the response as JSON
    #[arg(long)]
    json: bool,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<OrchestratorConfig> {
    let config = match path {
        Some(path) => OrchestratorConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => OrchestratorConfig::load_merged()?,
    };
    Ok(config.with_env_overrides()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let settings = Settings::default()
        .with_log_level(args.log_level.clone())
        .with_env_overrides();
    init_tracing_with(&settings)?;

    let config = load_config(args.config.as_ref())?;
    let registry = Arc::new(demo::registry(&config)?);
    let engine = CoordinationEngine::new(registry, config);

    let mut request = match &args.query {
        Some(query) => engine.router().request_from_query(query)?,
        None if args.tickers.is_empty() => bail!("Provide at least one --ticker or a --query"),
        None if args.tasks.is_empty() => AnalysisRequest::full_pipeline(args.tickers.clone()),
        None => AnalysisRequest::for_kinds(args.tasks.clone(), args.tickers.clone()),
    };
    if let Some(secs) = args.deadline_secs {
        request = request.with_deadline(Duration::from_secs(secs));
    }

    info!(request_id = %request.id, "Starting finagent");
    let response = engine.run(request).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print!("{}", response.format_summary());
    }

    if let Some(failure) = &response.failure {
        bail!(failure.to_error());
    }
    Ok(())
}
