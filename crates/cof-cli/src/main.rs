use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cof_engine::{EngineConfig, FeedEngine};
use cof_providers::{
    load_provider_registry, FallbackProvider, FixtureProvider, HeuristicProfileModel,
    KeywordOverlapScorer, OpportunityProvider,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cof-cli")]
#[command(about = "Clustered Opportunity Feed command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the feed API plus the periodic sweep scheduler.
    Serve,
    /// Run one maintenance sweep and exit.
    Sweep,
    /// Force a synchronous fetch-and-merge for a user's cluster.
    Refresh { user: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let engine = build_engine()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            if let Some(mut sched) = engine.maybe_build_scheduler().await? {
                sched.start().await.context("starting sweep scheduler")?;
            }
            cof_web::serve_from_env(engine).await?;
        }
        Commands::Sweep => {
            let report = engine.sweep().await;
            println!(
                "sweep complete: deactivated={} removed={} history_purged={} clusters_refreshed={}",
                report.pool.deactivated,
                report.pool.removed,
                report.history_purged,
                report.clusters_refreshed
            );
        }
        Commands::Refresh { user } => {
            let summary = engine.refresh_now(&user).await?;
            println!(
                "refresh complete: fetched={} cached={} duplicates={} duration_ms={}",
                summary.fetched, summary.cached, summary.duplicates, summary.duration_ms
            );
        }
    }

    Ok(())
}

/// Wire the engine from the environment: a registry-backed provider chain
/// when `COF_PROVIDERS_FILE` is set, otherwise fixture data for local runs.
fn build_engine() -> Result<Arc<FeedEngine>> {
    let config = EngineConfig::from_env();
    let provider: Arc<dyn OpportunityProvider> = if let Ok(path) =
        std::env::var("COF_PROVIDERS_FILE")
    {
        let registry = load_provider_registry(&path)
            .with_context(|| format!("loading provider registry {path}"))?;
        Arc::new(FallbackProvider::from_registry(
            &registry,
            Duration::from_secs(10),
            Duration::from_secs(25),
        )?)
    } else if let Ok(path) = std::env::var("COF_FIXTURE_FILE") {
        Arc::new(
            FixtureProvider::from_json_file("fixtures", &path)
                .with_context(|| format!("loading fixture file {path}"))?,
        )
    } else {
        Arc::new(FixtureProvider::new("fixtures", Vec::new()))
    };

    Ok(FeedEngine::new(
        config,
        provider,
        Arc::new(KeywordOverlapScorer),
        Arc::new(HeuristicProfileModel::default()),
    ))
}
