use clap::Parser;
use spectre::cli::{Cli, Commands};
use spectre::config::Config;
use spectre::core::temporal::Timestamp;
use spectre::error::Result;
use spectre::export;
use spectre::pipeline::graph::Neo4jGraphClient;
use spectre::pipeline::SyncPipeline;
use spectre::rebuild::Rebuilder;
use spectre::service::Service;
use spectre::storage::store::SegmentStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => run_serve(&config).await,
        Commands::Rebuild { window_secs } => run_rebuild(&config, window_secs).await,
        Commands::Export { output, start_secs, end_secs } => run_export(&config, output, start_secs, end_secs),
        Commands::Import { input } => run_import(&config, input),
    }
}

async fn run_serve(config: &Config) -> Result<()> {
    tracing::info!(bind_addr = %config.grpc.bind_addr, "spectre starting");
    let (service, rebuild_report) = Service::bootstrap(config).await?;
    tracing::info!(
        ran = rebuild_report.ran,
        applied = rebuild_report.batches_applied,
        dropped = rebuild_report.batches_dropped,
        "startup rebuild finished"
    );

    tokio::signal::ctrl_c().await.map_err(spectre::error::Error::Io)?;
    tracing::info!("ctrl-c received, shutting down");
    service.shutdown().await;
    Ok(())
}

/// `spectre rebuild`: force a replay bypassing `RebuildIfEmptyOnly`, for
/// operators recovering a graph known to be stale or corrupted.
async fn run_rebuild(config: &Config, window_secs: Option<u64>) -> Result<()> {
    let graph = Arc::new(Neo4jGraphClient::connect(&config.graph.uri, &config.graph.user, &config.graph.password).await?);
    graph.init_schema().await?;

    let (store, _recovered) = SegmentStore::open(config.store_config())?;
    let pipeline = SyncPipeline::new(graph.clone(), config.pipeline_config());

    let mut rebuild_config = config.rebuild_config();
    rebuild_config.rebuild_on_start = true;
    rebuild_config.rebuild_if_empty_only = false;
    if let Some(secs) = window_secs {
        rebuild_config.window = std::time::Duration::from_secs(secs);
    }
    let rebuilder = Rebuilder::new(rebuild_config);

    let report = rebuilder.run(&store, &pipeline, graph.as_ref(), &CancellationToken::new()).await?;
    tracing::info!(applied = report.batches_applied, dropped = report.batches_dropped, "forced rebuild complete");
    Ok(())
}

fn run_export(config: &Config, output: std::path::PathBuf, start_secs: i64, end_secs: i64) -> Result<()> {
    let (store, _recovered) = SegmentStore::open(config.store_config())?;
    let report = export::export(&store, &output, Timestamp::from_secs(start_secs), Timestamp::from_secs(end_secs))?;
    tracing::info!(segments_written = report.segments_written, path = %output.display(), "export complete");
    Ok(())
}

fn run_import(config: &Config, input: std::path::PathBuf) -> Result<()> {
    let (store, _recovered) = SegmentStore::open(config.store_config())?;
    let report = export::import(&store, &input)?;
    tracing::info!(
        examined = report.segments_examined,
        imported = report.events_imported,
        deduplicated = report.events_deduplicated,
        "import complete"
    );
    Ok(())
}
