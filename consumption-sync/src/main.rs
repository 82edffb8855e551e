use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use consumption_sync::{
    cli::Cli,
    config::AppConfig,
    metrics_export, observability,
    pipeline::{RunReport, SyncPipeline},
    sinks::{questdb, QuestDbIlpSink, QuestDbWatermarkStore},
    sources::OctopusSource,
    SyncError,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    observability::init_tracing(cli.debug);

    // Load configuration; flags and environment override the file.
    let mut cfg = AppConfig::load(cli.config.as_deref())?;
    cfg.apply_cli(&cli);

    if cfg.metrics.is_some() {
        metrics_export::init()?;
    }

    let result = run(&cfg).await;

    if let Some(metrics_cfg) = &cfg.metrics {
        if let Err(e) = metrics_export::write_textfile(&metrics_cfg.textfile_path) {
            tracing::warn!(error = %e, "failed to export metrics");
        }
    }

    match result {
        Ok(report) => {
            for stream in &report.streams {
                tracing::info!(
                    fuel_type = %stream.fuel,
                    since = %stream.watermark,
                    fetched = stream.fetched,
                    written = stream.committed,
                    "stream synchronized"
                );
            }
            tracing::info!(elapsed = ?report.elapsed, dry_run = report.dry_run, "Done");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "sync run failed");
            Err(e.into())
        }
    }
}

async fn run(cfg: &AppConfig) -> Result<RunReport, SyncError> {
    let settings = cfg.run_settings()?;

    tracing::debug!("Creating QuestDB client");
    let pool = questdb::connect(&cfg.questdb).await?;

    let sink = QuestDbIlpSink::new(
        cfg.ilp_addr()?,
        cfg.questdb.table.clone(),
        Duration::from_millis(cfg.questdb.write_timeout_ms),
    );
    if !settings.dry_run {
        sink.check_connection().await?;
    }
    let sink = Arc::new(sink);

    tracing::debug!("Creating octopus client");
    let source = OctopusSource::new(&cfg.octopus)?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling run");
            on_signal.cancel();
        }
    });

    let pipeline = SyncPipeline {
        watermarks: Arc::new(QuestDbWatermarkStore::new(pool.clone(), &cfg.questdb)),
        source: Arc::new(source),
        sink: sink.clone(),
        settings,
    };

    let result = pipeline.run(shutdown).await;

    sink.close().await;
    pool.close().await;

    result
}
