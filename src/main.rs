//! msgbridge - Main Entry Point
//!
//! Loads the settings and the pipeline document, starts every pipeline and
//! runs until Ctrl-C.
//!
//! Usage: `msgbridge [path/to/msgbridge.toml]`

use anyhow::Context;
use msgbridge_rs::{
    config::{BridgeConfig, LoggingSettings, PipelinesDocument},
    context::AppContext,
    pipeline::PipelineRegistry,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How often the running pipelines' status is logged
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

fn init_logging(settings: &LoggingSettings) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));

    let (file_layer, guard) = match &settings.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "msgbridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let (json_layer, text_layer) = if settings.json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .init();

    guard
}

fn log_statuses(registry: &PipelineRegistry) {
    for status in registry.statuses() {
        tracing::info!(
            pipeline = %status.id,
            state = %status.state,
            received = status.inbound.count,
            sent = status.outbound.count,
            dropped = status.dropped,
            stage_errors = status.stage_errors,
            "status"
        );
        if let Some(error) = &status.last_error {
            tracing::warn!(pipeline = %status.id, "last error: {}", error);
        }
        if let Some(error) = &status.last_stage_error {
            tracing::debug!(pipeline = %status.id, "last stage error: {}", error);
        }
    }
}

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = BridgeConfig::load_or_default(config_path.as_deref());
    let _log_guard = init_logging(&config.logging);

    tracing::info!("Starting msgbridge");

    let pipelines_path = config.pipelines_path();
    let document = if pipelines_path.exists() {
        PipelinesDocument::load(&pipelines_path)
            .with_context(|| format!("loading {}", pipelines_path.display()))?
    } else {
        tracing::warn!(
            "No pipeline document at {}, nothing to run",
            pipelines_path.display()
        );
        PipelinesDocument::new()
    };

    let ctx = AppContext::shared(config.runtime.clone());
    let mut registry = PipelineRegistry::new(ctx);
    for (id, error) in registry.load(&document) {
        tracing::error!("Pipeline '{}' not registered: {}", id, error);
    }
    let failures = registry.start_all();
    tracing::info!(
        "{} pipeline(s) registered, {} failed to start",
        registry.len(),
        failures.len()
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;

    runtime.block_on(async {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut ticker = tokio::time::interval(STATUS_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                result = &mut ctrl_c => {
                    if let Err(e) = result {
                        tracing::error!("Failed to listen for Ctrl-C: {}", e);
                    }
                    tracing::info!("Received Ctrl-C, shutting down...");
                    break;
                }
                _ = ticker.tick() => log_statuses(&registry),
            }
        }
    });

    registry.terminate_all();
    log_statuses(&registry);
    tracing::info!("msgbridge stopped");
    Ok(())
}
