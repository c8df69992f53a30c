mod error;
mod http_api;
mod logging;
mod metrics;
mod runner;
mod schedule;
mod selector;
mod service;
mod settings;
mod speedtest;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use metrics::MetricsStore;
use schedule::{Schedule, Scheduler};
use service::{ClientFactory, ExporterService};
use settings::Settings;
use speedtest::{HttpSpeedtestClient, SpeedtestClient};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::parse();

    let level = logging::parse_level(&settings.log_level)?;
    logging::init_logging(level, settings.log_format)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Start speedtest-exporter");
    match serde_json::to_string(&settings) {
        Ok(config) => info!(%config, "Loaded configuration"),
        Err(e) => warn!(error = %e, "Failed to serialize configuration"),
    }

    let schedule = Schedule::parse(&settings.schedule).context("Invalid schedule")?;
    info!(%schedule, run_on_start = settings.run_on_start, "Schedule configured");

    let store = Arc::new(MetricsStore::new()?);

    let ping_count = settings.ping_count;
    let connect: ClientFactory = Arc::new(move || {
        let client: Box<dyn SpeedtestClient> = Box::new(HttpSpeedtestClient::new(ping_count)?);
        anyhow::Ok(client)
    });
    let service = Arc::new(ExporterService::new(&settings, store.clone(), connect));
    let scheduler = Scheduler::new(schedule).start(service, settings.run_on_start);

    let served = http_api::serve(settings.metrics_port, store, shutdown_signal()).await;
    scheduler.abort();
    served.context("Metrics server failed")?;

    info!("Stopped speedtest-exporter");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
