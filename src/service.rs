//! One measurement cycle: discovery, selection, measurement and publication.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Level};

use crate::error::{ExporterError, Result};
use crate::metrics::MetricsStore;
use crate::runner::MeasurementRunner;
use crate::schedule::Job;
use crate::selector::{self, SelectionMode, ServerSelector};
use crate::settings::Settings;
use crate::speedtest::{MeasurementResult, SpeedtestClient, Target};

/// Builds a fresh client for every cycle so no connection state outlives it.
pub type ClientFactory = Arc<dyn Fn() -> anyhow::Result<Box<dyn SpeedtestClient>> + Send + Sync>;

pub struct ExporterService {
    store: Arc<MetricsStore>,
    selector: ServerSelector,
    runner: MeasurementRunner,
    connect: ClientFactory,
    parallelism: usize,
    multi_server: bool,
    cycle_timeout: Option<Duration>,
}

impl ExporterService {
    pub fn new(settings: &Settings, store: Arc<MetricsStore>, connect: ClientFactory) -> Self {
        Self {
            store,
            selector: ServerSelector::new(settings.server_mode),
            runner: MeasurementRunner::new(settings.sample_window()),
            connect,
            parallelism: settings.threads,
            multi_server: settings.multi_server,
            cycle_timeout: settings.cycle_timeout(),
        }
    }

    /// Runs one cycle. Gauges change only when a target was fully measured;
    /// on error they keep their previous values.
    pub async fn run_cycle(&self) -> Result<()> {
        match self.cycle_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.cycle())
                .await
                .map_err(|_| ExporterError::CycleTimeout { timeout })?,
            None => self.cycle().await,
        }
    }

    async fn cycle(&self) -> Result<()> {
        let client = (self.connect)().map_err(ExporterError::discovery)?;

        let user = client
            .fetch_user_info()
            .await
            .map_err(ExporterError::discovery)?;
        debug!(ip = ?user.ip, isp = ?user.isp, city = ?user.city, "Fetch userInfo done");

        let candidates = client
            .fetch_servers()
            .await
            .map_err(ExporterError::discovery)?;
        debug!(
            servers = candidates.len(),
            reachable = candidates.iter().filter(|c| c.is_reachable()).count(),
            "Fetch servers done"
        );

        let targets = self.selector.select(&candidates)?.into_targets();
        let peers = match (self.selector.mode(), self.multi_server) {
            (SelectionMode::SingleBest, true) => selector::reachable(&candidates),
            _ => Vec::new(),
        };

        info!(targets = targets.len(), parallelism = self.parallelism, "Speedtest started");

        let mut published = 0;
        let mut last_error = None;
        for mut target in targets {
            debug!(server = %target.server, distance_km = target.server.distance_km, "Target server is decided");

            match self
                .runner
                .run(client.as_ref(), &mut target, &peers, self.parallelism)
                .await
            {
                Ok(result) => {
                    self.store.set_all(&result);
                    published += 1;
                    log_result(&target, &result);
                }
                Err(e) => {
                    warn!(server = %target.server.id, error = %e, "Speedtest against server failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if published == 0 => Err(e),
            _ => Ok(()),
        }
    }
}

fn log_result(target: &Target, result: &MeasurementResult) {
    if tracing::enabled!(Level::DEBUG) {
        info!(
            server = %target.server.id,
            latency_us = result.latency.as_micros() as u64,
            download = result.download_mbps,
            upload = result.upload_mbps,
            "Speedtest is done"
        );
    } else {
        info!(
            server = %target.server.id,
            latency_ms = result.latency.as_millis() as u64,
            download = result.download_mbps,
            upload = result.upload_mbps,
            "Speedtest is done"
        );
    }
}

#[async_trait]
impl Job for ExporterService {
    async fn run(&self) -> Result<()> {
        let outcome = self.run_cycle().await;
        self.store.record_run(outcome.is_ok());
        outcome
    }
}
