use anyhow::Context;
use futures::future::try_join_all;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ExporterError, Result};
use crate::speedtest::{
    Candidate, MeasurementResult, SpeedtestClient, Target, TestPhase, TransferContext,
};

/// Drives the latency probe and the download and upload phases for a target.
pub struct MeasurementRunner {
    sample_window: Duration,
}

impl MeasurementRunner {
    pub fn new(sample_window: Duration) -> Self {
        Self { sample_window }
    }

    /// Measures `target` with `parallelism` workers per phase. Workers are
    /// spread round-robin over the target followed by `peers`.
    ///
    /// The target's transfer context is cleared when each phase ends, also
    /// when the phase fails or the returned future is dropped.
    pub async fn run<C>(
        &self,
        client: &C,
        target: &mut Target,
        peers: &[Candidate],
        parallelism: usize,
    ) -> Result<MeasurementResult>
    where
        C: SpeedtestClient + ?Sized,
    {
        let mut servers = vec![&target.server];
        servers.extend(peers.iter().filter(|p| p.id != target.server.id));
        let parallelism = parallelism.max(1);

        target.latency = client
            .latency(&target.server)
            .await
            .map_err(|e| ExporterError::measurement(TestPhase::Download, &target.server.id, e))?;
        debug!(
            server = %target.server.id,
            latency_us = target.latency.as_micros() as u64,
            "Latency probe done"
        );

        debug!(server = %target.server.id, parallelism, "Start download test");
        target.dl_speed_mbps = self
            .phase(client, TestPhase::Download, &target.context, &servers, parallelism)
            .await
            .map_err(|e| ExporterError::measurement(TestPhase::Download, &target.server.id, e))?;
        debug!(server = %target.server.id, mbps = target.dl_speed_mbps, "Download test is done");

        debug!(server = %target.server.id, parallelism, "Start upload test");
        target.ul_speed_mbps = self
            .phase(client, TestPhase::Upload, &target.context, &servers, parallelism)
            .await
            .map_err(|e| ExporterError::measurement(TestPhase::Upload, &target.server.id, e))?;
        debug!(server = %target.server.id, mbps = target.ul_speed_mbps, "Upload test is done");

        Ok(target.result())
    }

    async fn phase<C>(
        &self,
        client: &C,
        phase: TestPhase,
        context: &TransferContext,
        servers: &[&Candidate],
        parallelism: usize,
    ) -> anyhow::Result<f64>
    where
        C: SpeedtestClient + ?Sized,
    {
        let scope = context.scope();
        let start = Instant::now();
        let deadline = start + self.sample_window;

        let workers = (0..parallelism).map(|i| {
            let server = servers[i % servers.len()];
            let context = scope.context();
            async move {
                let transfer = match phase {
                    TestPhase::Upload => client.upload_worker(server, context, deadline).await,
                    _ => client.download_worker(server, context, deadline).await,
                };
                transfer.with_context(|| format!("{phase} worker {i} against server {}", server.id))
            }
        });
        try_join_all(workers).await?;

        let elapsed = start.elapsed();
        let mbps = client.throughput_mbps(phase, scope.context(), elapsed);
        debug!(
            %phase,
            bytes = scope.context().bytes(),
            elapsed_ms = elapsed.as_millis() as u64,
            mbps,
            "Phase finished"
        );
        Ok(mbps)
    }
}
