//! Prometheus gauges holding the latest speedtest result.
//!
//! The store owns its registry. The measurement cycle publishes a whole
//! result at once through [`MetricsStore::set_all`]; scrapes read through
//! [`MetricsStore::snapshot`] or [`MetricsStore::render`]. A single lock covers
//! both sides so a scrape never mixes values from two cycles. Writers only
//! hold it for a handful of atomic stores.

use anyhow::Result;
use parking_lot::RwLock;
use prometheus::{Encoder, Gauge, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ExporterError;
use crate::speedtest::MeasurementResult;

const NAMESPACE: &str = "speedtest";

/// Values visible on the scrape endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GaugePair {
    pub download_mbps: f64,
    pub upload_mbps: f64,
}

pub struct MetricsStore {
    registry: Registry,
    download_mbps: Gauge,
    upload_mbps: Gauge,
    latency_seconds: Gauge,
    last_success_timestamp: Gauge,
    runs_total: IntCounterVec,
    publish: RwLock<()>,
}

impl MetricsStore {
    /// Creates the gauges and registers them. Fails on duplicate or invalid
    /// metric names.
    pub fn new() -> std::result::Result<Self, ExporterError> {
        let registry = Registry::new();

        let download_mbps = Gauge::with_opts(
            Opts::new("download_speed_mbps", "Download speed of the last successful test in Mbps")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(download_mbps.clone()))?;

        let upload_mbps = Gauge::with_opts(
            Opts::new("upload_speed_mbps", "Upload speed of the last successful test in Mbps")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(upload_mbps.clone()))?;

        let latency_seconds = Gauge::with_opts(
            Opts::new("latency_seconds", "Latency of the last successful test in seconds")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(latency_seconds.clone()))?;

        let last_success_timestamp = Gauge::with_opts(
            Opts::new(
                "last_success_timestamp_seconds",
                "Unix timestamp of the last successful test",
            )
            .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(last_success_timestamp.clone()))?;

        let runs_total = IntCounterVec::new(
            Opts::new("runs_total", "Speedtest cycles by outcome").namespace(NAMESPACE),
            &["outcome"],
        )?;
        registry.register(Box::new(runs_total.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))?;

        Ok(Self {
            registry,
            download_mbps,
            upload_mbps,
            latency_seconds,
            last_success_timestamp,
            runs_total,
            publish: RwLock::new(()),
        })
    }

    /// Replaces every result gauge with the values of `result`.
    pub fn set_all(&self, result: &MeasurementResult) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        let _guard = self.publish.write();
        self.download_mbps.set(result.download_mbps);
        self.upload_mbps.set(result.upload_mbps);
        self.latency_seconds.set(result.latency.as_secs_f64());
        self.last_success_timestamp.set(now);
    }

    pub fn snapshot(&self) -> GaugePair {
        let _guard = self.publish.read();
        GaugePair {
            download_mbps: self.download_mbps.get(),
            upload_mbps: self.upload_mbps.get(),
        }
    }

    pub fn record_run(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.runs_total.with_label_values(&[outcome]).inc();
    }

    /// Encodes every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let families = {
            let _guard = self.publish.read();
            self.registry.gather()
        };

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn result(download_mbps: f64, upload_mbps: f64) -> MeasurementResult {
        MeasurementResult {
            latency: Duration::from_millis(20),
            download_mbps,
            upload_mbps,
        }
    }

    #[test]
    fn starts_at_zero() {
        let store = MetricsStore::new().unwrap();
        assert_eq!(store.snapshot(), GaugePair::default());

        let text = store.render().unwrap();
        assert!(text.contains("speedtest_download_speed_mbps 0"));
        assert!(text.contains("speedtest_upload_speed_mbps 0"));
    }

    #[test]
    fn set_all_replaces_pair() {
        let store = MetricsStore::new().unwrap();
        store.set_all(&result(450.0, 30.0));
        store.set_all(&result(120.5, 12.25));

        assert_eq!(
            store.snapshot(),
            GaugePair {
                download_mbps: 120.5,
                upload_mbps: 12.25,
            }
        );

        let text = store.render().unwrap();
        assert!(text.contains("speedtest_download_speed_mbps 120.5"));
        assert!(text.contains("speedtest_upload_speed_mbps 12.25"));
        assert!(text.contains("speedtest_latency_seconds 0.02"));
        assert!(!text.contains("speedtest_last_success_timestamp_seconds 0\n"));
    }

    #[test]
    fn counts_runs_by_outcome() {
        let store = MetricsStore::new().unwrap();
        store.record_run(true);
        store.record_run(false);
        store.record_run(false);

        let text = store.render().unwrap();
        assert!(text.contains(r#"speedtest_runs_total{outcome="success"} 1"#));
        assert!(text.contains(r#"speedtest_runs_total{outcome="failure"} 2"#));
    }

    #[test]
    fn stores_are_independent() {
        let a = MetricsStore::new().unwrap();
        let b = MetricsStore::new().unwrap();
        a.set_all(&result(1.0, 2.0));
        assert_eq!(b.snapshot(), GaugePair::default());
    }

    #[test]
    fn concurrent_snapshots_never_tear() {
        let store = Arc::new(MetricsStore::new().unwrap());
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        let pair = store.snapshot();
                        // every published pair has upload == download / 10
                        assert_eq!(pair.upload_mbps * 10.0, pair.download_mbps);
                    }
                })
            })
            .collect();

        for i in 0..20_000 {
            let download = (i % 997) as f64 * 10.0;
            store.set_all(&result(download, download / 10.0));
        }
        done.store(true, Ordering::Relaxed);

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
