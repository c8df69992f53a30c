pub mod client;
pub mod download;
pub mod ping;
pub mod upload;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub use client::HttpSpeedtestClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPhase {
    Discovery,
    Download,
    Upload,
}

impl TestPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            TestPhase::Discovery => "discovery",
            TestPhase::Download => "download",
            TestPhase::Upload => "upload",
        }
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public identity of the measuring host as seen by the service.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserInfo {
    pub ip: Option<String>,
    pub isp: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

/// A discovered speedtest server.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub id: String,
    pub name: String,
    pub sponsor: String,
    pub country: String,
    pub host: String,
    /// Upload endpoint; the other test resources live next to it.
    pub url: String,
    pub distance_km: f64,
    /// Discovery probe round trip, `None` when the server did not answer.
    pub latency: Option<Duration>,
}

impl Candidate {
    pub fn is_reachable(&self) -> bool {
        self.latency.is_some()
    }

    pub fn base_url(&self) -> &str {
        match self.url.rfind('/') {
            Some(idx) if idx > "https://".len() => &self.url[..idx],
            _ => self.url.trim_end_matches('/'),
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.id, self.sponsor, self.name)
    }
}

/// Byte counter shared by every worker of one phase.
#[derive(Debug, Default)]
pub struct TransferContext {
    bytes: AtomicU64,
}

impl TransferContext {
    pub fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.bytes.store(0, Ordering::Relaxed);
    }

    pub fn mbps(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.bytes() as f64 * 8.0) / secs / 1_000_000.0
    }

    /// Starts a phase on this context. The returned scope clears the counter
    /// when dropped, whatever way the phase ends.
    pub fn scope(&self) -> TransferScope<'_> {
        self.reset();
        TransferScope { context: self }
    }
}

pub struct TransferScope<'a> {
    context: &'a TransferContext,
}

impl TransferScope<'_> {
    pub fn context(&self) -> &TransferContext {
        self.context
    }
}

impl Drop for TransferScope<'_> {
    fn drop(&mut self) {
        self.context.reset();
    }
}

/// A candidate chosen for measurement, together with its per-run state.
#[derive(Debug)]
pub struct Target {
    pub server: Candidate,
    pub latency: Duration,
    pub dl_speed_mbps: f64,
    pub ul_speed_mbps: f64,
    pub context: TransferContext,
}

impl Target {
    pub fn new(server: Candidate) -> Self {
        Self {
            server,
            latency: Duration::ZERO,
            dl_speed_mbps: 0.0,
            ul_speed_mbps: 0.0,
            context: TransferContext::default(),
        }
    }

    pub fn result(&self) -> MeasurementResult {
        MeasurementResult {
            latency: self.latency,
            download_mbps: self.dl_speed_mbps,
            upload_mbps: self.ul_speed_mbps,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementResult {
    pub latency: Duration,
    pub download_mbps: f64,
    pub upload_mbps: f64,
}

/// Operations the exporter needs from a speedtest backend.
///
/// Workers only move bytes into the [`TransferContext`]; the rate for a phase
/// is asked for once, after every worker has returned.
#[async_trait]
pub trait SpeedtestClient: Send + Sync {
    async fn fetch_user_info(&self) -> Result<UserInfo>;

    /// Candidate servers, closest first. Unreachable servers are included
    /// with `latency: None`.
    async fn fetch_servers(&self) -> Result<Vec<Candidate>>;

    async fn latency(&self, server: &Candidate) -> Result<Duration>;

    async fn download_worker(
        &self,
        server: &Candidate,
        context: &TransferContext,
        deadline: Instant,
    ) -> Result<()>;

    async fn upload_worker(
        &self,
        server: &Candidate,
        context: &TransferContext,
        deadline: Instant,
    ) -> Result<()>;

    fn throughput_mbps(
        &self,
        _phase: TestPhase,
        context: &TransferContext,
        elapsed: Duration,
    ) -> f64 {
        context.mbps(elapsed)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory client used by the runner, service and HTTP tests.

    use super::*;
    use anyhow::bail;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    pub fn candidate(id: &str, distance_km: f64, latency_ms: Option<u64>) -> Candidate {
        Candidate {
            id: id.to_string(),
            name: format!("City {id}"),
            sponsor: format!("Sponsor {id}"),
            country: "Testland".to_string(),
            host: format!("speedtest-{id}.example.net:8080"),
            url: format!("http://speedtest-{id}.example.net:8080/speedtest/upload.php"),
            distance_km,
            latency: latency_ms.map(Duration::from_millis),
        }
    }

    #[derive(Debug, Default)]
    pub struct Calls {
        pub user_info: AtomicUsize,
        pub servers: AtomicUsize,
        pub latency: AtomicUsize,
        pub download_workers: AtomicUsize,
        pub upload_workers: AtomicUsize,
        pub active_workers: AtomicUsize,
        pub max_active_workers: AtomicUsize,
    }

    /// Scripted client. Workers move a few bytes, wait for the phase deadline
    /// and the phase rates are reported as configured.
    #[derive(Clone)]
    pub struct MockClient {
        pub servers: Vec<Candidate>,
        pub latency: Duration,
        pub download_mbps: f64,
        pub upload_mbps: f64,
        pub fail_user_info: bool,
        pub fail_servers: bool,
        pub fail_download: bool,
        pub fail_upload: bool,
        pub calls: Arc<Calls>,
    }

    impl MockClient {
        pub fn new(servers: Vec<Candidate>) -> Self {
            Self {
                servers,
                latency: Duration::from_millis(20),
                download_mbps: 450.0,
                upload_mbps: 30.0,
                fail_user_info: false,
                fail_servers: false,
                fail_download: false,
                fail_upload: false,
                calls: Arc::new(Calls::default()),
            }
        }

        async fn work(&self, context: &TransferContext, deadline: Instant) {
            let active = self.calls.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
            self.calls
                .max_active_workers
                .fetch_max(active, Ordering::SeqCst);
            context.add(64 * 1024);
            tokio::time::sleep_until(deadline).await;
            context.add(64 * 1024);
            self.calls.active_workers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SpeedtestClient for MockClient {
        async fn fetch_user_info(&self) -> Result<UserInfo> {
            self.calls.user_info.fetch_add(1, Ordering::SeqCst);
            if self.fail_user_info {
                bail!("user info endpoint unavailable");
            }
            Ok(UserInfo {
                ip: Some("203.0.113.7".to_string()),
                isp: Some("Example ISP".to_string()),
                ..Default::default()
            })
        }

        async fn fetch_servers(&self) -> Result<Vec<Candidate>> {
            self.calls.servers.fetch_add(1, Ordering::SeqCst);
            if self.fail_servers {
                bail!("server list request timed out");
            }
            Ok(self.servers.clone())
        }

        async fn latency(&self, _server: &Candidate) -> Result<Duration> {
            self.calls.latency.fetch_add(1, Ordering::SeqCst);
            Ok(self.latency)
        }

        async fn download_worker(
            &self,
            _server: &Candidate,
            context: &TransferContext,
            deadline: Instant,
        ) -> Result<()> {
            let worker = self.calls.download_workers.fetch_add(1, Ordering::SeqCst);
            if self.fail_download && worker == 0 {
                context.add(1_000_000);
                bail!("download stream closed early");
            }
            self.work(context, deadline).await;
            Ok(())
        }

        async fn upload_worker(
            &self,
            _server: &Candidate,
            context: &TransferContext,
            deadline: Instant,
        ) -> Result<()> {
            let worker = self.calls.upload_workers.fetch_add(1, Ordering::SeqCst);
            if self.fail_upload && worker == 0 {
                bail!("upload rejected with 503");
            }
            self.work(context, deadline).await;
            Ok(())
        }

        fn throughput_mbps(
            &self,
            phase: TestPhase,
            context: &TransferContext,
            _elapsed: Duration,
        ) -> f64 {
            assert!(context.bytes() > 0, "{phase} rate requested without any transfer");
            match phase {
                TestPhase::Upload => self.upload_mbps,
                _ => self.download_mbps,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::candidate;
    use super::*;

    #[test]
    fn base_url_strips_upload_script() {
        let server = candidate("7", 1.0, Some(5));
        assert_eq!(server.base_url(), "http://speedtest-7.example.net:8080/speedtest");
    }

    #[test]
    fn transfer_rate_in_megabits() {
        let context = TransferContext::default();
        context.add(12_500_000);
        assert_eq!(context.mbps(Duration::from_secs(1)), 100.0);
        assert_eq!(context.mbps(Duration::ZERO), 0.0);
    }

    #[test]
    fn transfer_scope_resets_on_drop() {
        let context = TransferContext::default();
        context.add(10);
        {
            let scope = context.scope();
            assert_eq!(scope.context().bytes(), 0);
            scope.context().add(4_096);
            assert_eq!(context.bytes(), 4_096);
        }
        assert_eq!(context.bytes(), 0);
    }

    #[test]
    fn unreachable_candidate() {
        assert!(!candidate("1", 3.0, None).is_reachable());
        assert!(candidate("1", 3.0, Some(12)).is_reachable());
    }
}
