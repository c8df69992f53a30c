//! speedtest.net backed implementation of [`SpeedtestClient`].
//!
//! Servers come from the public JSON server list. Each of them exposes the
//! legacy HTTP test resources next to its `upload.php` endpoint:
//! `latency.txt` for round trips and `random<N>x<N>.jpg` for downloads.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::download::DownloadTest;
use super::ping::PingTest;
use super::upload::{random_payload, UploadTest};
use super::{Candidate, SpeedtestClient, TransferContext, UserInfo};

const USER_INFO_URL: &str = "https://ipinfo.io/json";
const SERVERS_URL: &str = "https://www.speedtest.net/api/js/servers?engine=js&limit=10";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpSpeedtestClient {
    http: reqwest::Client,
    probe: reqwest::Client,
    ping_count: usize,
    payload: bytes::Bytes,
}

impl HttpSpeedtestClient {
    pub fn new(ping_count: usize) -> Result<Self> {
        let user_agent = concat!("speedtest-exporter/", env!("CARGO_PKG_VERSION"));

        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let probe = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(PROBE_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            probe,
            ping_count,
            payload: random_payload(),
        })
    }

    async fn probe(&self, server: &Candidate) -> Option<Duration> {
        let url = latency_url(server);
        match PingTest::new(1).run(&self.probe, &url).await {
            Ok(latency) => Some(latency),
            Err(e) => {
                let reason = format!("{e:#}");
                debug!(server = %server.id, error = %reason, "Server probe failed");
                None
            }
        }
    }
}

#[async_trait]
impl SpeedtestClient for HttpSpeedtestClient {
    async fn fetch_user_info(&self) -> Result<UserInfo> {
        let raw: RawUserInfo = self
            .http
            .get(USER_INFO_URL)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context("requesting user info")?
            .json()
            .await
            .context("decoding user info")?;

        Ok(raw.into())
    }

    async fn fetch_servers(&self) -> Result<Vec<Candidate>> {
        let body = self
            .http
            .get(SERVERS_URL)
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context("requesting server list")?
            .text()
            .await
            .context("reading server list")?;

        let mut servers = parse_servers(&body)?;

        let probes = join_all(servers.iter().map(|s| self.probe(s))).await;
        for (server, latency) in servers.iter_mut().zip(probes) {
            server.latency = latency;
        }

        Ok(servers)
    }

    async fn latency(&self, server: &Candidate) -> Result<Duration> {
        PingTest::new(self.ping_count)
            .run(&self.http, &latency_url(server))
            .await
    }

    async fn download_worker(
        &self,
        server: &Candidate,
        context: &TransferContext,
        deadline: Instant,
    ) -> Result<()> {
        DownloadTest::new(&self.http, server.base_url())
            .run(context, deadline)
            .await
    }

    async fn upload_worker(
        &self,
        server: &Candidate,
        context: &TransferContext,
        deadline: Instant,
    ) -> Result<()> {
        UploadTest::new(&self.http, &server.url, &self.payload)
            .run(context, deadline)
            .await
    }
}

fn latency_url(server: &Candidate) -> String {
    format!("{}/latency.txt", server.base_url())
}

/// Parses the server list body, closest server first.
fn parse_servers(body: &str) -> Result<Vec<Candidate>> {
    let raw: Vec<RawServer> = serde_json::from_str(body).context("decoding server list")?;

    let mut servers: Vec<Candidate> = raw
        .into_iter()
        .filter(|s| !s.url.is_empty())
        .map(Candidate::from)
        .collect();
    servers.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));

    Ok(servers)
}

#[derive(Debug, Deserialize)]
struct RawServer {
    #[serde(deserialize_with = "loose_string")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    sponsor: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    url: String,
    #[serde(default, deserialize_with = "loose_f64")]
    distance: f64,
}

impl From<RawServer> for Candidate {
    fn from(raw: RawServer) -> Self {
        Candidate {
            id: raw.id,
            name: raw.name,
            sponsor: raw.sponsor,
            country: raw.country,
            host: raw.host,
            url: raw.url,
            distance_km: raw.distance,
            latency: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawUserInfo {
    ip: Option<String>,
    org: Option<String>,
    city: Option<String>,
    country: Option<String>,
}

impl From<RawUserInfo> for UserInfo {
    fn from(raw: RawUserInfo) -> Self {
        UserInfo {
            ip: raw.ip,
            isp: raw.org,
            city: raw.city,
            country: raw.country,
        }
    }
}

// The server list is not consistent about quoting numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Number(f64),
    Text(String),
}

fn loose_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Loose::deserialize(deserializer)? {
        Loose::Number(n) if n.fract() == 0.0 => format!("{}", n as i64),
        Loose::Number(n) => n.to_string(),
        Loose::Text(s) => s,
    })
}

fn loose_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Loose::deserialize(deserializer)? {
        Loose::Number(n) => Ok(n),
        Loose::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
