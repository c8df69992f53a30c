use anyhow::{bail, Context, Result};
use std::time::{Duration, Instant};

const PING_INTERVAL: Duration = Duration::from_millis(50);

pub struct PingTest {
    samples: Vec<Duration>,
    ping_count: usize,
}

impl PingTest {
    pub fn new(ping_count: usize) -> Self {
        Self {
            samples: Vec::with_capacity(ping_count),
            ping_count: ping_count.max(1),
        }
    }

    /// Average round trip to `url`, ignoring individual failed probes.
    pub async fn run(&mut self, client: &reqwest::Client, url: &str) -> Result<Duration> {
        self.samples.clear();
        let mut last_error = None;

        for i in 0..self.ping_count {
            let start = Instant::now();
            match client.get(url).send().await.and_then(|r| r.error_for_status()) {
                Ok(_) => self.samples.push(start.elapsed()),
                Err(e) => last_error = Some(e),
            }

            if i + 1 < self.ping_count {
                tokio::time::sleep(PING_INTERVAL).await;
            }
        }

        if self.samples.is_empty() {
            return match last_error {
                Some(e) => Err(e).with_context(|| format!("no answer from {url}")),
                None => bail!("no answer from {url}"),
            };
        }

        Ok(self.average())
    }

    fn average(&self) -> Duration {
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }
}
