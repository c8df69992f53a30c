use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::time::{timeout_at, Instant};

use super::TransferContext;

/// Edge length of the random image requested per round; speedtest servers
/// ship 350..4000 px variants.
const IMAGE_SIZE: u32 = 4000;

pub struct DownloadTest<'a> {
    client: &'a reqwest::Client,
    url: String,
}

impl<'a> DownloadTest<'a> {
    pub fn new(client: &'a reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{base_url}/random{IMAGE_SIZE}x{IMAGE_SIZE}.jpg"),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Streams the test image repeatedly until `deadline`, crediting every
    /// received chunk to `context`. A server that stalls past the deadline
    /// ends the sample instead of failing it.
    pub async fn run(&self, context: &TransferContext, deadline: Instant) -> Result<()> {
        while Instant::now() < deadline {
            let Ok(sent) = timeout_at(deadline, self.client.get(&self.url).send()).await else {
                return Ok(());
            };
            let response = sent
                .and_then(|r| r.error_for_status())
                .with_context(|| format!("GET {}", self.url))?;

            let mut stream = response.bytes_stream();
            loop {
                let chunk = match timeout_at(deadline, stream.next()).await {
                    Err(_) => return Ok(()),
                    Ok(None) => break,
                    Ok(Some(chunk)) => chunk.with_context(|| format!("reading {}", self.url))?,
                };
                context.add(chunk.len() as u64);

                if Instant::now() >= deadline {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}
