use anyhow::{Context, Result};
use bytes::Bytes;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use super::TransferContext;

const CHUNK_SIZE: usize = 1_000_000; // 1MB per POST

/// Incompressible payload shared by every upload worker of a client.
pub fn random_payload() -> Bytes {
    let mut rng = rand::rngs::StdRng::from_entropy();
    (0..CHUNK_SIZE).map(|_| rng.gen::<u8>()).collect()
}

pub struct UploadTest<'a> {
    client: &'a reqwest::Client,
    url: &'a str,
    data: &'a Bytes,
}

impl<'a> UploadTest<'a> {
    pub fn new(client: &'a reqwest::Client, url: &'a str, data: &'a Bytes) -> Self {
        Self { client, url, data }
    }

    /// Posts random chunks until `deadline`. A chunk only counts once the
    /// server has acknowledged it.
    pub async fn run(&self, context: &TransferContext, deadline: Instant) -> Result<()> {
        while Instant::now() < deadline {
            self.client
                .post(self.url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(self.data.clone())
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .with_context(|| format!("POST {}", self.url))?;

            context.add(self.data.len() as u64);
        }

        Ok(())
    }
}
