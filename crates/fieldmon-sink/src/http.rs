use async_trait::async_trait;
use fieldmon_batch::Flusher;
use fieldmon_common::MetricData;
use serde::Deserialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSinkConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub bearer_token: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_endpoint() -> String {
    "http://localhost:8080/api/v1/metrics/batch".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl Default for HttpSinkConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            bearer_token: String::new(),
            timeout: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// Posts the JSON-encoded batch to an HTTP endpoint, retrying with
/// exponential backoff before giving the batch back to the batcher as a
/// failure (and hence to the spill cache).
pub struct HttpSink {
    cfg: HttpSinkConfig,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(cfg: HttpSinkConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout.max(1)))
            .build()?;
        Ok(Self { cfg, client })
    }

    async fn send_once(&self, batch: &[MetricData]) -> anyhow::Result<()> {
        let mut request = self.client.post(&self.cfg.endpoint).json(batch);
        if !self.cfg.bearer_token.is_empty() {
            request = request.bearer_auth(&self.cfg.bearer_token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("HTTP {status}: {body}")
        }
    }
}

#[async_trait]
impl Flusher for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn flush(&self, batch: &[MetricData]) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let attempts = self.cfg.max_retries.max(1);
        let mut last_err = None;

        for attempt in 0..attempts {
            match self.send_once(batch).await {
                Ok(()) => {
                    tracing::debug!(
                        size = batch.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Batch delivered"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "Sink delivery failed, retrying"
                    );
                    last_err = Some(e);
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt))).await;
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("delivery failed")))
    }
}
