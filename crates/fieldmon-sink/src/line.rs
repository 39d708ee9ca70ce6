use async_trait::async_trait;
use fieldmon_batch::Flusher;
use fieldmon_common::{MetricData, Value};
use serde::Deserialize;
use std::fmt::Write as _;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct LineSinkConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_measurement")]
    pub measurement: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_endpoint() -> String {
    "http://localhost:8086".to_string()
}

fn default_measurement() -> String {
    "device_metrics".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for LineSinkConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            org: String::new(),
            bucket: String::new(),
            token: String::new(),
            measurement: default_measurement(),
            timeout: default_timeout(),
        }
    }
}

/// Time-series writer: one line-protocol point per metric, written through
/// the HTTP v2 write endpoint with nanosecond precision.
pub struct LineSink {
    cfg: LineSinkConfig,
    client: reqwest::Client,
    write_url: String,
}

impl LineSink {
    pub fn new(cfg: LineSinkConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout.max(1)))
            .build()?;
        let write_url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ns",
            cfg.endpoint.trim_end_matches('/'),
            cfg.org,
            cfg.bucket
        );
        Ok(Self {
            cfg,
            client,
            write_url,
        })
    }

    pub fn encode_batch(&self, batch: &[MetricData]) -> String {
        let mut body = String::new();
        for data in batch {
            for line in encode_points(&self.cfg.measurement, data) {
                body.push_str(&line);
                body.push('\n');
            }
        }
        body
    }
}

/// Encodes one point per metric: tags carry the device identity and the
/// metric name, fields carry value, quality and the optional unit.
pub fn encode_points(measurement: &str, data: &MetricData) -> Vec<String> {
    let ts_nanos = data
        .timestamp
        .timestamp_nanos_opt()
        .unwrap_or_else(|| data.timestamp.timestamp_millis().saturating_mul(1_000_000));

    let mut names: Vec<&String> = data.metrics.keys().collect();
    names.sort();

    names
        .iter()
        .map(|name| {
            let metric = &data.metrics[*name];
            let mut line = String::new();
            line.push_str(&escape_tag(measurement));
            let _ = write!(
                line,
                ",device_id={},device_ip={},metric_name={}",
                escape_tag(&data.device_id),
                escape_tag(&data.device_ip),
                escape_tag(name)
            );

            let mut tags: Vec<(&String, &String)> = data.tags.iter().collect();
            tags.sort();
            for (key, value) in tags {
                let _ = write!(line, ",{}={}", escape_tag(key), escape_tag(value));
            }

            let _ = write!(
                line,
                " value={},quality=\"{}\"",
                format_field_value(&metric.value),
                metric.quality
            );
            if !metric.unit.is_empty() {
                let _ = write!(line, ",unit=\"{}\"", escape_string_field(&metric.unit));
            }

            let _ = write!(line, " {ts_nanos}");
            line
        })
        .collect()
}

fn escape_tag(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_string_field(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn format_field_value(value: &Value) -> String {
    match value {
        Value::Float(v) => format!("{v}"),
        Value::Int(v) => format!("{v}i"),
        Value::Bool(v) => format!("{v}"),
        Value::Text(s) => format!("\"{}\"", escape_string_field(s)),
    }
}

#[async_trait]
impl Flusher for LineSink {
    fn name(&self) -> &str {
        "line"
    }

    async fn flush(&self, batch: &[MetricData]) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let body = self.encode_batch(batch);
        let mut request = self.client.post(&self.write_url).body(body);
        if !self.cfg.token.is_empty() {
            request = request.header("Authorization", format!("Token {}", self.cfg.token));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            tracing::debug!(size = batch.len(), "Points written");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("write failed: HTTP {status}: {body}")
        }
    }
}
