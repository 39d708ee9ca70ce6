//! Downstream sink implementations of the batcher's [`Flusher`] contract:
//! an HTTP JSON bridge, a line-protocol time-series writer, and a log sink
//! for development.

pub mod http;
pub mod line;
pub mod log;

#[cfg(test)]
mod tests;

use fieldmon_batch::Flusher;
use serde::Deserialize;
use std::sync::Arc;

pub use http::{HttpSink, HttpSinkConfig};
pub use line::{LineSink, LineSinkConfig};
pub use log::LogSink;

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// "http", "line" or "log".
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub http: HttpSinkConfig,
    #[serde(default)]
    pub line: LineSinkConfig,
}

fn default_kind() -> String {
    "log".to_string()
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            http: HttpSinkConfig::default(),
            line: LineSinkConfig::default(),
        }
    }
}

pub fn build(cfg: &SinkConfig) -> anyhow::Result<Arc<dyn Flusher>> {
    match cfg.kind.as_str() {
        "http" => Ok(Arc::new(HttpSink::new(cfg.http.clone())?)),
        "line" => Ok(Arc::new(LineSink::new(cfg.line.clone())?)),
        "log" => Ok(Arc::new(LogSink::default())),
        other => anyhow::bail!("unknown sink kind: {other}"),
    }
}
