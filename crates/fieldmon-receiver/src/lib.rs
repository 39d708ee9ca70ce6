//! Push-mode ingress.
//!
//! Devices that cannot be polled push `MetricData` at the agent instead.
//! Each enabled adapter decodes payloads, fills a missing timestamp,
//! validates the device id and hands the data to the agent's push handler,
//! which feeds the same batcher pipeline as polled collection.

pub mod http;
pub mod mqtt;


use async_trait::async_trait;
use fieldmon_common::MetricData;
use serde::Deserialize;
use std::sync::Arc;

pub use http::HttpReceiver;
pub use mqtt::MqttReceiver;

/// Callback invoked for every accepted push.
pub type PushHandler = Arc<dyn Fn(MetricData) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub http: HttpReceiverConfig,
    #[serde(default)]
    pub mqtt: MqttReceiverConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpReceiverConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8089".to_string()
}

fn default_endpoint() -> String {
    "/api/v1/metrics".to_string()
}

impl Default for HttpReceiverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_listen_addr(),
            endpoint: default_endpoint(),
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// "bearer" or "basic".
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttReceiverConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_topics() -> Vec<String> {
    vec!["fieldmon/metrics".to_string()]
}

fn default_keep_alive() -> u64 {
    15
}

impl Default for MqttReceiverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            client_id: String::new(),
            username: String::new(),
            password: String::new(),
            topics: default_topics(),
            keep_alive: default_keep_alive(),
        }
    }
}

/// A concrete ingress surface (HTTP endpoint, MQTT subscription).
#[async_trait]
pub trait ReceiverAdapter: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self);
}

/// Starts the configured adapters and stops them in reverse order.
pub struct ReceiverManager {
    adapters: Vec<Box<dyn ReceiverAdapter>>,
}

impl ReceiverManager {
    pub fn new(
        cfg: &ReceiverConfig,
        handler: PushHandler,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Self {
        let mut adapters: Vec<Box<dyn ReceiverAdapter>> = Vec::new();
        if cfg.enabled {
            if cfg.http.enabled {
                adapters.push(Box::new(HttpReceiver::new(
                    cfg.http.clone(),
                    handler.clone(),
                    cancel.clone(),
                )));
            }
            if cfg.mqtt.enabled {
                adapters.push(Box::new(MqttReceiver::new(
                    cfg.mqtt.clone(),
                    handler,
                    cancel,
                )));
            }
        }
        Self { adapters }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        if self.adapters.is_empty() {
            tracing::info!("Receiver disabled, operating in pull mode only");
            return Ok(());
        }
        for adapter in &self.adapters {
            adapter.start().await?;
            tracing::info!(receiver = adapter.name(), "Receiver started");
        }
        Ok(())
    }

    pub async fn stop(&self) {
        for adapter in self.adapters.iter().rev() {
            tracing::info!(receiver = adapter.name(), "Stopping receiver");
            adapter.stop().await;
        }
    }

    pub fn active_count(&self) -> usize {
        self.adapters.len()
    }
}
