use fieldmon_batch::BatchConfig;
use fieldmon_cache::CacheConfig;
use fieldmon_engine::BreakerConfig;
use fieldmon_protocol::PoolConfig;
use fieldmon_receiver::ReceiverConfig;
use fieldmon_sink::SinkConfig;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Pool sizing per protocol tag, e.g. `[connection_pool.sim]`.
    #[serde(default)]
    pub connection_pool: HashMap<String, PoolConfig>,
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Worker pool size.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Soft cap on the device count; exceeding it only warns.
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
    /// Default collection interval in seconds for devices that omit one.
    #[serde(default = "default_collection_interval")]
    pub collection_interval: u64,
    /// Accepted for compatibility with other runtimes; has no effect here.
    #[serde(default)]
    pub gc_percent: Option<i32>,
}

fn default_agent_id() -> String {
    "fieldmon-agent".to_string()
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_devices() -> usize {
    100
}

fn default_collection_interval() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            name: String::new(),
            max_concurrency: default_max_concurrency(),
            max_devices: default_max_devices(),
            collection_interval: default_collection_interval(),
            gc_percent: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevicesConfig {
    #[serde(default = "default_devices_source")]
    pub source: String,
    #[serde(default)]
    pub file: DeviceFileConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceFileConfig {
    #[serde(default)]
    pub path: String,
}

fn default_devices_source() -> String {
    "file".to_string()
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            source: default_devices_source(),
            file: DeviceFileConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "console" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "console".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config file '{path}': {e}"))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("parse config file '{path}': {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.agent.max_concurrency == 0 {
            anyhow::bail!("agent.max_concurrency must be positive");
        }
        if self.agent.max_devices == 0 {
            anyhow::bail!("agent.max_devices must be positive");
        }
        if self.agent.collection_interval == 0 {
            anyhow::bail!("agent.collection_interval must be positive");
        }
        if self.batch.interval == 0 {
            anyhow::bail!("batch.interval must be positive");
        }
        if self.batch.max_size == 0 {
            anyhow::bail!("batch.max_size must be positive");
        }
        if self.cache.path.is_empty() {
            anyhow::bail!("cache.path is required");
        }
        if self.devices.source.is_empty() {
            anyhow::bail!("devices.source is required");
        }
        if self.devices.source == "file" && self.devices.file.path.is_empty() {
            anyhow::bail!("devices.file.path is required when devices.source is \"file\"");
        }
        if !matches!(self.logging.level.as_str(), "debug" | "info" | "warn" | "error") {
            anyhow::bail!("logging.level must be one of: debug, info, warn, error");
        }
        if !matches!(self.logging.format.as_str(), "json" | "console") {
            anyhow::bail!("logging.format must be one of: json, console");
        }
        Ok(())
    }
}
