#![allow(dead_code)]

use async_trait::async_trait;
use fieldmon_agent::Config;
use fieldmon_batch::Flusher;
use fieldmon_common::{ConnectionConfig, DataType, Device, MetricData, MetricDefinition, ProtocolKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Sink double: records delivered batches and can be switched into a
/// failing state to simulate a downstream outage.
#[derive(Default)]
pub struct MockSink {
    fail: AtomicBool,
    records: Mutex<Vec<MetricData>>,
}

impl MockSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        Arc::new(sink)
    }

    pub fn set_should_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn records(&self) -> Vec<MetricData> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl Flusher for MockSink {
    fn name(&self) -> &str {
        "mock"
    }

    async fn flush(&self, batch: &[MetricData]) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("sink unavailable");
        }
        self.records.lock().extend_from_slice(batch);
        Ok(())
    }
}

pub fn sim_device(id: &str, interval: u64) -> Arc<Device> {
    sim_device_with_tags(id, interval, HashMap::from([("site".to_string(), "test".to_string())]))
}

/// A device the simulator refuses to connect to.
pub fn unreachable_device(id: &str, interval: u64) -> Arc<Device> {
    sim_device_with_tags(
        id,
        interval,
        HashMap::from([("sim.unreachable".to_string(), "1".to_string())]),
    )
}

pub fn sim_device_with_tags(
    id: &str,
    interval: u64,
    tags: HashMap<String, String>,
) -> Arc<Device> {
    Arc::new(Device {
        id: id.to_string(),
        name: id.to_string(),
        ip: "10.9.0.1".to_string(),
        port: 4840,
        protocol: ProtocolKind::Sim,
        enabled: true,
        connection_config: ConnectionConfig {
            timeout: 5,
            ..Default::default()
        },
        metrics: vec![
            MetricDefinition {
                node_id: "temp.zone1".to_string(),
                name: "temperature".to_string(),
                data_type: DataType::Float,
                unit: "celsius".to_string(),
                scale_factor: 1.0,
            },
            MetricDefinition {
                node_id: "int:heats".to_string(),
                name: "heat_count".to_string(),
                data_type: DataType::Int,
                unit: String::new(),
                scale_factor: 1.0,
            },
        ],
        interval,
        tags,
        health: Default::default(),
    })
}

/// Shortened intervals throughout so end-to-end scenarios finish in a few
/// seconds.
pub fn test_config(dir: &TempDir) -> Config {
    let cache_path = dir.path().join("cache").to_string_lossy().to_string();
    let toml = format!(
        r#"
        [agent]
        id = "test-agent"
        max_concurrency = 2
        max_devices = 50
        collection_interval = 1

        [batch]
        interval = 1
        max_size = 10

        [cache]
        path = "{cache_path}"
        ttl = 3600
        gc_interval = 600
        retry_interval = 1

        [circuit_breaker]
        failure_threshold = 3
        success_threshold = 1
        timeout = 2
        half_open_max_requests = 1

        [devices.file]
        path = "unused.json"
        "#
    );
    toml::from_str(&toml).expect("test config should parse")
}
