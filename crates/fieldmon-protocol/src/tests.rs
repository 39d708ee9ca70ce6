use crate::pool::{ConnectionPool, PoolConfig};
use crate::session::{NodeReading, ReadSession, SessionFactory};
use crate::sim::SimSessionFactory;
use crate::{Protocol, ProtocolError, SessionProtocol};
use async_trait::async_trait;
use fieldmon_common::{
    ConnectionConfig, DataType, Device, MetricDefinition, PointQuality, ProtocolKind, Quality,
    Value,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn device(id: &str, nodes: &[(&str, &str, DataType, f64)]) -> Device {
    Device {
        id: id.to_string(),
        name: id.to_string(),
        ip: "10.1.0.5".to_string(),
        port: 4840,
        protocol: ProtocolKind::Sim,
        enabled: true,
        connection_config: ConnectionConfig::default(),
        metrics: nodes
            .iter()
            .map(|(node_id, name, data_type, scale)| MetricDefinition {
                node_id: node_id.to_string(),
                name: name.to_string(),
                data_type: *data_type,
                unit: String::new(),
                scale_factor: *scale,
            })
            .collect(),
        interval: 5,
        tags: HashMap::new(),
        health: Default::default(),
    }
}

struct CountingFactory {
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl CountingFactory {
    fn new() -> Self {
        Self {
            opened: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct CountingSession {
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl ReadSession for CountingSession {
    async fn read(&mut self, node_ids: &[String]) -> Result<Vec<NodeReading>, ProtocolError> {
        Ok(node_ids
            .iter()
            .map(|id| NodeReading {
                node_id: id.clone(),
                value: Some(Value::Float(1.0)),
                quality: PointQuality::Good,
            })
            .collect())
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SessionFactory for CountingFactory {
    async fn connect(&self, _device: &Device) -> Result<Box<dyn ReadSession>, ProtocolError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingSession {
            closed: self.closed.clone(),
        }))
    }
}

fn pool_cfg(max_idle: usize, max_open: usize, max_lifetime: u64, idle_timeout: u64) -> PoolConfig {
    PoolConfig {
        max_idle,
        max_open,
        max_lifetime,
        idle_timeout,
    }
}

#[tokio::test]
async fn pool_reuses_session_for_same_device() {
    let pool = ConnectionPool::new(ProtocolKind::Sim, &pool_cfg(4, 16, 0, 0));
    let factory = CountingFactory::new();
    let dev = device("plc-1", &[]);

    let conn = pool.get(&dev, &factory).await.unwrap();
    pool.put(conn).await;
    let conn = pool.get(&dev, &factory).await.unwrap();
    pool.put(conn).await;

    assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pool_never_hands_a_session_to_another_device() {
    let pool = ConnectionPool::new(ProtocolKind::Sim, &pool_cfg(4, 16, 0, 0));
    let factory = CountingFactory::new();

    let conn = pool.get(&device("plc-1", &[]), &factory).await.unwrap();
    pool.put(conn).await;
    let conn = pool.get(&device("plc-2", &[]), &factory).await.unwrap();
    assert_eq!(conn.device_id(), "plc-2");
    pool.put(conn).await;

    assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn pool_exhausted_at_max_open_without_waiting() {
    let pool = ConnectionPool::new(ProtocolKind::Sim, &pool_cfg(1, 1, 0, 0));
    let factory = CountingFactory::new();

    let held = pool.get(&device("plc-1", &[]), &factory).await.unwrap();
    let err = pool.get(&device("plc-2", &[]), &factory).await.unwrap_err();
    assert!(matches!(err, ProtocolError::PoolExhausted));

    pool.put(held).await;
    let conn = pool.get(&device("plc-1", &[]), &factory).await.unwrap();
    pool.put(conn).await;
}

#[tokio::test]
async fn pool_tears_down_sessions_beyond_max_idle() {
    let pool = ConnectionPool::new(ProtocolKind::Sim, &pool_cfg(0, 4, 0, 0));
    let factory = CountingFactory::new();

    let conn = pool.get(&device("plc-1", &[]), &factory).await.unwrap();
    pool.put(conn).await;

    assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().idle, 0);
}

#[tokio::test]
async fn pool_retires_session_at_max_lifetime_on_get() {
    let pool = ConnectionPool::new(ProtocolKind::Sim, &pool_cfg(4, 16, 1, 0));
    let factory = CountingFactory::new();
    let dev = device("plc-1", &[]);

    let conn = pool.get(&dev, &factory).await.unwrap();
    pool.put(conn).await;

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let conn = pool.get(&dev, &factory).await.unwrap();
    pool.put(conn).await;

    assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn closed_pool_rejects_get() {
    let pool = ConnectionPool::new(ProtocolKind::Sim, &pool_cfg(4, 16, 0, 0));
    let factory = CountingFactory::new();

    pool.close().await;
    pool.close().await; // idempotent

    let err = pool.get(&device("plc-1", &[]), &factory).await.unwrap_err();
    assert!(matches!(err, ProtocolError::PoolClosed));
}

#[tokio::test]
async fn sim_collect_scales_coerces_and_aggregates_quality() {
    let proto = SessionProtocol::new(
        ProtocolKind::Sim,
        &PoolConfig::default(),
        Arc::new(SimSessionFactory),
    );
    let dev = device(
        "plc-1",
        &[
            ("int:counter", "counter", DataType::Int, 10.0),
            ("bool:running", "running", DataType::Bool, 1.0),
            ("bad:broken", "broken", DataType::Float, 1.0),
            ("flow", "flow", DataType::Float, 1.0),
        ],
    );

    let data = proto.collect(&dev).await.unwrap();

    assert_eq!(data.device_id, "plc-1");
    assert_eq!(data.device_ip, "10.1.0.5");
    assert_eq!(data.quality, Quality::Partial);
    assert_eq!(data.metrics.len(), 3);
    assert!(!data.metrics.contains_key("broken"));

    // First read is tick 1; the scale factor multiplies before coercion.
    assert_eq!(data.metrics["counter"].value, Value::Int(10));
    assert_eq!(data.metrics["running"].value, Value::Bool(false));
    assert!(matches!(data.metrics["flow"].value, Value::Float(_)));
}

#[tokio::test]
async fn zero_scale_factor_zeroes_the_value() {
    let proto = SessionProtocol::new(
        ProtocolKind::Sim,
        &PoolConfig::default(),
        Arc::new(SimSessionFactory),
    );
    let dev = device("plc-1", &[("int:heats", "zeroed", DataType::Float, 0.0)]);

    let data = proto.collect(&dev).await.unwrap();
    assert_eq!(data.metrics["zeroed"].value, Value::Float(0.0));
}

#[tokio::test]
async fn sim_collect_with_all_bad_nodes_is_bad_quality() {
    let proto = SessionProtocol::new(
        ProtocolKind::Sim,
        &PoolConfig::default(),
        Arc::new(SimSessionFactory),
    );
    let dev = device(
        "plc-1",
        &[
            ("bad:a", "a", DataType::Float, 1.0),
            ("bad:b", "b", DataType::Float, 1.0),
        ],
    );

    let data = proto.collect(&dev).await.unwrap();
    assert_eq!(data.quality, Quality::Bad);
    assert!(data.metrics.is_empty());
}

#[tokio::test]
async fn sim_collect_read_error_propagates() {
    let proto = SessionProtocol::new(
        ProtocolKind::Sim,
        &PoolConfig::default(),
        Arc::new(SimSessionFactory),
    );
    let dev = device("plc-1", &[("err:x", "x", DataType::Float, 1.0)]);

    let err = proto.collect(&dev).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Session(_)));
}

#[tokio::test]
async fn sim_unreachable_device_fails_connect() {
    let proto = SessionProtocol::new(
        ProtocolKind::Sim,
        &PoolConfig::default(),
        Arc::new(SimSessionFactory),
    );
    let mut dev = device("plc-1", &[("flow", "flow", DataType::Float, 1.0)]);
    dev.tags
        .insert("sim.unreachable".to_string(), "1".to_string());

    let err = proto.collect(&dev).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Session(_)));
    assert_eq!(proto.pool_stats().active, 0);
}

#[tokio::test]
async fn collect_without_nodes_is_rejected() {
    let proto = SessionProtocol::new(
        ProtocolKind::Sim,
        &PoolConfig::default(),
        Arc::new(SimSessionFactory),
    );
    let dev = device("plc-1", &[]);

    let err = proto.collect(&dev).await.unwrap_err();
    assert!(matches!(err, ProtocolError::NoNodes));
}
