use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Protocol tag selecting which registered [`Protocol`] implementation
/// services a device. Tags without a registered implementation are a
/// startup error, not a runtime one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Sim,
    OpcUa,
    Modbus,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Sim => "sim",
            ProtocolKind::OpcUa => "opcua",
            ProtocolKind::Modbus => "modbus",
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
    Disabled,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Disabled => write!(f, "disabled"),
        }
    }
}

/// Declared type of a metric; reads are coerced into this type after the
/// scale factor has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float,
    Int,
    Bool,
    String,
}

/// A single datum to read from a device. `node_id` is opaque to the core;
/// only the protocol session knows how to resolve it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub node_id: String,
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
}

fn default_scale_factor() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Per-collect timeout in seconds; 0 falls back to the engine default.
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub retry_attempts: u32,
    /// Keep-alive interval in seconds.
    #[serde(default)]
    pub keep_alive: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub security_mode: String,
    #[serde(default)]
    pub security_policy: String,
}

/// A remote endpoint metrics are collected from. Loaded at startup and
/// treated immutable by the core; only the health bookkeeping mutates.
#[derive(Debug, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub ip: String,
    #[serde(default)]
    pub port: u16,
    pub protocol: ProtocolKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub connection_config: ConnectionConfig,
    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
    /// Collection interval in seconds; 0 uses the agent default.
    #[serde(default)]
    pub interval: u64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(skip)]
    pub health: DeviceHealth,
}

fn default_enabled() -> bool {
    true
}

/// Runtime health bookkeeping for a device. Consecutive failures degrade
/// the status; any success restores it and stamps `last_success`.
#[derive(Debug, Default)]
pub struct DeviceHealth {
    inner: Mutex<HealthState>,
}

#[derive(Debug, Default, Clone)]
struct HealthState {
    status: HealthStatus,
    last_success: Option<DateTime<Utc>>,
    failure_count: u32,
}

const UNHEALTHY_FAILURES: u32 = 5;

impl DeviceHealth {
    pub fn record_success(&self) {
        let mut state = self.inner.lock();
        state.status = HealthStatus::Healthy;
        state.last_success = Some(Utc::now());
        state.failure_count = 0;
    }

    pub fn record_failure(&self) {
        let mut state = self.inner.lock();
        state.failure_count += 1;
        state.status = if state.failure_count >= UNHEALTHY_FAILURES {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
    }

    pub fn status(&self) -> HealthStatus {
        self.inner.lock().status
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_success
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }
}

/// Dynamically typed metric value. Untagged so pushed JSON numbers,
/// booleans and strings decode without an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Text(s) => s.parse().ok(),
        }
    }

    /// Applies a linear scale factor. Non-numeric values pass through
    /// unchanged; integers become floats so the scaled value is exact.
    pub fn apply_scale(self, factor: f64) -> Value {
        match self {
            Value::Float(v) => Value::Float(v * factor),
            Value::Int(v) => Value::Float(v as f64 * factor),
            other => other,
        }
    }

    /// Coerces the value into the declared data type.
    pub fn coerce(self, data_type: DataType) -> Value {
        match data_type {
            DataType::Float => Value::Float(self.as_f64().unwrap_or(0.0)),
            DataType::Int => match self {
                Value::Int(v) => Value::Int(v),
                Value::Float(v) => Value::Int(v as i64),
                Value::Bool(v) => Value::Int(i64::from(v)),
                Value::Text(s) => Value::Int(s.parse().unwrap_or(0)),
            },
            DataType::Bool => match self {
                Value::Bool(v) => Value::Bool(v),
                Value::Int(v) => Value::Bool(v != 0),
                Value::Float(v) => Value::Bool(v != 0.0),
                Value::Text(s) => Value::Bool(s.parse().unwrap_or(false)),
            },
            DataType::String => match self {
                Value::Text(s) => Value::Text(s),
                Value::Bool(v) => Value::Text(v.to_string()),
                Value::Int(v) => Value::Text(v.to_string()),
                Value::Float(v) => Value::Text(v.to_string()),
            },
        }
    }
}

/// Per-point provenance quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointQuality {
    Good,
    Bad,
    Uncertain,
}

impl std::fmt::Display for PointQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PointQuality::Good => write!(f, "Good"),
            PointQuality::Bad => write!(f, "Bad"),
            PointQuality::Uncertain => write!(f, "Uncertain"),
        }
    }
}

/// Aggregate quality of one collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Good,
    Partial,
    Bad,
}

impl Quality {
    /// good iff every requested read succeeded, bad iff none did.
    pub fn aggregate(good: usize, requested: usize) -> Quality {
        if good == 0 {
            Quality::Bad
        } else if good < requested {
            Quality::Partial
        } else {
            Quality::Good
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quality::Good => write!(f, "good"),
            Quality::Partial => write!(f, "partial"),
            Quality::Bad => write!(f, "bad"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub unit: String,
    pub quality: PointQuality,
}

/// The result unit of one collect or one push. Downstream consumers treat
/// it as idempotent by `(device_id, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricData {
    pub device_id: String,
    #[serde(default)]
    pub device_ip: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metrics: HashMap<String, MetricValue>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub quality: Quality,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_untagged_round_trip() {
        for value in [
            Value::Float(21.5),
            Value::Int(42),
            Value::Bool(true),
            Value::Text("running".to_string()),
        ] {
            let encoded = serde_json::to_string(&value).unwrap();
            let decoded: Value = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, value, "round trip of {encoded}");
        }
    }

    #[test]
    fn scale_then_coerce_keeps_declared_type() {
        let scaled = Value::Int(250).apply_scale(0.1);
        assert_eq!(scaled, Value::Float(25.0));
        assert_eq!(scaled.coerce(DataType::Int), Value::Int(25));
    }

    #[test]
    fn scale_leaves_non_numeric_untouched() {
        assert_eq!(
            Value::Text("on".to_string()).apply_scale(2.0),
            Value::Text("on".to_string())
        );
        assert_eq!(Value::Bool(true).apply_scale(2.0), Value::Bool(true));
    }

    #[test]
    fn coercion_between_types() {
        assert_eq!(Value::Float(1.0).coerce(DataType::Bool), Value::Bool(true));
        assert_eq!(
            Value::Text("3".to_string()).coerce(DataType::Int),
            Value::Int(3)
        );
        assert_eq!(
            Value::Int(7).coerce(DataType::String),
            Value::Text("7".to_string())
        );
        assert_eq!(Value::Bool(false).coerce(DataType::Float), Value::Float(0.0));
    }

    #[test]
    fn quality_aggregation() {
        assert_eq!(Quality::aggregate(3, 3), Quality::Good);
        assert_eq!(Quality::aggregate(1, 3), Quality::Partial);
        assert_eq!(Quality::aggregate(0, 3), Quality::Bad);
    }

    #[test]
    fn metric_data_round_trip() {
        let mut metrics = HashMap::new();
        metrics.insert(
            "temperature".to_string(),
            MetricValue {
                name: "temperature".to_string(),
                value: Value::Float(21.5),
                unit: "celsius".to_string(),
                quality: PointQuality::Good,
            },
        );
        let data = MetricData {
            device_id: "plc-001".to_string(),
            device_ip: "10.0.0.5".to_string(),
            timestamp: Utc::now(),
            metrics,
            tags: HashMap::from([("line".to_string(), "a".to_string())]),
            quality: Quality::Good,
        };

        let encoded = serde_json::to_string(&data).unwrap();
        let decoded: MetricData = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn push_decode_fills_missing_timestamp() {
        let before = Utc::now();
        let decoded: MetricData =
            serde_json::from_str(r#"{"device_id":"pushed-01","metrics":{}}"#).unwrap();
        assert_eq!(decoded.device_id, "pushed-01");
        assert!(decoded.timestamp >= before);
        assert_eq!(decoded.quality, Quality::Good);
    }

    #[test]
    fn device_health_transitions() {
        let health = DeviceHealth::default();
        assert_eq!(health.status(), HealthStatus::Healthy);

        health.record_failure();
        assert_eq!(health.status(), HealthStatus::Degraded);

        for _ in 0..4 {
            health.record_failure();
        }
        assert_eq!(health.status(), HealthStatus::Unhealthy);
        assert_eq!(health.failure_count(), 5);

        health.record_success();
        assert_eq!(health.status(), HealthStatus::Healthy);
        assert!(health.last_success().is_some());
    }
}
