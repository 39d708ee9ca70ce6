use crate::line::encode_points;
use crate::{build, SinkConfig};
use chrono::{TimeZone, Utc};
use fieldmon_common::{MetricData, MetricValue, PointQuality, Quality, Value};
use std::collections::HashMap;

fn sample() -> MetricData {
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
    metrics.insert(
        "running".to_string(),
        MetricValue {
            name: "running".to_string(),
            value: Value::Bool(true),
            unit: String::new(),
            quality: PointQuality::Good,
        },
    );
    MetricData {
        device_id: "plc-001".to_string(),
        device_ip: "10.1.0.5".to_string(),
        timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        metrics,
        tags: HashMap::from([("line".to_string(), "cast house".to_string())]),
        quality: Quality::Good,
    }
}

#[test]
fn one_point_per_metric_with_sorted_names() {
    let lines = encode_points("device_metrics", &sample());
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("metric_name=running"));
    assert!(lines[1].contains("metric_name=temperature"));
}

#[test]
fn line_carries_identity_tags_and_fields() {
    let lines = encode_points("device_metrics", &sample());
    let temp = &lines[1];

    assert!(temp.starts_with("device_metrics,device_id=plc-001,device_ip=10.1.0.5"));
    // Tag values with spaces are escaped.
    assert!(temp.contains("line=cast\\ house"));
    assert!(temp.contains("value=21.5"));
    assert!(temp.contains("quality=\"Good\""));
    assert!(temp.contains("unit=\"celsius\""));
    // Nanosecond timestamp suffix.
    assert!(temp.ends_with(" 1748779200000000000"));
}

#[test]
fn field_value_formats_by_type() {
    let mut data = sample();
    data.metrics.insert(
        "counter".to_string(),
        MetricValue {
            name: "counter".to_string(),
            value: Value::Int(42),
            unit: String::new(),
            quality: PointQuality::Good,
        },
    );
    data.metrics.insert(
        "mode".to_string(),
        MetricValue {
            name: "mode".to_string(),
            value: Value::Text("auto \"x\"".to_string()),
            unit: String::new(),
            quality: PointQuality::Uncertain,
        },
    );

    let lines = encode_points("m", &data);
    let joined = lines.join("\n");
    assert!(joined.contains("value=42i"));
    assert!(joined.contains("value=true"));
    assert!(joined.contains("value=\"auto \\\"x\\\"\""));
    assert!(joined.contains("quality=\"Uncertain\""));
}

#[test]
fn build_selects_sink_kind() {
    let cfg = SinkConfig::default();
    let sink = build(&cfg).unwrap();
    assert_eq!(sink.name(), "log");

    let mut cfg = SinkConfig::default();
    cfg.kind = "http".to_string();
    assert_eq!(build(&cfg).unwrap().name(), "http");

    cfg.kind = "line".to_string();
    assert_eq!(build(&cfg).unwrap().name(), "line");

    cfg.kind = "kafka".to_string();
    assert!(build(&cfg).is_err());
}
