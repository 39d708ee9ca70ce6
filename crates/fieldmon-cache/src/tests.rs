use crate::{CacheConfig, SpillCache};
use chrono::{Duration as ChronoDuration, Utc};
use fieldmon_common::{MetricData, MetricValue, PointQuality, Quality, Value};
use std::collections::HashMap;
use std::time::Duration;
use tempfile::TempDir;

fn setup(ttl: u64) -> (TempDir, SpillCache) {
    let dir = TempDir::new().unwrap();
    let cfg = CacheConfig {
        path: dir.path().to_string_lossy().to_string(),
        ttl,
        gc_interval: 600,
        retry_interval: 300,
    };
    let cache = SpillCache::open(&cfg).unwrap();
    (dir, cache)
}

fn metric(device_id: &str, secs_ago: i64) -> MetricData {
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
    MetricData {
        device_id: device_id.to_string(),
        device_ip: "10.1.0.5".to_string(),
        timestamp: Utc::now() - ChronoDuration::seconds(secs_ago),
        metrics,
        tags: HashMap::new(),
        quality: Quality::Good,
    }
}

#[test]
fn store_and_read_back() {
    let (_dir, cache) = setup(3600);
    let original = metric("plc-1", 0);
    cache.store(&original).unwrap();

    let entries = cache.get_all().unwrap();
    assert_eq!(entries.len(), 1);
    let (key, decoded) = &entries[0];
    assert!(key.starts_with("metric:plc-1:"));
    assert_eq!(decoded, &original);
}

#[test]
fn store_batch_is_ordered_oldest_first() {
    let (_dir, cache) = setup(3600);
    let batch = vec![metric("plc-1", 5), metric("plc-1", 30), metric("plc-2", 10)];
    assert_eq!(cache.store_batch(&batch).unwrap(), 3);
    assert_eq!(cache.size().unwrap(), 3);

    let entries = cache.get_all().unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.windows(2).all(|w| w[0].1.timestamp <= w[1].1.timestamp));
}

#[test]
fn delete_removes_single_entry() {
    let (_dir, cache) = setup(3600);
    cache.store(&metric("plc-1", 0)).unwrap();

    let entries = cache.get_all().unwrap();
    assert!(cache.delete(&entries[0].0).unwrap());
    assert!(!cache.delete(&entries[0].0).unwrap());
    assert_eq!(cache.size().unwrap(), 0);
}

#[test]
fn replay_preserves_identity() {
    let (_dir, cache) = setup(3600);
    let original = metric("plc-1", 12);
    cache.store(&original).unwrap();

    // Storing the same (device_id, timestamp) twice keeps one entry.
    cache.store(&original).unwrap();
    let entries = cache.get_all().unwrap();
    assert_eq!(entries.len(), 1);

    let replayed = &entries[0].1;
    assert_eq!(replayed.device_id, original.device_id);
    assert_eq!(replayed.timestamp, original.timestamp);
    assert_eq!(replayed.metrics, original.metrics);
}

#[test]
fn expired_entries_are_invisible_and_purged() {
    let (_dir, cache) = setup(0);
    cache.store(&metric("plc-1", 0)).unwrap();

    // TTL of zero: already expired for readers.
    assert!(cache.get_all().unwrap().is_empty());
    assert_eq!(cache.size().unwrap(), 1);

    let removed = cache.purge_expired().unwrap();
    assert_eq!(removed, 1);
    assert_eq!(cache.size().unwrap(), 0);
}

#[test]
fn delete_older_than_uses_collection_time() {
    let (_dir, cache) = setup(3600);
    cache.store(&metric("plc-1", 120)).unwrap();
    cache.store(&metric("plc-1", 0)).unwrap();

    let removed = cache.delete_older_than(Duration::from_secs(60)).unwrap();
    assert_eq!(removed, 1);

    let entries = cache.get_all().unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].1.timestamp > Utc::now() - ChronoDuration::seconds(60));
}

#[tokio::test]
async fn gc_loop_stops_on_cancel() {
    let (_dir, cache) = setup(3600);
    let cancel = tokio_util::sync::CancellationToken::new();
    let token = cancel.clone();

    let cache = std::sync::Arc::new(cache);
    let gc_cache = cache.clone();
    let handle =
        tokio::spawn(async move { gc_cache.run_gc(Duration::from_millis(50), token).await });

    tokio::time::sleep(Duration::from_millis(120)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
