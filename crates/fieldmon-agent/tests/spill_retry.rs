mod common;

use common::{sim_device, test_config, MockSink};
use fieldmon_agent::Agent;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread")]
async fn sink_outage_spills_then_retry_drains() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let sink = MockSink::failing();

    let agent = Arc::new(
        Agent::with_sink(config, vec![sim_device("plc-001", 1)], sink.clone()).unwrap(),
    );
    agent.start().await.unwrap();

    // Collects flow, every flush fails, batches land in the spill cache.
    tokio::time::sleep(Duration::from_millis(2600)).await;
    assert_eq!(sink.record_count(), 0);
    let spilled = agent.spill_size();
    assert!(spilled >= 1, "expected spill entries, got {spilled}");
    let stats = agent.batcher_stats();
    assert!(stats.flush_errors >= 1);
    assert!(stats.items_spilled >= 1);

    // Sink recovers; the 1 s retry loop drains the cache entry by entry.
    sink.set_should_fail(false);
    tokio::time::sleep(Duration::from_millis(3000)).await;

    assert_eq!(agent.spill_size(), 0, "spill cache should be drained");
    assert!(sink.record_count() >= 1);

    agent.stop().await;
    assert_eq!(agent.batcher_stats().items_lost, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_with_hung_sink_spills_final_batch() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let sink = MockSink::failing();

    let agent = Arc::new(
        Agent::with_sink(config, vec![sim_device("plc-001", 1)], sink.clone()).unwrap(),
    );
    agent.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    agent.stop().await;

    // Nothing reached the sink and nothing was dropped: everything the
    // batcher accepted is in the spill cache.
    assert_eq!(sink.record_count(), 0);
    let stats = agent.batcher_stats();
    assert_eq!(stats.items_lost, 0);
    assert_eq!(stats.items_flushed, 0);
    assert_eq!(stats.items_spilled, stats.items_received);
    assert!(agent.spill_size() >= 1);
}
