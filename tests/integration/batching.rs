//! End-to-end batching behavior through the batcher actor

use std::time::Duration;

use bytes::Bytes;
use transit_agent::batcher::{BatcherHandle, EventsBatchBuilder, MetricsBatchBuilder};
use transit_agent::PayloadKind;

use crate::helpers::*;

#[tokio::test(start_paused = true)]
async fn events_accumulate_until_the_tick() {
    let (sink, collected) = collecting_sink();
    let batcher = BatcherHandle::spawn(
        Box::new(EventsBatchBuilder::new(1024 * 1024)),
        Duration::from_secs(10),
        1024 * 1024,
        sink,
    );

    assert!(batcher.add(events_payload(&["host-1", "host-2", "host-3", "host-4"])));
    assert!(batcher.add(events_payload(&["host-5"])));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(collected.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(6)).await;
    let collected = collected.lock().unwrap();
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].0, PayloadKind::Events);
    assert_eq!(
        event_hosts(&collected[0].1),
        vec!["host-1", "host-2", "host-3", "host-4", "host-5"]
    );
}

#[tokio::test]
async fn oversized_submission_leaves_as_multiple_batches() {
    let (sink, collected) = collecting_sink();
    let small = events_payload(&["host-1"]);
    let max_bytes = small.len() * 3;
    let batcher = BatcherHandle::spawn(
        Box::new(EventsBatchBuilder::new(max_bytes)),
        Duration::ZERO,
        max_bytes,
        sink,
    );

    let big = events_payload(&[
        "host-01", "host-02", "host-03", "host-04", "host-05", "host-06", "host-07", "host-08",
        "host-09", "host-10", "host-11", "host-12",
    ]);
    assert!(big.len() > max_bytes);
    assert!(batcher.add(big));
    batcher.exit().await;

    let collected = collected.lock().unwrap();
    assert!(collected.len() > 1, "oversized input must be split");

    let all_hosts: Vec<String> = collected
        .iter()
        .flat_map(|(_, batch)| event_hosts(batch))
        .collect();
    let expected: Vec<String> = (1..=12).map(|n| format!("host-{n:02}")).collect();
    assert_eq!(all_hosts, expected);
}

#[tokio::test]
async fn exit_flushes_whatever_is_buffered() {
    let (sink, collected) = collecting_sink();
    let batcher = BatcherHandle::spawn(
        Box::new(EventsBatchBuilder::new(1024 * 1024)),
        Duration::from_secs(3600),
        1024 * 1024,
        sink,
    );

    assert!(batcher.add(events_payload(&["host-1"])));
    batcher.exit().await;

    assert_eq!(collected.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reset_applies_new_interval() {
    let (sink, collected) = collecting_sink();
    let batcher = BatcherHandle::spawn(
        Box::new(EventsBatchBuilder::new(1024 * 1024)),
        Duration::from_secs(3600),
        1024 * 1024,
        sink,
    );

    assert!(batcher.add(events_payload(&["host-1"])));
    batcher.reset(Duration::from_secs(2), 1024 * 1024).await;
    // reset flushed the pending buffer
    assert_eq!(collected.lock().unwrap().len(), 1);

    assert!(batcher.add(events_payload(&["host-2"])));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(collected.lock().unwrap().len(), 2);

    batcher.exit().await;
}

#[tokio::test]
async fn metrics_batches_per_group_key_set() {
    let (sink, collected) = collecting_sink();
    let batcher = BatcherHandle::spawn(
        Box::new(MetricsBatchBuilder::new()),
        Duration::ZERO,
        1024 * 1024,
        sink,
    );

    let linux = serde_json::json!({
        "groups": [{"type": "HostGroup", "groupName": "linux"}],
        "resources": [{"name": "host-1", "type": "host"}]
    });
    let also_linux = serde_json::json!({
        "groups": [{"type": "HostGroup", "groupName": "linux"}],
        "resources": [{"name": "host-2", "type": "host"}]
    });
    let windows = serde_json::json!({
        "groups": [{"type": "HostGroup", "groupName": "windows"}],
        "resources": [{"name": "host-3", "type": "host"}]
    });
    for payload in [&linux, &also_linux, &windows] {
        assert!(batcher.add(Bytes::from(serde_json::to_vec(payload).unwrap())));
    }
    batcher.exit().await;

    let collected = collected.lock().unwrap();
    assert_eq!(collected.len(), 2);
    assert!(collected.iter().all(|(kind, _)| *kind == PayloadKind::Metrics));

    let resource_counts: Vec<usize> = collected
        .iter()
        .map(|(_, batch)| {
            let value: serde_json::Value = serde_json::from_slice(batch).unwrap();
            value["resources"].as_array().unwrap().len()
        })
        .collect();
    let mut sorted = resource_counts.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![1, 2]);
}
