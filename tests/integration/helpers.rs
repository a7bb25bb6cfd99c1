//! Helper functions for integration tests

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use transit_agent::batcher::BatchSink;
use transit_agent::config::{Connector, GwConnection};
use transit_agent::PayloadKind;

pub fn create_test_connector() -> Connector {
    let mut connector = Connector::default();
    connector.agent_id = "agent-test".into();
    connector.app_type = "NAGIOS".into();
    connector
}

pub fn create_test_gw_connection(uri: &str) -> GwConnection {
    GwConnection {
        host_name: uri.to_string(),
        user_name: "test-user".into(),
        password: "test-password".into(),
        enabled: true,
        timeout_secs: 5,
    }
}

pub fn events_payload(names: &[&str]) -> Bytes {
    let events: Vec<_> = names
        .iter()
        .map(|name| serde_json::json!({"host": name}))
        .collect();
    Bytes::from(serde_json::to_vec(&serde_json::json!({"events": events})).unwrap())
}

pub fn event_hosts(batch: &Bytes) -> Vec<String> {
    let value: serde_json::Value = serde_json::from_slice(batch).unwrap();
    value["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|event| event["host"].as_str().unwrap().to_string())
        .collect()
}

/// Sink collecting flushed batches in memory
pub fn collecting_sink() -> (BatchSink, Arc<Mutex<Vec<(PayloadKind, Bytes)>>>) {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let inner = Arc::clone(&collected);
    let sink: BatchSink = Arc::new(move |kind, batch| {
        let inner = Arc::clone(&inner);
        Box::pin(async move {
            inner.lock().unwrap().push((kind, batch));
            Ok(())
        })
    });
    (sink, collected)
}
