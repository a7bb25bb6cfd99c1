//! Agent lifecycle through the task queue (no broker required)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use transit_agent::config::Connector;
use transit_agent::errors::ErrorKind;
use transit_agent::service::AgentService;

use crate::helpers::create_test_connector;

#[tokio::test]
async fn lifecycle_ops_are_serialized_and_idempotent() {
    let agent = AgentService::new(create_test_connector());

    // stop before start is a no-op, not an error
    agent.stop_transport().await.unwrap();
    agent.stop_nats().await.unwrap();

    agent.start_controller().await.unwrap();
    agent.start_controller().await.unwrap();
    let status = agent.status().await;
    assert!(status.controller);
    assert!(!status.nats);
    assert!(!status.transport);

    agent.exit().await.unwrap();
    agent.quit().await;
    assert!(!agent.status().await.controller);
}

#[tokio::test]
async fn async_variants_return_awaitable_handles() {
    let agent = AgentService::new(create_test_connector());

    let handle = agent.start_controller_async().unwrap();
    handle.done().await.unwrap();
    assert!(agent.status().await.controller);

    let handle = agent.stop_controller_async().unwrap();
    handle.done().await.unwrap();
    assert!(!agent.status().await.controller);
}

#[tokio::test]
async fn transport_without_broker_fails_cleanly() {
    let agent = AgentService::new(create_test_connector());
    assert!(agent.start_transport().await.is_err());
    // the queue worker survives the failed task
    agent.start_controller().await.unwrap();
}

#[tokio::test]
async fn unchanged_broker_config_does_not_touch_the_broker() {
    let agent = AgentService::new(create_test_connector());
    let applied = Arc::new(AtomicUsize::new(0));
    let applied_handler = Arc::clone(&applied);
    agent.on_config(Arc::new(move |_connector: &Connector| {
        applied_handler.fetch_add(1, Ordering::SeqCst);
    }));

    // only batching and suppression change; checksum stays the same
    let mut updated = create_test_connector();
    updated.batch_events_secs = 30;
    updated.suppress.metrics = true;
    agent.config(updated).await.unwrap();

    assert_eq!(applied.load(Ordering::SeqCst), 1);
    assert!(!agent.status().await.nats);
}

#[tokio::test]
async fn changed_broker_config_is_applied_when_idle() {
    let agent = AgentService::new(create_test_connector());

    let mut updated = create_test_connector();
    updated.nats.server_url = "nats://other-broker:4222".into();
    agent.config(updated).await.unwrap();

    // nothing was running, so nothing restarts; the config is live
    let status = agent.status().await;
    assert!(!status.nats);
    assert!(!status.transport);
}

#[tokio::test]
async fn suppression_switches_are_honored_after_reload() {
    let agent = AgentService::new(create_test_connector());
    let transit = agent.transit();

    // without a broker a real send fails
    let err = transit
        .send_events(Bytes::from_static(b"{\"events\":[]}"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);

    let mut updated = create_test_connector();
    updated.suppress.events = true;
    agent.config(updated).await.unwrap();

    // suppressed sends short-circuit before the broker is consulted
    transit
        .send_events(Bytes::from_static(b"{\"events\":[]}"))
        .await
        .unwrap();
}

#[tokio::test]
async fn exit_runs_registered_handlers_in_order() {
    let agent = AgentService::new(create_test_connector());
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["first", "second"] {
        let order = Arc::clone(&order);
        agent.on_exit(Arc::new(move || {
            order.lock().unwrap().push(name);
        }));
    }

    agent.exit().await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}
