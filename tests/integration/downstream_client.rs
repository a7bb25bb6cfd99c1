//! Downstream HTTP client against a mock monitoring API

use bytes::Bytes;
use transit_agent::clients::GwClient;
use transit_agent::errors::ErrorKind;
use transit_agent::PayloadKind;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::create_test_gw_connection;

async fn mock_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_string("token-1"))
        .mount(server)
        .await;
}

fn client_for(server: &MockServer) -> GwClient {
    GwClient::new(create_test_gw_connection(&server.uri()), "NAGIOS").unwrap()
}

#[tokio::test]
async fn each_kind_hits_its_api_operation() {
    let routes = [
        (PayloadKind::Events, "/api/events"),
        (PayloadKind::EventsAck, "/api/events/ack"),
        (PayloadKind::EventsUnack, "/api/events/unack"),
        (PayloadKind::ClearInDowntime, "/api/biz/clearindowntime"),
        (PayloadKind::SetInDowntime, "/api/biz/setindowntime"),
        (PayloadKind::Metrics, "/api/monitoring"),
        (PayloadKind::Inventory, "/api/synchronizer"),
    ];

    let server = MockServer::start().await;
    mock_login(&server).await;
    for (_, route) in routes {
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
    }

    let client = client_for(&server);
    for (kind, _) in routes {
        client
            .send(kind, Bytes::from_static(b"{}"))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn payload_body_reaches_the_api() {
    let server = MockServer::start().await;
    mock_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/events"))
        .and(body_string_contains("host-42"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client
        .send(
            PayloadKind::Events,
            Bytes::from_static(br#"{"events":[{"host":"host-42"}]}"#),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn expired_token_is_refreshed_once() {
    let server = MockServer::start().await;
    mock_login(&server).await;
    // first delivery rejected, second (after re-login) accepted
    Mock::given(method("POST"))
        .and(path("/api/events"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/events"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_for(&server);
    client
        .send(PayloadKind::Events, Bytes::from_static(b"{}"))
        .await
        .unwrap();
}

#[tokio::test]
async fn rejected_login_is_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .send(PayloadKind::Events, Bytes::from_static(b"{}"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn busy_synchronizer_is_transient() {
    let server = MockServer::start().await;
    mock_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/synchronizer"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .send(PayloadKind::Inventory, Bytes::from_static(b"{}"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
}
