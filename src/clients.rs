//! HTTP client for the downstream monitoring API
//!
//! One client per configured downstream connection, holding a reused
//! `reqwest::Client` and a cached auth token. This is the single place
//! where delivery failures are classified into the [`ErrorKind`] taxonomy.

use bytes::Bytes;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::GwConnection;
use crate::errors::{DeliveryError, DeliveryResult, ErrorKind};
use crate::PayloadKind;

const HEADER_TOKEN: &str = "GWOS-API-TOKEN";
const HEADER_APP_NAME: &str = "GWOS-APP-NAME";

const LOGIN_PATH: &str = "/api/auth/login";
const EVENTS_PATH: &str = "/api/events";
const EVENTS_ACK_PATH: &str = "/api/events/ack";
const EVENTS_UNACK_PATH: &str = "/api/events/unack";
const DOWNTIME_CLEAR_PATH: &str = "/api/biz/clearindowntime";
const DOWNTIME_SET_PATH: &str = "/api/biz/setindowntime";
const MONITORING_PATH: &str = "/api/monitoring";
const SYNCHRONIZER_PATH: &str = "/api/synchronizer";

/// Client for one downstream connection
pub struct GwClient {
    connection: GwConnection,
    app_name: String,
    http: reqwest::Client,
    token: Mutex<Option<String>>,
}

impl GwClient {
    pub fn new(connection: GwConnection, app_name: impl Into<String>) -> DeliveryResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(connection.timeout_secs))
            .build()
            .map_err(|err| DeliveryError::undecided(err.to_string()))?;

        Ok(Self {
            connection,
            app_name: app_name.into(),
            http,
            token: Mutex::new(None),
        })
    }

    pub fn host_name(&self) -> &str {
        &self.connection.host_name
    }

    /// Route a payload to the API operation matching its kind
    pub async fn send(&self, kind: PayloadKind, payload: Bytes) -> DeliveryResult<()> {
        let path = match kind {
            PayloadKind::Events => EVENTS_PATH,
            PayloadKind::EventsAck => EVENTS_ACK_PATH,
            PayloadKind::EventsUnack => EVENTS_UNACK_PATH,
            PayloadKind::ClearInDowntime => DOWNTIME_CLEAR_PATH,
            PayloadKind::SetInDowntime => DOWNTIME_SET_PATH,
            PayloadKind::Metrics => MONITORING_PATH,
            PayloadKind::Inventory => SYNCHRONIZER_PATH,
        };
        self.post(path, payload).await
    }

    async fn post(&self, path: &str, payload: Bytes) -> DeliveryResult<()> {
        let token = self.token().await?;
        let url = format!("{}{}", self.connection.host_name, path);

        let response = self
            .http
            .post(&url)
            .header(HEADER_TOKEN, &token)
            .header(HEADER_APP_NAME, &self.app_name)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.clone())
            .send()
            .await
            .map_err(classify_transport_error)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            // cached token may have expired; re-login once
            debug!(url, "token rejected, re-authenticating");
            self.token.lock().await.take();
            let token = self.token().await?;
            let response = self
                .http
                .post(&url)
                .header(HEADER_TOKEN, &token)
                .header(HEADER_APP_NAME, &self.app_name)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(payload)
                .send()
                .await
                .map_err(classify_transport_error)?;
            return classify_response(response).await;
        }

        classify_response(response).await
    }

    async fn token(&self) -> DeliveryResult<String> {
        let mut token = self.token.lock().await;
        if let Some(token) = token.as_ref() {
            return Ok(token.clone());
        }

        let url = format!("{}{}", self.connection.host_name, LOGIN_PATH);
        let response = self
            .http
            .post(&url)
            .header(HEADER_APP_NAME, &self.app_name)
            .form(&[
                ("user", self.connection.user_name.as_str()),
                ("password", self.connection.password.as_str()),
                ("gwos-app-name", self.app_name.as_str()),
            ])
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(DeliveryError::unauthorized(format!(
                "login rejected by {}",
                self.connection.host_name
            )));
        }
        if !status.is_success() {
            return Err(classify_status(status, "login"));
        }

        let fresh = response
            .text()
            .await
            .map_err(classify_transport_error)?
            .trim()
            .to_string();
        if fresh.is_empty() {
            return Err(DeliveryError::undecided("login returned an empty token"));
        }

        *token = Some(fresh.clone());
        Ok(fresh)
    }
}

async fn classify_response(response: reqwest::Response) -> DeliveryResult<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    warn!(%status, body, "downstream rejected payload");
    Err(classify_status(status, &body))
}

fn classify_status(status: StatusCode, detail: &str) -> DeliveryError {
    let kind = match status {
        StatusCode::UNAUTHORIZED => ErrorKind::Unauthorized,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            ErrorKind::Transient
        }
        _ => ErrorKind::Undecided,
    };
    DeliveryError::new(kind, format!("{status}: {detail}"))
}

fn classify_transport_error(err: reqwest::Error) -> DeliveryError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        DeliveryError::transient(err.to_string())
    } else {
        DeliveryError::undecided(err.to_string())
    }
}
