//! JetStream broker layer
//!
//! Outgoing payloads are published to one stream (`{stream}.{kind}`
//! subjects) with the payload kind, original length, gzip marker and trace
//! token carried in message headers. Payloads over the broker limit are
//! gzip-compressed; if still too large they are rejected with a capacity
//! error instead of being queued.

pub mod dispatcher;

use std::io::{Read, Write};

use async_nats::jetstream::{self, stream, Context as JetStreamContext};
use async_nats::{Client, ConnectOptions, HeaderMap};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info};

use crate::config::NatsConfig;
use crate::errors::{DeliveryError, DeliveryResult};
use crate::{Envelope, PayloadKind};

pub use dispatcher::{DispatchHandler, DispatcherOption, DurableDispatcher, RETRY_DELAYS};

const HEADER_PAYLOAD_TYPE: &str = "payload-type";
const HEADER_PAYLOAD_LEN: &str = "payload-len";
const HEADER_COMPRESSED: &str = "compressed";
const HEADER_TRACE_TOKEN: &str = "trace-token";

const CLIENT_NAME: &str = "transit-agent";

/// Live connection to the broker plus its JetStream stream
pub struct BrokerConnection {
    config: NatsConfig,
    client: Client,
    jetstream: JetStreamContext,
}

impl BrokerConnection {
    /// Connect and make sure the delivery stream exists
    pub async fn connect(config: NatsConfig) -> DeliveryResult<Self> {
        info!(url = %config.server_url, "connecting to broker");
        let options = ConnectOptions::new().name(CLIENT_NAME);
        let client = async_nats::connect_with_options(config.server_url.clone(), options)
            .await
            .map_err(|err| DeliveryError::transient(err.to_string()))?;
        let jetstream = jetstream::new(client.clone());

        let connection = Self {
            config,
            client,
            jetstream,
        };
        connection.ensure_stream().await?;
        Ok(connection)
    }

    async fn ensure_stream(&self) -> DeliveryResult<()> {
        let storage = if self.config.file_store {
            stream::StorageType::File
        } else {
            stream::StorageType::Memory
        };
        let stream_config = stream::Config {
            name: self.config.stream_name.clone(),
            subjects: vec![format!("{}.>", self.config.stream_name)],
            storage,
            max_age: std::time::Duration::from_secs(self.config.max_age_secs),
            ..Default::default()
        };

        match self.jetstream.get_stream(&self.config.stream_name).await {
            Ok(_) => {
                debug!(stream = %self.config.stream_name, "using existing stream");
                Ok(())
            }
            Err(_) => {
                info!(stream = %self.config.stream_name, "creating stream");
                self.jetstream
                    .create_stream(stream_config)
                    .await
                    .map(|_| ())
                    .map_err(|err| DeliveryError::transient(err.to_string()))
            }
        }
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    pub(crate) fn jetstream(&self) -> &JetStreamContext {
        &self.jetstream
    }

    pub fn subject_for(&self, kind: PayloadKind) -> String {
        format!("{}.{}", self.config.stream_name, kind)
    }

    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    /// Queue a payload on the stream; returns once the broker has stored it
    pub async fn publish(
        &self,
        kind: PayloadKind,
        payload: Bytes,
        trace_token: &str,
    ) -> DeliveryResult<()> {
        let (headers, body) =
            encode_payload(kind, payload, self.config.max_payload, trace_token)?;
        let subject = self.subject_for(kind);

        let ack = self
            .jetstream
            .publish_with_headers(subject.clone(), headers, body)
            .await
            .map_err(|err| DeliveryError::transient(err.to_string()))?;
        ack.await
            .map_err(|err| DeliveryError::transient(err.to_string()))?;

        debug!(%subject, trace_token, "payload queued");
        Ok(())
    }

    /// Drop all queued payloads but keep the stream
    pub async fn purge(&self) -> DeliveryResult<()> {
        let stream = self
            .jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|err| DeliveryError::transient(err.to_string()))?;
        stream
            .purge()
            .await
            .map_err(|err| DeliveryError::transient(err.to_string()))?;
        info!(stream = %self.config.stream_name, "stream purged");
        Ok(())
    }

    /// Drain the connection; queued payloads stay on the broker
    pub async fn stop(&self) -> DeliveryResult<()> {
        self.client
            .drain()
            .await
            .map_err(|err| DeliveryError::transient(err.to_string()))?;
        info!("broker connection closed");
        Ok(())
    }
}

/// Build the headers and (possibly compressed) body for one payload
pub fn encode_payload(
    kind: PayloadKind,
    payload: Bytes,
    max_payload: usize,
    trace_token: &str,
) -> DeliveryResult<(HeaderMap, Bytes)> {
    let original_len = payload.len();
    let mut headers = HeaderMap::new();
    headers.insert(HEADER_PAYLOAD_TYPE, kind.as_str());
    headers.insert(HEADER_PAYLOAD_LEN, original_len.to_string().as_str());
    headers.insert(HEADER_TRACE_TOKEN, trace_token);

    if original_len <= max_payload {
        return Ok((headers, payload));
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&payload)?;
    let compressed = encoder.finish()?;
    if compressed.len() > max_payload {
        return Err(DeliveryError::capacity(format!(
            "payload of {} bytes exceeds broker limit of {} even compressed",
            original_len, max_payload
        )));
    }

    debug!(
        original_len,
        compressed_len = compressed.len(),
        "payload compressed for broker"
    );
    headers.insert(HEADER_COMPRESSED, "gzip");
    Ok((headers, Bytes::from(compressed)))
}

/// Reverse of [`encode_payload`] on the consumer side
pub fn decode_message(headers: Option<&HeaderMap>, payload: &Bytes) -> DeliveryResult<Envelope> {
    let headers =
        headers.ok_or_else(|| DeliveryError::undecided("broker message carries no headers"))?;

    let kind: PayloadKind = headers
        .get(HEADER_PAYLOAD_TYPE)
        .ok_or_else(|| DeliveryError::undecided("missing payload-type header"))?
        .as_str()
        .parse()?;

    let body = if headers.get(HEADER_COMPRESSED).is_some() {
        let mut decoder = GzDecoder::new(payload.as_ref());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|err| DeliveryError::undecided(format!("gzip decode failed: {err}")))?;
        Bytes::from(decompressed)
    } else {
        payload.clone()
    };

    Ok(Envelope::new(kind, body))
}

/// Trace token carried by a broker message, if any
pub fn message_trace_token(headers: Option<&HeaderMap>) -> Option<String> {
    headers
        .and_then(|headers| headers.get(HEADER_TRACE_TOKEN))
        .map(|value| value.as_str().to_string())
}
