pub mod batcher;
pub mod cache;
pub mod clients;
pub mod config;
pub mod errors;
pub mod nats;
pub mod service;
pub mod taskqueue;
pub mod transit;
pub mod util;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::errors::{DeliveryError, ErrorKind};

/// Kind of a payload travelling through the delivery engine.
///
/// The kind is carried out-of-band in broker message headers and selects
/// the downstream API operation at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Events,
    EventsAck,
    EventsUnack,
    ClearInDowntime,
    SetInDowntime,
    Inventory,
    Metrics,
}

impl PayloadKind {
    pub const ALL: [PayloadKind; 7] = [
        PayloadKind::Events,
        PayloadKind::EventsAck,
        PayloadKind::EventsUnack,
        PayloadKind::ClearInDowntime,
        PayloadKind::SetInDowntime,
        PayloadKind::Inventory,
        PayloadKind::Metrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Events => "events",
            PayloadKind::EventsAck => "events-ack",
            PayloadKind::EventsUnack => "events-unack",
            PayloadKind::ClearInDowntime => "downtime-clear",
            PayloadKind::SetInDowntime => "downtime-set",
            PayloadKind::Inventory => "inventory",
            PayloadKind::Metrics => "metrics",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadKind {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "events" => Ok(PayloadKind::Events),
            "events-ack" => Ok(PayloadKind::EventsAck),
            "events-unack" => Ok(PayloadKind::EventsUnack),
            "downtime-clear" => Ok(PayloadKind::ClearInDowntime),
            "downtime-set" => Ok(PayloadKind::SetInDowntime),
            "inventory" => Ok(PayloadKind::Inventory),
            "metrics" => Ok(PayloadKind::Metrics),
            other => Err(DeliveryError::new(
                ErrorKind::Undecided,
                format!("unknown payload kind: {other}"),
            )),
        }
    }
}

/// Wire envelope handed to dispatcher handlers.
///
/// Built from a broker message after header parsing and decompression.
/// The payload is the original JSON submitted at the orchestrator boundary.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: PayloadKind,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(kind: PayloadKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}
