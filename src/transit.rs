//! Transit payload shapes for the downstream monitoring API
//!
//! Payloads cross the engine as opaque JSON; these types model just enough
//! structure for batching, tracer-context handling, and time
//! reconciliation. Unknown fields are preserved through `serde(flatten)`
//! so the engine never strips data it does not understand.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

pub const VERSION: &str = "1.0.0";

/// Millisecond UTC timestamp, serialized as an integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0).single()
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        i64::deserialize(deserializer).map(Timestamp)
    }
}

/// Provenance attached to every outgoing request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracerContext {
    pub agent_id: String,
    pub app_type: String,
    pub time_stamp: Timestamp,
    pub trace_token: String,
    pub version: String,
}

static TRACE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Mint a process-unique trace token
pub fn make_trace_token() -> String {
    let counter = TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", Uuid::new_v4(), counter)
}

impl TracerContext {
    /// Mint a context with a fresh trace token
    pub fn new(agent_id: impl Into<String>, app_type: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            app_type: app_type.into(),
            time_stamp: Timestamp::now(),
            trace_token: make_trace_token(),
            version: VERSION.into(),
        }
    }
}

/// Batch of events; individual events stay schemaless
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventsRequest {
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroup {
    #[serde(rename = "type")]
    pub group_type: String,
    pub group_name: String,

    #[serde(flatten)]
    pub rest: BTreeMap<String, serde_json::Value>,
}

impl ResourceGroup {
    /// Grouping identity used by the metrics batcher
    pub fn group_key(&self) -> String {
        format!("{}:{}", self.group_type, self.group_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredService {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check_time: Option<Timestamp>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_check_time: Option<Timestamp>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_plugin_output: Option<String>,

    #[serde(flatten)]
    pub rest: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredResource {
    pub name: String,

    #[serde(rename = "type", default)]
    pub resource_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check_time: Option<Timestamp>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_check_time: Option<Timestamp>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_plugin_output: Option<String>,

    #[serde(default)]
    pub services: Vec<MonitoredService>,

    #[serde(flatten)]
    pub rest: BTreeMap<String, serde_json::Value>,
}

/// Metrics/inventory request: resources plus their group memberships
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcesWithServicesRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<TracerContext>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<ResourceGroup>,

    #[serde(default)]
    pub resources: Vec<MonitoredResource>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn timestamp_serializes_as_millis() {
        let ts = Timestamp(1_700_000_000_123);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "1700000000123");
        let back: Timestamp = serde_json::from_str("1700000000123").unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn tracer_tokens_are_unique() {
        let a = TracerContext::new("agent-1", "NAGIOS");
        let b = TracerContext::new("agent-1", "NAGIOS");
        assert_ne!(a.trace_token, b.trace_token);
        assert_eq!(a.version, VERSION);
    }

    #[test]
    fn unknown_fields_survive_roundtrip() {
        let json = r#"{
            "name": "host-1",
            "type": "host",
            "status": "HOST_UP",
            "services": [
                {"name": "cpu", "status": "SERVICE_OK", "lastCheckTime": 1700000000000}
            ]
        }"#;
        let resource: MonitoredResource = serde_json::from_str(json).unwrap();
        assert_eq!(
            resource.rest.get("status"),
            Some(&serde_json::json!("HOST_UP"))
        );
        assert_eq!(resource.services[0].last_check_time, Some(Timestamp(1_700_000_000_000)));

        let out = serde_json::to_value(&resource).unwrap();
        assert_eq!(out["status"], "HOST_UP");
        assert_eq!(out["services"][0]["status"], "SERVICE_OK");
    }

    #[test]
    fn group_key_format() {
        let group = ResourceGroup {
            group_type: "HostGroup".into(),
            group_name: "linux".into(),
            rest: BTreeMap::new(),
        };
        assert_eq!(group.group_key(), "HostGroup:linux");
    }
}
