use std::hash::{Hash, Hasher};
use std::time::Duration;

use tracing::trace;

/// Placeholder agent id used until a real config is applied.
pub const UNDEFINED_AGENT_ID: &str = "#AGENTID#";
/// Placeholder application type used until a real config is applied.
pub const UNDEFINED_APP_TYPE: &str = "#APPTYPE#";

/// Connection settings for one downstream monitoring server
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct GwConnection {
    pub host_name: String,
    pub user_name: String,
    pub password: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds before a downstream request is abandoned
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

/// Broker (JetStream) settings
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_url")]
    pub server_url: String,

    #[serde(default = "default_stream_name")]
    pub stream_name: String,

    /// Hard limit on a single broker message; larger payloads are
    /// gzip-compressed and rejected if still over the limit
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,

    /// Seconds the broker waits for an ack before redelivering
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,

    /// Unacked messages a durable consumer may hold at once
    #[serde(default = "default_max_inflight")]
    pub max_inflight: i64,

    /// Keep queued payloads on disk (`true`) or in memory only
    #[serde(default = "default_file_store")]
    pub file_store: bool,

    /// Retention for queued payloads, in seconds (0 keeps them until acked)
    #[serde(default)]
    pub max_age_secs: u64,
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".into()
}

fn default_stream_name() -> String {
    "transit".into()
}

fn default_max_payload() -> usize {
    1024 * 1024
}

fn default_ack_wait_secs() -> u64 {
    30
}

fn default_max_inflight() -> i64 {
    1
}

fn default_file_store() -> bool {
    true
}

impl NatsConfig {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            server_url: default_nats_url(),
            stream_name: default_stream_name(),
            max_payload: default_max_payload(),
            ack_wait_secs: default_ack_wait_secs(),
            max_inflight: default_max_inflight(),
            file_store: default_file_store(),
            max_age_secs: 0,
        }
    }
}

/// Per-kind suppression switches; suppressed payloads are dropped at the
/// orchestrator boundary before they reach the broker
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct Suppress {
    #[serde(default)]
    pub events: bool,
    #[serde(default)]
    pub metrics: bool,
    #[serde(default)]
    pub inventory: bool,
    #[serde(default)]
    pub downtimes: bool,
}

impl Suppress {
    /// Environment variables win over the config file
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(flag) = crate::util::get_suppress_events() {
            self.events = flag;
        }
        if let Some(flag) = crate::util::get_suppress_metrics() {
            self.metrics = flag;
        }
        if let Some(flag) = crate::util::get_suppress_inventory() {
            self.inventory = flag;
        }
        if let Some(flag) = crate::util::get_suppress_downtimes() {
            self.downtimes = flag;
        }
        self
    }
}

/// Full agent configuration, reloadable at runtime
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Connector {
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    #[serde(default = "default_app_type")]
    pub app_type: String,

    #[serde(default)]
    pub gw_connections: Vec<GwConnection>,

    #[serde(default)]
    pub nats: NatsConfig,

    /// Seconds between event-batch flushes (0 disables event batching)
    #[serde(default)]
    pub batch_events_secs: u64,

    /// Seconds between metric-batch flushes (0 disables metric batching)
    #[serde(default)]
    pub batch_metrics_secs: u64,

    /// Flush a batch early once its buffered inputs reach this many bytes
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: usize,

    /// Seconds before a lifecycle task triggers the stuck-task alarm
    #[serde(default = "default_task_alarm_secs")]
    pub task_alarm_secs: u64,

    #[serde(default)]
    pub suppress: Suppress,
}

fn default_agent_id() -> String {
    UNDEFINED_AGENT_ID.into()
}

fn default_app_type() -> String {
    UNDEFINED_APP_TYPE.into()
}

fn default_batch_max_bytes() -> usize {
    1024 * 1024
}

fn default_task_alarm_secs() -> u64 {
    60
}

impl Default for Connector {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            app_type: default_app_type(),
            gw_connections: Vec::new(),
            nats: NatsConfig::default(),
            batch_events_secs: 0,
            batch_metrics_secs: 0,
            batch_max_bytes: default_batch_max_bytes(),
            task_alarm_secs: default_task_alarm_secs(),
            suppress: Suppress::default(),
        }
    }
}

impl Connector {
    pub fn batch_events(&self) -> Duration {
        Duration::from_secs(self.batch_events_secs)
    }

    pub fn batch_metrics(&self) -> Duration {
        Duration::from_secs(self.batch_metrics_secs)
    }

    pub fn task_alarm(&self) -> Duration {
        Duration::from_secs(self.task_alarm_secs)
    }

    /// Checksum over the broker-relevant subset of the config.
    ///
    /// A reload whose checksum matches the running config leaves the broker
    /// untouched and only restarts the transport.
    pub fn broker_checksum(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.agent_id.hash(&mut hasher);
        self.app_type.hash(&mut hasher);
        self.nats.hash(&mut hasher);
        hasher.finish()
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Connector> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|err| anyhow::anyhow!("invalid configuration file: {err}"))
        .map(|connector: Connector| Connector {
            suppress: connector.suppress.with_env_overrides(),
            ..connector
        })
        .inspect(|connector| trace!("loaded config: {connector:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_apply() {
        let connector = Connector::default();
        assert_eq!(connector.agent_id, UNDEFINED_AGENT_ID);
        assert_eq!(connector.nats.stream_name, "transit");
        assert_eq!(connector.nats.max_inflight, 1);
        assert!(connector.nats.file_store);
        assert_eq!(connector.batch_max_bytes, 1024 * 1024);
        assert_eq!(connector.batch_events_secs, 0);
    }

    #[test]
    fn checksum_ignores_batching_changes() {
        let base = Connector::default();
        let mut changed = base.clone();
        changed.batch_events_secs = 30;
        changed.suppress.events = true;
        assert_eq!(base.broker_checksum(), changed.broker_checksum());
    }

    #[test]
    fn checksum_tracks_broker_changes() {
        let base = Connector::default();

        let mut changed = base.clone();
        changed.nats.server_url = "nats://10.0.0.1:4222".into();
        assert_ne!(base.broker_checksum(), changed.broker_checksum());

        let mut changed = base.clone();
        changed.agent_id = "agent-1".into();
        assert_ne!(base.broker_checksum(), changed.broker_checksum());
    }

    #[test]
    fn parse_config_json() {
        let connector: Connector = serde_json::from_str(
            r#"{
                "agent_id": "agent-1",
                "app_type": "NAGIOS",
                "gw_connections": [
                    {"host_name": "https://gw.example", "user_name": "u", "password": "p"}
                ],
                "nats": {"server_url": "nats://broker:4222"},
                "batch_events_secs": 15
            }"#,
        )
        .unwrap();

        assert_eq!(connector.agent_id, "agent-1");
        assert_eq!(connector.gw_connections.len(), 1);
        assert!(connector.gw_connections[0].enabled);
        assert_eq!(connector.nats.server_url, "nats://broker:4222");
        assert_eq!(connector.batch_events().as_secs(), 15);
    }
}
