//! Agent orchestration
//!
//! [`AgentService`] owns the runtime: every lifecycle transition runs as a
//! task on the single-consumer queue, so starts, stops, config swaps and
//! dispatcher retries never interleave. [`TransitService`] is the sending
//! facade handed to payload producers.

pub mod agent;
pub mod transit;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::nats::DispatcherOption;
use crate::transit::Timestamp;

pub use agent::AgentService;
pub use transit::TransitService;

/// Lifecycle operations accepted by the agent task queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Config,
    Exit,
    ResetNats,
    StartController,
    StopController,
    StartNats,
    StopNats,
    StartTransport,
    StopTransport,
    RetryDurable,
}

/// Arguments travelling with a lifecycle task
pub enum TaskArgs {
    None,
    Config(crate::config::Connector),
    Retry(DispatcherOption),
}

impl std::fmt::Debug for TaskArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskArgs::None => write!(f, "None"),
            TaskArgs::Config(_) => write!(f, "Config"),
            TaskArgs::Retry(opt) => write!(f, "Retry({})", opt.durable),
        }
    }
}

const LAST_ERRORS_CAP: usize = 10;

/// Delivery counters, updated from the dispatch path
pub struct Stats {
    pub messages_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub metrics_sent: AtomicU64,
    last_errors: Mutex<VecDeque<String>>,
    up_since: Timestamp,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            metrics_sent: AtomicU64::new(0),
            last_errors: Mutex::new(VecDeque::with_capacity(LAST_ERRORS_CAP)),
            up_since: Timestamp::now(),
        }
    }

    pub fn record_sent(&self, bytes: usize, is_metrics: bool) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        if is_metrics {
            self.metrics_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self, error: impl Into<String>) {
        let mut last_errors = self.last_errors.lock().unwrap();
        if last_errors.len() == LAST_ERRORS_CAP {
            last_errors.pop_front();
        }
        last_errors.push_back(error.into());
    }

    pub fn snapshot(&self) -> AgentStats {
        AgentStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            metrics_sent: self.metrics_sent.load(Ordering::Relaxed),
            last_errors: self.last_errors.lock().unwrap().iter().cloned().collect(),
            up_since: self.up_since,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the delivery counters
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub metrics_sent: u64,
    pub last_errors: Vec<String>,
    pub up_since: Timestamp,
}

/// Which subsystems are currently running
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub controller: bool,
    pub nats: bool,
    pub transport: bool,
}
