//! Durable dispatch from the broker to the downstream client
//!
//! One durable pull consumer per payload kind. Delivery is at-least-once,
//! so a TTL'd dedup cache keyed by `{durable}#{stream_sequence}` keeps
//! redeliveries from reaching the downstream twice. Transient failures
//! close the durable and schedule a reopen on an escalating delay table;
//! once the table is exhausted the durable stays closed until the next
//! transport restart.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nats::jetstream::consumer;
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::cache::TtlCache;
use crate::errors::{DeliveryError, DeliveryResult, ErrorKind};
use crate::nats::{decode_message, message_trace_token, BrokerConnection};
use crate::Envelope;

/// Escalating delays before a failed durable is reopened
pub const RETRY_DELAYS: [Duration; 4] = [
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(300),
    Duration::from_secs(1200),
];

const DEDUP_TTL: Duration = Duration::from_secs(10 * 60);
const RETRY_TTL: Duration = Duration::from_secs(30 * 60);

/// Delivers one decoded payload downstream
pub type DispatchHandler =
    Arc<dyn Fn(Envelope) -> BoxFuture<'static, Result<(), DeliveryError>> + Send + Sync>;

/// Called (after the tier delay) to route a reopen through the task queue
pub type RetryScheduler = Arc<dyn Fn(DispatcherOption) + Send + Sync>;

/// Called when the downstream rejects credentials
pub type UnauthorizedHook = Arc<dyn Fn() + Send + Sync>;

/// Everything needed to open one durable consumer
#[derive(Clone)]
pub struct DispatcherOption {
    pub durable: String,
    pub subject: String,
    pub handler: DispatchHandler,
}

#[derive(Debug, Clone)]
struct RetryState {
    last_error: String,
    retry: usize,
}

/// Dedup and retry bookkeeping, independent of the broker connection
struct DeliveryState {
    dedup: TtlCache<String, ()>,
    retries: TtlCache<String, RetryState>,
}

impl DeliveryState {
    fn new() -> Self {
        Self {
            dedup: TtlCache::new(DEDUP_TTL),
            retries: TtlCache::new(RETRY_TTL),
        }
    }

    fn already_delivered(&self, key: &String) -> bool {
        self.dedup.get(key).is_some()
    }

    /// Record a completed delivery.
    ///
    /// Must run before the ack goes out: if the ack is lost the broker
    /// redelivers, and only this entry keeps the handler from running the
    /// payload downstream a second time.
    fn mark_delivered(&self, key: String, durable: &str) {
        self.dedup.set(key, ());
        self.retries.delete(&durable.to_string());
    }

    /// Count one transient failure against the escalation table.
    ///
    /// Returns the attempt number and the delay before the next reopen, or
    /// `None` once the table is exhausted (retry state is dropped).
    fn next_retry(&self, durable: &str, error: &DeliveryError) -> Option<(usize, Duration)> {
        let retry = self
            .retries
            .get(&durable.to_string())
            .map(|state| state.retry)
            .unwrap_or(0)
            + 1;
        match retry_delay(retry) {
            Some(delay) => {
                self.retries.set(
                    durable.to_string(),
                    RetryState {
                        last_error: error.to_string(),
                        retry,
                    },
                );
                Some((retry, delay))
            }
            None => {
                self.retries.delete(&durable.to_string());
                None
            }
        }
    }

    /// Last transient error recorded for a durable, if still within TTL
    fn last_error(&self, durable: &str) -> Option<String> {
        self.retries
            .get(&durable.to_string())
            .map(|state| state.last_error)
    }
}

/// Owns the durable consumers and their retry/dedup state
pub struct DurableDispatcher {
    connection: Arc<BrokerConnection>,
    durables: Mutex<HashMap<String, AbortHandle>>,
    state: DeliveryState,
    retry_scheduler: RetryScheduler,
    on_unauthorized: UnauthorizedHook,
}

impl DurableDispatcher {
    pub fn new(
        connection: Arc<BrokerConnection>,
        retry_scheduler: RetryScheduler,
        on_unauthorized: UnauthorizedHook,
    ) -> Self {
        Self {
            connection,
            durables: Mutex::new(HashMap::new()),
            state: DeliveryState::new(),
            retry_scheduler,
            on_unauthorized,
        }
    }

    /// Open a durable consumer and start draining it.
    ///
    /// At most one consumer per durable name may be open.
    pub async fn open_durable(self: &Arc<Self>, opt: DispatcherOption) -> DeliveryResult<()> {
        {
            let durables = self.durables.lock().unwrap();
            if durables.contains_key(&opt.durable) {
                return Err(DeliveryError::undecided(format!(
                    "durable {} is already open",
                    opt.durable
                )));
            }
        }

        let config = self.connection.config();
        let stream = self
            .connection
            .jetstream()
            .get_stream(&config.stream_name)
            .await
            .map_err(|err| DeliveryError::transient(err.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                &opt.durable,
                consumer::pull::Config {
                    durable_name: Some(opt.durable.clone()),
                    filter_subject: opt.subject.clone(),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ack_wait: config.ack_wait(),
                    max_ack_pending: config.max_inflight,
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| DeliveryError::transient(err.to_string()))?;

        let durable = opt.durable.clone();
        let task = tokio::spawn(Arc::clone(self).consume(consumer, opt));
        self.durables
            .lock()
            .unwrap()
            .insert(durable.clone(), task.abort_handle());
        info!(durable, "durable opened");
        Ok(())
    }

    /// Reopen a durable after a transient failure.
    ///
    /// Only valid while the broker connection is live and the durable is
    /// still closed.
    pub async fn retry(self: &Arc<Self>, opt: DispatcherOption) -> DeliveryResult<()> {
        if !self.connection.is_connected() {
            return Err(DeliveryError::undecided(
                "cannot retry durable: broker connection is not live",
            ));
        }
        info!(
            durable = opt.durable,
            last_error = ?self.state.last_error(&opt.durable),
            "retrying durable"
        );
        self.open_durable(opt).await
    }

    /// Close every open durable
    pub fn close_all(&self) {
        let mut durables = self.durables.lock().unwrap();
        for (durable, handle) in durables.drain() {
            handle.abort();
            info!(durable, "durable closed");
        }
    }

    async fn consume(
        self: Arc<Self>,
        consumer: consumer::Consumer<consumer::pull::Config>,
        opt: DispatcherOption,
    ) {
        let mut messages = match consumer.messages().await {
            Ok(messages) => messages,
            Err(err) => {
                error!(durable = opt.durable, error = %err, "failed to start consuming");
                self.durables.lock().unwrap().remove(&opt.durable);
                return;
            }
        };

        while let Some(next) = messages.next().await {
            let message = match next {
                Ok(message) => message,
                Err(err) => {
                    warn!(durable = opt.durable, error = %err, "consumer stream error");
                    continue;
                }
            };
            if let ControlFlow::Break(()) = self.process(&opt, message).await {
                break;
            }
        }

        self.durables.lock().unwrap().remove(&opt.durable);
    }

    async fn process(
        &self,
        opt: &DispatcherOption,
        message: async_nats::jetstream::Message,
    ) -> ControlFlow<()> {
        let sequence = match message.info() {
            Ok(info) => info.stream_sequence,
            Err(err) => {
                warn!(durable = opt.durable, error = %err, "message without metadata");
                return ControlFlow::Continue(());
            }
        };
        let dedup_key = dedup_key(&opt.durable, sequence);

        if self.state.already_delivered(&dedup_key) {
            debug!(durable = opt.durable, sequence, "skipping duplicate delivery");
            if let Err(err) = message.ack().await {
                warn!(durable = opt.durable, error = %err, "failed to ack duplicate");
            }
            return ControlFlow::Continue(());
        }

        let trace_token = message_trace_token(message.headers.as_ref());
        let envelope = match decode_message(message.headers.as_ref(), &message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                // undeliverable as-is; redelivery applies after ack_wait
                error!(durable = opt.durable, sequence, error = %err, "undecodable message");
                return ControlFlow::Continue(());
            }
        };

        debug!(durable = opt.durable, sequence, ?trace_token, "dispatching payload");
        match (opt.handler)(envelope).await {
            Ok(()) => {
                // marked before the ack: if the ack is lost the broker
                // redelivers, and the entry suppresses a duplicate dispatch
                self.state.mark_delivered(dedup_key, &opt.durable);
                if let Err(err) = message.double_ack().await {
                    warn!(durable = opt.durable, error = %err, "failed to ack delivery");
                }
                ControlFlow::Continue(())
            }
            Err(err) => self.handle_error(opt, sequence, err),
        }
    }

    fn handle_error(
        &self,
        opt: &DispatcherOption,
        sequence: u64,
        err: DeliveryError,
    ) -> ControlFlow<()> {
        match err.kind() {
            ErrorKind::Transient => {
                self.handle_transient(opt, err);
                ControlFlow::Break(())
            }
            ErrorKind::Unauthorized => {
                error!(durable = opt.durable, error = %err, "downstream rejected credentials");
                (self.on_unauthorized)();
                ControlFlow::Break(())
            }
            ErrorKind::Undecided | ErrorKind::Capacity => {
                error!(durable = opt.durable, sequence, error = %err, "delivery failed");
                ControlFlow::Continue(())
            }
        }
    }

    fn handle_transient(&self, opt: &DispatcherOption, err: DeliveryError) {
        let Some((retry, delay)) = self.state.next_retry(&opt.durable, &err) else {
            error!(
                durable = opt.durable,
                retries = RETRY_DELAYS.len(),
                error = %err,
                "retries exhausted, durable abandoned"
            );
            return;
        };

        warn!(
            durable = opt.durable,
            retry,
            delay_secs = delay.as_secs(),
            error = %err,
            "transient failure, scheduling durable reopen"
        );

        let scheduler = Arc::clone(&self.retry_scheduler);
        let opt = opt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler(opt);
        });
    }
}

fn dedup_key(durable: &str, sequence: u64) -> String {
    format!("{durable}#{sequence}")
}

/// Delay before the n-th reopen attempt; `None` once the table is exhausted
fn retry_delay(retry: usize) -> Option<Duration> {
    RETRY_DELAYS.get(retry.checked_sub(1)?).copied()
}
