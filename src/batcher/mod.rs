//! Batching actor for outgoing payloads
//!
//! A batcher owns a [`BatchBuilder`] and flushes it downstream on three
//! triggers: the interval tick, the buffered byte size reaching the
//! configured threshold, and shutdown. `add` never blocks the producer.

pub mod events;
pub mod metrics;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::PayloadKind;

pub use events::EventsBatchBuilder;
pub use metrics::MetricsBatchBuilder;

const COMMAND_BUFFER: usize = 64;

/// Receives every flushed batch; typically publishes it to the broker
pub type BatchSink =
    Arc<dyn Fn(PayloadKind, Bytes) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Accumulates raw payloads and cuts them into ready batches
pub trait BatchBuilder: Send + 'static {
    fn kind(&self) -> PayloadKind;

    /// Buffer one input; returns the running byte size of the buffer
    fn add(&mut self, payload: Bytes) -> usize;

    /// Drain the buffer into zero or more ready batches
    fn build(&mut self) -> Vec<Bytes>;

    /// Re-apply the size threshold on config reload
    fn set_max_bytes(&mut self, _max_bytes: usize) {}
}

enum BatcherCommand {
    Add(Bytes),
    Exit(oneshot::Sender<()>),
    Reset {
        interval: Duration,
        max_bytes: usize,
        done: oneshot::Sender<()>,
    },
}

/// Handle to a running batcher task
#[derive(Clone)]
pub struct BatcherHandle {
    tx: mpsc::Sender<BatcherCommand>,
}

impl BatcherHandle {
    /// Spawn a batcher around `builder`.
    ///
    /// A zero `interval` disables the tick; flushes then happen only on the
    /// size threshold and on exit.
    pub fn spawn(
        builder: Box<dyn BatchBuilder>,
        interval: Duration,
        max_bytes: usize,
        sink: BatchSink,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(run_batcher(rx, builder, interval, max_bytes, sink));
        Self { tx }
    }

    /// Hand a payload to the batcher without waiting.
    ///
    /// Returns `false` if the batcher is gone or its command buffer is full;
    /// the payload is dropped in that case.
    pub fn add(&self, payload: Bytes) -> bool {
        match self.tx.try_send(BatcherCommand::Add(payload)) {
            Ok(()) => true,
            Err(_) => {
                warn!("batcher not accepting input, payload dropped");
                false
            }
        }
    }

    /// Flush whatever is buffered and stop the batcher
    pub async fn exit(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(BatcherCommand::Exit(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Flush, then continue with new interval and size threshold
    pub async fn reset(&self, interval: Duration, max_bytes: usize) {
        let (done_tx, done_rx) = oneshot::channel();
        let command = BatcherCommand::Reset {
            interval,
            max_bytes,
            done: done_tx,
        };
        if self.tx.send(command).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_batcher(
    mut rx: mpsc::Receiver<BatcherCommand>,
    mut builder: Box<dyn BatchBuilder>,
    mut interval: Duration,
    mut max_bytes: usize,
    sink: BatchSink,
) {
    builder.set_max_bytes(max_bytes);
    let mut ticker = make_ticker(interval);
    debug!(kind = %builder.kind(), ?interval, max_bytes, "batcher started");

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(BatcherCommand::Add(payload)) => {
                    trace!(kind = %builder.kind(), len = payload.len(), "buffering payload");
                    if builder.add(payload) >= max_bytes {
                        flush(builder.as_mut(), &sink).await;
                    }
                }
                Some(BatcherCommand::Reset { interval: new_interval, max_bytes: new_max, done }) => {
                    flush(builder.as_mut(), &sink).await;
                    interval = new_interval;
                    max_bytes = new_max;
                    builder.set_max_bytes(max_bytes);
                    ticker = make_ticker(interval);
                    debug!(kind = %builder.kind(), ?interval, max_bytes, "batcher reset");
                    let _ = done.send(());
                }
                Some(BatcherCommand::Exit(done)) => {
                    flush(builder.as_mut(), &sink).await;
                    debug!(kind = %builder.kind(), "batcher stopped");
                    let _ = done.send(());
                    return;
                }
                None => {
                    flush(builder.as_mut(), &sink).await;
                    return;
                }
            },
            _ = tick(&mut ticker) => {
                flush(builder.as_mut(), &sink).await;
            }
        }
    }
}

fn make_ticker(interval: Duration) -> Option<tokio::time::Interval> {
    if interval.is_zero() {
        return None;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the immediate first tick would flush an empty buffer
    ticker.reset();
    Some(ticker)
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => futures::future::pending().await,
    }
}

async fn flush(builder: &mut dyn BatchBuilder, sink: &BatchSink) {
    let kind = builder.kind();
    for batch in builder.build() {
        trace!(%kind, len = batch.len(), "flushing batch");
        if let Err(err) = sink(kind, batch).await {
            warn!(%kind, error = %err, "failed to hand off batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Builder cutting one batch per buffered input, for exercising the actor
    struct PassThrough {
        buffered: Vec<Bytes>,
    }

    impl BatchBuilder for PassThrough {
        fn kind(&self) -> PayloadKind {
            PayloadKind::Events
        }

        fn add(&mut self, payload: Bytes) -> usize {
            self.buffered.push(payload);
            self.buffered.iter().map(Bytes::len).sum()
        }

        fn build(&mut self) -> Vec<Bytes> {
            std::mem::take(&mut self.buffered)
        }
    }

    fn collecting_sink() -> (BatchSink, Arc<Mutex<Vec<Bytes>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&collected);
        let sink: BatchSink = Arc::new(move |_kind, batch| {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                inner.lock().unwrap().push(batch);
                Ok(())
            })
        });
        (sink, collected)
    }

    #[tokio::test(start_paused = true)]
    async fn interval_flushes_buffer() {
        let (sink, collected) = collecting_sink();
        let batcher = BatcherHandle::spawn(
            Box::new(PassThrough { buffered: vec![] }),
            Duration::from_secs(5),
            1024,
            sink,
        );

        assert!(batcher.add(Bytes::from_static(b"one")));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(collected.lock().unwrap().len(), 1);

        batcher.exit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn size_threshold_flushes_early() {
        let (sink, collected) = collecting_sink();
        let batcher = BatcherHandle::spawn(
            Box::new(PassThrough { buffered: vec![] }),
            Duration::from_secs(3600),
            8,
            sink,
        );

        assert!(batcher.add(Bytes::from_static(b"0123456789")));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(collected.lock().unwrap().len(), 1);

        batcher.exit().await;
    }

    #[tokio::test]
    async fn exit_flushes_remainder() {
        let (sink, collected) = collecting_sink();
        let batcher = BatcherHandle::spawn(
            Box::new(PassThrough { buffered: vec![] }),
            Duration::ZERO,
            1024,
            sink,
        );

        assert!(batcher.add(Bytes::from_static(b"tail")));
        batcher.exit().await;
        assert_eq!(collected.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_never_ticks() {
        let (sink, collected) = collecting_sink();
        let batcher = BatcherHandle::spawn(
            Box::new(PassThrough { buffered: vec![] }),
            Duration::ZERO,
            1024,
            sink,
        );

        assert!(batcher.add(Bytes::from_static(b"idle")));
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(collected.lock().unwrap().is_empty());

        batcher.exit().await;
        assert_eq!(collected.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_flushes_and_reapplies_config() {
        let (sink, collected) = collecting_sink();
        let batcher = BatcherHandle::spawn(
            Box::new(PassThrough { buffered: vec![] }),
            Duration::from_secs(3600),
            1024,
            sink,
        );

        assert!(batcher.add(Bytes::from_static(b"before-reset")));
        batcher.reset(Duration::from_secs(1), 1024).await;
        assert_eq!(collected.lock().unwrap().len(), 1);

        assert!(batcher.add(Bytes::from_static(b"after-reset")));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(collected.lock().unwrap().len(), 2);

        batcher.exit().await;
    }
}
