//! Batch builder for event payloads
//!
//! Events from separate submissions are concatenated into one request.
//! A single submission already larger than the size threshold cannot be
//! batched further, so its events are split into evenly-sized chunks and
//! each chunk leaves as its own batch.

use bytes::Bytes;
use tracing::warn;

use crate::batcher::BatchBuilder;
use crate::transit::EventsRequest;
use crate::PayloadKind;

pub struct EventsBatchBuilder {
    max_bytes: usize,
    buffered: Vec<serde_json::Value>,
    buffered_size: usize,
    ready: Vec<Vec<serde_json::Value>>,
    ready_size: usize,
}

impl EventsBatchBuilder {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            // a zero threshold would make every input "oversized" and the
            // chunk arithmetic divide by zero
            max_bytes: max_bytes.max(1),
            buffered: Vec::new(),
            buffered_size: 0,
            ready: Vec::new(),
            ready_size: 0,
        }
    }

    fn cut(&mut self) {
        if !self.buffered.is_empty() {
            self.ready.push(std::mem::take(&mut self.buffered));
            self.ready_size += self.buffered_size;
            self.buffered_size = 0;
        }
    }
}

impl BatchBuilder for EventsBatchBuilder {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Events
    }

    fn add(&mut self, payload: Bytes) -> usize {
        let size = payload.len();
        let request: EventsRequest = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "skipping malformed events payload");
                return self.buffered_size + self.ready_size;
            }
        };
        if request.events.is_empty() {
            return self.buffered_size + self.ready_size;
        }

        if size > self.max_bytes {
            // cut first so the chunks keep their submission order
            self.cut();
            let count = request.events.len();
            let lim = count / (size / self.max_bytes + 1) + 1;
            for chunk in request.events.chunks(lim) {
                self.ready.push(chunk.to_vec());
            }
            self.ready_size += size;
            return self.buffered_size + self.ready_size;
        }

        self.buffered.extend(request.events);
        self.buffered_size += size;
        if self.buffered_size >= self.max_bytes {
            self.cut();
        }
        self.buffered_size + self.ready_size
    }

    fn build(&mut self) -> Vec<Bytes> {
        self.cut();
        self.ready_size = 0;
        self.ready
            .drain(..)
            .filter_map(|events| match serde_json::to_vec(&EventsRequest { events }) {
                Ok(batch) => Some(Bytes::from(batch)),
                Err(err) => {
                    warn!(error = %err, "failed to serialize events batch");
                    None
                }
            })
            .collect()
    }

    fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes.max(1);
    }
}
