//! Sending facade for payload producers
//!
//! Every send wraps the caller's JSON, applies the per-kind suppression
//! switch, tags metrics/inventory payloads with a tracer context and hands
//! the result to the broker, through the matching batcher when batching is
//! enabled. Calls return once the payload is queued (or buffered), never
//! after downstream delivery.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::config::{UNDEFINED_AGENT_ID, UNDEFINED_APP_TYPE};
use crate::errors::{DeliveryError, DeliveryResult};
use crate::service::agent::Inner;
use crate::transit::TracerContext;
use crate::PayloadKind;

const CONTEXT_FIELD: &str = "context";
const AGENT_ID_FIELD: &str = "agentId";
const APP_TYPE_FIELD: &str = "appType";

/// Producer-facing sending API; cheap to clone
#[derive(Clone)]
pub struct TransitService {
    inner: Arc<Inner>,
}

impl TransitService {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub async fn send_events(&self, payload: Bytes) -> DeliveryResult<()> {
        if self.suppressed(PayloadKind::Events) {
            return Ok(());
        }
        let batched = self.inner.connector().batch_events_secs > 0;
        self.send(PayloadKind::Events, payload, batched).await
    }

    pub async fn send_events_ack(&self, payload: Bytes) -> DeliveryResult<()> {
        if self.suppressed(PayloadKind::EventsAck) {
            return Ok(());
        }
        self.send(PayloadKind::EventsAck, payload, false).await
    }

    pub async fn send_events_unack(&self, payload: Bytes) -> DeliveryResult<()> {
        if self.suppressed(PayloadKind::EventsUnack) {
            return Ok(());
        }
        self.send(PayloadKind::EventsUnack, payload, false).await
    }

    pub async fn clear_in_downtime(&self, payload: Bytes) -> DeliveryResult<()> {
        if self.suppressed(PayloadKind::ClearInDowntime) {
            return Ok(());
        }
        self.send(PayloadKind::ClearInDowntime, payload, false).await
    }

    pub async fn set_in_downtime(&self, payload: Bytes) -> DeliveryResult<()> {
        if self.suppressed(PayloadKind::SetInDowntime) {
            return Ok(());
        }
        self.send(PayloadKind::SetInDowntime, payload, false).await
    }

    pub async fn send_resource_with_metrics(&self, payload: Bytes) -> DeliveryResult<()> {
        if self.suppressed(PayloadKind::Metrics) {
            return Ok(());
        }
        let (agent_id, app_type) = self.inner.identity();
        let payload = mix_tracer_context(&payload, &agent_id, &app_type)?;
        let batched = self.inner.connector().batch_metrics_secs > 0;
        self.send(PayloadKind::Metrics, payload, batched).await
    }

    pub async fn synchronize_inventory(&self, payload: Bytes) -> DeliveryResult<()> {
        if self.suppressed(PayloadKind::Inventory) {
            return Ok(());
        }
        let (agent_id, app_type) = self.inner.identity();
        let payload = mix_tracer_context(&payload, &agent_id, &app_type)?;
        self.send(PayloadKind::Inventory, payload, false).await
    }

    async fn send(&self, kind: PayloadKind, payload: Bytes, batched: bool) -> DeliveryResult<()> {
        if batched {
            let handed_off = match kind {
                PayloadKind::Events => self.inner.batch_events(payload.clone()).await,
                PayloadKind::Metrics => self.inner.batch_metrics(payload.clone()).await,
                _ => false,
            };
            if handed_off {
                trace!(%kind, len = payload.len(), "payload buffered for batching");
                return Ok(());
            }
        }
        self.inner.publish(kind, payload).await
    }

    fn suppressed(&self, kind: PayloadKind) -> bool {
        let suppress = self.inner.connector().suppress;
        let suppressed = match kind {
            PayloadKind::Events | PayloadKind::EventsAck | PayloadKind::EventsUnack => {
                suppress.events
            }
            PayloadKind::ClearInDowntime | PayloadKind::SetInDowntime => suppress.downtimes,
            PayloadKind::Metrics => suppress.metrics,
            PayloadKind::Inventory => suppress.inventory,
        };
        if suppressed {
            debug!(%kind, "payload suppressed by configuration");
        }
        suppressed
    }
}

/// Add a tracer context to a payload that lacks one
pub(crate) fn mix_tracer_context(
    payload: &Bytes,
    agent_id: &str,
    app_type: &str,
) -> DeliveryResult<Bytes> {
    let mut value: serde_json::Value = serde_json::from_slice(payload)?;
    let Some(object) = value.as_object_mut() else {
        return Err(DeliveryError::undecided("payload is not a JSON object"));
    };
    if object.contains_key(CONTEXT_FIELD) {
        return Ok(payload.clone());
    }

    let context = TracerContext::new(agent_id, app_type);
    object.insert(CONTEXT_FIELD.into(), serde_json::to_value(&context)?);
    Ok(Bytes::from(serde_json::to_vec(&value)?))
}

/// Replace placeholder identity in a payload's tracer context.
///
/// Payloads tagged before the real config arrived carry placeholder
/// agent-id/app-type values; they are fixed up at dispatch time.
pub(crate) fn fix_tracer_context(
    payload: &Bytes,
    agent_id: &str,
    app_type: &str,
) -> DeliveryResult<Bytes> {
    let mut value: serde_json::Value = serde_json::from_slice(payload)?;
    let Some(context) = value.get_mut(CONTEXT_FIELD) else {
        return Ok(payload.clone());
    };

    let mut changed = false;
    if context.get(AGENT_ID_FIELD).and_then(|v| v.as_str()) == Some(UNDEFINED_AGENT_ID) {
        context[AGENT_ID_FIELD] = serde_json::Value::String(agent_id.to_string());
        changed = true;
    }
    if context.get(APP_TYPE_FIELD).and_then(|v| v.as_str()) == Some(UNDEFINED_APP_TYPE) {
        context[APP_TYPE_FIELD] = serde_json::Value::String(app_type.to_string());
        changed = true;
    }

    if changed {
        Ok(Bytes::from(serde_json::to_vec(&value)?))
    } else {
        Ok(payload.clone())
    }
}
