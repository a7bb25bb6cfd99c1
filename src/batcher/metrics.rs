//! Batch builder for metrics payloads
//!
//! Submissions are regrouped by their set of resource-group memberships:
//! all inputs sharing the same sorted group-key set merge into one request
//! per flush. Merging also reconciles missing check timestamps and trims
//! overlong plugin output so the downstream API accepts the batch.

use std::collections::{BTreeMap, HashSet};

use bytes::Bytes;
use tracing::warn;

use crate::batcher::BatchBuilder;
use crate::transit::{
    MonitoredResource, ResourceGroup, ResourcesWithServicesRequest, Timestamp, TracerContext,
};
use crate::PayloadKind;

/// Longest `last_plugin_output` the downstream API accepts
pub const MAX_PLUGIN_OUTPUT: usize = 254;
const SHORTENED_SUFFIX: &str = "...<shortened>";

#[derive(Default)]
struct MergedGroup {
    context: Option<TracerContext>,
    groups: Vec<ResourceGroup>,
    group_keys: HashSet<String>,
    resources: Vec<MonitoredResource>,
}

pub struct MetricsBatchBuilder {
    buffered: Vec<ResourcesWithServicesRequest>,
    buffered_size: usize,
}

impl MetricsBatchBuilder {
    pub fn new() -> Self {
        Self {
            buffered: Vec::new(),
            buffered_size: 0,
        }
    }
}

impl Default for MetricsBatchBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchBuilder for MetricsBatchBuilder {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Metrics
    }

    fn add(&mut self, payload: Bytes) -> usize {
        match serde_json::from_slice::<ResourcesWithServicesRequest>(&payload) {
            Ok(request) => {
                self.buffered.push(request);
                self.buffered_size += payload.len();
            }
            Err(err) => warn!(error = %err, "skipping malformed metrics payload"),
        }
        self.buffered_size
    }

    fn build(&mut self) -> Vec<Bytes> {
        self.buffered_size = 0;
        if self.buffered.is_empty() {
            return Vec::new();
        }

        // BTreeMap keeps flush order stable across runs
        let mut merged: BTreeMap<String, MergedGroup> = BTreeMap::new();
        for request in self.buffered.drain(..) {
            let mut keys: Vec<String> = request.groups.iter().map(ResourceGroup::group_key).collect();
            keys.sort();
            let key = keys.join("#");

            let slot = merged.entry(key).or_default();
            if slot.context.is_none() {
                slot.context = request.context;
            }
            for group in request.groups {
                if slot.group_keys.insert(group.group_key()) {
                    slot.groups.push(group);
                }
            }
            slot.resources.extend(request.resources);
        }

        let now = Timestamp::now();
        merged
            .into_values()
            .filter_map(|mut slot| {
                for resource in &mut slot.resources {
                    reconcile_times(resource, now);
                    truncate_output(&mut resource.last_plugin_output);
                    for service in &mut resource.services {
                        truncate_output(&mut service.last_plugin_output);
                    }
                }
                let request = ResourcesWithServicesRequest {
                    context: slot.context,
                    groups: slot.groups,
                    resources: slot.resources,
                };
                match serde_json::to_vec(&request) {
                    Ok(batch) => Some(Bytes::from(batch)),
                    Err(err) => {
                        warn!(error = %err, "failed to serialize metrics batch");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Backfill missing check times: the resource inherits from its first
/// service carrying one (or from now), and services inherit from the
/// resource.
fn reconcile_times(resource: &mut MonitoredResource, now: Timestamp) {
    if resource.last_check_time.is_none() {
        resource.last_check_time = resource
            .services
            .iter()
            .find_map(|service| service.last_check_time)
            .or(Some(now));
    }
    if resource.next_check_time.is_none() {
        resource.next_check_time = resource
            .services
            .iter()
            .find_map(|service| service.next_check_time)
            .or(Some(now));
    }
    for service in &mut resource.services {
        if service.last_check_time.is_none() {
            service.last_check_time = resource.last_check_time;
        }
        if service.next_check_time.is_none() {
            service.next_check_time = resource.next_check_time;
        }
    }
}

fn truncate_output(output: &mut Option<String>) {
    if let Some(text) = output {
        if text.len() > MAX_PLUGIN_OUTPUT {
            let mut cut = MAX_PLUGIN_OUTPUT;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str(SHORTENED_SUFFIX);
        }
    }
}
