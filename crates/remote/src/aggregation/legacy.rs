//! Streams trigger aggregation, v1 wire format
//!
//! Each response carries a batch of reports across many feeds. The aggregate holds,
//! per feed, the newest report that carries enough valid signatures.

use super::{Aggregator, SignedReport, SignerAddress};
use crate::error::AggregationError;
use capmesh_capabilities::{TriggerEvent, TriggerResponse};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Outputs of a v1 streams trigger event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamsTriggerOutputs {
    /// Event time (Unix epoch seconds)
    pub timestamp: u64,
    /// Reports, one or more per feed
    pub reports: Vec<SignedReport>,
}

/// Per-feed newest validly signed report
#[derive(Debug, Clone)]
pub struct LegacyStreamsAggregator {
    signers: HashSet<SignerAddress>,
    min_signatures: usize,
    capability_id: String,
}

impl LegacyStreamsAggregator {
    /// Create an aggregator for `capability_id`
    pub fn new(
        signers: HashSet<SignerAddress>,
        min_signatures: usize,
        capability_id: impl Into<String>,
    ) -> Self {
        Self {
            signers,
            min_signatures,
            capability_id: capability_id.into(),
        }
    }
}

impl Aggregator for LegacyStreamsAggregator {
    fn aggregate(
        &self,
        event_id: &str,
        responses: &[Vec<u8>],
    ) -> Result<TriggerResponse, AggregationError> {
        let mut latest: BTreeMap<String, SignedReport> = BTreeMap::new();
        let mut timestamp = 0u64;

        for raw in responses {
            let Some(outputs) = decode_outputs(raw) else {
                debug!(event_id, "Skipping undecodable streams response");
                continue;
            };
            timestamp = timestamp.max(outputs.timestamp);

            for report in outputs.reports {
                if report.valid_signature_count(&self.signers) < self.min_signatures {
                    continue;
                }
                let newer = latest.get(&report.feed_id).map_or(true, |current| {
                    (report.observation_timestamp, report.seq_nr)
                        > (current.observation_timestamp, current.seq_nr)
                });
                if newer {
                    latest.insert(report.feed_id.clone(), report);
                }
            }
        }

        if latest.is_empty() {
            return Err(AggregationError::NoValidReport {
                event_id: event_id.to_string(),
            });
        }

        let outputs = StreamsTriggerOutputs {
            timestamp,
            reports: latest.into_values().collect(),
        };
        Ok(TriggerResponse {
            event: TriggerEvent {
                trigger_type: self.capability_id.clone(),
                id: event_id.to_string(),
                outputs: serde_json::to_value(outputs)?,
            },
            error: None,
        })
    }
}

fn decode_outputs(raw: &[u8]) -> Option<StreamsTriggerOutputs> {
    let response: TriggerResponse = serde_json::from_slice(raw).ok()?;
    if response.error.is_some() {
        return None;
    }
    serde_json::from_value(response.event.outputs).ok()
}
