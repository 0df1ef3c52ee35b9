//! Streams trigger aggregation, v2 wire format
//!
//! Each response carries one [`SignedReport`] as its outputs. The aggregate is the
//! report with the highest sequence number that is both properly signed and recent.

use super::{Aggregator, SignedReport, SignerAddress};
use crate::error::AggregationError;
use capmesh_capabilities::{TriggerEvent, TriggerResponse};
use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Newest validly signed report wins
#[derive(Debug, Clone)]
pub struct SignedReportAggregator {
    signers: HashSet<SignerAddress>,
    min_signatures: usize,
    capability_id: String,
    max_age: Duration,
}

impl SignedReportAggregator {
    /// Create an aggregator for `capability_id`
    pub fn new(
        signers: HashSet<SignerAddress>,
        min_signatures: usize,
        capability_id: impl Into<String>,
        max_age: Duration,
    ) -> Self {
        Self {
            signers,
            min_signatures,
            capability_id: capability_id.into(),
            max_age,
        }
    }

    /// Aggregate as of `now_secs` (Unix epoch seconds)
    pub fn aggregate_at(
        &self,
        event_id: &str,
        responses: &[Vec<u8>],
        now_secs: u64,
    ) -> Result<TriggerResponse, AggregationError> {
        let mut best: Option<SignedReport> = None;

        for raw in responses {
            let Some(report) = decode_report(raw) else {
                debug!(event_id, "Skipping undecodable streams response");
                continue;
            };
            if now_secs.saturating_sub(report.observation_timestamp) > self.max_age.as_secs() {
                debug!(event_id, feed_id = %report.feed_id, "Skipping stale report");
                continue;
            }
            if report.valid_signature_count(&self.signers) < self.min_signatures {
                debug!(event_id, feed_id = %report.feed_id, "Skipping under-signed report");
                continue;
            }
            if best.as_ref().map_or(true, |b| report.seq_nr > b.seq_nr) {
                best = Some(report);
            }
        }

        let report = best.ok_or_else(|| AggregationError::NoValidReport {
            event_id: event_id.to_string(),
        })?;

        Ok(TriggerResponse {
            event: TriggerEvent {
                trigger_type: self.capability_id.clone(),
                id: event_id.to_string(),
                outputs: serde_json::to_value(report)?,
            },
            error: None,
        })
    }
}

impl Aggregator for SignedReportAggregator {
    fn aggregate(
        &self,
        event_id: &str,
        responses: &[Vec<u8>],
    ) -> Result<TriggerResponse, AggregationError> {
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.aggregate_at(event_id, responses, now_secs)
    }
}

fn decode_report(raw: &[u8]) -> Option<SignedReport> {
    let response: TriggerResponse = serde_json::from_slice(raw).ok()?;
    if response.error.is_some() {
        return None;
    }
    serde_json::from_value(response.event.outputs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::test_support::*;

    const NOW: u64 = 1_700_000_000;

    fn wrap(report: &SignedReport) -> Vec<u8> {
        let response = TriggerResponse {
            event: TriggerEvent {
                trigger_type: "streams-trigger@2.0.0".to_string(),
                id: "node-local".to_string(),
                outputs: serde_json::to_value(report).unwrap(),
            },
            error: None,
        };
        serde_json::to_vec(&response).unwrap()
    }

    fn aggregator(keys: &[ed25519_dalek::SigningKey]) -> SignedReportAggregator {
        SignedReportAggregator::new(
            signer_set(keys),
            2,
            "streams-trigger@2.0.0",
            Duration::from_secs(120),
        )
    }

    #[test]
    fn test_highest_sequence_wins() {
        let keys = signing_keys(4);
        let agg = aggregator(&keys);
        let responses = vec![
            wrap(&report("btc", 5, NOW - 10, &keys[..2])),
            wrap(&report("btc", 7, NOW - 5, &keys[..3])),
            wrap(&report("btc", 6, NOW - 1, &keys[..2])),
        ];

        let out = agg.aggregate_at("ev-9", &responses, NOW).unwrap();
        let chosen: SignedReport = serde_json::from_value(out.event.outputs).unwrap();
        assert_eq!(chosen.seq_nr, 7);
        assert_eq!(out.event.id, "ev-9");
        assert_eq!(out.event.trigger_type, "streams-trigger@2.0.0");
    }

    #[test]
    fn test_under_signed_and_stale_reports_skipped() {
        let keys = signing_keys(4);
        let agg = aggregator(&keys);
        let responses = vec![
            wrap(&report("btc", 9, NOW - 1, &keys[..1])),
            wrap(&report("btc", 8, NOW - 500, &keys)),
            wrap(&report("btc", 3, NOW - 2, &keys[..2])),
        ];

        let out = agg.aggregate_at("ev-1", &responses, NOW).unwrap();
        let chosen: SignedReport = serde_json::from_value(out.event.outputs).unwrap();
        assert_eq!(chosen.seq_nr, 3);
    }

    #[test]
    fn test_no_valid_report() {
        let keys = signing_keys(3);
        let agg = aggregator(&keys);
        let responses = vec![wrap(&report("btc", 1, NOW, &keys[..1])), b"junk".to_vec()];
        assert!(matches!(
            agg.aggregate_at("ev-1", &responses, NOW),
            Err(AggregationError::NoValidReport { .. })
        ));
    }
}
