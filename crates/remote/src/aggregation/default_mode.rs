//! Mode aggregation over byte-identical responses

use super::Aggregator;
use crate::error::AggregationError;
use capmesh_capabilities::TriggerResponse;
use std::collections::HashMap;

/// Picks the response that at least `min_identical_responses` nodes sent byte-for-byte
#[derive(Debug, Clone)]
pub struct DefaultModeAggregator {
    min_identical_responses: usize,
}

impl DefaultModeAggregator {
    /// Create an aggregator requiring `min_identical_responses` matching payloads
    pub fn new(min_identical_responses: usize) -> Self {
        Self {
            min_identical_responses,
        }
    }

    /// Required agreement
    pub fn min_identical_responses(&self) -> usize {
        self.min_identical_responses
    }
}

impl Aggregator for DefaultModeAggregator {
    fn aggregate(
        &self,
        event_id: &str,
        responses: &[Vec<u8>],
    ) -> Result<TriggerResponse, AggregationError> {
        let (payload, count) = most_common(responses).unwrap_or((&[][..], 0));
        if count < self.min_identical_responses || count == 0 {
            return Err(AggregationError::InsufficientResponses {
                event_id: event_id.to_string(),
                got: count,
                required: self.min_identical_responses,
            });
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Most frequent payload and its count
///
/// Ties go to the payload that appears first.
pub(crate) fn most_common(payloads: &[Vec<u8>]) -> Option<(&[u8], usize)> {
    let mut counts: HashMap<[u8; 32], (usize, usize)> = HashMap::new();
    for (idx, payload) in payloads.iter().enumerate() {
        let digest = *blake3::hash(payload).as_bytes();
        counts.entry(digest).or_insert((0, idx)).0 += 1;
    }

    counts
        .into_values()
        .max_by(|(count_a, idx_a), (count_b, idx_b)| {
            count_a.cmp(count_b).then_with(|| idx_b.cmp(idx_a))
        })
        .map(|(count, idx)| (payloads[idx].as_slice(), count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use capmesh_capabilities::TriggerEvent;
    use serde_json::json;

    fn response(value: i64) -> Vec<u8> {
        let response = TriggerResponse {
            event: TriggerEvent {
                trigger_type: "cron@1.0.0".to_string(),
                id: "ev-1".to_string(),
                outputs: json!({ "value": value }),
            },
            error: None,
        };
        serde_json::to_vec(&response).unwrap()
    }

    #[test]
    fn test_most_common_prefers_majority() {
        let payloads = vec![vec![1], vec![2], vec![2], vec![3]];
        let (payload, count) = most_common(&payloads).unwrap();
        assert_eq!(payload, &[2]);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_most_common_tie_goes_to_first() {
        let payloads = vec![vec![9], vec![1], vec![1], vec![9]];
        let (payload, _) = most_common(&payloads).unwrap();
        assert_eq!(payload, &[9]);
        assert!(most_common(&[]).is_none());
    }

    #[test]
    fn test_aggregate_with_enough_agreement() {
        let agg = DefaultModeAggregator::new(2);
        let responses = vec![response(7), response(7), response(8)];
        let out = agg.aggregate("ev-1", &responses).unwrap();
        assert_eq!(out.event.outputs, json!({ "value": 7 }));
    }

    #[test]
    fn test_aggregate_without_agreement() {
        let agg = DefaultModeAggregator::new(2);
        let responses = vec![response(1), response(2), response(3)];
        let err = agg.aggregate("ev-1", &responses).unwrap_err();
        assert!(matches!(
            err,
            AggregationError::InsufficientResponses { got: 1, required: 2, .. }
        ));
    }

    #[test]
    fn test_aggregate_malformed_majority() {
        let agg = DefaultModeAggregator::new(1);
        let err = agg.aggregate("ev-1", &[b"not json".to_vec()]).unwrap_err();
        assert!(matches!(err, AggregationError::Malformed(_)));
    }
}
