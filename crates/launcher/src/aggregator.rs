//! Aggregator Selection
//!
//! Picks the aggregation policy of a remote trigger from its capability ID. Streams
//! triggers (`<prefix>...@<semver>`) select a signature-checking policy by major
//! version; every other trigger uses mode aggregation.

use crate::error::{LaunchError, LaunchResult};
use capmesh_capabilities::{Don, DirectorySnapshot};
use capmesh_remote::{
    Aggregator, DefaultModeAggregator, LegacyStreamsAggregator, SignedReportAggregator,
    SignerAddress,
};
use semver::Version;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Aggregation policy of a remote trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorKind {
    /// Streams trigger v1: per-feed signed reports
    LegacyStreams,
    /// Streams trigger v2: single signed report
    SignedReport,
    /// Any other trigger: byte-identical responses
    DefaultMode,
}

/// Classify `capability_id`
///
/// The version is the text after the last '@'; an ID without '@' is parsed whole.
pub fn select_aggregator_kind(capability_id: &str, prefix: &str) -> LaunchResult<AggregatorKind> {
    if !capability_id.starts_with(prefix) {
        return Ok(AggregatorKind::DefaultMode);
    }

    let raw = capability_id
        .rsplit_once('@')
        .map_or(capability_id, |(_, version)| version);
    let version = Version::parse(raw).map_err(|e| LaunchError::InvalidStreamTriggerVersion {
        capability_id: capability_id.to_string(),
        version: raw.to_string(),
        reason: e.to_string(),
    })?;

    match version.major {
        1 => Ok(AggregatorKind::LegacyStreams),
        2 => Ok(AggregatorKind::SignedReport),
        _ => Err(LaunchError::UnsupportedStreamTrigger {
            capability_id: capability_id.to_string(),
        }),
    }
}

/// Signer addresses of every member of `don`
pub fn signers_for(don: &Don, snapshot: &DirectorySnapshot) -> LaunchResult<HashSet<SignerAddress>> {
    don.members
        .iter()
        .map(|member| {
            snapshot
                .nodes
                .get(member)
                .map(|node| node.signer_address())
                .ok_or_else(|| LaunchError::SignerNotFound {
                    peer_id: member.to_string(),
                    don_id: don.id,
                })
        })
        .collect()
}

/// Build the aggregator for a trigger hosted by `remote_don`
pub fn build_aggregator(
    capability_id: &str,
    prefix: &str,
    remote_don: &Don,
    snapshot: &DirectorySnapshot,
    max_report_age: Duration,
) -> LaunchResult<Arc<dyn Aggregator>> {
    let threshold = remote_don.threshold();
    let aggregator: Arc<dyn Aggregator> = match select_aggregator_kind(capability_id, prefix)? {
        AggregatorKind::LegacyStreams => Arc::new(LegacyStreamsAggregator::new(
            signers_for(remote_don, snapshot)?,
            threshold,
            capability_id,
        )),
        AggregatorKind::SignedReport => Arc::new(SignedReportAggregator::new(
            signers_for(remote_don, snapshot)?,
            threshold,
            capability_id,
            max_report_age,
        )),
        AggregatorKind::DefaultMode => Arc::new(DefaultModeAggregator::new(threshold)),
    };
    Ok(aggregator)
}
