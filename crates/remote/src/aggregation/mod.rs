//! Trigger Aggregation Policies
//!
//! A trigger subscriber receives the same logical event from several members of the
//! capability DON. An aggregator turns those per-node responses into the single event
//! handed to the workflow.
//!
//! - [`DefaultModeAggregator`]: byte-identical responses from `F+1` nodes
//! - [`SignedReportAggregator`]: newest report carrying `F+1` valid signatures
//! - [`LegacyStreamsAggregator`]: per-feed newest report carrying `F+1` valid signatures
//!
//! Signed reports are signed with ed25519. The signer address checked against the
//! DON's registered signers is the first 20 bytes of the attached public key.

mod default_mode;
mod legacy;
mod signed_report;

pub use default_mode::DefaultModeAggregator;
pub use legacy::{LegacyStreamsAggregator, StreamsTriggerOutputs};
pub use signed_report::SignedReportAggregator;

pub(crate) use default_mode::most_common;

use crate::error::AggregationError;
use capmesh_capabilities::TriggerResponse;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Address of a report signer
pub type SignerAddress = [u8; 20];

/// Combines per-node trigger responses into one event
pub trait Aggregator: Send + Sync {
    /// Aggregate serialized `TriggerResponse`s received for `event_id`
    fn aggregate(
        &self,
        event_id: &str,
        responses: &[Vec<u8>],
    ) -> Result<TriggerResponse, AggregationError>;
}

/// One node's signature over a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSignature {
    /// ed25519 public key of the signer
    pub signer_key: Vec<u8>,
    /// ed25519 signature over [`SignedReport::signing_payload`]
    pub signature: Vec<u8>,
}

/// Report produced by a streams DON and signed by its members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedReport {
    /// Feed the report belongs to
    pub feed_id: String,
    /// Report sequence number, increasing per feed
    pub seq_nr: u64,
    /// Observation time (Unix epoch seconds)
    pub observation_timestamp: u64,
    /// Encoded report body
    pub report: Vec<u8>,
    /// Member signatures
    pub signatures: Vec<ReportSignature>,
}

impl SignedReport {
    /// Digest covered by the signatures
    pub fn signing_payload(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.feed_id.len() as u64).to_le_bytes());
        hasher.update(self.feed_id.as_bytes());
        hasher.update(&self.seq_nr.to_le_bytes());
        hasher.update(&self.observation_timestamp.to_le_bytes());
        hasher.update(&self.report);
        *hasher.finalize().as_bytes()
    }

    /// Append a signature made with `key`
    pub fn sign(&mut self, key: &SigningKey) {
        let signature = key.sign(&self.signing_payload());
        self.signatures.push(ReportSignature {
            signer_key: key.verifying_key().to_bytes().to_vec(),
            signature: signature.to_bytes().to_vec(),
        });
    }

    /// Number of distinct allowed signers with a valid signature
    pub fn valid_signature_count(&self, signers: &HashSet<SignerAddress>) -> usize {
        let payload = self.signing_payload();
        let mut seen: HashSet<SignerAddress> = HashSet::new();

        for sig in &self.signatures {
            let Ok(key_bytes) = <[u8; 32]>::try_from(sig.signer_key.as_slice()) else {
                continue;
            };
            let mut address = [0u8; 20];
            address.copy_from_slice(&key_bytes[..20]);
            if !signers.contains(&address) || seen.contains(&address) {
                continue;
            }

            let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
                continue;
            };
            let Ok(signature) = Signature::from_slice(&sig.signature) else {
                continue;
            };
            if key.verify(&payload, &signature).is_ok() {
                seen.insert(address);
            }
        }

        seen.len()
    }
}
