//! Error types for the capability launcher.
//!
//! Launch errors fall into three groups: topology invariant violations, data
//! resolution failures (unknown capability, undecodable config, missing signer) and
//! wiring failures propagated from the registry, dispatcher or a shim's start.

use capmesh_capabilities::{
    CapabilityError, CapabilityType, ConfigError, DonId, RegistryError, ServiceError,
};
use capmesh_p2p::PeerError;
use capmesh_remote::DispatchError;
use thiserror::Error;

/// Errors raised while reconciling the capability topology
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Snapshot contradicts a topology invariant
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Peer connection manager rejected the connection set
    #[error("Failed to update peer connections: {0}")]
    PeerConnections(#[from] PeerError),

    /// DON references a capability the snapshot does not describe
    #[error("Could not find capability matching id {capability_id}")]
    CapabilityNotFound {
        /// Capability ID
        capability_id: String,
    },

    /// Capability configuration blob could not be decoded
    #[error("Could not decode capability config for id {capability_id}: {source}")]
    ConfigDecode {
        /// Capability ID
        capability_id: String,
        /// Decoder failure
        #[source]
        source: ConfigError,
    },

    /// DON member has no node entry, so its signer is unknown
    #[error("Signer for member {peer_id} of DON {don_id} not found")]
    SignerNotFound {
        /// Member identity (hex)
        peer_id: String,
        /// DON ID
        don_id: DonId,
    },

    /// Version suffix of a streams trigger ID is not semver
    #[error("Could not extract version from {capability_id} ({version}): {reason}")]
    InvalidStreamTriggerVersion {
        /// Capability ID
        capability_id: String,
        /// Text after the last '@'
        version: String,
        /// Parser message
        reason: String,
    },

    /// Streams trigger major version has no aggregator
    #[error("Unsupported stream trigger {capability_id}")]
    UnsupportedStreamTrigger {
        /// Capability ID
        capability_id: String,
    },

    /// Remote capability info could not be built
    #[error("Failed to create remote capability info: {0}")]
    InvalidCapabilityInfo(#[from] CapabilityError),

    /// Registry operation failed
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Dispatcher operation failed
    #[error("Dispatcher error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Shim failed to start
    #[error("Failed to start {name}: {source}")]
    StartFailed {
        /// Shim name
        name: String,
        /// Start failure
        #[source]
        source: ServiceError,
    },

    /// Local capability does not implement the interface its type requires
    #[error("Capability {capability_id} does not implement the {capability_type} interface")]
    InterfaceMismatch {
        /// Capability ID
        capability_id: String,
        /// Declared type
        capability_type: CapabilityType,
    },

    /// Capability to expose is not registered locally
    #[error("Local capability {capability_id} not available: {source}")]
    LocalCapabilityMissing {
        /// Capability ID
        capability_id: String,
        /// Registry lookup failure
        #[source]
        source: RegistryError,
    },

    /// Launcher configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for launcher operations
pub type LaunchResult<T> = Result<T, LaunchError>;
