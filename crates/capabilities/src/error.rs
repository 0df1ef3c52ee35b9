//! Error types for capability, configuration, registry and lifecycle operations.

use thiserror::Error;

/// Errors raised by capabilities and capability metadata
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// Capability identifier is malformed
    #[error("Invalid capability id {id:?}: {reason}")]
    InvalidId {
        /// Offending identifier
        id: String,
        /// Why it was rejected
        reason: String,
    },

    /// Trigger registration failed
    #[error("Trigger registration failed: {0}")]
    Registration(String),

    /// Capability execution failed
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Capability cannot serve requests right now
    #[error("Capability unavailable: {0}")]
    Unavailable(String),
}

/// Errors decoding a capability configuration blob
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Protobuf decoding failed
    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A duration field was negative
    #[error("Negative duration in field {field}")]
    NegativeDuration {
        /// Field name
        field: &'static str,
    },

    /// A numeric value cannot be represented as JSON
    #[error("Non-finite number in config value")]
    NonFiniteNumber,
}

/// Errors from the Local Capability Registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No capability registered under this ID
    #[error("Capability not found: {id}")]
    NotFound {
        /// Requested ID
        id: String,
    },

    /// The instance variant does not fit the declared capability type
    #[error("Capability {id} declares type {declared} but was registered as {registered}")]
    TypeMismatch {
        /// Capability ID
        id: String,
        /// Type declared in the capability info
        declared: String,
        /// Instance variant that was registered
        registered: &'static str,
    },

    /// No directory snapshot has been installed yet
    #[error("No directory snapshot available")]
    NoSnapshot,

    /// DON is not part of the held snapshot
    #[error("DON {don_id} not found in snapshot")]
    DonNotFound {
        /// DON identifier
        don_id: u32,
    },

    /// DON carries no configuration for the capability
    #[error("No configuration for capability {capability_id} on DON {don_id}")]
    ConfigNotFound {
        /// Capability ID
        capability_id: String,
        /// DON identifier
        don_id: u32,
    },

    /// Stored configuration could not be decoded
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Capability metadata is malformed
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    /// Registry lock was poisoned
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Errors from the service lifecycle
#[derive(Debug, Error)]
pub enum ServiceError {
    /// `start` called twice
    #[error("{name} already started")]
    AlreadyStarted {
        /// Service name
        name: String,
    },

    /// `close` called on a service that never started
    #[error("{name} not started")]
    NotStarted {
        /// Service name
        name: String,
    },

    /// `close` called twice
    #[error("{name} already stopped")]
    AlreadyStopped {
        /// Service name
        name: String,
    },

    /// Service-specific failure
    #[error("{name} failed: {reason}")]
    Failed {
        /// Service name
        name: String,
        /// Failure reason
        reason: String,
    },
}
