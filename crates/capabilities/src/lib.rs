//! Capmesh Capabilities - Capability model, directory snapshot and local registry
//!
//! This crate holds everything a node knows about capabilities:
//! - Capability descriptors, identifiers and per-DON information
//! - The capability traits implemented by local capabilities and remote shims
//! - The `Service` lifecycle shared by every long-running component
//! - Decoding of the opaque per-DON capability configuration blobs
//! - The directory snapshot produced by the registry syncer
//! - The Local Capability Registry
//!
//! # Registry semantics
//!
//! Registration is idempotent. Adding a capability whose ID is already present
//! reports `Registration::AlreadyPresent` instead of failing, because reconciliation
//! passes are expected to repeat work.

#![warn(missing_docs)]

pub mod capability;
pub mod config;
pub mod error;
pub mod registry;
pub mod service;
pub mod snapshot;
pub mod types;

pub use capability::{
    BaseCapability, CapabilityInstance, CapabilityRequest, CapabilityResponse,
    ConsensusCapability, ExecutableCapability, RequestMetadata, TriggerCapability, TriggerEvent,
    TriggerRegistrationRequest, TriggerResponse,
};
pub use config::{
    CapabilityConfiguration, RemoteExecutableConfig, RemoteTargetConfig, RemoteTriggerConfig,
};
pub use error::{CapabilityError, ConfigError, RegistryError, ServiceError};
pub use registry::{LocalNode, Registration, Registry};
pub use service::{Service, ServiceState, StateMachine};
pub use snapshot::{CapabilityDescriptor, DirectorySnapshot, DonEntry, NodeInfo};
pub use types::{CapabilityId, CapabilityInfo, CapabilityType, Don, DonId};
