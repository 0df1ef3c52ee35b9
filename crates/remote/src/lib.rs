//! Capmesh Remote - Cross-DON capability shims
//!
//! Bridges local capability interfaces to wire-level messages exchanged with other DONs.
//!
//! # Components
//!
//! - **Dispatcher**: routes inbound messages by `(capability_id, don_id)` to receivers
//!   and hands outbound messages to the transport
//! - **Aggregation**: policies that combine per-node trigger observations into one
//!   agreed event under an F-of-N fault assumption
//! - **Trigger shims**: `TriggerSubscriber` (consumer side) and `TriggerPublisher`
//!   (producer side)
//! - **Executable shims**: `ExecutableClient` (consumer side) and `ExecutableServer`
//!   (producer side) for actions and targets
//!
//! # Fault Model
//!
//! Every quorum in this crate is `F+1` members of the relevant DON: at least one of them
//! is honest, so identical answers from `F+1` distinct members are trustworthy.

#![warn(missing_docs)]

pub mod aggregation;
pub mod cache;
pub mod dispatcher;
pub mod error;
pub mod executable;
pub mod message;
pub mod shim;
pub mod trigger;

pub use aggregation::{
    Aggregator, DefaultModeAggregator, LegacyStreamsAggregator, ReportSignature,
    SignedReport, SignedReportAggregator, SignerAddress, StreamsTriggerOutputs,
};
pub use cache::MessageCache;
pub use dispatcher::{Dispatcher, LocalDispatcher, Receiver};
pub use error::{AggregationError, DispatchError};
pub use executable::{ExecutableClient, ExecutableServer};
pub use message::{MessageBody, Method, TriggerEventPayload, MESSAGE_VERSION};
pub use shim::{CapabilityShim, ConsumerShim};
pub use trigger::{TriggerPublisher, TriggerSubscriber};
