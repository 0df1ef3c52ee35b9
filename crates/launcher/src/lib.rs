//! Capmesh Launcher - Capability topology reconciliation
//!
//! Drives the remote capability wiring of a node from periodically refreshed
//! directory snapshots.
//!
//! # Components
//!
//! - **Launcher**: `launch(snapshot)` reconciles peer connections and shims,
//!   `close()` stops every shim and drops all connections
//! - **Topology**: pure classification of DONs relative to this node and the desired
//!   peer connection set
//! - **Aggregator selection**: maps a remote trigger's capability ID to its
//!   aggregation policy
//! - **Notifier**: announces the node's workflow DON
//!
//! # Invariants
//!
//! A node belongs to at most one workflow DON. A snapshot that says otherwise is
//! rejected before any shim is installed.

#![warn(missing_docs)]

pub mod aggregator;
pub mod config;
pub mod error;
pub mod launcher;
pub mod notifier;
pub mod topology;

pub use aggregator::{build_aggregator, select_aggregator_kind, signers_for, AggregatorKind};
pub use config::{LauncherConfig, DEFAULT_STREAM_TRIGGER_PREFIX};
pub use error::{LaunchError, LaunchResult};
pub use launcher::{Launcher, LauncherState, LAUNCHER_NAME};
pub use notifier::{DonNotifier, WorkflowDonNotifier};
pub use topology::{classify, desired_connections, DonClassification};
