//! Capmesh P2P - Peer identity and connection management
//!
//! Provides the peer-layer primitives the capability launcher depends on:
//!
//! - **Peer identity**: fixed-size 32-byte node identifiers
//! - **Stream profiles**: bounded queues and token-bucket rate limits per peer stream
//! - **Connection management**: a declarative `PeerConnections` seam that converges
//!   the live connection set onto a desired target set
//!
//! # Example Usage
//!
//! ```rust
//! use std::collections::HashMap;
//! use capmesh_p2p::{ConnectionTable, PeerConnections, PeerId, StreamConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let table = ConnectionTable::new(PeerId::from_bytes([1u8; 32]));
//!
//! let mut desired = HashMap::new();
//! desired.insert(PeerId::from_bytes([2u8; 32]), StreamConfig::default());
//! table.update_connections(desired)?;
//!
//! assert_eq!(table.connection_count(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod connections;
pub mod error;
pub mod peer;
pub mod stream;

pub use connections::{ConnectionDelta, ConnectionTable, PeerConnections};
pub use error::{PeerError, PeerResult};
pub use peer::PeerId;
pub use stream::{StreamConfig, TokenBucketParams};
