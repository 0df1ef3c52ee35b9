//! Remote trigger shims
//!
//! The subscriber lives on workflow DON nodes and implements `TriggerCapability` for a
//! trigger hosted elsewhere. The publisher lives on capability DON nodes and feeds a
//! local trigger's events to remote workflow DONs.

mod publisher;
mod subscriber;

pub use publisher::TriggerPublisher;
pub use subscriber::TriggerSubscriber;

/// Capacity of the per-workflow event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1000;
