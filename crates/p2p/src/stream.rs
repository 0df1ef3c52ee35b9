//! Per-peer stream profiles
//!
//! A stream profile bounds the inbound and outbound message queues of a peer stream
//! and rate-limits it with two token buckets: one counting messages and one counting bytes.

use serde::{Deserialize, Serialize};

/// Token bucket parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketParams {
    /// Refill rate in tokens per second
    pub rate: f64,
    /// Bucket capacity in tokens
    pub capacity: u32,
}

/// Stream configuration applied to every connection to a peer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Inbound message queue length
    pub incoming_message_buffer_size: usize,
    /// Outbound message queue length
    pub outgoing_message_buffer_size: usize,
    /// Largest accepted message in bytes
    pub max_message_len_bytes: usize,
    /// Message-count rate limiter
    pub message_rate_limiter: TokenBucketParams,
    /// Byte-count rate limiter
    pub bytes_rate_limiter: TokenBucketParams,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            incoming_message_buffer_size: 500,
            outgoing_message_buffer_size: 500,
            max_message_len_bytes: 500_000, // 500 KB; worst case 500 * 500 KB = 250 MB queued
            message_rate_limiter: TokenBucketParams {
                rate: 100.0,
                capacity: 500,
            },
            bytes_rate_limiter: TokenBucketParams {
                rate: 5_000_000.0, // 5 MB/s
                capacity: 10_000_000, // 10 MB
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile() {
        let config = StreamConfig::default();
        assert_eq!(config.incoming_message_buffer_size, 500);
        assert_eq!(config.outgoing_message_buffer_size, 500);
        assert_eq!(config.bytes_rate_limiter.capacity, 10_000_000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: StreamConfig = toml::from_str("max_message_len_bytes = 1024").unwrap();
        assert_eq!(config.max_message_len_bytes, 1024);
        assert_eq!(config.message_rate_limiter.capacity, 500);
    }
}
