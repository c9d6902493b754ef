//! Error types for the FLEE stack.

use std::net::Ipv6Addr;
use std::time::Duration;

use thiserror::Error;

/// Routing table and forwarding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// No entry matches the destination. Callers treat this as final for the
    /// attempt; nothing is retried internally.
    #[error("no route to host {0}")]
    NoRouteToHost(Ipv6Addr),

    /// The interface index is not known to the routing table
    #[error("unknown interface {0}")]
    UnknownInterface(u32),

    /// Positional access past the end of the table
    #[error("route index {index} out of range ({len} routes)")]
    RouteIndexOutOfRange { index: usize, len: usize },
}

/// Hello datagram decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HelloError {
    #[error("hello datagram truncated: need 1 byte, got {0}")]
    Truncated(usize),
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be non-zero")]
    ZeroValue(&'static str),

    #[error("broadcast interval {interval:?} must be shorter than the frame length {frame:?}")]
    BroadcastIntervalTooLong { interval: Duration, frame: Duration },

    #[error("channel {0} is outside 11..=26")]
    InvalidChannel(u8),

    #[error("acknowledgment payload of {0} bytes would decode as a Hello")]
    AckTooShort(usize),
}

/// Simulator errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("unknown node index {0}")]
    UnknownNode(usize),

    #[error("no node owns address {0}")]
    UnknownAddress(Ipv6Addr),

    #[error("no address left for node {index} after prefix {prefix}")]
    AddressSpaceExhausted { prefix: Ipv6Addr, index: usize },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for routing operations
pub type RoutingResult<T> = Result<T, RoutingError>;

/// Result type for simulator operations
pub type SimResult<T> = Result<T, SimError>;
