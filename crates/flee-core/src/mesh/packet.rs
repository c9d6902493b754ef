//! MAC service primitives
//!
//! Addresses and the request/indication/confirm parameter blocks exchanged
//! with the underlying MAC. Frame bodies travel alongside as plain byte
//! vectors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 16-bit short MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShortAddress(u16);

impl ShortAddress {
    /// Broadcast address (all 0xFF)
    pub const BROADCAST: ShortAddress = ShortAddress(0xFFFF);

    pub const fn new(value: u16) -> Self {
        ShortAddress(value)
    }

    pub fn to_u16(self) -> u16 {
        self.0
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }
}

impl fmt::Display for ShortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [hi, lo] = self.0.to_be_bytes();
        write!(f, "{:02x}:{:02x}", hi, lo)
    }
}

impl From<u16> for ShortAddress {
    fn from(value: u16) -> Self {
        ShortAddress(value)
    }
}

/// Outbound data request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    pub source: ShortAddress,
    pub destination: ShortAddress,
    /// Handle echoed back in the matching [`DataConfirm`]
    pub handle: u8,
    pub ack_requested: bool,
}

impl DataRequest {
    pub fn new(source: ShortAddress, destination: ShortAddress, handle: u8) -> Self {
        Self {
            source,
            destination,
            handle,
            ack_requested: !destination.is_broadcast(),
        }
    }
}

/// Inbound frame notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataIndication {
    pub source: ShortAddress,
    pub destination: ShortAddress,
    /// Link quality indicator reported by the radio
    pub link_quality: u8,
}

/// Transmission outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Success,
    /// No acknowledgment after all retries
    NoAck,
    /// Channel never came clear
    ChannelAccessFailure,
}

/// Transmission confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataConfirm {
    pub handle: u8,
    pub status: TxStatus,
}
