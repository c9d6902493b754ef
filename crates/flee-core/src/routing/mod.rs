//! Hop-count Routing
//!
//! A designated sink floods a one-byte Hello carrying its hop distance (0).
//! Every node keeps the smallest distance it has heard plus one, installs a
//! host route to each neighbor it hears from, and re-floods once per new
//! neighbor. The neighbor that improved a node's distance becomes its uplink:
//! the default route points at it.
//!
//! ```text
//!   sink (0) ──Hello(0)──► relay (1) ──Hello(1)──► leaf (2)
//!      ▲                      │  ▲                    │
//!      └──────── ack ─────────┘  └─────── ack ────────┘
//! ```
//!
//! - **Table**: longest-prefix routing table with interface tracking
//! - **Interface**: per-interface addresses and source address selection
//! - **Hello**: the flood protocol driving the table

pub mod hello;
pub mod interface;
pub mod table;

pub use hello::{DatagramTransport, HelloMessage, HelloProtocol, RoutingEvent, SocketBinding};
pub use interface::{Interface, InterfaceAddress, Interfaces};
pub use table::{Forwarding, Route, RoutingTable, RoutingTableEntry};

use std::net::Ipv6Addr;

/// UDP port of the Hello protocol
pub const FLEE_PORT: u16 = 6262;

/// Hop distance meaning "sink unreachable"
pub const INFINITE_DISTANCE: u8 = u8::MAX;

/// All-nodes link-local multicast group
pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
