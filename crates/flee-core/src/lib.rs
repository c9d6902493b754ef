//! # FLEE Core Library
//!
//! This crate implements FLEE, a duty-cycled slot-scheduling MAC for low-power
//! IEEE 802.15.4 style radios, together with the hop-count routing protocol
//! that builds routes towards a designated sink.
//!
//! ## Overview
//!
//! Low-power nodes cannot keep their receivers on. FLEE gives every neighbor
//! link a slot in a repeating frame and lets both ends wake up only for it,
//! while a hopping broadcast channel fills the gaps. On top of that, a one-byte
//! Hello flood lets every node learn its distance to the sink:
//!
//! - **Scheduler**: virtual-time event queue the protocols run on
//! - **Mesh**: link registry, slot layout and the MAC facade
//! - **Routing**: longest-prefix routing table and the Hello protocol
//! - **Observer**: injected hooks and counters for protocol events
//! - **Sim**: multi-node network simulation of the routing layer
//!
//! ## Layering
//!
//! ```text
//! Upper layer ──► HelloProtocol ──► RoutingTable
//!      │
//!      ▼
//!   FleeMac ──► SlotScheduler / LinkRegistry ──► LowerMac + Radio
//! ```
//!
//! ## Example
//!
//! ```rust
//! use flee_core::routing::HelloProtocol;
//! use flee_core::HelloConfig;
//!
//! let sink = HelloProtocol::new(HelloConfig::sink()).unwrap();
//! assert_eq!(sink.distance_to_sink(), 0);
//!
//! let node = HelloProtocol::new(HelloConfig::default()).unwrap();
//! assert!(!node.is_sink());
//! ```

pub mod config;
pub mod error;
pub mod mesh;
pub mod observer;
pub mod routing;
pub mod scheduler;
pub mod sim;

pub use config::{HelloConfig, MacConfig};
pub use error::{ConfigError, HelloError, RoutingError, RoutingResult, SimError, SimResult};
pub use mesh::{DataConfirm, DataIndication, DataRequest, FleeMac, MacEvent, ShortAddress, TxStatus};
pub use observer::{CounterSnapshot, Counters, MeshObserver, NoopObserver};
pub use routing::{HelloProtocol, RoutingEvent, RoutingTable};
pub use scheduler::{EventQueue, MappedScheduler, Scheduler, TimerHandle};
pub use sim::{MeshSimulator, SimConfig, SimStats};
