//! Duty-cycled Slot-Scheduling MAC
//!
//! FLEE sits on top of an IEEE 802.15.4 style MAC and decides *when* and *on
//! which channel* the radio is awake. Each neighbor gets a slot at a fixed
//! offset inside a repeating frame; the two ends of a link alternate between
//! transmitting and listening in that slot. Broadcast traffic uses the gaps
//! between link slots and hops across 16 channels frame by frame.
//!
//! - **Link**: per-neighbor channel, slot offset, turn and expiry watchdog
//! - **Slots**: per-frame slot layout and per-slot dispatch decisions
//! - **MAC**: the facade wrapping the underlying MAC and radio
//! - **Traits**: the underlying MAC and radio collaborators
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Upper Layer (IPv6 adaptation)                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//!            │ data_request                        ▲ indication / confirm
//!            ▼                                     │
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          FleeMac facade                                  │
//! │  ┌─────────────────┐  ┌──────────────────┐  ┌───────────────────────┐   │
//! │  │  LinkRegistry   │◄─│  SlotScheduler   │  │ broadcast replication │   │
//! │  │ (expiry timers) │  │ (layout/dispatch)│  │   (one copy/channel)  │   │
//! │  └─────────────────┘  └──────────────────┘  └───────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//!            │                                     │
//!            ▼                                     ▼
//! ┌──────────────────────────────┐   ┌──────────────────────────────────────┐
//! │      LowerMac trait          │   │          Radio trait                 │
//! │ queue, start_sending, drop   │   │  channel, TX_ON, RX_ON when idle     │
//! └──────────────────────────────┘   └──────────────────────────────────────┘
//! ```
//!
//! Time is virtual: the facade reacts to [`MacEvent`]s handed back by a
//! [`Scheduler`](crate::scheduler::Scheduler).

pub mod channel;
pub mod link;
pub mod mac;
pub mod packet;
pub mod slots;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use link::{LinkRegistry, LinkSettings, Turn};
pub use mac::{FleeMac, MacEvent};
pub use packet::{DataConfirm, DataIndication, DataRequest, ShortAddress, TxStatus};
pub use slots::{Slot, SlotAction, SlotScheduler, SlotTarget};
pub use traits::{LowerMac, Radio};
