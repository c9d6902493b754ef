//! Protocol event observation
//!
//! Components report notable transitions to an injected [`MeshObserver`].
//! Every hook has a no-op default so an observer only implements what it
//! cares about. [`Counters`] is the stock implementation that tallies events.

use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::mesh::{ShortAddress, SlotAction, SlotTarget};

/// Receives protocol events from the MAC and routing layers
#[allow(unused_variables)]
pub trait MeshObserver: Send + Sync {
    /// A link was created for a previously unknown neighbor
    fn link_created(&self, address: ShortAddress, confirmed: bool) {}

    /// A link's expiry fired and the link was removed
    fn link_expired(&self, address: ShortAddress) {}

    /// A link was removed after a failed transmission
    fn link_pruned(&self, address: ShortAddress) {}

    /// One copy of a frame was handed to the underlying MAC
    fn frame_submitted(&self, destination: ShortAddress) {}

    /// A slot fired and the dispatcher decided what to do with it
    fn slot_dispatched(&self, target: SlotTarget, action: SlotAction) {}

    /// The broadcast channel moved to `channel`
    fn broadcast_channel_changed(&self, channel: u8) {}

    /// A Hello carrying `distance` was sent on `interface`
    fn hello_sent(&self, interface: u32, distance: u8) {}

    /// A Hello was received and decoded
    fn hello_received(&self, from: Ipv6Addr, distance: u8) {}

    /// An acknowledgment was sent to a newly discovered neighbor
    fn ack_sent(&self, to: Ipv6Addr) {}

    /// The node's hop distance to the sink improved
    fn distance_changed(&self, old: u8, new: u8) {}

    /// A host route to a neighbor was installed
    fn route_installed(&self, destination: Ipv6Addr, interface: u32) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl MeshObserver for NoopObserver {}

/// Shared no-op observer
pub fn noop() -> Arc<dyn MeshObserver> {
    Arc::new(NoopObserver)
}

/// Event tallies
#[derive(Debug, Default)]
pub struct Counters {
    links_created: AtomicU64,
    links_expired: AtomicU64,
    links_pruned: AtomicU64,
    frames_submitted: AtomicU64,
    slots_transmit: AtomicU64,
    slots_listen: AtomicU64,
    channel_changes: AtomicU64,
    hellos_sent: AtomicU64,
    hellos_received: AtomicU64,
    acks_sent: AtomicU64,
    distance_changes: AtomicU64,
    routes_installed: AtomicU64,
}

/// Point-in-time copy of [`Counters`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub links_created: u64,
    pub links_expired: u64,
    pub links_pruned: u64,
    pub frames_submitted: u64,
    pub slots_transmit: u64,
    pub slots_listen: u64,
    pub channel_changes: u64,
    pub hellos_sent: u64,
    pub hellos_received: u64,
    pub acks_sent: u64,
    pub distance_changes: u64,
    pub routes_installed: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            links_created: load(&self.links_created),
            links_expired: load(&self.links_expired),
            links_pruned: load(&self.links_pruned),
            frames_submitted: load(&self.frames_submitted),
            slots_transmit: load(&self.slots_transmit),
            slots_listen: load(&self.slots_listen),
            channel_changes: load(&self.channel_changes),
            hellos_sent: load(&self.hellos_sent),
            hellos_received: load(&self.hellos_received),
            acks_sent: load(&self.acks_sent),
            distance_changes: load(&self.distance_changes),
            routes_installed: load(&self.routes_installed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl MeshObserver for Counters {
    fn link_created(&self, _address: ShortAddress, _confirmed: bool) {
        bump(&self.links_created);
    }

    fn link_expired(&self, _address: ShortAddress) {
        bump(&self.links_expired);
    }

    fn link_pruned(&self, _address: ShortAddress) {
        bump(&self.links_pruned);
    }

    fn frame_submitted(&self, _destination: ShortAddress) {
        bump(&self.frames_submitted);
    }

    fn slot_dispatched(&self, _target: SlotTarget, action: SlotAction) {
        match action {
            SlotAction::Transmit => bump(&self.slots_transmit),
            SlotAction::Listen => bump(&self.slots_listen),
            SlotAction::Idle | SlotAction::Skipped | SlotAction::Stale => {}
        }
    }

    fn broadcast_channel_changed(&self, _channel: u8) {
        bump(&self.channel_changes);
    }

    fn hello_sent(&self, _interface: u32, _distance: u8) {
        bump(&self.hellos_sent);
    }

    fn hello_received(&self, _from: Ipv6Addr, _distance: u8) {
        bump(&self.hellos_received);
    }

    fn ack_sent(&self, _to: Ipv6Addr) {
        bump(&self.acks_sent);
    }

    fn distance_changed(&self, _old: u8, _new: u8) {
        bump(&self.distance_changes);
    }

    fn route_installed(&self, _destination: Ipv6Addr, _interface: u32) {
        bump(&self.routes_installed);
    }
}
