//! Link registry and expiry watchdogs
//!
//! A link exists for every neighbor heard recently. Each link owns exactly
//! one pending expiry timer; when it fires the link is removed. Any traffic
//! on the link re-arms the timer, cancelling the previous one first so a
//! link never has two expiries in flight.
//!
//! Links heard only in passing get a short expiry. Links that exchanged
//! traffic addressed to us are confirmed and get a long one.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, trace};

use super::channel;
use super::mac::MacEvent;
use super::packet::ShortAddress;
use crate::config::MacConfig;
use crate::scheduler::{Scheduler, TimerHandle};

/// Whose turn it is in a link's slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Turn {
    Transmit,
    Receive,
}

impl Turn {
    pub fn flip(self) -> Self {
        match self {
            Turn::Transmit => Turn::Receive,
            Turn::Receive => Turn::Transmit,
        }
    }
}

/// Per-neighbor link state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    /// Channel the link's slot uses; [`channel::PRUNED`] marks a dead link
    pub channel: u8,
    /// Slot position within the frame, in `[0, frame_length)`
    pub frame_offset: Duration,
    /// Missed slots; not yet driven by anything
    pub miss_count: u8,
    /// Traffic addressed to us has been exchanged on this link
    pub confirmed: bool,
    /// New links open on the transmit turn
    pub turn: Turn,
}

impl LinkSettings {
    pub fn new(channel: u8, frame_offset: Duration) -> Self {
        Self {
            channel,
            frame_offset,
            miss_count: 0,
            confirmed: false,
            turn: Turn::Transmit,
        }
    }

    pub fn is_pruned(&self) -> bool {
        self.channel == channel::PRUNED
    }
}

#[derive(Debug)]
struct Link {
    settings: LinkSettings,
    expiry: TimerHandle,
}

/// All known links, keyed by neighbor address
#[derive(Debug)]
pub struct LinkRegistry {
    links: BTreeMap<ShortAddress, Link>,
    short_expiry: Duration,
    long_expiry: Duration,
}

impl LinkRegistry {
    pub fn new(short_expiry: Duration, long_expiry: Duration) -> Self {
        Self {
            links: BTreeMap::new(),
            short_expiry,
            long_expiry,
        }
    }

    pub fn from_config(config: &MacConfig) -> Self {
        Self::new(config.short_expiry(), config.long_expiry())
    }

    pub fn get(&self, address: ShortAddress) -> Option<&LinkSettings> {
        self.links.get(&address).map(|l| &l.settings)
    }

    pub fn contains(&self, address: ShortAddress) -> bool {
        self.links.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Links in address order
    pub fn iter(&self) -> impl Iterator<Item = (ShortAddress, &LinkSettings)> {
        self.links.iter().map(|(a, l)| (*a, &l.settings))
    }

    /// Record a neighbor heard for the first time
    ///
    /// Creates an unconfirmed link on `channel` at `frame_offset` and arms
    /// the short expiry. Returns `false` if the address is the broadcast
    /// address or the link already exists, leaving the registry unchanged.
    pub fn observe<S: Scheduler<MacEvent>>(
        &mut self,
        address: ShortAddress,
        channel: u8,
        frame_offset: Duration,
        sched: &mut S,
    ) -> bool {
        if address.is_broadcast() || self.links.contains_key(&address) {
            return false;
        }
        let expiry = sched.schedule_after(self.short_expiry, MacEvent::LinkExpired(address));
        self.links.insert(
            address,
            Link {
                settings: LinkSettings::new(channel, frame_offset),
                expiry,
            },
        );
        debug!(%address, channel, offset = ?frame_offset, "link observed");
        true
    }

    /// Mark a link confirmed and arm the long expiry
    pub fn confirm<S: Scheduler<MacEvent>>(&mut self, address: ShortAddress, sched: &mut S) -> bool {
        let delay = self.long_expiry;
        match self.rearm(address, delay, sched) {
            Some(link) => {
                link.settings.confirmed = true;
                debug!(%address, "link confirmed");
                true
            }
            None => false,
        }
    }

    /// Re-arm the long expiry after traffic on a link
    pub fn touch<S: Scheduler<MacEvent>>(&mut self, address: ShortAddress, sched: &mut S) -> bool {
        let delay = self.long_expiry;
        self.rearm(address, delay, sched).is_some()
    }

    /// Re-arm the expiry to fire after `delay`
    pub fn rearm_after<S: Scheduler<MacEvent>>(
        &mut self,
        address: ShortAddress,
        delay: Duration,
        sched: &mut S,
    ) -> bool {
        self.rearm(address, delay, sched).is_some()
    }

    fn rearm<S: Scheduler<MacEvent>>(
        &mut self,
        address: ShortAddress,
        delay: Duration,
        sched: &mut S,
    ) -> Option<&mut Link> {
        let link = self.links.get_mut(&address)?;
        sched.cancel(link.expiry);
        link.expiry = sched.schedule_after(delay, MacEvent::LinkExpired(address));
        trace!(%address, ?delay, "link expiry re-armed");
        Some(link)
    }

    /// Remove a link immediately, cancelling its expiry
    pub fn prune<S: Scheduler<MacEvent>>(
        &mut self,
        address: ShortAddress,
        sched: &mut S,
    ) -> Option<LinkSettings> {
        let link = self.links.remove(&address)?;
        sched.cancel(link.expiry);
        debug!(%address, "link pruned");
        Some(link.settings)
    }

    /// Remove a link whose expiry just fired
    pub fn expire(&mut self, address: ShortAddress) -> Option<LinkSettings> {
        let link = self.links.remove(&address)?;
        debug!(%address, "link expired");
        Some(link.settings)
    }

    /// Write back settings changed by the dispatcher
    ///
    /// Does nothing if the link vanished in the meantime.
    pub fn store(&mut self, address: ShortAddress, settings: LinkSettings) {
        if let Some(link) = self.links.get_mut(&address) {
            link.settings = settings;
        }
    }

    /// Mark a link dead without removing it
    ///
    /// The slot dispatcher finds it at its next slot and expires it.
    pub fn mark_pruned(&mut self, address: ShortAddress) -> bool {
        match self.links.get_mut(&address) {
            Some(link) => {
                link.settings.channel = channel::PRUNED;
                true
            }
            None => false,
        }
    }
}
