//! Slot layout and dispatch
//!
//! At every frame tick the scheduler lays out the frame: one slot per link
//! at the link's own offset, plus broadcast opportunities spaced
//! `broadcast_interval` apart in the gap that follows each link slot. With
//! no links at all, broadcast opportunities tile the whole frame.
//!
//! When a slot fires, the dispatcher decides whether to transmit, listen or
//! skip, tunes the radio, and flips the link's turn so the two ends of a link
//! alternate.
//!
//! ## Broadcast channel hopping
//!
//! The broadcast channel advances every frame in which nothing broadcast is
//! queued. While a broadcast frame waits, the frame-level "may transmit"
//! flag toggles each frame, so a node spends alternate frames listening and
//! transmitting on the broadcast channel.

use std::time::Duration;

use tracing::{debug, trace};

use super::channel;
use super::link::{LinkRegistry, LinkSettings, Turn};
use super::mac::MacEvent;
use super::packet::ShortAddress;
use super::traits::{LowerMac, Radio};
use crate::config::MacConfig;
use crate::observer::MeshObserver;
use crate::scheduler::Scheduler;

/// What a slot is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotTarget {
    Link(ShortAddress),
    Broadcast,
}

impl SlotTarget {
    pub fn address(self) -> ShortAddress {
        match self {
            SlotTarget::Link(address) => address,
            SlotTarget::Broadcast => ShortAddress::BROADCAST,
        }
    }
}

/// Outcome of dispatching one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAction {
    Transmit,
    Listen,
    /// Our turn to transmit but nothing is queued for the link
    Idle,
    /// The link disappeared before its slot fired
    Skipped,
    /// The link was dead and has been sent to expiry
    Stale,
}

/// One slot of a frame layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Offset from the start of the frame
    pub at: Duration,
    pub target: SlotTarget,
}

/// Frame-level scheduling state
#[derive(Debug, Clone)]
pub struct SlotScheduler {
    frame_length: Duration,
    broadcast_interval: Duration,
    rx_timeout: Duration,
    broadcast_channel: u8,
    may_transmit: bool,
    frame_started_at: Duration,
}

/// Forward distance from `from` to `to` around a frame of length `frame`
fn forward_gap(from: Duration, to: Duration, frame: Duration) -> Duration {
    let frame = frame.as_nanos();
    let gap = (to.as_nanos() % frame + frame - from.as_nanos() % frame) % frame;
    Duration::from_nanos(gap as u64)
}

fn wrap(offset: Duration, frame: Duration) -> Duration {
    Duration::from_nanos((offset.as_nanos() % frame.as_nanos()) as u64)
}

impl SlotScheduler {
    pub fn new(config: &MacConfig) -> Self {
        Self {
            frame_length: config.frame_length,
            broadcast_interval: config.broadcast_interval,
            rx_timeout: config.rx_timeout,
            broadcast_channel: config.initial_channel,
            may_transmit: true,
            frame_started_at: Duration::ZERO,
        }
    }

    pub fn frame_length(&self) -> Duration {
        self.frame_length
    }

    pub fn broadcast_channel(&self) -> u8 {
        self.broadcast_channel
    }

    pub fn may_transmit(&self) -> bool {
        self.may_transmit
    }

    pub fn frame_started_at(&self) -> Duration {
        self.frame_started_at
    }

    /// Note the start of a new frame
    pub fn begin_frame(&mut self, now: Duration) {
        self.frame_started_at = now;
    }

    /// How far into the current frame `now` is
    pub fn frame_offset_at(&self, now: Duration) -> Duration {
        wrap(now.saturating_sub(self.frame_started_at), self.frame_length)
    }

    /// Restore a saved broadcast channel; out-of-band values are ignored
    pub fn set_broadcast_channel(&mut self, ch: u8) -> bool {
        if !channel::is_valid(ch) {
            return false;
        }
        self.broadcast_channel = ch;
        true
    }

    pub fn advance_broadcast_channel(&mut self) -> u8 {
        self.broadcast_channel = channel::next(self.broadcast_channel);
        trace!(channel = self.broadcast_channel, "broadcast channel advanced");
        self.broadcast_channel
    }

    /// Compute the slots of one frame without touching any state
    pub fn plan_frame(&self, links: &LinkRegistry) -> Vec<Slot> {
        let frame = self.frame_length;
        let interval = self.broadcast_interval;
        let mut slots = Vec::new();

        if links.is_empty() {
            if self.may_transmit {
                let mut at = Duration::ZERO;
                while at + interval < frame {
                    slots.push(Slot {
                        at,
                        target: SlotTarget::Broadcast,
                    });
                    at += interval;
                }
            }
            return slots;
        }

        for (address, settings) in links.iter() {
            let offset = wrap(settings.frame_offset, frame);
            slots.push(Slot {
                at: offset,
                target: SlotTarget::Link(address),
            });

            let gap = links
                .iter()
                .filter(|(other, _)| *other != address)
                .map(|(_, s)| forward_gap(offset, s.frame_offset, frame))
                .min()
                .unwrap_or(frame);

            if gap > interval * 2 && self.may_transmit {
                let mut at = offset + interval;
                while at < offset + gap {
                    slots.push(Slot {
                        at: wrap(at, frame),
                        target: SlotTarget::Broadcast,
                    });
                    at += interval;
                }
            }
        }
        slots
    }

    /// Lay out the frame that starts now and schedule its slots
    ///
    /// Afterwards updates the frame-level broadcast state: with broadcast
    /// traffic queued the "may transmit" flag toggles, otherwise it is set
    /// and the broadcast channel advances.
    pub fn layout<L, S>(
        &mut self,
        links: &LinkRegistry,
        lower: &L,
        sched: &mut S,
        observer: &dyn MeshObserver,
    ) -> Vec<Slot>
    where
        L: LowerMac,
        S: Scheduler<MacEvent>,
    {
        let slots = self.plan_frame(links);
        for slot in &slots {
            sched.schedule_after(slot.at, MacEvent::Dispatch(slot.target));
        }
        debug!(
            links = links.len(),
            slots = slots.len(),
            may_transmit = self.may_transmit,
            "frame laid out"
        );

        if lower.has_queued_for(ShortAddress::BROADCAST) {
            self.may_transmit = !self.may_transmit;
        } else {
            self.may_transmit = true;
            let ch = self.advance_broadcast_channel();
            observer.broadcast_channel_changed(ch);
        }
        slots
    }

    /// Act on one slot
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch<L, R, S>(
        &mut self,
        target: SlotTarget,
        links: &mut LinkRegistry,
        lower: &mut L,
        radio: &mut R,
        sched: &mut S,
        observer: &dyn MeshObserver,
    ) -> SlotAction
    where
        L: LowerMac,
        R: Radio,
        S: Scheduler<MacEvent>,
    {
        let address = target.address();
        let mut settings = match target {
            SlotTarget::Broadcast => {
                let queued = lower.has_queued_for(ShortAddress::BROADCAST);
                let turn = if queued && !self.may_transmit {
                    let ch = self.advance_broadcast_channel();
                    observer.broadcast_channel_changed(ch);
                    Turn::Transmit
                } else {
                    Turn::Receive
                };
                LinkSettings {
                    turn,
                    ..LinkSettings::new(self.broadcast_channel, Duration::ZERO)
                }
            }
            SlotTarget::Link(_) => match links.get(address) {
                Some(settings) => settings.clone(),
                None => {
                    trace!(%address, "slot for vanished link");
                    return SlotAction::Skipped;
                }
            },
        };

        if settings.is_pruned() {
            debug!(%address, "dead link found at dispatch, expiring");
            links.rearm_after(address, Duration::ZERO, sched);
            observer.slot_dispatched(target, SlotAction::Stale);
            return SlotAction::Stale;
        }

        let mut action = SlotAction::Idle;
        if settings.turn == Turn::Transmit {
            if lower.has_queued_for(address) {
                radio.set_channel(settings.channel);
                lower.start_sending(address);
                radio.request_tx_on();
                action = SlotAction::Transmit;
                if target == SlotTarget::Broadcast {
                    sched.schedule_after(
                        self.frame_length,
                        MacEvent::RestoreBroadcastChannel(self.broadcast_channel),
                    );
                    sched.schedule_after(self.frame_length, MacEvent::Dispatch(target));
                }
            } else if target == SlotTarget::Broadcast {
                settings.turn = Turn::Receive;
            }
        }

        if settings.turn == Turn::Receive {
            radio.set_channel(settings.channel);
            radio.set_rx_on_when_idle(true);
            sched.schedule_after(self.rx_timeout, MacEvent::RxTimeout);
            action = SlotAction::Listen;
        }

        trace!(%address, channel = settings.channel, ?action, "slot dispatched");
        observer.slot_dispatched(target, action);

        if let SlotTarget::Link(_) = target {
            settings.turn = settings.turn.flip();
            links.store(address, settings);
        }
        action
    }
}
