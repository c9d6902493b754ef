//! FLEE MAC facade
//!
//! Wraps an underlying MAC and a radio. Upper layers see the usual
//! request/indication/confirm service; underneath, the facade keeps the link
//! registry current from received traffic and lets the slot scheduler decide
//! when the underlying MAC may transmit.
//!
//! ## Event flow
//!
//! ```text
//! start ──(random phase)──► FrameTick ──► LayoutSlots ──► Dispatch(slot)...
//!                              │                              │
//!                              └── next FrameTick after ──────┘
//!                                  one frame_length
//! ```
//!
//! The owner of the scheduler feeds every fired [`MacEvent`] back through
//! [`FleeMac::handle_event`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

use super::channel;
use super::link::LinkRegistry;
use super::packet::{DataConfirm, DataIndication, DataRequest, ShortAddress, TxStatus};
use super::slots::{SlotScheduler, SlotTarget};
use super::traits::{LowerMac, Radio};
use crate::config::MacConfig;
use crate::error::ConfigError;
use crate::observer::{self, MeshObserver};
use crate::scheduler::{Scheduler, TimerHandle};

/// Timer events owned by the MAC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacEvent {
    /// A new frame begins
    FrameTick,
    /// Lay out the slots of the frame that just began
    LayoutSlots,
    /// A slot is due
    Dispatch(SlotTarget),
    /// Put the broadcast channel back after a broadcast transmission
    RestoreBroadcastChannel(u8),
    /// Receive window of an idle slot closed
    RxTimeout,
    /// A link's expiry fired
    LinkExpired(ShortAddress),
}

/// Upward data indication handler
pub type IndicationHandler = Box<dyn FnMut(&DataIndication, &[u8])>;

/// Upward transmit confirmation handler
pub type ConfirmHandler = Box<dyn FnMut(&DataConfirm)>;

/// Duty-cycled slot-scheduling MAC
pub struct FleeMac<L, R> {
    config: MacConfig,
    address: ShortAddress,
    lower: L,
    radio: R,
    links: LinkRegistry,
    slots: SlotScheduler,
    /// Last channel the radio reported
    current_channel: u8,
    /// Frame offset at which the latest reception began
    latest_rx_offset: Duration,
    frame_timer: Option<TimerHandle>,
    rng: StdRng,
    observer: Arc<dyn MeshObserver>,
    on_indication: Option<IndicationHandler>,
    on_confirm: Option<ConfirmHandler>,
}

impl<L, R> fmt::Debug for FleeMac<L, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleeMac")
            .field("address", &self.address)
            .field("links", &self.links.len())
            .field("broadcast_channel", &self.slots.broadcast_channel())
            .field("current_channel", &self.current_channel)
            .finish()
    }
}

impl<L: LowerMac, R: Radio> FleeMac<L, R> {
    pub fn new(
        address: ShortAddress,
        lower: L,
        radio: R,
        config: MacConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            address,
            lower,
            radio,
            links: LinkRegistry::from_config(&config),
            slots: SlotScheduler::new(&config),
            current_channel: config.initial_channel,
            latest_rx_offset: Duration::ZERO,
            frame_timer: None,
            rng: StdRng::seed_from_u64(config.seed),
            observer: observer::noop(),
            on_indication: None,
            on_confirm: None,
            config,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn MeshObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn set_indication_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&DataIndication, &[u8]) + 'static,
    {
        self.on_indication = Some(Box::new(handler));
    }

    pub fn set_confirm_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&DataConfirm) + 'static,
    {
        self.on_confirm = Some(Box::new(handler));
    }

    pub fn address(&self) -> ShortAddress {
        self.address
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    pub fn links(&self) -> &LinkRegistry {
        &self.links
    }

    pub fn links_mut(&mut self) -> &mut LinkRegistry {
        &mut self.links
    }

    pub fn slots(&self) -> &SlotScheduler {
        &self.slots
    }

    pub fn lower(&self) -> &L {
        &self.lower
    }

    pub fn lower_mut(&mut self) -> &mut L {
        &mut self.lower
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn current_channel(&self) -> u8 {
        self.current_channel
    }

    /// Turn the receiver on and schedule the first frame tick
    ///
    /// The first tick lands at a random point in `[0, 2 * frame_length]` so
    /// neighbors powered on together do not share a frame phase. Returns the
    /// chosen delay.
    pub fn start<S: Scheduler<MacEvent>>(&mut self, sched: &mut S) -> Duration {
        self.radio.set_rx_on_when_idle(true);
        self.radio.request_rx_on();

        let max = (self.config.frame_length * 2).as_micros() as u64;
        let phase = Duration::from_micros(self.rng.gen_range(0..=max));
        if let Some(old) = self.frame_timer.replace(sched.schedule_after(phase, MacEvent::FrameTick)) {
            sched.cancel(old);
        }
        info!(address = %self.address, ?phase, "FLEE MAC started");
        phase
    }

    /// Stop ticking frames; already scheduled slots still fire
    pub fn stop<S: Scheduler<MacEvent>>(&mut self, sched: &mut S) {
        if let Some(timer) = self.frame_timer.take() {
            sched.cancel(timer);
        }
    }

    pub fn handle_event<S: Scheduler<MacEvent>>(&mut self, event: MacEvent, sched: &mut S) {
        match event {
            MacEvent::FrameTick => {
                self.slots.begin_frame(sched.now());
                sched.schedule_now(MacEvent::LayoutSlots);
                self.frame_timer =
                    Some(sched.schedule_after(self.config.frame_length, MacEvent::FrameTick));
            }
            MacEvent::LayoutSlots => {
                self.slots
                    .layout(&self.links, &self.lower, sched, self.observer.as_ref());
            }
            MacEvent::Dispatch(target) => {
                self.slots.dispatch(
                    target,
                    &mut self.links,
                    &mut self.lower,
                    &mut self.radio,
                    sched,
                    self.observer.as_ref(),
                );
            }
            MacEvent::RestoreBroadcastChannel(ch) => {
                if !self.slots.set_broadcast_channel(ch) {
                    warn!(channel = ch, "ignoring out-of-band broadcast channel");
                }
            }
            MacEvent::RxTimeout => {
                // Receiver power-down hook
                trace!("receive window closed");
            }
            MacEvent::LinkExpired(address) => {
                if self.links.expire(address).is_some() {
                    if self.lower.in_flight_destination() == Some(address) {
                        self.lower.discard_in_flight();
                    }
                    self.observer.link_expired(address);
                }
            }
        }
    }

    /// Hand a frame down for transmission
    ///
    /// Broadcast frames are submitted once per channel so a copy is waiting
    /// whichever channel the next broadcast slot lands on.
    pub fn data_request(&mut self, request: DataRequest, payload: Vec<u8>) {
        if request.destination.is_broadcast() {
            for _ in 0..channel::COUNT {
                self.lower.data_request(request.clone(), payload.clone());
                self.observer.frame_submitted(request.destination);
            }
            trace!(copies = channel::COUNT, len = payload.len(), "broadcast replicated");
        } else {
            let destination = request.destination;
            self.lower.data_request(request, payload);
            self.observer.frame_submitted(destination);
        }
    }

    /// Transmission finished in the underlying MAC
    pub fn on_data_confirm<S: Scheduler<MacEvent>>(&mut self, confirm: DataConfirm, sched: &mut S) {
        if let Some(destination) = self.lower.in_flight_destination() {
            if !destination.is_broadcast() {
                match confirm.status {
                    TxStatus::Success => {
                        self.links.touch(destination, sched);
                    }
                    TxStatus::NoAck | TxStatus::ChannelAccessFailure => {
                        // Peer lost our slot phase
                        if self.prune(destination, sched) {
                            debug!(%destination, status = ?confirm.status, "transmission failed, link pruned");
                        }
                    }
                }
            }
        }
        if let Some(handler) = self.on_confirm.as_mut() {
            handler(&confirm);
        }
    }

    /// Frame received by the underlying MAC
    pub fn on_data_indication<S: Scheduler<MacEvent>>(
        &mut self,
        indication: DataIndication,
        payload: &[u8],
        sched: &mut S,
    ) {
        // Answer arrives later through on_channel_report
        self.radio.request_channel();

        let source = indication.source;
        if !self.links.contains(source) {
            let created = self.links.observe(
                source,
                self.current_channel,
                self.latest_rx_offset,
                sched,
            );
            if created {
                let to_us = indication.destination == self.address;
                if to_us {
                    self.links.confirm(source, sched);
                }
                self.observer.link_created(source, to_us);
            }
        } else {
            self.links.confirm(source, sched);
        }

        if let Some(handler) = self.on_indication.as_mut() {
            handler(&indication, payload);
        }
    }

    /// The PHY started receiving a frame
    pub fn on_rx_start(&mut self, now: Duration) {
        self.latest_rx_offset = self.slots.frame_offset_at(now);
    }

    /// The PHY answered a channel request
    pub fn on_channel_report(&mut self, ch: u8) {
        if channel::is_valid(ch) {
            self.current_channel = ch;
        } else {
            warn!(channel = ch, "radio reported out-of-band channel");
        }
    }

    /// Drop a link at once
    pub fn prune<S: Scheduler<MacEvent>>(&mut self, address: ShortAddress, sched: &mut S) -> bool {
        if self.links.prune(address, sched).is_some() {
            self.observer.link_pruned(address);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::testing::{MockLowerMac, MockRadio, RadioCall};
    use crate::observer::Counters;
    use crate::scheduler::EventQueue;
    use std::cell::RefCell;
    use std::rc::Rc;

    type TestMac = FleeMac<MockLowerMac, MockRadio>;

    const OWN: ShortAddress = ShortAddress::new(0x0001);
    const PEER: ShortAddress = ShortAddress::new(0x0002);

    fn mac() -> TestMac {
        FleeMac::new(OWN, MockLowerMac::default(), MockRadio::default(), MacConfig::default()).unwrap()
    }

    fn run_until(mac: &mut TestMac, queue: &mut EventQueue<MacEvent>, until: Duration) {
        while let Some(at) = queue.peek_time() {
            if at > until {
                break;
            }
            let (_, event) = queue.pop().unwrap();
            mac.handle_event(event, queue);
        }
        queue.advance_to(until);
    }

    fn indication(source: ShortAddress, destination: ShortAddress) -> DataIndication {
        DataIndication {
            source,
            destination,
            link_quality: 200,
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = MacConfig::default().with_initial_channel(3);
        let result = FleeMac::new(OWN, MockLowerMac::default(), MockRadio::default(), config);
        assert_eq!(result.err(), Some(ConfigError::InvalidChannel(3)));
    }

    #[test]
    fn test_broadcast_replicated_per_channel() {
        let counters = Arc::new(Counters::new());
        let mut mac = mac().with_observer(counters.clone());
        let request = DataRequest::new(OWN, ShortAddress::BROADCAST, 1);
        mac.data_request(request.clone(), vec![0xAA, 0xBB]);

        let sent = &mac.lower().requests;
        assert_eq!(sent.len(), 16);
        assert!(sent.iter().all(|(r, p)| *r == request && p == &[0xAA, 0xBB]));
        // Every copy owns its own buffer
        assert_ne!(sent[0].1.as_ptr(), sent[1].1.as_ptr());
        assert_eq!(counters.snapshot().frames_submitted, 16);
    }

    #[test]
    fn test_unicast_passed_through() {
        let mut mac = mac();
        mac.data_request(DataRequest::new(OWN, PEER, 2), vec![1, 2, 3]);
        assert_eq!(mac.lower().requests.len(), 1);
        assert!(mac.lower().has_queued_for(PEER));
    }

    #[test]
    fn test_start_picks_phase_within_two_frames() {
        let mut queue = EventQueue::new();
        let mut a = mac();
        let phase = a.start(&mut queue);
        assert!(phase <= Duration::from_millis(200));
        assert_eq!(queue.pop(), Some((phase, MacEvent::FrameTick)));
        assert_eq!(
            a.radio().calls,
            vec![RadioCall::RxOnWhenIdle(true), RadioCall::RxOn]
        );

        // Same seed, same phase
        let mut queue = EventQueue::new();
        let mut b = mac();
        assert_eq!(b.start(&mut queue), phase);
    }

    #[test]
    fn test_frame_tick_reschedules_itself() {
        let mut queue = EventQueue::new();
        let mut mac = mac();
        mac.handle_event(MacEvent::FrameTick, &mut queue);
        assert_eq!(queue.pop(), Some((Duration::ZERO, MacEvent::LayoutSlots)));
        assert_eq!(queue.pop(), Some((Duration::from_millis(100), MacEvent::FrameTick)));
    }

    #[test]
    fn test_stop_cancels_frame_tick() {
        let mut queue = EventQueue::new();
        let mut mac = mac();
        mac.start(&mut queue);
        mac.stop(&mut queue);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_unknown_sender_not_for_us_is_observed() {
        let mut queue = EventQueue::new();
        let mut mac = mac();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        mac.set_indication_handler(move |ind, payload| {
            sink.borrow_mut().push((ind.source, payload.to_vec()));
        });

        mac.on_channel_report(19);
        mac.on_rx_start(Duration::from_millis(37));
        mac.on_data_indication(indication(PEER, ShortAddress::new(9)), b"hi", &mut queue);

        let link = mac.links().get(PEER).unwrap();
        assert!(!link.confirmed);
        assert_eq!(link.channel, 19);
        assert_eq!(link.frame_offset, Duration::from_millis(37));
        assert_eq!(queue.pop(), Some((Duration::from_millis(200), MacEvent::LinkExpired(PEER))));
        assert_eq!(seen.borrow().as_slice(), &[(PEER, b"hi".to_vec())]);
        assert!(mac.radio().calls.contains(&RadioCall::RequestChannel));
    }

    #[test]
    fn test_unknown_sender_for_us_is_confirmed() {
        let mut queue = EventQueue::new();
        let mut mac = mac();
        mac.on_data_indication(indication(PEER, OWN), &[], &mut queue);

        assert!(mac.links().get(PEER).unwrap().confirmed);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some((Duration::from_secs(1), MacEvent::LinkExpired(PEER))));
    }

    #[test]
    fn test_known_sender_is_touched_and_confirmed() {
        let mut queue = EventQueue::new();
        let mut mac = mac();
        mac.on_data_indication(indication(PEER, ShortAddress::BROADCAST), &[], &mut queue);
        assert!(!mac.links().get(PEER).unwrap().confirmed);

        queue.advance_to(Duration::from_millis(150));
        mac.on_data_indication(indication(PEER, ShortAddress::BROADCAST), &[], &mut queue);
        assert!(mac.links().get(PEER).unwrap().confirmed);
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.pop(),
            Some((Duration::from_millis(1150), MacEvent::LinkExpired(PEER)))
        );
    }

    #[test]
    fn test_broadcast_source_never_stored() {
        let mut queue = EventQueue::new();
        let mut mac = mac();
        mac.on_data_indication(indication(ShortAddress::BROADCAST, OWN), &[], &mut queue);
        assert!(mac.links().is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_confirm_touches_unicast_link() {
        let mut queue = EventQueue::new();
        let mut mac = mac();
        let confirms = Rc::new(RefCell::new(0));
        let count = confirms.clone();
        mac.set_confirm_handler(move |_| *count.borrow_mut() += 1);

        mac.on_data_indication(indication(PEER, ShortAddress::new(9)), &[], &mut queue);
        mac.lower_mut().in_flight = Some(PEER);
        queue.advance_to(Duration::from_millis(50));
        mac.on_data_confirm(
            DataConfirm {
                handle: 1,
                status: TxStatus::Success,
            },
            &mut queue,
        );

        assert_eq!(*confirms.borrow(), 1);
        assert_eq!(
            queue.pop(),
            Some((Duration::from_millis(1050), MacEvent::LinkExpired(PEER)))
        );
    }

    #[test]
    fn test_confirm_for_broadcast_touches_nothing() {
        let mut queue = EventQueue::new();
        let mut mac = mac();
        mac.on_data_indication(indication(PEER, ShortAddress::new(9)), &[], &mut queue);
        mac.lower_mut().in_flight = Some(ShortAddress::BROADCAST);
        mac.on_data_confirm(
            DataConfirm {
                handle: 1,
                status: TxStatus::Success,
            },
            &mut queue,
        );
        assert_eq!(
            queue.pop(),
            Some((Duration::from_millis(200), MacEvent::LinkExpired(PEER)))
        );
    }

    #[test]
    fn test_no_ack_prunes_link_immediately() {
        let counters = Arc::new(Counters::new());
        let mut queue = EventQueue::new();
        let mut mac = mac().with_observer(counters.clone());
        mac.on_data_indication(indication(PEER, OWN), &[], &mut queue);
        mac.lower_mut().in_flight = Some(PEER);

        mac.on_data_confirm(
            DataConfirm {
                handle: 3,
                status: TxStatus::NoAck,
            },
            &mut queue,
        );
        assert!(!mac.links().contains(PEER));
        // Expiry cancelled with the link
        assert!(queue.is_empty());
        assert!(mac.slots().plan_frame(mac.links()).iter().all(|s| s.target != SlotTarget::Link(PEER)));

        let snap = counters.snapshot();
        assert_eq!(snap.links_pruned, 1);
        assert_eq!(snap.links_expired, 0);
    }

    #[test]
    fn test_channel_access_failure_prunes_link() {
        let counters = Arc::new(Counters::new());
        let mut queue = EventQueue::new();
        let mut mac = mac().with_observer(counters.clone());
        mac.on_data_indication(indication(PEER, OWN), &[], &mut queue);
        mac.lower_mut().in_flight = Some(PEER);

        mac.on_data_confirm(
            DataConfirm {
                handle: 4,
                status: TxStatus::ChannelAccessFailure,
            },
            &mut queue,
        );
        assert!(!mac.links().contains(PEER));
        assert!(queue.is_empty());
        assert_eq!(counters.snapshot().links_pruned, 1);
    }

    #[test]
    fn test_dead_link_reexpired_by_its_slot() {
        let counters = Arc::new(Counters::new());
        let mut queue = EventQueue::new();
        let mut mac = mac().with_observer(counters.clone());
        mac.on_data_indication(indication(PEER, OWN), &[], &mut queue);
        mac.lower_mut().in_flight = Some(PEER);
        mac.links_mut().mark_pruned(PEER);

        mac.handle_event(MacEvent::Dispatch(SlotTarget::Link(PEER)), &mut queue);
        run_until(&mut mac, &mut queue, Duration::ZERO);

        assert!(!mac.links().contains(PEER));
        assert_eq!(mac.lower().discarded, 1);
        assert_eq!(counters.snapshot().links_expired, 1);
    }

    #[test]
    fn test_expiry_removes_link_and_discards_in_flight() {
        let mut queue = EventQueue::new();
        let mut mac = mac();
        mac.on_data_indication(indication(PEER, ShortAddress::new(9)), &[], &mut queue);
        mac.lower_mut().in_flight = Some(PEER);

        run_until(&mut mac, &mut queue, Duration::from_millis(199));
        assert!(mac.links().contains(PEER));

        run_until(&mut mac, &mut queue, Duration::from_millis(200));
        assert!(!mac.links().contains(PEER));
        assert_eq!(mac.lower().in_flight, None);
    }

    #[test]
    fn test_expiry_keeps_frame_for_other_link() {
        let other = ShortAddress::new(0x0003);
        let mut queue = EventQueue::new();
        let mut mac = mac();
        // Overheard: short expiry at 200 ms
        mac.on_data_indication(indication(PEER, ShortAddress::new(9)), &[], &mut queue);
        // Addressed to us: long expiry at 1 s
        mac.on_data_indication(indication(other, OWN), &[], &mut queue);
        mac.lower_mut().in_flight = Some(other);

        run_until(&mut mac, &mut queue, Duration::from_millis(200));
        assert!(!mac.links().contains(PEER));
        assert!(mac.links().contains(other));
        assert_eq!(mac.lower().in_flight, Some(other));
        assert_eq!(mac.lower().discarded, 0);
    }

    #[test]
    fn test_explicit_prune() {
        let mut queue = EventQueue::new();
        let mut mac = mac();
        mac.on_data_indication(indication(PEER, OWN), &[], &mut queue);
        assert!(mac.prune(PEER, &mut queue));
        assert!(!mac.prune(PEER, &mut queue));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_idle_frames_rotate_broadcast_channel() {
        let mut queue = EventQueue::new();
        let mut mac = mac();
        mac.handle_event(MacEvent::FrameTick, &mut queue);

        // 20 frames: layouts at 0, 100, ... 1900 ms
        run_until(&mut mac, &mut queue, Duration::from_millis(1950));
        // 11 + 20 steps around 16 channels
        assert_eq!(mac.slots().broadcast_channel(), 15);
        assert!(mac.lower().started.is_empty());
    }

    #[test]
    fn test_queued_broadcast_goes_out_within_two_frames() {
        let mut queue = EventQueue::new();
        let mut mac = mac();
        mac.data_request(DataRequest::new(OWN, ShortAddress::BROADCAST, 1), vec![7]);
        mac.handle_event(MacEvent::FrameTick, &mut queue);

        run_until(&mut mac, &mut queue, Duration::from_millis(250));
        assert_eq!(mac.lower().started.first(), Some(&ShortAddress::BROADCAST));
        let tx_channel = mac.radio().last_channel();
        assert!(tx_channel.map(channel::is_valid).unwrap_or(false));
    }

    #[test]
    fn test_out_of_band_channel_report_ignored() {
        let mut mac = mac();
        mac.on_channel_report(14);
        mac.on_channel_report(40);
        assert_eq!(mac.current_channel(), 14);
    }
}
