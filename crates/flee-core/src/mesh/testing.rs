//! Test doubles for the MAC collaborators

use std::collections::VecDeque;

use super::packet::{DataRequest, ShortAddress};
use super::traits::{LowerMac, Radio};

/// Underlying MAC with an inspectable queue
#[derive(Debug, Default)]
pub struct MockLowerMac {
    pub requests: Vec<(DataRequest, Vec<u8>)>,
    pub queued: VecDeque<ShortAddress>,
    pub started: Vec<ShortAddress>,
    pub in_flight: Option<ShortAddress>,
    pub discarded: usize,
}

impl MockLowerMac {
    /// Pretend a frame for `destination` is waiting
    pub fn queue(&mut self, destination: ShortAddress) {
        self.queued.push_back(destination);
    }
}

impl LowerMac for MockLowerMac {
    fn data_request(&mut self, request: DataRequest, payload: Vec<u8>) {
        self.queued.push_back(request.destination);
        self.requests.push((request, payload));
    }

    fn has_queued_for(&self, destination: ShortAddress) -> bool {
        self.queued.contains(&destination)
    }

    fn start_sending(&mut self, destination: ShortAddress) {
        if let Some(pos) = self.queued.iter().position(|d| *d == destination) {
            self.queued.remove(pos);
            self.in_flight = Some(destination);
        }
        self.started.push(destination);
    }

    fn in_flight_destination(&self) -> Option<ShortAddress> {
        self.in_flight
    }

    fn discard_in_flight(&mut self) {
        if self.in_flight.take().is_some() {
            self.discarded += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioCall {
    SetChannel(u8),
    RequestChannel,
    RxOnWhenIdle(bool),
    TxOn,
    RxOn,
}

/// Radio that records every call
#[derive(Debug, Default)]
pub struct MockRadio {
    pub calls: Vec<RadioCall>,
}

impl MockRadio {
    pub fn last_channel(&self) -> Option<u8> {
        self.calls.iter().rev().find_map(|c| match c {
            RadioCall::SetChannel(ch) => Some(*ch),
            _ => None,
        })
    }
}

impl Radio for MockRadio {
    fn set_channel(&mut self, channel: u8) {
        self.calls.push(RadioCall::SetChannel(channel));
    }

    fn request_channel(&mut self) {
        self.calls.push(RadioCall::RequestChannel);
    }

    fn set_rx_on_when_idle(&mut self, enabled: bool) {
        self.calls.push(RadioCall::RxOnWhenIdle(enabled));
    }

    fn request_tx_on(&mut self) {
        self.calls.push(RadioCall::TxOn);
    }

    fn request_rx_on(&mut self) {
        self.calls.push(RadioCall::RxOn);
    }
}
