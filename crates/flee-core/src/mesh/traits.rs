//! Collaborators below the slot scheduler
//!
//! [`FleeMac`](super::FleeMac) never touches hardware directly. It drives an
//! underlying CSMA-style MAC that owns the transmit queue and retries, and a
//! radio that owns channel and transceiver state. Both are traits so the
//! facade can run against real drivers or test doubles.

use super::packet::{DataRequest, ShortAddress};

/// The underlying MAC whose transmit queue the slot scheduler paces
pub trait LowerMac {
    /// Queue a frame for transmission
    fn data_request(&mut self, request: DataRequest, payload: Vec<u8>);

    /// Whether a frame for `destination` is waiting in the queue
    fn has_queued_for(&self, destination: ShortAddress) -> bool;

    /// Start transmitting the queued frame for `destination`
    fn start_sending(&mut self, destination: ShortAddress);

    /// Destination of the frame currently being transmitted, if any
    fn in_flight_destination(&self) -> Option<ShortAddress>;

    /// Drop the frame currently being transmitted
    fn discard_in_flight(&mut self);
}

/// Radio control
///
/// Channel reads are asynchronous: `request_channel` asks the PHY, and the
/// answer comes back through [`FleeMac::on_channel_report`](super::FleeMac::on_channel_report).
pub trait Radio {
    fn set_channel(&mut self, channel: u8);

    fn request_channel(&mut self);

    /// Keep the receiver on whenever the transmitter is idle
    fn set_rx_on_when_idle(&mut self, enabled: bool);

    fn request_tx_on(&mut self);

    fn request_rx_on(&mut self);
}
