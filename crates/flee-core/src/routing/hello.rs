//! Hello flood protocol
//!
//! ## Wire format
//!
//! A Hello is exactly one byte: the sender's hop distance to the sink.
//! Acknowledgments are `ack_len` zero bytes and are never interpreted.
//! Anything longer than one byte is therefore treated as an acknowledgment.
//!
//! ## Behavior
//!
//! - The sink sends a Hello on every interface right after start and then
//!   every `hello_interval`.
//! - On a Hello carrying `d`, a node's distance becomes `min(distance, d + 1)`.
//!   A strict improvement makes the sender the node's uplink.
//! - The first Hello from a neighbor with no route yet installs a host route
//!   to it, acknowledges it, and triggers one re-flood after
//!   `rebroadcast_delay`.

use std::collections::BTreeMap;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::Arc;

use tracing::{debug, info, trace};

use super::interface::InterfaceAddress;
use super::table::RoutingTable;
use super::{ALL_NODES, INFINITE_DISTANCE};
use crate::config::HelloConfig;
use crate::error::{ConfigError, HelloError};
use crate::observer::{self, MeshObserver};
use crate::scheduler::{Scheduler, TimerHandle};

/// A decoded Hello protocol datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloMessage {
    Hello { distance: u8 },
    Ack,
}

impl HelloMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, HelloError> {
        match payload {
            [] => Err(HelloError::Truncated(0)),
            [distance] => Ok(HelloMessage::Hello {
                distance: *distance,
            }),
            _ => Ok(HelloMessage::Ack),
        }
    }

    /// Encode; `ack_len` sizes the acknowledgment body
    pub fn encode(&self, ack_len: usize) -> Vec<u8> {
        match self {
            HelloMessage::Hello { distance } => vec![*distance],
            HelloMessage::Ack => vec![0; ack_len],
        }
    }
}

/// Timer events owned by the Hello protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingEvent {
    /// Send a Hello on every interface
    Hello,
    /// Acknowledge a newly heard neighbor
    SendAck { interface: u32, to: SocketAddrV6 },
}

/// A datagram socket bound on one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketBinding {
    pub interface: u32,
    /// Local address and port; the address is unspecified for the
    /// wildcard socket
    pub local: SocketAddrV6,
}

impl SocketBinding {
    pub fn is_wildcard(&self) -> bool {
        self.local.ip().is_unspecified()
    }
}

/// Datagram send primitive
pub trait DatagramTransport {
    fn send_to(&mut self, socket: &SocketBinding, payload: &[u8], flags: u32, to: SocketAddrV6);
}

/// Per-node Hello protocol state and routing table
#[derive(Clone)]
pub struct HelloProtocol {
    config: HelloConfig,
    table: RoutingTable,
    distance: u8,
    /// Neighbor that last improved our distance, and the interface it is on
    uplink: Option<(Ipv6Addr, u32)>,
    unicast_sockets: BTreeMap<u32, SocketBinding>,
    wildcard_sockets: BTreeMap<u32, SocketBinding>,
    hello_timer: Option<TimerHandle>,
    observer: Arc<dyn MeshObserver>,
}

impl std::fmt::Debug for HelloProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelloProtocol")
            .field("distance", &self.distance)
            .field("uplink", &self.uplink)
            .field("routes", &self.table.len())
            .finish()
    }
}

impl HelloProtocol {
    pub fn new(config: HelloConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            distance: config.initial_distance,
            config,
            table: RoutingTable::new(),
            uplink: None,
            unicast_sockets: BTreeMap::new(),
            wildcard_sockets: BTreeMap::new(),
            hello_timer: None,
            observer: observer::noop(),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn MeshObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &HelloConfig {
        &self.config
    }

    pub fn distance_to_sink(&self) -> u8 {
        self.distance
    }

    pub fn is_sink(&self) -> bool {
        self.distance == 0
    }

    /// Neighbor currently used as the way toward the sink
    pub fn uplink(&self) -> Option<Ipv6Addr> {
        self.uplink.map(|(gw, _)| gw)
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut RoutingTable {
        &mut self.table
    }

    pub fn unicast_socket(&self, interface: u32) -> Option<&SocketBinding> {
        self.unicast_sockets.get(&interface)
    }

    pub fn wildcard_socket(&self, interface: u32) -> Option<&SocketBinding> {
        self.wildcard_sockets.get(&interface)
    }

    /// Socket a datagram for `destination` arriving on `interface` lands on
    pub fn socket_for(&self, interface: u32, destination: Ipv6Addr) -> Option<SocketBinding> {
        let unicast = self
            .unicast_sockets
            .get(&interface)
            .filter(|s| *s.local.ip() == destination);
        unicast
            .or_else(|| self.wildcard_sockets.get(&interface))
            .copied()
    }

    /// Kick off the protocol; a sink schedules its first Hello at once
    pub fn start<S: Scheduler<RoutingEvent>>(&mut self, sched: &mut S) {
        if self.is_sink() {
            self.hello_timer = Some(sched.schedule_now(RoutingEvent::Hello));
            info!("sink started");
        }
    }

    pub fn notify_add_address(&mut self, interface: u32, address: InterfaceAddress) {
        self.table.notify_add_address(interface, address);
    }

    pub fn notify_remove_address(&mut self, interface: u32, address: InterfaceAddress) {
        self.table.notify_remove_address(interface, address);
        if self
            .unicast_sockets
            .get(&interface)
            .is_some_and(|s| *s.local.ip() == address.address)
        {
            self.unicast_sockets.remove(&interface);
        }
    }

    /// Interface came up: install its routes and bind its sockets
    ///
    /// The unicast socket binds to the interface's primary address; the
    /// wildcard socket receives multicast Hellos. Loopback gets neither.
    pub fn notify_interface_up(&mut self, interface: u32) {
        self.table.notify_interface_up(interface);
        let primary = self
            .table
            .interfaces()
            .get(interface)
            .and_then(|i| i.primary_address());
        let Some(primary) = primary else {
            return;
        };
        let port = self.config.port;
        self.unicast_sockets.insert(
            interface,
            SocketBinding {
                interface,
                local: SocketAddrV6::new(primary.address, port, 0, 0),
            },
        );
        self.wildcard_sockets.insert(
            interface,
            SocketBinding {
                interface,
                local: SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0),
            },
        );
        debug!(interface, address = %primary.address, port, "hello sockets bound");
    }

    pub fn notify_interface_down(&mut self, interface: u32) {
        self.table.notify_interface_down(interface);
        self.unicast_sockets.remove(&interface);
        self.wildcard_sockets.remove(&interface);
        if self.uplink.is_some_and(|(_, i)| i == interface) {
            self.uplink = None;
        }
    }

    pub fn handle_event<T, S>(&mut self, event: RoutingEvent, transport: &mut T, sched: &mut S)
    where
        T: DatagramTransport,
        S: Scheduler<RoutingEvent>,
    {
        match event {
            RoutingEvent::Hello => self.send_hello(transport, sched),
            RoutingEvent::SendAck { interface, to } => self.send_ack(interface, to, transport),
        }
    }

    fn send_hello<T, S>(&mut self, transport: &mut T, sched: &mut S)
    where
        T: DatagramTransport,
        S: Scheduler<RoutingEvent>,
    {
        let payload = HelloMessage::Hello {
            distance: self.distance,
        }
        .encode(self.config.ack_len);
        let to = SocketAddrV6::new(ALL_NODES, self.config.port, 0, 0);
        for socket in self.unicast_sockets.values() {
            transport.send_to(socket, &payload, 0, to);
            self.observer.hello_sent(socket.interface, self.distance);
        }
        trace!(distance = self.distance, sockets = self.unicast_sockets.len(), "hello sent");

        if self.is_sink() {
            // A single periodic chain, however many extra Hellos were sent
            if let Some(timer) = self.hello_timer.take() {
                sched.cancel(timer);
            }
            let timer = sched.schedule_after(self.config.hello_interval, RoutingEvent::Hello);
            self.hello_timer = Some(timer);
        }
    }

    fn send_ack<T: DatagramTransport>(&mut self, interface: u32, to: SocketAddrV6, transport: &mut T) {
        let Some(socket) = self.unicast_sockets.get(&interface) else {
            debug!(interface, "no unicast socket for ack");
            return;
        };
        let payload = HelloMessage::Ack.encode(self.config.ack_len);
        transport.send_to(socket, &payload, 0, to);
        self.observer.ack_sent(*to.ip());
        trace!(to = %to.ip(), interface, "ack sent");
    }

    /// A datagram arrived on `socket` from `from`
    pub fn recv<S: Scheduler<RoutingEvent>>(
        &mut self,
        socket: &SocketBinding,
        from: SocketAddrV6,
        payload: &[u8],
        sched: &mut S,
    ) {
        let heard = match HelloMessage::decode(payload) {
            Ok(HelloMessage::Hello { distance }) => distance,
            Ok(HelloMessage::Ack) => {
                trace!(from = %from.ip(), "ack received");
                return;
            }
            Err(err) => {
                debug!(from = %from.ip(), %err, "ignoring datagram");
                return;
            }
        };
        let sender = *from.ip();
        let interface = socket.interface;
        self.observer.hello_received(sender, heard);

        let candidate = heard.saturating_add(1);
        if candidate < self.distance {
            self.adopt_uplink(sender, interface, candidate);
        }

        if self.table.has_network_dest(sender, interface) {
            return;
        }
        self.table.add_host_route(sender, None, interface, 0);
        self.observer.route_installed(sender, interface);
        sched.schedule_now(RoutingEvent::SendAck {
            interface,
            to: SocketAddrV6::new(sender, self.config.port, 0, 0),
        });
        sched.schedule_after(self.config.rebroadcast_delay, RoutingEvent::Hello);
        debug!(neighbor = %sender, interface, "new neighbor");
    }

    fn adopt_uplink(&mut self, gateway: Ipv6Addr, interface: u32, distance: u8) {
        if let Some((old, old_interface)) = self.uplink.take() {
            self.table
                .notify_remove_route(Ipv6Addr::UNSPECIFIED, 0, old, old_interface, None);
        }
        self.table
            .set_default_route(gateway, interface, None, u32::from(distance));
        self.uplink = Some((gateway, interface));

        let old = self.distance;
        self.distance = distance;
        self.observer.distance_changed(old, distance);
        if old == INFINITE_DISTANCE {
            info!(distance, via = %gateway, "sink reachable");
        } else {
            info!(old, distance, via = %gateway, "distance to sink improved");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::Counters;
    use crate::routing::FLEE_PORT;
    use crate::scheduler::EventQueue;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<(SocketBinding, Vec<u8>, SocketAddrV6)>,
    }

    impl DatagramTransport for Recorder {
        fn send_to(&mut self, socket: &SocketBinding, payload: &[u8], _flags: u32, to: SocketAddrV6) {
            self.sent.push((*socket, payload.to_vec(), to));
        }
    }

    fn addr(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    fn node(config: HelloConfig, address: &str) -> HelloProtocol {
        let mut proto = HelloProtocol::new(config).unwrap();
        proto.notify_add_address(1, InterfaceAddress::new(addr(address), 128));
        proto.notify_interface_up(1);
        proto
    }

    fn from(address: &str) -> SocketAddrV6 {
        SocketAddrV6::new(addr(address), FLEE_PORT, 0, 0)
    }

    #[test]
    fn test_decode() {
        assert_eq!(HelloMessage::decode(&[]), Err(HelloError::Truncated(0)));
        assert_eq!(
            HelloMessage::decode(&[3]),
            Ok(HelloMessage::Hello { distance: 3 })
        );
        assert_eq!(HelloMessage::decode(&[0; 9]), Ok(HelloMessage::Ack));
        assert_eq!(HelloMessage::Ack.encode(9), vec![0; 9]);
        assert_eq!(HelloMessage::Hello { distance: 4 }.encode(9), vec![4]);
    }

    #[test]
    fn test_sockets_bound_on_interface_up() {
        let proto = node(HelloConfig::default(), "2001:db8::2");
        let unicast = proto.unicast_socket(1).unwrap();
        assert_eq!(*unicast.local.ip(), addr("2001:db8::2"));
        assert_eq!(unicast.local.port(), FLEE_PORT);
        assert!(proto.wildcard_socket(1).unwrap().is_wildcard());

        assert_eq!(proto.socket_for(1, ALL_NODES), proto.wildcard_socket(1).copied());
        assert_eq!(proto.socket_for(1, addr("2001:db8::2")), Some(*unicast));
    }

    #[test]
    fn test_loopback_gets_no_sockets() {
        let mut proto = HelloProtocol::new(HelloConfig::default()).unwrap();
        proto.notify_add_address(0, InterfaceAddress::new(Ipv6Addr::LOCALHOST, 128));
        proto.notify_interface_up(0);
        assert!(proto.unicast_socket(0).is_none());
        assert!(proto.wildcard_socket(0).is_none());
    }

    #[test]
    fn test_sink_hellos_periodically() {
        let mut queue = EventQueue::new();
        let mut transport = Recorder::default();
        let mut sink = node(HelloConfig::sink(), "2001:db8::1");
        sink.start(&mut queue);

        assert_eq!(queue.pop(), Some((Duration::ZERO, RoutingEvent::Hello)));
        sink.handle_event(RoutingEvent::Hello, &mut transport, &mut queue);
        assert_eq!(transport.sent.len(), 1);
        let (socket, payload, to) = &transport.sent[0];
        assert_eq!(payload, &vec![0]);
        assert_eq!(*to.ip(), ALL_NODES);
        assert_eq!(*socket.local.ip(), addr("2001:db8::1"));

        assert_eq!(queue.pop(), Some((Duration::from_secs(5), RoutingEvent::Hello)));
    }

    #[test]
    fn test_non_sink_start_is_silent() {
        let mut queue = EventQueue::new();
        let mut proto = node(HelloConfig::default(), "2001:db8::2");
        proto.start(&mut queue);
        assert!(queue.is_empty());
        assert_eq!(proto.distance_to_sink(), INFINITE_DISTANCE);
    }

    #[test]
    fn test_extra_sink_hello_keeps_single_chain() {
        let mut queue = EventQueue::new();
        let mut transport = Recorder::default();
        let mut sink = node(HelloConfig::sink(), "2001:db8::1");
        sink.handle_event(RoutingEvent::Hello, &mut transport, &mut queue);
        sink.handle_event(RoutingEvent::Hello, &mut transport, &mut queue);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_first_hello_installs_route_acks_and_refloods() {
        let counters = Arc::new(Counters::new());
        let mut queue = EventQueue::new();
        let mut relay = node(HelloConfig::default(), "2001:db8::2").with_observer(counters.clone());
        let socket = *relay.wildcard_socket(1).unwrap();

        relay.recv(&socket, from("2001:db8::1"), &[0], &mut queue);

        assert_eq!(relay.distance_to_sink(), 1);
        assert_eq!(relay.uplink(), Some(addr("2001:db8::1")));
        assert!(relay.table().has_network_dest(addr("2001:db8::1"), 1));
        let default = relay.table().default_route().unwrap();
        assert_eq!(default.gateway, addr("2001:db8::1"));
        assert_eq!(default.metric, 1);

        assert_eq!(
            queue.pop(),
            Some((
                Duration::ZERO,
                RoutingEvent::SendAck {
                    interface: 1,
                    to: from("2001:db8::1")
                }
            ))
        );
        assert_eq!(
            queue.pop(),
            Some((Duration::from_millis(100), RoutingEvent::Hello))
        );

        let snap = counters.snapshot();
        assert_eq!(snap.hellos_received, 1);
        assert_eq!(snap.routes_installed, 1);
        assert_eq!(snap.distance_changes, 1);
    }

    #[test]
    fn test_ack_goes_out_unicast_socket() {
        let mut queue = EventQueue::new();
        let mut transport = Recorder::default();
        let mut relay = node(HelloConfig::default(), "2001:db8::2");
        relay.handle_event(
            RoutingEvent::SendAck {
                interface: 1,
                to: from("2001:db8::1"),
            },
            &mut transport,
            &mut queue,
        );
        let (socket, payload, to) = &transport.sent[0];
        assert_eq!(*socket.local.ip(), addr("2001:db8::2"));
        assert_eq!(payload.len(), 9);
        assert_eq!(*to, from("2001:db8::1"));

        // Unknown interface: nothing sent
        relay.handle_event(
            RoutingEvent::SendAck {
                interface: 7,
                to: from("2001:db8::1"),
            },
            &mut transport,
            &mut queue,
        );
        assert_eq!(transport.sent.len(), 1);
    }

    #[test]
    fn test_repeated_hello_is_idempotent() {
        let mut queue = EventQueue::new();
        let mut relay = node(HelloConfig::default(), "2001:db8::2");
        let socket = *relay.wildcard_socket(1).unwrap();
        relay.recv(&socket, from("2001:db8::1"), &[0], &mut queue);
        while queue.pop().is_some() {}
        let routes = relay.table().entries().to_vec();

        relay.recv(&socket, from("2001:db8::1"), &[0], &mut queue);
        relay.recv(&socket, from("2001:db8::1"), &[5], &mut queue);

        assert!(queue.is_empty());
        assert_eq!(relay.table().entries(), routes.as_slice());
        assert_eq!(relay.distance_to_sink(), 1);
    }

    #[test]
    fn test_distance_never_increases() {
        let mut queue = EventQueue::new();
        let mut leaf = node(HelloConfig::default(), "2001:db8::3");
        let socket = *leaf.wildcard_socket(1).unwrap();

        leaf.recv(&socket, from("2001:db8::10"), &[4], &mut queue);
        assert_eq!(leaf.distance_to_sink(), 5);
        leaf.recv(&socket, from("2001:db8::11"), &[9], &mut queue);
        assert_eq!(leaf.distance_to_sink(), 5);
        assert_eq!(leaf.uplink(), Some(addr("2001:db8::10")));

        leaf.recv(&socket, from("2001:db8::12"), &[1], &mut queue);
        assert_eq!(leaf.distance_to_sink(), 2);
        assert_eq!(leaf.uplink(), Some(addr("2001:db8::12")));
        // The old uplink's default route was replaced
        let defaults = leaf.table().entries().iter().filter(|e| e.is_default()).count();
        assert_eq!(defaults, 1);

        // Infinity saturates instead of wrapping
        leaf.recv(&socket, from("2001:db8::13"), &[u8::MAX], &mut queue);
        assert_eq!(leaf.distance_to_sink(), 2);
    }

    #[test]
    fn test_sink_distance_stays_zero() {
        let mut queue = EventQueue::new();
        let mut sink = node(HelloConfig::sink(), "2001:db8::1");
        let socket = *sink.wildcard_socket(1).unwrap();
        sink.recv(&socket, from("2001:db8::2"), &[0], &mut queue);
        assert_eq!(sink.distance_to_sink(), 0);
        assert!(sink.uplink().is_none());
        assert!(sink.table().default_route().is_none());
        // Still learns the neighbor
        assert!(sink.table().has_network_dest(addr("2001:db8::2"), 1));
    }

    #[test]
    fn test_empty_and_ack_datagrams_ignored() {
        let mut queue = EventQueue::new();
        let mut relay = node(HelloConfig::default(), "2001:db8::2");
        let socket = *relay.unicast_socket(1).unwrap();
        let routes = relay.table().len();

        relay.recv(&socket, from("2001:db8::1"), &[], &mut queue);
        relay.recv(&socket, from("2001:db8::1"), &[0; 9], &mut queue);

        assert!(queue.is_empty());
        assert_eq!(relay.table().len(), routes);
        assert_eq!(relay.distance_to_sink(), INFINITE_DISTANCE);
    }

    #[test]
    fn test_interface_down_drops_sockets_and_uplink() {
        let mut queue = EventQueue::new();
        let mut relay = node(HelloConfig::default(), "2001:db8::2");
        let socket = *relay.wildcard_socket(1).unwrap();
        relay.recv(&socket, from("2001:db8::1"), &[0], &mut queue);

        relay.notify_interface_down(1);
        assert!(relay.unicast_socket(1).is_none());
        assert!(relay.uplink().is_none());
        assert!(relay.table().is_empty());
    }
}
