//! Multi-Node Mesh Network Simulation
//!
//! Runs the Hello protocol of many nodes on one virtual clock. It models:
//!
//! - Nodes placed in 2D space with a fixed radio range
//! - One-hop datagram delivery with a fixed link delay
//! - Hop-by-hop forwarding of data packets through each node's routing table
//! - Delivery statistics and a per-packet path trace
//!
//! The radio channel itself is ideal: every neighbor in range receives every
//! datagram.
//!
//! ## Example
//!
//! ```rust
//! use flee_core::sim::{MeshSimulator, SimConfig};
//! use std::time::Duration;
//!
//! // Sink, relay and leaf 100 m apart; only adjacent nodes hear each other
//! let config = SimConfig::default().with_stop_time(Duration::from_secs(3));
//! let mut sim = MeshSimulator::line(config, 3, 100.0).unwrap();
//!
//! sim.run_until(Duration::from_secs(1));
//! let sink = sim.node(0).unwrap().address();
//! let id = sim.send(2, sink, b"reading".to_vec()).unwrap();
//! sim.run();
//!
//! let delivered = sim.delivered(id).unwrap();
//! assert_eq!(delivered.path, vec![2, 1, 0]);
//! ```

use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::HelloConfig;
use crate::error::{ConfigError, SimError, SimResult};
use crate::observer::{self, MeshObserver};
use crate::routing::{
    DatagramTransport, Forwarding, HelloProtocol, InterfaceAddress, RoutingEvent, SocketBinding,
    INFINITE_DISTANCE,
};
use crate::scheduler::{EventQueue, MappedScheduler, Scheduler};

/// Interface index every simulated node uses for its radio
pub const SIM_INTERFACE: u32 = 1;

/// Node position in 2D space (meters)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub x: f64,
    pub y: f64,
}

impl NodePosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Distance to another node in meters
    pub fn distance_to(&self, other: &NodePosition) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Simulation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Nodes closer than this hear each other (meters)
    pub radio_range: f64,
    /// One-hop delivery delay
    pub link_delay: Duration,
    /// `run` stops here
    pub stop_time: Duration,
    /// Data packets visiting more nodes than this are dropped
    pub max_hops: u8,
    /// Node addresses are allocated sequentially from this prefix
    pub address_prefix: Ipv6Addr,
    /// Hello settings shared by every node; the sink overrides the distance
    pub hello: HelloConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            radio_range: 150.0,
            link_delay: Duration::from_millis(1),
            stop_time: Duration::from_secs(30),
            max_hops: 64,
            address_prefix: Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0),
            hello: HelloConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn with_radio_range(mut self, range: f64) -> Self {
        self.radio_range = range;
        self
    }

    pub fn with_link_delay(mut self, delay: Duration) -> Self {
        self.link_delay = delay;
        self
    }

    pub fn with_stop_time(mut self, stop_time: Duration) -> Self {
        self.stop_time = stop_time;
        self
    }

    pub fn with_max_hops(mut self, max_hops: u8) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_hello(mut self, hello: HelloConfig) -> Self {
        self.hello = hello;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.radio_range <= 0.0 || !self.radio_range.is_finite() {
            return Err(ConfigError::ZeroValue("radio_range"));
        }
        if self.max_hops == 0 {
            return Err(ConfigError::ZeroValue("max_hops"));
        }
        self.hello.validate()
    }
}

/// A unicast data packet travelling through the mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub id: u64,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
    pub payload: Vec<u8>,
    /// Indices of the nodes visited so far, source first
    pub path: Vec<usize>,
    pub sent_at: Duration,
}

impl DataPacket {
    /// Transmissions so far
    pub fn hops(&self) -> usize {
        self.path.len().saturating_sub(1)
    }
}

/// Simulation statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimStats {
    pub hellos_sent: u64,
    pub acks_sent: u64,
    /// Datagrams handed to a neighbor
    pub datagrams_delivered: u64,
    /// Unicast datagrams whose destination was out of range
    pub datagrams_dropped: u64,
    pub data_sent: u64,
    pub data_delivered: u64,
    pub data_dropped: u64,
    /// Sum of hop counts of delivered data packets
    pub total_hops: u64,
}

impl SimStats {
    /// Data delivery rate (0.0 - 1.0)
    pub fn delivery_rate(&self) -> f64 {
        if self.data_sent == 0 {
            0.0
        } else {
            self.data_delivered as f64 / self.data_sent as f64
        }
    }

    /// Average hop count of delivered data packets
    pub fn avg_hops(&self) -> f64 {
        if self.data_delivered == 0 {
            0.0
        } else {
            self.total_hops as f64 / self.data_delivered as f64
        }
    }
}

/// Simulation events for logging
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    NodeJoined { node: usize, address: Ipv6Addr, position: NodePosition },
    DistanceChanged { node: usize, distance: u8, at: Duration },
    DatagramDropped { from: usize, to: Ipv6Addr },
    DataSent { id: u64, node: usize },
    DataForwarded { id: u64, node: usize, next: usize },
    DataDelivered { id: u64, node: usize, hops: usize, latency: Duration },
    DataDropped { id: u64, node: usize, reason: String },
}

/// Simulated node
#[derive(Debug)]
pub struct SimNode {
    name: String,
    position: NodePosition,
    address: Ipv6Addr,
    protocol: HelloProtocol,
    received: Vec<DataPacket>,
}

impl SimNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> NodePosition {
        self.position
    }

    pub fn address(&self) -> Ipv6Addr {
        self.address
    }

    pub fn protocol(&self) -> &HelloProtocol {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut HelloProtocol {
        &mut self.protocol
    }

    pub fn distance_to_sink(&self) -> u8 {
        self.protocol.distance_to_sink()
    }

    /// Data packets delivered to this node
    pub fn received(&self) -> &[DataPacket] {
        &self.received
    }
}

/// Work waiting on the simulator clock
#[derive(Debug)]
enum Pending {
    Routing {
        node: usize,
        event: RoutingEvent,
    },
    Datagram {
        node: usize,
        from: SocketAddrV6,
        to: SocketAddrV6,
        payload: Vec<u8>,
    },
    Data {
        node: usize,
        packet: DataPacket,
    },
}

/// Datagrams one node sent while handling an event
#[derive(Default)]
struct Outbox {
    datagrams: Vec<(SocketBinding, Vec<u8>, SocketAddrV6)>,
}

impl DatagramTransport for Outbox {
    fn send_to(&mut self, socket: &SocketBinding, payload: &[u8], _flags: u32, to: SocketAddrV6) {
        self.datagrams.push((*socket, payload.to_vec(), to));
    }
}

/// Multi-node mesh network simulator
pub struct MeshSimulator {
    config: SimConfig,
    nodes: Vec<SimNode>,
    queue: EventQueue<Pending>,
    stats: SimStats,
    event_log: Vec<SimEvent>,
    next_packet_id: u64,
    observer: Arc<dyn MeshObserver>,
}

impl MeshSimulator {
    /// Create an empty simulator
    pub fn new(config: SimConfig) -> SimResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            nodes: Vec::new(),
            queue: EventQueue::new(),
            stats: SimStats::default(),
            event_log: Vec::new(),
            next_packet_id: 1,
            observer: observer::noop(),
        })
    }

    /// Nodes on a straight line, `spacing` meters apart, node 0 the sink
    pub fn line(config: SimConfig, count: usize, spacing: f64) -> SimResult<Self> {
        let mut sim = Self::new(config)?;
        for i in 0..count {
            let name = if i == 0 {
                "sink".to_string()
            } else {
                format!("n{}", i)
            };
            sim.add_node(name, NodePosition::new(i as f64 * spacing, 0.0), i == 0)?;
        }
        Ok(sim)
    }

    /// Observer handed to every node added afterwards
    pub fn with_observer(mut self, observer: Arc<dyn MeshObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Place a node and start its Hello protocol
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        position: NodePosition,
        sink: bool,
    ) -> SimResult<usize> {
        let index = self.nodes.len();
        let prefix = self.config.address_prefix;
        let address = u128::from(prefix)
            .checked_add(index as u128 + 1)
            .map(Ipv6Addr::from)
            .ok_or(SimError::AddressSpaceExhausted { prefix, index })?;
        let hello = self.config.hello.clone().with_initial_distance(if sink {
            0
        } else {
            INFINITE_DISTANCE
        });

        let mut protocol = HelloProtocol::new(hello)?.with_observer(self.observer.clone());
        protocol.notify_add_address(SIM_INTERFACE, InterfaceAddress::new(address, 128));
        protocol.notify_interface_up(SIM_INTERFACE);
        {
            let mut sched =
                MappedScheduler::new(&mut self.queue, move |event| Pending::Routing {
                    node: index,
                    event,
                });
            protocol.start(&mut sched);
        }

        let name = name.into();
        info!(node = index, %name, %address, sink, "node joined");
        self.event_log.push(SimEvent::NodeJoined {
            node: index,
            address,
            position,
        });
        self.nodes.push(SimNode {
            name,
            position,
            address,
            protocol,
            received: Vec::new(),
        });
        Ok(index)
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn now(&self) -> Duration {
        self.queue.now()
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> SimResult<&SimNode> {
        self.nodes.get(index).ok_or(SimError::UnknownNode(index))
    }

    pub fn node_by_address(&self, address: Ipv6Addr) -> SimResult<usize> {
        self.nodes
            .iter()
            .position(|n| n.address == address)
            .ok_or(SimError::UnknownAddress(address))
    }

    /// Nodes within radio range of `index`
    pub fn neighbors(&self, index: usize) -> Vec<usize> {
        let Some(me) = self.nodes.get(index) else {
            return Vec::new();
        };
        self.nodes
            .iter()
            .enumerate()
            .filter(|(i, n)| {
                *i != index && me.position.distance_to(&n.position) <= self.config.radio_range
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    pub fn event_log(&self) -> &[SimEvent] {
        &self.event_log
    }

    /// The delivered copy of packet `id`, if it arrived
    pub fn delivered(&self, id: u64) -> Option<&DataPacket> {
        self.nodes
            .iter()
            .flat_map(|n| n.received.iter())
            .find(|p| p.id == id)
    }

    /// Originate a data packet at node `from`, returning its id
    pub fn send(&mut self, from: usize, destination: Ipv6Addr, payload: Vec<u8>) -> SimResult<u64> {
        let source = self.node(from)?.address;
        let id = self.next_packet_id;
        self.next_packet_id += 1;

        let packet = DataPacket {
            id,
            source,
            destination,
            payload,
            path: Vec::new(),
            sent_at: self.queue.now(),
        };
        self.queue.schedule_now(Pending::Data { node: from, packet });
        self.stats.data_sent += 1;
        self.event_log.push(SimEvent::DataSent { id, node: from });
        Ok(id)
    }

    /// Run until the configured stop time
    pub fn run(&mut self) -> &SimStats {
        let stop = self.config.stop_time;
        self.run_until(stop);
        &self.stats
    }

    /// Process every event due at or before `until`
    pub fn run_until(&mut self, until: Duration) {
        while self.queue.peek_time().is_some_and(|t| t <= until) {
            self.step();
        }
        self.queue.advance_to(until);
    }

    /// Process the next event; `false` when nothing is left
    pub fn step(&mut self) -> bool {
        let Some((_, pending)) = self.queue.pop() else {
            return false;
        };
        match pending {
            Pending::Routing { node, event } => self.on_routing_event(node, event),
            Pending::Datagram {
                node,
                from,
                to,
                payload,
            } => self.on_datagram(node, from, to, &payload),
            Pending::Data { node, packet } => self.on_data(node, packet),
        }
        true
    }

    fn on_routing_event(&mut self, index: usize, event: RoutingEvent) {
        let mut outbox = Outbox::default();
        {
            let mut sched = MappedScheduler::new(&mut self.queue, move |event| Pending::Routing {
                node: index,
                event,
            });
            self.nodes[index]
                .protocol
                .handle_event(event, &mut outbox, &mut sched);
        }
        self.transmit(index, outbox);
    }

    fn on_datagram(&mut self, index: usize, from: SocketAddrV6, to: SocketAddrV6, payload: &[u8]) {
        let before = self.nodes[index].protocol.distance_to_sink();
        let Some(socket) = self.nodes[index].protocol.socket_for(SIM_INTERFACE, *to.ip()) else {
            debug!(node = index, to = %to.ip(), "no socket, datagram dropped");
            return;
        };
        {
            let mut sched = MappedScheduler::new(&mut self.queue, move |event| Pending::Routing {
                node: index,
                event,
            });
            self.nodes[index]
                .protocol
                .recv(&socket, from, payload, &mut sched);
        }
        let after = self.nodes[index].protocol.distance_to_sink();
        if after != before {
            self.event_log.push(SimEvent::DistanceChanged {
                node: index,
                distance: after,
                at: self.queue.now(),
            });
        }
    }

    /// Put one node's outgoing datagrams on the air
    fn transmit(&mut self, from: usize, outbox: Outbox) {
        let neighbors = self.neighbors(from);
        let delay = self.config.link_delay;

        for (socket, payload, to) in outbox.datagrams {
            if payload.len() == 1 {
                self.stats.hellos_sent += 1;
            } else {
                self.stats.acks_sent += 1;
            }

            let receivers: Vec<usize> = if to.ip().is_multicast() {
                neighbors.clone()
            } else {
                neighbors
                    .iter()
                    .copied()
                    .filter(|n| self.nodes[*n].address == *to.ip())
                    .collect()
            };
            if receivers.is_empty() && !to.ip().is_multicast() {
                self.stats.datagrams_dropped += 1;
                self.event_log.push(SimEvent::DatagramDropped { from, to: *to.ip() });
                continue;
            }

            for node in receivers {
                self.stats.datagrams_delivered += 1;
                self.queue.schedule_after(
                    delay,
                    Pending::Datagram {
                        node,
                        from: socket.local,
                        to,
                        payload: payload.clone(),
                    },
                );
            }
        }
    }

    fn on_data(&mut self, index: usize, mut packet: DataPacket) {
        packet.path.push(index);
        let destination = packet.destination;
        let table = self.nodes[index].protocol.table();

        let decision = if self.nodes[index].address == destination {
            Ok(Forwarding::Local(SIM_INTERFACE))
        } else if packet.path.len() == 1 {
            table.route_output(destination, None).map(Forwarding::Forward)
        } else {
            table.route_input(destination, SIM_INTERFACE)
        };

        match decision {
            Ok(Forwarding::Local(_)) => self.deliver(index, packet),
            Ok(Forwarding::Forward(route)) => {
                if packet.path.len() > usize::from(self.config.max_hops) {
                    self.drop_data(index, packet, "hop limit exceeded".to_string());
                    return;
                }
                let next_hop = route.next_hop(destination);
                let next = self
                    .neighbors(index)
                    .into_iter()
                    .find(|n| self.nodes[*n].address == next_hop);
                match next {
                    Some(next) => {
                        debug!(id = packet.id, node = index, next, %next_hop, "forwarding");
                        self.event_log.push(SimEvent::DataForwarded {
                            id: packet.id,
                            node: index,
                            next,
                        });
                        self.queue.schedule_after(
                            self.config.link_delay,
                            Pending::Data { node: next, packet },
                        );
                    }
                    None => {
                        let reason = format!("next hop {} out of range", next_hop);
                        self.drop_data(index, packet, reason);
                    }
                }
            }
            Err(err) => self.drop_data(index, packet, err.to_string()),
        }
    }

    fn deliver(&mut self, index: usize, packet: DataPacket) {
        let latency = self.queue.now().saturating_sub(packet.sent_at);
        let hops = packet.hops();
        info!(id = packet.id, node = index, hops, ?latency, "data delivered");
        self.stats.data_delivered += 1;
        self.stats.total_hops += hops as u64;
        self.event_log.push(SimEvent::DataDelivered {
            id: packet.id,
            node: index,
            hops,
            latency,
        });
        self.nodes[index].received.push(packet);
    }

    fn drop_data(&mut self, index: usize, packet: DataPacket, reason: String) {
        debug!(id = packet.id, node = index, %reason, "data dropped");
        self.stats.data_dropped += 1;
        self.event_log.push(SimEvent::DataDropped {
            id: packet.id,
            node: index,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_node_position_distance() {
        let a = NodePosition::new(0.0, 0.0);
        let b = NodePosition::new(3.0, 4.0);
        assert!((a.distance_to(&b) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_config_validate() {
        assert!(SimConfig::default().validate().is_ok());
        assert!(SimConfig::default().with_radio_range(0.0).validate().is_err());
        assert!(SimConfig::default().with_max_hops(0).validate().is_err());
        assert!(matches!(
            MeshSimulator::new(SimConfig::default().with_max_hops(0)),
            Err(SimError::Config(_))
        ));
    }

    #[test]
    fn test_addresses_and_neighbors() {
        let sim = MeshSimulator::line(SimConfig::default(), 3, 100.0).unwrap();
        assert_eq!(sim.node(0).unwrap().address(), "2001:db8::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(sim.node(2).unwrap().address(), "2001:db8::3".parse::<Ipv6Addr>().unwrap());
        assert_eq!(sim.neighbors(0), vec![1]);
        assert_eq!(sim.neighbors(1), vec![0, 2]);
        assert_eq!(sim.neighbors(2), vec![1]);
        assert!(sim.neighbors(9).is_empty());
        assert!(matches!(sim.node(3), Err(SimError::UnknownNode(3))));
    }

    #[test]
    fn test_distances_converge() {
        let mut sim = MeshSimulator::line(SimConfig::default(), 4, 100.0).unwrap();
        sim.run_until(ms(1000));
        let distances: Vec<u8> = sim.nodes().iter().map(|n| n.distance_to_sink()).collect();
        assert_eq!(distances, vec![0, 1, 2, 3]);
        assert!(sim.stats().hellos_sent >= 4);
        assert!(sim.stats().acks_sent >= 3);
    }

    #[test]
    fn test_unreachable_node_keeps_infinite_distance() {
        let mut sim = MeshSimulator::new(SimConfig::default()).unwrap();
        sim.add_node("sink", NodePosition::new(0.0, 0.0), true).unwrap();
        sim.add_node("far", NodePosition::new(1000.0, 0.0), false).unwrap();
        sim.run_until(ms(500));
        assert_eq!(sim.node(1).unwrap().distance_to_sink(), INFINITE_DISTANCE);
    }

    #[test]
    fn test_send_without_route_is_dropped() {
        let mut sim = MeshSimulator::new(SimConfig::default()).unwrap();
        sim.add_node("lonely", NodePosition::new(0.0, 0.0), false).unwrap();
        let id = sim
            .send(0, "2001:db8::99".parse().unwrap(), vec![1])
            .unwrap();
        sim.run_until(ms(10));
        assert!(sim.delivered(id).is_none());
        assert_eq!(sim.stats().data_dropped, 1);
        assert!(matches!(
            sim.event_log().last(),
            Some(SimEvent::DataDropped { reason, .. }) if reason.contains("no route")
        ));
    }

    #[test]
    fn test_send_to_self_is_local() {
        let mut sim = MeshSimulator::line(SimConfig::default(), 1, 0.0).unwrap();
        let me = sim.node(0).unwrap().address();
        let id = sim.send(0, me, vec![]).unwrap();
        sim.run_until(ms(1));
        assert_eq!(sim.delivered(id).unwrap().hops(), 0);
    }

    #[test]
    fn test_address_space_exhausted() {
        let config = SimConfig {
            address_prefix: Ipv6Addr::from(u128::MAX - 1),
            ..SimConfig::default()
        };
        let mut sim = MeshSimulator::new(config).unwrap();
        sim.add_node("last", NodePosition::new(0.0, 0.0), true).unwrap();
        assert_eq!(sim.node(0).unwrap().address(), Ipv6Addr::from(u128::MAX));

        let err = sim
            .add_node("overflow", NodePosition::new(10.0, 0.0), false)
            .unwrap_err();
        assert!(matches!(err, SimError::AddressSpaceExhausted { index: 1, .. }));
        assert_eq!(sim.nodes().len(), 1);
    }

    #[test]
    fn test_unknown_sender_rejected() {
        let mut sim = MeshSimulator::new(SimConfig::default()).unwrap();
        assert!(matches!(
            sim.send(0, Ipv6Addr::LOCALHOST, vec![]),
            Err(SimError::UnknownNode(0))
        ));
    }
}
