//! IPv6 routing table
//!
//! Entries map a destination prefix to an output interface and an optional
//! gateway. Lookup is longest-prefix match; among entries of equal prefix
//! length the lowest metric wins, and among those the most recently inserted
//! one. A full-length (/128) match ends the search at once.
//!
//! The table also tracks interface state: an interface going down takes all
//! of its routes with it, and addresses added to an interface install an
//! on-link route for their prefix.

use std::fmt;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::interface::{InterfaceAddress, Interfaces};
use crate::error::{RoutingError, RoutingResult};

/// Bit mask of a prefix length
pub fn prefix_mask(prefix_len: u8) -> u128 {
    match prefix_len {
        0 => 0,
        n if n >= 128 => u128::MAX,
        n => u128::MAX << (128 - u32::from(n)),
    }
}

/// Whether `address` falls inside `network/prefix_len`
pub fn prefix_matches(network: Ipv6Addr, prefix_len: u8, address: Ipv6Addr) -> bool {
    (u128::from(network) ^ u128::from(address)) & prefix_mask(prefix_len) == 0
}

/// `address` with the host bits cleared
pub fn network_of(address: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(address) & prefix_mask(prefix_len))
}

/// Number of leading bits two addresses share
pub fn common_prefix_len(a: Ipv6Addr, b: Ipv6Addr) -> u8 {
    (u128::from(a) ^ u128::from(b)).leading_zeros() as u8
}

/// One row of the routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTableEntry {
    pub destination: Ipv6Addr,
    pub prefix_len: u8,
    /// Next hop; unspecified means the destination is on-link
    pub gateway: Ipv6Addr,
    pub interface: u32,
    /// Prefix to pick the source address from
    pub prefix_to_use: Option<Ipv6Addr>,
    /// Lower is better
    pub metric: u32,
}

impl RoutingTableEntry {
    pub fn is_host(&self) -> bool {
        self.prefix_len == 128
    }

    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    pub fn is_gateway(&self) -> bool {
        !self.gateway.is_unspecified()
    }

    pub fn matches(&self, address: Ipv6Addr) -> bool {
        prefix_matches(self.destination, self.prefix_len, address)
    }

    /// `route -n` style flags
    pub fn flags(&self) -> &'static str {
        if self.is_host() {
            "UH"
        } else if self.is_gateway() {
            "UG"
        } else {
            "U"
        }
    }
}

/// Result of a lookup: where to send a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination of the matching entry
    pub destination: Ipv6Addr,
    /// Unspecified when the destination is on-link
    pub gateway: Ipv6Addr,
    /// Source address to use, if the interface has one
    pub source: Option<Ipv6Addr>,
    pub interface: u32,
}

impl Route {
    /// Address to hand the packet to for a final destination of `destination`
    pub fn next_hop(&self, destination: Ipv6Addr) -> Ipv6Addr {
        if self.gateway.is_unspecified() {
            destination
        } else {
            self.gateway
        }
    }
}

/// Outcome of routing an inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Forwarding {
    /// Addressed to this node, arrived for delivery on this interface
    Local(u32),
    /// Forward along this route
    Forward(Route),
}

/// Static routing table with interface tracking
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    entries: Vec<RoutingTableEntry>,
    interfaces: Interfaces,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interfaces(&self) -> &Interfaces {
        &self.interfaces
    }

    pub fn entries(&self) -> &[RoutingTableEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, entry: RoutingTableEntry) {
        debug!(
            destination = %entry.destination,
            prefix_len = entry.prefix_len,
            gateway = %entry.gateway,
            interface = entry.interface,
            metric = entry.metric,
            "route added"
        );
        self.entries.push(entry);
    }

    /// Route to `network/prefix_len`, through `gateway` when given
    pub fn add_network_route(
        &mut self,
        network: Ipv6Addr,
        prefix_len: u8,
        gateway: Option<Ipv6Addr>,
        interface: u32,
        metric: u32,
    ) {
        self.add_network_route_with_source(network, prefix_len, gateway, interface, None, metric);
    }

    /// Route to `network/prefix_len` with a preferred source prefix
    pub fn add_network_route_with_source(
        &mut self,
        network: Ipv6Addr,
        prefix_len: u8,
        gateway: Option<Ipv6Addr>,
        interface: u32,
        prefix_to_use: Option<Ipv6Addr>,
        metric: u32,
    ) {
        let prefix_len = prefix_len.min(128);
        self.push(RoutingTableEntry {
            destination: network_of(network, prefix_len),
            prefix_len,
            gateway: gateway.unwrap_or(Ipv6Addr::UNSPECIFIED),
            interface,
            prefix_to_use,
            metric,
        });
    }

    /// Route to a single address
    pub fn add_host_route(
        &mut self,
        destination: Ipv6Addr,
        gateway: Option<Ipv6Addr>,
        interface: u32,
        metric: u32,
    ) {
        self.add_network_route(destination, 128, gateway, interface, metric);
    }

    /// Route of last resort through `next_hop`
    pub fn set_default_route(
        &mut self,
        next_hop: Ipv6Addr,
        interface: u32,
        prefix_to_use: Option<Ipv6Addr>,
        metric: u32,
    ) {
        self.add_network_route_with_source(
            Ipv6Addr::UNSPECIFIED,
            0,
            Some(next_hop),
            interface,
            prefix_to_use,
            metric,
        );
    }

    pub fn route(&self, index: usize) -> RoutingResult<&RoutingTableEntry> {
        self.entries
            .get(index)
            .ok_or(RoutingError::RouteIndexOutOfRange {
                index,
                len: self.entries.len(),
            })
    }

    pub fn metric(&self, index: usize) -> RoutingResult<u32> {
        self.route(index).map(|e| e.metric)
    }

    pub fn remove_route_at(&mut self, index: usize) -> RoutingResult<RoutingTableEntry> {
        if index >= self.entries.len() {
            return Err(RoutingError::RouteIndexOutOfRange {
                index,
                len: self.entries.len(),
            });
        }
        let entry = self.entries.remove(index);
        debug!(destination = %entry.destination, prefix_len = entry.prefix_len, "route removed");
        Ok(entry)
    }

    /// Remove the first entry for `network/prefix_len` on `interface`
    pub fn remove_route(
        &mut self,
        network: Ipv6Addr,
        prefix_len: u8,
        interface: u32,
        prefix_to_use: Option<Ipv6Addr>,
    ) -> Option<RoutingTableEntry> {
        let network = network_of(network, prefix_len);
        let index = self.entries.iter().position(|e| {
            e.destination == network
                && e.prefix_len == prefix_len
                && e.interface == interface
                && e.prefix_to_use == prefix_to_use
        })?;
        self.remove_route_at(index).ok()
    }

    /// Whether a non-default route on `interface` covers `address`
    ///
    /// Default routes match everything and never count as knowing a
    /// particular neighbor.
    pub fn has_network_dest(&self, address: Ipv6Addr, interface: u32) -> bool {
        self.entries
            .iter()
            .any(|e| e.interface == interface && !e.is_default() && e.matches(address))
    }

    /// Default route with the lowest metric; later entries win ties
    pub fn default_route(&self) -> Option<&RoutingTableEntry> {
        self.entries
            .iter()
            .filter(|e| e.is_default())
            .fold(None, |best: Option<&RoutingTableEntry>, e| match best {
                Some(b) if b.metric < e.metric => Some(b),
                _ => Some(e),
            })
    }

    /// Longest-prefix lookup, optionally restricted to one output interface
    pub fn lookup(&self, destination: Ipv6Addr, interface: Option<u32>) -> Option<Route> {
        let mut best: Option<&RoutingTableEntry> = None;

        for entry in self.entries.iter().rev() {
            if !entry.matches(destination) {
                continue;
            }
            if interface.is_some_and(|i| i != entry.interface) {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    entry.prefix_len > b.prefix_len
                        || (entry.prefix_len == b.prefix_len && entry.metric < b.metric)
                }
            };
            if better {
                trace!(%destination, via = %entry.destination, prefix_len = entry.prefix_len, "candidate route");
                best = Some(entry);
            }
        }

        let entry = best?;
        let source_hint = if !entry.is_gateway() {
            destination
        } else if entry.is_default() {
            entry.prefix_to_use.unwrap_or(destination)
        } else {
            entry.gateway
        };
        Some(Route {
            destination: entry.destination,
            gateway: entry.gateway,
            source: self.interfaces.select_source(entry.interface, source_hint),
            interface: entry.interface,
        })
    }

    /// Route a locally originated packet
    ///
    /// Multicast destinations skip the table and go straight out of
    /// `interface`, which must therefore be given.
    pub fn route_output(
        &self,
        destination: Ipv6Addr,
        interface: Option<u32>,
    ) -> RoutingResult<Route> {
        if destination.is_multicast() {
            let interface = interface.ok_or(RoutingError::NoRouteToHost(destination))?;
            return Ok(Route {
                destination,
                gateway: Ipv6Addr::UNSPECIFIED,
                source: self.interfaces.select_source(interface, destination),
                interface,
            });
        }
        self.lookup(destination, interface).ok_or_else(|| {
            debug!(%destination, "no route to host");
            RoutingError::NoRouteToHost(destination)
        })
    }

    /// Route a packet that arrived on `input`
    pub fn route_input(&self, destination: Ipv6Addr, input: u32) -> RoutingResult<Forwarding> {
        if self.interfaces.get(input).is_none() {
            return Err(RoutingError::UnknownInterface(input));
        }
        if let Some(local) = self.interfaces.owner_of(destination) {
            return Ok(Forwarding::Local(local));
        }
        if !self.interfaces.is_forwarding(input) {
            warn!(%destination, interface = input, "forwarding disabled, dropping");
            return Err(RoutingError::NoRouteToHost(destination));
        }
        self.lookup(destination, None)
            .map(Forwarding::Forward)
            .ok_or(RoutingError::NoRouteToHost(destination))
    }

    pub fn set_forwarding(&mut self, interface: u32, enabled: bool) -> RoutingResult<()> {
        let iface = self
            .interfaces
            .get_mut(interface)
            .ok_or(RoutingError::UnknownInterface(interface))?;
        iface.forwarding = enabled;
        Ok(())
    }

    /// Interface came up: install on-link routes for its addresses
    pub fn notify_interface_up(&mut self, interface: u32) {
        let iface = self.interfaces.ensure(interface);
        iface.up = true;
        let addresses = iface.addresses.clone();
        for address in addresses {
            self.add_address_route(interface, address);
        }
        debug!(interface, "interface up");
    }

    /// Interface went down: every route through it goes away
    pub fn notify_interface_down(&mut self, interface: u32) {
        if let Some(iface) = self.interfaces.get_mut(interface) {
            iface.up = false;
        }
        let before = self.entries.len();
        self.entries.retain(|e| e.interface != interface);
        debug!(interface, removed = before - self.entries.len(), "interface down");
    }

    pub fn notify_add_address(&mut self, interface: u32, address: InterfaceAddress) {
        let iface = self.interfaces.ensure(interface);
        if iface.addresses.contains(&address) {
            return;
        }
        iface.addresses.push(address);
        if iface.up {
            self.add_address_route(interface, address);
        }
    }

    pub fn notify_remove_address(&mut self, interface: u32, address: InterfaceAddress) {
        let Some(iface) = self.interfaces.get_mut(interface) else {
            return;
        };
        iface.addresses.retain(|a| *a != address);
        let network = address.network();
        self.entries.retain(|e| {
            !(e.interface == interface
                && e.destination == network
                && e.prefix_len == address.prefix_len
                && !e.is_gateway())
        });
    }

    /// A route was added by another component
    pub fn notify_add_route(
        &mut self,
        destination: Ipv6Addr,
        prefix_len: u8,
        next_hop: Ipv6Addr,
        interface: u32,
        prefix_to_use: Option<Ipv6Addr>,
    ) {
        let gateway = (!next_hop.is_unspecified()).then_some(next_hop);
        if destination.is_unspecified() {
            self.set_default_route(next_hop, interface, prefix_to_use, 0);
        } else {
            self.add_network_route_with_source(
                destination,
                prefix_len,
                gateway,
                interface,
                prefix_to_use,
                0,
            );
        }
    }

    /// A route was removed by another component
    pub fn notify_remove_route(
        &mut self,
        destination: Ipv6Addr,
        prefix_len: u8,
        next_hop: Ipv6Addr,
        interface: u32,
        prefix_to_use: Option<Ipv6Addr>,
    ) -> Option<RoutingTableEntry> {
        let destination = network_of(destination, prefix_len);
        let index = self.entries.iter().position(|e| {
            e.destination == destination
                && e.prefix_len == prefix_len
                && e.gateway == next_hop
                && e.interface == interface
                && e.prefix_to_use == prefix_to_use
        })?;
        self.remove_route_at(index).ok()
    }

    fn add_address_route(&mut self, interface: u32, address: InterfaceAddress) {
        if address.address.is_loopback() || address.address.is_unspecified() {
            return;
        }
        let network = address.network();
        let exists = self.entries.iter().any(|e| {
            e.interface == interface
                && e.destination == network
                && e.prefix_len == address.prefix_len
                && !e.is_gateway()
        });
        if !exists {
            self.add_network_route(network, address.prefix_len, None, interface, 0);
        }
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Destination                    Next Hop                   Flag Met Ref Use If"
        )?;
        for entry in &self.entries {
            let destination = format!("{}/{}", entry.destination, entry.prefix_len);
            writeln!(
                f,
                "{:<31}{:<27}{:<5}{:<4}-   -   {}",
                destination,
                entry.gateway.to_string(),
                entry.flags(),
                entry.metric,
                entry.interface
            )?;
        }
        Ok(())
    }
}
