//! Network interfaces known to the routing table

use std::collections::BTreeMap;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

use super::table::{common_prefix_len, network_of};

/// An address assigned to an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
}

impl InterfaceAddress {
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len: prefix_len.min(128),
        }
    }

    /// Network part of the address
    pub fn network(&self) -> Ipv6Addr {
        network_of(self.address, self.prefix_len)
    }

    /// fe80::/10
    pub fn is_link_local(&self) -> bool {
        is_link_local(self.address)
    }
}

pub(crate) fn is_link_local(address: Ipv6Addr) -> bool {
    (address.segments()[0] & 0xffc0) == 0xfe80
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub index: u32,
    pub up: bool,
    pub forwarding: bool,
    pub addresses: Vec<InterfaceAddress>,
}

impl Interface {
    fn new(index: u32) -> Self {
        Self {
            index,
            up: false,
            forwarding: true,
            addresses: Vec::new(),
        }
    }

    /// First address that is neither loopback nor unspecified
    pub fn primary_address(&self) -> Option<InterfaceAddress> {
        self.addresses
            .iter()
            .find(|a| !a.address.is_loopback() && !a.address.is_unspecified())
            .copied()
    }
}

/// Interface set, keyed by index
#[derive(Debug, Clone, Default)]
pub struct Interfaces {
    map: BTreeMap<u32, Interface>,
}

impl Interfaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an interface, creating it (down, forwarding) if unknown
    pub fn ensure(&mut self, index: u32) -> &mut Interface {
        self.map.entry(index).or_insert_with(|| Interface::new(index))
    }

    pub fn get(&self, index: u32) -> Option<&Interface> {
        self.map.get(&index)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut Interface> {
        self.map.get_mut(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.map.values()
    }

    pub fn is_up(&self, index: u32) -> bool {
        self.map.get(&index).is_some_and(|i| i.up)
    }

    pub fn is_forwarding(&self, index: u32) -> bool {
        self.map.get(&index).is_some_and(|i| i.forwarding)
    }

    /// Interface owning `address`, if any
    pub fn owner_of(&self, address: Ipv6Addr) -> Option<u32> {
        self.map
            .values()
            .find(|i| i.addresses.iter().any(|a| a.address == address))
            .map(|i| i.index)
    }

    /// Pick the source address for traffic to `destination` out of `index`
    ///
    /// Link-local destinations get a link-local source when one exists.
    /// Otherwise the address sharing the longest prefix with the destination
    /// wins, falling back to the first address.
    pub fn select_source(&self, index: u32, destination: Ipv6Addr) -> Option<Ipv6Addr> {
        let iface = self.map.get(&index)?;
        let candidates: Vec<_> = iface
            .addresses
            .iter()
            .filter(|a| !a.address.is_unspecified())
            .collect();

        if is_link_local(destination) {
            if let Some(ll) = candidates.iter().find(|a| a.is_link_local()) {
                return Some(ll.address);
            }
        }

        candidates
            .iter()
            .filter(|a| !a.is_link_local())
            .max_by_key(|a| common_prefix_len(a.address, destination))
            .or_else(|| candidates.first())
            .map(|a| a.address)
    }
}
