//! Interface table
//!
//! Interfaces are L3 ports: each has an id, a routing domain, an optional
//! IPv4 address and a TX channel drained by whoever sits behind the port.
//! The table is read by every worker; updates swap in a new map.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam_channel::Sender;
use ipnet::Ipv4Net;

use super::packet::Packet;

/// Routing domain (VRF) identifier
pub type DomainId = u16;

/// Interface identifier
pub type IfaceId = u16;

/// Domain filter value matching every domain
pub const ALL_DOMAINS: DomainId = u16::MAX;

/// A configured interface
#[derive(Debug)]
pub struct Iface {
    pub id: IfaceId,
    pub name: String,
    pub domain: DomainId,
    pub address: Option<Ipv4Net>,
    tx: Sender<Packet>,
}

impl Iface {
    pub fn new(
        id: IfaceId,
        name: impl Into<String>,
        domain: DomainId,
        address: Option<Ipv4Net>,
        tx: Sender<Packet>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            domain,
            address,
            tx,
        }
    }

    /// Queue a packet for transmission, handing it back if the port is full.
    pub fn transmit(&self, packet: Packet) -> Result<(), Packet> {
        self.tx.try_send(packet).map_err(|e| e.into_inner())
    }
}

/// Lock-free readable interface table
pub struct IfaceTable {
    ifaces: ArcSwap<HashMap<IfaceId, Arc<Iface>>>,
}

impl IfaceTable {
    pub fn new() -> Self {
        Self {
            ifaces: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Insert or replace an interface.
    pub fn insert(&self, iface: Iface) {
        let mut map = (**self.ifaces.load()).clone();
        map.insert(iface.id, Arc::new(iface));
        self.ifaces.store(Arc::new(map));
    }

    pub fn get(&self, id: IfaceId) -> Option<Arc<Iface>> {
        self.ifaces.load().get(&id).cloned()
    }

    /// Interface owning `addr` in `domain`, if the address is local.
    pub fn local(&self, domain: DomainId, addr: Ipv4Addr) -> Option<Arc<Iface>> {
        self.ifaces
            .load()
            .values()
            .find(|i| i.domain == domain && i.address.is_some_and(|a| a.addr() == addr))
            .cloned()
    }

    /// All interfaces sorted by id.
    pub fn list(&self) -> Vec<Arc<Iface>> {
        let mut ifaces: Vec<_> = self.ifaces.load().values().cloned().collect();
        ifaces.sort_by_key(|i| i.id);
        ifaces
    }
}

impl Default for IfaceTable {
    fn default() -> Self {
        Self::new()
    }
}
