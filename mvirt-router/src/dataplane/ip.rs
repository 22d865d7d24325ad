//! L3 input, IPv4 forwarding and port transmit stages
//!
//! ```text
//! l3_input ─┬─ ip_input ─┬─ icmp_input            (local, ICMP)
//!           │            └─ ip_output ── ip_forward ─┬─ port_tx
//!           │                                        └─ mpls_push  (labeled route)
//!           └─ mpls_input
//! ```
//!
//! `ip_output` also loops packets addressed to a local interface back into
//! `ip_input`, so the router can ping its own addresses.

use std::sync::Arc;

use smoltcp::wire::{IpProtocol, Ipv4Packet};
use tracing::trace;

use super::graph::{Edge, Enqueue, Stage};
use super::iface::IfaceTable;
use super::packet::{ETHERTYPE_IPV4, ETHERTYPE_MPLS, IpMeta, MplsMeta, Packet};
use crate::nexthop::DirectoryReader;
use crate::routing::RouteTable;

/// Dispatches on the packet's EtherType
pub struct L3Input;

impl L3Input {
    const IP: Edge = Edge(0);
    const MPLS: Edge = Edge(1);
    const UNSUPPORTED: Edge = Edge(2);
}

impl Stage for L3Input {
    fn name(&self) -> &str {
        "l3_input"
    }

    fn edges(&self) -> &[&'static str] {
        &["ip_input", "mpls_input", "l3_input_unsupported"]
    }

    fn process(&mut self, batch: Vec<Packet>, out: &mut Enqueue<'_>) {
        for pkt in batch {
            let edge = match pkt.meta.ethertype {
                ETHERTYPE_IPV4 => Self::IP,
                ETHERTYPE_MPLS => Self::MPLS,
                _ => Self::UNSUPPORTED,
            };
            out.enqueue(edge, pkt);
        }
    }
}

/// Validates IPv4 headers, delivers local traffic and decrements TTL on transit
pub struct IpInput {
    ifaces: Arc<IfaceTable>,
}

impl IpInput {
    const OUTPUT: Edge = Edge(0);
    const ICMP: Edge = Edge(1);
    const INVALID: Edge = Edge(2);
    const UNSUPPORTED: Edge = Edge(3);
    const TTL_EXCEEDED: Edge = Edge(4);

    pub fn new(ifaces: Arc<IfaceTable>) -> Self {
        Self { ifaces }
    }

    fn classify(&self, pkt: &mut Packet) -> Edge {
        let Some(iface) = pkt.meta.iface_in.and_then(|id| self.ifaces.get(id)) else {
            return Self::INVALID;
        };

        let (header_len, total_len, meta) = {
            let Ok(ip) = Ipv4Packet::new_checked(pkt.data()) else {
                return Self::INVALID;
            };
            if ip.version() != 4 || !ip.verify_checksum() {
                return Self::INVALID;
            }
            let meta = IpMeta {
                domain: iface.domain,
                src: ip.src_addr(),
                dst: ip.dst_addr(),
                proto: u8::from(ip.next_header()),
                ttl: ip.hop_limit(),
            };
            (ip.header_len() as usize, ip.total_len() as usize, meta)
        };
        pkt.truncate(total_len);
        pkt.meta.ip = meta;

        if self.ifaces.local(iface.domain, meta.dst).is_some() {
            if meta.proto != u8::from(IpProtocol::Icmp) {
                return Self::UNSUPPORTED;
            }
            pkt.adj(header_len);
            return Self::ICMP;
        }

        if meta.ttl <= 1 {
            return Self::TTL_EXCEEDED;
        }
        let mut ip = Ipv4Packet::new_unchecked(pkt.data_mut());
        ip.set_hop_limit(meta.ttl - 1);
        ip.fill_checksum();
        pkt.meta.ip.ttl = meta.ttl - 1;
        Self::OUTPUT
    }
}

impl Stage for IpInput {
    fn name(&self) -> &str {
        "ip_input"
    }

    fn edges(&self) -> &[&'static str] {
        &[
            "ip_output",
            "icmp_input",
            "ip_input_invalid",
            "ip_input_unsupported",
            "ip_input_ttl_exceeded",
        ]
    }

    fn process(&mut self, batch: Vec<Packet>, out: &mut Enqueue<'_>) {
        for mut pkt in batch {
            let edge = self.classify(&mut pkt);
            out.enqueue(edge, pkt);
        }
    }
}

/// Routes IPv4 packets by destination, looping local destinations back
pub struct IpOutput {
    ifaces: Arc<IfaceTable>,
    routes: Arc<RouteTable>,
}

impl IpOutput {
    const FORWARD: Edge = Edge(0);
    const LOCAL: Edge = Edge(1);
    const NO_ROUTE: Edge = Edge(2);

    pub fn new(ifaces: Arc<IfaceTable>, routes: Arc<RouteTable>) -> Self {
        Self { ifaces, routes }
    }

    fn route(&self, pkt: &mut Packet) -> Edge {
        let IpMeta { domain, dst, .. } = pkt.meta.ip;
        if let Some(iface) = self.ifaces.local(domain, dst) {
            pkt.meta.iface_in = Some(iface.id);
            return Self::LOCAL;
        }
        match self.routes.lookup(domain, dst) {
            Some(route) => {
                pkt.meta.nexthop = Some(route.nexthop);
                pkt.meta.push_label = route.label;
                Self::FORWARD
            }
            None => {
                trace!(domain, %dst, "No route");
                Self::NO_ROUTE
            }
        }
    }
}

impl Stage for IpOutput {
    fn name(&self) -> &str {
        "ip_output"
    }

    fn edges(&self) -> &[&'static str] {
        &["ip_forward", "ip_input", "ip_output_no_route"]
    }

    fn process(&mut self, batch: Vec<Packet>, out: &mut Enqueue<'_>) {
        for mut pkt in batch {
            let edge = self.route(&mut pkt);
            out.enqueue(edge, pkt);
        }
    }
}

/// Resolves the packet's nexthop handle to an output interface.
///
/// Packets routed with a label leave through `mpls_push` instead, which
/// switches them on that label's directory entry.
pub struct IpForward {
    nexthops: DirectoryReader,
}

impl IpForward {
    const TX: Edge = Edge(0);
    const PUSH: Edge = Edge(1);
    const INVALID: Edge = Edge(2);

    pub fn new(nexthops: DirectoryReader) -> Self {
        Self { nexthops }
    }
}

impl Stage for IpForward {
    fn name(&self) -> &str {
        "ip_forward"
    }

    fn edges(&self) -> &[&'static str] {
        &["port_tx", "mpls_push", "ip_forward_invalid"]
    }

    fn process(&mut self, batch: Vec<Packet>, out: &mut Enqueue<'_>) {
        for mut pkt in batch {
            let Some(entry) = pkt.meta.nexthop.and_then(|nh| self.nexthops.resolve(nh)) else {
                out.enqueue(Self::INVALID, pkt);
                continue;
            };
            pkt.meta.ethertype = ETHERTYPE_IPV4;
            match pkt.meta.push_label.take() {
                Some(label) => {
                    pkt.meta.mpls = MplsMeta {
                        domain: pkt.meta.ip.domain,
                        label,
                    };
                    out.enqueue(Self::PUSH, pkt);
                }
                None => {
                    pkt.meta.iface_out = Some(entry.iface);
                    out.enqueue(Self::TX, pkt);
                }
            }
        }
    }
}

/// Hands packets to the output interface's TX channel
pub struct PortTx {
    ifaces: Arc<IfaceTable>,
}

impl PortTx {
    const ERROR: Edge = Edge(0);

    pub fn new(ifaces: Arc<IfaceTable>) -> Self {
        Self { ifaces }
    }
}

impl Stage for PortTx {
    fn name(&self) -> &str {
        "port_tx"
    }

    fn edges(&self) -> &[&'static str] {
        &["port_tx_error"]
    }

    fn process(&mut self, batch: Vec<Packet>, out: &mut Enqueue<'_>) {
        for pkt in batch {
            let Some(iface) = pkt.meta.iface_out.and_then(|id| self.ifaces.get(id)) else {
                out.enqueue(Self::ERROR, pkt);
                continue;
            };
            if let Err(pkt) = iface.transmit(pkt) {
                trace!(iface = %iface.name, "TX queue full");
                out.enqueue(Self::ERROR, pkt);
            }
        }
    }
}
