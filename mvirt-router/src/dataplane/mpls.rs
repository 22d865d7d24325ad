//! MPLS label stack stages
//!
//! - `mpls_input`: pops the outer label. With more labels below, the new top
//!   label inherits TTL-1 and `mpls_forward` switches on it; at bottom of
//!   stack the IPv4 payload is routed by destination (pipe model, the IP TTL
//!   is left alone).
//! - `mpls_forward`: looks up `(domain, top label)` in the nexthop directory.
//! - `mpls_push`: imposes the label of a labeled route, then hands the
//!   packet to `mpls_forward`.

use std::sync::Arc;

use smoltcp::wire::Ipv4Packet;
use tracing::trace;

use super::graph::{Edge, Enqueue, Stage};
use super::iface::IfaceTable;
use super::packet::{ETHERTYPE_IPV4, ETHERTYPE_MPLS, MplsMeta, Packet};
use crate::nexthop::{DirectoryReader, NexthopKey};
use crate::routing::RouteTable;

/// Size of one label stack entry
pub const MPLS_HEADER_LEN: usize = 4;

/// TTL written into imposed labels
pub const MPLS_DEFAULT_TTL: u8 = 64;

/// One label stack entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MplsHeader {
    pub label: u32,
    pub tc: u8,
    pub bos: bool,
    pub ttl: u8,
}

impl MplsHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let word = u32::from_be_bytes(data.get(..MPLS_HEADER_LEN)?.try_into().ok()?);
        Some(Self {
            label: word >> 12,
            tc: ((word >> 9) & 0x7) as u8,
            bos: (word >> 8) & 0x1 == 1,
            ttl: (word & 0xff) as u8,
        })
    }

    /// Write into the first four bytes of `buf`, which must be long enough.
    pub fn emit(&self, buf: &mut [u8]) {
        let word = ((self.label & 0xf_ffff) << 12)
            | (u32::from(self.tc & 0x7) << 9)
            | (u32::from(self.bos) << 8)
            | u32::from(self.ttl);
        buf[..MPLS_HEADER_LEN].copy_from_slice(&word.to_be_bytes());
    }
}

pub struct MplsInput {
    ifaces: Arc<IfaceTable>,
    routes: Arc<RouteTable>,
}

impl MplsInput {
    const FORWARD: Edge = Edge(0);
    const IP_FORWARD: Edge = Edge(1);
    const NO_ROUTE: Edge = Edge(2);
    const TTL_EXCEEDED: Edge = Edge(3);
    const INVALID: Edge = Edge(4);

    pub fn new(ifaces: Arc<IfaceTable>, routes: Arc<RouteTable>) -> Self {
        Self { ifaces, routes }
    }

    fn pop(&self, pkt: &mut Packet) -> Edge {
        let Some(iface) = pkt.meta.iface_in.and_then(|id| self.ifaces.get(id)) else {
            return Self::INVALID;
        };
        let Some(outer) = MplsHeader::parse(pkt.data()) else {
            return Self::INVALID;
        };
        if !outer.bos && outer.ttl <= 1 {
            return Self::TTL_EXCEEDED;
        }
        pkt.adj(MPLS_HEADER_LEN);

        if outer.bos {
            let dst = match Ipv4Packet::new_checked(pkt.data()) {
                Ok(ip) if ip.version() == 4 => ip.dst_addr(),
                _ => return Self::INVALID,
            };
            let Some(route) = self.routes.lookup(iface.domain, dst) else {
                trace!(domain = iface.domain, %dst, "No route for popped payload");
                return Self::NO_ROUTE;
            };
            pkt.meta.ethertype = ETHERTYPE_IPV4;
            pkt.meta.nexthop = Some(route.nexthop);
            pkt.meta.push_label = route.label;
            pkt.meta.ip.domain = iface.domain;
            pkt.meta.ip.dst = dst;
            return Self::IP_FORWARD;
        }

        let Some(next) = MplsHeader::parse(pkt.data()) else {
            return Self::INVALID;
        };
        MplsHeader {
            ttl: outer.ttl - 1,
            ..next
        }
        .emit(pkt.data_mut());
        pkt.meta.mpls = MplsMeta {
            domain: iface.domain,
            label: next.label,
        };
        Self::FORWARD
    }
}

impl Stage for MplsInput {
    fn name(&self) -> &str {
        "mpls_input"
    }

    fn edges(&self) -> &[&'static str] {
        &[
            "mpls_forward",
            "ip_forward",
            "mpls_input_no_route",
            "mpls_input_ttl_exceeded",
            "mpls_input_invalid",
        ]
    }

    fn process(&mut self, batch: Vec<Packet>, out: &mut Enqueue<'_>) {
        for mut pkt in batch {
            let edge = self.pop(&mut pkt);
            out.enqueue(edge, pkt);
        }
    }
}

/// Label lookup. Unresolved labels are dropped on `mpls_forward_invalid`.
pub struct MplsForward {
    nexthops: DirectoryReader,
}

impl MplsForward {
    const TX: Edge = Edge(0);
    const INVALID: Edge = Edge(1);

    pub fn new(nexthops: DirectoryReader) -> Self {
        Self { nexthops }
    }
}

impl Stage for MplsForward {
    fn name(&self) -> &str {
        "mpls_forward"
    }

    fn edges(&self) -> &[&'static str] {
        &["port_tx", "mpls_forward_invalid"]
    }

    fn process(&mut self, batch: Vec<Packet>, out: &mut Enqueue<'_>) {
        for mut pkt in batch {
            let MplsMeta { domain, label } = pkt.meta.mpls;
            match self.nexthops.lookup(domain, NexthopKey::Label(label)) {
                Ok(entry) => {
                    pkt.meta.ethertype = ETHERTYPE_MPLS;
                    pkt.meta.iface_out = Some(entry.iface);
                    out.enqueue(Self::TX, pkt);
                }
                Err(e) => {
                    trace!(domain, label, error = %e, "Label lookup failed");
                    out.enqueue(Self::INVALID, pkt);
                }
            }
        }
    }
}

/// Imposes `meta.mpls.label` on the packet.
pub struct MplsPush;

impl MplsPush {
    const FORWARD: Edge = Edge(0);
    const NO_HEADROOM: Edge = Edge(1);
}

impl Stage for MplsPush {
    fn name(&self) -> &str {
        "mpls_push"
    }

    fn edges(&self) -> &[&'static str] {
        &["mpls_forward", "mpls_push_no_headroom"]
    }

    fn process(&mut self, batch: Vec<Packet>, out: &mut Enqueue<'_>) {
        for mut pkt in batch {
            let header = MplsHeader {
                label: pkt.meta.mpls.label,
                tc: 0,
                bos: pkt.meta.ethertype != ETHERTYPE_MPLS,
                ttl: MPLS_DEFAULT_TTL,
            };
            let Some(buf) = pkt.prepend(MPLS_HEADER_LEN) else {
                out.enqueue(Self::NO_HEADROOM, pkt);
                continue;
            };
            header.emit(buf);
            pkt.meta.ethertype = ETHERTYPE_MPLS;
            out.enqueue(Self::FORWARD, pkt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::graph::{Graph, GraphBuilder};
    use crate::dataplane::iface::Iface;
    use crate::dataplane::ip::{IpForward, PortTx};
    use crate::dataplane::packet::PacketPool;
    use crate::nexthop::{DirectoryWriter, NexthopDirectory};
    use crate::routing::RoutingManager;
    use crate::test_util::{ipv4_udp, mpls_stack};
    use crossbeam_channel::{Receiver, bounded};

    #[test]
    fn test_header_fields() {
        let header = MplsHeader {
            label: 0xabcde,
            tc: 5,
            bos: true,
            ttl: 200,
        };
        let mut buf = [0u8; 4];
        header.emit(&mut buf);
        assert_eq!(buf, [0xab, 0xcd, 0xeb, 200]);
        assert_eq!(MplsHeader::parse(&buf), Some(header));
        assert_eq!(MplsHeader::parse(&buf[..3]), None);
    }

    struct Fixture {
        graph: Graph,
        pool: PacketPool,
        /// TX side of eth0 (iface 1)
        tx: Receiver<Packet>,
        /// TX side of eth1 (iface 2)
        tx2: Receiver<Packet>,
        writer: DirectoryWriter,
    }

    fn fixture() -> Fixture {
        let ifaces = Arc::new(IfaceTable::new());
        let (tx, rx) = bounded(16);
        ifaces.insert(Iface::new(1, "eth0", 0, Some("10.0.0.1/24".parse().unwrap()), tx));
        let (tx2, rx2) = bounded(16);
        ifaces.insert(Iface::new(2, "eth1", 0, Some("10.0.1.1/24".parse().unwrap()), tx2));

        let (mut writer, reader) = NexthopDirectory::init(16);
        let mut routing = RoutingManager::new(Arc::new(RouteTable::new()));
        routing
            .add_route(
                &mut writer,
                0,
                "192.168.0.0/16".parse().unwrap(),
                "10.0.0.2".parse().unwrap(),
                1,
                false,
            )
            .unwrap();

        let mut builder = GraphBuilder::new(8);
        builder
            .add_stage(MplsInput::new(Arc::clone(&ifaces), Arc::clone(routing.table())))
            .add_stage(MplsForward::new(reader.clone()))
            .add_stage(MplsPush)
            .add_stage(IpForward::new(reader))
            .add_stage(PortTx::new(ifaces));
        for sink in [
            "mpls_input_no_route",
            "mpls_input_ttl_exceeded",
            "mpls_input_invalid",
            "mpls_forward_invalid",
            "mpls_push_no_headroom",
            "ip_forward_invalid",
            "port_tx_error",
        ] {
            builder.add_drop(sink);
        }

        Fixture {
            graph: builder.build().unwrap(),
            pool: PacketPool::new(8, 512, 64),
            tx: rx,
            tx2: rx2,
            writer,
        }
    }

    fn inject(f: &mut Fixture, data: &[u8]) {
        let mut pkt = f.pool.alloc_from(data).unwrap();
        pkt.meta.ethertype = ETHERTYPE_MPLS;
        pkt.meta.iface_in = Some(1);
        f.graph.run_stage("mpls_input", vec![pkt]).unwrap();
    }

    #[test]
    fn test_swap_decrements_ttl() {
        let mut f = fixture();
        f.writer.add(0, NexthopKey::Label(100), 1, false).unwrap();
        f.writer.add(0, NexthopKey::Label(200), 2, false).unwrap();

        let payload = ipv4_udp("10.0.0.5".parse().unwrap(), "192.168.1.1".parse().unwrap(), 64);
        inject(&mut f, &mpls_stack(&[(100, 10), (200, 33)], &payload));

        // Switched on the new top label, not the popped one
        assert!(f.tx.try_recv().is_err());
        let out = f.tx2.try_recv().unwrap();
        let next = MplsHeader::parse(out.data()).unwrap();
        assert_eq!(next.label, 200);
        assert_eq!(next.ttl, 9);
        assert!(next.bos);
        assert_eq!(out.meta.ethertype, ETHERTYPE_MPLS);
        assert_eq!(out.meta.iface_out, Some(2));
    }

    #[test]
    fn test_three_label_stack() {
        let mut f = fixture();
        f.writer.add(0, NexthopKey::Label(200), 2, false).unwrap();
        f.writer.add(0, NexthopKey::Label(300), 1, false).unwrap();

        let payload = ipv4_udp("10.0.0.5".parse().unwrap(), "192.168.1.1".parse().unwrap(), 64);
        inject(&mut f, &mpls_stack(&[(100, 20), (200, 64), (300, 64)], &payload));

        let out = f.tx2.try_recv().unwrap();
        let top = MplsHeader::parse(out.data()).unwrap();
        assert_eq!(top.label, 200);
        assert_eq!(top.ttl, 19);
        assert!(!top.bos);
        assert_eq!(out.len(), MPLS_HEADER_LEN * 2 + payload.len());
    }

    #[test]
    fn test_ttl_one_dropped() {
        let mut f = fixture();
        f.writer.add(0, NexthopKey::Label(100), 1, false).unwrap();

        let payload = ipv4_udp("10.0.0.5".parse().unwrap(), "192.168.1.1".parse().unwrap(), 64);
        inject(&mut f, &mpls_stack(&[(100, 1), (200, 64)], &payload));

        assert!(f.tx.try_recv().is_err());
        assert_eq!(f.graph.stats().packets("mpls_input_ttl_exceeded"), 1);
        assert_eq!(f.pool.in_use(), 0);
    }

    #[test]
    fn test_unknown_label_dropped() {
        let mut f = fixture();
        // Only the outer label is known
        f.writer.add(0, NexthopKey::Label(100), 1, false).unwrap();
        let payload = ipv4_udp("10.0.0.5".parse().unwrap(), "192.168.1.1".parse().unwrap(), 64);
        inject(&mut f, &mpls_stack(&[(100, 10), (200, 64)], &payload));

        assert_eq!(f.graph.stats().packets("mpls_forward_invalid"), 1);
        assert_eq!(f.pool.in_use(), 0);
    }

    #[test]
    fn test_bottom_of_stack_routes_payload() {
        let mut f = fixture();
        let payload = ipv4_udp("10.0.0.5".parse().unwrap(), "192.168.1.1".parse().unwrap(), 64);
        inject(&mut f, &mpls_stack(&[(100, 1)], &payload));

        let out = f.tx.try_recv().unwrap();
        assert_eq!(out.meta.ethertype, ETHERTYPE_IPV4);
        assert_eq!(out.data(), &payload[..]);
    }

    #[test]
    fn test_bottom_of_stack_no_route() {
        let mut f = fixture();
        let payload = ipv4_udp("10.0.0.5".parse().unwrap(), "172.16.0.1".parse().unwrap(), 64);
        inject(&mut f, &mpls_stack(&[(100, 64)], &payload));
        assert_eq!(f.graph.stats().packets("mpls_input_no_route"), 1);
    }

    #[test]
    fn test_push_sets_bos_on_ip_payload() {
        let mut f = fixture();
        f.writer.add(0, NexthopKey::Label(300), 1, false).unwrap();

        let payload = ipv4_udp("10.0.0.5".parse().unwrap(), "192.168.1.1".parse().unwrap(), 64);
        let mut pkt = f.pool.alloc_from(&payload).unwrap();
        pkt.meta.ethertype = ETHERTYPE_IPV4;
        pkt.meta.mpls = MplsMeta {
            domain: 0,
            label: 300,
        };
        f.graph.run_stage("mpls_push", vec![pkt]).unwrap();

        let out = f.tx.try_recv().unwrap();
        let header = MplsHeader::parse(out.data()).unwrap();
        assert_eq!(header.label, 300);
        assert_eq!(header.ttl, MPLS_DEFAULT_TTL);
        assert!(header.bos);
        assert_eq!(&out.data()[MPLS_HEADER_LEN..], &payload[..]);
    }

    #[test]
    fn test_push_without_headroom() {
        let mut f = fixture();
        let pool = PacketPool::new(1, 64, 0);
        let mut pkt = pool.alloc_from(&[0u8; 20]).unwrap();
        pkt.meta.ethertype = ETHERTYPE_IPV4;
        f.graph.run_stage("mpls_push", vec![pkt]).unwrap();

        assert_eq!(f.graph.stats().packets("mpls_push_no_headroom"), 1);
        assert_eq!(pool.in_use(), 0);
    }
}
