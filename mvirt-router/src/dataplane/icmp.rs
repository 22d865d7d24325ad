//! ICMPv4 stages and the per-type handler registry
//!
//! Echo requests to a local address are answered in the dataplane. Every
//! other ICMP type is punted to whichever handler registered for it; types
//! nobody registered for are dropped as unsupported.

use std::collections::HashMap;
use std::sync::Arc;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{IpProtocol, Icmpv4Message, Icmpv4Packet, Icmpv4Repr, Ipv4Packet, Ipv4Repr};
use tracing::{debug, trace};

use super::graph::{Edge, Enqueue, Stage};
use super::iface::IfaceTable;
use super::packet::{Clock, ETHERTYPE_IPV4, IpMeta, Packet, PuntMeta};
use crate::config::ConfigError;
use crate::control::output::PuntHandler;
use crate::nexthop::DirectoryReader;

/// Fixed ICMP header: type, code, checksum, rest-of-header
pub const ICMP_HEADER_LEN: usize = 8;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;

/// Identifier carried by locally originated echo requests
pub const ECHO_IDENT: u16 = 0x4242;

/// TTL of locally originated ICMP messages
pub const ICMP_DEFAULT_TTL: u8 = 64;

/// Maps an ICMP type to the control-side handler its packets are punted to
#[derive(Default)]
pub struct IcmpHandlers {
    handlers: HashMap<u8, Arc<dyn PuntHandler>>,
}

impl IcmpHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `icmp_type`. Each type takes one handler.
    pub fn register(
        &mut self,
        icmp_type: u8,
        handler: Arc<dyn PuntHandler>,
    ) -> Result<(), ConfigError> {
        if icmp_type == ICMP_ECHO_REQUEST || self.handlers.contains_key(&icmp_type) {
            return Err(ConfigError::DuplicateIcmpHandler(icmp_type));
        }
        self.handlers.insert(icmp_type, handler);
        debug!(icmp_type, "Registered ICMP handler");
        Ok(())
    }

    pub fn get(&self, icmp_type: u8) -> Option<&Arc<dyn PuntHandler>> {
        self.handlers.get(&icmp_type)
    }
}

/// Local ICMP delivery. Expects the data window at the ICMP header.
pub struct IcmpInput {
    handlers: Arc<IcmpHandlers>,
    clock: Clock,
}

impl IcmpInput {
    const OUTPUT: Edge = Edge(0);
    const PUNT: Edge = Edge(1);
    const INVALID: Edge = Edge(2);
    const UNSUPPORTED: Edge = Edge(3);

    pub fn new(handlers: Arc<IcmpHandlers>, clock: Clock) -> Self {
        Self { handlers, clock }
    }

    fn dispatch(&self, pkt: &mut Packet) -> Edge {
        if pkt.len() < ICMP_HEADER_LEN {
            return Self::INVALID;
        }
        let (msg_type, code) = {
            let Ok(icmp) = Icmpv4Packet::new_checked(pkt.data()) else {
                return Self::INVALID;
            };
            if !icmp.verify_checksum() {
                return Self::INVALID;
            }
            (u8::from(icmp.msg_type()), icmp.msg_code())
        };

        if msg_type == ICMP_ECHO_REQUEST {
            if code != 0 {
                return Self::INVALID;
            }
            let mut icmp = Icmpv4Packet::new_unchecked(pkt.data_mut());
            icmp.set_msg_type(Icmpv4Message::EchoReply);
            icmp.fill_checksum();

            let ip = &mut pkt.meta.ip;
            std::mem::swap(&mut ip.src, &mut ip.dst);
            ip.ttl = ICMP_DEFAULT_TTL;
            trace!(dst = %ip.dst, "Answering echo request");
            return Self::OUTPUT;
        }

        match self.handlers.get(msg_type) {
            Some(handler) => {
                pkt.meta.punt = Some(PuntMeta {
                    callback: Arc::clone(handler),
                    timestamp: self.clock.now_us(),
                });
                Self::PUNT
            }
            None => Self::UNSUPPORTED,
        }
    }
}

impl Stage for IcmpInput {
    fn name(&self) -> &str {
        "icmp_input"
    }

    fn edges(&self) -> &[&'static str] {
        &[
            "icmp_output",
            "control_output",
            "icmp_input_invalid",
            "icmp_input_unsupported",
        ]
    }

    fn process(&mut self, batch: Vec<Packet>, out: &mut Enqueue<'_>) {
        for mut pkt in batch {
            let edge = self.dispatch(&mut pkt);
            out.enqueue(edge, pkt);
        }
    }
}

/// Wraps a finished ICMP message in an IPv4 header built from `meta.ip`
pub struct IcmpOutput;

impl IcmpOutput {
    const OUTPUT: Edge = Edge(0);
    const NO_HEADROOM: Edge = Edge(1);
}

impl Stage for IcmpOutput {
    fn name(&self) -> &str {
        "icmp_output"
    }

    fn edges(&self) -> &[&'static str] {
        &["ip_output", "icmp_output_no_headroom"]
    }

    fn process(&mut self, batch: Vec<Packet>, out: &mut Enqueue<'_>) {
        for mut pkt in batch {
            let IpMeta { src, dst, ttl, .. } = pkt.meta.ip;
            let repr = Ipv4Repr {
                src_addr: src,
                dst_addr: dst,
                next_header: IpProtocol::Icmp,
                payload_len: pkt.len(),
                hop_limit: ttl,
            };
            let Some(header) = pkt.prepend(repr.buffer_len()) else {
                out.enqueue(Self::NO_HEADROOM, pkt);
                continue;
            };
            repr.emit(
                &mut Ipv4Packet::new_unchecked(header),
                &ChecksumCapabilities::default(),
            );
            pkt.meta.ethertype = ETHERTYPE_IPV4;
            pkt.meta.ip.proto = u8::from(IpProtocol::Icmp);
            out.enqueue(Self::OUTPUT, pkt);
        }
    }
}

/// Builds echo requests handed over by the control thread.
///
/// The payload is the send timestamp, so the reply carries it back.
pub struct IcmpOutputRequest {
    ifaces: Arc<IfaceTable>,
    nexthops: DirectoryReader,
    clock: Clock,
}

impl IcmpOutputRequest {
    const OUTPUT: Edge = Edge(0);
    const ERROR: Edge = Edge(1);

    pub fn new(ifaces: Arc<IfaceTable>, nexthops: DirectoryReader, clock: Clock) -> Self {
        Self {
            ifaces,
            nexthops,
            clock,
        }
    }

    fn build(&self, pkt: &mut Packet) -> Edge {
        // `req.hold` is dropped on return, once the packet no longer needs the entry
        let Some(req) = pkt.meta.echo_request.take() else {
            return Self::ERROR;
        };
        let Some(entry) = self.nexthops.resolve(req.hold.nexthop()) else {
            debug!(dst = %req.dst, "Echo request nexthop released before send");
            return Self::ERROR;
        };
        let Some(src) = self.ifaces.get(entry.iface).and_then(|i| i.address) else {
            return Self::ERROR;
        };

        let timestamp = self.clock.now_us().to_be_bytes();
        let repr = Icmpv4Repr::EchoRequest {
            ident: ECHO_IDENT,
            seq_no: req.sequence,
            data: &timestamp,
        };
        let Some(buf) = pkt.append(repr.buffer_len()) else {
            return Self::ERROR;
        };
        repr.emit(
            &mut Icmpv4Packet::new_unchecked(buf),
            &ChecksumCapabilities::default(),
        );

        pkt.meta.ip = IpMeta {
            domain: req.domain,
            src: src.addr(),
            dst: req.dst,
            proto: u8::from(IpProtocol::Icmp),
            ttl: req.ttl,
        };
        Self::OUTPUT
    }
}

impl Stage for IcmpOutputRequest {
    fn name(&self) -> &str {
        "icmp_output_request"
    }

    fn edges(&self) -> &[&'static str] {
        &["icmp_output", "icmp_request_output_error"]
    }

    fn process(&mut self, batch: Vec<Packet>, out: &mut Enqueue<'_>) {
        for mut pkt in batch {
            let edge = self.build(&mut pkt);
            out.enqueue(edge, pkt);
        }
    }
}
