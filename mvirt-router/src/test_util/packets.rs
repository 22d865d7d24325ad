//! Protocol packet builders
//!
//! Uses smoltcp for header construction, matching the dataplane stages.

use std::net::Ipv4Addr;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{Icmpv4Packet, IpProtocol, Ipv4Packet, Ipv4Repr};

use crate::dataplane::mpls::{MPLS_HEADER_LEN, MplsHeader};

/// IP header size (without options)
pub const IP_HDR_SIZE: usize = 20;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

/// An ICMP message with a valid checksum.
///
/// `ident` and `sequence` fill the rest-of-header word, which error types
/// leave unused (pass 0).
pub fn icmp_message(icmp_type: u8, code: u8, ident: u16, sequence: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 8 + data.len()];
    buf[0] = icmp_type;
    buf[1] = code;
    buf[4..6].copy_from_slice(&ident.to_be_bytes());
    buf[6..8].copy_from_slice(&sequence.to_be_bytes());
    buf[8..].copy_from_slice(data);
    Icmpv4Packet::new_unchecked(&mut buf[..]).fill_checksum();
    buf
}

fn ipv4(src: Ipv4Addr, dst: Ipv4Addr, ttl: u8, proto: IpProtocol, payload: &[u8]) -> Vec<u8> {
    let repr = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: proto,
        payload_len: payload.len(),
        hop_limit: ttl,
    };
    let mut buf = vec![0u8; repr.buffer_len() + payload.len()];
    let mut packet = Ipv4Packet::new_unchecked(&mut buf[..]);
    repr.emit(&mut packet, &ChecksumCapabilities::default());
    packet.payload_mut().copy_from_slice(payload);
    buf
}

/// An IPv4 packet carrying `payload` as ICMP.
pub fn ipv4_icmp(src: Ipv4Addr, dst: Ipv4Addr, ttl: u8, payload: &[u8]) -> Vec<u8> {
    ipv4(src, dst, ttl, IpProtocol::Icmp, payload)
}

/// An IPv4/UDP packet from port 40000 to 9 with a short payload.
pub fn ipv4_udp(src: Ipv4Addr, dst: Ipv4Addr, ttl: u8) -> Vec<u8> {
    let data = b"payload";
    let mut udp = vec![0u8; UDP_HDR_SIZE + data.len()];
    udp[0..2].copy_from_slice(&40000u16.to_be_bytes());
    udp[2..4].copy_from_slice(&9u16.to_be_bytes());
    let len = udp.len() as u16;
    udp[4..6].copy_from_slice(&len.to_be_bytes());
    udp[UDP_HDR_SIZE..].copy_from_slice(data);
    ipv4(src, dst, ttl, IpProtocol::Udp, &udp)
}

/// Prepend a label stack, outermost first. The last entry gets the BoS bit.
pub fn mpls_stack(labels: &[(u32, u8)], payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; labels.len() * MPLS_HEADER_LEN];
    for (i, &(label, ttl)) in labels.iter().enumerate() {
        MplsHeader {
            label,
            tc: 0,
            bos: i + 1 == labels.len(),
            ttl,
        }
        .emit(&mut buf[i * MPLS_HEADER_LEN..]);
    }
    buf.extend_from_slice(payload);
    buf
}
