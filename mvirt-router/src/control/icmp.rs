//! ICMP echo correlation on the control thread
//!
//! Sends echo requests through a worker and keeps the most recent punted
//! reply in a single-slot mailbox until a client collects it. Only one
//! outstanding reply is tracked; a newer one replaces an unread older one.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use nix::errno::Errno;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

use super::output::PuntHandler;
use crate::config::ConfigError;
use crate::dataplane::control_input::{ControlInputMsg, ControlInputs};
use crate::dataplane::icmp::{
    ICMP_DEST_UNREACHABLE, ICMP_ECHO_REPLY, ICMP_HEADER_LEN, ICMP_TIME_EXCEEDED, IcmpHandlers,
};
use crate::dataplane::iface::DomainId;
use crate::dataplane::packet::{Clock, EchoRequestMeta, Packet};
use crate::nexthop::{DirectoryWriter, NexthopError};
use crate::routing::{RouteError, RoutingManager};

/// Most bytes of the reply body copied into `EchoReply::data`
pub const ECHO_DATA_MAX: usize = 64;

#[derive(Debug, Error)]
pub enum EchoError {
    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Nexthop(#[from] NexthopError),

    #[error("Control input queue full")]
    QueueFull,
}

impl EchoError {
    pub fn errno(&self) -> Errno {
        match self {
            EchoError::Route(e) => e.errno(),
            EchoError::Nexthop(e) => e.errno(),
            EchoError::QueueFull => Errno::ENOBUFS,
        }
    }
}

/// Parameters of one echo request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoParams {
    pub domain: DomainId,
    pub dst: Ipv4Addr,
    pub sequence: u16,
    pub ttl: u8,
}

/// Decoded reply, or `answered: false` when nothing has arrived
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EchoReply {
    pub answered: bool,
    pub icmp_type: u8,
    pub code: u8,
    pub sequence: u16,
    /// TTL of the IPv4 header the reply arrived in
    pub ttl: u8,
    pub rtt: Option<Duration>,
    pub data: Vec<u8>,
}

/// Single-slot echo reply store
pub struct EchoCorrelator {
    /// Capacity 1: `force_push` swaps in the newest reply and hands back the old one
    reply: ArrayQueue<Packet>,
}

impl EchoCorrelator {
    pub fn new() -> Self {
        Self {
            reply: ArrayQueue::new(1),
        }
    }

    /// Register for echo replies and the error types an echo request can trigger.
    pub fn register(self: &Arc<Self>, handlers: &mut IcmpHandlers) -> Result<(), ConfigError> {
        for icmp_type in [ICMP_ECHO_REPLY, ICMP_DEST_UNREACHABLE, ICMP_TIME_EXCEEDED] {
            handlers.register(icmp_type, Arc::clone(self) as Arc<dyn PuntHandler>)?;
        }
        Ok(())
    }

    /// Post an echo request to a worker.
    ///
    /// Any unread reply is discarded first. The request carries a hold on
    /// the gateway nexthop, so the entry outlives a route delete until the
    /// worker has built the packet.
    pub fn send_request(
        &self,
        params: EchoParams,
        routing: &RoutingManager,
        directory: &mut DirectoryWriter,
        inputs: &ControlInputs,
    ) -> Result<(), EchoError> {
        self.discard_pending();

        let route = routing.resolve(params.domain, params.dst)?;
        let hold = directory.hold(route.nexthop)?;

        let posted = inputs.post(ControlInputMsg::IcmpEcho(EchoRequestMeta {
            domain: params.domain,
            dst: params.dst,
            hold,
            sequence: params.sequence,
            ttl: params.ttl,
        }));
        if let Err(msg) = posted {
            drop(msg);
            directory.collect_released();
            return Err(EchoError::QueueFull);
        }

        debug!(
            domain = params.domain,
            dst = %params.dst,
            seq = params.sequence,
            ttl = params.ttl,
            "Echo request posted"
        );
        Ok(())
    }

    /// Take the stored reply, if any.
    pub fn take_reply(&self) -> Option<Packet> {
        self.reply.pop()
    }

    /// Collect and decode the stored reply.
    pub fn reply(&self) -> EchoReply {
        self.take_reply()
            .map(|pkt| dissect(&pkt))
            .unwrap_or_default()
    }

    pub fn discard_pending(&self) {
        if self.reply.pop().is_some() {
            trace!("Discarded unread echo reply");
        }
    }
}

impl Default for EchoCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl PuntHandler for EchoCorrelator {
    fn punt(&self, packet: Packet) {
        if self.reply.force_push(packet).is_some() {
            trace!("Replaced unread echo reply");
        }
    }
}

/// Decode a punted ICMP packet whose data window starts at the ICMP header.
///
/// For echo replies the sequence number and send timestamp come from the
/// reply itself. For destination-unreachable and time-exceeded they come
/// from the quoted echo request behind the quoted IPv4 header, and `data`
/// holds the start of that quote.
pub fn dissect(reply: &Packet) -> EchoReply {
    let msg = reply.data();
    let mut out = EchoReply {
        answered: true,
        ttl: reply.meta.ip.ttl,
        ..EchoReply::default()
    };
    if msg.len() < ICMP_HEADER_LEN {
        return out;
    }
    out.icmp_type = msg[0];
    out.code = msg[1];
    let body = &msg[ICMP_HEADER_LEN..];

    let sent_us = match out.icmp_type {
        ICMP_DEST_UNREACHABLE | ICMP_TIME_EXCEEDED => {
            out.data = body[..body.len().min(ECHO_DATA_MAX)].to_vec();
            let inner = body
                .first()
                .map(|b| usize::from(b & 0x0f) * 4)
                .and_then(|ihl| body.get(ihl..));
            if let Some(seq) = inner.and_then(|icmp| read_u16(icmp, 6)) {
                out.sequence = seq;
            }
            inner.and_then(|icmp| read_u64(icmp, ICMP_HEADER_LEN))
        }
        _ => {
            if let Some(seq) = read_u16(msg, 6) {
                out.sequence = seq;
            }
            read_u64(body, 0)
        }
    };

    out.rtt = match (sent_us, reply.meta.punt.as_ref()) {
        (Some(sent), Some(punt)) => Some(Clock::between(sent, punt.timestamp)),
        _ => None,
    };
    out
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u64(buf: &[u8], offset: usize) -> Option<u64> {
    let bytes = buf.get(offset..offset + 8)?;
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}
