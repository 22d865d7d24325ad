//! Echo client on top of the control API
//!
//! Each echo posts one request, then polls for the reply every
//! `poll_interval`, giving up after `poll_attempts` polls.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;
use tracing::{debug, info};

use crate::control::api::{ApiPayload, ApiRequest};
use crate::control::icmp::{EchoParams, EchoReply};
use crate::control::plane::ControlClient;
use crate::dataplane::icmp::ICMP_ECHO_REPLY;
use crate::dataplane::iface::DomainId;

pub const POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const POLL_ATTEMPTS: u32 = 50;

pub const PING_COUNT: u16 = 4;
pub const PING_DELAY: Duration = Duration::from_millis(1000);
pub const PING_TTL: u8 = 64;

pub const TRACEROUTE_MAX_TTL: u8 = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PingError {
    #[error("Echo request rejected: {0}")]
    Rejected(Errno),
}

/// Outcome of one echo request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoOutcome {
    Reply(EchoReply),
    Timeout,
}

impl EchoOutcome {
    pub fn reply(&self) -> Option<&EchoReply> {
        match self {
            EchoOutcome::Reply(reply) => Some(reply),
            EchoOutcome::Timeout => None,
        }
    }
}

/// One traceroute step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub ttl: u8,
    pub outcome: EchoOutcome,
}

pub struct EchoClient {
    client: ControlClient,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl EchoClient {
    pub fn new(client: ControlClient) -> Self {
        Self {
            client,
            poll_interval: POLL_INTERVAL,
            poll_attempts: POLL_ATTEMPTS,
        }
    }

    pub fn with_polling(mut self, interval: Duration, attempts: u32) -> Self {
        self.poll_interval = interval;
        self.poll_attempts = attempts;
        self
    }

    /// Send one echo request and wait for the matching reply.
    ///
    /// Replies carrying another sequence number are stale and skipped.
    pub fn echo(
        &self,
        domain: DomainId,
        dst: Ipv4Addr,
        sequence: u16,
        ttl: u8,
    ) -> Result<EchoOutcome, PingError> {
        let resp = self.client.call(ApiRequest::IcmpEchoRequest(EchoParams {
            domain,
            dst,
            sequence,
            ttl,
        }));
        if let Some(errno) = resp.errno() {
            return Err(PingError::Rejected(errno));
        }

        for _ in 0..self.poll_attempts {
            thread::sleep(self.poll_interval);
            let resp = self.client.call(ApiRequest::IcmpEchoReply);
            if let Some(errno) = resp.errno() {
                return Err(PingError::Rejected(errno));
            }
            if let Some(ApiPayload::EchoReply(reply)) = resp.payload {
                if reply.sequence == sequence {
                    return Ok(EchoOutcome::Reply(reply));
                }
                debug!(expected = sequence, got = reply.sequence, "Skipping stale reply");
            }
        }
        Ok(EchoOutcome::Timeout)
    }

    /// Send `count` echoes, sleeping `delay` after each answered one.
    ///
    /// Stops early when `stop` is set.
    pub fn ping(
        &self,
        domain: DomainId,
        dst: Ipv4Addr,
        count: u16,
        delay: Duration,
        stop: &AtomicBool,
    ) -> Result<Vec<EchoOutcome>, PingError> {
        let mut outcomes = Vec::with_capacity(usize::from(count));
        for sequence in 0..count {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let outcome = self.echo(domain, dst, sequence, PING_TTL)?;
            match &outcome {
                EchoOutcome::Reply(reply) => info!(
                    %dst,
                    seq = sequence,
                    ttl = reply.ttl,
                    rtt_us = reply.rtt.map(|d| d.as_micros() as u64),
                    "Echo reply"
                ),
                EchoOutcome::Timeout => info!(%dst, seq = sequence, "Echo timeout"),
            }
            let answered = outcome.reply().is_some();
            outcomes.push(outcome);
            if answered && sequence + 1 < count {
                thread::sleep(delay);
            }
        }
        Ok(outcomes)
    }

    /// Send echoes with TTL 1, 2, … up to `max_ttl`, stopping at the first echo reply.
    pub fn traceroute(
        &self,
        domain: DomainId,
        dst: Ipv4Addr,
        max_ttl: u8,
        stop: &AtomicBool,
    ) -> Result<Vec<Hop>, PingError> {
        let mut hops = Vec::new();
        for ttl in 1..=max_ttl {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let outcome = self.echo(domain, dst, u16::from(ttl), ttl)?;
            let done = outcome
                .reply()
                .is_some_and(|r| r.icmp_type == ICMP_ECHO_REPLY);
            info!(
                ttl,
                icmp_type = outcome.reply().map(|r| r.icmp_type),
                rtt_us = outcome.reply().and_then(|r| r.rtt).map(|d| d.as_micros() as u64),
                "Hop"
            );
            hops.push(Hop { ttl, outcome });
            if done {
                break;
            }
        }
        Ok(hops)
    }
}
