//! Packet buffers and per-packet metadata
//!
//! Packets are allocated from a fixed-size `PacketPool`. A `Packet` owns its
//! buffer exclusively: moving it hands ownership to the next stage, dropping
//! it returns the buffer to the pool. The pool's `in_use` counter makes leaks
//! observable in tests.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;

use super::iface::{DomainId, IfaceId};
use crate::control::output::PuntHandler;
use crate::nexthop::{NexthopHold, NexthopRef};

/// Default size of a single packet buffer (headroom included)
pub const BUFFER_SIZE: usize = 2048;

/// Default headroom reserved in front of the packet data
pub const HEADROOM: usize = 128;

/// Default number of buffers in a pool
pub const POOL_SIZE: usize = 4096;

/// EtherType for IPv4 payloads
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// EtherType for MPLS unicast payloads
pub const ETHERTYPE_MPLS: u16 = 0x8847;

/// Monotonic microsecond clock shared by the send and receive paths.
///
/// Echo requests embed `now_us()` in their payload and punted replies are
/// stamped with it on arrival, so both values must come from the same epoch.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Microseconds elapsed since the clock was created.
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Duration between two timestamps taken from this clock.
    pub fn between(sent_us: u64, received_us: u64) -> Duration {
        Duration::from_micros(received_us.saturating_sub(sent_us))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Addressing for locally originated or locally delivered IPv4 traffic
#[derive(Debug, Clone, Copy)]
pub struct IpMeta {
    pub domain: DomainId,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub ttl: u8,
}

impl Default for IpMeta {
    fn default() -> Self {
        Self {
            domain: 0,
            src: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
            proto: 0,
            ttl: 0,
        }
    }
}

/// Label context for one traversal of the MPLS stages
#[derive(Debug, Clone, Copy, Default)]
pub struct MplsMeta {
    pub domain: DomainId,
    pub label: u32,
}

/// Set by a stage that punts the packet to the control thread
#[derive(Clone)]
pub struct PuntMeta {
    pub callback: Arc<dyn PuntHandler>,
    /// Receive timestamp, from `Clock::now_us`
    pub timestamp: u64,
}

/// Echo request parameters carried from the control thread into a worker
#[derive(Debug)]
pub struct EchoRequestMeta {
    pub domain: DomainId,
    pub dst: Ipv4Addr,
    /// Keeps the gateway nexthop alive until the request has been built
    pub hold: NexthopHold,
    pub sequence: u16,
    pub ttl: u8,
}

/// Private metadata region attached to every packet.
///
/// Fields are written by the stage that owns the corresponding layer and
/// are only meaningful along the path that set them.
#[derive(Default)]
pub struct PacketMeta {
    pub ethertype: u16,
    pub iface_in: Option<IfaceId>,
    pub iface_out: Option<IfaceId>,
    pub nexthop: Option<NexthopRef>,
    /// Label `ip_forward` imposes before transmit
    pub push_label: Option<u32>,
    pub ip: IpMeta,
    pub mpls: MplsMeta,
    pub punt: Option<PuntMeta>,
    pub echo_request: Option<EchoRequestMeta>,
}

struct PoolInner {
    free: ArrayQueue<Box<[u8]>>,
    buffer_size: usize,
    headroom: usize,
    in_use: AtomicUsize,
}

/// Fixed-capacity packet buffer pool.
///
/// Cloning is cheap; all clones allocate from the same set of buffers.
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

impl PacketPool {
    /// Create a pool of `count` buffers of `buffer_size` bytes each.
    pub fn new(count: usize, buffer_size: usize, headroom: usize) -> Self {
        let free = ArrayQueue::new(count.max(1));
        for _ in 0..count {
            let _ = free.push(vec![0u8; buffer_size].into_boxed_slice());
        }
        Self {
            inner: Arc::new(PoolInner {
                free,
                buffer_size,
                headroom: headroom.min(buffer_size),
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// Take an empty packet from the pool, `None` when exhausted.
    pub fn alloc(&self) -> Option<Packet> {
        let buf = self.inner.free.pop()?;
        self.inner.in_use.fetch_add(1, Ordering::Relaxed);
        Some(Packet {
            buf,
            start: self.inner.headroom,
            end: self.inner.headroom,
            pool: Arc::clone(&self.inner),
            meta: PacketMeta::default(),
        })
    }

    /// Allocate a packet and copy `data` into it.
    pub fn alloc_from(&self, data: &[u8]) -> Option<Packet> {
        let mut packet = self.alloc()?;
        packet.append(data.len())?.copy_from_slice(data);
        Some(packet)
    }

    /// Number of packets currently allocated.
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Relaxed)
    }

    /// Number of buffers available for allocation.
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }
}

/// An owned packet.
///
/// The data window `[start, end)` sits inside the buffer; bytes before
/// `start` are headroom that `prepend` can claim.
pub struct Packet {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    pool: Arc<PoolInner>,
    pub meta: PacketMeta,
}

impl Packet {
    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn headroom(&self) -> usize {
        self.start
    }

    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.end
    }

    /// Grow the data window by `len` bytes at the front.
    ///
    /// Returns the new leading bytes, or `None` if headroom is insufficient.
    pub fn prepend(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.start {
            return None;
        }
        self.start -= len;
        Some(&mut self.buf[self.start..self.start + len])
    }

    /// Strip `len` bytes from the front. The bytes stay in headroom.
    pub fn adj(&mut self, len: usize) -> bool {
        if len > self.len() {
            return false;
        }
        self.start += len;
        true
    }

    /// Grow the data window by `len` bytes at the end.
    pub fn append(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.tailroom() {
            return None;
        }
        let old_end = self.end;
        self.end += len;
        Some(&mut self.buf[old_end..self.end])
    }

    /// Shrink the data window to at most `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.end = self.start + len;
        }
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        // Pool capacity equals the number of buffers, push cannot fail
        let _ = self.pool.free.push(buf);
        self.pool.in_use.fetch_sub(1, Ordering::Relaxed);
    }
}
