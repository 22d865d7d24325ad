//! Nexthop / label directory
//!
//! Maps `(domain, key)` to a forwarding target. Keys are MPLS labels or IPv4
//! gateway addresses. Entries live in a fixed-capacity slot array; a copy-on-write
//! key index maps each `(domain, key)` to a slot.
//!
//! The directory has exactly one writer and any number of readers:
//! - `DirectoryWriter` is owned by the control thread. It is not `Clone`, and
//!   every mutation takes `&mut self`.
//! - `DirectoryReader` is cheap to clone and lock-free. Workers use it for lookups.
//!
//! Handles (`NexthopRef`) carry the generation of the slot they were issued
//! for. Releasing an entry bumps the slot generation, so a handle held across
//! a release resolves to nothing instead of to the slot's next occupant.
//! Readers that already loaded an `Arc<NexthopEntry>` keep a valid snapshot.
//!
//! A `NexthopHold` is a reference that travels across threads, e.g. inside
//! a message to a worker. Dropping it queues the matching decref, which the
//! writer applies on its own thread.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam_channel::{Receiver, Sender, unbounded};
use nix::errno::Errno;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::dataplane::iface::{ALL_DOMAINS, DomainId, IfaceId};

/// Default directory capacity
pub const MAX_NEXTHOPS: usize = 1 << 16;

/// Lowest non-reserved MPLS label
pub const MPLS_LABEL_MIN: u32 = 16;

/// Highest 20-bit MPLS label
pub const MPLS_LABEL_MAX: u32 = (1 << 20) - 1;

/// What a nexthop is keyed by within its domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NexthopKey {
    /// MPLS incoming label
    Label(u32),
    /// IPv4 gateway address
    Addr(Ipv4Addr),
}

impl fmt::Display for NexthopKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NexthopKey::Label(label) => write!(f, "label {label}"),
            NexthopKey::Addr(addr) => write!(f, "{addr}"),
        }
    }
}

/// Generation-checked handle to a directory slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NexthopRef {
    index: u32,
    generation: u32,
}

impl NexthopRef {
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// A published directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NexthopEntry {
    pub domain: DomainId,
    pub key: NexthopKey,
    pub iface: IfaceId,
    #[serde(skip)]
    handle: NexthopRef,
}

impl NexthopEntry {
    pub fn handle(&self) -> NexthopRef {
        self.handle
    }
}

/// A reference owned by something other than the writer.
///
/// The entry stays in the directory at least until the hold is dropped and
/// the writer has collected it (`DirectoryWriter::collect_released`).
#[derive(Debug)]
pub struct NexthopHold {
    nh: NexthopRef,
    release: Sender<NexthopRef>,
}

impl NexthopHold {
    pub fn nexthop(&self) -> NexthopRef {
        self.nh
    }
}

impl Drop for NexthopHold {
    fn drop(&mut self) {
        // The writer is gone after shutdown, and so is every entry
        let _ = self.release.send(self.nh);
    }
}

/// Directory errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NexthopError {
    #[error("Nexthop already exists: domain {domain} {key}")]
    Duplicate { domain: DomainId, key: NexthopKey },

    #[error("Nexthop not found: domain {domain} {key}")]
    NotFound { domain: DomainId, key: NexthopKey },

    #[error("Stale nexthop handle (slot {0})")]
    Stale(u32),

    #[error("Nexthop directory full ({0} entries)")]
    OutOfCapacity(usize),

    #[error("Invalid MPLS label: {0}")]
    InvalidLabel(u32),
}

impl NexthopError {
    pub fn errno(&self) -> Errno {
        match self {
            NexthopError::Duplicate { .. } => Errno::EEXIST,
            NexthopError::NotFound { .. } | NexthopError::Stale(_) => Errno::ENOENT,
            NexthopError::OutOfCapacity(_) => Errno::ENOSPC,
            NexthopError::InvalidLabel(_) => Errno::EINVAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, NexthopError>;

type IndexKey = (DomainId, NexthopKey);

struct Shared {
    slots: Box<[ArcSwapOption<NexthopEntry>]>,
    index: ArcSwap<HashMap<IndexKey, NexthopRef>>,
}

impl Shared {
    fn resolve(&self, nh: NexthopRef) -> Option<Arc<NexthopEntry>> {
        let entry = self.slots.get(nh.index as usize)?.load_full()?;
        (entry.handle == nh).then_some(entry)
    }
}

/// Writer-private bookkeeping for one slot
#[derive(Debug, Clone, Copy, Default)]
struct SlotState {
    generation: u32,
    refcount: i32,
}

/// Directory lifecycle entry point.
pub struct NexthopDirectory;

impl NexthopDirectory {
    /// Allocate a directory with room for `capacity` entries.
    pub fn init(capacity: usize) -> (DirectoryWriter, DirectoryReader) {
        let shared = Arc::new(Shared {
            slots: (0..capacity).map(|_| ArcSwapOption::empty()).collect(),
            index: ArcSwap::new(Arc::new(HashMap::new())),
        });
        let (released_tx, released_rx) = unbounded();
        let writer = DirectoryWriter {
            shared: Arc::clone(&shared),
            slots: vec![SlotState::default(); capacity],
            free: (0..capacity as u32).rev().collect(),
            released_tx,
            released_rx,
        };
        debug!(capacity, "Nexthop directory initialized");
        (writer, DirectoryReader { shared })
    }
}

/// The single mutating side of the directory
pub struct DirectoryWriter {
    shared: Arc<Shared>,
    slots: Vec<SlotState>,
    free: Vec<u32>,
    released_tx: Sender<NexthopRef>,
    released_rx: Receiver<NexthopRef>,
}

impl DirectoryWriter {
    pub fn reader(&self) -> DirectoryReader {
        DirectoryReader {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Insert `(domain, key)` with a reference count of 1.
    ///
    /// With `exist_ok`, an existing entry is returned untouched instead of
    /// failing with `Duplicate`.
    pub fn add(
        &mut self,
        domain: DomainId,
        key: NexthopKey,
        iface: IfaceId,
        exist_ok: bool,
    ) -> Result<NexthopRef> {
        if let NexthopKey::Label(label) = key
            && !(MPLS_LABEL_MIN..=MPLS_LABEL_MAX).contains(&label)
        {
            return Err(NexthopError::InvalidLabel(label));
        }

        if let Some(existing) = self.shared.index.load().get(&(domain, key)) {
            if exist_ok {
                return Ok(*existing);
            }
            return Err(NexthopError::Duplicate { domain, key });
        }

        let index = self
            .free
            .pop()
            .ok_or(NexthopError::OutOfCapacity(self.slots.len()))?;
        let slot = &mut self.slots[index as usize];
        slot.refcount = 1;
        let handle = NexthopRef {
            index,
            generation: slot.generation,
        };

        // Publish the slot before the key so readers never see a dangling index
        self.shared.slots[index as usize].store(Some(Arc::new(NexthopEntry {
            domain,
            key,
            iface,
            handle,
        })));
        let mut map = (**self.shared.index.load()).clone();
        map.insert((domain, key), handle);
        self.shared.index.store(Arc::new(map));

        debug!(domain, %key, iface, slot = index, "Added nexthop");
        Ok(handle)
    }

    /// Take an additional reference. Returns the new count.
    pub fn incref(&mut self, nh: NexthopRef) -> Result<i32> {
        let slot = self.live_slot(nh).ok_or(NexthopError::Stale(nh.index))?;
        slot.refcount += 1;
        Ok(slot.refcount)
    }

    /// Take a reference that is given back by dropping the returned hold.
    pub fn hold(&mut self, nh: NexthopRef) -> Result<NexthopHold> {
        self.incref(nh)?;
        Ok(NexthopHold {
            nh,
            release: self.released_tx.clone(),
        })
    }

    /// Yields the handle of every dropped hold. Pass each to `decref`.
    pub fn released(&self) -> Receiver<NexthopRef> {
        self.released_rx.clone()
    }

    /// Drop the reference of every hold dropped so far. Returns how many.
    pub fn collect_released(&mut self) -> usize {
        let mut collected = 0;
        while let Ok(nh) = self.released_rx.try_recv() {
            self.decref(nh);
            collected += 1;
        }
        collected
    }

    /// Drop one reference, releasing the entry when the count reaches zero.
    ///
    /// Returns true if the entry was released. A stale handle is a no-op.
    pub fn decref(&mut self, nh: NexthopRef) -> bool {
        let Some(slot) = self.live_slot(nh) else {
            trace!(slot = nh.index, "decref on stale nexthop handle");
            return false;
        };
        slot.refcount -= 1;
        if slot.refcount > 0 {
            return false;
        }
        self.release(nh.index);
        true
    }

    /// Delete `(domain, key)` by dropping the directory's own reference.
    ///
    /// The entry stays visible while other holders keep it referenced.
    pub fn del(&mut self, domain: DomainId, key: NexthopKey, missing_ok: bool) -> Result<()> {
        let Some(nh) = self.shared.index.load().get(&(domain, key)).copied() else {
            if missing_ok {
                return Ok(());
            }
            return Err(NexthopError::NotFound { domain, key });
        };
        self.decref(nh);
        Ok(())
    }

    /// Current reference count, `None` for stale handles.
    pub fn refcount(&self, nh: NexthopRef) -> Option<i32> {
        let slot = self.slots.get(nh.index as usize)?;
        (slot.generation == nh.generation && slot.refcount > 0).then_some(slot.refcount)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every entry regardless of its count. Returns how many were live.
    pub fn shutdown(mut self) -> usize {
        let live: Vec<u32> = self
            .shared
            .index
            .load()
            .values()
            .map(|nh| nh.index)
            .collect();
        for index in &live {
            self.release(*index);
        }
        info!(released = live.len(), "Nexthop directory shut down");
        live.len()
    }

    fn live_slot(&mut self, nh: NexthopRef) -> Option<&mut SlotState> {
        let slot = self.slots.get_mut(nh.index as usize)?;
        (slot.generation == nh.generation && slot.refcount > 0).then_some(slot)
    }

    fn release(&mut self, index: u32) {
        let Some(entry) = self.shared.slots[index as usize].swap(None) else {
            return;
        };
        let mut map = (**self.shared.index.load()).clone();
        map.remove(&(entry.domain, entry.key));
        self.shared.index.store(Arc::new(map));

        let slot = &mut self.slots[index as usize];
        *slot = SlotState {
            generation: slot.generation.wrapping_add(1),
            refcount: 0,
        };
        self.free.push(index);
        debug!(domain = entry.domain, key = %entry.key, slot = index, "Released nexthop");
    }
}

/// Lock-free read side of the directory
#[derive(Clone)]
pub struct DirectoryReader {
    shared: Arc<Shared>,
}

impl DirectoryReader {
    pub fn lookup(&self, domain: DomainId, key: NexthopKey) -> Result<Arc<NexthopEntry>> {
        self.shared
            .index
            .load()
            .get(&(domain, key))
            .and_then(|nh| self.shared.resolve(*nh))
            .ok_or(NexthopError::NotFound { domain, key })
    }

    /// Resolve a handle, `None` once the entry has been released.
    pub fn resolve(&self, nh: NexthopRef) -> Option<Arc<NexthopEntry>> {
        self.shared.resolve(nh)
    }

    /// Lazily iterate live entries in slot order.
    ///
    /// `ALL_DOMAINS` matches every domain.
    pub fn list(&self, domain: DomainId) -> impl Iterator<Item = Arc<NexthopEntry>> + '_ {
        self.shared
            .slots
            .iter()
            .filter_map(|slot| slot.load_full())
            .filter(move |entry| domain == ALL_DOMAINS || entry.domain == domain)
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }
}
