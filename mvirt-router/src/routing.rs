//! LPM (Longest Prefix Match) IPv4 routing, one table per domain.
//!
//! This module provides:
//! - `Route`: a prefix resolved to a gateway nexthop in the directory,
//!   optionally with an MPLS label to impose
//! - `LpmTable`: a single domain's prefix map
//! - `RouteTable`: all domains, readable lock-free from worker threads
//! - `RoutingManager`: the control-thread writer that keeps gateway
//!   nexthops referenced for as long as a route points at them

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::Ipv4Net;
use nix::errno::Errno;
use prefix_trie::PrefixMap;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::dataplane::iface::{ALL_DOMAINS, DomainId, IfaceId};
use crate::nexthop::{
    DirectoryWriter, MPLS_LABEL_MAX, MPLS_LABEL_MIN, NexthopError, NexthopKey, NexthopRef,
};

/// A routing table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Route {
    pub prefix: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub iface: IfaceId,
    /// Outgoing label. Traffic leaves through `mpls_push` and is switched
    /// on this label's directory entry.
    pub label: Option<u32>,
    /// Directory handle of the gateway nexthop, referenced by this route
    #[serde(skip)]
    pub nexthop: NexthopRef,
}

/// Routing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("Route already exists: domain {0} {1}")]
    Exists(DomainId, Ipv4Net),

    #[error("Route not found: domain {0} {1}")]
    NotFound(DomainId, Ipv4Net),

    #[error("No route to {1} in domain {0}")]
    NoRoute(DomainId, Ipv4Addr),

    #[error("Gateway {gateway} is already reached through interface {iface}")]
    GatewayIface { gateway: Ipv4Addr, iface: IfaceId },

    #[error("Nexthop error: {0}")]
    Nexthop(#[from] NexthopError),
}

impl RouteError {
    pub fn errno(&self) -> Errno {
        match self {
            RouteError::Exists(..) => Errno::EEXIST,
            RouteError::NotFound(..) => Errno::ENOENT,
            RouteError::NoRoute(..) => Errno::EHOSTUNREACH,
            RouteError::GatewayIface { .. } => Errno::EINVAL,
            RouteError::Nexthop(e) => e.errno(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RouteError>;

/// A single domain's LPM table.
#[derive(Clone)]
pub struct LpmTable {
    routes: PrefixMap<Ipv4Net, Route>,
}

impl LpmTable {
    pub fn new() -> Self {
        Self {
            routes: PrefixMap::new(),
        }
    }

    /// Lookup IPv4 address, returns longest matching prefix.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<&Route> {
        let prefix = Ipv4Net::new(addr, 32).ok()?;
        self.routes.get_lpm(&prefix).map(|(_, route)| route)
    }

    /// Exact-match lookup.
    pub fn get(&self, prefix: &Ipv4Net) -> Option<&Route> {
        self.routes.get(prefix)
    }

    pub fn insert(&mut self, route: Route) -> Option<Route> {
        self.routes.insert(route.prefix, route)
    }

    pub fn remove(&mut self, prefix: &Ipv4Net) -> Option<Route> {
        self.routes.remove(prefix)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().map(|(_, route)| route)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.iter().next().is_none()
    }
}

impl Default for LpmTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Routing tables for all domains.
///
/// Lookups load a snapshot without locking. Updates clone the affected
/// domain's table and swap the map, so they belong on the control thread.
pub struct RouteTable {
    tables: ArcSwap<HashMap<DomainId, Arc<LpmTable>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            tables: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    pub fn lookup(&self, domain: DomainId, addr: Ipv4Addr) -> Option<Route> {
        self.tables.load().get(&domain)?.lookup(addr).copied()
    }

    pub fn get(&self, domain: DomainId, prefix: &Ipv4Net) -> Option<Route> {
        self.tables.load().get(&domain)?.get(prefix).copied()
    }

    /// All routes of `domain` (or every domain for `ALL_DOMAINS`).
    pub fn list(&self, domain: DomainId) -> Vec<(DomainId, Route)> {
        let tables = self.tables.load();
        let mut routes: Vec<_> = tables
            .iter()
            .filter(|(d, _)| domain == ALL_DOMAINS || **d == domain)
            .flat_map(|(d, table)| table.iter().map(move |r| (*d, *r)))
            .collect();
        routes.sort_by_key(|(d, r)| (*d, r.prefix));
        routes
    }

    fn update<T>(&self, domain: DomainId, f: impl FnOnce(&mut LpmTable) -> T) -> T {
        let mut tables = (**self.tables.load()).clone();
        let mut table = tables
            .get(&domain)
            .map(|t| (**t).clone())
            .unwrap_or_default();
        let result = f(&mut table);
        if table.is_empty() {
            tables.remove(&domain);
        } else {
            tables.insert(domain, Arc::new(table));
        }
        self.tables.store(Arc::new(tables));
        result
    }

    fn insert(&self, domain: DomainId, route: Route) -> Option<Route> {
        self.update(domain, |table| table.insert(route))
    }

    fn remove(&self, domain: DomainId, prefix: &Ipv4Net) -> Option<Route> {
        self.update(domain, |table| table.remove(prefix))
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Control-thread side of routing.
///
/// Each route holds one reference on its gateway nexthop, so a gateway
/// shared by several routes stays in the directory until the last of them
/// is removed.
pub struct RoutingManager {
    table: Arc<RouteTable>,
}

impl RoutingManager {
    pub fn new(table: Arc<RouteTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    /// Add `prefix via gateway` on `iface`.
    pub fn add_route(
        &mut self,
        directory: &mut DirectoryWriter,
        domain: DomainId,
        prefix: Ipv4Net,
        gateway: Ipv4Addr,
        iface: IfaceId,
        exist_ok: bool,
    ) -> Result<Route> {
        self.add_labeled_route(directory, domain, prefix, gateway, iface, None, exist_ok)
    }

    /// Add `prefix via gateway` on `iface`, imposing `label` when set.
    ///
    /// A gateway maps to one directory entry per domain, so every route
    /// through it has to use the same interface.
    #[allow(clippy::too_many_arguments)]
    pub fn add_labeled_route(
        &mut self,
        directory: &mut DirectoryWriter,
        domain: DomainId,
        prefix: Ipv4Net,
        gateway: Ipv4Addr,
        iface: IfaceId,
        label: Option<u32>,
        exist_ok: bool,
    ) -> Result<Route> {
        let prefix = prefix.trunc();
        if let Some(label) = label
            && !(MPLS_LABEL_MIN..=MPLS_LABEL_MAX).contains(&label)
        {
            return Err(NexthopError::InvalidLabel(label).into());
        }
        if let Some(existing) = self.table.get(domain, &prefix) {
            if exist_ok {
                return Ok(existing);
            }
            return Err(RouteError::Exists(domain, prefix));
        }

        let key = NexthopKey::Addr(gateway);
        let nexthop = match directory.reader().lookup(domain, key) {
            Ok(entry) if entry.iface != iface => {
                return Err(RouteError::GatewayIface {
                    gateway,
                    iface: entry.iface,
                });
            }
            Ok(entry) => {
                directory.incref(entry.handle())?;
                entry.handle()
            }
            Err(_) => directory.add(domain, key, iface, false)?,
        };

        let route = Route {
            prefix,
            gateway,
            iface,
            label,
            nexthop,
        };
        self.table.insert(domain, route);
        debug!(domain, %prefix, %gateway, iface, ?label, "Added route");
        Ok(route)
    }

    /// Remove `prefix`, dropping its reference on the gateway nexthop.
    pub fn del_route(
        &mut self,
        directory: &mut DirectoryWriter,
        domain: DomainId,
        prefix: Ipv4Net,
        missing_ok: bool,
    ) -> Result<()> {
        let prefix = prefix.trunc();
        match self.table.remove(domain, &prefix) {
            Some(route) => {
                directory.decref(route.nexthop);
                debug!(domain, %prefix, "Removed route");
                Ok(())
            }
            None if missing_ok => Ok(()),
            None => Err(RouteError::NotFound(domain, prefix)),
        }
    }

    /// Longest-prefix match, as an error when nothing matches.
    pub fn resolve(&self, domain: DomainId, addr: Ipv4Addr) -> Result<Route> {
        self.table
            .lookup(domain, addr)
            .ok_or(RouteError::NoRoute(domain, addr))
    }
}
