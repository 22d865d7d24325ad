//! Control API requests and their handlers
//!
//! Every request is handled on the control thread, which owns the only
//! `DirectoryWriter`. Responses carry a status that is 0 on success or a
//! negative errno, plus an optional payload.

use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use nix::errno::Errno;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::icmp::{EchoCorrelator, EchoParams, EchoReply};
use crate::dataplane::control_input::ControlInputs;
use crate::dataplane::graph::{GraphStats, NodeStats};
use crate::dataplane::iface::{DomainId, IfaceId, IfaceTable};
use crate::nexthop::{DirectoryWriter, NexthopEntry, NexthopKey};
use crate::routing::{Route, RoutingManager};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiRequest {
    NexthopAdd {
        domain: DomainId,
        label: u32,
        iface: IfaceId,
        exist_ok: bool,
    },
    NexthopDel {
        domain: DomainId,
        label: u32,
        missing_ok: bool,
    },
    NexthopGet {
        domain: DomainId,
        label: u32,
    },
    /// `ALL_DOMAINS` lists every domain
    NexthopList {
        domain: DomainId,
    },
    RouteAdd {
        domain: DomainId,
        prefix: Ipv4Net,
        gateway: Ipv4Addr,
        iface: IfaceId,
        /// Impose this label on matching traffic
        label: Option<u32>,
        exist_ok: bool,
    },
    RouteDel {
        domain: DomainId,
        prefix: Ipv4Net,
        missing_ok: bool,
    },
    /// Longest-prefix match for `dst`
    RouteGet {
        domain: DomainId,
        dst: Ipv4Addr,
    },
    RouteList {
        domain: DomainId,
    },
    IcmpEchoRequest(EchoParams),
    /// Collect the pending echo reply, if any
    IcmpEchoReply,
    GraphStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NexthopRecord {
    pub domain: DomainId,
    pub key: NexthopKey,
    pub iface: IfaceId,
}

impl From<&NexthopEntry> for NexthopRecord {
    fn from(entry: &NexthopEntry) -> Self {
        Self {
            domain: entry.domain,
            key: entry.key,
            iface: entry.iface,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteRecord {
    pub domain: DomainId,
    pub prefix: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub iface: IfaceId,
    pub label: Option<u32>,
}

impl RouteRecord {
    fn new(domain: DomainId, route: &Route) -> Self {
        Self {
            domain,
            prefix: route.prefix,
            gateway: route.gateway,
            iface: route.iface,
            label: route.label,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiPayload {
    Nexthop(NexthopRecord),
    Nexthops(Vec<NexthopRecord>),
    Route(RouteRecord),
    Routes(Vec<RouteRecord>),
    EchoReply(EchoReply),
    GraphStats(Vec<NodeStats>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiResponse {
    /// 0 or a negative errno
    pub status: i32,
    pub payload: Option<ApiPayload>,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self {
            status: 0,
            payload: None,
        }
    }

    pub fn with(payload: ApiPayload) -> Self {
        Self {
            status: 0,
            payload: Some(payload),
        }
    }

    pub fn error(errno: Errno) -> Self {
        Self {
            status: -(errno as i32),
            payload: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }

    /// The failure as an errno, `None` on success.
    pub fn errno(&self) -> Option<Errno> {
        (self.status < 0).then(|| Errno::from_raw(-self.status))
    }
}

/// Everything the control thread mutates or consults
pub struct ControlState {
    pub directory: DirectoryWriter,
    pub routing: RoutingManager,
    pub ifaces: Arc<IfaceTable>,
    pub echo: Arc<EchoCorrelator>,
    pub inputs: ControlInputs,
    pub stats: Vec<GraphStats>,
}

impl ControlState {
    pub fn handle(&mut self, request: ApiRequest) -> ApiResponse {
        debug!(?request, "Control request");
        match request {
            ApiRequest::NexthopAdd {
                domain,
                label,
                iface,
                exist_ok,
            } => {
                if self.ifaces.get(iface).is_none() {
                    return ApiResponse::error(Errno::ENODEV);
                }
                match self
                    .directory
                    .add(domain, NexthopKey::Label(label), iface, exist_ok)
                {
                    Ok(_) => {
                        info!(domain, label, iface, "Label added");
                        ApiResponse::ok()
                    }
                    Err(e) => {
                        warn!(domain, label, error = %e, "Label add failed");
                        ApiResponse::error(e.errno())
                    }
                }
            }
            ApiRequest::NexthopDel {
                domain,
                label,
                missing_ok,
            } => match self
                .directory
                .del(domain, NexthopKey::Label(label), missing_ok)
            {
                Ok(()) => ApiResponse::ok(),
                Err(e) => ApiResponse::error(e.errno()),
            },
            ApiRequest::NexthopGet { domain, label } => {
                match self
                    .directory
                    .reader()
                    .lookup(domain, NexthopKey::Label(label))
                {
                    Ok(entry) => ApiResponse::with(ApiPayload::Nexthop(entry.as_ref().into())),
                    Err(e) => ApiResponse::error(e.errno()),
                }
            }
            ApiRequest::NexthopList { domain } => {
                let entries = self
                    .directory
                    .reader()
                    .list(domain)
                    .map(|e| NexthopRecord::from(e.as_ref()))
                    .collect();
                ApiResponse::with(ApiPayload::Nexthops(entries))
            }
            ApiRequest::RouteAdd {
                domain,
                prefix,
                gateway,
                iface,
                label,
                exist_ok,
            } => {
                if self.ifaces.get(iface).is_none() {
                    return ApiResponse::error(Errno::ENODEV);
                }
                match self.routing.add_labeled_route(
                    &mut self.directory,
                    domain,
                    prefix,
                    gateway,
                    iface,
                    label,
                    exist_ok,
                ) {
                    Ok(_) => ApiResponse::ok(),
                    Err(e) => {
                        warn!(domain, %prefix, error = %e, "Route add failed");
                        ApiResponse::error(e.errno())
                    }
                }
            }
            ApiRequest::RouteDel {
                domain,
                prefix,
                missing_ok,
            } => match self
                .routing
                .del_route(&mut self.directory, domain, prefix, missing_ok)
            {
                Ok(()) => ApiResponse::ok(),
                Err(e) => ApiResponse::error(e.errno()),
            },
            ApiRequest::RouteGet { domain, dst } => match self.routing.resolve(domain, dst) {
                Ok(route) => ApiResponse::with(ApiPayload::Route(RouteRecord::new(domain, &route))),
                Err(e) => ApiResponse::error(e.errno()),
            },
            ApiRequest::RouteList { domain } => {
                let routes = self
                    .routing
                    .table()
                    .list(domain)
                    .iter()
                    .map(|(d, r)| RouteRecord::new(*d, r))
                    .collect();
                ApiResponse::with(ApiPayload::Routes(routes))
            }
            ApiRequest::IcmpEchoRequest(params) => {
                match self.echo.send_request(
                    params,
                    &self.routing,
                    &mut self.directory,
                    &self.inputs,
                ) {
                    Ok(()) => ApiResponse::ok(),
                    Err(e) => {
                        debug!(dst = %params.dst, error = %e, "Echo request failed");
                        ApiResponse::error(e.errno())
                    }
                }
            }
            ApiRequest::IcmpEchoReply => {
                let reply = self.echo.reply();
                if reply.answered {
                    ApiResponse::with(ApiPayload::EchoReply(reply))
                } else {
                    ApiResponse::ok()
                }
            }
            ApiRequest::GraphStats => ApiResponse::with(ApiPayload::GraphStats(self.graph_stats())),
        }
    }

    /// Per-stage counters summed over all workers
    fn graph_stats(&self) -> Vec<NodeStats> {
        let mut total: Vec<NodeStats> = Vec::new();
        for stats in &self.stats {
            for node in stats.snapshot() {
                match total.iter_mut().find(|n| n.name == node.name) {
                    Some(sum) => {
                        sum.packets += node.packets;
                        sum.calls += node.calls;
                    }
                    None => total.push(node),
                }
            }
        }
        total
    }

    /// Release control-side state. Punted packets still in the mailbox go
    /// back to the pool before the directory is torn down.
    pub fn shutdown(self) {
        self.echo.discard_pending();
        let released = self.directory.shutdown();
        debug!(released, "Control state released");
    }
}
