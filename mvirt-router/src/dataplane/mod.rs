//! Data plane: packet graph, stages and worker threads
//!
//! Architecture:
//! - Every worker owns a private instance of the same stage graph
//! - Stages share read-only state (interfaces, routes, nexthops) through
//!   lock-free snapshots carried in a `DataplaneContext`
//! - Packets leave the graph through a port TX channel, the control-output
//!   channel, or a counting drop sink
//!
//! ```text
//!  port inbox ─▶ l3_input ─┬─ ip_input ─┬─ icmp_input ─┬─ icmp_output ─▶ ip_output
//!                          │            │              └─ control_output ─▶ control thread
//!                          │            └─ ip_output ─▶ ip_forward ─┬─▶ port_tx
//!                          │                                        └─▶ mpls_push ─▶ mpls_forward
//!                          └─ mpls_input ─┬─ mpls_forward ─▶ port_tx
//!                                         └─ ip_forward
//!  control input ─▶ icmp_output_request ─▶ icmp_output
//! ```

pub mod control_input;
pub mod graph;
pub mod icmp;
pub mod iface;
pub mod ip;
pub mod mpls;
pub mod packet;
pub mod punt;
pub mod worker;

use std::sync::Arc;

pub use control_input::{ControlInputMsg, ControlInputs, control_input_channel};
pub use graph::{BURST_SIZE, Graph, GraphBuilder, GraphError, GraphStats, NodeStats, Stage};
pub use icmp::IcmpHandlers;
pub use iface::{ALL_DOMAINS, DomainId, Iface, IfaceId, IfaceTable};
pub use packet::{Clock, ETHERTYPE_IPV4, ETHERTYPE_MPLS, Packet, PacketPool};
pub use worker::{WorkerConfig, WorkerHandle, spawn_worker};

use crate::control::output::ControlOutputSender;
use crate::nexthop::DirectoryReader;
use crate::routing::RouteTable;

/// Shared state handed to every stage constructor
#[derive(Clone)]
pub struct DataplaneContext {
    pub ifaces: Arc<IfaceTable>,
    pub routes: Arc<RouteTable>,
    pub nexthops: DirectoryReader,
    pub control_output: ControlOutputSender,
    pub icmp_handlers: Arc<IcmpHandlers>,
    pub clock: Clock,
}

/// Every drop sink a full graph declares
pub const DROP_SINKS: &[&str] = &[
    "l3_input_unsupported",
    "ip_input_invalid",
    "ip_input_unsupported",
    "ip_input_ttl_exceeded",
    "ip_output_no_route",
    "ip_forward_invalid",
    "port_tx_error",
    "icmp_input_invalid",
    "icmp_input_unsupported",
    "icmp_output_no_headroom",
    "icmp_request_output_error",
    "control_output_error",
    "mpls_input_no_route",
    "mpls_input_ttl_exceeded",
    "mpls_input_invalid",
    "mpls_forward_invalid",
    "mpls_push_no_headroom",
];

/// Build one worker's graph instance.
pub fn build_graph(ctx: &DataplaneContext, burst: usize) -> Result<Graph, GraphError> {
    let mut builder = GraphBuilder::new(burst);
    builder
        .add_stage(ip::L3Input)
        .add_stage(ip::IpInput::new(Arc::clone(&ctx.ifaces)))
        .add_stage(ip::IpOutput::new(
            Arc::clone(&ctx.ifaces),
            Arc::clone(&ctx.routes),
        ))
        .add_stage(ip::IpForward::new(ctx.nexthops.clone()))
        .add_stage(ip::PortTx::new(Arc::clone(&ctx.ifaces)))
        .add_stage(icmp::IcmpInput::new(
            Arc::clone(&ctx.icmp_handlers),
            ctx.clock,
        ))
        .add_stage(icmp::IcmpOutput)
        .add_stage(icmp::IcmpOutputRequest::new(
            Arc::clone(&ctx.ifaces),
            ctx.nexthops.clone(),
            ctx.clock,
        ))
        .add_stage(punt::ControlOutputStage::new(ctx.control_output.clone()))
        .add_stage(mpls::MplsInput::new(
            Arc::clone(&ctx.ifaces),
            Arc::clone(&ctx.routes),
        ))
        .add_stage(mpls::MplsForward::new(ctx.nexthops.clone()))
        .add_stage(mpls::MplsPush);
    for sink in DROP_SINKS {
        builder.add_drop(sink);
    }
    builder.build()
}
