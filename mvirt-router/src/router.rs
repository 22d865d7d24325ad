//! Router context
//!
//! `Router` owns every long-lived component and wires them together in
//! dependency order:
//! 1. packet pool, interface table and ports
//! 2. nexthop directory and connected routes
//! 3. control-output channel
//! 4. ICMP handler registry
//! 5. one graph per worker, then the workers
//! 6. control thread
//!
//! Shutdown runs the reverse: workers stop first so nothing posts into the
//! channel while the control thread drains it and releases the directory.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{ConfigError, RouterConfig};
use crate::control::api::{ApiRequest, ApiResponse, ControlState};
use crate::control::icmp::EchoCorrelator;
use crate::control::output::ControlOutput;
use crate::control::plane::{ControlClient, ControlPlane};
use crate::dataplane::control_input::{ControlInputs, control_input_channel};
use crate::dataplane::graph::{GraphError, GraphStats};
use crate::dataplane::icmp::IcmpHandlers;
use crate::dataplane::iface::{Iface, IfaceId, IfaceTable};
use crate::dataplane::packet::{Clock, Packet, PacketPool};
use crate::dataplane::worker::{WorkerConfig, WorkerHandle, spawn_worker};
use crate::dataplane::{DataplaneContext, build_graph};
use crate::nexthop::NexthopDirectory;
use crate::routing::{RouteError, RouteTable, RoutingManager};

/// Receive queue depth per worker
const INBOX_CAPACITY: usize = 1024;

/// Transmit queue depth per interface
const PORT_TX_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Failed to install connected route: {0}")]
    Route(#[from] RouteError),

    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] io::Error),

    #[error("{0}")]
    WorkerPanicked(String),
}

pub type Result<T> = std::result::Result<T, RouterError>;

/// Attachment point for whatever sits behind an interface.
///
/// `inject` feeds received packets into the interface's worker, `recv`
/// takes packets the router transmitted on the interface.
#[derive(Clone)]
pub struct Port {
    pub iface: IfaceId,
    pub name: String,
    inbox: Sender<Packet>,
    tx: Receiver<Packet>,
    pool: PacketPool,
}

impl Port {
    /// Copy `data` into a packet and hand it to the worker.
    ///
    /// Returns false if the pool is exhausted or the worker's inbox is full.
    pub fn inject(&self, ethertype: u16, data: &[u8]) -> bool {
        let Some(mut pkt) = self.pool.alloc_from(data) else {
            warn!(port = %self.name, "Packet pool exhausted on receive");
            return false;
        };
        pkt.meta.ethertype = ethertype;
        pkt.meta.iface_in = Some(self.iface);
        self.inbox.try_send(pkt).is_ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Packet> {
        self.tx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<Packet> {
        self.tx.try_recv().ok()
    }
}

pub struct Router {
    pool: PacketPool,
    ifaces: Arc<IfaceTable>,
    ports: Vec<Port>,
    workers: Vec<WorkerHandle>,
    control: Option<ControlPlane>,
    client: ControlClient,
}

impl Router {
    pub fn start(config: RouterConfig) -> Result<Self> {
        config.validate()?;
        let clock = Clock::new();
        let pool = PacketPool::new(config.pool_size, config.buffer_size, config.headroom);

        let inboxes: Vec<(Sender<Packet>, Receiver<Packet>)> =
            (0..config.workers).map(|_| bounded(INBOX_CAPACITY)).collect();

        let ifaces = Arc::new(IfaceTable::new());
        let mut ports = Vec::with_capacity(config.interfaces.len());
        for (i, cfg) in config.interfaces.iter().enumerate() {
            let id = (i + 1) as IfaceId;
            let (tx, tx_rx) = bounded(PORT_TX_CAPACITY);
            ifaces.insert(Iface::new(id, &cfg.name, cfg.domain, cfg.address, tx));
            ports.push(Port {
                iface: id,
                name: cfg.name.clone(),
                inbox: inboxes[i % inboxes.len()].0.clone(),
                tx: tx_rx,
                pool: pool.clone(),
            });
            info!(iface = id, name = %cfg.name, domain = cfg.domain, address = ?cfg.address, "Interface configured");
        }

        let (mut directory, nexthops) = NexthopDirectory::init(config.nexthop_capacity);
        let mut routing = RoutingManager::new(Arc::new(RouteTable::new()));
        for iface in ifaces.list() {
            if let Some(addr) = iface.address {
                routing.add_route(
                    &mut directory,
                    iface.domain,
                    addr.trunc(),
                    addr.addr(),
                    iface.id,
                    false,
                )?;
            }
        }

        let output = ControlOutput::init(config.burst_size, config.wake_timeout())?;

        let echo = Arc::new(EchoCorrelator::new());
        let mut handlers = IcmpHandlers::new();
        echo.register(&mut handlers)?;

        let ctx = DataplaneContext {
            ifaces: Arc::clone(&ifaces),
            routes: Arc::clone(routing.table()),
            nexthops,
            control_output: output.sender(),
            icmp_handlers: Arc::new(handlers),
            clock,
        };

        let mut workers = Vec::with_capacity(config.workers);
        let mut control_inputs = Vec::with_capacity(config.workers);
        let mut stats: Vec<GraphStats> = Vec::with_capacity(config.workers);
        for (id, (_, inbox)) in inboxes.into_iter().enumerate() {
            let graph = build_graph(&ctx, config.burst_size)?;
            stats.push(graph.stats());
            let (input_tx, input_rx) = control_input_channel();
            control_inputs.push(input_tx);
            workers.push(spawn_worker(WorkerConfig {
                id,
                graph,
                inbox,
                control_input: input_rx,
                pool: pool.clone(),
            })?);
        }

        let state = ControlState {
            directory,
            routing,
            ifaces: Arc::clone(&ifaces),
            echo,
            inputs: ControlInputs::new(control_inputs),
            stats,
        };
        let control = ControlPlane::spawn(state, output)?;
        let client = control.client();

        info!(
            workers = workers.len(),
            interfaces = ports.len(),
            burst = config.burst_size,
            "Router started"
        );

        Ok(Self {
            pool,
            ifaces,
            ports,
            workers,
            control: Some(control),
            client,
        })
    }

    pub fn client(&self) -> ControlClient {
        self.client.clone()
    }

    /// Shorthand for `client().call(request)`.
    pub fn call(&self, request: ApiRequest) -> ApiResponse {
        self.client.call(request)
    }

    pub fn port(&self, name: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.name == name)
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn ifaces(&self) -> &Arc<IfaceTable> {
        &self.ifaces
    }

    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    /// Stop workers, then the control thread.
    pub fn shutdown(mut self) -> Result<()> {
        let result = self.stop();
        info!("Router stopped");
        result
    }

    fn stop(&mut self) -> Result<()> {
        for worker in &self.workers {
            worker.stop();
        }
        let mut result = Ok(());
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.join() {
                error!(error = %e, "Worker failed");
                result = Err(RouterError::WorkerPanicked(e));
            }
        }
        if let Some(control) = self.control.take() {
            control.shutdown();
        }
        result
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
