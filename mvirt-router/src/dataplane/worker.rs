//! Worker thread management
//!
//! Each worker owns one graph instance and runs it to completion for every
//! batch it receives. Inputs:
//! - port inbox: packets received on the interfaces assigned to this worker
//! - control input: packets the control thread asks this worker to originate
//!
//! Workers never block on their outputs; every enqueue is non-blocking and
//! overflow ends in a counting drop stage.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, select};
use tracing::{debug, error, info, warn};

use super::control_input::ControlInputMsg;
use super::graph::Graph;
use super::packet::{Packet, PacketPool};

/// How often an idle worker checks its shutdown flag
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Configuration for a worker thread
pub struct WorkerConfig {
    pub id: usize,
    pub graph: Graph,
    /// Received packets, `meta.ethertype` and `meta.iface_in` already set
    pub inbox: Receiver<Packet>,
    pub control_input: Receiver<ControlInputMsg>,
    pub pool: PacketPool,
}

/// Handle to a running worker
pub struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    pub id: usize,
}

impl WorkerHandle {
    /// Signal the worker to stop
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> Result<(), String> {
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| format!("Worker {} panicked", self.id))
        } else {
            Ok(())
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn spawn_worker(config: WorkerConfig) -> std::io::Result<WorkerHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);
    let id = config.id;

    let thread = thread::Builder::new()
        .name(format!("worker-{id}"))
        .spawn(move || run_worker(config, shutdown_clone))?;

    Ok(WorkerHandle {
        thread: Some(thread),
        shutdown,
        id,
    })
}

fn run_worker(mut config: WorkerConfig, shutdown: Arc<AtomicBool>) {
    let worker = config.id;
    let Some(l3_input) = config.graph.node_id("l3_input") else {
        error!(worker, "Graph has no l3_input stage");
        return;
    };
    let burst = config.graph.burst();
    info!(worker, burst, "Worker started");

    while !shutdown.load(Ordering::SeqCst) {
        select! {
            recv(config.inbox) -> pkt => {
                let Ok(pkt) = pkt else {
                    debug!(worker, "Inbox closed");
                    break;
                };
                let mut batch = Vec::with_capacity(burst);
                batch.push(pkt);
                while batch.len() < burst {
                    match config.inbox.try_recv() {
                        Ok(pkt) => batch.push(pkt),
                        Err(_) => break,
                    }
                }
                config.graph.run(l3_input, batch);
            }
            recv(config.control_input) -> msg => {
                let Ok(msg) = msg else {
                    debug!(worker, "Control input closed");
                    break;
                };
                originate(&mut config, msg);
            }
            default(IDLE_POLL) => {}
        }
    }

    info!(worker, "Worker stopped");
}

/// Allocate a packet for a control-input message and run it from the
/// message's entry stage.
fn originate(config: &mut WorkerConfig, msg: ControlInputMsg) {
    let Some(entry) = config.graph.node_id(msg.stage()) else {
        error!(worker = config.id, stage = msg.stage(), "Unknown control input stage");
        return;
    };
    let Some(mut pkt) = config.pool.alloc() else {
        warn!(worker = config.id, "Packet pool exhausted, dropping control input");
        return;
    };
    match msg {
        ControlInputMsg::IcmpEcho(request) => pkt.meta.echo_request = Some(request),
    }
    config.graph.run(entry, vec![pkt]);
}
