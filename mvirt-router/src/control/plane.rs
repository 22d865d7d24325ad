//! Control thread event loop
//!
//! One thread owns `ControlState` and the consumer side of the
//! control-output channel. It multiplexes:
//! - API calls from `ControlClient`s
//! - wakes from the control-output wake thread, answered with a drain
//! - nexthop holds dropped by workers, applied as decrefs
//! - the shutdown signal
//!
//! On exit the control-output channel is drained before the directory is
//! shut down, so callbacks never see a torn-down directory.

use std::io;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use nix::errno::Errno;
use tracing::{debug, error, info};

use super::api::{ApiRequest, ApiResponse, ControlState};
use super::output::ControlOutput;

type ApiCall = (ApiRequest, Sender<ApiResponse>);

/// Synchronous handle for issuing control requests
#[derive(Clone)]
pub struct ControlClient {
    requests: Sender<ApiCall>,
}

impl ControlClient {
    /// Send a request and wait for its response.
    ///
    /// Fails with `ESHUTDOWN` once the control thread has exited.
    pub fn call(&self, request: ApiRequest) -> ApiResponse {
        let (reply_tx, reply_rx) = bounded(1);
        if self.requests.send((request, reply_tx)).is_err() {
            return ApiResponse::error(Errno::ESHUTDOWN);
        }
        reply_rx
            .recv()
            .unwrap_or_else(|_| ApiResponse::error(Errno::ESHUTDOWN))
    }
}

pub struct ControlPlane {
    client: ControlClient,
    shutdown_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl ControlPlane {
    pub fn spawn(state: ControlState, output: ControlOutput) -> io::Result<Self> {
        let (requests_tx, requests_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = bounded(1);

        let thread = thread::Builder::new()
            .name("control".to_string())
            .spawn(move || run_control_loop(state, output, requests_rx, shutdown_rx))?;

        info!("Control thread started");
        Ok(Self {
            client: ControlClient {
                requests: requests_tx,
            },
            shutdown_tx,
            thread: Some(thread),
        })
    }

    pub fn client(&self) -> ControlClient {
        self.client.clone()
    }

    /// Stop the loop and wait for teardown to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.shutdown_tx.try_send(());
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            error!("Control thread panicked");
        }
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_control_loop(
    mut state: ControlState,
    output: ControlOutput,
    requests: Receiver<ApiCall>,
    shutdown: Receiver<()>,
) {
    let wake = output.wake_receiver();
    let released = state.directory.released();
    loop {
        select! {
            recv(requests) -> call => {
                let Ok((request, reply)) = call else {
                    break;
                };
                let response = state.handle(request);
                let _ = reply.send(response);
            }
            recv(wake) -> _ => {
                output.drain();
            }
            recv(released) -> nh => {
                if let Ok(nh) = nh {
                    state.directory.decref(nh);
                }
            }
            recv(shutdown) -> _ => break,
        }
    }

    debug!("Control thread stopping");
    let delivered = output.shutdown(true);
    state.shutdown();
    info!(delivered, "Control thread stopped");
}
