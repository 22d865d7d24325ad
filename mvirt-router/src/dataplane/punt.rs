//! `control_output` stage: hands punted packets to the control thread.

use std::sync::Arc;

use tracing::trace;

use super::graph::{Edge, Enqueue, Stage};
use super::packet::Packet;
use crate::control::output::{ControlOutputMsg, ControlOutputSender};

pub struct ControlOutputStage {
    sender: ControlOutputSender,
}

impl ControlOutputStage {
    const ERROR: Edge = Edge(0);

    pub fn new(sender: ControlOutputSender) -> Self {
        Self { sender }
    }
}

impl Stage for ControlOutputStage {
    fn name(&self) -> &str {
        "control_output"
    }

    fn edges(&self) -> &[&'static str] {
        &["control_output_error"]
    }

    /// Enqueues the whole batch, then wakes the control thread once.
    fn process(&mut self, batch: Vec<Packet>, out: &mut Enqueue<'_>) {
        let mut posted = 0usize;
        for packet in batch {
            let Some(callback) = packet.meta.punt.as_ref().map(|p| Arc::clone(&p.callback))
            else {
                out.enqueue(Self::ERROR, packet);
                continue;
            };
            match self.sender.enqueue(ControlOutputMsg { callback, packet }) {
                Ok(()) => posted += 1,
                Err(msg) => {
                    trace!(queued = self.sender.len(), "Control output queue full");
                    out.enqueue(Self::ERROR, msg.packet);
                }
            }
        }
        if posted > 0 {
            self.sender.signal();
        }
    }
}
