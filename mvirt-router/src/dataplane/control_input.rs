//! Control-input queue: control thread → worker.
//!
//! The control thread never touches a worker's graph directly. Requests
//! that need a packet built on the dataplane are posted here; the worker
//! allocates the packet and runs it through the stage named by the message.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};

use super::packet::EchoRequestMeta;

/// Per-worker control-input capacity
const CONTROL_INPUT_CAPACITY: usize = 256;

/// A request for a worker to originate a packet
#[derive(Debug)]
pub enum ControlInputMsg {
    IcmpEcho(EchoRequestMeta),
}

impl ControlInputMsg {
    /// Entry stage for the originated packet
    pub fn stage(&self) -> &'static str {
        match self {
            ControlInputMsg::IcmpEcho(_) => "icmp_output_request",
        }
    }
}

pub fn control_input_channel() -> (Sender<ControlInputMsg>, Receiver<ControlInputMsg>) {
    bounded(CONTROL_INPUT_CAPACITY)
}

/// Round-robin fan-out over all workers' control-input queues
#[derive(Clone)]
pub struct ControlInputs {
    senders: Arc<[Sender<ControlInputMsg>]>,
    next: Arc<AtomicUsize>,
}

impl ControlInputs {
    pub fn new(senders: Vec<Sender<ControlInputMsg>>) -> Self {
        Self {
            senders: senders.into(),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Post to the next worker without blocking.
    ///
    /// The message is handed back if that worker's queue is full or gone.
    pub fn post(&self, msg: ControlInputMsg) -> Result<(), ControlInputMsg> {
        if self.senders.is_empty() {
            return Err(msg);
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[idx].try_send(msg).map_err(|e| e.into_inner())
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nexthop::{NexthopDirectory, NexthopKey};

    fn echo_msg(sequence: u16) -> ControlInputMsg {
        let (mut writer, _reader) = NexthopDirectory::init(1);
        let nexthop = writer.add(0, NexthopKey::Label(16), 1, false).unwrap();
        ControlInputMsg::IcmpEcho(EchoRequestMeta {
            domain: 0,
            dst: "10.0.0.2".parse().unwrap(),
            hold: writer.hold(nexthop).unwrap(),
            sequence,
            ttl: 64,
        })
    }

    #[test]
    fn test_round_robin() {
        let (tx0, rx0) = control_input_channel();
        let (tx1, rx1) = control_input_channel();
        let inputs = ControlInputs::new(vec![tx0, tx1]);

        for seq in 0..4 {
            assert!(inputs.post(echo_msg(seq)).is_ok());
        }
        assert_eq!(rx0.len(), 2);
        assert_eq!(rx1.len(), 2);
        assert_eq!(rx0.try_recv().unwrap().stage(), "icmp_output_request");
    }

    #[test]
    fn test_no_workers_rejects() {
        let inputs = ControlInputs::new(Vec::new());
        assert!(inputs.post(echo_msg(1)).is_err());
    }

    #[test]
    fn test_disconnected_rejects() {
        let (tx, rx) = control_input_channel();
        drop(rx);
        let inputs = ControlInputs::new(vec![tx]);
        assert!(inputs.post(echo_msg(1)).is_err());
    }
}
