//! Control-output channel: worker → control thread punting.
//!
//! Workers post `{callback, packet}` messages into a bounded lock-free
//! queue and never block. A dedicated wake thread turns post signals, or a
//! timeout when nothing arrives, into a wake of the control thread's event
//! loop. The control thread then drains the queue and runs the callbacks.
//!
//! ```text
//!  worker ──post──▶ ArrayQueue ──────────────▶ drain() on control thread
//!     └──signal──▶ wake thread ──wake──▶ control loop select!
//! ```
//!
//! Callbacks only ever run on the thread that calls `drain`.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use crossbeam_queue::ArrayQueue;
use tracing::{debug, info, trace};

use crate::dataplane::packet::Packet;

/// Upper bound on the time between a post and the control thread noticing it
pub const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Queue capacity as a multiple of the burst size
pub const QUEUE_BURST_FACTOR: usize = 4;

/// Receives punted packets on the control thread.
///
/// The handler owns the packet and is responsible for releasing it.
/// Handlers run inside the control loop and must not block.
pub trait PuntHandler: Send + Sync {
    fn punt(&self, packet: Packet);
}

impl<F> PuntHandler for F
where
    F: Fn(Packet) + Send + Sync,
{
    fn punt(&self, packet: Packet) {
        self(packet)
    }
}

/// A punted packet and the handler that will receive it
pub struct ControlOutputMsg {
    pub callback: Arc<dyn PuntHandler>,
    pub packet: Packet,
}

/// Producer handle, cloned into every worker
#[derive(Clone)]
pub struct ControlOutputSender {
    queue: Arc<ArrayQueue<ControlOutputMsg>>,
    signal: Sender<()>,
}

impl ControlOutputSender {
    /// Enqueue without signaling. On a full queue the message is handed back.
    pub fn enqueue(&self, msg: ControlOutputMsg) -> Result<(), ControlOutputMsg> {
        self.queue.push(msg)
    }

    /// Enqueue and signal the wake thread.
    pub fn post(&self, msg: ControlOutputMsg) -> Result<(), ControlOutputMsg> {
        self.enqueue(msg)?;
        self.signal();
        Ok(())
    }

    /// Nudge the wake thread. Signals coalesce while one is pending.
    pub fn signal(&self) {
        let _ = self.signal.try_send(());
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Consumer side of the channel, owned by the control thread
pub struct ControlOutput {
    queue: Arc<ArrayQueue<ControlOutputMsg>>,
    sender: ControlOutputSender,
    wake_rx: Receiver<()>,
    shutdown: Arc<AtomicBool>,
    waker: Option<JoinHandle<()>>,
    burst: usize,
}

impl ControlOutput {
    /// Create the queue (`QUEUE_BURST_FACTOR * burst` entries) and start
    /// the wake thread.
    pub fn init(burst: usize, wake_timeout: Duration) -> io::Result<Self> {
        let burst = burst.max(1);
        let queue = Arc::new(ArrayQueue::new(burst * QUEUE_BURST_FACTOR));
        let (signal_tx, signal_rx) = bounded(1);
        let (wake_tx, wake_rx) = bounded(1);
        let shutdown = Arc::new(AtomicBool::new(false));

        let shutdown_clone = Arc::clone(&shutdown);
        let waker = thread::Builder::new()
            .name("ctl-output-wake".to_string())
            .spawn(move || run_waker(signal_rx, wake_tx, shutdown_clone, wake_timeout))?;

        info!(
            capacity = queue.capacity(),
            timeout_ms = wake_timeout.as_millis() as u64,
            "Control output channel started"
        );

        Ok(Self {
            sender: ControlOutputSender {
                queue: Arc::clone(&queue),
                signal: signal_tx,
            },
            queue,
            wake_rx,
            shutdown,
            waker: Some(waker),
            burst,
        })
    }

    pub fn sender(&self) -> ControlOutputSender {
        self.sender.clone()
    }

    /// Fires whenever the control loop should call `drain`.
    pub fn wake_receiver(&self) -> Receiver<()> {
        self.wake_rx.clone()
    }

    /// Dequeue in bursts until empty, invoking callbacks in FIFO order.
    ///
    /// Returns the number of messages delivered.
    pub fn drain(&self) -> usize {
        let mut delivered = 0;
        loop {
            let mut n = 0;
            while n < self.burst {
                let Some(msg) = self.queue.pop() else {
                    break;
                };
                msg.callback.punt(msg.packet);
                n += 1;
            }
            delivered += n;
            if n < self.burst {
                break;
            }
        }
        if delivered > 0 {
            trace!(delivered, "Drained control output queue");
        }
        delivered
    }

    /// Stop the wake thread, then deliver (`deliver = true`) or release
    /// everything still queued. Returns the number of messages handled.
    pub fn shutdown(mut self, deliver: bool) -> usize {
        self.stop_waker();
        let handled = if deliver {
            self.drain()
        } else {
            let mut released = 0;
            while let Some(msg) = self.queue.pop() {
                drop(msg);
                released += 1;
            }
            released
        };
        info!(handled, deliver, "Control output channel shut down");
        handled
    }

    fn stop_waker(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.sender.signal();
        if let Some(handle) = self.waker.take()
            && handle.join().is_err()
        {
            debug!("Control output wake thread panicked");
        }
    }
}

impl Drop for ControlOutput {
    fn drop(&mut self) {
        self.stop_waker();
    }
}

/// Wake thread body.
///
/// Every wake, signaled or timed out, is forwarded to the control loop.
fn run_waker(
    signal_rx: Receiver<()>,
    wake_tx: Sender<()>,
    shutdown: Arc<AtomicBool>,
    timeout: Duration,
) {
    debug!("Control output wake thread started");
    while !shutdown.load(Ordering::Acquire) {
        match signal_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let _ = wake_tx.try_send(());
    }
    debug!("Control output wake thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::packet::PacketPool;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn recorder() -> (Arc<Mutex<Vec<u8>>>, Arc<dyn PuntHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let handler: Arc<dyn PuntHandler> = Arc::new(move |pkt: Packet| {
            seen_clone.lock().unwrap().push(pkt.data()[0]);
        });
        (seen, handler)
    }

    #[test]
    fn test_capacity_is_four_bursts() {
        let output = ControlOutput::init(8, WAKE_TIMEOUT).unwrap();
        assert_eq!(output.sender().capacity(), 32);
        output.shutdown(false);
    }

    #[test]
    fn test_drain_fifo() {
        let pool = PacketPool::new(16, 64, 8);
        let output = ControlOutput::init(4, WAKE_TIMEOUT).unwrap();
        let sender = output.sender();
        let (seen, handler) = recorder();

        // More than one burst so drain has to loop
        for i in 0..10u8 {
            let msg = ControlOutputMsg {
                callback: Arc::clone(&handler),
                packet: pool.alloc_from(&[i]).unwrap(),
            };
            assert!(sender.post(msg).is_ok());
        }

        assert_eq!(output.drain(), 10);
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<u8>>());
        assert_eq!(pool.in_use(), 0);
        assert_eq!(output.drain(), 0);
        output.shutdown(true);
    }

    #[test]
    fn test_post_full_returns_message() {
        let pool = PacketPool::new(8, 64, 8);
        let output = ControlOutput::init(1, WAKE_TIMEOUT).unwrap();
        let sender = output.sender();
        let (_seen, handler) = recorder();

        for i in 0..4u8 {
            let msg = ControlOutputMsg {
                callback: Arc::clone(&handler),
                packet: pool.alloc_from(&[i]).unwrap(),
            };
            assert!(sender.post(msg).is_ok());
        }

        let overflow = ControlOutputMsg {
            callback: Arc::clone(&handler),
            packet: pool.alloc_from(&[99]).unwrap(),
        };
        let rejected = sender.post(overflow).err().unwrap();
        assert_eq!(rejected.packet.data(), &[99]);
        assert_eq!(sender.len(), 4);

        drop(rejected);
        output.shutdown(false);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_signal_wakes_control_loop() {
        let pool = PacketPool::new(4, 64, 8);
        let output = ControlOutput::init(4, WAKE_TIMEOUT).unwrap();
        let wake = output.wake_receiver();
        let (seen, handler) = recorder();

        let sender = output.sender();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            let msg = ControlOutputMsg {
                callback: handler,
                packet: pool.alloc_from(&[7]).unwrap(),
            };
            assert!(sender.post(msg).is_ok());
        });

        // Well under the 1s timeout floor
        let start = Instant::now();
        wake.recv_timeout(Duration::from_millis(500)).unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));

        producer.join().unwrap();
        assert_eq!(output.drain(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![7]);
        output.shutdown(true);
    }

    #[test]
    fn test_timeout_wakes_without_signal() {
        let output = ControlOutput::init(4, Duration::from_millis(20)).unwrap();
        let wake = output.wake_receiver();
        assert!(wake.recv_timeout(Duration::from_millis(500)).is_ok());
        output.shutdown(true);
    }

    #[test]
    fn test_callbacks_not_run_by_wake_thread() {
        let pool = PacketPool::new(4, 64, 8);
        let output = ControlOutput::init(4, Duration::from_millis(10)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let handler: Arc<dyn PuntHandler> = Arc::new(move |_pkt: Packet| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        let msg = ControlOutputMsg {
            callback: handler,
            packet: pool.alloc().unwrap(),
        };
        assert!(output.sender().post(msg).is_ok());

        // Several wake cycles pass; nothing runs until drain()
        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(output.drain(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        output.shutdown(true);
    }

    #[test]
    fn test_shutdown_delivers_or_releases() {
        let pool = PacketPool::new(8, 64, 8);
        let (seen, handler) = recorder();

        let output = ControlOutput::init(4, WAKE_TIMEOUT).unwrap();
        for i in 0..3u8 {
            let msg = ControlOutputMsg {
                callback: Arc::clone(&handler),
                packet: pool.alloc_from(&[i]).unwrap(),
            };
            assert!(output.sender().post(msg).is_ok());
        }
        assert_eq!(output.shutdown(true), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);

        let output = ControlOutput::init(4, WAKE_TIMEOUT).unwrap();
        for i in 0..2u8 {
            let msg = ControlOutputMsg {
                callback: Arc::clone(&handler),
                packet: pool.alloc_from(&[i]).unwrap(),
            };
            assert!(output.sender().post(msg).is_ok());
        }
        assert_eq!(output.shutdown(false), 2);
        // Released, not delivered
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(pool.in_use(), 0);
    }
}
