//! Byte transports underneath cross-process channels.
//!
//! A [`Transport`] is one end of an OS-level connection. Connecting it yields a
//! [`TransportLink`] used for sending, and registers [`TransportEvents`] that the transport
//! raises on the io queue it was connected with.
//!
//! Transports are owned by the actor using them and must be released on the thread that
//! connected them, so their io callbacks never race with their destruction.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::runtime::TaskQueue;

/// Callbacks a connected transport raises on its io queue.
pub struct TransportEvents {
    pub on_receive: Arc<dyn Fn(Vec<u8>) + Send + Sync>,
    pub on_hangup: Box<dyn FnOnce() + Send>,
}

pub trait Transport: Send + 'static {
    fn connect(
        &mut self,
        io_queue: &TaskQueue,
        events: TransportEvents,
    ) -> Result<Box<dyn TransportLink>, ChannelError>;
}

pub trait TransportLink: Send {
    fn send(&self, payload: Vec<u8>) -> Result<(), ChannelError>;

    /// Tells the far end this end is going away.
    fn hang_up(&self);

    /// Pushes out anything buffered. Most transports write through.
    fn flush(&self) {}
}

struct Endpoint {
    io_queue: TaskQueue,
    on_receive: Arc<dyn Fn(Vec<u8>) + Send + Sync>,
    on_hangup: Option<Box<dyn FnOnce() + Send>>,
}

#[derive(Default)]
struct Wire {
    ends: [Option<Endpoint>; 2],
    backlog: [VecDeque<Vec<u8>>; 2],
    hung_up: bool,
}

impl Wire {
    fn deliver(&mut self, to: usize, payload: Vec<u8>) {
        match &self.ends[to] {
            Some(end) => {
                let on_receive = end.on_receive.clone();
                if end.io_queue.dispatch(move || on_receive(payload)).is_err() {
                    debug!(end = to, "Loopback receiver stopped; payload dropped");
                }
            }
            None => self.backlog[to].push_back(payload),
        }
    }

    fn notify_hangup(&mut self, to: usize) {
        if let Some(end) = &mut self.ends[to] {
            if let Some(on_hangup) = end.on_hangup.take() {
                if end.io_queue.dispatch(on_hangup).is_err() {
                    debug!(end = to, "Loopback receiver stopped before hangup");
                }
            }
        }
    }

    fn hang_up(&mut self, from: usize) {
        if self.hung_up {
            return;
        }
        self.hung_up = true;
        self.notify_hangup(1 - from);
    }
}

/// In-memory transport pair, for tests and single-process demos.
///
/// Dropping either end (or hanging up its link) hangs up the pair.
pub struct LoopbackTransport {
    wire: Arc<Mutex<Wire>>,
    index: usize,
}

impl LoopbackTransport {
    pub fn pair() -> (LoopbackTransport, LoopbackTransport) {
        let wire = Arc::new(Mutex::new(Wire::default()));
        (
            LoopbackTransport {
                wire: wire.clone(),
                index: 0,
            },
            LoopbackTransport { wire, index: 1 },
        )
    }

    /// True once either end has hung up.
    pub fn is_hung_up(&self) -> bool {
        self.wire.lock().hung_up
    }
}

impl Transport for LoopbackTransport {
    fn connect(
        &mut self,
        io_queue: &TaskQueue,
        events: TransportEvents,
    ) -> Result<Box<dyn TransportLink>, ChannelError> {
        let mut wire = self.wire.lock();
        if wire.ends[self.index].is_some() {
            return Err(ChannelError::AlreadyOpen);
        }
        wire.ends[self.index] = Some(Endpoint {
            io_queue: io_queue.clone(),
            on_receive: events.on_receive,
            on_hangup: Some(events.on_hangup),
        });
        let backlog = std::mem::take(&mut wire.backlog[self.index]);
        for payload in backlog {
            wire.deliver(self.index, payload);
        }
        if wire.hung_up {
            wire.notify_hangup(self.index);
        }
        Ok(Box::new(LoopbackLink {
            wire: self.wire.clone(),
            index: self.index,
        }))
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.wire.lock().hang_up(self.index);
    }
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("index", &self.index)
            .field("hung_up", &self.is_hung_up())
            .finish()
    }
}

struct LoopbackLink {
    wire: Arc<Mutex<Wire>>,
    index: usize,
}

impl TransportLink for LoopbackLink {
    fn send(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        let mut wire = self.wire.lock();
        if wire.hung_up {
            warn!(end = self.index, "Send on hung-up loopback");
            return Err(ChannelError::Closed);
        }
        wire.deliver(1 - self.index, payload);
        Ok(())
    }

    fn hang_up(&self) {
        self.wire.lock().hang_up(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TaskLoop;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn recorder() -> (Arc<Mutex<Vec<Vec<u8>>>>, Arc<AtomicBool>, TransportEvents) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let hung_up = Arc::new(AtomicBool::new(false));
        let sink = received.clone();
        let flag = hung_up.clone();
        let events = TransportEvents {
            on_receive: Arc::new(move |payload| sink.lock().push(payload)),
            on_hangup: Box::new(move || flag.store(true, Ordering::SeqCst)),
        };
        (received, hung_up, events)
    }

    #[test]
    fn bytes_sent_before_peer_connects_are_delivered() {
        let task_loop = TaskLoop::new("loopback");
        let (mut a, mut b) = LoopbackTransport::pair();
        let (_, _, events_a) = recorder();
        let link_a = a.connect(&task_loop.queue(), events_a).unwrap();
        link_a.send(b"early".to_vec()).unwrap();

        let (received, _, events_b) = recorder();
        let _link_b = b.connect(&task_loop.queue(), events_b).unwrap();
        task_loop.run_pending();
        assert_eq!(*received.lock(), vec![b"early".to_vec()]);
    }

    #[test]
    fn dropping_one_end_hangs_up_the_other() {
        let task_loop = TaskLoop::new("loopback");
        let (a, mut b) = LoopbackTransport::pair();
        let (_, hung_up, events) = recorder();
        let link_b = b.connect(&task_loop.queue(), events).unwrap();
        drop(a);
        task_loop.run_pending();
        assert!(hung_up.load(Ordering::SeqCst));
        assert_eq!(link_b.send(vec![1]), Err(ChannelError::Closed));
    }

    #[test]
    fn double_connect_is_rejected() {
        let task_loop = TaskLoop::new("loopback");
        let (mut a, _b) = LoopbackTransport::pair();
        let (_, _, first) = recorder();
        let (_, _, second) = recorder();
        let _link = a.connect(&task_loop.queue(), first).unwrap();
        assert_eq!(
            a.connect(&task_loop.queue(), second).err(),
            Some(ChannelError::AlreadyOpen)
        );
    }
}
