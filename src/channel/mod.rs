//! # Message channels
//!
//! A [`MessageChannel`] is one end of a bidirectional actor connection. It is opened exactly once,
//! either over a [`Transport`] (the peer lives in another process) or directly against another
//! in-process end (same-process actors), and is closed at most once.
//!
//! Once open, a channel belongs to the task loop it was opened on: incoming payloads and peer
//! hangups are delivered there, and [`MessageChannel::close`] must be called there. When the
//! channel closes, for whatever reason, its [`ChannelListener`] hears about it exactly once.
//!
//! Payloads posted before the channel opens are queued and flushed on open.

pub mod transport;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::ChannelError;
use crate::process::ProcessId;
use crate::runtime::TaskQueue;

pub use transport::{LoopbackTransport, Transport, TransportEvents, TransportLink};

/// Which end of a connection a channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Parent,
    Child,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Parent => Side::Child,
            Side::Child => Side::Parent,
        }
    }
}

/// Why a channel stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// This end closed the channel.
    LocalClose,
    /// The far end closed or its connection dropped.
    PeerClose,
}

/// Receives the end-of-life notification for a channel.
pub trait ChannelListener: Send + Sync + 'static {
    /// Called once, on the channel's owning loop, after the channel has closed.
    fn actor_destroy(self: Arc<Self>, reason: DestroyReason);
}

enum Link {
    Transport(Box<dyn TransportLink>),
    Direct {
        peer: Weak<MessageChannel>,
        peer_queue: TaskQueue,
    },
}

enum State {
    Unopened {
        outbox: Vec<Vec<u8>>,
    },
    Open {
        owner: TaskQueue,
        link: Link,
        listener: Arc<dyn ChannelListener>,
    },
    Closed,
}

pub struct MessageChannel {
    side: Side,
    state: Mutex<State>,
    inbox: Mutex<VecDeque<Vec<u8>>>,
    peer_pid: Mutex<Option<ProcessId>>,
}

impl MessageChannel {
    pub fn new(side: Side) -> Arc<Self> {
        Arc::new(Self {
            side,
            state: Mutex::new(State::Unopened { outbox: Vec::new() }),
            inbox: Mutex::new(VecDeque::new()),
            peer_pid: Mutex::new(None),
        })
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock(), State::Open { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), State::Closed)
    }

    /// Pid of the peer process for transport-backed channels.
    pub fn peer_pid(&self) -> Option<ProcessId> {
        *self.peer_pid.lock()
    }

    /// Opens this end over `transport`, owned by the calling thread's loop.
    ///
    /// Transport events arrive on `io_queue` and are forwarded to the owning loop.
    pub fn open(
        self: &Arc<Self>,
        transport: &mut dyn Transport,
        peer_pid: ProcessId,
        io_queue: &TaskQueue,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<(), ChannelError> {
        let owner = TaskQueue::current().ok_or(ChannelError::NoTaskQueue)?;
        let mut state = self.state.lock();
        match &*state {
            State::Unopened { .. } => {}
            State::Open { .. } => return Err(ChannelError::AlreadyOpen),
            State::Closed => return Err(ChannelError::Closed),
        }

        let link = transport.connect(io_queue, self.transport_events(&owner))?;
        let State::Unopened { outbox } = std::mem::replace(&mut *state, State::Closed) else {
            unreachable!("state checked above under the same lock");
        };
        for payload in outbox {
            if let Err(e) = link.send(payload) {
                warn!(side = ?self.side, error = %e, "Queued payload lost on open");
            }
        }
        *state = State::Open {
            owner,
            link: Link::Transport(link),
            listener,
        };
        drop(state);
        *self.peer_pid.lock() = Some(peer_pid);
        debug!(side = ?self.side, pid = peer_pid, "Channel opened over transport");
        Ok(())
    }

    fn transport_events(self: &Arc<Self>, owner: &TaskQueue) -> TransportEvents {
        let receiver = Arc::downgrade(self);
        let receive_queue = owner.clone();
        let hangup = Arc::downgrade(self);
        let hangup_queue = owner.clone();
        TransportEvents {
            on_receive: Arc::new(move |payload| {
                let receiver = receiver.clone();
                let _ = receive_queue.dispatch(move || {
                    if let Some(channel) = receiver.upgrade() {
                        channel.receive(payload);
                    }
                });
            }),
            on_hangup: Box::new(move || {
                let _ = hangup_queue.dispatch(move || {
                    if let Some(channel) = hangup.upgrade() {
                        channel.peer_closed();
                    }
                });
            }),
        }
    }

    /// Opens this end and `peer` against each other within one process.
    ///
    /// This end is owned by the calling thread's loop and `peer` by `peer_queue`'s loop.
    pub fn open_direct(
        self: &Arc<Self>,
        listener: Arc<dyn ChannelListener>,
        peer: &Arc<MessageChannel>,
        peer_queue: TaskQueue,
        peer_listener: Arc<dyn ChannelListener>,
    ) -> Result<(), ChannelError> {
        let owner = TaskQueue::current().ok_or(ChannelError::NoTaskQueue)?;
        if Arc::ptr_eq(self, peer) || self.side == peer.side {
            return Err(ChannelError::PeerUnavailable);
        }

        // Lock order: parent end first.
        let (first, second) = match self.side {
            Side::Parent => (self, peer),
            Side::Child => (peer, self),
        };
        let mut first_state = first.state.lock();
        let mut second_state = second.state.lock();
        let (mine, theirs) = match self.side {
            Side::Parent => (&mut *first_state, &mut *second_state),
            Side::Child => (&mut *second_state, &mut *first_state),
        };

        let (my_outbox, their_outbox) = match (&mut *mine, &mut *theirs) {
            (State::Unopened { outbox: a }, State::Unopened { outbox: b }) => {
                (std::mem::take(a), std::mem::take(b))
            }
            (State::Closed, _) | (_, State::Closed) => return Err(ChannelError::Closed),
            _ => return Err(ChannelError::AlreadyOpen),
        };

        *mine = State::Open {
            owner: owner.clone(),
            link: Link::Direct {
                peer: Arc::downgrade(peer),
                peer_queue: peer_queue.clone(),
            },
            listener,
        };
        *theirs = State::Open {
            owner: peer_queue.clone(),
            link: Link::Direct {
                peer: Arc::downgrade(self),
                peer_queue: owner.clone(),
            },
            listener: peer_listener,
        };
        drop(second_state);
        drop(first_state);

        for payload in my_outbox {
            deliver_direct(&Arc::downgrade(peer), &peer_queue, payload);
        }
        for payload in their_outbox {
            deliver_direct(&Arc::downgrade(self), &owner, payload);
        }
        debug!(side = ?self.side, "Channel opened in-process");
        Ok(())
    }

    /// Sends `payload` to the peer, or queues it if the channel is not open yet.
    pub fn post(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        match &mut *self.state.lock() {
            State::Unopened { outbox } => {
                outbox.push(payload);
                Ok(())
            }
            State::Open { link, .. } => match link {
                Link::Transport(link) => link.send(payload),
                Link::Direct { peer, peer_queue } => {
                    deliver_direct(peer, peer_queue, payload);
                    Ok(())
                }
            },
            State::Closed => Err(ChannelError::Closed),
        }
    }

    /// Drains payloads received so far.
    pub fn take_received(&self) -> Vec<Vec<u8>> {
        self.inbox.lock().drain(..).collect()
    }

    /// Pushes out anything the link has buffered.
    pub fn flush(&self) {
        if let State::Open {
            link: Link::Transport(link),
            ..
        } = &*self.state.lock()
        {
            link.flush();
        }
    }

    /// Closes this end and tells the peer. No-op if not open.
    ///
    /// # Panics
    ///
    /// Panics when called off the owning loop of an open channel.
    pub fn close(&self) {
        let previous = {
            let mut state = self.state.lock();
            if let State::Open { owner, .. } = &*state {
                assert!(
                    owner.is_current(),
                    "{:?} channel closed off its owning thread `{}`",
                    self.side,
                    owner.name()
                );
            }
            std::mem::replace(&mut *state, State::Closed)
        };
        match previous {
            State::Open { link, listener, .. } => {
                match link {
                    Link::Transport(link) => link.hang_up(),
                    Link::Direct { peer, peer_queue } => {
                        let _ = peer_queue.dispatch(move || {
                            if let Some(peer) = peer.upgrade() {
                                peer.peer_closed();
                            }
                        });
                    }
                }
                debug!(side = ?self.side, "Channel closed locally");
                listener.actor_destroy(DestroyReason::LocalClose);
            }
            State::Unopened { outbox } => {
                trace!(side = ?self.side, dropped = outbox.len(), "Unopened channel closed");
            }
            State::Closed => {}
        }
    }

    fn receive(&self, payload: Vec<u8>) {
        if matches!(*self.state.lock(), State::Open { .. }) {
            self.inbox.lock().push_back(payload);
        } else {
            trace!(side = ?self.side, "Payload for a closed channel dropped");
        }
    }

    fn peer_closed(&self) {
        let previous = {
            let mut state = self.state.lock();
            match &*state {
                State::Open { .. } => std::mem::replace(&mut *state, State::Closed),
                _ => return,
            }
        };
        if let State::Open { listener, .. } = previous {
            debug!(side = ?self.side, "Channel closed by peer");
            listener.actor_destroy(DestroyReason::PeerClose);
        }
    }
}

fn deliver_direct(peer: &Weak<MessageChannel>, peer_queue: &TaskQueue, payload: Vec<u8>) {
    let peer = peer.clone();
    if peer_queue
        .dispatch(move || {
            if let Some(peer) = peer.upgrade() {
                peer.receive(payload);
            }
        })
        .is_err()
    {
        warn!(queue = peer_queue.name(), "Peer loop stopped; payload dropped");
    }
}

impl fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            State::Unopened { .. } => "unopened",
            State::Open { .. } => "open",
            State::Closed => "closed",
        };
        f.debug_struct("MessageChannel")
            .field("side", &self.side)
            .field("state", &state)
            .finish()
    }
}
