//! # Test doubles
//!
//! Stand-ins for the collaborators a [`Background`](crate::Background) talks to, so lifecycle
//! behavior can be driven deterministically from tests:
//!
//! - [`MockProcessTable`] decides which pids are alive and counts handle traffic.
//! - [`FlakySpawner`] fails a chosen number of thread spawns and counts attempts.
//! - [`StubbornTransport`] connects but never reports the far end hanging up.
//! - [`FailingTransport`] refuses to connect.
//! - [`ScriptedBridge`] records bridge requests from a content process.
//! - [`CallbackProbe`] records child-creation outcomes and lets a test wait for them.
//!
//! ```ignore
//! let probe = CallbackProbe::default();
//! background.get_or_create_for_current_thread(probe.callback("first"))?;
//! main_loop.spin_until_timeout(timeout, || probe.len() == 1);
//! assert!(matches!(probe.outcomes()[0], Outcome::Created { .. }));
//! ```

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::actor::{Actor, ActorId, CreateCallback};
use crate::channel::{Transport, TransportEvents, TransportLink};
use crate::error::{BackgroundError, ChannelError};
use crate::lifecycle::BridgeConnector;
use crate::process::{ProcessHandle, ProcessId, ProcessTable};
use crate::runtime::{current_loop_id, LoopId, TaskQueue, ThreadSpawner};

// =============================================================================
// PROCESSES
// =============================================================================

/// Process table whose live pids are set by the test.
#[derive(Default)]
pub struct MockProcessTable {
    live: Mutex<HashSet<ProcessId>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl MockProcessTable {
    pub fn with_live(pids: impl IntoIterator<Item = ProcessId>) -> Arc<Self> {
        Arc::new(Self {
            live: Mutex::new(pids.into_iter().collect()),
            ..Self::default()
        })
    }

    /// Marks `pid` as exited. Existing handles stay open.
    pub fn kill(&self, pid: ProcessId) {
        self.live.lock().remove(&pid);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn open_handles(&self) -> usize {
        self.opened() - self.closed()
    }
}

impl ProcessTable for MockProcessTable {
    fn open(&self, pid: ProcessId) -> Option<ProcessHandle> {
        if !self.live.lock().contains(&pid) {
            return None;
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Some(ProcessHandle::new(pid))
    }

    fn close(&self, _handle: ProcessHandle) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// THREADS
// =============================================================================

/// Spawns real threads after failing the first `failures` attempts.
#[derive(Default)]
pub struct FlakySpawner {
    failures: AtomicUsize,
    attempts: AtomicUsize,
    spawned: AtomicUsize,
}

impl FlakySpawner {
    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            ..Self::default()
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl ThreadSpawner for FlakySpawner {
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::new(io::ErrorKind::Other, "injected spawn failure"));
        }
        let handle = std::thread::Builder::new().name(name.to_owned()).spawn(body)?;
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }
}

// =============================================================================
// TRANSPORTS
// =============================================================================

#[derive(Default)]
struct StubbornCounters {
    connected: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
    hang_ups: AtomicUsize,
}

/// Connects, swallows sends, and never reports a hangup. Clones share counters.
#[derive(Clone, Default)]
pub struct StubbornTransport {
    counters: Arc<StubbornCounters>,
}

impl StubbornTransport {
    pub fn is_connected(&self) -> bool {
        self.counters.connected.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.counters.sent.lock().clone()
    }

    pub fn hang_ups(&self) -> usize {
        self.counters.hang_ups.load(Ordering::SeqCst)
    }
}

struct StubbornLink {
    counters: Arc<StubbornCounters>,
}

impl Transport for StubbornTransport {
    fn connect(
        &mut self,
        _io_queue: &TaskQueue,
        _events: TransportEvents,
    ) -> Result<Box<dyn TransportLink>, ChannelError> {
        self.counters.connected.store(true, Ordering::SeqCst);
        Ok(Box::new(StubbornLink {
            counters: self.counters.clone(),
        }))
    }
}

impl TransportLink for StubbornLink {
    fn send(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.counters.sent.lock().push(payload);
        Ok(())
    }

    fn hang_up(&self) {
        self.counters.hang_ups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport whose connect always fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingTransport;

impl Transport for FailingTransport {
    fn connect(
        &mut self,
        _io_queue: &TaskQueue,
        _events: TransportEvents,
    ) -> Result<Box<dyn TransportLink>, ChannelError> {
        Err(ChannelError::Transport("injected connect failure".into()))
    }
}

// =============================================================================
// BRIDGE
// =============================================================================

/// Records bridge requests; optionally refuses them.
#[derive(Default)]
pub struct ScriptedBridge {
    requests: AtomicUsize,
    refuse: AtomicBool,
}

impl ScriptedBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refusing() -> Arc<Self> {
        let bridge = Self::new();
        bridge.refuse.store(true, Ordering::SeqCst);
        bridge
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl BridgeConnector for ScriptedBridge {
    fn open_bridge(&self) -> Result<(), BackgroundError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(BackgroundError::Bridge("injected bridge refusal".into()));
        }
        Ok(())
    }
}

// =============================================================================
// CALLBACKS
// =============================================================================

/// One recorded child-creation outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created {
        label: String,
        actor: ActorId,
        /// Loop the callback ran on.
        ran_on: Option<LoopId>,
    },
    Failed {
        label: String,
        ran_on: Option<LoopId>,
    },
}

impl Outcome {
    pub fn label(&self) -> &str {
        match self {
            Outcome::Created { label, .. } | Outcome::Failed { label, .. } => label,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Outcome::Created { .. })
    }
}

/// Shared recorder for [`CreateCallback`] outcomes. Clones record into the same log.
#[derive(Clone, Default)]
pub struct CallbackProbe {
    log: Arc<(Mutex<Vec<Outcome>>, Condvar)>,
}

impl CallbackProbe {
    /// A callback that records its outcome under `label`.
    pub fn callback(&self, label: &str) -> impl CreateCallback {
        let log = self.log.clone();
        let label = label.to_owned();
        move |result: Result<Arc<Actor>, BackgroundError>| {
            let ran_on = current_loop_id();
            let outcome = match result {
                Ok(actor) => Outcome::Created {
                    label,
                    actor: actor.id(),
                    ran_on,
                },
                Err(_) => Outcome::Failed { label, ran_on },
            };
            let (outcomes, changed) = &*log;
            outcomes.lock().push(outcome);
            changed.notify_all();
        }
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.log.0.lock().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.log.0.lock().iter().map(|o| o.label().to_owned()).collect()
    }

    pub fn len(&self) -> usize {
        self.log.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until at least `count` outcomes are recorded. Returns false on timeout.
    ///
    /// Only for threads that are not needed to deliver the outcomes; a thread that must run
    /// its own loop should spin it instead.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (outcomes, changed) = &*self.log;
        let mut outcomes = outcomes.lock();
        while outcomes.len() < count {
            if changed.wait_until(&mut outcomes, deadline).timed_out() {
                return outcomes.len() >= count;
            }
        }
        true
    }
}
