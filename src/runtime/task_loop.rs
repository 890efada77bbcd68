//! # Task loops
//!
//! Every thread that takes part in the background protocol runs a [`TaskLoop`]: a FIFO of boxed
//! closures drained one at a time on that thread. Other threads reach it through a cloneable
//! [`TaskQueue`].
//!
//! The loop is built on a tokio unbounded channel consumed with `blocking_recv`, so loops run on
//! plain OS threads and never need a runtime of their own.
//!
//! - A thread hosts at most one loop. [`TaskQueue::current`] answers "which loop am I on".
//! - [`TaskLoop::at_exit`] hooks run on the owning thread when the loop is dropped. That is where
//!   per-thread cleanup lives, instead of thread-local destructors.
//! - [`TaskLoop::spin_until`] lets the owning thread keep serving tasks while it waits for a
//!   condition, which the shutdown coordinator relies on.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, trace};

/// A unit of work posted to a loop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Process-unique identity of a task loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(u64);

impl LoopId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        LoopId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Inverse of [`LoopId::as_u64`]. Zero is reserved for "no loop".
    pub(crate) fn from_u64(raw: u64) -> Option<Self> {
        (raw != 0).then_some(LoopId(raw))
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop#{}", self.0)
    }
}

/// Returned when a task is posted to a loop that no longer accepts work.
#[derive(Debug, Clone, thiserror::Error)]
#[error("task queue `{queue}` is no longer accepting tasks")]
pub struct DispatchError {
    pub queue: String,
}

pub(crate) enum Envelope {
    Run(Task),
    Quit,
}

/// Cloneable, thread-safe handle for posting tasks to a [`TaskLoop`].
#[derive(Clone)]
pub struct TaskQueue {
    id: LoopId,
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Envelope>,
}

impl TaskQueue {
    pub(crate) fn from_parts(
        id: LoopId,
        name: Arc<str>,
        sender: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self { id, name, sender }
    }

    /// The queue of the loop hosted by the calling thread, if any.
    pub fn current() -> Option<TaskQueue> {
        current_core().map(|core| core.queue.clone())
    }

    pub fn id(&self) -> LoopId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the caller runs on the thread that drains this queue.
    pub fn is_current(&self) -> bool {
        current_loop_id() == Some(self.id)
    }

    /// Posts `task` to the back of the queue.
    pub fn dispatch<F>(&self, task: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Envelope::Run(Box::new(task)))
            .map_err(|_| self.stopped())
    }

    pub(crate) fn quit(&self) -> Result<(), DispatchError> {
        self.sender.send(Envelope::Quit).map_err(|_| self.stopped())
    }

    fn stopped(&self) -> DispatchError {
        DispatchError {
            queue: self.name.to_string(),
        }
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Identity of the loop hosted by the calling thread.
pub fn current_loop_id() -> Option<LoopId> {
    CURRENT_ID.with(Cell::get)
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<LoopCore>>> = const { RefCell::new(None) };
    static CURRENT_ID: Cell<Option<LoopId>> = const { Cell::new(None) };
}

fn current_core() -> Option<Rc<LoopCore>> {
    CURRENT.with(|current| current.borrow().clone())
}

struct LoopCore {
    queue: TaskQueue,
    receiver: RefCell<mpsc::UnboundedReceiver<Envelope>>,
    exit_hooks: RefCell<Vec<Box<dyn FnOnce()>>>,
    quit: Cell<bool>,
}

impl LoopCore {
    /// Blocks for the next envelope and runs it. Returns false once the loop has stopped.
    fn run_one(&self) -> bool {
        if self.quit.get() {
            return false;
        }
        let envelope = self.receiver.borrow_mut().blocking_recv();
        self.handle(envelope)
    }

    /// Runs one envelope if one is already queued.
    fn try_run_one(&self) -> Option<bool> {
        if self.quit.get() {
            return Some(false);
        }
        let envelope = self.receiver.borrow_mut().try_recv();
        match envelope {
            Ok(envelope) => Some(self.handle(Some(envelope))),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(self.handle(None)),
        }
    }

    fn handle(&self, envelope: Option<Envelope>) -> bool {
        match envelope {
            Some(Envelope::Run(task)) => {
                task();
                true
            }
            Some(Envelope::Quit) | None => {
                self.quit.set(true);
                false
            }
        }
    }

    fn spin_until(&self, done: &mut dyn FnMut() -> bool) -> bool {
        loop {
            if done() {
                return true;
            }
            if !self.run_one() {
                return done();
            }
        }
    }
}

/// A FIFO task loop owned by the thread that created it.
///
/// `TaskLoop` is deliberately `!Send`: it can only be driven by the thread that installed it.
pub struct TaskLoop {
    core: Rc<LoopCore>,
}

impl TaskLoop {
    /// Installs a new loop on the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the thread already hosts a loop.
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self::install(
            TaskQueue::from_parts(LoopId::next(), Arc::from(name), sender),
            receiver,
        )
    }

    /// Installs a loop whose queue was handed out before the thread started.
    pub(crate) fn install(queue: TaskQueue, receiver: mpsc::UnboundedReceiver<Envelope>) -> Self {
        let core = Rc::new(LoopCore {
            queue,
            receiver: RefCell::new(receiver),
            exit_hooks: RefCell::new(Vec::new()),
            quit: Cell::new(false),
        });
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            assert!(
                current.is_none(),
                "thread already hosts a task loop; one loop per thread"
            );
            *current = Some(core.clone());
        });
        CURRENT_ID.with(|id| id.set(Some(core.queue.id)));
        trace!(queue = %core.queue.name, id = %core.queue.id, "Task loop installed");
        Self { core }
    }

    pub fn queue(&self) -> TaskQueue {
        self.core.queue.clone()
    }

    pub fn id(&self) -> LoopId {
        self.core.queue.id
    }

    /// Runs tasks until the loop is told to quit, then tears it down.
    pub fn run(self) {
        while self.core.run_one() {}
        debug!(queue = %self.core.queue.name, "Task loop stopped");
    }

    /// Runs every task that is already queued without blocking. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Some(true) = self.core.try_run_one() {
            ran += 1;
        }
        ran
    }

    /// Serves tasks until `done` returns true. Returns false if the loop stopped first.
    pub fn spin_until(&self, mut done: impl FnMut() -> bool) -> bool {
        self.core.spin_until(&mut done)
    }

    /// Like [`TaskLoop::spin_until`] but gives up after `timeout`.
    pub fn spin_until_timeout(&self, timeout: Duration, done: impl FnMut() -> bool) -> bool {
        spin_core_until_timeout(&self.core, timeout, done)
    }

    /// Registers a hook that runs on this thread when the loop is torn down.
    pub fn at_exit(&self, hook: impl FnOnce() + 'static) {
        self.core.exit_hooks.borrow_mut().push(Box::new(hook));
    }

    /// [`TaskLoop::spin_until`] for whichever loop the calling thread hosts.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread has no loop.
    pub fn spin_current_until(mut done: impl FnMut() -> bool) -> bool {
        match current_core() {
            Some(core) => core.spin_until(&mut done),
            None => panic!("spin_current_until called on a thread without a task loop"),
        }
    }

    /// [`TaskLoop::at_exit`] for whichever loop the calling thread hosts.
    /// Returns false if the thread has no loop.
    pub fn at_current_exit(hook: impl FnOnce() + 'static) -> bool {
        match current_core() {
            Some(core) => {
                core.exit_hooks.borrow_mut().push(Box::new(hook));
                true
            }
            None => false,
        }
    }
}

fn spin_core_until_timeout(
    core: &LoopCore,
    timeout: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        match core.try_run_one() {
            Some(true) => continue,
            Some(false) => return done(),
            None => {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                std::thread::park_timeout((deadline - now).min(Duration::from_millis(1)));
            }
        }
    }
}

impl Drop for TaskLoop {
    fn drop(&mut self) {
        // Hooks may register further hooks; drain until quiet.
        loop {
            let hooks = std::mem::take(&mut *self.core.exit_hooks.borrow_mut());
            if hooks.is_empty() {
                break;
            }
            for hook in hooks {
                hook();
            }
        }
        self.core.receiver.borrow_mut().close();
        CURRENT.with(|current| current.borrow_mut().take());
        CURRENT_ID.with(|id| id.set(None));
        trace!(queue = %self.core.queue.name, "Task loop torn down");
    }
}
