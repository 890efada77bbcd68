//! # Background lifecycle
//!
//! [`Background`] is the process-wide context. It is cheap to clone and every clone refers to
//! the same state. It owns:
//!
//! - **the dispatcher registry**: the lazily spawned dispatcher thread, its published task queue,
//!   and the set of live parent actors bound to it ([`dispatcher`]);
//! - **thread slots**: one per consumer thread that asked for a child actor, holding the actor,
//!   the callbacks waiting on it, and an opaque payload ([`slots`]);
//! - **the child-open protocol**: how a consumer's request turns into an opened child, in-process
//!   or through a bridge to the main process ([`child_open`]);
//! - **the shutdown coordinator**: voluntary close, a bounded wait, then forced close
//!   ([`shutdown`]).
//!
//! Main-thread bookkeeping sits in a [`ThreadBound`] cell owned by the main loop, so touching it
//! from any other thread panics. The only state read across threads is the atomic dispatcher
//! identity and the shutdown flag.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use background_ipc::{Actor, Background, BackgroundConfig, BackgroundError, TaskLoop};
//!
//! let main_loop = TaskLoop::new("main");
//! let background = Background::startup(BackgroundConfig::default())?;
//! background.get_or_create_for_current_thread(|result: Result<Arc<Actor>, BackgroundError>| {
//!     if let Ok(actor) = result {
//!         println!("child actor {} ready", actor.id());
//!     }
//! })?;
//! main_loop.spin_until(|| background.get_for_current_thread().is_some());
//! background.shutdown();
//! # Ok::<(), BackgroundError>(())
//! ```

pub mod child_open;
pub mod dispatcher;
pub mod shutdown;
pub mod slots;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::{BackgroundConfig, ProcessRole};
use crate::error::BackgroundError;
use crate::process::{OsProcessTable, ProcessTable};
use crate::runtime::{
    current_loop_id, DeadlineTimer, LoopId, OsThreadSpawner, TaskQueue, ThreadBound,
    ThreadSpawner,
};

pub use child_open::BridgeConnector;
pub(crate) use dispatcher::LiveActors;

use child_open::OpenTarget;
use dispatcher::DispatcherThread;
use slots::SlotRegistry;

/// Handle on the process-wide background state.
#[derive(Clone)]
pub struct Background {
    shared: Arc<Shared>,
}

struct Shared {
    config: BackgroundConfig,
    main_loop: LoopId,
    main_queue: TaskQueue,
    processes: Arc<dyn ProcessTable>,
    spawner: Arc<dyn ThreadSpawner>,
    bridge: Option<Arc<dyn BridgeConnector>>,
    /// Loop id of the registered dispatcher thread, 0 when none.
    dispatcher_loop: AtomicU64,
    /// Cross-thread mirror of `MainState::shutdown_started`.
    shutdown_started: AtomicBool,
    main: ThreadBound<MainState>,
    slots: SlotRegistry,
}

#[derive(Default)]
struct MainState {
    dispatcher: Option<DispatcherThread>,
    live_actor_count: u64,
    shutdown_started: bool,
    /// Set by the first dispatcher request; shutdown only runs the parent side once set.
    parent_side_started: bool,
    timer: Option<DeadlineTimer>,
    /// Content role: threads waiting for the main process to bridge a child to them.
    pending_targets: VecDeque<OpenTarget>,
    forced_close_rounds: u32,
}

/// Collects collaborators before [`BackgroundBuilder::startup`].
pub struct BackgroundBuilder {
    config: BackgroundConfig,
    processes: Arc<dyn ProcessTable>,
    spawner: Arc<dyn ThreadSpawner>,
    bridge: Option<Arc<dyn BridgeConnector>>,
}

impl BackgroundBuilder {
    pub fn process_table<P: ProcessTable>(mut self, table: Arc<P>) -> Self {
        self.processes = table;
        self
    }

    pub fn thread_spawner<S: ThreadSpawner>(mut self, spawner: Arc<S>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Required for [`ProcessRole::Content`].
    pub fn bridge<B: BridgeConnector>(mut self, bridge: Arc<B>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Starts the background context on the calling thread, which becomes its main thread.
    pub fn startup(self) -> Result<Background, BackgroundError> {
        self.config.validate()?;
        let main_queue = TaskQueue::current().ok_or(BackgroundError::NoTaskQueue)?;
        if self.config.role == ProcessRole::Content && self.bridge.is_none() {
            return Err(BackgroundError::Bridge(
                "content processes need a bridge connector".into(),
            ));
        }
        let main_loop = main_queue.id();
        info!(role = ?self.config.role, main = main_queue.name(), "Background started");
        Ok(Background {
            shared: Arc::new(Shared {
                config: self.config,
                main_loop,
                main_queue,
                processes: self.processes,
                spawner: self.spawner,
                bridge: self.bridge,
                dispatcher_loop: AtomicU64::new(0),
                shutdown_started: AtomicBool::new(false),
                main: ThreadBound::new(
                    main_loop,
                    "background main-thread state",
                    MainState::default(),
                ),
                slots: SlotRegistry::default(),
            }),
        })
    }
}

impl Background {
    pub fn builder(config: BackgroundConfig) -> BackgroundBuilder {
        BackgroundBuilder {
            config,
            processes: Arc::new(OsProcessTable),
            spawner: Arc::new(OsThreadSpawner),
            bridge: None,
        }
    }

    /// Starts with the OS process table and thread spawner.
    pub fn startup(config: BackgroundConfig) -> Result<Self, BackgroundError> {
        Self::builder(config).startup()
    }

    pub fn config(&self) -> &BackgroundConfig {
        &self.shared.config
    }

    pub fn main_queue(&self) -> TaskQueue {
        self.shared.main_queue.clone()
    }

    pub fn is_main_thread(&self) -> bool {
        current_loop_id() == Some(self.shared.main_loop)
    }

    #[track_caller]
    pub(crate) fn assert_on_main_thread(&self) {
        assert!(self.is_main_thread(), "must be called on the background main thread");
    }

    /// Readable from any thread.
    pub fn is_shutdown_started(&self) -> bool {
        self.shared.shutdown_started.load(Ordering::Acquire)
    }

    /// Main thread only.
    pub fn live_actor_count(&self) -> u64 {
        self.shared.main.with(|state| state.live_actor_count)
    }

    /// How many times the shutdown grace period expired and live actors were force-closed.
    /// Main thread only.
    pub fn forced_close_rounds(&self) -> u32 {
        self.shared.main.with(|state| state.forced_close_rounds)
    }

    /// Drops one live-actor reference, stopping the dispatcher thread when none remain.
    pub(crate) fn release_live_actor(&self) {
        let remaining = self.shared.main.with(|state| {
            assert!(state.live_actor_count > 0, "live actor count underflow");
            state.live_actor_count -= 1;
            state.live_actor_count
        });
        if remaining == 0 {
            self.shutdown_dispatcher_thread();
        }
    }
}

impl fmt::Debug for Background {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Background")
            .field("role", &self.shared.config.role)
            .field("main_loop", &self.shared.main_loop)
            .field("shutdown_started", &self.is_shutdown_started())
            .finish()
    }
}
