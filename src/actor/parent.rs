use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::{Actor, Role};
use crate::channel::{DestroyReason, Transport};
use crate::error::ChannelError;
use crate::lifecycle::{Background, LiveActors};
use crate::process::{ContentProcess, PeerProcess};
use crate::runtime::TaskQueue;

pub(crate) struct ParentState {
    background: Background,
    /// Where the transport is released.
    dispatcher: TaskQueue,
    live: Arc<LiveActors>,
    content: Mutex<Option<Arc<ContentProcess>>>,
    transport: Mutex<Option<Box<dyn Transport>>>,
    process: Mutex<Option<PeerProcess>>,
    other_process: bool,
    torn_down: AtomicBool,
}

impl ParentState {
    pub(crate) fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub(crate) fn is_other_process(&self) -> bool {
        self.other_process
    }

    pub(crate) fn content(&self) -> Option<Arc<ContentProcess>> {
        self.content.lock().clone()
    }

    /// Dispatcher thread.
    fn connect(&self, actor: &Arc<Actor>) {
        actor.bound.bind_current();
        let Some(io_queue) = TaskQueue::current() else {
            error!(actor = %actor.id, "Parent connect ran outside a task loop");
            return;
        };
        let pid = self.process.lock().as_ref().map(PeerProcess::pid);
        let result = match (self.transport.lock().as_mut(), pid) {
            (Some(transport), Some(pid)) => {
                actor
                    .channel
                    .open(transport.as_mut(), pid, &io_queue, actor.clone())
            }
            _ => Err(ChannelError::PeerUnavailable),
        };
        match result {
            Ok(()) => {
                self.live.insert(actor);
                debug!(actor = %actor.id, ?pid, "Parent actor connected");
            }
            Err(e) => {
                warn!(actor = %actor.id, error = %e, "Failed to open parent actor");
                actor.destroy();
            }
        }
    }

    /// Dispatcher thread, after a child opened directly against this parent.
    fn attach(&self, actor: &Arc<Actor>) {
        actor.bound.bind_current();
        if actor.is_destroyed() {
            debug!(actor = %actor.id, "Parent closed before attaching");
            return;
        }
        self.live.insert(actor);
        debug!(actor = %actor.id, "Parent actor attached in-process");
    }

    /// Dispatcher thread, from `actor_destroy`.
    pub(crate) fn on_destroyed(&self, actor: &Arc<Actor>, reason: DestroyReason) {
        self.live.remove(actor);
        debug!(actor = %actor.id, ?reason, "Parent actor destroyed");

        // The channel is still unwinding; finish on a later turn.
        let deferred = actor.clone();
        let posted = TaskQueue::current().map(|queue| queue.dispatch(move || deferred.destroy()));
        if !matches!(posted, Some(Ok(()))) {
            actor.destroy();
        }
    }

    fn main_thread_teardown(&self, actor: &Actor) {
        self.background.assert_on_main_thread();
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        actor.destroyed.store(true, Ordering::Release);

        if let Some(transport) = self.transport.lock().take() {
            if let Err(e) = self.dispatcher.dispatch(move || drop(transport)) {
                warn!(actor = %actor.id, error = %e, "Dispatcher gone; transport released on main thread");
            }
        }
        let process = self.process.lock().take();
        drop(process);
        self.content.lock().take();

        debug!(actor = %actor.id, "Parent actor torn down");
        self.background.release_live_actor();
    }
}

impl Actor {
    pub(crate) fn new_parent(
        background: Background,
        dispatcher: TaskQueue,
        live: Arc<LiveActors>,
        content: Option<Arc<ContentProcess>>,
        transport: Option<Box<dyn Transport>>,
        process: Option<PeerProcess>,
    ) -> Arc<Self> {
        let other_process = transport.is_some();
        Actor::with_role(Role::Parent(ParentState {
            background,
            dispatcher,
            live,
            content: Mutex::new(content),
            transport: Mutex::new(transport),
            process: Mutex::new(process),
            other_process,
            torn_down: AtomicBool::new(false),
        }))
    }

    fn parent_state(&self) -> &ParentState {
        match &self.role {
            Role::Parent(parent) => parent,
            Role::Child(_) => panic!("actor {} is not a parent", self.id),
        }
    }

    pub(crate) fn connect(self: &Arc<Self>) {
        self.parent_state().connect(self);
    }

    pub(crate) fn attach(self: &Arc<Self>) {
        self.parent_state().attach(self);
    }

    /// Main-thread teardown without the task hop, for parents that never reached the dispatcher.
    pub(crate) fn teardown_now(self: &Arc<Self>) {
        self.parent_state().main_thread_teardown(self);
    }

    /// Schedules main-thread teardown of a parent actor. Safe from any thread and idempotent.
    ///
    /// # Panics
    ///
    /// Panics for child actors.
    pub fn destroy(self: &Arc<Self>) {
        let parent = self.parent_state();
        let actor = self.clone();
        if let Err(e) = parent
            .background
            .main_queue()
            .dispatch(move || actor.parent_state().main_thread_teardown(&actor))
        {
            error!(actor = %self.id, error = %e, "Main thread gone; parent actor cannot be torn down");
        }
    }
}
