//! Dispatcher thread registry and parent-side allocation.
//!
//! The dispatcher thread is spawned on first demand from the main thread. Its task queue is
//! published back to the main thread through a double hop: a probe task runs on the new thread,
//! records the thread's identity, and posts the queue back to main. Same-process requests that
//! arrive before then wait in a FIFO that drains on publication.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use tracing::{debug, error, info, trace, warn};

use super::Background;
use crate::actor::{Actor, SameProcessCallback};
use crate::channel::Transport;
use crate::error::BackgroundError;
use crate::process::{ContentProcess, PeerProcess, ProcessId};
use crate::runtime::{current_loop_id, DeadlineTimer, LoopId, TaskQueue, ThreadBound, ThreadHandle};

/// Parent actors currently open on the dispatcher thread. Dispatcher thread only.
pub(crate) struct LiveActors {
    actors: ThreadBound<Vec<Weak<Actor>>>,
}

impl LiveActors {
    fn new(dispatcher: LoopId) -> Self {
        Self {
            actors: ThreadBound::new(dispatcher, "live parent actor set", Vec::new()),
        }
    }

    pub(crate) fn insert(&self, actor: &Arc<Actor>) {
        self.actors.with(|actors| {
            debug_assert!(
                !actors.iter().any(|known| std::ptr::eq(known.as_ptr(), Arc::as_ptr(actor))),
                "parent actor registered twice"
            );
            actors.push(Arc::downgrade(actor));
        });
    }

    pub(crate) fn remove(&self, actor: &Arc<Actor>) -> bool {
        self.actors.with(|actors| {
            let before = actors.len();
            actors.retain(|known| {
                known.strong_count() > 0 && !std::ptr::eq(known.as_ptr(), Arc::as_ptr(actor))
            });
            actors.len() != before
        })
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Actor>> {
        self.actors
            .with(|actors| actors.iter().filter_map(Weak::upgrade).collect())
    }
}

pub(crate) enum Readiness {
    /// Spawned, queue not yet published. Holds same-process requests in arrival order.
    Starting(VecDeque<Box<dyn SameProcessCallback>>),
    Ready(TaskQueue),
}

pub(crate) struct DispatcherThread {
    pub(crate) handle: ThreadHandle,
    pub(crate) readiness: Readiness,
    pub(crate) live: Arc<LiveActors>,
}

impl Background {
    /// Spawns the dispatcher thread unless it already exists. Main thread only.
    ///
    /// Fails once shutdown has started, or when the timer or thread cannot be created. A failed
    /// spawn leaves nothing registered, so a later call may try again.
    pub fn ensure_dispatcher_thread(&self) -> Result<(), BackgroundError> {
        self.assert_on_main_thread();
        let needs_timer = self.shared.main.with(|state| {
            if state.shutdown_started {
                return Err(BackgroundError::ShutdownStarted);
            }
            Ok(state.dispatcher.is_none().then_some(state.timer.is_none()))
        })?;
        let Some(needs_timer) = needs_timer else {
            return Ok(());
        };

        let timer = if needs_timer {
            Some(DeadlineTimer::new().map_err(|e| {
                warn!(error = %e, "Failed to create shutdown timer");
                BackgroundError::TimerUnavailable(e)
            })?)
        } else {
            None
        };
        self.shared.main.with(|state| {
            if state.timer.is_none() {
                state.timer = timer;
            }
            state.parent_side_started = true;
        });

        let name = &self.shared.config.dispatcher_thread_name;
        let handle = ThreadHandle::spawn(&*self.shared.spawner, name).map_err(|e| {
            warn!(thread = %name, error = %e, "Failed to spawn dispatcher thread");
            BackgroundError::ThreadSpawn(e)
        })?;
        let background = self.clone();
        handle.dispatch(move || background.report_dispatcher_ready())?;

        info!(thread = %name, id = %handle.id(), "Dispatcher thread spawned");
        let live = Arc::new(LiveActors::new(handle.id()));
        self.shared.main.with(|state| {
            state.dispatcher = Some(DispatcherThread {
                handle,
                readiness: Readiness::Starting(VecDeque::new()),
                live,
            });
        });
        Ok(())
    }

    /// Runs first on the dispatcher thread.
    fn report_dispatcher_ready(&self) {
        let Some(queue) = TaskQueue::current() else {
            error!("Dispatcher probe ran outside a task loop");
            return;
        };
        let previous = self
            .shared
            .dispatcher_loop
            .swap(queue.id().as_u64(), Ordering::AcqRel);
        if let Some(previous) = LoopId::from_u64(previous) {
            warn!(%previous, "Replacing a dispatcher identity that was never cleared");
        }
        let background = self.clone();
        if let Err(e) = self
            .shared
            .main_queue
            .dispatch(move || background.on_dispatcher_ready(queue))
        {
            warn!(error = %e, "Main thread gone before dispatcher readiness");
        }
    }

    /// Main thread. Ignores queues from a dispatcher that has since been torn down.
    fn on_dispatcher_ready(&self, queue: TaskQueue) {
        let waiters = self.shared.main.with(|state| {
            let dispatcher = state
                .dispatcher
                .as_mut()
                .filter(|dispatcher| dispatcher.handle.owns(&queue))?;
            match std::mem::replace(&mut dispatcher.readiness, Readiness::Ready(queue.clone())) {
                Readiness::Starting(waiters) => Some(waiters),
                Readiness::Ready(_) => panic!("dispatcher readiness published twice"),
            }
        });
        let Some(waiters) = waiters else {
            debug!(id = %queue.id(), "Stale dispatcher readiness ignored");
            return;
        };
        info!(thread = queue.name(), waiters = waiters.len(), "Dispatcher thread ready");
        for callback in waiters {
            self.post_same_process_completion(callback);
        }
    }

    /// Dispatcher thread only is meaningful; false everywhere else.
    pub fn is_on_dispatcher_thread(&self) -> bool {
        let registered = LoopId::from_u64(self.shared.dispatcher_loop.load(Ordering::Acquire));
        registered.is_some() && registered == current_loop_id()
    }

    /// Dispatcher thread, last task before it stops.
    pub(crate) fn unregister_dispatcher(&self, id: LoopId) {
        let cleared = self.shared.dispatcher_loop.compare_exchange(
            id.as_u64(),
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if cleared.is_err() {
            debug!(%id, "Dispatcher identity already replaced");
        }
    }

    /// Whether the dispatcher thread exists. Main thread only.
    pub fn has_dispatcher_thread(&self) -> bool {
        self.shared.main.with(|state| state.dispatcher.is_some())
    }

    /// The dispatcher's task queue once it has been published. Main thread only.
    pub fn dispatcher_queue(&self) -> Option<TaskQueue> {
        self.shared.main.with(|state| match &state.dispatcher {
            Some(DispatcherThread {
                readiness: Readiness::Ready(queue),
                ..
            }) => Some(queue.clone()),
            _ => None,
        })
    }

    /// Allocates a parent actor serving process `pid` over `transport`. Main thread only.
    ///
    /// The actor is returned right away and opens on the dispatcher thread shortly after.
    /// Payloads posted before then are queued. If the open fails the actor tears itself down.
    pub fn alloc_cross_process<T: Transport>(
        &self,
        content: Arc<ContentProcess>,
        transport: T,
        pid: ProcessId,
    ) -> Result<Arc<Actor>, BackgroundError> {
        self.assert_on_main_thread();
        let peer = PeerProcess::open(&self.shared.processes, pid).ok_or_else(|| {
            warn!(pid, "Peer process is gone");
            BackgroundError::PeerGone(pid)
        })?;
        self.ensure_dispatcher_thread()?;

        let registered = self.shared.main.with(|state| {
            let found = state
                .dispatcher
                .as_ref()
                .map(|dispatcher| (dispatcher.handle.queue(), dispatcher.live.clone()));
            if found.is_some() {
                state.live_actor_count += 1;
            }
            found
        });
        let Some((dispatcher, live)) = registered else {
            return Err(BackgroundError::ShutdownStarted);
        };

        let actor = Actor::new_parent(
            self.clone(),
            dispatcher.clone(),
            live,
            Some(content),
            Some(Box::new(transport)),
            Some(peer),
        );
        let connecting = actor.clone();
        if let Err(e) = dispatcher.dispatch(move || connecting.connect()) {
            warn!(pid, error = %e, "Failed to post parent connect");
            actor.teardown_now();
            return Err(e.into());
        }
        debug!(actor = %actor.id(), pid, "Cross-process parent allocated");
        Ok(actor)
    }

    /// Allocates an unopened in-process parent and hands it to `callback` on the main thread
    /// once the dispatcher queue is known. Main thread only.
    ///
    /// On `Err` the callback is dropped without being called.
    pub fn create_actor_for_same_process<C: SameProcessCallback>(
        &self,
        callback: C,
    ) -> Result<(), BackgroundError> {
        self.assert_on_main_thread();
        self.ensure_dispatcher_thread()?;

        let callback: Box<dyn SameProcessCallback> = Box::new(callback);
        let immediate = self.shared.main.with(|state| {
            state.live_actor_count += 1;
            match state.dispatcher.as_mut().map(|d| &mut d.readiness) {
                Some(Readiness::Starting(waiters)) => {
                    waiters.push_back(callback);
                    None
                }
                _ => Some(callback),
            }
        });
        match immediate {
            Some(callback) => self.post_same_process_completion(callback),
            None => trace!("Same-process request queued until the dispatcher is ready"),
        }
        Ok(())
    }

    fn post_same_process_completion(&self, callback: Box<dyn SameProcessCallback>) {
        let background = self.clone();
        if let Err(e) = self
            .shared
            .main_queue
            .dispatch(move || background.complete_same_process(callback))
        {
            error!(error = %e, "Main thread gone; same-process request dropped");
        }
    }

    /// Main thread, one task turn after the request or the readiness report.
    fn complete_same_process(&self, callback: Box<dyn SameProcessCallback>) {
        let ready = self.shared.main.with(|state| match &state.dispatcher {
            Some(DispatcherThread {
                readiness: Readiness::Ready(queue),
                live,
                ..
            }) => Some((queue.clone(), live.clone())),
            _ => None,
        });
        match ready {
            Some((queue, live)) => {
                let parent = Actor::new_parent(self.clone(), queue.clone(), live, None, None, None);
                debug!(actor = %parent.id(), "Same-process parent allocated");
                callback.success(parent, queue);
            }
            None => {
                debug!("Dispatcher gone before same-process request completed");
                callback.failure();
                self.release_live_actor();
            }
        }
    }
}
