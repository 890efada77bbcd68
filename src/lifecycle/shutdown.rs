//! Shutdown coordination.
//!
//! Shutdown first fails everything still waiting to be created, then closes every thread slot
//! so children close voluntarily. The main thread keeps serving its loop until the live-actor
//! count drains. If that takes longer than the configured grace period, the remaining parents
//! are closed on the dispatcher thread. The dispatcher thread is joined last.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::dispatcher::{DispatcherThread, LiveActors, Readiness};
use super::Background;
use crate::runtime::{TaskLoop, TaskQueue};

impl Background {
    /// Shuts the background down. Main thread only; later calls are no-ops.
    ///
    /// Blocks while serving the main loop until every live actor has been released.
    pub fn shutdown(&self) {
        self.assert_on_main_thread();
        let (already, parent_side_started) = self.shared.main.with(|state| {
            (
                std::mem::replace(&mut state.shutdown_started, true),
                state.parent_side_started,
            )
        });
        if already {
            return;
        }
        self.shared.shutdown_started.store(true, Ordering::Release);
        info!(live_actors = self.live_actor_count(), "Background shutdown started");

        self.fail_pending_same_process();
        self.fail_pending_targets();
        self.close_all_slots();

        if parent_side_started {
            self.shutdown_dispatcher_thread();
        }
        info!("Background shutdown complete");
    }

    /// Fails same-process requests still waiting for the dispatcher queue.
    fn fail_pending_same_process(&self) {
        let waiters = self.shared.main.with(|state| {
            let Some(Readiness::Starting(waiters)) =
                state.dispatcher.as_mut().map(|d| &mut d.readiness)
            else {
                return VecDeque::new();
            };
            let waiters = std::mem::take(waiters);
            let released = waiters.len() as u64;
            debug_assert!(state.live_actor_count >= released);
            state.live_actor_count = state.live_actor_count.saturating_sub(released);
            waiters
        });
        if waiters.is_empty() {
            return;
        }
        debug!(count = waiters.len(), "Failing same-process requests");
        for callback in waiters {
            callback.failure();
        }
    }

    /// Main thread. Stops and joins the dispatcher thread.
    ///
    /// Outside shutdown this runs when the last live actor is released. During shutdown it
    /// first waits for live actors to drain, forcing them closed once the grace period expires.
    pub(crate) fn shutdown_dispatcher_thread(&self) {
        self.assert_on_main_thread();
        self.fail_pending_same_process();
        let (dispatcher, timer, shutting_down, live_actors) = self.shared.main.with(|state| {
            let dispatcher = state.dispatcher.take();
            let timer = if state.shutdown_started && dispatcher.is_some() {
                state.timer.take()
            } else {
                None
            };
            (dispatcher, timer, state.shutdown_started, state.live_actor_count)
        });
        let Some(DispatcherThread { handle, live, .. }) = dispatcher else {
            return;
        };

        let mut timer = timer;
        if shutting_down && live_actors > 0 {
            let grace = self.shared.config.shutdown_grace();
            info!(live_actors, ?grace, "Waiting for live actors to close");
            if let Some(timer) = timer.as_mut() {
                let background = self.clone();
                let dispatcher_queue = handle.queue();
                timer.arm(grace, self.main_queue(), move || {
                    background.force_close_live_actors(&dispatcher_queue, live)
                });
            } else {
                warn!("No shutdown timer; waiting without a deadline");
            }
            TaskLoop::spin_current_until(|| self.live_actor_count() == 0);
            if let Some(timer) = timer.as_mut() {
                timer.cancel();
            }
        }

        let background = self.clone();
        let id = handle.id();
        if let Err(e) = handle.dispatch(move || background.unregister_dispatcher(id)) {
            warn!(error = %e, "Dispatcher stopped before it could unregister");
            self.unregister_dispatcher(id);
        }
        let name = handle.name().to_owned();
        handle.shutdown();
        info!(thread = %name, "Dispatcher thread joined");
        drop(timer);
    }

    /// Main thread, when the shutdown grace period expires. Closes every live parent on the
    /// dispatcher thread. Holds one live-actor reference for the round so the count cannot
    /// reach zero before the closes have been issued.
    fn force_close_live_actors(&self, dispatcher: &TaskQueue, live: Arc<LiveActors>) {
        let remaining = self.shared.main.with(|state| {
            if state.live_actor_count == 0 {
                return None;
            }
            state.live_actor_count += 1;
            state.forced_close_rounds += 1;
            Some(state.live_actor_count - 1)
        });
        let Some(remaining) = remaining else {
            debug!("Grace period expired after live actors drained");
            return;
        };
        warn!(live_actors = remaining, "Grace period expired; forcing live actors closed");

        let background = self.clone();
        let main = self.main_queue();
        let posted = dispatcher.dispatch(move || {
            let actors = live.snapshot();
            debug!(count = actors.len(), "Force-closing parent actors");
            for actor in actors {
                actor.close();
            }
            if let Err(e) = main.dispatch(move || background.release_live_actor()) {
                warn!(error = %e, "Main thread gone before forced close finished");
            }
        });
        if let Err(e) = posted {
            warn!(error = %e, "Dispatcher gone; forced close skipped");
            self.release_live_actor();
        }
    }
}
