//! Turning a consumer's request into an opened child actor.
//!
//! In the main process the child is linked directly to a same-process parent on the dispatcher
//! thread. In a content process the main thread asks the main process for a bridge through a
//! [`BridgeConnector`], and the child end arrives later through [`Background::alloc_child`].
//! Either way the child opens on the requesting thread and is published into its slot there.

use std::sync::Arc;

use tracing::{debug, warn};

use super::Background;
use crate::actor::{Actor, SameProcessCallback};
use crate::channel::Transport;
use crate::config::ProcessRole;
use crate::error::BackgroundError;
use crate::process::{PeerProcess, ProcessId};
use crate::runtime::{LoopId, TaskQueue};

/// Asks the main process to open a bridge to this content process.
///
/// Called on the content process's main thread. The child end is delivered later by calling
/// [`Background::alloc_child`] on that same thread, one call per successful request.
pub trait BridgeConnector: Send + Sync + 'static {
    fn open_bridge(&self) -> Result<(), BackgroundError>;
}

/// The slot a construction sequence will publish into.
#[derive(Debug, Clone)]
pub(crate) struct OpenTarget {
    pub(crate) loop_id: LoopId,
    pub(crate) queue: TaskQueue,
    pub(crate) generation: u64,
}

/// Same-process completion that opens the requesting thread's child against the new parent.
struct ChildOpenRequest {
    background: Background,
    target: OpenTarget,
}

impl SameProcessCallback for ChildOpenRequest {
    fn success(self: Box<Self>, parent: Arc<Actor>, dispatcher: TaskQueue) {
        let ChildOpenRequest { background, target } = *self;
        let queue = target.queue.clone();
        let open = InProcessOpen {
            background,
            target,
            child: Actor::new_child(),
            parent: Some(parent),
            dispatcher,
        };
        // An unsent task is dropped here, which tears the parent down.
        if let Err(e) = queue.dispatch(move || open.run()) {
            warn!(thread = queue.name(), error = %e, "Requesting thread exited before its child could open");
        }
    }

    fn failure(self: Box<Self>) {
        self.background.fail_target(&self.target);
    }
}

/// Child-open task for the requesting thread. Holds the counted same-process parent until it
/// runs; if the thread's loop goes away first, dropping the task destroys the parent.
struct InProcessOpen {
    background: Background,
    target: OpenTarget,
    child: Arc<Actor>,
    parent: Option<Arc<Actor>>,
    dispatcher: TaskQueue,
}

impl InProcessOpen {
    fn run(mut self) {
        if let Some(parent) = self.parent.take() {
            self.background.open_child_in_process(
                &self.target,
                self.child.clone(),
                parent,
                self.dispatcher.clone(),
            );
        }
    }
}

impl Drop for InProcessOpen {
    fn drop(&mut self) {
        if let Some(parent) = self.parent.take() {
            debug!(actor = %parent.id(), thread = self.target.queue.name(), "Child open never ran; destroying its parent");
            parent.destroy();
        }
    }
}

impl Background {
    /// Main thread. Starts construction for `target`'s slot.
    pub(crate) fn start_child_open(&self, target: OpenTarget) {
        self.assert_on_main_thread();
        if self.shared.main.with(|state| state.shutdown_started) {
            debug!(thread = target.queue.name(), "Child request arrived after shutdown started");
            self.fail_target(&target);
            return;
        }
        match self.shared.config.role {
            ProcessRole::Main => {
                let request = ChildOpenRequest {
                    background: self.clone(),
                    target: target.clone(),
                };
                if let Err(e) = self.create_actor_for_same_process(request) {
                    warn!(thread = target.queue.name(), error = %e, "Same-process parent allocation failed");
                    self.fail_target(&target);
                }
            }
            ProcessRole::Content => self.request_bridge(target),
        }
    }

    fn request_bridge(&self, target: OpenTarget) {
        let Some(bridge) = self.shared.bridge.clone() else {
            warn!("No bridge connector configured");
            self.fail_target(&target);
            return;
        };
        self.shared
            .main
            .with(|state| state.pending_targets.push_back(target.clone()));
        if let Err(e) = bridge.open_bridge() {
            warn!(thread = target.queue.name(), error = %e, "Bridge request failed");
            self.shared.main.with(|state| {
                state
                    .pending_targets
                    .retain(|pending| pending.generation != target.generation)
            });
            self.fail_target(&target);
            return;
        }
        debug!(thread = target.queue.name(), "Bridge requested");
    }

    /// Content process, main thread. Receives the child end of a bridge to the main process
    /// (`parent_pid`) and opens it on the oldest thread waiting for one.
    pub fn alloc_child<T: Transport>(
        &self,
        transport: T,
        parent_pid: ProcessId,
    ) -> Result<Arc<Actor>, BackgroundError> {
        self.assert_on_main_thread();
        let target = self
            .shared
            .main
            .with(|state| state.pending_targets.pop_front())
            .ok_or_else(|| BackgroundError::Bridge("no thread is waiting for a bridged child".into()))?;
        let Some(peer) = PeerProcess::open(&self.shared.processes, parent_pid) else {
            warn!(pid = parent_pid, "Main process handle unavailable");
            self.fail_target(&target);
            return Err(BackgroundError::PeerGone(parent_pid));
        };

        let child = Actor::new_child();
        let opening = child.clone();
        let transport: Box<dyn Transport> = Box::new(transport);
        let opener = self.clone();
        let opened_for = target.clone();
        target.queue.dispatch(move || {
            opener.open_child_over_transport(&opened_for, opening, transport, peer)
        })?;
        debug!(actor = %child.id(), thread = target.queue.name(), "Bridged child allocated");
        Ok(child)
    }

    /// Requesting thread.
    fn open_child_in_process(
        &self,
        target: &OpenTarget,
        child: Arc<Actor>,
        parent: Arc<Actor>,
        dispatcher: TaskQueue,
    ) {
        match child.open_child_direct(&parent, dispatcher) {
            Ok(()) => self.publish_child(target, child),
            Err(e) => {
                warn!(actor = %child.id(), error = %e, "Failed to open child in-process");
                child.abandon();
                parent.destroy();
                self.fail_slot(target);
            }
        }
    }

    /// Requesting thread.
    fn open_child_over_transport(
        &self,
        target: &OpenTarget,
        child: Arc<Actor>,
        transport: Box<dyn Transport>,
        peer: PeerProcess,
    ) {
        match child.open_child_with_transport(transport, peer) {
            Ok(()) => self.publish_child(target, child),
            Err(e) => {
                warn!(actor = %child.id(), error = %e, "Failed to open bridged child");
                child.abandon();
                self.fail_slot(target);
            }
        }
    }

    /// Shutdown, content role: fails threads still waiting on a bridge.
    pub(crate) fn fail_pending_targets(&self) {
        let pending = self
            .shared
            .main
            .with(|state| std::mem::take(&mut state.pending_targets));
        for target in pending {
            self.fail_target(&target);
        }
    }
}
