use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Actor, Role};
use crate::channel::{DestroyReason, Transport};
use crate::error::ChannelError;
use crate::process::PeerProcess;
use crate::runtime::TaskQueue;

pub(crate) struct ChildState {
    /// Transport and the io queue it must be released on.
    transport: Mutex<Option<(Box<dyn Transport>, TaskQueue)>>,
    process: Mutex<Option<PeerProcess>>,
}

impl ChildState {
    pub(crate) fn is_other_process(&self) -> bool {
        self.process.lock().is_some()
    }

    pub(crate) fn on_destroyed(&self, actor: &Arc<Actor>, reason: DestroyReason) {
        debug!(actor = %actor.id, ?reason, "Child actor destroyed");
        self.release();
    }

    fn release(&self) {
        if let Some((transport, io_queue)) = self.transport.lock().take() {
            if let Err(e) = io_queue.dispatch(move || drop(transport)) {
                warn!(error = %e, "Io queue gone; transport released in place");
            }
        }
        let process = self.process.lock().take();
        drop(process);
    }
}

impl Actor {
    pub(crate) fn new_child() -> Arc<Self> {
        Actor::with_role(Role::Child(ChildState {
            transport: Mutex::new(None),
            process: Mutex::new(None),
        }))
    }

    fn child_state(&self) -> &ChildState {
        match &self.role {
            Role::Child(child) => child,
            Role::Parent(_) => panic!("actor {} is not a child", self.id),
        }
    }

    /// Binds to the calling thread and opens over `transport` to a parent in another process.
    pub(crate) fn open_child_with_transport(
        self: &Arc<Self>,
        transport: Box<dyn Transport>,
        peer: PeerProcess,
    ) -> Result<(), ChannelError> {
        let child = self.child_state();
        self.bound.bind_current();
        let io_queue = TaskQueue::current().ok_or(ChannelError::NoTaskQueue)?;
        let pid = peer.pid();
        *child.process.lock() = Some(peer);

        let mut slot = child.transport.lock();
        let (transport, _) = slot.insert((transport, io_queue.clone()));
        self.channel
            .open(transport.as_mut(), pid, &io_queue, self.clone())
    }

    /// Binds to the calling thread and opens directly against `parent`, whose channel is served
    /// by `dispatcher`.
    pub(crate) fn open_child_direct(
        self: &Arc<Self>,
        parent: &Arc<Actor>,
        dispatcher: TaskQueue,
    ) -> Result<(), ChannelError> {
        self.child_state();
        self.bound.bind_current();
        self.channel.open_direct(
            self.clone(),
            &parent.channel,
            dispatcher.clone(),
            parent.clone(),
        )?;
        let attaching = parent.clone();
        if let Err(e) = dispatcher.dispatch(move || attaching.attach()) {
            warn!(actor = %parent.id, error = %e, "Dispatcher gone before parent could attach");
        }
        Ok(())
    }

    /// Retires a child whose open failed.
    pub(crate) fn abandon(&self) {
        let child = self.child_state();
        self.destroyed.store(true, Ordering::Release);
        child.release();
    }
}
