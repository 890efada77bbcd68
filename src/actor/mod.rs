//! # Actors
//!
//! An [`Actor`] is one end of a [`MessageChannel`] bound to a single thread.
//!
//! - **Parent** actors live on the dispatcher thread. They are allocated on the main thread,
//!   counted in the live-actor count, and torn down on the main thread once their channel closes.
//! - **Child** actors live on a consumer thread and occupy that thread's slot.
//!
//! The role is a closed enum, and teardown picks the role-specific path with a `match`.
//!
//! ## Teardown
//!
//! When the channel closes, it calls [`ChannelListener::actor_destroy`] on the bound thread. That
//! call is idempotent. For a parent it unregisters from the live set and defers [`Actor::destroy`]
//! by one task turn, since the channel is still on the call stack. `destroy` then runs the
//! main-thread teardown:
//!
//! 1. the transport is released on the dispatcher queue,
//! 2. the peer process handle is closed,
//! 3. the live count drops, which may stop the dispatcher thread.

mod callback;
mod child;
mod parent;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::channel::{ChannelListener, DestroyReason, MessageChannel, Side};
use crate::error::ChannelError;
use crate::process::ContentProcess;
use crate::runtime::{BoundThread, LoopId};

pub use callback::{CreateCallback, SameProcessCallback};
pub(crate) use child::ChildState;
pub(crate) use parent::ParentState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(u64);

impl ActorId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ActorId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) enum Role {
    Parent(ParentState),
    Child(ChildState),
}

pub struct Actor {
    id: ActorId,
    channel: Arc<MessageChannel>,
    bound: BoundThread,
    destroyed: AtomicBool,
    role: Role,
}

impl Actor {
    fn with_role(role: Role) -> Arc<Self> {
        let (side, what) = match role {
            Role::Parent(_) => (Side::Parent, "parent actor"),
            Role::Child(_) => (Side::Child, "child actor"),
        };
        let actor = Arc::new(Self {
            id: ActorId::next(),
            channel: MessageChannel::new(side),
            bound: BoundThread::unbound(what),
            destroyed: AtomicBool::new(false),
            role,
        });
        trace!(actor = %actor.id, ?side, "Actor constructed");
        actor
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn side(&self) -> Side {
        self.channel.side()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// The loop this actor is bound to, once bound.
    pub fn bound_thread(&self) -> Option<LoopId> {
        self.bound.owner()
    }

    /// Sends a payload to the peer. Callable from any thread; queued until the channel opens.
    pub fn post(&self, payload: impl Into<Vec<u8>>) -> Result<(), ChannelError> {
        self.channel.post(payload.into())
    }

    /// Drains payloads received from the peer.
    pub fn take_received(&self) -> Vec<Vec<u8>> {
        self.bound.assert_current();
        self.channel.take_received()
    }

    /// Pushes out payloads buffered in the transport.
    pub fn flush(&self) {
        self.bound.assert_current();
        self.channel.flush();
    }

    /// Closes the channel. Teardown follows through [`ChannelListener::actor_destroy`].
    pub fn close(&self) {
        self.bound.assert_current();
        self.channel.close();
    }

    /// True when the peer lives in another process.
    pub fn is_other_process(&self) -> bool {
        self.bound.assert_current();
        match &self.role {
            Role::Parent(parent) => parent.is_other_process(),
            Role::Child(child) => child.is_other_process(),
        }
    }

    /// The content process a parent serves. `None` for children, same-process parents, and
    /// once teardown has begun.
    pub fn content(&self) -> Option<Arc<ContentProcess>> {
        self.bound.assert_current();
        if self.is_destroyed() {
            return None;
        }
        match &self.role {
            Role::Parent(parent) => parent.content(),
            Role::Child(_) => None,
        }
    }

    fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::AcqRel)
    }
}

impl ChannelListener for Actor {
    fn actor_destroy(self: Arc<Self>, reason: DestroyReason) {
        self.bound.assert_current();
        if !self.mark_destroyed() {
            trace!(actor = %self.id, ?reason, "Actor already destroyed");
            return;
        }
        match &self.role {
            Role::Parent(parent) => parent.on_destroyed(&self, reason),
            Role::Child(child) => child.on_destroyed(&self, reason),
        }
    }
}

impl Drop for Actor {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        match &self.role {
            Role::Parent(parent) => debug_assert!(
                parent.is_torn_down(),
                "parent actor {} dropped before main-thread teardown",
                self.id
            ),
            Role::Child(_) => debug_assert!(
                self.bound.owner().is_none() || self.is_destroyed(),
                "child actor {} dropped while still live",
                self.id
            ),
        }
    }
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor")
            .field("id", &self.id)
            .field("side", &self.side())
            .field("bound", &self.bound.owner())
            .field("destroyed", &self.is_destroyed())
            .field("channel", &self.channel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LoopbackTransport;
    use crate::mock::MockProcessTable;
    use crate::process::{PeerProcess, ProcessTable};
    use crate::runtime::TaskLoop;

    fn opened_child(task_loop: &TaskLoop) -> (Arc<Actor>, LoopbackTransport) {
        let table: Arc<dyn ProcessTable> = MockProcessTable::with_live([17]);
        let peer = PeerProcess::open(&table, 17).unwrap();
        let (ours, theirs) = LoopbackTransport::pair();
        let child = Actor::new_child();
        child
            .open_child_with_transport(Box::new(ours), peer)
            .unwrap();
        assert_eq!(child.bound_thread(), Some(task_loop.id()));
        (child, theirs)
    }

    #[test]
    fn destroy_notification_is_handled_once() {
        let task_loop = TaskLoop::new("actor-test");
        let (child, _far_end) = opened_child(&task_loop);
        assert!(child.is_other_process());

        child.close();
        assert!(child.is_destroyed());
        assert!(!child.is_open());
        assert!(!child.is_other_process(), "process handle released on destroy");

        // A late peer notification must not run teardown again.
        child.clone().actor_destroy(DestroyReason::PeerClose);
        assert!(child.is_destroyed());
        task_loop.run_pending();
    }

    #[test]
    fn far_end_hangup_destroys_the_child() {
        let task_loop = TaskLoop::new("actor-hangup");
        let (child, far_end) = opened_child(&task_loop);
        drop(far_end);
        assert!(task_loop.spin_until_timeout(std::time::Duration::from_secs(5), || child
            .is_destroyed()));
        assert!(child.channel.is_closed());
    }

    #[test]
    #[should_panic(expected = "is not a parent")]
    fn children_cannot_be_destroyed_as_parents() {
        let child = Actor::new_child();
        child.abandon();
        child.destroy();
    }
}
