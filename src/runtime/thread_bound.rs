//! Runtime thread-confinement checks.
//!
//! State that logically belongs to one thread (main-thread bookkeeping, the dispatcher's live
//! actor set, an actor's channel end) is wrapped so every access asserts it happens on the
//! owning loop. Violations are programmer errors and panic.

use std::sync::OnceLock;

use parking_lot::{Mutex, MutexGuard};

use super::task_loop::{current_loop_id, LoopId};

/// Records which loop something belongs to and checks callers against it.
#[derive(Debug)]
pub struct BoundThread {
    owner: OnceLock<LoopId>,
    what: &'static str,
}

impl BoundThread {
    pub fn unbound(what: &'static str) -> Self {
        Self {
            owner: OnceLock::new(),
            what,
        }
    }

    pub fn bound_to(owner: LoopId, what: &'static str) -> Self {
        let bound = Self::unbound(what);
        let _ = bound.owner.set(owner);
        bound
    }

    /// Binds to the calling thread's loop.
    ///
    /// # Panics
    ///
    /// Panics if the caller has no loop or if already bound elsewhere.
    pub fn bind_current(&self) {
        let Some(here) = current_loop_id() else {
            panic!("{} bound from a thread without a task loop", self.what);
        };
        let owner = *self.owner.get_or_init(|| here);
        assert_eq!(owner, here, "{} is already bound to {}", self.what, owner);
    }

    pub fn owner(&self) -> Option<LoopId> {
        self.owner.get().copied()
    }

    pub fn is_current(&self) -> bool {
        matches!((self.owner(), current_loop_id()), (Some(owner), Some(here)) if owner == here)
    }

    /// # Panics
    ///
    /// Panics unless bound to the calling thread.
    #[track_caller]
    pub fn assert_current(&self) {
        match (self.owner(), current_loop_id()) {
            (Some(owner), Some(here)) if owner == here => {}
            (None, _) => panic!("{} used before being bound to a thread", self.what),
            (Some(owner), here) => panic!(
                "{} belongs to {} but was used from {:?}",
                self.what, owner, here
            ),
        }
    }
}

/// A value only its owning loop may touch.
///
/// Accesses are checked, and re-entrant access from a callback running inside [`ThreadBound::with`]
/// panics instead of deadlocking. Never call out to foreign code while holding the value.
#[derive(Debug)]
pub struct ThreadBound<T> {
    bound: BoundThread,
    value: Mutex<T>,
}

impl<T> ThreadBound<T> {
    pub fn new(owner: LoopId, what: &'static str, value: T) -> Self {
        Self {
            bound: BoundThread::bound_to(owner, what),
            value: Mutex::new(value),
        }
    }

    pub fn owner(&self) -> Option<LoopId> {
        self.bound.owner()
    }

    pub fn is_current(&self) -> bool {
        self.bound.is_current()
    }

    #[track_caller]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.bound.assert_current();
        let mut guard = self.lock_unshared();
        f(&mut guard)
    }

    #[track_caller]
    fn lock_unshared(&self) -> MutexGuard<'_, T> {
        match self.value.try_lock() {
            Some(guard) => guard,
            None => panic!("re-entrant access to {}", self.bound.what),
        }
    }

    /// Consumes the cell. Dropping happens wherever the last owner is, so no check here.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TaskLoop;

    #[test]
    fn owner_thread_can_mutate() {
        let task_loop = TaskLoop::new("owner");
        let cell = ThreadBound::new(task_loop.id(), "counter", 0u32);
        cell.with(|n| *n += 2);
        assert_eq!(cell.with(|n| *n), 2);
        assert!(cell.is_current());
    }

    #[test]
    fn other_thread_access_panics() {
        let task_loop = TaskLoop::new("owner");
        let cell = std::sync::Arc::new(ThreadBound::new(task_loop.id(), "counter", 0u32));
        let remote = cell.clone();
        let result = std::thread::spawn(move || {
            let _other = TaskLoop::new("intruder");
            remote.with(|n| *n += 1);
        })
        .join();
        assert!(result.is_err());
        assert_eq!(cell.with(|n| *n), 0);
    }

    #[test]
    #[should_panic(expected = "re-entrant access")]
    fn reentrant_access_panics() {
        let task_loop = TaskLoop::new("owner");
        let cell = ThreadBound::new(task_loop.id(), "state", ());
        cell.with(|_| cell.with(|_| ()));
    }

    #[test]
    fn late_binding_takes_first_caller() {
        let task_loop = TaskLoop::new("binder");
        let bound = BoundThread::unbound("actor");
        assert!(!bound.is_current());
        bound.bind_current();
        bound.bind_current();
        assert_eq!(bound.owner(), Some(task_loop.id()));
        bound.assert_current();
    }
}
