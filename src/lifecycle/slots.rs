//! Per-thread child actor slots.
//!
//! Each consumer thread that asks for a child actor gets a slot in a registry keyed by its loop
//! id. A slot goes `InFlight -> Ready | Failed` exactly once. Callbacks registered while in
//! flight wait in FIFO order and fire together when construction settles; later callbacks are
//! served one task turn after they are registered.
//!
//! Slots are removed explicitly ([`Background::close_for_current_thread`]), by the loop's exit
//! hook when the thread stops, or by shutdown.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::child_open::OpenTarget;
use super::Background;
use crate::actor::{Actor, CreateCallback};
use crate::error::BackgroundError;
use crate::runtime::{current_loop_id, LoopId, TaskLoop, TaskQueue};

pub(crate) enum Construction {
    InFlight,
    Ready(Arc<Actor>),
    Failed,
}

pub(crate) struct ThreadSlot {
    /// Distinguishes this slot from one recreated after a close.
    generation: u64,
    queue: TaskQueue,
    construction: Construction,
    waiters: VecDeque<Box<dyn CreateCallback>>,
    payload: Option<Box<dyn Any + Send>>,
}

#[derive(Default)]
pub(crate) struct SlotRegistry {
    slots: Mutex<HashMap<LoopId, ThreadSlot>>,
    generations: AtomicU64,
}

enum Step {
    Start(OpenTarget),
    Wait,
    Serve,
}

impl SlotRegistry {
    /// Moves an in-flight slot to its final state and hands back its waiters. `None` when the
    /// slot was closed or replaced meanwhile.
    fn settle(
        &self,
        target: &OpenTarget,
        outcome: Construction,
    ) -> Option<VecDeque<Box<dyn CreateCallback>>> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&target.loop_id)?;
        let in_flight = matches!(slot.construction, Construction::InFlight);
        if slot.generation != target.generation || !in_flight {
            return None;
        }
        slot.construction = outcome;
        Some(std::mem::take(&mut slot.waiters))
    }
}

impl Background {
    /// The calling thread's child actor, if it has finished opening.
    pub fn get_for_current_thread(&self) -> Option<Arc<Actor>> {
        let id = current_loop_id()?;
        let slots = self.shared.slots.slots.lock();
        match &slots.get(&id)?.construction {
            Construction::Ready(actor) => Some(actor.clone()),
            _ => None,
        }
    }

    /// Requests the calling thread's child actor, creating it on first use.
    ///
    /// `callback` always runs later on this thread, never inside this call. Only the first
    /// request on a thread starts construction; requests made while it is in flight are queued
    /// behind it in FIFO order. Once a slot has failed, further requests fail until it is closed.
    ///
    /// Returns `Err` without queuing the callback when the thread has no task loop or shutdown
    /// has started.
    pub fn get_or_create_for_current_thread<C: CreateCallback>(
        &self,
        callback: C,
    ) -> Result<(), BackgroundError> {
        let queue = TaskQueue::current().ok_or(BackgroundError::NoTaskQueue)?;
        if self.is_shutdown_started() {
            return Err(BackgroundError::ShutdownStarted);
        }

        let callback: Box<dyn CreateCallback> = Box::new(callback);
        let step = {
            let mut slots = self.shared.slots.slots.lock();
            match slots.entry(queue.id()) {
                Entry::Vacant(vacant) => {
                    let generation = self.shared.slots.generations.fetch_add(1, Ordering::Relaxed);
                    vacant.insert(ThreadSlot {
                        generation,
                        queue: queue.clone(),
                        construction: Construction::InFlight,
                        waiters: VecDeque::from([callback]),
                        payload: None,
                    });
                    Step::Start(OpenTarget {
                        loop_id: queue.id(),
                        queue: queue.clone(),
                        generation,
                    })
                }
                Entry::Occupied(mut occupied) => {
                    let slot = occupied.get_mut();
                    slot.waiters.push_back(callback);
                    match slot.construction {
                        Construction::InFlight => Step::Wait,
                        Construction::Ready(_) | Construction::Failed => Step::Serve,
                    }
                }
            }
        };

        match step {
            Step::Wait => trace!(thread = queue.name(), "Child creation already in flight"),
            Step::Serve => {
                let background = self.clone();
                queue.dispatch(move || background.serve_settled_slot())?;
            }
            Step::Start(target) => {
                let background = self.clone();
                let loop_id = queue.id();
                TaskLoop::at_current_exit(move || background.close_slot(loop_id));
                debug!(thread = queue.name(), "Starting child actor creation");
                if self.is_main_thread() {
                    self.start_child_open(target);
                } else {
                    let background = self.clone();
                    let request = target.clone();
                    if self
                        .shared
                        .main_queue
                        .dispatch(move || background.start_child_open(request))
                        .is_err()
                    {
                        self.fail_target(&target);
                    }
                }
            }
        }
        Ok(())
    }

    /// Serves callbacks queued on a slot that has already settled. Runs on the slot's thread.
    fn serve_settled_slot(&self) {
        let Some(id) = current_loop_id() else {
            return;
        };
        let settled = {
            let mut slots = self.shared.slots.slots.lock();
            slots.get_mut(&id).and_then(|slot| match &slot.construction {
                Construction::InFlight => None,
                Construction::Ready(actor) => {
                    Some((std::mem::take(&mut slot.waiters), Some(actor.clone())))
                }
                Construction::Failed => Some((std::mem::take(&mut slot.waiters), None)),
            })
        };
        let Some((waiters, actor)) = settled else {
            return;
        };
        for callback in waiters {
            match &actor {
                Some(actor) => callback.actor_created(actor),
                None => callback.actor_failed(),
            }
        }
    }

    /// Slot thread. Publishes a freshly opened child and fires the queued callbacks in order.
    /// A child whose slot went away meanwhile is closed straight away.
    pub(crate) fn publish_child(&self, target: &OpenTarget, child: Arc<Actor>) {
        match self
            .shared
            .slots
            .settle(target, Construction::Ready(child.clone()))
        {
            Some(waiters) => {
                debug!(
                    actor = %child.id(),
                    thread = target.queue.name(),
                    waiters = waiters.len(),
                    "Child actor ready"
                );
                for callback in waiters {
                    callback.actor_created(&child);
                }
            }
            None => {
                debug!(actor = %child.id(), "Slot closed while its child was opening; closing child");
                child.close();
            }
        }
    }

    /// Slot thread. Fails every callback queued on the in-flight slot.
    pub(crate) fn fail_slot(&self, target: &OpenTarget) {
        let Some(waiters) = self.shared.slots.settle(target, Construction::Failed) else {
            return;
        };
        debug!(thread = target.queue.name(), waiters = waiters.len(), "Child actor creation failed");
        for callback in waiters {
            callback.actor_failed();
        }
    }

    /// Any thread. Posts [`Background::fail_slot`] to the target's thread.
    pub(crate) fn fail_target(&self, target: &OpenTarget) {
        let background = self.clone();
        let failed = target.clone();
        if target
            .queue
            .dispatch(move || background.fail_slot(&failed))
            .is_err()
        {
            debug!(thread = target.queue.name(), "Requesting thread exited before failure delivery");
        }
    }

    /// Closes and clears the calling thread's slot. Payloads are flushed before the child
    /// closes. Returns false if the thread had no slot.
    pub fn close_for_current_thread(&self) -> bool {
        let Some(id) = current_loop_id() else {
            return false;
        };
        let slot = self.shared.slots.slots.lock().remove(&id);
        match slot {
            Some(slot) => {
                self.retire_slot(slot);
                true
            }
            None => false,
        }
    }

    /// Slot thread. Used by the loop exit hook and by shutdown.
    pub(crate) fn close_slot(&self, id: LoopId) {
        let slot = self.shared.slots.slots.lock().remove(&id);
        if let Some(slot) = slot {
            self.retire_slot(slot);
        }
    }

    fn retire_slot(&self, slot: ThreadSlot) {
        let ThreadSlot {
            queue,
            construction,
            waiters,
            payload,
            ..
        } = slot;
        drop(payload);
        match construction {
            Construction::Ready(actor) => {
                actor.flush();
                actor.close();
                debug!(actor = %actor.id(), thread = queue.name(), "Thread slot closed");
                if !self.is_main_thread() {
                    // Final release belongs to the main thread.
                    if let Err(e) = self.shared.main_queue.dispatch(move || drop(actor)) {
                        warn!(thread = queue.name(), error = %e, "Main thread gone; child released on its own thread");
                    }
                }
            }
            Construction::InFlight => {
                debug!(thread = queue.name(), "Thread slot closed with creation in flight");
            }
            Construction::Failed => {}
        }
        for callback in waiters {
            callback.actor_failed();
        }
    }

    /// Shutdown: closes every slot on its own thread. The main thread's slot closes inline.
    pub(crate) fn close_all_slots(&self) {
        let slots: Vec<(LoopId, TaskQueue)> = self
            .shared
            .slots
            .slots
            .lock()
            .iter()
            .map(|(id, slot)| (*id, slot.queue.clone()))
            .collect();
        for (id, queue) in slots {
            if queue.is_current() {
                self.close_slot(id);
                continue;
            }
            let background = self.clone();
            if queue.dispatch(move || background.close_slot(id)).is_err() {
                trace!(thread = queue.name(), "Slot thread already stopped");
            }
        }
    }

    /// Runs `f` on the calling thread's payload, creating it with `T::default()` on first use.
    ///
    /// Returns `None` if the thread has no slot or its payload has a different type.
    pub fn with_thread_local_payload<T, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R>
    where
        T: Default + Send + 'static,
    {
        let id = current_loop_id()?;
        let mut payload: Box<dyn Any + Send> = {
            let mut slots = self.shared.slots.slots.lock();
            let slot = slots.get_mut(&id)?;
            match slot.payload.take() {
                Some(payload) if payload.is::<T>() => payload,
                Some(other) => {
                    slot.payload = Some(other);
                    return None;
                }
                None => Box::new(T::default()),
            }
        };
        let result = payload.downcast_mut::<T>().map(f);

        let mut slots = self.shared.slots.slots.lock();
        if let Some(slot) = slots.get_mut(&id) {
            slot.payload.get_or_insert(payload);
        }
        result
    }
}
