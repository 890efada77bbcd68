//! Owned OS threads that run a [`TaskLoop`] until told to quit.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::task_loop::{DispatchError, LoopId, TaskLoop, TaskQueue};

/// Creates the OS threads backing a [`ThreadHandle`].
///
/// Exists so thread creation failure can be exercised in tests.
pub trait ThreadSpawner: Send + Sync + 'static {
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>;
}

/// Spawns named `std::thread`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsThreadSpawner;

impl ThreadSpawner for OsThreadSpawner {
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new().name(name.to_owned()).spawn(body)
    }
}

/// Owner's handle on a thread running a task loop.
///
/// The queue exists before the thread runs, so tasks may be posted right after
/// [`ThreadHandle::spawn`] returns; they run once the loop starts.
pub struct ThreadHandle {
    queue: TaskQueue,
    join: Option<JoinHandle<()>>,
}

impl ThreadHandle {
    pub fn spawn(spawner: &dyn ThreadSpawner, name: &str) -> io::Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = TaskQueue::from_parts(LoopId::next(), Arc::from(name), sender);
        let loop_queue = queue.clone();
        let join = spawner.spawn(
            name,
            Box::new(move || TaskLoop::install(loop_queue, receiver).run()),
        )?;
        debug!(thread = name, id = %queue.id(), "Thread spawned");
        Ok(Self {
            queue,
            join: Some(join),
        })
    }

    pub fn id(&self) -> LoopId {
        self.queue.id()
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    /// Queue for posting to the thread from outside.
    pub fn queue(&self) -> TaskQueue {
        self.queue.clone()
    }

    pub fn dispatch<F>(&self, task: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.dispatch(task)
    }

    /// True if `queue` is the queue of this thread's loop.
    pub fn owns(&self, queue: &TaskQueue) -> bool {
        self.queue.id() == queue.id()
    }

    /// Lets already-queued tasks finish, stops the loop and joins the thread.
    ///
    /// # Panics
    ///
    /// Panics when called from the thread itself.
    pub fn shutdown(mut self) {
        assert!(
            !self.queue.is_current(),
            "thread `{}` cannot join itself",
            self.queue.name()
        );
        if self.queue.quit().is_err() {
            debug!(thread = self.queue.name(), "Thread loop already stopped");
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!(thread = self.queue.name(), "Thread panicked before shutdown");
            }
        }
        debug!(thread = self.queue.name(), "Thread joined");
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        if self.join.take().is_some() {
            warn!(thread = self.queue.name(), "Thread handle dropped without shutdown; detaching");
            let _ = self.queue.quit();
        }
    }
}

impl std::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHandle").field("queue", &self.queue).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn queued_tasks_finish_before_join() {
        let handle = ThreadHandle::spawn(&OsThreadSpawner, "worker").unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        handle
            .dispatch(move || {
                assert_eq!(thread::current().name(), Some("worker"));
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();
        let queue = handle.queue();
        handle.shutdown();
        assert!(ran.load(Ordering::SeqCst));
        assert!(queue.dispatch(|| {}).is_err());
    }

    #[test]
    fn task_sees_its_own_queue_as_current() {
        let handle = ThreadHandle::spawn(&OsThreadSpawner, "introspect").unwrap();
        let expected = handle.id();
        let (tx, rx) = std::sync::mpsc::channel();
        handle
            .dispatch(move || {
                let _ = tx.send(TaskQueue::current().map(|q| q.id()));
            })
            .unwrap();
        assert_eq!(rx.recv().unwrap(), Some(expected));
        handle.shutdown();
    }
}
