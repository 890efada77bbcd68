//! One-shot deadline timer that fires a callback on a chosen task queue.

use std::io;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::task_loop::TaskQueue;

/// Arms at most one deadline at a time. Firing posts the callback to the target queue, so the
/// callback always runs on the target's thread.
pub struct DeadlineTimer {
    runtime: Runtime,
    pending: Option<JoinHandle<()>>,
}

impl DeadlineTimer {
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ipc-deadline-timer")
            .enable_time()
            .build()?;
        Ok(Self {
            runtime,
            pending: None,
        })
    }

    /// Replaces any armed deadline with a new one.
    pub fn arm<F>(&mut self, delay: Duration, target: TaskQueue, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        debug!(?delay, queue = target.name(), "Deadline armed");
        self.pending = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = target.dispatch(callback) {
                warn!(error = %e, "Deadline fired after its target stopped");
            }
        }));
    }

    /// Returns true if an armed deadline was cancelled before firing.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for DeadlineTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineTimer")
            .field("armed", &self.is_armed())
            .finish()
    }
}
