//! Threading substrate.
//!
//! - [`TaskLoop`] / [`TaskQueue`] - per-thread FIFO task loops and the handles used to post to them
//! - [`ThreadHandle`] - an owned OS thread running a task loop
//! - [`DeadlineTimer`] - one-shot timer delivering its callback to a task queue
//! - [`ThreadBound`] / [`BoundThread`] - runtime thread-confinement checks
//! - [`setup_tracing`] - logging initialization

pub mod task_loop;
pub mod thread;
pub mod thread_bound;
pub mod timer;
pub mod tracing;

pub use task_loop::{current_loop_id, DispatchError, LoopId, Task, TaskLoop, TaskQueue};
pub use thread::{OsThreadSpawner, ThreadHandle, ThreadSpawner};
pub use thread_bound::{BoundThread, ThreadBound};
pub use timer::DeadlineTimer;
pub use self::tracing::{setup_tracing, try_setup_tracing};
