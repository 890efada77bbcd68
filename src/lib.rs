//! # Background IPC
//!
//! > **A lazily started dispatcher thread for parent/child IPC actors.**
//!
//! Threads in a process often need a private line to a parent-side service. This crate provides
//! one without each thread paying for its own setup: a single process-wide **dispatcher thread**
//! hosts every parent actor, and each consumer thread owns at most one **child actor**, created
//! on first use and torn down when the thread stops.
//!
//! ## 🏗️ Design Philosophy
//!
//! ### Thread Confinement over Locks
//! Every actor is bound to exactly one thread. Main-thread bookkeeping lives behind a
//! [`ThreadBound`](runtime::ThreadBound) cell that panics when touched from anywhere else, so
//! misuse shows up as an immediate failure instead of a data race.
//!
//! ### Asynchronous by Default
//! Child creation never completes inline. Callbacks always run on the requesting thread on a
//! later task turn, and concurrent requests from one thread are served in order.
//!
//! ### Bounded Shutdown
//! Shutdown waits for actors to close on their own, but only for a grace period. After that,
//! the remaining parent actors are closed from the dispatcher thread.
//!
//! ## 🚀 Core Concepts
//!
//! ### Task Loops
//! Each participating thread runs a [`TaskLoop`]: a FIFO of closures posted through a
//! [`TaskQueue`]. The dispatcher thread is a [`ThreadHandle`] running such a loop.
//!
//! ### Parents and Children
//! A parent actor lives on the dispatcher thread. For another process it talks over a
//! [`Transport`](channel::Transport). In the same process it is linked directly to a child on a
//! consumer thread. Both ends are [`Actor`]s; the role decides how they are torn down.
//!
//! ### Testing
//! The [`mock`] module provides test doubles for processes, thread spawning, transports and
//! callbacks.
//!
//! ## 🗺️ Module Tour
//!
//! ### 1. The Substrate ([`runtime`])
//! Task loops, owned threads, the deadline timer and thread-confinement checks.
//!
//! ### 2. The Wire ([`channel`])
//! Message channels and the transports beneath them.
//!
//! ### 3. The Actors ([`actor`])
//! Parent and child actors and their teardown.
//!
//! ### 4. The Orchestrator ([`lifecycle`])
//! The [`Background`] context: dispatcher registry, per-thread slots, the child-open protocol
//! and the shutdown coordinator.
//!
//! ### 5. Support ([`config`], [`error`], [`process`])
//! Configuration loading, error types and peer process handles.
//!
//! ## 🚀 Quick Start
//!
//! ### Running the Demo
//!
//! ```bash
//! RUST_LOG=debug cargo run
//! ```
//!
//! ### Running Tests
//!
//! ```bash
//! cargo test
//! ```

pub mod actor;
pub mod channel;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod mock;
pub mod process;
pub mod runtime;

pub use actor::{Actor, ActorId, CreateCallback, SameProcessCallback};
pub use channel::{ChannelListener, DestroyReason, LoopbackTransport, MessageChannel, Side};
pub use config::{BackgroundConfig, ProcessRole};
pub use error::{BackgroundError, ChannelError, ConfigError};
pub use lifecycle::{Background, BackgroundBuilder, BridgeConnector};
pub use process::{ContentProcess, ProcessId};
pub use runtime::{LoopId, TaskLoop, TaskQueue, ThreadHandle};
