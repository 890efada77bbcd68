//! # Observability
//!
//! Logging goes through `tracing` with structured fields. Lifecycle milestones are `info`,
//! per-actor traffic is `debug`, and recoverable anomalies (a grace period expiring, a task
//! posted to a stopped loop) are `warn`.
//!
//! ## What Gets Traced
//!
//! - **Dispatcher thread**: spawn, readiness, teardown and join
//! - **Actors**: allocation, open failures, destruction with the reason
//! - **Shutdown**: start, forced close rounds, completion
//!
//! ## Example Output
//!
//! With `RUST_LOG=debug`:
//!
//! ```text
//! INFO  Dispatcher thread spawned thread="IPC Background"
//! DEBUG Parent actor connected actor=3 pid=4242
//! INFO  Background shutdown started live_actors=1
//! WARN  Grace period expired; forcing live actors closed live_actors=1
//! INFO  Background shutdown complete
//! ```

/// Initializes the tracing/logging infrastructure for the application.
///
/// Filtering is controlled through `RUST_LOG`:
/// - `RUST_LOG=info` - lifecycle milestones (dispatcher spawned, shutdown started/complete)
/// - `RUST_LOG=debug` - per-actor allocation and teardown
/// - `RUST_LOG=background_ipc=trace` - task loop installation and teardown
///
/// # Panics
///
/// Panics if a global subscriber is already installed. Use [`try_setup_tracing`] from tests.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_names(true)
        .with_target(false)
        .compact()
        .init();
}

/// Like [`setup_tracing`], but quietly does nothing when a subscriber is already installed.
pub fn try_setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_names(true)
        .with_test_writer()
        .try_init();
}
