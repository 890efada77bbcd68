//! # Background IPC demo
//!
//! Starts the background context on the main thread, then:
//! 1. has two worker threads each obtain their child actor and send a greeting,
//! 2. allocates a cross-process parent over a loopback transport and hangs up its far end,
//! 3. shuts everything down.
//!
//! Run with `RUST_LOG=debug` to follow the lifecycle.

use std::sync::Arc;
use std::time::Duration;

use background_ipc::runtime::{setup_tracing, OsThreadSpawner};
use background_ipc::{
    Actor, Background, BackgroundConfig, BackgroundError, ContentProcess, LoopbackTransport,
    TaskLoop, ThreadHandle,
};
use tracing::{error, info, warn};

fn main() -> Result<(), BackgroundError> {
    setup_tracing();

    let main_loop = TaskLoop::new("main");
    let config = BackgroundConfig::default().with_env_overrides()?;
    let background = Background::startup(config)?;
    info!(?background, "Starting background demo");

    // 1. Worker threads with in-process children
    let mut workers = Vec::new();
    for name in ["worker-1", "worker-2"] {
        let worker =
            ThreadHandle::spawn(&OsThreadSpawner, name).map_err(BackgroundError::ThreadSpawn)?;
        let requester = background.clone();
        worker.dispatch(move || {
            let requested = requester.get_or_create_for_current_thread(
                |result: Result<Arc<Actor>, BackgroundError>| match result {
                    Ok(actor) => {
                        info!(actor = %actor.id(), "Child actor ready");
                        if let Err(e) = actor.post(b"hello from a worker".to_vec()) {
                            warn!(error = %e, "Greeting not sent");
                        }
                    }
                    Err(e) => error!(error = %e, "Child actor creation failed"),
                },
            );
            if let Err(e) = requested {
                error!(error = %e, "Child actor request rejected");
            }
        })?;
        workers.push(worker);
    }

    // 2. A cross-process parent; our own pid stands in for the content process
    let (parent_end, content_end) = LoopbackTransport::pair();
    let pid = std::process::id();
    let parent = background.alloc_cross_process(
        ContentProcess::new(pid, "loopback content"),
        parent_end,
        pid,
    )?;
    parent.post(b"hello from the main process".to_vec())?;
    main_loop.spin_until_timeout(Duration::from_millis(200), || false);
    info!(live_actors = background.live_actor_count(), "Actors running");

    drop(content_end);
    main_loop.spin_until_timeout(Duration::from_secs(1), || parent.is_destroyed());

    // 3. Shutdown
    background.shutdown();
    for worker in workers {
        worker.shutdown();
    }
    info!(
        forced_close_rounds = background.forced_close_rounds(),
        "System shutdown complete"
    );
    Ok(())
}
