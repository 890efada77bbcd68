use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use background_ipc::mock::{CallbackProbe, FlakySpawner, MockProcessTable, StubbornTransport};
use background_ipc::runtime::{try_setup_tracing, OsThreadSpawner};
use background_ipc::{
    Actor, Background, BackgroundConfig, BackgroundError, ContentProcess, LoopbackTransport,
    TaskLoop, TaskQueue, ThreadHandle,
};

const TIMEOUT: Duration = Duration::from_secs(10);
const CONTENT_PID: u32 = 4242;

struct Harness {
    background: Background,
    processes: Arc<MockProcessTable>,
    spawner: Arc<FlakySpawner>,
}

fn start(grace: Duration) -> Harness {
    try_setup_tracing();
    let processes = MockProcessTable::with_live([CONTENT_PID]);
    let spawner = FlakySpawner::failing(0);
    let background = Background::builder(
        BackgroundConfig::default()
            .with_shutdown_grace(grace)
            .with_thread_name("shutdown-dispatcher"),
    )
    .process_table(processes.clone())
    .thread_spawner(spawner.clone())
    .startup()
    .expect("background should start");
    Harness {
        background,
        processes,
        spawner,
    }
}

#[test]
fn unresponsive_peer_is_force_closed_after_grace_period() {
    let main_loop = TaskLoop::new("main");
    let Harness {
        background,
        processes,
        ..
    } = start(Duration::from_millis(50));
    let transport = StubbornTransport::default();
    let (closable_end, _content_end) = LoopbackTransport::pair();

    let stubborn = background
        .alloc_cross_process(
            ContentProcess::new(CONTENT_PID, "stubborn"),
            transport.clone(),
            CONTENT_PID,
        )
        .unwrap();
    let closable = background
        .alloc_cross_process(
            ContentProcess::new(CONTENT_PID, "closable"),
            closable_end,
            CONTENT_PID,
        )
        .unwrap();
    stubborn.post(b"queued before open".to_vec()).unwrap();
    assert!(main_loop.spin_until_timeout(TIMEOUT, || transport.sent().len() == 1));
    assert_eq!(transport.sent()[0], b"queued before open");
    assert!(main_loop.spin_until_timeout(TIMEOUT, || closable.is_open()));
    assert_eq!(background.live_actor_count(), 2);
    assert_eq!(processes.open_handles(), 2);

    background.shutdown();

    assert_eq!(background.forced_close_rounds(), 1);
    assert_eq!(background.live_actor_count(), 0);
    assert!(stubborn.is_destroyed());
    assert!(closable.is_destroyed());
    assert_eq!(transport.hang_ups(), 1);
    assert_eq!(processes.open_handles(), 0);
    assert!(!background.has_dispatcher_thread());
}

#[test]
fn destroying_a_parent_twice_is_harmless() {
    let main_loop = TaskLoop::new("main");
    let Harness { background, .. } = start(Duration::from_millis(20));
    let transport = StubbornTransport::default();

    let parent = background
        .alloc_cross_process(
            ContentProcess::new(CONTENT_PID, "twice"),
            transport.clone(),
            CONTENT_PID,
        )
        .unwrap();
    assert!(main_loop.spin_until_timeout(TIMEOUT, || transport.is_connected()));
    background.shutdown();
    assert_eq!(background.live_actor_count(), 0);

    parent.destroy();
    parent.destroy();
    main_loop.run_pending();
    assert_eq!(background.live_actor_count(), 0);
    assert_eq!(background.forced_close_rounds(), 1);
}

#[test]
fn peer_hangup_closes_the_parent_and_stops_the_dispatcher() {
    let main_loop = TaskLoop::new("main");
    let Harness {
        background,
        processes,
        spawner,
    } = start(Duration::from_secs(5));
    let (parent_end, content_end) = LoopbackTransport::pair();

    let parent = background
        .alloc_cross_process(
            ContentProcess::new(CONTENT_PID, "loopback"),
            parent_end,
            CONTENT_PID,
        )
        .unwrap();
    assert!(background.has_dispatcher_thread());
    assert_eq!(background.live_actor_count(), 1);

    drop(content_end);
    assert!(main_loop.spin_until_timeout(TIMEOUT, || {
        background.live_actor_count() == 0 && !background.has_dispatcher_thread()
    }));
    assert!(parent.is_destroyed());
    assert_eq!(processes.open_handles(), 0);
    assert_eq!(spawner.spawned(), 1);

    background.shutdown();
    assert_eq!(background.forced_close_rounds(), 0);
}

#[test]
fn shutdown_waits_for_children_to_close_voluntarily() {
    let main_loop = TaskLoop::new("main");
    let Harness { background, .. } = start(Duration::from_secs(30));
    let probe = CallbackProbe::default();

    let worker = ThreadHandle::spawn(&OsThreadSpawner, "voluntary").unwrap();
    let requester = background.clone();
    let callback = probe.callback("worker");
    worker
        .dispatch(move || requester.get_or_create_for_current_thread(callback).unwrap())
        .unwrap();
    background
        .get_or_create_for_current_thread(probe.callback("main"))
        .unwrap();
    assert!(main_loop.spin_until_timeout(TIMEOUT, || probe.len() == 2));
    assert_eq!(background.live_actor_count(), 2);

    background.shutdown();
    assert_eq!(background.live_actor_count(), 0);
    assert_eq!(background.forced_close_rounds(), 0, "no forced close with a long grace period");
    worker.shutdown();
}

#[test]
fn request_in_flight_at_shutdown_fails_on_its_thread() {
    let main_loop = TaskLoop::new("main");
    let Harness {
        background,
        spawner,
        ..
    } = start(Duration::from_secs(5));
    let probe = CallbackProbe::default();

    let worker = ThreadHandle::spawn(&OsThreadSpawner, "late").unwrap();
    let requester = background.clone();
    let callback = probe.callback("late");
    let (requested, wait_requested) = mpsc::channel();
    worker
        .dispatch(move || {
            requester.get_or_create_for_current_thread(callback).unwrap();
            let _ = requested.send(());
        })
        .unwrap();
    wait_requested.recv_timeout(TIMEOUT).unwrap();

    // The request is still queued on the main loop; shut down before serving it.
    background.shutdown();
    assert!(probe.wait_for(1, TIMEOUT));
    let outcomes = probe.outcomes();
    assert!(!outcomes[0].is_created());

    main_loop.run_pending();
    assert_eq!(probe.len(), 1, "each callback fires exactly once");
    assert_eq!(spawner.attempts(), 0);
    worker.shutdown();
}

#[test]
fn shutdown_before_the_dispatcher_is_ready_fails_same_process_requests() {
    let _main_loop = TaskLoop::new("main");
    let Harness {
        background,
        spawner,
        ..
    } = start(Duration::from_secs(5));
    let handed: Arc<Mutex<Option<bool>>> = Arc::default();

    let slot = handed.clone();
    let callback = move |result: Result<(Arc<Actor>, TaskQueue), BackgroundError>| {
        *slot.lock() = Some(result.is_ok());
    };
    background.create_actor_for_same_process(callback).unwrap();
    assert!(background.has_dispatcher_thread());
    assert_eq!(background.live_actor_count(), 1);

    // No spin: the dispatcher has not reported its queue yet.
    background.shutdown();
    assert_eq!(*handed.lock(), Some(false));
    assert_eq!(background.live_actor_count(), 0);
    assert!(!background.has_dispatcher_thread());
    assert_eq!(background.forced_close_rounds(), 0);
    assert_eq!(spawner.spawned(), 1);
}

#[test]
fn nothing_is_spawned_after_shutdown() {
    let _main_loop = TaskLoop::new("main");
    let Harness {
        background,
        spawner,
        ..
    } = start(Duration::from_secs(5));

    background.shutdown();
    background.shutdown();
    assert!(background.is_shutdown_started());

    assert!(matches!(
        background.ensure_dispatcher_thread(),
        Err(BackgroundError::ShutdownStarted)
    ));
    assert!(matches!(
        background.get_or_create_for_current_thread(
            |_: Result<Arc<Actor>, BackgroundError>| {}
        ),
        Err(BackgroundError::ShutdownStarted)
    ));
    assert!(matches!(
        background.create_actor_for_same_process(
            |_: Result<(Arc<Actor>, TaskQueue), BackgroundError>| {}
        ),
        Err(BackgroundError::ShutdownStarted)
    ));
    let (parent_end, _content_end) = LoopbackTransport::pair();
    assert!(matches!(
        background.alloc_cross_process(
            ContentProcess::new(CONTENT_PID, "too late"),
            parent_end,
            CONTENT_PID
        ),
        Err(BackgroundError::ShutdownStarted)
    ));
    assert_eq!(spawner.attempts(), 0);
    assert!(!background.has_dispatcher_thread());
}

#[test]
fn dispatcher_identity_is_published_and_cleared() {
    let main_loop = TaskLoop::new("main");
    let Harness { background, .. } = start(Duration::from_secs(5));

    assert!(!background.is_on_dispatcher_thread());
    background.ensure_dispatcher_thread().unwrap();
    background.ensure_dispatcher_thread().unwrap();
    assert!(main_loop.spin_until_timeout(TIMEOUT, || background.dispatcher_queue().is_some()));

    let queue = background.dispatcher_queue().unwrap();
    assert_eq!(queue.name(), "shutdown-dispatcher");
    let observer = background.clone();
    let (tx, rx) = mpsc::channel();
    queue
        .dispatch(move || {
            let _ = tx.send(observer.is_on_dispatcher_thread());
        })
        .unwrap();
    assert!(rx.recv_timeout(TIMEOUT).unwrap());
    assert!(!background.is_on_dispatcher_thread());

    background.shutdown();
    assert!(!background.has_dispatcher_thread());
    assert!(queue.dispatch(|| {}).is_err(), "dispatcher loop has stopped");
}

#[test]
fn same_process_parent_is_handed_over_unopened() {
    let main_loop = TaskLoop::new("main");
    let Harness { background, .. } = start(Duration::from_secs(5));
    let handed: Arc<Mutex<Option<(Arc<Actor>, TaskQueue)>>> = Arc::default();

    let slot = handed.clone();
    let callback = move |result: Result<(Arc<Actor>, TaskQueue), BackgroundError>| {
        *slot.lock() = result.ok();
    };
    background.create_actor_for_same_process(callback).unwrap();
    assert!(handed.lock().is_none());
    assert!(main_loop.spin_until_timeout(TIMEOUT, || handed.lock().is_some()));
    assert_eq!(background.live_actor_count(), 1);

    let (parent, dispatcher) = handed.lock().take().unwrap();
    assert_eq!(Some(dispatcher.id()), background.dispatcher_queue().map(|q| q.id()));
    assert!(!parent.is_open());

    parent.destroy();
    assert!(main_loop.spin_until_timeout(TIMEOUT, || {
        background.live_actor_count() == 0 && !background.has_dispatcher_thread()
    }));
    assert!(parent.is_destroyed());

    background.shutdown();
    assert_eq!(background.forced_close_rounds(), 0);
}
