use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use background_ipc::mock::{CallbackProbe, FlakySpawner, Outcome};
use background_ipc::runtime::{try_setup_tracing, OsThreadSpawner};
use background_ipc::{
    Actor, Background, BackgroundConfig, BackgroundError, TaskLoop, ThreadHandle,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn config() -> BackgroundConfig {
    BackgroundConfig::default()
        .with_shutdown_grace(Duration::from_secs(5))
        .with_thread_name("test-dispatcher")
}

fn start(spawner: &Arc<FlakySpawner>) -> Background {
    try_setup_tracing();
    Background::builder(config())
        .thread_spawner(spawner.clone())
        .startup()
        .expect("background should start")
}

/// Created actor ids in callback order.
fn created_ids(probe: &CallbackProbe) -> Vec<background_ipc::ActorId> {
    probe
        .outcomes()
        .into_iter()
        .filter_map(|outcome| match outcome {
            Outcome::Created { actor, .. } => Some(actor),
            Outcome::Failed { .. } => None,
        })
        .collect()
}

#[test]
fn callbacks_never_run_inline_and_fire_in_request_order() {
    let main_loop = TaskLoop::new("main");
    let spawner = FlakySpawner::failing(0);
    let background = start(&spawner);
    let probe = CallbackProbe::default();

    for label in ["c1", "c2", "c3"] {
        background
            .get_or_create_for_current_thread(probe.callback(label))
            .unwrap();
    }
    assert!(probe.is_empty(), "no callback may run inside the request");
    assert!(background.get_for_current_thread().is_none());

    assert!(main_loop.spin_until_timeout(TIMEOUT, || probe.len() == 3));
    assert_eq!(probe.labels(), ["c1", "c2", "c3"]);
    let ids = created_ids(&probe);
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| *id == ids[0]));

    let actor = background.get_for_current_thread().expect("slot should be ready");
    assert_eq!(actor.id(), ids[0]);
    assert_eq!(actor.bound_thread(), Some(main_loop.id()));
    assert!(!actor.is_other_process());
    assert!(actor.content().is_none());
    assert_eq!(spawner.spawned(), 1);
    assert_eq!(background.live_actor_count(), 1);

    background.shutdown();
    assert_eq!(background.live_actor_count(), 0);
    assert_eq!(background.forced_close_rounds(), 0);
    assert!(!background.has_dispatcher_thread());
    assert!(actor.is_destroyed());
}

#[test]
fn late_request_is_served_on_a_later_turn_with_the_same_actor() {
    let main_loop = TaskLoop::new("main");
    let spawner = FlakySpawner::failing(0);
    let background = start(&spawner);
    let probe = CallbackProbe::default();

    background
        .get_or_create_for_current_thread(probe.callback("first"))
        .unwrap();
    assert!(main_loop.spin_until_timeout(TIMEOUT, || probe.len() == 1));

    background
        .get_or_create_for_current_thread(probe.callback("second"))
        .unwrap();
    assert_eq!(probe.len(), 1, "ready slots still answer asynchronously");
    assert!(main_loop.spin_until_timeout(TIMEOUT, || probe.len() == 2));

    let ids = created_ids(&probe);
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0], ids[1]);
    assert_eq!(spawner.attempts(), 1);

    background.shutdown();
    assert_eq!(background.live_actor_count(), 0);
}

#[test]
fn worker_threads_get_their_own_children_from_one_dispatcher() {
    let main_loop = TaskLoop::new("main");
    let spawner = FlakySpawner::failing(0);
    let background = start(&spawner);
    let probe = CallbackProbe::default();

    let workers: Vec<ThreadHandle> = ["worker-a", "worker-b", "worker-c"]
        .into_iter()
        .map(|name| ThreadHandle::spawn(&OsThreadSpawner, name).unwrap())
        .collect();
    for worker in &workers {
        let requester = background.clone();
        let callback = probe.callback(worker.name());
        worker
            .dispatch(move || {
                requester.get_or_create_for_current_thread(callback).unwrap();
            })
            .unwrap();
    }

    assert!(main_loop.spin_until_timeout(TIMEOUT, || probe.len() == workers.len()));
    assert_eq!(spawner.attempts(), 1, "only one dispatcher thread may be spawned");

    let mut ids = Vec::new();
    for outcome in probe.outcomes() {
        let Outcome::Created { label, actor, ran_on } = outcome else {
            panic!("unexpected failure: {outcome:?}");
        };
        let worker = workers.iter().find(|w| w.name() == label).unwrap();
        assert_eq!(ran_on, Some(worker.id()), "callback must run on the requesting thread");
        ids.push(actor);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), workers.len(), "each thread gets its own child");
    assert_eq!(background.live_actor_count(), 3);
    assert!(background.get_for_current_thread().is_none());

    background.shutdown();
    assert_eq!(background.live_actor_count(), 0);
    assert_eq!(background.forced_close_rounds(), 0);
    for worker in workers {
        worker.shutdown();
    }
}

#[test]
fn closing_a_slot_lets_the_next_request_build_a_new_child() {
    let main_loop = TaskLoop::new("main");
    let spawner = FlakySpawner::failing(0);
    let background = start(&spawner);
    let probe = CallbackProbe::default();

    assert!(!background.close_for_current_thread(), "no slot yet");

    background
        .get_or_create_for_current_thread(probe.callback("before"))
        .unwrap();
    assert!(main_loop.spin_until_timeout(TIMEOUT, || probe.len() == 1));
    let first = background.get_for_current_thread().unwrap();

    assert!(background.close_for_current_thread());
    assert!(first.is_destroyed());
    assert!(background.get_for_current_thread().is_none());

    // Last live actor gone: the dispatcher thread stops until needed again.
    assert!(main_loop.spin_until_timeout(TIMEOUT, || {
        background.live_actor_count() == 0 && !background.has_dispatcher_thread()
    }));

    background
        .get_or_create_for_current_thread(probe.callback("after"))
        .unwrap();
    assert!(main_loop.spin_until_timeout(TIMEOUT, || probe.len() == 2));
    let second = background.get_for_current_thread().unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(spawner.spawned(), 2);

    background.shutdown();
    assert_eq!(background.live_actor_count(), 0);
}

#[test]
fn worker_exiting_before_its_child_opens_releases_the_parent() {
    let main_loop = TaskLoop::new("main");
    let spawner = FlakySpawner::failing(0);
    let background = start(&spawner);
    let probe = CallbackProbe::default();

    let requester = background.clone();
    let callback = probe.callback("idle");
    let (requested, wait_requested) = mpsc::channel();
    let (exit, wait_exit) = mpsc::channel::<()>();
    let worker = std::thread::spawn(move || {
        let idle_loop = TaskLoop::new("idle-worker");
        requester.get_or_create_for_current_thread(callback).unwrap();
        let _ = requested.send(());
        // The loop is never served; its queued tasks are dropped with it.
        let _ = wait_exit.recv_timeout(TIMEOUT);
        drop(idle_loop);
    });
    wait_requested.recv_timeout(TIMEOUT).unwrap();
    assert!(main_loop.spin_until_timeout(TIMEOUT, || background.dispatcher_queue().is_some()));
    main_loop.spin_until_timeout(Duration::from_millis(200), || false);
    assert_eq!(background.live_actor_count(), 1);

    exit.send(()).unwrap();
    assert!(worker.join().is_ok(), "worker thread must exit cleanly");
    assert!(probe.wait_for(1, TIMEOUT));
    assert!(!probe.outcomes()[0].is_created());

    assert!(main_loop.spin_until_timeout(TIMEOUT, || {
        background.live_actor_count() == 0 && !background.has_dispatcher_thread()
    }));
    background.shutdown();
    assert_eq!(background.forced_close_rounds(), 0);
}

#[test]
fn spawn_failure_fails_the_slot_until_it_is_closed() {
    let main_loop = TaskLoop::new("main");
    let spawner = FlakySpawner::failing(1);
    let background = start(&spawner);
    let probe = CallbackProbe::default();

    background
        .get_or_create_for_current_thread(probe.callback("doomed"))
        .unwrap();
    assert!(probe.is_empty(), "failures are delivered asynchronously too");
    assert!(main_loop.spin_until_timeout(TIMEOUT, || probe.len() == 1));
    assert!(!probe.outcomes()[0].is_created());
    assert!(!background.has_dispatcher_thread());

    background
        .get_or_create_for_current_thread(probe.callback("still failed"))
        .unwrap();
    assert!(main_loop.spin_until_timeout(TIMEOUT, || probe.len() == 2));
    assert!(!probe.outcomes()[1].is_created());
    assert_eq!(spawner.attempts(), 1, "a failed slot does not retry by itself");

    assert!(background.close_for_current_thread());
    background
        .get_or_create_for_current_thread(probe.callback("retry"))
        .unwrap();
    assert!(main_loop.spin_until_timeout(TIMEOUT, || probe.len() == 3));
    assert!(probe.outcomes()[2].is_created());
    assert_eq!(spawner.attempts(), 2);
    assert_eq!(spawner.spawned(), 1);

    background.shutdown();
    assert_eq!(background.live_actor_count(), 0);
}

#[test]
fn requests_need_a_task_loop() {
    let _main_loop = TaskLoop::new("main");
    let spawner = FlakySpawner::failing(0);
    let background = start(&spawner);

    let requester = background.clone();
    let result = std::thread::spawn(move || {
        requester.get_or_create_for_current_thread(|_: Result<Arc<Actor>, BackgroundError>| {
            panic!("must not be called");
        })
    })
    .join()
    .unwrap();
    assert!(matches!(result, Err(BackgroundError::NoTaskQueue)));
    assert_eq!(spawner.attempts(), 0);

    background.shutdown();
}

#[test]
fn thread_local_payload_lives_in_the_slot() {
    let main_loop = TaskLoop::new("main");
    let spawner = FlakySpawner::failing(0);
    let background = start(&spawner);
    let probe = CallbackProbe::default();

    assert_eq!(background.with_thread_local_payload(|n: &mut u32| *n), None);

    background
        .get_or_create_for_current_thread(probe.callback("payload"))
        .unwrap();
    assert_eq!(background.with_thread_local_payload(|n: &mut u32| {
        *n += 1;
        *n
    }), Some(1));
    assert_eq!(background.with_thread_local_payload(|n: &mut u32| {
        *n += 1;
        *n
    }), Some(2));
    assert_eq!(
        background.with_thread_local_payload(|s: &mut String| s.len()),
        None,
        "a payload of another type is left alone"
    );
    assert_eq!(background.with_thread_local_payload(|n: &mut u32| *n), Some(2));

    assert!(main_loop.spin_until_timeout(TIMEOUT, || probe.len() == 1));
    background.shutdown();
    assert_eq!(background.with_thread_local_payload(|n: &mut u32| *n), None);
}

#[test]
fn child_actor_refuses_use_from_another_thread() {
    let main_loop = TaskLoop::new("main");
    let spawner = FlakySpawner::failing(0);
    let background = start(&spawner);
    let probe = CallbackProbe::default();

    background
        .get_or_create_for_current_thread(probe.callback("confined"))
        .unwrap();
    assert!(main_loop.spin_until_timeout(TIMEOUT, || probe.len() == 1));
    let actor = background.get_for_current_thread().unwrap();

    let stray = actor.clone();
    let outcome = std::thread::spawn(move || stray.close()).join();
    assert!(outcome.is_err(), "closing off the bound thread must panic");

    let worker = ThreadHandle::spawn(&OsThreadSpawner, "stray-worker").unwrap();
    let stray = actor.clone();
    let (tx, rx) = mpsc::channel();
    worker
        .dispatch(move || {
            let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                stray.take_received()
            }));
            let _ = tx.send(caught.is_err());
        })
        .unwrap();
    assert!(rx.recv_timeout(TIMEOUT).unwrap());
    worker.shutdown();

    // Posting is allowed from anywhere.
    assert!(actor.post(b"still usable".to_vec()).is_ok());
    assert!(actor.is_open());

    background.shutdown();
    assert_eq!(background.live_actor_count(), 0);
}
