//! Integration tests: selector loop wake-up, deferred tasks and alarms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use wireline::{Error, SelectorParams, SelectorThread};

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn started_thread(params: SelectorParams) -> Arc<SelectorThread> {
    let thread = Arc::new(SelectorThread::new(params).expect("creating selector thread"));
    assert!(thread.start());
    thread
}

#[test]
fn cross_thread_task_wakes_the_loop() {
    init_logging();
    let thread = started_thread(SelectorParams::default());
    let selector = thread.selector().clone();

    let flag = Arc::new(AtomicBool::new(false));
    let task_flag = flag.clone();
    let task_selector = selector.clone();
    selector.run_in_select_loop(move || {
        task_flag.store(true, Ordering::SeqCst);
        task_selector.make_loop_exit();
    });

    // The default loop timeout is one second; a prompt exit proves the
    // wake-up fd fired.
    let deadline = std::time::Instant::now() + Duration::from_millis(500);
    while thread.is_started() && std::time::Instant::now() < deadline {
        if !selector.is_running() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(flag.load(Ordering::SeqCst));
    thread.stop();
    assert!(thread.loop_status().is_ok());
}

#[test]
fn tasks_posted_before_start_run_after_start() {
    init_logging();
    let thread = Arc::new(SelectorThread::new(SelectorParams::default()).unwrap());
    let (tx, rx) = crossbeam_channel::unbounded();
    thread.selector().run_in_select_loop(move || {
        tx.send("ran").unwrap();
    });
    assert!(thread.start());
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "ran");
    thread.stop();
}

#[test]
fn deferred_tasks_keep_posting_order() {
    init_logging();
    let thread = started_thread(SelectorParams::default());
    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = crossbeam_channel::bounded(1);
    for i in 0..32u32 {
        let order = order.clone();
        let tx = tx.clone();
        thread.selector().run_in_select_loop(move || {
            order.lock().push(i);
            if i == 31 {
                tx.send(()).unwrap();
            }
        });
    }
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(*order.lock(), (0..32).collect::<Vec<_>>());
    thread.stop();
}

#[test]
fn zero_duration_alarm_fires_promptly() {
    init_logging();
    let thread = started_thread(SelectorParams::default());
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread.selector().register_alarm(
        move || {
            tx.send(()).unwrap();
        },
        Duration::ZERO,
    );
    rx.recv_timeout(Duration::from_secs(2))
        .expect("zero-duration alarm fired");
    thread.stop();
}

#[test]
fn cancelled_alarm_never_runs() {
    init_logging();
    let thread = started_thread(SelectorParams::default());
    let fired = Arc::new(AtomicBool::new(false));
    let alarm_fired = fired.clone();
    let alarm_id = thread.selector().register_alarm(
        move || {
            alarm_fired.store(true, Ordering::SeqCst);
        },
        Duration::from_millis(50),
    );
    std::thread::sleep(Duration::from_millis(10));
    thread.selector().unregister_alarm(alarm_id);
    std::thread::sleep(Duration::from_millis(200));
    assert!(!fired.load(Ordering::SeqCst));
    thread.stop();
}

#[test]
fn equal_deadline_alarms_fire_in_registration_order() {
    init_logging();
    let thread = started_thread(SelectorParams::default());
    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = crossbeam_channel::bounded(1);
    for i in 0..8u32 {
        let order = order.clone();
        let tx = tx.clone();
        thread.selector().register_alarm(
            move || {
                order.lock().push(i);
                if i == 7 {
                    tx.send(()).unwrap();
                }
            },
            Duration::from_millis(20),
        );
    }
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    thread.stop();
}

#[test]
fn loop_thread_only_calls_are_rejected_from_outside() {
    init_logging();
    let thread = started_thread(SelectorParams::default());
    // Give the loop a moment to record its thread id.
    std::thread::sleep(Duration::from_millis(50));
    let result = thread.selector().clean_and_close_all();
    assert!(matches!(result, Err(Error::FailedPrecondition(_))));
    thread.stop();
}

#[test]
fn stop_is_idempotent() {
    init_logging();
    let thread = started_thread(SelectorParams::default());
    assert!(!thread.start(), "second start reports already started");
    assert!(thread.stop());
    assert!(!thread.stop(), "second stop reports already stopped");
    assert!(thread.loop_status().is_ok());
}

#[test]
fn poll_backend_loop_runs() {
    init_logging();
    let params = SelectorParams::default()
        .set_use_epoll(false)
        .set_use_event_fd(false);
    let thread = started_thread(params);
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread.selector().run_in_select_loop(move || {
        tx.send(()).unwrap();
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("poll-backed loop runs tasks");
    thread.stop();
    assert!(thread.loop_status().is_ok());
}
