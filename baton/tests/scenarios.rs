//! End-to-end baton scenarios against real stream workers.
//!
//! Timing-sensitive, so every test runs serially. Deadlines are generous;
//! the assertions are about which terminal status wins, not latency.
//!
//! ```bash
//! RUST_LOG=baton=trace cargo test --features tracing --test scenarios -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;

use baton::stream::{Stream, StreamConfig};
use baton::{
    BackendKind, Baton, BatonConfig, BatonStatus, ChannelMemory, ChannelStorage,
    DEFAULT_POLL_INTERVAL, Registry, Timeout,
};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(baton::init_tracing);
}

const WATCHDOG: Timeout = Timeout::from_millis(5_000);

fn registry() -> (Arc<Stream>, Registry) {
    init_test_tracing();
    let stream = Arc::new(
        Stream::spawn(StreamConfig {
            name: "baton-scenario".into(),
            core: None,
        })
        .unwrap(),
    );
    let registry = Registry::builtin(Arc::clone(&stream));
    (stream, registry)
}

fn wait_running(baton: &dyn Baton) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while baton.status() != Ok(BatonStatus::Running) {
        assert!(Instant::now() < deadline, "wait loop never started");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Polls without sleeping a full interval, so the measured time is the
/// loop's latency rather than ours.
fn time_to_terminal(baton: &dyn Baton) -> (BatonStatus, Duration) {
    let started = Instant::now();
    loop {
        let status = baton.status().unwrap();
        if status.is_terminal() {
            return (status, started.elapsed());
        }
        assert!(started.elapsed() < Duration::from_secs(5), "baton never settled");
        thread::sleep(Duration::from_micros(50));
    }
}

/// Slack for scheduler noise on top of the one-interval bound.
const LATENCY_SLACK: Duration = Duration::from_millis(50);

#[test]
#[serial]
fn unaborted_baton_times_out() {
    let (_stream, registry) = registry();
    let started = Instant::now();
    let baton = registry.create("stream", Timeout::from_millis(50)).unwrap();
    wait_running(baton.as_ref());

    thread::sleep(Duration::from_millis(100));
    assert_eq!(baton.status(), Ok(BatonStatus::TimedOut));
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
#[serial]
fn timeout_lands_within_one_poll_interval() {
    let (_stream, registry) = registry();
    let limit = Duration::from_millis(50);
    let baton = registry.baton(Timeout::Duration(limit)).unwrap();
    wait_running(baton.as_ref());

    // Measured from the first RUNNING sighting, which is after loop start.
    let (status, held) = time_to_terminal(baton.as_ref());
    assert_eq!(status, BatonStatus::TimedOut);
    assert!(
        held <= limit + DEFAULT_POLL_INTERVAL + LATENCY_SLACK,
        "timed out after {held:?}"
    );
}

#[test]
#[serial]
fn immediate_abort_releases_an_infinite_baton() {
    let (_stream, registry) = registry();
    let baton = registry.baton(Timeout::Infinite).unwrap();
    baton.abort();

    assert_eq!(baton.wait_terminal(WATCHDOG), Ok(Some(BatonStatus::Aborted)));
}

#[test]
#[serial]
fn abort_lands_within_one_poll_interval() {
    let (_stream, registry) = registry();
    let baton = registry.baton(Timeout::Infinite).unwrap();
    wait_running(baton.as_ref());

    let released = Instant::now();
    baton.abort();
    let (status, _) = time_to_terminal(baton.as_ref());
    let latency = released.elapsed();
    assert_eq!(status, BatonStatus::Aborted);
    assert!(
        latency <= DEFAULT_POLL_INTERVAL + LATENCY_SLACK,
        "aborted after {latency:?}"
    );
}

#[test]
#[serial]
fn abort_before_deadline_never_reports_timeout() {
    let (_stream, registry) = registry();
    let baton = registry.baton(Timeout::from_millis(1_000)).unwrap();
    wait_running(baton.as_ref());

    thread::sleep(Duration::from_millis(10));
    baton.abort();
    assert_eq!(baton.wait_terminal(WATCHDOG), Ok(Some(BatonStatus::Aborted)));

    for _ in 0..50 {
        assert_eq!(baton.status(), Ok(BatonStatus::Aborted));
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
#[serial]
fn concurrent_aborts_produce_one_transition() {
    let (_stream, registry) = registry();
    let baton: Arc<dyn Baton> = Arc::from(registry.baton(Timeout::Infinite).unwrap());
    wait_running(baton.as_ref());

    let stop = Arc::new(AtomicBool::new(false));
    let history = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(Barrier::new(3));
    let observer = {
        let baton = Arc::clone(&baton);
        let stop = Arc::clone(&stop);
        let history = Arc::clone(&history);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let first = baton.status().unwrap();
            history.lock().unwrap().push(first);
            let mut last = Some(first);
            barrier.wait();
            while !stop.load(Ordering::Acquire) {
                let status = baton.status().unwrap();
                if last != Some(status) {
                    history.lock().unwrap().push(status);
                    last = Some(status);
                }
            }
        })
    };

    let aborters: Vec<_> = (0..2)
        .map(|_| {
            let baton = Arc::clone(&baton);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                baton.abort();
            })
        })
        .collect();
    for handle in aborters {
        handle.join().unwrap();
    }

    assert_eq!(baton.wait_terminal(WATCHDOG), Ok(Some(BatonStatus::Aborted)));
    thread::sleep(Duration::from_millis(5));
    stop.store(true, Ordering::Release);
    observer.join().unwrap();

    assert_eq!(
        *history.lock().unwrap(),
        vec![BatonStatus::Running, BatonStatus::Aborted]
    );
}

#[test]
#[serial]
fn abort_is_idempotent_after_settling() {
    let (_stream, registry) = registry();
    let baton = registry.baton(Timeout::from_millis(20)).unwrap();
    assert_eq!(baton.wait_terminal(WATCHDOG), Ok(Some(BatonStatus::TimedOut)));

    // A late abort does not rewrite a terminal status.
    baton.abort();
    baton.abort();
    thread::sleep(Duration::from_millis(10));
    assert_eq!(baton.status(), Ok(BatonStatus::TimedOut));
}

#[test]
#[serial]
fn gated_work_starts_only_after_release() {
    let (stream, registry) = registry();
    let baton = registry.baton(Timeout::Infinite).unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    stream
        .enqueue(move || {
            counter.fetch_add(1, Ordering::Release);
        })
        .unwrap();

    wait_running(baton.as_ref());
    thread::sleep(Duration::from_millis(20));
    assert_eq!(ran.load(Ordering::Acquire), 0);

    baton.abort();
    assert!(stream.fence().unwrap().wait(WATCHDOG));
    assert_eq!(ran.load(Ordering::Acquire), 1);
}

#[test]
#[serial]
fn batons_on_one_stream_run_back_to_back() {
    let (_stream, registry) = registry();
    let first = registry.baton(Timeout::from_millis(30)).unwrap();
    let second = registry.baton(Timeout::Infinite).unwrap();

    assert_eq!(second.status(), Ok(BatonStatus::Unknown));
    assert_eq!(first.wait_terminal(WATCHDOG), Ok(Some(BatonStatus::TimedOut)));

    wait_running(second.as_ref());
    second.abort();
    assert_eq!(second.wait_terminal(WATCHDOG), Ok(Some(BatonStatus::Aborted)));
}

#[test]
#[serial]
fn config_selects_the_shared_memory_backend() {
    init_test_tracing();
    let stream = Stream::spawn(StreamConfig::default()).unwrap();
    let config: BatonConfig =
        serde_json::from_str(r#"{ "backend": "shm", "timeout_ms": 25 }"#).unwrap();
    assert_eq!(config.backend, BackendKind::Shm);

    let baton = match config.launch(&stream) {
        Ok(baton) => baton,
        Err(baton::BatonError::Alloc(err)) if err.is_access_denied() => {
            eprintln!("Skipping config_selects_the_shared_memory_backend: {err}");
            return;
        }
        Err(err) => panic!("launch failed: {err}"),
    };
    assert!(baton.channel_path().is_some());
    assert_eq!(baton.wait_terminal(WATCHDOG), Ok(Some(BatonStatus::TimedOut)));
    stream.shutdown();
}

#[test]
#[serial]
fn device_process_is_released_by_the_host() {
    init_test_tracing();
    let channel = match ChannelStorage::allocate(ChannelMemory::Shared) {
        Ok(channel) => channel,
        Err(err) if err.is_access_denied() => {
            eprintln!("Skipping device_process_is_released_by_the_host: {err}");
            return;
        }
        Err(err) => panic!("allocate failed: {err}"),
    };
    let path = channel.path().unwrap().to_string();

    let child = std::process::Command::new(env!("CARGO_BIN_EXE_baton-wait"))
        .arg(&path)
        .args(["--poll-us", "200"])
        .stdout(std::process::Stdio::piped())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while channel.status() != Ok(BatonStatus::Running) {
        assert!(Instant::now() < deadline, "device process never attached");
        thread::sleep(Duration::from_millis(1));
    }
    channel.request_abort();

    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "3");
    assert_eq!(channel.status(), Ok(BatonStatus::Aborted));
}
