//! Host-side controller for a baton running on a [`Stream`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::backend::Baton;
use crate::channel::{ChannelMemory, ChannelStorage};
use crate::device::{DEFAULT_POLL_INTERVAL, Timeout, WaitLoop};
use crate::error::{BatonError, BatonFault};
use crate::ipc::shmem::ShmPath;
use crate::status::{BatonStatus, InvalidStatus};
use crate::stream::Stream;
use crate::trace::{debug, error, warn};

/// Construction parameters for a [`StreamBaton`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatonOptions {
    /// Device-side timeout; [`Timeout::Infinite`] holds until aborted.
    pub timeout: Timeout,
    /// Sleep between polls of the abort flag.
    pub poll_interval: Duration,
    /// Where the control channel is allocated.
    pub memory: ChannelMemory,
}

impl Default for BatonOptions {
    fn default() -> Self {
        Self {
            timeout: Timeout::Infinite,
            poll_interval: DEFAULT_POLL_INTERVAL,
            memory: ChannelMemory::Local,
        }
    }
}

impl BatonOptions {
    /// Defaults with the given timeout.
    #[must_use]
    pub fn with_timeout(timeout: Timeout) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// State shared between the host handle and the enqueued loop.
struct WaitState {
    channel: ChannelStorage,
    /// Host-side only: set if the loop is dropped without finishing.
    abandoned: AtomicBool,
}

/// The enqueued job. Marks the wait abandoned if it is dropped unfinished,
/// either unrun by a closing stream or unwinding out of the loop.
struct LoopJob {
    state: Arc<WaitState>,
    wait: WaitLoop,
    finished: bool,
}

impl LoopJob {
    fn run(mut self) {
        self.wait.run(&self.state.channel);
        self.finished = true;
    }
}

impl Drop for LoopJob {
    fn drop(&mut self) {
        if !self.finished {
            self.state.abandoned.store(true, Ordering::Release);
            warn!("wait loop dropped before reaching a terminal status");
        }
    }
}

/// Blocks a [`Stream`] until aborted or timed out.
///
/// Construction enqueues the wait loop and returns immediately. Work
/// enqueued on the same stream afterwards starts only once the loop is
/// terminal.
///
/// The loop keeps its own reference to the control channel, so dropping the
/// handle never frees memory under a running loop. Dropping a handle whose
/// loop has no timeout and was never aborted still leaves that loop holding
/// the stream forever.
pub struct StreamBaton {
    state: Arc<WaitState>,
    timeout: Timeout,
}

impl StreamBaton {
    /// Allocates a zeroed channel and enqueues the wait loop on `stream`.
    ///
    /// # Errors
    ///
    /// [`BatonError::Alloc`] or [`BatonError::Enqueue`]. On either, the
    /// channel is released and no loop is left queued.
    pub fn launch(stream: &Stream, options: BatonOptions) -> Result<Self, BatonError> {
        let channel = ChannelStorage::allocate(options.memory).map_err(|e| {
            error!(error = %e, memory = ?options.memory, "control channel allocation failed");
            BatonError::Alloc(e)
        })?;

        let state = Arc::new(WaitState {
            channel,
            abandoned: AtomicBool::new(false),
        });
        let job = LoopJob {
            state: Arc::clone(&state),
            wait: WaitLoop::new(options.timeout).with_poll_interval(options.poll_interval),
            finished: false,
        };

        stream.enqueue(move || job.run()).map_err(|e| {
            error!(stream = stream.name(), error = %e, "wait loop enqueue failed");
            BatonError::Enqueue(e)
        })?;

        debug!(
            stream = stream.name(),
            timeout_ms = options.timeout.as_millis(),
            path = ?state.channel.path(),
            "baton launched"
        );

        Ok(Self {
            state,
            timeout: options.timeout,
        })
    }

    /// Releases the stream. Safe to call any number of times from any thread.
    pub fn abort(&self) {
        if !self.state.channel.abort_requested() {
            debug!(path = ?self.state.channel.path(), "baton abort requested");
        }
        self.state.channel.request_abort();
    }

    /// Non-blocking read of the loop's status.
    ///
    /// `Ok(Unknown)` while the loop is still queued behind other work.
    ///
    /// # Errors
    ///
    /// [`BatonFault::Abandoned`] if the loop was dropped before finishing,
    /// [`BatonFault::Corrupted`] if the status word is not a valid status.
    pub fn status(&self) -> Result<BatonStatus, BatonFault> {
        let status = self
            .state
            .channel
            .status()
            .map_err(|InvalidStatus(raw)| BatonFault::Corrupted { raw })?;

        if !status.is_terminal() && self.state.abandoned.load(Ordering::Acquire) {
            return Err(BatonFault::Abandoned);
        }
        Ok(status)
    }

    /// The configured device-side timeout.
    #[must_use]
    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    /// The shm name of the control channel, if it lives in shared memory.
    ///
    /// Other processes may open it to observe the status word.
    #[must_use]
    pub fn channel_path(&self) -> Option<&ShmPath> {
        self.state.channel.path()
    }
}

impl Baton for StreamBaton {
    fn abort(&self) {
        StreamBaton::abort(self);
    }

    fn status(&self) -> Result<BatonStatus, BatonFault> {
        StreamBaton::status(self)
    }
}

impl Drop for StreamBaton {
    fn drop(&mut self) {
        let channel = &self.state.channel;
        let live = channel
            .status()
            .is_ok_and(|status| !status.is_terminal());
        if live && !channel.abort_requested() && !self.state.abandoned.load(Ordering::Acquire) {
            warn!(
                timeout_ms = self.timeout.as_millis(),
                "baton dropped while its wait loop may still hold the stream"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamConfig, StreamError};
    use std::thread;

    fn stream() -> Stream {
        Stream::spawn(StreamConfig {
            name: "baton-host-test".into(),
            core: None,
        })
        .unwrap()
    }

    fn settle(baton: &StreamBaton) -> Result<BatonStatus, BatonFault> {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            match baton.status() {
                Ok(status) if !status.is_terminal() => {
                    assert!(std::time::Instant::now() < deadline, "baton never settled");
                    thread::sleep(Duration::from_millis(1));
                }
                other => return other,
            }
        }
    }

    #[test]
    fn abort_releases_an_infinite_wait() {
        let stream = stream();
        let baton = StreamBaton::launch(&stream, BatonOptions::default()).unwrap();
        assert_eq!(baton.timeout(), Timeout::Infinite);
        assert!(baton.channel_path().is_none());

        baton.abort();
        assert_eq!(settle(&baton), Ok(BatonStatus::Aborted));
        stream.shutdown();
    }

    #[test]
    fn status_is_unknown_while_queued() {
        let stream = stream();
        let first = StreamBaton::launch(&stream, BatonOptions::default()).unwrap();
        let second = StreamBaton::launch(&stream, BatonOptions::default()).unwrap();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(second.status(), Ok(BatonStatus::Unknown));

        first.abort();
        assert_eq!(settle(&first), Ok(BatonStatus::Aborted));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while second.status() != Ok(BatonStatus::Running) {
            assert!(std::time::Instant::now() < deadline, "second loop never started");
            thread::sleep(Duration::from_millis(1));
        }
        second.abort();
        assert_eq!(settle(&second), Ok(BatonStatus::Aborted));
        stream.shutdown();
    }

    #[test]
    fn closing_the_stream_abandons_a_queued_loop() {
        let stream = stream();
        let holder = StreamBaton::launch(&stream, BatonOptions::default()).unwrap();
        let queued = StreamBaton::launch(&stream, BatonOptions::default()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while holder.status() != Ok(BatonStatus::Running) {
            assert!(std::time::Instant::now() < deadline, "holder never started");
            thread::sleep(Duration::from_millis(1));
        }
        stream.close();
        holder.abort();
        stream.shutdown();

        assert_eq!(holder.status(), Ok(BatonStatus::Aborted));
        assert_eq!(queued.status(), Err(BatonFault::Abandoned));
    }

    #[test]
    fn launches_racing_close_never_strand_a_baton() {
        for _ in 0..100 {
            let shared = Arc::new(stream());
            let launcher = {
                let stream = Arc::clone(&shared);
                thread::spawn(move || {
                    let mut launched = Vec::new();
                    loop {
                        let options = BatonOptions::with_timeout(Timeout::from_millis(1));
                        match StreamBaton::launch(&stream, options) {
                            Ok(baton) => launched.push(baton),
                            Err(BatonError::Enqueue(StreamError::Full)) => thread::yield_now(),
                            Err(_) => return launched,
                        }
                    }
                })
            };

            thread::sleep(Duration::from_micros(50));
            shared.close();
            let launched = launcher.join().unwrap();

            // Every accepted loop either runs to a terminal status or is
            // reported abandoned; none stays queued behind a closed stream.
            for baton in &launched {
                match settle(baton) {
                    Ok(status) => assert!(status.is_terminal()),
                    Err(fault) => assert_eq!(fault, BatonFault::Abandoned),
                }
            }
        }
    }

    #[test]
    fn launch_on_closed_stream_fails() {
        let stream = stream();
        stream.close();
        let result = StreamBaton::launch(&stream, BatonOptions::default());
        assert!(matches!(result, Err(BatonError::Enqueue(_))));
        stream.shutdown();
    }

    #[test]
    fn corrupted_status_word_is_a_fault() {
        let stream = stream();
        let baton = StreamBaton::launch(
            &stream,
            BatonOptions::with_timeout(Timeout::from_millis(10)),
        )
        .unwrap();
        assert_eq!(settle(&baton), Ok(BatonStatus::TimedOut));

        baton.state.channel.store_raw_status(9);
        assert_eq!(baton.status(), Err(BatonFault::Corrupted { raw: 9 }));
        stream.shutdown();
    }

    #[test]
    fn dropping_the_handle_keeps_the_loop_safe() {
        let stream = stream();
        let baton = StreamBaton::launch(
            &stream,
            BatonOptions::with_timeout(Timeout::from_millis(20)),
        )
        .unwrap();
        drop(baton);

        // The loop still owns the channel and times out normally.
        assert!(stream.fence().unwrap().wait(Timeout::from_millis(5_000)));
        stream.shutdown();
    }

    #[test]
    fn shared_memory_channel_is_observable_by_name() {
        use crate::channel::ControlChannel;
        use crate::ipc::shmem::{Opener, Shm};

        let stream = stream();
        let options = BatonOptions {
            memory: ChannelMemory::Shared,
            ..BatonOptions::default()
        };
        let baton = match StreamBaton::launch(&stream, options) {
            Ok(baton) => baton,
            Err(BatonError::Alloc(err)) if err.is_access_denied() => {
                eprintln!("Skipping shared_memory_channel_is_observable_by_name: {err}");
                return;
            }
            Err(err) => panic!("launch failed: {err}"),
        };

        let path = baton.channel_path().cloned().unwrap();
        let observer = Shm::<ControlChannel, Opener>::open(&path).unwrap();

        baton.abort();
        assert_eq!(settle(&baton), Ok(BatonStatus::Aborted));
        assert_eq!(observer.status(), Ok(BatonStatus::Aborted));
        assert!(observer.abort_requested());
        stream.shutdown();
    }
}
