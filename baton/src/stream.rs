//! Execution streams: ordered work queues served by one dedicated worker.
//!
//! A [`Stream`] plays the role of a device compute queue. Work items run one
//! at a time in submission order on the stream's worker thread, so a job that
//! blocks (a baton wait loop) holds back everything enqueued after it. The
//! worker may be pinned to a core, in which case the stream occupies exactly
//! that one execution unit.
//!
//! ```
//! use baton::stream::{Stream, StreamConfig};
//! use baton::Timeout;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//!
//! let stream = Stream::spawn(StreamConfig::default())?;
//! let hits = Arc::new(AtomicU32::new(0));
//! let counter = Arc::clone(&hits);
//! stream.enqueue(move || {
//!     counter.fetch_add(1, Ordering::Relaxed);
//! })?;
//!
//! assert!(stream.fence()?.wait(Timeout::from_millis(1_000)));
//! assert_eq!(hits.load(Ordering::Relaxed), 1);
//! stream.shutdown();
//! # Ok::<(), baton::stream::StreamError>(())
//! ```

mod ring;

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use core_affinity::CoreId;
use minstant::Instant;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::Timeout;
use crate::trace::{debug, error, info, warn};

use ring::Ring;

/// Maximum number of jobs waiting on one stream.
pub const STREAM_QUEUE_CAPACITY: usize = 256;

/// Upper bound on how long an idle worker sleeps before rechecking its queue.
const IDLE_PARK: Duration = Duration::from_millis(1);

/// Poll interval for [`Fence::wait`].
const FENCE_POLL: Duration = Duration::from_micros(100);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Configuration for a stream worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Worker thread name.
    pub name: String,
    /// Core to pin the worker to (`None` = let the OS schedule it).
    pub core: Option<usize>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "baton-stream".into(),
            core: None,
        }
    }
}

/// Errors submitting to or starting a stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// All queue slots are taken.
    #[error("stream queue is full")]
    Full,
    /// The stream has been closed and accepts no more work.
    #[error("stream is closed")]
    Closed,
    /// The worker thread could not be started.
    #[error("failed to spawn stream worker: {0}")]
    Spawn(#[source] io::Error),
}

struct Shared {
    queue: Ring<Job, STREAM_QUEUE_CAPACITY>,
    /// `closed` and `pushing` form a Dekker pair and use `SeqCst`: either a
    /// producer sees `closed`, or the worker sees its push in flight and
    /// waits for it before the final drain.
    closed: AtomicBool,
    /// Producers between their `closed` check and the end of their push.
    pushing: AtomicUsize,
    name: String,
}

/// Handle to a running stream.
///
/// Dropping the handle closes the stream without waiting for the worker.
/// Use [`Stream::shutdown`] to close and join.
pub struct Stream {
    shared: Arc<Shared>,
    worker: Thread,
    handle: Option<JoinHandle<()>>,
}

impl Stream {
    /// Starts the worker thread.
    ///
    /// # Errors
    ///
    /// [`StreamError::Spawn`] if the OS refuses a new thread.
    pub fn spawn(config: StreamConfig) -> Result<Self, StreamError> {
        let shared = Arc::new(Shared {
            queue: Ring::new(),
            closed: AtomicBool::new(false),
            pushing: AtomicUsize::new(0),
            name: config.name.clone(),
        });

        let worker_shared = Arc::clone(&shared);
        let core = config.core;
        let handle = thread::Builder::new()
            .name(config.name)
            .spawn(move || run_worker(&worker_shared, core))
            .map_err(|e| {
                error!(error = %e, "failed to spawn stream worker");
                StreamError::Spawn(e)
            })?;

        Ok(Self {
            shared,
            worker: handle.thread().clone(),
            handle: Some(handle),
        })
    }

    /// Name the stream was configured with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Submits `job` behind all previously enqueued work.
    ///
    /// Returns as soon as the job is queued; it runs later on the worker.
    ///
    /// # Errors
    ///
    /// [`StreamError::Closed`] after [`close`](Self::close), or
    /// [`StreamError::Full`] when the queue has no free slot. A rejected job is
    /// dropped without running.
    pub fn enqueue<F>(&self, job: F) -> Result<(), StreamError>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &*self.shared;
        shared.pushing.fetch_add(1, Ordering::SeqCst);
        let pushed = if shared.closed.load(Ordering::SeqCst) {
            Err(StreamError::Closed)
        } else {
            shared.queue.push(Box::new(job)).map_err(|_| {
                warn!(stream = %shared.name, "stream queue full, job rejected");
                StreamError::Full
            })
        };
        shared.pushing.fetch_sub(1, Ordering::SeqCst);

        if pushed.is_ok() {
            self.worker.unpark();
        }
        pushed
    }

    /// Enqueues a marker that completes once all earlier work has run.
    ///
    /// # Errors
    ///
    /// Same as [`enqueue`](Self::enqueue).
    pub fn fence(&self) -> Result<Fence, StreamError> {
        let done = Arc::new(AtomicBool::new(false));
        let signal = Arc::clone(&done);
        self.enqueue(move || signal.store(true, Ordering::Release))?;
        Ok(Fence { done })
    }

    /// Stops accepting work. The job currently running finishes; jobs still
    /// queued are dropped without running.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!(stream = %self.shared.name, "stream closing");
        }
        self.worker.unpark();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Closes the stream and waits for the worker to exit.
    ///
    /// Blocks for as long as the running job does: a baton with an infinite
    /// timeout must be aborted first.
    pub fn shutdown(mut self) {
        self.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_worker(shared: &Shared, core: Option<usize>) {
    if let Some(id) = core {
        if core_affinity::set_for_current(CoreId { id }) {
            debug!(stream = %shared.name, core = id, "stream worker pinned");
        } else {
            warn!(stream = %shared.name, core = id, "failed to pin stream worker");
        }
    }
    info!(stream = %shared.name, "stream worker started");

    while !shared.closed.load(Ordering::SeqCst) {
        // SAFETY: this thread is the queue's only consumer.
        match unsafe { shared.queue.pop() } {
            Some(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!(stream = %shared.name, "stream job panicked");
                }
            }
            None => thread::park_timeout(IDLE_PARK),
        }
    }

    // A producer that passed its `closed` check before close may still be
    // pushing. Its job must land before the drain, not after it.
    while shared.pushing.load(Ordering::SeqCst) != 0 {
        thread::yield_now();
    }

    // Queued jobs are dropped unrun; their destructors observe the loss.
    // SAFETY: still the only consumer.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    let dropped = std::iter::from_fn(|| unsafe { shared.queue.pop() }).count();
    info!(stream = %shared.name, dropped, "stream worker exiting");
}

/// Completion marker returned by [`Stream::fence`].
#[derive(Debug, Clone)]
pub struct Fence {
    done: Arc<AtomicBool>,
}

impl Fence {
    /// Whether every job enqueued before the fence has run.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Polls until the fence completes; `false` on timeout.
    ///
    /// A fence on a stream closed before reaching it never completes.
    #[must_use]
    pub fn wait(&self, timeout: Timeout) -> bool {
        let deadline = timeout.deadline();
        loop {
            if self.is_complete() {
                return true;
            }
            if let Some(dl) = deadline
                && Instant::now() > dl
            {
                return false;
            }
            thread::sleep(FENCE_POLL);
        }
    }
}
