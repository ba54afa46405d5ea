//! Device-side wait loop.
//!
//! The loop is the only writer of the status word:
//!
//! ```text
//! UNKNOWN ──enter──> RUNNING ──abort_flag != 0──> ABORTED
//!                       │
//!                       └──elapsed > timeout────> TIMED_OUT
//! ```
//!
//! Every iteration checks the abort flag first, then the device-local clock,
//! then sleeps one poll interval. Host-to-device latency is therefore bounded
//! by roughly one interval. Time is measured with [`minstant::Instant`] on the
//! executing side only; the host never enforces the timeout.

use std::thread;
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use crate::channel::ControlChannel;
use crate::ipc::shmem::{Opener, Shm, ShmError, ShmPath};
use crate::status::{BatonStatus, InvalidStatus};
use crate::trace::{debug, trace};

/// Sleep between two polls of the control channel.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How long a wait loop may hold its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Hold until aborted.
    #[default]
    Infinite,
    /// Give up once this much device time has elapsed.
    Duration(Duration),
}

impl Timeout {
    /// Milliseconds with `0` meaning [`Timeout::Infinite`].
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        if millis == 0 {
            Self::Infinite
        } else {
            Self::Duration(Duration::from_millis(millis))
        }
    }

    /// Inverse of [`Timeout::from_millis`] (sub-millisecond parts truncate).
    #[must_use]
    pub fn as_millis(&self) -> u64 {
        match self {
            Self::Infinite => 0,
            Self::Duration(d) => u64::try_from(d.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Absolute deadline from now, or `None` when the timeout is infinite or
    /// too far out to represent.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            Self::Duration(d) => Instant::now().checked_add(*d),
        }
    }
}

impl From<Duration> for Timeout {
    /// A zero duration is treated as "no timeout", like `0` milliseconds.
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Self::Infinite
        } else {
            Self::Duration(d)
        }
    }
}

/// Parameters of one wait loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitLoop {
    timeout: Timeout,
    poll_interval: Duration,
}

impl WaitLoop {
    /// A loop with the default 1 ms poll interval.
    #[must_use]
    pub const fn new(timeout: Timeout) -> Self {
        Self {
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the sleep between polls. Zero yields instead of sleeping.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub const fn timeout(&self) -> Timeout {
        self.timeout
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Holds the calling execution unit until the channel is aborted or the
    /// timeout elapses, and returns the terminal status it published.
    ///
    /// The channel must be fresh (status UNKNOWN); a channel is good for one
    /// loop only.
    pub fn run(&self, channel: &ControlChannel) -> BatonStatus {
        let start = Instant::now();
        channel.publish(BatonStatus::Running);
        trace!(timeout_ms = self.timeout.as_millis(), "wait loop running");

        let terminal = loop {
            if channel.abort_requested() {
                break BatonStatus::Aborted;
            }
            if let Timeout::Duration(limit) = self.timeout
                && start.elapsed() > limit
            {
                break BatonStatus::TimedOut;
            }
            if self.poll_interval.is_zero() {
                thread::yield_now();
            } else {
                thread::sleep(self.poll_interval);
            }
        };

        channel.publish(terminal);
        debug!(
            status = %terminal,
            held_us = start.elapsed().as_micros() as u64,
            "wait loop finished"
        );
        terminal
    }
}

/// Errors attaching to a channel owned by another process.
#[derive(Debug, Error)]
pub enum AttachError {
    /// The channel could not be mapped.
    #[error(transparent)]
    Shm(#[from] ShmError),
    /// Another loop already ran (or is running) on this channel.
    #[error("control channel already claimed (status {0})")]
    AlreadyClaimed(BatonStatus),
    /// The status word does not decode.
    #[error(transparent)]
    Corrupted(#[from] InvalidStatus),
}

/// Runs a wait loop against a shm-resident channel created by a host.
///
/// This is the device half for hosts that allocate their channel with
/// [`ChannelMemory::Shared`](crate::ChannelMemory::Shared) and hand the name
/// to a separate process. The status check guards against reusing a finished
/// channel; it does not arbitrate between two devices attaching at once,
/// which the single-writer protocol forbids.
///
/// # Errors
///
/// See [`AttachError`].
pub fn attach(path: &ShmPath, wait: WaitLoop) -> Result<BatonStatus, AttachError> {
    let channel = Shm::<ControlChannel, Opener>::open(path)?;
    match channel.status()? {
        BatonStatus::Unknown => {}
        claimed => return Err(AttachError::AlreadyClaimed(claimed)),
    }
    debug!(path = %path, "attached to control channel");
    Ok(wait.run(&channel))
}
