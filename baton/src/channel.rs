//! The two-word control channel shared by host and device.
//!
//! ```text
//! offset 0: abort_flag  host writes (0 -> 1, once), device reads
//! offset 4: status      device writes (UNKNOWN -> RUNNING -> terminal), host reads
//! ```
//!
//! Each word has exactly one writing domain, so plain atomic loads and stores
//! are sufficient. Writers use `Release` and readers `Acquire`.

use std::ops::Deref;
use std::sync::atomic::{AtomicI32, Ordering};

use rustix::io::Errno;
use serde::{Deserialize, Serialize};

use crate::ipc::shmem::{Creator, SharedMemorySafe, Shm, ShmError, ShmPath};
use crate::status::{BatonStatus, InvalidStatus};

/// Shared `[abort_flag, status]` buffer.
#[derive(Debug, Default)]
#[repr(C)]
pub struct ControlChannel {
    abort_flag: AtomicI32,
    status: AtomicI32,
}

// SAFETY: repr(C), two atomics, no pointers, nothing relies on Drop.
unsafe impl SharedMemorySafe for ControlChannel {}

impl ControlChannel {
    /// A zeroed channel: no abort requested, status UNKNOWN.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            abort_flag: AtomicI32::new(0),
            status: AtomicI32::new(BatonStatus::Unknown as i32),
        }
    }

    /// Host side: release the waiting device. Idempotent.
    #[inline]
    pub fn request_abort(&self) {
        self.abort_flag.store(1, Ordering::Release);
    }

    /// Device side: whether the host has released the wait.
    #[inline]
    #[must_use]
    pub fn abort_requested(&self) -> bool {
        self.abort_flag.load(Ordering::Acquire) != 0
    }

    /// Host side: the raw status word.
    #[inline]
    #[must_use]
    pub fn load_status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    /// Host side: the decoded status word.
    ///
    /// # Errors
    ///
    /// [`InvalidStatus`] if the word was written by something other than a
    /// wait loop.
    #[inline]
    pub fn status(&self) -> Result<BatonStatus, InvalidStatus> {
        BatonStatus::try_from(self.load_status())
    }

    /// Device side: advance the status word.
    ///
    /// Only the device writes this word, so the previous value can be read
    /// relaxed to check the transition.
    #[inline]
    pub(crate) fn publish(&self, next: BatonStatus) {
        debug_assert!(
            BatonStatus::try_from(self.status.load(Ordering::Relaxed))
                .is_ok_and(|prev| prev.can_transition_to(next)),
            "illegal status transition to {next}"
        );
        self.status.store(next.into(), Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn store_raw_status(&self, raw: i32) {
        self.status.store(raw, Ordering::Release);
    }
}

/// Where a baton's control channel is allocated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelMemory {
    /// Heap memory of this process. Visible to in-process streams only.
    #[default]
    Local,
    /// A named POSIX shm object, mappable by other processes.
    Shared,
}

/// Attempts made to find an unused shm name before giving up.
const NAME_ATTEMPTS: usize = 4;

/// Generates a fresh channel name for this process.
fn channel_path() -> ShmPath {
    let nonce: u32 = rand::random();
    let name = format!("/baton-{}-{nonce:08x}", std::process::id());
    // Always valid: leading '/', no other '/', well under NAME_MAX.
    match ShmPath::new(name) {
        Ok(path) => path,
        Err(_) => unreachable!("generated channel path is valid"),
    }
}

/// Owned allocation backing one [`ControlChannel`].
pub enum ChannelStorage {
    /// Heap allocation owned by this process.
    Local(Box<ControlChannel>),
    /// Named shm object, unlinked when this storage drops.
    Shared(Shm<ControlChannel, Creator>),
}

impl ChannelStorage {
    /// Allocates a zero-initialized channel in `memory`.
    ///
    /// # Errors
    ///
    /// Shared allocation fails if shm is unavailable; name collisions are
    /// retried with a new nonce.
    pub fn allocate(memory: ChannelMemory) -> Result<Self, ShmError> {
        match memory {
            ChannelMemory::Local => Ok(Self::Local(Box::new(ControlChannel::new()))),
            ChannelMemory::Shared => {
                let mut attempt = 1;
                loop {
                    match Shm::<ControlChannel, Creator>::create(&channel_path()) {
                        Ok(shm) => return Ok(Self::Shared(shm)),
                        Err(ShmError::PosixError { source, .. })
                            if source == Errno::EXIST && attempt < NAME_ATTEMPTS =>
                        {
                            attempt += 1;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    /// The shm name, when the channel lives in shared memory.
    #[must_use]
    pub fn path(&self) -> Option<&ShmPath> {
        match self {
            Self::Local(_) => None,
            Self::Shared(shm) => Some(shm.path()),
        }
    }
}

impl Deref for ChannelStorage {
    type Target = ControlChannel;

    fn deref(&self) -> &ControlChannel {
        match self {
            Self::Local(channel) => channel,
            Self::Shared(shm) => shm,
        }
    }
}
