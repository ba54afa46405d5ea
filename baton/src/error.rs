//! Baton construction errors and status faults.

use thiserror::Error;

use crate::ipc::shmem::ShmError;
use crate::stream::StreamError;

/// A baton could not be constructed. Nothing was left running.
#[derive(Debug, Error)]
pub enum BatonError {
    /// The control channel could not be allocated.
    #[error("failed to allocate control channel: {0}")]
    Alloc(#[from] ShmError),
    /// The wait loop could not be enqueued on its stream.
    #[error("failed to enqueue wait loop: {0}")]
    Enqueue(#[from] StreamError),
    /// No factory is registered under this backend name.
    #[error("no baton backend registered as `{0}`")]
    UnknownBackend(String),
}

/// A status read that does not reflect a loop-driven state.
///
/// Kept apart from [`BatonStatus`](crate::BatonStatus) so a lost loop is
/// never mistaken for a timeout or an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BatonFault {
    /// The wait loop was discarded before it could publish a terminal status:
    /// its stream closed while it was still queued, or it unwound.
    #[error("wait loop was abandoned before reaching a terminal status")]
    Abandoned,
    /// The status word holds a value no wait loop writes.
    #[error("control channel status word is corrupted ({raw})")]
    Corrupted { raw: i32 },
}
