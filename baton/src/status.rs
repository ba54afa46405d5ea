//! Baton status word encoding.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of a wait loop, as stored in the channel's status word.
///
/// The integer values are part of the wire format: other processes read the
/// raw word, and serialization always emits the integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum BatonStatus {
    /// The loop has not started executing yet.
    Unknown = 0,
    /// The loop is holding its stream.
    Running = 1,
    /// The timeout elapsed before an abort was observed.
    TimedOut = 2,
    /// The host released the stream.
    Aborted = 3,
}

impl BatonStatus {
    /// Returns `true` for [`TimedOut`](Self::TimedOut) and [`Aborted`](Self::Aborted).
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::TimedOut | Self::Aborted)
    }

    /// Whether the device may move the status word from `self` to `next`.
    #[inline]
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unknown, Self::Running) | (Self::Running, Self::TimedOut | Self::Aborted)
        )
    }
}

impl From<BatonStatus> for i32 {
    #[inline]
    fn from(status: BatonStatus) -> Self {
        status as i32
    }
}

/// A status word that does not decode to a [`BatonStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid baton status word {0}")]
pub struct InvalidStatus(pub i32);

impl TryFrom<i32> for BatonStatus {
    type Error = InvalidStatus;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Running),
            2 => Ok(Self::TimedOut),
            3 => Ok(Self::Aborted),
            other => Err(InvalidStatus(other)),
        }
    }
}

impl fmt::Display for BatonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Running => write!(f, "running"),
            Self::TimedOut => write!(f, "timed-out"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}
