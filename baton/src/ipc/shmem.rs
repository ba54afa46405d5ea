//! POSIX shared memory mapping for control channels.
//!
//! [`Shm<T, Mode>`] maps a single `T` into the address space. The `Mode`
//! typestate decides cleanup:
//!
//! | Mode | Constructor | On drop |
//! |------|-------------|---------|
//! | [`Creator`] | [`Shm::create`] | `munmap()` + `shm_unlink()` |
//! | [`Opener`] | [`Shm::open`] | `munmap()` only |
//!
//! A host creates the object and a device process (or a second mapping in
//! the same process) opens it by name:
//!
//! ```no_run
//! use baton::ipc::shmem::{Creator, Opener, Shm, ShmPath};
//! use baton::ControlChannel;
//!
//! let path = ShmPath::new("/baton-demo")?;
//! let host = Shm::<ControlChannel, Creator>::create(&path)?;
//! let device = Shm::<ControlChannel, Opener>::open(&path)?;
//!
//! host.request_abort();
//! assert!(device.abort_requested());
//! # Ok::<(), baton::ipc::shmem::ShmError>(())
//! ```

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::ptr::{NonNull, null_mut};
use thiserror::Error;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Errors produced while creating or opening a mapping.
#[derive(Debug, Error)]
pub enum ShmError {
    /// The name is not a portable POSIX shm name.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// A syscall failed.
    #[error("{op} failed for `{path}`: {source}")]
    PosixError {
        op: &'static str,
        path: String,
        #[source]
        source: io::Errno,
    },
    /// The existing object was not created for `T`.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, err: io::Errno) -> Self {
        Self::PosixError {
            op,
            path: path.to_string(),
            source: err,
        }
    }

    /// Whether the host denied access to shared memory entirely.
    ///
    /// Sandboxed environments often mount `/dev/shm` read-only; callers and
    /// tests use this to fall back or skip.
    #[must_use]
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::PosixError { source, .. } if *source == io::Errno::ACCESS)
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory object name.
///
/// Must start with `/`, contain no other `/`, and fit in `NAME_MAX` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    /// Validates `path` as a shm name.
    ///
    /// # Errors
    ///
    /// [`ShmError::InvalidPath`] if the name is not portable.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let reason = if !path.starts_with('/') {
            Some("path must start with '/'")
        } else if path[1..].contains('/') {
            Some("path must not contain additional '/' characters")
        } else if path.len() > POSIX_NAME_MAX {
            Some("path length must be <= 255 bytes")
        } else if path.len() == 1 {
            Some("path must name an object after '/'")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ShmError::InvalidPath { path, reason }),
            None => Ok(Self(path)),
        }
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cleanup policy for a mapping.
pub trait ShmMode {
    /// Whether dropping the mapping removes the name.
    const SHOULD_UNLINK: bool;
}

/// Owner of the object: unmaps and unlinks on drop.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Secondary mapping of an object created elsewhere: unmaps only.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types that may live in memory mapped by several processes.
///
/// # Safety
///
/// Implementers must be `#[repr(C)]` or `#[repr(transparent)]`, contain no
/// pointers or process-local handles, stay valid if `Drop` never runs, and
/// synchronize all shared mutation through atomics.
pub unsafe trait SharedMemorySafe: Send + Sync {}

/// Mapping of one `T` in POSIX shared memory.
///
/// Invariants: `ptr` is the start of a live `MAP_SHARED` mapping of exactly
/// `size_of::<T>()` bytes that stays mapped until drop; the contents are an
/// initialized `T`.
pub struct Shm<T: SharedMemorySafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    path: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: the pointee is SharedMemorySafe (Send + Sync) and the mapping is
// not tied to the creating thread.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Send for Shm<T, Mode> {}
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

/// Maps `size_of::<T>()` bytes of `fd` read-write.
fn map_shared<T>(fd: &rustix::fd::OwnedFd, path: &ShmPath) -> Result<NonNull<T>> {
    // SAFETY: a fresh mapping chosen by the kernel (null hint) cannot alias
    // existing Rust objects; the object is at least size_of::<T>() bytes and
    // mmap returns page-aligned addresses, which satisfies T's alignment.
    let ptr = unsafe {
        mmap(
            null_mut(),
            size_of::<T>(),
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|err| ShmError::posix("mmap", path, err))?;

    NonNull::new(ptr.cast::<T>()).ok_or(ShmError::PosixError {
        op: "mmap",
        path: path.to_string(),
        source: io::Errno::NOMEM,
    })
}

impl<T: SharedMemorySafe + Default> Shm<T, Creator> {
    /// Creates the object exclusively and writes `T::default()` into it.
    ///
    /// # Errors
    ///
    /// `EEXIST` if the name is taken, `EACCES` if shm is not permitted, or any
    /// `ftruncate`/`mmap` failure. The name is unlinked again on every error
    /// path, so a failed create never leaks an object.
    pub fn create(path: &ShmPath) -> Result<Self> {
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", path, err))?;

        let mapped = ftruncate(&fd, size_of::<T>() as u64)
            .map_err(|err| ShmError::posix("ftruncate", path, err))
            .and_then(|()| map_shared::<T>(&fd, path));
        drop(fd);

        let ptr = match mapped {
            Ok(ptr) => ptr,
            Err(err) => {
                let _ = shm::unlink(path.as_str());
                return Err(err);
            }
        };

        // SAFETY: the mapping is fresh, exclusively ours, and sized for T.
        unsafe { ptr.as_ptr().write(T::default()) };

        Ok(Self {
            ptr,
            path: path.clone(),
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Maps an object previously created with [`Shm::create`].
    ///
    /// # Errors
    ///
    /// `ENOENT` if it does not exist, [`ShmError::SizeMismatch`] if it was
    /// created for a different type.
    pub fn open(path: &ShmPath) -> Result<Self> {
        let fd = shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", path, err))?;

        let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", path, err))?;
        if stat.st_size != size_of::<T>() as i64 {
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        let ptr = map_shared::<T>(&fd, path)?;
        Ok(Self {
            ptr,
            path: path.clone(),
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Shm<T, Mode> {
    /// Name of the underlying object.
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe the mapping made in the constructor and
        // no references into it outlive `self`.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), size_of::<T>());
        }

        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: mapped and initialized for the lifetime of self.
        unsafe { self.ptr.as_ref() }
    }
}
