//! Cross-process memory primitives.
//!
//! Control channels that must be visible to another address space are placed
//! in POSIX shared memory through [`shmem`].

pub mod shmem;
