//! Host-released, device-timed wait barriers for ordered execution streams.
//!
//! A [`StreamBaton`] enqueues a wait loop on a [`Stream`](stream::Stream).
//! The loop holds the stream until the host calls [`abort`](Baton::abort)
//! or until its [`Timeout`] elapses on the executing side, then publishes
//! the outcome in a two-word [`ControlChannel`]. Work enqueued behind the
//! baton does not start before that.
//!
//! ```
//! use baton::stream::{Stream, StreamConfig};
//! use baton::{BatonOptions, BatonStatus, StreamBaton, Timeout};
//!
//! let stream = Stream::spawn(StreamConfig::default())?;
//! let baton = StreamBaton::launch(&stream, BatonOptions::default())?;
//!
//! // ... stage the data the gated work needs ...
//! baton.abort();
//!
//! assert!(stream.fence()?.wait(Timeout::from_millis(5_000)));
//! assert_eq!(baton.status()?, BatonStatus::Aborted);
//! stream.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Enable the `tracing` feature and call [`init_tracing`] to log stream and
//! baton lifecycle events.

pub mod backend;
pub mod channel;
pub mod device;
pub mod error;
pub mod host;
pub mod ipc;
pub mod status;
pub mod stream;

mod trace;

pub use backend::{BackendKind, Baton, BatonConfig, BatonFactory, DEFAULT_BACKEND, Registry};
pub use channel::{ChannelMemory, ChannelStorage, ControlChannel};
pub use device::{AttachError, DEFAULT_POLL_INTERVAL, Timeout, WaitLoop, attach};
pub use error::{BatonError, BatonFault};
pub use host::{BatonOptions, StreamBaton};
pub use status::{BatonStatus, InvalidStatus};
pub use trace::init_tracing;
