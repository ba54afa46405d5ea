//! Backend selection for batons.
//!
//! Every backend implements [`Baton`]. Callers pick one either by name
//! through an explicit [`Registry`] (no process-global registration state),
//! or from configuration through [`BatonConfig`].
//!
//! ```
//! use std::sync::Arc;
//! use baton::{BatonStatus, Registry, Timeout};
//! use baton::stream::{Stream, StreamConfig};
//!
//! let stream = Arc::new(Stream::spawn(StreamConfig::default())?);
//! let registry = Registry::builtin(Arc::clone(&stream));
//!
//! let baton = registry.create("stream", Timeout::Infinite)?;
//! baton.abort();
//! let settled = baton.wait_terminal(Timeout::from_millis(5_000))?;
//! assert_eq!(settled, Some(BatonStatus::Aborted));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use minstant::Instant;
use serde::{Deserialize, Serialize};

use crate::channel::ChannelMemory;
use crate::device::{DEFAULT_POLL_INTERVAL, Timeout};
use crate::error::{BatonError, BatonFault};
use crate::host::{BatonOptions, StreamBaton};
use crate::status::BatonStatus;
use crate::stream::Stream;
use crate::trace::{debug, warn};

/// Name of the backend [`Registry::baton`] creates.
pub const DEFAULT_BACKEND: &str = "stream";

/// Capability shared by every baton implementation.
pub trait Baton: Send + Sync {
    /// Releases the waiting stream. Idempotent and infallible.
    fn abort(&self);

    /// Non-blocking status read.
    ///
    /// # Errors
    ///
    /// A [`BatonFault`] when the status does not come from a live loop.
    fn status(&self) -> Result<BatonStatus, BatonFault>;

    /// Polls [`status`](Self::status) until it is terminal or `watchdog`
    /// expires (`Ok(None)`).
    ///
    /// This is a host-side watchdog only; the baton's own timeout is always
    /// enforced by the device.
    ///
    /// # Errors
    ///
    /// The first fault reported by `status`.
    fn wait_terminal(&self, watchdog: Timeout) -> Result<Option<BatonStatus>, BatonFault> {
        let deadline = watchdog.deadline();
        loop {
            let status = self.status()?;
            if status.is_terminal() {
                return Ok(Some(status));
            }
            if let Some(dl) = deadline
                && Instant::now() > dl
            {
                return Ok(None);
            }
            thread::sleep(DEFAULT_POLL_INTERVAL);
        }
    }
}

/// Constructor registered under a backend name.
pub type BatonFactory = Box<dyn Fn(Timeout) -> Result<Box<dyn Baton>, BatonError> + Send + Sync>;

/// Name-keyed set of baton factories.
pub struct Registry {
    factories: HashMap<String, BatonFactory>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in backends, all launching on `stream`:
    ///
    /// - `"stream"`: control channel in process memory
    /// - `"shm"`: control channel in named POSIX shared memory
    #[must_use]
    pub fn builtin(stream: Arc<Stream>) -> Self {
        let mut registry = Self::new();
        for kind in [BackendKind::Stream, BackendKind::Shm] {
            let stream = Arc::clone(&stream);
            registry.register(kind.name(), move |timeout| {
                let options = BatonOptions {
                    memory: kind.memory(),
                    ..BatonOptions::with_timeout(timeout)
                };
                let baton = StreamBaton::launch(&stream, options)?;
                Ok(Box::new(baton) as Box<dyn Baton>)
            });
        }
        debug!(stream = stream.name(), "builtin baton registry created");
        registry
    }

    /// Associates `name` with `factory`, returning the factory it replaces.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Option<BatonFactory>
    where
        F: Fn(Timeout) -> Result<Box<dyn Baton>, BatonError> + Send + Sync + 'static,
    {
        let name = name.into();
        let previous = self.factories.insert(name.clone(), Box::new(factory));
        if previous.is_some() {
            warn!(backend = %name, "baton backend re-registered");
        }
        previous
    }

    /// Whether a backend is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered backend names, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Creates a baton from the backend registered as `name`.
    ///
    /// # Errors
    ///
    /// [`BatonError::UnknownBackend`], or whatever the factory reports.
    pub fn create(&self, name: &str, timeout: Timeout) -> Result<Box<dyn Baton>, BatonError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| BatonError::UnknownBackend(name.to_string()))?;
        debug!(backend = name, timeout_ms = timeout.as_millis(), "creating baton");
        factory(timeout)
    }

    /// Creates a baton from [`DEFAULT_BACKEND`].
    ///
    /// # Errors
    ///
    /// Fails loudly with [`BatonError::UnknownBackend`] if no default backend
    /// is registered.
    pub fn baton(&self, timeout: Timeout) -> Result<Box<dyn Baton>, BatonError> {
        self.create(DEFAULT_BACKEND, timeout)
    }
}

/// Built-in backends selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Stream worker with a process-local control channel.
    #[default]
    Stream,
    /// Stream worker with a control channel in POSIX shared memory.
    Shm,
}

impl BackendKind {
    /// Registry name of this backend.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Shm => "shm",
        }
    }

    /// Where this backend allocates its control channel.
    #[must_use]
    pub const fn memory(self) -> ChannelMemory {
        match self {
            Self::Stream => ChannelMemory::Local,
            Self::Shm => ChannelMemory::Shared,
        }
    }
}

/// Configuration-file form of a baton.
///
/// ```
/// # use baton::{BackendKind, BatonConfig};
/// let config: BatonConfig = serde_json::from_str(
///     r#"{ "backend": "shm", "timeout_ms": 250 }"#,
/// ).unwrap();
/// assert_eq!(config.backend, BackendKind::Shm);
/// assert_eq!(config.poll_interval_us, 1_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatonConfig {
    pub backend: BackendKind,
    /// Device-side timeout; `0` waits until aborted.
    pub timeout_ms: u64,
    /// Sleep between polls, in microseconds.
    pub poll_interval_us: u64,
}

impl Default for BatonConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            timeout_ms: 0,
            poll_interval_us: DEFAULT_POLL_INTERVAL.as_micros() as u64,
        }
    }
}

impl BatonConfig {
    #[must_use]
    pub const fn timeout(&self) -> Timeout {
        Timeout::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    /// Launch options equivalent to this config.
    #[must_use]
    pub const fn options(&self) -> BatonOptions {
        BatonOptions {
            timeout: self.timeout(),
            poll_interval: self.poll_interval(),
            memory: self.backend.memory(),
        }
    }

    /// Launches the configured backend on `stream`.
    ///
    /// # Errors
    ///
    /// See [`StreamBaton::launch`].
    pub fn launch(&self, stream: &Stream) -> Result<StreamBaton, BatonError> {
        StreamBaton::launch(stream, self.options())
    }
}
