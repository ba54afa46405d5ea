//! Logging facade.
//!
//! Built with `--features tracing` the macros below forward to `tracing`.
//! Without the feature they expand to nothing, so the wait loop and the
//! stream worker pay no logging cost in production builds.

/// Installs a fmt subscriber filtered by `RUST_LOG` (default `baton=debug`).
///
/// Safe to call more than once; later calls are ignored. A no-op unless the
/// `tracing` feature is enabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("baton=debug"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
mod disabled {
    macro_rules! trace_off {
        ($($arg:tt)*) => {};
    }
    macro_rules! debug_off {
        ($($arg:tt)*) => {};
    }
    macro_rules! info_off {
        ($($arg:tt)*) => {};
    }
    macro_rules! warn_off {
        ($($arg:tt)*) => {};
    }
    macro_rules! error_off {
        ($($arg:tt)*) => {};
    }
    pub(crate) use {debug_off, error_off, info_off, trace_off, warn_off};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use disabled::{
    debug_off as debug, error_off as error, info_off as info, trace_off as trace,
    warn_off as warn,
};
