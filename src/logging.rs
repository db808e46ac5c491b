//! Logging context handed to every component at construction.
//!
//! Output goes through `tracing`; a `LogContext` only carries the component
//! tag and the debug flag as plain data, so there is no process-wide mutable
//! logger state besides the subscriber installed once by [`init`].

use std::fmt::Display;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct LogContext {
    component: &'static str,
    debug: bool,
}

impl LogContext {
    pub fn new(debug: bool) -> Self {
        LogContext {
            component: "onair",
            debug,
        }
    }

    /// Same flags, different component tag.
    pub fn for_component(&self, component: &'static str) -> Self {
        LogContext {
            component,
            debug: self.debug,
        }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug
    }

    /// Always handed to `tracing`; whether it shows is up to the
    /// subscriber's filter, which [`init`] derives from the debug flag.
    pub fn debug(&self, message: impl Display) {
        tracing::debug!(component = self.component, "{}", message);
    }

    pub fn info(&self, message: impl Display) {
        tracing::info!(component = self.component, "{}", message);
    }

    pub fn warn(&self, message: impl Display) {
        tracing::warn!(component = self.component, "{}", message);
    }

    pub fn error(&self, message: impl Display) {
        tracing::error!(component = self.component, "{}", message);
    }
}

impl Default for LogContext {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Install the global fmt subscriber. `RUST_LOG` wins over the debug flag.
/// Safe to call more than once; later calls are ignored.
pub fn init(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
