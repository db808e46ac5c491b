//! Error types shared across the broadcaster core.

use std::path::PathBuf;

/// Result alias for onair operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Filesystem or socket failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] ureq::Error),

    /// Startup configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A schedule item failed validation.
    #[error("Invalid schedule item '{name}': {reason}")]
    Schedule { name: String, reason: String },

    /// A playlist could not be loaded.
    #[error("Playlist '{}': {reason}", path.display())]
    Playlist { path: PathBuf, reason: String },

    /// The cast-init handshake or a metadata push failed.
    #[error("Cast error: {0}")]
    Cast(#[from] CastError),

    /// The audio engine refused a command.
    #[error("Audio engine error: {0}")]
    Engine(String),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub fn playlist(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Playlist {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Outcome of a failed cast-init handshake.
///
/// `Busy` means the encoder (or the server mount) is still held by a previous
/// session; the caller recreates the encoder and retries the same attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CastError {
    #[error("resource busy")]
    Busy,
    #[error("{0}")]
    Failed(String),
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_or_recover<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
