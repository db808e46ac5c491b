//! onair: core library for a continuous internet radio broadcaster.
//!
//! Scheduling, jingle injection, streaming connections and the control loop
//! live here. The `onair` binary wires them up from a config file.

pub mod audio_runtime;
pub mod broadcast;
pub mod cast;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod fanout;
pub mod http;
pub mod jingle;
pub mod logging;
pub mod notifier;
pub mod now_playing;
pub mod orchestrator;
pub mod player;
pub mod playlist;
pub mod schedule;
pub mod scheduler;
pub mod spacing;
pub mod stream_engine;
pub mod track;

pub use error::{CastError, Error, Result};
pub use logging::LogContext;
