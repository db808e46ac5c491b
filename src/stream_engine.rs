use crate::audio_runtime::{
    self, AudioHandle, RuntimeOptions, RuntimeStatus, SessionRegistry,
};
use crate::cast::PassthroughEncoder;
use crate::engine::{AudioEngine, Encoder, EncoderSettings};
use crate::error::{Error, Result, lock_or_recover};
use crate::logging::LogContext;
use crate::track::TrackInfo;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const PLAY_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// AudioEngine that streams files unchanged to every live cast session,
/// with optional local monitoring.
pub struct StreamEngine {
    handle: AudioHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
    status: Arc<RuntimeStatus>,
    sessions: Arc<SessionRegistry>,
    log: LogContext,
}

impl StreamEngine {
    pub fn start(monitor: bool, fallback_bitrate_kbps: u32, log: &LogContext) -> Result<Self> {
        let log = log.for_component("engine");
        let sessions = Arc::new(SessionRegistry::new());
        let status = Arc::new(RuntimeStatus::default());
        let fallback = EncoderSettings {
            bitrate_kbps: fallback_bitrate_kbps,
            ..EncoderSettings::default()
        };
        let (handle, thread) = audio_runtime::spawn_audio_runtime(
            sessions.clone(),
            status.clone(),
            RuntimeOptions {
                monitor,
                fallback_byte_rate: fallback.byte_rate(),
            },
            &log,
        )
        .map_err(|e| Error::Engine(format!("cannot start audio thread: {}", e)))?;

        log.info(format!(
            "Stream engine started (monitor {})",
            if monitor { "on" } else { "off" }
        ));
        Ok(StreamEngine {
            handle,
            thread: Mutex::new(Some(thread)),
            status,
            sessions,
            log,
        })
    }

    pub fn is_paused(&self) -> bool {
        self.status.is_paused()
    }

    /// Number of cast sessions currently fed.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Stop the audio thread. Idempotent.
    pub fn shutdown(&self) {
        self.handle.shutdown();
        if let Some(thread) = lock_or_recover(&self.thread).take() {
            let _ = thread.join();
            self.log.debug("Audio thread stopped");
        }
    }
}

impl AudioEngine for StreamEngine {
    fn play_track(&self, path: &Path) -> Option<TrackInfo> {
        let info = match TrackInfo::from_path(path) {
            Ok(info) => info,
            Err(e) => {
                self.log.error(e);
                return None;
            }
        };
        match self
            .handle
            .play(path.to_path_buf(), info.duration, PLAY_ACK_TIMEOUT)
        {
            Ok(()) => Some(info),
            Err(e) => {
                self.log.error(e);
                None
            }
        }
    }

    fn is_playing(&self) -> bool {
        self.status.is_playing()
    }

    fn pause(&self) {
        self.handle.pause();
    }

    fn resume(&self) {
        self.handle.resume();
    }

    fn stop(&self) {
        self.handle.stop();
    }

    fn current_time(&self) -> Duration {
        self.status.position()
    }

    fn total_time(&self) -> Duration {
        self.status.total()
    }

    fn create_encoder(&self, settings: &EncoderSettings) -> Box<dyn Encoder> {
        Box::new(PassthroughEncoder::new(
            settings.clone(),
            self.sessions.clone(),
            &self.log,
        ))
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreadable_file_is_not_played() {
        let engine = StreamEngine::start(false, 128, &LogContext::default()).unwrap();
        assert!(engine.play_track(Path::new("__nonexistent_file__.mp3")).is_none());
        assert!(!engine.is_playing());
        assert_eq!(engine.current_time(), Duration::ZERO);
        engine.shutdown();
        engine.shutdown();
    }

    #[test]
    fn encoders_share_the_session_registry() {
        let engine = StreamEngine::start(false, 128, &LogContext::default()).unwrap();
        let encoder = engine.create_encoder(&EncoderSettings::default());
        assert!(!encoder.is_casting());
        assert_eq!(engine.session_count(), 0);
    }
}
