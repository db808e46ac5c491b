//! AudioRuntime: dedicated audio thread with channel-based command dispatch.
//!
//! The thread owns the file being streamed and the optional rodio monitor.
//! Bytes are read at the track's natural rate (file size / duration) and
//! handed to every registered cast session. Callers talk to it through
//! [`AudioHandle`] and read progress from [`RuntimeStatus`].

use crate::error::lock_or_recover;
use crate::logging::LogContext;
use crate::player::MonitorPlayer;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(50);
const MAX_CHUNK: usize = 16 * 1024;

/// Queue depth per cast session; a session that falls this far behind
/// loses chunks instead of stalling the pump.
pub const SESSION_QUEUE_DEPTH: usize = 64;

pub type Chunk = Arc<[u8]>;

// ── Commands ─────────────────────────────────────────────────────────────────

pub enum AudioCmd {
    Play {
        path: PathBuf,
        duration: Duration,
        ack: Sender<Result<(), String>>,
    },
    Stop,
    Pause,
    Resume,
    Shutdown,
}

// ── Shared state ─────────────────────────────────────────────────────────────

/// Playback progress published by the audio thread.
#[derive(Debug, Default)]
pub struct RuntimeStatus {
    playing: AtomicBool,
    paused: AtomicBool,
    position_ms: AtomicU64,
    total_ms: AtomicU64,
}

impl RuntimeStatus {
    /// A track is loaded and has not finished (paused counts as playing).
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn position(&self) -> Duration {
        Duration::from_millis(self.position_ms.load(Ordering::SeqCst))
    }

    pub fn total(&self) -> Duration {
        Duration::from_millis(self.total_ms.load(Ordering::SeqCst))
    }

    fn start(&self, total: Duration) {
        self.total_ms.store(total.as_millis() as u64, Ordering::SeqCst);
        self.position_ms.store(0, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        self.playing.store(true, Ordering::SeqCst);
    }

    fn set_position(&self, position: Duration) {
        self.position_ms
            .store(position.as_millis() as u64, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.playing.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }
}

/// Live cast sessions fed by the audio thread.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sinks: Mutex<Vec<(u64, Sender<Chunk>)>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and get the receiving end of its chunk queue.
    pub fn register(&self) -> (u64, Receiver<Chunk>) {
        let (tx, rx) = bounded(SESSION_QUEUE_DEPTH);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock_or_recover(&self.sinks).push((id, tx));
        (id, rx)
    }

    pub fn remove(&self, id: u64) {
        lock_or_recover(&self.sinks).retain(|(sid, _)| *sid != id);
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.sinks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand a chunk to every session. Sessions whose receiver is gone are
    /// dropped; full queues lose this chunk.
    pub fn broadcast(&self, bytes: &[u8]) {
        let chunk: Chunk = Arc::from(bytes);
        lock_or_recover(&self.sinks).retain(|(_, tx)| {
            !matches!(tx.try_send(chunk.clone()), Err(TrySendError::Disconnected(_)))
        });
    }
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Thread-safe handle for sending commands to the audio runtime.
#[derive(Clone)]
pub struct AudioHandle {
    tx: Sender<AudioCmd>,
}

impl AudioHandle {
    /// Ask the runtime to start `path` and wait (bounded) for the outcome.
    pub fn play(&self, path: PathBuf, duration: Duration, timeout: Duration) -> Result<(), String> {
        let (ack, done) = bounded(1);
        self.tx
            .send(AudioCmd::Play { path, duration, ack })
            .map_err(|_| "audio runtime is not running".to_string())?;
        match done.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => Err("audio runtime did not acknowledge play".to_string()),
        }
    }

    pub fn stop(&self) {
        let _ = self.tx.send(AudioCmd::Stop);
    }

    pub fn pause(&self) {
        let _ = self.tx.send(AudioCmd::Pause);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(AudioCmd::Resume);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(AudioCmd::Shutdown);
    }
}

// ── Runtime ──────────────────────────────────────────────────────────────────

pub struct RuntimeOptions {
    /// Play through the local output device as well.
    pub monitor: bool,
    /// Pace used when a file reports no duration.
    pub fallback_byte_rate: u64,
}

/// Spawn the audio runtime on a dedicated thread.
pub fn spawn_audio_runtime(
    sessions: Arc<SessionRegistry>,
    status: Arc<RuntimeStatus>,
    options: RuntimeOptions,
    log: &LogContext,
) -> io::Result<(AudioHandle, JoinHandle<()>)> {
    let (tx, rx) = unbounded::<AudioCmd>();
    let log = log.for_component("audio");

    let thread = std::thread::Builder::new()
        .name("audio-runtime".into())
        .spawn(move || {
            audio_thread_loop(rx, &sessions, &status, &options, &log);
        })?;

    Ok((AudioHandle { tx }, thread))
}

/// One file being streamed in real time.
struct Pump {
    reader: BufReader<File>,
    len: u64,
    sent: u64,
    byte_rate: f64,
    total: Duration,
    started: Instant,
    paused_at: Option<Instant>,
    paused_for: Duration,
}

impl Pump {
    fn open(path: &Path, duration: Duration, fallback_byte_rate: u64) -> io::Result<Pump> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let (byte_rate, total) = if duration.is_zero() {
            let rate = fallback_byte_rate.max(1) as f64;
            (rate, Duration::from_secs_f64(len as f64 / rate))
        } else {
            (len as f64 / duration.as_secs_f64(), duration)
        };
        Ok(Pump {
            reader: BufReader::new(file),
            len,
            sent: 0,
            byte_rate,
            total,
            started: Instant::now(),
            paused_at: None,
            paused_for: Duration::ZERO,
        })
    }

    fn elapsed(&self) -> Duration {
        let until = self.paused_at.unwrap_or_else(Instant::now);
        until
            .saturating_duration_since(self.started)
            .saturating_sub(self.paused_for)
    }

    fn position(&self) -> Duration {
        self.elapsed().min(self.total)
    }

    fn pause(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    fn resume(&mut self) {
        if let Some(at) = self.paused_at.take() {
            self.paused_for += at.elapsed();
        }
    }

    /// Send everything due by now. Returns true once the track is over.
    fn pump(&mut self, sessions: &SessionRegistry) -> io::Result<bool> {
        if self.paused_at.is_some() {
            return Ok(false);
        }
        let due = ((self.elapsed().as_secs_f64() * self.byte_rate) as u64).min(self.len);
        let mut buf = [0u8; MAX_CHUNK];
        while self.sent < due {
            let want = ((due - self.sent) as usize).min(MAX_CHUNK);
            let n = self.reader.read(&mut buf[..want])?;
            if n == 0 {
                // File shrank under us.
                self.sent = self.len;
                break;
            }
            sessions.broadcast(&buf[..n]);
            self.sent += n as u64;
        }
        Ok(self.sent >= self.len && self.elapsed() >= self.total)
    }
}

/// Main loop for the audio thread. Owns the pump and the monitor player.
fn audio_thread_loop(
    rx: Receiver<AudioCmd>,
    sessions: &SessionRegistry,
    status: &RuntimeStatus,
    options: &RuntimeOptions,
    log: &LogContext,
) {
    let mut current: Option<Pump> = None;
    let mut monitor: Option<MonitorPlayer> = None;
    let mut monitor_failed = false;

    loop {
        match rx.recv_timeout(TICK) {
            Ok(AudioCmd::Play { path, duration, ack }) => {
                match Pump::open(&path, duration, options.fallback_byte_rate) {
                    Ok(pump) => {
                        if options.monitor && !monitor_failed {
                            // Lazy-init monitor on first use
                            if monitor.is_none() {
                                match MonitorPlayer::new() {
                                    Ok(p) => monitor = Some(p),
                                    Err(e) => {
                                        log.warn(format!("Monitor output disabled: {}", e));
                                        monitor_failed = true;
                                    }
                                }
                            }
                            if let Some(p) = &monitor {
                                if let Err(e) = p.play_file(&path) {
                                    log.warn(format!("Monitor playback failed: {}", e));
                                }
                            }
                        }
                        status.start(pump.total);
                        log.debug(format!(
                            "Streaming {} ({} bytes at {:.0} B/s)",
                            path.display(),
                            pump.len,
                            pump.byte_rate
                        ));
                        current = Some(pump);
                        let _ = ack.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = ack.send(Err(format!("Cannot open '{}': {}", path.display(), e)));
                    }
                }
            }

            Ok(AudioCmd::Stop) => {
                current = None;
                if let Some(p) = &monitor {
                    p.stop();
                }
                status.finish();
            }

            Ok(AudioCmd::Pause) => {
                if let Some(pump) = current.as_mut() {
                    pump.pause();
                    status.paused.store(true, Ordering::SeqCst);
                }
                if let Some(p) = &monitor {
                    p.pause();
                }
            }

            Ok(AudioCmd::Resume) => {
                if let Some(pump) = current.as_mut() {
                    pump.resume();
                    status.paused.store(false, Ordering::SeqCst);
                }
                if let Some(p) = &monitor {
                    p.resume();
                }
            }

            Ok(AudioCmd::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(p) = &monitor {
                    p.stop();
                }
                status.finish();
                break;
            }

            Err(RecvTimeoutError::Timeout) => {}
        }

        let Some(pump) = current.as_mut() else {
            continue;
        };
        match pump.pump(sessions) {
            Ok(false) => status.set_position(pump.position()),
            Ok(true) => {
                status.set_position(pump.total);
                status.finish();
                current = None;
            }
            Err(e) => {
                log.error(format!("Read error while streaming: {}", e));
                status.finish();
                current = None;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn(fallback_byte_rate: u64) -> (AudioHandle, JoinHandle<()>, Arc<SessionRegistry>, Arc<RuntimeStatus>) {
        let sessions = Arc::new(SessionRegistry::new());
        let status = Arc::new(RuntimeStatus::default());
        let (handle, thread) = spawn_audio_runtime(
            sessions.clone(),
            status.clone(),
            RuntimeOptions {
                monitor: false,
                fallback_byte_rate,
            },
            &LogContext::default(),
        )
        .unwrap();
        (handle, thread, sessions, status)
    }

    #[test]
    fn handle_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AudioHandle>();
    }

    #[test]
    fn shutdown_stops_thread() {
        let (handle, thread, _, _) = spawn(16_000);
        handle.shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn play_nonexistent_reports_error() {
        let (handle, thread, _, status) = spawn(16_000);
        let result = handle.play(
            PathBuf::from("__nonexistent_file__.mp3"),
            Duration::from_secs(1),
            Duration::from_secs(2),
        );
        assert!(result.is_err());
        assert!(!status.is_playing());
        handle.shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn streams_whole_file_to_sessions_then_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.mp3");
        let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let (handle, thread, sessions, status) = spawn(16_000);
        let (_id, rx) = sessions.register();
        handle
            .play(path, Duration::from_millis(200), Duration::from_secs(2))
            .unwrap();
        assert!(status.is_playing());

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        while received.len() < data.len() && Instant::now() < deadline {
            if let Ok(chunk) = rx.recv_timeout(Duration::from_millis(100)) {
                received.extend_from_slice(&chunk);
            }
        }
        assert_eq!(received, data);

        let deadline = Instant::now() + Duration::from_secs(2);
        while status.is_playing() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!status.is_playing());
        assert_eq!(status.total(), Duration::from_millis(200));

        handle.shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn pause_holds_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.mp3");
        std::fs::write(&path, vec![0u8; 1000]).unwrap();

        let (handle, thread, _, status) = spawn(16_000);
        handle
            .play(path, Duration::from_secs(60), Duration::from_secs(2))
            .unwrap();
        handle.pause();
        std::thread::sleep(Duration::from_millis(150));
        assert!(status.is_paused());
        let held = status.position();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(status.position(), held);
        assert!(status.is_playing());

        handle.resume();
        handle.stop();
        std::thread::sleep(Duration::from_millis(150));
        assert!(!status.is_playing());

        handle.shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn registry_drops_closed_sessions() {
        let registry = SessionRegistry::new();
        let (_a, rx_a) = registry.register();
        let (b, _rx_b) = registry.register();
        drop(rx_a);
        registry.broadcast(b"abc");
        assert_eq!(registry.len(), 1);
        registry.remove(b);
        assert!(registry.is_empty());
    }
}
