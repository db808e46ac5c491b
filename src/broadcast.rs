//! One outbound stream to one server mount: connect, watch, reconnect.
//!
//! A monitor thread asks the server's status document every interval
//! whether our mount is listed. An absent mount starts (or continues) an
//! outage and triggers exactly one full reconnect per tick; the outage ends
//! on the first successful reconnect or on the first tick that sees the
//! mount again, and ending it emits one `ConnectionRestored`.

use crate::engine::{AudioEngine, CastParams, Encoder, EncoderSettings};
use crate::error::{CastError, lock_or_recover};
use crate::events::{BroadcastEvent, EventBus};
use crate::http;
use crate::logging::LogContext;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// ── Destination ──────────────────────────────────────────────────────────────

fn default_port() -> u16 {
    8000
}

fn default_username() -> String {
    "source".to_string()
}

fn default_stream_name() -> String {
    "onair".to_string()
}

fn default_status_path() -> String {
    "/status-json.xsl".to_string()
}

/// A streaming server mount we push audio to. The mount is the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastDestination {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub mount: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default = "default_status_path")]
    pub status_path: String,
    #[serde(default)]
    pub encoder: EncoderSettings,
}

impl BroadcastDestination {
    pub fn new(host: &str, port: u16, mount: &str) -> Self {
        BroadcastDestination {
            host: host.to_string(),
            port,
            mount: mount.to_string(),
            username: default_username(),
            password: String::new(),
            stream_name: default_stream_name(),
            genre: String::new(),
            description: String::new(),
            public: false,
            status_path: default_status_path(),
            encoder: EncoderSettings::default(),
        }
    }

    /// Mount with exactly one leading `/`.
    pub fn mount_path(&self) -> String {
        format!("/{}", self.mount.trim_start_matches('/'))
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.mount_path())
    }

    pub fn status_url(&self) -> String {
        format!(
            "http://{}:{}/{}",
            self.host,
            self.port,
            self.status_path.trim_start_matches('/')
        )
    }

    pub fn cast_params(&self) -> CastParams {
        CastParams {
            host: self.host.clone(),
            port: self.port,
            mount: self.mount_path(),
            username: self.username.clone(),
            password: self.password.clone(),
            content_type: self.encoder.content_type.clone(),
            name: self.stream_name.clone(),
            genre: self.genre.clone(),
            description: self.description.clone(),
            bitrate_kbps: self.encoder.bitrate_kbps,
            public: self.public,
        }
    }
}

// ── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Outage bookkeeping: attempt counter plus downtime clock.
#[derive(Debug, Default)]
pub struct ReconnectTracker {
    attempts: u32,
    down_since: Option<Instant>,
}

impl ReconnectTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mount was absent on a tick. Returns the attempt number to make.
    pub fn on_absent(&mut self) -> u32 {
        if self.down_since.is_none() {
            self.down_since = Some(Instant::now());
            self.attempts = 1;
        } else {
            self.attempts = self.attempts.saturating_add(1);
        }
        self.attempts
    }

    /// The stream is back. Returns the outage length if one was in progress.
    pub fn on_recovered(&mut self) -> Option<Duration> {
        self.attempts = 0;
        self.down_since.take().map(|since| since.elapsed())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn in_outage(&self) -> bool {
        self.down_since.is_some()
    }

    /// Time since the outage began, zero when none is in progress.
    pub fn downtime(&self) -> Duration {
        self.down_since.map(|t| t.elapsed()).unwrap_or_default()
    }
}

// ── Status probe ─────────────────────────────────────────────────────────────

/// Fetches a destination's status document. `None` means unreachable.
pub trait StatusProbe: Send + Sync {
    fn fetch_status(&self, destination: &BroadcastDestination) -> Option<String>;
}

pub struct HttpStatusProbe {
    agent: ureq::Agent,
}

impl HttpStatusProbe {
    pub fn new() -> Self {
        HttpStatusProbe {
            agent: http::agent(http::HTTP_TIMEOUT),
        }
    }
}

impl Default for HttpStatusProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusProbe for HttpStatusProbe {
    fn fetch_status(&self, destination: &BroadcastDestination) -> Option<String> {
        let mut response = self.agent.get(&destination.status_url()).call().ok()?;
        response.body_mut().read_to_string().ok()
    }
}

/// True when the status document lists `mount` (which starts with `/`).
pub fn mount_present(status: &str, mount: &str) -> bool {
    status.contains(mount)
}

/// Listener count from the first `"listeners":` key of a status document.
pub fn parse_listeners(status: &str) -> Option<u32> {
    const KEY: &str = "\"listeners\":";
    let start = status.find(KEY)? + KEY.len();
    let rest = &status[start..];
    let end = rest.find([',', '}'])?;
    rest[..end].trim().parse().ok()
}

// ── Connection ───────────────────────────────────────────────────────────────

/// Timing knobs. Defaults: 10 s monitor interval, 2 s busy backoff doubling
/// up to 8 s, 3 busy retries, 1 s dispose join.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub monitor_interval: Duration,
    pub busy_backoff: Duration,
    pub busy_backoff_cap: Duration,
    pub max_busy_retries: u32,
    pub dispose_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            monitor_interval: Duration::from_secs(10),
            busy_backoff: Duration::from_secs(2),
            busy_backoff_cap: Duration::from_secs(8),
            max_busy_retries: 3,
            dispose_timeout: Duration::from_secs(1),
        }
    }
}

/// Read-only snapshot for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub mount: String,
    pub url: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub listeners: u32,
    pub peak_listeners: u32,
    pub reconnect_attempts: u32,
    #[serde(with = "secs")]
    pub reconnect_time: Duration,
}

mod secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

const SESSION_POLL: Duration = Duration::from_millis(10);

struct Session {
    encoder: Option<Box<dyn Encoder>>,
}

impl Session {
    fn close(&mut self) {
        if let Some(mut encoder) = self.encoder.take() {
            encoder.close();
        }
    }
}

struct MonitorHandle {
    done: Receiver<()>,
    thread: JoinHandle<()>,
}

struct Inner {
    destination: BroadcastDestination,
    engine: Arc<dyn AudioEngine>,
    probe: Arc<dyn StatusProbe>,
    options: ConnectionOptions,
    events: EventBus<BroadcastEvent>,
    /// Instance lock: connect attempts, metadata pushes and dispose.
    session: Mutex<Session>,
    state: Mutex<ConnectionState>,
    tracker: Mutex<ReconnectTracker>,
    connected: AtomicBool,
    disposed: AtomicBool,
    listeners: AtomicU32,
    peak_listeners: AtomicU32,
    /// Dropped on dispose; every wait on `stop_rx` then returns at once.
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    log: LogContext,
}

/// One live stream to one destination.
pub struct BroadcastConnection {
    inner: Arc<Inner>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl BroadcastConnection {
    pub fn new(
        destination: BroadcastDestination,
        engine: Arc<dyn AudioEngine>,
        probe: Arc<dyn StatusProbe>,
        options: ConnectionOptions,
        log: &LogContext,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded(1);
        BroadcastConnection {
            inner: Arc::new(Inner {
                destination,
                engine,
                probe,
                options,
                events: EventBus::new(),
                session: Mutex::new(Session { encoder: None }),
                state: Mutex::new(ConnectionState::Disconnected),
                tracker: Mutex::new(ReconnectTracker::new()),
                connected: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                listeners: AtomicU32::new(0),
                peak_listeners: AtomicU32::new(0),
                stop_tx: Mutex::new(Some(stop_tx)),
                stop_rx,
                log: log.for_component("broadcast"),
            }),
            monitor: Mutex::new(None),
        }
    }

    pub fn destination(&self) -> &BroadcastDestination {
        &self.inner.destination
    }

    pub fn events(&self) -> &EventBus<BroadcastEvent> {
        &self.inner.events
    }

    pub fn subscribe(&self) -> Receiver<BroadcastEvent> {
        self.inner.events.subscribe()
    }

    /// Connect once, then start monitoring. Connection failures are logged
    /// and left to the monitor.
    pub fn initialize(&self) {
        let inner = &self.inner;
        if inner.is_disposed() {
            return;
        }
        inner.log.info(format!("Initializing stream to {}", inner.destination.url()));
        inner.connect();
        self.start_monitor();
    }

    fn start_monitor(&self) {
        let mut monitor = lock_or_recover(&self.monitor);
        if monitor.is_some() || self.inner.is_disposed() {
            return;
        }
        let (done_tx, done_rx) = bounded(1);
        let inner = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("monitor{}", inner.destination.mount_path().replace('/', "-")))
            .spawn(move || monitor_loop(&inner, &done_tx));
        match spawned {
            Ok(thread) => {
                *monitor = Some(MonitorHandle {
                    done: done_rx,
                    thread,
                });
            }
            Err(e) => self
                .inner
                .log
                .error(format!("Cannot start monitor thread: {}", e)),
        }
    }

    /// Push "artist - title". False when disposed, not connected, or the
    /// server refused.
    pub fn set_metadata(&self, artist: &str, title: &str) -> bool {
        let inner = &self.inner;
        let mut session = lock_or_recover(&inner.session);
        if inner.is_disposed() || !inner.connected.load(Ordering::SeqCst) {
            return false;
        }
        let Some(encoder) = session.encoder.as_mut() else {
            return false;
        };
        let pushed = encoder.set_metadata(artist, title);
        if inner.is_disposed() {
            // dispose() gave up waiting for this push.
            session.close();
            return false;
        }
        match pushed {
            Ok(()) => {
                inner.log.debug(format!(
                    "Metadata on {}: {} - {}",
                    inner.destination.mount_path(),
                    artist,
                    title
                ));
                true
            }
            Err(e) => {
                inner.log.error(format!("Metadata update failed: {}", e));
                false
            }
        }
    }

    /// Stop monitoring and release the encoder. Idempotent, and bounded by
    /// `dispose_timeout` even while a handshake or status fetch hangs.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock_or_recover(&inner.stop_tx).take();
        let deadline = Instant::now() + inner.options.dispose_timeout;

        if let Some(monitor) = lock_or_recover(&self.monitor).take() {
            match monitor.done.recv_timeout(inner.options.dispose_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = monitor.thread.join();
                }
                Err(RecvTimeoutError::Timeout) => inner
                    .log
                    .warn("Monitor thread did not stop in time; detaching"),
            }
        }

        match inner.lock_session_until(deadline) {
            Some(mut session) => session.close(),
            None => inner
                .log
                .warn("Session busy past the dispose timeout; it closes itself when done"),
        }
        inner.connected.store(false, Ordering::SeqCst);
        inner.set_state(ConnectionState::Disconnected);
        inner.log.info(format!(
            "Stream to {} stopped",
            inner.destination.mount_path()
        ));
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub fn state(&self) -> ConnectionState {
        *lock_or_recover(&self.inner.state)
    }

    pub fn listeners(&self) -> u32 {
        self.inner.listeners.load(Ordering::SeqCst)
    }

    pub fn peak_listeners(&self) -> u32 {
        self.inner.peak_listeners.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        lock_or_recover(&self.inner.tracker).attempts()
    }

    pub fn current_reconnect_time(&self) -> Duration {
        lock_or_recover(&self.inner.tracker).downtime()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            mount: self.inner.destination.mount_path(),
            url: self.inner.destination.url(),
            state: self.state(),
            connected: self.is_connected(),
            listeners: self.listeners(),
            peak_listeners: self.peak_listeners(),
            reconnect_attempts: self.reconnect_attempts(),
            reconnect_time: self.current_reconnect_time(),
        }
    }

    /// Run one monitor tick on the calling thread.
    pub fn check_now(&self) {
        if !self.inner.is_disposed() {
            self.inner.tick();
        }
    }
}

impl Drop for BroadcastConnection {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn monitor_loop(inner: &Inner, done: &Sender<()>) {
    inner.log.info(format!(
        "Monitoring {} every {}s",
        inner.destination.mount_path(),
        inner.options.monitor_interval.as_secs_f32()
    ));
    while inner.wait(inner.options.monitor_interval) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| inner.tick()));
        if result.is_err() {
            inner.log.error("Monitor tick panicked, pausing before next check");
            if !inner.wait(inner.options.monitor_interval) {
                break;
            }
        }
    }
    inner.log.info(format!(
        "Monitoring of {} stopped",
        inner.destination.mount_path()
    ));
    let _ = done.send(());
}

impl Inner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`. False if the connection is being disposed.
    fn wait(&self, timeout: Duration) -> bool {
        match self.stop_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => !self.is_disposed(),
            _ => false,
        }
    }

    /// The session lock, or `None` if it is still held at `deadline`. A
    /// holder that outlives the deadline sees `disposed` and cleans up.
    fn lock_session_until(&self, deadline: Instant) -> Option<MutexGuard<'_, Session>> {
        loop {
            match self.session.try_lock() {
                Ok(session) => return Some(session),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => {
                    std::thread::sleep(SESSION_POLL);
                }
                Err(TryLockError::WouldBlock) => return None,
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *lock_or_recover(&self.state) = state;
    }

    fn emit_restored(&self, downtime: Duration) {
        self.events.broadcast(BroadcastEvent::ConnectionRestored {
            mount: self.destination.mount_path(),
            downtime,
        });
    }

    /// One full connect attempt, retrying while the resource is busy.
    fn connect(&self) -> bool {
        let mut session = lock_or_recover(&self.session);
        if self.is_disposed() {
            return false;
        }
        self.set_state(ConnectionState::Connecting);
        let params = self.destination.cast_params();
        self.log.info(format!("Connecting to {}", params.url()));

        let mut backoff = self.options.busy_backoff;
        let mut busy_retries = 0;
        loop {
            session.close();
            let mut encoder = self.engine.create_encoder(&self.destination.encoder);
            match encoder.cast_init(&params) {
                Ok(()) if self.is_disposed() => {
                    encoder.close();
                    self.log.info(format!(
                        "Disposed during handshake, dropping {}",
                        params.url()
                    ));
                    return false;
                }
                Ok(()) => {
                    session.encoder = Some(encoder);
                    self.connected.store(true, Ordering::SeqCst);
                    self.set_state(ConnectionState::Connected);
                    self.log.info(format!("Connected to {}", params.url()));
                    return true;
                }
                Err(CastError::Busy) if busy_retries < self.options.max_busy_retries => {
                    encoder.close();
                    busy_retries += 1;
                    self.log.warn(format!(
                        "Resources busy, retry {}/{} in {:.1}s",
                        busy_retries,
                        self.options.max_busy_retries,
                        backoff.as_secs_f32()
                    ));
                    if !self.wait(backoff) {
                        return self.connect_failed();
                    }
                    backoff = (backoff * 2).min(self.options.busy_backoff_cap);
                }
                Err(e) => {
                    encoder.close();
                    self.log
                        .error(format!("Failed to connect to {}: {}", params.url(), e));
                    return self.connect_failed();
                }
            }
        }
    }

    fn connect_failed(&self) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        if self.is_disposed() {
            return false;
        }
        let state = if lock_or_recover(&self.tracker).in_outage() {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Disconnected
        };
        self.set_state(state);
        false
    }

    fn tick(&self) {
        let mount = self.destination.mount_path();
        let status = self.probe.fetch_status(&self.destination);
        if self.is_disposed() {
            return;
        }
        let present = status.as_deref().is_some_and(|s| mount_present(s, &mount));

        if present {
            if let Some(count) = status.as_deref().and_then(parse_listeners) {
                self.listeners.store(count, Ordering::SeqCst);
                self.peak_listeners.fetch_max(count, Ordering::SeqCst);
            }
            let was_connected = self.connected.swap(true, Ordering::SeqCst);
            let recovered = lock_or_recover(&self.tracker).on_recovered();
            if !was_connected {
                self.set_state(ConnectionState::Connected);
                self.log
                    .info(format!("Connection to {} restored (detected by status check)", mount));
            }
            if let Some(downtime) = recovered {
                self.emit_restored(downtime);
            }
            return;
        }

        let attempt = lock_or_recover(&self.tracker).on_absent();
        if attempt == 1 {
            self.log
                .warn(format!("Connection to {} lost, reconnecting", mount));
            self.events
                .broadcast(BroadcastEvent::ConnectionLost { mount: mount.clone() });
        }
        self.connected.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Reconnecting);
        self.log.info(format!("Reconnect attempt #{} to {}", attempt, mount));

        if self.connect() {
            if let Some(downtime) = lock_or_recover(&self.tracker).on_recovered() {
                self.log.info(format!(
                    "Connection to {} restored in {:.1}s",
                    mount,
                    downtime.as_secs_f32()
                ));
                self.emit_restored(downtime);
            }
        } else {
            self.log.warn(format!(
                "Reconnect attempt #{} to {} failed",
                attempt, mount
            ));
        }
    }
}
