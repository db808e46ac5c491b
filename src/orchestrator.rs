//! The control loop: one playback unit in flight, chosen from the jingle
//! injector or the scheduler, with metadata pushed to every destination.
//!
//! Scheduler, injector and notifier are moved into the loop thread at
//! `start()`; the rest of the program only talks to it through the atomic
//! flags and the now-playing snapshot.

use crate::engine::AudioEngine;
use crate::error::{Result, lock_or_recover};
use crate::events::BroadcastEvent;
use crate::fanout::BroadcastFanout;
use crate::jingle::{JingleInjector, jingle_metadata};
use crate::logging::LogContext;
use crate::notifier::TrackNotifier;
use crate::now_playing::{ItemKind, NowPlaying, PlaybackState};
use crate::scheduler::TrackScheduler;
use crate::spacing::ArtistSpacing;
use crate::track::TrackInfo;
use chrono::{Local, NaiveDateTime};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub type Clock = Box<dyn Fn() -> NaiveDateTime + Send>;

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Re-check interval while paused.
    pub pause_wait: Duration,
    /// Retry interval when there is nothing to play.
    pub idle_wait: Duration,
    /// Back-off after the engine refused a file.
    pub play_failure_backoff: Duration,
    /// Back-off after an unexpected failure in the loop.
    pub error_backoff: Duration,
    /// How often the playing unit is polled.
    pub poll_interval: Duration,
    /// How long `stop()` waits for the loop thread.
    pub stop_timeout: Duration,
    /// Rewritten at every unit start when set.
    pub now_playing_xml: Option<PathBuf>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        OrchestratorOptions {
            pause_wait: Duration::from_millis(250),
            idle_wait: Duration::from_millis(500),
            play_failure_backoff: Duration::from_millis(500),
            error_backoff: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(3),
            now_playing_xml: None,
        }
    }
}

struct Shared {
    running: AtomicBool,
    paused: AtomicBool,
    skip: AtomicBool,
    now_playing: Mutex<NowPlaying>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl Shared {
    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    fn update_now_playing(&self, f: impl FnOnce(&mut NowPlaying)) {
        f(&mut lock_or_recover(&self.now_playing));
    }
}

struct Parts {
    scheduler: TrackScheduler,
    injector: JingleInjector,
    notifier: Option<Box<dyn TrackNotifier>>,
    spacing: Option<ArtistSpacing>,
    clock: Clock,
}

struct LoopHandle {
    done: Receiver<()>,
    thread: JoinHandle<()>,
}

pub struct Orchestrator {
    engine: Arc<dyn AudioEngine>,
    fanout: Arc<BroadcastFanout>,
    shared: Arc<Shared>,
    parts: Mutex<Option<Parts>>,
    handle: Mutex<Option<LoopHandle>>,
    stopped: AtomicBool,
    options: OrchestratorOptions,
    log: LogContext,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn AudioEngine>,
        fanout: Arc<BroadcastFanout>,
        scheduler: TrackScheduler,
        injector: JingleInjector,
        log: &LogContext,
    ) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Orchestrator {
            engine,
            fanout,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                skip: AtomicBool::new(false),
                now_playing: Mutex::new(NowPlaying::default()),
                wake_tx,
                wake_rx,
            }),
            parts: Mutex::new(Some(Parts {
                scheduler,
                injector,
                notifier: None,
                spacing: None,
                clock: Box::new(|| Local::now().naive_local()),
            })),
            handle: Mutex::new(None),
            stopped: AtomicBool::new(false),
            options: OrchestratorOptions::default(),
            log: log.for_component("orchestrator"),
        }
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_notifier(self, notifier: Box<dyn TrackNotifier>) -> Self {
        if let Some(parts) = lock_or_recover(&self.parts).as_mut() {
            parts.notifier = Some(notifier);
        }
        self
    }

    /// Pass over scheduled tracks whose artist or genre played recently.
    pub fn with_spacing(self, spacing: ArtistSpacing) -> Self {
        if let Some(parts) = lock_or_recover(&self.parts).as_mut() {
            parts.spacing = Some(spacing);
        }
        self
    }

    /// Replace the wall clock used for schedule decisions.
    pub fn with_clock(self, clock: Clock) -> Self {
        if let Some(parts) = lock_or_recover(&self.parts).as_mut() {
            parts.clock = clock;
        }
        self
    }

    /// Spawn the control loop. A second call does nothing.
    pub fn start(&self) -> Result<()> {
        let Some(parts) = lock_or_recover(&self.parts).take() else {
            self.log.warn("Orchestrator already started");
            return Ok(());
        };
        let (done_tx, done_rx) = bounded(1);
        let control = ControlLoop {
            parts,
            engine: self.engine.clone(),
            fanout: self.fanout.clone(),
            events: self.fanout.subscribe(),
            shared: self.shared.clone(),
            engine_paused: false,
            options: self.options.clone(),
            log: self.log.clone(),
        };
        self.shared.running.store(true, Ordering::SeqCst);
        let thread = std::thread::Builder::new()
            .name("orchestrator".into())
            .spawn(move || {
                control.run();
                let _ = done_tx.send(());
            });
        match thread {
            Ok(thread) => {
                *lock_or_recover(&self.handle) = Some(LoopHandle {
                    done: done_rx,
                    thread,
                });
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Stop the loop (bounded wait), then stop the engine and dispose the
    /// fanout regardless of how the loop ended. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.log.info("Stopping");
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake();

        if let Some(handle) = lock_or_recover(&self.handle).take() {
            match handle.done.recv_timeout(self.options.stop_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = handle.thread.join();
                }
                Err(RecvTimeoutError::Timeout) => self
                    .log
                    .warn("Control loop did not stop in time; forcing shutdown"),
            }
        }

        self.engine.stop();
        self.fanout.dispose();
        self.shared
            .update_now_playing(|np| np.clear_item(PlaybackState::Stopped));
        self.log.info("Stopped");
    }

    /// End the current unit and move on.
    pub fn skip(&self) {
        self.shared.skip.store(true, Ordering::SeqCst);
        self.shared.wake();
        self.log.info("Skipping to next track");
    }

    /// Returns the new paused state. The loop thread applies it to the
    /// engine, so a unit that is still starting is paused once it is up.
    pub fn toggle_pause(&self) -> bool {
        let paused = !self.shared.paused.fetch_xor(true, Ordering::SeqCst);
        if paused {
            self.log.info("Playback paused");
        } else {
            self.log.info("Playback resumed");
        }
        self.shared.wake();
        paused
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn now_playing(&self) -> NowPlaying {
        lock_or_recover(&self.shared.now_playing).clone()
    }

    pub fn fanout(&self) -> &BroadcastFanout {
        &self.fanout
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if lock_or_recover(&self.handle).is_some() {
            self.stop();
        }
    }
}

/// State owned by the loop thread.
struct ControlLoop {
    parts: Parts,
    engine: Arc<dyn AudioEngine>,
    fanout: Arc<BroadcastFanout>,
    events: Receiver<BroadcastEvent>,
    shared: Arc<Shared>,
    /// Pause state last applied to the engine.
    engine_paused: bool,
    options: OrchestratorOptions,
    log: LogContext,
}

impl ControlLoop {
    fn running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Bring the engine and the snapshot in line with the paused flag.
    fn sync_pause(&mut self) {
        let paused = self.paused();
        if paused == self.engine_paused {
            return;
        }
        if paused {
            self.engine.pause();
        } else {
            self.engine.resume();
        }
        self.engine_paused = paused;
        self.shared.update_now_playing(|np| {
            if np.kind.is_some() {
                np.state = if paused {
                    PlaybackState::Paused
                } else {
                    PlaybackState::Playing
                };
            }
        });
    }

    /// Sleep up to `timeout`, waking early on control input.
    fn wait(&self, timeout: Duration) {
        let _ = self.shared.wake_rx.recv_timeout(timeout);
    }

    fn run(mut self) {
        self.log.info("Control loop started");
        while self.running() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.run_once()));
            if result.is_err() {
                self.log.error(format!(
                    "Control loop failed, retrying in {:.1}s",
                    self.options.error_backoff.as_secs_f32()
                ));
                self.wait(self.options.error_backoff);
            }
        }
        self.log.info("Control loop stopped");
    }

    /// Choose, start and follow one playback unit.
    fn run_once(&mut self) {
        self.sync_pause();
        if self.paused() {
            self.drain_events();
            self.wait(self.options.pause_wait);
            return;
        }

        let now = (self.parts.clock)();
        if self.parts.scheduler.check_and_update(now) {
            let info = self.parts.scheduler.current_schedule_info();
            self.shared.update_now_playing(|np| np.schedule = info);
        }

        let Some((path, kind)) = self.next_unit() else {
            self.drain_events();
            self.shared
                .update_now_playing(|np| np.clear_item(PlaybackState::Idle));
            self.wait(self.options.idle_wait);
            return;
        };

        self.shared.skip.store(false, Ordering::SeqCst);
        self.log.debug(format!("Playing {}", path.display()));
        let Some(info) = self.engine.play_track(&path) else {
            self.log
                .error(format!("Failed to play {}, skipping", path.display()));
            if kind == ItemKind::Jingle {
                // Give the slot up rather than retrying a broken jingle forever.
                self.parts.injector.on_jingle_started();
            }
            self.wait(self.options.play_failure_backoff);
            return;
        };

        if !self.running() {
            // stop() gave up waiting while the engine was still starting.
            self.engine.stop();
            return;
        }
        self.engine_paused = false;
        self.on_unit_started(info, kind);
        self.sync_pause();
        self.follow_unit();
    }

    fn next_unit(&mut self) -> Option<(PathBuf, ItemKind)> {
        if let Some(jingle) = self.parts.injector.next_jingle() {
            return Some((jingle, ItemKind::Jingle));
        }
        let scheduler = &mut self.parts.scheduler;
        let track = match self.parts.spacing.as_mut() {
            Some(spacing) => spacing.pick(|| scheduler.next_track()),
            None => scheduler.next_track(),
        };
        track.map(|path| (path, ItemKind::Track))
    }

    fn on_unit_started(&mut self, mut info: TrackInfo, kind: ItemKind) {
        match kind {
            ItemKind::Jingle => {
                self.parts.injector.on_jingle_started();
                let (artist, title) = jingle_metadata(&info.path);
                info.artist = artist;
                info.title = title;
                self.log.info(format!("Jingle: {}", info.title));
            }
            ItemKind::Track => {
                self.parts.injector.on_track_played();
                self.log.info(format!("Now playing: {}", info));
            }
        }

        if !self.fanout.set_metadata(&info.artist, &info.title) {
            self.log.debug("No destination accepted metadata");
        }

        let number = self.parts.scheduler.current_track_number();
        if kind == ItemKind::Track {
            if let Some(notifier) = &self.parts.notifier {
                notifier.notify(number, &info);
            }
        }

        let since_jingle = self.parts.injector.counter();
        let schedule = self.parts.scheduler.current_schedule_info();
        let snapshot = {
            let mut np = lock_or_recover(&self.shared.now_playing);
            np.start_item(&info, kind, Local::now());
            np.track_number = number;
            np.tracks_since_jingle = since_jingle;
            np.schedule = schedule;
            np.clone()
        };
        if let Some(path) = &self.options.now_playing_xml {
            if let Err(e) = snapshot.write_xml(path) {
                self.log.warn(format!("Cannot write now-playing file: {}", e));
            }
        }
    }

    /// Poll until the unit ends, a skip is requested or the loop stops.
    /// Pausing holds the current unit.
    fn follow_unit(&mut self) {
        loop {
            if self.drain_events() {
                self.log
                    .info("Stream restored, restarting on the next track");
                self.shared.skip.store(true, Ordering::SeqCst);
            }
            if !self.running() || self.shared.skip.swap(false, Ordering::SeqCst) {
                return;
            }
            self.sync_pause();
            if self.paused() {
                self.wait(self.options.pause_wait);
                continue;
            }
            if !self.engine.is_playing() {
                return;
            }
            let elapsed = self.engine.current_time();
            self.shared
                .update_now_playing(|np| np.elapsed = Some(elapsed));
            self.wait(self.options.poll_interval);
        }
    }

    /// Handle pending fanout events. True if any stream was restored.
    fn drain_events(&self) -> bool {
        let mut restored = false;
        for event in self.events.try_iter() {
            match event {
                BroadcastEvent::ConnectionRestored { mount, downtime } => {
                    self.log.info(format!(
                        "{} back on air after {:.1}s",
                        mount,
                        downtime.as_secs_f32()
                    ));
                    restored = true;
                }
                BroadcastEvent::ConnectionLost { mount } => {
                    self.log.warn(format!("{} went off air", mount));
                }
            }
        }
        restored
    }
}
