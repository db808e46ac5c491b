use crate::logging::LogContext;
use crate::playlist::{PlaylistLoader, TrackSource};
use crate::schedule::{ScheduleConfig, ScheduleItem};
use chrono::{Datelike, Duration as ChronoDuration, NaiveDateTime};
use serde::Serialize;
use std::path::PathBuf;

/// A playlist whose load failed is not retried more often than this.
const FAILED_LOAD_RETRY_SECS: i64 = 60;

/// Name used for the playlist in fixed mode.
pub const FIXED_PLAYLIST_NAME: &str = "Fixed playlist";

/// What the scheduler is currently playing from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleInfo {
    pub name: String,
    pub playlist_path: PathBuf,
    /// "HH:MM-HH:MM", empty in fixed mode.
    pub window: String,
    pub track_count: usize,
}

/// A schedule window that opens later on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpcomingWindow {
    pub name: String,
    pub playlist_path: PathBuf,
    pub starts_at: NaiveDateTime,
}

struct ActivePlaylist {
    item: ScheduleItem,
    source: Box<dyn TrackSource>,
}

enum Mode {
    Scheduled {
        config: ScheduleConfig,
        loader: Box<dyn PlaylistLoader>,
    },
    Fixed,
}

/// Resolves which playlist is active and hands out its next track.
///
/// Owned by the orchestrator thread; never shared.
pub struct TrackScheduler {
    mode: Mode,
    active: Option<ActivePlaylist>,
    failed: Option<(ScheduleItem, NaiveDateTime)>,
    log: LogContext,
}

impl TrackScheduler {
    pub fn new(config: ScheduleConfig, loader: Box<dyn PlaylistLoader>, log: &LogContext) -> Self {
        TrackScheduler {
            mode: Mode::Scheduled { config, loader },
            active: None,
            failed: None,
            log: log.for_component("scheduler"),
        }
    }

    /// Scheduling disabled: always play from `source`.
    pub fn fixed(source: Box<dyn TrackSource>, playlist_path: impl Into<PathBuf>, log: &LogContext) -> Self {
        let item = ScheduleItem {
            name: FIXED_PLAYLIST_NAME.to_string(),
            playlist_path: playlist_path.into(),
            start_hour: 0,
            start_minute: 0,
            end_hour: 0,
            end_minute: 0,
            days_of_week: vec![crate::schedule::ALL_DAYS.to_string()],
        };
        TrackScheduler {
            mode: Mode::Fixed,
            active: Some(ActivePlaylist { item, source }),
            failed: None,
            log: log.for_component("scheduler"),
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.mode, Mode::Fixed)
    }

    /// True when no playlist is active.
    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    /// Re-evaluate the schedule at `now`. Returns true when the active
    /// playlist changed (including a switch to idle).
    pub fn check_and_update(&mut self, now: NaiveDateTime) -> bool {
        let Mode::Scheduled { config, loader } = &self.mode else {
            return false;
        };

        let Some(item) = config.active_at(now) else {
            self.failed = None;
            if let Some(previous) = self.active.take() {
                self.log.info(format!(
                    "No schedule window active, leaving '{}' (idle)",
                    previous.item.name
                ));
                return true;
            }
            return false;
        };

        let same = |other: &ScheduleItem| {
            other.name == item.name && other.playlist_path == item.playlist_path
        };

        if self.active.as_ref().is_some_and(|a| same(&a.item)) {
            return false;
        }
        if let Some((failed_item, at)) = &self.failed {
            if same(failed_item) && (now - *at).num_seconds() < FAILED_LOAD_RETRY_SECS {
                return false;
            }
        }

        match loader.load(&item.playlist_path) {
            Ok(source) => {
                self.log.info(format!(
                    "Switching to '{}' ({}, {} tracks)",
                    item.name,
                    item.playlist_path.display(),
                    source.track_count()
                ));
                self.active = Some(ActivePlaylist {
                    item: item.clone(),
                    source,
                });
                self.failed = None;
                true
            }
            Err(e) => {
                self.log.error(format!(
                    "Failed to load playlist for '{}': {}",
                    item.name, e
                ));
                self.failed = Some((item.clone(), now));
                false
            }
        }
    }

    /// Next track from the active playlist, or None while idle.
    pub fn next_track(&mut self) -> Option<PathBuf> {
        let active = self.active.as_mut()?;
        let track = active.source.random_track();
        if track.is_none() {
            self.log
                .warn(format!("Playlist '{}' returned no track", active.item.name));
        }
        track
    }

    /// 1-based position of the last track handed out, 0 if unknown.
    pub fn current_track_number(&self) -> usize {
        self.active
            .as_ref()
            .and_then(|a| a.source.current_index())
            .map_or(0, |i| i + 1)
    }

    pub fn current_schedule_info(&self) -> Option<ScheduleInfo> {
        let active = self.active.as_ref()?;
        Some(ScheduleInfo {
            name: active.item.name.clone(),
            playlist_path: active.item.playlist_path.clone(),
            window: if self.is_fixed() {
                String::new()
            } else {
                active.item.window_display()
            },
            track_count: active.source.track_count(),
        })
    }

    /// Up to `count` window openings after `now`, soonest first, looking one
    /// week ahead.
    pub fn upcoming(&self, now: NaiveDateTime, count: usize) -> Vec<UpcomingWindow> {
        let Mode::Scheduled { config, .. } = &self.mode else {
            return Vec::new();
        };
        let mut windows: Vec<UpcomingWindow> = Vec::new();
        for offset in 0..=7 {
            let date = now.date() + ChronoDuration::days(offset);
            for item in &config.schedule_items {
                if !item.matches_day(date.weekday()) {
                    continue;
                }
                let starts_at = date.and_time(item.start_time());
                if starts_at > now {
                    windows.push(UpcomingWindow {
                        name: item.name.clone(),
                        playlist_path: item.playlist_path.clone(),
                        starts_at,
                    });
                }
            }
        }
        windows.sort_by_key(|w| w.starts_at);
        windows.truncate(count);
        windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::playlist::Playlist;
    use chrono::NaiveDate;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    /// Loader serving single-track playlists named after the playlist path.
    #[derive(Clone, Default)]
    struct StubLoader {
        loads: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl PlaylistLoader for StubLoader {
        fn load(&self, path: &Path) -> Result<Box<dyn TrackSource>> {
            self.loads.lock().unwrap().push(path.to_path_buf());
            if path.to_string_lossy().contains("broken") {
                return Err(Error::playlist(path, "no tracks found"));
            }
            let track = path.with_extension("mp3");
            Ok(Box::new(Playlist::from_tracks(path, vec![track], LogContext::default())))
        }
    }

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        // January 2024: the 1st is a Monday.
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn day_and_evening() -> ScheduleConfig {
        ScheduleConfig::new(vec![
            ScheduleItem::new("Day", "/lists/a.pls", (6, 0), (18, 0), &["*"]),
            ScheduleItem::new("Evening", "/lists/b.pls", (18, 0), (23, 0), &["*"]),
        ])
    }

    #[test]
    fn switches_playlist_at_window_boundary() {
        let loader = StubLoader::default();
        let mut sched = TrackScheduler::new(day_and_evening(), Box::new(loader.clone()), &LogContext::default());

        assert!(sched.check_and_update(at(1, 17, 59)));
        assert_eq!(sched.next_track(), Some(PathBuf::from("/lists/a.mp3")));

        // Same window again: no reload.
        assert!(!sched.check_and_update(at(1, 17, 59)));

        assert!(sched.check_and_update(at(1, 18, 0)));
        assert_eq!(sched.next_track(), Some(PathBuf::from("/lists/b.mp3")));
        assert_eq!(
            *loader.loads.lock().unwrap(),
            vec![PathBuf::from("/lists/a.pls"), PathBuf::from("/lists/b.pls")]
        );
    }

    #[test]
    fn idle_when_no_window_matches() {
        let mut sched = TrackScheduler::new(day_and_evening(), Box::new(StubLoader::default()), &LogContext::default());
        assert!(!sched.check_and_update(at(1, 3, 0)));
        assert!(sched.is_idle());
        assert_eq!(sched.next_track(), None);

        sched.check_and_update(at(1, 12, 0));
        assert!(!sched.is_idle());
        assert!(sched.check_and_update(at(1, 23, 30)));
        assert!(sched.is_idle());
        assert_eq!(sched.current_schedule_info(), None);
    }

    #[test]
    fn failed_load_keeps_previous_playlist() {
        let config = ScheduleConfig::new(vec![
            ScheduleItem::new("Day", "/lists/a.pls", (6, 0), (18, 0), &["*"]),
            ScheduleItem::new("Broken", "/lists/broken.pls", (18, 0), (23, 0), &["*"]),
        ]);
        let loader = StubLoader::default();
        let mut sched = TrackScheduler::new(config, Box::new(loader.clone()), &LogContext::default());

        sched.check_and_update(at(1, 17, 0));
        assert!(!sched.check_and_update(at(1, 18, 0)));
        assert_eq!(sched.current_schedule_info().unwrap().name, "Day");
        assert_eq!(sched.next_track(), Some(PathBuf::from("/lists/a.mp3")));

        // Not retried until the back-off passes.
        sched.check_and_update(at(1, 18, 0));
        assert_eq!(loader.loads.lock().unwrap().len(), 2);
        sched.check_and_update(at(1, 18, 1));
        assert_eq!(loader.loads.lock().unwrap().len(), 3);
    }

    #[test]
    fn reload_when_playlist_path_changes_under_same_name() {
        let loader = StubLoader::default();
        let first = ScheduleConfig::new(vec![ScheduleItem::new("Show", "/lists/a.pls", (0, 0), (23, 59), &["*"])]);
        let mut sched = TrackScheduler::new(first, Box::new(loader.clone()), &LogContext::default());
        sched.check_and_update(at(1, 10, 0));

        if let Mode::Scheduled { config, .. } = &mut sched.mode {
            config.schedule_items[0].playlist_path = PathBuf::from("/lists/c.pls");
        }
        assert!(sched.check_and_update(at(1, 10, 1)));
        assert_eq!(sched.next_track(), Some(PathBuf::from("/lists/c.mp3")));
    }

    #[test]
    fn fixed_mode_ignores_clock() {
        let source = Playlist::from_tracks("/music/all.pls", vec![PathBuf::from("/music/x.mp3")], LogContext::default());
        let mut sched = TrackScheduler::fixed(Box::new(source), "/music/all.pls", &LogContext::default());
        assert!(sched.is_fixed());
        assert!(!sched.check_and_update(at(1, 3, 0)));
        assert_eq!(sched.next_track(), Some(PathBuf::from("/music/x.mp3")));

        let info = sched.current_schedule_info().unwrap();
        assert_eq!(info.name, FIXED_PLAYLIST_NAME);
        assert_eq!(info.window, "");
        assert_eq!(info.track_count, 1);
        assert!(sched.upcoming(at(1, 3, 0), 5).is_empty());
    }

    #[test]
    fn current_info_reports_window() {
        let mut sched = TrackScheduler::new(day_and_evening(), Box::new(StubLoader::default()), &LogContext::default());
        sched.check_and_update(at(1, 19, 0));
        let info = sched.current_schedule_info().unwrap();
        assert_eq!(info.name, "Evening");
        assert_eq!(info.window, "18:00-23:00");
        assert_eq!(info.track_count, 1);
    }

    #[test]
    fn upcoming_lists_next_openings_in_order() {
        let config = ScheduleConfig::new(vec![
            ScheduleItem::new("Morning", "/lists/m.pls", (7, 0), (10, 0), &["Mon", "Tue"]),
            ScheduleItem::new("Night", "/lists/n.pls", (22, 0), (6, 0), &["*"]),
        ]);
        let sched = TrackScheduler::new(config, Box::new(StubLoader::default()), &LogContext::default());

        let next = sched.upcoming(at(1, 8, 0), 3);
        let names: Vec<(&str, NaiveDateTime)> = next.iter().map(|w| (w.name.as_str(), w.starts_at)).collect();
        assert_eq!(
            names,
            vec![
                ("Night", at(1, 22, 0)),
                ("Morning", at(2, 7, 0)),
                ("Night", at(2, 22, 0)),
            ]
        );
    }
}
