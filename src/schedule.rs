use crate::error::{Error, Result};
use crate::logging::LogContext;
use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Token matching every day of the week.
pub const ALL_DAYS: &str = "*";

const DAY_NAMES: [(&str, Weekday); 7] = [
    ("monday", Weekday::Mon),
    ("tuesday", Weekday::Tue),
    ("wednesday", Weekday::Wed),
    ("thursday", Weekday::Thu),
    ("friday", Weekday::Fri),
    ("saturday", Weekday::Sat),
    ("sunday", Weekday::Sun),
];

/// Parse a weekday token: full English name or 3-letter abbreviation,
/// case-insensitive. `*` is not a weekday and returns None.
pub fn parse_weekday(token: &str) -> Option<Weekday> {
    let lower = token.trim().to_lowercase();
    DAY_NAMES
        .iter()
        .find(|(name, _)| *name == lower || (lower.len() == 3 && name.starts_with(&lower)))
        .map(|(_, day)| *day)
}

/// One schedule window: a playlist that is active during a time-of-day
/// interval on a set of weekdays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleItem {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub playlist_path: PathBuf,
    #[serde(default)]
    pub start_hour: u32,
    #[serde(default)]
    pub start_minute: u32,
    #[serde(default)]
    pub end_hour: u32,
    #[serde(default)]
    pub end_minute: u32,
    /// `*`, full day names or 3-letter abbreviations.
    #[serde(default)]
    pub days_of_week: Vec<String>,
}

impl ScheduleItem {
    pub fn new(
        name: &str,
        playlist_path: impl Into<PathBuf>,
        start: (u32, u32),
        end: (u32, u32),
        days: &[&str],
    ) -> Self {
        ScheduleItem {
            name: name.to_string(),
            playlist_path: playlist_path.into(),
            start_hour: start.0,
            start_minute: start.1,
            end_hour: end.0,
            end_minute: end.1,
            days_of_week: days.iter().map(|d| d.to_string()).collect(),
        }
    }

    pub fn start_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.start_hour, self.start_minute, 0).unwrap_or(NaiveTime::MIN)
    }

    pub fn end_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.end_hour, self.end_minute, 0).unwrap_or(NaiveTime::MIN)
    }

    /// True when the window crosses midnight (start after end).
    pub fn wraps_midnight(&self) -> bool {
        self.start_time() > self.end_time()
    }

    pub fn matches_day(&self, day: Weekday) -> bool {
        self.days_of_week
            .iter()
            .any(|token| token.trim() == ALL_DAYS || parse_weekday(token) == Some(day))
    }

    /// `[start, end)`, or `t >= start || t < end` when the window wraps midnight.
    pub fn contains_time(&self, t: NaiveTime) -> bool {
        let (start, end) = (self.start_time(), self.end_time());
        if start <= end {
            t >= start && t < end
        } else {
            t >= start || t < end
        }
    }

    pub fn is_active(&self, now: NaiveDateTime) -> bool {
        self.matches_day(now.weekday()) && self.contains_time(now.time())
    }

    /// Check the item the way the schedule editor does before saving it.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| {
            Err(Error::Schedule {
                name: self.name.clone(),
                reason: reason.to_string(),
            })
        };
        if self.name.trim().is_empty() {
            return fail("name must not be empty");
        }
        if self.playlist_path.as_os_str().is_empty() {
            return fail("playlist path must not be empty");
        }
        if self.start_hour > 23 || self.end_hour > 23 || self.start_minute > 59 || self.end_minute > 59
        {
            return fail("time out of range");
        }
        if self.days_of_week.is_empty() {
            return fail("no days of week");
        }
        let has_wildcard = self.days_of_week.iter().any(|d| d.trim() == ALL_DAYS);
        if has_wildcard && self.days_of_week.len() > 1 {
            return fail("'*' must be the only day token");
        }
        if let Some(bad) = self
            .days_of_week
            .iter()
            .find(|d| d.trim() != ALL_DAYS && parse_weekday(d).is_none())
        {
            return fail(&format!("unknown day '{}'", bad));
        }
        Ok(())
    }

    /// Window as "HH:MM-HH:MM".
    pub fn window_display(&self) -> String {
        format!(
            "{}-{}",
            self.start_time().format("%H:%M"),
            self.end_time().format("%H:%M")
        )
    }

    pub fn days_display(&self) -> String {
        self.days_of_week.join(",")
    }

    /// Minutes since midnight covered by this window, as half-open ranges.
    fn minute_ranges(&self) -> Vec<(u32, u32)> {
        let start = self.start_hour * 60 + self.start_minute;
        let end = self.end_hour * 60 + self.end_minute;
        if start <= end {
            vec![(start, end)]
        } else {
            vec![(start, 24 * 60), (0, end)]
        }
    }

    fn shares_day_with(&self, other: &ScheduleItem) -> bool {
        DAY_NAMES
            .iter()
            .any(|(_, day)| self.matches_day(*day) && other.matches_day(*day))
    }

    /// True when both items can be active at the same instant.
    pub fn overlaps(&self, other: &ScheduleItem) -> bool {
        if !self.shares_day_with(other) {
            return false;
        }
        self.minute_ranges().iter().any(|&(a0, a1)| {
            other
                .minute_ranges()
                .iter()
                .any(|&(b0, b1)| a0 < b1 && b0 < a1)
        })
    }
}

impl fmt::Display for ScheduleItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({})",
            self.name,
            self.playlist_path.display(),
            self.window_display()
        )
    }
}

/// Ordered schedule. Order matters: the first active item wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    #[serde(default, alias = "ScheduleItems")]
    pub schedule_items: Vec<ScheduleItem>,
}

impl ScheduleConfig {
    pub fn new(schedule_items: Vec<ScheduleItem>) -> Self {
        ScheduleConfig { schedule_items }
    }

    pub fn len(&self) -> usize {
        self.schedule_items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedule_items.is_empty()
    }

    /// First item active at `now`, in declared order.
    pub fn active_at(&self, now: NaiveDateTime) -> Option<&ScheduleItem> {
        self.schedule_items.iter().find(|item| item.is_active(now))
    }

    /// Index pairs `(earlier, later)` of items whose windows overlap.
    /// The earlier item shadows the later one while both are active.
    pub fn overlaps(&self) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for (i, a) in self.schedule_items.iter().enumerate() {
            for (j, b) in self.schedule_items.iter().enumerate().skip(i + 1) {
                if a.overlaps(b) {
                    pairs.push((i, j));
                }
            }
        }
        pairs
    }

    /// Parse schedule JSON. A leading UTF-8 BOM is ignored.
    pub fn from_json(json: &str) -> Result<Self> {
        let json = json.strip_prefix('\u{feff}').unwrap_or(json);
        Ok(serde_json::from_str(json)?)
    }

    /// Drop invalid items (with a warning), resolve relative playlist paths
    /// against `base_dir`, and warn about overlapping windows.
    pub fn sanitize(mut self, base_dir: Option<&Path>, log: &LogContext) -> Self {
        self.schedule_items.retain(|item| match item.validate() {
            Ok(()) => true,
            Err(e) => {
                log.warn(format!("Dropping schedule item: {}", e));
                false
            }
        });
        if let Some(base) = base_dir {
            for item in &mut self.schedule_items {
                if item.playlist_path.is_relative() {
                    item.playlist_path = base.join(&item.playlist_path);
                }
            }
        }
        for (i, j) in self.overlaps() {
            log.warn(format!(
                "Schedule items '{}' and '{}' overlap; '{}' wins while both are active",
                self.schedule_items[i].name, self.schedule_items[j].name, self.schedule_items[i].name
            ));
        }
        self
    }

    /// Load a schedule file. Never fails: a missing or broken file yields an
    /// empty schedule, which leaves the scheduler idle.
    pub fn load(path: &Path, log: &LogContext) -> Self {
        if !path.exists() {
            log.warn(format!("Schedule file not found: {}", path.display()));
            return ScheduleConfig::default();
        }
        let parsed = fs::read_to_string(path)
            .map_err(Error::from)
            .and_then(|json| ScheduleConfig::from_json(&json));
        match parsed {
            Ok(config) => {
                let config = config.sanitize(path.parent(), log);
                log.info(format!(
                    "Schedule loaded: {} items from {}",
                    config.len(),
                    path.display()
                ));
                for item in &config.schedule_items {
                    log.debug(format!("  - {} [{}]", item, item.days_display()));
                }
                config
            }
            Err(e) => {
                log.error(format!("Failed to load schedule {}: {}", path.display(), e));
                ScheduleConfig::default()
            }
        }
    }
}
