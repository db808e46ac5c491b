use crate::error::Result;
use crate::logging::LogContext;
use crate::track::display_name;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Artist pushed as stream metadata while a jingle plays.
pub const JINGLE_ARTIST: &str = "Jingle";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JingleFile {
    #[serde(default, alias = "JingleItems")]
    jingle_items: Vec<JingleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JingleEntry {
    #[serde(alias = "Path")]
    path: PathBuf,
}

/// Validated jingle paths, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JingleLibrary {
    jingles: Vec<PathBuf>,
}

impl JingleLibrary {
    pub fn new(jingles: Vec<PathBuf>) -> Self {
        JingleLibrary { jingles }
    }

    pub fn len(&self) -> usize {
        self.jingles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jingles.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.jingles
    }

    /// Parse `{"jingleItems": [{"path": ...}]}`, keeping only files that
    /// exist. Relative paths resolve against `base_dir`.
    pub fn from_json(json: &str, base_dir: Option<&Path>, log: &LogContext) -> Result<Self> {
        let json = json.strip_prefix('\u{feff}').unwrap_or(json);
        let file: JingleFile = serde_json::from_str(json)?;
        let jingles = file
            .jingle_items
            .into_iter()
            .map(|entry| match base_dir {
                Some(base) if entry.path.is_relative() => base.join(entry.path),
                _ => entry.path,
            })
            .filter(|path| {
                let exists = path.is_file();
                if !exists {
                    log.warn(format!("Jingle file not found: {}", path.display()));
                }
                exists
            })
            .collect();
        Ok(JingleLibrary { jingles })
    }

    /// Load the jingle list. Never fails: problems leave the library empty,
    /// which disables injection.
    pub fn load(path: &Path, log: &LogContext) -> Self {
        let parsed = fs::read_to_string(path)
            .map_err(crate::error::Error::from)
            .and_then(|json| JingleLibrary::from_json(&json, path.parent(), log));
        match parsed {
            Ok(library) => {
                log.info(format!(
                    "Loaded {} jingles from {}",
                    library.len(),
                    path.display()
                ));
                library
            }
            Err(e) => {
                log.error(format!(
                    "Failed to load jingles from {}: {}; jingles disabled",
                    path.display(),
                    e
                ));
                JingleLibrary::default()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JingleSelection {
    #[default]
    Random,
    RoundRobin,
}

/// Decides when a jingle goes between regular tracks and which one.
///
/// Owned by the orchestrator thread.
#[derive(Debug)]
pub struct JingleInjector {
    library: JingleLibrary,
    enabled: bool,
    frequency: u32,
    selection: JingleSelection,
    counter: u32,
    cursor: usize,
    log: LogContext,
}

impl JingleInjector {
    /// `frequency` is the number of regular tracks between jingles; 0 disables.
    pub fn new(library: JingleLibrary, frequency: u32, selection: JingleSelection, log: &LogContext) -> Self {
        let log = log.for_component("jingle");
        if frequency > 0 && library.is_empty() {
            log.warn("Jingle frequency set but no jingles available");
        }
        JingleInjector {
            library,
            enabled: true,
            frequency,
            selection,
            counter: 0,
            cursor: 0,
            log,
        }
    }

    pub fn disabled(log: &LogContext) -> Self {
        let mut injector = JingleInjector::new(JingleLibrary::default(), 0, JingleSelection::Random, log);
        injector.enabled = false;
        injector
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_active(&self) -> bool {
        self.enabled && self.frequency > 0 && !self.library.is_empty()
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    pub fn library(&self) -> &JingleLibrary {
        &self.library
    }

    /// A regular track started.
    pub fn on_track_played(&mut self) {
        self.counter = self.counter.saturating_add(1);
        self.log.debug(format!(
            "Tracks since last jingle: {}/{}",
            self.counter, self.frequency
        ));
    }

    pub fn should_play_jingle(&self) -> bool {
        self.is_active() && self.counter > 0 && self.counter % self.frequency == 0
    }

    pub fn select_jingle(&mut self) -> Option<PathBuf> {
        let jingles = self.library.paths();
        if jingles.is_empty() {
            return None;
        }
        let index = match self.selection {
            JingleSelection::Random => fastrand::usize(..jingles.len()),
            JingleSelection::RoundRobin => {
                let index = self.cursor % jingles.len();
                self.cursor = (index + 1) % jingles.len();
                index
            }
        };
        let jingle = jingles[index].clone();
        self.log.debug(format!("Selected jingle: {}", jingle.display()));
        Some(jingle)
    }

    /// Convenience for the control loop: a jingle if one is due.
    pub fn next_jingle(&mut self) -> Option<PathBuf> {
        if self.should_play_jingle() {
            self.select_jingle()
        } else {
            None
        }
    }

    /// A jingle started: reset the counter.
    pub fn on_jingle_started(&mut self) {
        self.counter = 0;
    }
}

/// (artist, title) metadata for a jingle path.
pub fn jingle_metadata(path: &Path) -> (String, String) {
    (JINGLE_ARTIST.to_string(), display_name(path))
}
