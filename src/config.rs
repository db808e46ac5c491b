//! Station configuration, read from `onair.json`.

use crate::broadcast::{BroadcastDestination, ConnectionOptions};
use crate::error::{Error, Result};
use crate::jingle::JingleSelection;
use crate::notifier::NotifierConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "onair.json";

fn default_jingle_frequency() -> u32 {
    5
}

fn default_fallback_bitrate() -> u32 {
    128
}

fn default_monitor_interval() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub destinations: Vec<BroadcastDestination>,
    /// Schedule JSON. Without it the fallback playlist plays around the clock.
    #[serde(default)]
    pub schedule_file: Option<PathBuf>,
    #[serde(default)]
    pub fallback_playlist: Option<PathBuf>,
    #[serde(default)]
    pub jingles_file: Option<PathBuf>,
    /// A jingle after every this many tracks; 0 disables.
    #[serde(default = "default_jingle_frequency")]
    pub jingle_frequency: u32,
    #[serde(default)]
    pub jingle_selection: JingleSelection,
    /// Where play histories are kept; next to each playlist when unset.
    #[serde(default)]
    pub history_dir: Option<PathBuf>,
    /// Re-read a playlist file when it changes on disk.
    #[serde(default)]
    pub dynamic_playlists: bool,
    /// Avoid artists and genres heard in the last few tracks.
    #[serde(default = "default_true")]
    pub artist_spacing: bool,
    /// Also play to the local sound card.
    #[serde(default)]
    pub monitor: bool,
    #[serde(default)]
    pub notifier: Option<NotifierConfig>,
    #[serde(default)]
    pub now_playing_xml: Option<PathBuf>,
    /// Pacing rate for files whose duration is unknown.
    #[serde(default = "default_fallback_bitrate")]
    pub fallback_bitrate: u32,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            destinations: Vec::new(),
            schedule_file: None,
            fallback_playlist: None,
            jingles_file: None,
            jingle_frequency: default_jingle_frequency(),
            jingle_selection: JingleSelection::default(),
            history_dir: None,
            dynamic_playlists: false,
            artist_spacing: true,
            monitor: false,
            notifier: None,
            now_playing_xml: None,
            fallback_bitrate: default_fallback_bitrate(),
            monitor_interval_secs: default_monitor_interval(),
        }
    }
}

impl AppConfig {
    /// `<config dir>/onair/onair.json`, or `./onair.json` when the platform
    /// has no config directory.
    pub fn default_path() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join("onair").join(CONFIG_FILE),
            None => PathBuf::from(CONFIG_FILE),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let json = json.trim_start_matches('\u{feff}');
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse the file, resolving relative paths against its
    /// directory. Unlike the schedule, a bad main config is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_json(&data)
            .map_err(|e| Error::config(format!("invalid {}: {}", path.display(), e)))?;
        let base = path.parent().filter(|p| !p.as_os_str().is_empty());
        Ok(match base {
            Some(base) => config.resolve_paths(base),
            None => config,
        })
    }

    pub fn resolve_paths(mut self, base: &Path) -> Self {
        for field in [
            &mut self.schedule_file,
            &mut self.fallback_playlist,
            &mut self.jingles_file,
            &mut self.history_dir,
            &mut self.now_playing_xml,
        ] {
            if let Some(p) = field.as_mut() {
                if p.is_relative() {
                    *p = base.join(&*p);
                }
            }
        }
        self
    }

    /// Startup errors that leave nothing sensible to run.
    pub fn validate(&self) -> Result<()> {
        if self.destinations.is_empty() {
            return Err(Error::config("no destinations configured"));
        }
        for (i, dest) in self.destinations.iter().enumerate() {
            if dest.host.trim().is_empty() {
                return Err(Error::config(format!("destination {} has no host", i + 1)));
            }
            if dest.mount.trim_matches('/').trim().is_empty() {
                return Err(Error::config(format!("destination {} has no mount", i + 1)));
            }
        }
        for (i, a) in self.destinations.iter().enumerate() {
            if self.destinations[i + 1..]
                .iter()
                .any(|b| a.host == b.host && a.port == b.port && a.mount_path() == b.mount_path())
            {
                return Err(Error::config(format!("destination {} is listed twice", a.url())));
            }
        }
        if self.schedule_file.is_none() && self.fallback_playlist.is_none() {
            return Err(Error::config(
                "neither a schedule file nor a fallback playlist configured",
            ));
        }
        Ok(())
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            monitor_interval: Duration::from_secs(self.monitor_interval_secs.max(1)),
            ..ConnectionOptions::default()
        }
    }
}
