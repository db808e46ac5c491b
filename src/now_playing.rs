use crate::error::{Error, Result};
use crate::scheduler::ScheduleInfo;
use crate::track::{TrackInfo, format_mmss};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Stopped,
    /// Running but nothing to play (no schedule window active).
    Idle,
    Playing,
    Paused,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Stopped => write!(f, "stopped"),
            PlaybackState::Idle => write!(f, "idle"),
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Paused => write!(f, "paused"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Track,
    Jingle,
}

/// Snapshot of what is on air, kept current by the control loop.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NowPlaying {
    pub state: PlaybackState,
    pub kind: Option<ItemKind>,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub duration: Option<Duration>,
    pub elapsed: Option<Duration>,
    pub started_at: Option<DateTime<Local>>,
    pub schedule: Option<ScheduleInfo>,
    /// 1-based position in the playlist, 0 if unknown.
    pub track_number: usize,
    pub tracks_since_jingle: u32,
    pub tracks_played: u64,
}

impl NowPlaying {
    /// Record a unit that just started.
    pub fn start_item(&mut self, info: &TrackInfo, kind: ItemKind, started_at: DateTime<Local>) {
        self.state = PlaybackState::Playing;
        self.kind = Some(kind);
        self.artist = Some(info.artist.clone());
        self.title = Some(info.title.clone());
        self.duration = Some(info.duration);
        self.elapsed = Some(Duration::ZERO);
        self.started_at = Some(started_at);
        if kind == ItemKind::Track {
            self.tracks_played += 1;
        }
    }

    /// Nothing on air.
    pub fn clear_item(&mut self, state: PlaybackState) {
        self.state = state;
        self.kind = None;
        self.artist = None;
        self.title = None;
        self.duration = None;
        self.elapsed = None;
        self.started_at = None;
    }

    pub fn remaining(&self) -> Option<Duration> {
        match (self.duration, self.elapsed) {
            (Some(dur), Some(el)) => Some(dur.saturating_sub(el)),
            _ => None,
        }
    }

    /// One line per field, for the console status command.
    pub fn status_text(&self) -> String {
        let mut out = format!("Playback: {}\n", self.state);
        if let (Some(artist), Some(title)) = (&self.artist, &self.title) {
            let label = match self.kind {
                Some(ItemKind::Jingle) => "Jingle",
                _ => "Track",
            };
            out.push_str(&format!("{}: {} - {}\n", label, artist, title));
            out.push_str(&format!(
                "Position: {} / {}\n",
                format_mmss(self.elapsed.unwrap_or_default()),
                format_mmss(self.duration.unwrap_or_default())
            ));
        }
        match &self.schedule {
            Some(s) if s.window.is_empty() => {
                out.push_str(&format!("Playlist: {} ({} tracks)\n", s.name, s.track_count))
            }
            Some(s) => out.push_str(&format!(
                "Playlist: {} [{}] ({} tracks)\n",
                s.name, s.window, s.track_count
            )),
            None => out.push_str("Playlist: none\n"),
        }
        out.push_str(&format!("Tracks played: {}\n", self.tracks_played));
        out
    }

    /// Render this snapshot as an XML string.
    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<nowplaying>\n");

        xml.push_str(&format!("  <state>{}</state>\n", self.state));
        xml.push_str(&format!(
            "  <playlist>{}</playlist>\n",
            xml_escape(self.schedule.as_ref().map(|s| s.name.as_str()).unwrap_or(""))
        ));

        xml.push_str("  <current>\n");
        xml.push_str(&format!(
            "    <kind>{}</kind>\n",
            match self.kind {
                Some(ItemKind::Track) => "track",
                Some(ItemKind::Jingle) => "jingle",
                None => "",
            }
        ));
        xml.push_str(&format!(
            "    <artist>{}</artist>\n",
            xml_escape(self.artist.as_deref().unwrap_or(""))
        ));
        xml.push_str(&format!(
            "    <title>{}</title>\n",
            xml_escape(self.title.as_deref().unwrap_or(""))
        ));
        xml.push_str(&format!(
            "    <duration>{}</duration>\n",
            self.duration.map(format_secs).unwrap_or_default()
        ));
        xml.push_str(&format!(
            "    <elapsed>{}</elapsed>\n",
            self.elapsed.map(format_secs).unwrap_or_default()
        ));
        xml.push_str(&format!(
            "    <remaining>{}</remaining>\n",
            self.remaining().map(format_secs).unwrap_or_default()
        ));
        xml.push_str(&format!(
            "    <started>{}</started>\n",
            self.started_at
                .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
                .unwrap_or_default()
        ));
        xml.push_str("  </current>\n");

        xml.push_str("</nowplaying>\n");
        xml
    }

    /// Write the XML snapshot to a file.
    pub fn write_xml(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_xml()).map_err(Error::from)
    }
}

/// Format Duration as integer seconds string.
fn format_secs(d: Duration) -> String {
    d.as_secs().to_string()
}

/// Escape XML special characters.
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
