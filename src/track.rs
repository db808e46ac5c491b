use lofty::file::{AudioFile, TaggedFileExt};
use lofty::tag::{Accessor, ItemKey};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

/// Tag data for the item that just started playing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub path: PathBuf,
    pub artist: String,
    pub title: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub year: Option<u32>,
    #[serde(default)]
    pub genre: String,
    /// Track gain in dB, if the file carries a ReplayGain tag.
    #[serde(default)]
    pub replay_gain: Option<f32>,
    #[serde(default)]
    pub comment: String,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl TrackInfo {
    /// Minimal info for a path with no readable tags.
    pub fn untagged(path: &Path, duration: Duration) -> Self {
        TrackInfo {
            path: path.to_path_buf(),
            artist: UNKNOWN_ARTIST.to_string(),
            title: display_name(path),
            album: String::new(),
            year: None,
            genre: String::new(),
            replay_gain: None,
            comment: String::new(),
            duration,
        }
    }

    /// Create a TrackInfo by reading metadata from an audio file.
    pub fn from_path(path: &Path) -> Result<Self, String> {
        let tagged_file = lofty::read_from_path(path)
            .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;

        let duration = tagged_file.properties().duration();
        let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) else {
            return Ok(TrackInfo::untagged(path, duration));
        };

        let text = |value: Option<std::borrow::Cow<'_, str>>| {
            value
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        Ok(TrackInfo {
            path: path.to_path_buf(),
            artist: text(tag.artist()).unwrap_or_else(|| UNKNOWN_ARTIST.to_string()),
            title: text(tag.title()).unwrap_or_else(|| display_name(path)),
            album: text(tag.album()).unwrap_or_default(),
            year: tag
                .get_string(&ItemKey::Year)
                .or_else(|| tag.get_string(&ItemKey::RecordingDate))
                .and_then(parse_year),
            genre: text(tag.genre()).unwrap_or_default(),
            replay_gain: tag
                .get_string(&ItemKey::ReplayGainTrackGain)
                .and_then(parse_gain_db),
            comment: text(tag.comment()).unwrap_or_default(),
            duration,
        })
    }

    /// Format duration as MM:SS.
    pub fn duration_display(&self) -> String {
        format_mmss(self.duration)
    }
}

impl std::fmt::Display for TrackInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {} [{}]", self.artist, self.title, self.duration_display())
    }
}

/// File stem used as a display name for untagged files and jingles.
pub fn display_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

pub fn format_mmss(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// First four-digit run of a date-ish tag ("1999", "1999-04-01").
fn parse_year(raw: &str) -> Option<u32> {
    raw.trim().get(..4).and_then(|y| y.parse().ok())
}

/// "-6.48 dB" -> -6.48
fn parse_gain_db(raw: &str) -> Option<f32> {
    raw.trim()
        .trim_end_matches(|c: char| c.is_ascii_alphabetic() || c.is_whitespace())
        .parse()
        .ok()
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct DurationRepr {
        secs: u64,
        nanos: u32,
    }

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        DurationRepr {
            secs: dur.as_secs(),
            nanos: dur.subsec_nanos(),
        }
        .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let repr = DurationRepr::deserialize(d)?;
        Ok(Duration::new(repr.secs, repr.nanos))
    }
}
