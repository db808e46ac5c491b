//! Boundary to the audio engine: playback control plus an encoder factory
//! whose encoders can open a cast session to a streaming server.

use crate::error::{CastError, Result};
use crate::track::TrackInfo;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitrateMode {
    #[default]
    Cbr,
    Vbr,
    Abr,
}

impl fmt::Display for BitrateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitrateMode::Cbr => write!(f, "CBR"),
            BitrateMode::Vbr => write!(f, "VBR"),
            BitrateMode::Abr => write!(f, "ABR"),
        }
    }
}

fn default_content_type() -> String {
    "audio/mpeg".to_string()
}

fn default_bitrate() -> u32 {
    128
}

fn default_codec_hint() -> String {
    "music".to_string()
}

fn default_complexity() -> u8 {
    10
}

fn default_frame_size_ms() -> f32 {
    20.0
}

/// Encoder parameters carried by each destination. Engines that do not
/// encode (pass-through) only use `content_type` and `bitrate_kbps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSettings {
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default = "default_bitrate")]
    pub bitrate_kbps: u32,
    #[serde(default)]
    pub bitrate_mode: BitrateMode,
    /// Codec content hint ("music", "voice").
    #[serde(default = "default_codec_hint")]
    pub codec_hint: String,
    #[serde(default = "default_complexity")]
    pub complexity: u8,
    #[serde(default = "default_frame_size_ms")]
    pub frame_size_ms: f32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        EncoderSettings {
            content_type: default_content_type(),
            bitrate_kbps: default_bitrate(),
            bitrate_mode: BitrateMode::default(),
            codec_hint: default_codec_hint(),
            complexity: default_complexity(),
            frame_size_ms: default_frame_size_ms(),
        }
    }
}

impl EncoderSettings {
    /// Bytes per second of the encoded stream at the nominal bitrate.
    pub fn byte_rate(&self) -> u64 {
        u64::from(self.bitrate_kbps.max(1)) * 1000 / 8
    }
}

/// Everything a cast-init handshake needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CastParams {
    pub host: String,
    pub port: u16,
    /// Always starts with `/`.
    pub mount: String,
    pub username: String,
    pub password: String,
    pub content_type: String,
    pub name: String,
    pub genre: String,
    pub description: String,
    pub bitrate_kbps: u32,
    pub public: bool,
}

impl CastParams {
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.mount)
    }

    /// `user:password` as sent in Basic auth.
    pub fn credentials(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }
}

/// An encoder instance created by the engine. One live cast session at most.
pub trait Encoder: Send {
    /// Open a cast session. `Err(CastError::Busy)` when the encoder or the
    /// server mount is still held by a previous session.
    fn cast_init(&mut self, params: &CastParams) -> std::result::Result<(), CastError>;

    /// Push "artist - title" stream metadata to the server.
    fn set_metadata(&mut self, artist: &str, title: &str) -> Result<()>;

    fn is_casting(&self) -> bool;

    /// End the session and release resources. Idempotent.
    fn close(&mut self);
}

/// Playback control. Implementations are shared between the control loop
/// and connection monitors, so every method takes `&self`.
pub trait AudioEngine: Send + Sync {
    /// Start playing `path`, replacing whatever plays now. None when the
    /// file cannot be opened or decoded.
    fn play_track(&self, path: &Path) -> Option<TrackInfo>;

    fn is_playing(&self) -> bool;

    fn pause(&self);

    fn resume(&self);

    fn stop(&self);

    fn current_time(&self) -> Duration;

    fn total_time(&self) -> Duration;

    fn create_encoder(&self, settings: &EncoderSettings) -> Box<dyn Encoder>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_settings_fill_defaults_from_json() {
        let settings: EncoderSettings =
            serde_json::from_str(r#"{"bitrate_kbps": 64, "bitrate_mode": "vbr"}"#).unwrap();
        assert_eq!(settings.bitrate_kbps, 64);
        assert_eq!(settings.bitrate_mode, BitrateMode::Vbr);
        assert_eq!(settings.content_type, "audio/mpeg");
        assert_eq!(settings.complexity, 10);
    }

    #[test]
    fn byte_rate_follows_bitrate() {
        let settings = EncoderSettings {
            bitrate_kbps: 128,
            ..EncoderSettings::default()
        };
        assert_eq!(settings.byte_rate(), 16_000);
    }

    #[test]
    fn cast_params_url_and_credentials() {
        let params = CastParams {
            host: "radio.example.org".into(),
            port: 8000,
            mount: "/live".into(),
            username: "source".into(),
            password: "hackme".into(),
            content_type: "audio/mpeg".into(),
            name: "Test FM".into(),
            genre: "Various".into(),
            description: String::new(),
            bitrate_kbps: 128,
            public: false,
        };
        assert_eq!(params.url(), "http://radio.example.org:8000/live");
        assert_eq!(params.credentials(), "source:hackme");
    }
}
