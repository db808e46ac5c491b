use crate::http;
use crate::logging::LogContext;
use crate::track::TrackInfo;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Told about every regular track that starts.
pub trait TrackNotifier: Send {
    /// `number` is the 1-based position in the active playlist, 0 if unknown.
    fn notify(&self, number: usize, info: &TrackInfo);
}

fn default_number_var() -> String {
    "number".to_string()
}

fn default_artist_var() -> String {
    "artist".to_string()
}

fn default_title_var() -> String {
    "title".to_string()
}

fn default_link_var() -> String {
    "link".to_string()
}

/// Where and how to report now-playing to a web site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Base URL, e.g. `https://example.org`.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub key: String,
    /// Page path appended to `url`, e.g. `add_song.php`.
    #[serde(default)]
    pub page: String,
    #[serde(default = "default_number_var")]
    pub number_var: String,
    #[serde(default = "default_artist_var")]
    pub artist_var: String,
    #[serde(default = "default_title_var")]
    pub title_var: String,
    #[serde(default = "default_link_var")]
    pub link_var: String,
    /// Public folder the track files are reachable under.
    #[serde(default)]
    pub link_folder: String,
    /// Local path prefix removed before joining with `link_folder`.
    #[serde(default)]
    pub strip_prefix: String,
}

impl NotifierConfig {
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.url.trim().is_empty()
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.url.trim_end_matches('/'),
            self.page.trim_start_matches('/')
        )
    }
}

/// Public link for a local track path.
pub fn track_link(path: &Path, strip_prefix: &str, link_folder: &str) -> String {
    let file = path.to_string_lossy().replace('\\', "/");
    let prefix = strip_prefix.replace('\\', "/");
    let relative = match file.find(&prefix) {
        Some(pos) if !prefix.is_empty() => &file[pos + prefix.len()..],
        _ => file.as_str(),
    };
    format!(
        "{}/{}",
        link_folder.trim_end_matches('/'),
        relative.trim_start_matches('/')
    )
}

/// Reports tracks with an HTTP GET. Failures are logged and dropped.
pub struct HttpNotifier {
    config: NotifierConfig,
    agent: ureq::Agent,
    log: LogContext,
}

impl HttpNotifier {
    pub fn new(config: NotifierConfig, log: &LogContext) -> Self {
        let log = log.for_component("notifier");
        log.info(format!("Now-playing notifier posting to {}", config.endpoint()));
        HttpNotifier {
            config,
            agent: http::agent(http::HTTP_TIMEOUT),
            log,
        }
    }

    /// Query pairs sent for a track, in order.
    pub fn query(&self, number: usize, info: &TrackInfo) -> Vec<(String, String)> {
        let c = &self.config;
        vec![
            ("key".to_string(), c.key.clone()),
            (c.number_var.clone(), number.to_string()),
            (c.artist_var.clone(), info.artist.clone()),
            (c.title_var.clone(), info.title.clone()),
            (
                c.link_var.clone(),
                track_link(&info.path, &c.strip_prefix, &c.link_folder),
            ),
        ]
    }
}

impl TrackNotifier for HttpNotifier {
    fn notify(&self, number: usize, info: &TrackInfo) {
        if info.artist.trim().is_empty() || info.title.trim().is_empty() {
            self.log.warn("Not reporting a track without artist or title");
            return;
        }
        let mut request = self.agent.get(&self.config.endpoint());
        for (key, value) in self.query(number, info) {
            request = request.query(key, value);
        }
        match request.call() {
            Ok(_) => self.log.debug(format!("Reported #{} {} - {}", number, info.artist, info.title)),
            Err(e) => self.log.warn(format!("Failed to report track: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn link_strips_local_prefix() {
        assert_eq!(
            track_link(Path::new("/srv/music/jazz/a.mp3"), "/srv/music", "https://cdn.example.org/tracks/"),
            "https://cdn.example.org/tracks/jazz/a.mp3"
        );
        assert_eq!(
            track_link(Path::new("/other/a.mp3"), "/srv/music", "https://cdn.example.org"),
            "https://cdn.example.org/other/a.mp3"
        );
    }

    #[test]
    fn endpoint_joins_url_and_page() {
        let config = NotifierConfig {
            url: "https://example.org/".into(),
            page: "/add_song.php".into(),
            ..NotifierConfig::default()
        };
        assert_eq!(config.endpoint(), "https://example.org/add_song.php");
        assert!(!config.is_usable());
    }

    #[test]
    fn query_uses_configured_variable_names() {
        let config: NotifierConfig = serde_json::from_str(
            r#"{"enabled": true, "url": "http://x", "key": "k", "artist_var": "a", "link_folder": "http://x/m"}"#,
        )
        .unwrap();
        assert!(config.is_usable());
        let notifier = HttpNotifier::new(config, &LogContext::default());

        let mut info = TrackInfo::untagged(Path::new("/m/s.mp3"), Duration::ZERO);
        info.artist = "Nina".into();
        let pairs = notifier.query(3, &info);
        assert_eq!(pairs[0], ("key".to_string(), "k".to_string()));
        assert_eq!(pairs[1], ("number".to_string(), "3".to_string()));
        assert_eq!(pairs[2], ("a".to_string(), "Nina".to_string()));
        assert_eq!(pairs[3], ("title".to_string(), "s".to_string()));
        assert_eq!(pairs[4], ("link".to_string(), "http://x/m/m/s.mp3".to_string()));
    }
}
