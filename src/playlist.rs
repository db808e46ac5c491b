use crate::error::{Error, Result};
use crate::logging::LogContext;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const TRACK_PREFIX: &str = "track=";
const TRACK_SUFFIX: &str = "?;";

/// History is cleared once this share of the playlist (in percent) has
/// been played, so the last picks are not forced from a handful of tracks.
const HISTORY_RESET_PERCENT: usize = 80;

/// Anything that can hand out the next track of an active playlist.
pub trait TrackSource: Send {
    /// Pick the next track. Repetition avoidance is the source's business.
    fn random_track(&mut self) -> Option<PathBuf>;

    fn track_count(&self) -> usize;

    /// 0-based position of the last track handed out, if any.
    fn current_index(&self) -> Option<usize> {
        None
    }
}

/// Builds a [`TrackSource`] for a playlist path named by the schedule.
pub trait PlaylistLoader: Send {
    fn load(&self, path: &Path) -> Result<Box<dyn TrackSource>>;
}

/// Extract `track=<path>?;` entries from playlist text, in order.
pub fn parse_entries(content: &str) -> Vec<PathBuf> {
    let mut tracks = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find(TRACK_PREFIX) {
        let after = &rest[start + TRACK_PREFIX.len()..];
        let Some(end) = after.find(TRACK_SUFFIX) else {
            break;
        };
        let entry = after[..end].trim();
        if !entry.is_empty() {
            tracks.push(PathBuf::from(entry));
        }
        rest = &after[end + TRACK_SUFFIX.len()..];
    }
    tracks
}

/// A playlist file loaded into memory with a no-repeat play history.
#[derive(Debug)]
pub struct Playlist {
    pub source_path: PathBuf,
    tracks: Vec<PathBuf>,
    history: Vec<PathBuf>,
    history_file: Option<PathBuf>,
    current_index: Option<usize>,
    /// Re-read the file before each pick when it changed on disk.
    dynamic: bool,
    modified: Option<SystemTime>,
    log: LogContext,
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Read and resolve the entries of a playlist file, dropping missing files.
fn read_tracks(path: &Path, log: &LogContext) -> Result<Vec<PathBuf>> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::playlist(path, format!("cannot read: {}", e)))?;

    let base = path.parent().unwrap_or(Path::new(""));
    let tracks: Vec<PathBuf> = parse_entries(&content)
        .into_iter()
        .map(|p| if p.is_relative() { base.join(p) } else { p })
        .filter(|p| {
            let exists = p.exists();
            if !exists {
                log.warn(format!("Track file not found: {}", p.display()));
            }
            exists
        })
        .collect();

    if tracks.is_empty() {
        return Err(Error::playlist(path, "no tracks found"));
    }
    Ok(tracks)
}

impl Playlist {
    /// Build a playlist from already-resolved paths (no filesystem checks).
    pub fn from_tracks(source_path: impl Into<PathBuf>, tracks: Vec<PathBuf>, log: LogContext) -> Self {
        Playlist {
            source_path: source_path.into(),
            tracks,
            history: Vec::new(),
            history_file: None,
            current_index: None,
            dynamic: false,
            modified: None,
            log,
        }
    }

    /// Load a playlist file. Entries whose files do not exist are dropped
    /// with a warning; a playlist with no playable entry is an error.
    pub fn load(path: &Path, history_file: Option<PathBuf>, log: &LogContext) -> Result<Self> {
        let log = log.for_component("playlist");
        let tracks = read_tracks(path, &log)?;
        log.info(format!("Loaded {} tracks from {}", tracks.len(), path.display()));

        let mut playlist = Playlist::from_tracks(path, tracks, log);
        playlist.modified = modified_time(path);
        if let Some(file) = history_file {
            playlist.load_history(&file);
            playlist.history_file = Some(file);
        }
        Ok(playlist)
    }

    /// Watch the playlist file and pick up edits before the next selection.
    pub fn with_dynamic_reload(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    /// Reload the track list if the file changed since it was last read.
    /// A changed file that no longer parses keeps the current tracks.
    pub fn check_and_reload(&mut self) -> bool {
        if !self.dynamic {
            return false;
        }
        let Some(modified) = modified_time(&self.source_path) else {
            return false;
        };
        if self.modified == Some(modified) {
            return false;
        }
        self.modified = Some(modified);

        match read_tracks(&self.source_path, &self.log) {
            Ok(tracks) => {
                let old_count = self.tracks.len();
                self.tracks = tracks;
                let tracks = &self.tracks;
                self.history.retain(|p| tracks.contains(p));
                self.current_index = None;
                self.log.info(format!(
                    "Playlist {} changed: {} -> {} tracks",
                    self.source_path.display(),
                    old_count,
                    self.tracks.len()
                ));
                true
            }
            Err(e) => {
                self.log
                    .warn(format!("Keeping previous tracks, reload failed: {}", e));
                false
            }
        }
    }

    pub fn tracks(&self) -> &[PathBuf] {
        &self.tracks
    }

    pub fn history(&self) -> &[PathBuf] {
        &self.history
    }

    /// Pick a random track not yet in the history. Once 80% of the tracks
    /// have been played the history is cleared and the cycle starts over.
    pub fn next_random(&mut self) -> Option<PathBuf> {
        self.check_and_reload();
        if self.tracks.is_empty() {
            return None;
        }
        if self.history.len() * 100 >= self.tracks.len() * HISTORY_RESET_PERCENT {
            self.history.clear();
            self.log.info("History cleared, starting playlist over");
        }
        let available: Vec<usize> = (0..self.tracks.len())
            .filter(|&i| !self.history.contains(&self.tracks[i]))
            .collect();
        // History may hold paths from an older version of the file.
        let index = if available.is_empty() {
            self.history.clear();
            fastrand::usize(..self.tracks.len())
        } else {
            available[fastrand::usize(..available.len())]
        };

        let selected = self.tracks[index].clone();
        self.history.push(selected.clone());
        self.current_index = Some(index);
        self.save_history();

        self.log.debug(format!(
            "Selected track: {} (index {}/{})",
            selected.display(),
            index + 1,
            self.tracks.len()
        ));
        Some(selected)
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        self.save_history();
        self.log.info("Playlist history cleared");
    }

    fn load_history(&mut self, file: &Path) {
        let Ok(content) = fs::read_to_string(file) else {
            return;
        };
        self.history = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .filter(|p| self.tracks.contains(p))
            .collect();
        self.log
            .info(format!("Loaded {} tracks from history", self.history.len()));
    }

    fn save_history(&self) {
        let Some(file) = &self.history_file else {
            return;
        };
        let body = self
            .history
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        let result = file
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::write(file, body));
        if let Err(e) = result {
            self.log.error(format!("Failed to save history: {}", e));
        }
    }
}

impl TrackSource for Playlist {
    fn random_track(&mut self) -> Option<PathBuf> {
        self.next_random()
    }

    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn current_index(&self) -> Option<usize> {
        self.current_index
    }
}

/// Loads playlist files from disk, optionally persisting play history in
/// `history_dir` (one `<playlist stem>.history` file per playlist).
pub struct FilePlaylistLoader {
    history_dir: Option<PathBuf>,
    dynamic: bool,
    log: LogContext,
}

impl FilePlaylistLoader {
    pub fn new(history_dir: Option<PathBuf>, log: &LogContext) -> Self {
        FilePlaylistLoader {
            history_dir,
            dynamic: false,
            log: log.clone(),
        }
    }

    /// Loaded playlists re-read their file when it changes.
    pub fn with_dynamic_reload(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    fn history_file_for(&self, playlist: &Path) -> Option<PathBuf> {
        let dir = self.history_dir.as_ref()?;
        let stem = playlist.file_stem()?.to_string_lossy().to_string();
        Some(dir.join(format!("{}.history", stem)))
    }
}

impl PlaylistLoader for FilePlaylistLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn TrackSource>> {
        let playlist = Playlist::load(path, self.history_file_for(path), &self.log)?
            .with_dynamic_reload(self.dynamic);
        Ok(Box::new(playlist))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn make_playlist(names: &[&str]) -> Playlist {
        Playlist::from_tracks(
            "test.pls",
            names.iter().map(|n| PathBuf::from(format!("{}.mp3", n))).collect(),
            LogContext::default(),
        )
    }

    #[test]
    fn parse_entries_extracts_tracks_in_order() {
        let text = "# header\ntrack=/music/a.mp3?;\ntrack= /music/b.mp3 ?;track=?;\ntrack=/music/c.ogg?;";
        let entries = parse_entries(text);
        assert_eq!(
            entries,
            vec![
                PathBuf::from("/music/a.mp3"),
                PathBuf::from("/music/b.mp3"),
                PathBuf::from("/music/c.ogg"),
            ]
        );
    }

    #[test]
    fn parse_entries_stops_at_unterminated_entry() {
        let entries = parse_entries("track=/a.mp3?;track=/b.mp3");
        assert_eq!(entries, vec![PathBuf::from("/a.mp3")]);
    }

    #[test]
    fn random_selection_does_not_repeat_within_a_cycle() {
        let mut pl = make_playlist(&["A", "B", "C", "D"]);
        let picked: HashSet<PathBuf> = (0..4).map(|_| pl.next_random().unwrap()).collect();
        assert_eq!(picked.len(), 4);
        assert_eq!(pl.history().len(), 4);

        // Fifth pick starts a new cycle.
        assert!(pl.next_random().is_some());
        assert_eq!(pl.history().len(), 1);
    }

    #[test]
    fn current_index_tracks_last_selection() {
        let mut pl = make_playlist(&["Only"]);
        assert_eq!(pl.current_index(), None);
        pl.random_track();
        assert_eq!(pl.current_index(), Some(0));
    }

    #[test]
    fn empty_playlist_yields_nothing() {
        let mut pl = make_playlist(&[]);
        assert!(pl.next_random().is_none());
    }

    #[test]
    fn load_drops_missing_files_and_resolves_relative_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("song.mp3"), b"x").unwrap();
        let list = dir.path().join("main.pls");
        fs::write(&list, "track=song.mp3?;\ntrack=missing.mp3?;").unwrap();

        let pl = Playlist::load(&list, None, &LogContext::default()).unwrap();
        assert_eq!(pl.track_count(), 1);
        assert_eq!(pl.tracks()[0], dir.path().join("song.mp3"));
    }

    #[test]
    fn load_fails_when_no_track_exists() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("empty.pls");
        fs::write(&list, "track=/nowhere/x.mp3?;").unwrap();
        assert!(Playlist::load(&list, None, &LogContext::default()).is_err());
        assert!(Playlist::load(&dir.path().join("absent.pls"), None, &LogContext::default()).is_err());
    }

    #[test]
    fn history_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.mp3", "b.mp3", "c.mp3"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let list = dir.path().join("rot.pls");
        fs::write(&list, "track=a.mp3?;track=b.mp3?;track=c.mp3?;").unwrap();
        let history = dir.path().join("state").join("rot.history");

        let first = {
            let mut pl = Playlist::load(&list, Some(history.clone()), &LogContext::default()).unwrap();
            pl.next_random().unwrap()
        };

        let mut reloaded = Playlist::load(&list, Some(history), &LogContext::default()).unwrap();
        assert_eq!(reloaded.history(), &[first.clone()]);
        let second = reloaded.next_random().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn loader_names_history_after_playlist() {
        let loader = FilePlaylistLoader::new(Some(PathBuf::from("/var/lib/onair")), &LogContext::default());
        assert_eq!(
            loader.history_file_for(Path::new("/lists/evening.pls")),
            Some(PathBuf::from("/var/lib/onair/evening.history"))
        );
        let no_history = FilePlaylistLoader::new(None, &LogContext::default());
        assert_eq!(no_history.history_file_for(Path::new("/lists/evening.pls")), None);
    }

    #[test]
    fn history_resets_after_eighty_percent() {
        let mut pl = make_playlist(&["A", "B", "C", "D", "E"]);
        for _ in 0..4 {
            pl.next_random();
        }
        assert_eq!(pl.history().len(), 4);

        // 4 of 5 played: the next pick starts a fresh cycle.
        pl.next_random();
        assert_eq!(pl.history().len(), 1);
    }

    #[test]
    fn dynamic_playlist_picks_up_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.mp3", "b.mp3", "c.mp3"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let list = dir.path().join("live.pls");
        fs::write(&list, "track=a.mp3?;").unwrap();

        let mut pl = Playlist::load(&list, None, &LogContext::default())
            .unwrap()
            .with_dynamic_reload(true);
        assert!(!pl.check_and_reload());
        assert_eq!(pl.next_random(), Some(dir.path().join("a.mp3")));

        fs::write(&list, "track=b.mp3?;track=c.mp3?;").unwrap();
        let later = SystemTime::now() + std::time::Duration::from_secs(30);
        fs::File::options().write(true).open(&list).unwrap().set_modified(later).unwrap();

        let next = pl.next_random().unwrap();
        assert_eq!(pl.track_count(), 2);
        assert_ne!(next, dir.path().join("a.mp3"));
        assert!(pl.history().iter().all(|p| pl.tracks().contains(p)));
    }

    #[test]
    fn static_playlist_ignores_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.mp3", "b.mp3"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let list = dir.path().join("fixed.pls");
        fs::write(&list, "track=a.mp3?;").unwrap();
        let mut pl = Playlist::load(&list, None, &LogContext::default()).unwrap();

        fs::write(&list, "track=a.mp3?;track=b.mp3?;").unwrap();
        let later = SystemTime::now() + std::time::Duration::from_secs(30);
        fs::File::options().write(true).open(&list).unwrap().set_modified(later).unwrap();

        assert!(!pl.check_and_reload());
        assert_eq!(pl.track_count(), 1);
    }

    #[test]
    fn broken_reload_keeps_previous_tracks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mp3"), b"x").unwrap();
        let list = dir.path().join("live.pls");
        fs::write(&list, "track=a.mp3?;").unwrap();
        let mut pl = Playlist::load(&list, None, &LogContext::default())
            .unwrap()
            .with_dynamic_reload(true);

        fs::write(&list, "track=gone.mp3?;").unwrap();
        let later = SystemTime::now() + std::time::Duration::from_secs(30);
        fs::File::options().write(true).open(&list).unwrap().set_modified(later).unwrap();

        assert!(!pl.check_and_reload());
        assert_eq!(pl.tracks(), &[dir.path().join("a.mp3")]);
    }
}
