//! Keeps the same artist or genre from coming round again too soon.
//!
//! Sits between the scheduler and the control loop: a candidate whose
//! artist or genre is among the recent ones is passed over, up to a fixed
//! number of picks, after which the last candidate plays anyway.

use crate::logging::LogContext;
use crate::track::{TrackInfo, UNKNOWN_ARTIST, display_name};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

pub const DEFAULT_MEMORY: usize = 10;
pub const DEFAULT_MAX_PICKS: usize = 5;

/// The tags spacing looks at. `None` means the tag is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackTags {
    pub artist: Option<String>,
    pub genre: Option<String>,
}

impl TrackTags {
    pub fn new(artist: &str, genre: &str) -> Self {
        let known = |s: &str| {
            let s = s.trim();
            (!s.is_empty() && s != UNKNOWN_ARTIST).then(|| s.to_string())
        };
        TrackTags {
            artist: known(artist),
            genre: known(genre),
        }
    }
}

/// Reads tags for a candidate. `None` when the file cannot be read.
pub type TagReader = Box<dyn Fn(&Path) -> Option<TrackTags> + Send>;

/// Tags from the file itself, via lofty.
pub fn file_tags(path: &Path) -> Option<TrackTags> {
    TrackInfo::from_path(path)
        .ok()
        .map(|info| TrackTags::new(&info.artist, &info.genre))
}

pub struct ArtistSpacing {
    recent_artists: VecDeque<String>,
    recent_genres: VecDeque<String>,
    memory: usize,
    max_picks: usize,
    reader: TagReader,
    log: LogContext,
}

impl ArtistSpacing {
    pub fn new(log: &LogContext) -> Self {
        Self::with_reader(Box::new(file_tags), log)
    }

    pub fn with_reader(reader: TagReader, log: &LogContext) -> Self {
        ArtistSpacing {
            recent_artists: VecDeque::new(),
            recent_genres: VecDeque::new(),
            memory: DEFAULT_MEMORY,
            max_picks: DEFAULT_MAX_PICKS,
            reader,
            log: log.for_component("spacing"),
        }
    }

    /// How many recent artists/genres are remembered, and how many
    /// candidates are drawn at most per selection.
    pub fn with_limits(mut self, memory: usize, max_picks: usize) -> Self {
        self.memory = memory;
        self.max_picks = max_picks.max(1);
        self
    }

    pub fn recent_artists(&self) -> impl Iterator<Item = &str> {
        self.recent_artists.iter().map(String::as_str)
    }

    pub fn recent_genres(&self) -> impl Iterator<Item = &str> {
        self.recent_genres.iter().map(String::as_str)
    }

    /// Draw candidates from `next` until one is not a recent repeat.
    ///
    /// Only known tags are compared: a track with neither tag is taken as
    /// is, one with a single known tag is judged on that tag alone.
    pub fn pick(&mut self, mut next: impl FnMut() -> Option<PathBuf>) -> Option<PathBuf> {
        for attempt in 1..=self.max_picks {
            let candidate = next()?;
            let Some(tags) = (self.reader)(&candidate) else {
                self.log.debug(format!(
                    "No tags for {}, playing it unchecked",
                    candidate.display()
                ));
                return Some(candidate);
            };

            let artist_repeated = tags
                .artist
                .as_ref()
                .is_some_and(|a| self.recent_artists.contains(a));
            let genre_repeated = tags
                .genre
                .as_ref()
                .is_some_and(|g| self.recent_genres.contains(g));

            if (artist_repeated || genre_repeated) && attempt < self.max_picks {
                self.log.debug(format!(
                    "Passing over {}: {} played recently (pick {}/{})",
                    display_name(&candidate),
                    if artist_repeated { "artist" } else { "genre" },
                    attempt,
                    self.max_picks
                ));
                continue;
            }
            if attempt == self.max_picks && (artist_repeated || genre_repeated) {
                self.log.warn(format!(
                    "No track without a recent artist or genre after {} picks, playing {}",
                    self.max_picks,
                    display_name(&candidate)
                ));
            }
            self.remember(tags);
            return Some(candidate);
        }
        None
    }

    fn remember(&mut self, tags: TrackTags) {
        if let Some(artist) = tags.artist {
            push_bounded(&mut self.recent_artists, artist, self.memory);
        }
        if let Some(genre) = tags.genre {
            push_bounded(&mut self.recent_genres, genre, self.memory);
        }
    }
}

fn push_bounded(queue: &mut VecDeque<String>, value: String, limit: usize) {
    queue.push_back(value);
    while queue.len() > limit {
        queue.pop_front();
    }
}
