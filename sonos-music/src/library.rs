//! Local music library index.
//!
//! The library root is swept in two passes: `A:ALBUMARTIST` for the artist
//! roster and `A:TRACKS` for the track set, in pages of 500 with a pacing
//! pause every 5000 tracks so the device's content directory is not
//! hammered. The finished index is swapped in atomically and serialized to
//! disk; a stale cache keeps serving queries while a re-index runs.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use sonos_player::Player;

use crate::error::{MusicError, Result};
use crate::persist;
use crate::query::StructuredQuery;

/// Page size for library browse sweeps.
const INDEX_PAGE_SIZE: u32 = 500;

/// Pause inserted after every this many tracks.
const PACING_EVERY: u32 = 5000;

/// Length of the pacing pause.
const PACING_PAUSE: Duration = Duration::from_millis(500);

/// Tracks returned for an empty query.
pub const DEFAULT_RANDOM_QUEUE_LIMIT: usize = 50;

/// One indexed library track, with lowercased forms for matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedTrack {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub uri: String,
    pub title_lc: String,
    pub artist_lc: String,
    pub album_lc: String,
}

impl CachedTrack {
    pub fn new(id: String, title: String, artist: String, album: String, uri: String) -> Self {
        Self {
            title_lc: title.to_lowercase(),
            artist_lc: artist.to_lowercase(),
            album_lc: album.to_lowercase(),
            id,
            title,
            artist,
            album,
            uri,
        }
    }
}

/// The whole index: primary by-id table plus the two name indices and the
/// album-artist roster.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LibraryIndex {
    pub tracks: HashMap<String, CachedTrack>,
    pub by_album: HashMap<String, HashSet<String>>,
    pub by_artist: HashMap<String, HashSet<String>>,
    pub album_artists: Vec<String>,
    pub built_at: Option<DateTime<Utc>>,
}

impl LibraryIndex {
    fn insert(&mut self, track: CachedTrack) {
        self.by_album
            .entry(track.album_lc.clone())
            .or_default()
            .insert(track.id.clone());
        self.by_artist
            .entry(track.artist_lc.clone())
            .or_default()
            .insert(track.id.clone());
        self.tracks.insert(track.id.clone(), track);
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Cache staleness window: 24 h.
    pub fn is_stale(&self) -> bool {
        match self.built_at {
            Some(built_at) => Utc::now() - built_at > chrono::Duration::hours(24),
            None => true,
        }
    }
}

/// Summary payload for the library admin routes.
#[derive(Debug, Clone, Serialize)]
pub struct LibrarySummary {
    pub tracks: usize,
    pub albums: usize,
    pub artists: usize,
    pub built_at: Option<DateTime<Utc>>,
    pub stale: bool,
    pub indexing: bool,
}

/// Parse the compact re-index interval grammar: `<int>(h|d|w)`.
pub fn parse_reindex_interval(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (number, unit) = value.split_at(value.len().checked_sub(1)?);
    let number: u64 = number.parse().ok()?;
    let hours = match unit {
        "h" => number,
        "d" => number * 24,
        "w" => number * 24 * 7,
        _ => return None,
    };
    Some(Duration::from_secs(hours * 3600))
}

/// The local-library catalogue.
pub struct MusicLibrary {
    index: RwLock<Arc<LibraryIndex>>,
    cache_path: PathBuf,
    random_queue_limit: usize,
    indexing: AtomicBool,
}

impl MusicLibrary {
    pub fn new(cache_path: PathBuf) -> Self {
        let library = Self {
            index: RwLock::new(Arc::new(LibraryIndex::default())),
            cache_path,
            random_queue_limit: DEFAULT_RANDOM_QUEUE_LIMIT,
            indexing: AtomicBool::new(false),
        };
        if let Some(persisted) = persist::load_json::<LibraryIndex>(&library.cache_path) {
            tracing::info!(tracks = persisted.tracks.len(), "library cache loaded from disk");
            *library.index.write().unwrap() = Arc::new(persisted);
        }
        library
    }

    pub fn with_random_queue_limit(mut self, limit: usize) -> Self {
        self.random_queue_limit = limit;
        self
    }

    pub fn is_ready(&self) -> bool {
        !self.index.read().unwrap().is_empty()
    }

    pub fn is_indexing(&self) -> bool {
        self.indexing.load(Ordering::SeqCst)
    }

    pub fn summary(&self) -> LibrarySummary {
        let index = self.snapshot();
        LibrarySummary {
            tracks: index.tracks.len(),
            albums: index.by_album.len(),
            artists: index.by_artist.len(),
            built_at: index.built_at,
            stale: index.is_stale(),
            indexing: self.is_indexing(),
        }
    }

    /// Current index snapshot; queries keep serving from it during a
    /// re-index.
    pub fn snapshot(&self) -> Arc<LibraryIndex> {
        Arc::clone(&self.index.read().unwrap())
    }

    /// The ground-truth artist roster from the `A:ALBUMARTIST` sweep.
    pub fn album_artists(&self) -> Vec<String> {
        self.snapshot().album_artists.clone()
    }

    /// Re-index from a player's content directory. Blocking; run it on a
    /// scheduler task. The old index keeps serving until the swap at the
    /// end.
    pub fn reindex(&self, player: &Player) -> Result<LibrarySummary> {
        if self.indexing.swap(true, Ordering::SeqCst) {
            tracing::info!("re-index already running, skipping");
            return Ok(self.summary());
        }
        let result = self.reindex_inner(player);
        self.indexing.store(false, Ordering::SeqCst);
        result
    }

    fn reindex_inner(&self, player: &Player) -> Result<LibrarySummary> {
        tracing::info!("library re-index starting");
        let mut index = LibraryIndex::default();

        // Artist roster sweep
        let mut offset = 0u32;
        loop {
            let page = player.browse("A:ALBUMARTIST", offset, INDEX_PAGE_SIZE)?;
            for entry in &page.items {
                if let Some(title) = &entry.title {
                    index.album_artists.push(title.clone());
                }
            }
            offset += page.number_returned;
            if page.number_returned == 0 || offset >= page.total_matches {
                break;
            }
        }

        // Track sweep, paced to protect the device
        let mut offset = 0u32;
        loop {
            let page = player.browse("A:TRACKS", offset, INDEX_PAGE_SIZE)?;
            for entry in &page.items {
                let Some(uri) = entry.uri.clone() else { continue };
                let id = entry.id.clone().unwrap_or_else(|| uri.clone());
                index.insert(CachedTrack::new(
                    id,
                    entry.title.clone().unwrap_or_default(),
                    entry.artist.clone().unwrap_or_default(),
                    entry.album.clone().unwrap_or_default(),
                    uri,
                ));
            }
            offset += page.number_returned;
            if page.number_returned == 0 || offset >= page.total_matches {
                break;
            }
            if offset % PACING_EVERY < INDEX_PAGE_SIZE {
                std::thread::sleep(PACING_PAUSE);
            }
        }

        index.built_at = Some(Utc::now());
        persist::save_json(&self.cache_path, &index)?;
        let tracks = index.tracks.len();
        *self.index.write().unwrap() = Arc::new(index);
        tracing::info!(tracks, "library re-index complete");
        Ok(self.summary())
    }

    /// Install a pre-built index (tests, cache import).
    pub fn install_index(&self, index: LibraryIndex) {
        *self.index.write().unwrap() = Arc::new(index);
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Resolve a structured query against the index.
    ///
    /// Resolution order: empty query → random picks; all fields → strict
    /// conjunction; two fields → conjunction of the two; single
    /// album/artist → substring with a title-fuzzy fallback; then the
    /// prefix-bidirectional fuzzy pass.
    pub fn search(&self, query: &StructuredQuery) -> Result<Vec<CachedTrack>> {
        let index = self.snapshot();
        if index.is_empty() {
            return Err(MusicError::LibraryNotReady);
        }

        if query.is_empty() {
            return Ok(self.random_tracks(&index));
        }

        let artist = query.artist.as_deref();
        let album = query.album.as_deref();
        let track = query.track_text();

        let matches: Vec<CachedTrack> = match (artist, album, track) {
            (Some(artist), Some(album), Some(track)) => index
                .tracks
                .values()
                .filter(|t| {
                    artist_matches(&t.artist_lc, artist)
                        && t.album_lc.contains(album)
                        && t.title_lc.contains(track)
                })
                .cloned()
                .collect(),
            (Some(artist), Some(album), None) => index
                .tracks
                .values()
                .filter(|t| artist_matches(&t.artist_lc, artist) && t.album_lc.contains(album))
                .cloned()
                .collect(),
            (Some(artist), None, Some(track)) => index
                .tracks
                .values()
                .filter(|t| artist_matches(&t.artist_lc, artist) && t.title_lc.contains(track))
                .cloned()
                .collect(),
            (None, Some(album), Some(track)) => index
                .tracks
                .values()
                .filter(|t| t.album_lc.contains(album) && t.title_lc.contains(track))
                .cloned()
                .collect(),
            (Some(artist), None, None) => {
                let hits: Vec<CachedTrack> = index
                    .tracks
                    .values()
                    .filter(|t| artist_matches(&t.artist_lc, artist))
                    .cloned()
                    .collect();
                if hits.is_empty() {
                    // Same term retried against titles
                    index
                        .tracks
                        .values()
                        .filter(|t| t.title_lc.contains(artist))
                        .cloned()
                        .collect()
                } else {
                    hits
                }
            }
            (None, Some(album), None) => {
                let hits: Vec<CachedTrack> = index
                    .tracks
                    .values()
                    .filter(|t| t.album_lc.contains(album))
                    .cloned()
                    .collect();
                if hits.is_empty() {
                    index
                        .tracks
                        .values()
                        .filter(|t| t.title_lc.contains(album))
                        .cloned()
                        .collect()
                } else {
                    hits
                }
            }
            (None, None, Some(track)) => index
                .tracks
                .values()
                .filter(|t| t.title_lc.contains(track))
                .cloned()
                .collect(),
            (None, None, None) => Vec::new(),
        };

        if !matches.is_empty() {
            return Ok(sorted(matches));
        }
        Ok(sorted(self.fuzzy_search(&index, &query.flat_text())))
    }

    /// Prefix-bidirectional fuzzy pass: a row matches when any of its
    /// lowercased fields is a prefix of the query or vice versa. An
    /// album-level hit narrows the result to that album's tracks.
    fn fuzzy_search(&self, index: &LibraryIndex, flat: &str) -> Vec<CachedTrack> {
        if flat.is_empty() {
            return Vec::new();
        }
        let prefix_match = |field: &str| {
            !field.is_empty() && (field.starts_with(flat) || flat.starts_with(field))
        };

        let mut album_hit: Option<String> = None;
        let mut matches = Vec::new();
        for track in index.tracks.values() {
            let on_album = prefix_match(&track.album_lc);
            if on_album && album_hit.is_none() {
                album_hit = Some(track.album_lc.clone());
            }
            if on_album || prefix_match(&track.artist_lc) || prefix_match(&track.title_lc) {
                matches.push(track.clone());
            }
        }

        if let Some(album) = album_hit {
            matches.retain(|track| track.album_lc == album);
        }
        matches
    }

    fn random_tracks(&self, index: &LibraryIndex) -> Vec<CachedTrack> {
        let mut rng = rand::thread_rng();
        let mut tracks: Vec<&CachedTrack> = index.tracks.values().collect();
        tracks.shuffle(&mut rng);
        tracks
            .into_iter()
            .take(self.random_queue_limit)
            .cloned()
            .collect()
    }
}

/// [`MusicService`] adapter over the library index, so musicsearch routes
/// can treat the library like any other source.
pub struct LibraryAdapter {
    library: Arc<MusicLibrary>,
}

impl LibraryAdapter {
    pub fn new(library: Arc<MusicLibrary>) -> Self {
        Self { library }
    }

    fn track_by_id(&self, id: &str) -> Result<CachedTrack> {
        self.library
            .snapshot()
            .tracks
            .get(id)
            .cloned()
            .ok_or_else(|| MusicError::NotFound(format!("library track '{id}'")))
    }
}

impl crate::adapter::MusicService for LibraryAdapter {
    fn name(&self) -> &'static str {
        "library"
    }

    fn search(
        &self,
        kind: crate::query::SearchKind,
        term: &str,
        _country: Option<&str>,
    ) -> Result<Vec<crate::adapter::SearchResult>> {
        use crate::query::SearchKind;
        // The library has no station concept
        if kind == SearchKind::Station {
            return Err(MusicError::Unsupported("library stations".to_string()));
        }
        let query = match kind {
            SearchKind::Album if !term.contains(':') => {
                StructuredQuery::parse(&format!("album:{term}"))
            }
            SearchKind::Artist if !term.contains(':') => {
                StructuredQuery::parse(&format!("artist:{term}"))
            }
            _ => StructuredQuery::parse(term),
        };
        Ok(self
            .library
            .search(&query)?
            .into_iter()
            .map(|track| crate::adapter::SearchResult {
                kind: SearchKind::Song,
                id: track.id.clone(),
                title: track.title,
                artist: Some(track.artist),
                album: Some(track.album),
            })
            .collect())
    }

    fn uri_for(&self, result: &crate::adapter::SearchResult) -> Result<String> {
        Ok(self.track_by_id(&result.id)?.uri)
    }

    fn metadata_for(&self, result: &crate::adapter::SearchResult) -> Result<String> {
        let track = self.track_by_id(&result.id)?;
        Ok(format!(
            r#"<DIDL-Lite xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/" xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/"><item id="{id}" restricted="true"><dc:title>{title}</dc:title><upnp:class>object.item.audioItem.musicTrack</upnp:class></item></DIDL-Lite>"#,
            id = soap_client::xml::escape(&track.id),
            title = soap_client::xml::escape(&track.title),
        ))
    }
}

/// Artist matching rules: substring, end-match, and a leading-`the` strip.
fn artist_matches(artist_lc: &str, needle: &str) -> bool {
    if artist_lc.contains(needle) || artist_lc.ends_with(needle) {
        return true;
    }
    if let Some(stripped) = artist_lc.strip_prefix("the ") {
        return stripped.contains(needle);
    }
    false
}

fn sorted(mut tracks: Vec<CachedTrack>) -> Vec<CachedTrack> {
    tracks.sort_by(|a, b| {
        (&a.artist_lc, &a.album_lc, &a.title_lc).cmp(&(&b.artist_lc, &b.album_lc, &b.title_lc))
    });
    tracks
}
