//! Music service catalogues for the audio gateway.
//!
//! Five cooperating pieces:
//!
//! - [`ServicesCache`]: the household's third-party service table, refreshed
//!   daily from a player and persisted to disk.
//! - [`AccountExtractor`]: mines per-service account identifiers (session
//!   numbers, container prefixes, tokens) from device favourites.
//! - [`MusicService`] adapters: search plus bit-exact playback URI and
//!   DIDL-Lite metadata construction ([`SpotifySearch`], [`LibraryAdapter`]).
//! - [`MusicLibrary`]: the local library index with its structured/fuzzy
//!   search ladder.
//! - [`SavedStationManager`]: favourites- and API-derived station lists
//!   merged into one name-indexed catalogue with API backoff.

mod accounts;
mod adapter;
mod error;
mod library;
mod persist;
mod query;
mod services;
mod spotify;
mod stations;

pub use accounts::{AccountExtractor, ServiceAccount};
pub use adapter::{MusicService, SearchResult};
pub use error::{MusicError, Result};
pub use library::{
    parse_reindex_interval, CachedTrack, LibraryAdapter, LibraryIndex, LibrarySummary,
    MusicLibrary, DEFAULT_RANDOM_QUEUE_LIMIT,
};
pub use persist::{load_json, save_json};
pub use query::{SearchKind, StructuredQuery};
pub use services::{
    infer_service_type, ServiceDescriptor, ServiceType, ServicesCache, ServicesStatus,
};
pub use stations::{
    RestStationApi, SavedStationManager, StationApi, StationRecord, StationSource,
    API_BACKOFF, API_REFRESH_PERIOD, FAVORITES_REFRESH_PERIOD,
};
pub use spotify::{SpotifyConfig, SpotifySearch};
