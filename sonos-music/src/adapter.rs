//! Common surface for music catalogue adapters.

use serde::Serialize;

use sonos_player::Player;

use crate::error::{MusicError, Result};
use crate::query::SearchKind;

/// One hit from a catalogue search. `id` is the service-native content id
/// (e.g. `spotify:track:...` or a library track id); URI and metadata
/// construction happens in the owning adapter.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub kind: SearchKind,
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
}

/// A searchable music source that can mint playback URIs and transport
/// metadata for its results.
pub trait MusicService: Send + Sync {
    /// Service name as used in route paths (lowercase).
    fn name(&self) -> &'static str;

    fn search(
        &self,
        kind: SearchKind,
        term: &str,
        country: Option<&str>,
    ) -> Result<Vec<SearchResult>>;

    /// Playback URI for a result. Bit-sensitive: flags and container
    /// prefixes are part of the wire contract.
    fn uri_for(&self, result: &SearchResult) -> Result<String>;

    /// DIDL-Lite transport metadata for a result.
    fn metadata_for(&self, result: &SearchResult) -> Result<String>;

    /// For services whose artist radio cannot be triggered directly:
    /// queue the artist's top tracks instead.
    fn play_artist_top_tracks(&self, _player: &Player, artist: &str) -> Result<()> {
        Err(MusicError::Unsupported(format!(
            "artist top tracks for '{artist}' on {}",
            self.name()
        )))
    }
}
