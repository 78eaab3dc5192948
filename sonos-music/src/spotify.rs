//! Spotify-class catalogue adapter.
//!
//! Search goes to the Web API with a bearer token obtained by the external
//! OAuth collaborator; URI and metadata construction uses the identifiers
//! mined from favourites. The flag integers and container prefixes below
//! are part of the wire contract: a wrong value makes the player silently
//! refuse to play.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;

use sonos_player::Player;

use crate::accounts::{AccountExtractor, ServiceAccount};
use crate::adapter::{MusicService, SearchResult};
use crate::error::{MusicError, Result};
use crate::query::{SearchKind, StructuredQuery};

/// SMAPI flag values by content class.
mod flags {
    /// Directly streamable track
    pub const STREAM_TRACK: u32 = 8224;
    /// Queueable container (album, playlist)
    pub const QUEUE_CONTAINER: u32 = 108;
    /// Programmed artist radio
    pub const ARTIST_RADIO: u32 = 8200;
}

/// DIDL item-id prefixes by content class.
mod metadata_prefix {
    pub const TRACK: &str = "00032020";
    pub const ALBUM: &str = "0004206c";
    pub const ARTIST_RADIO: &str = "000c206c";
}

const CDUDN_NAMESPACE: &str = "urn:schemas-rinconnetworks-com:metadata-1-0/";
const DEFAULT_API_BASE: &str = "https://api.spotify.com";

/// Runtime credentials for the Web API. The token is minted elsewhere;
/// absence means the service is unconfigured, not an error.
#[derive(Debug, Clone, Default)]
pub struct SpotifyConfig {
    pub bearer_token: Option<String>,
    /// Default market for availability filtering (ISO 3166-1 alpha-2)
    pub market: Option<String>,
}

/// Spotify search + URI/metadata construction.
pub struct SpotifySearch {
    http: reqwest::blocking::Client,
    config: RwLock<SpotifyConfig>,
    accounts: Arc<AccountExtractor>,
    api_base: String,
}

impl SpotifySearch {
    pub fn new(accounts: Arc<AccountExtractor>, config: SpotifyConfig) -> Self {
        Self::with_api_base(accounts, config, DEFAULT_API_BASE.to_string())
    }

    pub fn with_api_base(
        accounts: Arc<AccountExtractor>,
        config: SpotifyConfig,
        api_base: String,
    ) -> Self {
        Self {
            http: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            config: RwLock::new(config),
            accounts,
            api_base,
        }
    }

    /// Swap in a fresh bearer token (called after token refresh).
    pub fn set_bearer_token(&self, token: Option<String>) {
        self.config.write().unwrap().bearer_token = token;
    }

    pub fn is_configured(&self) -> bool {
        self.config.read().unwrap().bearer_token.is_some()
    }

    fn account(&self) -> ServiceAccount {
        self.accounts.default_account().unwrap_or(ServiceAccount {
            sid: 12,
            sn: 1,
            account_id: "0".to_string(),
            album_prefix: crate::accounts::DEFAULT_ALBUM_PREFIX.to_string(),
            playlist_prefix: crate::accounts::DEFAULT_PLAYLIST_PREFIX.to_string(),
        })
    }

    fn api_get(&self, path_and_query: &str) -> Result<reqwest::blocking::Response> {
        let token = self
            .config
            .read()
            .unwrap()
            .bearer_token
            .clone()
            .ok_or_else(|| MusicError::Unconfigured("spotify".to_string()))?;

        let response = self
            .http
            .get(format!("{}{}", self.api_base, path_and_query))
            .bearer_auth(token)
            .send()
            .map_err(|e| MusicError::Http(e.to_string()))?;

        match response.status().as_u16() {
            200..=299 => Ok(response),
            401 | 403 => Err(MusicError::Auth("spotify token rejected".to_string())),
            429 => Err(MusicError::Quota("spotify rate limit".to_string())),
            status => Err(MusicError::Http(format!("spotify API status {status}"))),
        }
    }

    fn market(&self, country: Option<&str>) -> Option<String> {
        country
            .map(|c| c.to_uppercase())
            .or_else(|| self.config.read().unwrap().market.clone())
    }

    /// Build the Web API `q` parameter from the structured term; the API
    /// understands the same field qualifiers natively.
    fn api_query(query: &StructuredQuery) -> String {
        let mut parts = Vec::new();
        if let Some(track) = query.track_text() {
            parts.push(track.to_string());
        }
        if let Some(artist) = &query.artist {
            parts.push(format!("artist:{artist}"));
        }
        if let Some(album) = &query.album {
            parts.push(format!("album:{album}"));
        }
        parts.join(" ")
    }

    fn artist_id(&self, artist: &str, market: Option<&str>) -> Result<String> {
        let results = self.search(SearchKind::Artist, artist, market)?;
        results
            .first()
            .map(|result| result.id.clone())
            .ok_or_else(|| MusicError::NotFound(format!("artist '{artist}'")))
    }
}

impl MusicService for SpotifySearch {
    fn name(&self) -> &'static str {
        "spotify"
    }

    fn search(
        &self,
        kind: SearchKind,
        term: &str,
        country: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let query = StructuredQuery::parse(term);
        let market = self.market(country);

        let search_type = match kind {
            SearchKind::Album => "album",
            SearchKind::Song => "track",
            // Stations are artist radio: resolve the artist first
            SearchKind::Station | SearchKind::Artist => "artist",
        };

        let mut url = format!(
            "/v1/search?q={}&type={}&limit=25",
            urlencoding::encode(&Self::api_query(&query)),
            search_type
        );
        if let Some(market) = &market {
            url.push_str(&format!("&market={market}"));
        }

        let body: SearchResponse = self
            .api_get(&url)?
            .json()
            .map_err(|e| MusicError::Parse(e.to_string()))?;

        let mut results = Vec::new();
        if let Some(tracks) = body.tracks {
            for track in tracks.items {
                if !available_in(&track.available_markets, market.as_deref()) {
                    continue;
                }
                results.push(SearchResult {
                    kind: SearchKind::Song,
                    id: track.uri,
                    title: track.name,
                    artist: track.artists.into_iter().next().map(|a| a.name),
                    album: track.album.map(|a| a.name),
                });
            }
        }
        if let Some(albums) = body.albums {
            for album in albums.items {
                if !available_in(&album.available_markets, market.as_deref()) {
                    continue;
                }
                results.push(SearchResult {
                    kind: SearchKind::Album,
                    id: album.uri,
                    title: album.name,
                    artist: album.artists.into_iter().next().map(|a| a.name),
                    album: None,
                });
            }
        }
        if let Some(artists) = body.artists {
            for artist in artists.items {
                results.push(SearchResult {
                    kind,
                    id: artist.uri,
                    title: artist.name,
                    artist: None,
                    album: None,
                });
            }
        }
        Ok(results)
    }

    fn uri_for(&self, result: &SearchResult) -> Result<String> {
        let account = self.account();
        let sid = account.sid;
        let sn = account.sn;
        match result.kind {
            SearchKind::Song => Ok(format!(
                "x-sonos-spotify:{}?sid={sid}&flags={}&sn={sn}",
                urlencoding::encode(&result.id),
                flags::STREAM_TRACK
            )),
            SearchKind::Album => Ok(format!(
                "x-rincon-cpcontainer:{}{}?sid={sid}&flags={}&sn={sn}",
                account.album_prefix,
                urlencoding::encode(&result.id),
                flags::QUEUE_CONTAINER
            )),
            SearchKind::Station | SearchKind::Artist => {
                let radio_id = result.id.replace(":artist:", ":artistRadio:");
                Ok(format!(
                    "x-sonosapi-radio:{}?sid={sid}&flags={}&sn={sn}",
                    urlencoding::encode(&radio_id),
                    flags::ARTIST_RADIO
                ))
            }
        }
    }

    fn metadata_for(&self, result: &SearchResult) -> Result<String> {
        let account = self.account();
        let (prefix, class) = match result.kind {
            SearchKind::Song => (metadata_prefix::TRACK, "object.item.audioItem.musicTrack"),
            SearchKind::Album => (
                metadata_prefix::ALBUM,
                "object.container.album.musicAlbum",
            ),
            SearchKind::Station | SearchKind::Artist => (
                metadata_prefix::ARTIST_RADIO,
                "object.item.audioItem.audioBroadcast.#artistRadio",
            ),
        };
        let content_id = match result.kind {
            SearchKind::Station | SearchKind::Artist => {
                result.id.replace(":artist:", ":artistRadio:")
            }
            _ => result.id.clone(),
        };
        let serial = account.token_serial();
        Ok(format!(
            r#"<DIDL-Lite xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/" xmlns:r="{CDUDN_NAMESPACE}" xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/"><item id="{prefix}{id}" restricted="true"><dc:title>{title}</dc:title><upnp:class>{class}</upnp:class><desc id="cdudn" nameSpace="{CDUDN_NAMESPACE}">SA_RINCON{serial}_X_#Svc{serial}-{account_id}-Token</desc></item></DIDL-Lite>"#,
            id = urlencoding::encode(&content_id),
            title = soap_client::xml::escape(&result.title),
            account_id = account.account_id,
        ))
    }

    /// Artist radio is not available through SMAPI for every account tier;
    /// queue the artist's top tracks instead.
    fn play_artist_top_tracks(&self, player: &Player, artist: &str) -> Result<()> {
        let market = self.market(None);
        let artist_uri = self.artist_id(artist, market.as_deref())?;
        let artist_id = artist_uri
            .rsplit(':')
            .next()
            .ok_or_else(|| MusicError::Parse(format!("bad artist uri {artist_uri}")))?;

        let mut url = format!("/v1/artists/{artist_id}/top-tracks");
        if let Some(market) = &market {
            url.push_str(&format!("?market={market}"));
        }
        let body: TopTracksResponse = self
            .api_get(&url)?
            .json()
            .map_err(|e| MusicError::Parse(e.to_string()))?;
        if body.tracks.is_empty() {
            return Err(MusicError::NotFound(format!("top tracks for '{artist}'")));
        }

        player.clear_queue()?;
        for track in body.tracks {
            let result = SearchResult {
                kind: SearchKind::Song,
                id: track.uri,
                title: track.name,
                artist: None,
                album: None,
            };
            player.add_uri_to_queue(
                &self.uri_for(&result)?,
                &self.metadata_for(&result)?,
                false,
                0,
            )?;
        }
        let queue_uri = format!("x-rincon-queue:{}#0", player.uuid);
        player.set_av_transport_uri(&queue_uri, "")?;
        player.play()?;
        Ok(())
    }
}

fn available_in(markets: &Option<Vec<String>>, market: Option<&str>) -> bool {
    match (markets, market) {
        (Some(markets), Some(market)) => {
            markets.is_empty() || markets.iter().any(|m| m == market)
        }
        _ => true,
    }
}

// Web API response shapes (the slice of them we read)

#[derive(Debug, Deserialize)]
struct SearchResponse {
    tracks: Option<Page<TrackObject>>,
    albums: Option<Page<AlbumObject>>,
    artists: Option<Page<ArtistObject>>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct TrackObject {
    name: String,
    uri: String,
    #[serde(default)]
    artists: Vec<ArtistObject>,
    album: Option<AlbumObject>,
    #[serde(default)]
    available_markets: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct AlbumObject {
    name: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    artists: Vec<ArtistObject>,
    #[serde(default)]
    available_markets: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ArtistObject {
    name: String,
    #[serde(default)]
    uri: String,
}

#[derive(Debug, Deserialize)]
struct TopTracksResponse {
    #[serde(default)]
    tracks: Vec<TrackObject>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ServicesCache;
    use soap_client::SoapClient;
    use sonos_discovery::Discovery;
    use sonos_topology::TopologyManager;

    fn adapter_with(config: SpotifyConfig, base: &str) -> SpotifySearch {
        let dir = std::env::temp_dir().join("spotify-adapter-test-cache.json");
        let services = Arc::new(ServicesCache::new(
            Arc::new(SoapClient::new()),
            Arc::new(Discovery::new().unwrap()),
            Arc::new(TopologyManager::new()),
            dir,
        ));
        SpotifySearch::with_api_base(
            Arc::new(AccountExtractor::new(services)),
            config,
            base.to_string(),
        )
    }

    #[test]
    fn test_unconfigured_search_is_rejected() {
        let adapter = adapter_with(SpotifyConfig::default(), DEFAULT_API_BASE);
        assert!(matches!(
            adapter.search(SearchKind::Song, "harvest moon", None),
            Err(MusicError::Unconfigured(_))
        ));
        assert!(!adapter.is_configured());
    }

    #[test]
    fn test_track_uri_carries_stream_flags() {
        let adapter = adapter_with(SpotifyConfig::default(), DEFAULT_API_BASE);
        let result = SearchResult {
            kind: SearchKind::Song,
            id: "spotify:track:3BQHpFgAp4l80e1XslIjNI".to_string(),
            title: "Harvest Moon".to_string(),
            artist: Some("Neil Young".to_string()),
            album: None,
        };
        let uri = adapter.uri_for(&result).unwrap();
        assert_eq!(
            uri,
            "x-sonos-spotify:spotify%3Atrack%3A3BQHpFgAp4l80e1XslIjNI?sid=12&flags=8224&sn=1"
        );
    }

    #[test]
    fn test_album_uri_uses_container_prefix() {
        let adapter = adapter_with(SpotifyConfig::default(), DEFAULT_API_BASE);
        let result = SearchResult {
            kind: SearchKind::Album,
            id: "spotify:album:5S9b2SsOsIxrCf8IBRrUwD".to_string(),
            title: "Harvest Moon".to_string(),
            artist: None,
            album: None,
        };
        let uri = adapter.uri_for(&result).unwrap();
        assert!(uri.starts_with("x-rincon-cpcontainer:1004206cspotify%3Aalbum%3A"));
        assert!(uri.contains("flags=108"));
    }

    #[test]
    fn test_artist_radio_uri_and_metadata() {
        let adapter = adapter_with(SpotifyConfig::default(), DEFAULT_API_BASE);
        let result = SearchResult {
            kind: SearchKind::Station,
            id: "spotify:artist:6v8FB84lnmJs434UJf2Mrm".to_string(),
            title: "Santana".to_string(),
            artist: None,
            album: None,
        };
        let uri = adapter.uri_for(&result).unwrap();
        assert!(uri.starts_with("x-sonosapi-radio:spotify%3AartistRadio%3A"));
        assert!(uri.contains("flags=8200"));

        let metadata = adapter.metadata_for(&result).unwrap();
        assert!(metadata.contains("000c206c"));
        assert!(metadata.contains("#artistRadio"));
        assert!(metadata.contains("SA_RINCON3079_X_#Svc3079-0-Token"));
    }

    #[test]
    fn test_search_parses_and_filters_by_market() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", mockito::Matcher::Regex("/v1/search.*".to_string()))
            .with_status(200)
            .with_body(
                r#"{"tracks": {"items": [
                    {"name": "Harvest Moon", "uri": "spotify:track:aaa", "artists": [{"name": "Neil Young", "uri": "spotify:artist:x"}], "album": {"name": "Harvest Moon", "uri": "spotify:album:y"}, "available_markets": ["US", "CA"]},
                    {"name": "Unavailable", "uri": "spotify:track:bbb", "artists": [], "album": null, "available_markets": ["JP"]}
                ]}}"#,
            )
            .create();

        let adapter = adapter_with(
            SpotifyConfig {
                bearer_token: Some("token".to_string()),
                market: Some("US".to_string()),
            },
            &server.url(),
        );
        let results = adapter
            .search(SearchKind::Song, "harvest moon", None)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Harvest Moon");
        assert_eq!(results[0].artist.as_deref(), Some("Neil Young"));
    }

    #[test]
    fn test_auth_failure_is_classified() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", mockito::Matcher::Regex("/v1/search.*".to_string()))
            .with_status(401)
            .with_body(r#"{"error": {"status": 401}}"#)
            .create();

        let adapter = adapter_with(
            SpotifyConfig {
                bearer_token: Some("expired".to_string()),
                market: None,
            },
            &server.url(),
        );
        let err = adapter
            .search(SearchKind::Song, "anything", None)
            .unwrap_err();
        assert!(matches!(err, MusicError::Auth(_)));
        assert!(err.triggers_backoff());
    }

    #[test]
    fn test_api_query_uses_field_qualifiers() {
        let query = StructuredQuery::parse("track:old man artist:neil young");
        assert_eq!(SpotifySearch::api_query(&query), "old man artist:neil young");
    }
}
