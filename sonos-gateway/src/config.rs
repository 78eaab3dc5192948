//! Typed configuration model.
//!
//! Loading (file discovery, CLI overrides) belongs to the external
//! collaborator; this is the shape it fills in, with the defaults a bare
//! install runs with.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// HTTP basic credentials for the outer listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

/// Credentials for the Spotify-class service. Token exchange is handled
/// by the external OAuth collaborator; the gateway only consumes the
/// resulting bearer token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotifyCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub market: Option<String>,
}

/// Credentials for the saved-station service API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationApiCredentials {
    pub endpoint: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Listener port of the outer HTTP layer
    pub port: u16,
    /// Bind host of the outer HTTP layer
    pub host: Option<String>,
    /// CIDR strings whose peers skip HTTP auth
    pub trusted_networks: Vec<String>,
    /// Room used when a route omits one
    pub default_room: Option<String>,
    /// Music service used when a search route omits one
    pub default_service: String,
    /// Volume used for announcements when the route omits one
    pub announce_volume: u8,
    /// Directory for persisted caches
    pub data_dir: PathBuf,
    /// Library re-index cadence, `<int>(h|d|w)`
    pub reindex_interval: Option<String>,
    /// Age after which cached TTS clips are deleted, hours
    pub tts_cache_max_age_hours: u64,
    /// IP override handed to players for fetching TTS clips; players
    /// cannot resolve hostnames
    pub tts_host_ip: Option<String>,
    pub auth: Option<AuthConfig>,
    pub spotify: SpotifyCredentials,
    pub pandora: StationApiCredentials,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5005,
            host: None,
            trusted_networks: Vec::new(),
            default_room: None,
            default_service: "library".to_string(),
            announce_volume: 40,
            data_dir: PathBuf::from("data"),
            reindex_interval: None,
            tts_cache_max_age_hours: 24,
            tts_host_ip: None,
            auth: None,
            spotify: SpotifyCredentials::default(),
            pandora: StationApiCredentials::default(),
        }
    }
}

impl Config {
    pub fn services_cache_path(&self) -> PathBuf {
        self.data_dir.join("services-cache.json")
    }

    pub fn music_library_path(&self) -> PathBuf {
        self.data_dir.join("music-library.json")
    }

    pub fn stations_path(&self) -> PathBuf {
        self.data_dir.join("pandora-stations.json")
    }

    pub fn tts_cache_dir(&self) -> PathBuf {
        self.data_dir.join("tts")
    }
}
