//! Saved radio-station catalogue.
//!
//! Stations come from two sources: the household's favourites (mined from
//! the device) and the service's own API. The two lists merge into one
//! name-indexed table; favourite-sourced records win on conflict. API
//! refresh failures of the auth/quota kind put the manager into a
//! multi-hour backoff during which only favourites refreshes run, so the
//! table stays usable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use sonos_player::Player;

use crate::error::Result;
use crate::persist;

/// Favourites refresh cadence.
pub const FAVORITES_REFRESH_PERIOD: Duration = Duration::from_secs(5 * 60);

/// API refresh cadence.
pub const API_REFRESH_PERIOD: Duration = Duration::from_secs(24 * 3600);

/// Backoff entered after an auth/quota failure from the API.
pub const API_BACKOFF: Duration = Duration::from_secs(6 * 3600);

/// Where a station record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationSource {
    Favorite,
    Api,
    Both,
}

/// One saved station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationRecord {
    pub station_id: String,
    pub station_name: String,
    pub uri: Option<String>,
    pub metadata: Option<String>,
    pub source: StationSource,
    pub session_number: Option<u32>,
    pub flags: Option<u32>,
}

/// Upstream list source. The concrete API client lives behind this seam so
/// the manager's merge/backoff behavior is independent of any one service.
pub trait StationApi: Send + Sync {
    fn fetch_stations(&self) -> Result<Vec<StationRecord>>;
}

/// A thin REST implementation of [`StationApi`]: a bearer-authenticated
/// JSON endpoint returning `[{stationId, stationName}]`.
pub struct RestStationApi {
    http: reqwest::blocking::Client,
    endpoint: String,
    bearer_token: String,
}

impl RestStationApi {
    pub fn new(endpoint: String, bearer_token: String) -> Self {
        Self {
            http: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            endpoint,
            bearer_token,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiStation {
    #[serde(rename = "stationId")]
    station_id: String,
    #[serde(rename = "stationName")]
    station_name: String,
}

impl StationApi for RestStationApi {
    fn fetch_stations(&self) -> Result<Vec<StationRecord>> {
        let response = self
            .http
            .get(&self.endpoint)
            .bearer_auth(&self.bearer_token)
            .send()
            .map_err(|e| crate::error::MusicError::Http(e.to_string()))?;
        match response.status().as_u16() {
            200..=299 => {}
            401 | 403 => {
                return Err(crate::error::MusicError::Auth(
                    "station API rejected credentials".to_string(),
                ))
            }
            429 => {
                return Err(crate::error::MusicError::Quota(
                    "station API rate limit".to_string(),
                ))
            }
            status => {
                return Err(crate::error::MusicError::Http(format!(
                    "station API status {status}"
                )))
            }
        }
        let stations: Vec<ApiStation> = response
            .json()
            .map_err(|e| crate::error::MusicError::Parse(e.to_string()))?;
        Ok(stations
            .into_iter()
            .map(|station| StationRecord {
                station_id: station.station_id,
                station_name: station.station_name,
                uri: None,
                metadata: None,
                source: StationSource::Api,
                session_number: None,
                flags: None,
            })
            .collect())
    }
}

/// Merged, name-indexed station table.
pub struct SavedStationManager {
    table: RwLock<HashMap<String, StationRecord>>,
    cache_path: PathBuf,
    api: Option<Box<dyn StationApi>>,
    /// URI marker identifying this service's favourites
    favorite_marker: String,
    backoff_until: Mutex<Option<Instant>>,
}

impl SavedStationManager {
    pub fn new(
        cache_path: PathBuf,
        api: Option<Box<dyn StationApi>>,
        favorite_marker: impl Into<String>,
    ) -> Self {
        let manager = Self {
            table: RwLock::new(HashMap::new()),
            cache_path,
            api,
            favorite_marker: favorite_marker.into(),
            backoff_until: Mutex::new(None),
        };
        if let Some(persisted) = persist::load_json::<Vec<StationRecord>>(&manager.cache_path) {
            let mut table = manager.table.write().unwrap();
            for record in persisted {
                table.insert(record.station_id.clone(), record);
            }
            tracing::info!(count = table.len(), "station table loaded from disk");
        }
        manager
    }

    pub fn stations(&self) -> Vec<StationRecord> {
        let mut stations: Vec<StationRecord> =
            self.table.read().unwrap().values().cloned().collect();
        stations.sort_by(|a, b| a.station_name.cmp(&b.station_name));
        stations
    }

    pub fn len(&self) -> usize {
        self.table.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().unwrap().is_empty()
    }

    /// Name lookup ladder: exact (case-insensitive), prefix, substring,
    /// word-start. First hit wins.
    pub fn find_station(&self, name: &str) -> Option<StationRecord> {
        let needle = name.to_lowercase();
        let table = self.table.read().unwrap();
        let mut stations: Vec<&StationRecord> = table.values().collect();
        stations.sort_by(|a, b| a.station_name.cmp(&b.station_name));

        if let Some(hit) = stations
            .iter()
            .find(|s| s.station_name.to_lowercase() == needle)
        {
            return Some((*hit).clone());
        }
        if let Some(hit) = stations
            .iter()
            .find(|s| s.station_name.to_lowercase().starts_with(&needle))
        {
            return Some((*hit).clone());
        }
        if let Some(hit) = stations
            .iter()
            .find(|s| s.station_name.to_lowercase().contains(&needle))
        {
            return Some((*hit).clone());
        }
        stations
            .iter()
            .find(|s| {
                s.station_name
                    .to_lowercase()
                    .split_whitespace()
                    .any(|word| word.starts_with(&needle))
            })
            .map(|hit| (*hit).clone())
    }

    /// Merge station-shaped favourites into the table. Favourite-sourced
    /// entries supersede API-sourced ones of the same id, tagged `both`.
    pub fn refresh_from_favorites(&self, player: &Player) -> Result<usize> {
        let favorites = player.get_favorites()?;
        let mut merged = 0usize;
        {
            let mut table = self.table.write().unwrap();
            for item in &favorites.items {
                let Some(uri) = item.uri.as_deref() else { continue };
                if !uri.contains(&self.favorite_marker) {
                    continue;
                }
                let Some(station_id) = station_id_from_uri(uri) else {
                    continue;
                };
                let Some(name) = item.title.clone() else { continue };
                let query = parse_query(uri);
                let record = StationRecord {
                    station_id: station_id.clone(),
                    station_name: name,
                    uri: Some(uri.to_string()),
                    metadata: item.metadata.clone(),
                    source: match table.get(&station_id).map(|r| r.source) {
                        Some(StationSource::Api) | Some(StationSource::Both) => {
                            StationSource::Both
                        }
                        _ => StationSource::Favorite,
                    },
                    session_number: query.get("sn").and_then(|v| v.parse().ok()),
                    flags: query.get("flags").and_then(|v| v.parse().ok()),
                };
                table.insert(station_id, record);
                merged += 1;
            }
        }
        self.persist()?;
        tracing::debug!(merged, "favourites merged into station table");
        Ok(merged)
    }

    /// Refresh from the upstream API, honoring the backoff window.
    /// API-sourced entries never override favourite-sourced ones.
    pub fn refresh_from_api(&self) -> Result<usize> {
        if self.is_in_backoff() {
            tracing::debug!("station API refresh skipped: in backoff");
            return Ok(0);
        }
        let Some(api) = &self.api else {
            return Ok(0);
        };

        let stations = match api.fetch_stations() {
            Ok(stations) => stations,
            Err(err) if err.triggers_backoff() => {
                *self.backoff_until.lock().unwrap() = Some(Instant::now() + API_BACKOFF);
                tracing::warn!(
                    backoff_hours = API_BACKOFF.as_secs() / 3600,
                    "station API refresh failed, backing off: {err}"
                );
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let count = stations.len();
        {
            let mut table = self.table.write().unwrap();
            for station in stations {
                match table.get_mut(&station.station_id) {
                    Some(existing) => {
                        if existing.source == StationSource::Favorite {
                            existing.source = StationSource::Both;
                        }
                    }
                    None => {
                        table.insert(station.station_id.clone(), station);
                    }
                }
            }
        }
        self.persist()?;
        tracing::info!(count, "station table refreshed from API");
        Ok(count)
    }

    pub fn is_in_backoff(&self) -> bool {
        self.backoff_remaining().is_some()
    }

    pub fn backoff_remaining(&self) -> Option<Duration> {
        let mut backoff = self.backoff_until.lock().unwrap();
        match *backoff {
            Some(until) => {
                let remaining = until.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    *backoff = None;
                    None
                } else {
                    Some(remaining)
                }
            }
            None => None,
        }
    }

    fn persist(&self) -> Result<()> {
        persist::save_json(&self.cache_path, &self.stations())
    }
}

/// Extract the station id from a favourite URI like
/// `x-sonosapi-radio:ST%3a42?sid=236&flags=8300&sn=1`.
fn station_id_from_uri(uri: &str) -> Option<String> {
    let rest = uri.split_once(':').map(|(_, rest)| rest)?;
    let id = rest.split('?').next()?;
    if id.is_empty() {
        return None;
    }
    Some(
        urlencoding::decode(id)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| id.to_string()),
    )
}

fn parse_query(uri: &str) -> HashMap<String, String> {
    let Some((_, query)) = uri.split_once('?') else {
        return HashMap::new();
    };
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeApi {
        calls: Arc<AtomicUsize>,
        response: std::result::Result<Vec<StationRecord>, &'static str>,
    }

    impl StationApi for FakeApi {
        fn fetch_stations(&self) -> Result<Vec<StationRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(stations) => Ok(stations.clone()),
                Err("auth") => Err(crate::error::MusicError::Auth("bad creds".to_string())),
                Err(other) => Err(crate::error::MusicError::Http(other.to_string())),
            }
        }
    }

    fn api_station(id: &str, name: &str) -> StationRecord {
        StationRecord {
            station_id: id.to_string(),
            station_name: name.to_string(),
            uri: None,
            metadata: None,
            source: StationSource::Api,
            session_number: None,
            flags: None,
        }
    }

    fn manager_with_api(
        response: std::result::Result<Vec<StationRecord>, &'static str>,
    ) -> (SavedStationManager, Arc<AtomicUsize>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = SavedStationManager::new(
            dir.path().join("pandora-stations.json"),
            Some(Box::new(FakeApi {
                calls: Arc::clone(&calls),
                response,
            })),
            "x-sonosapi-radio",
        );
        (manager, calls, dir)
    }

    #[test]
    fn test_api_refresh_populates_table() {
        let (manager, _, _dir) = manager_with_api(Ok(vec![
            api_station("ST:1", "Classic Rock Radio"),
            api_station("ST:2", "Jazz 24"),
        ]));
        assert_eq!(manager.refresh_from_api().unwrap(), 2);
        assert_eq!(manager.len(), 2);
        assert_eq!(
            manager.find_station("jazz 24").unwrap().station_id,
            "ST:2"
        );
    }

    #[test]
    fn test_find_station_priority_ladder() {
        let (manager, _, _dir) = manager_with_api(Ok(vec![
            api_station("ST:1", "Rock"),
            api_station("ST:2", "Rock Classics"),
            api_station("ST:3", "Smooth Jazz"),
            api_station("ST:4", "The Best of Rock"),
        ]));
        manager.refresh_from_api().unwrap();

        // Exact beats prefix
        assert_eq!(manager.find_station("rock").unwrap().station_id, "ST:1");
        // Prefix beats substring
        assert_eq!(
            manager.find_station("rock c").unwrap().station_id,
            "ST:2"
        );
        // Substring
        assert_eq!(manager.find_station("jazz").unwrap().station_id, "ST:3");
        assert_eq!(manager.find_station("bes").unwrap().station_id, "ST:4");
        assert!(manager.find_station("polka").is_none());
    }

    #[test]
    fn test_auth_failure_enters_backoff_and_skips() {
        let (manager, calls, _dir) = manager_with_api(Err("auth"));
        assert!(manager.refresh_from_api().is_err());
        assert!(manager.is_in_backoff());
        assert!(manager.backoff_remaining().unwrap() > Duration::from_secs(3600));

        // Backoff silently skips further API refreshes
        assert_eq!(manager.refresh_from_api().unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_plain_http_failure_does_not_backoff() {
        let (manager, _, _dir) = manager_with_api(Err("boom"));
        assert!(manager.refresh_from_api().is_err());
        assert!(!manager.is_in_backoff());
    }

    #[test]
    fn test_api_does_not_override_favorite() {
        let (manager, _, _dir) = manager_with_api(Ok(vec![api_station("ST:1", "API Name")]));
        {
            let mut table = manager.table.write().unwrap();
            table.insert(
                "ST:1".to_string(),
                StationRecord {
                    station_id: "ST:1".to_string(),
                    station_name: "Favourite Name".to_string(),
                    uri: Some("x-sonosapi-radio:ST%3a1?sid=236&flags=8300&sn=1".to_string()),
                    metadata: None,
                    source: StationSource::Favorite,
                    session_number: Some(1),
                    flags: Some(8300),
                },
            );
        }
        manager.refresh_from_api().unwrap();
        let record = manager.find_station("favourite name").unwrap();
        assert_eq!(record.station_name, "Favourite Name");
        assert_eq!(record.source, StationSource::Both);
    }

    #[test]
    fn test_station_id_from_uri() {
        assert_eq!(
            station_id_from_uri("x-sonosapi-radio:ST%3a42?sid=236&flags=8300&sn=1"),
            Some("ST:42".to_string())
        );
        assert_eq!(station_id_from_uri("no-scheme"), None);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pandora-stations.json");
        {
            let manager =
                SavedStationManager::new(path.clone(), None, "x-sonosapi-radio");
            let mut table = manager.table.write().unwrap();
            table.insert("ST:1".to_string(), api_station("ST:1", "Jazz 24"));
            drop(table);
            manager.persist().unwrap();
        }
        let reloaded = SavedStationManager::new(path, None, "x-sonosapi-radio");
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.find_station("Jazz 24").is_some());
    }
}
