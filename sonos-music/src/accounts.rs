//! Per-household service account mining.
//!
//! Newer firmware exposes no API for service account identifiers, but every
//! favourite written by the vendor app embeds them: the session number and
//! service id travel in the favourite URI's query string, the account token
//! in the DIDL `desc` element, and the container prefixes in
//! `x-rincon-cpcontainer:` URIs. This component digs them out of the
//! favourites container and caches them per account.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use sonos_player::Player;

use crate::error::Result;
use crate::services::ServicesCache;

/// Marker identifying Spotify-sourced favourites.
const SPOTIFY_URI_MARKER: &str = "spotify";

/// Fallback container prefixes used when no favourite reveals them.
pub const DEFAULT_ALBUM_PREFIX: &str = "1004206c";
pub const DEFAULT_PLAYLIST_PREFIX: &str = "1006286c";

/// Identifiers for one service account instance on the household.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceAccount {
    /// Service id as used in playback URIs
    pub sid: u32,
    /// Session (serial) number of this account instance
    pub sn: u32,
    /// Account token fragment from the favourite's `desc` element
    pub account_id: String,
    /// Hex container prefix for album playback URIs
    pub album_prefix: String,
    /// Hex container prefix for playlist playback URIs
    pub playlist_prefix: String,
}

impl ServiceAccount {
    /// The token serial embedded in DIDL `desc` elements: `sid * 256 + 7`.
    pub fn token_serial(&self) -> u32 {
        self.sid * 256 + 7
    }
}

/// Mines Spotify-class account identifiers from device favourites.
pub struct AccountExtractor {
    services: Arc<ServicesCache>,
    /// Accounts keyed by session number
    accounts: RwLock<HashMap<u32, ServiceAccount>>,
}

impl AccountExtractor {
    pub fn new(services: Arc<ServicesCache>) -> Self {
        Self {
            services,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// All extracted accounts, ordered by session number.
    pub fn accounts(&self) -> Vec<ServiceAccount> {
        let mut accounts: Vec<ServiceAccount> =
            self.accounts.read().unwrap().values().cloned().collect();
        accounts.sort_by_key(|account| account.sn);
        accounts
    }

    /// The account to use by default (lowest session number), if any were
    /// mined.
    pub fn default_account(&self) -> Option<ServiceAccount> {
        self.accounts().into_iter().next()
    }

    pub fn account_for_session(&self, sn: u32) -> Option<ServiceAccount> {
        self.accounts.read().unwrap().get(&sn).cloned()
    }

    /// Browse the favourites container on `player` and extract account
    /// identifiers from every Spotify-sourced entry. Falls back to
    /// hard-coded container prefixes when favourites reveal none.
    pub fn extract(&self, player: &Player) -> Result<Vec<ServiceAccount>> {
        let favorites = player.get_favorites()?;

        let mut mined: HashMap<u32, ServiceAccount> = HashMap::new();
        let mut album_prefix: Option<String> = None;
        let mut playlist_prefix: Option<String> = None;

        for item in &favorites.items {
            let Some(uri) = item.uri.as_deref() else {
                continue;
            };
            if !uri.contains(SPOTIFY_URI_MARKER) {
                continue;
            }

            let query = parse_uri_query(uri);
            let uri_sid = query.get("sid").and_then(|v| v.parse::<u32>().ok());
            let sn = query.get("sn").and_then(|v| v.parse::<u32>().ok());

            if let Some(prefix) = container_prefix(uri) {
                if uri.contains("%3aalbum%3a") || uri.contains(":album:") {
                    album_prefix.get_or_insert(prefix);
                } else if uri.contains("%3aplaylist%3a") || uri.contains(":playlist:") {
                    playlist_prefix.get_or_insert(prefix);
                }
            }

            let token = item
                .metadata
                .as_deref()
                .and_then(parse_account_token)
                .or_else(|| item.desc.as_deref().and_then(parse_account_token));

            let (sid, account_id) = match token {
                // The SID encoded in the token supersedes the URI's
                Some((serial, account_id)) => (serial_to_sid(serial), account_id),
                None => match uri_sid {
                    Some(sid) => (sid, "0".to_string()),
                    None => continue,
                },
            };
            let Some(sn) = sn else { continue };

            mined
                .entry(sn)
                .and_modify(|account| {
                    if account.account_id == "0" && account_id != "0" {
                        account.account_id = account_id.clone();
                        account.sid = sid;
                    }
                })
                .or_insert(ServiceAccount {
                    sid,
                    sn,
                    account_id,
                    album_prefix: DEFAULT_ALBUM_PREFIX.to_string(),
                    playlist_prefix: DEFAULT_PLAYLIST_PREFIX.to_string(),
                });
        }

        if mined.is_empty() {
            tracing::warn!("no favourites revealed service accounts, playback URIs may be refused");
        }
        if album_prefix.is_none() && playlist_prefix.is_none() && !mined.is_empty() {
            tracing::warn!("no container prefixes found in favourites, using defaults");
        }

        let album_prefix = album_prefix.unwrap_or_else(|| DEFAULT_ALBUM_PREFIX.to_string());
        let playlist_prefix =
            playlist_prefix.unwrap_or_else(|| DEFAULT_PLAYLIST_PREFIX.to_string());
        for account in mined.values_mut() {
            account.album_prefix = album_prefix.clone();
            account.playlist_prefix = playlist_prefix.clone();
            // Keep the services table aware of ids only favourites reveal
            if self.services.get_by_id(account.sid).is_none() {
                if let Err(err) = self
                    .services
                    .add_discovered_service_id(account.sid, "Spotify")
                {
                    tracing::debug!(sid = account.sid, "could not register discovered sid: {err}");
                }
            }
        }

        let accounts: Vec<ServiceAccount> = {
            let mut sorted: Vec<ServiceAccount> = mined.values().cloned().collect();
            sorted.sort_by_key(|account| account.sn);
            sorted
        };
        *self.accounts.write().unwrap() = mined;
        Ok(accounts)
    }
}

/// Parse `key=value` pairs from a playback URI's query string.
fn parse_uri_query(uri: &str) -> HashMap<String, String> {
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

/// Extract the hex container prefix from an `x-rincon-cpcontainer:` URI:
/// the run of hex digits between the scheme and the service id text.
fn container_prefix(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("x-rincon-cpcontainer:")?;
    let prefix: String = rest
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    (prefix.len() >= 8).then(|| prefix[..8].to_string())
}

/// Find the `SA_RINCON<serial>_X_#Svc<serial>-<accountId>-Token` pattern
/// inside DIDL metadata and return (serial, accountId).
fn parse_account_token(metadata: &str) -> Option<(u32, String)> {
    let start = metadata.find("SA_RINCON")?;
    let rest = &metadata[start + "SA_RINCON".len()..];
    let serial: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let serial: u32 = serial.parse().ok()?;

    let svc_marker = rest.find("#Svc")?;
    let after_svc = &rest[svc_marker + "#Svc".len()..];
    let after_serial = after_svc.trim_start_matches(|c: char| c.is_ascii_digit());
    let after_dash = after_serial.strip_prefix('-')?;
    let token_end = after_dash.find("-Token")?;
    Some((serial, after_dash[..token_end].to_string()))
}

/// The token serial encodes the service id in its upper byte.
fn serial_to_sid(serial: u32) -> u32 {
    if serial > 255 {
        serial / 256
    } else {
        serial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri_query() {
        let query = parse_uri_query(
            "x-sonos-spotify:spotify%3atrack%3aabc?sid=12&flags=8224&sn=3",
        );
        assert_eq!(query.get("sid").map(String::as_str), Some("12"));
        assert_eq!(query.get("sn").map(String::as_str), Some("3"));
        assert!(parse_uri_query("no-query-here").is_empty());
    }

    #[test]
    fn test_container_prefix() {
        assert_eq!(
            container_prefix("x-rincon-cpcontainer:1004206cspotify%3aalbum%3aabc?sid=12&sn=3"),
            Some("1004206c".to_string())
        );
        assert_eq!(
            container_prefix("x-sonos-spotify:spotify%3atrack%3aabc"),
            None
        );
        assert_eq!(container_prefix("x-rincon-cpcontainer:12"), None);
    }

    #[test]
    fn test_parse_account_token() {
        let metadata = r#"<desc id="cdudn" nameSpace="urn:schemas-rinconnetworks-com:metadata-1-0/">SA_RINCON3079_X_#Svc3079-8e1b3c42-Token</desc>"#;
        let (serial, account) = parse_account_token(metadata).unwrap();
        assert_eq!(serial, 3079);
        assert_eq!(account, "8e1b3c42");
        assert_eq!(serial_to_sid(serial), 12);
    }

    #[test]
    fn test_parse_account_token_rejects_garbage() {
        assert!(parse_account_token("no token here").is_none());
        assert!(parse_account_token("SA_RINCONabc").is_none());
    }

    #[test]
    fn test_token_serial_round_trip() {
        let account = ServiceAccount {
            sid: 12,
            sn: 3,
            account_id: "x".to_string(),
            album_prefix: DEFAULT_ALBUM_PREFIX.to_string(),
            playlist_prefix: DEFAULT_PLAYLIST_PREFIX.to_string(),
        };
        assert_eq!(account.token_serial(), 3079);
        assert_eq!(serial_to_sid(account.token_serial()), 12);
    }
}
