//! DIDL-Lite metadata model.
//!
//! DIDL-Lite documents appear XML-escaped inside event property values and
//! SOAP browse responses. Namespace prefixes are stripped before parsing,
//! so `dc:title` binds to `title`, `upnp:albumArtURI` to `albumArtURI`,
//! `r:resMD` to `resMD`.

use serde::Deserialize;

use crate::error::{EventError, Result};

/// Root of a DIDL-Lite document. Browse responses hold items and/or
/// containers; track metadata holds a single item.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename = "DIDL-Lite")]
pub struct DidlLite {
    #[serde(rename = "item", default)]
    pub items: Vec<DidlItem>,
    #[serde(rename = "container", default)]
    pub containers: Vec<DidlContainer>,
}

/// A playable item.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DidlItem {
    #[serde(rename = "@id", default)]
    pub id: Option<String>,
    #[serde(rename = "@parentID", default)]
    pub parent_id: Option<String>,
    #[serde(rename = "title", default)]
    pub title: Option<String>,
    #[serde(rename = "creator", default)]
    pub creator: Option<String>,
    #[serde(rename = "album", default)]
    pub album: Option<String>,
    #[serde(rename = "albumArtURI", default)]
    pub album_art_uri: Option<String>,
    #[serde(rename = "class", default)]
    pub class: Option<String>,
    #[serde(rename = "streamContent", default)]
    pub stream_content: Option<String>,
    #[serde(rename = "res", default)]
    pub res: Option<DidlRes>,
    /// Escaped transport metadata carried by favourites (`r:resMD`)
    #[serde(rename = "resMD", default)]
    pub res_md: Option<String>,
    /// Service descriptor element used by music-service items
    #[serde(rename = "desc", default)]
    pub desc: Option<DidlDesc>,
}

/// Service descriptor element (`<desc id="cdudn" ...>token</desc>`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DidlDesc {
    #[serde(rename = "@id", default)]
    pub id: Option<String>,
    #[serde(rename = "$text", default)]
    pub text: Option<String>,
}

/// A browsable container (album, playlist, favourites folder).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DidlContainer {
    #[serde(rename = "@id", default)]
    pub id: Option<String>,
    #[serde(rename = "title", default)]
    pub title: Option<String>,
    #[serde(rename = "creator", default)]
    pub creator: Option<String>,
    #[serde(rename = "albumArtURI", default)]
    pub album_art_uri: Option<String>,
    #[serde(rename = "class", default)]
    pub class: Option<String>,
    #[serde(rename = "res", default)]
    pub res: Option<DidlRes>,
}

/// Resource element: URI text plus attributes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DidlRes {
    #[serde(rename = "@duration", default)]
    pub duration: Option<String>,
    #[serde(rename = "@protocolInfo", default)]
    pub protocol_info: Option<String>,
    #[serde(rename = "$text", default)]
    pub uri: Option<String>,
}

impl DidlLite {
    pub fn from_xml(xml: &str) -> Result<Self> {
        sonos_topology::xml_decode::parse(xml).map_err(|e| EventError::Parse(e.to_string()))
    }

    /// The single item of a track-metadata document.
    pub fn first_item(&self) -> Option<&DidlItem> {
        self.items.first()
    }
}

/// Parse a `H:MM:SS[.frac]` duration into milliseconds.
pub fn parse_duration_ms(duration: &str) -> Option<u64> {
    let parts: Vec<&str> = duration.split(':').collect();
    match parts.len() {
        3 => {
            let hours: u64 = parts[0].parse().ok()?;
            let minutes: u64 = parts[1].parse().ok()?;
            let seconds: f64 = parts[2].parse().ok()?;
            Some((hours * 3600 + minutes * 60) * 1000 + (seconds * 1000.0) as u64)
        }
        2 => {
            let minutes: u64 = parts[0].parse().ok()?;
            let seconds: f64 = parts[1].parse().ok()?;
            Some(minutes * 60 * 1000 + (seconds * 1000.0) as u64)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACK_DIDL: &str = r#"<DIDL-Lite xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/" xmlns:r="urn:schemas-rinconnetworks-com:metadata-1-0/" xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/"><item id="-1" parentID="-1" restricted="true"><res protocolInfo="sonos.com-spotify:*:audio/x-spotify:*" duration="0:03:45">x-sonos-spotify:spotify%3atrack%3aabc?sid=12&amp;flags=8224&amp;sn=3</res><r:streamContent></r:streamContent><upnp:albumArtURI>/getaa?s=1</upnp:albumArtURI><dc:title>Harvest Moon</dc:title><upnp:class>object.item.audioItem.musicTrack</upnp:class><dc:creator>Neil Young</dc:creator><upnp:album>Harvest Moon</upnp:album></item></DIDL-Lite>"#;

    #[test]
    fn test_parse_track_metadata() {
        let didl = DidlLite::from_xml(TRACK_DIDL).unwrap();
        let item = didl.first_item().unwrap();
        assert_eq!(item.title.as_deref(), Some("Harvest Moon"));
        assert_eq!(item.creator.as_deref(), Some("Neil Young"));
        assert_eq!(item.album.as_deref(), Some("Harvest Moon"));
        let res = item.res.as_ref().unwrap();
        assert_eq!(res.duration.as_deref(), Some("0:03:45"));
        assert!(res.uri.as_deref().unwrap().starts_with("x-sonos-spotify:"));
    }

    #[test]
    fn test_parse_browse_containers() {
        let xml = r#"<DIDL-Lite xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/"><container id="A:ALBUM/Harvest" parentID="A:ALBUM" restricted="true"><dc:title>Harvest</dc:title><upnp:class xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/">object.container.album.musicAlbum</upnp:class></container></DIDL-Lite>"#;
        let didl = DidlLite::from_xml(xml).unwrap();
        assert_eq!(didl.containers.len(), 1);
        assert_eq!(didl.containers[0].title.as_deref(), Some("Harvest"));
    }

    #[test]
    fn test_parse_duration_ms() {
        assert_eq!(parse_duration_ms("0:03:45"), Some(225_000));
        assert_eq!(parse_duration_ms("1:00:00"), Some(3_600_000));
        assert_eq!(parse_duration_ms("03:45"), Some(225_000));
        assert_eq!(parse_duration_ms("garbage"), None);
    }
}
