//! Content-directory browse results.

use serde::Serialize;

use sonos_eventing::didl::{DidlLite, parse_duration_ms};

/// One browsable entry: a queue track, favourite, playlist or container.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BrowseItem {
    pub id: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_art_uri: Option<String>,
    pub uri: Option<String>,
    pub duration_ms: Option<u64>,
    pub class: Option<String>,
    /// Transport metadata carried by favourites (`r:resMD`), replayed
    /// when the entry is played
    pub metadata: Option<String>,
    /// Service descriptor element, used for account mining
    pub desc: Option<String>,
}

/// Result page of a Browse action.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BrowseResult {
    pub items: Vec<BrowseItem>,
    pub number_returned: u32,
    pub total_matches: u32,
}

impl BrowseResult {
    /// Build from a parsed DIDL-Lite document plus the response counters.
    pub fn from_didl(didl: DidlLite, number_returned: u32, total_matches: u32) -> Self {
        let mut items = Vec::with_capacity(didl.items.len() + didl.containers.len());

        for item in didl.items {
            let (uri, duration_ms) = match &item.res {
                Some(res) => (
                    res.uri.clone(),
                    res.duration.as_deref().and_then(parse_duration_ms),
                ),
                None => (None, None),
            };
            items.push(BrowseItem {
                id: item.id,
                title: item.title,
                artist: item.creator,
                album: item.album,
                album_art_uri: item.album_art_uri,
                uri,
                duration_ms,
                class: item.class,
                metadata: item.res_md,
                desc: item.desc.and_then(|desc| desc.text),
            });
        }

        for container in didl.containers {
            let uri = container.res.as_ref().and_then(|res| res.uri.clone());
            items.push(BrowseItem {
                id: container.id,
                title: container.title,
                artist: container.creator,
                album: None,
                album_art_uri: container.album_art_uri,
                uri,
                duration_ms: None,
                class: container.class,
                metadata: None,
                desc: None,
            });
        }

        Self {
            items,
            number_returned,
            total_matches,
        }
    }

    /// Case-insensitive title lookup, used by favourite/playlist routes.
    pub fn find_by_title(&self, title: &str) -> Option<&BrowseItem> {
        self.items.iter().find(|item| {
            item.title
                .as_deref()
                .map(|t| t.eq_ignore_ascii_case(title))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAVORITES_DIDL: &str = r#"<DIDL-Lite xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/" xmlns:r="urn:schemas-rinconnetworks-com:metadata-1-0/" xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/"><item id="FV:2/13" parentID="FV:2" restricted="false"><dc:title>Morning Jazz</dc:title><upnp:class>object.itemobject.item.sonos-favorite</upnp:class><r:ordinal>2</r:ordinal><res protocolInfo="sonos.com-spotify:*:audio/x-spotify:*">x-sonos-spotify:spotify%3aplaylist%3aabc?sid=12&amp;flags=108&amp;sn=3</res><r:resMD>&lt;DIDL-Lite&gt;&lt;item&gt;&lt;dc:title&gt;Morning Jazz&lt;/dc:title&gt;&lt;/item&gt;&lt;/DIDL-Lite&gt;</r:resMD></item></DIDL-Lite>"#;

    #[test]
    fn test_from_didl_favorites() {
        let didl = DidlLite::from_xml(FAVORITES_DIDL).unwrap();
        let result = BrowseResult::from_didl(didl, 1, 1);
        assert_eq!(result.items.len(), 1);

        let item = &result.items[0];
        assert_eq!(item.title.as_deref(), Some("Morning Jazz"));
        assert!(item.uri.as_deref().unwrap().contains("flags=108"));
        // resMD decodes to a DIDL document, replayed as transport metadata
        assert!(item.metadata.as_deref().unwrap().contains("<DIDL-Lite>"));
    }

    #[test]
    fn test_find_by_title_case_insensitive() {
        let didl = DidlLite::from_xml(FAVORITES_DIDL).unwrap();
        let result = BrowseResult::from_didl(didl, 1, 1);
        assert!(result.find_by_title("morning jazz").is_some());
        assert!(result.find_by_title("MORNING JAZZ").is_some());
        assert!(result.find_by_title("Evening Jazz").is_none());
    }
}
