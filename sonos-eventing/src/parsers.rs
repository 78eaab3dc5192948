//! Typed parsers for NOTIFY bodies.
//!
//! AVTransport and RenderingControl wrap their state in a `LastChange`
//! property whose text is an XML-escaped `Event` document; ContentDirectory
//! reports plain update-id properties.

use serde::de::Deserializer;
use serde::Deserialize;

use sonos_topology::xml_decode;

use crate::didl::{parse_duration_ms, DidlLite};
use crate::error::{EventError, Result};
use crate::state::TrackState;

/// Plain `val` attribute wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct ValueAttribute {
    #[serde(rename = "@val")]
    pub val: String,
}

/// `val` attribute qualified by a channel (volume, mute, loudness).
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelValue {
    #[serde(rename = "@channel", default)]
    pub channel: Option<String>,
    #[serde(rename = "@val")]
    pub val: String,
}

/// `val` attribute whose content is an escaped DIDL-Lite document.
#[derive(Debug, Clone, Deserialize)]
pub struct DidlAttribute {
    #[serde(rename = "@val", deserialize_with = "didl_from_attr", default)]
    pub val: Option<DidlLite>,
}

fn didl_from_attr<'de, D>(deserializer: D) -> std::result::Result<Option<DidlLite>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(match raw {
        Some(raw) if !raw.trim().is_empty() && raw != "NOT_IMPLEMENTED" => {
            // Malformed embedded metadata must not poison the whole event
            DidlLite::from_xml(&raw).ok()
        }
        _ => None,
    })
}

fn select_master(values: &[ChannelValue]) -> Option<&ChannelValue> {
    values
        .iter()
        .find(|value| value.channel.as_deref() == Some("Master"))
        .or_else(|| values.first())
}

// ============================================================================
// AVTransport
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "propertyset")]
struct TransportPropertySet {
    #[serde(rename = "property", default)]
    properties: Vec<TransportProperty>,
}

#[derive(Debug, Clone, Deserialize)]
struct TransportProperty {
    #[serde(
        rename = "LastChange",
        deserialize_with = "xml_decode::deserialize_nested",
        default
    )]
    last_change: Option<TransportLastChange>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "Event")]
struct TransportLastChange {
    #[serde(rename = "InstanceID")]
    instance: TransportInstance,
}

#[derive(Debug, Clone, Deserialize)]
struct TransportInstance {
    #[serde(rename = "TransportState", default)]
    transport_state: Option<ValueAttribute>,

    #[serde(rename = "CurrentPlayMode", default)]
    current_play_mode: Option<ValueAttribute>,

    #[serde(rename = "CurrentCrossfadeMode", default)]
    current_crossfade_mode: Option<ValueAttribute>,

    #[serde(rename = "CurrentTrackURI", default)]
    current_track_uri: Option<ValueAttribute>,

    #[serde(rename = "CurrentTrackDuration", default)]
    current_track_duration: Option<ValueAttribute>,

    #[serde(rename = "CurrentTrackMetaData", default)]
    current_track_metadata: Option<DidlAttribute>,

    #[serde(rename = "NextTrackURI", default)]
    next_track_uri: Option<ValueAttribute>,

    #[serde(rename = "NextTrackMetaData", default)]
    next_track_metadata: Option<DidlAttribute>,

    #[serde(rename = "AVTransportURI", default)]
    av_transport_uri: Option<ValueAttribute>,

    #[serde(rename = "EnqueuedTransportURIMetaData", default)]
    enqueued_metadata: Option<DidlAttribute>,
}

/// Field deltas carried by one AVTransport NOTIFY. `None` means the body
/// did not mention the field.
#[derive(Debug, Clone, Default)]
pub struct TransportDelta {
    pub transport_state: Option<String>,
    pub play_mode: Option<String>,
    pub crossfade: Option<bool>,
    pub current_track: Option<TrackState>,
    pub next_track: Option<TrackState>,
    /// Set when the transport URI points at another player
    /// (`x-rincon:<uuid>`), meaning this player mirrors a coordinator.
    pub coordinator_ref: Option<String>,
}

/// Parse an AVTransport NOTIFY body into field deltas.
pub fn parse_transport_event(body: &str) -> Result<TransportDelta> {
    let set: TransportPropertySet =
        xml_decode::parse(body).map_err(|e| EventError::Parse(e.to_string()))?;
    let Some(instance) = set
        .properties
        .into_iter()
        .find_map(|p| p.last_change)
        .map(|lc| lc.instance)
    else {
        return Ok(TransportDelta::default());
    };

    let current_track = build_track(
        instance.current_track_uri.as_ref(),
        instance.current_track_duration.as_ref(),
        instance.current_track_metadata.as_ref(),
        instance.enqueued_metadata.as_ref(),
    );
    let next_track = build_track(
        instance.next_track_uri.as_ref(),
        None,
        instance.next_track_metadata.as_ref(),
        None,
    );

    let coordinator_ref = instance
        .av_transport_uri
        .as_ref()
        .and_then(|uri| uri.val.strip_prefix("x-rincon:"))
        .map(|uuid| uuid.to_string());

    Ok(TransportDelta {
        transport_state: instance.transport_state.map(|v| v.val),
        play_mode: instance.current_play_mode.map(|v| v.val),
        crossfade: instance.current_crossfade_mode.map(|v| v.val == "1"),
        current_track,
        next_track,
        coordinator_ref,
    })
}

fn build_track(
    uri: Option<&ValueAttribute>,
    duration: Option<&ValueAttribute>,
    metadata: Option<&DidlAttribute>,
    station_metadata: Option<&DidlAttribute>,
) -> Option<TrackState> {
    let uri = uri.map(|v| v.val.clone()).filter(|v| !v.is_empty());
    let item = metadata.and_then(|didl| didl.val.as_ref()).and_then(|didl| didl.first_item());
    if uri.is_none() && item.is_none() {
        return None;
    }

    let duration_ms = duration
        .and_then(|v| parse_duration_ms(&v.val))
        .or_else(|| {
            item.and_then(|i| i.res.as_ref())
                .and_then(|res| res.duration.as_deref())
                .and_then(parse_duration_ms)
        });

    let station_name = station_metadata
        .and_then(|didl| didl.val.as_ref())
        .and_then(|didl| didl.first_item())
        .and_then(|i| i.title.clone());

    Some(TrackState {
        title: item.and_then(|i| i.title.clone()),
        artist: item.and_then(|i| i.creator.clone()),
        album: item.and_then(|i| i.album.clone()),
        album_art_uri: item.and_then(|i| i.album_art_uri.clone()),
        duration_ms,
        uri,
        station_name,
    })
}

// ============================================================================
// RenderingControl
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "propertyset")]
struct RenderingPropertySet {
    #[serde(rename = "property", default)]
    properties: Vec<RenderingProperty>,
}

#[derive(Debug, Clone, Deserialize)]
struct RenderingProperty {
    #[serde(
        rename = "LastChange",
        deserialize_with = "xml_decode::deserialize_nested",
        default
    )]
    last_change: Option<RenderingLastChange>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "Event")]
struct RenderingLastChange {
    #[serde(rename = "InstanceID")]
    instance: RenderingInstance,
}

#[derive(Debug, Clone, Deserialize)]
struct RenderingInstance {
    #[serde(rename = "Volume", default)]
    volume: Vec<ChannelValue>,

    #[serde(rename = "Mute", default)]
    mute: Vec<ChannelValue>,

    #[serde(rename = "Bass", default)]
    bass: Option<ValueAttribute>,

    #[serde(rename = "Treble", default)]
    treble: Option<ValueAttribute>,

    #[serde(rename = "Loudness", default)]
    loudness: Vec<ChannelValue>,
}

/// Field deltas carried by one RenderingControl NOTIFY.
#[derive(Debug, Clone, Default)]
pub struct RenderingDelta {
    pub volume: Option<u8>,
    pub mute: Option<bool>,
    pub bass: Option<i8>,
    pub treble: Option<i8>,
    pub loudness: Option<bool>,
}

/// Parse a RenderingControl NOTIFY body. Master-channel values win; the
/// per-speaker LF/RF values of bonded sets are ignored.
pub fn parse_rendering_event(body: &str) -> Result<RenderingDelta> {
    let set: RenderingPropertySet =
        xml_decode::parse(body).map_err(|e| EventError::Parse(e.to_string()))?;
    let Some(instance) = set
        .properties
        .into_iter()
        .find_map(|p| p.last_change)
        .map(|lc| lc.instance)
    else {
        return Ok(RenderingDelta::default());
    };

    Ok(RenderingDelta {
        volume: select_master(&instance.volume).and_then(|v| v.val.parse().ok()),
        mute: select_master(&instance.mute).map(|v| v.val == "1"),
        bass: instance.bass.and_then(|v| v.val.parse().ok()),
        treble: instance.treble.and_then(|v| v.val.parse().ok()),
        loudness: select_master(&instance.loudness).map(|v| v.val == "1"),
    })
}

// ============================================================================
// ContentDirectory
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "propertyset")]
struct ContentPropertySet {
    #[serde(rename = "property", default)]
    properties: Vec<ContentProperty>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ContentProperty {
    #[serde(rename = "ContainerUpdateIDs", default)]
    container_update_ids: Option<String>,
    #[serde(rename = "FavoritesUpdateID", default)]
    favorites_update_id: Option<String>,
    #[serde(rename = "ShareListUpdateID", default)]
    share_list_update_id: Option<String>,
}

/// Update markers carried by one ContentDirectory NOTIFY.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentDelta {
    pub container_update_ids: Option<String>,
    pub favorites_update_id: Option<String>,
    pub share_list_update_id: Option<String>,
}

impl ContentDelta {
    pub fn is_empty(&self) -> bool {
        self.container_update_ids.is_none()
            && self.favorites_update_id.is_none()
            && self.share_list_update_id.is_none()
    }
}

/// Parse a ContentDirectory NOTIFY body.
pub fn parse_content_event(body: &str) -> Result<ContentDelta> {
    let set: ContentPropertySet =
        xml_decode::parse(body).map_err(|e| EventError::Parse(e.to_string()))?;
    let mut delta = ContentDelta::default();
    for property in set.properties {
        if property.container_update_ids.is_some() {
            delta.container_update_ids = property.container_update_ids;
        }
        if property.favorites_update_id.is_some() {
            delta.favorites_update_id = property.favorites_update_id;
        }
        if property.share_list_update_id.is_some() {
            delta.share_list_update_id = property.share_list_update_id;
        }
    }
    Ok(delta)
}
