//! Per-player control handle.
//!
//! Every method is a thin SOAP call with argument validation; state flows
//! back through the event bus, not through these calls.

use std::sync::Arc;

use serde::Serialize;

use soap_client::{xml, CallOptions, SoapClient};
use sonos_discovery::{normalize_uuid, Device};
use sonos_eventing::didl::DidlLite;
use sonos_eventing::PlayMode;

use crate::browse::{BrowseItem, BrowseResult};
use crate::error::{PlayerError, Result};

const AV_TRANSPORT_TYPE: &str = "urn:schemas-upnp-org:service:AVTransport:1";
const AV_TRANSPORT_PATH: &str = "/MediaRenderer/AVTransport/Control";

const RENDERING_TYPE: &str = "urn:schemas-upnp-org:service:RenderingControl:1";
const RENDERING_PATH: &str = "/MediaRenderer/RenderingControl/Control";

const CONTENT_DIRECTORY_TYPE: &str = "urn:schemas-upnp-org:service:ContentDirectory:1";
const CONTENT_DIRECTORY_PATH: &str = "/MediaServer/ContentDirectory/Control";

/// Default page size for browse calls.
pub const BROWSE_PAGE_SIZE: u32 = 100;

/// Transport info returned by `GetTransportInfo`.
#[derive(Debug, Clone, Serialize)]
pub struct TransportInfo {
    pub current_transport_state: String,
    pub current_transport_status: String,
    pub current_speed: String,
}

/// Transport settings returned by `GetTransportSettings`.
#[derive(Debug, Clone, Serialize)]
pub struct TransportSettings {
    pub play_mode: String,
    pub rec_quality_mode: Option<String>,
}

/// Position info returned by `GetPositionInfo`.
#[derive(Debug, Clone, Serialize)]
pub struct PositionInfo {
    pub track: u32,
    pub duration: Option<String>,
    pub rel_time: Option<String>,
    pub track_uri: Option<String>,
    pub track_title: Option<String>,
}

/// Result of `AddURIToQueue`.
#[derive(Debug, Clone, Serialize)]
pub struct AddToQueueResult {
    pub first_track_num_enqueued: u32,
    pub num_tracks_added: u32,
    pub new_queue_length: u32,
}

/// Handle for one player. Cheap to clone; the registry remains the owner
/// of device identity.
#[derive(Clone)]
pub struct Player {
    pub uuid: String,
    pub room_name: String,
    pub model_name: String,
    pub base_url: String,
    soap: Arc<SoapClient>,
}

impl Player {
    pub fn from_device(device: &Device, soap: Arc<SoapClient>) -> Self {
        Self {
            uuid: normalize_uuid(&device.id),
            room_name: device.room_name.clone(),
            model_name: device.model_name.clone(),
            base_url: device.base_url.clone(),
            soap,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn avt(
        &self,
        action: &str,
        arguments: &[(&str, &str)],
        opts: CallOptions,
    ) -> Result<xmltree::Element> {
        Ok(self.soap.call(
            &self.endpoint(AV_TRANSPORT_PATH),
            AV_TRANSPORT_TYPE,
            action,
            arguments,
            opts,
        )?)
    }

    fn rendering(&self, action: &str, arguments: &[(&str, &str)]) -> Result<xmltree::Element> {
        Ok(self.soap.call(
            &self.endpoint(RENDERING_PATH),
            RENDERING_TYPE,
            action,
            arguments,
            CallOptions::default(),
        )?)
    }

    // ========================================================================
    // Transport
    // ========================================================================

    pub fn play(&self) -> Result<()> {
        self.avt(
            "Play",
            &[("InstanceID", "0"), ("Speed", "1")],
            CallOptions::default(),
        )?;
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        self.avt("Pause", &[("InstanceID", "0")], CallOptions::default())?;
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.avt("Stop", &[("InstanceID", "0")], CallOptions::default())?;
        Ok(())
    }

    pub fn next(&self) -> Result<()> {
        self.avt(
            "Next",
            &[("InstanceID", "0")],
            CallOptions {
                idempotent: false,
                within_discovery_grace: false,
            },
        )?;
        Ok(())
    }

    pub fn previous(&self) -> Result<()> {
        self.avt(
            "Previous",
            &[("InstanceID", "0")],
            CallOptions {
                idempotent: false,
                within_discovery_grace: false,
            },
        )?;
        Ok(())
    }

    /// Seek to a queue position (1-based).
    pub fn seek_track(&self, track: u32) -> Result<()> {
        if track == 0 {
            return Err(PlayerError::InvalidArgument(
                "track numbers are 1-based".to_string(),
            ));
        }
        let target = track.to_string();
        self.avt(
            "Seek",
            &[
                ("InstanceID", "0"),
                ("Unit", "TRACK_NR"),
                ("Target", &target),
            ],
            CallOptions::default(),
        )?;
        Ok(())
    }

    /// Seek within the current track, `H:MM:SS`.
    pub fn seek_time(&self, target: &str) -> Result<()> {
        self.avt(
            "Seek",
            &[
                ("InstanceID", "0"),
                ("Unit", "REL_TIME"),
                ("Target", target),
            ],
            CallOptions::default(),
        )?;
        Ok(())
    }

    pub fn set_av_transport_uri(&self, uri: &str, metadata: &str) -> Result<()> {
        self.avt(
            "SetAVTransportURI",
            &[
                ("InstanceID", "0"),
                ("CurrentURI", uri),
                ("CurrentURIMetaData", metadata),
            ],
            CallOptions::default(),
        )?;
        Ok(())
    }

    pub fn get_transport_info(&self) -> Result<TransportInfo> {
        let response = self.avt("GetTransportInfo", &[("InstanceID", "0")], CallOptions::default())?;
        Ok(TransportInfo {
            current_transport_state: xml::child_text(&response, "CurrentTransportState")
                .ok_or_else(|| PlayerError::Response("missing CurrentTransportState".to_string()))?,
            current_transport_status: xml::child_text(&response, "CurrentTransportStatus")
                .unwrap_or_default(),
            current_speed: xml::child_text(&response, "CurrentSpeed").unwrap_or_default(),
        })
    }

    pub fn get_transport_settings(&self) -> Result<TransportSettings> {
        let response =
            self.avt("GetTransportSettings", &[("InstanceID", "0")], CallOptions::default())?;
        Ok(TransportSettings {
            play_mode: xml::child_text(&response, "PlayMode")
                .ok_or_else(|| PlayerError::Response("missing PlayMode".to_string()))?,
            rec_quality_mode: xml::child_text(&response, "RecQualityMode"),
        })
    }

    pub fn get_position_info(&self) -> Result<PositionInfo> {
        let response = self.avt("GetPositionInfo", &[("InstanceID", "0")], CallOptions::default())?;
        let track_title = xml::child_text(&response, "TrackMetaData")
            .filter(|meta| meta != "NOT_IMPLEMENTED" && !meta.is_empty())
            .and_then(|meta| DidlLite::from_xml(&meta).ok())
            .and_then(|didl| didl.first_item().and_then(|item| item.title.clone()));
        Ok(PositionInfo {
            track: xml::child_parse(&response, "Track").unwrap_or(0),
            duration: xml::child_text(&response, "TrackDuration"),
            rel_time: xml::child_text(&response, "RelTime"),
            track_uri: xml::child_text(&response, "TrackURI"),
            track_title,
        })
    }

    pub fn set_play_mode(&self, mode: PlayMode) -> Result<()> {
        self.avt(
            "SetPlayMode",
            &[("InstanceID", "0"), ("NewPlayMode", mode.to_wire())],
            CallOptions::default(),
        )?;
        Ok(())
    }

    pub fn get_crossfade_mode(&self) -> Result<bool> {
        let response =
            self.avt("GetCrossfadeMode", &[("InstanceID", "0")], CallOptions::default())?;
        Ok(xml::child_text(&response, "CrossfadeMode").as_deref() == Some("1"))
    }

    pub fn set_crossfade(&self, enabled: bool) -> Result<()> {
        self.avt(
            "SetCrossfadeMode",
            &[
                ("InstanceID", "0"),
                ("CrossfadeMode", if enabled { "1" } else { "0" }),
            ],
            CallOptions::default(),
        )?;
        Ok(())
    }

    /// Arm the sleep timer. Zero seconds cancels any existing timer.
    pub fn configure_sleep_timer(&self, seconds: u32) -> Result<()> {
        let duration = if seconds == 0 {
            String::new()
        } else {
            format!(
                "{:02}:{:02}:{:02}",
                seconds / 3600,
                (seconds % 3600) / 60,
                seconds % 60
            )
        };
        self.avt(
            "ConfigureSleepTimer",
            &[("InstanceID", "0"), ("NewSleepTimerDuration", &duration)],
            CallOptions::default(),
        )?;
        Ok(())
    }

    // ========================================================================
    // Queue
    // ========================================================================

    pub fn add_uri_to_queue(
        &self,
        uri: &str,
        metadata: &str,
        as_next: bool,
        position: u32,
    ) -> Result<AddToQueueResult> {
        let position = position.to_string();
        let response = self.avt(
            "AddURIToQueue",
            &[
                ("InstanceID", "0"),
                ("EnqueuedURI", uri),
                ("EnqueuedURIMetaData", metadata),
                ("DesiredFirstTrackNumberEnqueued", &position),
                ("EnqueueAsNext", if as_next { "1" } else { "0" }),
            ],
            CallOptions {
                idempotent: false,
                within_discovery_grace: false,
            },
        )?;
        Ok(AddToQueueResult {
            first_track_num_enqueued: xml::child_parse(&response, "FirstTrackNumberEnqueued")
                .unwrap_or(0),
            num_tracks_added: xml::child_parse(&response, "NumTracksAdded").unwrap_or(0),
            new_queue_length: xml::child_parse(&response, "NewQueueLength").unwrap_or(0),
        })
    }

    pub fn clear_queue(&self) -> Result<()> {
        self.avt(
            "RemoveAllTracksFromQueue",
            &[("InstanceID", "0")],
            CallOptions::default(),
        )?;
        Ok(())
    }

    pub fn get_queue(&self, offset: u32, limit: u32) -> Result<BrowseResult> {
        self.browse("Q:0", offset, limit)
    }

    // ========================================================================
    // Grouping
    // ========================================================================

    pub fn become_coordinator_of_standalone_group(&self) -> Result<()> {
        self.avt(
            "BecomeCoordinatorOfStandaloneGroup",
            &[("InstanceID", "0")],
            CallOptions::default(),
        )?;
        Ok(())
    }

    /// Join the group coordinated by `coordinator_uuid`.
    pub fn add_player_to_group(&self, coordinator_uuid: &str) -> Result<()> {
        let uri = format!("x-rincon:{}", normalize_uuid(coordinator_uuid));
        self.set_av_transport_uri(&uri, "")
    }

    /// Play the analog line-in of `source_uuid` (defaults to this player).
    pub fn play_line_in(&self, source_uuid: Option<&str>) -> Result<()> {
        let source = normalize_uuid(source_uuid.unwrap_or(&self.uuid));
        let uri = format!("x-rincon-stream:{source}");
        self.set_av_transport_uri(&uri, "")?;
        self.play()
    }

    // ========================================================================
    // Rendering
    // ========================================================================

    pub fn get_volume(&self) -> Result<u8> {
        let response = self.rendering(
            "GetVolume",
            &[("InstanceID", "0"), ("Channel", "Master")],
        )?;
        xml::child_parse(&response, "CurrentVolume")
            .ok_or_else(|| PlayerError::Response("missing CurrentVolume".to_string()))
    }

    pub fn set_volume(&self, volume: u8) -> Result<()> {
        if volume > 100 {
            return Err(PlayerError::InvalidArgument(format!(
                "volume {volume} out of range 0..100"
            )));
        }
        let volume = volume.to_string();
        self.rendering(
            "SetVolume",
            &[
                ("InstanceID", "0"),
                ("Channel", "Master"),
                ("DesiredVolume", &volume),
            ],
        )?;
        Ok(())
    }

    /// Adjust volume by a signed delta; the device clamps at 0 and 100 and
    /// reports the value it settled on.
    pub fn set_relative_volume(&self, delta: i16) -> Result<u8> {
        if !(-100..=100).contains(&delta) {
            return Err(PlayerError::InvalidArgument(format!(
                "volume delta {delta} out of range"
            )));
        }
        let delta = delta.to_string();
        let response = self.rendering(
            "SetRelativeVolume",
            &[
                ("InstanceID", "0"),
                ("Channel", "Master"),
                ("Adjustment", &delta),
            ],
        )?;
        xml::child_parse(&response, "NewVolume")
            .ok_or_else(|| PlayerError::Response("missing NewVolume".to_string()))
    }

    pub fn get_mute(&self) -> Result<bool> {
        let response =
            self.rendering("GetMute", &[("InstanceID", "0"), ("Channel", "Master")])?;
        Ok(xml::child_text(&response, "CurrentMute").as_deref() == Some("1"))
    }

    pub fn set_mute(&self, mute: bool) -> Result<()> {
        self.rendering(
            "SetMute",
            &[
                ("InstanceID", "0"),
                ("Channel", "Master"),
                ("DesiredMute", if mute { "1" } else { "0" }),
            ],
        )?;
        Ok(())
    }

    pub fn get_bass(&self) -> Result<i8> {
        let response = self.rendering("GetBass", &[("InstanceID", "0")])?;
        xml::child_parse(&response, "CurrentBass")
            .ok_or_else(|| PlayerError::Response("missing CurrentBass".to_string()))
    }

    pub fn set_bass(&self, bass: i8) -> Result<()> {
        if !(-10..=10).contains(&bass) {
            return Err(PlayerError::InvalidArgument(format!(
                "bass {bass} out of range -10..10"
            )));
        }
        let bass = bass.to_string();
        self.rendering("SetBass", &[("InstanceID", "0"), ("DesiredBass", &bass)])?;
        Ok(())
    }

    pub fn get_treble(&self) -> Result<i8> {
        let response = self.rendering("GetTreble", &[("InstanceID", "0")])?;
        xml::child_parse(&response, "CurrentTreble")
            .ok_or_else(|| PlayerError::Response("missing CurrentTreble".to_string()))
    }

    pub fn set_treble(&self, treble: i8) -> Result<()> {
        if !(-10..=10).contains(&treble) {
            return Err(PlayerError::InvalidArgument(format!(
                "treble {treble} out of range -10..10"
            )));
        }
        let treble = treble.to_string();
        self.rendering(
            "SetTreble",
            &[("InstanceID", "0"), ("DesiredTreble", &treble)],
        )?;
        Ok(())
    }

    pub fn set_loudness(&self, enabled: bool) -> Result<()> {
        self.rendering(
            "SetLoudness",
            &[
                ("InstanceID", "0"),
                ("Channel", "Master"),
                ("DesiredLoudness", if enabled { "1" } else { "0" }),
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // Browse
    // ========================================================================

    /// Browse a content-directory container, one page.
    pub fn browse(&self, object_id: &str, offset: u32, limit: u32) -> Result<BrowseResult> {
        let offset = offset.to_string();
        let limit = limit.to_string();
        let response = self.soap.call(
            &self.endpoint(CONTENT_DIRECTORY_PATH),
            CONTENT_DIRECTORY_TYPE,
            "Browse",
            &[
                ("ObjectID", object_id),
                ("BrowseFlag", "BrowseDirectChildren"),
                ("Filter", "*"),
                ("StartingIndex", &offset),
                ("RequestedCount", &limit),
                ("SortCriteria", ""),
            ],
            CallOptions::default(),
        )?;

        let number_returned = xml::child_parse(&response, "NumberReturned").unwrap_or(0);
        let total_matches = xml::child_parse(&response, "TotalMatches").unwrap_or(0);
        let didl = match xml::child_text(&response, "Result") {
            Some(result) if !result.trim().is_empty() => DidlLite::from_xml(&result)
                .map_err(|e| PlayerError::Response(format!("bad browse DIDL: {e}")))?,
            _ => DidlLite::default(),
        };
        Ok(BrowseResult::from_didl(didl, number_returned, total_matches))
    }

    /// Browse every page of a container.
    pub fn browse_all(&self, object_id: &str) -> Result<BrowseResult> {
        let mut all = BrowseResult::default();
        let mut offset = 0u32;
        loop {
            let page = self.browse(object_id, offset, BROWSE_PAGE_SIZE)?;
            let fetched = page.number_returned;
            all.total_matches = page.total_matches;
            all.items.extend(page.items);
            offset += fetched;
            if fetched == 0 || offset >= page.total_matches {
                break;
            }
        }
        all.number_returned = all.items.len() as u32;
        Ok(all)
    }

    /// Device favourites (`FV:2`).
    pub fn get_favorites(&self) -> Result<BrowseResult> {
        self.browse_all("FV:2")
    }

    /// Saved queues a.k.a. playlists (`SQ:`).
    pub fn get_playlists(&self) -> Result<BrowseResult> {
        self.browse_all("SQ:")
    }

    /// Resolve a favourite by name and start playing it.
    pub fn play_favorite(&self, name: &str) -> Result<BrowseItem> {
        let favorites = self.get_favorites()?;
        let favorite = favorites
            .find_by_title(name)
            .cloned()
            .ok_or_else(|| PlayerError::NotFound(format!("favorite '{name}'")))?;
        let uri = favorite
            .uri
            .as_deref()
            .ok_or_else(|| PlayerError::Response("favorite has no resource".to_string()))?;
        self.set_av_transport_uri(uri, favorite.metadata.as_deref().unwrap_or(""))?;
        self.play()?;
        Ok(favorite)
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("uuid", &self.uuid)
            .field("room_name", &self.room_name)
            .field("model_name", &self.model_name)
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player_for(url: &str) -> Player {
        Player {
            uuid: "RINCON_TEST".to_string(),
            room_name: "Kitchen".to_string(),
            model_name: "Sonos One".to_string(),
            base_url: url.to_string(),
            soap: Arc::new(SoapClient::new()),
        }
    }

    fn envelope(action: &str, inner: &str) -> String {
        format!(
            r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:{action}Response xmlns:u="urn:schemas-upnp-org:service:AVTransport:1">{inner}</u:{action}Response></s:Body></s:Envelope>"#
        )
    }

    #[test]
    fn test_volume_validation_rejects_out_of_range() {
        let player = player_for("http://127.0.0.1:9");
        assert!(matches!(
            player.set_volume(101),
            Err(PlayerError::InvalidArgument(_))
        ));
        assert!(matches!(
            player.set_relative_volume(101),
            Err(PlayerError::InvalidArgument(_))
        ));
        assert!(matches!(
            player.set_bass(11),
            Err(PlayerError::InvalidArgument(_))
        ));
        assert!(matches!(
            player.seek_track(0),
            Err(PlayerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_play_sends_transport_action() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/MediaRenderer/AVTransport/Control")
            .match_header(
                "soapaction",
                "\"urn:schemas-upnp-org:service:AVTransport:1#Play\"",
            )
            .with_status(200)
            .with_body(envelope("Play", ""))
            .create();

        let player = player_for(&server.url());
        player.play().unwrap();
        mock.assert();
    }

    #[test]
    fn test_get_transport_info() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/MediaRenderer/AVTransport/Control")
            .with_status(200)
            .with_body(envelope(
                "GetTransportInfo",
                "<CurrentTransportState>PAUSED_PLAYBACK</CurrentTransportState><CurrentTransportStatus>OK</CurrentTransportStatus><CurrentSpeed>1</CurrentSpeed>",
            ))
            .create();

        let player = player_for(&server.url());
        let info = player.get_transport_info().unwrap();
        assert_eq!(info.current_transport_state, "PAUSED_PLAYBACK");
        assert_eq!(info.current_transport_status, "OK");
    }

    #[test]
    fn test_add_uri_to_queue_parses_counters() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/MediaRenderer/AVTransport/Control")
            .with_status(200)
            .with_body(envelope(
                "AddURIToQueue",
                "<FirstTrackNumberEnqueued>7</FirstTrackNumberEnqueued><NumTracksAdded>1</NumTracksAdded><NewQueueLength>7</NewQueueLength>",
            ))
            .create();

        let player = player_for(&server.url());
        let result = player
            .add_uri_to_queue("x-sonos-spotify:track", "", false, 0)
            .unwrap();
        assert_eq!(result.first_track_num_enqueued, 7);
        assert_eq!(result.new_queue_length, 7);
    }

    #[test]
    fn test_browse_parses_result_didl() {
        let didl = r#"&lt;DIDL-Lite xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/"&gt;&lt;item id="Q:0/1"&gt;&lt;dc:title&gt;Song One&lt;/dc:title&gt;&lt;res duration="0:03:00"&gt;x-file-cifs://nas/song.mp3&lt;/res&gt;&lt;/item&gt;&lt;/DIDL-Lite&gt;"#;
        let body = format!(
            r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:BrowseResponse xmlns:u="urn:schemas-upnp-org:service:ContentDirectory:1"><Result>{didl}</Result><NumberReturned>1</NumberReturned><TotalMatches>1</TotalMatches><UpdateID>3</UpdateID></u:BrowseResponse></s:Body></s:Envelope>"#
        );

        let mut server = mockito::Server::new();
        server
            .mock("POST", "/MediaServer/ContentDirectory/Control")
            .with_status(200)
            .with_body(body)
            .create();

        let player = player_for(&server.url());
        let result = player.get_queue(0, 10).unwrap();
        assert_eq!(result.total_matches, 1);
        assert_eq!(result.items[0].title.as_deref(), Some("Song One"));
        assert_eq!(result.items[0].duration_ms, Some(180_000));
        assert_eq!(
            result.items[0].uri.as_deref(),
            Some("x-file-cifs://nas/song.mp3")
        );
    }

    #[test]
    fn test_sleep_timer_formats_duration() {
        // 0 cancels with an empty duration; others use H:MM:SS
        let mut server = mockito::Server::new();
        let cancel = server
            .mock("POST", "/MediaRenderer/AVTransport/Control")
            .match_body(mockito::Matcher::Regex(
                "<NewSleepTimerDuration></NewSleepTimerDuration>".to_string(),
            ))
            .with_status(200)
            .with_body(envelope("ConfigureSleepTimer", ""))
            .create();

        let player = player_for(&server.url());
        player.configure_sleep_timer(0).unwrap();
        cancel.assert();

        let timed = server
            .mock("POST", "/MediaRenderer/AVTransport/Control")
            .match_body(mockito::Matcher::Regex(
                "<NewSleepTimerDuration>01:01:05</NewSleepTimerDuration>".to_string(),
            ))
            .with_status(200)
            .with_body(envelope("ConfigureSleepTimer", ""))
            .create();
        player.configure_sleep_timer(3665).unwrap();
        timed.assert();
    }

    #[test]
    fn test_add_player_to_group_builds_rincon_uri() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/MediaRenderer/AVTransport/Control")
            .match_body(mockito::Matcher::Regex(
                "<CurrentURI>x-rincon:RINCON_COORD</CurrentURI>".to_string(),
            ))
            .with_status(200)
            .with_body(envelope("SetAVTransportURI", ""))
            .create();

        let player = player_for(&server.url());
        player.add_player_to_group("uuid:RINCON_COORD").unwrap();
        mock.assert();
    }
}
