//! Evented UPnP services and their endpoint paths.

use serde::Serialize;

/// The services the gateway subscribes to on every player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventService {
    AVTransport,
    RenderingControl,
    ZoneGroupTopology,
    ContentDirectory,
}

impl EventService {
    pub const ALL: [EventService; 4] = [
        EventService::AVTransport,
        EventService::RenderingControl,
        EventService::ZoneGroupTopology,
        EventService::ContentDirectory,
    ];

    /// Event endpoint path on the player.
    pub fn event_path(&self) -> &'static str {
        match self {
            EventService::AVTransport => "/MediaRenderer/AVTransport/Event",
            EventService::RenderingControl => "/MediaRenderer/RenderingControl/Event",
            EventService::ZoneGroupTopology => "/ZoneGroupTopology/Event",
            EventService::ContentDirectory => "/MediaServer/ContentDirectory/Event",
        }
    }

    /// Short tag used in subscription keys and logs.
    pub fn tag(&self) -> &'static str {
        match self {
            EventService::AVTransport => "avt",
            EventService::RenderingControl => "rc",
            EventService::ZoneGroupTopology => "zgt",
            EventService::ContentDirectory => "cd",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "avt" => Some(EventService::AVTransport),
            "rc" => Some(EventService::RenderingControl),
            "zgt" => Some(EventService::ZoneGroupTopology),
            "cd" => Some(EventService::ContentDirectory),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}
