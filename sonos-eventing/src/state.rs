//! Player state model maintained by the event bus.

use serde::{Deserialize, Serialize};

/// Transport state of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
    Transitioning,
}

impl PlaybackState {
    /// Parse the wire form (`PAUSED_PLAYBACK` folds into `Paused`).
    pub fn from_wire(value: &str) -> Self {
        match value {
            "PLAYING" => PlaybackState::Playing,
            "PAUSED_PLAYBACK" | "PAUSED" => PlaybackState::Paused,
            "TRANSITIONING" => PlaybackState::Transitioning,
            _ => PlaybackState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackState::Stopped => "STOPPED",
            PlaybackState::Playing => "PLAYING",
            PlaybackState::Paused => "PAUSED",
            PlaybackState::Transitioning => "TRANSITIONING",
        }
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Repeat flavor inside a play mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Repeat {
    #[default]
    None,
    All,
    One,
}

/// Queue play mode: repeat/shuffle plus the crossfade toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlayMode {
    pub repeat: Repeat,
    pub shuffle: bool,
    pub crossfade: bool,
}

impl PlayMode {
    /// Decode the `CurrentPlayMode` wire value. Crossfade travels in a
    /// separate variable and is preserved from the previous mode.
    pub fn from_wire(value: &str, crossfade: bool) -> Self {
        let (repeat, shuffle) = match value {
            "NORMAL" => (Repeat::None, false),
            "REPEAT_ALL" => (Repeat::All, false),
            "REPEAT_ONE" => (Repeat::One, false),
            "SHUFFLE_NOREPEAT" => (Repeat::None, true),
            "SHUFFLE" => (Repeat::All, true),
            "SHUFFLE_REPEAT_ONE" => (Repeat::One, true),
            _ => (Repeat::None, false),
        };
        Self {
            repeat,
            shuffle,
            crossfade,
        }
    }

    /// Encode back to the `CurrentPlayMode` wire value.
    pub fn to_wire(&self) -> &'static str {
        match (self.shuffle, self.repeat) {
            (false, Repeat::None) => "NORMAL",
            (false, Repeat::All) => "REPEAT_ALL",
            (false, Repeat::One) => "REPEAT_ONE",
            (true, Repeat::None) => "SHUFFLE_NOREPEAT",
            (true, Repeat::All) => "SHUFFLE",
            (true, Repeat::One) => "SHUFFLE_REPEAT_ONE",
        }
    }
}

/// Equalizer settings mirrored from RenderingControl events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Equalizer {
    pub bass: i8,
    pub treble: i8,
    pub loudness: bool,
}

/// What is (or will be) playing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackState {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_art_uri: Option<String>,
    pub duration_ms: Option<u64>,
    pub uri: Option<String>,
    /// Stream/station display name for radio-style sources
    pub station_name: Option<String>,
}

impl TrackState {
    /// Track identity for change detection: (uri, title, artist).
    /// Metadata-only churn such as album-art URL rotation is not a change.
    pub fn same_track(&self, other: &TrackState) -> bool {
        self.uri == other.uri && self.title == other.title && self.artist == other.artist
    }

    pub fn is_empty(&self) -> bool {
        self.uri.is_none() && self.title.is_none() && self.artist.is_none()
    }
}

/// Full last-known state of one player. Mutated only by the event manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    pub playback_state: PlaybackState,
    pub volume: u8,
    pub mute: bool,
    pub current_track: Option<TrackState>,
    pub next_track: Option<TrackState>,
    pub play_mode: PlayMode,
    pub equalizer: Equalizer,
    /// Coordinator UUID when the player mirrors another's transport
    pub coordinator_ref: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playback_state_wire_mapping() {
        assert_eq!(PlaybackState::from_wire("PLAYING"), PlaybackState::Playing);
        assert_eq!(
            PlaybackState::from_wire("PAUSED_PLAYBACK"),
            PlaybackState::Paused
        );
        assert_eq!(
            PlaybackState::from_wire("TRANSITIONING"),
            PlaybackState::Transitioning
        );
        assert_eq!(PlaybackState::from_wire("STOPPED"), PlaybackState::Stopped);
        assert_eq!(PlaybackState::from_wire("GARBAGE"), PlaybackState::Stopped);
    }

    #[test]
    fn test_play_mode_round_trip() {
        for wire in [
            "NORMAL",
            "REPEAT_ALL",
            "REPEAT_ONE",
            "SHUFFLE_NOREPEAT",
            "SHUFFLE",
            "SHUFFLE_REPEAT_ONE",
        ] {
            let mode = PlayMode::from_wire(wire, false);
            assert_eq!(mode.to_wire(), wire);
        }
    }

    #[test]
    fn test_play_mode_preserves_crossfade() {
        let mode = PlayMode::from_wire("REPEAT_ALL", true);
        assert!(mode.crossfade);
        assert_eq!(mode.repeat, Repeat::All);
    }

    #[test]
    fn test_track_identity_ignores_art_churn() {
        let a = TrackState {
            title: Some("Song".to_string()),
            artist: Some("Artist".to_string()),
            uri: Some("x-sonos-spotify:track1".to_string()),
            album_art_uri: Some("http://art/1.jpg".to_string()),
            ..Default::default()
        };
        let mut b = a.clone();
        b.album_art_uri = Some("http://art/2.jpg".to_string());
        assert!(a.same_track(&b));

        b.uri = Some("x-sonos-spotify:track2".to_string());
        assert!(!a.same_track(&b));
    }
}
