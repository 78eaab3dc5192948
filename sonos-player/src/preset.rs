//! Preset execution.
//!
//! A preset is a declarative action recipe: which rooms to gather into a
//! group, at which volumes, and what to start playing. Execution is the
//! one place in the player layer that consults the event bus, because the
//! grouping steps need the transport to settle before the next command.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use soap_client::SoapClient;
use sonos_discovery::Discovery;
use sonos_eventing::EventManager;

use crate::error::{PlayerError, Result};
use crate::player::Player;

/// How long a grouping step may take to leave TRANSITIONING.
const STABILIZE_TIMEOUT: Duration = Duration::from_secs(5);

/// One room participating in a preset, with an optional target volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetMember {
    #[serde(rename = "roomName")]
    pub room_name: String,
    #[serde(default)]
    pub volume: Option<u8>,
}

/// A declarative action recipe. The first member becomes the group
/// coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preset {
    pub players: Vec<PresetMember>,
    /// Content by direct URI, with optional transport metadata
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub metadata: Option<String>,
    /// Content by favourite name, resolved against the coordinator
    #[serde(default)]
    pub favorite: Option<String>,
    /// Start playback once the group is assembled (default true)
    #[serde(default = "default_play")]
    pub play: bool,
}

fn default_play() -> bool {
    true
}

/// Services a preset needs beyond the players themselves.
pub struct PresetContext {
    pub discovery: Arc<Discovery>,
    pub events: Arc<EventManager>,
    pub soap: Arc<SoapClient>,
}

impl Preset {
    /// Execute the preset: isolate the coordinator, pull members in, set
    /// volumes, load content, play.
    pub fn execute(&self, ctx: &PresetContext) -> Result<()> {
        let first = self
            .players
            .first()
            .ok_or_else(|| PlayerError::InvalidArgument("preset has no players".to_string()))?;

        let coordinator = self.resolve(ctx, &first.room_name)?;
        tracing::info!(room = %coordinator.room_name, "executing preset");

        // The coordinator leaves its current group first; failure here is
        // routine (it may already be standalone).
        if let Err(err) = coordinator.become_coordinator_of_standalone_group() {
            tracing::debug!(room = %coordinator.room_name, "standalone step skipped: {err}");
        }
        ctx.events
            .wait_for_stable_state(&coordinator.uuid, STABILIZE_TIMEOUT);

        if let Some(volume) = first.volume {
            coordinator.set_volume(volume)?;
        }

        for member in &self.players[1..] {
            let player = self.resolve(ctx, &member.room_name)?;
            player.add_player_to_group(&coordinator.uuid)?;
            ctx.events
                .wait_for_stable_state(&player.uuid, STABILIZE_TIMEOUT);
            if let Some(volume) = member.volume {
                player.set_volume(volume)?;
            }
        }

        if let Some(favorite) = &self.favorite {
            if self.play {
                coordinator.play_favorite(favorite)?;
            }
        } else if let Some(uri) = &self.uri {
            coordinator.set_av_transport_uri(uri, self.metadata.as_deref().unwrap_or(""))?;
            if self.play {
                coordinator.play()?;
            }
        } else if self.play {
            coordinator.play()?;
        }

        Ok(())
    }

    fn resolve(&self, ctx: &PresetContext, room: &str) -> Result<Player> {
        let device = ctx
            .discovery
            .registry()
            .get_by_room(room)
            .ok_or_else(|| PlayerError::UnknownRoom(room.to_string()))?;
        Ok(Player::from_device(&device, Arc::clone(&ctx.soap)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_deserializes_from_json() {
        let json = r#"{
            "players": [
                {"roomName": "Kitchen", "volume": 25},
                {"roomName": "Den"}
            ],
            "favorite": "Morning Jazz"
        }"#;
        let preset: Preset = serde_json::from_str(json).unwrap();
        assert_eq!(preset.players.len(), 2);
        assert_eq!(preset.players[0].room_name, "Kitchen");
        assert_eq!(preset.players[0].volume, Some(25));
        assert_eq!(preset.players[1].volume, None);
        assert_eq!(preset.favorite.as_deref(), Some("Morning Jazz"));
        assert!(preset.play);
    }

    #[test]
    fn test_preset_without_players_is_rejected() {
        let preset = Preset::default();
        let ctx = PresetContext {
            discovery: Arc::new(Discovery::new().unwrap()),
            events: Arc::new(EventManager::new(Arc::new(
                sonos_topology::TopologyManager::new(),
            ))),
            soap: Arc::new(SoapClient::new()),
        };
        assert!(matches!(
            preset.execute(&ctx),
            Err(PlayerError::InvalidArgument(_))
        ));
    }
}
