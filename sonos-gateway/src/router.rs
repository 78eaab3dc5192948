//! Action routing and group semantics.
//!
//! The HTTP dispatcher (external) translates each matched route into one
//! call here. Room-bearing actions resolve the room to the right player:
//! coordinator for playback-affecting commands, the physical player (pair
//! primary for bonded rooms) for volume and mute. Vendor faults that mean
//! "wrong member of a bonded set" are retried down the member ladder.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{json, Value};

use soap_client::SoapClient;
use sonos_discovery::{Device, Discovery};
use sonos_eventing::{EventManager, PlayMode, PlaybackState, SubscriptionManager};
use sonos_music::{
    AccountExtractor, MusicLibrary, MusicService, SavedStationManager, SearchKind, SearchResult,
    ServicesCache,
};
use sonos_player::{Player, Preset, PresetContext};
use sonos_scheduler::{Scheduler, TaskOptions};
use sonos_topology::TopologyManager;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::response::{data, success, success_with};
use crate::tts::TtsProvider;

/// Vendor faults meaning "this member cannot take the command, try
/// another member of the bonded set".
const PAIR_RETRY_CODES: [u16; 2] = [701, 1023];

/// How long playback-verification waits are allowed to take.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on the wait for an announcement clip to finish.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime-adjustable defaults (the `/default` routes).
#[derive(Debug, Clone)]
struct Defaults {
    room: Option<String>,
    service: String,
}

/// Everything the router dispatches into.
pub struct RouterDeps {
    pub soap: Arc<SoapClient>,
    pub discovery: Arc<Discovery>,
    pub topology: Arc<TopologyManager>,
    pub events: Arc<EventManager>,
    pub scheduler: Arc<Scheduler>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub services: Arc<ServicesCache>,
    pub library: Arc<MusicLibrary>,
    pub stations: Arc<SavedStationManager>,
    pub accounts: Arc<AccountExtractor>,
    pub adapters: HashMap<String, Arc<dyn MusicService>>,
    pub tts: Option<Arc<dyn TtsProvider>>,
    pub config: Config,
}

pub struct ActionRouter {
    soap: Arc<SoapClient>,
    discovery: Arc<Discovery>,
    topology: Arc<TopologyManager>,
    events: Arc<EventManager>,
    scheduler: Arc<Scheduler>,
    subscriptions: Arc<SubscriptionManager>,
    services: Arc<ServicesCache>,
    library: Arc<MusicLibrary>,
    stations: Arc<SavedStationManager>,
    accounts: Arc<AccountExtractor>,
    adapters: HashMap<String, Arc<dyn MusicService>>,
    tts: Option<Arc<dyn TtsProvider>>,
    presets: RwLock<HashMap<String, Preset>>,
    defaults: RwLock<Defaults>,
    announce_volume: u8,
}

impl ActionRouter {
    pub fn new(deps: RouterDeps) -> Self {
        Self {
            soap: deps.soap,
            discovery: deps.discovery,
            topology: deps.topology,
            events: deps.events,
            scheduler: deps.scheduler,
            subscriptions: deps.subscriptions,
            services: deps.services,
            library: deps.library,
            stations: deps.stations,
            accounts: deps.accounts,
            adapters: deps.adapters,
            tts: deps.tts,
            presets: RwLock::new(HashMap::new()),
            defaults: RwLock::new(Defaults {
                room: deps.config.default_room.clone(),
                service: deps.config.default_service.clone(),
            }),
            announce_volume: deps.config.announce_volume,
        }
    }

    // ========================================================================
    // Room resolution
    // ========================================================================

    fn resolve_room_name(&self, room: Option<&str>) -> Result<String> {
        match room {
            Some(room) => Ok(room.to_string()),
            None => self
                .defaults
                .read()
                .unwrap()
                .room
                .clone()
                .ok_or_else(|| {
                    GatewayError::Validation(
                        "no room given and no default room configured".to_string(),
                    )
                }),
        }
    }

    fn device_for_room(&self, room: &str) -> Result<Device> {
        self.discovery
            .registry()
            .get_by_room(room)
            .ok_or_else(|| GatewayError::RoomNotFound(room.to_string()))
    }

    fn player_from(&self, device: &Device) -> Player {
        Player::from_device(device, Arc::clone(&self.soap))
    }

    /// The physical player for a room. For bonded rooms this is the pair
    /// primary, never a secondary.
    fn resolve_physical(&self, room: Option<&str>) -> Result<Player> {
        let name = self.resolve_room_name(room)?;
        if let Some(primary) = self.topology.stereo_primary(&name) {
            if let Some(device) = self.discovery.registry().get_by_id(&primary) {
                return Ok(self.player_from(&device));
            }
        }
        let device = self.device_for_room(&name)?;
        Ok(self.player_from(&device))
    }

    /// The player to send playback-affecting commands to: the coordinator
    /// of the room's zone.
    fn resolve_playback(&self, room: Option<&str>) -> Result<Player> {
        let physical = self.resolve_physical(room)?;
        match self.topology.coordinator_of(&physical.uuid) {
            Some(coordinator) if coordinator != physical.uuid => {
                match self.discovery.registry().get_by_id(&coordinator) {
                    Some(device) => Ok(self.player_from(&device)),
                    None => Ok(physical),
                }
            }
            _ => Ok(physical),
        }
    }

    /// Run `op` against the player; on a bonded-set fault (701/1023) walk
    /// the retry ladder: stereo primary first, then each zone member in
    /// order.
    fn with_pair_retry(
        &self,
        player: &Player,
        op: impl Fn(&Player) -> sonos_player::Result<()>,
    ) -> Result<()> {
        let first = op(player);
        let Err(err) = first else { return Ok(()) };
        let retryable = err
            .upnp_code()
            .map(|code| PAIR_RETRY_CODES.contains(&code))
            .unwrap_or(false);
        if !retryable {
            return Err(err.into());
        }
        tracing::debug!(room = %player.room_name, "bonded-set fault, walking member ladder");

        let mut candidates: Vec<String> = Vec::new();
        if let Some(primary) = self.topology.stereo_primary(&player.room_name) {
            candidates.push(primary);
        }
        candidates.extend(self.topology.members_of(&player.uuid));
        candidates.retain(|uuid| *uuid != player.uuid);
        candidates.dedup();

        let mut last: GatewayError = err.into();
        for uuid in candidates {
            let Some(device) = self.discovery.registry().get_by_id(&uuid) else {
                continue;
            };
            match op(&self.player_from(&device)) {
                Ok(()) => return Ok(()),
                Err(err) => last = err.into(),
            }
        }
        Err(last)
    }

    // ========================================================================
    // System queries
    // ========================================================================

    pub fn zones(&self) -> Result<Value> {
        let snapshot = self.topology.snapshot();
        let registry = self.discovery.registry();
        let zones: Vec<Value> = snapshot
            .zones
            .iter()
            .map(|zone| {
                let coordinator_room = zone
                    .members
                    .iter()
                    .find(|member| member.uuid == zone.coordinator)
                    .map(|member| member.room_name.clone())
                    .or_else(|| registry.get_by_id(&zone.coordinator).map(|d| d.room_name))
                    .unwrap_or_else(|| zone.coordinator.clone());
                json!({
                    "id": zone.id,
                    "coordinator": coordinator_room,
                    "members": zone.members.iter().map(|member| json!({
                        "id": format!("uuid:{}", member.uuid),
                        "roomName": member.room_name,
                        "isCoordinator": member.is_coordinator,
                        "invisible": member.invisible,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        Ok(json!(zones))
    }

    pub fn devices(&self) -> Result<Value> {
        Ok(data(&self.discovery.registry().get_all()))
    }

    pub fn device_by_id(&self, id: &str) -> Result<Value> {
        self.discovery
            .registry()
            .get_by_id(id)
            .map(|device| data(&device))
            .ok_or_else(|| GatewayError::NotFound(format!("device '{id}'")))
    }

    pub fn device_by_room(&self, room: &str) -> Result<Value> {
        self.device_for_room(room).map(|device| data(&device))
    }

    /// State of one room's player (last-known, event-fed).
    pub fn state(&self, room: Option<&str>) -> Result<Value> {
        let physical = self.resolve_physical(room)?;
        let coordinator = self.resolve_playback(Some(&physical.room_name))?;
        let state = self
            .events
            .player_state(&physical.uuid)
            .unwrap_or_default();
        let coordinator_state = self
            .events
            .player_state(&coordinator.uuid)
            .unwrap_or_default();
        Ok(json!({
            "roomName": physical.room_name,
            "coordinator": coordinator.room_name,
            "playbackState": coordinator_state.playback_state.as_str(),
            "volume": state.volume,
            "mute": state.mute,
            "currentTrack": coordinator_state.current_track,
            "nextTrack": coordinator_state.next_track,
            "playMode": {
                "repeat": coordinator_state.play_mode.repeat,
                "shuffle": coordinator_state.play_mode.shuffle,
                "crossfade": coordinator_state.play_mode.crossfade,
            },
            "equalizer": state.equalizer,
        }))
    }

    /// State of every visible room, for the system-wide state route.
    pub fn system_state(&self) -> Result<Value> {
        let snapshot = self.topology.snapshot();
        let mut rooms: Vec<Value> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for zone in &snapshot.zones {
            for member in &zone.members {
                if member.invisible || !seen.insert(member.room_name.clone()) {
                    continue;
                }
                if let Ok(state) = self.state(Some(&member.room_name)) {
                    rooms.push(state);
                }
            }
        }
        // Players discovered before the first topology event still count
        for device in self.discovery.registry().get_all() {
            if seen.insert(device.room_name.clone()) {
                if let Ok(state) = self.state(Some(&device.room_name)) {
                    rooms.push(state);
                }
            }
        }
        Ok(json!(rooms))
    }

    pub fn health(&self) -> Result<Value> {
        Ok(json!({
            "status": "success",
            "devices": self.discovery.registry().len(),
            "health": self.events.device_health(),
        }))
    }

    // ========================================================================
    // Transport
    // ========================================================================

    pub fn play(&self, room: Option<&str>) -> Result<Value> {
        let player = self.resolve_playback(room)?;
        player.play()?;
        self.events
            .wait_for_state(&player.uuid, "PLAYING", VERIFY_TIMEOUT);
        Ok(success())
    }

    pub fn pause(&self, room: Option<&str>) -> Result<Value> {
        let player = self.resolve_playback(room)?;
        player.pause()?;
        Ok(success())
    }

    pub fn play_pause(&self, room: Option<&str>) -> Result<Value> {
        let player = self.resolve_playback(room)?;
        let playing = self
            .events
            .current_state(&player.uuid)
            .map(|state| state == PlaybackState::Playing)
            .unwrap_or_else(|| {
                player
                    .get_transport_info()
                    .map(|info| info.current_transport_state == "PLAYING")
                    .unwrap_or(false)
            });
        if playing {
            player.pause()?;
        } else {
            player.play()?;
        }
        Ok(success())
    }

    pub fn stop(&self, room: Option<&str>) -> Result<Value> {
        let player = self.resolve_playback(room)?;
        player.stop()?;
        Ok(success())
    }

    pub fn next(&self, room: Option<&str>) -> Result<Value> {
        self.resolve_playback(room)?.next()?;
        Ok(success())
    }

    pub fn previous(&self, room: Option<&str>) -> Result<Value> {
        self.resolve_playback(room)?.previous()?;
        Ok(success())
    }

    // ========================================================================
    // Volume & mute
    // ========================================================================

    pub fn set_volume(&self, room: Option<&str>, level: i64) -> Result<Value> {
        if !(0..=100).contains(&level) {
            return Err(GatewayError::Validation(format!(
                "volume {level} out of range 0..100"
            )));
        }
        let player = self.resolve_physical(room)?;
        player.set_volume(level as u8)?;
        Ok(success())
    }

    /// Relative volume: `+5` / `-5`, clamped at both ends.
    pub fn adjust_volume(&self, room: Option<&str>, delta: i64) -> Result<Value> {
        if !(-100..=100).contains(&delta) {
            return Err(GatewayError::Validation(format!(
                "volume delta {delta} out of range"
            )));
        }
        let player = self.resolve_physical(room)?;
        let current = player.get_volume()? as i64;
        let clamped = (current + delta).clamp(0, 100) as u8;
        player.set_volume(clamped)?;
        Ok(success_with(json!({ "volume": clamped })))
    }

    /// Set every member of the room's group to the same level.
    pub fn group_volume(&self, room: Option<&str>, level: i64) -> Result<Value> {
        if !(0..=100).contains(&level) {
            return Err(GatewayError::Validation(format!(
                "volume {level} out of range 0..100"
            )));
        }
        let anchor = self.resolve_physical(room)?;
        let members = self.topology.members_of(&anchor.uuid);
        let members = if members.is_empty() {
            vec![anchor.uuid.clone()]
        } else {
            members
        };
        for uuid in members {
            let Some(device) = self.discovery.registry().get_by_id(&uuid) else {
                continue;
            };
            if let Err(err) = self.player_from(&device).set_volume(level as u8) {
                tracing::warn!(room = %device.room_name, "group volume member failed: {err}");
            }
        }
        Ok(success())
    }

    pub fn mute(&self, room: Option<&str>, mute: bool) -> Result<Value> {
        self.resolve_physical(room)?.set_mute(mute)?;
        Ok(success())
    }

    pub fn toggle_mute(&self, room: Option<&str>) -> Result<Value> {
        let player = self.resolve_physical(room)?;
        let current = self
            .events
            .current_mute(&player.uuid)
            .map(Ok)
            .unwrap_or_else(|| player.get_mute())?;
        player.set_mute(!current)?;
        Ok(success_with(json!({ "mute": !current })))
    }

    // ========================================================================
    // Playback modes
    // ========================================================================

    fn current_play_mode(&self, player: &Player) -> PlayMode {
        self.events
            .player_state(&player.uuid)
            .map(|state| state.play_mode)
            .unwrap_or_else(|| {
                player
                    .get_transport_settings()
                    .map(|settings| PlayMode::from_wire(&settings.play_mode, false))
                    .unwrap_or_default()
            })
    }

    pub fn set_repeat(&self, room: Option<&str>, on: bool) -> Result<Value> {
        let player = self.resolve_playback(room)?;
        let mut mode = self.current_play_mode(&player);
        mode.repeat = if on {
            sonos_eventing::Repeat::All
        } else {
            sonos_eventing::Repeat::None
        };
        player.set_play_mode(mode)?;
        Ok(success())
    }

    pub fn set_shuffle(&self, room: Option<&str>, on: bool) -> Result<Value> {
        let player = self.resolve_playback(room)?;
        let mut mode = self.current_play_mode(&player);
        mode.shuffle = on;
        player.set_play_mode(mode)?;
        Ok(success())
    }

    pub fn set_crossfade(&self, room: Option<&str>, on: bool) -> Result<Value> {
        let player = self.resolve_playback(room)?;
        player.set_crossfade(on)?;
        Ok(success())
    }

    /// `sleep/0` cancels any armed timer.
    pub fn sleep(&self, room: Option<&str>, seconds: u32) -> Result<Value> {
        let player = self.resolve_playback(room)?;
        player.configure_sleep_timer(seconds)?;
        Ok(success())
    }

    // ========================================================================
    // Queue
    // ========================================================================

    pub fn queue(
        &self,
        room: Option<&str>,
        limit: Option<u32>,
        offset: Option<u32>,
        detailed: bool,
    ) -> Result<Value> {
        let player = self.resolve_playback(room)?;
        let result = player.get_queue(offset.unwrap_or(0), limit.unwrap_or(500))?;
        if detailed {
            return Ok(data(&result));
        }
        let simple: Vec<Value> = result
            .items
            .iter()
            .map(|item| {
                json!({
                    "title": item.title,
                    "artist": item.artist,
                    "album": item.album,
                    "albumArtUri": item.album_art_uri,
                    "uri": item.uri,
                })
            })
            .collect();
        Ok(json!(simple))
    }

    pub fn clear_queue(&self, room: Option<&str>) -> Result<Value> {
        self.resolve_playback(room)?.clear_queue()?;
        Ok(success())
    }

    /// `POST /{room}/queue` with `{uri, metadata?}`.
    pub fn enqueue(&self, room: Option<&str>, uri: &str, metadata: Option<&str>) -> Result<Value> {
        if uri.is_empty() {
            return Err(GatewayError::Validation("uri must not be empty".to_string()));
        }
        let player = self.resolve_playback(room)?;
        let added = player.add_uri_to_queue(uri, metadata.unwrap_or(""), false, 0)?;
        Ok(success_with(json!({
            "firstTrackNumberEnqueued": added.first_track_num_enqueued,
            "newQueueLength": added.new_queue_length,
        })))
    }

    // ========================================================================
    // Groups
    // ========================================================================

    /// Join `room` to the group containing `target`.
    pub fn join(&self, room: Option<&str>, target: &str) -> Result<Value> {
        let mover = self.resolve_physical(room)?;
        let target_coordinator = self.resolve_playback(Some(target))?;

        // Leaving the old group first is routine; failure just means the
        // player was already standalone.
        let _ = mover.become_coordinator_of_standalone_group();
        self.with_pair_retry(&mover, |player| {
            player.add_player_to_group(&target_coordinator.uuid)
        })?;
        self.events.wait_for_topology_change(VERIFY_TIMEOUT);
        Ok(success())
    }

    /// `add` is `join` with the arguments flipped: pull `other` into
    /// `room`'s group.
    pub fn add(&self, room: Option<&str>, other: &str) -> Result<Value> {
        let anchor = self.resolve_room_name(room)?;
        self.join(Some(other), &anchor)
    }

    /// Detach `room` into its own standalone group. Refused for pure
    /// stereo pairs.
    pub fn leave(&self, room: Option<&str>) -> Result<Value> {
        let player = self.resolve_physical(room)?;
        if let Some(zone) = self.topology.zone_of(&player.uuid) {
            if zone.is_pure_stereo_pair() {
                return Err(GatewayError::StereoPairProtected(player.room_name.clone()));
            }
        }
        self.with_pair_retry(&player, |player| {
            player.become_coordinator_of_standalone_group()
        })?;
        self.events.wait_for_topology_change(VERIFY_TIMEOUT);
        Ok(success())
    }

    /// Pause every group. Coordinators only, in parallel; individual
    /// failures are logged, never propagated.
    pub fn pause_all(&self) -> Result<Value> {
        self.for_all_coordinators("pause-all", |player| player.pause())
    }

    pub fn resume_all(&self) -> Result<Value> {
        self.for_all_coordinators("resume-all", |player| player.play())
    }

    fn for_all_coordinators(
        &self,
        what: &str,
        op: impl Fn(&Player) -> sonos_player::Result<()> + Send + Sync,
    ) -> Result<Value> {
        let registry = self.discovery.registry();
        let coordinators: Vec<Player> = self
            .topology
            .snapshot()
            .zones
            .iter()
            .filter_map(|zone| registry.get_by_id(&zone.coordinator))
            .map(|device| self.player_from(&device))
            .collect();

        std::thread::scope(|scope| {
            for player in &coordinators {
                scope.spawn(|| {
                    if let Err(err) = op(player) {
                        tracing::warn!(room = %player.room_name, "{what} failed: {err}");
                    }
                });
            }
        });
        Ok(success())
    }

    // ========================================================================
    // Favourites & playlists
    // ========================================================================

    pub fn favorites(&self, room: Option<&str>, detailed: bool) -> Result<Value> {
        let player = self.resolve_playback(room)?;
        let favorites = player.get_favorites()?;
        if detailed {
            return Ok(data(&favorites));
        }
        let names: Vec<&str> = favorites
            .items
            .iter()
            .filter_map(|item| item.title.as_deref())
            .collect();
        Ok(json!(names))
    }

    pub fn play_favorite(&self, room: Option<&str>, name: &str) -> Result<Value> {
        let player = self.resolve_playback(room)?;
        player.play_favorite(name)?;
        Ok(success())
    }

    pub fn playlists(&self, room: Option<&str>, detailed: bool) -> Result<Value> {
        let player = self.resolve_playback(room)?;
        let playlists = player.get_playlists()?;
        if detailed {
            return Ok(data(&playlists));
        }
        let names: Vec<&str> = playlists
            .items
            .iter()
            .filter_map(|item| item.title.as_deref())
            .collect();
        Ok(json!(names))
    }

    pub fn play_playlist(&self, room: Option<&str>, name: &str) -> Result<Value> {
        let player = self.resolve_playback(room)?;
        let playlists = player.get_playlists()?;
        let playlist = playlists
            .find_by_title(name)
            .ok_or_else(|| GatewayError::NotFound(format!("playlist '{name}'")))?;

        // Saved queues replace the current queue and play from its head
        let uri = match &playlist.uri {
            Some(uri) => uri.clone(),
            None => {
                let id = playlist
                    .id
                    .as_deref()
                    .and_then(|id| id.strip_prefix("SQ:"))
                    .ok_or_else(|| {
                        GatewayError::Internal(format!("playlist '{name}' has no resource"))
                    })?;
                format!("file:///jffs/settings/savedqueues.rsq#{id}")
            }
        };
        player.clear_queue()?;
        player.add_uri_to_queue(&uri, "", false, 0)?;
        player.set_av_transport_uri(&format!("x-rincon-queue:{}#0", player.uuid), "")?;
        player.play()?;
        Ok(success())
    }

    // ========================================================================
    // Presets
    // ========================================================================

    pub fn set_presets(&self, presets: HashMap<String, Preset>) {
        *self.presets.write().unwrap() = presets;
    }

    pub fn presets(&self, detailed: bool) -> Result<Value> {
        let presets = self.presets.read().unwrap();
        if detailed {
            return Ok(data(&*presets));
        }
        let mut names: Vec<&String> = presets.keys().collect();
        names.sort();
        Ok(json!(names))
    }

    pub fn run_preset(&self, name: &str, room_override: Option<&str>) -> Result<Value> {
        let mut preset = self
            .presets
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("preset '{name}'")))?;
        if let Some(room) = room_override {
            match preset.players.first_mut() {
                Some(first) => first.room_name = room.to_string(),
                None => {
                    return Err(GatewayError::Validation(format!(
                        "preset '{name}' has no players"
                    )))
                }
            }
        }
        let ctx = PresetContext {
            discovery: Arc::clone(&self.discovery),
            events: Arc::clone(&self.events),
            soap: Arc::clone(&self.soap),
        };
        preset.execute(&ctx)?;
        Ok(success())
    }

    // ========================================================================
    // Music search
    // ========================================================================

    fn adapter(&self, service: &str) -> Result<Arc<dyn MusicService>> {
        self.adapters
            .get(&service.to_lowercase())
            .cloned()
            .ok_or_else(|| GatewayError::NotImplemented(format!("music service '{service}'")))
    }

    /// `/{room}/musicsearch/{service}/{kind}/{term}`. With `play=false`
    /// the results come back without starting playback.
    pub fn music_search(
        &self,
        room: Option<&str>,
        service: Option<&str>,
        kind: &str,
        term: &str,
        play: bool,
    ) -> Result<Value> {
        let service = service
            .map(str::to_string)
            .unwrap_or_else(|| self.defaults.read().unwrap().service.clone());
        let adapter = self.adapter(&service)?;
        let kind = SearchKind::parse(kind)
            .ok_or_else(|| GatewayError::Validation(format!("unknown search type '{kind}'")))?;

        let results = adapter.search(kind, term, None)?;
        if results.is_empty() {
            return Err(GatewayError::NotFound(format!("no matches for '{term}'")));
        }
        if !play {
            return Ok(data(&results));
        }

        let player = self.resolve_playback(room)?;
        self.play_search_result(&player, adapter.as_ref(), &results[0])?;
        Ok(success_with(json!({
            "played": results[0].title,
            "service": service,
        })))
    }

    fn play_search_result(
        &self,
        player: &Player,
        adapter: &dyn MusicService,
        result: &SearchResult,
    ) -> Result<()> {
        let uri = adapter.uri_for(result)?;
        let metadata = adapter.metadata_for(result)?;
        match result.kind {
            SearchKind::Song => {
                player.set_av_transport_uri(&uri, &metadata)?;
                player.play()?;
            }
            SearchKind::Album => {
                player.clear_queue()?;
                player.add_uri_to_queue(&uri, &metadata, false, 0)?;
                player.set_av_transport_uri(&format!("x-rincon-queue:{}#0", player.uuid), "")?;
                player.play()?;
            }
            SearchKind::Station | SearchKind::Artist => {
                // Some account tiers refuse direct artist radio; fall back
                // to the artist's top tracks.
                let direct = player
                    .set_av_transport_uri(&uri, &metadata)
                    .and_then(|_| player.play());
                if let Err(err) = direct {
                    tracing::debug!(
                        title = %result.title,
                        "direct station playback refused, queueing top tracks: {err}"
                    );
                    adapter.play_artist_top_tracks(player, &result.title)?;
                }
            }
        }
        self.events
            .wait_for_state(&player.uuid, "PLAYING", VERIFY_TIMEOUT);
        Ok(())
    }

    // ========================================================================
    // Saved stations
    // ========================================================================

    pub fn play_station(&self, room: Option<&str>, name: &str) -> Result<Value> {
        let station = self
            .stations
            .find_station(name)
            .ok_or_else(|| GatewayError::NotFound(format!("station '{name}'")))?;
        let uri = station.uri.clone().unwrap_or_else(|| {
            // API-sourced records carry no favourite URI; build the radio
            // URI from the id
            format!(
                "x-sonosapi-radio:{}?sid=236&flags=8300&sn={}",
                urlencoding::encode(&station.station_id),
                station.session_number.unwrap_or(1)
            )
        });
        let player = self.resolve_playback(room)?;
        player.set_av_transport_uri(&uri, station.metadata.as_deref().unwrap_or(""))?;
        player.play()?;
        Ok(success_with(json!({ "station": station.station_name })))
    }

    pub fn stations(&self, detailed: bool) -> Result<Value> {
        let stations = self.stations.stations();
        if detailed {
            return Ok(data(&stations));
        }
        let names: Vec<&str> = stations
            .iter()
            .map(|station| station.station_name.as_str())
            .collect();
        Ok(json!(names))
    }

    pub fn stations_status(&self) -> Result<Value> {
        Ok(json!({
            "stations": self.stations.len(),
            "inBackoff": self.stations.is_in_backoff(),
            "backoffRemainingSeconds": self.stations.backoff_remaining().map(|d| d.as_secs()),
        }))
    }

    // ========================================================================
    // Library admin
    // ========================================================================

    pub fn library_summary(&self) -> Result<Value> {
        Ok(data(&self.library.summary()))
    }

    pub fn library_detailed(&self) -> Result<Value> {
        let summary = self.library.summary();
        Ok(json!({
            "summary": summary,
            "albumArtists": self.library.album_artists(),
        }))
    }

    /// Kick a background re-index. Returns immediately; the current index
    /// keeps serving until the swap.
    pub fn library_refresh(&self) -> Result<Value> {
        let devices = self.discovery.registry().get_all();
        let Some(device) = devices.first().cloned() else {
            return Err(GatewayError::Internal(
                "no players available to index from".to_string(),
            ));
        };
        let library = Arc::clone(&self.library);
        let soap = Arc::clone(&self.soap);
        self.scheduler.schedule_timeout(
            "library-reindex-now",
            Duration::from_millis(10),
            TaskOptions { unref: true },
            move || {
                let player = Player::from_device(&device, soap);
                if let Err(err) = library.reindex(&player) {
                    tracing::error!("library re-index failed: {err}");
                }
            },
        );
        Ok(success_with(json!({ "indexing": true })))
    }

    // ========================================================================
    // Services
    // ========================================================================

    pub fn services(&self) -> Result<Value> {
        Ok(data(&self.services.get_services()))
    }

    pub fn services_refresh(&self) -> Result<Value> {
        let count = self.services.refresh()?;
        Ok(success_with(json!({ "services": count })))
    }

    // ========================================================================
    // Line-in
    // ========================================================================

    pub fn line_in(&self, room: Option<&str>, source: Option<&str>) -> Result<Value> {
        let player = self.resolve_playback(room)?;
        let source_uuid = match source {
            Some(source_room) => Some(self.device_for_room(source_room)?.id),
            None => None,
        };
        player.play_line_in(source_uuid.as_deref())?;
        Ok(success())
    }

    // ========================================================================
    // TTS announcements
    // ========================================================================

    /// `/{room}/say/{text}[/{volume}]`
    pub fn say(&self, room: Option<&str>, text: &str, volume: Option<u8>) -> Result<Value> {
        let tts = self
            .tts
            .as_ref()
            .ok_or_else(|| GatewayError::NotImplemented("text-to-speech".to_string()))?;
        let clip = tts.synthesize(text, None)?;
        let player = self.resolve_playback(room)?;
        self.announce(&player, &clip.url, clip.duration_ms, volume)?;
        Ok(success())
    }

    /// `/sayall/{text}[/{volume}]`: announce on every group coordinator.
    pub fn say_all(&self, text: &str, volume: Option<u8>) -> Result<Value> {
        let tts = self
            .tts
            .as_ref()
            .ok_or_else(|| GatewayError::NotImplemented("text-to-speech".to_string()))?;
        let clip = tts.synthesize(text, None)?;
        let registry = self.discovery.registry();
        let coordinators: Vec<Player> = self
            .topology
            .snapshot()
            .zones
            .iter()
            .filter_map(|zone| registry.get_by_id(&zone.coordinator))
            .map(|device| self.player_from(&device))
            .collect();

        std::thread::scope(|scope| {
            for player in &coordinators {
                let url = clip.url.clone();
                let duration = clip.duration_ms;
                scope.spawn(move || {
                    if let Err(err) = self.announce(player, &url, duration, volume) {
                        tracing::warn!(room = %player.room_name, "announcement failed: {err}");
                    }
                });
            }
        });
        Ok(success())
    }

    /// Play a clip at announce volume, then restore volume and resume the
    /// queue when something was playing.
    fn announce(
        &self,
        player: &Player,
        url: &str,
        duration_ms: Option<u64>,
        volume: Option<u8>,
    ) -> Result<()> {
        let previous_volume = player.get_volume()?;
        let was_playing = self
            .events
            .current_state(&player.uuid)
            .map(|state| state == PlaybackState::Playing)
            .unwrap_or(false);

        player.set_volume(volume.unwrap_or(self.announce_volume))?;
        player.set_av_transport_uri(url, "")?;
        player.play()?;

        let wait = duration_ms
            .map(|ms| Duration::from_millis(ms + 2000))
            .unwrap_or(ANNOUNCE_TIMEOUT)
            .min(ANNOUNCE_TIMEOUT);
        self.events.wait_for_state(&player.uuid, "STOPPED", wait);

        player.set_volume(previous_volume)?;
        if was_playing {
            let queue_uri = format!("x-rincon-queue:{}#0", player.uuid);
            if player.set_av_transport_uri(&queue_uri, "").is_ok() {
                let _ = player.play();
            }
        }
        Ok(())
    }

    // ========================================================================
    // Defaults & debug
    // ========================================================================

    pub fn settings(&self) -> Result<Value> {
        let defaults = self.defaults.read().unwrap();
        Ok(json!({
            "defaultRoom": defaults.room,
            "defaultService": defaults.service,
            "announceVolume": self.announce_volume,
        }))
    }

    pub fn set_default_room(&self, room: &str) -> Result<Value> {
        // Validate before persisting the default
        self.device_for_room(room)?;
        self.defaults.write().unwrap().room = Some(room.to_string());
        Ok(success())
    }

    pub fn set_default_service(&self, service: &str) -> Result<Value> {
        let service = service.to_lowercase();
        if !self.adapters.contains_key(&service) {
            return Err(GatewayError::NotImplemented(format!(
                "music service '{service}'"
            )));
        }
        self.defaults.write().unwrap().service = service;
        Ok(success())
    }

    pub fn debug_device_health(&self) -> Result<Value> {
        Ok(data(&self.events.device_health()))
    }

    pub fn debug_scheduler(&self) -> Result<Value> {
        Ok(json!({
            "status": self.scheduler.status(),
            "tasks": self.scheduler.detailed_tasks(),
        }))
    }

    pub fn debug_subscriptions(&self) -> Result<Value> {
        Ok(json!({
            "callbackUrl": self.subscriptions.callback_base_url(),
            "subscriptions": self.subscriptions.statuses(),
        }))
    }

    pub fn debug_spotify_account(&self) -> Result<Value> {
        Ok(data(&self.accounts.accounts()))
    }
}
