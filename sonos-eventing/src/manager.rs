//! The event manager: single convergence point for observable player state.
//!
//! NOTIFY bodies arrive here (via the subscription layer), get demultiplexed
//! into typed field deltas, and mutate the per-player state cache. Each
//! changed field produces exactly one event, emitted in a fixed order
//! (state, volume, mute, track) before the cache guard is released.
//!
//! Waiters block on a condvar under the same guard the delta emitter uses:
//! lock, check the fast path, then wait. This closes the classic lost-wakeup
//! window between "not there yet" and "waiting".

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;

use sonos_discovery::{normalize_uuid, Device, Discovery};
use sonos_topology::{TopologyManager, TopologySnapshot};

use crate::error::Result;
use crate::parsers::{
    parse_content_event, parse_rendering_event, parse_transport_event, ContentDelta,
};
use crate::service::EventService;
use crate::state::{PlayMode, PlaybackState, PlayerState, TrackState};

/// Subscription considered dead after this long without an event.
pub const STALE_NOTIFY_THRESHOLD: Duration = Duration::from_secs(90);

/// Device declared unhealthy in diagnostics after this long without one.
pub const UNHEALTHY_THRESHOLD: Duration = Duration::from_secs(3600);

/// Cadence of the health evaluation timer.
pub const HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Ring-buffer depth for per-player state and mute histories.
const HISTORY_CAPACITY: usize = 50;

/// A typed state-change event, one per changed field.
#[derive(Debug, Clone)]
pub enum StateEvent {
    StateChange {
        uuid: String,
        previous: PlaybackState,
        current: PlaybackState,
    },
    VolumeChange {
        uuid: String,
        previous: u8,
        current: u8,
    },
    MuteChange {
        uuid: String,
        previous: bool,
        current: bool,
    },
    TrackChange {
        uuid: String,
        previous: Option<TrackState>,
        current: Option<TrackState>,
    },
    ContentUpdate {
        uuid: String,
        delta: ContentDelta,
    },
    TopologyChange {
        snapshot: Arc<TopologySnapshot>,
    },
}

/// One entry of a history ring.
#[derive(Debug, Clone)]
pub struct HistoryEntry<T> {
    pub seq: u64,
    pub at: SystemTime,
    pub value: T,
}

/// Health summary for one registered player.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceHealth {
    pub uuid: String,
    pub room_name: Option<String>,
    pub seconds_since_last_event: Option<u64>,
    pub stale_notify: bool,
    pub unhealthy: bool,
}

#[derive(Debug, Clone)]
struct HealthRecord {
    registered_at: Instant,
    last_event_at: Option<Instant>,
}

impl HealthRecord {
    fn age(&self) -> Duration {
        self.last_event_at
            .unwrap_or(self.registered_at)
            .elapsed()
    }
}

#[derive(Debug, Default)]
struct PlayerSlot {
    registered: bool,
    state: PlayerState,
    state_history: VecDeque<HistoryEntry<PlaybackState>>,
    mute_history: VecDeque<HistoryEntry<bool>>,
    /// Sequence number of the last track change
    track_seq: u64,
    /// Sequence number of the last content-directory update
    content_seq: u64,
    last_content: Option<ContentDelta>,
}

#[derive(Debug, Clone)]
struct GroupInfo {
    coordinator: String,
    members: Vec<String>,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, PlayerSlot>,
    /// Reverse map: uuid -> zone info, rebuilt on every topology change
    groups: HashMap<String, GroupInfo>,
    /// Global event sequence, bumped once per emitted change
    seq: u64,
    topology_seq: u64,
}

impl Inner {
    fn group_members(&self, uuid: &str) -> Vec<String> {
        self.groups
            .get(uuid)
            .map(|info| info.members.clone())
            .unwrap_or_else(|| vec![uuid.to_string()])
    }

    fn coordinator_of(&self, uuid: &str) -> String {
        self.groups
            .get(uuid)
            .map(|info| info.coordinator.clone())
            .unwrap_or_else(|| uuid.to_string())
    }
}

type EventListener = Arc<dyn Fn(&StateEvent) + Send + Sync>;
type ResubscribeListener = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Process-wide event bus. Constructed once at startup and shared via `Arc`.
pub struct EventManager {
    inner: Mutex<Inner>,
    condvar: Condvar,
    health: DashMap<String, HealthRecord>,
    topology: Arc<TopologyManager>,
    discovery: RwLock<Option<Arc<Discovery>>>,
    listeners: RwLock<Vec<EventListener>>,
    resubscribe_listeners: RwLock<Vec<ResubscribeListener>>,
    stale_threshold: Duration,
    unhealthy_threshold: Duration,
}

impl EventManager {
    pub fn new(topology: Arc<TopologyManager>) -> Self {
        Self::with_thresholds(topology, STALE_NOTIFY_THRESHOLD, UNHEALTHY_THRESHOLD)
    }

    pub fn with_thresholds(
        topology: Arc<TopologyManager>,
        stale_threshold: Duration,
        unhealthy_threshold: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            condvar: Condvar::new(),
            health: DashMap::new(),
            topology,
            discovery: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            resubscribe_listeners: RwLock::new(Vec::new()),
            stale_threshold,
            unhealthy_threshold,
        }
    }

    /// Late-bound back-reference, used only for room lookups in diagnostics.
    /// Avoids a construction cycle between discovery and the event bus.
    pub fn set_discovery(&self, discovery: Arc<Discovery>) {
        *self.discovery.write() = Some(discovery);
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    /// Attach the state-delta handler for a player.
    pub fn register(&self, device: &Device) {
        let uuid = normalize_uuid(&device.id);
        let mut inner = self.inner.lock();
        let slot = inner.slots.entry(uuid.clone()).or_default();
        slot.registered = true;
        self.health.insert(
            uuid.clone(),
            HealthRecord {
                registered_at: Instant::now(),
                last_event_at: None,
            },
        );
        tracing::debug!(uuid = %uuid, room = %device.room_name, "player registered with event bus");
    }

    /// Detach a player. A non-permanent unregister (device offline) keeps
    /// the cached state so it survives the offline window.
    pub fn unregister(&self, uuid: &str, permanent: bool) {
        let uuid = normalize_uuid(uuid);
        let mut inner = self.inner.lock();
        if permanent {
            inner.slots.remove(&uuid);
        } else if let Some(slot) = inner.slots.get_mut(&uuid) {
            slot.registered = false;
        }
        drop(inner);
        self.health.remove(&uuid);
    }

    /// Subscribe to typed state events. Listeners run under the cache guard
    /// in emission order and must not call back into the manager.
    pub fn on_event(&self, listener: impl Fn(&StateEvent) + Send + Sync + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Subscribe to the `devices-need-resubscribe` signal produced by the
    /// health evaluator.
    pub fn on_devices_need_resubscribe(
        &self,
        listener: impl Fn(&[String]) + Send + Sync + 'static,
    ) {
        self.resubscribe_listeners.write().push(Arc::new(listener));
    }

    // ========================================================================
    // NOTIFY ingestion
    // ========================================================================

    /// Demultiplex one NOTIFY body. Called by the subscription layer for
    /// every delivery, after the 200 has already gone out.
    pub fn handle_notify(&self, uuid: &str, service: EventService, body: &str) -> Result<()> {
        let uuid = normalize_uuid(uuid);
        self.note_event(&uuid);

        match service {
            EventService::ZoneGroupTopology => self.handle_topology(body),
            EventService::AVTransport => self.handle_transport(&uuid, body),
            EventService::RenderingControl => self.handle_rendering(&uuid, body),
            EventService::ContentDirectory => self.handle_content(&uuid, body),
        }
    }

    /// Feed a transport state obtained by polling rather than eventing.
    pub fn ingest_transport_state(&self, uuid: &str, wire_state: &str) {
        let uuid = normalize_uuid(uuid);
        let mut inner = self.inner.lock();
        let mut events = Vec::new();
        Self::apply_state_change(
            &mut inner,
            &uuid,
            PlaybackState::from_wire(wire_state),
            &mut events,
        );
        self.finish(inner, events);
    }

    fn handle_topology(&self, body: &str) -> Result<()> {
        let snapshot = self.topology.apply_event(body)?;
        let mut inner = self.inner.lock();
        inner.groups.clear();
        for zone in &snapshot.zones {
            let info = GroupInfo {
                coordinator: zone.coordinator.clone(),
                members: zone.members.iter().map(|m| m.uuid.clone()).collect(),
            };
            for member in &zone.members {
                inner.groups.insert(member.uuid.clone(), info.clone());
            }
        }
        inner.seq += 1;
        inner.topology_seq = inner.seq;
        let events = vec![StateEvent::TopologyChange {
            snapshot: Arc::clone(&snapshot),
        }];
        self.finish(inner, events);
        Ok(())
    }

    fn handle_transport(&self, uuid: &str, body: &str) -> Result<()> {
        let delta = parse_transport_event(body)?;
        let mut inner = self.inner.lock();
        if !inner.slots.get(uuid).map(|s| s.registered).unwrap_or(false) {
            tracing::debug!(uuid, "transport event for unregistered player ignored");
            return Ok(());
        }

        let mut events = Vec::new();

        if let Some(wire) = &delta.transport_state {
            Self::apply_state_change(&mut inner, uuid, PlaybackState::from_wire(wire), &mut events);
        }

        {
            let slot = inner.slots.get_mut(uuid).expect("slot checked above");
            if let Some(mode) = &delta.play_mode {
                slot.state.play_mode =
                    PlayMode::from_wire(mode, slot.state.play_mode.crossfade);
            }
            if let Some(crossfade) = delta.crossfade {
                slot.state.play_mode.crossfade = crossfade;
            }
            slot.state.coordinator_ref = delta
                .coordinator_ref
                .clone()
                .or(slot.state.coordinator_ref.take());
            if let Some(next) = delta.next_track.clone() {
                slot.state.next_track = Some(next);
            }
        }

        if let Some(track) = delta.current_track.clone() {
            let slot = inner.slots.get_mut(uuid).expect("slot checked above");
            let changed = slot
                .state
                .current_track
                .as_ref()
                .map(|previous| !previous.same_track(&track))
                .unwrap_or(true);
            let previous = slot.state.current_track.clone();
            slot.state.current_track = Some(track.clone());
            if changed {
                inner.seq += 1;
                let seq = inner.seq;
                let slot = inner.slots.get_mut(uuid).expect("slot checked above");
                slot.track_seq = seq;
                events.push(StateEvent::TrackChange {
                    uuid: uuid.to_string(),
                    previous,
                    current: Some(track),
                });
            }
        }

        self.finish(inner, events);
        Ok(())
    }

    fn handle_rendering(&self, uuid: &str, body: &str) -> Result<()> {
        let delta = parse_rendering_event(body)?;
        let mut inner = self.inner.lock();
        if !inner.slots.get(uuid).map(|s| s.registered).unwrap_or(false) {
            tracing::debug!(uuid, "rendering event for unregistered player ignored");
            return Ok(());
        }

        let mut events = Vec::new();

        if let Some(volume) = delta.volume {
            let slot = inner.slots.get_mut(uuid).expect("slot checked above");
            if slot.state.volume != volume {
                let previous = slot.state.volume;
                slot.state.volume = volume;
                inner.seq += 1;
                events.push(StateEvent::VolumeChange {
                    uuid: uuid.to_string(),
                    previous,
                    current: volume,
                });
            }
        }

        if let Some(mute) = delta.mute {
            let slot = inner.slots.get_mut(uuid).expect("slot checked above");
            if slot.state.mute != mute {
                let previous = slot.state.mute;
                slot.state.mute = mute;
                inner.seq += 1;
                let seq = inner.seq;
                let slot = inner.slots.get_mut(uuid).expect("slot checked above");
                push_history(&mut slot.mute_history, seq, mute);
                events.push(StateEvent::MuteChange {
                    uuid: uuid.to_string(),
                    previous,
                    current: mute,
                });
            }
        }

        {
            let slot = inner.slots.get_mut(uuid).expect("slot checked above");
            if let Some(bass) = delta.bass {
                slot.state.equalizer.bass = bass;
            }
            if let Some(treble) = delta.treble {
                slot.state.equalizer.treble = treble;
            }
            if let Some(loudness) = delta.loudness {
                slot.state.equalizer.loudness = loudness;
            }
        }

        self.finish(inner, events);
        Ok(())
    }

    fn handle_content(&self, uuid: &str, body: &str) -> Result<()> {
        let delta = parse_content_event(body)?;
        if delta.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slots.get_mut(uuid) else {
            return Ok(());
        };
        if !slot.registered {
            return Ok(());
        }
        slot.last_content = Some(delta.clone());
        inner.seq += 1;
        let seq = inner.seq;
        inner.slots.get_mut(uuid).expect("slot checked above").content_seq = seq;
        let events = vec![StateEvent::ContentUpdate {
            uuid: uuid.to_string(),
            delta,
        }];
        self.finish(inner, events);
        Ok(())
    }

    fn apply_state_change(
        inner: &mut Inner,
        uuid: &str,
        new_state: PlaybackState,
        events: &mut Vec<StateEvent>,
    ) {
        let Some(slot) = inner.slots.get_mut(uuid) else {
            return;
        };
        if slot.state.playback_state == new_state {
            return;
        }
        let previous = slot.state.playback_state;
        slot.state.playback_state = new_state;
        inner.seq += 1;
        let seq = inner.seq;
        let slot = inner.slots.get_mut(uuid).expect("slot exists");
        push_history(&mut slot.state_history, seq, new_state);
        events.push(StateEvent::StateChange {
            uuid: uuid.to_string(),
            previous,
            current: new_state,
        });
    }

    /// Emit events in order and wake waiters, all before releasing the
    /// guard. Waiters re-check their predicates once the guard is free.
    fn finish(&self, guard: parking_lot::MutexGuard<'_, Inner>, events: Vec<StateEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<EventListener> = self.listeners.read().clone();
        for event in &events {
            for listener in &listeners {
                listener(event);
            }
        }
        self.condvar.notify_all();
        drop(guard);
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn current_state(&self, uuid: &str) -> Option<PlaybackState> {
        let uuid = normalize_uuid(uuid);
        self.inner
            .lock()
            .slots
            .get(&uuid)
            .map(|slot| slot.state.playback_state)
    }

    pub fn current_mute(&self, uuid: &str) -> Option<bool> {
        let uuid = normalize_uuid(uuid);
        self.inner.lock().slots.get(&uuid).map(|slot| slot.state.mute)
    }

    /// Full last-known state, for the state routes.
    pub fn player_state(&self, uuid: &str) -> Option<PlayerState> {
        let uuid = normalize_uuid(uuid);
        self.inner
            .lock()
            .slots
            .get(&uuid)
            .map(|slot| slot.state.clone())
    }

    /// Recent state transitions, newest last. Diagnostics only.
    pub fn state_history(&self, uuid: &str) -> Vec<HistoryEntry<PlaybackState>> {
        let uuid = normalize_uuid(uuid);
        self.inner
            .lock()
            .slots
            .get(&uuid)
            .map(|slot| slot.state_history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn mute_history(&self, uuid: &str) -> Vec<HistoryEntry<bool>> {
        let uuid = normalize_uuid(uuid);
        self.inner
            .lock()
            .slots
            .get(&uuid)
            .map(|slot| slot.mute_history.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ========================================================================
    // Waiters
    // ========================================================================

    /// Wait until any member of `uuid`'s zone reaches `target`, or is
    /// already there. Returns `false` on timeout.
    pub fn wait_for_state(&self, uuid: &str, target: &str, timeout: Duration) -> bool {
        self.wait_for_any_state(uuid, &[target], timeout)
    }

    /// Wait until any member of the zone reaches any of `targets`.
    pub fn wait_for_any_state(&self, uuid: &str, targets: &[&str], timeout: Duration) -> bool {
        let uuid = normalize_uuid(uuid);
        let targets: Vec<String> = targets.iter().map(|t| t.to_uppercase()).collect();
        let mut members: Option<Vec<String>> = None;
        let mut entry_seq: Option<u64> = None;
        self.wait_loop(timeout, move |inner| {
            let members = members.get_or_insert_with(|| inner.group_members(&uuid));
            let entry = *entry_seq.get_or_insert(inner.seq);
            for member in members.iter() {
                if let Some(slot) = inner.slots.get(member) {
                    if targets.iter().any(|t| t == slot.state.playback_state.as_str()) {
                        return Some(true);
                    }
                    let hit = slot
                        .state_history
                        .iter()
                        .rev()
                        .take_while(|e| e.seq > entry)
                        .any(|e| targets.iter().any(|t| t == e.value.as_str()));
                    if hit {
                        return Some(true);
                    }
                }
            }
            None
        })
        .unwrap_or(false)
    }

    /// Wait until the player satisfies an arbitrary state predicate.
    pub fn wait_for_state_matching(
        &self,
        uuid: &str,
        predicate: impl Fn(PlaybackState) -> bool,
        timeout: Duration,
    ) -> bool {
        let uuid = normalize_uuid(uuid);
        let mut members: Option<Vec<String>> = None;
        self.wait_loop(timeout, move |inner| {
            let members = members.get_or_insert_with(|| inner.group_members(&uuid));
            members
                .iter()
                .filter_map(|m| inner.slots.get(m))
                .any(|slot| predicate(slot.state.playback_state))
                .then_some(true)
        })
        .unwrap_or(false)
    }

    /// Resolve once the group's coordinator leaves `TRANSITIONING`,
    /// returning the settled state. `None` on timeout.
    pub fn wait_for_stable_state(&self, uuid: &str, timeout: Duration) -> Option<PlaybackState> {
        let uuid = normalize_uuid(uuid);
        self.wait_loop(timeout, move |inner| {
            let coordinator = inner.coordinator_of(&uuid);
            let anchor = inner
                .slots
                .get(&coordinator)
                .or_else(|| inner.slots.get(&uuid))?;
            match anchor.state.playback_state {
                PlaybackState::Transitioning => None,
                settled => Some(settled),
            }
        })
    }

    /// Wait until any zone member's volume equals `target`.
    pub fn wait_for_volume(&self, uuid: &str, target: u8, timeout: Duration) -> bool {
        let uuid = normalize_uuid(uuid);
        let mut members: Option<Vec<String>> = None;
        self.wait_loop(timeout, move |inner| {
            let members = members.get_or_insert_with(|| inner.group_members(&uuid));
            members
                .iter()
                .filter_map(|m| inner.slots.get(m))
                .any(|slot| slot.state.volume == target)
                .then_some(true)
        })
        .unwrap_or(false)
    }

    /// Wait until any zone member's mute equals `target`.
    pub fn wait_for_mute(&self, uuid: &str, target: bool, timeout: Duration) -> bool {
        let uuid = normalize_uuid(uuid);
        let mut members: Option<Vec<String>> = None;
        let mut entry_seq: Option<u64> = None;
        self.wait_loop(timeout, move |inner| {
            let members = members.get_or_insert_with(|| inner.group_members(&uuid));
            let entry = *entry_seq.get_or_insert(inner.seq);
            for member in members.iter() {
                if let Some(slot) = inner.slots.get(member) {
                    if slot.state.mute == target {
                        return Some(true);
                    }
                    let hit = slot
                        .mute_history
                        .iter()
                        .rev()
                        .take_while(|e| e.seq > entry)
                        .any(|e| e.value == target);
                    if hit {
                        return Some(true);
                    }
                }
            }
            None
        })
        .unwrap_or(false)
    }

    /// Wait for a track change on any zone member after call entry.
    pub fn wait_for_track_change(&self, uuid: &str, timeout: Duration) -> bool {
        let uuid = normalize_uuid(uuid);
        let mut members: Option<Vec<String>> = None;
        let mut entry_seq: Option<u64> = None;
        self.wait_loop(timeout, move |inner| {
            let members = members.get_or_insert_with(|| inner.group_members(&uuid));
            let entry = *entry_seq.get_or_insert(inner.seq);
            members
                .iter()
                .filter_map(|m| inner.slots.get(m))
                .any(|slot| slot.track_seq > entry)
                .then_some(true)
        })
        .unwrap_or(false)
    }

    /// Wait for a content-directory update on any zone member, returning
    /// the raw delta.
    pub fn wait_for_content_update(&self, uuid: &str, timeout: Duration) -> Option<ContentDelta> {
        let uuid = normalize_uuid(uuid);
        let mut members: Option<Vec<String>> = None;
        let mut entry_seq: Option<u64> = None;
        self.wait_loop(timeout, move |inner| {
            let members = members.get_or_insert_with(|| inner.group_members(&uuid));
            let entry = *entry_seq.get_or_insert(inner.seq);
            members
                .iter()
                .filter_map(|m| inner.slots.get(m))
                .find(|slot| slot.content_seq > entry)
                .and_then(|slot| slot.last_content.clone())
        })
    }

    /// Wait for the next topology change, returning the new snapshot.
    pub fn wait_for_topology_change(&self, timeout: Duration) -> Option<Arc<TopologySnapshot>> {
        let mut entry_seq: Option<u64> = None;
        let changed = self.wait_loop(timeout, move |inner| {
            let entry = *entry_seq.get_or_insert(inner.topology_seq);
            (inner.topology_seq > entry).then_some(true)
        });
        changed.map(|_| self.topology.snapshot())
    }

    fn wait_loop<T>(
        &self,
        timeout: Duration,
        mut check: impl FnMut(&Inner) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(value) = check(&inner) {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let result = self.condvar.wait_for(&mut inner, deadline - now);
            if result.timed_out() {
                return check(&inner);
            }
        }
    }

    // ========================================================================
    // Health tracking
    // ========================================================================

    fn note_event(&self, uuid: &str) {
        if let Some(mut record) = self.health.get_mut(uuid) {
            record.last_event_at = Some(Instant::now());
        }
    }

    /// Per-device health snapshot for diagnostics.
    pub fn device_health(&self) -> Vec<DeviceHealth> {
        let discovery = self.discovery.read();
        let mut health: Vec<DeviceHealth> = self
            .health
            .iter()
            .map(|entry| {
                let age = entry.value().age();
                DeviceHealth {
                    uuid: entry.key().clone(),
                    room_name: discovery
                        .as_ref()
                        .and_then(|d| d.registry().get_by_id(entry.key()))
                        .map(|device| device.room_name),
                    seconds_since_last_event: entry
                        .value()
                        .last_event_at
                        .map(|at| at.elapsed().as_secs()),
                    stale_notify: age >= self.stale_threshold,
                    unhealthy: age >= self.unhealthy_threshold,
                }
            })
            .collect();
        health.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        health
    }

    /// Players whose subscriptions look dead (no event for the stale
    /// window).
    pub fn stale_notify_devices(&self) -> Vec<String> {
        self.health
            .iter()
            .filter(|entry| entry.value().age() >= self.stale_threshold)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn unhealthy_devices(&self) -> Vec<String> {
        self.health
            .iter()
            .filter(|entry| entry.value().age() >= self.unhealthy_threshold)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Evaluate health thresholds; wired to a 60 s scheduler tick. Emits
    /// `devices-need-resubscribe` for stale players and returns them.
    pub fn check_health(&self) -> Vec<String> {
        let stale = self.stale_notify_devices();
        if !stale.is_empty() {
            tracing::warn!(count = stale.len(), "devices need resubscribe: {stale:?}");
            let listeners: Vec<ResubscribeListener> = self.resubscribe_listeners.read().clone();
            for listener in listeners {
                listener(&stale);
            }
        }
        stale
    }
}

fn push_history<T>(ring: &mut VecDeque<HistoryEntry<T>>, seq: u64, value: T) {
    if ring.len() == HISTORY_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(HistoryEntry {
        seq,
        at: SystemTime::now(),
        value,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TRANSPORT_PLAYING: &str = r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><LastChange>&lt;Event xmlns=&quot;urn:schemas-upnp-org:metadata-1-0/AVT/&quot;&gt;&lt;InstanceID val=&quot;0&quot;&gt;&lt;TransportState val=&quot;PLAYING&quot;/&gt;&lt;/InstanceID&gt;&lt;/Event&gt;</LastChange></e:property></e:propertyset>"#;

    const TRANSPORT_STOPPED: &str = r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><LastChange>&lt;Event xmlns=&quot;urn:schemas-upnp-org:metadata-1-0/AVT/&quot;&gt;&lt;InstanceID val=&quot;0&quot;&gt;&lt;TransportState val=&quot;STOPPED&quot;/&gt;&lt;/InstanceID&gt;&lt;/Event&gt;</LastChange></e:property></e:propertyset>"#;

    const RENDERING_VOL_50_MUTED: &str = r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><LastChange>&lt;Event xmlns=&quot;urn:schemas-upnp-org:metadata-1-0/RCS/&quot;&gt;&lt;InstanceID val=&quot;0&quot;&gt;&lt;Volume channel=&quot;Master&quot; val=&quot;50&quot;/&gt;&lt;Mute channel=&quot;Master&quot; val=&quot;1&quot;/&gt;&lt;/InstanceID&gt;&lt;/Event&gt;</LastChange></e:property></e:propertyset>"#;

    const TOPOLOGY_GROUP: &str = r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><ZoneGroupState>&lt;ZoneGroupState&gt;&lt;ZoneGroups&gt;&lt;ZoneGroup Coordinator=&quot;RINCON_A&quot; ID=&quot;RINCON_A:1&quot;&gt;&lt;ZoneGroupMember UUID=&quot;RINCON_A&quot; ZoneName=&quot;Kitchen&quot;/&gt;&lt;ZoneGroupMember UUID=&quot;RINCON_B&quot; ZoneName=&quot;Den&quot;/&gt;&lt;/ZoneGroup&gt;&lt;/ZoneGroups&gt;&lt;/ZoneGroupState&gt;</ZoneGroupState></e:property></e:propertyset>"#;

    fn device(id: &str, room: &str) -> Device {
        Device {
            id: id.to_string(),
            room_name: room.to_string(),
            model_name: "Sonos One".to_string(),
            base_url: "http://192.168.1.50:1400".to_string(),
            software_version: None,
        }
    }

    fn manager() -> Arc<EventManager> {
        let manager = Arc::new(EventManager::new(Arc::new(TopologyManager::new())));
        manager.register(&device("RINCON_A", "Kitchen"));
        manager.register(&device("RINCON_B", "Den"));
        manager
    }

    #[test]
    fn test_state_change_emits_one_event_per_changed_field() {
        let manager = manager();
        let events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&events);
        manager.on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager
            .handle_notify("RINCON_A", EventService::AVTransport, TRANSPORT_PLAYING)
            .unwrap();
        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.current_state("RINCON_A"),
            Some(PlaybackState::Playing)
        );

        // Same state again: no change, no event
        manager
            .handle_notify("RINCON_A", EventService::AVTransport, TRANSPORT_PLAYING)
            .unwrap();
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rendering_event_updates_volume_and_mute() {
        let manager = manager();
        manager
            .handle_notify(
                "RINCON_A",
                EventService::RenderingControl,
                RENDERING_VOL_50_MUTED,
            )
            .unwrap();
        let state = manager.player_state("RINCON_A").unwrap();
        assert_eq!(state.volume, 50);
        assert!(state.mute);
        assert_eq!(manager.current_mute("RINCON_A"), Some(true));
        assert_eq!(manager.mute_history("RINCON_A").len(), 1);
    }

    #[test]
    fn test_wait_for_state_fast_path() {
        let manager = manager();
        manager
            .handle_notify("RINCON_A", EventService::AVTransport, TRANSPORT_PLAYING)
            .unwrap();
        // Already in target state: resolves without waiting
        assert!(manager.wait_for_state("RINCON_A", "PLAYING", Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_for_state_wakes_on_event() {
        let manager = manager();
        let background = Arc::clone(&manager);
        let waiter = std::thread::spawn(move || {
            background.wait_for_state("RINCON_A", "PLAYING", Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(50));
        manager
            .handle_notify("RINCON_A", EventService::AVTransport, TRANSPORT_PLAYING)
            .unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_for_state_times_out() {
        let manager = manager();
        let started = Instant::now();
        assert!(!manager.wait_for_state("RINCON_A", "PLAYING", Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_for_state_group_aware() {
        let manager = manager();
        manager
            .handle_notify("RINCON_A", EventService::ZoneGroupTopology, TOPOLOGY_GROUP)
            .unwrap();
        // Event on the coordinator satisfies a wait addressed at the member
        let background = Arc::clone(&manager);
        let waiter = std::thread::spawn(move || {
            background.wait_for_state("RINCON_B", "PLAYING", Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(50));
        manager
            .handle_notify("RINCON_A", EventService::AVTransport, TRANSPORT_PLAYING)
            .unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_catches_transition_through_target() {
        let manager = manager();
        let background = Arc::clone(&manager);
        let waiter = std::thread::spawn(move || {
            background.wait_for_state("RINCON_A", "PLAYING", Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(50));
        // PLAYING then immediately STOPPED: the history ring still satisfies
        // the waiter even if it wakes late
        manager
            .handle_notify("RINCON_A", EventService::AVTransport, TRANSPORT_PLAYING)
            .unwrap();
        manager
            .handle_notify("RINCON_A", EventService::AVTransport, TRANSPORT_STOPPED)
            .unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_for_volume() {
        let manager = manager();
        let background = Arc::clone(&manager);
        let waiter = std::thread::spawn(move || {
            background.wait_for_volume("RINCON_A", 50, Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(50));
        manager
            .handle_notify(
                "RINCON_A",
                EventService::RenderingControl,
                RENDERING_VOL_50_MUTED,
            )
            .unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_for_topology_change() {
        let manager = manager();
        let background = Arc::clone(&manager);
        let waiter = std::thread::spawn(move || {
            background.wait_for_topology_change(Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(50));
        manager
            .handle_notify("RINCON_A", EventService::ZoneGroupTopology, TOPOLOGY_GROUP)
            .unwrap();
        let snapshot = waiter.join().unwrap().unwrap();
        assert_eq!(snapshot.zones.len(), 1);
    }

    #[test]
    fn test_history_ring_is_bounded() {
        let manager = manager();
        for _ in 0..40 {
            manager
                .handle_notify("RINCON_A", EventService::AVTransport, TRANSPORT_PLAYING)
                .unwrap();
            manager
                .handle_notify("RINCON_A", EventService::AVTransport, TRANSPORT_STOPPED)
                .unwrap();
        }
        assert_eq!(manager.state_history("RINCON_A").len(), HISTORY_CAPACITY);
    }

    #[test]
    fn test_unregistered_player_is_ignored() {
        let manager = manager();
        manager
            .handle_notify("RINCON_X", EventService::AVTransport, TRANSPORT_PLAYING)
            .unwrap();
        assert_eq!(manager.current_state("RINCON_X"), None);
    }

    #[test]
    fn test_health_thresholds() {
        let topology = Arc::new(TopologyManager::new());
        let manager = EventManager::with_thresholds(
            topology,
            Duration::from_millis(20),
            Duration::from_millis(200),
        );
        manager.register(&device("RINCON_A", "Kitchen"));

        assert!(manager.stale_notify_devices().is_empty());
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(manager.stale_notify_devices(), vec!["RINCON_A"]);
        assert!(manager.unhealthy_devices().is_empty());

        // An event clears staleness
        manager
            .handle_notify("RINCON_A", EventService::AVTransport, TRANSPORT_PLAYING)
            .unwrap();
        assert!(manager.stale_notify_devices().is_empty());

        let resubscribed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&resubscribed);
        manager.on_devices_need_resubscribe(move |stale| {
            counter.fetch_add(stale.len(), Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(40));
        let stale = manager.check_health();
        assert_eq!(stale, vec!["RINCON_A"]);
        assert_eq!(resubscribed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_for_stable_state() {
        let manager = manager();
        let transitioning = TRANSPORT_PLAYING.replace("PLAYING", "TRANSITIONING");
        manager
            .handle_notify("RINCON_A", EventService::AVTransport, &transitioning)
            .unwrap();
        let background = Arc::clone(&manager);
        let waiter = std::thread::spawn(move || {
            background.wait_for_stable_state("RINCON_A", Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(50));
        manager
            .handle_notify("RINCON_A", EventService::AVTransport, TRANSPORT_PLAYING)
            .unwrap();
        assert_eq!(waiter.join().unwrap(), Some(PlaybackState::Playing));
    }
}
