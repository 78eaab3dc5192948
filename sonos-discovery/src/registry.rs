//! Live player registry.
//!
//! The registry is the single owner of [`Device`] records. Other components
//! refer to players by UUID and look them up here on demand.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::device::{normalize_uuid, Device};

/// Consecutive subscription failures required before removal is considered.
const REMOVAL_FAILURE_COUNT: u32 = 3;

/// Minimum span the failures must cover. A burst of failures within a few
/// seconds is indistinguishable from a transient network blip.
const REMOVAL_FAILURE_SPAN: Duration = Duration::from_secs(60);

/// Registry change notification.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Added(Device),
    Removed(Device),
}

type Listener = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

#[derive(Debug, Clone)]
struct FailureWindow {
    count: u32,
    first_at: Instant,
}

/// Thread-safe registry of known players.
pub struct Registry {
    devices: RwLock<HashMap<String, Device>>,
    listeners: RwLock<Vec<Listener>>,
    failures: RwLock<HashMap<String, FailureWindow>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            failures: RwLock::new(HashMap::new()),
        }
    }

    /// Register a callback invoked on every add/remove.
    pub fn subscribe(&self, listener: impl Fn(&DeviceEvent) + Send + Sync + 'static) {
        self.listeners.write().unwrap().push(Arc::new(listener));
    }

    /// Insert or refresh a device. Emits `Added` for devices not currently
    /// present, which includes devices reappearing after removal.
    pub fn insert(&self, device: Device) {
        let is_new = {
            let mut devices = self.devices.write().unwrap();
            let existing = devices.insert(device.id.clone(), device.clone());
            existing.is_none()
        };
        if is_new {
            self.failures.write().unwrap().remove(&device.id);
            tracing::info!(id = %device.id, room = %device.room_name, model = %device.model_name, "player added");
            self.emit(&DeviceEvent::Added(device));
        }
    }

    /// Remove a device and notify listeners. Returns the removed record.
    pub fn remove(&self, uuid: &str) -> Option<Device> {
        let id = normalize_uuid(uuid);
        let removed = self.devices.write().unwrap().remove(&id);
        if let Some(device) = &removed {
            self.failures.write().unwrap().remove(&id);
            tracing::info!(id = %device.id, room = %device.room_name, "player removed");
            self.emit(&DeviceEvent::Removed(device.clone()));
        }
        removed
    }

    pub fn get_all(&self) -> Vec<Device> {
        self.devices.read().unwrap().values().cloned().collect()
    }

    /// Look up by UUID, with or without the `uuid:` prefix.
    pub fn get_by_id(&self, uuid: &str) -> Option<Device> {
        let id = normalize_uuid(uuid);
        self.devices.read().unwrap().get(&id).cloned()
    }

    /// Case-insensitive room lookup.
    pub fn get_by_room(&self, room: &str) -> Option<Device> {
        self.devices
            .read()
            .unwrap()
            .values()
            .find(|device| device.room_name.eq_ignore_ascii_case(room))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().unwrap().is_empty()
    }

    /// Reset the failure window after a successful subscription cycle.
    pub fn note_subscription_success(&self, uuid: &str) {
        self.failures.write().unwrap().remove(&normalize_uuid(uuid));
    }

    /// Record a failed subscription cycle. Returns `true` once the failure
    /// window is exhausted (count and span), meaning the caller should
    /// confirm with a description fetch and remove the device if that fails
    /// too.
    pub fn note_subscription_failure(&self, uuid: &str) -> bool {
        let id = normalize_uuid(uuid);
        let mut failures = self.failures.write().unwrap();
        let window = failures.entry(id).or_insert(FailureWindow {
            count: 0,
            first_at: Instant::now(),
        });
        window.count += 1;
        window.count >= REMOVAL_FAILURE_COUNT
            && window.first_at.elapsed() >= REMOVAL_FAILURE_SPAN
    }

    /// Invoke listeners on a snapshot, so a listener may re-enter the
    /// registry (e.g. a subscription failure confirming a removal).
    fn emit(&self, event: &DeviceEvent) {
        let listeners: Vec<Listener> = self.listeners.read().unwrap().clone();
        for listener in listeners {
            listener(event);
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn device(id: &str, room: &str) -> Device {
        Device {
            id: id.to_string(),
            room_name: room.to_string(),
            model_name: "Sonos One".to_string(),
            base_url: "http://192.168.1.50:1400".to_string(),
            software_version: None,
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let registry = Registry::new();
        registry.insert(device("RINCON_1", "Kitchen"));

        assert_eq!(registry.len(), 1);
        assert!(registry.get_by_id("uuid:RINCON_1").is_some());
        assert!(registry.get_by_id("RINCON_1").is_some());
        assert!(registry.get_by_room("kitchen").is_some());
        assert!(registry.get_by_room("KITCHEN").is_some());
        assert!(registry.get_by_room("Basement").is_none());
    }

    #[test]
    fn test_added_event_fires_once_per_appearance() {
        let registry = Registry::new();
        let added = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&added);
        registry.subscribe(move |event| {
            if matches!(event, DeviceEvent::Added(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        registry.insert(device("RINCON_1", "Kitchen"));
        registry.insert(device("RINCON_1", "Kitchen"));
        assert_eq!(added.load(Ordering::SeqCst), 1);

        // Reappearance after removal announces again
        registry.remove("RINCON_1");
        registry.insert(device("RINCON_1", "Kitchen"));
        assert_eq!(added.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failure_window_needs_count_and_span() {
        let registry = Registry::new();
        registry.insert(device("RINCON_1", "Kitchen"));

        // Three rapid failures do not exhaust the window: the span gate holds
        assert!(!registry.note_subscription_failure("RINCON_1"));
        assert!(!registry.note_subscription_failure("RINCON_1"));
        assert!(!registry.note_subscription_failure("RINCON_1"));
    }

    #[test]
    fn test_success_resets_failure_window() {
        let registry = Registry::new();
        registry.insert(device("RINCON_1", "Kitchen"));

        registry.note_subscription_failure("RINCON_1");
        registry.note_subscription_failure("RINCON_1");
        registry.note_subscription_success("RINCON_1");
        assert!(!registry.note_subscription_failure("RINCON_1"));
    }
}
