//! UPnP event subscription lifecycle.
//!
//! One `SubscriptionManager` owns the callback listener and a registered
//! set of (player, service) subscriptions. Registration survives offline
//! windows: a device that disappears keeps its entries, and the next
//! `device-added` announcement from discovery re-subscribes transparently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

use callback_server::{CallbackServer, Notification};
use soap_client::{SoapClient, SoapError};
use sonos_discovery::{normalize_uuid, Device, DeviceEvent, Discovery};
use sonos_scheduler::{Scheduler, TaskOptions};

use crate::error::Result;
use crate::manager::EventManager;
use crate::service::EventService;

/// Subscription lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Pending,
    Active,
    Renewing,
    Expired,
    Failed,
}

/// Tunables for the subscription protocol.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Requested subscription TIMEOUT, seconds
    pub timeout_seconds: u32,
    /// How long before expiry the renewal must run
    pub renew_margin: Duration,
    /// Port range scanned for the local callback listener
    pub port_range: (u16, u16),
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 300,
            renew_margin: Duration::from_secs(30),
            port_range: (3400, 3500),
        }
    }
}

#[derive(Debug, Clone)]
struct SubscriptionRecord {
    uuid: String,
    service: EventService,
    event_url: String,
    callback_url: String,
    sid: Option<String>,
    state: SubscriptionState,
    expires_at: Option<Instant>,
    consecutive_failures: u32,
}

/// Serializable status row for the debug surface.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatus {
    pub key: String,
    pub uuid: String,
    pub service: String,
    pub sid: Option<String>,
    pub state: SubscriptionState,
    pub expires_in_seconds: Option<u64>,
    pub consecutive_failures: u32,
}

/// Owns SUBSCRIBE/renew/UNSUBSCRIBE for every (player, service) pair.
pub struct SubscriptionManager {
    soap: SoapClient,
    callback: Mutex<CallbackServer>,
    records: Mutex<HashMap<String, SubscriptionRecord>>,
    events: Arc<EventManager>,
    discovery: Arc<Discovery>,
    scheduler: Arc<Scheduler>,
    config: SubscriptionConfig,
    consumer: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    weak: Weak<Self>,
}

impl SubscriptionManager {
    /// Start the callback listener and the NOTIFY consumer thread, and wire
    /// discovery/health signals. The returned manager reacts to
    /// `device-added` announcements on its own.
    pub fn start(
        events: Arc<EventManager>,
        discovery: Arc<Discovery>,
        scheduler: Arc<Scheduler>,
        config: SubscriptionConfig,
    ) -> Result<Arc<Self>> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Notification>();
        let callback = CallbackServer::start(config.port_range, tx)?;

        let manager = Arc::new_cyclic(|weak| Self {
            soap: SoapClient::new(),
            callback: Mutex::new(callback),
            records: Mutex::new(HashMap::new()),
            events,
            discovery,
            scheduler,
            config,
            consumer: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            weak: weak.clone(),
        });

        // NOTIFY consumer: the listener already answered 200, parsing is
        // entirely ours now.
        let weak: Weak<Self> = Arc::downgrade(&manager);
        let consumer = std::thread::Builder::new()
            .name("notify-consumer".to_string())
            .spawn(move || {
                while let Some(notification) = rx.blocking_recv() {
                    let Some(manager) = weak.upgrade() else {
                        break;
                    };
                    manager.handle_notification(notification);
                }
            })
            .map_err(|e| {
                crate::error::EventError::Parse(format!("failed to spawn consumer: {e}"))
            })?;
        *manager.consumer.lock().unwrap() = Some(consumer);

        // Device lifecycle: subscribe on every appearance (including
        // reappearance after an offline window).
        let weak: Weak<Self> = Arc::downgrade(&manager);
        manager.discovery.registry().subscribe(move |event| {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            match event {
                DeviceEvent::Added(device) => manager.subscribe_player(device),
                DeviceEvent::Removed(device) => manager.forget_player(&device.id),
            }
        });

        // Stale-notify signal from the health evaluator
        let weak: Weak<Self> = Arc::downgrade(&manager);
        manager.events.on_devices_need_resubscribe(move |uuids| {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            for uuid in uuids {
                manager.resubscribe(uuid);
            }
        });

        Ok(manager)
    }

    /// Callback listener base URL, for diagnostics.
    pub fn callback_base_url(&self) -> String {
        self.callback.lock().unwrap().base_url().to_string()
    }

    /// Subscribe all managed services on a player.
    pub fn subscribe_player(&self, device: &Device) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        self.events.register(device);
        for service in EventService::ALL {
            self.subscribe_one(device, service);
        }
    }

    /// Clear the registered entries for a removed player.
    pub fn forget_player(&self, uuid: &str) {
        let uuid = normalize_uuid(uuid);
        // Task clearing joins the renewal threads, which take the records
        // lock themselves: collect first, clear outside the lock.
        let removed: Vec<String> = {
            let mut records = self.records.lock().unwrap();
            let keys: Vec<String> = records
                .iter()
                .filter(|(_, record)| record.uuid == uuid)
                .map(|(key, _)| key.clone())
                .collect();
            records.retain(|_, record| record.uuid != uuid);
            keys
        };
        for key in removed {
            self.scheduler.clear_task(&renewal_task_id(&key));
        }
        self.events.unregister(&uuid, false);
    }

    /// Drop SIDs and subscribe fresh, e.g. after a stale-notify signal.
    pub fn resubscribe(&self, uuid: &str) {
        let uuid = normalize_uuid(uuid);
        let Some(device) = self.discovery.registry().get_by_id(&uuid) else {
            tracing::debug!(%uuid, "resubscribe requested for unknown player");
            return;
        };
        tracing::info!(%uuid, room = %device.room_name, "re-subscribing after stale notify");
        {
            let mut records = self.records.lock().unwrap();
            for record in records.values_mut() {
                if record.uuid == uuid {
                    record.sid = None;
                    record.state = SubscriptionState::Expired;
                }
            }
        }
        for service in EventService::ALL {
            self.subscribe_one(&device, service);
        }
    }

    fn subscribe_one(&self, device: &Device, service: EventService) {
        let uuid = normalize_uuid(&device.id);
        let key = subscription_key(&uuid, service);
        let event_url = format!("{}{}", device.base_url, service.event_path());
        let callback_url = self.callback.lock().unwrap().notify_url(&key);

        {
            let mut records = self.records.lock().unwrap();
            records
                .entry(key.clone())
                .or_insert_with(|| SubscriptionRecord {
                    uuid: uuid.clone(),
                    service,
                    event_url: event_url.clone(),
                    callback_url: callback_url.clone(),
                    sid: None,
                    state: SubscriptionState::Pending,
                    expires_at: None,
                    consecutive_failures: 0,
                });
        }

        match self
            .soap
            .subscribe(&event_url, &callback_url, self.config.timeout_seconds)
        {
            Ok(response) => {
                tracing::debug!(key = %key, sid = %response.sid, timeout = response.timeout_seconds, "subscribed");
                self.mark_active(&key, response.sid, response.timeout_seconds);
                self.discovery.report_subscription_success(&uuid);
            }
            Err(err) => self.handle_failure(&key, &uuid, err),
        }
    }

    /// Renew one subscription; wired to a one-shot scheduler task that
    /// re-arms itself on success.
    fn renew(&self, key: &str) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let Some((uuid, event_url, sid)) = ({
            let mut records = self.records.lock().unwrap();
            records.get_mut(key).and_then(|record| {
                record.state = SubscriptionState::Renewing;
                record
                    .sid
                    .clone()
                    .map(|sid| (record.uuid.clone(), record.event_url.clone(), sid))
            })
        }) else {
            return;
        };

        match self
            .soap
            .renew(&event_url, &sid, self.config.timeout_seconds)
        {
            Ok(response) => {
                tracing::debug!(key, "subscription renewed");
                self.mark_active(key, response.sid, response.timeout_seconds);
                self.discovery.report_subscription_success(&uuid);
            }
            Err(SoapError::PreconditionFailed) => {
                // SID expired server-side: clear it and subscribe fresh once
                tracing::debug!(key, "SID rejected (412), re-subscribing fresh");
                let (event_url, callback_url) = {
                    let mut records = self.records.lock().unwrap();
                    let Some(record) = records.get_mut(key) else {
                        return;
                    };
                    record.sid = None;
                    (record.event_url.clone(), record.callback_url.clone())
                };
                match self
                    .soap
                    .subscribe(&event_url, &callback_url, self.config.timeout_seconds)
                {
                    Ok(response) => {
                        self.mark_active(key, response.sid, response.timeout_seconds);
                        self.discovery.report_subscription_success(&uuid);
                    }
                    Err(err) => self.handle_failure(key, &uuid, err),
                }
            }
            Err(err) => self.handle_failure(key, &uuid, err),
        }
    }

    fn mark_active(&self, key: &str, sid: String, timeout_seconds: u32) {
        {
            let mut records = self.records.lock().unwrap();
            if let Some(record) = records.get_mut(key) {
                record.sid = Some(sid);
                record.state = SubscriptionState::Active;
                record.expires_at =
                    Some(Instant::now() + Duration::from_secs(timeout_seconds as u64));
                record.consecutive_failures = 0;
            }
        }
        let delay = Duration::from_secs(timeout_seconds as u64)
            .saturating_sub(self.config.renew_margin);
        self.schedule_renewal(key, delay);
    }

    fn schedule_renewal(&self, key: &str, delay: Duration) {
        // Renewals are serialized per subscription by the single one-shot
        // task, and parallel across subscriptions by thread-per-task.
        let weak = self.weak_self();
        let task_key = key.to_string();
        self.scheduler.schedule_timeout(
            &renewal_task_id(key),
            delay,
            TaskOptions { unref: true },
            move || {
                if let Some(manager) = weak.upgrade() {
                    manager.renew(&task_key);
                }
            },
        );
    }

    /// Apply the failure table: offline/unreachable and permanent errors
    /// all drop the subscription for this cycle; the registered set keeps
    /// the entry so reappearance re-subscribes.
    fn handle_failure(&self, key: &str, uuid: &str, err: SoapError) {
        let classification = match err {
            SoapError::ConnectionRefused(_) => "offline",
            SoapError::Timeout(_) => "unreachable",
            _ => "protocol",
        };
        tracing::warn!(key, classification, "subscription cycle failed: {err}");
        {
            let mut records = self.records.lock().unwrap();
            if let Some(record) = records.get_mut(key) {
                record.sid = None;
                record.state = SubscriptionState::Failed;
                record.expires_at = None;
                record.consecutive_failures += 1;
            }
        }
        self.scheduler.clear_task(&renewal_task_id(key));
        let removed = self.discovery.report_subscription_failure(uuid);
        if removed {
            self.forget_player(uuid);
        }
    }

    fn handle_notification(&self, notification: Notification) {
        let Some((uuid, service)) = parse_subscription_key(&notification.subscription_key) else {
            tracing::debug!(key = %notification.subscription_key, "NOTIFY with unknown key shape");
            return;
        };
        if let Err(err) = self.events.handle_notify(&uuid, service, &notification.body) {
            tracing::warn!(%uuid, %service, "failed to process NOTIFY: {err}");
        }
    }

    /// Status rows for the debug surface.
    pub fn statuses(&self) -> Vec<SubscriptionStatus> {
        let records = self.records.lock().unwrap();
        let mut statuses: Vec<SubscriptionStatus> = records
            .iter()
            .map(|(key, record)| SubscriptionStatus {
                key: key.clone(),
                uuid: record.uuid.clone(),
                service: record.service.tag().to_string(),
                sid: record.sid.clone(),
                state: record.state,
                expires_in_seconds: record
                    .expires_at
                    .map(|at| at.saturating_duration_since(Instant::now()).as_secs()),
                consecutive_failures: record.consecutive_failures,
            })
            .collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }

    /// Unsubscribe everything (parallel, 2 s budget per call) and stop the
    /// listener. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let (keys, records): (Vec<String>, Vec<SubscriptionRecord>) = {
            let mut records = self.records.lock().unwrap();
            let keys = records.keys().cloned().collect();
            (keys, records.drain().map(|(_, record)| record).collect())
        };
        for key in keys {
            self.scheduler.clear_task(&renewal_task_id(&key));
        }

        let mut workers = Vec::new();
        for record in records {
            let Some(sid) = record.sid else { continue };
            workers.push(std::thread::spawn(move || {
                let soap =
                    SoapClient::with_timeouts(Duration::from_secs(2), Duration::from_secs(2));
                if let Err(err) = soap.unsubscribe(&record.event_url, &sid) {
                    tracing::debug!(uuid = %record.uuid, service = %record.service, "unsubscribe failed: {err}");
                }
            }));
        }
        for worker in workers {
            let _ = worker.join();
        }

        self.callback.lock().unwrap().shutdown();
        if let Some(consumer) = self.consumer.lock().unwrap().take() {
            let _ = consumer.join();
        }
        tracing::info!("subscription manager stopped");
    }

    fn weak_self(&self) -> Weak<Self> {
        // Renewal closures must not keep the manager alive through the
        // scheduler's task table.
        self.weak.clone()
    }
}

fn subscription_key(uuid: &str, service: EventService) -> String {
    format!("{uuid}|{}", service.tag())
}

fn parse_subscription_key(key: &str) -> Option<(String, EventService)> {
    let (uuid, tag) = key.split_once('|')?;
    Some((uuid.to_string(), EventService::from_tag(tag)?))
}

fn renewal_task_id(key: &str) -> String {
    format!("subscription-renewal:{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_key_round_trip() {
        let key = subscription_key("RINCON_1", EventService::AVTransport);
        assert_eq!(key, "RINCON_1|avt");
        let (uuid, service) = parse_subscription_key(&key).unwrap();
        assert_eq!(uuid, "RINCON_1");
        assert_eq!(service, EventService::AVTransport);
        assert!(parse_subscription_key("garbage").is_none());
        assert!(parse_subscription_key("a|nope").is_none());
    }

    #[test]
    fn test_default_config() {
        let config = SubscriptionConfig::default();
        assert_eq!(config.timeout_seconds, 300);
        assert_eq!(config.renew_margin, Duration::from_secs(30));
    }
}
