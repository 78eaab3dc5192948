//! Event subscription lifecycle and typed event bus.
//!
//! Two halves, tightly coupled:
//!
//! - [`SubscriptionManager`] keeps long-lived UPnP event subscriptions on
//!   every player (SUBSCRIBE, renewal before expiry, re-subscribe on
//!   reappearance) and feeds received NOTIFY bodies into the bus.
//! - [`EventManager`] demultiplexes those bodies into typed state deltas,
//!   maintains the per-player last-known state, and offers blocking
//!   `wait_for_*` primitives used by action verification.

pub mod didl;
mod error;
mod manager;
mod parsers;
mod service;
mod state;
mod subscriptions;

pub use error::{EventError, Result};
pub use manager::{
    DeviceHealth, EventManager, HistoryEntry, StateEvent, HEALTH_CHECK_PERIOD,
    STALE_NOTIFY_THRESHOLD, UNHEALTHY_THRESHOLD,
};
pub use parsers::{ContentDelta, RenderingDelta, TransportDelta};
pub use service::EventService;
pub use state::{Equalizer, PlayMode, PlaybackState, PlayerState, Repeat, TrackState};
pub use subscriptions::{
    SubscriptionConfig, SubscriptionManager, SubscriptionState, SubscriptionStatus,
};
