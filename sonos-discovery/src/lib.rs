//! SSDP-based discovery and live player registry.
//!
//! This crate finds players on the local network and maintains the
//! authoritative registry of them. All other gateway components hold player
//! UUIDs and resolve them here; the registry is the only owner of [`Device`]
//! records.

mod device;
mod discovery;
mod error;
mod registry;
mod ssdp;

pub use device::{extract_ip_from_url, normalize_uuid, Device};
pub use discovery::{Discovery, INITIAL_PROBE_INTERVAL, STEADY_PROBE_INTERVAL};
pub use error::{DiscoveryError, Result};
pub use registry::{DeviceEvent, Registry};
