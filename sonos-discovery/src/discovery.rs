//! Discovery driver: SSDP sweeps feeding the registry.
//!
//! A sweep:
//! 1. Sends an SSDP M-SEARCH for ZonePlayer devices
//! 2. Filters and deduplicates responses
//! 3. Fetches each device description via HTTP
//! 4. Inserts validated players into the registry

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::device::{base_url_from_location, DeviceDescription};
use crate::error::{DiscoveryError, Result};
use crate::registry::Registry;
use crate::ssdp::{SsdpClient, SsdpResponse};

const SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:ZonePlayer:1";

/// Re-probe cadence before any player has been found.
pub const INITIAL_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Re-probe cadence after the first successful sweep.
pub const STEADY_PROBE_INTERVAL: Duration = Duration::from_secs(300);

/// Discovery component: owns the registry and runs SSDP sweeps on demand.
///
/// Scheduling of sweeps is the caller's concern; [`Discovery::probe`] is a
/// single blocking sweep and [`Discovery::probe_interval`] reports the
/// cadence the next one should run at.
pub struct Discovery {
    registry: Arc<Registry>,
    http: reqwest::blocking::Client,
    search_timeout: Duration,
    found_any: AtomicBool,
}

impl Discovery {
    pub fn new() -> Result<Self> {
        Self::with_search_timeout(Duration::from_secs(3))
    }

    pub fn with_search_timeout(search_timeout: Duration) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| DiscoveryError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            registry: Arc::new(Registry::new()),
            http,
            search_timeout,
            found_any: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Run one SSDP sweep, inserting every validated player into the
    /// registry. Returns the number of players seen in this sweep.
    pub fn probe(&self) -> Result<usize> {
        let client = SsdpClient::new(self.search_timeout)?;
        let responses = client.search(SEARCH_TARGET)?;

        let mut seen_locations = HashSet::new();
        let mut found = 0usize;

        for response in responses {
            if !seen_locations.insert(response.location.clone()) {
                continue;
            }
            if !Self::is_likely_player(&response) {
                continue;
            }
            match self.fetch_and_validate(&response.location) {
                Ok(true) => found += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(location = %response.location, "skipping device: {e}");
                }
            }
        }

        if found > 0 {
            self.found_any.store(true, Ordering::Relaxed);
        }
        tracing::debug!(found, "discovery sweep complete");
        Ok(found)
    }

    /// Cadence for the next sweep: 30 s until something is found, 5 min
    /// afterwards.
    pub fn probe_interval(&self) -> Duration {
        if self.found_any.load(Ordering::Relaxed) {
            STEADY_PROBE_INTERVAL
        } else {
            INITIAL_PROBE_INTERVAL
        }
    }

    /// Record a subscription failure for a player. When the failure window
    /// is exhausted, a fresh description fetch is the final arbiter: only if
    /// that fails too is the player removed.
    pub fn report_subscription_failure(&self, uuid: &str) -> bool {
        if !self.registry.note_subscription_failure(uuid) {
            return false;
        }
        let Some(device) = self.registry.get_by_id(uuid) else {
            return false;
        };
        let url = format!("{}/xml/device_description.xml", device.base_url);
        let reachable = self
            .http
            .get(&url)
            .send()
            .map(|resp| resp.status().is_success())
            .unwrap_or(false);
        if reachable {
            tracing::warn!(id = %device.id, "subscription failures but device still answers, keeping");
            self.registry.note_subscription_success(uuid);
            false
        } else {
            self.registry.remove(uuid);
            true
        }
    }

    pub fn report_subscription_success(&self, uuid: &str) {
        self.registry.note_subscription_success(uuid);
    }

    /// IPv4 of the interface used for outbound traffic. Determined via a
    /// connected UDP socket; no packet is sent.
    pub fn local_ip() -> Option<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        socket.local_addr().ok().map(|addr| addr.ip())
    }

    fn is_likely_player(response: &SsdpResponse) -> bool {
        if response.urn.contains("ZonePlayer") {
            return true;
        }
        if response.usn.contains("RINCON") {
            return true;
        }
        if let Some(server) = &response.server {
            if server.to_lowercase().contains("sonos") {
                return true;
            }
        }
        false
    }

    fn fetch_and_validate(&self, location: &str) -> Result<bool> {
        let response = self
            .http
            .get(location)
            .send()
            .map_err(|e| DiscoveryError::Network(format!("failed to fetch description: {e}")))?;
        let xml = response
            .text()
            .map_err(|e| DiscoveryError::Network(format!("failed to read description: {e}")))?;

        let description = DeviceDescription::from_xml(&xml)?;
        if !description.is_supported_player() {
            return Ok(false);
        }
        let Some(base_url) = base_url_from_location(location) else {
            return Ok(false);
        };
        self.registry.insert(description.to_device(base_url));
        Ok(true)
    }
}
