//! Household music-service table.
//!
//! Populated by calling `ListAvailableServices` on a preferred player and
//! refreshed daily. Entries discovered indirectly (a favourite referencing
//! a service id the list does not carry) are cloned from their canonical
//! entry and survive refreshes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use soap_client::{xml, CallOptions, SoapClient};
use sonos_discovery::{normalize_uuid, Discovery};
use sonos_topology::TopologyManager;

use crate::error::{MusicError, Result};
use crate::persist;

const MUSIC_SERVICES_TYPE: &str = "urn:schemas-upnp-org:service:MusicServices:1";
const MUSIC_SERVICES_PATH: &str = "/MusicServices/Control";

/// Personalized (household-bound) service instances live in this id band.
const PERSONALIZED_ID_RANGE: std::ops::RangeInclusive<u32> = 80000..=99999;

/// Playback behavior class, inferred from URI scheme markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    Stream,
    Radio,
    Hls,
    SpotifyLike,
    Playlist,
    Library,
    Mp3Radio,
    Unknown,
}

/// Infer the playback class from a URI or scheme marker string.
pub fn infer_service_type(marker: &str) -> ServiceType {
    let marker = marker.to_lowercase();
    if marker.contains("x-sonos-spotify") {
        ServiceType::SpotifyLike
    } else if marker.contains("x-sonosapi-stream") {
        ServiceType::Stream
    } else if marker.contains("x-sonosapi-radio") {
        ServiceType::Radio
    } else if marker.contains("x-sonosapi-hls") {
        ServiceType::Hls
    } else if marker.contains("x-rincon-playlist") || marker.contains("x-rincon-cpcontainer") {
        ServiceType::Playlist
    } else if marker.contains("x-file-cifs") {
        ServiceType::Library
    } else if marker.contains("x-rincon-mp3radio") {
        ServiceType::Mp3Radio
    } else {
        ServiceType::Unknown
    }
}

/// One third-party service known to the household.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: u32,
    /// Display name (e.g. "Spotify")
    pub name: String,
    /// Name normalized for lookup (lowercase, no spaces)
    pub internal_name: String,
    pub uri: Option<String>,
    pub auth_policy: Option<String>,
    pub capabilities: u32,
    pub service_type: ServiceType,
    pub is_tunein: bool,
    pub is_personalized: bool,
    /// Cloned from a canonical entry after being seen in a favourite
    pub is_discovered: bool,
}

/// Status payload for the `/services` debug surface.
#[derive(Debug, Clone, Serialize)]
pub struct ServicesStatus {
    pub count: usize,
    pub discovered_count: usize,
    pub last_refresh: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "Services")]
struct ServicesDoc {
    #[serde(rename = "Service", default)]
    services: Vec<ServiceElement>,
}

#[derive(Debug, Deserialize)]
struct ServiceElement {
    #[serde(rename = "@Id")]
    id: String,
    #[serde(rename = "@Name")]
    name: String,
    #[serde(rename = "@Uri", default)]
    uri: Option<String>,
    #[serde(rename = "@ContainerType", default)]
    container_type: Option<String>,
    #[serde(rename = "@Capabilities", default)]
    capabilities: Option<String>,
    #[serde(rename = "Policy", default)]
    policy: Option<PolicyElement>,
}

#[derive(Debug, Deserialize)]
struct PolicyElement {
    #[serde(rename = "@Auth", default)]
    auth: Option<String>,
}

/// Cached table of service descriptors, persisted as JSON.
pub struct ServicesCache {
    soap: Arc<SoapClient>,
    discovery: Arc<Discovery>,
    topology: Arc<TopologyManager>,
    table: RwLock<HashMap<u32, ServiceDescriptor>>,
    cache_path: PathBuf,
    last_refresh: Mutex<Option<DateTime<Utc>>>,
}

impl ServicesCache {
    pub fn new(
        soap: Arc<SoapClient>,
        discovery: Arc<Discovery>,
        topology: Arc<TopologyManager>,
        cache_path: PathBuf,
    ) -> Self {
        let cache = Self {
            soap,
            discovery,
            topology,
            table: RwLock::new(HashMap::new()),
            cache_path,
            last_refresh: Mutex::new(None),
        };
        if let Some(persisted) = persist::load_json::<Vec<ServiceDescriptor>>(&cache.cache_path) {
            let mut table = cache.table.write().unwrap();
            for descriptor in persisted {
                table.insert(descriptor.id, descriptor);
            }
            tracing::info!(count = table.len(), "services cache loaded from disk");
        }
        cache
    }

    pub fn get_services(&self) -> Vec<ServiceDescriptor> {
        let mut services: Vec<ServiceDescriptor> =
            self.table.read().unwrap().values().cloned().collect();
        services.sort_by_key(|s| s.id);
        services
    }

    pub fn get_by_id(&self, id: u32) -> Option<ServiceDescriptor> {
        self.table.read().unwrap().get(&id).cloned()
    }

    /// Case-insensitive lookup by display or internal name.
    pub fn find_by_name(&self, name: &str) -> Option<ServiceDescriptor> {
        let needle = name.to_lowercase().replace(' ', "");
        self.table
            .read()
            .unwrap()
            .values()
            .find(|service| {
                service.internal_name == needle || service.name.eq_ignore_ascii_case(name)
            })
            .cloned()
    }

    pub fn status(&self) -> ServicesStatus {
        let table = self.table.read().unwrap();
        ServicesStatus {
            count: table.len(),
            discovered_count: table.values().filter(|s| s.is_discovered).count(),
            last_refresh: *self.last_refresh.lock().unwrap(),
        }
    }

    /// Fetch the service list from the preferred player and replace the
    /// table (keeping discovered entries). Wired to a 24 h scheduler task.
    pub fn refresh(&self) -> Result<usize> {
        let device = self
            .preferred_device()
            .ok_or_else(|| MusicError::Unconfigured("no players discovered yet".to_string()))?;

        let endpoint = format!("{}{}", device.base_url, MUSIC_SERVICES_PATH);
        let response = self
            .soap
            .call(
                &endpoint,
                MUSIC_SERVICES_TYPE,
                "ListAvailableServices",
                &[],
                CallOptions::default(),
            )
            .map_err(|e| MusicError::Http(e.to_string()))?;

        let descriptor_list = xml::child_text(&response, "AvailableServiceDescriptorList")
            .ok_or_else(|| MusicError::Parse("missing service descriptor list".to_string()))?;
        let parsed = parse_service_list(&descriptor_list)?;
        let count = parsed.len();

        {
            let mut table = self.table.write().unwrap();
            let discovered: Vec<ServiceDescriptor> = table
                .values()
                .filter(|service| service.is_discovered)
                .cloned()
                .collect();
            table.clear();
            for descriptor in parsed {
                table.insert(descriptor.id, descriptor);
            }
            // Discovered clones survive refreshes unless the list now has
            // the real entry
            for descriptor in discovered {
                table.entry(descriptor.id).or_insert(descriptor);
            }
        }
        *self.last_refresh.lock().unwrap() = Some(Utc::now());
        self.persist()?;
        tracing::info!(count, "services table refreshed");
        Ok(count)
    }

    /// Clone the canonical entry under a new id seen in a favourite URI.
    pub fn add_discovered_service_id(&self, id: u32, canonical_name: &str) -> Result<()> {
        {
            let mut table = self.table.write().unwrap();
            if table.contains_key(&id) {
                return Ok(());
            }
            let canonical = table
                .values()
                .find(|service| service.name.eq_ignore_ascii_case(canonical_name))
                .cloned()
                .ok_or_else(|| {
                    MusicError::NotFound(format!("canonical service '{canonical_name}'"))
                })?;
            tracing::info!(id, canonical = %canonical.name, "registering discovered service id");
            table.insert(
                id,
                ServiceDescriptor {
                    id,
                    is_discovered: true,
                    is_personalized: PERSONALIZED_ID_RANGE.contains(&id),
                    ..canonical
                },
            );
        }
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let services = self.get_services();
        persist::save_json(&self.cache_path, &services)
    }

    /// Preference order for the query anchor: a coordinator first, then a
    /// non-portable model, then anything.
    fn preferred_device(&self) -> Option<sonos_discovery::Device> {
        let devices = self.discovery.registry().get_all();
        if devices.is_empty() {
            return None;
        }
        let is_coordinator = |device: &sonos_discovery::Device| {
            let uuid = normalize_uuid(&device.id);
            self.topology.coordinator_of(&uuid).as_deref() == Some(uuid.as_str())
        };
        devices
            .iter()
            .find(|d| is_coordinator(d))
            .or_else(|| devices.iter().find(|d| !d.is_portable()))
            .or_else(|| devices.first())
            .cloned()
    }
}

fn parse_service_list(xml: &str) -> Result<Vec<ServiceDescriptor>> {
    let doc: ServicesDoc =
        sonos_topology::xml_decode::parse(xml).map_err(|e| MusicError::Parse(e.to_string()))?;
    let mut services = Vec::with_capacity(doc.services.len());
    for element in doc.services {
        let Ok(id) = element.id.parse::<u32>() else {
            continue;
        };
        let marker = format!(
            "{} {}",
            element.uri.as_deref().unwrap_or(""),
            element.container_type.as_deref().unwrap_or("")
        );
        services.push(ServiceDescriptor {
            id,
            internal_name: element.name.to_lowercase().replace(' ', ""),
            is_tunein: element.name.eq_ignore_ascii_case("TuneIn") || id == 254,
            is_personalized: PERSONALIZED_ID_RANGE.contains(&id),
            is_discovered: false,
            service_type: infer_service_type(&marker),
            capabilities: element
                .capabilities
                .as_deref()
                .and_then(|c| c.parse().ok())
                .unwrap_or(0),
            auth_policy: element.policy.and_then(|p| p.auth),
            uri: element.uri,
            name: element.name,
        });
    }
    Ok(services)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICES_XML: &str = r#"<Services SchemaVersion="1"><Service Id="12" Name="Spotify" Version="1.1" Uri="https://spotify.ws.sonos.com/smapi" SecureUri="https://spotify.ws.sonos.com/smapi" ContainerType="SoundLab" Capabilities="2208321" MaxMessagingChars="0"><Policy Auth="AppLink" PollInterval="30"/><Presentation/></Service><Service Id="254" Name="TuneIn" Version="1.1" Uri="http://legato.radiotime.com/Radio.asmx" SecureUri="http://legato.radiotime.com/Radio.asmx" ContainerType="MService" Capabilities="0"><Policy Auth="Anonymous" PollInterval="0"/></Service><Service Id="85255" Name="Pandora" Version="1.1" Uri="https://ws.sonos.pandora.com/smapi" SecureUri="https://ws.sonos.pandora.com/smapi" ContainerType="MService" Capabilities="63" ><Policy Auth="DeviceLink" PollInterval="3600"/></Service></Services>"#;

    #[test]
    fn test_parse_service_list() {
        let services = parse_service_list(SERVICES_XML).unwrap();
        assert_eq!(services.len(), 3);

        let spotify = services.iter().find(|s| s.id == 12).unwrap();
        assert_eq!(spotify.name, "Spotify");
        assert_eq!(spotify.internal_name, "spotify");
        assert_eq!(spotify.auth_policy.as_deref(), Some("AppLink"));
        assert!(!spotify.is_personalized);

        let tunein = services.iter().find(|s| s.id == 254).unwrap();
        assert!(tunein.is_tunein);

        let pandora = services.iter().find(|s| s.id == 85255).unwrap();
        assert!(pandora.is_personalized);
        assert!(!pandora.is_tunein);
    }

    #[test]
    fn test_infer_service_type_markers() {
        assert_eq!(
            infer_service_type("x-sonos-spotify:spotify%3atrack"),
            ServiceType::SpotifyLike
        );
        assert_eq!(
            infer_service_type("x-sonosapi-stream:s1234?sid=254"),
            ServiceType::Stream
        );
        assert_eq!(
            infer_service_type("x-sonosapi-radio:ST%3a1?sid=236"),
            ServiceType::Radio
        );
        assert_eq!(
            infer_service_type("x-sonosapi-hls:catalog"),
            ServiceType::Hls
        );
        assert_eq!(
            infer_service_type("x-rincon-cpcontainer:1006286c"),
            ServiceType::Playlist
        );
        assert_eq!(
            infer_service_type("x-file-cifs://nas/music"),
            ServiceType::Library
        );
        assert_eq!(
            infer_service_type("x-rincon-mp3radio://stream.example"),
            ServiceType::Mp3Radio
        );
        assert_eq!(infer_service_type("https://smapi"), ServiceType::Unknown);
    }

    fn cache_with(services: Vec<ServiceDescriptor>) -> (ServicesCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ServicesCache::new(
            Arc::new(SoapClient::new()),
            Arc::new(Discovery::new().unwrap()),
            Arc::new(TopologyManager::new()),
            dir.path().join("services-cache.json"),
        );
        {
            let mut table = cache.table.write().unwrap();
            for service in services {
                table.insert(service.id, service);
            }
        }
        (cache, dir)
    }

    #[test]
    fn test_discovered_service_id_clones_canonical() {
        let (cache, _dir) = cache_with(parse_service_list(SERVICES_XML).unwrap());

        cache.add_discovered_service_id(3079, "Spotify").unwrap();
        let discovered = cache.get_by_id(3079).unwrap();
        assert_eq!(discovered.name, "Spotify");
        assert!(discovered.is_discovered);
        assert_eq!(discovered.service_type, ServiceType::SpotifyLike);

        // Unknown canonical name is an error
        assert!(cache.add_discovered_service_id(9, "Nonesuch").is_err());
        // Existing ids are a no-op
        cache.add_discovered_service_id(12, "Spotify").unwrap();
        assert!(!cache.get_by_id(12).unwrap().is_discovered);
    }

    #[test]
    fn test_find_by_name() {
        let (cache, _dir) = cache_with(parse_service_list(SERVICES_XML).unwrap());
        assert!(cache.find_by_name("spotify").is_some());
        assert!(cache.find_by_name("SPOTIFY").is_some());
        assert!(cache.find_by_name("deezer").is_none());
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services-cache.json");
        persist::save_json(&path, &parse_service_list(SERVICES_XML).unwrap()).unwrap();

        let cache = ServicesCache::new(
            Arc::new(SoapClient::new()),
            Arc::new(Discovery::new().unwrap()),
            Arc::new(TopologyManager::new()),
            path,
        );
        assert_eq!(cache.status().count, 3);
        assert!(cache.find_by_name("Pandora").is_some());
    }
}
