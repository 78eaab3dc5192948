//! Device description parsing and validation.

use serde::Deserialize;

use crate::error::{DiscoveryError, Result};

/// Model substrings identifying battery-powered players. Portable players
/// are deprioritized when the gateway picks a query anchor.
const PORTABLE_MODELS: &[&str] = &["Roam", "Move"];

/// A player known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Device {
    /// Player UUID, normalized (no `uuid:` prefix)
    pub id: String,
    /// Room name as configured on the player
    pub room_name: String,
    /// Model name (e.g. "Sonos One")
    pub model_name: String,
    /// Control-plane base URL, `http://<ip>:<port>`
    pub base_url: String,
    /// Software version, when the description carries one
    pub software_version: Option<String>,
}

impl Device {
    /// IP portion of the base URL.
    pub fn ip_address(&self) -> Option<&str> {
        extract_ip_from_url(&self.base_url)
    }

    /// Whether the model is battery-powered.
    pub fn is_portable(&self) -> bool {
        PORTABLE_MODELS
            .iter()
            .any(|model| self.model_name.contains(model))
    }
}

/// Strip the optional `uuid:` prefix so identifiers compare by value.
pub fn normalize_uuid(raw: &str) -> String {
    raw.strip_prefix("uuid:").unwrap_or(raw).to_string()
}

/// UPnP device description root element.
#[derive(Debug, Deserialize)]
pub(crate) struct Root {
    pub device: DeviceDescription,
}

/// Device description parsed from the player's description XML.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeviceDescription {
    pub device_type: String,
    #[allow(dead_code)]
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_name: String,
    #[serde(rename = "UDN")]
    pub udn: String,
    pub room_name: Option<String>,
    pub software_version: Option<String>,
}

impl DeviceDescription {
    pub fn from_xml(xml: &str) -> Result<Self> {
        let root: Root = quick_xml::de::from_str(xml)
            .map_err(|e| DiscoveryError::Parse(format!("failed to parse device XML: {e}")))?;
        Ok(root.device)
    }

    /// Validate by manufacturer name and device type.
    pub fn is_supported_player(&self) -> bool {
        self.manufacturer.to_lowercase().contains("sonos")
            || self.device_type.contains("ZonePlayer")
    }

    pub fn to_device(&self, base_url: String) -> Device {
        Device {
            id: normalize_uuid(&self.udn),
            room_name: self
                .room_name
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            model_name: self.model_name.clone(),
            base_url,
            software_version: self.software_version.clone(),
        }
    }
}

/// Extract the host portion of a URL like `http://192.168.1.100:1400/xml/...`.
pub fn extract_ip_from_url(url: &str) -> Option<&str> {
    url.split("//").nth(1)?.split([':', '/']).next()
}

/// Reduce a description location URL to the control-plane base URL.
pub fn base_url_from_location(location: &str) -> Option<String> {
    let rest = location.split("//").nth(1)?;
    let host_port = rest.split('/').next()?;
    Some(format!("http://{host_port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTION_XML: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:ZonePlayer:1</deviceType>
    <friendlyName>192.168.1.50 - Sonos One</friendlyName>
    <manufacturer>Sonos, Inc.</manufacturer>
    <modelName>Sonos One</modelName>
    <UDN>uuid:RINCON_ABCDEF123456</UDN>
    <roomName>Kitchen</roomName>
    <softwareVersion>70.3-35220</softwareVersion>
  </device>
</root>"#;

    #[test]
    fn test_parse_description() {
        let desc = DeviceDescription::from_xml(DESCRIPTION_XML).unwrap();
        assert_eq!(desc.model_name, "Sonos One");
        assert_eq!(desc.udn, "uuid:RINCON_ABCDEF123456");
        assert_eq!(desc.room_name.as_deref(), Some("Kitchen"));
        assert!(desc.is_supported_player());
    }

    #[test]
    fn test_to_device_normalizes_uuid() {
        let desc = DeviceDescription::from_xml(DESCRIPTION_XML).unwrap();
        let device = desc.to_device("http://192.168.1.50:1400".to_string());
        assert_eq!(device.id, "RINCON_ABCDEF123456");
        assert_eq!(device.room_name, "Kitchen");
        assert_eq!(device.ip_address(), Some("192.168.1.50"));
        assert!(!device.is_portable());
    }

    #[test]
    fn test_normalize_uuid() {
        assert_eq!(normalize_uuid("uuid:RINCON_1"), "RINCON_1");
        assert_eq!(normalize_uuid("RINCON_1"), "RINCON_1");
    }

    #[test]
    fn test_portable_model_detection() {
        let device = Device {
            id: "RINCON_X".to_string(),
            room_name: "Patio".to_string(),
            model_name: "Sonos Roam".to_string(),
            base_url: "http://192.168.1.60:1400".to_string(),
            software_version: None,
        };
        assert!(device.is_portable());
    }

    #[test]
    fn test_base_url_from_location() {
        assert_eq!(
            base_url_from_location("http://192.168.1.100:1400/xml/device_description.xml"),
            Some("http://192.168.1.100:1400".to_string())
        );
        assert_eq!(base_url_from_location("garbage"), None);
    }

    #[test]
    fn test_rejects_non_player_device() {
        let xml = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:Basic:1</deviceType>
    <friendlyName>Router</friendlyName>
    <manufacturer>Other Company</manufacturer>
    <modelName>Router Model</modelName>
    <UDN>uuid:ROUTER123</UDN>
  </device>
</root>"#;
        let desc = DeviceDescription::from_xml(xml).unwrap();
        assert!(!desc.is_supported_player());
    }
}
