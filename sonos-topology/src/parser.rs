//! Serde model for zone-group-topology UPnP events.
//!
//! Events are wrapped in a propertyset; the `ZoneGroupState` property text
//! is itself an XML-escaped document:
//!
//! ```xml
//! <e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0">
//!   <e:property>
//!     <ZoneGroupState>&lt;ZoneGroupState&gt;...&lt;/ZoneGroupState&gt;</ZoneGroupState>
//!   </e:property>
//! </e:propertyset>
//! ```

use serde::Deserialize;

use crate::error::{Result, TopologyError};
use crate::xml_decode;

/// Root parser for topology events.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "propertyset")]
pub struct TopologyEvent {
    #[serde(rename = "property", default)]
    pub properties: Vec<Property>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Property {
    #[serde(
        rename = "ZoneGroupState",
        deserialize_with = "xml_decode::deserialize_nested",
        default
    )]
    pub zone_group_state: Option<ZoneGroupState>,
}

/// Decoded `ZoneGroupState` document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "ZoneGroupState")]
pub struct ZoneGroupState {
    #[serde(rename = "ZoneGroups", default)]
    pub zone_groups: ZoneGroups,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ZoneGroups {
    #[serde(rename = "ZoneGroup", default)]
    pub zone_groups: Vec<ZoneGroupElement>,
}

/// One group of players sharing playback.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneGroupElement {
    #[serde(rename = "@Coordinator")]
    pub coordinator: String,

    #[serde(rename = "@ID")]
    pub id: String,

    #[serde(rename = "ZoneGroupMember", default)]
    pub members: Vec<ZoneGroupMemberElement>,
}

/// One member descriptor. Only the attributes the gateway consumes are
/// modeled; the rest of the descriptor is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneGroupMemberElement {
    #[serde(rename = "@UUID")]
    pub uuid: String,

    #[serde(rename = "@Location", default)]
    pub location: Option<String>,

    #[serde(rename = "@ZoneName")]
    pub zone_name: String,

    #[serde(rename = "@SoftwareVersion", default)]
    pub software_version: Option<String>,

    /// Stereo-pair channel map, e.g. `RINCON_A:LF,LF;RINCON_B:RF,RF`
    #[serde(rename = "@ChannelMapSet", default)]
    pub channel_map_set: Option<String>,

    /// Home-theater satellite channel map
    #[serde(rename = "@HTSatChanMapSet", default)]
    pub ht_sat_chan_map_set: Option<String>,

    #[serde(rename = "@Invisible", default)]
    pub invisible: Option<String>,

    #[serde(rename = "Satellite", default)]
    pub satellites: Vec<SatelliteElement>,
}

/// A satellite speaker nested under its home-theater primary.
#[derive(Debug, Clone, Deserialize)]
pub struct SatelliteElement {
    #[serde(rename = "@UUID")]
    pub uuid: String,

    #[serde(rename = "@ZoneName")]
    pub zone_name: String,

    #[serde(rename = "@HTSatChanMapSet", default)]
    pub ht_sat_chan_map_set: Option<String>,

    #[serde(rename = "@SoftwareVersion", default)]
    pub software_version: Option<String>,
}

impl TopologyEvent {
    pub fn from_xml(xml: &str) -> Result<Self> {
        xml_decode::parse(xml)
    }

    /// The ZoneGroupState property, required for a topology event to be
    /// meaningful.
    pub fn zone_group_state(&self) -> Result<&ZoneGroupState> {
        self.properties
            .iter()
            .find_map(|p| p.zone_group_state.as_ref())
            .ok_or(TopologyError::MissingZoneGroupState)
    }
}

impl ZoneGroupMemberElement {
    pub fn is_invisible(&self) -> bool {
        self.invisible.as_deref() == Some("1")
    }

    /// The channel map carried by this member, whichever flavor is present.
    pub fn channel_map(&self) -> Option<&str> {
        self.ht_sat_chan_map_set
            .as_deref()
            .or(self.channel_map_set.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const STEREO_PAIR_XML: &str = r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><ZoneGroupState>&lt;ZoneGroupState&gt;&lt;ZoneGroups&gt;&lt;ZoneGroup Coordinator=&quot;RINCON_LEFT01400&quot; ID=&quot;RINCON_LEFT01400:12&quot;&gt;&lt;ZoneGroupMember UUID=&quot;RINCON_LEFT01400&quot; Location=&quot;http://192.168.1.61:1400/xml/device_description.xml&quot; ZoneName=&quot;Study&quot; SoftwareVersion=&quot;85.0-64200&quot; ChannelMapSet=&quot;RINCON_LEFT01400:LF,LF;RINCON_RIGHT1400:RF,RF&quot;/&gt;&lt;ZoneGroupMember UUID=&quot;RINCON_RIGHT1400&quot; Location=&quot;http://192.168.1.62:1400/xml/device_description.xml&quot; ZoneName=&quot;Study&quot; SoftwareVersion=&quot;85.0-64200&quot; ChannelMapSet=&quot;RINCON_LEFT01400:LF,LF;RINCON_RIGHT1400:RF,RF&quot;/&gt;&lt;/ZoneGroup&gt;&lt;/ZoneGroups&gt;&lt;VanishedDevices&gt;&lt;/VanishedDevices&gt;&lt;/ZoneGroupState&gt;</ZoneGroupState></e:property></e:propertyset>"#;

    #[test]
    fn test_parse_stereo_pair_event() {
        let event = TopologyEvent::from_xml(STEREO_PAIR_XML).unwrap();
        let state = event.zone_group_state().unwrap();

        assert_eq!(state.zone_groups.zone_groups.len(), 1);
        let group = &state.zone_groups.zone_groups[0];
        assert_eq!(group.coordinator, "RINCON_LEFT01400");
        assert_eq!(group.members.len(), 2);
        assert_eq!(group.members[0].zone_name, "Study");
        assert_eq!(
            group.members[1].channel_map(),
            Some("RINCON_LEFT01400:LF,LF;RINCON_RIGHT1400:RF,RF")
        );
    }

    #[test]
    fn test_event_without_zone_group_state() {
        let xml = r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><ThirdPartyMediaServersX>abc</ThirdPartyMediaServersX></e:property></e:propertyset>"#;
        let event = TopologyEvent::from_xml(xml).unwrap();
        assert!(matches!(
            event.zone_group_state(),
            Err(TopologyError::MissingZoneGroupState)
        ));
    }
}
