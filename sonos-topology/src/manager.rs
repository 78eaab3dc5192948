//! Topology snapshot and query surface.
//!
//! Every topology NOTIFY replaces the whole snapshot atomically: readers
//! hold an `Arc` to either the previous or the new state, never a mix.

use std::sync::{Arc, RwLock};

use crate::channel_map;
use crate::error::Result;
use crate::parser::TopologyEvent;

/// A member of a zone, flattened from the wire descriptor (satellites
/// become members with `invisible` set).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ZoneMember {
    pub uuid: String,
    pub room_name: String,
    pub is_coordinator: bool,
    /// Raw channel-map string when the member belongs to a bonded set
    pub channel_map_set: Option<String>,
    pub software_version: Option<String>,
    /// Bonded secondaries and satellites are invisible to room addressing
    pub invisible: bool,
}

/// A zone: one coordinator plus members (a solo player is a zone of one).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Zone {
    pub id: String,
    pub coordinator: String,
    pub members: Vec<ZoneMember>,
}

impl Zone {
    pub fn contains(&self, uuid: &str) -> bool {
        self.members.iter().any(|member| member.uuid == uuid)
    }

    /// Whether this zone is exactly a stereo pair: two members, one room.
    pub fn is_pure_stereo_pair(&self) -> bool {
        self.members.len() == 2
            && self.members[0].room_name == self.members[1].room_name
            && self
                .members
                .iter()
                .any(|member| member.channel_map_set.is_some())
    }
}

/// Immutable view of the household at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TopologySnapshot {
    pub zones: Vec<Zone>,
}

/// Details for one member, as exposed to diagnostics and room resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberDetails {
    pub room_name: String,
    pub channel_map_set: Option<String>,
}

/// Tracks the current zone/bond layout of the household.
pub struct TopologyManager {
    snapshot: RwLock<Arc<TopologySnapshot>>,
}

impl TopologyManager {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(TopologySnapshot::default())),
        }
    }

    /// Parse a topology NOTIFY body and swap in the new snapshot.
    /// Returns the installed snapshot.
    pub fn apply_event(&self, body_xml: &str) -> Result<Arc<TopologySnapshot>> {
        let event = TopologyEvent::from_xml(body_xml)?;
        let state = event.zone_group_state()?;

        let mut zones = Vec::with_capacity(state.zone_groups.zone_groups.len());
        for group in &state.zone_groups.zone_groups {
            let mut members = Vec::new();
            for member in &group.members {
                members.push(ZoneMember {
                    uuid: member.uuid.clone(),
                    room_name: member.zone_name.clone(),
                    is_coordinator: member.uuid == group.coordinator,
                    channel_map_set: member.channel_map().map(|s| s.to_string()),
                    software_version: member.software_version.clone(),
                    invisible: member.is_invisible(),
                });
                for satellite in &member.satellites {
                    members.push(ZoneMember {
                        uuid: satellite.uuid.clone(),
                        room_name: satellite.zone_name.clone(),
                        is_coordinator: false,
                        channel_map_set: satellite.ht_sat_chan_map_set.clone(),
                        software_version: satellite.software_version.clone(),
                        invisible: true,
                    });
                }
            }
            zones.push(Zone {
                id: group.id.clone(),
                coordinator: group.coordinator.clone(),
                members,
            });
        }

        let snapshot = Arc::new(TopologySnapshot { zones });
        *self.snapshot.write().unwrap() = Arc::clone(&snapshot);
        tracing::debug!(zones = snapshot.zones.len(), "topology snapshot replaced");
        Ok(snapshot)
    }

    /// Current snapshot (cheap clone of an `Arc`).
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        Arc::clone(&self.snapshot.read().unwrap())
    }

    pub fn zones(&self) -> Vec<Zone> {
        self.snapshot().zones.clone()
    }

    /// Coordinator of the zone containing `uuid`.
    pub fn coordinator_of(&self, uuid: &str) -> Option<String> {
        self.snapshot()
            .zones
            .iter()
            .find(|zone| zone.contains(uuid))
            .map(|zone| zone.coordinator.clone())
    }

    /// UUIDs of every member in `uuid`'s zone, coordinator included.
    pub fn members_of(&self, uuid: &str) -> Vec<String> {
        self.snapshot()
            .zones
            .iter()
            .find(|zone| zone.contains(uuid))
            .map(|zone| zone.members.iter().map(|m| m.uuid.clone()).collect())
            .unwrap_or_default()
    }

    /// When several members share `room`, the one carrying the `LF` channel
    /// role is the pair primary, the member all room addressing must hit.
    pub fn stereo_primary(&self, room: &str) -> Option<String> {
        let snapshot = self.snapshot();
        let sharing: Vec<&ZoneMember> = snapshot
            .zones
            .iter()
            .flat_map(|zone| zone.members.iter())
            .filter(|member| member.room_name.eq_ignore_ascii_case(room))
            .collect();
        if sharing.len() < 2 {
            return None;
        }
        sharing
            .iter()
            .filter_map(|member| member.channel_map_set.as_deref())
            .find_map(channel_map::left_front_uuid)
    }

    pub fn member_details(&self, uuid: &str) -> Option<MemberDetails> {
        self.snapshot()
            .zones
            .iter()
            .flat_map(|zone| zone.members.iter())
            .find(|member| member.uuid == uuid)
            .map(|member| MemberDetails {
                room_name: member.room_name.clone(),
                channel_map_set: member.channel_map_set.clone(),
            })
    }

    /// Zone containing `uuid`, if any.
    pub fn zone_of(&self, uuid: &str) -> Option<Zone> {
        self.snapshot()
            .zones
            .iter()
            .find(|zone| zone.contains(uuid))
            .cloned()
    }
}

impl Default for TopologyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_ZONES_XML: &str = r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><ZoneGroupState>&lt;ZoneGroupState&gt;&lt;ZoneGroups&gt;&lt;ZoneGroup Coordinator=&quot;RINCON_KITCHEN400&quot; ID=&quot;RINCON_KITCHEN400:11&quot;&gt;&lt;ZoneGroupMember UUID=&quot;RINCON_KITCHEN400&quot; ZoneName=&quot;Kitchen&quot; SoftwareVersion=&quot;85.0-64200&quot;/&gt;&lt;ZoneGroupMember UUID=&quot;RINCON_DEN00001400&quot; ZoneName=&quot;Den&quot; SoftwareVersion=&quot;85.0-64200&quot;/&gt;&lt;/ZoneGroup&gt;&lt;ZoneGroup Coordinator=&quot;RINCON_LEFT01400&quot; ID=&quot;RINCON_LEFT01400:12&quot;&gt;&lt;ZoneGroupMember UUID=&quot;RINCON_LEFT01400&quot; ZoneName=&quot;Study&quot; ChannelMapSet=&quot;RINCON_LEFT01400:LF,LF;RINCON_RIGHT1400:RF,RF&quot;/&gt;&lt;ZoneGroupMember UUID=&quot;RINCON_RIGHT1400&quot; ZoneName=&quot;Study&quot; Invisible=&quot;1&quot; ChannelMapSet=&quot;RINCON_LEFT01400:LF,LF;RINCON_RIGHT1400:RF,RF&quot;/&gt;&lt;/ZoneGroup&gt;&lt;/ZoneGroups&gt;&lt;/ZoneGroupState&gt;</ZoneGroupState></e:property></e:propertyset>"#;

    fn manager_with_fixture() -> TopologyManager {
        let manager = TopologyManager::new();
        manager.apply_event(TWO_ZONES_XML).unwrap();
        manager
    }

    #[test]
    fn test_zones_after_event() {
        let manager = manager_with_fixture();
        let zones = manager.zones();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].coordinator, "RINCON_KITCHEN400");
        assert_eq!(zones[0].members.len(), 2);
    }

    #[test]
    fn test_coordinator_of_member() {
        let manager = manager_with_fixture();
        assert_eq!(
            manager.coordinator_of("RINCON_DEN00001400").as_deref(),
            Some("RINCON_KITCHEN400")
        );
        assert_eq!(
            manager.coordinator_of("RINCON_KITCHEN400").as_deref(),
            Some("RINCON_KITCHEN400")
        );
        assert_eq!(manager.coordinator_of("RINCON_UNKNOWN"), None);
    }

    #[test]
    fn test_members_of() {
        let manager = manager_with_fixture();
        let members = manager.members_of("RINCON_DEN00001400");
        assert_eq!(members, vec!["RINCON_KITCHEN400", "RINCON_DEN00001400"]);
    }

    #[test]
    fn test_stereo_primary() {
        let manager = manager_with_fixture();
        assert_eq!(
            manager.stereo_primary("Study").as_deref(),
            Some("RINCON_LEFT01400")
        );
        assert_eq!(manager.stereo_primary("study").as_deref(), Some("RINCON_LEFT01400"));
        // Single-member rooms have no pair primary
        assert_eq!(manager.stereo_primary("Kitchen"), None);
    }

    #[test]
    fn test_pure_stereo_pair_detection() {
        let manager = manager_with_fixture();
        let pair_zone = manager.zone_of("RINCON_LEFT01400").unwrap();
        assert!(pair_zone.is_pure_stereo_pair());
        let group_zone = manager.zone_of("RINCON_KITCHEN400").unwrap();
        assert!(!group_zone.is_pure_stereo_pair());
    }

    #[test]
    fn test_snapshot_is_replaced_atomically() {
        let manager = manager_with_fixture();
        let before = manager.snapshot();
        manager.apply_event(TWO_ZONES_XML).unwrap();
        let after = manager.snapshot();
        // Old snapshot still readable, new snapshot is a distinct Arc
        assert_eq!(before.zones.len(), 2);
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_member_details() {
        let manager = manager_with_fixture();
        let details = manager.member_details("RINCON_RIGHT1400").unwrap();
        assert_eq!(details.room_name, "Study");
        assert!(details.channel_map_set.unwrap().contains("RF,RF"));
    }
}
