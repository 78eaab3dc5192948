//! Channel-map string parsing.
//!
//! Bonded sets carry a semicolon-delimited map assigning channel roles to
//! member UUIDs: `RINCON_A:LF,LF;RINCON_B:RF,RF` for a stereo pair, or
//! `RINCON_A:LF,RF;RINCON_B:LR;RINCON_C:RR` for a surround set.

/// Channel roles a bonded member can carry.
pub const CHANNEL_ROLES: &[&str] = &["LF", "RF", "LR", "RR", "C", "SW", "H", "MX"];

/// Whether `role` is one of the known channel roles.
pub fn is_known_role(role: &str) -> bool {
    CHANNEL_ROLES.contains(&role)
}

/// One entry of a channel map: member UUID plus its role strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMapEntry {
    pub uuid: String,
    pub roles: Vec<String>,
}

impl ChannelMapEntry {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Parse a channel-map string. Entries without a role list are skipped;
/// role tokens outside [`CHANNEL_ROLES`] are dropped.
pub fn parse(map: &str) -> Vec<ChannelMapEntry> {
    map.split(';')
        .filter_map(|entry| {
            let (uuid, roles) = entry.split_once(':')?;
            let uuid = uuid.trim();
            if uuid.is_empty() {
                return None;
            }
            let roles: Vec<String> = roles
                .split(',')
                .map(|role| role.trim().to_string())
                .filter(|role| is_known_role(role))
                .collect();
            Some(ChannelMapEntry {
                uuid: uuid.to_string(),
                roles,
            })
        })
        .collect()
}

/// Find the UUID carrying the left-front role in a map: the bond primary.
pub fn left_front_uuid(map: &str) -> Option<String> {
    parse(map)
        .into_iter()
        .find(|entry| entry.has_role("LF"))
        .map(|entry| entry.uuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stereo_pair() {
        let entries = parse("RINCON_A:LF,LF;RINCON_B:RF,RF");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].uuid, "RINCON_A");
        assert_eq!(entries[0].roles, vec!["LF", "LF"]);
        assert!(entries[0].has_role("LF"));
        assert!(!entries[1].has_role("LF"));
    }

    #[test]
    fn test_parse_surround_set() {
        let entries = parse("RINCON_A:LF,RF;RINCON_B:LR;RINCON_C:RR;RINCON_D:SW");
        assert_eq!(entries.len(), 4);
        assert!(entries[0].has_role("RF"));
        assert!(entries[3].has_role("SW"));
    }

    #[test]
    fn test_left_front_uuid() {
        assert_eq!(
            left_front_uuid("RINCON_A:LF,LF;RINCON_B:RF,RF").as_deref(),
            Some("RINCON_A")
        );
        assert_eq!(left_front_uuid("RINCON_B:RF,RF"), None);
    }

    #[test]
    fn test_parse_skips_malformed_entries() {
        let entries = parse("no-colon;RINCON_A:LF;:orphan");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].uuid, "RINCON_A");
    }

    #[test]
    fn test_parse_drops_unknown_role_tokens() {
        let entries = parse("RINCON_A:LF,XX;RINCON_B:YY");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].roles, vec!["LF"]);
        assert!(entries[1].roles.is_empty());
    }

    #[test]
    fn test_known_roles() {
        for role in CHANNEL_ROLES {
            assert!(is_known_role(role));
        }
        assert!(!is_known_role("XX"));
        assert!(!is_known_role(""));
    }
}
