//! Peer policy: maps a remote hostname or IP to the record types it may
//! publish to us and subscribe from us.

use crate::error::{JalError, Result};
use crate::types::RecordType;
use std::collections::HashMap;
use std::net::IpAddr;

/// Role a remote is requesting for one record type on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The remote wants to push records to us.
    Publish,
    /// The remote wants to pull records from us.
    Subscribe,
}

/// `(publish_allow, subscribe_allow)` bitmasks over [`RecordType::bit`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerRule {
    pub publish_allow: u8,
    pub subscribe_allow: u8,
}

impl PeerRule {
    fn allows(&self, role: Role, record_type: RecordType) -> bool {
        let mask = match role {
            Role::Publish => self.publish_allow,
            Role::Subscribe => self.subscribe_allow,
        };
        mask & record_type.bit() != 0
    }
}

/// The full hostname/IP → rule mapping, built once from configuration at
/// startup. Lookup tries hostname first, then IP; a remote with no entry
/// is rejected outright rather than falling back to a default policy.
pub struct PeerPolicy {
    rules: HashMap<String, PeerRule>,
}

impl PeerPolicy {
    pub fn new(rules: HashMap<String, PeerRule>) -> Self {
        PeerPolicy { rules }
    }

    pub fn from_masks(masks: HashMap<String, (u8, u8)>) -> Self {
        let rules = masks
            .into_iter()
            .map(|(host, (publish_allow, subscribe_allow))| {
                (
                    host,
                    PeerRule {
                        publish_allow,
                        subscribe_allow,
                    },
                )
            })
            .collect();
        PeerPolicy { rules }
    }

    /// Rejects any `(remote, role, type)` triple whose bit is clear, or
    /// whose hostname/IP has no entry at all.
    pub fn check(
        &self,
        hostname: Option<&str>,
        ip: Option<IpAddr>,
        role: Role,
        record_type: RecordType,
    ) -> Result<()> {
        let rule = hostname
            .and_then(|h| self.rules.get(h))
            .or_else(|| ip.and_then(|ip| self.rules.get(&ip.to_string())))
            .ok_or_else(|| {
                JalError::protocol(format!(
                    "no peer policy entry for {}",
                    hostname.unwrap_or("<unknown host>")
                ))
            })?;

        if rule.allows(role, record_type) {
            Ok(())
        } else {
            Err(JalError::protocol(format!(
                "{role:?} of {record_type} not permitted for this peer"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PeerPolicy {
        let mut rules = HashMap::new();
        rules.insert(
            "collector-a".to_string(),
            PeerRule {
                publish_allow: RecordType::Audit.bit(),
                subscribe_allow: RecordType::Log.bit(),
            },
        );
        PeerPolicy::new(rules)
    }

    #[test]
    fn allows_matching_bit() {
        let policy = policy();
        assert!(policy
            .check(Some("collector-a"), None, Role::Publish, RecordType::Audit)
            .is_ok());
    }

    #[test]
    fn rejects_clear_bit() {
        let policy = policy();
        assert!(policy
            .check(Some("collector-a"), None, Role::Publish, RecordType::Journal)
            .is_err());
        assert!(policy
            .check(Some("collector-a"), None, Role::Subscribe, RecordType::Audit)
            .is_err());
    }

    #[test]
    fn rejects_unknown_host() {
        let policy = policy();
        assert!(policy
            .check(Some("stranger"), None, Role::Publish, RecordType::Audit)
            .is_err());
    }

    #[test]
    fn falls_back_to_ip_when_hostname_absent() {
        let mut rules = HashMap::new();
        rules.insert(
            "10.0.0.5".to_string(),
            PeerRule {
                publish_allow: RecordType::Log.bit(),
                subscribe_allow: 0,
            },
        );
        let policy = PeerPolicy::new(rules);
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(policy
            .check(None, Some(ip), Role::Publish, RecordType::Log)
            .is_ok());
    }
}
