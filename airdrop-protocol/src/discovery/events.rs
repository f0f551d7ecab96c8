//! Discovery Event System
//!
//! Unified events emitted by the discovery coordinator regardless of which
//! channel (BLE or mDNS) produced the underlying sighting.

use crate::device::PeerRecord;

/// Events emitted by the discovery coordinator
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A peer appeared for the first time
    PeerFound(PeerRecord),

    /// An already-known peer was sighted again
    PeerUpdated(PeerRecord),

    /// A peer aged out or said goodbye
    PeerLost {
        peer_id: String,
    },

    /// Discovery is up; publishers may be down when visibility is Off
    Started {
        port: u16,
        publishing: bool,
    },

    /// Discovery was stopped
    Stopped,

    /// A channel failed; discovery keeps running on the others
    Error {
        message: String,
    },
}

impl DiscoveryEvent {
    /// Peer id when this event concerns a peer
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            DiscoveryEvent::PeerFound(record) => Some(&record.peer_id),
            DiscoveryEvent::PeerUpdated(record) => Some(&record.peer_id),
            DiscoveryEvent::PeerLost { peer_id } => Some(peer_id),
            _ => None,
        }
    }

    pub fn is_peer_found(&self) -> bool {
        matches!(self, DiscoveryEvent::PeerFound(_))
    }

    pub fn is_peer_lost(&self) -> bool {
        matches!(self, DiscoveryEvent::PeerLost { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceClass, PeerRecord, PeerSighting, SightingSource};
    use std::collections::HashMap;
    use std::time::SystemTime;

    fn record(id: &str) -> PeerRecord {
        PeerRecord::from_sighting(
            PeerSighting {
                peer_id: id.to_string(),
                source: SightingSource::Mdns,
                display_name: id.to_string(),
                device_class: DeviceClass::Mac,
                ip: None,
                port: 8771,
                identity_hash: None,
                metadata: HashMap::new(),
                rssi: None,
            },
            SystemTime::now(),
        )
    }

    #[test]
    fn test_peer_id_extraction() {
        assert_eq!(
            DiscoveryEvent::PeerFound(record("alice")).peer_id(),
            Some("alice")
        );
        assert_eq!(
            DiscoveryEvent::PeerLost {
                peer_id: "bob".into()
            }
            .peer_id(),
            Some("bob")
        );
        assert_eq!(
            DiscoveryEvent::Started {
                port: 8771,
                publishing: true
            }
            .peer_id(),
            None
        );
    }

    #[test]
    fn test_event_predicates() {
        assert!(DiscoveryEvent::PeerFound(record("a")).is_peer_found());
        assert!(!DiscoveryEvent::PeerFound(record("a")).is_peer_lost());
        assert!(DiscoveryEvent::PeerLost { peer_id: "a".into() }.is_peer_lost());
    }
}
