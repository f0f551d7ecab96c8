//! Peer device model
//!
//! `PeerRecord` is the unified view of a remote device assembled from BLE
//! and mDNS sightings. The merge rules favor the more specific fact: a
//! known device class beats Unknown, a non-empty name is never clobbered
//! by an empty one, and metadata keys are unioned with the newest value
//! winning.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

/// Device categories reported in the mDNS `deviceType` TXT key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceClass {
    IPhone,
    IPad,
    Mac,
    WindowsPc,
    Unknown,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::IPhone => "iPhone",
            DeviceClass::IPad => "iPad",
            DeviceClass::Mac => "Mac",
            DeviceClass::WindowsPc => "Windows-PC",
            DeviceClass::Unknown => "Unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "iphone" => DeviceClass::IPhone,
            "ipad" => DeviceClass::IPad,
            "mac" | "macbook" | "imac" => DeviceClass::Mac,
            "windows-pc" | "windows" | "pc" => DeviceClass::WindowsPc,
            _ => DeviceClass::Unknown,
        }
    }
}

/// Which discovery channel produced a sighting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SightingSource {
    Ble,
    Mdns,
}

/// One observation of a peer from either discovery channel
#[derive(Debug, Clone)]
pub struct PeerSighting {
    /// mDNS instance name, or formatted Bluetooth MAC for BLE-only peers
    pub peer_id: String,
    pub source: SightingSource,
    pub display_name: String,
    pub device_class: DeviceClass,
    pub ip: Option<IpAddr>,
    /// 0 when the channel doesn't carry a port (BLE)
    pub port: u16,
    /// Identity-hash prefix from the beacon or the `id` TXT key
    pub identity_hash: Option<String>,
    /// Freeform TXT metadata (transport list, capabilities, version, ...)
    pub metadata: HashMap<String, String>,
    pub rssi: Option<i16>,
}

/// Unified record for one remote device
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: String,
    pub display_name: String,
    pub device_class: DeviceClass,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub identity_hash: Option<String>,
    pub metadata: HashMap<String, String>,
    pub rssi: Option<i16>,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
}

impl PeerRecord {
    /// Create a record from the first sighting of a peer
    pub fn from_sighting(sighting: PeerSighting, now: SystemTime) -> Self {
        Self {
            peer_id: sighting.peer_id,
            display_name: sighting.display_name,
            device_class: sighting.device_class,
            ip: sighting.ip,
            port: sighting.port,
            identity_hash: sighting.identity_hash,
            metadata: sighting.metadata,
            rssi: sighting.rssi,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Fold a subsequent sighting into this record.
    ///
    /// Incoming values only overwrite when they are more specific:
    /// non-empty name, non-Unknown class, present address, non-zero port.
    pub fn merge(&mut self, sighting: PeerSighting, now: SystemTime) {
        self.last_seen = now;

        if !sighting.display_name.is_empty() {
            self.display_name = sighting.display_name;
        }
        if sighting.device_class != DeviceClass::Unknown {
            self.device_class = sighting.device_class;
        }
        if sighting.ip.is_some() {
            self.ip = sighting.ip;
        }
        if sighting.port != 0 {
            self.port = sighting.port;
        }
        if sighting.identity_hash.is_some() {
            self.identity_hash = sighting.identity_hash;
        }
        if sighting.rssi.is_some() {
            self.rssi = sighting.rssi;
        }
        for (key, value) in sighting.metadata {
            self.metadata.insert(key, value);
        }
    }

    /// Whether the peer has been sighted within the expiration window
    pub fn is_available(&self, window: Duration) -> bool {
        SystemTime::now()
            .duration_since(self.last_seen)
            .map(|age| age <= window)
            .unwrap_or(true)
    }

    /// BLE-only records are keyed by MAC until mDNS names the peer
    pub fn has_mac_id(&self) -> bool {
        looks_like_mac(&self.peer_id)
    }
}

/// `AA:BB:CC:DD:EE:FF` shape check
pub fn looks_like_mac(id: &str) -> bool {
    let parts: Vec<&str> = id.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sighting(id: &str, source: SightingSource) -> PeerSighting {
        PeerSighting {
            peer_id: id.to_string(),
            source,
            display_name: String::new(),
            device_class: DeviceClass::Unknown,
            ip: None,
            port: 0,
            identity_hash: None,
            metadata: HashMap::new(),
            rssi: None,
        }
    }

    #[test]
    fn test_device_class_parse() {
        assert_eq!(DeviceClass::parse("iPhone"), DeviceClass::IPhone);
        assert_eq!(DeviceClass::parse("IPAD"), DeviceClass::IPad);
        assert_eq!(DeviceClass::parse("Mac"), DeviceClass::Mac);
        assert_eq!(DeviceClass::parse("Windows-PC"), DeviceClass::WindowsPc);
        assert_eq!(DeviceClass::parse("toaster"), DeviceClass::Unknown);
    }

    #[test]
    fn test_merge_keeps_specific_values() {
        let now = SystemTime::now();
        let mut first = sighting("AA:BB:CC:DD:EE:FF", SightingSource::Ble);
        first.display_name = "Alice's iPhone".to_string();
        first.rssi = Some(-55);
        let mut record = PeerRecord::from_sighting(first, now);

        // A vaguer later sighting must not erase what we know
        let vague = sighting("AA:BB:CC:DD:EE:FF", SightingSource::Ble);
        record.merge(vague, now);
        assert_eq!(record.display_name, "Alice's iPhone");
        assert_eq!(record.device_class, DeviceClass::Unknown);

        // mDNS fills in class, address and port
        let mut rich = sighting("AA:BB:CC:DD:EE:FF", SightingSource::Mdns);
        rich.device_class = DeviceClass::IPhone;
        rich.ip = Some("192.168.1.20".parse().unwrap());
        rich.port = 8771;
        record.merge(rich, now);
        assert_eq!(record.device_class, DeviceClass::IPhone);
        assert_eq!(record.port, 8771);
    }

    #[test]
    fn test_merge_metadata_union_incoming_wins() {
        let now = SystemTime::now();
        let mut first = sighting("peer", SightingSource::Mdns);
        first.metadata.insert("version".into(), "1".into());
        first.metadata.insert("transport".into(), "wifi".into());
        let mut record = PeerRecord::from_sighting(first, now);

        let mut second = sighting("peer", SightingSource::Mdns);
        second.metadata.insert("version".into(), "2".into());
        second.metadata.insert("capabilities".into(), "send,receive".into());
        record.merge(second, now);

        assert_eq!(record.metadata["version"], "2");
        assert_eq!(record.metadata["transport"], "wifi");
        assert_eq!(record.metadata["capabilities"], "send,receive");
    }

    #[test]
    fn test_availability_window() {
        let now = SystemTime::now();
        let mut record =
            PeerRecord::from_sighting(sighting("peer", SightingSource::Mdns), now);
        assert!(record.is_available(Duration::from_secs(60)));

        record.last_seen = now - Duration::from_secs(120);
        assert!(!record.is_available(Duration::from_secs(60)));
    }

    #[test]
    fn test_mac_shape() {
        assert!(looks_like_mac("AA:BB:CC:DD:EE:FF"));
        assert!(looks_like_mac("00:11:22:33:44:55"));
        assert!(!looks_like_mac("Alice's iPhone"));
        assert!(!looks_like_mac("AA:BB:CC:DD:EE"));
        assert!(!looks_like_mac("AA:BB:CC:DD:EE:GG"));
    }
}
