//! Engine Configuration
//!
//! Runtime options consumed by the protocol engine. Loading these from disk
//! is the embedding application's job; the engine only defines the knobs
//! and their defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Default HTTP/2 and mDNS SRV port
pub const DEFAULT_PORT: u16 = 8771;

/// Default chunk size for streaming file I/O (80 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 81920;

/// Who can see this device while discovery is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Publishers stay down; the device only browses
    Off,
    /// Simplified contacts gate: publish, expect peers to match our
    /// identity-hash prefix before initiating
    ContactsOnly,
    /// Publish to anyone in range
    Everyone,
}

impl Visibility {
    /// Whether the BLE publisher and mDNS responder should run
    pub fn is_discoverable(&self) -> bool {
        !matches!(self, Visibility::Off)
    }
}

/// Configuration for the protocol engine
#[derive(Debug, Clone)]
pub struct AirDropConfig {
    /// Gates the BLE publisher and mDNS responder
    pub visibility: Visibility,

    /// Grant every /Ask without invoking the approval callback
    pub auto_accept: bool,

    /// Listen port for HTTP/2 and the mDNS SRV record
    pub port: u16,

    /// Directory incoming files are written to (created on first write)
    pub save_dir: PathBuf,

    /// Per-provider connect timeout
    pub connect_timeout: Duration,

    /// /Discover round-trip timeout
    pub discover_timeout: Duration,

    /// How long the receiver waits for an approval decision
    pub approval_timeout: Duration,

    /// Overall upload deadline
    pub transfer_timeout: Duration,

    /// Peer removed from the registry after this long without a sighting
    pub peer_expiration: Duration,

    /// Registry sweeper period
    pub sweep_interval: Duration,

    /// BLE out-of-range timeout
    pub ble_out_of_range: Duration,

    /// Minimum gap between progress callback invocations
    pub progress_interval: Duration,

    /// Chunk size for multipart streaming and disk writes
    pub buffer_size: usize,

    /// Apply `<part>_timestamp` modification times to received files
    pub preserve_timestamps: bool,

    /// Validity of a freshly generated certificate
    pub cert_validity_days: u32,

    /// Renew when fewer days than this remain
    pub cert_renewal_threshold_days: u32,

    /// Concurrent transfer cap; excess /Ask requests are rejected
    pub max_concurrent_transfers: usize,
}

impl Default for AirDropConfig {
    fn default() -> Self {
        Self {
            visibility: Visibility::Everyone,
            auto_accept: false,
            port: DEFAULT_PORT,
            save_dir: PathBuf::from("received"),
            connect_timeout: Duration::from_secs(30),
            discover_timeout: Duration::from_secs(10),
            approval_timeout: Duration::from_secs(60),
            transfer_timeout: Duration::from_secs(30 * 60),
            peer_expiration: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            ble_out_of_range: Duration::from_secs(10),
            progress_interval: Duration::from_millis(100),
            buffer_size: DEFAULT_BUFFER_SIZE,
            preserve_timestamps: true,
            cert_validity_days: 365,
            cert_renewal_threshold_days: 30,
            max_concurrent_transfers: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AirDropConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.buffer_size, 81920);
        assert_eq!(config.peer_expiration, Duration::from_secs(60));
        assert_eq!(config.approval_timeout, Duration::from_secs(60));
        assert_eq!(config.max_concurrent_transfers, 3);
        assert!(!config.auto_accept);
    }

    #[test]
    fn test_visibility_gating() {
        assert!(!Visibility::Off.is_discoverable());
        assert!(Visibility::ContactsOnly.is_discoverable());
        assert!(Visibility::Everyone.is_discoverable());
    }
}
