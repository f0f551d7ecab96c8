//! Discovery Plane
//!
//! The coordinator composes the BLE beacon, the mDNS responder and the
//! device registry into one lifecycle: `start()` brings scanner and
//! browser up unconditionally and the publishers only when visibility
//! allows, `stop()` tears down in reverse order. Consumers watch a single
//! `PeerFound`/`PeerUpdated`/`PeerLost` stream fanned out from the
//! registry by one multiplexing task.

pub mod ble;
pub mod events;
pub mod mdns;

pub use ble::{
    BeaconConfig, BeaconEvent, BleAdvertisement, BleBeacon, BleRadio, BtleplugRadio,
    AIRDROP_SERVICE_UUID, APPLE_COMPANY_ID,
};
pub use events::DiscoveryEvent;
pub use mdns::{sanitize_service_name, MdnsEvent, MdnsService, SERVICE_TYPE};

use crate::config::AirDropConfig;
use crate::device::{DeviceClass, PeerRecord};
use crate::identity::LocalIdentity;
use crate::registry::{DeviceRegistry, RegistryConfig, RegistryEvent};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle facade over the discovery sub-services
pub struct DiscoveryCoordinator {
    identity: LocalIdentity,
    config: AirDropConfig,
    registry: Arc<DeviceRegistry>,
    beacon: BleBeacon,
    mdns: MdnsService,
    event_tx: broadcast::Sender<DiscoveryEvent>,
    running: bool,
}

impl DiscoveryCoordinator {
    pub fn new(
        identity: LocalIdentity,
        config: AirDropConfig,
        radio: Arc<dyn BleRadio>,
    ) -> Result<Self> {
        let registry = Arc::new(DeviceRegistry::new(RegistryConfig {
            expiration: config.peer_expiration,
            sweep_interval: config.sweep_interval,
        }));

        let beacon = BleBeacon::new(
            radio,
            BeaconConfig {
                in_range_rssi: ble::DEFAULT_IN_RANGE_RSSI,
                out_of_range: config.ble_out_of_range,
            },
        );
        let mdns = MdnsService::new()?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            identity,
            config,
            registry,
            beacon,
            mdns,
            event_tx,
            running: false,
        })
    }

    /// Get a receiver for discovery events; each subscriber has its own
    /// independent feed.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.event_tx.subscribe()
    }

    /// The shared registry, for components that resolve peers by id
    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.registry.clone()
    }

    /// Bring discovery up
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        info!(
            visibility = ?self.config.visibility,
            port = self.config.port,
            "starting discovery"
        );

        self.registry.start_sweeper();
        self.spawn_registry_forwarder();

        // Receive side runs regardless of visibility
        self.spawn_beacon_bridge();
        self.beacon.start_scanner().await?;
        self.spawn_mdns_bridge();
        self.mdns.browse()?;

        let publishing = self.config.visibility.is_discoverable();
        if publishing {
            self.beacon.start_publisher(&self.identity.identity_hash).await?;
            self.mdns
                .publish(&self.identity, DeviceClass::WindowsPc, self.config.port)?;
        }

        self.running = true;
        let _ = self.event_tx.send(DiscoveryEvent::Started {
            port: self.config.port,
            publishing,
        });
        Ok(())
    }

    /// Tear discovery down in reverse order
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        info!("stopping discovery");

        self.mdns.unpublish();
        self.beacon.stop().await;
        self.mdns.stop_browse();
        self.registry.stop_sweeper();

        self.running = false;
        let _ = self.event_tx.send(DiscoveryEvent::Stopped);
    }

    /// Restart the mDNS browser to force a fresh query
    pub async fn rescan(&mut self) -> Result<()> {
        self.mdns.rescan().await
    }

    /// Currently available peers
    pub async fn devices(&self) -> Vec<PeerRecord> {
        self.registry.snapshot().await
    }

    fn spawn_registry_forwarder(&self) {
        let mut events = self.registry.subscribe();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("discovery forwarder lagged, {skipped} registry events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let mapped = match event {
                    RegistryEvent::Added(record) => DiscoveryEvent::PeerFound(record),
                    RegistryEvent::Updated(record) => DiscoveryEvent::PeerUpdated(record),
                    RegistryEvent::Removed { peer_id } => DiscoveryEvent::PeerLost { peer_id },
                };
                // No subscriber right now just means nobody is watching
                let _ = event_tx.send(mapped);
            }
        });
    }

    fn spawn_beacon_bridge(&self) {
        let mut events = self.beacon.subscribe();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("beacon bridge lagged, {skipped} events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match event {
                    BeaconEvent::Sighting(sighting) => registry.apply(sighting).await,
                    BeaconEvent::OutOfRange { peer_id } => {
                        // Only BLE-only records drop with the beacon; a
                        // peer also known over mDNS stays until it expires
                        if registry
                            .get(&peer_id)
                            .await
                            .is_some_and(|r| r.has_mac_id())
                        {
                            registry.remove(&peer_id).await;
                        }
                    }
                }
            }
        });
    }

    fn spawn_mdns_bridge(&self) {
        let mut events = self.mdns.subscribe();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("mDNS bridge lagged, {skipped} events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match event {
                    MdnsEvent::Sighting(sighting) => registry.apply(sighting).await,
                    MdnsEvent::Removed { peer_id } => registry.remove(&peer_id).await,
                }
            }
        });
    }
}

impl Drop for DiscoveryCoordinator {
    fn drop(&mut self) {
        if self.running {
            warn!("discovery coordinator dropped while running");
            self.registry.stop_sweeper();
        }
    }
}

/// Helper for waiting on a specific peer to show up, used by callers that
/// drive a send right after discovery starts.
pub async fn wait_for_peer(
    events: &mut broadcast::Receiver<DiscoveryEvent>,
    peer_id: &str,
    deadline: Duration,
) -> Option<PeerRecord> {
    let deadline = tokio::time::Instant::now() + deadline;
    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
        };
        match event {
            DiscoveryEvent::PeerFound(record) | DiscoveryEvent::PeerUpdated(record)
                if record.peer_id == peer_id =>
            {
                return Some(record);
            }
            _ => continue,
        }
    }
}
