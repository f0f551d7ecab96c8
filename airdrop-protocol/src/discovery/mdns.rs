//! mDNS Responder
//!
//! Publishes the local `_airdrop._tcp` service instance and browses for
//! peers. The published TXT record carries the device type, transport and
//! capability lists, protocol version, and the identity-hash prefix used
//! for rendezvous with the BLE beacon.

use crate::device::{DeviceClass, PeerSighting, SightingSource};
use crate::identity::LocalIdentity;
use crate::{AirDropError, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Service type for AirDrop peers
pub const SERVICE_TYPE: &str = "_airdrop._tcp.local.";

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Protocol version announced in TXT
const TXT_VERSION: &str = "1.0";

/// Fallback instance name when sanitization eats the whole display name
const FALLBACK_INSTANCE: &str = "Windows-Device";

/// Ceiling for register retry backoff
const MAX_REGISTER_BACKOFF: Duration = Duration::from_secs(30);

/// Gap between stopping and restarting the browser on rescan
const RESCAN_GAP: Duration = Duration::from_millis(500);

/// Events produced by the browser
#[derive(Debug, Clone)]
pub enum MdnsEvent {
    Sighting(PeerSighting),
    Removed { peer_id: String },
}

/// mDNS publisher and browser
pub struct MdnsService {
    daemon: ServiceDaemon,
    event_tx: broadcast::Sender<MdnsEvent>,
    registered_fullname: Option<String>,
    own_instance: Option<String>,
    browsing: bool,
}

impl MdnsService {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| AirDropError::Discovery(format!("failed to start mDNS daemon: {e}")))?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            daemon,
            event_tx,
            registered_fullname: None,
            own_instance: None,
            browsing: false,
        })
    }

    /// Get a receiver for browser events; each subscriber has its own
    /// independent feed.
    pub fn subscribe(&self) -> broadcast::Receiver<MdnsEvent> {
        self.event_tx.subscribe()
    }

    /// Publish the local service instance.
    ///
    /// Transient register failures are retried with exponential backoff
    /// capped at 30 s; the daemon keeps answering queries once registered.
    pub fn publish(
        &mut self,
        identity: &LocalIdentity,
        device_class: DeviceClass,
        port: u16,
    ) -> Result<()> {
        let instance = sanitize_service_name(&identity.display_name);
        let host_label = format!("{instance}.local.");
        let ip = select_publish_address();

        let id_prefix: String = identity.identity_hash.chars().take(32).collect();
        let mut props = HashMap::new();
        props.insert("deviceType".to_string(), device_class.as_str().to_string());
        props.insert("transport".to_string(), "wifidirect,wifi".to_string());
        props.insert("capabilities".to_string(), "send,receive".to_string());
        props.insert("version".to_string(), TXT_VERSION.to_string());
        props.insert("id".to_string(), id_prefix);

        let service_info = if ip.is_unspecified() {
            // No usable interface right now; let the daemon track addresses
            ServiceInfo::new(SERVICE_TYPE, &instance, &host_label, "", port, props)
                .map_err(|e| {
                    AirDropError::Discovery(format!("failed to build service info: {e}"))
                })?
                .enable_addr_auto()
        } else {
            ServiceInfo::new(SERVICE_TYPE, &instance, &host_label, ip, port, props).map_err(
                |e| AirDropError::Discovery(format!("failed to build service info: {e}")),
            )?
        };

        let fullname = service_info.get_fullname().to_string();
        self.registered_fullname = Some(fullname.clone());
        self.own_instance = Some(instance.clone());

        match self.daemon.register(service_info.clone()) {
            Ok(()) => {
                info!("mDNS service registered as {fullname} on {ip}:{port}");
            }
            Err(e) => {
                warn!("mDNS register failed ({e}), retrying with backoff");
                let daemon = self.daemon.clone();
                tokio::spawn(async move {
                    let mut backoff = Duration::from_secs(1);
                    loop {
                        tokio::time::sleep(backoff).await;
                        match daemon.register(service_info.clone()) {
                            Ok(()) => {
                                info!("mDNS service registered after retry");
                                break;
                            }
                            Err(e) => {
                                warn!("mDNS register retry failed: {e}");
                                backoff = (backoff * 2).min(MAX_REGISTER_BACKOFF);
                            }
                        }
                    }
                });
            }
        }

        Ok(())
    }

    /// Withdraw the published instance (sends the goodbye record)
    pub fn unpublish(&mut self) {
        if let Some(fullname) = self.registered_fullname.take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                warn!("mDNS unregister failed: {e}");
            } else {
                debug!("mDNS service {fullname} unregistered");
            }
        }
    }

    /// Start the continuous browser
    pub fn browse(&mut self) -> Result<()> {
        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| AirDropError::Discovery(format!("mDNS browse failed: {e}")))?;
        self.browsing = true;

        let event_tx = self.event_tx.clone();
        let own_instance = self.own_instance.clone();

        tokio::spawn(async move {
            loop {
                match receiver.recv_async().await {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        let instance = instance_name(info.get_fullname());
                        if own_instance.as_deref() == Some(instance.as_str()) {
                            continue;
                        }
                        debug!("resolved {instance}");
                        let _ = event_tx.send(MdnsEvent::Sighting(sighting_from_info(&info)));
                    }
                    Ok(ServiceEvent::ServiceRemoved(_ty, fullname)) => {
                        let instance = instance_name(&fullname);
                        if own_instance.as_deref() == Some(instance.as_str()) {
                            continue;
                        }
                        debug!("goodbye from {instance}");
                        let _ = event_tx.send(MdnsEvent::Removed { peer_id: instance });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("mDNS browse channel closed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop the browser
    pub fn stop_browse(&mut self) {
        if self.browsing {
            if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
                warn!("mDNS stop_browse failed: {e}");
            }
            self.browsing = false;
        }
    }

    /// Restart the browser to force a fresh PTR query
    pub async fn rescan(&mut self) -> Result<()> {
        self.stop_browse();
        tokio::time::sleep(RESCAN_GAP).await;
        self.browse()
    }

    /// Shut the responder down entirely
    pub fn shutdown(&mut self) {
        self.unpublish();
        self.stop_browse();
        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS daemon shutdown: {e}");
        }
    }
}

/// Keep letters, digits, `-` and `_`; truncate to 63 octets; never empty.
pub fn sanitize_service_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(63)
        .collect();

    if cleaned.is_empty() {
        FALLBACK_INSTANCE.to_string()
    } else {
        cleaned
    }
}

/// Prefer a wireless interface for the published A/AAAA record, fall back
/// to the first non-loopback interface, then to the wildcard.
pub fn select_publish_address() -> IpAddr {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(list) => list,
        Err(e) => {
            warn!("interface enumeration failed ({e}), publishing on wildcard");
            return IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        }
    };

    let usable = |ip: &IpAddr| !ip.is_loopback() && ip.is_ipv4();

    let wireless = interfaces.iter().find(|(name, ip)| {
        let name = name.to_lowercase();
        usable(ip)
            && (name.contains("wi-fi")
                || name.contains("wifi")
                || name.contains("wireless")
                || name.contains("wlan"))
    });
    if let Some((name, ip)) = wireless {
        debug!("publishing mDNS on wireless interface {name} ({ip})");
        return *ip;
    }

    if let Some((name, ip)) = interfaces.iter().find(|(_, ip)| usable(ip)) {
        debug!("publishing mDNS on interface {name} ({ip})");
        return *ip;
    }

    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

/// `Alice._airdrop._tcp.local.` → `Alice`
fn instance_name(fullname: &str) -> String {
    fullname
        .strip_suffix(SERVICE_TYPE)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

fn sighting_from_info(info: &ServiceInfo) -> PeerSighting {
    let instance = instance_name(info.get_fullname());

    let mut metadata = HashMap::new();
    for key in ["transport", "capabilities", "version", "id"] {
        if let Some(value) = info.get_property_val_str(key) {
            metadata.insert(key.to_string(), value.to_string());
        }
    }

    let device_class = info
        .get_property_val_str("deviceType")
        .map(DeviceClass::parse)
        .unwrap_or(DeviceClass::Unknown);

    let ip = info
        .get_addresses()
        .iter()
        .cloned()
        .find(|addr| !addr.is_loopback())
        .or_else(|| info.get_addresses().iter().cloned().next());

    PeerSighting {
        peer_id: instance.clone(),
        source: SightingSource::Mdns,
        display_name: instance,
        device_class,
        ip,
        port: info.get_port(),
        identity_hash: info
            .get_property_val_str("id")
            .map(|s| s.to_string())
            .filter(|s| !s.is_empty()),
        metadata,
        rssi: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_keeps_allowed_chars() {
        assert_eq!(sanitize_service_name("My-PC_2"), "My-PC_2");
        assert_eq!(sanitize_service_name("Alice's iPhone"), "AlicesiPhone");
        assert_eq!(sanitize_service_name("désk tøp"), "dsktp");
    }

    #[test]
    fn test_sanitize_truncates_to_63() {
        let long = "x".repeat(100);
        assert_eq!(sanitize_service_name(&long).len(), 63);
    }

    #[test]
    fn test_sanitize_empty_falls_back() {
        assert_eq!(sanitize_service_name(""), FALLBACK_INSTANCE);
        assert_eq!(sanitize_service_name("!!! ***"), FALLBACK_INSTANCE);
    }

    #[test]
    fn test_instance_name_extraction() {
        assert_eq!(instance_name("Alice._airdrop._tcp.local."), "Alice");
        assert_eq!(instance_name("weird"), "weird");
    }

    #[tokio::test]
    async fn test_publish_browse_loopback_round_trip() {
        let identity = LocalIdentity::new("RoundTrip-Test-Peer", "rt@example.com", "");

        let mut publisher = MdnsService::new().unwrap();
        publisher
            .publish(&identity, DeviceClass::WindowsPc, 8771)
            .unwrap();

        let mut browser = MdnsService::new().unwrap();
        let mut events = browser.subscribe();
        browser.browse().unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let sighting = loop {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .expect("no mDNS sighting before deadline")
                .expect("browser channel closed");
            if let MdnsEvent::Sighting(s) = event {
                if s.peer_id == "RoundTrip-Test-Peer" {
                    break s;
                }
            }
        };

        assert_eq!(sighting.port, 8771);
        assert_eq!(sighting.device_class, DeviceClass::WindowsPc);
        assert_eq!(sighting.metadata.get("capabilities").unwrap(), "send,receive");
        assert_eq!(sighting.metadata.get("version").unwrap(), TXT_VERSION);
        assert_eq!(
            sighting.identity_hash.as_deref().unwrap(),
            &identity.identity_hash[..32]
        );

        publisher.shutdown();
        browser.shutdown();
    }
}
