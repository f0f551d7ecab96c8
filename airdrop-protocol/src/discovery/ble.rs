//! BLE Beacon
//!
//! Publishes the AirDrop manufacturer-data advertisement and scans for peer
//! advertisements carrying Apple's company ID. The radio itself is behind
//! the [`BleRadio`] trait so platform wrappers can plug in; the default
//! [`BtleplugRadio`] scans through `btleplug` and reports advertising as
//! unavailable (central-role backend), which disables the publisher per the
//! radio-unavailable policy: one warning, no restart loop.

use crate::device::{DeviceClass, PeerSighting, SightingSource};
use crate::{AirDropError, Result};
use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 128-bit service UUID identifying AirDrop peers
pub const AIRDROP_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000af0a_0000_1000_8000_00805f9b34fb);

/// Apple's Bluetooth company identifier
pub const APPLE_COMPANY_ID: u16 = 0x004C;

/// Manufacturer-data frame type for AirDrop
const BEACON_TYPE: u8 = 0x05;

/// Fixed flags byte
const BEACON_FLAGS: u8 = 0x01;

/// Frames weaker than this are treated as out of range
pub const DEFAULT_IN_RANGE_RSSI: i16 = -70;

/// A peer drops out after this long without a frame
pub const DEFAULT_OUT_OF_RANGE: Duration = Duration::from_secs(10);

/// How long each scan window lasts before the peripheral cache is read
const SCAN_WINDOW: Duration = Duration::from_secs(5);

/// Backoff ceiling for transient scan failures
const MAX_SCAN_BACKOFF: Duration = Duration::from_secs(30);

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The AirDrop manufacturer-data payload: type, flags, and the first
/// eight bytes of the identity hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconFrame {
    pub identity_hash_prefix: [u8; 8],
}

impl BeaconFrame {
    /// Build the frame from a full hex identity hash
    pub fn from_identity_hash(identity_hash: &str) -> Result<Self> {
        let bytes = hex::decode(identity_hash).map_err(|e| {
            AirDropError::InvalidState(format!("identity hash is not hex: {e}"))
        })?;
        if bytes.len() < 8 {
            return Err(AirDropError::InvalidState(
                "identity hash shorter than 8 bytes".to_string(),
            ));
        }
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&bytes[..8]);
        Ok(Self {
            identity_hash_prefix: prefix,
        })
    }

    /// Serialize to the manufacturer-data payload
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(10);
        payload.push(BEACON_TYPE);
        payload.push(BEACON_FLAGS);
        payload.extend_from_slice(&self.identity_hash_prefix);
        payload
    }

    /// Parse a manufacturer-data payload; `None` for foreign Apple frames
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 10 || data[0] != BEACON_TYPE {
            return None;
        }
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&data[2..10]);
        Some(Self {
            identity_hash_prefix: prefix,
        })
    }
}

/// One advertisement as delivered by the radio
#[derive(Debug, Clone)]
pub struct BleAdvertisement {
    /// Formatted MAC address, `AA:BB:CC:DD:EE:FF`
    pub address: String,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

impl BleAdvertisement {
    /// AirDrop classification: matching service UUID or Apple company ID
    pub fn is_airdrop_peer(&self) -> bool {
        self.service_uuids.contains(&AIRDROP_SERVICE_UUID)
            || self.manufacturer_data.contains_key(&APPLE_COMPANY_ID)
    }
}

/// Abstract BLE radio the beacon runs on.
///
/// The platform wrapper decides how advertising and scanning map onto the
/// actual hardware; the beacon only cares about these four operations.
#[async_trait]
pub trait BleRadio: Send + Sync {
    /// Whether a usable adapter is present
    async fn available(&self) -> bool;

    /// Start an immutable advertisement carrying the given service UUID and
    /// manufacturer payload. Runs until `stop_advertising`.
    async fn advertise(&self, service_uuid: Uuid, company_id: u16, payload: Vec<u8>)
        -> Result<()>;

    async fn stop_advertising(&self) -> Result<()>;

    /// Start scanning; advertisements arrive on the returned channel until
    /// the receiver is dropped.
    async fn start_scan(&self) -> Result<mpsc::Receiver<BleAdvertisement>>;
}

/// Beacon configuration
#[derive(Debug, Clone)]
pub struct BeaconConfig {
    pub in_range_rssi: i16,
    pub out_of_range: Duration,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            in_range_rssi: DEFAULT_IN_RANGE_RSSI,
            out_of_range: DEFAULT_OUT_OF_RANGE,
        }
    }
}

/// Events produced by the scanner
#[derive(Debug, Clone)]
pub enum BeaconEvent {
    Sighting(PeerSighting),
    OutOfRange { peer_id: String },
}

/// BLE publisher and scanner over an abstract radio
pub struct BleBeacon {
    radio: Arc<dyn BleRadio>,
    config: BeaconConfig,
    event_tx: broadcast::Sender<BeaconEvent>,
    shutdown_tx: Option<tokio::sync::watch::Sender<bool>>,
    publishing: bool,
}

impl BleBeacon {
    pub fn new(radio: Arc<dyn BleRadio>, config: BeaconConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            radio,
            config,
            event_tx,
            shutdown_tx: None,
            publishing: false,
        }
    }

    /// Get a receiver for beacon events; each subscriber has its own
    /// independent feed.
    pub fn subscribe(&self) -> broadcast::Receiver<BeaconEvent> {
        self.event_tx.subscribe()
    }

    /// Start the advertisement. The payload is immutable; an identity
    /// change requires a beacon restart. A radio that cannot advertise
    /// disables the publisher with a single warning.
    pub async fn start_publisher(&mut self, identity_hash: &str) -> Result<()> {
        let frame = BeaconFrame::from_identity_hash(identity_hash)?;

        match self
            .radio
            .advertise(AIRDROP_SERVICE_UUID, APPLE_COMPANY_ID, frame.encode())
            .await
        {
            Ok(()) => {
                info!("BLE advertisement up");
                self.publishing = true;
                Ok(())
            }
            Err(AirDropError::RadioUnavailable(reason)) => {
                warn!("BLE advertising unavailable, publisher disabled: {reason}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the advertisement is actually running
    pub fn is_publishing(&self) -> bool {
        self.publishing
    }

    /// Start the continuous scanner and the out-of-range checker.
    pub async fn start_scanner(&mut self) -> Result<()> {
        if !self.radio.available().await {
            warn!("no BLE adapter, scanner disabled");
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let mut advertisements = self.radio.start_scan().await?;
        let event_tx = self.event_tx.clone();
        let in_range_rssi = self.config.in_range_rssi;
        let last_seen: Arc<RwLock<HashMap<String, Instant>>> =
            Arc::new(RwLock::new(HashMap::new()));

        // Scanner task: classify frames and emit sightings
        let seen = last_seen.clone();
        let tx = event_tx.clone();
        let mut scan_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    adv = advertisements.recv() => {
                        let Some(adv) = adv else { break };
                        if !adv.is_airdrop_peer() {
                            continue;
                        }
                        if adv.rssi.is_some_and(|rssi| rssi < in_range_rssi) {
                            debug!("ignoring weak frame from {} ({:?} dBm)", adv.address, adv.rssi);
                            continue;
                        }
                        let sighting = sighting_from_advertisement(&adv);
                        seen.write().await.insert(sighting.peer_id.clone(), Instant::now());
                        let _ = tx.send(BeaconEvent::Sighting(sighting));
                    }
                    _ = scan_shutdown.changed() => break,
                }
            }
            debug!("BLE scanner task finished");
        });

        // Out-of-range checker
        let out_of_range = self.config.out_of_range;
        let mut oor_shutdown = shutdown_rx;
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(2));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let mut seen = last_seen.write().await;
                        let gone: Vec<String> = seen
                            .iter()
                            .filter(|(_, at)| now.duration_since(**at) > out_of_range)
                            .map(|(id, _)| id.clone())
                            .collect();
                        for peer_id in gone {
                            debug!("BLE peer {peer_id} out of range");
                            seen.remove(&peer_id);
                            let _ = event_tx.send(BeaconEvent::OutOfRange { peer_id });
                        }
                    }
                    _ = oor_shutdown.changed() => break,
                }
            }
        });

        Ok(())
    }

    /// Stop advertisement and scanning
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if self.publishing {
            if let Err(e) = self.radio.stop_advertising().await {
                warn!("failed to stop BLE advertisement: {e}");
            }
            self.publishing = false;
        }
    }
}

/// Build a sighting from a classified advertisement.
///
/// Peer id is the formatted MAC; the display name falls back to the last
/// six hex characters of the address when the frame carries no local name.
pub fn sighting_from_advertisement(adv: &BleAdvertisement) -> PeerSighting {
    let display_name = adv
        .local_name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| {
            let hexchars: String = adv
                .address
                .chars()
                .filter(|c| c.is_ascii_hexdigit())
                .collect();
            let tail = hexchars.len().saturating_sub(6);
            hexchars[tail..].to_string()
        });

    let identity_hash = adv
        .manufacturer_data
        .get(&APPLE_COMPANY_ID)
        .and_then(|data| BeaconFrame::parse(data))
        .map(|frame| hex::encode(frame.identity_hash_prefix));

    PeerSighting {
        peer_id: adv.address.clone(),
        source: SightingSource::Ble,
        display_name,
        device_class: DeviceClass::Unknown,
        ip: None,
        port: 0,
        identity_hash,
        metadata: HashMap::new(),
        rssi: adv.rssi,
    }
}

/// Default radio backed by `btleplug`.
///
/// Scanning runs as periodic windows against the adapter's peripheral
/// cache. Advertising needs a peripheral-role backend and is reported as
/// unavailable here.
pub struct BtleplugRadio {
    adapter: Option<Adapter>,
}

impl BtleplugRadio {
    pub async fn new() -> Self {
        let adapter = match Self::first_adapter().await {
            Ok(adapter) => Some(adapter),
            Err(e) => {
                warn!("no Bluetooth adapter: {e}");
                None
            }
        };
        Self { adapter }
    }

    async fn first_adapter() -> Result<Adapter> {
        let manager = Manager::new()
            .await
            .map_err(|e| AirDropError::RadioUnavailable(e.to_string()))?;
        manager
            .adapters()
            .await
            .map_err(|e| AirDropError::RadioUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| AirDropError::RadioUnavailable("no Bluetooth adapter found".into()))
    }
}

#[async_trait]
impl BleRadio for BtleplugRadio {
    async fn available(&self) -> bool {
        self.adapter.is_some()
    }

    async fn advertise(
        &self,
        _service_uuid: Uuid,
        _company_id: u16,
        _payload: Vec<u8>,
    ) -> Result<()> {
        Err(AirDropError::RadioUnavailable(
            "btleplug backend is central-role only".to_string(),
        ))
    }

    async fn stop_advertising(&self) -> Result<()> {
        Ok(())
    }

    async fn start_scan(&self) -> Result<mpsc::Receiver<BleAdvertisement>> {
        let adapter = self
            .adapter
            .clone()
            .ok_or_else(|| AirDropError::RadioUnavailable("no Bluetooth adapter".into()))?;

        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);

            loop {
                match scan_window(&adapter, &tx).await {
                    Ok(()) => backoff = Duration::from_secs(1),
                    Err(e) => {
                        warn!("BLE scan window failed: {e}, retrying in {backoff:?}");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_SCAN_BACKOFF);
                    }
                }
                if tx.is_closed() {
                    break;
                }
            }
            debug!("btleplug scan loop finished");
        });

        Ok(rx)
    }
}

async fn scan_window(
    adapter: &Adapter,
    tx: &mpsc::Sender<BleAdvertisement>,
) -> Result<()> {
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| AirDropError::RadioUnavailable(e.to_string()))?;

    tokio::time::sleep(SCAN_WINDOW).await;

    adapter
        .stop_scan()
        .await
        .map_err(|e| AirDropError::RadioUnavailable(e.to_string()))?;

    let peripherals = adapter
        .peripherals()
        .await
        .map_err(|e| AirDropError::RadioUnavailable(e.to_string()))?;

    for peripheral in peripherals {
        let Ok(Some(properties)) = peripheral.properties().await else {
            continue;
        };

        let advertisement = BleAdvertisement {
            address: peripheral.address().to_string().to_uppercase(),
            local_name: properties.local_name,
            rssi: properties.rssi,
            service_uuids: properties.services,
            manufacturer_data: properties.manufacturer_data,
        };

        if tx.send(advertisement).await.is_err() {
            break;
        }
    }

    Ok(())
}
