//! Device Registry
//!
//! Merges BLE and mDNS sightings into one `PeerRecord` per peer and ages
//! entries out on a timer. Consumers see exactly one ordered event stream:
//! per peer the sequence is always `Added` → `Updated`* → `Removed`, and
//! nothing after `Removed` without a fresh `Added`. Ordering is enforced
//! by emitting from inside the registry's single critical section; every
//! subscriber gets its own broadcast receiver, so no lock is held while
//! waiting for events.

use crate::device::{looks_like_mac, PeerRecord, PeerSighting, SightingSource};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;
use tracing::{debug, info};

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// First sighting of a peer
    Added(PeerRecord),
    /// Subsequent sighting merged into an existing record
    Updated(PeerRecord),
    /// Peer aged out or was superseded
    Removed { peer_id: String },
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Records older than this are swept
    pub expiration: Duration,
    /// Sweeper period
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            expiration: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Shared peer table with merge semantics and expiry
pub struct DeviceRegistry {
    peers: Arc<RwLock<HashMap<String, PeerRecord>>>,
    event_tx: broadcast::Sender<RegistryEvent>,
    config: RegistryConfig,
    shutdown_tx: std::sync::Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl DeviceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            config,
            shutdown_tx: std::sync::Mutex::new(None),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RegistryConfig::default())
    }

    /// Get a receiver for registry events; every subscriber sees the full
    /// stream from the moment it subscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Insert or merge a sighting.
    ///
    /// When an mDNS sighting carries an identity-hash prefix we have
    /// previously only seen from a BLE MAC record, the MAC record is
    /// retired (with a `Removed` event) and its facts fold into the
    /// mDNS-named record, so consumers keep seeing exactly one record
    /// per device.
    pub async fn apply(&self, sighting: PeerSighting) {
        let now = SystemTime::now();
        let mut peers = self.peers.write().await;

        // Retire a BLE-only alias for the same device. Its facts seed the
        // named record so the sighting merge only improves on them; the
        // named record still enters the stream with `Added`.
        let mut seed: Option<PeerRecord> = None;
        if sighting.source == SightingSource::Mdns
            && !looks_like_mac(&sighting.peer_id)
            && !peers.contains_key(&sighting.peer_id)
        {
            if let Some(hash) = sighting.identity_hash.as_deref() {
                let alias = peers
                    .iter()
                    .find(|(id, record)| {
                        *id != &sighting.peer_id
                            && record.has_mac_id()
                            && record
                                .identity_hash
                                .as_deref()
                                .is_some_and(|h| hashes_overlap(h, hash))
                    })
                    .map(|(id, _)| id.clone());

                if let Some(alias_id) = alias {
                    debug!("retiring BLE alias {alias_id} for {}", sighting.peer_id);
                    seed = peers.remove(&alias_id);
                    let _ = self.event_tx.send(RegistryEvent::Removed {
                        peer_id: alias_id,
                    });
                }
            }
        }

        match peers.get_mut(&sighting.peer_id) {
            Some(record) => {
                record.merge(sighting, now);
                let _ = self.event_tx.send(RegistryEvent::Updated(record.clone()));
            }
            None => {
                let record = match seed {
                    Some(old) => {
                        let mut record = PeerRecord {
                            peer_id: sighting.peer_id.clone(),
                            ..old
                        };
                        record.merge(sighting, now);
                        record
                    }
                    None => PeerRecord::from_sighting(sighting, now),
                };
                info!(
                    peer_id = %record.peer_id,
                    name = %record.display_name,
                    "peer discovered"
                );
                peers.insert(record.peer_id.clone(), record.clone());
                let _ = self.event_tx.send(RegistryEvent::Added(record));
            }
        }
    }

    /// Remove a peer immediately (mDNS goodbye, service shutdown)
    pub async fn remove(&self, peer_id: &str) {
        let mut peers = self.peers.write().await;
        if peers.remove(peer_id).is_some() {
            info!(peer_id, "peer removed");
            let _ = self.event_tx.send(RegistryEvent::Removed {
                peer_id: peer_id.to_string(),
            });
        }
    }

    /// Resolve a peer by id
    pub async fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.read().await.get(peer_id).cloned()
    }

    /// Records sighted within the expiration window
    pub async fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers
            .read()
            .await
            .values()
            .filter(|r| r.is_available(self.config.expiration))
            .cloned()
            .collect()
    }

    /// Start the expiry sweeper
    pub fn start_sweeper(&self) {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        *self.shutdown_tx.lock().unwrap() = Some(shutdown_tx);

        let peers = self.peers.clone();
        let event_tx = self.event_tx.clone();
        let expiration = self.config.expiration;
        let sweep_interval = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = SystemTime::now();
                        let mut peers = peers.write().await;
                        let expired: Vec<String> = peers
                            .iter()
                            .filter(|(_, record)| {
                                now.duration_since(record.last_seen)
                                    .map(|age| age > expiration)
                                    .unwrap_or(false)
                            })
                            .map(|(id, _)| id.clone())
                            .collect();

                        for peer_id in expired {
                            info!(peer_id = %peer_id, "peer expired");
                            peers.remove(&peer_id);
                            let _ = event_tx.send(RegistryEvent::Removed { peer_id });
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("registry sweeper shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Stop the sweeper
    pub fn stop_sweeper(&self) {
        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

/// A beacon carries only the first 8 bytes of the hash, the TXT key the
/// first 32 hex chars; either being a prefix of the other counts.
fn hashes_overlap(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && (a.starts_with(b) || b.starts_with(a))
}
