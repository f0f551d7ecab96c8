//! Peer-Link Layer
//!
//! A peer link is an unauthenticated byte stream to a remote device,
//! independent of the underlying transport. Providers are tried in order
//! (Wi-Fi Direct wrappers first when installed, same-subnet TCP as the
//! fallback); the first provider that is available and connects wins.
//! Every opened link gets a fresh connection id in the pool and links are
//! never reused across transfers, which keeps cancellation a matter of
//! dropping one connection.

pub mod tcp;

pub use tcp::{TcpLinkListener, TcpLinkProvider};

use crate::device::PeerRecord;
use crate::{AirDropError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Byte stream requirements for a link
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

/// An open byte stream to a peer, tagged with its transport
pub struct PeerLink {
    pub stream: Box<dyn LinkStream>,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub transport: String,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("transport", &self.transport)
            .finish()
    }
}

/// One transport's way of reaching peers
#[async_trait]
pub trait PeerLinkProvider: Send + Sync {
    /// Transport name used for tagging and logs (`wifidirect`, `wifi`)
    fn name(&self) -> &str;

    /// Whether this transport can currently be used at all
    async fn available(&self) -> bool;

    /// Open a link to the peer
    async fn connect(&self, peer: &PeerRecord) -> Result<PeerLink>;
}

/// Listen side of a transport; the server drains this in a loop and every
/// accepted link is yielded upward.
#[async_trait]
pub trait PeerLinkListener: Send {
    async fn accept(&mut self) -> Result<PeerLink>;

    fn local_addr(&self) -> SocketAddr;
}

/// Bookkeeping for one pooled connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub peer_id: String,
    pub transport: String,
    pub remote_addr: SocketAddr,
}

/// Ordered provider list plus the connection pool
pub struct PeerLinkManager {
    providers: Vec<Arc<dyn PeerLinkProvider>>,
    connect_timeout: Duration,
    pool: Arc<RwLock<HashMap<Uuid, ConnectionInfo>>>,
}

impl PeerLinkManager {
    pub fn new(providers: Vec<Arc<dyn PeerLinkProvider>>, connect_timeout: Duration) -> Self {
        Self {
            providers,
            connect_timeout,
            pool: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Open a link to the peer, walking the provider order.
    ///
    /// Unavailable providers are skipped; each attempt is bounded by the
    /// connect timeout. Returns the link together with its pool id.
    pub async fn connect(&self, peer: &PeerRecord) -> Result<(Uuid, PeerLink)> {
        let mut last_error: Option<AirDropError> = None;

        for provider in &self.providers {
            if !provider.available().await {
                debug!("provider {} unavailable, skipping", provider.name());
                continue;
            }

            match timeout(self.connect_timeout, provider.connect(peer)).await {
                Ok(Ok(link)) => {
                    let connection_id = Uuid::new_v4();
                    info!(
                        peer_id = %peer.peer_id,
                        transport = %link.transport,
                        %connection_id,
                        "link established"
                    );
                    self.pool.write().await.insert(
                        connection_id,
                        ConnectionInfo {
                            connection_id,
                            peer_id: peer.peer_id.clone(),
                            transport: link.transport.clone(),
                            remote_addr: link.remote_addr,
                        },
                    );
                    return Ok((connection_id, link));
                }
                Ok(Err(e)) => {
                    warn!("provider {} failed for {}: {e}", provider.name(), peer.peer_id);
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(
                        "provider {} timed out connecting to {}",
                        provider.name(),
                        peer.peer_id
                    );
                    last_error = Some(AirDropError::Timeout(format!(
                        "{} connect to {}",
                        provider.name(),
                        peer.peer_id
                    )));
                }
            }
        }

        match last_error {
            Some(e) => {
                warn!("all providers failed for {}: {e}", peer.peer_id);
                Err(AirDropError::NoTransport(peer.peer_id.clone()))
            }
            None => Err(AirDropError::NoTransport(peer.peer_id.clone())),
        }
    }

    /// Drop a connection from the pool. The socket itself closes when the
    /// owning transfer drops the link.
    pub async fn close(&self, connection_id: Uuid) {
        if self.pool.write().await.remove(&connection_id).is_some() {
            debug!(%connection_id, "connection released");
        }
    }

    /// Pool snapshot, newest first not guaranteed
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.pool.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceClass, PeerSighting, SightingSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    fn peer(id: &str) -> PeerRecord {
        PeerRecord::from_sighting(
            PeerSighting {
                peer_id: id.to_string(),
                source: SightingSource::Mdns,
                display_name: id.to_string(),
                device_class: DeviceClass::Mac,
                ip: Some("127.0.0.1".parse().unwrap()),
                port: 1,
                identity_hash: None,
                metadata: Default::default(),
                rssi: None,
            },
            SystemTime::now(),
        )
    }

    struct FakeProvider {
        name: &'static str,
        available: bool,
        succeed: bool,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeerLinkProvider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn available(&self) -> bool {
            self.available
        }

        async fn connect(&self, _peer: &PeerRecord) -> Result<PeerLink> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                let (client, _server) = tokio::io::duplex(64);
                Ok(PeerLink {
                    stream: Box::new(client),
                    local_addr: "127.0.0.1:1".parse().unwrap(),
                    remote_addr: "127.0.0.1:2".parse().unwrap(),
                    transport: self.name.to_string(),
                })
            } else {
                Err(AirDropError::PeerUnreachable("fake".into()))
            }
        }
    }

    #[tokio::test]
    async fn test_unavailable_provider_skipped() {
        let wfd_attempts = Arc::new(AtomicUsize::new(0));
        let tcp_attempts = Arc::new(AtomicUsize::new(0));

        let manager = PeerLinkManager::new(
            vec![
                Arc::new(FakeProvider {
                    name: "wifidirect",
                    available: false,
                    succeed: true,
                    attempts: wfd_attempts.clone(),
                }),
                Arc::new(FakeProvider {
                    name: "wifi",
                    available: true,
                    succeed: true,
                    attempts: tcp_attempts.clone(),
                }),
            ],
            Duration::from_secs(5),
        );

        let (id, link) = manager.connect(&peer("alice")).await.unwrap();
        assert_eq!(link.transport, "wifi");
        assert_eq!(wfd_attempts.load(Ordering::SeqCst), 0);
        assert_eq!(tcp_attempts.load(Ordering::SeqCst), 1);

        assert_eq!(manager.connections().await.len(), 1);
        manager.close(id).await;
        assert!(manager.connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_fallback_on_provider_failure() {
        let manager = PeerLinkManager::new(
            vec![
                Arc::new(FakeProvider {
                    name: "wifidirect",
                    available: true,
                    succeed: false,
                    attempts: Arc::new(AtomicUsize::new(0)),
                }),
                Arc::new(FakeProvider {
                    name: "wifi",
                    available: true,
                    succeed: true,
                    attempts: Arc::new(AtomicUsize::new(0)),
                }),
            ],
            Duration::from_secs(5),
        );

        let (_, link) = manager.connect(&peer("alice")).await.unwrap();
        assert_eq!(link.transport, "wifi");
    }

    #[tokio::test]
    async fn test_no_transport_when_all_fail() {
        let manager = PeerLinkManager::new(
            vec![Arc::new(FakeProvider {
                name: "wifi",
                available: true,
                succeed: false,
                attempts: Arc::new(AtomicUsize::new(0)),
            })],
            Duration::from_secs(5),
        );

        let err = manager.connect(&peer("alice")).await.unwrap_err();
        assert!(matches!(err, AirDropError::NoTransport(id) if id == "alice"));
    }

    #[tokio::test]
    async fn test_no_transport_when_none_available() {
        let manager = PeerLinkManager::new(vec![], Duration::from_secs(5));
        let err = manager.connect(&peer("alice")).await.unwrap_err();
        assert!(matches!(err, AirDropError::NoTransport(_)));
    }
}
