//! Same-subnet TCP transport
//!
//! The fallback transport: a plain TCP connection to the address and port
//! the peer published over mDNS. The listen side binds the configured port
//! on the selected Wi-Fi interface and yields each accepted connection.

use super::{PeerLink, PeerLinkListener, PeerLinkProvider};
use crate::device::PeerRecord;
use crate::discovery::mdns::select_publish_address;
use crate::{AirDropError, Result};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Transport tag for same-subnet TCP
pub const TCP_TRANSPORT: &str = "wifi";

/// Standard TCP provider
#[derive(Debug, Default)]
pub struct TcpLinkProvider;

#[async_trait]
impl PeerLinkProvider for TcpLinkProvider {
    fn name(&self) -> &str {
        TCP_TRANSPORT
    }

    async fn available(&self) -> bool {
        true
    }

    async fn connect(&self, peer: &PeerRecord) -> Result<PeerLink> {
        let ip = peer.ip.ok_or_else(|| {
            AirDropError::InvalidState(format!("peer {} has no known address", peer.peer_id))
        })?;
        if peer.port == 0 {
            return Err(AirDropError::InvalidState(format!(
                "peer {} has no known port",
                peer.peer_id
            )));
        }

        let addr = SocketAddr::new(ip, peer.port);
        debug!("connecting to {addr}");

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| AirDropError::from_io_error(e, "TCP connect"))?;
        stream.set_nodelay(true)?;

        let local_addr = stream.local_addr()?;
        Ok(PeerLink {
            stream: Box::new(stream),
            local_addr,
            remote_addr: addr,
            transport: TCP_TRANSPORT.to_string(),
        })
    }
}

/// TCP listener bound on the selected Wi-Fi interface
pub struct TcpLinkListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpLinkListener {
    /// Bind the configured port on the preferred interface, falling back
    /// to the wildcard when no interface qualifies.
    pub async fn bind(port: u16) -> Result<Self> {
        let ip = select_publish_address();
        match TcpListener::bind((ip, port)).await {
            Ok(listener) => Self::from_listener(listener),
            Err(e) if !ip.is_unspecified() => {
                debug!("bind on {ip}:{port} failed ({e}), retrying on wildcard");
                let listener = TcpListener::bind((IpAddr::from([0, 0, 0, 0]), port)).await?;
                Self::from_listener(listener)
            }
            Err(e) => Err(AirDropError::Io(e)),
        }
    }

    /// Bind an explicit address (loopback testing, caller-picked interface)
    pub async fn bind_addr(addr: SocketAddr) -> Result<Self> {
        Self::from_listener(TcpListener::bind(addr).await?)
    }

    fn from_listener(listener: TcpListener) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        info!("TCP listener on {local_addr}");
        Ok(Self {
            listener,
            local_addr,
        })
    }
}

#[async_trait]
impl PeerLinkListener for TcpLinkListener {
    async fn accept(&mut self) -> Result<PeerLink> {
        let (stream, remote_addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!("accepted connection from {remote_addr}");

        Ok(PeerLink {
            stream: Box::new(stream),
            local_addr: self.local_addr,
            remote_addr,
            transport: TCP_TRANSPORT.to_string(),
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
