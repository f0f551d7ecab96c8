//! TLS Guard
//!
//! Wraps peer links with mutual TLS 1.2+. Both sides present the local
//! self-signed certificate; the trust decision deliberately does not come
//! from a public PKI. The server requires a client certificate but accepts
//! any that decodes; the client tolerates chain-of-trust failures and
//! rejects only certificates that are unusable (undecodable or already
//! expired). Peer authentication assurance comes from the out-of-band /Ask
//! consent and identity-hash matching.
//!
//! The guarded stream exposes the peer certificate thumbprint, which the
//! server uses to correlate /Ask approvals with later /Upload requests.

use crate::identity::Certificate;
use crate::link::{LinkStream, PeerLink};
use crate::{AirDropError, Result};
use openssl::asn1::Asn1Time;
use openssl::pkey::PKey;
use openssl::ssl::{
    AlpnError, Ssl, SslAcceptor, SslConnector, SslMethod, SslVerifyMode, SslVersion,
};
use openssl::x509::X509;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tokio_openssl::SslStream;
use tracing::{debug, warn};

/// Handshake deadline
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// ALPN identifier for HTTP/2
const ALPN_H2: &[u8] = b"\x02h2";

/// Mutual-TLS wrapper for peer links
pub struct TlsGuard {
    acceptor: Arc<SslAcceptor>,
    connector: Arc<SslConnector>,
}

impl TlsGuard {
    pub fn new(certificate: &Certificate) -> Result<Self> {
        Ok(Self {
            acceptor: Arc::new(build_acceptor(certificate)?),
            connector: Arc::new(build_connector(certificate)?),
        })
    }

    /// Server-side handshake over an accepted link
    pub async fn accept(&self, link: PeerLink) -> Result<GuardedStream> {
        let remote_addr = link.remote_addr;
        let transport = link.transport;

        let ssl = Ssl::new(self.acceptor.context())?;
        let mut stream = SslStream::new(ssl, link.stream)?;

        timeout(HANDSHAKE_TIMEOUT, Pin::new(&mut stream).accept())
            .await
            .map_err(|_| AirDropError::TlsHandshake(format!("{remote_addr}: handshake timeout")))?
            .map_err(|e| {
                warn!("TLS accept from {remote_addr} failed: {e}");
                AirDropError::TlsHandshake(format!("{remote_addr}: {e}"))
            })?;

        let peer_thumbprint = peer_thumbprint(&stream);
        debug!(
            %remote_addr,
            thumbprint = peer_thumbprint.as_deref().unwrap_or("<none>"),
            "TLS session up (server)"
        );

        Ok(GuardedStream {
            stream,
            remote_addr,
            transport,
            peer_thumbprint,
        })
    }

    /// Client-side handshake over a connected link
    pub async fn connect(&self, link: PeerLink) -> Result<GuardedStream> {
        let remote_addr = link.remote_addr;
        let transport = link.transport;

        // SNI carries the peer address; verification doesn't key off it
        let mut configuration = self.connector.configure()?;
        configuration.set_verify_hostname(false);
        let ssl = configuration.into_ssl(&remote_addr.ip().to_string())?;
        let mut stream = SslStream::new(ssl, link.stream)?;

        timeout(HANDSHAKE_TIMEOUT, Pin::new(&mut stream).connect())
            .await
            .map_err(|_| AirDropError::TlsHandshake(format!("{remote_addr}: handshake timeout")))?
            .map_err(|e| {
                warn!("TLS connect to {remote_addr} failed: {e}");
                AirDropError::TlsHandshake(format!("{remote_addr}: {e}"))
            })?;

        let peer_thumbprint = peer_thumbprint(&stream);
        debug!(
            %remote_addr,
            thumbprint = peer_thumbprint.as_deref().unwrap_or("<none>"),
            "TLS session up (client)"
        );

        Ok(GuardedStream {
            stream,
            remote_addr,
            transport,
            peer_thumbprint,
        })
    }
}

fn build_acceptor(certificate: &Certificate) -> Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;

    let cert = X509::from_der(&certificate.cert_der)?;
    let pkey = PKey::private_key_from_der(&certificate.key_der)?;
    builder.set_certificate(&cert)?;
    builder.set_private_key(&pkey)?;

    // A client certificate is mandatory, but any certificate that decodes
    // passes: the trust anchor is the consent flow, not a CA
    builder.set_verify_callback(
        SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        |_preverified, ctx| ctx.current_cert().is_some(),
    );

    builder.set_alpn_select_callback(|_ssl, client_protos| {
        openssl::ssl::select_next_proto(ALPN_H2, client_protos).ok_or(AlpnError::NOACK)
    });

    Ok(builder.build())
}

fn build_connector(certificate: &Certificate) -> Result<SslConnector> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;

    let cert = X509::from_der(&certificate.cert_der)?;
    let pkey = PKey::private_key_from_der(&certificate.key_der)?;
    builder.set_certificate(&cert)?;
    builder.set_private_key(&pkey)?;

    // Reject only unusable server certificates: undecodable or already
    // expired. Self-signed and otherwise untrusted chains are expected.
    builder.set_verify_callback(SslVerifyMode::PEER, |_preverified, ctx| {
        let Some(cert) = ctx.current_cert() else {
            return false;
        };
        let Ok(now) = Asn1Time::days_from_now(0) else {
            return false;
        };
        *cert.not_after() >= now
    });

    builder.set_alpn_protos(ALPN_H2)?;

    Ok(builder.build())
}

fn peer_thumbprint(stream: &SslStream<Box<dyn LinkStream>>) -> Option<String> {
    stream
        .ssl()
        .peer_certificate()
        .and_then(|cert| cert.to_der().ok())
        .map(|der| hex::encode(Sha256::digest(der)))
}

/// A TLS-authenticated byte stream
pub struct GuardedStream {
    stream: SslStream<Box<dyn LinkStream>>,
    remote_addr: SocketAddr,
    transport: String,
    peer_thumbprint: Option<String>,
}

impl GuardedStream {
    /// SHA-256 over the peer certificate DER, when one was presented
    pub fn peer_thumbprint(&self) -> Option<&str> {
        self.peer_thumbprint.as_deref()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }
}

impl AsyncRead for GuardedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for GuardedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CertificateStore;
    use crate::link::PeerLink;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn test_certificate(name: &str) -> Certificate {
        let temp = TempDir::new().unwrap();
        let store = CertificateStore::new(temp.path(), 365, 30).unwrap();
        store.get_or_create_certificate(name).await.unwrap()
    }

    fn link_from(stream: TcpStream, transport: &str) -> PeerLink {
        let local_addr = stream.local_addr().unwrap();
        let remote_addr = stream.peer_addr().unwrap();
        PeerLink {
            stream: Box::new(stream),
            local_addr,
            remote_addr,
            transport: transport.to_string(),
        }
    }

    #[tokio::test]
    async fn test_mutual_handshake_with_self_signed_certs() {
        let server_cert = test_certificate("server").await;
        let client_cert = test_certificate("client").await;
        let client_print = client_cert.thumbprint.clone();
        let server_print = server_cert.thumbprint.clone();

        let server_guard = TlsGuard::new(&server_cert).unwrap();
        let client_guard = TlsGuard::new(&client_cert).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut guarded = server_guard.accept(link_from(stream, "wifi")).await.unwrap();

            // The client certificate is visible for correlation
            assert_eq!(guarded.peer_thumbprint(), Some(client_print.as_str()));

            let mut buf = [0u8; 4];
            guarded.read_exact(&mut buf).await.unwrap();
            guarded.write_all(b"pong").await.unwrap();
            guarded.flush().await.unwrap();
            buf
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut guarded = client_guard.connect(link_from(stream, "wifi")).await.unwrap();
        assert_eq!(guarded.peer_thumbprint(), Some(server_print.as_str()));

        guarded.write_all(b"ping").await.unwrap();
        guarded.flush().await.unwrap();
        let mut buf = [0u8; 4];
        guarded.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_server_requires_client_certificate() {
        let server_cert = test_certificate("server").await;
        let server_guard = TlsGuard::new(&server_cert).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            server_guard.accept(link_from(stream, "wifi")).await
        });

        // A bare client that presents no certificate is refused
        let mut builder = SslConnector::builder(SslMethod::tls_client()).unwrap();
        builder.set_verify(SslVerifyMode::NONE);
        let connector = builder.build();

        let stream = TcpStream::connect(addr).await.unwrap();
        let ssl = connector
            .configure()
            .unwrap()
            .into_ssl(&addr.ip().to_string())
            .unwrap();
        let mut tls = SslStream::new(ssl, stream).unwrap();
        let client_result = Pin::new(&mut tls).connect().await;

        let server_result = server.await.unwrap();
        assert!(server_result.is_err() || client_result.is_err());
        if let Err(e) = server_result {
            assert!(matches!(e, AirDropError::TlsHandshake(_)));
        }
    }
}
