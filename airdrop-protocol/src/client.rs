//! AirDrop Client
//!
//! Drives the send path: open a peer link, wrap it in mutual TLS, then
//! issue the three requests in order. `/Discover` confirms the peer,
//! `/Ask` obtains consent, `/Upload` streams the files as multipart.
//! Progress is reported through the transfer manager at most once per
//! progress interval with an EWMA rate and ETA; cancelling the transfer
//! aborts the in-flight request and closes the connection.

use crate::config::AirDropConfig;
use crate::device::PeerRecord;
use crate::identity::{Certificate, LocalIdentity};
use crate::link::PeerLinkManager;
use crate::proto::{outgoing, AskFileEntry};
use crate::tls::TlsGuard;
use crate::transfer::{
    FileDescriptor, ProgressTracker, TransferDirection, TransferManager, TransferRecord,
    TransferState,
};
use crate::{AirDropError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::SinkExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

type BodyStream = StreamBody<mpsc::Receiver<std::result::Result<Frame<Bytes>, std::io::Error>>>;
type H2Sender = hyper::client::conn::http2::SendRequest<BodyStream>;

/// The sending half of the protocol engine
pub struct AirDropClient {
    identity: LocalIdentity,
    config: AirDropConfig,
    tls: Arc<TlsGuard>,
    links: Arc<PeerLinkManager>,
    transfers: Arc<TransferManager>,
}

impl AirDropClient {
    pub fn new(
        identity: LocalIdentity,
        config: AirDropConfig,
        certificate: &Certificate,
        links: Arc<PeerLinkManager>,
        transfers: Arc<TransferManager>,
    ) -> Result<Self> {
        Ok(Self {
            identity,
            config,
            tls: Arc::new(TlsGuard::new(certificate)?),
            links,
            transfers,
        })
    }

    /// Send files to a peer. The returned record is terminal.
    pub async fn send(&self, peer: &PeerRecord, paths: &[PathBuf]) -> Result<TransferRecord> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(FileDescriptor::from_path(path).await?);
        }

        let record = TransferRecord::new(
            peer.peer_id.clone(),
            peer.display_name.clone(),
            TransferDirection::Send,
            files,
        );
        let transfer_id = record.transfer_id;
        info!(
            %transfer_id,
            peer = %peer.peer_id,
            files = record.files.len(),
            total_bytes = record.total_bytes,
            "starting send"
        );
        self.transfers.register(record.clone()).await;
        self.transfers
            .transition(transfer_id, TransferState::Connecting, None)
            .await?;

        match self.run_send(peer, &record).await {
            Ok(()) => self
                .transfers
                .transition(transfer_id, TransferState::Completed, None)
                .await,
            Err(AirDropError::PeerRejected(reason)) => self
                .transfers
                .transition(transfer_id, TransferState::Rejected, reason)
                .await,
            Err(AirDropError::Cancelled(_)) => self
                .transfers
                .transition(transfer_id, TransferState::Cancelled, None)
                .await,
            Err(e) => self
                .transfers
                .transition(transfer_id, TransferState::Failed, Some(e.to_string()))
                .await,
        }
    }

    async fn run_send(&self, peer: &PeerRecord, record: &TransferRecord) -> Result<()> {
        // Transport selection and TLS
        let (connection_id, link) = self.links.connect(peer).await?;
        let remote_addr = link.remote_addr;
        let guarded = self.tls.connect(link).await?;

        let result = self.run_requests(remote_addr, record, guarded).await;
        self.links.close(connection_id).await;
        result
    }

    async fn run_requests(
        &self,
        remote_addr: std::net::SocketAddr,
        record: &TransferRecord,
        guarded: crate::tls::GuardedStream,
    ) -> Result<()> {
        let (mut sender, connection) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(guarded))
                .await?;
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("client connection ended: {e}");
            }
        });

        let base = format!("https://{remote_addr}");
        let transfer_id = record.transfer_id;

        // Phase 1: /Discover confirms the peer speaks the protocol
        let discover_body = serde_json::to_vec(&outgoing::DiscoverRequest {
            sender_computer_name: self.identity.display_name.clone(),
            sender_model_name: self.identity.model_name.clone(),
            sender_id: self.identity.device_id.to_string(),
        })?;
        let (status, _) = tokio::time::timeout(
            self.config.discover_timeout,
            post_json(&mut sender, &base, "/Discover", discover_body),
        )
        .await
        .map_err(|_| AirDropError::PeerUnreachable(format!("{remote_addr}: /Discover timeout")))??;

        if !status.is_success() {
            connection.abort();
            return Err(AirDropError::PeerUnreachable(format!(
                "/Discover answered {status}"
            )));
        }
        debug!(%transfer_id, "/Discover ok");

        // Phase 2: /Ask waits for the receiver's consent
        let ask_body = serde_json::to_vec(&outgoing::AskRequest {
            sender_computer_name: self.identity.display_name.clone(),
            sender_id: self.identity.device_id.to_string(),
            files: record
                .files
                .iter()
                .map(|f| {
                    outgoing::OutgoingFileEntry::from(&AskFileEntry {
                        file_name: f.name.clone(),
                        file_size: f.size_bytes,
                        file_type: f.uti.clone(),
                        file_is_directory: f.is_directory,
                    })
                })
                .collect(),
        })?;

        // The receiver may take the whole approval window to answer
        let ask_deadline = self.config.approval_timeout + self.config.discover_timeout;
        let (status, _) = tokio::time::timeout(
            ask_deadline,
            post_json(&mut sender, &base, "/Ask", ask_body),
        )
        .await
        .map_err(|_| AirDropError::Timeout("/Ask".into()))??;

        match status.as_u16() {
            200 => debug!(%transfer_id, "/Ask approved"),
            403 => {
                connection.abort();
                return Err(AirDropError::PeerRejected(None));
            }
            408 => {
                connection.abort();
                return Err(AirDropError::ApprovalTimeout);
            }
            other => {
                connection.abort();
                return Err(AirDropError::ProtocolViolation(format!(
                    "/Ask answered {other}"
                )));
            }
        }

        self.transfers
            .transition(transfer_id, TransferState::Transferring, None)
            .await?;

        // Phase 3: /Upload streams the files
        let result = self.upload(&mut sender, &base, record).await;
        connection.abort();
        result
    }

    async fn upload(
        &self,
        sender: &mut H2Sender,
        base: &str,
        record: &TransferRecord,
    ) -> Result<()> {
        let boundary = format!("airdrop-{}", Uuid::new_v4().simple());
        let (body_tx, body_rx) = mpsc::channel::<
            std::result::Result<Frame<Bytes>, std::io::Error>,
        >(4);
        let body = StreamBody::new(body_rx);

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("{base}/Upload"))
            .header(
                http::header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(body)
            .expect("static request parts");

        // Producer feeds the multipart body while the request is in flight
        let producer = tokio::spawn(feed_multipart(
            record.clone(),
            boundary,
            body_tx,
            self.transfers.clone(),
            self.config.buffer_size,
            self.config.progress_interval,
            self.config.preserve_timestamps,
        ));

        let response = tokio::time::timeout(
            self.config.transfer_timeout,
            sender.send_request(request),
        )
        .await;

        let produced = producer
            .await
            .map_err(|e| AirDropError::InvalidState(format!("producer task died: {e}")))?;

        // A cancel aborts the stream, which also surfaces as a request
        // error; the cancel is the authoritative outcome
        if record.cancel.is_cancelled() {
            return Err(AirDropError::Cancelled("send cancelled".into()));
        }
        produced?;
        let response = response
            .map_err(|_| AirDropError::Timeout("/Upload".into()))??;

        let status = response.status();
        if status.is_success() {
            info!(transfer_id = %record.transfer_id, "upload acknowledged");
            Ok(())
        } else {
            let body = response
                .into_body()
                .collect()
                .await
                .map(|c| String::from_utf8_lossy(&c.to_bytes()).into_owned())
                .unwrap_or_default();
            warn!("upload answered {status}: {body}");
            Err(AirDropError::ProtocolViolation(format!(
                "/Upload answered {status}"
            )))
        }
    }
}

/// POST a JSON body and collect the response
async fn post_json(
    sender: &mut H2Sender,
    base: &str,
    path: &str,
    body: Vec<u8>,
) -> Result<(StatusCode, Bytes)> {
    let (mut tx, rx) = mpsc::channel(1);
    tx.send(Ok(Frame::data(Bytes::from(body))))
        .await
        .map_err(|_| AirDropError::InvalidState("request body channel closed".into()))?;
    drop(tx);

    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("{base}{path}"))
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(StreamBody::new(rx))
        .expect("static request parts");

    let response = sender.send_request(request).await?;
    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok((status, bytes))
}

/// Stream every file as one multipart part, with optional `_timestamp`
/// sibling parts. Closing the channel without the final boundary makes an
/// aborted body visible to the server.
async fn feed_multipart(
    record: TransferRecord,
    boundary: String,
    mut tx: mpsc::Sender<std::result::Result<Frame<Bytes>, std::io::Error>>,
    transfers: Arc<TransferManager>,
    buffer_size: usize,
    progress_interval: std::time::Duration,
    preserve_timestamps: bool,
) -> Result<()> {
    let mut tracker =
        ProgressTracker::new(record.transfer_id, record.total_bytes, progress_interval);
    let mut bytes_total = 0u64;
    let cancel = record.cancel.clone();

    for (index, descriptor) in record.files.iter().enumerate() {
        let Some(source) = descriptor.source_path.as_ref() else {
            return Err(AirDropError::InvalidState(format!(
                "file {} has no source path",
                descriptor.name
            )));
        };
        let part_name = format!("file{index}");

        let header = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{part_name}\"; \
             filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
            descriptor.name
        );
        send_frame(&mut tx, Bytes::from(header)).await?;

        let mut file = tokio::fs::File::open(source).await?;
        let mut buffer = vec![0u8; buffer_size];

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("send cancelled while streaming {}", descriptor.name);
                    // An error frame resets the HTTP/2 stream instead of
                    // ending the body cleanly
                    let _ = tx.send(Err(std::io::Error::other("cancelled"))).await;
                    return Err(AirDropError::Cancelled("send cancelled".into()));
                }
                read = file.read(&mut buffer) => read?,
            };
            if read == 0 {
                break;
            }

            send_frame(&mut tx, Bytes::copy_from_slice(&buffer[..read])).await?;
            bytes_total += read as u64;
            if let Some(progress) = tracker.update(bytes_total) {
                transfers.report_progress(progress).await;
            }
        }
        send_frame(&mut tx, Bytes::from_static(b"\r\n")).await?;

        if preserve_timestamps {
            if let Some(modified) = descriptor.modified {
                let stamp: DateTime<Utc> = modified.into();
                let part = format!(
                    "--{boundary}\r\nContent-Disposition: form-data; \
                     name=\"{part_name}_timestamp\"\r\n\r\n{}\r\n",
                    stamp.to_rfc3339()
                );
                send_frame(&mut tx, Bytes::from(part)).await?;
            }
        }
    }

    send_frame(&mut tx, Bytes::from(format!("--{boundary}--\r\n"))).await?;
    if let Some(progress) = tracker.update(bytes_total) {
        transfers.report_progress(progress).await;
    }
    Ok(())
}

async fn send_frame(
    tx: &mut mpsc::Sender<std::result::Result<Frame<Bytes>, std::io::Error>>,
    data: Bytes,
) -> Result<()> {
    tx.send(Ok(Frame::data(data)))
        .await
        .map_err(|_| AirDropError::PeerUnreachable("upload stream closed by peer".into()))
}

/// Descriptor helper for callers that stage sends from raw paths
pub async fn describe_files(paths: &[impl AsRef<Path>]) -> Result<Vec<FileDescriptor>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(FileDescriptor::from_path(path.as_ref()).await?);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_multipart_body_shape() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("hello.txt");
        std::fs::write(&path, b"hello multipart").unwrap();

        let descriptor = FileDescriptor::from_path(&path).await.unwrap();
        let record = TransferRecord::new(
            "peer",
            "Peer",
            TransferDirection::Send,
            vec![descriptor],
        );
        let transfers = Arc::new(TransferManager::new(
            crate::transfer::TransferManagerConfig {
                auto_accept: true,
                approval_timeout: std::time::Duration::from_secs(1),
                max_concurrent_transfers: 3,
            },
        ));

        let (tx, rx) = mpsc::channel(64);
        feed_multipart(
            record,
            "test-boundary".to_string(),
            tx,
            transfers,
            8192,
            std::time::Duration::from_millis(100),
            true,
        )
        .await
        .unwrap();

        let frames: Vec<_> = rx.collect().await;
        let mut body = Vec::new();
        for frame in frames {
            body.extend_from_slice(frame.unwrap().data_ref().unwrap());
        }
        let text = String::from_utf8_lossy(&body);

        assert!(text.starts_with("--test-boundary\r\n"));
        assert!(text.contains("filename=\"hello.txt\""));
        assert!(text.contains("hello multipart"));
        assert!(text.contains("name=\"file0_timestamp\""));
        assert!(text.ends_with("--test-boundary--\r\n"));
    }

    #[tokio::test]
    async fn test_cancelled_body_stops_early() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("big.bin");
        std::fs::write(&path, vec![0u8; 1 << 20]).unwrap();

        let descriptor = FileDescriptor::from_path(&path).await.unwrap();
        let record = TransferRecord::new(
            "peer",
            "Peer",
            TransferDirection::Send,
            vec![descriptor],
        );
        record.cancel.cancel();

        let transfers = Arc::new(TransferManager::new(
            crate::transfer::TransferManagerConfig {
                auto_accept: true,
                approval_timeout: std::time::Duration::from_secs(1),
                max_concurrent_transfers: 3,
            },
        ));

        let (tx, _rx) = mpsc::channel(64);
        let result = feed_multipart(
            record,
            "b".to_string(),
            tx,
            transfers,
            8192,
            std::time::Duration::from_millis(100),
            false,
        )
        .await;

        assert!(matches!(result, Err(AirDropError::Cancelled(_))));
    }
}
