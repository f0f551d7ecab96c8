//! AirDrop Server
//!
//! HTTP/2 endpoint router behind the TLS guard. Three POST endpoints:
//! `/Discover` answers identity queries, `/Ask` gates an incoming transfer
//! on user consent, `/Upload` streams the multipart payload to disk.
//!
//! An approved `/Ask` is remembered against the peer's certificate
//! thumbprint for five minutes; an `/Upload` arriving without a matching
//! approval is answered 409 and writes nothing.

mod upload;

use crate::config::AirDropConfig;
use crate::identity::{Certificate, LocalIdentity};
use crate::link::{PeerLink, PeerLinkListener};
use crate::proto::{
    from_slice_ci, AskRequest, AskResponse, DiscoverRequest, DiscoverResponse, MediaCapabilities,
};
use crate::tls::TlsGuard;
use crate::transfer::{
    ApprovalDecision, FileDescriptor, TransferDirection, TransferManager, TransferRecord,
    TransferState,
};
use crate::{AirDropError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long an /Ask approval stays good for a subsequent /Upload
const APPROVAL_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Request bodies on the JSON endpoints are capped at this size
const MAX_JSON_BODY: usize = 1024 * 1024;

/// An /Ask approval remembered for the correlating /Upload
#[derive(Debug, Clone)]
struct ApprovalGrant {
    transfer_id: Uuid,
    save_path: Option<PathBuf>,
    granted_at: Instant,
}

/// Shared state the per-connection services close over
pub(crate) struct ServerState {
    pub identity: LocalIdentity,
    pub config: AirDropConfig,
    pub transfers: Arc<TransferManager>,
    approvals: RwLock<HashMap<String, ApprovalGrant>>,
}

impl ServerState {
    async fn grant(&self, thumbprint: &str, grant: ApprovalGrant) {
        self.approvals
            .write()
            .await
            .insert(thumbprint.to_string(), grant);
    }

    /// Take the approval for this peer if one is still inside the window
    async fn take_grant(&self, thumbprint: &str) -> Option<ApprovalGrant> {
        let mut approvals = self.approvals.write().await;
        approvals.retain(|_, g| g.granted_at.elapsed() <= APPROVAL_WINDOW);
        approvals.remove(thumbprint)
    }
}

/// The listening half of the protocol engine
pub struct AirDropServer {
    state: Arc<ServerState>,
    tls: Arc<TlsGuard>,
    shutdown_tx: watch::Sender<bool>,
}

impl AirDropServer {
    pub fn new(
        identity: LocalIdentity,
        config: AirDropConfig,
        certificate: &Certificate,
        transfers: Arc<TransferManager>,
    ) -> Result<Self> {
        let tls = Arc::new(TlsGuard::new(certificate)?);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            state: Arc::new(ServerState {
                identity,
                config,
                transfers,
                approvals: RwLock::new(HashMap::new()),
            }),
            tls,
            shutdown_tx,
        })
    }

    /// Drive the accept loop until shutdown.
    ///
    /// Every accepted link goes through the TLS guard; handshake failures
    /// drop that connection and the loop keeps serving. A failing listener
    /// (radio withdrawn mid-session) is logged and retried.
    pub async fn run(&self, mut listener: Box<dyn PeerLinkListener>) {
        let local_addr = listener.local_addr();
        info!("AirDrop server serving on {local_addr}");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok(link) => self.spawn_connection(link),
                        Err(e) => {
                            warn!("listener accept failed: {e}");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("AirDrop server shutting down");
                    break;
                }
            }
        }
    }

    /// Signal the accept loop to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn spawn_connection(&self, link: PeerLink) {
        let tls = self.tls.clone();
        let state = self.state.clone();

        tokio::spawn(async move {
            let remote_addr = link.remote_addr;
            let guarded = match tls.accept(link).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("TLS accept from {remote_addr} failed: {e}");
                    return;
                }
            };

            let Some(thumbprint) = guarded.peer_thumbprint().map(str::to_string) else {
                warn!("connection from {remote_addr} presented no certificate");
                return;
            };

            let service = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                let thumbprint = thumbprint.clone();
                async move { route(state, thumbprint, remote_addr, req).await }
            });

            let connection = http2::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(guarded), service);

            if let Err(e) = connection.await {
                debug!("connection from {remote_addr} ended: {e}");
            }
        });
    }
}

/// Route one request; protocol outcomes are responses, only internal
/// faults surface as service errors (resetting the stream).
async fn route(
    state: Arc<ServerState>,
    thumbprint: String,
    remote_addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, AirDropError> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{method} {path} from {remote_addr}");

    if method != Method::POST {
        return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED, "POST only"));
    }

    match path.as_str() {
        p if p.eq_ignore_ascii_case("/discover") => handle_discover(state, req).await,
        p if p.eq_ignore_ascii_case("/ask") => handle_ask(state, thumbprint, req).await,
        p if p.eq_ignore_ascii_case("/upload") => {
            upload::handle_upload(state, thumbprint, req).await
        }
        _ => Ok(status_response(StatusCode::NOT_FOUND, "no such endpoint")),
    }
}

async fn handle_discover(
    state: Arc<ServerState>,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, AirDropError> {
    let body = match read_json_body(req).await {
        Ok(bytes) => bytes,
        Err(response) => return Ok(response),
    };
    let request: DiscoverRequest = match from_slice_ci(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("malformed /Discover body: {e}");
            return Ok(status_response(StatusCode::BAD_REQUEST, "malformed body"));
        }
    };
    debug!(
        "/Discover from {} ({})",
        request.sender_computer_name, request.sender_model_name
    );

    json_response(
        StatusCode::OK,
        &DiscoverResponse {
            receiver_computer_name: state.identity.display_name.clone(),
            receiver_model_name: state.identity.model_name.clone(),
            receiver_media_capabilities: MediaCapabilities::default(),
        },
    )
}

async fn handle_ask(
    state: Arc<ServerState>,
    thumbprint: String,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, AirDropError> {
    let body = match read_json_body(req).await {
        Ok(bytes) => bytes,
        Err(response) => return Ok(response),
    };
    let request: AskRequest = match from_slice_ci(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("malformed /Ask body: {e}");
            return Ok(status_response(StatusCode::BAD_REQUEST, "malformed body"));
        }
    };

    let files: Vec<FileDescriptor> = request
        .files
        .iter()
        .map(FileDescriptor::from_ask_entry)
        .collect();
    if files.is_empty() {
        return Ok(status_response(StatusCode::BAD_REQUEST, "no files announced"));
    }

    let peer_id = if request.sender_id.is_empty() {
        thumbprint.clone()
    } else {
        request.sender_id.clone()
    };
    let record = TransferRecord::new(
        peer_id,
        request.sender_computer_name.clone(),
        TransferDirection::Receive,
        files,
    );
    let transfer_id = record.transfer_id;
    info!(
        %transfer_id,
        sender = %request.sender_computer_name,
        files = record.files.len(),
        total_bytes = record.total_bytes,
        "/Ask received"
    );

    state.transfers.register(record).await;
    let record = state
        .transfers
        .transition(transfer_id, TransferState::AwaitingApproval, None)
        .await?;

    // The record itself is already in the table, so the cap is breached
    // only when more than max_concurrent_transfers are active
    if state.transfers.active_count().await > state.config.max_concurrent_transfers {
        warn!(%transfer_id, "concurrent transfer cap reached, rejecting");
        state
            .transfers
            .transition(
                transfer_id,
                TransferState::Rejected,
                Some("too many concurrent transfers".into()),
            )
            .await?;
        return json_response(
            StatusCode::FORBIDDEN,
            &AskResponse {
                receiver_computer_name: state.identity.display_name.clone(),
                receiver_model_name: state.identity.model_name.clone(),
            },
        );
    }

    match state.transfers.request_approval(&record).await {
        Ok(ApprovalDecision::Approve { save_path }) => {
            state
                .transfers
                .transition(transfer_id, TransferState::Approved, None)
                .await?;
            state
                .grant(
                    &thumbprint,
                    ApprovalGrant {
                        transfer_id,
                        save_path,
                        granted_at: Instant::now(),
                    },
                )
                .await;
            json_response(
                StatusCode::OK,
                &AskResponse {
                    receiver_computer_name: state.identity.display_name.clone(),
                    receiver_model_name: state.identity.model_name.clone(),
                },
            )
        }
        Ok(ApprovalDecision::Reject { reason }) => {
            state
                .transfers
                .transition(transfer_id, TransferState::Rejected, reason)
                .await?;
            json_response(
                StatusCode::FORBIDDEN,
                &AskResponse {
                    receiver_computer_name: state.identity.display_name.clone(),
                    receiver_model_name: state.identity.model_name.clone(),
                },
            )
        }
        Err(AirDropError::ApprovalTimeout) => {
            state
                .transfers
                .transition(
                    transfer_id,
                    TransferState::Failed,
                    Some("approval timed out".into()),
                )
                .await?;
            Ok(status_response(
                StatusCode::REQUEST_TIMEOUT,
                "approval timed out",
            ))
        }
        Err(e) => Err(e),
    }
}

/// Collect a JSON endpoint body under the size cap
async fn read_json_body(
    req: Request<Incoming>,
) -> std::result::Result<Bytes, Response<Full<Bytes>>> {
    match Limited::new(req.into_body(), MAX_JSON_BODY).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => {
            warn!("failed to read request body: {e}");
            Err(status_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "body too large or unreadable",
            ))
        }
    }
}

pub(crate) fn json_response<T: serde::Serialize>(
    status: StatusCode,
    value: &T,
) -> std::result::Result<Response<Full<Bytes>>, AirDropError> {
    let body = serde_json::to_vec(value)?;
    Ok(Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("static response parts"))
}

pub(crate) fn status_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(message.to_string())))
        .expect("static response parts")
}
