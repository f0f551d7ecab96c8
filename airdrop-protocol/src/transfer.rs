//! Transfer State Machine
//!
//! Owns per-transfer lifecycle: consent gating, progress aggregation and
//! cancellation. Transitions follow one path through the machine below and
//! every terminal state is emitted exactly once; the transition table is
//! enforced here so neither the server nor the client can skip a gate.
//!
//! ```text
//!   Pending ──(send path)──────────────▶ Connecting
//!   Pending ──(receive, /Ask arrived)──▶ AwaitingApproval
//!   AwaitingApproval ─(approve)─▶ Approved ─(first byte)─▶ Transferring
//!   AwaitingApproval ─(reject)──▶ Rejected   [terminal]
//!   AwaitingApproval ─(timeout)─▶ Failed     [terminal]
//!   Connecting ──(TLS up, /Discover ok, /Ask 200)──▶ Transferring
//!   Connecting ──(/Ask 403)──▶ Rejected      [terminal]
//!   Connecting ──(any failure)──▶ Failed     [terminal]
//!   Transferring ──(all bytes moved)──▶ Completed [terminal]
//!   Transferring ──(error)─▶ Failed          [terminal]
//!   any non-terminal ──(cancel)─▶ Cancelled  [terminal]
//! ```

use crate::proto::AskFileEntry;
use crate::{AirDropError, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle states of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TransferState {
    Pending,
    AwaitingApproval,
    Approved,
    Rejected,
    Connecting,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Rejected
                | TransferState::Completed
                | TransferState::Failed
                | TransferState::Cancelled
        )
    }

    /// Legal edges of the state machine
    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;

        if self.is_terminal() {
            return false;
        }
        if next == Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Connecting)
                | (Pending, AwaitingApproval)
                | (AwaitingApproval, Approved)
                | (AwaitingApproval, Rejected)
                | (AwaitingApproval, Failed)
                | (Approved, Transferring)
                | (Approved, Failed)
                | (Connecting, Transferring)
                | (Connecting, Rejected)
                | (Connecting, Failed)
                | (Transferring, Completed)
                | (Transferring, Failed)
        )
    }
}

/// Direction of a transfer as seen from this host
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Metadata for one file in a transfer
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub name: String,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
    /// Apple uniform type identifier, when the peer supplied one
    pub uti: Option<String>,
    /// Where the bytes come from on the send side
    pub source_path: Option<PathBuf>,
    /// Where the bytes landed on the receive side
    pub dest_path: Option<PathBuf>,
    pub sha256: Option<String>,
    pub created: Option<SystemTime>,
    pub modified: Option<SystemTime>,
    pub is_directory: bool,
    /// Path inside a directory archive, when part of one
    pub archive_path: Option<String>,
}

impl FileDescriptor {
    /// Read metadata for a local file about to be sent
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AirDropError::InvalidState(format!("bad filename: {path:?}")))?
            .to_string();

        Ok(Self {
            name,
            size_bytes: metadata.len(),
            mime_type: None,
            uti: None,
            source_path: Some(path.to_path_buf()),
            dest_path: None,
            sha256: None,
            created: metadata.created().ok(),
            modified: metadata.modified().ok(),
            is_directory: metadata.is_dir(),
            archive_path: None,
        })
    }

    /// Build a descriptor from an /Ask file entry
    pub fn from_ask_entry(entry: &AskFileEntry) -> Self {
        Self {
            name: entry.file_name.clone(),
            size_bytes: entry.file_size,
            mime_type: None,
            uti: entry.file_type.clone(),
            source_path: None,
            dest_path: None,
            sha256: None,
            created: None,
            modified: None,
            is_directory: entry.file_is_directory,
            archive_path: None,
        }
    }
}

/// Cooperative cancellation handle owned by a transfer.
///
/// Cloning shares the signal; flipping it unwinds any worker blocked in
/// I/O for that transfer.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the handle is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                // Sender gone without a cancel: never resolves
                std::future::pending::<()>().await;
            }
        }
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// One in-flight exchange
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub transfer_id: Uuid,
    pub peer_id: String,
    pub peer_name: String,
    pub direction: TransferDirection,
    pub files: Vec<FileDescriptor>,
    pub total_bytes: u64,
    pub bytes_done: u64,
    pub state: TransferState,
    pub initiated_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub error: Option<String>,
    pub cancel: CancelHandle,
}

impl TransferRecord {
    pub fn new(
        peer_id: impl Into<String>,
        peer_name: impl Into<String>,
        direction: TransferDirection,
        files: Vec<FileDescriptor>,
    ) -> Self {
        let total_bytes = files.iter().map(|f| f.size_bytes).sum();
        Self {
            transfer_id: Uuid::new_v4(),
            peer_id: peer_id.into(),
            peer_name: peer_name.into(),
            direction,
            files,
            total_bytes,
            bytes_done: 0,
            state: TransferState::Pending,
            initiated_at: SystemTime::now(),
            started_at: None,
            completed_at: None,
            error: None,
            cancel: CancelHandle::new(),
        }
    }
}

/// Throttled progress snapshot
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub transfer_id: Uuid,
    pub bytes_done: u64,
    pub total_bytes: u64,
    /// Smoothed transfer rate in bytes per second
    pub rate_bps: f64,
    /// Remaining time at the current rate, when computable
    pub eta: Option<Duration>,
}

/// Events emitted by the transfer manager
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A peer asked to send us files; approval is pending
    Requested(TransferRecord),
    /// Non-terminal state movement
    StateChanged(TransferRecord),
    Progress(TransferProgress),
    Completed(TransferRecord),
    Failed(TransferRecord),
    Rejected(TransferRecord),
    Cancelled(TransferRecord),
}

/// What the approval callback decided
#[derive(Debug, Clone)]
pub enum ApprovalDecision {
    Approve { save_path: Option<PathBuf> },
    Reject { reason: Option<String> },
}

/// Async approval callback invoked for each incoming /Ask
pub type ApprovalCallback =
    Arc<dyn Fn(TransferRecord) -> BoxFuture<'static, ApprovalDecision> + Send + Sync>;

/// Configuration slice the manager needs
#[derive(Debug, Clone)]
pub struct TransferManagerConfig {
    pub auto_accept: bool,
    pub approval_timeout: Duration,
    pub max_concurrent_transfers: usize,
}

/// Shared table of transfers plus the consent gate
pub struct TransferManager {
    transfers: Arc<RwLock<HashMap<Uuid, TransferRecord>>>,
    event_tx: broadcast::Sender<TransferEvent>,
    approval: RwLock<Option<ApprovalCallback>>,
    config: TransferManagerConfig,
}

impl TransferManager {
    pub fn new(config: TransferManagerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transfers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            approval: RwLock::new(None),
            config,
        }
    }

    /// Install the approval callback consulted for incoming transfers
    pub async fn set_approval_callback(&self, callback: ApprovalCallback) {
        *self.approval.write().await = Some(callback);
    }

    /// Get a receiver for transfer events; each subscriber has its own
    /// independent feed.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.event_tx.subscribe()
    }

    /// Register a fresh record in the table
    pub async fn register(&self, record: TransferRecord) {
        debug!(
            transfer_id = %record.transfer_id,
            direction = ?record.direction,
            files = record.files.len(),
            "transfer registered"
        );
        self.transfers
            .write()
            .await
            .insert(record.transfer_id, record);
    }

    pub async fn get(&self, transfer_id: Uuid) -> Option<TransferRecord> {
        self.transfers.read().await.get(&transfer_id).cloned()
    }

    /// Transfers that have not reached a terminal state
    pub async fn active_count(&self) -> usize {
        self.transfers
            .read()
            .await
            .values()
            .filter(|r| !r.state.is_terminal())
            .count()
    }

    /// Whether a new transfer may start under the concurrency cap
    pub async fn has_capacity(&self) -> bool {
        self.active_count().await < self.config.max_concurrent_transfers
    }

    /// Move a transfer along one legal edge.
    ///
    /// Terminal states stamp `completed_at` and fire their event exactly
    /// once; an illegal transition is an error and changes nothing.
    pub async fn transition(
        &self,
        transfer_id: Uuid,
        next: TransferState,
        error: Option<String>,
    ) -> Result<TransferRecord> {
        let mut transfers = self.transfers.write().await;
        let record = transfers
            .get_mut(&transfer_id)
            .ok_or_else(|| AirDropError::InvalidState(format!("unknown transfer {transfer_id}")))?;

        if record.state == next {
            return Ok(record.clone());
        }
        if !record.state.can_transition_to(next) {
            // A cancel racing a terminal state is a no-op, not a bug
            if next == TransferState::Cancelled && record.state.is_terminal() {
                return Ok(record.clone());
            }
            return Err(AirDropError::InvalidState(format!(
                "illegal transition {:?} -> {:?} for {transfer_id}",
                record.state, next
            )));
        }

        info!(%transfer_id, from = ?record.state, to = ?next, "transfer state");
        record.state = next;
        if next == TransferState::Transferring && record.started_at.is_none() {
            record.started_at = Some(SystemTime::now());
        }
        if next.is_terminal() {
            record.completed_at = Some(SystemTime::now());
            if let Some(message) = error {
                record.error = Some(message);
            }
        }
        let snapshot = record.clone();
        drop(transfers);

        let event = match next {
            TransferState::Completed => TransferEvent::Completed(snapshot.clone()),
            TransferState::Failed => TransferEvent::Failed(snapshot.clone()),
            TransferState::Rejected => TransferEvent::Rejected(snapshot.clone()),
            TransferState::Cancelled => TransferEvent::Cancelled(snapshot.clone()),
            _ => TransferEvent::StateChanged(snapshot.clone()),
        };
        let _ = self.event_tx.send(event);

        Ok(snapshot)
    }

    /// Stamp where received files landed, in write order
    pub async fn record_destinations(&self, transfer_id: Uuid, destinations: &[PathBuf]) {
        if let Some(record) = self.transfers.write().await.get_mut(&transfer_id) {
            for (descriptor, path) in record.files.iter_mut().zip(destinations) {
                descriptor.dest_path = Some(path.clone());
            }
        }
    }

    /// Record progress and forward it to subscribers
    pub async fn report_progress(&self, progress: TransferProgress) {
        if let Some(record) = self.transfers.write().await.get_mut(&progress.transfer_id) {
            record.bytes_done = progress.bytes_done;
        }
        let _ = self.event_tx.send(TransferEvent::Progress(progress));
    }

    /// Ask the user (or the auto-accept setting) about an incoming
    /// transfer. The record must be in `AwaitingApproval`.
    ///
    /// Returns the decision; a missing callback or an elapsed window maps
    /// to `ApprovalTimeout`.
    pub async fn request_approval(&self, record: &TransferRecord) -> Result<ApprovalDecision> {
        let _ = self
            .event_tx
            .send(TransferEvent::Requested(record.clone()));

        if self.config.auto_accept {
            debug!(transfer_id = %record.transfer_id, "auto-accept enabled, granting");
            return Ok(ApprovalDecision::Approve { save_path: None });
        }

        let callback = self.approval.read().await.clone();
        let Some(callback) = callback else {
            warn!("no approval callback installed, incoming transfer will time out");
            tokio::time::sleep(self.config.approval_timeout).await;
            return Err(AirDropError::ApprovalTimeout);
        };

        match tokio::time::timeout(self.config.approval_timeout, callback(record.clone())).await
        {
            Ok(decision) => Ok(decision),
            Err(_) => Err(AirDropError::ApprovalTimeout),
        }
    }

    /// Cancel a transfer; a no-op once a terminal state was reached.
    pub async fn cancel(&self, transfer_id: Uuid) {
        let handle = {
            let transfers = self.transfers.read().await;
            match transfers.get(&transfer_id) {
                Some(record) if !record.state.is_terminal() => Some(record.cancel.clone()),
                _ => None,
            }
        };
        if let Some(handle) = handle {
            info!(%transfer_id, "cancelling transfer");
            handle.cancel();
        }
    }

    /// All records, for status surfaces
    pub async fn snapshot(&self) -> Vec<TransferRecord> {
        self.transfers.read().await.values().cloned().collect()
    }
}

/// Rate/ETA tracker with EWMA smoothing over roughly the last second,
/// throttled to the configured progress interval.
pub struct ProgressTracker {
    transfer_id: Uuid,
    total_bytes: u64,
    interval: Duration,
    last_emit: Option<Instant>,
    last_bytes: u64,
    rate_bps: f64,
}

impl ProgressTracker {
    pub fn new(transfer_id: Uuid, total_bytes: u64, interval: Duration) -> Self {
        Self {
            transfer_id,
            total_bytes,
            interval,
            last_emit: None,
            last_bytes: 0,
            rate_bps: 0.0,
        }
    }

    /// Feed the running byte count; yields a snapshot at most once per
    /// interval (and always for the final byte).
    pub fn update(&mut self, bytes_done: u64) -> Option<TransferProgress> {
        let now = Instant::now();
        let finished = bytes_done >= self.total_bytes;

        match self.last_emit {
            Some(last) if !finished && now.duration_since(last) < self.interval => return None,
            _ => {}
        }

        if let Some(last) = self.last_emit {
            let dt = now.duration_since(last).as_secs_f64();
            if dt > 0.0 {
                let instantaneous = (bytes_done - self.last_bytes) as f64 / dt;
                // Smoothing constant of one second
                let alpha = 1.0 - (-dt).exp();
                self.rate_bps = alpha * instantaneous + (1.0 - alpha) * self.rate_bps;
            }
        }
        self.last_emit = Some(now);
        self.last_bytes = bytes_done;

        let eta = if self.rate_bps > 1.0 && !finished {
            Some(Duration::from_secs_f64(
                (self.total_bytes - bytes_done) as f64 / self.rate_bps,
            ))
        } else {
            None
        };

        Some(TransferProgress {
            transfer_id: self.transfer_id,
            bytes_done,
            total_bytes: self.total_bytes,
            rate_bps: self.rate_bps,
            eta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TransferManager {
        TransferManager::new(TransferManagerConfig {
            auto_accept: false,
            approval_timeout: Duration::from_millis(100),
            max_concurrent_transfers: 3,
        })
    }

    fn record(direction: TransferDirection) -> TransferRecord {
        TransferRecord::new(
            "peer-1",
            "Alice",
            direction,
            vec![FileDescriptor {
                name: "a.txt".into(),
                size_bytes: 10,
                mime_type: None,
                uti: None,
                source_path: None,
                dest_path: None,
                sha256: None,
                created: None,
                modified: None,
                is_directory: false,
                archive_path: None,
            }],
        )
    }

    #[test]
    fn test_legal_receive_path() {
        use TransferState::*;
        assert!(Pending.can_transition_to(AwaitingApproval));
        assert!(AwaitingApproval.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Transferring));
        assert!(Transferring.can_transition_to(Completed));
    }

    #[test]
    fn test_legal_send_path() {
        use TransferState::*;
        assert!(Pending.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Transferring));
        assert!(Connecting.can_transition_to(Rejected));
        assert!(Transferring.can_transition_to(Failed));
    }

    #[test]
    fn test_terminal_states_are_sinks() {
        use TransferState::*;
        for terminal in [Rejected, Completed, Failed, Cancelled] {
            for next in [
                Pending,
                AwaitingApproval,
                Approved,
                Connecting,
                Transferring,
                Completed,
                Failed,
                Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_illegal_shortcuts() {
        use TransferState::*;
        assert!(!Pending.can_transition_to(Transferring));
        assert!(!AwaitingApproval.can_transition_to(Completed));
        assert!(!Approved.can_transition_to(Completed));
    }

    #[test]
    fn test_cancel_from_any_non_terminal() {
        use TransferState::*;
        for state in [Pending, AwaitingApproval, Approved, Connecting, Transferring] {
            assert!(state.can_transition_to(Cancelled));
        }
    }

    #[tokio::test]
    async fn test_terminal_event_emitted_once() {
        let manager = manager();
        let mut events = manager.subscribe();

        let rec = record(TransferDirection::Send);
        let id = rec.transfer_id;
        manager.register(rec).await;

        manager
            .transition(id, TransferState::Connecting, None)
            .await
            .unwrap();
        manager
            .transition(id, TransferState::Transferring, None)
            .await
            .unwrap();
        manager
            .transition(id, TransferState::Completed, None)
            .await
            .unwrap();

        // A late cancel must not produce a second terminal event
        manager.cancel(id).await;
        let result = manager.transition(id, TransferState::Cancelled, None).await;
        assert!(result.is_ok());
        assert_eq!(
            manager.get(id).await.unwrap().state,
            TransferState::Completed
        );

        assert!(matches!(
            events.recv().await.unwrap(),
            TransferEvent::StateChanged(_)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            TransferEvent::StateChanged(_)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            TransferEvent::Completed(_)
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let manager = manager();
        let rec = record(TransferDirection::Send);
        let id = rec.transfer_id;
        manager.register(rec).await;

        let err = manager
            .transition(id, TransferState::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AirDropError::InvalidState(_)));
        assert_eq!(manager.get(id).await.unwrap().state, TransferState::Pending);
    }

    #[tokio::test]
    async fn test_approval_timeout_when_callback_hangs() {
        let manager = manager();
        manager
            .set_approval_callback(Arc::new(|_record| {
                Box::pin(async {
                    // Never answers
                    std::future::pending::<ApprovalDecision>().await
                })
            }))
            .await;

        let rec = record(TransferDirection::Receive);
        let err = manager.request_approval(&rec).await.unwrap_err();
        assert!(matches!(err, AirDropError::ApprovalTimeout));
    }

    #[tokio::test]
    async fn test_auto_accept_bypasses_callback() {
        let manager = TransferManager::new(TransferManagerConfig {
            auto_accept: true,
            approval_timeout: Duration::from_millis(50),
            max_concurrent_transfers: 3,
        });

        let rec = record(TransferDirection::Receive);
        let decision = manager.request_approval(&rec).await.unwrap();
        assert!(matches!(decision, ApprovalDecision::Approve { .. }));
    }

    #[tokio::test]
    async fn test_capacity_gate() {
        let manager = TransferManager::new(TransferManagerConfig {
            auto_accept: true,
            approval_timeout: Duration::from_millis(50),
            max_concurrent_transfers: 1,
        });

        let rec = record(TransferDirection::Receive);
        let id = rec.transfer_id;
        manager.register(rec).await;
        assert!(!manager.has_capacity().await);

        manager
            .transition(id, TransferState::Cancelled, None)
            .await
            .unwrap();
        assert!(manager.has_capacity().await);
    }

    #[tokio::test]
    async fn test_cancel_handle_unblocks_waiter() {
        let handle = CancelHandle::new();
        let waiter = handle.clone();

        let task = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap());
    }

    #[test]
    fn test_progress_tracker_throttles() {
        let mut tracker =
            ProgressTracker::new(Uuid::new_v4(), 1000, Duration::from_millis(100));

        // First update always emits
        assert!(tracker.update(100).is_some());
        // Immediate follow-up is throttled
        assert!(tracker.update(200).is_none());
        // The final byte always emits
        let last = tracker.update(1000).unwrap();
        assert_eq!(last.bytes_done, 1000);
        assert!(last.eta.is_none());
    }

    #[tokio::test]
    async fn test_progress_tracker_rate() {
        let mut tracker =
            ProgressTracker::new(Uuid::new_v4(), 10_000_000, Duration::from_millis(10));

        tracker.update(0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let progress = tracker.update(500_000).unwrap();
        assert!(progress.rate_bps > 0.0);
        assert!(progress.eta.is_some());
    }

    #[tokio::test]
    async fn test_file_descriptor_from_path() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), b"hello world").unwrap();

        let descriptor = FileDescriptor::from_path(temp.path()).await.unwrap();
        assert_eq!(descriptor.size_bytes, 11);
        assert!(!descriptor.is_directory);
        assert!(descriptor.source_path.is_some());
    }
}
