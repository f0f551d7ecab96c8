//! /Upload handling
//!
//! Streams each multipart part to the save directory in configurable
//! chunks. Sibling `<part>_timestamp` parts carry ISO-8601 modification
//! times applied after the write when timestamp preservation is on.
//! Cancellation and I/O errors remove every file written for the request;
//! nothing of a failed transfer stays on disk.

use super::{json_response, status_response, ServerState};
use crate::fs_utils::{
    apply_modified_time, cleanup_partial_file, create_file_safe, sanitize_file_name,
    unique_target_path, write_file_safe,
};
use crate::proto::UploadResponse;
use crate::transfer::{ProgressTracker, TransferState};
use crate::AirDropError;
use bytes::Bytes;
use http_body_util::{BodyDataStream, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Why the part loop stopped early
enum UploadAbort {
    Cancelled,
    Error(AirDropError),
}

impl From<AirDropError> for UploadAbort {
    fn from(error: AirDropError) -> Self {
        UploadAbort::Error(error)
    }
}

/// What a finished part loop produced
struct UploadOutcome {
    /// Part name and target path for every non-empty file written
    written: Vec<(String, PathBuf)>,
    /// `<part>_timestamp` values keyed by the base part name
    timestamps: HashMap<String, String>,
    bytes_total: u64,
}

pub(crate) async fn handle_upload(
    state: Arc<ServerState>,
    thumbprint: String,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, AirDropError> {
    // Correlation rule: an /Upload is only served to a peer whose /Ask
    // was approved inside the window, matched by certificate thumbprint
    let Some(grant) = state.take_grant(&thumbprint).await else {
        warn!("/Upload without approved /Ask (thumbprint {thumbprint})");
        return Ok(status_response(
            StatusCode::CONFLICT,
            "no approved /Ask precedes this upload",
        ));
    };

    let record = match state.transfers.get(grant.transfer_id).await {
        Some(record) => record,
        None => {
            return Ok(status_response(StatusCode::CONFLICT, "transfer no longer exists"));
        }
    };
    let transfer_id = record.transfer_id;

    let boundary = req
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|ct| multer::parse_boundary(ct).ok());
    let Some(boundary) = boundary else {
        warn!(%transfer_id, "/Upload without multipart content type");
        return Ok(status_response(
            StatusCode::BAD_REQUEST,
            "multipart/form-data required",
        ));
    };

    let save_dir = grant
        .save_path
        .unwrap_or_else(|| state.config.save_dir.clone());

    // Request body arriving is the first byte of the transfer
    state
        .transfers
        .transition(transfer_id, TransferState::Transferring, None)
        .await?;

    let multipart = multer::Multipart::new(BodyDataStream::new(req.into_body()), boundary);
    let outcome = tokio::time::timeout(
        state.config.transfer_timeout,
        stream_parts(&state, &record, multipart, &save_dir),
    )
    .await;

    match outcome {
        Ok(Ok(outcome)) => {
            if state.config.preserve_timestamps {
                for (part_name, path) in &outcome.written {
                    if let Some(stamp) = outcome.timestamps.get(part_name) {
                        apply_modified_time(path, stamp);
                    }
                }
            }

            info!(
                %transfer_id,
                files = outcome.written.len(),
                bytes = outcome.bytes_total,
                "upload complete"
            );
            let destinations: Vec<PathBuf> =
                outcome.written.iter().map(|(_, path)| path.clone()).collect();
            state
                .transfers
                .record_destinations(transfer_id, &destinations)
                .await;
            state
                .transfers
                .transition(transfer_id, TransferState::Completed, None)
                .await?;

            json_response(
                StatusCode::OK,
                &UploadResponse {
                    success: true,
                    files_received: outcome.written.len(),
                    message: format!("received {} file(s)", outcome.written.len()),
                },
            )
        }
        Ok(Err(UploadAbort::Cancelled)) => {
            info!(%transfer_id, "upload cancelled, partial files removed");
            state
                .transfers
                .transition(transfer_id, TransferState::Cancelled, None)
                .await?;
            // Propagating the error resets the HTTP/2 stream
            Err(AirDropError::Cancelled("upload cancelled by receiver".into()))
        }
        Ok(Err(UploadAbort::Error(e))) => {
            warn!(%transfer_id, "upload failed: {e}");
            state
                .transfers
                .transition(transfer_id, TransferState::Failed, Some(e.to_string()))
                .await?;

            let status = match &e {
                AirDropError::ProtocolViolation(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            json_response(
                status,
                &UploadResponse {
                    success: false,
                    files_received: 0,
                    message: e.to_string(),
                },
            )
        }
        Err(_elapsed) => {
            warn!(%transfer_id, "upload exceeded the transfer timeout");
            state
                .transfers
                .transition(
                    transfer_id,
                    TransferState::Failed,
                    Some("transfer timeout".into()),
                )
                .await?;
            Ok(status_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "transfer timeout",
            ))
        }
    }
}

/// Drain the multipart body to disk.
///
/// On any early exit every file written so far is removed before the
/// abort reason is handed back.
async fn stream_parts(
    state: &Arc<ServerState>,
    record: &crate::transfer::TransferRecord,
    mut multipart: multer::Multipart<'static>,
    save_dir: &std::path::Path,
) -> std::result::Result<UploadOutcome, UploadAbort> {
    let mut written: Vec<(String, PathBuf)> = Vec::new();
    let mut timestamps: HashMap<String, String> = HashMap::new();
    let mut bytes_total = 0u64;
    let mut tracker = ProgressTracker::new(
        record.transfer_id,
        record.total_bytes,
        state.config.progress_interval,
    );
    let cancel = record.cancel.clone();

    let result: std::result::Result<(), UploadAbort> = async {
        loop {
            let field = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadAbort::Cancelled),
                field = multipart.next_field() => field.map_err(|e| {
                    AirDropError::ProtocolViolation(format!("bad multipart: {e}"))
                })?,
            };
            let Some(mut field) = field else { break };

            let part_name = field.name().unwrap_or_default().to_string();

            // Sibling timestamp parts are metadata, not files
            if let Some(base) = part_name.strip_suffix("_timestamp") {
                let text = field.text().await.map_err(|e| {
                    AirDropError::ProtocolViolation(format!("bad timestamp part: {e}"))
                })?;
                timestamps.insert(base.to_string(), text.trim().to_string());
                continue;
            }

            let filename = field
                .file_name()
                .map(str::to_string)
                .unwrap_or_else(|| part_name.clone());
            let safe_name = sanitize_file_name(&filename);
            let target = unique_target_path(save_dir, &safe_name);
            debug!("writing part '{part_name}' to {}", target.display());

            let mut file = create_file_safe(&target).await?;
            // Track the in-progress file so an abort removes it too
            written.push((part_name.clone(), target.clone()));

            let mut part_bytes = 0u64;
            let mut buffer: Vec<u8> = Vec::with_capacity(state.config.buffer_size);

            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(UploadAbort::Cancelled),
                    chunk = field.chunk() => chunk.map_err(|e| {
                        AirDropError::ProtocolViolation(format!("multipart read: {e}"))
                    })?,
                };

                match chunk {
                    Some(data) => {
                        part_bytes += data.len() as u64;
                        bytes_total += data.len() as u64;
                        buffer.extend_from_slice(&data);
                        if buffer.len() >= state.config.buffer_size {
                            write_file_safe(&mut file, &buffer).await?;
                            buffer.clear();
                        }
                        if let Some(progress) = tracker.update(bytes_total) {
                            state.transfers.report_progress(progress).await;
                        }
                    }
                    None => break,
                }
            }

            if !buffer.is_empty() {
                write_file_safe(&mut file, &buffer).await?;
            }
            file.flush().await.map_err(AirDropError::Io)?;
            drop(file);

            if part_bytes == 0 {
                warn!("empty part '{part_name}' skipped");
                let (_, path) = written.pop().expect("just pushed");
                cleanup_partial_file(&path).await;
            }
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            if let Some(progress) = tracker.update(bytes_total) {
                state.transfers.report_progress(progress).await;
            }
            Ok(UploadOutcome {
                written,
                timestamps,
                bytes_total,
            })
        }
        Err(abort) => {
            for (_, path) in &written {
                cleanup_partial_file(path).await;
            }
            Err(abort)
        }
    }
}
