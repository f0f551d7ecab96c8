//! File System Utilities for the receive path
//!
//! Safe write helpers used when streaming uploads to the save directory:
//! filename sanitization, collision renaming, disk-full classification and
//! partial-file cleanup.

use crate::{AirDropError, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Reduce an incoming filename to its basename.
///
/// Peers control the part names in an upload, so path components are
/// stripped before any filesystem access. Both separator styles count:
/// `../../etc/passwd` and `..\..\boot.ini` come out as `passwd` and
/// `boot.ini`.
pub fn sanitize_file_name(name: &str) -> String {
    let basename = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .trim()
        .to_string();

    if basename.is_empty() || basename == "." || basename == ".." {
        "unnamed".to_string()
    } else {
        basename
    }
}

/// Pick a target path that doesn't collide with an existing file.
///
/// If `dir/filename` exists, appends ` (1)`, ` (2)`, ... before the
/// extension until a free name is found. With `a.txt` and `a (1).txt`
/// present, a new `a.txt` lands at `a (2).txt`.
pub fn unique_target_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match filename.rfind('.') {
        // Leading dot means a hidden file, not an extension
        Some(pos) if pos > 0 => filename.split_at(pos),
        _ => (filename, ""),
    };

    let mut n = 1u32;
    loop {
        let renamed = format!("{stem} ({n}){ext}");
        let candidate = dir.join(&renamed);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Create a file for writing, creating the parent directory if needed.
pub async fn create_file_safe(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            debug!("creating directory {}", parent.display());
            fs::create_dir_all(parent)
                .await
                .map_err(|e| AirDropError::from_io_error(e, "creating save directory"))?;
        }
    }

    let file = fs::File::create(path)
        .await
        .map_err(|e| AirDropError::from_io_error(e, "creating file"))?;
    debug!("created {}", path.display());
    Ok(file)
}

/// Write a chunk, mapping disk-full conditions to a distinct message.
pub async fn write_file_safe(file: &mut fs::File, data: &[u8]) -> Result<()> {
    file.write_all(data).await.map_err(|e| {
        let msg = e.to_string().to_lowercase();
        if msg.contains("no space") || msg.contains("disk full") {
            AirDropError::Io(std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "disk full during file write",
            ))
        } else {
            AirDropError::Io(e)
        }
    })
}

/// Best-effort removal of a partially written file.
pub async fn cleanup_partial_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path).await {
            warn!("failed to remove partial file {}: {}", path.display(), e);
        } else {
            debug!("removed partial file {}", path.display());
        }
    }
}

/// Apply an ISO-8601 modification time to a written file.
///
/// Unparseable timestamps are logged and skipped; the file keeps its
/// write-time mtime.
pub fn apply_modified_time(path: &Path, iso8601: &str) {
    let parsed = match DateTime::parse_from_rfc3339(iso8601) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(e) => {
            warn!("unparseable timestamp '{iso8601}' for {}: {e}", path.display());
            return;
        }
    };

    let mtime = std::time::UNIX_EPOCH + std::time::Duration::from_millis(
        parsed.timestamp_millis().max(0) as u64,
    );

    match std::fs::File::options().append(true).open(path) {
        Ok(file) => {
            if let Err(e) = file.set_modified(mtime) {
                warn!("failed to set mtime on {}: {e}", path.display());
            }
        }
        Err(e) => warn!("failed to reopen {} for mtime: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_strips_path_components() {
        assert_eq!(sanitize_file_name("photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("..\\..\\boot.ini"), "boot.ini");
        assert_eq!(sanitize_file_name("/abs/path/doc.pdf"), "doc.pdf");
        assert_eq!(sanitize_file_name(""), "unnamed");
        assert_eq!(sanitize_file_name(".."), "unnamed");
    }

    #[test]
    fn test_unique_path_no_collision() {
        let temp = TempDir::new().unwrap();
        let path = unique_target_path(temp.path(), "file.txt");
        assert_eq!(path, temp.path().join("file.txt"));
    }

    #[test]
    fn test_unique_path_increments_deterministically() {
        let temp = TempDir::new().unwrap();
        std::fs::File::create(temp.path().join("a.txt")).unwrap();
        std::fs::File::create(temp.path().join("a (1).txt")).unwrap();

        let path = unique_target_path(temp.path(), "a.txt");
        assert_eq!(path, temp.path().join("a (2).txt"));
    }

    #[test]
    fn test_unique_path_without_extension() {
        let temp = TempDir::new().unwrap();
        std::fs::File::create(temp.path().join("README")).unwrap();

        let path = unique_target_path(temp.path(), "README");
        assert_eq!(path, temp.path().join("README (1)"));
    }

    #[test]
    fn test_unique_path_hidden_file() {
        let temp = TempDir::new().unwrap();
        std::fs::File::create(temp.path().join(".env")).unwrap();

        // The leading dot is part of the name, not an extension
        let path = unique_target_path(temp.path(), ".env");
        assert_eq!(path, temp.path().join(".env (1)"));
    }

    #[tokio::test]
    async fn test_create_file_creates_save_dir() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("incoming/file.bin");

        let mut file = create_file_safe(&path).await.unwrap();
        write_file_safe(&mut file, b"data").await.unwrap();
        drop(file);

        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_cleanup_partial_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("partial.bin");
        std::fs::write(&path, b"half").unwrap();

        cleanup_partial_file(&path).await;
        assert!(!path.exists());

        // Removing a missing file is not an error
        cleanup_partial_file(&path).await;
    }

    #[test]
    fn test_apply_modified_time() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("stamped.txt");
        std::fs::write(&path, b"x").unwrap();

        apply_modified_time(&path, "2024-05-01T12:00:00Z");

        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        let secs = mtime
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert_eq!(secs, 1714564800);
    }
}
