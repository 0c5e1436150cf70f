//! Staged vehicle images written by the recognition cameras

use base64::{engine::general_purpose::STANDARD, Engine};
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, warn};

pub async fn file_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

/// Image contents as base64, `None` if the file cannot be read
pub async fn read_base64(path: &Path) -> Option<String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(STANDARD.encode(bytes)),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "staged_image_unreadable");
            None
        }
    }
}

/// Delete a staged image. Returns true if a file was removed.
pub async fn delete(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "staged_image_deleted");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "staged_image_already_gone");
            false
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "staged_image_delete_failed");
            false
        }
    }
}
