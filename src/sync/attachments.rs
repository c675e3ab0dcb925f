// Attachment storage
// Uploads go to object storage first, then an attachment record is written.
// Both steps are remote writes and share one bounded retry loop.

use anyhow::Result;
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tokio::time::Duration;

use crate::config::SyncConfig;
use crate::models::{Attachment, OutgoingAttachment};
use super::backend::{Backend, NewAttachment};
use super::cache;
use super::{SyncError, SyncResult};

static UNSAFE_FILE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9.-]").expect("static file name pattern compiles"));

/// Replace every character outside `[A-Za-z0-9.-]` with `_`
pub fn sanitize_file_name(name: &str) -> String {
    UNSAFE_FILE_CHARS.replace_all(name, "_").into_owned()
}

/// Object storage path: `{owner}/{message_id}/{millis}-{sanitized name}`
pub fn storage_path(owner_id: &str, message_id: &str, file_name: &str) -> String {
    format!(
        "{}/{}/{}-{}",
        owner_id,
        message_id,
        chrono::Utc::now().timestamp_millis(),
        sanitize_file_name(file_name)
    )
}

#[derive(Clone)]
pub struct AttachmentUploader {
    backend: Arc<dyn Backend>,
    max_attempts: u32,
    config: SyncConfig,
}

impl AttachmentUploader {
    pub fn new(backend: Arc<dyn Backend>, config: &SyncConfig) -> Self {
        AttachmentUploader {
            backend,
            max_attempts: config.upload_max_attempts.max(1),
            config: config.clone(),
        }
    }

    /// Upload one file for a confirmed message, retrying with incremental backoff.
    ///
    /// # Arguments
    ///
    /// * `owner_id` - The uploading user
    /// * `message_id` - Server id of the message the file belongs to
    /// * `file` - The file to store
    ///
    /// # Returns
    ///
    /// The stored attachment, or `SyncError::AttachmentUpload` once every attempt failed
    pub async fn upload(&self, owner_id: &str, message_id: &str, file: &OutgoingAttachment) -> SyncResult<Attachment> {
        let path = storage_path(owner_id, message_id, &file.file_name);
        let mut last_error = String::new();
        // Set while an object from an earlier attempt is still at `path`
        let mut object_stored = false;

        for attempt in 1..=self.max_attempts {
            debug!("Uploading {} attempt {}/{}", file.file_name, attempt, self.max_attempts);
            match self.try_upload(message_id, file, &path, &mut object_stored).await {
                Ok(attachment) => {
                    info!("Uploaded {} as {} on attempt {}", file.file_name, attachment.id, attempt);
                    return Ok(attachment);
                }
                Err(e) => {
                    warn!("Upload of {} failed on attempt {}: {}", file.file_name, attempt, e);
                    last_error = e.to_string();
                    if attempt < self.max_attempts {
                        self.backoff(attempt).await;
                    }
                }
            }
        }

        error!("Giving up on {} after {} attempts", file.file_name, self.max_attempts);
        Err(SyncError::AttachmentUpload {
            file_name: file.file_name.clone(),
            attempts: self.max_attempts,
            reason: last_error,
        })
    }

    async fn try_upload(
        &self,
        message_id: &str,
        file: &OutgoingAttachment,
        path: &str,
        object_stored: &mut bool,
    ) -> Result<Attachment> {
        if *object_stored {
            debug!("Object {} already stored, only writing the record", path);
        } else {
            self.backend.upload_object(path, &file.data, &file.file_type).await?;
            *object_stored = true;
        }

        let record = NewAttachment {
            message_id: message_id.to_string(),
            file_name: file.file_name.clone(),
            file_type: file.file_type.clone(),
            file_size: file.data.len() as u64,
            storage_path: path.to_string(),
        };
        match self.backend.insert_attachment(record).await {
            Ok(attachment) => Ok(attachment),
            Err(e) => {
                // Don't leave an orphaned object behind, the next attempt re-uploads it
                match self.backend.remove_object(path).await {
                    Ok(()) => *object_stored = false,
                    Err(cleanup) => error!("Failed to remove orphaned object {}: {}", path, cleanup),
                }
                Err(e)
            }
        }
    }

    async fn backoff(&self, attempt: u32) {
        let base = self.config.upload_backoff(attempt);
        let jitter_ms = base.as_millis() as u64 / 4;
        let jitter = if jitter_ms > 0 { rand::random::<u64>() % (jitter_ms + 1) } else { 0 };
        let delay = base + Duration::from_millis(jitter);
        info!("Retrying upload in {:?}...", delay);
        tokio::time::sleep(delay).await;
    }

    /// Time-limited read URL for a stored attachment
    pub async fn signed_url(&self, attachment: &Attachment) -> SyncResult<String> {
        self.backend
            .signed_url(&attachment.storage_path, self.config.signed_url_ttl_secs)
            .await
            .map_err(|e| SyncError::Load(format!("Failed to generate attachment URL: {}", e)))
    }

    /// File contents, served from the process-wide cache after the first read.
    /// Storage paths are unique per upload, so cached bytes never go stale.
    pub async fn download(&self, attachment: &Attachment) -> SyncResult<Arc<Vec<u8>>> {
        if let Some(bytes) = cache::global().get(&attachment.storage_path) {
            debug!("Cache hit for {}", attachment.storage_path);
            return Ok(bytes);
        }
        let bytes = self
            .backend
            .download_object(&attachment.storage_path)
            .await
            .map_err(|e| SyncError::Load(format!("Failed to download {}: {}", attachment.file_name, e)))?;
        Ok(cache::global().set(&attachment.storage_path, bytes))
    }

    /// Remove the stored object and then the record
    pub async fn delete(&self, attachment_id: &str) -> SyncResult<()> {
        let attachment = self
            .backend
            .fetch_attachment(attachment_id)
            .await
            .map_err(|e| SyncError::NotFound(format!("{} ({})", attachment_id, e)))?;

        if let Err(e) = self.backend.remove_object(&attachment.storage_path).await {
            error!("Failed to delete {} from storage: {}", attachment.storage_path, e);
        }

        self.backend
            .delete_attachment_record(attachment_id)
            .await
            .map_err(|e| SyncError::Backend(e.to_string()))
    }
}
