// Client-side synchronization layer for chatsync
// This file serves as the entry point for everything that merges local
// optimistic state with backend fetches and realtime pushes.
// Organized by concern (one tracker per file).

use thiserror::Error;

pub mod attachments;
pub mod backend;
pub mod cache;
pub mod contacts;
pub mod conversation;
pub mod memory;
pub mod message_status;
pub mod message_store;
pub mod presence;
pub mod subscriptions;
pub mod typing;

// Re-export the types callers need most
pub use backend::{Backend, PushEvent, PushFeed, PushTopic};
pub use attachments::AttachmentUploader;
pub use contacts::{AddOutcome, ContactDirectory};
pub use conversation::{ConversationSession, SessionUpdates};
pub use memory::MemoryBackend;
pub use message_status::StatusTracker;
pub use message_store::{ConversationStore, LoadOutcome, SendOutcome};
pub use presence::{ActivityEvent, PresenceTracker};
pub use typing::TypingTracker;

/// Errors surfaced by the synchronization layer
#[derive(Debug, Error)]
pub enum SyncError {
    /// Read failure (initial load, older page, search, status or contact fetch)
    #[error("Failed to load: {0}")]
    Load(String),

    /// A user-initiated send failed; `content` is what the user typed so
    /// the compose field can be restored
    #[error("Failed to send message: {reason}")]
    Send { content: String, reason: String },

    #[error("Message {message_id} can no longer be edited ({age_secs}s old)")]
    EditWindowExpired { message_id: String, age_secs: i64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Message cannot be changed: {0}")]
    NotEditable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Upload still failing after the bounded retries
    #[error("Failed to upload {file_name} after {attempts} attempts: {reason}")]
    AttachmentUpload { file_name: String, attempts: u32, reason: String },

    /// Write failure on a non-send operation
    #[error("Backend error: {0}")]
    Backend(String),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
