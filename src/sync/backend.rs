// Backend service interface
// The managed backend (relational storage, object storage, realtime feed) is an
// external collaborator. Everything the trackers need from it goes through the
// Backend trait so the same code runs against the real service or MemoryBackend.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::models::{Attachment, Contact, ContactStatus, Message, MessageStatus, PresenceRow, TypingIndicator};

/// Row data for a new attachment record
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub message_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub storage_path: String,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Most recent `limit` messages between the two users, strictly older than
    /// `before` when given, in ascending order. Rows hidden by `user_id` are omitted.
    async fn fetch_messages(
        &self,
        user_id: &str,
        contact_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>>;

    /// Insert a message; the backend assigns id and created_at
    async fn insert_message(&self, sender_id: &str, receiver_id: &str, content: &str) -> Result<Message>;

    /// Replace content and stamp edited_at
    async fn update_message_content(&self, message_id: &str, content: &str) -> Result<Message>;

    /// Soft delete for everyone
    async fn soft_delete_message(&self, message_id: &str) -> Result<Message>;

    /// Record a per-user hide ("delete for me")
    async fn hide_message(&self, user_id: &str, message_id: &str) -> Result<()>;

    /// Soft delete every message between the two users
    async fn soft_delete_conversation(&self, user_id: &str, contact_id: &str) -> Result<()>;

    /// Case-insensitive content search within a conversation, newest first
    async fn search_messages(&self, user_id: &str, contact_id: &str, query: &str, limit: usize) -> Result<Vec<Message>>;

    async fn fetch_statuses(&self, message_ids: &[String]) -> Result<Vec<MessageStatus>>;

    async fn mark_delivered(&self, message_id: &str, user_id: &str) -> Result<MessageStatus>;

    /// Mark every unread status row of `user_id` for messages sent by
    /// `contact_id` as read; returns the rows that changed
    async fn mark_conversation_read(&self, user_id: &str, contact_id: &str) -> Result<Vec<MessageStatus>>;

    async fn update_presence(&self, user_id: &str, online: bool, connection_id: &str) -> Result<()>;

    /// Presence rows joined with each user's visibility preference
    async fn fetch_presence(&self, user_ids: &[String]) -> Result<Vec<PresenceRow>>;

    async fn upsert_typing(&self, user_id: &str, contact_id: &str, typing: bool) -> Result<()>;

    /// Rows owned by `user_id` (user_id == self), any status
    async fn fetch_contacts(&self, user_id: &str) -> Result<Vec<Contact>>;

    /// Pending rows addressed to `user_id` (contact_id == self)
    async fn fetch_contact_requests(&self, user_id: &str) -> Result<Vec<Contact>>;

    async fn insert_contact(&self, user_id: &str, contact_id: &str, status: ContactStatus) -> Result<Contact>;

    /// Update the (user_id -> contact_id) row, optionally only if it currently has `expected` status
    async fn update_contact_status(
        &self,
        user_id: &str,
        contact_id: &str,
        status: ContactStatus,
        expected: Option<ContactStatus>,
    ) -> Result<Contact>;

    async fn delete_contact(&self, user_id: &str, contact_id: &str) -> Result<()>;

    async fn upload_object(&self, path: &str, data: &[u8], content_type: &str) -> Result<()>;

    async fn remove_object(&self, path: &str) -> Result<()>;

    async fn download_object(&self, path: &str) -> Result<Vec<u8>>;

    async fn insert_attachment(&self, attachment: NewAttachment) -> Result<Attachment>;

    async fn fetch_attachment(&self, attachment_id: &str) -> Result<Attachment>;

    async fn delete_attachment_record(&self, attachment_id: &str) -> Result<()>;

    async fn signed_url(&self, path: &str, ttl_secs: u64) -> Result<String>;

    /// Open a realtime feed; the topic is only a coarse server-side filter
    fn subscribe(&self, topic: PushTopic) -> PushFeed;
}

/// Realtime change event
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    MessageInserted(Message),
    MessageUpdated(Message),
    StatusChanged(MessageStatus),
    /// Raw presence change; does not carry the visibility preference
    PresenceChanged {
        user_id: String,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    },
    /// A user changed their "show online status" preference
    VisibilityChanged { user_id: String },
    TypingChanged(TypingIndicator),
}

/// Table + column predicate a feed is filtered by on the server side
#[derive(Debug, Clone, PartialEq)]
pub enum PushTopic {
    /// Message inserts/updates, optionally only from one sender
    Messages { sender_id: Option<String> },
    MessageStatus,
    Presence,
    /// Typing rows written by one user
    Typing { user_id: String },
}

impl PushTopic {
    /// Server-side filter; deliberately coarse, so consumers re-filter
    pub fn matches(&self, event: &PushEvent) -> bool {
        match (self, event) {
            (PushTopic::Messages { sender_id }, PushEvent::MessageInserted(msg))
            | (PushTopic::Messages { sender_id }, PushEvent::MessageUpdated(msg)) => {
                sender_id.as_ref().map_or(true, |s| *s == msg.sender_id)
            }
            (PushTopic::MessageStatus, PushEvent::StatusChanged(_)) => true,
            (PushTopic::Presence, PushEvent::PresenceChanged { .. })
            | (PushTopic::Presence, PushEvent::VisibilityChanged { .. }) => true,
            (PushTopic::Typing { user_id }, PushEvent::TypingChanged(row)) => row.user_id == *user_id,
            _ => false,
        }
    }
}

/// A live subscription to one topic
pub struct PushFeed {
    topic: PushTopic,
    stream: BroadcastStream<PushEvent>,
}

impl PushFeed {
    pub fn new(topic: PushTopic, rx: broadcast::Receiver<PushEvent>) -> Self {
        PushFeed {
            topic,
            stream: BroadcastStream::new(rx),
        }
    }

    pub fn topic(&self) -> &PushTopic {
        &self.topic
    }

    /// Next event matching the topic, or None once the source is gone
    pub async fn next(&mut self) -> Option<PushEvent> {
        while let Some(item) = self.stream.next().await {
            match item {
                Ok(event) if self.topic.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    // Consumers re-fetch state after resubscribing, so lag is recoverable
                    warn!("Push feed {:?} lagged, {} events skipped", self.topic, skipped);
                }
            }
        }
        None
    }
}
