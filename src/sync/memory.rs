// In-process backend
// Holds every table in memory and publishes realtime events on a broadcast
// channel. Used by the demo binary and the test-suite; supports failure
// injection and per-operation request counters.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as TokioMutex};
use tokio::time::Duration;

use crate::models::{
    Attachment, Contact, ContactStatus, Message, MessageStatus, PresenceRow, TypingIndicator,
    DELETED_PLACEHOLDER,
};
use super::backend::{Backend, NewAttachment, PushEvent, PushFeed, PushTopic};

/// Backend operations, for counting requests and injecting failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    FetchMessages,
    InsertMessage,
    UpdateMessage,
    DeleteMessage,
    HideMessage,
    DeleteConversation,
    SearchMessages,
    FetchStatuses,
    MarkDelivered,
    MarkRead,
    UpdatePresence,
    FetchPresence,
    UpsertTyping,
    FetchContacts,
    FetchRequests,
    InsertContact,
    UpdateContact,
    DeleteContact,
    UploadObject,
    RemoveObject,
    DownloadObject,
    InsertAttachment,
    FetchAttachment,
    DeleteAttachment,
    SignedUrl,
}

#[derive(Debug, Clone)]
struct Session {
    online: bool,
    last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    messages: Vec<Message>,
    hidden: HashSet<(String, String)>,
    statuses: HashMap<String, MessageStatus>,
    sessions: HashMap<String, HashMap<String, Session>>,
    visibility: HashMap<String, bool>,
    typing: HashMap<(String, String), TypingIndicator>,
    contacts: Vec<Contact>,
    objects: HashMap<String, Vec<u8>>,
    attachments: Vec<Attachment>,
    failures: HashMap<Op, u32>,
    requests: HashMap<Op, u32>,
    latency: HashMap<Op, Duration>,
}

impl State {
    /// Count the request and fail it if a failure was injected
    fn begin(&mut self, op: Op) -> Result<()> {
        *self.requests.entry(op).or_insert(0) += 1;
        if let Some(remaining) = self.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                debug!("Injected failure for {:?}", op);
                return Err(anyhow!("simulated backend failure in {:?}", op));
            }
        }
        Ok(())
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:08}", prefix, self.next_id)
    }

    fn with_attachments(&self, message: &Message) -> Message {
        let mut message = message.clone();
        message.attachments = self
            .attachments
            .iter()
            .filter(|a| a.message_id == message.id.as_str())
            .cloned()
            .collect();
        message
    }

    fn message_mut(&mut self, message_id: &str) -> Result<&mut Message> {
        self.messages
            .iter_mut()
            .find(|m| m.id.as_str() == message_id)
            .ok_or_else(|| anyhow!("no message with id {}", message_id))
    }

    fn presence_row(&self, user_id: &str) -> Option<PresenceRow> {
        let sessions = self.sessions.get(user_id)?;
        let latest = sessions.iter().max_by_key(|(_, s)| s.last_seen)?;
        Some(PresenceRow {
            user_id: user_id.to_string(),
            online: sessions.values().any(|s| s.online),
            last_seen: Some(latest.1.last_seen),
            connection_id: Some(latest.0.clone()),
            show_online_status: self.visibility.get(user_id).copied().unwrap_or(true),
        })
    }
}

/// Shared in-memory backend; clones see the same tables and feed
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<TokioMutex<State>>,
    events: broadcast::Sender<PushEvent>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(256)
    }
}

impl MemoryBackend {
    pub fn new(push_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(push_buffer.max(1));
        MemoryBackend {
            state: Arc::new(TokioMutex::new(State::default())),
            events,
        }
    }

    fn publish(&self, event: PushEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    /// Make the next `times` calls of `op` fail
    pub async fn fail_next(&self, op: Op, times: u32) {
        self.state.lock().await.failures.insert(op, times);
    }

    /// Delay every call of `op` by `latency` before it touches any table
    pub async fn set_latency(&self, op: Op, latency: Duration) {
        self.state.lock().await.latency.insert(op, latency);
    }

    async fn simulate_latency(&self, op: Op) {
        let latency = self.state.lock().await.latency.get(&op).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    pub async fn request_count(&self, op: Op) -> u32 {
        self.state.lock().await.requests.get(&op).copied().unwrap_or(0)
    }

    /// Insert a message with an explicit creation time, without publishing
    pub async fn seed_message(&self, sender_id: &str, receiver_id: &str, content: &str, created_at: DateTime<Utc>) -> Message {
        let mut state = self.state.lock().await;
        let id = state.next_id("msg");
        let message = Message::confirmed(&id, sender_id, receiver_id, content, created_at);
        state.messages.push(message.clone());
        state.statuses.insert(id.clone(), MessageStatus::new(&id, receiver_id));
        message
    }

    /// Insert a message and publish it, as if another client had sent it at `created_at`
    pub async fn push_message(&self, sender_id: &str, receiver_id: &str, content: &str, created_at: DateTime<Utc>) -> Message {
        let message = self.seed_message(sender_id, receiver_id, content, created_at).await;
        self.publish(PushEvent::MessageInserted(message.clone()));
        message
    }

    /// Change a user's "show online status" profile preference
    pub async fn set_online_visibility(&self, user_id: &str, visible: bool) {
        self.state.lock().await.visibility.insert(user_id.to_string(), visible);
        self.publish(PushEvent::VisibilityChanged { user_id: user_id.to_string() });
    }

    pub async fn stored_message(&self, message_id: &str) -> Option<Message> {
        let state = self.state.lock().await;
        state.messages.iter().find(|m| m.id.as_str() == message_id).map(|m| state.with_attachments(m))
    }

    pub async fn typing_row(&self, user_id: &str, contact_id: &str) -> Option<TypingIndicator> {
        self.state
            .lock()
            .await
            .typing
            .get(&(user_id.to_string(), contact_id.to_string()))
            .cloned()
    }

    pub async fn status_row(&self, message_id: &str) -> Option<MessageStatus> {
        self.state.lock().await.statuses.get(message_id).cloned()
    }

    pub async fn contact_row(&self, user_id: &str, contact_id: &str) -> Option<Contact> {
        self.state
            .lock()
            .await
            .contacts
            .iter()
            .find(|c| c.user_id == user_id && c.contact_id == contact_id)
            .cloned()
    }

    pub async fn object_exists(&self, path: &str) -> bool {
        self.state.lock().await.objects.contains_key(path)
    }

    /// Publish a raw event, e.g. a stale or out-of-order status payload
    pub fn inject(&self, event: PushEvent) {
        self.publish(event);
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn fetch_messages(
        &self,
        user_id: &str,
        contact_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        self.simulate_latency(Op::FetchMessages).await;
        let mut state = self.state.lock().await;
        state.begin(Op::FetchMessages)?;
        let mut rows: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.is_between(user_id, contact_id))
            .filter(|m| !state.hidden.contains(&(user_id.to_string(), m.id.as_str().to_string())))
            .filter(|m| before.map_or(true, |b| m.created_at < b))
            .map(|m| state.with_attachments(m))
            .collect();
        rows.sort_by(|a, b| a.cmp_timeline(b));
        let skip = rows.len().saturating_sub(limit);
        Ok(rows.split_off(skip))
    }

    async fn insert_message(&self, sender_id: &str, receiver_id: &str, content: &str) -> Result<Message> {
        self.simulate_latency(Op::InsertMessage).await;
        let message = {
            let mut state = self.state.lock().await;
            state.begin(Op::InsertMessage)?;
            let id = state.next_id("msg");
            let message = Message::confirmed(&id, sender_id, receiver_id, content, Utc::now());
            state.messages.push(message.clone());
            state.statuses.insert(id.clone(), MessageStatus::new(&id, receiver_id));
            message
        };
        self.publish(PushEvent::MessageInserted(message.clone()));
        self.publish(PushEvent::StatusChanged(MessageStatus::new(message.id.as_str(), receiver_id)));
        Ok(message)
    }

    async fn update_message_content(&self, message_id: &str, content: &str) -> Result<Message> {
        let updated = {
            let mut state = self.state.lock().await;
            state.begin(Op::UpdateMessage)?;
            let message = state.message_mut(message_id)?;
            message.content = content.to_string();
            message.edited_at = Some(Utc::now());
            let message = message.clone();
            state.with_attachments(&message)
        };
        self.publish(PushEvent::MessageUpdated(updated.clone()));
        Ok(updated)
    }

    async fn soft_delete_message(&self, message_id: &str) -> Result<Message> {
        let updated = {
            let mut state = self.state.lock().await;
            state.begin(Op::DeleteMessage)?;
            let message = state.message_mut(message_id)?;
            message.deleted = true;
            message.content = DELETED_PLACEHOLDER.to_string();
            let message = message.clone();
            state.with_attachments(&message)
        };
        self.publish(PushEvent::MessageUpdated(updated.clone()));
        Ok(updated)
    }

    async fn hide_message(&self, user_id: &str, message_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.begin(Op::HideMessage)?;
        state.message_mut(message_id)?;
        state.hidden.insert((user_id.to_string(), message_id.to_string()));
        Ok(())
    }

    async fn soft_delete_conversation(&self, user_id: &str, contact_id: &str) -> Result<()> {
        let updated: Vec<Message> = {
            let mut state = self.state.lock().await;
            state.begin(Op::DeleteConversation)?;
            state
                .messages
                .iter_mut()
                .filter(|m| m.is_between(user_id, contact_id) && !m.deleted)
                .map(|m| {
                    m.deleted = true;
                    m.content = DELETED_PLACEHOLDER.to_string();
                    m.clone()
                })
                .collect()
        };
        for message in updated {
            self.publish(PushEvent::MessageUpdated(message));
        }
        Ok(())
    }

    async fn search_messages(&self, user_id: &str, contact_id: &str, query: &str, limit: usize) -> Result<Vec<Message>> {
        let mut state = self.state.lock().await;
        state.begin(Op::SearchMessages)?;
        let needle = query.to_lowercase();
        let mut rows: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.is_between(user_id, contact_id) && !m.deleted)
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.cmp_timeline(a));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn fetch_statuses(&self, message_ids: &[String]) -> Result<Vec<MessageStatus>> {
        let mut state = self.state.lock().await;
        state.begin(Op::FetchStatuses)?;
        Ok(message_ids.iter().filter_map(|id| state.statuses.get(id).cloned()).collect())
    }

    async fn mark_delivered(&self, message_id: &str, user_id: &str) -> Result<MessageStatus> {
        let row = {
            let mut state = self.state.lock().await;
            state.begin(Op::MarkDelivered)?;
            let row = state
                .statuses
                .get_mut(message_id)
                .filter(|s| s.user_id == user_id)
                .ok_or_else(|| anyhow!("no status row for {} / {}", message_id, user_id))?;
            if row.delivered_at.is_none() {
                row.delivered_at = Some(Utc::now());
            }
            row.clone()
        };
        self.publish(PushEvent::StatusChanged(row.clone()));
        Ok(row)
    }

    async fn mark_conversation_read(&self, user_id: &str, contact_id: &str) -> Result<Vec<MessageStatus>> {
        let changed: Vec<MessageStatus> = {
            let mut state = self.state.lock().await;
            state.begin(Op::MarkRead)?;
            let incoming: HashSet<String> = state
                .messages
                .iter()
                .filter(|m| m.sender_id == contact_id && m.receiver_id == user_id)
                .map(|m| m.id.as_str().to_string())
                .collect();
            let now = Utc::now();
            state
                .statuses
                .values_mut()
                .filter(|s| s.user_id == user_id && s.read_at.is_none() && incoming.contains(&s.message_id))
                .map(|s| {
                    s.read_at = Some(now);
                    s.clone()
                })
                .collect()
        };
        for row in &changed {
            self.publish(PushEvent::StatusChanged(row.clone()));
        }
        Ok(changed)
    }

    async fn update_presence(&self, user_id: &str, online: bool, connection_id: &str) -> Result<()> {
        let (online, last_seen) = {
            let mut state = self.state.lock().await;
            state.begin(Op::UpdatePresence)?;
            state
                .sessions
                .entry(user_id.to_string())
                .or_default()
                .insert(connection_id.to_string(), Session { online, last_seen: Utc::now() });
            match state.presence_row(user_id) {
                Some(row) => (row.online, row.last_seen),
                None => (online, None),
            }
        };
        self.publish(PushEvent::PresenceChanged {
            user_id: user_id.to_string(),
            online,
            last_seen,
        });
        Ok(())
    }

    async fn fetch_presence(&self, user_ids: &[String]) -> Result<Vec<PresenceRow>> {
        let mut state = self.state.lock().await;
        state.begin(Op::FetchPresence)?;
        Ok(user_ids.iter().filter_map(|id| state.presence_row(id)).collect())
    }

    async fn upsert_typing(&self, user_id: &str, contact_id: &str, typing: bool) -> Result<()> {
        let row = TypingIndicator {
            user_id: user_id.to_string(),
            contact_id: contact_id.to_string(),
            typing,
            updated_at: Utc::now(),
        };
        {
            let mut state = self.state.lock().await;
            state.begin(Op::UpsertTyping)?;
            state.typing.insert((user_id.to_string(), contact_id.to_string()), row.clone());
        }
        self.publish(PushEvent::TypingChanged(row));
        Ok(())
    }

    async fn fetch_contacts(&self, user_id: &str) -> Result<Vec<Contact>> {
        let mut state = self.state.lock().await;
        state.begin(Op::FetchContacts)?;
        Ok(state.contacts.iter().filter(|c| c.user_id == user_id).cloned().collect())
    }

    async fn fetch_contact_requests(&self, user_id: &str) -> Result<Vec<Contact>> {
        let mut state = self.state.lock().await;
        state.begin(Op::FetchRequests)?;
        Ok(state
            .contacts
            .iter()
            .filter(|c| c.contact_id == user_id && c.status == ContactStatus::Pending)
            .cloned()
            .collect())
    }

    async fn insert_contact(&self, user_id: &str, contact_id: &str, status: ContactStatus) -> Result<Contact> {
        let mut state = self.state.lock().await;
        state.begin(Op::InsertContact)?;
        if state.contacts.iter().any(|c| c.user_id == user_id && c.contact_id == contact_id) {
            return Err(anyhow!("contact row {} -> {} already exists", user_id, contact_id));
        }
        let now = Utc::now();
        let row = Contact {
            user_id: user_id.to_string(),
            contact_id: contact_id.to_string(),
            status,
            created_at: now,
            updated_at: now,
        };
        state.contacts.push(row.clone());
        Ok(row)
    }

    async fn update_contact_status(
        &self,
        user_id: &str,
        contact_id: &str,
        status: ContactStatus,
        expected: Option<ContactStatus>,
    ) -> Result<Contact> {
        let mut state = self.state.lock().await;
        state.begin(Op::UpdateContact)?;
        let row = state
            .contacts
            .iter_mut()
            .find(|c| c.user_id == user_id && c.contact_id == contact_id && expected.map_or(true, |e| c.status == e))
            .ok_or_else(|| anyhow!("no matching contact row {} -> {}", user_id, contact_id))?;
        row.status = status;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn delete_contact(&self, user_id: &str, contact_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.begin(Op::DeleteContact)?;
        state.contacts.retain(|c| !(c.user_id == user_id && c.contact_id == contact_id));
        Ok(())
    }

    async fn upload_object(&self, path: &str, data: &[u8], _content_type: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.begin(Op::UploadObject)?;
        if state.objects.contains_key(path) {
            return Err(anyhow!("object {} already exists", path));
        }
        state.objects.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn remove_object(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.begin(Op::RemoveObject)?;
        state.objects.remove(path);
        Ok(())
    }

    async fn download_object(&self, path: &str) -> Result<Vec<u8>> {
        let mut state = self.state.lock().await;
        state.begin(Op::DownloadObject)?;
        state
            .objects
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("object {} not found", path))
    }

    async fn insert_attachment(&self, attachment: NewAttachment) -> Result<Attachment> {
        let mut state = self.state.lock().await;
        state.begin(Op::InsertAttachment)?;
        let row = Attachment {
            id: state.next_id("att"),
            message_id: attachment.message_id,
            file_name: attachment.file_name,
            file_type: attachment.file_type,
            file_size: attachment.file_size,
            storage_path: attachment.storage_path,
            created_at: Utc::now(),
        };
        state.attachments.push(row.clone());
        Ok(row)
    }

    async fn fetch_attachment(&self, attachment_id: &str) -> Result<Attachment> {
        let mut state = self.state.lock().await;
        state.begin(Op::FetchAttachment)?;
        state
            .attachments
            .iter()
            .find(|a| a.id == attachment_id)
            .cloned()
            .ok_or_else(|| anyhow!("no attachment with id {}", attachment_id))
    }

    async fn delete_attachment_record(&self, attachment_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.begin(Op::DeleteAttachment)?;
        state.attachments.retain(|a| a.id != attachment_id);
        Ok(())
    }

    async fn signed_url(&self, path: &str, ttl_secs: u64) -> Result<String> {
        let mut state = self.state.lock().await;
        state.begin(Op::SignedUrl)?;
        if !state.objects.contains_key(path) {
            return Err(anyhow!("object {} not found", path));
        }
        Ok(format!("memory://attachments/{}?token={}&expires_in={}", path, uuid::Uuid::new_v4(), ttl_secs))
    }

    fn subscribe(&self, topic: PushTopic) -> PushFeed {
        PushFeed::new(topic, self.events.subscribe())
    }
}
