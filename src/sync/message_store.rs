// Conversation message store
// Keeps the ordered, deduplicated timeline of the one open conversation and
// merges three sources into it: paginated history fetches, optimistic local
// sends, and realtime pushes.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

use crate::config::SyncConfig;
use crate::models::{Message, MessageId, OutgoingAttachment, ATTACHMENT_ONLY_CONTENT, DELETED_PLACEHOLDER};
use super::attachments::AttachmentUploader;
use super::backend::Backend;
use super::{SyncError, SyncResult};

/// Result of a history load
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Page applied; `has_more` is false once a short page was returned
    Loaded { count: usize, has_more: bool },
    /// Guard refused the load; no request was made
    Skipped,
    /// The conversation changed while the request was in flight; result dropped
    Superseded,
}

/// Result of a successful send
#[derive(Debug)]
pub struct SendOutcome {
    pub message: Message,
    /// Attachments that could not be stored after retries
    pub attachment_errors: Vec<SyncError>,
}

#[derive(Default)]
struct StoreState {
    contact_id: Option<String>,
    /// Bumped whenever the conversation is (re)opened or closed
    epoch: u64,
    messages: Vec<Message>,
    initial_loaded: bool,
    anchored_at_bottom: bool,
    has_more: bool,
    loading_older: bool,
    /// Oldest timestamp reached by history pages; pushes never move it
    oldest_paged: Option<DateTime<Utc>>,
}

impl StoreState {
    fn index_of(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id.as_str() == id)
    }

    /// Epoch of the open conversation, if it is still `contact_id`
    fn active_epoch(&self) -> Option<(String, u64)> {
        self.contact_id.clone().map(|c| (c, self.epoch))
    }
}

// ---------------------------------------------------------------------------
// Timeline primitives. The list is always sorted by (created_at, id).
// ---------------------------------------------------------------------------

fn sorted_position(list: &[Message], message: &Message) -> usize {
    list.partition_point(|m| m.cmp_timeline(message).is_lt())
}

/// Move the entry at `index` only if it no longer fits between its neighbours
fn resettle(list: &mut Vec<Message>, index: usize) {
    let fits_left = index == 0 || list[index - 1].cmp_timeline(&list[index]).is_lt();
    let fits_right = index + 1 >= list.len() || list[index].cmp_timeline(&list[index + 1]).is_lt();
    if fits_left && fits_right {
        return;
    }
    let entry = list.remove(index);
    let position = sorted_position(list, &entry);
    list.insert(position, entry);
}

/// Insert a message or update the existing entry with the same id.
/// Returns true when a new entry was added.
fn upsert(list: &mut Vec<Message>, message: Message) -> bool {
    if let Some(index) = list.iter().position(|m| m.id.as_str() == message.id.as_str()) {
        list[index] = message;
        resettle(list, index);
        return false;
    }
    let position = sorted_position(list, &message);
    list.insert(position, message);
    true
}

/// Prepend an older page as one block
fn prepend_block(list: &mut Vec<Message>, mut older: Vec<Message>) -> usize {
    older.retain(|m| !list.iter().any(|e| e.id.as_str() == m.id.as_str()));
    older.sort_by(|a, b| a.cmp_timeline(b));
    let count = older.len();
    let overlaps = match (older.last(), list.first()) {
        (Some(last), Some(first)) => !last.cmp_timeline(first).is_lt(),
        _ => false,
    };
    list.splice(0..0, older);
    if overlaps {
        warn!("Older page overlaps the loaded timeline, re-sorting");
        list.sort_by(|a, b| a.cmp_timeline(b));
    }
    count
}

/// Swap an optimistic placeholder for its confirmed row
fn confirm(list: &mut Vec<Message>, temp_id: &str, confirmed: Message) {
    let placeholder = list.iter().position(|m| m.id.as_str() == temp_id);
    let existing = list.iter().position(|m| m.id.as_str() == confirmed.id.as_str());

    match (placeholder, existing) {
        (Some(p), Some(_)) => {
            // A push for this message beat the confirmation
            list.remove(p);
            upsert(list, confirmed);
        }
        (Some(p), None) => {
            list[p] = confirmed;
            resettle(list, p);
        }
        (None, _) => debug!("Placeholder {} already gone, dropping confirmation", temp_id),
    }
}

// ---------------------------------------------------------------------------

/// Timeline for one open conversation between `self_id` and a contact
#[derive(Clone)]
pub struct ConversationStore {
    backend: Arc<dyn Backend>,
    uploader: AttachmentUploader,
    self_id: String,
    edit_window: chrono::Duration,
    search_limit: usize,
    state: Arc<TokioMutex<StoreState>>,
}

impl ConversationStore {
    pub fn new(backend: Arc<dyn Backend>, self_id: &str, config: &SyncConfig) -> Self {
        ConversationStore {
            uploader: AttachmentUploader::new(backend.clone(), config),
            backend,
            self_id: self_id.to_string(),
            edit_window: config.edit_window(),
            search_limit: config.search_limit,
            state: Arc::new(TokioMutex::new(StoreState::default())),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn uploader(&self) -> &AttachmentUploader {
        &self.uploader
    }

    /// Fetch the most recent `page_size` messages with `contact_id`.
    ///
    /// Always resets the store first, so calling it again for the same
    /// contact starts over. Pushes arriving while the fetch is in flight are
    /// merged with the fetched page rather than overwritten.
    pub async fn load_initial(&self, contact_id: &str, page_size: usize) -> SyncResult<LoadOutcome> {
        let epoch = {
            let mut state = self.state.lock().await;
            state.epoch += 1;
            state.contact_id = Some(contact_id.to_string());
            state.messages.clear();
            state.initial_loaded = false;
            state.anchored_at_bottom = false;
            state.has_more = false;
            state.loading_older = false;
            state.oldest_paged = None;
            state.epoch
        };

        info!("Loading last {} messages with {}", page_size, contact_id);
        let result = self.backend.fetch_messages(&self.self_id, contact_id, page_size, None).await;

        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            debug!("Initial load for {} superseded", contact_id);
            return Ok(LoadOutcome::Superseded);
        }
        let rows = result.map_err(|e| {
            error!("Failed to load messages with {}: {}", contact_id, e);
            SyncError::Load(e.to_string())
        })?;

        let count = rows.len();
        let has_more = count >= page_size;
        state.oldest_paged = rows.iter().map(|m| m.created_at).min();
        for row in rows {
            upsert(&mut state.messages, row);
        }
        state.initial_loaded = true;
        state.has_more = has_more;
        info!("Loaded {} messages with {} (has_more={})", count, contact_id, has_more);
        Ok(LoadOutcome::Loaded { count, has_more })
    }

    /// Called by the view once the initial page is rendered and scrolled to the bottom.
    /// Older pages are refused until then.
    pub async fn mark_anchored_at_bottom(&self) {
        let mut state = self.state.lock().await;
        if state.initial_loaded {
            state.anchored_at_bottom = true;
        }
    }

    /// Load the page before the oldest paged message
    pub async fn load_older(&self, page_size: usize) -> SyncResult<LoadOutcome> {
        let boundary = {
            let state = self.state.lock().await;
            match state.oldest_paged {
                Some(oldest) => oldest,
                None => return Ok(LoadOutcome::Skipped),
            }
        };
        self.load_older_before(boundary, page_size).await
    }

    /// Load up to `page_size` messages strictly older than `before` and prepend them.
    ///
    /// Skipped without a request unless the initial page is loaded, the view is
    /// anchored, history is not exhausted and no other older load is running.
    pub async fn load_older_before(&self, before: DateTime<Utc>, page_size: usize) -> SyncResult<LoadOutcome> {
        let (contact_id, epoch) = {
            let mut state = self.state.lock().await;
            let ready = state.initial_loaded && state.anchored_at_bottom && state.has_more && !state.loading_older;
            match state.active_epoch() {
                Some(active) if ready => {
                    state.loading_older = true;
                    active
                }
                _ => {
                    debug!("Older page skipped (loaded={}, anchored={}, has_more={}, busy={})",
                        state.initial_loaded, state.anchored_at_bottom, state.has_more, state.loading_older);
                    return Ok(LoadOutcome::Skipped);
                }
            }
        };

        let result = self
            .backend
            .fetch_messages(&self.self_id, &contact_id, page_size, Some(before))
            .await;

        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            debug!("Older page for {} superseded", contact_id);
            return Ok(LoadOutcome::Superseded);
        }
        state.loading_older = false;
        let rows = result.map_err(|e| {
            error!("Failed to load older messages with {}: {}", contact_id, e);
            SyncError::Load(e.to_string())
        })?;

        let has_more = rows.len() >= page_size;
        if let Some(oldest) = rows.iter().map(|m| m.created_at).min() {
            state.oldest_paged = Some(state.oldest_paged.map_or(oldest, |o| o.min(oldest)));
        }
        let count = prepend_block(&mut state.messages, rows);
        state.has_more = has_more;
        info!("Prepended {} older messages with {} (has_more={})", count, contact_id, has_more);
        Ok(LoadOutcome::Loaded { count, has_more })
    }

    /// Send a message with optional attachments.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when there is nothing to send (blank text and no files);
    /// no placeholder is created and nothing is written. On failure the
    /// placeholder is removed and `SyncError::Send` carries the typed content.
    pub async fn send(&self, content: &str, attachments: Vec<OutgoingAttachment>) -> SyncResult<Option<SendOutcome>> {
        let text = content.trim();
        if text.is_empty() && attachments.is_empty() {
            debug!("Ignoring empty send");
            return Ok(None);
        }
        let body = if text.is_empty() { ATTACHMENT_ONLY_CONTENT } else { text };

        let (contact_id, epoch, temp_id) = {
            let mut state = self.state.lock().await;
            let (contact_id, epoch) = state
                .active_epoch()
                .ok_or_else(|| SyncError::InvalidInput("no conversation is open".to_string()))?;
            let placeholder = Message {
                id: MessageId::new_pending(),
                sender_id: self.self_id.clone(),
                receiver_id: contact_id.clone(),
                content: body.to_string(),
                created_at: Utc::now(),
                edited_at: None,
                deleted: false,
                attachments: Vec::new(),
            };
            let temp_id = placeholder.id.as_str().to_string();
            upsert(&mut state.messages, placeholder);
            (contact_id, epoch, temp_id)
        };
        debug!("Added placeholder {} for message to {}", temp_id, contact_id);

        let mut confirmed = match self.backend.insert_message(&self.self_id, &contact_id, body).await {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to send message to {}: {}", contact_id, e);
                let mut state = self.state.lock().await;
                if state.epoch == epoch {
                    if let Some(index) = state.index_of(&temp_id) {
                        state.messages.remove(index);
                    }
                }
                return Err(SyncError::Send {
                    content: content.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        info!("Message {} confirmed as {}", temp_id, confirmed.id);

        let mut attachment_errors = Vec::new();
        for file in &attachments {
            match self.uploader.upload(&self.self_id, confirmed.id.as_str(), file).await {
                Ok(stored) => confirmed.attachments.push(stored),
                Err(e) => attachment_errors.push(e),
            }
        }

        let mut state = self.state.lock().await;
        if state.epoch == epoch {
            confirm(&mut state.messages, &temp_id, confirmed.clone());
        } else {
            debug!("Conversation changed before {} was confirmed", temp_id);
        }
        Ok(Some(SendOutcome {
            message: confirmed,
            attachment_errors,
        }))
    }

    /// Apply a realtime insert. Returns true when a new entry was added.
    pub async fn receive_push(&self, message: Message) -> bool {
        let mut state = self.state.lock().await;
        let belongs = match &state.contact_id {
            Some(contact_id) => message.is_between(&self.self_id, contact_id),
            None => false,
        };
        if !belongs {
            return false;
        }
        debug!("Push for message {}", message.id);
        upsert(&mut state.messages, message)
    }

    /// Apply a realtime update (edit or delete by either participant).
    /// Unknown ids are ignored.
    pub async fn receive_update(&self, message: Message) -> bool {
        let mut state = self.state.lock().await;
        match state.index_of(message.id.as_str()) {
            Some(index) => {
                let entry = &mut state.messages[index];
                entry.content = message.content;
                entry.edited_at = message.edited_at;
                entry.deleted = message.deleted;
                if !message.attachments.is_empty() {
                    entry.attachments = message.attachments;
                }
                true
            }
            None => false,
        }
    }

    /// Edit one of our own messages within the edit window
    pub async fn edit(&self, message_id: &str, new_content: &str) -> SyncResult<Message> {
        let text = new_content.trim();
        if text.is_empty() {
            return Err(SyncError::InvalidInput("edited content is empty".to_string()));
        }

        let epoch = {
            let state = self.state.lock().await;
            let index = state
                .index_of(message_id)
                .ok_or_else(|| SyncError::NotFound(message_id.to_string()))?;
            let entry = &state.messages[index];
            if entry.id.is_pending() {
                return Err(SyncError::NotEditable("message is not confirmed yet".to_string()));
            }
            if entry.sender_id != self.self_id {
                return Err(SyncError::NotEditable("message was sent by someone else".to_string()));
            }
            if entry.deleted {
                return Err(SyncError::NotEditable("message was deleted".to_string()));
            }
            let age = Utc::now() - entry.created_at;
            if age > self.edit_window {
                return Err(SyncError::EditWindowExpired {
                    message_id: message_id.to_string(),
                    age_secs: age.num_seconds(),
                });
            }
            state.epoch
        };

        let updated = self
            .backend
            .update_message_content(message_id, text)
            .await
            .map_err(|e| SyncError::Backend(e.to_string()))?;

        let mut state = self.state.lock().await;
        if state.epoch == epoch {
            if let Some(index) = state.index_of(message_id) {
                let entry = &mut state.messages[index];
                entry.content = updated.content.clone();
                entry.edited_at = updated.edited_at;
            }
        }
        info!("Edited message {}", message_id);
        Ok(updated)
    }

    /// Soft delete one of our own messages for both participants.
    /// The entry stays in place with the deleted placeholder text.
    pub async fn delete_for_everyone(&self, message_id: &str) -> SyncResult<()> {
        let epoch = {
            let state = self.state.lock().await;
            let index = state
                .index_of(message_id)
                .ok_or_else(|| SyncError::NotFound(message_id.to_string()))?;
            let entry = &state.messages[index];
            if entry.id.is_pending() {
                return Err(SyncError::NotEditable("message is not confirmed yet".to_string()));
            }
            if entry.sender_id != self.self_id {
                return Err(SyncError::NotEditable("message was sent by someone else".to_string()));
            }
            state.epoch
        };

        self.backend
            .soft_delete_message(message_id)
            .await
            .map_err(|e| SyncError::Backend(e.to_string()))?;

        let mut state = self.state.lock().await;
        if state.epoch == epoch {
            if let Some(index) = state.index_of(message_id) {
                let entry = &mut state.messages[index];
                entry.deleted = true;
                entry.content = DELETED_PLACEHOLDER.to_string();
            }
        }
        info!("Deleted message {} for everyone", message_id);
        Ok(())
    }

    /// Hide a message from our own view. The hide is recorded server-side so
    /// later loads omit it; the other participant is unaffected.
    pub async fn delete_for_me(&self, message_id: &str) -> SyncResult<()> {
        let epoch = {
            let state = self.state.lock().await;
            let index = state
                .index_of(message_id)
                .ok_or_else(|| SyncError::NotFound(message_id.to_string()))?;
            if state.messages[index].id.is_pending() {
                return Err(SyncError::NotEditable("message is not confirmed yet".to_string()));
            }
            state.epoch
        };

        self.backend
            .hide_message(&self.self_id, message_id)
            .await
            .map_err(|e| SyncError::Backend(e.to_string()))?;

        let mut state = self.state.lock().await;
        if state.epoch == epoch {
            if let Some(index) = state.index_of(message_id) {
                state.messages.remove(index);
            }
        }
        info!("Hid message {} for {}", message_id, self.self_id);
        Ok(())
    }

    /// Empty the timeline immediately and soft delete the conversation on the
    /// server. A server failure is logged and not rolled back.
    pub async fn clear_conversation(&self) -> SyncResult<()> {
        let contact_id = {
            let mut state = self.state.lock().await;
            let (contact_id, _) = state
                .active_epoch()
                .ok_or_else(|| SyncError::InvalidInput("no conversation is open".to_string()))?;
            state.messages.clear();
            state.has_more = false;
            state.oldest_paged = None;
            contact_id
        };

        match self.backend.soft_delete_conversation(&self.self_id, &contact_id).await {
            Ok(()) => info!("Cleared conversation with {}", contact_id),
            Err(e) => error!("Failed to clear conversation with {} on the server: {}", contact_id, e),
        }
        Ok(())
    }

    /// Search the open conversation, newest first
    pub async fn search(&self, query: &str) -> SyncResult<Vec<Message>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let contact_id = self
            .contact_id()
            .await
            .ok_or_else(|| SyncError::InvalidInput("no conversation is open".to_string()))?;
        self.backend
            .search_messages(&self.self_id, &contact_id, query, self.search_limit)
            .await
            .map_err(|e| SyncError::Load(e.to_string()))
    }

    /// Forget the open conversation; in-flight results for it are dropped
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.epoch += 1;
        state.contact_id = None;
        state.messages.clear();
        state.initial_loaded = false;
        state.anchored_at_bottom = false;
        state.has_more = false;
        state.loading_older = false;
        state.oldest_paged = None;
    }

    /// Snapshot of the timeline, oldest first
    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.messages.clone()
    }

    /// Server ids of every confirmed entry
    pub async fn confirmed_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .messages
            .iter()
            .filter(|m| !m.id.is_pending())
            .map(|m| m.id.as_str().to_string())
            .collect()
    }

    pub async fn get(&self, message_id: &str) -> Option<Message> {
        let state = self.state.lock().await;
        state.index_of(message_id).map(|i| state.messages[i].clone())
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.messages.is_empty()
    }

    pub async fn has_more(&self) -> bool {
        self.state.lock().await.has_more
    }

    pub async fn contact_id(&self) -> Option<String> {
        self.state.lock().await.contact_id.clone()
    }

    pub async fn epoch(&self) -> u64 {
        self.state.lock().await.epoch
    }
}
