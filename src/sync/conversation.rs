// Open conversation
// Ties the message store, receipt tracking and typing indicators to the one
// conversation the user has open, and routes realtime events to them.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::models::{DeliveryStatus, Message, MessageStatus, OutgoingAttachment, TypingIndicator};
use super::backend::{Backend, PushEvent, PushFeed, PushTopic};
use super::message_status::StatusTracker;
use super::message_store::{ConversationStore, LoadOutcome, SendOutcome};
use super::typing::TypingTracker;
use super::{SyncError, SyncResult};

/// Channels carrying merged updates for the UI
pub struct SessionUpdates {
    pub statuses: mpsc::Receiver<MessageStatus>,
    pub typing: mpsc::Receiver<TypingIndicator>,
}

#[derive(Clone)]
pub struct ConversationSession {
    backend: Arc<dyn Backend>,
    self_id: String,
    page_size: usize,
    store: ConversationStore,
    status: StatusTracker,
    typing: TypingTracker,
    listeners: Arc<TokioMutex<Vec<JoinHandle<()>>>>,
}

impl ConversationSession {
    pub fn new(backend: Arc<dyn Backend>, self_id: &str, config: &SyncConfig) -> (Self, SessionUpdates) {
        let (status, statuses) = StatusTracker::new(backend.clone(), self_id);
        let (typing, typing_rx) = TypingTracker::new(backend.clone(), self_id, config);
        let session = ConversationSession {
            store: ConversationStore::new(backend.clone(), self_id, config),
            backend,
            self_id: self_id.to_string(),
            page_size: config.page_size.max(1),
            status,
            typing,
            listeners: Arc::new(TokioMutex::new(Vec::new())),
        };
        (session, SessionUpdates { statuses, typing: typing_rx })
    }

    /// Open the conversation with `contact_id`, replacing any open one.
    ///
    /// Feeds are attached before the initial fetch so nothing pushed while
    /// it is in flight is lost. Opening marks the conversation read.
    pub async fn open(&self, contact_id: &str) -> SyncResult<LoadOutcome> {
        let contact_id = contact_id.trim();
        if contact_id.is_empty() || contact_id == self.self_id {
            return Err(SyncError::InvalidInput(format!("cannot open a conversation with '{}'", contact_id)));
        }
        self.detach().await;
        info!("Opening conversation {} <-> {}", self.self_id, contact_id);

        let messages = self.backend.subscribe(PushTopic::Messages { sender_id: None });
        let statuses = self.status.subscribe();
        let typing = self.typing.watch(contact_id).await;
        {
            let mut listeners = self.listeners.lock().await;
            listeners.push(self.spawn_pump(messages));
            listeners.push(self.spawn_pump(statuses));
            listeners.push(self.spawn_pump(typing));
        }

        let outcome = self.store.load_initial(contact_id, self.page_size).await?;
        if outcome == LoadOutcome::Superseded {
            return Ok(outcome);
        }
        self.retrack().await;
        self.mark_read(contact_id).await;
        Ok(outcome)
    }

    /// Close the open conversation; late results for it are dropped
    pub async fn close(&self) {
        self.detach().await;
        debug!("Closed conversation for {}", self.self_id);
    }

    async fn detach(&self) {
        let handles: Vec<JoinHandle<()>> = self.listeners.lock().await.drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        self.typing.teardown().await;
        self.store.close().await;
        self.status.clear().await;
    }

    /// Feed every event of `feed` through `dispatch` until it closes
    pub fn spawn_pump(&self, mut feed: PushFeed) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                session.dispatch(event).await;
            }
            debug!("Push feed {:?} closed", feed.topic());
        })
    }

    /// Route one realtime event
    pub async fn dispatch(&self, event: PushEvent) {
        match event {
            PushEvent::MessageInserted(message) => {
                let incoming = message.receiver_id == self.self_id;
                let message_id = message.id.as_str().to_string();
                let sender_id = message.sender_id.clone();
                if !self.store.receive_push(message).await {
                    return;
                }
                self.retrack().await;
                if incoming {
                    if let Err(e) = self.status.mark_delivered(&message_id).await {
                        debug!("Delivery receipt for {} not written: {}", message_id, e);
                    }
                    self.mark_read(&sender_id).await;
                }
            }
            PushEvent::MessageUpdated(message) => {
                self.store.receive_update(message).await;
            }
            event @ PushEvent::StatusChanged(_) => {
                self.status.apply_push(&event).await;
            }
            event @ PushEvent::TypingChanged(_) => {
                self.typing.apply_push(&event).await;
            }
            PushEvent::PresenceChanged { .. } | PushEvent::VisibilityChanged { .. } => {}
        }
    }

    async fn retrack(&self) {
        let ids = self.store.confirmed_ids().await;
        if let Err(e) = self.status.track(&ids).await {
            warn!("Failed to refresh receipts after resubscribing: {}", e);
        }
    }

    async fn mark_read(&self, contact_id: &str) {
        if let Err(e) = self.status.mark_conversation_read(contact_id).await {
            warn!("Could not mark conversation with {} read: {}", contact_id, e);
        }
    }

    async fn open_contact(&self) -> SyncResult<String> {
        self.store
            .contact_id()
            .await
            .ok_or_else(|| SyncError::InvalidInput("no conversation is open".to_string()))
    }

    /// Send a message; clears our typing indicator first
    pub async fn send(&self, content: &str, attachments: Vec<OutgoingAttachment>) -> SyncResult<Option<SendOutcome>> {
        let contact_id = self.open_contact().await?;
        if self.typing.is_typing().await {
            self.typing.set_typing(&contact_id, false).await;
        }
        let outcome = self.store.send(content, attachments).await?;
        if outcome.is_some() {
            self.retrack().await;
        }
        Ok(outcome)
    }

    pub async fn load_older(&self) -> SyncResult<LoadOutcome> {
        let outcome = self.store.load_older(self.page_size).await?;
        if matches!(outcome, LoadOutcome::Loaded { count, .. } if count > 0) {
            self.retrack().await;
        }
        Ok(outcome)
    }

    pub async fn set_typing(&self, typing: bool) -> SyncResult<()> {
        let contact_id = self.open_contact().await?;
        self.typing.set_typing(&contact_id, typing).await;
        Ok(())
    }

    pub async fn edit(&self, message_id: &str, new_content: &str) -> SyncResult<Message> {
        self.store.edit(message_id, new_content).await
    }

    pub async fn delete_for_everyone(&self, message_id: &str) -> SyncResult<()> {
        self.store.delete_for_everyone(message_id).await
    }

    pub async fn delete_for_me(&self, message_id: &str) -> SyncResult<()> {
        self.store.delete_for_me(message_id).await?;
        self.retrack().await;
        Ok(())
    }

    pub async fn clear_conversation(&self) -> SyncResult<()> {
        self.store.clear_conversation().await?;
        self.retrack().await;
        Ok(())
    }

    pub async fn search(&self, query: &str) -> SyncResult<Vec<Message>> {
        self.store.search(query).await
    }

    /// Timeline paired with what the UI shows for each entry
    pub async fn timeline(&self) -> Vec<(Message, DeliveryStatus)> {
        let mut rows = Vec::new();
        for message in self.store.messages().await {
            let status = self.status.delivery_status(&message).await;
            rows.push((message, status));
        }
        rows
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }
}
