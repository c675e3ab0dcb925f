// Delivery and read receipts
// Holds one merged status entry per tracked message and folds realtime status
// pushes into it. Timestamps only move forward; see MessageStatus::merge.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;

use crate::models::{DeliveryStatus, Message, MessageStatus};
use super::backend::{Backend, PushEvent, PushFeed, PushTopic};
use super::subscriptions::SubscriptionSet;
use super::{SyncError, SyncResult};

#[derive(Default)]
struct StatusState {
    statuses: HashMap<String, MessageStatus>,
    tracked: SubscriptionSet<String>,
}

#[derive(Clone)]
pub struct StatusTracker {
    backend: Arc<dyn Backend>,
    self_id: String,
    state: Arc<TokioMutex<StatusState>>,
    updates_tx: mpsc::Sender<MessageStatus>,
}

impl StatusTracker {
    /// Create a tracker and the channel its merged updates are delivered on
    pub fn new(backend: Arc<dyn Backend>, self_id: &str) -> (Self, mpsc::Receiver<MessageStatus>) {
        let (updates_tx, updates_rx) = mpsc::channel(100);
        let tracker = StatusTracker {
            backend,
            self_id: self_id.to_string(),
            state: Arc::new(TokioMutex::new(StatusState::default())),
            updates_tx,
        };
        (tracker, updates_rx)
    }

    /// Open the status feed for this tracker
    pub fn subscribe(&self) -> PushFeed {
        self.backend.subscribe(PushTopic::MessageStatus)
    }

    /// Bulk-fetch status rows for `message_ids` and merge them in
    pub async fn load_status(&self, message_ids: &[String]) -> SyncResult<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let rows = self
            .backend
            .fetch_statuses(message_ids)
            .await
            .map_err(|e| SyncError::Load(e.to_string()))?;

        let mut state = self.state.lock().await;
        let count = rows.len();
        for row in rows {
            merge_into(&mut state.statuses, &row);
        }
        debug!("Loaded {} status rows for {} messages", count, message_ids.len());
        Ok(count)
    }

    /// Track exactly `message_ids`.
    ///
    /// Only changes membership when the set actually differs. Newly added ids
    /// are fetched right away so nothing pushed before tracking began is lost.
    pub async fn track(&self, message_ids: &[String]) -> SyncResult<()> {
        let added = {
            let mut state = self.state.lock().await;
            let diff = state.tracked.reconcile(message_ids.iter().cloned());
            if diff.is_empty() {
                return Ok(());
            }
            for id in &diff.removed {
                state.statuses.remove(id);
            }
            debug!(
                "Status tracking now {} messages (+{} -{})",
                state.tracked.len(),
                diff.added.len(),
                diff.removed.len()
            );
            diff.added
        };
        self.load_status(&added).await.map(|_| ())
    }

    /// Stop tracking everything
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.tracked.clear();
        state.statuses.clear();
    }

    /// Merge one pushed event. Returns the merged entry when the event was for
    /// a tracked message.
    pub async fn apply_push(&self, event: &PushEvent) -> Option<MessageStatus> {
        let row = match event {
            PushEvent::StatusChanged(row) => row,
            _ => return None,
        };

        let merged = {
            let mut state = self.state.lock().await;
            if !state.tracked.contains(&row.message_id) {
                return None;
            }
            merge_into(&mut state.statuses, row)
        };

        if let Err(e) = self.updates_tx.try_send(merged.clone()) {
            debug!("Status update for {} not delivered: {}", merged.message_id, e);
        }
        Some(merged)
    }

    /// Drive a status feed until it closes
    pub fn spawn_listener(&self, mut feed: PushFeed) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                tracker.apply_push(&event).await;
            }
            debug!("Status feed closed");
        })
    }

    /// Acknowledge delivery of a message addressed to us
    pub async fn mark_delivered(&self, message_id: &str) -> SyncResult<MessageStatus> {
        let row = self
            .backend
            .mark_delivered(message_id, &self.self_id)
            .await
            .map_err(|e| {
                error!("Failed to mark {} delivered: {}", message_id, e);
                SyncError::Backend(e.to_string())
            })?;
        let mut state = self.state.lock().await;
        Ok(merge_into(&mut state.statuses, &row))
    }

    /// Mark everything `contact_id` sent us as read, in one request
    pub async fn mark_conversation_read(&self, contact_id: &str) -> SyncResult<usize> {
        let rows = self
            .backend
            .mark_conversation_read(&self.self_id, contact_id)
            .await
            .map_err(|e| {
                warn!("Failed to mark conversation with {} read: {}", contact_id, e);
                SyncError::Backend(e.to_string())
            })?;

        let mut state = self.state.lock().await;
        for row in &rows {
            merge_into(&mut state.statuses, row);
        }
        if !rows.is_empty() {
            info!("Marked {} messages from {} as read", rows.len(), contact_id);
        }
        Ok(rows.len())
    }

    pub async fn status(&self, message_id: &str) -> Option<MessageStatus> {
        self.state.lock().await.statuses.get(message_id).cloned()
    }

    pub async fn delivery_status(&self, message: &Message) -> DeliveryStatus {
        let state = self.state.lock().await;
        DeliveryStatus::derive(message, state.statuses.get(message.id.as_str()))
    }

    pub async fn tracked_count(&self) -> usize {
        self.state.lock().await.tracked.len()
    }

    /// Bumped whenever the tracked set changes membership
    pub async fn subscription_revision(&self) -> u64 {
        self.state.lock().await.tracked.revision()
    }
}

fn merge_into(statuses: &mut HashMap<String, MessageStatus>, row: &MessageStatus) -> MessageStatus {
    let entry = statuses
        .entry(row.message_id.clone())
        .or_insert_with(|| MessageStatus::new(&row.message_id, &row.user_id));
    entry.merge(row);
    entry.clone()
}
