// Presence tracking
// Publishes our own online state (heartbeat per session) and mirrors the
// presence of watched contacts, always through the visibility filter.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::models::Presence;
use super::backend::{Backend, PushEvent, PushFeed, PushTopic};
use super::subscriptions::SubscriptionSet;
use super::{SyncError, SyncResult};

/// Local app lifecycle signals that affect our own presence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityEvent {
    Hidden,
    Visible,
    Focus,
    NetworkOffline,
    NetworkOnline,
}

#[derive(Default)]
struct PresenceState {
    active: bool,
    heartbeat: Option<JoinHandle<()>>,
    watched: SubscriptionSet<String>,
    presence: HashMap<String, Presence>,
}

#[derive(Clone)]
pub struct PresenceTracker {
    backend: Arc<dyn Backend>,
    self_id: String,
    /// Identifies this session among the user's concurrent sessions
    connection_id: String,
    heartbeat_interval: Duration,
    state: Arc<TokioMutex<PresenceState>>,
    updates_tx: mpsc::Sender<Presence>,
}

impl PresenceTracker {
    pub fn new(backend: Arc<dyn Backend>, self_id: &str, config: &SyncConfig) -> (Self, mpsc::Receiver<Presence>) {
        let (updates_tx, updates_rx) = mpsc::channel(100);
        let tracker = PresenceTracker {
            backend,
            self_id: self_id.to_string(),
            connection_id: Uuid::new_v4().to_string(),
            heartbeat_interval: config.heartbeat_interval(),
            state: Arc::new(TokioMutex::new(PresenceState::default())),
            updates_tx,
        };
        (tracker, updates_rx)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Go online and start the heartbeat
    pub async fn start(&self) {
        {
            let mut state = self.state.lock().await;
            state.active = true;
            if let Some(handle) = state.heartbeat.take() {
                handle.abort();
            }
            state.heartbeat = Some(self.spawn_heartbeat());
        }
        info!("Presence session {} started for {}", self.connection_id, self.self_id);
        self.write_presence(true).await;
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let tracker = self.clone();
        let period = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; start() already wrote online
            interval.tick().await;
            loop {
                interval.tick().await;
                let active = tracker.state.lock().await.active;
                if active {
                    debug!("Presence heartbeat for {}", tracker.self_id);
                    tracker.write_presence(true).await;
                }
            }
        })
    }

    /// React to app visibility, focus and network changes
    pub async fn handle_activity(&self, event: ActivityEvent) {
        let online = match event {
            ActivityEvent::Hidden | ActivityEvent::NetworkOffline => false,
            ActivityEvent::Visible | ActivityEvent::Focus | ActivityEvent::NetworkOnline => true,
        };
        {
            let mut state = self.state.lock().await;
            if state.heartbeat.is_none() {
                debug!("Ignoring {:?}, presence session not started", event);
                return;
            }
            state.active = online;
        }
        debug!("Activity {:?} for {}", event, self.self_id);
        self.write_presence(online).await;
    }

    /// Stop the heartbeat and go offline
    pub async fn teardown(&self) {
        {
            let mut state = self.state.lock().await;
            state.active = false;
            if let Some(handle) = state.heartbeat.take() {
                handle.abort();
            }
        }
        self.write_presence(false).await;
        info!("Presence session {} ended for {}", self.connection_id, self.self_id);
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }

    // Presence writes never surface an error
    async fn write_presence(&self, online: bool) {
        if let Err(e) = self
            .backend
            .update_presence(&self.self_id, online, &self.connection_id)
            .await
        {
            warn!("Failed to set {} {}: {}", self.self_id, if online { "online" } else { "offline" }, e);
        }
    }

    /// Open the presence feed for this tracker
    pub fn subscribe(&self) -> PushFeed {
        self.backend.subscribe(PushTopic::Presence)
    }

    /// Watch exactly `contact_ids`.
    ///
    /// When membership changed, current state for the whole set is fetched
    /// again so changes made while resubscribing are not missed.
    pub async fn watch(&self, contact_ids: &[String]) -> SyncResult<()> {
        let desired = {
            let mut state = self.state.lock().await;
            let diff = state.watched.reconcile(contact_ids.iter().cloned());
            if diff.is_empty() {
                return Ok(());
            }
            for id in &diff.removed {
                state.presence.remove(id);
            }
            state.watched.keys()
        };

        let rows = self
            .backend
            .fetch_presence(&desired)
            .await
            .map_err(|e| SyncError::Load(e.to_string()))?;

        let mut state = self.state.lock().await;
        for row in rows {
            if state.watched.contains(&row.user_id) {
                let presence = Presence::from(row);
                state.presence.insert(presence.user_id.clone(), presence);
            }
        }
        debug!("Watching presence of {} contacts", state.watched.len());
        Ok(())
    }

    /// Handle one pushed event.
    ///
    /// Raw presence pushes do not carry the visibility preference, so the row
    /// is fetched again before anything is exposed.
    pub async fn apply_push(&self, event: &PushEvent) -> Option<Presence> {
        let user_id = match event {
            PushEvent::PresenceChanged { user_id, .. } | PushEvent::VisibilityChanged { user_id } => user_id,
            _ => return None,
        };
        if !self.state.lock().await.watched.contains(user_id) {
            return None;
        }

        let rows = match self.backend.fetch_presence(std::slice::from_ref(user_id)).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Dropping presence change for {}, re-fetch failed: {}", user_id, e);
                return None;
            }
        };
        let presence = rows
            .into_iter()
            .find(|r| r.user_id == *user_id)
            .map(Presence::from)
            .unwrap_or_else(|| Presence {
                user_id: user_id.clone(),
                online: false,
                last_seen: None,
            });

        {
            let mut state = self.state.lock().await;
            // Unwatched while the fetch was in flight
            if !state.watched.contains(user_id) {
                return None;
            }
            state.presence.insert(user_id.clone(), presence.clone());
        }
        if let Err(e) = self.updates_tx.try_send(presence.clone()) {
            debug!("Presence update for {} not delivered: {}", user_id, e);
        }
        Some(presence)
    }

    /// Drive a presence feed until it closes
    pub fn spawn_listener(&self, mut feed: PushFeed) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                tracker.apply_push(&event).await;
            }
            debug!("Presence feed closed");
        })
    }

    pub async fn is_online(&self, contact_id: &str) -> bool {
        self.state
            .lock()
            .await
            .presence
            .get(contact_id)
            .map_or(false, |p| p.online)
    }

    pub async fn last_seen(&self, contact_id: &str) -> Option<DateTime<Utc>> {
        self.state.lock().await.presence.get(contact_id).and_then(|p| p.last_seen)
    }

    pub async fn presence(&self, contact_id: &str) -> Option<Presence> {
        self.state.lock().await.presence.get(contact_id).cloned()
    }
}
