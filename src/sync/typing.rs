// Typing indicators
// Our own indicator is written through immediately and reset by a debounce
// timer; the contact's indicator is mirrored from their directed typing row.

use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::config::SyncConfig;
use crate::models::TypingIndicator;
use super::backend::{Backend, PushEvent, PushFeed, PushTopic};

#[derive(Default)]
struct TypingState {
    /// Contact our own indicator was last written for
    target: Option<String>,
    typing: bool,
    reset_timer: Option<JoinHandle<()>>,
    /// Bumped on every local change; a timer only fires for its own generation
    generation: u64,
    watched: Option<String>,
    contact_typing: bool,
}

#[derive(Clone)]
pub struct TypingTracker {
    backend: Arc<dyn Backend>,
    self_id: String,
    timeout: Duration,
    state: Arc<TokioMutex<TypingState>>,
    updates_tx: mpsc::Sender<TypingIndicator>,
}

impl TypingTracker {
    pub fn new(backend: Arc<dyn Backend>, self_id: &str, config: &SyncConfig) -> (Self, mpsc::Receiver<TypingIndicator>) {
        let (updates_tx, updates_rx) = mpsc::channel(100);
        let tracker = TypingTracker {
            backend,
            self_id: self_id.to_string(),
            timeout: config.typing_timeout(),
            state: Arc::new(TokioMutex::new(TypingState::default())),
            updates_tx,
        };
        (tracker, updates_rx)
    }

    /// Set our typing indicator towards `contact_id`.
    ///
    /// `true` (re)arms the auto-reset timer, so the indicator stays up until
    /// the configured quiet time after the last call. `false` cancels it.
    pub async fn set_typing(&self, contact_id: &str, typing: bool) {
        let abandoned = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            if let Some(timer) = state.reset_timer.take() {
                timer.abort();
            }
            let abandoned = match state.target.take() {
                Some(previous) if state.typing && previous != contact_id => Some(previous),
                _ => None,
            };
            state.target = Some(contact_id.to_string());
            state.typing = typing;
            if typing {
                state.reset_timer = Some(self.spawn_reset(contact_id.to_string(), state.generation));
            }
            abandoned
        };
        // Abandoned target has no reset timer left
        if let Some(previous) = abandoned {
            debug!("Typing moved from {} to {}", previous, contact_id);
            self.write_typing(&previous, false).await;
        }
        self.write_typing(contact_id, typing).await;
    }

    fn spawn_reset(&self, contact_id: String, generation: u64) -> JoinHandle<()> {
        let tracker = self.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            {
                let mut state = tracker.state.lock().await;
                if state.generation != generation {
                    return;
                }
                state.typing = false;
                state.reset_timer = None;
            }
            debug!("Typing indicator for {} expired", contact_id);
            tracker.write_typing(&contact_id, false).await;
        })
    }

    // Typing writes never surface an error
    async fn write_typing(&self, contact_id: &str, typing: bool) {
        if let Err(e) = self.backend.upsert_typing(&self.self_id, contact_id, typing).await {
            warn!("Failed to write typing={} for {} -> {}: {}", typing, self.self_id, contact_id, e);
        }
    }

    /// Follow `contact_id`'s typing row towards us
    pub async fn watch(&self, contact_id: &str) -> PushFeed {
        {
            let mut state = self.state.lock().await;
            state.watched = Some(contact_id.to_string());
            state.contact_typing = false;
        }
        self.backend.subscribe(PushTopic::Typing {
            user_id: contact_id.to_string(),
        })
    }

    /// Apply a pushed typing row; only (watched contact -> us) counts
    pub async fn apply_push(&self, event: &PushEvent) -> Option<bool> {
        let row = match event {
            PushEvent::TypingChanged(row) => row,
            _ => return None,
        };
        {
            let mut state = self.state.lock().await;
            if state.watched.as_deref() != Some(row.user_id.as_str()) || row.contact_id != self.self_id {
                return None;
            }
            state.contact_typing = row.typing;
        }
        if let Err(e) = self.updates_tx.try_send(row.clone()) {
            debug!("Typing update from {} not delivered: {}", row.user_id, e);
        }
        Some(row.typing)
    }

    /// Drive a typing feed until it closes
    pub fn spawn_listener(&self, mut feed: PushFeed) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                tracker.apply_push(&event).await;
            }
            debug!("Typing feed closed");
        })
    }

    /// Leave the conversation: cancel the timer, force our indicator off and
    /// stop mirroring the contact
    pub async fn teardown(&self) {
        let target = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            if let Some(timer) = state.reset_timer.take() {
                timer.abort();
            }
            state.typing = false;
            state.watched = None;
            state.contact_typing = false;
            state.target.take()
        };
        if let Some(contact_id) = target {
            self.write_typing(&contact_id, false).await;
        }
    }

    /// Our own indicator
    pub async fn is_typing(&self) -> bool {
        self.state.lock().await.typing
    }

    /// Whether the watched contact is typing to us
    pub async fn contact_typing(&self) -> bool {
        self.state.lock().await.contact_typing
    }
}
