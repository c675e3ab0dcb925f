// Common test utilities for integration tests
// Shared setup for every test file: logging, an in-memory backend and helpers
// for building seeded conversations.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;

use chrono::{DateTime, Duration, Utc};
use log::LevelFilter;
use tokio::time::{timeout, Duration as TokioDuration};

use chatsync::config::SyncConfig;
use chatsync::models::Message;
use chatsync::sync::{Backend, ConversationStore, MemoryBackend};

pub const ALICE: &str = "alice";
pub const BOB: &str = "bob";
pub const CAROL: &str = "carol";

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

/// A fresh backend plus the trait object the trackers take
pub fn setup_backend() -> (MemoryBackend, Arc<dyn Backend>) {
    let backend = MemoryBackend::default();
    let shared: Arc<dyn Backend> = Arc::new(backend.clone());
    (backend, shared)
}

/// Config with short timings so paused-clock tests stay readable
pub fn test_config() -> SyncConfig {
    SyncConfig {
        upload_backoff_ms: 100,
        ..SyncConfig::default()
    }
}

pub fn store_for(shared: &Arc<dyn Backend>, user_id: &str) -> ConversationStore {
    ConversationStore::new(shared.clone(), user_id, &test_config())
}

/// Seed `count` alternating messages between alice and bob, one minute apart,
/// ending `ends_ago` before now. Returns them oldest first.
pub async fn seed_conversation(backend: &MemoryBackend, count: usize, ends_ago: Duration) -> Vec<Message> {
    let end = Utc::now() - ends_ago;
    let mut seeded = Vec::with_capacity(count);
    for i in 0..count {
        let (from, to) = if i % 2 == 0 { (ALICE, BOB) } else { (BOB, ALICE) };
        let created_at = end - Duration::minutes((count - 1 - i) as i64);
        seeded.push(backend.seed_message(from, to, &format!("message {}", i), created_at).await);
    }
    seeded
}

pub fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    Utc::now() - Duration::minutes(minutes)
}

/// Fails if `list` is not strictly ordered by (created_at, id)
pub fn assert_timeline_ordered(list: &[Message]) {
    for pair in list.windows(2) {
        assert!(
            pair[0].cmp_timeline(&pair[1]).is_lt(),
            "{} ({}) should sort before {} ({})",
            pair[0].id,
            pair[0].created_at,
            pair[1].id,
            pair[1].created_at
        );
    }
}

/// Yield long enough for spawned listeners to process pending events
pub async fn settle() {
    tokio::time::sleep(TokioDuration::from_millis(20)).await;
}

/// Wait until `check` holds, giving up after `timeout_secs`
pub async fn wait_until<F, Fut>(mut check: F, timeout_secs: u64) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(TokioDuration::from_secs(timeout_secs), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(TokioDuration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
