// Typing indicator tests
// Debounce timing runs on a paused clock.

mod common;
use common::*;

use tokio::time::{sleep, Duration};

use chatsync::sync::memory::Op;
use chatsync::sync::TypingTracker;

#[tokio::test(start_paused = true)]
async fn test_each_keystroke_restarts_the_timer() {
    setup_logging();
    let (backend, shared) = setup_backend();
    let (alice, _rx) = TypingTracker::new(shared.clone(), ALICE, &test_config());

    alice.set_typing(BOB, true).await;
    sleep(Duration::from_millis(500)).await;
    alice.set_typing(BOB, true).await;
    sleep(Duration::from_millis(500)).await;
    alice.set_typing(BOB, true).await;

    // 3.5s after the first call, 2.5s after the last
    sleep(Duration::from_millis(2500)).await;
    assert!(alice.is_typing().await);
    assert!(backend.typing_row(ALICE, BOB).await.unwrap().typing);

    // Past 3s after the last call
    sleep(Duration::from_millis(600)).await;
    assert!(!alice.is_typing().await);
    assert!(!backend.typing_row(ALICE, BOB).await.unwrap().typing);
    assert_eq!(backend.request_count(Op::UpsertTyping).await, 4);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_stop_cancels_timer() {
    setup_logging();
    let (backend, shared) = setup_backend();
    let (alice, _rx) = TypingTracker::new(shared.clone(), ALICE, &test_config());

    alice.set_typing(BOB, true).await;
    alice.set_typing(BOB, false).await;
    assert!(!backend.typing_row(ALICE, BOB).await.unwrap().typing);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(backend.request_count(Op::UpsertTyping).await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_switching_target_resets_previous_row() {
    setup_logging();
    let (backend, shared) = setup_backend();
    let (alice, _rx) = TypingTracker::new(shared.clone(), ALICE, &test_config());

    alice.set_typing(BOB, true).await;
    alice.set_typing(CAROL, true).await;
    assert!(!backend.typing_row(ALICE, BOB).await.unwrap().typing);
    assert!(backend.typing_row(ALICE, CAROL).await.unwrap().typing);

    sleep(Duration::from_secs(10)).await;
    assert!(!backend.typing_row(ALICE, BOB).await.unwrap().typing);
    assert!(!backend.typing_row(ALICE, CAROL).await.unwrap().typing);
    assert!(!alice.is_typing().await);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_forces_false() {
    setup_logging();
    let (backend, shared) = setup_backend();
    let (alice, _rx) = TypingTracker::new(shared.clone(), ALICE, &test_config());

    alice.set_typing(BOB, true).await;
    alice.teardown().await;
    assert!(!alice.is_typing().await);
    assert!(!backend.typing_row(ALICE, BOB).await.unwrap().typing);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(backend.request_count(Op::UpsertTyping).await, 2);
}

#[tokio::test]
async fn test_contact_typing_mirrored() {
    setup_logging();
    let (_backend, shared) = setup_backend();
    let config = test_config();
    let (alice, _alice_rx) = TypingTracker::new(shared.clone(), ALICE, &config);
    let (bob, mut updates) = TypingTracker::new(shared.clone(), BOB, &config);

    let feed = bob.watch(ALICE).await;
    let listener = bob.spawn_listener(feed);

    // Alice typing to someone else is not for bob
    alice.set_typing(CAROL, true).await;
    alice.set_typing(BOB, true).await;

    let update = updates.recv().await.unwrap();
    assert_eq!(update.user_id, ALICE);
    assert_eq!(update.contact_id, BOB);
    assert!(bob.contact_typing().await);

    alice.set_typing(BOB, false).await;
    let update = updates.recv().await.unwrap();
    assert!(!update.typing);
    assert!(!bob.contact_typing().await);

    listener.abort();
}

#[tokio::test]
async fn test_typing_write_failure_is_swallowed() {
    setup_logging();
    let (backend, shared) = setup_backend();
    backend.fail_next(Op::UpsertTyping, 1).await;
    let (alice, _rx) = TypingTracker::new(shared.clone(), ALICE, &test_config());

    alice.set_typing(BOB, true).await;
    assert!(alice.is_typing().await);
    assert!(backend.typing_row(ALICE, BOB).await.is_none());
    alice.teardown().await;
}
