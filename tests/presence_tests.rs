// Presence tracker tests
// Heartbeat timing runs on a paused clock.

mod common;
use common::*;

use tokio::time::{sleep, Duration};

use chatsync::sync::memory::Op;
use chatsync::sync::{ActivityEvent, Backend, PresenceTracker, PushEvent};

#[tokio::test]
async fn test_privacy_flag_hides_online_state() {
    setup_logging();
    let (backend, shared) = setup_backend();
    let config = test_config();

    let (bob, _bob_rx) = PresenceTracker::new(shared.clone(), BOB, &config);
    bob.start().await;
    backend.set_online_visibility(BOB, false).await;

    // The raw row says online
    let rows = shared.fetch_presence(&[BOB.to_string()]).await.unwrap();
    assert!(rows[0].online);

    let (alice, _alice_rx) = PresenceTracker::new(shared.clone(), ALICE, &config);
    alice.watch(&[BOB.to_string()]).await.unwrap();
    assert!(!alice.is_online(BOB).await);
    assert!(alice.last_seen(BOB).await.is_none());
}

#[tokio::test]
async fn test_raw_push_goes_through_privacy_filter() {
    setup_logging();
    let (backend, shared) = setup_backend();
    let config = test_config();

    let (bob, _bob_rx) = PresenceTracker::new(shared.clone(), BOB, &config);
    bob.start().await;
    backend.set_online_visibility(BOB, false).await;

    let (alice, _alice_rx) = PresenceTracker::new(shared.clone(), ALICE, &config);
    alice.watch(&[BOB.to_string()]).await.unwrap();

    let raw = PushEvent::PresenceChanged {
        user_id: BOB.to_string(),
        online: true,
        last_seen: Some(chrono::Utc::now()),
    };
    let exposed = alice.apply_push(&raw).await.unwrap();
    assert!(!exposed.online);
    assert!(exposed.last_seen.is_none());
    assert!(!alice.is_online(BOB).await);
}

#[tokio::test]
async fn test_watched_contact_updates_from_feed() {
    setup_logging();
    let (backend, shared) = setup_backend();
    let config = test_config();

    let (alice, mut updates) = PresenceTracker::new(shared.clone(), ALICE, &config);
    let listener = alice.spawn_listener(alice.subscribe());
    alice.watch(&[BOB.to_string()]).await.unwrap();
    assert!(!alice.is_online(BOB).await);

    let (bob, _bob_rx) = PresenceTracker::new(shared.clone(), BOB, &config);
    bob.start().await;
    let update = updates.recv().await.unwrap();
    assert_eq!(update.user_id, BOB);
    assert!(update.online);
    assert!(alice.is_online(BOB).await);
    assert!(alice.last_seen(BOB).await.is_some());

    backend.set_online_visibility(BOB, false).await;
    let update = updates.recv().await.unwrap();
    assert!(!update.online);
    assert!(!alice.is_online(BOB).await);

    listener.abort();
}

#[tokio::test]
async fn test_unwatched_users_ignored() {
    setup_logging();
    let (_backend, shared) = setup_backend();
    let config = test_config();

    let (alice, _rx) = PresenceTracker::new(shared.clone(), ALICE, &config);
    alice.watch(&[BOB.to_string()]).await.unwrap();
    let event = PushEvent::PresenceChanged {
        user_id: CAROL.to_string(),
        online: true,
        last_seen: None,
    };
    assert!(alice.apply_push(&event).await.is_none());
    assert!(alice.presence(CAROL).await.is_none());

    // Dropping a contact forgets its state
    alice.watch(&[CAROL.to_string()]).await.unwrap();
    assert!(alice.presence(BOB).await.is_none());
}

#[tokio::test]
async fn test_other_session_keeps_user_online() {
    setup_logging();
    let (_backend, shared) = setup_backend();
    let config = test_config();

    let (phone, _phone_rx) = PresenceTracker::new(shared.clone(), BOB, &config);
    let (laptop, _laptop_rx) = PresenceTracker::new(shared.clone(), BOB, &config);
    assert_ne!(phone.connection_id(), laptop.connection_id());
    phone.start().await;
    laptop.start().await;

    let (alice, _rx) = PresenceTracker::new(shared.clone(), ALICE, &config);
    alice.watch(&[BOB.to_string()]).await.unwrap();

    phone.handle_activity(ActivityEvent::Hidden).await;
    let event = PushEvent::PresenceChanged {
        user_id: BOB.to_string(),
        online: false,
        last_seen: None,
    };
    assert!(alice.apply_push(&event).await.unwrap().online);

    laptop.teardown().await;
    assert!(!alice.apply_push(&event).await.unwrap().online);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_follows_activity() {
    setup_logging();
    let (backend, shared) = setup_backend();
    let config = test_config();

    let (bob, _rx) = PresenceTracker::new(shared.clone(), BOB, &config);
    bob.start().await;
    assert_eq!(backend.request_count(Op::UpdatePresence).await, 1);

    sleep(Duration::from_secs(61)).await;
    assert_eq!(backend.request_count(Op::UpdatePresence).await, 2);
    sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.request_count(Op::UpdatePresence).await, 3);

    // Hidden: one offline write, then no heartbeats
    bob.handle_activity(ActivityEvent::Hidden).await;
    assert!(!bob.is_active().await);
    sleep(Duration::from_secs(120)).await;
    assert_eq!(backend.request_count(Op::UpdatePresence).await, 4);

    bob.handle_activity(ActivityEvent::Focus).await;
    assert_eq!(backend.request_count(Op::UpdatePresence).await, 5);

    bob.teardown().await;
    sleep(Duration::from_secs(120)).await;
    assert_eq!(backend.request_count(Op::UpdatePresence).await, 6);
}

#[tokio::test]
async fn test_presence_write_failures_are_swallowed() {
    setup_logging();
    let (backend, shared) = setup_backend();
    let config = test_config();
    backend.fail_next(Op::UpdatePresence, 2).await;

    let (bob, _rx) = PresenceTracker::new(shared.clone(), BOB, &config);
    bob.start().await;
    bob.handle_activity(ActivityEvent::NetworkOffline).await;
    bob.handle_activity(ActivityEvent::NetworkOnline).await;
    assert!(bob.is_active().await);
    assert_eq!(backend.request_count(Op::UpdatePresence).await, 3);
    bob.teardown().await;
}
