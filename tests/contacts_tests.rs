// Contact directory tests

mod common;
use common::*;

use chatsync::models::ContactStatus;
use chatsync::sync::memory::Op;
use chatsync::sync::{AddOutcome, ContactDirectory, SyncError};

#[tokio::test]
async fn test_request_accept_creates_both_rows() {
    setup_logging();
    let (backend, shared) = setup_backend();
    let alice = ContactDirectory::new(shared.clone(), ALICE);
    let bob = ContactDirectory::new(shared.clone(), BOB);

    assert_eq!(alice.add_contact(BOB).await.unwrap(), AddOutcome::RequestSent);
    assert_eq!(alice.outgoing_requests().await, vec![BOB.to_string()]);
    assert!(backend.contact_row(BOB, ALICE).await.is_none());

    bob.load().await.unwrap();
    let requests = bob.incoming_requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].requester_id, ALICE);

    bob.accept_request(ALICE).await.unwrap();
    assert!(bob.incoming_requests().await.is_empty());
    assert_eq!(bob.contacts().await, vec![ALICE.to_string()]);
    assert_eq!(backend.contact_row(ALICE, BOB).await.unwrap().status, ContactStatus::Accepted);
    assert_eq!(backend.contact_row(BOB, ALICE).await.unwrap().status, ContactStatus::Accepted);

    alice.load().await.unwrap();
    assert!(alice.is_contact(BOB).await);
    assert!(alice.outgoing_requests().await.is_empty());
}

#[tokio::test]
async fn test_decline_deletes_request() {
    setup_logging();
    let (backend, shared) = setup_backend();
    let alice = ContactDirectory::new(shared.clone(), ALICE);
    let bob = ContactDirectory::new(shared.clone(), BOB);

    alice.add_contact(BOB).await.unwrap();
    bob.load().await.unwrap();
    bob.decline_request(ALICE).await.unwrap();

    assert!(bob.incoming_requests().await.is_empty());
    assert!(backend.contact_row(ALICE, BOB).await.is_none());

    // Accepting a request that no longer exists fails
    let err = bob.accept_request(ALICE).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
}

#[tokio::test]
async fn test_remove_deletes_both_directions() {
    setup_logging();
    let (backend, shared) = setup_backend();
    let alice = ContactDirectory::new(shared.clone(), ALICE);
    let bob = ContactDirectory::new(shared.clone(), BOB);
    alice.add_contact(BOB).await.unwrap();
    bob.load().await.unwrap();
    bob.accept_request(ALICE).await.unwrap();

    alice.load().await.unwrap();
    alice.remove_contact(BOB).await.unwrap();

    assert!(alice.contacts().await.is_empty());
    assert!(backend.contact_row(ALICE, BOB).await.is_none());
    assert!(backend.contact_row(BOB, ALICE).await.is_none());

    bob.load().await.unwrap();
    assert!(bob.contacts().await.is_empty());
}

#[tokio::test]
async fn test_add_validation() {
    setup_logging();
    let (backend, shared) = setup_backend();
    let alice = ContactDirectory::new(shared.clone(), ALICE);

    assert!(matches!(alice.add_contact(ALICE).await, Err(SyncError::InvalidInput(_))));
    assert!(matches!(alice.add_contact("  ").await, Err(SyncError::InvalidInput(_))));

    alice.add_contact(BOB).await.unwrap();
    assert!(matches!(alice.add_contact(BOB).await, Err(SyncError::InvalidInput(_))));
    assert_eq!(backend.request_count(Op::InsertContact).await, 1);
}

#[tokio::test]
async fn test_crossing_request_is_accepted() {
    setup_logging();
    let (backend, shared) = setup_backend();
    let alice = ContactDirectory::new(shared.clone(), ALICE);
    let bob = ContactDirectory::new(shared.clone(), BOB);

    alice.add_contact(BOB).await.unwrap();
    bob.load().await.unwrap();

    assert_eq!(bob.add_contact(ALICE).await.unwrap(), AddOutcome::Accepted);
    assert_eq!(backend.contact_row(ALICE, BOB).await.unwrap().status, ContactStatus::Accepted);
    assert_eq!(backend.contact_row(BOB, ALICE).await.unwrap().status, ContactStatus::Accepted);
    assert!(bob.is_contact(ALICE).await);
}

#[tokio::test]
async fn test_block_contact() {
    setup_logging();
    let (backend, shared) = setup_backend();
    let alice = ContactDirectory::new(shared.clone(), ALICE);
    let carol = ContactDirectory::new(shared.clone(), CAROL);

    carol.add_contact(ALICE).await.unwrap();
    alice.load().await.unwrap();
    assert_eq!(alice.incoming_requests().await.len(), 1);

    alice.block_contact(CAROL).await.unwrap();
    assert_eq!(alice.blocked().await, vec![CAROL.to_string()]);
    assert!(alice.incoming_requests().await.is_empty());
    assert_eq!(backend.contact_row(ALICE, CAROL).await.unwrap().status, ContactStatus::Blocked);
    assert!(backend.contact_row(CAROL, ALICE).await.is_none());

    alice.load().await.unwrap();
    assert!(alice.incoming_requests().await.is_empty());

    assert!(matches!(alice.add_contact(CAROL).await, Err(SyncError::InvalidInput(_))));
}

#[tokio::test]
async fn test_load_failure_is_reported() {
    setup_logging();
    let (backend, shared) = setup_backend();
    backend.fail_next(Op::FetchContacts, 1).await;
    let alice = ContactDirectory::new(shared.clone(), ALICE);

    assert!(matches!(alice.load().await, Err(SyncError::Load(_))));
    assert!(alice.load().await.is_ok());
}
