#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::Result;
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

mod utils;

use chatsync::config::{self, SyncConfig};
use chatsync::models::{DeliveryStatus, Message, OutgoingAttachment};
use chatsync::sync::{ActivityEvent, Backend, ContactDirectory, ConversationSession, MemoryBackend, PresenceTracker};

/// Command line arguments for chatsync
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "chatsync: scripted two-user conversation over the in-memory backend.",
    long_about = "Runs a short conversation between two users against the in-memory backend \
    and prints both timelines, exercising contacts, sends, edits, deletes, typing, \
    presence and read receipts."
)]
struct Args {
    /// Write logs to this file instead of stdout
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Use this config file instead of the per-user one
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the history page size
    #[arg(long, value_name = "N")]
    page_size: Option<usize>,
}

const ALICE: &str = "alice";
const BOB: &str = "bob";

fn status_marker(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Sending => "…",
        DeliveryStatus::Sent => "✓",
        DeliveryStatus::Delivered => "✓✓",
        DeliveryStatus::Read => "✓✓ read",
    }
}

fn format_line(owner: &str, message: &Message, status: DeliveryStatus) -> String {
    let mut line = format!(
        "  [{}] {}: {}",
        message.created_at.format("%H:%M:%S"),
        message.sender_id,
        message.content
    );
    if message.edited_at.is_some() && !message.deleted {
        line.push_str(" (edited)");
    }
    if !message.attachments.is_empty() {
        line.push_str(&format!(" [{} attachment(s)]", message.attachments.len()));
    }
    if message.sender_id == owner {
        line.push_str(&format!("  {}", status_marker(status)));
    }
    line
}

async fn print_timeline(owner: &str, session: &ConversationSession) {
    println!("--- {}'s view ---", owner);
    for (message, status) in session.timeline().await {
        println!("{}", format_line(owner, &message, status));
    }
}

/// Let spawned feed listeners drain
async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

async fn run(config: SyncConfig) -> Result<()> {
    let backend = MemoryBackend::new(config.push_buffer);
    let shared: Arc<dyn Backend> = Arc::new(backend.clone());

    // Contacts: alice asks, bob accepts
    let alice_contacts = ContactDirectory::new(shared.clone(), ALICE);
    let bob_contacts = ContactDirectory::new(shared.clone(), BOB);
    alice_contacts.add_contact(BOB).await?;
    bob_contacts.load().await?;
    for request in bob_contacts.incoming_requests().await {
        info!("{} has a request from {}", BOB, request.requester_id);
        bob_contacts.accept_request(&request.requester_id).await?;
    }
    alice_contacts.load().await?;
    println!("{} contacts: {:?}", ALICE, alice_contacts.contacts().await);
    println!("{} contacts: {:?}", BOB, bob_contacts.contacts().await);

    // Presence
    let (alice_presence, _alice_presence_rx) = PresenceTracker::new(shared.clone(), ALICE, &config);
    let (bob_presence, _bob_presence_rx) = PresenceTracker::new(shared.clone(), BOB, &config);
    let presence_feed = alice_presence.spawn_listener(alice_presence.subscribe());
    alice_presence.start().await;
    bob_presence.start().await;
    alice_presence.watch(&[BOB.to_string()]).await?;
    println!("{} sees {} online: {}", ALICE, BOB, alice_presence.is_online(BOB).await);

    // Conversation
    let (alice, _alice_updates) = ConversationSession::new(shared.clone(), ALICE, &config);
    let (bob, _bob_updates) = ConversationSession::new(shared.clone(), BOB, &config);
    alice.open(BOB).await?;
    bob.open(ALICE).await?;

    alice.set_typing(true).await?;
    settle().await;
    println!("{} sees {} typing: {}", BOB, ALICE, bob.typing().contact_typing().await);

    let first = alice.send("Hi Bob!", Vec::new()).await?;
    bob.send("Hey Alice, how are you?", Vec::new()).await?;
    let photo = OutgoingAttachment::new("holiday photo.png", "image/png", vec![0x89, 0x50, 0x4e, 0x47]);
    let with_file = alice.send("", vec![photo]).await?;
    settle().await;

    if let Some(outcome) = &first {
        if let Err(e) = alice.edit(outcome.message.id.as_str(), "Hi Bob! 👋").await {
            warn!("Edit failed: {}", e);
        }
    }
    if let Some(outcome) = &with_file {
        for err in &outcome.attachment_errors {
            error!("{}", err);
        }
        if let Some(attachment) = outcome.message.attachments.first() {
            let url = alice.store().uploader().signed_url(attachment).await?;
            println!("Attachment URL: {}", url);
        }
    }

    let oops = bob.send("Sent to the wrong chat", Vec::new()).await?;
    settle().await;
    if let Some(outcome) = oops {
        bob.delete_for_everyone(outcome.message.id.as_str()).await?;
    }
    settle().await;

    let hits = alice.search("alice").await?;
    println!("{} search hits for 'alice': {}", ALICE, hits.len());

    print_timeline(ALICE, &alice).await;
    print_timeline(BOB, &bob).await;

    bob_presence.handle_activity(ActivityEvent::Hidden).await;
    settle().await;
    println!("{} sees {} online after hiding: {}", ALICE, BOB, alice_presence.is_online(BOB).await);

    alice.close().await;
    bob.close().await;
    alice_presence.teardown().await;
    bob_presence.teardown().await;
    presence_feed.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_file = args.log_file.as_ref().and_then(|p| p.to_str());
    utils::setup_logging(log_file, LevelFilter::Info)?;

    if let Some(path) = args.config.clone() {
        config::set_config_path_override(path);
    }
    let mut config = match config::load_config() {
        Ok(config) => config,
        Err(e) => {
            warn!("Could not load config, using defaults: {}", e);
            SyncConfig::default()
        }
    };
    if let Some(page_size) = args.page_size {
        config.page_size = page_size.max(1);
    }
    info!("Using config: {:?}", config);

    if let Err(e) = run(config).await {
        error!("Demo failed: {}", e);
        return Err(e);
    }
    Ok(())
}
