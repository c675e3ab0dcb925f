// Data model shared by the synchronization layer.
// Rows mirror what the backend stores; derived views (DeliveryStatus, Presence)
// are computed on the client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Content written in place of a message deleted for everyone
pub const DELETED_PLACEHOLDER: &str = "This message was deleted";

/// Content used when a message is sent with attachments but no text
pub const ATTACHMENT_ONLY_CONTENT: &str = "📎 Attachment";

/// Identity of a message in a timeline.
///
/// A message starts as `Pending` with a locally generated id and becomes
/// `Confirmed` once the backend has assigned its own id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageId {
    Pending(String),
    Confirmed(String),
}

impl MessageId {
    pub fn new_pending() -> Self {
        MessageId::Pending(format!("local-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageId::Pending(id) | MessageId::Confirmed(id) => id,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MessageId::Pending(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a stored attachment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub message_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
}

/// A file the user attached to an outgoing message, not yet uploaded
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingAttachment {
    pub file_name: String,
    pub file_type: String,
    pub data: Vec<u8>,
}

impl OutgoingAttachment {
    pub fn new(file_name: &str, file_type: &str, data: Vec<u8>) -> Self {
        OutgoingAttachment {
            file_name: file_name.to_string(),
            file_type: file_type.to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Build a confirmed message as the backend would return it
    pub fn confirmed(id: &str, sender_id: &str, receiver_id: &str, content: &str, created_at: DateTime<Utc>) -> Self {
        Message {
            id: MessageId::Confirmed(id.to_string()),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            created_at,
            edited_at: None,
            deleted: false,
            attachments: Vec::new(),
        }
    }

    /// Ordering key of the message within its conversation
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }

    pub fn cmp_timeline(&self, other: &Message) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }

    /// True when the message belongs to the conversation between `a` and `b`
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.receiver_id == b) || (self.sender_id == b && self.receiver_id == a)
    }
}

/// Delivery/read timestamps for one (message, recipient) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageStatus {
    pub message_id: String,
    pub user_id: String,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl MessageStatus {
    pub fn new(message_id: &str, user_id: &str) -> Self {
        MessageStatus {
            message_id: message_id.to_string(),
            user_id: user_id.to_string(),
            delivered_at: None,
            read_at: None,
        }
    }

    /// Merge another row for the same message, keeping the latest of each
    /// timestamp so a stale payload can never clear or roll back a receipt.
    pub fn merge(&mut self, other: &MessageStatus) {
        self.delivered_at = later(self.delivered_at, other.delivered_at);
        self.read_at = later(self.read_at, other.read_at);
    }
}

fn later(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// What the UI shows next to an outgoing message
#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub enum DeliveryStatus {
    Sending = 1,   // Optimistic placeholder, not yet confirmed
    Sent = 2,      // Confirmed by the backend
    Delivered = 3, // Reached the recipient
    Read = 4,      // Seen by the recipient
}

impl DeliveryStatus {
    /// Derive the displayed status from a message and its status row.
    /// A read receipt supersedes delivery even if delivered_at is missing.
    pub fn derive(message: &Message, status: Option<&MessageStatus>) -> Self {
        if message.id.is_pending() {
            return DeliveryStatus::Sending;
        }
        match status {
            Some(s) if s.read_at.is_some() => DeliveryStatus::Read,
            Some(s) if s.delivered_at.is_some() => DeliveryStatus::Delivered,
            _ => DeliveryStatus::Sent,
        }
    }
}

/// Raw presence row joined with the owner's visibility preference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRow {
    pub user_id: String,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub connection_id: Option<String>,
    /// Owned by the user's profile; false hides online state from everyone else
    pub show_online_status: bool,
}

/// Presence as exposed to viewers, after the privacy filter
#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    pub user_id: String,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<PresenceRow> for Presence {
    fn from(row: PresenceRow) -> Self {
        if row.show_online_status {
            Presence {
                user_id: row.user_id,
                online: row.online,
                last_seen: row.last_seen,
            }
        } else {
            Presence {
                user_id: row.user_id,
                online: false,
                last_seen: None,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingIndicator {
    pub user_id: String,
    pub contact_id: String,
    pub typing: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Pending,
    Accepted,
    Blocked,
}

/// One directed (user -> contact) relationship row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub user_id: String,
    pub contact_id: String,
    pub status: ContactStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An inbound pending request, from `requester_id` to us
#[derive(Debug, Clone, PartialEq)]
pub struct ContactRequest {
    pub requester_id: String,
    pub requested_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_timeline_ordering_breaks_ties_by_id() {
        let t = Utc::now();
        let a = Message::confirmed("a", "u1", "u2", "first", t);
        let b = Message::confirmed("b", "u2", "u1", "second", t);
        let c = Message::confirmed("0", "u2", "u1", "earlier", t - Duration::seconds(1));

        assert_eq!(a.cmp_timeline(&b), Ordering::Less);
        assert_eq!(c.cmp_timeline(&a), Ordering::Less);
    }

    #[test]
    fn test_status_merge_never_regresses() {
        let t = Utc::now();
        let mut current = MessageStatus::new("m1", "u2");
        current.delivered_at = Some(t);
        current.read_at = Some(t + Duration::seconds(5));

        // Out-of-order payload that only knows about delivery
        let mut stale = MessageStatus::new("m1", "u2");
        stale.delivered_at = Some(t);
        current.merge(&stale);

        assert_eq!(current.read_at, Some(t + Duration::seconds(5)));
        assert_eq!(current.delivered_at, Some(t));
    }

    #[test]
    fn test_delivery_status_read_supersedes_delivered() {
        let msg = Message::confirmed("m1", "u1", "u2", "hi", Utc::now());
        let mut status = MessageStatus::new("m1", "u2");
        assert_eq!(DeliveryStatus::derive(&msg, Some(&status)), DeliveryStatus::Sent);

        status.read_at = Some(Utc::now());
        assert_eq!(DeliveryStatus::derive(&msg, Some(&status)), DeliveryStatus::Read);

        let mut pending = msg.clone();
        pending.id = MessageId::new_pending();
        assert_eq!(DeliveryStatus::derive(&pending, Some(&status)), DeliveryStatus::Sending);
    }

    #[test]
    fn test_presence_privacy_hides_online_state() {
        let row = PresenceRow {
            user_id: "u2".to_string(),
            online: true,
            last_seen: Some(Utc::now()),
            connection_id: Some("c1".to_string()),
            show_online_status: false,
        };
        let presence = Presence::from(row);
        assert!(!presence.online);
        assert!(presence.last_seen.is_none());
    }
}
