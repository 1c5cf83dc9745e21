//! Palaver wire protocol: the message model and the socket event vocabulary.
//!
//! ## Wire format
//! - All events travel as JSON text frames over one WebSocket per connection.
//! - Events are serde-tagged enums; the tag values are the historical event
//!   names (`chat_message`, `user-status-update`, ...) and payload fields are
//!   camelCase, so existing clients keep working unchanged.
//! - A [`Message`] addresses exactly one of a peer (`to`) or a group
//!   (`group_id`), never both; [`Message::validate`] enforces this.
//! - Message ids are generated by the *sender* before transmission.  Both
//!   the relay and the reconciliation engine key on the id, so there is no
//!   fallback identity for a message without one.
//!
//! These types are intentionally small and self-contained so they can be
//! reused by the relay, the client engine, and the storage layer.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Delivery status of a message, advanced by the delivery state machine.
///
/// `Failed` ranks above `Sending` (a failure is a later fact about the same
/// send attempt) but below `Sent`: if any replica saw the message accepted,
/// the send did happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Rank used by the reconciliation precedence rule: higher wins unless
    /// the lower-ranked side carries a strictly later timestamp.
    pub fn rank(self) -> u8 {
        match self {
            MessageStatus::Sending => 0,
            MessageStatus::Failed => 1,
            MessageStatus::Sent => 2,
            MessageStatus::Delivered => 3,
            MessageStatus::Read => 4,
        }
    }
}

/// A file attached to a message.  `url` points at wherever the upload
/// collaborator stored the bytes; the core never dereferences it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub url: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub size: u64,
}

/// Errors produced by [`Message::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    MissingId,
    MissingRecipient,
    AmbiguousRecipient,
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageError::MissingId => write!(f, "message has no id"),
            MessageError::MissingRecipient => {
                write!(f, "message has neither a recipient nor a group")
            }
            MessageError::AmbiguousRecipient => {
                write!(f, "message has both a recipient and a group")
            }
        }
    }
}

impl std::error::Error for MessageError {}

/// A chat message.
///
/// Exactly one of `to` / `group_id` is set.  `timestamp` is epoch
/// milliseconds as assigned by the sender.  Soft deletion flips
/// `is_deleted` in place; the stored `text`/`attachments` are retained but
/// every reader must go through [`Message::visible_text`] /
/// [`Message::visible_attachments`], which render a deleted message empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub timestamp: u64,
    pub status: MessageStatus,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deleted_at: Option<u64>,
}

impl Message {
    /// Build a 1:1 message in `Sending` state with a fresh id.
    pub fn direct(
        from: impl Into<String>,
        to: impl Into<String>,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: new_message_id(),
            from: from.into(),
            to: Some(to.into()),
            group_id: None,
            text: text.into(),
            attachments,
            timestamp,
            status: MessageStatus::Sending,
            is_deleted: false,
            deleted_at: None,
        }
    }

    /// Build a group message in `Sending` state with a fresh id.
    pub fn group(
        from: impl Into<String>,
        group_id: impl Into<String>,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: new_message_id(),
            from: from.into(),
            to: None,
            group_id: Some(group_id.into()),
            text: text.into(),
            attachments,
            timestamp,
            status: MessageStatus::Sending,
            is_deleted: false,
            deleted_at: None,
        }
    }

    /// Check the addressing invariants: a non-empty id and exactly one of
    /// `to` / `group_id`.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.id.is_empty() {
            return Err(MessageError::MissingId);
        }
        match (&self.to, &self.group_id) {
            (Some(_), Some(_)) => Err(MessageError::AmbiguousRecipient),
            (None, None) => Err(MessageError::MissingRecipient),
            _ => Ok(()),
        }
    }

    /// The cache/room key this message belongs to.
    pub fn conversation_key(&self) -> Result<ConversationKey, MessageError> {
        self.validate()?;
        if let Some(ref group_id) = self.group_id {
            Ok(ConversationKey::group(group_id))
        } else {
            // validate() guarantees `to` is present here.
            Ok(ConversationKey::direct(
                &self.from,
                self.to.as_deref().unwrap_or_default(),
            ))
        }
    }

    /// Mark the message deleted in place.  Content stays in storage; readers
    /// see it as empty from now on.
    pub fn soft_delete(&mut self, at: u64) {
        self.is_deleted = true;
        self.deleted_at = Some(at);
    }

    /// Text as readers must see it: empty once deleted.
    pub fn visible_text(&self) -> &str {
        if self.is_deleted {
            ""
        } else {
            &self.text
        }
    }

    /// Attachments as readers must see them: empty once deleted.
    pub fn visible_attachments(&self) -> &[Attachment] {
        if self.is_deleted {
            &[]
        } else {
            &self.attachments
        }
    }
}

/// Generate a fresh message id: 16 random bytes, URL-safe base64 without
/// padding.  Callers assign ids before transmission so the optimistic local
/// copy and the relay echo are the same logical message.
pub fn new_message_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Canonical key joining the local cache, the server fetch, and the room
/// name for one conversation.
///
/// 1:1 conversations canonicalize the unordered user pair by sorting, so
/// both participants derive the same key.  Group conversations use the
/// group id directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn direct(user_a: &str, user_b: &str) -> Self {
        let (lo, hi) = if user_a <= user_b {
            (user_a, user_b)
        } else {
            (user_b, user_a)
        };
        ConversationKey(format!("chat_{lo}_{hi}"))
    }

    pub fn group(group_id: &str) -> Self {
        ConversationKey(format!("group_{group_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Online/offline marker carried by `user-status-update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// A user's presence as tracked by the relay.
///
/// Created on first connection; `online` flips with the connection
/// refcount; `last_seen` is stamped only on the transition to offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_seen: Option<u64>,
}

/// Events a client sends to the relay.
///
/// The WebSocket path (`/ws/{user_id}`) carries the authentication the
/// original `connect` event used to, so there is no explicit hello here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Private 1:1 message for the recipient's room, echoed to the sender.
    #[serde(rename = "chat_message")]
    ChatMessage { message: Message },
    /// Group message, broadcast to the whole room including the sender.
    #[serde(rename = "group-message")]
    GroupMessage { message: Message },
    /// Enrol this connection in a group room.
    #[serde(rename = "join-group")]
    JoinGroup { group_id: String, user_id: String },
    /// Ephemeral 1:1 typing signal; at-most-once, no retry.
    #[serde(rename = "typing-private")]
    TypingPrivate { from: String, to: String },
    /// Ephemeral group typing signal.
    #[serde(rename = "typing")]
    Typing { group_id: String, user_id: String },
    /// Read receipt for a 1:1 message, raised when the recipient has the
    /// conversation open and visible.
    #[serde(rename = "seen-private")]
    SeenPrivate {
        from: String,
        to: String,
        message_id: String,
    },
    /// Read receipt for a group message.
    #[serde(rename = "seen")]
    Seen {
        group_id: String,
        user_id: String,
        message_id: String,
    },
    /// Soft-delete a 1:1 message for both participants.
    #[serde(rename = "delete-message")]
    DeleteMessage {
        message_id: String,
        user_id_a: String,
        user_id_b: String,
    },
    /// Transport-level delivery receipt: the recipient's client confirms it
    /// holds `message_id`.  Routed back to the sender's private room.
    /// `group_id` is set when the message was a group broadcast, so the
    /// sender can locate its copy.
    #[serde(rename = "received")]
    Received {
        message_id: String,
        from: String,
        to: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        group_id: Option<String>,
    },
}

/// Events the relay pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Presence transition, broadcast to every other connected user.
    #[serde(rename = "user-status-update")]
    UserStatusUpdate {
        user_id: String,
        status: PresenceStatus,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        last_seen: Option<u64>,
    },
    /// Private message delivery (and sender echo).
    #[serde(rename = "chat_message")]
    ChatMessage { message: Message },
    /// Group message broadcast.
    #[serde(rename = "new-group-message")]
    NewGroupMessage { message: Message },
    #[serde(rename = "typing-private")]
    TypingPrivate { from: String },
    #[serde(rename = "user-typing")]
    UserTyping { group_id: String, user_id: String },
    #[serde(rename = "seen-private")]
    SeenPrivate { from: String, message_id: String },
    #[serde(rename = "message-seen")]
    MessageSeen {
        group_id: String,
        user_id: String,
        message_id: String,
    },
    #[serde(rename = "message-deleted")]
    MessageDeleted {
        message_id: String,
        user_id_a: String,
        user_id_b: String,
    },
    /// Delivery receipt relayed to the original sender.
    #[serde(rename = "received")]
    Received {
        message_id: String,
        from: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        group_id: Option<String>,
    },
    /// The relay accepted and routed a send from this connection.  Drives
    /// the sender's `Sending -> Sent` transition.
    #[serde(rename = "ack")]
    Ack { message_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_and_group_are_mutually_exclusive() {
        let msg = Message::direct("u1", "u2", "hi", Vec::new(), 100);
        assert!(msg.validate().is_ok());

        let mut both = msg.clone();
        both.group_id = Some("grp1".to_string());
        assert_eq!(both.validate(), Err(MessageError::AmbiguousRecipient));

        let mut neither = msg;
        neither.to = None;
        assert_eq!(neither.validate(), Err(MessageError::MissingRecipient));
    }

    #[test]
    fn empty_id_is_rejected() {
        let mut msg = Message::direct("u1", "u2", "hi", Vec::new(), 100);
        msg.id = String::new();
        assert_eq!(msg.validate(), Err(MessageError::MissingId));
    }

    #[test]
    fn message_ids_are_unique() {
        let a = new_message_id();
        let b = new_message_id();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn conversation_key_is_order_independent() {
        assert_eq!(
            ConversationKey::direct("bob", "alice"),
            ConversationKey::direct("alice", "bob")
        );
        assert_eq!(
            ConversationKey::direct("alice", "bob").as_str(),
            "chat_alice_bob"
        );
        assert_eq!(ConversationKey::group("grp1").as_str(), "group_grp1");
    }

    #[test]
    fn soft_delete_hides_content_without_erasing_it() {
        let mut msg = Message::direct("u1", "u2", "secret", Vec::new(), 100);
        msg.attachments.push(Attachment {
            name: "a.png".to_string(),
            url: "https://files/a.png".to_string(),
            content_type: "image/png".to_string(),
            size: 10,
        });
        msg.soft_delete(200);

        assert!(msg.is_deleted);
        assert_eq!(msg.deleted_at, Some(200));
        assert_eq!(msg.visible_text(), "");
        assert!(msg.visible_attachments().is_empty());
        // Stored content is untouched.
        assert_eq!(msg.text, "secret");
        assert_eq!(msg.attachments.len(), 1);
    }

    #[test]
    fn events_keep_the_historical_wire_names() {
        let event = ServerEvent::UserStatusUpdate {
            user_id: "u1".to_string(),
            status: PresenceStatus::Offline,
            last_seen: Some(42),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "user-status-update");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["status"], "offline");
        assert_eq!(json["lastSeen"], 42);

        let event = ClientEvent::ChatMessage {
            message: Message::direct("u1", "u2", "hi", Vec::new(), 1),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "chat_message");
        assert_eq!(json["message"]["groupId"], serde_json::Value::Null);

        let roundtrip: ClientEvent =
            serde_json::from_value(json).expect("deserialize");
        assert_eq!(event, roundtrip);
    }

    #[test]
    fn status_rank_orders_the_lifecycle() {
        assert!(MessageStatus::Read.rank() > MessageStatus::Delivered.rank());
        assert!(MessageStatus::Delivered.rank() > MessageStatus::Sent.rank());
        assert!(MessageStatus::Sent.rank() > MessageStatus::Failed.rank());
        assert!(MessageStatus::Failed.rank() > MessageStatus::Sending.rank());
    }
}
