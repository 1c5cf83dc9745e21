//! Per-client engine: the delivery state machine and conversation sync.
//!
//! A [`ChatClient`] owns the local cache (any [`ConversationStore`]) and
//! advances each message through `sending -> sent -> delivered -> read`,
//! with `failed` on send/upload errors and soft deletion reachable from any
//! state.  Statuses move independently per message; one failure never
//! blocks or reorders siblings.
//!
//! Transitions are driven by explicit events, never by timers:
//! - `sending -> sent` on the relay's transport `ack`,
//! - `sent -> delivered` on the peer client's `received` receipt,
//! - `delivered -> read` on an explicit seen event.
//!
//! The engine runs on one logical thread.  Every cache mutation is
//! read-modify-write against the latest stored value for the conversation
//! key, so an incoming message and an in-flight receipt update never
//! clobber each other.  The caller owns the transport: methods return the
//! [`ClientEvent`]s to transmit rather than sending anything themselves.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::protocol::{
    Attachment, ClientEvent, ConversationKey, Message, MessageError, MessageStatus,
    PresenceRecord, PresenceStatus, ServerEvent,
};
use crate::reconcile::reconcile;
use crate::storage::{
    AttachmentUpload, AttachmentUploader, ConversationStore, RemoteHistory, StorageError,
    UploadError,
};

/// How long a typing signal stays visible without a follow-up.  There is no
/// "stopped typing" event; entries just age out.
pub const TYPING_EXPIRY: Duration = Duration::from_millis(2500);

#[derive(Debug)]
pub enum ClientError {
    Storage(StorageError),
    Upload(UploadError),
    Invalid(MessageError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Storage(e) => write!(f, "storage error: {e}"),
            ClientError::Upload(e) => write!(f, "upload error: {e}"),
            ClientError::Invalid(e) => write!(f, "invalid message: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<StorageError> for ClientError {
    fn from(e: StorageError) -> Self {
        ClientError::Storage(e)
    }
}

impl From<MessageError> for ClientError {
    fn from(e: MessageError) -> Self {
        ClientError::Invalid(e)
    }
}

/// Result of a send: the cached message plus the event to transmit.
/// `event` is `None` when the send already failed locally (upload error) —
/// the message is cached as `Failed` and the UI owns the retry.
#[derive(Debug)]
pub struct SendOutcome {
    pub message: Message,
    pub event: Option<ClientEvent>,
}

/// Result of opening a conversation: the visible log plus the read
/// receipts to transmit for previously-unread messages.
#[derive(Debug)]
pub struct OpenOutcome {
    pub messages: Vec<Message>,
    pub events: Vec<ClientEvent>,
}

pub struct ChatClient<S> {
    self_id: String,
    store: S,
    /// Conversation currently open and visible, if any.  Drives read
    /// receipts for messages arriving while the user is looking.
    open: Option<ConversationKey>,
    /// Conversation key for each of our in-flight sends, so a bare `ack`
    /// (which carries only the message id) can find its message.
    pending: HashMap<String, ConversationKey>,
    presence: HashMap<String, PresenceRecord>,
    typing: HashMap<(ConversationKey, String), Instant>,
}

impl<S: ConversationStore> ChatClient<S> {
    pub fn new(self_id: impl Into<String>, store: S) -> Self {
        Self {
            self_id: self_id.into(),
            store,
            open: None,
            pending: HashMap::new(),
            presence: HashMap::new(),
            typing: HashMap::new(),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Latest presence snapshot, fed by `user-status-update` events.
    pub fn presence(&self) -> &HashMap<String, PresenceRecord> {
        &self.presence
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Send a 1:1 message.  Attachments upload first; an upload failure
    /// fails this message only (cached as `Failed`, no event emitted).
    pub fn send_direct(
        &mut self,
        to: &str,
        text: &str,
        uploads: &[AttachmentUpload],
        uploader: &dyn AttachmentUploader,
    ) -> Result<SendOutcome, ClientError> {
        let key = ConversationKey::direct(&self.self_id, to);
        let attachments = match self.upload_all(uploads, uploader) {
            Ok(attachments) => attachments,
            Err(e) => {
                let mut message =
                    Message::direct(&self.self_id, to, text, Vec::new(), now_ms());
                message.status = MessageStatus::Failed;
                crate::plog!(
                    "client: upload failed for {}: {e}",
                    crate::logging::msg_id(&message.id)
                );
                self.upsert(&key, &message)?;
                return Ok(SendOutcome {
                    message,
                    event: None,
                });
            }
        };

        let message = Message::direct(&self.self_id, to, text, attachments, now_ms());
        self.upsert(&key, &message)?;
        self.pending.insert(message.id.clone(), key);
        Ok(SendOutcome {
            event: Some(ClientEvent::ChatMessage {
                message: message.clone(),
            }),
            message,
        })
    }

    /// Send a group message.  Same upload-then-send shape as
    /// [`ChatClient::send_direct`].
    pub fn send_group(
        &mut self,
        group_id: &str,
        text: &str,
        uploads: &[AttachmentUpload],
        uploader: &dyn AttachmentUploader,
    ) -> Result<SendOutcome, ClientError> {
        let key = ConversationKey::group(group_id);
        let attachments = match self.upload_all(uploads, uploader) {
            Ok(attachments) => attachments,
            Err(e) => {
                let mut message =
                    Message::group(&self.self_id, group_id, text, Vec::new(), now_ms());
                message.status = MessageStatus::Failed;
                crate::plog!(
                    "client: upload failed for {}: {e}",
                    crate::logging::msg_id(&message.id)
                );
                self.upsert(&key, &message)?;
                return Ok(SendOutcome {
                    message,
                    event: None,
                });
            }
        };

        let message = Message::group(&self.self_id, group_id, text, attachments, now_ms());
        self.upsert(&key, &message)?;
        self.pending.insert(message.id.clone(), key);
        Ok(SendOutcome {
            event: Some(ClientEvent::GroupMessage {
                message: message.clone(),
            }),
            message,
        })
    }

    fn upload_all(
        &self,
        uploads: &[AttachmentUpload],
        uploader: &dyn AttachmentUploader,
    ) -> Result<Vec<Attachment>, UploadError> {
        let mut attachments = Vec::with_capacity(uploads.len());
        for upload in uploads {
            attachments.push(uploader.upload(upload)?);
        }
        Ok(attachments)
    }

    /// The transport failed to carry a send (socket error, relay refused).
    /// The message stays visible as `Failed`; siblings are untouched.
    pub fn handle_send_failure(&mut self, message_id: &str) -> Result<(), ClientError> {
        if let Some(key) = self.pending.remove(message_id) {
            self.update_status(&key, message_id, MessageStatus::Failed)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Incoming events
    // -----------------------------------------------------------------------

    /// Apply one relay event.  Returns the events to transmit in response
    /// (delivery receipts, read receipts).
    pub fn handle_event(&mut self, event: ServerEvent) -> Result<Vec<ClientEvent>, ClientError> {
        match event {
            ServerEvent::ChatMessage { message } | ServerEvent::NewGroupMessage { message } => {
                self.handle_incoming(message)
            }
            ServerEvent::Ack { message_id } => {
                self.handle_ack(&message_id)?;
                Ok(Vec::new())
            }
            ServerEvent::Received {
                message_id,
                from,
                group_id,
            } => {
                let key = match group_id {
                    Some(ref gid) => ConversationKey::group(gid),
                    None => ConversationKey::direct(&self.self_id, &from),
                };
                self.update_status(&key, &message_id, MessageStatus::Delivered)?;
                Ok(Vec::new())
            }
            ServerEvent::SeenPrivate { from, message_id } => {
                let key = ConversationKey::direct(&self.self_id, &from);
                self.update_status(&key, &message_id, MessageStatus::Read)?;
                Ok(Vec::new())
            }
            ServerEvent::MessageSeen {
                group_id,
                message_id,
                ..
            } => {
                let key = ConversationKey::group(&group_id);
                self.mark_own_read(&key, &message_id)?;
                Ok(Vec::new())
            }
            ServerEvent::MessageDeleted {
                message_id,
                user_id_a,
                user_id_b,
            } => {
                self.handle_deletion(&message_id, &user_id_a, &user_id_b)?;
                Ok(Vec::new())
            }
            ServerEvent::UserStatusUpdate {
                user_id,
                status,
                last_seen,
            } => {
                self.presence.insert(
                    user_id.clone(),
                    PresenceRecord {
                        user_id,
                        online: status == PresenceStatus::Online,
                        last_seen,
                    },
                );
                Ok(Vec::new())
            }
            ServerEvent::TypingPrivate { from } => {
                let key = ConversationKey::direct(&self.self_id, &from);
                self.note_typing(key, from, Instant::now());
                Ok(Vec::new())
            }
            ServerEvent::UserTyping { group_id, user_id } => {
                self.note_typing(ConversationKey::group(&group_id), user_id, Instant::now());
                Ok(Vec::new())
            }
        }
    }

    /// Merge an incoming (or echoed) message into its conversation.
    ///
    /// Our own echo is the optimistic append coming back with the same id
    /// and collapses into it.  A peer's message is cached as `Delivered`
    /// (we hold it now) and answered with a `received` receipt — plus a
    /// read receipt immediately if the conversation is open and visible.
    pub fn handle_incoming(&mut self, message: Message) -> Result<Vec<ClientEvent>, ClientError> {
        message.validate()?;
        let key = conversation_key_for(&self.self_id, &message)?;
        let own_echo = message.from == self.self_id;

        let mut incoming = message;
        let mut events = Vec::new();

        if !own_echo {
            let conversation_open = self.open.as_ref() == Some(&key);
            incoming.status = if conversation_open {
                MessageStatus::Read
            } else {
                MessageStatus::Delivered
            };

            events.push(ClientEvent::Received {
                message_id: incoming.id.clone(),
                from: self.self_id.clone(),
                to: incoming.from.clone(),
                group_id: incoming.group_id.clone(),
            });
            if conversation_open {
                events.push(self.seen_event(&incoming));
            }
        }

        let local = self.store.load_conversation(&key)?;
        let merged = reconcile(&local, std::slice::from_ref(&incoming));
        self.store.save_conversation(&key, &merged)?;
        Ok(events)
    }

    fn handle_ack(&mut self, message_id: &str) -> Result<(), ClientError> {
        if let Some(key) = self.pending.remove(message_id) {
            self.update_status(&key, message_id, MessageStatus::Sent)?;
        }
        Ok(())
    }

    /// Soft-delete a message in place for the 1:1 conversation of
    /// `user_id_a` / `user_id_b`.  Content stays cached but is hidden from
    /// every reader from now on.
    pub fn handle_deletion(
        &mut self,
        message_id: &str,
        user_id_a: &str,
        user_id_b: &str,
    ) -> Result<(), ClientError> {
        let key = ConversationKey::direct(user_id_a, user_id_b);
        let mut messages = self.store.load_conversation(&key)?;
        let mut changed = false;
        for message in &mut messages {
            if message.id == message_id && !message.is_deleted {
                message.soft_delete(now_ms());
                changed = true;
            }
        }
        if changed {
            self.store.save_conversation(&key, &messages)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Conversation open / sync
    // -----------------------------------------------------------------------

    /// Open a conversation: load the cache, fetch server history, reconcile,
    /// persist, and mark everything unread as read.
    ///
    /// A failed history fetch degrades to cache-only and is not an error —
    /// the next open retries naturally.
    pub fn open_conversation(
        &mut self,
        key: &ConversationKey,
        history: &dyn RemoteHistory,
    ) -> Result<OpenOutcome, ClientError> {
        let local = self.store.load_conversation(key)?;
        let remote = match history.fetch_history(key) {
            Ok(remote) => remote,
            Err(e) => {
                crate::plog!("client: history fetch for {key} failed, using cache: {e}");
                Vec::new()
            }
        };

        let mut merged = reconcile(&local, &remote);
        self.open = Some(key.clone());

        // Read receipts for everything addressed to us that the peer has
        // not seen us read yet; drives the unread count to zero.
        let mut events = Vec::new();
        for message in &mut merged {
            let addressed_to_self = message.to.as_deref() == Some(self.self_id.as_str())
                || (message.group_id.is_some() && message.from != self.self_id);
            if addressed_to_self && message.status != MessageStatus::Read {
                message.status = MessageStatus::Read;
                events.push(self.seen_event(message));
            }
        }

        self.store.save_conversation(key, &merged)?;
        Ok(OpenOutcome {
            messages: merged,
            events,
        })
    }

    /// The conversation is no longer visible; stop issuing immediate read
    /// receipts.
    pub fn close_conversation(&mut self) {
        self.open = None;
    }

    /// Current cached log for a conversation.
    pub fn conversation(&self, key: &ConversationKey) -> Result<Vec<Message>, ClientError> {
        Ok(self.store.load_conversation(key)?)
    }

    /// Unread count from one peer, per the reconciled cache.
    pub fn unread_from(&self, peer_id: &str) -> Result<u32, ClientError> {
        let key = ConversationKey::direct(&self.self_id, peer_id);
        let messages = self.store.load_conversation(&key)?;
        let counts = crate::roster::unread_counts(&messages, &self.self_id);
        Ok(counts.get(peer_id).copied().unwrap_or(0))
    }

    // -----------------------------------------------------------------------
    // Typing
    // -----------------------------------------------------------------------

    /// Record a typing signal.  Entries auto-expire after [`TYPING_EXPIRY`];
    /// there is no explicit stop event.
    pub fn note_typing(&mut self, key: ConversationKey, user_id: String, now: Instant) {
        self.typing.retain(|_, seen_at| now.duration_since(*seen_at) < TYPING_EXPIRY);
        self.typing.insert((key, user_id), now);
    }

    /// Users currently typing in a conversation, as of `now`.
    pub fn typing_in(&self, key: &ConversationKey, now: Instant) -> Vec<String> {
        let mut users: Vec<String> = self
            .typing
            .iter()
            .filter(|((k, _), seen_at)| {
                k == key && now.duration_since(**seen_at) < TYPING_EXPIRY
            })
            .map(|((_, user_id), _)| user_id.clone())
            .collect();
        users.sort();
        users
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Read-modify-write a single message's status against the latest
    /// cached value.  Only upgrades: a stale or duplicate event can never
    /// walk a status backwards.
    fn update_status(
        &mut self,
        key: &ConversationKey,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<(), ClientError> {
        let mut messages = self.store.load_conversation(key)?;
        let mut changed = false;
        for message in &mut messages {
            if message.id == message_id && status.rank() > message.status.rank() {
                message.status = status;
                changed = true;
            }
        }
        if changed {
            self.store.save_conversation(key, &messages)?;
        }
        Ok(())
    }

    /// Mark our own message read (group seen events name the reader, but
    /// only the author's copy tracks the status).
    fn mark_own_read(
        &mut self,
        key: &ConversationKey,
        message_id: &str,
    ) -> Result<(), ClientError> {
        let mut messages = self.store.load_conversation(key)?;
        let mut changed = false;
        for message in &mut messages {
            if message.id == message_id
                && message.from == self.self_id
                && MessageStatus::Read.rank() > message.status.rank()
            {
                message.status = MessageStatus::Read;
                changed = true;
            }
        }
        if changed {
            self.store.save_conversation(key, &messages)?;
        }
        Ok(())
    }

    fn seen_event(&self, message: &Message) -> ClientEvent {
        match message.group_id {
            Some(ref group_id) => ClientEvent::Seen {
                group_id: group_id.clone(),
                user_id: self.self_id.clone(),
                message_id: message.id.clone(),
            },
            None => ClientEvent::SeenPrivate {
                from: self.self_id.clone(),
                to: message.from.clone(),
                message_id: message.id.clone(),
            },
        }
    }

    fn upsert(&mut self, key: &ConversationKey, message: &Message) -> Result<(), ClientError> {
        let local = self.store.load_conversation(key)?;
        let merged = reconcile(&local, std::slice::from_ref(message));
        self.store.save_conversation(key, &merged)?;
        Ok(())
    }
}

/// Conversation key from the *local* perspective: an incoming direct
/// message files under the pair (sender, us), our own echo under (us,
/// recipient) — both canonicalize to the same key.
fn conversation_key_for(self_id: &str, message: &Message) -> Result<ConversationKey, MessageError> {
    if let Some(ref group_id) = message.group_id {
        return Ok(ConversationKey::group(group_id));
    }
    match message.to {
        Some(ref to) if message.from == self_id => Ok(ConversationKey::direct(self_id, to)),
        Some(_) => Ok(ConversationKey::direct(&message.from, self_id)),
        None => Err(MessageError::MissingRecipient),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
