//! Unread/ordering index: derives per-peer unread counts and the sidebar
//! ordering from the reconciled message set and the presence map.
//!
//! Everything here is a pure function of its inputs — the counts are never
//! stored, they are recomputed whenever the reconciled set or the presence
//! map changes.

use std::collections::HashMap;

use crate::protocol::{Message, MessageStatus, PresenceRecord};

/// A peer as known to the ordering index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub user_id: String,
    pub display_name: String,
}

/// Per-peer unread counts from `self_id`'s perspective: messages addressed
/// to `self_id` whose status has not reached `Read`, keyed by sender.
///
/// Deleted messages still count until they are read — they remain entries
/// in the conversation and still need acknowledging.
pub fn unread_counts(messages: &[Message], self_id: &str) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for message in messages {
        if message.to.as_deref() != Some(self_id) {
            continue;
        }
        if message.status == MessageStatus::Read {
            continue;
        }
        *counts.entry(message.from.clone()).or_insert(0u32) += 1;
    }
    counts
}

/// Order peers for display: unread count descending, then online peers
/// first, then display name ascending (user id as a final stable
/// tie-break).
pub fn order_peers(
    peers: &[Peer],
    unread: &HashMap<String, u32>,
    presence: &HashMap<String, PresenceRecord>,
) -> Vec<String> {
    let mut ordered: Vec<&Peer> = peers.iter().collect();
    ordered.sort_by(|a, b| {
        let unread_a = unread.get(&a.user_id).copied().unwrap_or(0);
        let unread_b = unread.get(&b.user_id).copied().unwrap_or(0);
        let online_a = presence.get(&a.user_id).map(|p| p.online).unwrap_or(false);
        let online_b = presence.get(&b.user_id).map(|p| p.online).unwrap_or(false);
        unread_b
            .cmp(&unread_a)
            .then(online_b.cmp(&online_a))
            .then_with(|| a.display_name.cmp(&b.display_name))
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    ordered.into_iter().map(|p| p.user_id.clone()).collect()
}
