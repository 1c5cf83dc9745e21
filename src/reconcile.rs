//! Reconciliation engine: the pure merge of a locally cached message list
//! with a server-fetched one.
//!
//! [`reconcile`] is the system's actual durability mechanism — the live
//! relay is best-effort and queues nothing, so every conversation converges
//! by re-fetching history and merging it into the local cache.  The merge
//! is deterministic and idempotent: `reconcile(reconcile(a, b), b) ==
//! reconcile(a, b)`.
//!
//! Merge rules for two entries with the same id:
//! - `status`: the higher-ranked status wins, unless the lower-ranked side
//!   carries a strictly later timestamp — then the later write wins
//!   (last-writer-wins with a monotonicity bias).
//! - `timestamp`: the max of both sides.
//! - soft deletion is sticky: once either side is deleted, the result is.
//! - every other field takes the remote (server) value as authoritative.
//!
//! Entries with an empty body, no attachments, and no deletion mark are
//! treated as corrupt, logged, and dropped.  That filter is defensive — it
//! never removes a legitimately deleted message.

use std::collections::HashMap;

use crate::protocol::{Message, MessageStatus};

/// Merge `local` and `remote` into one deduplicated, status-resolved list,
/// sorted ascending by timestamp (ties broken by id for determinism).
pub fn reconcile(local: &[Message], remote: &[Message]) -> Vec<Message> {
    let mut by_id: HashMap<String, Message> = HashMap::with_capacity(local.len() + remote.len());

    // Local entries first.  Duplicate ids inside one input are merged by the
    // same rules, so even dirty input yields an id-unique result.
    for message in local {
        insert_merging(&mut by_id, message);
    }
    for message in remote {
        insert_merging(&mut by_id, message);
    }

    let mut merged: Vec<Message> = by_id
        .into_values()
        .filter(|message| {
            if is_corrupt(message) {
                crate::plog!(
                    "reconcile: dropping corrupt entry {} (empty body, not deleted)",
                    crate::logging::msg_id(&message.id)
                );
                false
            } else {
                true
            }
        })
        .collect();

    merged.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    merged
}

fn insert_merging(by_id: &mut HashMap<String, Message>, incoming: &Message) {
    match by_id.get(&incoming.id) {
        Some(existing) => {
            let merged = merge_pair(existing, incoming);
            by_id.insert(incoming.id.clone(), merged);
        }
        None => {
            by_id.insert(incoming.id.clone(), incoming.clone());
        }
    }
}

/// Merge one id collision.  `incoming` plays the remote role: its fields
/// are authoritative except for status, timestamp, and the deletion mark.
fn merge_pair(existing: &Message, incoming: &Message) -> Message {
    let mut out = incoming.clone();
    out.status = resolve_status(existing, incoming);
    out.timestamp = existing.timestamp.max(incoming.timestamp);
    if existing.is_deleted || incoming.is_deleted {
        out.is_deleted = true;
        out.deleted_at = incoming.deleted_at.or(existing.deleted_at);
        // A deleted entry may legitimately have an empty body; keep whatever
        // content the authoritative side carries.
    }
    out
}

/// Status precedence with last-writer-wins bias: the higher rank wins
/// unless the lower-ranked side has a strictly later timestamp.
fn resolve_status(a: &Message, b: &Message) -> MessageStatus {
    let (high, low) = if b.status.rank() >= a.status.rank() {
        (b, a)
    } else {
        (a, b)
    };
    if low.timestamp > high.timestamp {
        low.status
    } else {
        high.status
    }
}

/// An entry with no body, no attachments, and no deletion mark carries no
/// information and cannot be rendered; treat it as corrupt.
fn is_corrupt(message: &Message) -> bool {
    message.text.is_empty() && message.attachments.is_empty() && !message.is_deleted
}
