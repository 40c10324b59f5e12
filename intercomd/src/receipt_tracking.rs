//! Shared bookkeeping for in-flight message receipts.
//!
//! A `process_group_messages` run (or a message piped into one via IPC)
//! covers a *window* of inbound messages. This module tracks, per chat
//! JID, which `(external_message_id, trace_id)` pairs belong to the
//! window currently in flight so that:
//! - a follow-up piped into a running container extends the window
//!   instead of starting an untracked one, and
//! - the queue's `onMaxRetriesExceeded` callback (which only knows the
//!   group JID, not which messages it was processing) can dead-letter
//!   the right receipts.

use std::collections::HashMap;
use std::sync::Arc;

use intercom_core::{NewMessage, PgPool, trace_id};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct InFlightMessage {
    pub external_message_id: String,
    pub trace_id: String,
}

/// `chat_jid -> window of receipts currently in flight for that group`.
pub type ActiveTraces = Arc<RwLock<HashMap<String, Vec<InFlightMessage>>>>;

pub fn new_active_traces() -> ActiveTraces {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Mint (or no-op if already present) a `RECEIVED` receipt for each message,
/// returning their `(external_message_id, trace_id)` pairs.
pub async fn mint_receipts(pool: &PgPool, chat_jid: &str, messages: &[NewMessage]) -> Vec<InFlightMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for msg in messages {
        let trace = trace_id(chat_jid, &msg.id);
        if let Err(e) = pool.upsert_receipt(chat_jid, &msg.id, &trace, "user").await {
            warn!(chat_jid, external_message_id = msg.id.as_str(), err = %e, "failed to mint receipt");
        }
        out.push(InFlightMessage {
            external_message_id: msg.id.clone(),
            trace_id: trace,
        });
    }
    out
}

/// Move a set of receipts to `QUEUED` and merge them into the group's
/// in-flight window (deduplicated by trace id).
pub async fn mark_queued_and_track(pool: &PgPool, active: &ActiveTraces, chat_jid: &str, items: &[InFlightMessage]) {
    for item in items {
        if let Err(e) = pool.set_receipt_status(&item.trace_id, "QUEUED", None, None).await {
            warn!(chat_jid, trace_id = item.trace_id.as_str(), err = %e, "failed to mark receipt queued");
        }
    }
    let mut guard = active.write().await;
    let entry = guard.entry(chat_jid.to_string()).or_default();
    for item in items {
        if !entry.iter().any(|e| e.trace_id == item.trace_id) {
            entry.push(item.clone());
        }
    }
}

/// Replace the group's in-flight window outright (used at the start of a
/// `process_group_messages` run, which authoritatively owns the window it
/// is about to process).
pub async fn set_window(active: &ActiveTraces, chat_jid: &str, items: Vec<InFlightMessage>) {
    active.write().await.insert(chat_jid.to_string(), items);
}

/// Take (and clear) the group's current in-flight window.
pub async fn take_window(active: &ActiveTraces, chat_jid: &str) -> Vec<InFlightMessage> {
    active.write().await.remove(chat_jid).unwrap_or_default()
}

/// Peek the group's current in-flight window without clearing it.
pub async fn peek_window(active: &ActiveTraces, chat_jid: &str) -> Vec<InFlightMessage> {
    active.read().await.get(chat_jid).cloned().unwrap_or_default()
}

/// Dead-letter every receipt in the group's in-flight window and clear it.
/// Used by the queue's `onMaxRetriesExceeded` callback, which only knows the
/// group JID — the window tells it which messages were actually in flight.
pub async fn dead_letter_window(pool: &PgPool, active: &ActiveTraces, chat_jid: &str, reason: &str) {
    for item in take_window(active, chat_jid).await {
        if let Err(e) = pool
            .dead_letter(&item.trace_id, chat_jid, &item.external_message_id, reason, None, true)
            .await
        {
            warn!(trace_id = item.trace_id.as_str(), err = %e, "failed to write dead letter");
        }
        if let Err(e) = pool.set_receipt_status(&item.trace_id, "DEAD_LETTERED", Some(reason), None).await {
            warn!(trace_id = item.trace_id.as_str(), err = %e, "failed to mark receipt dead lettered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_and_take_window_roundtrip() {
        let active = new_active_traces();
        set_window(
            &active,
            "tg:1",
            vec![InFlightMessage {
                external_message_id: "m1".into(),
                trace_id: "abc".into(),
            }],
        )
        .await;
        let taken = take_window(&active, "tg:1").await;
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].trace_id, "abc");
        assert!(take_window(&active, "tg:1").await.is_empty());
    }

    #[tokio::test]
    async fn peek_does_not_clear() {
        let active = new_active_traces();
        set_window(
            &active,
            "tg:1",
            vec![InFlightMessage {
                external_message_id: "m1".into(),
                trace_id: "abc".into(),
            }],
        )
        .await;
        assert_eq!(peek_window(&active, "tg:1").await.len(), 1);
        assert_eq!(peek_window(&active, "tg:1").await.len(), 1);
    }
}
