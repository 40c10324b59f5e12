//! Dead-letter retry: the ops-facing "take this failed message off the
//! shelf and try again" operation (SPEC_FULL.md §8 scenario 6).
//!
//! `retry_dead_letter` is the single atomic step the spec describes:
//! claim the dead-letter row (only one caller wins), flip the receipt back
//! to `RETRYING`, and re-enqueue a message check on that chat. If the queue
//! rejects the re-enqueue because it's at capacity, the dead-letter row is
//! re-opened with `FAILED_QUEUE_FULL` rather than left claimed-but-stuck.

use intercom_core::PgPool;
use tracing::warn;

use crate::queue::GroupQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlqRetryOutcome {
    /// Claimed and successfully re-enqueued.
    Retrying,
    /// No open dead-letter row with this trace id (already retried/resolved, or unknown).
    NotClaimed,
    /// Claimed, but the queue was full — reopened as `FAILED_QUEUE_FULL`.
    QueueFull,
}

pub async fn retry_dead_letter(
    pool: &PgPool,
    queue: &GroupQueue,
    trace_id: &str,
    retried_by: &str,
) -> anyhow::Result<DlqRetryOutcome> {
    let claimed = pool.claim_dead_letter_retry(trace_id, retried_by).await?;
    if !claimed {
        return Ok(DlqRetryOutcome::NotClaimed);
    }

    let dead_letter = match pool.get_dead_letter(trace_id).await? {
        Some(dl) => dl,
        None => {
            warn!(trace_id, "claimed dead letter row vanished before retry could read it");
            return Ok(DlqRetryOutcome::NotClaimed);
        }
    };

    pool.set_receipt_status(trace_id, "RETRYING", None, None).await?;

    // DLQ retries are ops-initiated, not tied to the main group's priority.
    let accepted = queue.enqueue_message_check(&dead_letter.chat_jid, false).await;
    if !accepted {
        pool.set_receipt_status(trace_id, "RETRYING", Some("FAILED_QUEUE_FULL"), Some("queue full on DLQ retry"))
            .await?;
        pool.reopen_dead_letter(trace_id).await?;
        return Ok(DlqRetryOutcome::QueueFull);
    }

    Ok(DlqRetryOutcome::Retrying)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_variants_distinct() {
        assert_ne!(DlqRetryOutcome::Retrying, DlqRetryOutcome::NotClaimed);
        assert_ne!(DlqRetryOutcome::Retrying, DlqRetryOutcome::QueueFull);
    }
}
