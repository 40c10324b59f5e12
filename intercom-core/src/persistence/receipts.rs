use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio_postgres::Client;

use super::{PgPool, format_ts};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReceipt {
    pub trace_id: String,
    pub chat_jid: String,
    pub external_message_id: String,
    pub lane: String,
    pub status: String,
    pub attempt_count: i32,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    pub received_at: String,
    pub queued_at: Option<String>,
    pub started_at: Option<String>,
    pub replied_at: Option<String>,
    pub timeout_at: Option<String>,
    pub dead_lettered_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub trace_id: String,
    pub attempt_no: i32,
    pub container_name: Option<String>,
    pub run_started_at: String,
    pub run_ended_at: Option<String>,
    pub exit_code: Option<i32>,
    pub timeout_hit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub trace_id: String,
    pub chat_jid: String,
    pub external_message_id: String,
    pub reason: String,
    pub final_error: Option<String>,
    pub retryable: bool,
    pub status: String,
    pub created_at: String,
    pub retried_at: Option<String>,
    pub retried_by: Option<String>,
}

pub(super) async fn ensure_schema(client: &Client) -> anyhow::Result<()> {
    client
        .batch_execute(
            "\
            CREATE TABLE IF NOT EXISTS message_receipts (
              trace_id TEXT PRIMARY KEY,
              chat_jid TEXT NOT NULL,
              external_message_id TEXT NOT NULL,
              lane TEXT NOT NULL DEFAULT 'user',
              status TEXT NOT NULL DEFAULT 'RECEIVED',
              attempt_count INTEGER NOT NULL DEFAULT 0,
              error_code TEXT,
              error_detail TEXT,
              received_at TIMESTAMPTZ NOT NULL DEFAULT now(),
              queued_at TIMESTAMPTZ,
              started_at TIMESTAMPTZ,
              replied_at TIMESTAMPTZ,
              timeout_at TIMESTAMPTZ,
              dead_lettered_at TIMESTAMPTZ,
              UNIQUE (chat_jid, external_message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_receipts_status ON message_receipts(status);

            CREATE TABLE IF NOT EXISTS attempts (
              trace_id TEXT NOT NULL REFERENCES message_receipts(trace_id) ON DELETE CASCADE,
              attempt_no INTEGER NOT NULL,
              container_name TEXT,
              run_started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
              run_ended_at TIMESTAMPTZ,
              exit_code INTEGER,
              timeout_hit BOOLEAN NOT NULL DEFAULT FALSE,
              PRIMARY KEY (trace_id, attempt_no)
            );

            CREATE TABLE IF NOT EXISTS dead_letters (
              trace_id TEXT PRIMARY KEY,
              chat_jid TEXT NOT NULL,
              external_message_id TEXT NOT NULL,
              reason TEXT NOT NULL,
              final_error TEXT,
              retryable BOOLEAN NOT NULL DEFAULT TRUE,
              status TEXT NOT NULL DEFAULT 'open',
              created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
              retried_at TIMESTAMPTZ,
              retried_by TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_dead_letters_status ON dead_letters(status);
            ",
        )
        .await
        .context("failed to create receipts schema")
}

impl PgPool {
    pub async fn upsert_receipt(&self, chat_jid: &str, external_message_id: &str, trace_id: &str, lane: &str) -> anyhow::Result<()> {
        self.with_client(|client| {
            let chat_jid = chat_jid.to_string();
            let external_message_id = external_message_id.to_string();
            let trace_id = trace_id.to_string();
            let lane = lane.to_string();
            Box::pin(async move {
                client
                    .execute(
                        "\
                        INSERT INTO message_receipts (trace_id, chat_jid, external_message_id, lane)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (trace_id) DO NOTHING
                        ",
                        &[&trace_id, &chat_jid, &external_message_id, &lane],
                    )
                    .await
                    .context("upsert_receipt")?;
                Ok(())
            })
        })
        .await
    }

    pub async fn set_receipt_status(
        &self,
        trace_id: &str,
        status: &str,
        error_code: Option<&str>,
        error_detail: Option<&str>,
    ) -> anyhow::Result<()> {
        self.with_client(|client| {
            let trace_id = trace_id.to_string();
            let status = status.to_string();
            let error_code = error_code.map(|s| s.to_string());
            let error_detail = error_detail.map(|s| s.to_string());
            Box::pin(async move {
                let timestamp_col = match status.as_str() {
                    "QUEUED" => Some("queued_at"),
                    "RUNNING" => Some("started_at"),
                    "REPLIED" => Some("replied_at"),
                    "DEAD_LETTERED" => Some("dead_lettered_at"),
                    _ => None,
                };
                let sql = if let Some(col) = timestamp_col {
                    format!(
                        "UPDATE message_receipts SET status = $1, error_code = $2, error_detail = $3, {col} = now() WHERE trace_id = $4"
                    )
                } else {
                    "UPDATE message_receipts SET status = $1, error_code = $2, error_detail = $3 WHERE trace_id = $4".to_string()
                };
                client
                    .execute(&sql, &[&status, &error_code, &error_detail, &trace_id])
                    .await
                    .context("set_receipt_status")?;
                if status == "REPLIED" {
                    client
                        .execute(
                            "UPDATE message_receipts SET error_code = NULL, error_detail = NULL WHERE trace_id = $1",
                            &[&trace_id],
                        )
                        .await
                        .context("clear_receipt_error")?;
                }
                Ok(())
            })
        })
        .await
    }

    /// Stamp `timeout_at` on a receipt whose current attempt hit the
    /// container runner's watchdog. Does not change `status` — the caller
    /// still drives the usual RETRYING/FAILED transition separately.
    pub async fn mark_receipt_timeout(&self, trace_id: &str) -> anyhow::Result<()> {
        self.with_client(|client| {
            let trace_id = trace_id.to_string();
            Box::pin(async move {
                client
                    .execute(
                        "UPDATE message_receipts SET timeout_at = now() WHERE trace_id = $1",
                        &[&trace_id],
                    )
                    .await
                    .context("mark_receipt_timeout")?;
                Ok(())
            })
        })
        .await
    }

    pub async fn record_attempt_start(&self, trace_id: &str, container_name: Option<&str>) -> anyhow::Result<i32> {
        self.with_client(|client| {
            let trace_id = trace_id.to_string();
            let container_name = container_name.map(|s| s.to_string());
            Box::pin(async move {
                let row = client
                    .query_one(
                        "\
                        UPDATE message_receipts SET attempt_count = attempt_count + 1
                        WHERE trace_id = $1 RETURNING attempt_count
                        ",
                        &[&trace_id],
                    )
                    .await
                    .context("bump_attempt_count")?;
                let attempt_no: i32 = row.get("attempt_count");
                client
                    .execute(
                        "\
                        INSERT INTO attempts (trace_id, attempt_no, container_name)
                        VALUES ($1, $2, $3)
                        ",
                        &[&trace_id, &attempt_no, &container_name],
                    )
                    .await
                    .context("record_attempt_start")?;
                Ok(attempt_no)
            })
        })
        .await
    }

    pub async fn record_attempt_end(
        &self,
        trace_id: &str,
        attempt_no: i32,
        exit_code: Option<i32>,
        timeout_hit: bool,
    ) -> anyhow::Result<()> {
        self.with_client(|client| {
            let trace_id = trace_id.to_string();
            Box::pin(async move {
                client
                    .execute(
                        "\
                        UPDATE attempts SET run_ended_at = now(), exit_code = $3, timeout_hit = $4
                        WHERE trace_id = $1 AND attempt_no = $2
                        ",
                        &[&trace_id, &attempt_no, &exit_code, &timeout_hit],
                    )
                    .await
                    .context("record_attempt_end")?;
                Ok(())
            })
        })
        .await
    }

    pub async fn dead_letter(
        &self,
        trace_id: &str,
        chat_jid: &str,
        external_message_id: &str,
        reason: &str,
        final_error: Option<&str>,
        retryable: bool,
    ) -> anyhow::Result<()> {
        self.with_client(|client| {
            let trace_id = trace_id.to_string();
            let chat_jid = chat_jid.to_string();
            let external_message_id = external_message_id.to_string();
            let reason = reason.to_string();
            let final_error = final_error.map(|s| s.to_string());
            Box::pin(async move {
                client
                    .execute(
                        "\
                        INSERT INTO dead_letters (trace_id, chat_jid, external_message_id, reason, final_error, retryable)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        ON CONFLICT (trace_id) DO UPDATE SET
                          reason = EXCLUDED.reason, final_error = EXCLUDED.final_error,
                          retryable = EXCLUDED.retryable, status = 'open'
                        ",
                        &[&trace_id, &chat_jid, &external_message_id, &reason, &final_error, &retryable],
                    )
                    .await
                    .context("dead_letter")?;
                Ok(())
            })
        })
        .await
    }

    /// Atomically claim an open dead-letter for retry: only one caller wins.
    pub async fn claim_dead_letter_retry(&self, trace_id: &str, retried_by: &str) -> anyhow::Result<bool> {
        self.with_client(|client| {
            let trace_id = trace_id.to_string();
            let retried_by = retried_by.to_string();
            Box::pin(async move {
                let count = client
                    .execute(
                        "\
                        UPDATE dead_letters SET status = 'retrying', retried_at = now(), retried_by = $2
                        WHERE trace_id = $1 AND status = 'open'
                        ",
                        &[&trace_id, &retried_by],
                    )
                    .await
                    .context("claim_dead_letter_retry")?;
                Ok(count == 1)
            })
        })
        .await
    }

    pub async fn get_dead_letter(&self, trace_id: &str) -> anyhow::Result<Option<DeadLetter>> {
        self.with_client(|client| {
            let trace_id = trace_id.to_string();
            Box::pin(async move {
                let row = client
                    .query_opt("SELECT * FROM dead_letters WHERE trace_id = $1", &[&trace_id])
                    .await
                    .context("get_dead_letter")?;
                Ok(row.map(|r| DeadLetter {
                    trace_id: r.get("trace_id"),
                    chat_jid: r.get("chat_jid"),
                    external_message_id: r.get("external_message_id"),
                    reason: r.get("reason"),
                    final_error: r.get("final_error"),
                    retryable: r.get("retryable"),
                    status: r.get("status"),
                    created_at: format_ts(r.get("created_at")),
                    retried_at: r.get::<_, Option<std::time::SystemTime>>("retried_at").map(format_ts),
                    retried_by: r.get("retried_by"),
                }))
            })
        })
        .await
    }

    pub async fn reopen_dead_letter(&self, trace_id: &str) -> anyhow::Result<()> {
        self.with_client(|client| {
            let trace_id = trace_id.to_string();
            Box::pin(async move {
                client
                    .execute(
                        "UPDATE dead_letters SET status = 'open' WHERE trace_id = $1",
                        &[&trace_id],
                    )
                    .await
                    .context("reopen_dead_letter")?;
                Ok(())
            })
        })
        .await
    }

    pub async fn resolve_dead_letter(&self, trace_id: &str) -> anyhow::Result<()> {
        self.with_client(|client| {
            let trace_id = trace_id.to_string();
            Box::pin(async move {
                client
                    .execute(
                        "UPDATE dead_letters SET status = 'resolved' WHERE trace_id = $1",
                        &[&trace_id],
                    )
                    .await
                    .context("resolve_dead_letter")?;
                Ok(())
            })
        })
        .await
    }

    /// Receipts left mid-flight (RECEIVED/QUEUED/RUNNING) when the process
    /// last stopped. Called once at startup to re-enqueue them.
    pub async fn find_interrupted_receipts(&self) -> anyhow::Result<Vec<MessageReceipt>> {
        self.with_client(|client| {
            Box::pin(async move {
                let rows = client
                    .query(
                        "SELECT * FROM message_receipts WHERE status IN ('RECEIVED', 'QUEUED', 'RUNNING')",
                        &[],
                    )
                    .await
                    .context("find_interrupted_receipts")?;
                Ok(rows.iter().map(row_to_receipt).collect())
            })
        })
        .await
    }
}

fn row_to_receipt(r: &tokio_postgres::Row) -> MessageReceipt {
    MessageReceipt {
        trace_id: r.get("trace_id"),
        chat_jid: r.get("chat_jid"),
        external_message_id: r.get("external_message_id"),
        lane: r.get("lane"),
        status: r.get("status"),
        attempt_count: r.get("attempt_count"),
        error_code: r.get("error_code"),
        error_detail: r.get("error_detail"),
        received_at: format_ts(r.get("received_at")),
        queued_at: r.get::<_, Option<std::time::SystemTime>>("queued_at").map(format_ts),
        started_at: r.get::<_, Option<std::time::SystemTime>>("started_at").map(format_ts),
        replied_at: r.get::<_, Option<std::time::SystemTime>>("replied_at").map(format_ts),
        timeout_at: r.get::<_, Option<std::time::SystemTime>>("timeout_at").map(format_ts),
        dead_lettered_at: r.get::<_, Option<std::time::SystemTime>>("dead_lettered_at").map(format_ts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_serde_roundtrip() {
        let receipt = MessageReceipt {
            trace_id: "abc123".to_string(),
            chat_jid: "tg:1".to_string(),
            external_message_id: "m1".to_string(),
            lane: "user".to_string(),
            status: "RECEIVED".to_string(),
            attempt_count: 0,
            error_code: None,
            error_detail: None,
            received_at: "2024-01-01T00:00:00.000Z".to_string(),
            queued_at: None,
            started_at: None,
            replied_at: None,
            timeout_at: None,
            dead_lettered_at: None,
        };
        let json = serde_json::to_string(&receipt).unwrap();
        let parsed: MessageReceipt = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.trace_id, "abc123");
    }
}
