use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio_postgres::Client;

use super::{PgPool, format_ts};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatJob {
    pub id: String,
    pub chat_jid: String,
    pub label: String,
    pub prompt: String,
    pub category: String,
    pub status: String,
    pub interval_ms: Option<i64>,
    pub last_run: Option<String>,
    pub last_result: Option<String>,
    pub created_at: String,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatJobLog {
    pub job_id: String,
    pub run_at: String,
    pub status: String,
    pub result: Option<String>,
    pub duration_ms: i64,
    pub error: Option<String>,
}

pub(super) async fn ensure_schema(client: &Client) -> anyhow::Result<()> {
    client
        .batch_execute(
            "\
            CREATE TABLE IF NOT EXISTS heartbeat_jobs (
              id TEXT PRIMARY KEY,
              chat_jid TEXT NOT NULL,
              label TEXT NOT NULL,
              prompt TEXT NOT NULL,
              category TEXT NOT NULL DEFAULT 'custom',
              status TEXT NOT NULL DEFAULT 'active',
              interval_ms BIGINT,
              last_run TIMESTAMPTZ,
              last_result TEXT,
              created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
              created_by TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_heartbeat_jobs_status ON heartbeat_jobs(status);

            CREATE TABLE IF NOT EXISTS heartbeat_job_logs (
              id SERIAL PRIMARY KEY,
              job_id TEXT NOT NULL REFERENCES heartbeat_jobs(id) ON DELETE CASCADE,
              run_at TIMESTAMPTZ NOT NULL DEFAULT now(),
              status TEXT NOT NULL,
              result TEXT,
              duration_ms BIGINT NOT NULL,
              error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_heartbeat_job_logs_job ON heartbeat_job_logs(job_id, run_at);
            ",
        )
        .await
        .context("failed to create heartbeat schema")
}

const RUNNING_SENTINEL: &str = "__RUNNING__";

impl PgPool {
    pub async fn create_heartbeat_job(&self, job: &HeartbeatJob) -> anyhow::Result<()> {
        self.with_client(|client| {
            let job = job.clone();
            Box::pin(async move {
                client
                    .execute(
                        "\
                        INSERT INTO heartbeat_jobs (id, chat_jid, label, prompt, category, status, interval_ms, created_by)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                        ",
                        &[
                            &job.id, &job.chat_jid, &job.label, &job.prompt, &job.category,
                            &job.status, &job.interval_ms, &job.created_by,
                        ],
                    )
                    .await
                    .context("create_heartbeat_job")?;
                Ok(())
            })
        })
        .await
    }

    pub async fn get_heartbeat_job(&self, id: &str) -> anyhow::Result<Option<HeartbeatJob>> {
        self.with_client(|client| {
            let id = id.to_string();
            Box::pin(async move {
                let row = client
                    .query_opt("SELECT * FROM heartbeat_jobs WHERE id = $1", &[&id])
                    .await
                    .context("get_heartbeat_job")?;
                Ok(row.map(|r| row_to_job(&r)))
            })
        })
        .await
    }

    pub async fn remove_heartbeat_job(&self, id: &str) -> anyhow::Result<()> {
        self.with_client(|client| {
            let id = id.to_string();
            Box::pin(async move {
                client
                    .execute("DELETE FROM heartbeat_jobs WHERE id = $1", &[&id])
                    .await
                    .context("remove_heartbeat_job")?;
                Ok(())
            })
        })
        .await
    }

    pub async fn set_heartbeat_job_status(&self, id: &str, status: &str) -> anyhow::Result<()> {
        self.with_client(|client| {
            let id = id.to_string();
            let status = status.to_string();
            Box::pin(async move {
                client
                    .execute(
                        "UPDATE heartbeat_jobs SET status = $2 WHERE id = $1",
                        &[&id, &status],
                    )
                    .await
                    .context("set_heartbeat_job_status")?;
                Ok(())
            })
        })
        .await
    }

    /// Patch the mutable fields of a heartbeat job. `None` fields are left untouched.
    pub async fn update_heartbeat_job(
        &self,
        id: &str,
        label: Option<&str>,
        prompt: Option<&str>,
        interval_ms: Option<i64>,
    ) -> anyhow::Result<()> {
        self.with_client(|client| {
            let id = id.to_string();
            let label = label.map(|s| s.to_string());
            let prompt = prompt.map(|s| s.to_string());
            Box::pin(async move {
                client
                    .execute(
                        "\
                        UPDATE heartbeat_jobs SET
                          label = COALESCE($2, label),
                          prompt = COALESCE($3, prompt),
                          interval_ms = COALESCE($4, interval_ms)
                        WHERE id = $1
                        ",
                        &[&id, &label, &prompt, &interval_ms],
                    )
                    .await
                    .context("update_heartbeat_job")?;
                Ok(())
            })
        })
        .await
    }

    pub async fn get_all_heartbeat_jobs(&self) -> anyhow::Result<Vec<HeartbeatJob>> {
        self.with_client(|client| {
            Box::pin(async move {
                let rows = client
                    .query("SELECT * FROM heartbeat_jobs ORDER BY created_at", &[])
                    .await
                    .context("get_all_heartbeat_jobs")?;
                Ok(rows.iter().map(row_to_job).collect())
            })
        })
        .await
    }

    /// Jobs due to run: active, and either never run or past `last_run + interval`.
    /// `default_interval_ms` backstops jobs with no explicit interval.
    pub async fn get_due_heartbeat_jobs(&self, default_interval_ms: i64) -> anyhow::Result<Vec<HeartbeatJob>> {
        self.with_client(|client| {
            Box::pin(async move {
                let rows = client
                    .query(
                        "\
                        SELECT * FROM heartbeat_jobs
                        WHERE status = 'active'
                          AND (
                            last_run IS NULL
                            OR last_run <= now() - (COALESCE(interval_ms, $1) || ' milliseconds')::interval
                          )
                        ORDER BY last_run NULLS FIRST
                        ",
                        &[&default_interval_ms],
                    )
                    .await
                    .context("get_due_heartbeat_jobs")?;
                Ok(rows.iter().map(row_to_job).collect())
            })
        })
        .await
    }

    /// Claim a job before executing it by writing the running sentinel.
    /// Returns false if another caller already claimed it.
    pub async fn claim_heartbeat_job(&self, id: &str) -> anyhow::Result<bool> {
        self.with_client(|client| {
            let id = id.to_string();
            Box::pin(async move {
                let count = client
                    .execute(
                        "\
                        UPDATE heartbeat_jobs SET last_run = now(), last_result = $2
                        WHERE id = $1 AND status = 'active' AND COALESCE(last_result, '') != $2
                        ",
                        &[&id, &RUNNING_SENTINEL.to_string()],
                    )
                    .await
                    .context("claim_heartbeat_job")?;
                Ok(count == 1)
            })
        })
        .await
    }

    pub async fn finish_heartbeat_job(&self, id: &str, last_result: &str) -> anyhow::Result<()> {
        self.with_client(|client| {
            let id = id.to_string();
            let last_result = last_result.to_string();
            Box::pin(async move {
                client
                    .execute(
                        "UPDATE heartbeat_jobs SET last_result = $2 WHERE id = $1",
                        &[&id, &last_result],
                    )
                    .await
                    .context("finish_heartbeat_job")?;
                Ok(())
            })
        })
        .await
    }

    pub async fn log_heartbeat_run(&self, log: &HeartbeatJobLog) -> anyhow::Result<()> {
        self.with_client(|client| {
            let log = log.clone();
            Box::pin(async move {
                client
                    .execute(
                        "\
                        INSERT INTO heartbeat_job_logs (job_id, status, result, duration_ms, error)
                        VALUES ($1, $2, $3, $4, $5)
                        ",
                        &[&log.job_id, &log.status, &log.result, &log.duration_ms, &log.error],
                    )
                    .await
                    .context("log_heartbeat_run")?;
                Ok(())
            })
        })
        .await
    }

    /// On startup, any job stuck at the running sentinel means the process
    /// died mid-execution.
    pub async fn recover_interrupted_heartbeat_jobs(&self) -> anyhow::Result<u64> {
        self.with_client(|client| {
            Box::pin(async move {
                let count = client
                    .execute(
                        "\
                        UPDATE heartbeat_jobs
                        SET last_result = 'Error: process interrupted (recovered on restart)'
                        WHERE last_result = $1
                        ",
                        &[&RUNNING_SENTINEL.to_string()],
                    )
                    .await
                    .context("recover_interrupted_heartbeat_jobs")?;
                Ok(count)
            })
        })
        .await
    }
}

fn row_to_job(r: &tokio_postgres::Row) -> HeartbeatJob {
    HeartbeatJob {
        id: r.get("id"),
        chat_jid: r.get("chat_jid"),
        label: r.get("label"),
        prompt: r.get("prompt"),
        category: r.get("category"),
        status: r.get("status"),
        interval_ms: r.get("interval_ms"),
        last_run: r.get::<_, Option<std::time::SystemTime>>("last_run").map(format_ts),
        last_result: r.get("last_result"),
        created_at: format_ts(r.get("created_at")),
        created_by: r.get("created_by"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_serde_defaults() {
        let json = r#"{"id":"j1","chat_jid":"tg:1","label":"daily digest","prompt":"summarize","category":"monitor","status":"active","created_at":"2024-01-01T00:00:00Z"}"#;
        let job: HeartbeatJob = serde_json::from_str(json).unwrap();
        assert_eq!(job.category, "monitor");
        assert!(job.interval_ms.is_none());
    }
}
