//! Smart-Job Runner — polls Postgres for due heartbeat jobs (recurring *AI*
//! jobs, distinct from the daemon-health Heartbeat Reporter in
//! `heartbeat_reporter.rs`) and executes them with bounded concurrency.
//!
//! Shares the scheduler's poll/claim/shutdown-watch shape: `claim_heartbeat_job`
//! is the same atomic single-winner gate `claim_task` is for scheduled tasks,
//! just keyed on a running-sentinel string instead of a far-future timestamp.

use std::sync::Arc;
use std::time::Duration;

use intercom_core::{HeartbeatJob, HeartbeatJobLog, PgPool};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Configuration for the heartbeat job poll loop.
#[derive(Debug, Clone)]
pub struct HeartbeatRunnerConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub default_interval_ms: i64,
    pub job_timeout: Duration,
    pub batch_concurrency: usize,
}

/// Callback invoked to actually run a due job's prompt through a container.
/// Returns `Ok(summary)` on success, `Err(message)` on failure.
pub type JobExecutor =
    Arc<dyn Fn(HeartbeatJob) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, String>> + Send>> + Send + Sync>;

/// Run the smart-job poll loop. Exits when `shutdown` fires.
pub async fn run_heartbeat_runner_loop(
    config: HeartbeatRunnerConfig,
    pool: PgPool,
    executor: JobExecutor,
    mut shutdown: watch::Receiver<bool>,
) {
    if !config.enabled {
        info!("smart-job runner disabled, skipping loop");
        return;
    }
    info!(
        poll_interval_ms = config.poll_interval.as_millis(),
        batch_concurrency = config.batch_concurrency,
        "smart-job runner loop started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("smart-job runner loop shutting down");
                    return;
                }
            }
        }

        let due = match pool.get_due_heartbeat_jobs(config.default_interval_ms).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(err = %e, "failed to query due heartbeat jobs");
                continue;
            }
        };
        if due.is_empty() {
            continue;
        }
        debug!(count = due.len(), "found due heartbeat jobs");

        for chunk in due.chunks(config.batch_concurrency) {
            let mut handles = Vec::with_capacity(chunk.len());
            for job in chunk {
                let job = job.clone();
                let pool = pool.clone();
                let executor = executor.clone();
                let timeout = config.job_timeout;
                handles.push(tokio::spawn(async move {
                    run_one_job(pool, executor, job, timeout).await;
                }));
            }
            for h in handles {
                let _ = h.await;
            }
        }
    }
}

async fn run_one_job(pool: PgPool, executor: JobExecutor, job: HeartbeatJob, timeout: Duration) {
    match pool.claim_heartbeat_job(&job.id).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(job_id = %job.id, "heartbeat job already claimed, skipping");
            return;
        }
        Err(e) => {
            error!(job_id = %job.id, err = %e, "failed to claim heartbeat job");
            return;
        }
    }

    let start = std::time::Instant::now();
    let outcome = tokio::time::timeout(timeout, executor(job.clone())).await;

    let (status, last_result, error) = match outcome {
        Ok(Ok(summary)) => ("ok", summary, None),
        Ok(Err(msg)) => ("error", format!("Error: {msg}"), Some(msg)),
        Err(_) => {
            let msg = format!("timed out after {}ms", timeout.as_millis());
            ("error", format!("Error: {msg}"), Some(msg))
        }
    };

    if let Err(e) = pool.finish_heartbeat_job(&job.id, &last_result).await {
        warn!(job_id = %job.id, err = %e, "failed to finish heartbeat job");
    }

    let log = HeartbeatJobLog {
        job_id: job.id.clone(),
        run_at: chrono::Utc::now().to_rfc3339(),
        status: status.to_string(),
        result: Some(last_result.clone()),
        duration_ms: start.elapsed().as_millis() as i64,
        error,
    };
    if let Err(e) = pool.log_heartbeat_run(&log).await {
        warn!(job_id = %job.id, err = %e, "failed to log heartbeat run");
    }

    if status == "ok" {
        info!(job_id = %job.id, label = %job.label, "heartbeat job completed");
    } else {
        warn!(job_id = %job.id, label = %job.label, result = %last_result, "heartbeat job failed");
    }
}

/// Recover jobs stuck at the running sentinel from an unclean shutdown.
/// Call once at startup before the poll loop begins.
pub async fn recover_interrupted_jobs(pool: &PgPool) {
    match pool.recover_interrupted_heartbeat_jobs().await {
        Ok(0) => {}
        Ok(n) => info!(count = n, "recovered interrupted heartbeat jobs from previous run"),
        Err(e) => error!(err = %e, "failed to recover interrupted heartbeat jobs"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_disabled_by_default() {
        let cfg = HeartbeatRunnerConfig {
            enabled: false,
            poll_interval: Duration::from_secs(30),
            default_interval_ms: 3_600_000,
            job_timeout: Duration::from_secs(600),
            batch_concurrency: 2,
        };
        assert!(!cfg.enabled);
        assert_eq!(cfg.batch_concurrency, 2);
    }
}
