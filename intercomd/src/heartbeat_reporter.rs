//! Daemon-health Heartbeat Reporter — periodic and event-driven signals about
//! intercomd itself, distinct from the user-facing Smart-Job Runner in
//! `heartbeat_runner.rs`.
//!
//! Shares the scheduler's poll-loop-with-shutdown-watch shape. Three signals:
//! - *scheduled*: a one-line status digest every `report_interval`, unless
//!   `silent` suppresses routine reports
//! - *silence*: fires once after `silence_threshold` with no movement on the
//!   global message cursor (`router_state["last_timestamp"]`, the same cursor
//!   the message loop advances on every accepted inbound message), resets
//!   the moment the cursor moves again
//! - *escalated*: fires once while the Docker health probe has been
//!   unhealthy, or the spawn circuit has been open, continuously for
//!   `escalation_threshold`; does not repeat until the condition clears and
//!   re-triggers

use std::sync::Arc;
use std::time::{Duration, Instant};

use intercom_core::PgPool;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::container::resilience::DockerResilience;
use crate::telegram::TelegramBridge;

/// Configuration for the heartbeat reporter loop.
#[derive(Debug, Clone)]
pub struct HeartbeatReporterConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub report_interval: Duration,
    pub silence_threshold: Duration,
    pub escalation_threshold: Duration,
    pub silent: bool,
    pub notification_jid: Option<String>,
}

/// Point-in-time snapshot the reporter composes its routine digest from.
#[derive(Debug, Clone, Copy)]
pub struct ReporterStatus {
    pub registered_groups: usize,
    pub active_containers: usize,
    pub queue_depth: usize,
}

/// Callback supplying a fresh status snapshot on each scheduled digest.
pub type StatusFn = Arc<
    dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = ReporterStatus> + Send>> + Send + Sync,
>;

pub struct HeartbeatReporter {
    config: HeartbeatReporterConfig,
    pool: PgPool,
    telegram: Arc<TelegramBridge>,
    resilience: Option<Arc<DockerResilience>>,
    status_fn: StatusFn,
}

impl HeartbeatReporter {
    pub fn new(
        config: HeartbeatReporterConfig,
        pool: PgPool,
        telegram: Arc<TelegramBridge>,
        resilience: Option<Arc<DockerResilience>>,
        status_fn: StatusFn,
    ) -> Self {
        Self {
            config,
            pool,
            telegram,
            resilience,
            status_fn,
        }
    }

    /// Run the reporter loop. Exits when `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("heartbeat reporter disabled, skipping loop");
            return;
        }
        let jid = match &self.config.notification_jid {
            Some(jid) if !jid.is_empty() => jid.clone(),
            _ => {
                warn!("heartbeat reporter enabled but no notification_jid configured, skipping");
                return;
            }
        };
        info!(
            report_interval_ms = self.config.report_interval.as_millis(),
            silence_threshold_ms = self.config.silence_threshold.as_millis(),
            "heartbeat reporter loop started"
        );

        let mut last_cursor = self.current_cursor().await;
        let mut last_cursor_moved_at = Instant::now();
        let mut last_report_at = Instant::now();
        let mut silence_fired = false;
        let mut escalation_fired = false;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("heartbeat reporter loop shutting down");
                        return;
                    }
                }
            }

            let cursor = self.current_cursor().await;
            if cursor != last_cursor {
                last_cursor = cursor;
                last_cursor_moved_at = Instant::now();
                silence_fired = false;
            } else if !silence_fired && last_cursor_moved_at.elapsed() >= self.config.silence_threshold {
                silence_fired = true;
                self.send(
                    &jid,
                    &format!(
                        "Quiet period: no inbound messages accepted across any group in over {}.",
                        humanize(self.config.silence_threshold)
                    ),
                )
                .await;
            }

            let escalated = self.escalated().await;
            if escalated && !escalation_fired {
                escalation_fired = true;
                self.send(
                    &jid,
                    "Escalated: docker health probe unhealthy or the spawn circuit has been open continuously — containers may not be dispatching.",
                )
                .await;
            } else if !escalated {
                escalation_fired = false;
            }

            if !self.config.silent && last_report_at.elapsed() >= self.config.report_interval {
                last_report_at = Instant::now();
                let status = (self.status_fn)().await;
                self.send(
                    &jid,
                    &format!(
                        "Status: {} registered groups, {} active containers, queue depth {}.",
                        status.registered_groups, status.active_containers, status.queue_depth
                    ),
                )
                .await;
            }
        }
    }

    async fn current_cursor(&self) -> String {
        self.pool
            .get_router_state("last_timestamp")
            .await
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    async fn escalated(&self) -> bool {
        let Some(resilience) = &self.resilience else {
            return false;
        };
        let unhealthy = resilience
            .unhealthy_duration()
            .await
            .is_some_and(|d| d >= self.config.escalation_threshold);
        let circuit_open = resilience
            .circuit_open_duration()
            .await
            .is_some_and(|d| d >= self.config.escalation_threshold);
        unhealthy || circuit_open
    }

    async fn send(&self, jid: &str, text: &str) {
        if let Err(e) = self.telegram.send_text_to_jid(jid, text).await {
            warn!(err = %e, "failed to deliver heartbeat reporter notice");
        }
    }
}

fn humanize(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humanize_scales_units() {
        assert_eq!(humanize(Duration::from_secs(30)), "30s");
        assert_eq!(humanize(Duration::from_secs(120)), "2m");
        assert_eq!(humanize(Duration::from_secs(7200)), "2h");
    }

    #[test]
    fn default_disabled_config_has_no_notification_jid() {
        let cfg = HeartbeatReporterConfig {
            enabled: false,
            poll_interval: Duration::from_secs(60),
            report_interval: Duration::from_secs(3600),
            silence_threshold: Duration::from_secs(21_600),
            escalation_threshold: Duration::from_secs(900),
            silent: false,
            notification_jid: None,
        };
        assert!(!cfg.enabled);
        assert!(cfg.notification_jid.is_none());
    }
}
