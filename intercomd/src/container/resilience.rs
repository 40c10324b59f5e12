//! Docker daemon resilience: health probing, a spawn circuit breaker, and
//! orphan container sweeping.
//!
//! The Runner consults `DockerResilience::spawn_allowed` before every spawn
//! attempt; a tripped circuit or an unhealthy daemon both refuse new spawns
//! without touching `docker` again until their cooldown elapses.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const CONTAINER_RUNTIME_BIN: &str = "docker";

#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub health_probe_interval: Duration,
    pub spawn_circuit_threshold: usize,
    pub spawn_circuit_window: Duration,
    pub spawn_circuit_cooldown: Duration,
    pub orphan_sweep_interval: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            health_probe_interval: Duration::from_secs(30),
            spawn_circuit_threshold: 3,
            spawn_circuit_window: Duration::from_secs(60),
            spawn_circuit_cooldown: Duration::from_secs(120),
            orphan_sweep_interval: Duration::from_secs(300),
        }
    }
}

struct Inner {
    healthy: bool,
    unhealthy_since: Option<Instant>,
    circuit_open_until: Option<Instant>,
    circuit_opened_at: Option<Instant>,
    failure_timestamps: VecDeque<Instant>,
}

/// Tracks Docker daemon health and spawn failures, refusing spawns when the
/// daemon looks unwell or the circuit has tripped.
pub struct DockerResilience {
    inner: Arc<Mutex<Inner>>,
    config: ResilienceConfig,
}

impl DockerResilience {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                healthy: true,
                unhealthy_since: None,
                circuit_open_until: None,
                circuit_opened_at: None,
                failure_timestamps: VecDeque::new(),
            })),
            config,
        }
    }

    /// Whether the runner should attempt a spawn right now.
    pub async fn spawn_allowed(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.healthy {
            return false;
        }
        if let Some(until) = inner.circuit_open_until {
            if Instant::now() < until {
                return false;
            }
            inner.circuit_open_until = None;
            inner.circuit_opened_at = None;
            inner.failure_timestamps.clear();
        }
        true
    }

    /// Record a spawn outcome. A success resets the failure window; a
    /// failure may trip the circuit.
    pub async fn record_spawn_result(&self, success: bool) {
        let mut inner = self.inner.lock().await;
        if success {
            inner.failure_timestamps.clear();
            return;
        }

        let now = Instant::now();
        inner.failure_timestamps.push_back(now);
        let window = self.config.spawn_circuit_window;
        while let Some(&front) = inner.failure_timestamps.front() {
            if now.duration_since(front) > window {
                inner.failure_timestamps.pop_front();
            } else {
                break;
            }
        }

        if inner.failure_timestamps.len() >= self.config.spawn_circuit_threshold {
            let cooldown = self.config.spawn_circuit_cooldown;
            inner.circuit_open_until = Some(now + cooldown);
            inner.circuit_opened_at.get_or_insert(now);
            warn!(
                failures = inner.failure_timestamps.len(),
                cooldown_ms = cooldown.as_millis(),
                "spawn circuit opened"
            );
        }
    }

    /// Run one health probe (`docker info`) and update internal state.
    pub async fn probe_once(&self) {
        let ok = Command::new(CONTAINER_RUNTIME_BIN)
            .arg("info")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);

        let mut inner = self.inner.lock().await;
        if inner.healthy != ok {
            if ok {
                info!("docker daemon healthy again");
                inner.unhealthy_since = None;
            } else {
                error!("docker daemon unhealthy, refusing spawns");
                inner.unhealthy_since = Some(Instant::now());
            }
        }
        inner.healthy = ok;
    }

    /// Spawn a background task that probes on `health_probe_interval`.
    pub fn spawn_health_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let interval = this.config.health_probe_interval;
        tokio::spawn(async move {
            loop {
                this.probe_once().await;
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// Stop any container bearing the managed label that isn't in
    /// `active_names` and isn't a pool standby (pool containers are excluded
    /// by naming convention — callers pass the active queue's container set).
    pub async fn sweep_orphans(&self, managed_label: &str, active_names: &[String]) {
        let output = match Command::new(CONTAINER_RUNTIME_BIN)
            .args([
                "ps",
                "--filter",
                &format!("label={managed_label}"),
                "--format",
                "{{.Names}}",
            ])
            .output()
            .await
        {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "orphan sweep: failed to list containers");
                return;
            }
        };

        let names: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mut stopped = 0;
        for name in names {
            if active_names.contains(&name) {
                continue;
            }
            let result = Command::new(CONTAINER_RUNTIME_BIN)
                .args(["stop", &name])
                .output()
                .await;
            if matches!(result, Ok(o) if o.status.success()) {
                stopped += 1;
            }
        }
        if stopped > 0 {
            info!(stopped, "orphan sweep stopped containers");
        }
    }

    /// Spawn a background task that sweeps orphans on `orphan_sweep_interval`.
    /// `active_names_fn` is polled fresh on each tick.
    pub fn spawn_orphan_sweep_loop<F>(
        self: &Arc<Self>,
        managed_label: String,
        active_names_fn: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn() -> BoxFuture<Vec<String>> + Send + Sync + 'static,
    {
        let this = self.clone();
        let interval = this.config.orphan_sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let active = active_names_fn().await;
                this.sweep_orphans(&managed_label, &active).await;
            }
        })
    }

    pub async fn is_healthy(&self) -> bool {
        self.inner.lock().await.healthy
    }

    pub async fn circuit_open(&self) -> bool {
        let inner = self.inner.lock().await;
        inner
            .circuit_open_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// How long the daemon has been continuously unhealthy, if it is right now.
    pub async fn unhealthy_duration(&self) -> Option<Duration> {
        let inner = self.inner.lock().await;
        if inner.healthy {
            return None;
        }
        inner.unhealthy_since.map(|since| since.elapsed())
    }

    /// How long the spawn circuit has been continuously open, if it is right now.
    pub async fn circuit_open_duration(&self) -> Option<Duration> {
        let inner = self.inner.lock().await;
        if !inner.circuit_open_until.is_some_and(|until| Instant::now() < until) {
            return None;
        }
        inner.circuit_opened_at.map(|since| since.elapsed())
    }
}

/// Shorthand alias to keep the sweep-loop signature readable.
type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> ResilienceConfig {
        ResilienceConfig {
            health_probe_interval: Duration::from_millis(10),
            spawn_circuit_threshold: 3,
            spawn_circuit_window: Duration::from_secs(60),
            spawn_circuit_cooldown: Duration::from_millis(50),
            orphan_sweep_interval: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn spawn_allowed_by_default() {
        let dr = DockerResilience::new(fast_config());
        assert!(dr.spawn_allowed().await);
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_failures() {
        let dr = DockerResilience::new(fast_config());
        for _ in 0..3 {
            dr.record_spawn_result(false).await;
        }
        assert!(dr.circuit_open().await);
        assert!(!dr.spawn_allowed().await);
    }

    #[tokio::test]
    async fn circuit_resets_after_cooldown() {
        let dr = DockerResilience::new(fast_config());
        for _ in 0..3 {
            dr.record_spawn_result(false).await;
        }
        assert!(!dr.spawn_allowed().await);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(dr.spawn_allowed().await);
    }

    #[tokio::test]
    async fn success_clears_failure_window() {
        let dr = DockerResilience::new(fast_config());
        dr.record_spawn_result(false).await;
        dr.record_spawn_result(false).await;
        dr.record_spawn_result(true).await;
        dr.record_spawn_result(false).await;
        dr.record_spawn_result(false).await;
        // only 2 failures since the reset, below threshold of 3
        assert!(dr.spawn_allowed().await);
    }

    #[tokio::test]
    async fn unhealthy_daemon_blocks_spawns_even_without_circuit() {
        let dr = DockerResilience::new(fast_config());
        dr.inner.lock().await.healthy = false;
        assert!(!dr.spawn_allowed().await);
    }
}
