//! Standby container pool: amortizes cold-start cost with pre-warmed agents.
//!
//! A standby container is spawned with a `__STANDBY__` prompt. The runner
//! image recognizes this sentinel, writes a zero-byte `_ready` file into its
//! IPC inbox, then blocks reading `_assignment.json`. `acquire` hands out a
//! ready container by writing the assignment; `release` either returns the
//! container to the ready set (reuse) or force-stops it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use intercom_core::{ContainerOutput, RuntimeKind};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::mounts::GroupInfo;
use super::runner::{OutputCallback, stop_container};

/// Standby readiness wait before the pool gives up and drains it.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle standby lifetime before pruning.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Reuse ceiling: a standby is retired after this many assignments to bound
/// any slow resource leak inside the long-lived agent process.
const POOL_MAX_REUSE: u32 = 20;

/// Grace period before a force-stop on release without reuse.
const RELEASE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StandbyState {
    Warming,
    Ready,
    Assigned,
}

struct Standby {
    container_name: String,
    folder: String,
    runtime: RuntimeKind,
    state: StandbyState,
    reuse_count: u32,
    last_ready_at: Instant,
}

struct Inner {
    standbys: HashMap<String, Standby>,
    min_size: usize,
    max_size: usize,
    fallback_count: u64,
    /// Per-container output routing, set for the duration of an assigned
    /// task. `run_container_agent`'s `on_output` is fixed at spawn time, so a
    /// reused standby needs this indirection to deliver each assignment's
    /// output to that assignment's own caller rather than the warm-up loop's.
    routes: HashMap<String, Arc<OutputCallback>>,
}

/// Pool of pre-warmed containers, keyed by container name. Not persisted —
/// a restart always cold-starts.
pub struct ContainerPool {
    inner: Arc<Mutex<Inner>>,
    data_dir: PathBuf,
}

impl ContainerPool {
    pub fn new(data_dir: PathBuf, min_size: usize, max_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                standbys: HashMap::new(),
                min_size,
                max_size,
                fallback_count: 0,
                routes: HashMap::new(),
            })),
            data_dir,
        }
    }

    /// Spawn a standby container for `group`. The caller is responsible for
    /// actually launching the process (via `run_container_agent` with a
    /// `__STANDBY__` prompt) and registering it here once spawned.
    pub async fn register_warming(&self, container_name: &str, group: &GroupInfo, runtime: RuntimeKind) {
        let mut inner = self.inner.lock().await;
        if inner.standbys.len() >= inner.max_size {
            debug!(group = %group.name, "pool at max size, skipping warm");
            return;
        }
        inner.standbys.insert(
            container_name.to_string(),
            Standby {
                container_name: container_name.to_string(),
                folder: group.folder.clone(),
                runtime,
                state: StandbyState::Warming,
                reuse_count: 0,
                last_ready_at: Instant::now(),
            },
        );
    }

    /// Poll the IPC inbox for the `_ready` sentinel. Drains the standby if
    /// it never becomes ready within `READY_TIMEOUT`.
    pub async fn poll_ready(&self, container_name: &str) -> bool {
        let (folder, started) = {
            let inner = self.inner.lock().await;
            match inner.standbys.get(container_name) {
                Some(s) if s.state == StandbyState::Warming => {
                    (s.folder.clone(), s.last_ready_at)
                }
                _ => return false,
            }
        };

        let ready_file = self.data_dir.join("ipc").join(&folder).join("input").join("_ready");
        if ready_file.exists() {
            let mut inner = self.inner.lock().await;
            if let Some(s) = inner.standbys.get_mut(container_name) {
                s.state = StandbyState::Ready;
                s.last_ready_at = Instant::now();
            }
            let _ = tokio::fs::remove_file(&ready_file).await;
            info!(container_name, "standby ready");
            return true;
        }

        if started.elapsed() >= READY_TIMEOUT {
            warn!(container_name, "standby never became ready, draining");
            self.drain(container_name).await;
        }
        false
    }

    /// Acquire a ready standby for `folder`, if one exists.
    pub async fn acquire(&self, folder: &str) -> Option<String> {
        let mut inner = self.inner.lock().await;
        let name = inner
            .standbys
            .iter()
            .find(|(_, s)| s.folder == folder && s.state == StandbyState::Ready)
            .map(|(name, _)| name.clone())?;
        if let Some(s) = inner.standbys.get_mut(&name) {
            s.state = StandbyState::Assigned;
        }
        Some(name)
    }

    /// Record a cold-spawn fallback (no standby was available).
    pub async fn record_fallback(&self) {
        self.inner.lock().await.fallback_count += 1;
    }

    pub async fn fallback_count(&self) -> u64 {
        self.inner.lock().await.fallback_count
    }

    /// Write the assignment for an acquired standby via temp+rename.
    pub async fn assign_task(&self, container_name: &str, input_json: &str) -> anyhow::Result<()> {
        let folder = {
            let inner = self.inner.lock().await;
            match inner.standbys.get(container_name) {
                Some(s) => s.folder.clone(),
                None => anyhow::bail!("no such standby: {container_name}"),
            }
        };
        let input_dir = self.data_dir.join("ipc").join(&folder).join("input");
        tokio::fs::create_dir_all(&input_dir).await?;
        let final_path = input_dir.join("_assignment.json");
        let temp_path = input_dir.join("_assignment.json.tmp");
        tokio::fs::write(&temp_path, input_json).await?;
        tokio::fs::rename(&temp_path, &final_path).await?;
        Ok(())
    }

    /// Release a standby after use. If `keep_alive` and under the reuse
    /// ceiling, it goes back to `ready`; otherwise it is drained.
    pub async fn release(&self, container_name: &str, keep_alive: bool) {
        let should_drain = {
            let mut inner = self.inner.lock().await;
            match inner.standbys.get_mut(container_name) {
                Some(s) => {
                    s.reuse_count += 1;
                    if keep_alive && s.reuse_count < POOL_MAX_REUSE {
                        s.state = StandbyState::Ready;
                        s.last_ready_at = Instant::now();
                        false
                    } else {
                        true
                    }
                }
                None => return,
            }
        };
        if should_drain {
            self.drain(container_name).await;
        }
    }

    /// Force-stop and remove a standby from the pool.
    async fn drain(&self, container_name: &str) {
        let removed = self.inner.lock().await.standbys.remove(container_name);
        if let Some(s) = removed {
            tokio::time::sleep(Duration::ZERO).await;
            if !stop_container(&s.container_name).await {
                warn!(container_name = %s.container_name, "standby stop failed, will retry via orphan cleanup");
            }
        }
    }

    /// Prune standbys idle past `POOL_IDLE_TIMEOUT`. Call periodically.
    pub async fn prune_idle(&self) {
        let stale: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .standbys
                .iter()
                .filter(|(_, s)| {
                    s.state == StandbyState::Ready && s.last_ready_at.elapsed() >= POOL_IDLE_TIMEOUT
                })
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in stale {
            info!(container_name = %name, "pruning idle standby");
            self.drain(&name).await;
        }
    }

    pub async fn min_size(&self) -> usize {
        self.inner.lock().await.min_size
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.standbys.len()
    }

    /// Count of standbys currently warming or ready for `folder`.
    pub async fn count_for_folder(&self, folder: &str) -> usize {
        self.inner
            .lock()
            .await
            .standbys
            .values()
            .filter(|s| s.folder == folder)
            .count()
    }

    /// Container names of every standby the pool currently tracks, for the
    /// Docker resilience orphan sweep to exempt from cleanup.
    pub async fn tracked_names(&self) -> Vec<String> {
        self.inner.lock().await.standbys.keys().cloned().collect()
    }

    /// Route an assignment's output callback for the lifetime of one task.
    /// Cleared by the caller via `clear_route` once the task completes.
    pub async fn set_route(&self, container_name: &str, callback: Arc<OutputCallback>) {
        self.inner.lock().await.routes.insert(container_name.to_string(), callback);
    }

    pub async fn clear_route(&self, container_name: &str) {
        self.inner.lock().await.routes.remove(container_name);
    }

    /// Dispatch one output chunk to whichever caller currently owns this
    /// container's assignment. No-op if nothing is routed (e.g. the
    /// `__STANDBY__` handshake itself, which is tracked via the `_ready`
    /// sentinel rather than streamed output).
    pub async fn route_output(&self, container_name: &str, output: ContainerOutput) {
        let callback = self.inner.lock().await.routes.get(container_name).cloned();
        if let Some(callback) = callback {
            callback(output).await;
        }
    }

    /// Drop a standby's bookkeeping without touching the container process —
    /// used when the warm-up loop observes the process already exited.
    pub async fn forget(&self, container_name: &str) {
        self.inner.lock().await.standbys.remove(container_name);
        self.inner.lock().await.routes.remove(container_name);
    }
}

/// Release-grace helper: force-stop shortly after the grace window if the
/// container hasn't exited on its own. Exposed for the runner to call after
/// writing `_close` on a non-reused release.
pub async fn force_stop_after_grace(container_name: String) {
    tokio::time::sleep(RELEASE_GRACE).await;
    let _ = stop_container(&container_name).await;
}

#[allow(dead_code)]
fn ipc_input_dir(data_dir: &Path, folder: &str) -> PathBuf {
    data_dir.join("ipc").join(folder).join("input")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(folder: &str) -> GroupInfo {
        GroupInfo {
            folder: folder.to_string(),
            name: folder.to_string(),
            container_config: None,
        }
    }

    #[tokio::test]
    async fn acquire_returns_none_when_empty() {
        let pool = ContainerPool::new(PathBuf::from("/tmp/pool-test"), 0, 2);
        assert!(pool.acquire("g1").await.is_none());
    }

    #[tokio::test]
    async fn register_then_ready_then_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ContainerPool::new(dir.path().to_path_buf(), 0, 2);
        pool.register_warming("intercom-g1-1", &group("g1"), RuntimeKind::Claude)
            .await;

        let ready_dir = dir.path().join("ipc").join("g1").join("input");
        tokio::fs::create_dir_all(&ready_dir).await.unwrap();
        tokio::fs::write(ready_dir.join("_ready"), b"").await.unwrap();

        assert!(pool.poll_ready("intercom-g1-1").await);
        assert_eq!(pool.acquire("g1").await, Some("intercom-g1-1".to_string()));
        // Already assigned, cannot be acquired twice
        assert!(pool.acquire("g1").await.is_none());
    }

    #[tokio::test]
    async fn fallback_counter_increments() {
        let pool = ContainerPool::new(PathBuf::from("/tmp/pool-test"), 0, 2);
        pool.record_fallback().await;
        pool.record_fallback().await;
        assert_eq!(pool.fallback_count().await, 2);
    }

    #[tokio::test]
    async fn max_size_rejects_additional_warms() {
        let pool = ContainerPool::new(PathBuf::from("/tmp/pool-test"), 0, 1);
        pool.register_warming("c1", &group("g1"), RuntimeKind::Claude).await;
        pool.register_warming("c2", &group("g2"), RuntimeKind::Claude).await;
        assert_eq!(pool.size().await, 1);
    }
}
