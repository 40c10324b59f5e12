use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IntercomConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub runtimes: RuntimeConfig,
    pub orchestrator: OrchestratorConfig,
    pub scheduler: SchedulerConfig,
    pub heartbeat_jobs: HeartbeatJobsConfig,
    pub heartbeat_reporter: HeartbeatReporterConfig,
    pub budget: BudgetConfig,
    pub ipc: IpcConfig,
    pub container_pool: ContainerPoolConfig,
    pub docker_resilience: DockerResilienceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerResilienceConfig {
    /// How often to probe Docker daemon health.
    pub health_probe_interval_ms: u64,
    /// Consecutive spawn failures within `spawn_circuit_window_ms` that open the circuit.
    pub spawn_circuit_threshold: u32,
    /// Window over which consecutive spawn failures are counted.
    pub spawn_circuit_window_ms: u64,
    /// How long the spawn circuit stays open before allowing a trial spawn.
    pub spawn_circuit_cooldown_ms: u64,
    /// How often to sweep orphaned `intercom-` containers left by previous runs.
    pub orphan_sweep_interval_ms: u64,
}

impl Default for DockerResilienceConfig {
    fn default() -> Self {
        Self {
            health_probe_interval_ms: 30_000,
            spawn_circuit_threshold: 3,
            spawn_circuit_window_ms: 60_000,
            spawn_circuit_cooldown_ms: 120_000,
            orphan_sweep_interval_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerPoolConfig {
    /// Enable standby pre-warming. When false, every dispatch cold-spawns.
    pub enabled: bool,
    /// Standbys kept warm per group.
    pub min_size: usize,
    /// Hard ceiling on total standbys across all groups.
    pub max_size: usize,
}

impl Default for ContainerPoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_size: 0,
            max_size: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub request_timeout_ms: u64,
    pub max_body_bytes: usize,
    /// URL of the Node host's callback server for message/task forwarding.
    pub host_callback_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7340".to_string(),
            request_timeout_ms: 30_000,
            max_body_bytes: 1_048_576,
            host_callback_url: "http://127.0.0.1:7341".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub postgres_dsn: Option<String>,
    pub sqlite_legacy_path: String,
    pub groups_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            postgres_dsn: None,
            sqlite_legacy_path: "store/messages.db".to_string(),
            groups_dir: "groups".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub preserve_legacy_runtime_ids: bool,
    pub default_runtime: String,
    pub profiles: BTreeMap<String, RuntimeProfile>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "claude".to_string(),
            RuntimeProfile {
                provider: "anthropic".to_string(),
                default_model: "claude-opus-4-6".to_string(),
                required_env: vec!["CLAUDE_CODE_OAUTH_TOKEN".to_string()],
            },
        );
        profiles.insert(
            "gemini".to_string(),
            RuntimeProfile {
                provider: "code-assist".to_string(),
                default_model: "gemini-3.1-pro".to_string(),
                required_env: vec![
                    "GEMINI_REFRESH_TOKEN".to_string(),
                    "GEMINI_OAUTH_CLIENT_ID".to_string(),
                    "GEMINI_OAUTH_CLIENT_SECRET".to_string(),
                ],
            },
        );
        profiles.insert(
            "codex".to_string(),
            RuntimeProfile {
                provider: "openai".to_string(),
                default_model: "gpt-5.3-codex".to_string(),
                required_env: vec![
                    "CODEX_OAUTH_ACCESS_TOKEN".to_string(),
                    "CODEX_OAUTH_REFRESH_TOKEN".to_string(),
                    "CODEX_OAUTH_ID_TOKEN".to_string(),
                    "CODEX_OAUTH_ACCOUNT_ID".to_string(),
                ],
            },
        );

        Self {
            preserve_legacy_runtime_ids: true,
            default_runtime: "claude".to_string(),
            profiles,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeProfile {
    pub provider: String,
    pub default_model: String,
    pub required_env: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Enable the Rust orchestrator (message loop, queue, container dispatch).
    /// When false, intercomd runs as a sidecar only — Node remains the orchestrator.
    pub enabled: bool,
    /// Maximum concurrent containers across all groups.
    pub max_concurrent_containers: usize,
    /// Poll interval for the message loop (milliseconds).
    pub poll_interval_ms: u64,
    /// Idle timeout before closing container stdin (milliseconds).
    pub idle_timeout_ms: u64,
    /// Folder name for the main group.
    pub main_group_folder: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent_containers: 3,
            poll_interval_ms: 1000,
            idle_timeout_ms: 300_000,
            main_group_folder: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Enable the task scheduler loop.
    pub enabled: bool,
    /// Poll interval for due tasks (milliseconds).
    pub poll_interval_ms: u64,
    /// IANA timezone for cron expressions.
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_ms: 10_000,
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatJobsConfig {
    /// Enable the Smart-Job Runner poll loop.
    pub enabled: bool,
    /// Poll interval for due heartbeat jobs (milliseconds).
    pub poll_interval_ms: u64,
    /// Interval used for jobs with no explicit `interval_ms` set.
    pub default_interval_ms: i64,
    /// Per-run timeout before an attempt is abandoned.
    pub job_timeout_ms: u64,
    /// Max jobs executed concurrently.
    pub batch_concurrency: usize,
}

impl Default for HeartbeatJobsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_ms: 30_000,
            default_interval_ms: 3_600_000,
            job_timeout_ms: 600_000,
            batch_concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatReporterConfig {
    /// Enable the daemon-health Heartbeat Reporter loop.
    pub enabled: bool,
    /// How often to emit the routine status digest.
    pub report_interval_ms: u64,
    /// How long without an accepted inbound message before a silence notice fires.
    pub silence_threshold_ms: u64,
    /// How long the Docker health probe must report unhealthy (or the spawn
    /// circuit must stay open) before an escalated notice fires.
    pub escalation_threshold_ms: u64,
    /// Suppress routine scheduled reports (silence/escalation notices still fire).
    pub silent: bool,
    /// Chat JID that receives heartbeat notices (usually the main group).
    pub notification_jid: Option<String>,
}

impl Default for HeartbeatReporterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            report_interval_ms: 3_600_000,
            silence_threshold_ms: 21_600_000,
            escalation_threshold_ms: 900_000,
            silent: false,
            notification_jid: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub monthly_budget_usd: f64,
    pub daily_budget_usd: Option<f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_budget_usd: 200.0,
            daily_budget_usd: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Shared secret used to verify HMAC-signed command files written by
    /// containers. `None` disables authentication (standalone/dev mode).
    pub shared_secret: Option<String>,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            shared_secret: None,
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<IntercomConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(IntercomConfig::default().with_env_overrides());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let parsed: IntercomConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(parsed.with_env_overrides())
}

impl IntercomConfig {
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(bind) = std::env::var("INTERCOMD_BIND") {
            if !bind.trim().is_empty() {
                self.server.bind = bind;
            }
        }

        if let Ok(dsn) = std::env::var("INTERCOM_POSTGRES_DSN") {
            if !dsn.trim().is_empty() {
                self.storage.postgres_dsn = Some(dsn);
            }
        }

        if let Ok(url) = std::env::var("HOST_CALLBACK_URL") {
            if !url.trim().is_empty() {
                self.server.host_callback_url = url;
            }
        }

        if let Ok(secret) = std::env::var("IPC_SECRET") {
            if !secret.trim().is_empty() {
                self.ipc.shared_secret = Some(secret);
            }
        }

        if let Ok(raw) = std::env::var("MONTHLY_BUDGET") {
            if let Ok(v) = raw.parse::<f64>() {
                self.budget.monthly_budget_usd = v;
            }
        }

        if let Ok(raw) = std::env::var("DAILY_BUDGET") {
            if let Ok(v) = raw.parse::<f64>() {
                self.budget.daily_budget_usd = Some(v);
            }
        }

        if let Ok(raw) = std::env::var("DOCKER_HEALTH_PROBE_INTERVAL_MS") {
            if let Ok(v) = raw.parse::<u64>() {
                self.docker_resilience.health_probe_interval_ms = v;
            }
        }

        if let Ok(raw) = std::env::var("SPAWN_CIRCUIT_THRESHOLD") {
            if let Ok(v) = raw.parse::<u32>() {
                self.docker_resilience.spawn_circuit_threshold = v;
            }
        }

        if let Ok(raw) = std::env::var("SPAWN_CIRCUIT_WINDOW_MS") {
            if let Ok(v) = raw.parse::<u64>() {
                self.docker_resilience.spawn_circuit_window_ms = v;
            }
        }

        if let Ok(raw) = std::env::var("SPAWN_CIRCUIT_COOLDOWN_MS") {
            if let Ok(v) = raw.parse::<u64>() {
                self.docker_resilience.spawn_circuit_cooldown_ms = v;
            }
        }

        if let Ok(raw) = std::env::var("ORPHAN_SWEEP_INTERVAL_MS") {
            if let Ok(v) = raw.parse::<u64>() {
                self.docker_resilience.orphan_sweep_interval_ms = v;
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_three_runtime_profiles() {
        let cfg = IntercomConfig::default();
        assert!(cfg.runtimes.profiles.contains_key("claude"));
        assert!(cfg.runtimes.profiles.contains_key("gemini"));
        assert!(cfg.runtimes.profiles.contains_key("codex"));
    }

    #[test]
    fn parse_toml_uses_defaults_for_missing_fields() {
        let parsed: IntercomConfig = toml::from_str(
            r#"
            [server]
            bind = "127.0.0.1:9999"
            "#,
        )
        .expect("parse toml");

        assert_eq!(parsed.server.bind, "127.0.0.1:9999");
        assert_eq!(parsed.server.request_timeout_ms, 30_000);
        assert!(parsed.runtimes.profiles.contains_key("claude"));
    }
}
