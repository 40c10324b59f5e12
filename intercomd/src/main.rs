mod commands;
mod container;
mod db;
mod heartbeat_reporter;
mod heartbeat_runner;
mod heartbeat_wiring;
mod ipc;
mod ipc_delegate;
mod message_loop;
mod process_group;
mod queue;
mod receipt_tracking;
mod dlq;
mod scheduler;
mod scheduler_wiring;
mod telegram;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, Subcommand};
use intercom_core::{IntercomConfig, PgPool, RegisteredGroup, load_config};
use serde::Serialize;
use telegram::{
    TelegramBridge, TelegramEditRequest, TelegramEditResponse, TelegramIngressRequest,
    TelegramIngressResponse, TelegramSendRequest, TelegramSendResponse,
};
use tokio::sync::RwLock;
use tracing::info;

use crate::container::pool::ContainerPool;
use crate::container::resilience::{DockerResilience, ResilienceConfig};
use crate::container::runner::RunConfig;
use crate::ipc::GroupRegistry;
use crate::ipc_delegate::OrchestratorDelegate;
use crate::receipt_tracking;

#[derive(Parser, Debug)]
#[command(name = "intercomd", version, about = "Intercom Rust daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start intercomd HTTP service.
    Serve(ServeArgs),
    /// Print effective intercomd config as JSON.
    PrintConfig(PrintConfigArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "config/intercom.toml")]
    config: PathBuf,
    #[arg(long)]
    bind: Option<String>,
}

#[derive(clap::Args, Debug)]
struct PrintConfigArgs {
    #[arg(long, default_value = "config/intercom.toml")]
    config: PathBuf,
}

/// Shared orchestrator state: registered groups indexed by JID.
type Groups = HashMap<String, RegisteredGroup>;
/// Shared session state: group folder → session ID.
type Sessions = HashMap<String, String>;

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    config: Arc<IntercomConfig>,
    telegram: Arc<TelegramBridge>,
    db: Option<PgPool>,
    queue: Arc<queue::GroupQueue>,
    groups: Arc<RwLock<Groups>>,
    sessions: Arc<RwLock<Sessions>>,
    resilience: Option<Arc<DockerResilience>>,
    container_pool: Option<Arc<ContainerPool>>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    bind: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    runtime_profiles: usize,
    telegram_bridge_enabled: bool,
    postgres_connected: bool,
    orchestrator_enabled: bool,
    registered_groups: usize,
    active_containers: usize,
    docker_healthy: Option<bool>,
}

#[derive(Serialize)]
struct RuntimeProfilesResponse {
    default_runtime: String,
    profiles: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs {
        config: PathBuf::from("config/intercom.toml"),
        bind: None,
    })) {
        Command::Serve(args) => serve(args).await,
        Command::PrintConfig(args) => print_config(args),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let bind = config.server.bind.clone();
    let project_root =
        std::env::current_dir().context("failed to resolve current working directory")?;
    let telegram = Arc::new(TelegramBridge::new(&config));
    let assistant_name = std::env::var("ASSISTANT_NAME").unwrap_or_else(|_| "Amtiskaw".into());

    // Connect to Postgres if a DSN is configured.
    let db = if let Some(ref dsn) = config.storage.postgres_dsn {
        if !dsn.trim().is_empty() {
            let pool = PgPool::new(dsn.clone());
            match pool.connect().await {
                Ok(()) => {
                    info!("postgres persistence layer connected");
                    Some(pool)
                }
                Err(e) => {
                    tracing::warn!(err = %e, "postgres connection failed, DB endpoints disabled");
                    None
                }
            }
        } else {
            None
        }
    } else {
        None
    };

    let queue = Arc::new(queue::GroupQueue::new(
        config.orchestrator.max_concurrent_containers,
        project_root.join("data"),
    ));

    let (groups, sessions) = if let Some(ref pool) = db {
        let g = match pool.get_all_registered_groups().await {
            Ok(g) => {
                info!(count = g.len(), "loaded registered groups from Postgres");
                g
            }
            Err(e) => {
                tracing::warn!(err = %e, "failed to load groups, starting empty");
                HashMap::new()
            }
        };
        let s = match pool.get_all_sessions().await {
            Ok(s) => {
                info!(count = s.len(), "loaded sessions from Postgres");
                s
            }
            Err(e) => {
                tracing::warn!(err = %e, "failed to load sessions, starting empty");
                HashMap::new()
            }
        };
        (g, s)
    } else {
        (HashMap::new(), HashMap::new())
    };

    let groups = Arc::new(RwLock::new(groups));
    let sessions = Arc::new(RwLock::new(sessions));

    // Docker resilience guards every container spawn regardless of which
    // loop initiates it (message loop, scheduler, smart-job runner).
    let resilience = Arc::new(DockerResilience::new(ResilienceConfig {
        health_probe_interval: Duration::from_millis(config.docker_resilience.health_probe_interval_ms),
        spawn_circuit_threshold: config.docker_resilience.spawn_circuit_threshold as usize,
        spawn_circuit_window: Duration::from_millis(config.docker_resilience.spawn_circuit_window_ms),
        spawn_circuit_cooldown: Duration::from_millis(config.docker_resilience.spawn_circuit_cooldown_ms),
        orphan_sweep_interval: Duration::from_millis(config.docker_resilience.orphan_sweep_interval_ms),
    }));

    let run_config = RunConfig {
        project_root: project_root.clone(),
        groups_dir: project_root.join(&config.storage.groups_dir),
        data_dir: project_root.join("data"),
        timezone: config.scheduler.timezone.clone(),
        idle_timeout_ms: config.orchestrator.idle_timeout_ms,
        allowlist: None,
        resilience: Some(resilience.clone()),
    };

    let container_pool = if config.container_pool.enabled {
        Some(Arc::new(ContainerPool::new(
            run_config.data_dir.clone(),
            config.container_pool.min_size,
            config.container_pool.max_size,
        )))
    } else {
        None
    };

    // Group registry backs the IPC watcher's authorization checks — it is
    // populated from the same `groups` map the orchestrator loops share.
    let registry = Arc::new(RwLock::new(GroupRegistry::new()));
    {
        let mut reg = registry.write().await;
        for g in groups.read().await.values() {
            reg.register(g.jid.clone(), g.folder.clone());
        }
    }

    let state = AppState {
        started_at: Instant::now(),
        config: Arc::new(config),
        telegram: telegram.clone(),
        db,
        queue: queue.clone(),
        groups: groups.clone(),
        sessions: sessions.clone(),
        resilience: Some(resilience.clone()),
        container_pool: container_pool.clone(),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    // Named background tasks, started in this order and shut down in
    // reverse so nothing outlives state it depends on.
    let mut handles: Vec<(&'static str, tokio::task::JoinHandle<()>)> = Vec::new();

    // IPC watcher — polls data/ipc/ directories for container messages and
    // task/heartbeat commands, authenticated via HMAC.
    let ipc_config = ipc::IpcWatcherConfig {
        ipc_base_dir: project_root.join("data/ipc"),
        poll_interval: Duration::from_secs(1),
        shared_secret: state.config.ipc.shared_secret.clone(),
    };
    let ipc_delegate: Arc<dyn ipc::IpcDelegate> = match state.db.clone() {
        Some(pool) => Arc::new(OrchestratorDelegate {
            pool,
            queue: queue.clone(),
            telegram: telegram.clone(),
            groups: groups.clone(),
            sessions: sessions.clone(),
            registry: registry.clone(),
            run_config: run_config.clone(),
            timezone: state.config.scheduler.timezone.clone(),
        }),
        None => {
            tracing::warn!("no Postgres connection — IPC tasks will be logged only, not executed");
            Arc::new(ipc::LogOnlyDelegate)
        }
    };
    let ipc_watcher = ipc::IpcWatcher::new(ipc_config, ipc_delegate, registry.clone());
    let ipc_shutdown_rx = shutdown_rx.clone();
    handles.push((
        "ipc_watcher",
        tokio::spawn(async move {
            ipc_watcher.run(ipc_shutdown_rx).await;
        }),
    ));

    // Docker health probe + orphan sweep — independent of orchestrator.enabled,
    // since containers can be spawned manually even with the orchestrator off.
    let health_handle = resilience.spawn_health_loop();
    handles.push(("docker_health_probe", health_handle));

    let sweep_pool = container_pool.clone();
    let sweep_handle = resilience.spawn_orphan_sweep_loop(
        "intercom-".to_string(),
        move || {
            let sweep_pool = sweep_pool.clone();
            Box::pin(async move {
                match &sweep_pool {
                    Some(pool) => pool.tracked_names().await,
                    None => Vec::new(),
                }
            }) as futures::future::BoxFuture<'static, Vec<String>>
        },
    );
    handles.push(("docker_orphan_sweep", sweep_handle));

    if let Some(pool) = container_pool.clone() {
        let maintain_pool = pool.clone();
        let mut maintain_shutdown = shutdown_rx.clone();
        handles.push((
            "container_pool_maintenance",
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(30)) => {
                            maintain_pool.prune_idle().await;
                        }
                        _ = maintain_shutdown.changed() => {
                            if *maintain_shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }),
        ));
    }

    // Orchestrator loops (message poll, scheduler, smart-job runner) — all
    // require Postgres and the `orchestrator.enabled` flag.
    if state.config.orchestrator.enabled {
        if let Some(ref pool) = state.db {
            let active_traces = receipt_tracking::new_active_traces();

            let process_fn = process_group::build_process_messages_fn(
                pool.clone(),
                state.queue.clone(),
                state.groups.clone(),
                state.sessions.clone(),
                state.telegram.clone(),
                assistant_name.clone(),
                state.config.orchestrator.main_group_folder.clone(),
                run_config.clone(),
                state.config.budget.clone(),
                container_pool.clone(),
                active_traces.clone(),
            );
            state.queue.set_process_messages_fn(process_fn).await;

            state
                .queue
                .set_on_rejected(Arc::new(move |group_jid, lane| {
                    tracing::warn!(group_jid = group_jid.as_str(), ?lane, "queue full, message rejected");
                }))
                .await;

            let on_max_retries_telegram = state.telegram.clone();
            let on_max_retries_pool = pool.clone();
            let on_max_retries_traces = active_traces.clone();
            state
                .queue
                .set_on_max_retries_exceeded(Arc::new(move |group_jid| {
                    let telegram = on_max_retries_telegram.clone();
                    let pool = on_max_retries_pool.clone();
                    let traces = on_max_retries_traces.clone();
                    tracing::error!(group_jid = group_jid.as_str(), "max retries exceeded, giving up");
                    tokio::spawn(async move {
                        receipt_tracking::dead_letter_window(&pool, &traces, &group_jid, "MAX_RETRIES_EXCEEDED").await;
                        let _ = telegram
                            .send_text_to_jid(
                                &group_jid,
                                "This request failed repeatedly and has been dropped — try again or check logs.",
                            )
                            .await;
                    });
                }))
                .await;

            let ml_config = message_loop::MessageLoopConfig {
                poll_interval_ms: state.config.orchestrator.poll_interval_ms,
                assistant_name: assistant_name.clone(),
                main_group_folder: state.config.orchestrator.main_group_folder.clone(),
            };
            let ml_pool = pool.clone();
            let ml_queue = state.queue.clone();
            let ml_groups = state.groups.clone();
            let ml_traces = active_traces.clone();
            let ml_shutdown = shutdown_rx.clone();
            handles.push((
                "message_loop",
                tokio::spawn(async move {
                    message_loop::run_message_loop(ml_config, ml_pool, ml_queue, ml_groups, ml_traces, ml_shutdown).await;
                }),
            ));

            let sched_config = scheduler::SchedulerConfig {
                poll_interval: Duration::from_millis(state.config.scheduler.poll_interval_ms),
                timezone: state.config.scheduler.timezone.clone(),
                enabled: state.config.scheduler.enabled,
            };
            scheduler::recover_stale_claims(pool).await;
            let task_callback = scheduler_wiring::build_task_callback(
                pool.clone(),
                state.queue.clone(),
                state.groups.clone(),
                state.sessions.clone(),
                state.telegram.clone(),
                run_config.clone(),
                state.config.scheduler.timezone.clone(),
            );
            let sched_pool = pool.clone();
            let sched_shutdown = shutdown_rx.clone();
            handles.push((
                "scheduler",
                tokio::spawn(async move {
                    scheduler::run_scheduler_loop(sched_config, sched_pool, task_callback, sched_shutdown).await;
                }),
            ));

            // Smart-Job Runner — recurring AI heartbeat jobs, distinct from
            // the daemon-health reporter below.
            heartbeat_runner::recover_interrupted_jobs(pool).await;
            let hb_config = heartbeat_runner::HeartbeatRunnerConfig {
                enabled: state.config.heartbeat_jobs.enabled,
                poll_interval: Duration::from_millis(state.config.heartbeat_jobs.poll_interval_ms),
                default_interval_ms: state.config.heartbeat_jobs.default_interval_ms,
                job_timeout: Duration::from_millis(state.config.heartbeat_jobs.job_timeout_ms),
                batch_concurrency: state.config.heartbeat_jobs.batch_concurrency,
            };
            let job_executor = heartbeat_wiring::build_job_executor(
                state.queue.clone(),
                state.groups.clone(),
                state.telegram.clone(),
                assistant_name.clone(),
                run_config.clone(),
            );
            let hb_pool = pool.clone();
            let hb_shutdown = shutdown_rx.clone();
            handles.push((
                "smart_job_runner",
                tokio::spawn(async move {
                    heartbeat_runner::run_heartbeat_runner_loop(hb_config, hb_pool, job_executor, hb_shutdown).await;
                }),
            ));

            info!("orchestrator enabled: message loop, scheduler, smart-job runner wired");
        } else {
            tracing::warn!("orchestrator.enabled=true but no Postgres connection — orchestrator disabled");
        }
    }

    // Daemon-health Heartbeat Reporter — runs independent of orchestrator.enabled
    // since it reports on intercomd itself, not on container dispatch.
    if let Some(ref pool) = state.db {
        let reporter_config = heartbeat_reporter::HeartbeatReporterConfig {
            enabled: state.config.heartbeat_reporter.enabled,
            poll_interval: Duration::from_secs(60),
            report_interval: Duration::from_millis(state.config.heartbeat_reporter.report_interval_ms),
            silence_threshold: Duration::from_millis(state.config.heartbeat_reporter.silence_threshold_ms),
            escalation_threshold: Duration::from_millis(state.config.heartbeat_reporter.escalation_threshold_ms),
            silent: state.config.heartbeat_reporter.silent,
            notification_jid: state.config.heartbeat_reporter.notification_jid.clone(),
        };
        let status_groups = state.groups.clone();
        let status_queue = state.queue.clone();
        let status_fn: heartbeat_reporter::StatusFn = Arc::new(move || {
            let groups = status_groups.clone();
            let queue = status_queue.clone();
            Box::pin(async move {
                heartbeat_reporter::ReporterStatus {
                    registered_groups: groups.read().await.len(),
                    active_containers: queue.active_count().await,
                    queue_depth: queue.waiting_count().await,
                }
            })
        });
        let reporter = heartbeat_reporter::HeartbeatReporter::new(
            reporter_config,
            pool.clone(),
            telegram.clone(),
            Some(resilience.clone()),
            status_fn,
        );
        let reporter_shutdown = shutdown_rx.clone();
        handles.push((
            "heartbeat_reporter",
            tokio::spawn(async move {
                reporter.run(reporter_shutdown).await;
            }),
        ));
    }

    // DB routes use Option<PgPool> state — nested router avoids exposing
    // full AppState to the db module.
    let db_routes = Router::new()
        .route("/chats", post(db::store_chat_metadata))
        .route("/chats/name", post(db::update_chat_name))
        .route("/chats/all", post(db::get_all_chats))
        .route("/messages", post(db::store_message))
        .route("/messages/new", post(db::get_new_messages))
        .route("/messages/since", post(db::get_messages_since))
        .route("/messages/conversation", post(db::get_recent_conversation))
        .route("/tasks", post(db::create_task))
        .route("/tasks/get", post(db::get_task_by_id))
        .route("/tasks/group", post(db::get_tasks_for_group))
        .route("/tasks/all", post(db::get_all_tasks))
        .route("/tasks/update", post(db::update_task))
        .route("/tasks/delete", post(db::delete_task))
        .route("/tasks/due", post(db::get_due_tasks))
        .route("/tasks/after-run", post(db::update_task_after_run))
        .route("/tasks/log", post(db::log_task_run))
        .route("/router-state/get", post(db::get_router_state))
        .route("/router-state/set", post(db::set_router_state))
        .route("/sessions/get", post(db::get_session))
        .route("/sessions/set", post(db::set_session))
        .route("/sessions/all", post(db::get_all_sessions))
        .route("/sessions/delete", post(db::delete_session))
        .route("/groups/get", post(db::get_registered_group))
        .route("/groups/set", post(db::set_registered_group))
        .route("/groups/all", post(db::get_all_registered_groups))
        .with_state(state.db.clone());

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/v1/runtime/profiles", get(runtime_profiles))
        .route("/v1/telegram/ingress", post(telegram_ingress))
        .route("/v1/telegram/send", post(telegram_send))
        .route("/v1/telegram/edit", post(telegram_edit))
        .route("/v1/commands", post(handle_slash_command))
        .route("/v1/ops/dead-letters/retry", post(dlq_retry))
        .nest("/v1/db", db_routes)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind listener on {bind}"))?;

    info!(bind = %bind, "intercomd listening");
    let result = axum::serve(listener, app)
        .await
        .context("server exited unexpectedly");

    // Shut down in reverse start order.
    let _ = shutdown_tx.send(true);
    for (name, handle) in handles.into_iter().rev() {
        if let Err(e) = handle.await {
            tracing::warn!(task = name, err = %e, "background task join failed");
        }
    }

    result
}

fn print_config(args: PrintConfigArgs) -> anyhow::Result<()> {
    let cfg = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "intercomd",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        bind: state.config.server.bind.clone(),
    })
}

async fn readyz(State(state): State<AppState>) -> Json<ReadyResponse> {
    let groups_count = state.groups.read().await.len();
    let active = state.queue.active_count().await;
    let docker_healthy = match &state.resilience {
        Some(r) => Some(r.is_healthy().await),
        None => None,
    };
    Json(ReadyResponse {
        status: "ready",
        runtime_profiles: state.config.runtimes.profiles.len(),
        telegram_bridge_enabled: state.telegram.is_enabled(),
        postgres_connected: state.db.is_some(),
        orchestrator_enabled: state.config.orchestrator.enabled,
        registered_groups: groups_count,
        active_containers: active,
        docker_healthy,
    })
}

async fn runtime_profiles(State(state): State<AppState>) -> Json<RuntimeProfilesResponse> {
    let mut profiles = state
        .config
        .runtimes
        .profiles
        .keys()
        .cloned()
        .collect::<Vec<_>>();
    profiles.sort();

    Json(RuntimeProfilesResponse {
        default_runtime: state.config.runtimes.default_runtime.clone(),
        profiles,
    })
}

async fn telegram_ingress(
    State(state): State<AppState>,
    Json(request): Json<TelegramIngressRequest>,
) -> Json<TelegramIngressResponse> {
    match state.telegram.route_ingress(&state.config, request) {
        Ok(response) => Json(response),
        Err(err) => Json(TelegramIngressResponse {
            accepted: false,
            reason: Some(format!("routing_error: {err}")),
            normalized_content: String::new(),
            group_name: None,
            group_folder: None,
            runtime: None,
            model: None,
            parity: telegram::TelegramIngressParity {
                trigger_required: false,
                trigger_present: false,
                runtime_profile_found: false,
                runtime_fallback_used: false,
                model_fallback_used: false,
            },
        }),
    }
}

async fn telegram_send(
    State(state): State<AppState>,
    Json(request): Json<TelegramSendRequest>,
) -> Json<TelegramSendResponse> {
    match state.telegram.send_message(request).await {
        Ok(response) => Json(response),
        Err(err) => Json(TelegramSendResponse::from_error(err.to_string())),
    }
}

async fn telegram_edit(
    State(state): State<AppState>,
    Json(request): Json<TelegramEditRequest>,
) -> Json<TelegramEditResponse> {
    match state.telegram.edit_message(request).await {
        Ok(response) => Json(response),
        Err(err) => Json(TelegramEditResponse::from_error(err.to_string())),
    }
}

#[derive(serde::Deserialize)]
struct DlqRetryRequest {
    trace_id: String,
    #[serde(default = "default_retried_by")]
    retried_by: String,
}

fn default_retried_by() -> String {
    "ops".to_string()
}

#[derive(Serialize)]
struct DlqRetryResponse {
    outcome: &'static str,
}

async fn dlq_retry(
    State(state): State<AppState>,
    Json(request): Json<DlqRetryRequest>,
) -> impl IntoResponse {
    let pool = match &state.db {
        Some(p) => p,
        None => {
            return (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": "postgres not configured"})),
            )
                .into_response();
        }
    };
    match dlq::retry_dead_letter(pool, &state.queue, &request.trace_id, &request.retried_by).await {
        Ok(outcome) => {
            let outcome = match outcome {
                dlq::DlqRetryOutcome::Retrying => "retrying",
                dlq::DlqRetryOutcome::NotClaimed => "not_claimed",
                dlq::DlqRetryOutcome::QueueFull => "queue_full",
            };
            Json(DlqRetryResponse { outcome }).into_response()
        }
        Err(e) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn handle_slash_command(
    State(state): State<AppState>,
    Json(request): Json<commands::CommandRequest>,
) -> Json<commands::CommandResult> {
    let assistant_name = std::env::var("ASSISTANT_NAME").unwrap_or_else(|_| "Amtiskaw".into());
    let ctx = commands::CommandContext {
        assistant_name,
        started_at: state.started_at,
    };
    let result = commands::handle_command(
        &request.command,
        &request.args,
        request.group_name.as_deref(),
        request.group_folder.as_deref(),
        request.current_model.as_deref(),
        request.session_id.as_deref(),
        request.container_active,
        &ctx,
    );

    if !result.effects.is_empty() {
        apply_command_effects(
            &state,
            &request.chat_jid,
            request.group_folder.as_deref(),
            &result.effects,
        )
        .await;
    }

    Json(result)
}

/// Apply side effects from command handlers.
async fn apply_command_effects(
    state: &AppState,
    chat_jid: &str,
    group_folder: Option<&str>,
    effects: &[commands::CommandEffect],
) {
    for effect in effects {
        match effect {
            commands::CommandEffect::KillContainer => {
                state.queue.kill_group(chat_jid).await;
            }
            commands::CommandEffect::ClearSession => {
                if let Some(folder) = group_folder {
                    state.sessions.write().await.remove(folder);
                    if let Some(ref pool) = state.db {
                        if let Err(e) = pool.delete_session(folder).await {
                            tracing::warn!(err = %e, folder, "failed to delete session");
                        }
                    }
                }
            }
            commands::CommandEffect::SwitchModel { model_id, runtime } => {
                if let Some(folder) = group_folder {
                    let mut groups = state.groups.write().await;
                    if let Some(group) = groups.values_mut().find(|g| g.folder == folder) {
                        group.model = Some(model_id.clone());
                        group.runtime = Some(runtime.clone());

                        if let Some(ref pool) = state.db {
                            if let Err(e) = pool.set_registered_group(group).await {
                                tracing::warn!(err = %e, folder, "failed to persist model switch");
                            }
                        }
                    }
                }
            }
        }
    }
}
