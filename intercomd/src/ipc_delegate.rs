//! Concrete `IpcDelegate` — dispatches authenticated IPC commands from
//! containers against the scheduler store, heartbeat store, registered-group
//! state, and the messaging channel.
//!
//! `IpcDelegate::handle_task` is synchronous (the trait is shared with
//! test doubles); real work is fire-and-forget `tokio::spawn`ed, the same
//! idiom `GroupQueue`'s rejection/max-retries callbacks use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use intercom_core::{HeartbeatJob, IpcGroupContext, IpcTask, PgPool, RegisteredGroup, ScheduledTask, TaskUpdate};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::container::runner::RunConfig;
use crate::ipc::{GroupRegistry, IpcDelegate};
use crate::queue::GroupQueue;
use crate::scheduler::{DueTask, calculate_next_run};
use crate::scheduler_wiring::run_scheduled_task;
use crate::telegram::TelegramBridge;

pub struct OrchestratorDelegate {
    pub pool: PgPool,
    pub queue: Arc<GroupQueue>,
    pub telegram: Arc<TelegramBridge>,
    pub groups: Arc<RwLock<HashMap<String, RegisteredGroup>>>,
    pub sessions: Arc<RwLock<HashMap<String, String>>>,
    pub registry: Arc<RwLock<GroupRegistry>>,
    pub run_config: RunConfig,
    pub timezone: String,
}

impl IpcDelegate for OrchestratorDelegate {
    fn send_message(&self, chat_jid: &str, text: &str, _sender: Option<&str>) {
        let telegram = self.telegram.clone();
        let chat_jid = chat_jid.to_string();
        let text = text.to_string();
        tokio::spawn(async move {
            if let Err(e) = telegram.send_text_to_jid(&chat_jid, &text).await {
                warn!(err = %e, chat_jid, "failed to deliver IPC-forwarded message");
            }
        });
    }

    fn handle_task(&self, task: IpcTask, ctx: &IpcGroupContext) {
        let pool = self.pool.clone();
        let queue = self.queue.clone();
        let groups = self.groups.clone();
        let sessions = self.sessions.clone();
        let telegram = self.telegram.clone();
        let registry = self.registry.clone();
        let run_config = self.run_config.clone();
        let timezone = self.timezone.clone();
        let ctx = ctx.clone();

        tokio::spawn(async move {
            if let Err(e) = dispatch(
                task, &ctx, &pool, &queue, &groups, &sessions, &telegram, &registry, &run_config, &timezone,
            )
            .await
            {
                warn!(group = ctx.group_folder.as_str(), err = %e, "IPC task dispatch failed");
            }
        });
    }
}

async fn dispatch(
    task: IpcTask,
    ctx: &IpcGroupContext,
    pool: &PgPool,
    queue: &Arc<GroupQueue>,
    groups: &Arc<RwLock<HashMap<String, RegisteredGroup>>>,
    sessions: &Arc<RwLock<HashMap<String, String>>>,
    telegram: &Arc<TelegramBridge>,
    registry: &Arc<RwLock<GroupRegistry>>,
    run_config: &RunConfig,
    timezone: &str,
) -> anyhow::Result<()> {
    match task {
        IpcTask::ScheduleTask {
            prompt,
            schedule_type,
            schedule_value,
            context_mode,
            target_jid,
            created_by,
            ..
        } => {
            let chat_jid = resolve_target_jid(ctx, target_jid, registry).await;
            let next_run = if schedule_type == "once" {
                Some(schedule_value.clone())
            } else {
                calculate_next_run(&schedule_type, &schedule_value, timezone)
            };
            let task = ScheduledTask {
                id: new_id("task"),
                group_folder: ctx.group_folder.clone(),
                chat_jid,
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                next_run,
                last_run: None,
                last_result: None,
                status: "active".to_string(),
                created_at: chrono::Utc::now().to_rfc3339(),
                retry_count: 0,
                max_retries: 3,
                retry_delay_ms: 60_000,
                task_timeout_ms: None,
                label: created_by,
            };
            pool.create_task(&task).await?;
            info!(task_id = task.id.as_str(), group = ctx.group_folder.as_str(), "task scheduled via IPC");
        }
        IpcTask::PauseTask { task_id, .. } => {
            pool.update_task(&task_id, &TaskUpdate { status: Some("paused".to_string()), ..Default::default() }).await?;
        }
        IpcTask::ResumeTask { task_id, .. } => {
            pool.update_task(&task_id, &TaskUpdate { status: Some("active".to_string()), ..Default::default() }).await?;
        }
        IpcTask::CancelTask { task_id, .. } => {
            pool.delete_task(&task_id).await?;
        }
        IpcTask::RunTaskNow { task_id, .. } => {
            if let Some(due) = pool.get_task_by_id(&task_id).await? {
                let due_task = DueTask {
                    id: due.id,
                    group_folder: due.group_folder,
                    chat_jid: due.chat_jid,
                    prompt: due.prompt,
                    schedule_type: due.schedule_type,
                    schedule_value: due.schedule_value,
                    context_mode: due.context_mode,
                    retry_delay_ms: due.retry_delay_ms,
                    max_retries: due.max_retries,
                };
                let pool = pool.clone();
                let queue = queue.clone();
                let groups = groups.clone();
                let sessions = sessions.clone();
                let telegram = telegram.clone();
                let run_config = run_config.clone();
                let timezone = timezone.to_string();
                // Runs through the same path as a normal scheduled firing
                // (log_and_update etc.), so it resets retry_count on success
                // exactly like the poll loop would.
                tokio::spawn(async move {
                    run_scheduled_task(
                        due_task, &pool, &queue, &groups, &sessions, &telegram, &run_config, &timezone,
                    )
                    .await;
                });
            }
        }
        IpcTask::UpdateTask {
            task_id,
            prompt,
            schedule_type,
            schedule_value,
            ..
        } => {
            let next_run = match (&schedule_type, &schedule_value) {
                (Some(st), Some(sv)) => calculate_next_run(st, sv, timezone),
                _ => None,
            };
            pool.update_task(
                &task_id,
                &TaskUpdate {
                    prompt,
                    schedule_type,
                    schedule_value,
                    next_run,
                    status: None,
                },
            )
            .await?;
        }
        IpcTask::RefreshGroups { .. } => {
            let all = pool.get_all_registered_groups().await?;
            let mut g = groups.write().await;
            *g = all;
            let mut reg = registry.write().await;
            for group in g.values() {
                reg.register(group.jid.clone(), group.folder.clone());
            }
        }
        IpcTask::RegisterGroup { jid, name, folder, trigger, .. } => {
            let group = RegisteredGroup {
                jid: jid.clone(),
                name,
                folder: folder.clone(),
                trigger,
                added_at: chrono::Utc::now().to_rfc3339(),
                container_config: None,
                requires_trigger: None,
                runtime: None,
                model: None,
            };
            pool.set_registered_group(&group).await?;
            groups.write().await.insert(jid.clone(), group);
            registry.write().await.register(jid, folder);
        }
        IpcTask::HeartbeatConfig { .. } => {
            // Routed through IntercomConfig at startup; runtime patches are
            // logged only until a live-reload channel exists for config.
            info!("heartbeat_config command received (config patch not yet live-reloadable)");
        }
        IpcTask::HeartbeatAddJob { chat_jid, label, prompt, category, interval_ms, created_by, .. } => {
            // A non-main sender may only add a job against its own chat —
            // identity comes from the source directory, not the payload.
            let chat_jid = resolve_target_jid(ctx, Some(chat_jid), registry).await;
            let job = HeartbeatJob {
                id: new_id("hb"),
                chat_jid,
                label,
                prompt,
                category: category.unwrap_or_else(|| "custom".to_string()),
                status: "active".to_string(),
                interval_ms,
                last_run: None,
                last_result: None,
                created_at: chrono::Utc::now().to_rfc3339(),
                created_by,
            };
            pool.create_heartbeat_job(&job).await?;
        }
        IpcTask::HeartbeatUpdateJob { id, label, prompt, status, interval_ms, .. } => {
            if !owns_heartbeat_job(ctx, pool, registry, &id).await? {
                warn!(group = ctx.group_folder.as_str(), job_id = id.as_str(), "heartbeat_update_job denied: not job owner");
                return Ok(());
            }
            if let Some(status) = status {
                pool.set_heartbeat_job_status(&id, &status).await?;
            }
            pool.update_heartbeat_job(&id, label.as_deref(), prompt.as_deref(), interval_ms).await?;
        }
        IpcTask::HeartbeatRemoveJob { id, .. } => {
            if !owns_heartbeat_job(ctx, pool, registry, &id).await? {
                warn!(group = ctx.group_folder.as_str(), job_id = id.as_str(), "heartbeat_remove_job denied: not job owner");
                return Ok(());
            }
            pool.remove_heartbeat_job(&id).await?;
        }
    }

    Ok(())
}

/// Resolve the target chat JID for a scheduled task. Non-main groups can
/// only target their own chat — any `targetJid` in the payload is ignored
/// for them, since identity comes from the source directory, not the body.
async fn resolve_target_jid(
    ctx: &IpcGroupContext,
    target_jid: Option<String>,
    registry: &Arc<RwLock<GroupRegistry>>,
) -> String {
    if ctx.is_main {
        if let Some(jid) = target_jid {
            return jid;
        }
    }
    registry
        .read()
        .await
        .jid_for_folder(&ctx.group_folder)
        .map(|s| s.to_string())
        .unwrap_or_else(|| ctx.group_folder.clone())
}

/// Any group may touch its own heartbeat jobs; main may touch any (spec
/// §4.10). Looks the job up by id and checks its `chat_jid` maps back to
/// the caller's own folder — a non-main sender never gets to claim
/// ownership by asserting a `chatJid` in the payload, since a job update/
/// remove command only carries the job id, not a target.
async fn owns_heartbeat_job(
    ctx: &IpcGroupContext,
    pool: &PgPool,
    registry: &Arc<RwLock<GroupRegistry>>,
    job_id: &str,
) -> anyhow::Result<bool> {
    if ctx.is_main {
        return Ok(true);
    }
    let own_jid = registry.read().await.jid_for_folder(&ctx.group_folder).map(|s| s.to_string());
    let Some(job) = pool.get_heartbeat_job(job_id).await? else {
        return Ok(false);
    };
    Ok(own_jid.as_deref() == Some(job.chat_jid.as_str()))
}

fn new_id(prefix: &str) -> String {
    let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
    format!("{prefix}-{ts}-{:04x}", rand::random::<u16>())
}
