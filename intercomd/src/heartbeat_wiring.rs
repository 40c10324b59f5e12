//! Smart-Job Runner → GroupQueue wiring.
//!
//! Builds the `JobExecutor` closure `heartbeat_runner`'s poll loop calls for
//! each due job. Unlike the scheduler's `TaskCallback` (fire-and-forget, the
//! scheduler doesn't wait on the container), the runner needs the outcome to
//! record `last_result` — so the `TaskFn` enqueued into `GroupQueue` reports
//! back through a oneshot channel.
//!
//! Jobs run under a virtual `_hb_<chat_jid>` queue key rather than the real
//! group's own key: a heartbeat job and a live user conversation for the
//! same group must not block each other, but heartbeat runs for the same
//! chat still serialize against one another and count against the global
//! concurrency cap like any other container.

use std::collections::HashMap;
use std::sync::Arc;

use intercom_core::{ContainerInput, ContainerOutput, ContainerStatus, HeartbeatJob, RegisteredGroup};
use tokio::sync::{RwLock, oneshot};
use tracing::warn;

use crate::container::mounts::GroupInfo;
use crate::container::runner::{RunConfig, run_container_agent};
use crate::container::security::ContainerConfig;
use crate::heartbeat_runner::JobExecutor;
use crate::process_group::resolve_runtime;
use crate::queue::{GroupQueue, Lane};
use crate::telegram::TelegramBridge;

pub fn build_job_executor(
    queue: Arc<GroupQueue>,
    groups: Arc<RwLock<HashMap<String, RegisteredGroup>>>,
    telegram: Arc<TelegramBridge>,
    assistant_name: String,
    run_config: RunConfig,
) -> JobExecutor {
    Arc::new(move |job: HeartbeatJob| {
        let queue = queue.clone();
        let groups = groups.clone();
        let telegram = telegram.clone();
        let assistant_name = assistant_name.clone();
        let run_config = run_config.clone();

        Box::pin(async move {
            let group = {
                let g = groups.read().await;
                g.values().find(|g| g.jid == job.chat_jid).cloned()
            };
            let Some(group) = group else {
                return Err(format!("no registered group for chat {}", job.chat_jid));
            };

            let runtime = resolve_runtime(&group);
            let input = ContainerInput {
                prompt: job.prompt.clone(),
                session_id: None,
                group_folder: group.folder.clone(),
                chat_jid: job.chat_jid.clone(),
                is_main: false,
                is_scheduled_task: Some(true),
                assistant_name: Some(assistant_name),
                model: group.model.clone(),
                secrets: None,
            };
            let group_info = GroupInfo {
                folder: group.folder.clone(),
                name: group.name.clone(),
                container_config: group
                    .container_config
                    .as_ref()
                    .and_then(|v| serde_json::from_value::<ContainerConfig>(v.clone()).ok()),
            };

            let (tx, rx) = oneshot::channel::<Result<String, String>>();
            let tx = std::sync::Mutex::new(Some(tx));
            let chat_jid_cb = job.chat_jid.clone();
            let queue_cb = queue.clone();

            let on_output: Option<Arc<crate::container::runner::OutputCallback>> =
                Some(Arc::new(Box::new(move |output: ContainerOutput| {
                    let tx = tx.lock().unwrap().take();
                    let chat_jid = chat_jid_cb.clone();
                    let queue = queue_cb.clone();
                    Box::pin(async move {
                        if output.status == ContainerStatus::Success {
                            queue.notify_idle(&chat_jid).await;
                        }
                        if let Some(tx) = tx {
                            let result = match output.status {
                                ContainerStatus::Success => {
                                    Ok(output.result.unwrap_or_default())
                                }
                                ContainerStatus::Error => {
                                    Err(output.error.unwrap_or_else(|| "unknown error".into()))
                                }
                            };
                            let _ = tx.send(result);
                        }
                    })
                })));

            let virtual_jid = format!("_hb_{}", job.chat_jid);
            let job_id = job.id.clone();
            let task_fn = Box::new(move || -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
                Box::pin(async move {
                    if let Err(e) = run_container_agent(&group_info, &input, runtime, false, &run_config, on_output).await {
                        warn!(job_id = %job_id, err = %e, "heartbeat job container error");
                    }
                })
            });

            queue
                .enqueue_task(&virtual_jid, &format!("hb-{}", job.id), Lane::Heartbeat, task_fn, false)
                .await;

            rx.await.unwrap_or_else(|_| Err("heartbeat job dropped before completion".to_string()))
        })
    })
}
