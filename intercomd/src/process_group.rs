//! processGroupMessages callback — invoked by GroupQueue when it's a group's turn.
//!
//! Port of `processGroupMessages()` + `runAgent()` from `src/index.ts`.
//!
//! Flow:
//! 1. Look up group from JID in shared state
//! 2. Fetch pending messages from Postgres since lastAgentTimestamp
//! 3. Check trigger for non-main groups
//! 4. Format prompt from messages
//! 5. Spawn container via run_container_agent()
//! 6. Stream output: route results to Telegram
//! 7. Store bot responses in Postgres
//! 8. Advance per-group cursor on success, rollback on error

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use intercom_core::budget::{BudgetAction, BudgetThresholds, decide_action, default_price_table, estimate_cost};
use intercom_core::classifier::Tier;
use intercom_core::config::BudgetConfig;
use intercom_core::{
    ContainerInput, ContainerOutput, ContainerStatus, CostUsage, PgPool, RegisteredGroup,
    RuntimeKind, classify, stable_user_id,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::container::mounts::GroupInfo;
use crate::container::pool::ContainerPool;
use crate::container::runner::{OutputCallback, RunConfig, RunResult, run_container_agent};
use crate::container::security::ContainerConfig;
use crate::message_loop::{self, AgentTimestamps};
use crate::queue::{GroupQueue, ProcessMessagesFn};
use crate::receipt_tracking::{self, ActiveTraces};
use crate::telegram::TelegramBridge;

/// How long to wait for a pooled standby to finish an assigned task before
/// giving up and falling back to a cold spawn for the retry.
const POOL_ASSIGNMENT_TIMEOUT_MS: u64 = 600_000;

/// Build the `ProcessMessagesFn` closure that GroupQueue invokes for message processing.
///
/// The returned closure captures all shared state and is `Send + Sync`.
pub fn build_process_messages_fn(
    pool: PgPool,
    queue: Arc<GroupQueue>,
    groups: Arc<RwLock<HashMap<String, RegisteredGroup>>>,
    sessions: Arc<RwLock<HashMap<String, String>>>,
    telegram: Arc<TelegramBridge>,
    assistant_name: String,
    main_group_folder: String,
    run_config: RunConfig,
    budget_config: BudgetConfig,
    container_pool: Option<Arc<ContainerPool>>,
    active_traces: ActiveTraces,
) -> ProcessMessagesFn {
    Arc::new(move |chat_jid: String, retry_count: u32| {
        let pool = pool.clone();
        let queue = queue.clone();
        let groups = groups.clone();
        let sessions = sessions.clone();
        let telegram = telegram.clone();
        let assistant_name = assistant_name.clone();
        let main_group_folder = main_group_folder.clone();
        let run_config = run_config.clone();
        let budget_config = budget_config.clone();
        let container_pool = container_pool.clone();
        let active_traces = active_traces.clone();

        Box::pin(async move {
            match process_group_messages(
                &chat_jid,
                &pool,
                &queue,
                &groups,
                &sessions,
                &telegram,
                &assistant_name,
                &main_group_folder,
                &run_config,
                &budget_config,
                container_pool.as_ref(),
                &active_traces,
                retry_count,
            )
            .await
            {
                Ok(success) => success,
                Err(e) => {
                    error!(chat_jid, retry_count, err = %e, "processGroupMessages failed");
                    false
                }
            }
        })
    })
}

/// Core logic for processing messages for a single group.
async fn process_group_messages(
    chat_jid: &str,
    pool: &PgPool,
    queue: &Arc<GroupQueue>,
    groups: &Arc<RwLock<HashMap<String, RegisteredGroup>>>,
    sessions: &Arc<RwLock<HashMap<String, String>>>,
    telegram: &Arc<TelegramBridge>,
    assistant_name: &str,
    main_group_folder: &str,
    run_config: &RunConfig,
    budget_config: &BudgetConfig,
    container_pool: Option<&Arc<ContainerPool>>,
    active_traces: &ActiveTraces,
    retry_count: u32,
) -> anyhow::Result<bool> {
    // 1. Look up group
    let group = {
        let g = groups.read().await;
        match g.get(chat_jid) {
            Some(group) => group.clone(),
            None => return Ok(true), // unknown group — skip, not an error
        }
    };

    let is_main = group.folder == main_group_folder;

    // 2. Load agent timestamp and fetch pending messages
    let mut agent_timestamps = message_loop::load_agent_timestamps_pub(pool).await;
    let since = agent_timestamps
        .0
        .get(chat_jid)
        .cloned()
        .unwrap_or_default();

    let pending = pool
        .get_messages_since(chat_jid, &since, assistant_name)
        .await?;

    if pending.is_empty() {
        return Ok(true);
    }

    // 3. Check trigger for non-main groups
    if !is_main && group.requires_trigger.unwrap_or(true) {
        let trigger = if group.trigger.is_empty() {
            None
        } else {
            Some(group.trigger.as_str())
        };
        let re = message_loop::build_trigger_regex_pub(assistant_name, trigger);
        let has_trigger = pending.iter().any(|m| re.is_match(m.content.trim()));
        if !has_trigger {
            return Ok(true);
        }
    }

    // 4. Format prompt
    let prompt = message_loop::format_messages_pub(&pending);

    // This run owns the window it just fetched — mint/merge receipts for it
    // and take over bookkeeping from any earlier piped additions.
    let window = receipt_tracking::mint_receipts(pool, chat_jid, &pending).await;
    receipt_tracking::set_window(active_traces, chat_jid, window).await;

    // Save cursor position for rollback on error
    let previous_cursor = since.clone();
    let new_cursor = pending
        .last()
        .map(|m| m.timestamp.clone())
        .unwrap_or_default();

    // Advance cursor before running agent (matches Node behavior)
    agent_timestamps
        .0
        .insert(chat_jid.to_string(), new_cursor.clone());
    message_loop::save_agent_timestamps_pub(pool, &agent_timestamps).await;

    info!(
        group = group.name.as_str(),
        message_count = pending.len(),
        "processing messages"
    );

    // Classify the last message in the window and apply the inline/budget gates.
    let last_text = pending.last().map(|m| m.content.as_str()).unwrap_or("");
    let classification = classify(last_text);

    if classification.tier == Tier::Inline {
        let reply = match classification.reason {
            "admin-cmd" => {
                "Admin commands are handled through the control channel — use /help there."
            }
            _ => "Got it.",
        };
        let _ = telegram.send_text_to_jid(chat_jid, reply).await;
        mark_window_replied(pool, active_traces, chat_jid).await;
        return Ok(true);
    }

    if classification.tier == Tier::OracleOnly {
        // No knowledge service is wired up yet — fall through to a container
        // run per the spec's documented fallback behavior.
        debug!(
            group = group.name.as_str(),
            "oracle-only tier requested, no knowledge service configured, falling through to container"
        );
    }

    let requested_model = group
        .model
        .clone()
        .unwrap_or_else(|| classification.model.to_string());
    let mut effective_model = requested_model.clone();

    let cost_budget = pool.get_budget(&group.folder).await.ok().flatten();
    let (monthly_budget, daily_budget, thresholds, downgrade_model) = match &cost_budget {
        Some(b) => (
            b.monthly_budget,
            b.daily_budget,
            BudgetThresholds {
                alert: b.alert_thresh,
                downgrade: b.downgrade_thresh,
                hard_limit: b.hard_limit_thresh,
            },
            b.downgrade_model.clone(),
        ),
        None => (
            budget_config.monthly_budget_usd,
            budget_config.daily_budget_usd.unwrap_or(0.0),
            BudgetThresholds::default(),
            "haiku".to_string(),
        ),
    };
    let spend_month = pool.spend_month_to_date(&group.folder).await.unwrap_or(0.0);
    let spend_today = pool.spend_today(&group.folder).await.unwrap_or(0.0);
    let action = decide_action(spend_month, monthly_budget, spend_today, daily_budget, &thresholds);

    match action {
        BudgetAction::Offline => {
            let _ = telegram
                .send_text_to_jid(
                    chat_jid,
                    "Budget exhausted for this period — requests are paused until it resets.",
                )
                .await;
            mark_window_replied(pool, active_traces, chat_jid).await;
            return Ok(true);
        }
        BudgetAction::HaikuOnly | BudgetAction::Downgrade => {
            effective_model = downgrade_model;
        }
        BudgetAction::Alert => {
            if pool
                .should_fire_alert(&group.folder, "budget-alert")
                .await
                .unwrap_or(false)
            {
                let _ = telegram
                    .send_text_to_jid(
                        chat_jid,
                        "Heads up — this group is approaching its spend budget for the period.",
                    )
                    .await;
            }
        }
        BudgetAction::Normal => {}
    }

    // 5. Resolve runtime and session
    let runtime = resolve_runtime(&group);
    let session_id = {
        let s = sessions.read().await;
        s.get(&group.folder).cloned()
    };

    let prompt_char_count = prompt.chars().count();
    let input = ContainerInput {
        prompt,
        session_id,
        group_folder: group.folder.clone(),
        chat_jid: chat_jid.to_string(),
        is_main,
        is_scheduled_task: None,
        assistant_name: Some(assistant_name.to_string()),
        model: Some(effective_model.clone()),
        secrets: None, // Secrets injected by runner from env files
    };

    let group_info = GroupInfo {
        folder: group.folder.clone(),
        name: group.name.clone(),
        container_config: group
            .container_config
            .as_ref()
            .and_then(|v| serde_json::from_value::<ContainerConfig>(v.clone()).ok()),
    };

    // 6. Run container and collect output
    let sessions_clone: Arc<RwLock<HashMap<String, String>>> = sessions.clone();
    let group_folder = group.folder.clone();
    let queue_clone: Arc<GroupQueue> = queue.clone();
    let chat_jid_owned = chat_jid.to_string();

    // Track whether we sent any output to the user
    let output_sent = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let output_sent_cb = output_sent.clone();

    let telegram_cb: Arc<TelegramBridge> = telegram.clone();
    let pool_cb = pool.clone();
    let assistant_name_cb = assistant_name.to_string();

    let on_output: Option<Arc<OutputCallback>> = Some(Arc::new(Box::new(
        move |output: ContainerOutput| {
            let sessions = sessions_clone.clone();
            let group_folder = group_folder.clone();
            let queue = queue_clone.clone();
            let chat_jid = chat_jid_owned.clone();
            let telegram = telegram_cb.clone();
            let pool = pool_cb.clone();
            let assistant_name = assistant_name_cb.clone();
            let output_sent = output_sent_cb.clone();

            Box::pin(async move {
                // Track session ID from container
                if let Some(ref sid) = output.new_session_id {
                    let mut s = sessions.write().await;
                    s.insert(group_folder.clone(), sid.clone());
                    // Persist to Postgres
                    if let Err(e) = pool.set_session(&group_folder, sid).await {
                        warn!(err = %e, "failed to persist session");
                    }
                }

                // Handle final result
                if let Some(ref result_text) = output.result {
                    // Strip <internal>...</internal> blocks
                    let text = strip_internal_blocks(result_text);
                    if !text.is_empty() {
                        // Send via Telegram
                        if let Err(e) = telegram
                            .send_text_to_jid(&chat_jid, &text)
                            .await
                        {
                            error!(err = %e, "failed to send agent output via Telegram");
                        }

                        // Store bot response in Postgres
                        let bot_msg = intercom_core::NewMessage {
                            id: format!("bot-{}", chrono::Utc::now().timestamp_millis()),
                            chat_jid: chat_jid.clone(),
                            sender: "bot".into(),
                            sender_name: assistant_name.clone(),
                            content: text,
                            timestamp: chrono::Utc::now().to_rfc3339(),
                            is_from_me: true,
                            is_bot_message: true,
                        };
                        if let Err(e) = pool.store_message(&bot_msg).await {
                            warn!(err = %e, "failed to store bot response");
                        }

                        output_sent.store(true, std::sync::atomic::Ordering::SeqCst);
                    }
                }

                // Notify queue on completion
                if output.status == ContainerStatus::Success {
                    queue.notify_idle(&chat_jid).await;
                }
            })
        },
    )));

    // Mark the window RUNNING and open an attempt row per receipt before
    // dispatch — a crash mid-run leaves these at RUNNING for startup
    // recovery to pick up rather than silently stuck at QUEUED.
    let mut attempt_nos: HashMap<String, i32> = HashMap::new();
    for item in receipt_tracking::peek_window(active_traces, chat_jid).await {
        if let Err(e) = pool.set_receipt_status(&item.trace_id, "RUNNING", None, None).await {
            warn!(trace_id = item.trace_id.as_str(), err = %e, "failed to mark receipt running");
        }
        match pool.record_attempt_start(&item.trace_id, None).await {
            Ok(attempt_no) => {
                attempt_nos.insert(item.trace_id.clone(), attempt_no);
            }
            Err(e) => warn!(trace_id = item.trace_id.as_str(), err = %e, "failed to record attempt start"),
        }
    }

    let result = match container_pool {
        Some(pool_mgr) => match pool_mgr.acquire(&group_info.folder).await {
            Some(container_name) => {
                dispatch_via_pool(pool_mgr, &container_name, &input, on_output).await
            }
            None => {
                pool_mgr.record_fallback().await;
                run_container_agent(&group_info, &input, runtime, is_main, run_config, on_output).await
            }
        },
        None => run_container_agent(&group_info, &input, runtime, is_main, run_config, on_output).await,
    };

    // 7. Handle result
    match result {
        Ok(run_result) => {
            // Track session from final output
            if let Some(ref sid) = run_result.output.new_session_id {
                let mut s = sessions.write().await;
                s.insert(group.folder.clone(), sid.clone());
                if let Err(e) = pool.set_session(&group.folder, sid).await {
                    warn!(err = %e, "failed to persist session");
                }
            }

            if run_result.output.status == ContainerStatus::Error {
                let timed_out = run_result
                    .output
                    .error
                    .as_deref()
                    .is_some_and(|e| e.contains("timed out"));
                end_attempts(pool, &attempt_nos, None, timed_out).await;
                if timed_out {
                    for item in receipt_tracking::peek_window(active_traces, chat_jid).await {
                        if let Err(e) = pool.mark_receipt_timeout(&item.trace_id).await {
                            warn!(trace_id = item.trace_id.as_str(), err = %e, "failed to record receipt timeout");
                        }
                    }
                }

                // Error, but if we already sent output, don't rollback cursor
                if output_sent.load(std::sync::atomic::Ordering::SeqCst) {
                    warn!(
                        group = group.name.as_str(),
                        "agent error after output sent, skipping cursor rollback"
                    );
                    mark_window_replied(pool, active_traces, chat_jid).await;
                    return Ok(true);
                }

                notify_error_on_first_attempt(telegram, chat_jid, retry_count).await;

                // Rollback cursor for retry
                agent_timestamps
                    .0
                    .insert(chat_jid.to_string(), previous_cursor);
                message_loop::save_agent_timestamps_pub(pool, &agent_timestamps).await;
                warn!(
                    group = group.name.as_str(),
                    retry_count,
                    "agent error, rolled back cursor for retry"
                );
                mark_window_retrying(pool, active_traces, chat_jid, "AGENT_ERROR", run_result.output.error.as_deref()).await;
                return Ok(false);
            }

            if !output_sent.load(std::sync::atomic::Ordering::SeqCst) {
                // Success exit, but nothing user-visible shipped — treat the
                // same as a failure for retry/rollback purposes.
                end_attempts(pool, &attempt_nos, Some(0), false).await;
                notify_error_on_first_attempt(telegram, chat_jid, retry_count).await;
                agent_timestamps
                    .0
                    .insert(chat_jid.to_string(), previous_cursor);
                message_loop::save_agent_timestamps_pub(pool, &agent_timestamps).await;
                warn!(
                    group = group.name.as_str(),
                    retry_count,
                    "no output produced, rolled back cursor for retry"
                );
                mark_window_retrying(pool, active_traces, chat_jid, "NO_OUTPUT", None).await;
                return Ok(false);
            }

            end_attempts(pool, &attempt_nos, Some(0), false).await;
            mark_window_replied(pool, active_traces, chat_jid).await;

            let input_tokens = (prompt_char_count as i64 / 4).max(1);
            let output_tokens = run_result
                .output
                .result
                .as_ref()
                .map(|r| (r.chars().count() as i64 / 4).max(1))
                .unwrap_or(0);
            let table = default_price_table();
            let cost = estimate_cost(&effective_model, input_tokens, output_tokens, &table);
            let usage = CostUsage {
                user_id: stable_user_id(chat_jid),
                tier: classification.tier.as_str().to_string(),
                model: effective_model.clone(),
                input_tokens,
                output_tokens,
                estimated_cost_usd: cost,
                response_time_ms: run_result.duration.as_millis() as i64,
                group_id: group.folder.clone(),
                trace_id: None,
                cache_hit: false,
            };
            if let Err(e) = pool.track_usage(&usage).await {
                warn!(err = %e, "failed to record cost usage");
            }

            Ok(true)
        }
        Err(e) => {
            error!(group = group.name.as_str(), err = %e, "container agent error");
            end_attempts(pool, &attempt_nos, None, false).await;

            if output_sent.load(std::sync::atomic::Ordering::SeqCst) {
                warn!(
                    group = group.name.as_str(),
                    "agent error after output sent, skipping cursor rollback"
                );
                mark_window_replied(pool, active_traces, chat_jid).await;
                return Ok(true);
            }

            notify_error_on_first_attempt(telegram, chat_jid, retry_count).await;

            // Rollback cursor
            agent_timestamps
                .0
                .insert(chat_jid.to_string(), previous_cursor);
            message_loop::save_agent_timestamps_pub(pool, &agent_timestamps).await;
            mark_window_retrying(pool, active_traces, chat_jid, "AGENT_ERROR", Some(e.to_string().as_str())).await;
            Ok(false)
        }
    }
}

/// Close out every open attempt row for the receipts currently running.
async fn end_attempts(pool: &PgPool, attempt_nos: &HashMap<String, i32>, exit_code: Option<i32>, timeout_hit: bool) {
    for (trace_id, attempt_no) in attempt_nos {
        if let Err(e) = pool.record_attempt_end(trace_id, *attempt_no, exit_code, timeout_hit).await {
            warn!(trace_id = trace_id.as_str(), err = %e, "failed to record attempt end");
        }
    }
}

/// Mark every receipt in the group's in-flight window `REPLIED` and clear
/// the window — the run that owned it is done.
async fn mark_window_replied(pool: &PgPool, active_traces: &ActiveTraces, chat_jid: &str) {
    for item in receipt_tracking::take_window(active_traces, chat_jid).await {
        if let Err(e) = pool.set_receipt_status(&item.trace_id, "REPLIED", None, None).await {
            warn!(trace_id = item.trace_id.as_str(), err = %e, "failed to mark receipt replied");
        }
    }
}

/// Mark every receipt in the group's in-flight window `RETRYING` with the
/// given error code, but keep the window intact — the next run against the
/// same (rolled-back) cursor will re-adopt it via `set_window`.
async fn mark_window_retrying(pool: &PgPool, active_traces: &ActiveTraces, chat_jid: &str, error_code: &str, error_detail: Option<&str>) {
    for item in receipt_tracking::peek_window(active_traces, chat_jid).await {
        if let Err(e) = pool
            .set_receipt_status(&item.trace_id, "RETRYING", Some(error_code), error_detail)
            .await
        {
            warn!(trace_id = item.trace_id.as_str(), err = %e, "failed to mark receipt retrying");
        }
    }
}

/// Hand a task to an already-warm standby container instead of cold-spawning.
///
/// `run_container_agent`'s `on_output` is bound for the lifetime of the
/// process, so a reused standby routes through `ContainerPool::set_route`
/// instead: this installs the real callback for the duration of one
/// assignment, writes `_assignment.json`, and waits for the routed callback
/// to fire once (one full turn) or for the assignment to time out.
async fn dispatch_via_pool(
    pool_mgr: &Arc<ContainerPool>,
    container_name: &str,
    input: &ContainerInput,
    on_output: Option<Arc<OutputCallback>>,
) -> anyhow::Result<RunResult> {
    let start = std::time::Instant::now();
    let Some(on_output) = on_output else {
        pool_mgr.release(container_name, true).await;
        anyhow::bail!("pooled dispatch requires an output callback");
    };

    let (tx, rx) = tokio::sync::oneshot::channel::<ContainerOutput>();
    let tx = Arc::new(tokio::sync::Mutex::new(Some(tx)));
    let routed: Arc<OutputCallback> = Arc::new(Box::new(move |output: ContainerOutput| {
        let inner_cb = on_output.clone();
        let tx = tx.clone();
        let signal = output.clone();
        Box::pin(async move {
            inner_cb(output).await;
            if let Some(sender) = tx.lock().await.take() {
                let _ = sender.send(signal);
            }
        })
    }));

    pool_mgr.set_route(container_name, routed).await;

    let input_json = match serde_json::to_string(input) {
        Ok(j) => j,
        Err(e) => {
            pool_mgr.clear_route(container_name).await;
            pool_mgr.release(container_name, true).await;
            return Err(e.into());
        }
    };

    if let Err(e) = pool_mgr.assign_task(container_name, &input_json).await {
        pool_mgr.clear_route(container_name).await;
        pool_mgr.release(container_name, false).await;
        return Err(e);
    }

    let timeout = Duration::from_millis(POOL_ASSIGNMENT_TIMEOUT_MS);
    let outcome = tokio::time::timeout(timeout, rx).await;
    pool_mgr.clear_route(container_name).await;

    match outcome {
        Ok(Ok(output)) => {
            let keep_alive = output.status == ContainerStatus::Success;
            pool_mgr.release(container_name, keep_alive).await;
            Ok(RunResult {
                output,
                container_name: container_name.to_string(),
                duration: start.elapsed(),
            })
        }
        Ok(Err(_)) => {
            pool_mgr.release(container_name, false).await;
            anyhow::bail!("pooled container dropped its output channel")
        }
        Err(_) => {
            pool_mgr.release(container_name, false).await;
            anyhow::bail!("pooled container assignment timed out after {}ms", timeout.as_millis())
        }
    }
}

/// Send a brief user-facing error notice only on the first attempt — retries
/// stay silent so a flapping container doesn't spam the chat.
async fn notify_error_on_first_attempt(telegram: &Arc<TelegramBridge>, chat_jid: &str, retry_count: u32) {
    if retry_count != 0 {
        return;
    }
    let _ = telegram
        .send_text_to_jid(chat_jid, "Something went wrong processing that — retrying shortly.")
        .await;
}

/// Resolve runtime kind from group configuration.
pub(crate) fn resolve_runtime(group: &RegisteredGroup) -> RuntimeKind {
    match group.runtime.as_deref() {
        Some("gemini") => RuntimeKind::Gemini,
        Some("codex") => RuntimeKind::Codex,
        _ => RuntimeKind::Claude, // default
    }
}

/// Strip `<internal>...</internal>` blocks from agent output.
fn strip_internal_blocks(text: &str) -> String {
    // Simple regex-free approach: find and remove <internal>...</internal> spans
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("<internal>") {
        result.push_str(&rest[..start]);
        if let Some(end) = rest[start..].find("</internal>") {
            rest = &rest[start + end + "</internal>".len()..];
        } else {
            // Unclosed tag — strip to end
            rest = "";
            break;
        }
    }
    result.push_str(rest);
    result.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_internal_basic() {
        let input = "Hello <internal>reasoning here</internal> World";
        assert_eq!(strip_internal_blocks(input), "Hello  World");
    }

    #[test]
    fn strip_internal_multiple() {
        let input = "A <internal>x</internal> B <internal>y</internal> C";
        assert_eq!(strip_internal_blocks(input), "A  B  C");
    }

    #[test]
    fn strip_internal_none() {
        assert_eq!(strip_internal_blocks("Hello World"), "Hello World");
    }

    #[test]
    fn strip_internal_unclosed() {
        let input = "Hello <internal>never closed";
        assert_eq!(strip_internal_blocks(input), "Hello");
    }

    #[test]
    fn strip_internal_multiline() {
        let input = "Before\n<internal>\nmulti\nline\n</internal>\nAfter";
        assert_eq!(strip_internal_blocks(input), "Before\n\nAfter");
    }

    #[test]
    fn resolve_runtime_defaults_to_claude() {
        let group = RegisteredGroup {
            jid: "tg:123".into(),
            name: "Test".into(),
            folder: "test".into(),
            trigger: String::new(),
            added_at: String::new(),
            container_config: None,
            requires_trigger: None,
            runtime: None,
            model: None,
        };
        assert_eq!(resolve_runtime(&group), RuntimeKind::Claude);
    }

    #[test]
    fn resolve_runtime_gemini() {
        let group = RegisteredGroup {
            jid: "tg:123".into(),
            name: "Test".into(),
            folder: "test".into(),
            trigger: String::new(),
            added_at: String::new(),
            container_config: None,
            requires_trigger: None,
            runtime: Some("gemini".into()),
            model: None,
        };
        assert_eq!(resolve_runtime(&group), RuntimeKind::Gemini);
    }
}
