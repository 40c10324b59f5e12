//! IPC types shared between container agents and the intercomd host.
//!
//! Containers write JSON files into `/workspace/ipc/{channel}/` directories.
//! The host daemon polls these directories and processes files. Each file is
//! authenticated with an HMAC signature carried in a sibling `.sig` file
//! before being acted on — see `intercomd::ipc` for the verification path.
//!
//! Two IPC channels:
//! - **messages**: outbound messages from containers (container → host → channel)
//! - **tasks**: task management and heartbeat-job commands

use serde::{Deserialize, Serialize};

/// Outbound message from a container agent to a messaging channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcMessage {
    /// Must be "message".
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Target chat JID (e.g., "tg:1108701034").
    #[serde(rename = "chatJid")]
    pub chat_jid: String,
    /// Message text content.
    pub text: String,
    /// Optional sender identity override.
    pub sender: Option<String>,
    /// Source group folder (set by container).
    #[serde(rename = "groupFolder")]
    pub group_folder: Option<String>,
    pub timestamp: Option<String>,
}

/// Task management command from a container agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcTask {
    ScheduleTask {
        prompt: String,
        schedule_type: String,
        schedule_value: String,
        #[serde(default = "default_context_mode")]
        context_mode: String,
        #[serde(rename = "targetJid")]
        target_jid: Option<String>,
        #[serde(rename = "createdBy")]
        created_by: Option<String>,
        timestamp: Option<String>,
    },
    PauseTask {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "groupFolder")]
        group_folder: Option<String>,
        timestamp: Option<String>,
    },
    ResumeTask {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "groupFolder")]
        group_folder: Option<String>,
        timestamp: Option<String>,
    },
    CancelTask {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "groupFolder")]
        group_folder: Option<String>,
        timestamp: Option<String>,
    },
    RunTaskNow {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "groupFolder")]
        group_folder: Option<String>,
        timestamp: Option<String>,
    },
    UpdateTask {
        #[serde(rename = "taskId")]
        task_id: String,
        prompt: Option<String>,
        schedule_type: Option<String>,
        schedule_value: Option<String>,
        #[serde(rename = "groupFolder")]
        group_folder: Option<String>,
        timestamp: Option<String>,
    },
    RefreshGroups {
        timestamp: Option<String>,
    },
    RegisterGroup {
        jid: String,
        name: String,
        folder: String,
        trigger: String,
        timestamp: Option<String>,
    },
    HeartbeatConfig {
        silent: Option<bool>,
        #[serde(rename = "reportIntervalMs")]
        report_interval_ms: Option<u64>,
        #[serde(rename = "silenceThresholdMs")]
        silence_threshold_ms: Option<u64>,
        timestamp: Option<String>,
    },
    HeartbeatAddJob {
        #[serde(rename = "chatJid")]
        chat_jid: String,
        label: String,
        prompt: String,
        category: Option<String>,
        #[serde(rename = "intervalMs")]
        interval_ms: Option<i64>,
        #[serde(rename = "createdBy")]
        created_by: Option<String>,
        timestamp: Option<String>,
    },
    HeartbeatUpdateJob {
        id: String,
        label: Option<String>,
        prompt: Option<String>,
        status: Option<String>,
        #[serde(rename = "intervalMs")]
        interval_ms: Option<i64>,
        timestamp: Option<String>,
    },
    HeartbeatRemoveJob {
        id: String,
        timestamp: Option<String>,
    },
}

fn default_context_mode() -> String {
    "isolated".to_string()
}

/// Context for authorization decisions — derived from the IPC directory path.
#[derive(Debug, Clone)]
pub struct IpcGroupContext {
    /// Group folder name (e.g., "main", "team-eng").
    pub group_folder: String,
    /// Whether this is the main group (has elevated privileges).
    pub is_main: bool,
}

impl IpcGroupContext {
    pub fn new(group_folder: impl Into<String>, main_group_name: &str) -> Self {
        let group_folder = group_folder.into();
        let is_main = group_folder == main_group_name;
        Self {
            group_folder,
            is_main,
        }
    }
}
