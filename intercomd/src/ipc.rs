//! Filesystem-based IPC watcher for intercomd.
//!
//! Polls `{ipc_base}/{group}/` directories for outbound messages and task
//! commands written by container agents. Every file is a trust-boundary
//! crossing: it is authenticated by an HMAC-SHA256 signature carried in a
//! sibling `<file>.sig` file before being acted on. Identity comes from the
//! source directory (the group folder), never from anything inside the
//! payload — a non-main group cannot claim to be another group by putting a
//! different folder name in its JSON.
//!
//! Processed files are removed; signature failures are deleted outright
//! (per the trust-boundary rule); parse failures are moved to `errors/` for
//! debugging.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use intercom_core::{IpcGroupContext, IpcMessage, IpcTask};
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

type HmacSha256 = Hmac<Sha256>;

const MAIN_GROUP_FOLDER: &str = "main";

/// Configuration for the IPC watcher.
#[derive(Debug, Clone)]
pub struct IpcWatcherConfig {
    /// Base directory for IPC files (e.g., `data/ipc`).
    pub ipc_base_dir: PathBuf,
    /// Poll interval.
    pub poll_interval: Duration,
    /// Shared secret for HMAC verification. `None` disables authentication —
    /// used for standalone/dev runs with no container fleet.
    pub shared_secret: Option<String>,
}

impl Default for IpcWatcherConfig {
    fn default() -> Self {
        Self {
            ipc_base_dir: PathBuf::from("data/ipc"),
            poll_interval: Duration::from_secs(1),
            shared_secret: None,
        }
    }
}

/// Callback trait for actions the IPC watcher can't perform itself — sending
/// to a messaging channel, and executing task/heartbeat commands against the
/// scheduler and persistence layers.
pub trait IpcDelegate: Send + Sync {
    /// Send a message to a chat JID via the messaging channel.
    fn send_message(&self, chat_jid: &str, text: &str, sender: Option<&str>);

    /// Handle a task/heartbeat command for the given group context.
    fn handle_task(&self, task: IpcTask, ctx: &IpcGroupContext);
}

/// No-op delegate that logs actions without forwarding anywhere.
/// Used when intercomd runs standalone (no messaging channel wired).
pub struct LogOnlyDelegate;

impl IpcDelegate for LogOnlyDelegate {
    fn send_message(&self, chat_jid: &str, text: &str, _sender: Option<&str>) {
        info!(
            chat_jid,
            text_len = text.len(),
            "IPC message received (no delegate — logged only)"
        );
    }

    fn handle_task(&self, task: IpcTask, ctx: &IpcGroupContext) {
        info!(
            ?task,
            group_folder = ctx.group_folder.as_str(),
            is_main = ctx.is_main,
            "IPC task received (no delegate — logged only)"
        );
    }
}

/// Tracks which chat JIDs belong to which group folders, for authorization
/// of non-main message sends and for scoping task commands to their own
/// group. Rebuilt from the live registered-groups map each poll cycle.
#[derive(Debug, Default, Clone)]
pub struct GroupRegistry {
    jid_to_folder: std::collections::HashMap<String, String>,
    folder_to_jid: std::collections::HashMap<String, String>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, chat_jid: String, group_folder: String) {
        self.folder_to_jid.insert(group_folder.clone(), chat_jid.clone());
        self.jid_to_folder.insert(chat_jid, group_folder);
    }

    pub fn folder_for_jid(&self, chat_jid: &str) -> Option<&str> {
        self.jid_to_folder.get(chat_jid).map(|s| s.as_str())
    }

    pub fn jid_for_folder(&self, folder: &str) -> Option<&str> {
        self.folder_to_jid.get(folder).map(|s| s.as_str())
    }

    pub fn registered_jids(&self) -> std::collections::HashSet<String> {
        self.jid_to_folder.keys().cloned().collect()
    }
}

/// The IPC watcher. Owns polling state and dispatches authenticated commands
/// to the delegate.
pub struct IpcWatcher {
    config: IpcWatcherConfig,
    delegate: Arc<dyn IpcDelegate>,
    registry: Arc<RwLock<GroupRegistry>>,
}

impl IpcWatcher {
    pub fn new(
        config: IpcWatcherConfig,
        delegate: Arc<dyn IpcDelegate>,
        registry: Arc<RwLock<GroupRegistry>>,
    ) -> Self {
        Self {
            config,
            delegate,
            registry,
        }
    }

    /// Run the IPC polling loop. Call from a tokio::spawn.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        fs::create_dir_all(&self.config.ipc_base_dir).ok();
        if self.config.shared_secret.is_none() {
            warn!("IPC_SECRET not configured — command authentication disabled");
        }
        info!(dir = %self.config.ipc_base_dir.display(), "IPC watcher started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("IPC watcher shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Process one polling cycle across all group directories.
    pub async fn poll_once(&self) {
        let group_folders = match fs::read_dir(&self.config.ipc_base_dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|entry| {
                    entry.file_type().is_ok_and(|ft| ft.is_dir())
                        && entry.file_name() != "errors"
                })
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
            Err(err) => {
                debug!(err = %err, "IPC base directory not readable");
                return;
            }
        };

        let registry = self.registry.read().await.clone();

        for group_folder in group_folders {
            let ctx = IpcGroupContext::new(&group_folder, MAIN_GROUP_FOLDER);
            let group_dir = self.config.ipc_base_dir.join(&group_folder);

            self.process_messages(&group_dir, &ctx, &registry);
            self.process_tasks(&group_dir, &ctx, &registry);
        }
    }

    /// Process outbound messages from `{group}/messages/`.
    fn process_messages(&self, group_dir: &Path, ctx: &IpcGroupContext, registry: &GroupRegistry) {
        let messages_dir = group_dir.join("messages");
        let files = match read_json_files(&messages_dir) {
            Some(files) => files,
            None => return,
        };

        for file_path in files {
            if !self.authenticate(&file_path, ctx) {
                continue;
            }

            match read_and_parse::<IpcMessage>(&file_path) {
                Ok(msg) => {
                    if msg.msg_type != "message" || msg.chat_jid.is_empty() || msg.text.is_empty() {
                        warn!(path = %file_path.display(), "Invalid IPC message — missing fields");
                        move_to_errors(&self.config.ipc_base_dir, &file_path, &ctx.group_folder);
                        continue;
                    }

                    // Authorization: main can send anywhere, others only to their own chat.
                    let authorized = ctx.is_main
                        || registry.jid_for_folder(&ctx.group_folder) == Some(msg.chat_jid.as_str());
                    if authorized {
                        self.delegate.send_message(&msg.chat_jid, &msg.text, msg.sender.as_deref());
                        debug!(
                            chat_jid = %msg.chat_jid,
                            group = %ctx.group_folder,
                            "IPC message dispatched"
                        );
                    } else {
                        warn!(
                            chat_jid = %msg.chat_jid,
                            group = %ctx.group_folder,
                            "Unauthorized IPC message attempt blocked"
                        );
                    }

                    remove_file(&file_path);
                }
                Err(err) => {
                    error!(path = %file_path.display(), err = %err, "Failed to parse IPC message");
                    move_to_errors(&self.config.ipc_base_dir, &file_path, &ctx.group_folder);
                }
            }
        }
    }

    /// Process task/heartbeat commands from `{group}/tasks/`.
    fn process_tasks(&self, group_dir: &Path, ctx: &IpcGroupContext, _registry: &GroupRegistry) {
        let tasks_dir = group_dir.join("tasks");
        let files = match read_json_files(&tasks_dir) {
            Some(files) => files,
            None => return,
        };

        for file_path in files {
            if !self.authenticate(&file_path, ctx) {
                continue;
            }

            match read_and_parse::<IpcTask>(&file_path) {
                Ok(task) => {
                    if is_main_only(&task) && !ctx.is_main {
                        warn!(
                            ?task,
                            group = %ctx.group_folder,
                            "main-only IPC task attempted by non-main group, blocked"
                        );
                    } else {
                        self.delegate.handle_task(task, ctx);
                    }
                    remove_file(&file_path);
                }
                Err(err) => {
                    error!(path = %file_path.display(), err = %err, "Failed to parse IPC task");
                    move_to_errors(&self.config.ipc_base_dir, &file_path, &ctx.group_folder);
                }
            }
        }
    }

    /// Verify the HMAC signature carried in `<file>.sig`. Deletes the command
    /// file and returns false on a missing/bad signature. When no shared
    /// secret is configured authentication is skipped entirely (standalone
    /// mode) and every file is treated as authorized.
    fn authenticate(&self, file_path: &Path, ctx: &IpcGroupContext) -> bool {
        let secret = match &self.config.shared_secret {
            Some(s) => s,
            None => return true,
        };

        let body = match fs::read(file_path) {
            Ok(b) => b,
            Err(err) => {
                error!(path = %file_path.display(), err = %err, "failed to read IPC command file");
                return false;
            }
        };

        let sig_path = sibling_sig_path(file_path);
        let signature_hex = match fs::read_to_string(&sig_path) {
            Ok(s) => s.trim().to_string(),
            Err(_) => {
                warn!(
                    path = %file_path.display(),
                    group = %ctx.group_folder,
                    "IPC command missing .sig file, rejecting"
                );
                remove_file(file_path);
                return false;
            }
        };

        let ok = verify_hmac(&body, &signature_hex, secret);
        if !ok {
            warn!(
                path = %file_path.display(),
                group = %ctx.group_folder,
                "IPC command signature verification failed, rejecting"
            );
            remove_file(file_path);
            let _ = fs::remove_file(&sig_path);
        }
        ok
    }
}

fn is_main_only(task: &IpcTask) -> bool {
    matches!(
        task,
        IpcTask::RefreshGroups { .. } | IpcTask::RegisterGroup { .. } | IpcTask::HeartbeatConfig { .. }
    )
}

fn verify_hmac(body: &[u8], signature_hex: &str, secret: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

fn sibling_sig_path(file_path: &Path) -> PathBuf {
    let mut os = file_path.as_os_str().to_os_string();
    os.push(".sig");
    PathBuf::from(os)
}

// ── Filesystem helpers ─────────────────────────────────────────────

/// Read sorted `.json` filenames from a directory. Returns None if dir doesn't exist.
fn read_json_files(dir: &Path) -> Option<Vec<PathBuf>> {
    if !dir.exists() {
        return None;
    }

    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut files: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            files.sort();
            Some(files)
        }
        Err(err) => {
            error!(dir = %dir.display(), err = %err, "Failed to read IPC directory");
            None
        }
    }
}

/// Read and parse a JSON file.
fn read_and_parse<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = fs::read_to_string(path)?;
    let parsed = serde_json::from_str(&content)?;
    Ok(parsed)
}

/// Move a failed file to the errors directory for debugging.
fn move_to_errors(ipc_base: &Path, file_path: &Path, group_folder: &str) {
    let error_dir = ipc_base.join("errors");
    fs::create_dir_all(&error_dir).ok();

    if let Some(filename) = file_path.file_name() {
        let dest = error_dir.join(format!("{group_folder}-{}", filename.to_string_lossy()));
        if let Err(err) = fs::rename(file_path, &dest) {
            error!(
                path = %file_path.display(),
                err = %err,
                "Failed to move error file"
            );
        }
    }
}

/// Remove a processed file, ignoring errors.
fn remove_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        debug!(path = %path.display(), err = %err, "Failed to remove processed IPC file");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex;

    use super::*;

    fn sign(body: &[u8], secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn ipc_group_context_detects_main() {
        let ctx = IpcGroupContext::new("main", "main");
        assert!(ctx.is_main);

        let ctx = IpcGroupContext::new("team-eng", "main");
        assert!(!ctx.is_main);
    }

    #[test]
    fn verify_hmac_roundtrip() {
        let body = b"{\"type\":\"message\"}";
        let sig = sign(body, "topsecret");
        assert!(verify_hmac(body, &sig, "topsecret"));
        assert!(!verify_hmac(body, &sig, "wrongsecret"));
        assert!(!verify_hmac(body, "not-hex", "topsecret"));
    }

    #[test]
    fn main_only_tasks_are_flagged() {
        assert!(is_main_only(&IpcTask::RefreshGroups { timestamp: None }));
        assert!(is_main_only(&IpcTask::RegisterGroup {
            jid: "x".into(),
            name: "x".into(),
            folder: "x".into(),
            trigger: String::new(),
            timestamp: None,
        }));
        assert!(!is_main_only(&IpcTask::CancelTask {
            task_id: "t1".into(),
            group_folder: None,
            timestamp: None,
        }));
    }

    #[test]
    fn read_json_files_returns_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();

        fs::write(dir.join("003-xyz.json"), "{}").unwrap();
        fs::write(dir.join("001-abc.json"), "{}").unwrap();
        fs::write(dir.join("002-def.json"), "{}").unwrap();
        fs::write(dir.join("readme.txt"), "not json").unwrap();

        let files = read_json_files(dir).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[0].ends_with("001-abc.json"));
        assert!(files[1].ends_with("002-def.json"));
        assert!(files[2].ends_with("003-xyz.json"));
    }

    #[test]
    fn read_json_files_nonexistent_dir_returns_none() {
        assert!(read_json_files(Path::new("/nonexistent/path")).is_none());
    }

    #[test]
    fn move_to_errors_preserves_file() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path();
        let file_path = ipc_base.join("test-task.json");
        fs::write(&file_path, "bad json").unwrap();

        move_to_errors(ipc_base, &file_path, "team-eng");

        assert!(!file_path.exists());
        assert!(ipc_base.join("errors/team-eng-test-task.json").exists());
    }

    #[test]
    fn group_registry_tracks_jids() {
        let mut registry = GroupRegistry::new();
        registry.register("tg:123".to_string(), "team-eng".to_string());
        registry.register("tg:456".to_string(), "main".to_string());

        assert_eq!(registry.folder_for_jid("tg:123"), Some("team-eng"));
        assert_eq!(registry.jid_for_folder("main"), Some("tg:456"));
        assert_eq!(registry.folder_for_jid("tg:999"), None);
        assert_eq!(registry.registered_jids().len(), 2);
    }

    #[test]
    fn parse_ipc_message_from_json() {
        let json = r#"{
            "type": "message",
            "chatJid": "tg:1108701034",
            "text": "Hello from agent",
            "sender": "Amtiskaw",
            "groupFolder": "main",
            "timestamp": "2026-02-25T12:00:00Z"
        }"#;
        let msg: IpcMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.chat_jid, "tg:1108701034");
        assert_eq!(msg.text, "Hello from agent");
        assert_eq!(msg.sender.as_deref(), Some("Amtiskaw"));
    }

    #[test]
    fn parse_ipc_task_heartbeat_add_job() {
        let json = r#"{
            "type": "heartbeat_add_job",
            "chatJid": "tg:123",
            "label": "daily digest",
            "prompt": "Summarize open issues",
            "intervalMs": 3600000
        }"#;
        let task: IpcTask = serde_json::from_str(json).unwrap();
        match task {
            IpcTask::HeartbeatAddJob { chat_jid, label, interval_ms, .. } => {
                assert_eq!(chat_jid, "tg:123");
                assert_eq!(label, "daily digest");
                assert_eq!(interval_ms, Some(3_600_000));
            }
            _ => panic!("expected HeartbeatAddJob"),
        }
    }

    #[derive(Default)]
    struct RecordingDelegate {
        messages: Mutex<Vec<(String, String)>>,
        tasks: Mutex<Vec<String>>,
    }

    impl IpcDelegate for RecordingDelegate {
        fn send_message(&self, chat_jid: &str, text: &str, _sender: Option<&str>) {
            self.messages.lock().unwrap().push((chat_jid.to_string(), text.to_string()));
        }

        fn handle_task(&self, task: IpcTask, _ctx: &IpcGroupContext) {
            self.tasks.lock().unwrap().push(format!("{task:?}"));
        }
    }

    fn write_signed(dir: &Path, name: &str, body: &serde_json::Value, secret: Option<&str>) {
        fs::create_dir_all(dir).unwrap();
        let bytes = serde_json::to_vec(body).unwrap();
        fs::write(dir.join(name), &bytes).unwrap();
        if let Some(secret) = secret {
            let sig = sign(&bytes, secret);
            fs::write(dir.join(format!("{name}.sig")), sig).unwrap();
        }
    }

    #[tokio::test]
    async fn poll_once_dispatches_message_for_main_group() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path().to_path_buf();

        let msg = serde_json::json!({
            "type": "message",
            "chatJid": "tg:99999",
            "text": "Hello from test",
            "timestamp": "2026-02-25T12:00:00Z"
        });
        write_signed(&ipc_base.join("main/messages"), "001-msg.json", &msg, Some("s3cret"));

        let delegate = Arc::new(RecordingDelegate::default());
        let registry = Arc::new(RwLock::new(GroupRegistry::new()));
        let watcher = IpcWatcher::new(
            IpcWatcherConfig {
                ipc_base_dir: ipc_base.clone(),
                shared_secret: Some("s3cret".to_string()),
                ..Default::default()
            },
            delegate.clone(),
            registry,
        );

        watcher.poll_once().await;

        assert!(!ipc_base.join("main/messages/001-msg.json").exists());
        let messages = delegate.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "tg:99999");
    }

    #[tokio::test]
    async fn poll_once_rejects_bad_signature() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path().to_path_buf();

        let msg = serde_json::json!({
            "type": "message",
            "chatJid": "tg:99999",
            "text": "Hello"
        });
        write_signed(&ipc_base.join("main/messages"), "001-msg.json", &msg, Some("wrong-secret"));

        let delegate = Arc::new(RecordingDelegate::default());
        let registry = Arc::new(RwLock::new(GroupRegistry::new()));
        let watcher = IpcWatcher::new(
            IpcWatcherConfig {
                ipc_base_dir: ipc_base.clone(),
                shared_secret: Some("s3cret".to_string()),
                ..Default::default()
            },
            delegate.clone(),
            registry,
        );

        watcher.poll_once().await;

        assert!(!ipc_base.join("main/messages/001-msg.json").exists());
        assert_eq!(delegate.messages.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn poll_once_blocks_unauthorized_message_from_non_main() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path().to_path_buf();

        let msg = serde_json::json!({
            "type": "message",
            "chatJid": "tg:99999",
            "text": "Should be blocked"
        });
        write_signed(&ipc_base.join("team-eng/messages"), "001-msg.json", &msg, Some("s3cret"));

        let delegate = Arc::new(RecordingDelegate::default());
        let mut reg = GroupRegistry::new();
        reg.register("tg:11111".to_string(), "team-eng".to_string());
        let registry = Arc::new(RwLock::new(reg));
        let watcher = IpcWatcher::new(
            IpcWatcherConfig {
                ipc_base_dir: ipc_base.clone(),
                shared_secret: Some("s3cret".to_string()),
                ..Default::default()
            },
            delegate.clone(),
            registry,
        );

        watcher.poll_once().await;

        assert!(!ipc_base.join("team-eng/messages/001-msg.json").exists());
        assert_eq!(delegate.messages.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn poll_once_blocks_main_only_task_from_non_main() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path().to_path_buf();

        let task = serde_json::json!({"type": "register_group", "jid": "tg:1", "name": "x", "folder": "x", "trigger": ""});
        write_signed(&ipc_base.join("team-eng/tasks"), "001-task.json", &task, Some("s3cret"));

        let delegate = Arc::new(RecordingDelegate::default());
        let registry = Arc::new(RwLock::new(GroupRegistry::new()));
        let watcher = IpcWatcher::new(
            IpcWatcherConfig {
                ipc_base_dir: ipc_base.clone(),
                shared_secret: Some("s3cret".to_string()),
                ..Default::default()
            },
            delegate.clone(),
            registry,
        );

        watcher.poll_once().await;

        assert!(!ipc_base.join("team-eng/tasks/001-task.json").exists());
        assert_eq!(delegate.tasks.lock().unwrap().len(), 0);
    }
}
