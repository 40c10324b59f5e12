pub mod budget;
pub mod classifier;
pub mod config;
pub mod container;
pub mod error;
pub mod ipc;
pub mod persistence;
pub mod runtime;
pub mod trace;
pub mod user_id;

pub use config::{
    ContainerPoolConfig, IntercomConfig, OrchestratorConfig, SchedulerConfig, load_config,
};
pub use container::{
    ContainerInput, ContainerOutput, ContainerStatus, StreamEvent, VolumeMount,
    OUTPUT_END_MARKER, OUTPUT_START_MARKER, container_image, extract_output_markers,
    runner_container_path, runner_dir_name,
};
pub use budget::{BudgetAction, BudgetThresholds, decide_action, default_price_table, estimate_cost};
pub use classifier::{Tier, classify};
pub use error::{OrchestratorError, OrchestratorResult};
pub use ipc::{IpcGroupContext, IpcMessage, IpcTask};
pub use persistence::{
    Attempt, ChatInfo, ConversationMessage, CostBudget, CostUsage, DeadLetter, HeartbeatJob,
    HeartbeatJobLog, MessageReceipt, NewMessage, PgPool, RegisteredGroup, ScheduledTask,
    TaskRunLog, TaskUpdate,
};
pub use runtime::RuntimeKind;
pub use trace::trace_id;
pub use user_id::stable_user_id;
