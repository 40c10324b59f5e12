use thiserror::Error;

/// Typed outcomes for the operations callers must branch on: queue admission,
/// container spawn gating, budget checks, and scheduler claims. Everything
/// else (config loading, process wiring, one-off I/O) keeps using
/// `anyhow::Result` with `.context(...)`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("queue is full ({waiting} waiting, max {max})")]
    QueueFull { waiting: usize, max: usize },

    #[error("container spawn refused: {reason}")]
    SpawnRefused { reason: String },

    #[error("lost the claim race")]
    ClaimLost,

    #[error("budget exhausted for group {group_id}")]
    BudgetOffline { group_id: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Db(#[from] tokio_postgres::Error),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_message() {
        let err = OrchestratorError::QueueFull { waiting: 50, max: 50 };
        assert_eq!(err.to_string(), "queue is full (50 waiting, max 50)");
    }

    #[test]
    fn spawn_refused_carries_reason() {
        let err = OrchestratorError::SpawnRefused {
            reason: "docker daemon unhealthy".to_string(),
        };
        assert!(err.to_string().contains("docker daemon unhealthy"));
    }
}
