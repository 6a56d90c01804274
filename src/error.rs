//! Error taxonomy for task-terminal outcomes (spec §7).
//!
//! `Task.error` is always one of these codes once a task reaches `failed`.
//! The string form (`as_code`) is what gets persisted in the `error` column
//! and surfaced to adapters, so it must stay stable.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("enqueue refused — per-project queue cap reached")]
    QueueFull,
    #[error("task references a project alias that is not configured")]
    UnknownProject,
    #[error("no stdout from the agent for the configured silence window")]
    SilenceTimeout,
    #[error("hard timeout elapsed before the agent exited")]
    Timeout,
    #[error("token usage estimate crossed the effective budget")]
    BudgetExceeded,
    #[error("operator denied the pending approval")]
    ApprovalDenied,
    #[error("pending approval expired before an operator resolved it")]
    ApprovalTimeout,
    #[error("task was cancelled by an explicit request")]
    CancelledByUser,
    #[error("agent exited non-zero with no usable captured text")]
    CliError,
    #[error("task was still running when the engine started — orphan recovery")]
    WorkerCrashedRecovery,
}

impl EngineError {
    /// The exact string persisted in `Task.error` / surfaced to adapters.
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::UnknownProject => "unknown_project",
            Self::SilenceTimeout => "silence_timeout",
            Self::Timeout => "timeout",
            Self::BudgetExceeded => "budget_exceeded",
            Self::ApprovalDenied => "approval_denied",
            Self::ApprovalTimeout => "approval_timeout",
            Self::CancelledByUser => "cancelled_by_user",
            Self::CliError => "cli_error",
            Self::WorkerCrashedRecovery => "worker_crashed_recovery",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "queue_full" => Self::QueueFull,
            "unknown_project" => Self::UnknownProject,
            "silence_timeout" => Self::SilenceTimeout,
            "timeout" => Self::Timeout,
            "budget_exceeded" => Self::BudgetExceeded,
            "approval_denied" => Self::ApprovalDenied,
            "approval_timeout" => Self::ApprovalTimeout,
            "cancelled_by_user" => Self::CancelledByUser,
            "cli_error" => Self::CliError,
            "worker_crashed_recovery" => Self::WorkerCrashedRecovery,
            _ => return None,
        })
    }
}
