//! Core types for sandbox execution

use serde::{Deserialize, Serialize};

/// The single terminal result of one execution attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The code ran to completion; `output` is the final console content
    Completed { output: String },

    /// The code faulted during evaluation; the context remains usable
    RuntimeError { message: String, output: String },

    /// The run exceeded the configured timeout; the context was discarded
    TimedOut { output: String },

    /// The controller was torn down while the run was pending
    Cancelled,

    /// The context died mid-run; it was discarded like a timeout
    ContextLost { message: String },
}

impl ExecutionOutcome {
    /// Check if execution completed normally
    pub fn success(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed { .. })
    }

    /// Console content captured for the run, if any
    pub fn output(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::Completed { output }
            | ExecutionOutcome::RuntimeError { output, .. }
            | ExecutionOutcome::TimedOut { output } => Some(output),
            ExecutionOutcome::Cancelled | ExecutionOutcome::ContextLost { .. } => None,
        }
    }

    /// Whether the context that produced this outcome must be replaced
    pub fn discards_context(&self) -> bool {
        matches!(
            self,
            ExecutionOutcome::TimedOut { .. }
                | ExecutionOutcome::Cancelled
                | ExecutionOutcome::ContextLost { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed { .. } => "completed",
            ExecutionOutcome::RuntimeError { .. } => "runtime_error",
            ExecutionOutcome::TimedOut { .. } => "timed_out",
            ExecutionOutcome::Cancelled => "cancelled",
            ExecutionOutcome::ContextLost { .. } => "context_lost",
        }
    }
}

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxLifecycleState {
    Unloaded,
    Loading,
    Ready,
    Executing,
    Terminated,
}

impl SandboxLifecycleState {
    /// States in which a new execution may be admitted
    pub fn accepts_execution(self) -> bool {
        matches!(
            self,
            SandboxLifecycleState::Unloaded | SandboxLifecycleState::Ready
        )
    }
}

impl std::fmt::Display for SandboxLifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SandboxLifecycleState::Unloaded => "unloaded",
            SandboxLifecycleState::Loading => "loading",
            SandboxLifecycleState::Ready => "ready",
            SandboxLifecycleState::Executing => "executing",
            SandboxLifecycleState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}
