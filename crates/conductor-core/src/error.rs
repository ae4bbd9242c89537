use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Broad classification of a [`ConductorError`], used to decide how the
/// caller should react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Reported immediately and never retried.
    Configuration,
    /// Retryable by the caller with backoff.
    Availability,
    /// Absorbed into the task's own retry budget.
    Execution,
    /// Fatal to a workflow run, not to the process.
    Structural,
    /// Serialization or I/O failures from the surrounding plumbing.
    Internal,
}

/// Top-level error type for the Conductor orchestration engine.
#[derive(Debug, Error)]
pub enum ConductorError {
    /// A task with this identifier was already submitted.
    #[error("Duplicate task: {task_id}")]
    DuplicateTask { task_id: Uuid },

    /// Adding the task would close a dependency cycle.
    #[error("Cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<String> },

    /// A dependency names an identifier that was never registered.
    #[error("Task {task_id} depends on unknown task {dependency}")]
    UnknownDependency { task_id: Uuid, dependency: Uuid },

    /// A task definition violates one of its invariants.
    #[error("Invalid task {task_id}: {reason}")]
    InvalidTask { task_id: Uuid, reason: String },

    /// A workflow definition failed validation.
    #[error("Invalid workflow '{workflow}': {}", .issues.join("; "))]
    InvalidWorkflow {
        workflow: String,
        issues: Vec<String>,
    },

    /// The requested state transition is not allowed from the current state.
    #[error("Invalid transition for {id}: cannot {action} while {status}")]
    InvalidTransition {
        id: String,
        status: String,
        action: String,
    },

    /// No task, worker or run with this identifier is known.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// No registered worker has the capabilities the task requires.
    #[error("No capable worker for task {task_id} (requires {required:?})")]
    NoCapableWorker {
        task_id: Uuid,
        required: Vec<String>,
    },

    /// Capable workers exist but all of them are saturated.
    #[error("No capacity for task {task_id}: {capable} capable worker(s) saturated")]
    NoCapacity { task_id: Uuid, capable: usize },

    /// The worker refused the dispatched assignment.
    #[error("Worker {worker_id} rejected task {task_id}: {reason}")]
    DispatchRejected {
        task_id: Uuid,
        worker_id: String,
        reason: String,
    },

    /// A worker reported a failure for the task.
    #[error("Task failed: {task_id} - {message}")]
    TaskFailed { task_id: Uuid, message: String },

    /// The task exceeded its configured timeout.
    #[error("Task timeout: {task_id} - exceeded {timeout:?}")]
    TaskTimedOut { task_id: Uuid, timeout: Duration },

    /// Steps remain but none can become eligible.
    #[error("Workflow run {run_id} stalled with pending steps {pending:?}")]
    CircularOrStalledWorkflow { run_id: Uuid, pending: Vec<String> },

    /// The workflow exceeded its global timeout.
    #[error("Workflow run {run_id} timed out after {timeout:?}")]
    WorkflowTimedOut { run_id: Uuid, timeout: Duration },

    /// A lifecycle handler failed.
    #[error("Handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_cycle(cycle: &[String]) -> String {
    cycle.join(" -> ")
}

impl ConductorError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConductorError::DuplicateTask { .. }
            | ConductorError::CyclicDependency { .. }
            | ConductorError::UnknownDependency { .. }
            | ConductorError::InvalidTask { .. }
            | ConductorError::InvalidWorkflow { .. }
            | ConductorError::InvalidTransition { .. }
            | ConductorError::NotFound { .. }
            | ConductorError::Handler { .. }
            | ConductorError::Config(_) => ErrorKind::Configuration,
            ConductorError::NoCapableWorker { .. }
            | ConductorError::NoCapacity { .. }
            | ConductorError::DispatchRejected { .. } => ErrorKind::Availability,
            ConductorError::TaskFailed { .. } | ConductorError::TaskTimedOut { .. } => {
                ErrorKind::Execution
            }
            ConductorError::CircularOrStalledWorkflow { .. }
            | ConductorError::WorkflowTimedOut { .. } => ErrorKind::Structural,
            ConductorError::Json(_) | ConductorError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether a caller may retry the same request later.
    ///
    /// `NoCapableWorker` is an availability error but is not worth retrying
    /// until the worker pool changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConductorError::NoCapacity { .. } | ConductorError::DispatchRejected { .. }
        )
    }

    /// Shorthand for [`ConductorError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        ConductorError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;
