use crate::{ConductorError, ConductorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use uuid::Uuid;

/// Identifier of a [`TaskDefinition`].
pub type TaskId = Uuid;

/// Arbitrary key-value payload carried into and out of a task.
pub type Payload = HashMap<String, serde_json::Value>;

/// Scheduling priority. Higher values are handed out first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
    Emergency = 5,
}

impl Priority {
    /// Numeric level, 1 (low) through 5 (emergency).
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
            Priority::Emergency => write!(f, "emergency"),
        }
    }
}

/// Lifecycle status of a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    /// No transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::TimedOut
        )
    }

    /// Whether `self -> next` is an edge of the task state machine.
    ///
    /// `Running -> Pending` is the retry path taken after a failed or
    /// timed-out attempt that still has budget left.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, TimedOut)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, TimedOut)
                | (Running, Pending)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(300)
}

/// Immutable description of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    #[serde(default = "Uuid::new_v4")]
    pub id: TaskId,
    pub name: String,
    /// Opaque routing tag, also matched against worker capabilities.
    pub task_type: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(
        rename = "timeout_ms",
        with = "crate::duration_ms",
        default = "default_timeout"
    )]
    pub timeout: Duration,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub input: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            task_type: task_type.into(),
            required_capabilities: Vec::new(),
            priority: Priority::Normal,
            timeout: default_timeout(),
            max_retries: 0,
            input: HashMap::new(),
            deadline: None,
            dependencies: BTreeSet::new(),
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.input.insert(key.into(), value);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_dependencies<I: IntoIterator<Item = TaskId>>(mut self, deps: I) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }

    /// Check the definition's invariants.
    pub fn validate(&self) -> ConductorResult<()> {
        let reason = if self.name.trim().is_empty() {
            Some("name must not be empty")
        } else if self.task_type.trim().is_empty() {
            Some("task type must not be empty")
        } else if self.timeout.is_zero() {
            Some("timeout must be greater than zero")
        } else if !crate::duration_ms::is_whole_millis(&self.timeout) {
            Some("timeout must be a whole number of milliseconds")
        } else if self.dependencies.contains(&self.id) {
            Some("task cannot depend on itself")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ConductorError::InvalidTask {
                task_id: self.id,
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// True once `now` is past the optional deadline.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| now > d)
    }
}

/// A progress report recorded while a task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressCheckpoint {
    pub percent: u8,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// One resource-usage sample reported by the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_bytes: Option<u64>,
    pub at: DateTime<Utc>,
}

/// A failed attempt kept in the execution's retry history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub attempt: u32,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// Mutable record of the attempts made to run one [`TaskDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub worker_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub progress: u8,
    pub progress_message: Option<String>,
    #[serde(default)]
    pub checkpoints: Vec<ProgressCheckpoint>,
    #[serde(default)]
    pub output: Payload,
    pub error: Option<String>,
    pub error_details: Option<serde_json::Value>,
    /// 1-based number of the current (or last) attempt.
    pub attempt: u32,
    #[serde(default)]
    pub retry_history: Vec<FailedAttempt>,
    #[serde(default)]
    pub resource_samples: Vec<ResourceSample>,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Earliest time a retried attempt may be handed out again.
    pub not_before: Option<DateTime<Utc>>,
}

impl TaskExecution {
    pub fn new(task_id: TaskId, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            worker_id: None,
            submitted_at: now,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            progress: 0,
            progress_message: None,
            checkpoints: Vec::new(),
            output: HashMap::new(),
            error: None,
            error_details: None,
            attempt: 1,
            retry_history: Vec::new(),
            resource_samples: Vec::new(),
            cancel_requested: false,
            not_before: None,
        }
    }

    /// Move to `next`, rejecting edges the state machine does not allow.
    pub fn transition(&mut self, next: TaskStatus, action: &str) -> ConductorResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ConductorError::InvalidTransition {
                id: self.task_id.to_string(),
                status: self.status.to_string(),
                action: action.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Record that `worker_id` started the current attempt.
    pub fn begin(&mut self, worker_id: &str, now: DateTime<Utc>) -> ConductorResult<()> {
        self.transition(TaskStatus::Running, "start")?;
        self.worker_id = Some(worker_id.to_string());
        self.started_at = Some(now);
        self.finished_at = None;
        self.duration_ms = None;
        self.not_before = None;
        Ok(())
    }

    /// Stamp the end time and derive the duration from the start time.
    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.finished_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|start| (now - start).num_milliseconds().max(0) as u64);
    }

    /// Clamp and store a progress report.
    pub fn record_progress(&mut self, percent: u8, message: impl Into<String>, now: DateTime<Utc>) {
        let percent = percent.min(100);
        let message = message.into();
        self.progress = percent;
        self.progress_message = Some(message.clone());
        self.checkpoints.push(ProgressCheckpoint {
            percent,
            message,
            at: now,
        });
    }

    /// Push the current attempt into the retry history.
    pub fn record_failure(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        let reason = reason.into();
        self.retry_history.push(FailedAttempt {
            attempt: self.attempt,
            reason: reason.clone(),
            worker_id: self.worker_id.clone(),
            at: now,
        });
        self.error = Some(reason);
    }

    /// Number of attempts that ended in failure or timeout.
    pub fn failed_attempts(&self) -> usize {
        self.retry_history.len()
    }
}
