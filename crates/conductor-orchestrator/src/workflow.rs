use crate::condition::Condition;
use chrono::{DateTime, Utc};
use conductor_core::{Payload, TaskDefinition, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Identifier of a step, unique within its workflow.
pub type StepId = String;

/// Identifier of one run of a workflow.
pub type RunId = Uuid;

/// What the engine does when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    /// Abort the run; remaining steps are skipped.
    #[default]
    Stop,
    /// Skip the failed step's dependents, keep running independent branches.
    Continue,
    /// Re-run the step within its retry budget, then behave like `Stop`.
    Retry,
}

impl fmt::Display for FailureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureStrategy::Stop => write!(f, "stop"),
            FailureStrategy::Continue => write!(f, "continue"),
            FailureStrategy::Retry => write!(f, "retry"),
        }
    }
}

fn default_max_parallel_steps() -> usize {
    4
}

fn default_true() -> bool {
    true
}

/// Run-wide settings of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Upper bound on the whole run.
    #[serde(
        rename = "timeout_ms",
        with = "conductor_core::duration_ms::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            max_parallel_steps: default_max_parallel_steps(),
            failure_strategy: FailureStrategy::default(),
        }
    }
}

/// The three shapes a step can take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Run one task. The definition is a template: each attempt is
    /// submitted under a fresh task id.
    Task { task: TaskDefinition },
    /// Pick a branch. Steps in the unchosen list are skipped.
    Decision {
        condition: Condition,
        #[serde(default)]
        if_true: Vec<StepId>,
        #[serde(default)]
        if_false: Vec<StepId>,
    },
    /// Schedule `members` together.
    ParallelGroup {
        members: Vec<StepId>,
        #[serde(default = "default_true")]
        wait_for_all: bool,
    },
}

/// One node of the step graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// Guard: when it evaluates to false the step is skipped.
    #[serde(rename = "when", default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Condition>,
    /// Overrides the engine's default retry budget under the retry strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl WorkflowStep {
    pub fn task(id: impl Into<StepId>, task: TaskDefinition) -> Self {
        let id = id.into();
        Self {
            name: task.name.clone(),
            id,
            depends_on: Vec::new(),
            guard: None,
            max_retries: None,
            kind: StepKind::Task { task },
        }
    }

    pub fn decision<T, F>(id: impl Into<StepId>, condition: Condition, if_true: T, if_false: F) -> Self
    where
        T: IntoIterator,
        T::Item: Into<StepId>,
        F: IntoIterator,
        F::Item: Into<StepId>,
    {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            depends_on: Vec::new(),
            guard: None,
            max_retries: None,
            kind: StepKind::Decision {
                condition,
                if_true: if_true.into_iter().map(Into::into).collect(),
                if_false: if_false.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn parallel<M>(id: impl Into<StepId>, members: M, wait_for_all: bool) -> Self
    where
        M: IntoIterator,
        M::Item: Into<StepId>,
    {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            depends_on: Vec::new(),
            guard: None,
            max_retries: None,
            kind: StepKind::ParallelGroup {
                members: members.into_iter().map(Into::into).collect(),
                wait_for_all,
            },
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn depends_on<I>(mut self, deps: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<StepId>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.guard = Some(condition);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Step ids this step refers to through its kind (branches, members).
    pub fn referenced_steps(&self) -> Vec<&StepId> {
        match &self.kind {
            StepKind::Task { .. } => Vec::new(),
            StepKind::Decision {
                if_true, if_false, ..
            } => if_true.iter().chain(if_false).collect(),
            StepKind::ParallelGroup { members, .. } => members.iter().collect(),
        }
    }
}

/// A named step graph with its run settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub config: WorkflowConfig,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            steps: Vec::new(),
            config: WorkflowConfig::default(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Parse a workflow from TOML.
    pub fn from_toml(src: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(src)
    }

    /// Effective dependency edges of every step, in declaration order.
    ///
    /// Besides `depends_on`, branch targets of a decision depend on the
    /// decision, and members of a parallel group inherit the group's
    /// dependencies.
    pub fn effective_dependencies(&self) -> Vec<(StepId, Vec<StepId>)> {
        let mut edges: Vec<(StepId, Vec<StepId>)> = self
            .steps
            .iter()
            .map(|s| (s.id.clone(), s.depends_on.clone()))
            .collect();
        let index: BTreeMap<StepId, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        for step in &self.steps {
            let inherited: Vec<StepId> = match &step.kind {
                StepKind::Task { .. } => continue,
                StepKind::Decision { .. } => vec![step.id.clone()],
                StepKind::ParallelGroup { .. } => step.depends_on.clone(),
            };
            for target in step.referenced_steps() {
                let Some(&i) = index.get(target) else {
                    continue;
                };
                for dep in &inherited {
                    if dep != target && !edges[i].1.contains(dep) {
                        edges[i].1.push(dep.clone());
                    }
                }
            }
        }
        edges
    }

    /// Ids of steps that are members of some parallel group.
    pub fn group_members(&self) -> HashSet<&StepId> {
        self.steps
            .iter()
            .filter(|s| matches!(s.kind, StepKind::ParallelGroup { .. }))
            .flat_map(WorkflowStep::referenced_steps)
            .collect()
    }
}

/// Overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Created => write!(f, "created"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

/// State of one step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

/// Result recorded for a finished step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default)]
    pub output: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Task ids submitted for this step, one per attempt.
    #[serde(default)]
    pub task_ids: Vec<TaskId>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Branch taken, for decision steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<bool>,
}

impl StepResult {
    pub fn new(status: StepStatus) -> Self {
        Self {
            status,
            output: Payload::new(),
            error: None,
            task_ids: Vec::new(),
            attempts: 0,
            started_at: None,
            finished_at: None,
            branch: None,
        }
    }
}

/// One entry of a run's error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Mutable record of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub run_id: RunId,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub step_status: BTreeMap<StepId, StepStatus>,
    pub step_results: BTreeMap<StepId, StepResult>,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    /// Percentage of steps in a terminal state.
    pub progress: u8,
    pub errors: Vec<RunError>,
    /// Workflow inputs plus each finished step's output under its id.
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(run_id: RunId, definition: &WorkflowDefinition, inputs: Payload) -> Self {
        let step_status = definition
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepStatus::Pending))
            .collect();
        let context = serde_json::Value::Object(inputs.into_iter().collect());
        Self {
            run_id,
            workflow_id: definition.id,
            workflow_name: definition.name.clone(),
            status: WorkflowStatus::Created,
            step_status,
            step_results: BTreeMap::new(),
            completed_steps: 0,
            failed_steps: 0,
            skipped_steps: 0,
            progress: 0,
            errors: Vec::new(),
            context,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Record a step's terminal result and refresh the counters.
    pub fn record(&mut self, step_id: &str, result: StepResult) {
        if result.status == StepStatus::Completed && !result.output.is_empty() {
            if let serde_json::Value::Object(map) = &mut self.context {
                let output = result
                    .output
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                map.insert(step_id.to_string(), serde_json::Value::Object(output));
            }
        }
        if let Some(error) = &result.error {
            if result.status == StepStatus::Failed {
                self.log_error(Some(step_id), error.clone());
            }
        }
        self.step_status.insert(step_id.to_string(), result.status);
        self.step_results.insert(step_id.to_string(), result);
        self.refresh_counters();
    }

    pub fn set_status(&mut self, step_id: &str, status: StepStatus) {
        self.step_status.insert(step_id.to_string(), status);
        self.refresh_counters();
    }

    pub fn log_error(&mut self, step_id: Option<&str>, message: impl Into<String>) {
        self.errors.push(RunError {
            step_id: step_id.map(str::to_string),
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.step_status.get(step_id).copied()
    }

    pub fn summary(&self) -> WorkflowSummary {
        let outcome = match self.status {
            WorkflowStatus::Completed if self.failed_steps == 0 => RunOutcome::Success,
            WorkflowStatus::Completed => RunOutcome::PartialSuccess,
            _ => RunOutcome::Failure,
        };
        WorkflowSummary {
            run_id: self.run_id,
            workflow_id: self.workflow_id,
            workflow_name: self.workflow_name.clone(),
            status: self.status,
            outcome,
            total_steps: self.step_status.len(),
            completed_steps: self.completed_steps,
            failed_steps: self.failed_steps,
            skipped_steps: self.skipped_steps,
            duration_ms: self
                .started_at
                .zip(self.finished_at)
                .map(|(s, f)| (f - s).num_milliseconds().max(0) as u64),
            errors: self.errors.iter().map(|e| e.message.clone()).collect(),
        }
    }

    fn refresh_counters(&mut self) {
        let count = |wanted: StepStatus| self.step_status.values().filter(|s| **s == wanted).count();
        self.completed_steps = count(StepStatus::Completed);
        self.failed_steps = count(StepStatus::Failed);
        self.skipped_steps = count(StepStatus::Skipped);
        let total = self.step_status.len();
        let terminal = self.step_status.values().filter(|s| s.is_terminal()).count();
        self.progress = if total == 0 {
            100
        } else {
            ((terminal * 100) / total) as u8
        };
    }
}

/// How a finished run turned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    /// Completed under the continue strategy with at least one failed step.
    PartialSuccess,
    Failure,
}

/// Compact result handed back to callers of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub run_id: RunId,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub outcome: RunOutcome,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub duration_ms: Option<u64>,
    pub errors: Vec<String>,
}
