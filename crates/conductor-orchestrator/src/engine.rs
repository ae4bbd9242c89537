use crate::builder::WorkflowValidator;
use crate::condition::Condition;
use crate::config::EngineConfig;
use crate::monitor::{flatten, ratio, StatsMap};
use crate::resolver::DependencyResolver;
use crate::workflow::{
    FailureStrategy, RunId, StepId, StepKind, StepResult, StepStatus, WorkflowDefinition,
    WorkflowExecution, WorkflowStatus, WorkflowStep, WorkflowSummary,
};
use async_trait::async_trait;
use chrono::Utc;
use conductor_core::{ConductorError, ConductorResult, Payload, TaskDefinition};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One attempt of a task step, handed to a [`StepRunner`].
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub run_id: RunId,
    pub step_id: StepId,
    /// 1-based attempt number within the step.
    pub attempt: u32,
    /// The step's task template under a fresh id.
    pub task: TaskDefinition,
    /// Cancelled when the run aborts; runners should stop promptly.
    pub cancel: CancellationToken,
}

/// How a step attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(Payload),
    Failed(String),
    Cancelled,
}

/// Executes the task behind a task step.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run one attempt to a terminal state.
    async fn run_task(&self, invocation: StepInvocation) -> StepOutcome;
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub runs_started: u64,
    pub runs_active: usize,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub steps_completed: u64,
    pub steps_failed: u64,
    pub steps_skipped: u64,
    pub avg_run_ms: f64,
    pub success_rate: f64,
}

impl EngineStats {
    pub fn to_map(&self) -> StatsMap {
        flatten("engine", self)
    }
}

#[derive(Default)]
struct EngineCounters {
    runs_started: u64,
    runs_completed: u64,
    runs_failed: u64,
    steps_completed: u64,
    steps_failed: u64,
    steps_skipped: u64,
    total_run_ms: u64,
}

struct RunEntry {
    execution: WorkflowExecution,
    cancel: CancellationToken,
    done: watch::Sender<Option<WorkflowSummary>>,
}

/// Drives workflow runs over their step graphs.
///
/// Each run is a tokio task. The run table is guarded by one lock that is
/// never held across an `.await`.
pub struct WorkflowEngine {
    runner: Arc<dyn StepRunner>,
    config: EngineConfig,
    runs: Mutex<HashMap<RunId, RunEntry>>,
    /// Finished runs still on record, oldest first. Locked after `runs`.
    finished: Mutex<VecDeque<RunId>>,
    counters: Mutex<EngineCounters>,
    shutdown: CancellationToken,
}

impl WorkflowEngine {
    pub fn new(runner: Arc<dyn StepRunner>, config: EngineConfig) -> Self {
        Self {
            runner,
            config,
            runs: Mutex::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            counters: Mutex::new(EngineCounters::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Runs are cancelled when `token` is.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate `definition` and start a run in the background.
    pub fn submit(
        self: &Arc<Self>,
        definition: WorkflowDefinition,
        inputs: Payload,
    ) -> ConductorResult<RunId> {
        WorkflowValidator::check(&definition)?;
        let run_id = Uuid::new_v4();
        let execution = WorkflowExecution::new(run_id, &definition, inputs);
        let cancel = self.shutdown.child_token();
        let (done, _) = watch::channel(None);

        self.runs.lock().insert(
            run_id,
            RunEntry {
                execution: execution.clone(),
                cancel: cancel.clone(),
                done,
            },
        );
        self.counters.lock().runs_started += 1;
        info!(run_id = %run_id, workflow = %definition.name, steps = definition.steps.len(), "Workflow submitted");

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.drive(definition, execution, cancel).await;
        });
        Ok(run_id)
    }

    /// Wait for a run to finish. The summary is returned even if the run was
    /// retired in the meantime.
    pub async fn wait(&self, run_id: RunId) -> ConductorResult<WorkflowSummary> {
        let mut done = {
            let runs = self.runs.lock();
            let entry = runs
                .get(&run_id)
                .ok_or_else(|| ConductorError::not_found("workflow run", run_id))?;
            entry.done.subscribe()
        };
        let published = done
            .wait_for(Option::is_some)
            .await
            .map(|summary| (*summary).clone());
        let summary = match published {
            Ok(summary) => summary,
            // sender dropped: the run was retired, its last value remains
            Err(_) => (*done.borrow()).clone(),
        };
        summary.ok_or_else(|| ConductorError::not_found("workflow run", run_id))
    }

    /// Submit and wait.
    pub async fn run(
        self: &Arc<Self>,
        definition: WorkflowDefinition,
        inputs: Payload,
    ) -> ConductorResult<WorkflowSummary> {
        let run_id = self.submit(definition, inputs)?;
        self.wait(run_id).await
    }

    /// Snapshot of a run's record.
    pub fn get_run(&self, run_id: RunId) -> Option<WorkflowExecution> {
        self.runs.lock().get(&run_id).map(|e| e.execution.clone())
    }

    pub fn contains(&self, run_id: RunId) -> bool {
        self.runs.lock().contains_key(&run_id)
    }

    pub fn run_ids(&self) -> Vec<RunId> {
        self.runs.lock().keys().copied().collect()
    }

    /// Ask a running workflow to abort. In-flight steps are cancelled
    /// cooperatively; the run ends as failed.
    pub fn cancel_run(&self, run_id: RunId) -> ConductorResult<()> {
        let runs = self.runs.lock();
        let entry = runs
            .get(&run_id)
            .ok_or_else(|| ConductorError::not_found("workflow run", run_id))?;
        if entry.execution.status.is_terminal() {
            return Err(ConductorError::InvalidTransition {
                id: run_id.to_string(),
                status: entry.execution.status.to_string(),
                action: "cancel".into(),
            });
        }
        entry.cancel.cancel();
        info!(run_id = %run_id, "Workflow cancellation requested");
        Ok(())
    }

    /// Forget a finished run.
    pub fn retire(&self, run_id: RunId) -> bool {
        let mut runs = self.runs.lock();
        if runs
            .get(&run_id)
            .is_some_and(|e| e.execution.status.is_terminal())
        {
            runs.remove(&run_id);
            self.finished.lock().retain(|r| *r != run_id);
            return true;
        }
        false
    }

    pub fn snapshot(&self) -> EngineStats {
        let runs_active = self
            .runs
            .lock()
            .values()
            .filter(|e| !e.execution.status.is_terminal())
            .count();
        let c = self.counters.lock();
        let finished = c.runs_completed + c.runs_failed;
        EngineStats {
            runs_started: c.runs_started,
            runs_active,
            runs_completed: c.runs_completed,
            runs_failed: c.runs_failed,
            steps_completed: c.steps_completed,
            steps_failed: c.steps_failed,
            steps_skipped: c.steps_skipped,
            avg_run_ms: if finished == 0 {
                0.0
            } else {
                c.total_run_ms as f64 / finished as f64
            },
            success_rate: ratio(c.runs_completed, finished),
        }
    }

    fn publish(&self, execution: &WorkflowExecution) {
        if let Some(entry) = self.runs.lock().get_mut(&execution.run_id) {
            entry.execution = execution.clone();
        }
    }

    async fn drive(
        self: Arc<Self>,
        definition: WorkflowDefinition,
        execution: WorkflowExecution,
        cancel: CancellationToken,
    ) {
        let run_id = execution.run_id;
        let timeout = definition.config.timeout;
        let max_parallel = definition
            .config
            .max_parallel_steps
            .min(self.config.max_parallel_steps)
            .max(1);
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = RunState::new(definition, execution, self.config.default_step_retries);
        state.exec.status = WorkflowStatus::Running;
        state.exec.started_at = Some(Utc::now());

        let steps_cancel = cancel.child_token();
        let mut in_flight: JoinSet<(StepId, StepOutcome)> = JoinSet::new();

        let failure: Option<String> = loop {
            state.absorb_ready();
            while in_flight.len() < max_parallel {
                let Some(invocation) = state.next_invocation(&steps_cancel) else {
                    break;
                };
                debug!(run_id = %run_id, step = %invocation.step_id, attempt = invocation.attempt, "Step started");
                let runner = Arc::clone(&self.runner);
                in_flight.spawn(async move {
                    let step_id = invocation.step_id.clone();
                    let outcome = runner.run_task(invocation).await;
                    (step_id, outcome)
                });
            }
            self.publish(&state.exec);

            if in_flight.is_empty() {
                if state.all_terminal() {
                    break None;
                }
                let err = ConductorError::CircularOrStalledWorkflow {
                    run_id,
                    pending: state.unfinished(),
                };
                error!(run_id = %run_id, error = %err, "Workflow stalled");
                break Some(err.to_string());
            }

            tokio::select! {
                _ = cancel.cancelled() => break Some("workflow run cancelled".to_string()),
                _ = sleep_until(deadline) => {
                    let err = ConductorError::WorkflowTimedOut {
                        run_id,
                        timeout: timeout.unwrap_or_default(),
                    };
                    warn!(run_id = %run_id, error = %err, "Workflow timed out");
                    break Some(err.to_string());
                }
                joined = in_flight.join_next() => match joined {
                    Some(Ok((step_id, outcome))) => {
                        if let Err(reason) = state.on_outcome(&step_id, outcome) {
                            break Some(reason);
                        }
                    }
                    Some(Err(e)) => break Some(format!("step runner crashed: {e}")),
                    None => {}
                },
            }
        };

        match failure {
            Some(reason) => {
                steps_cancel.cancel();
                while let Some(joined) = in_flight.join_next().await {
                    if let Ok((step_id, outcome)) = joined {
                        state.on_drained(&step_id, outcome);
                    }
                }
                state.abort(&reason);
                warn!(run_id = %run_id, reason = %reason, "Workflow failed");
            }
            None => {
                state.exec.status = WorkflowStatus::Completed;
                state.exec.finished_at = Some(Utc::now());
                info!(
                    run_id = %run_id,
                    completed = state.exec.completed_steps,
                    failed = state.exec.failed_steps,
                    skipped = state.exec.skipped_steps,
                    "Workflow completed"
                );
            }
        }

        let summary = state.exec.summary();
        {
            let mut c = self.counters.lock();
            match summary.status {
                WorkflowStatus::Completed => c.runs_completed += 1,
                _ => c.runs_failed += 1,
            }
            c.steps_completed += summary.completed_steps as u64;
            c.steps_failed += summary.failed_steps as u64;
            c.steps_skipped += summary.skipped_steps as u64;
            c.total_run_ms += summary.duration_ms.unwrap_or(0);
        }
        let mut runs = self.runs.lock();
        if let Some(entry) = runs.get_mut(&run_id) {
            entry.execution = state.exec;
            entry.done.send_replace(Some(summary));
        }
        let mut finished = self.finished.lock();
        finished.push_back(run_id);
        while finished.len() > self.config.retain_runs {
            let Some(oldest) = finished.pop_front() else {
                break;
            };
            runs.remove(&oldest);
            debug!(run_id = %oldest, "Retired finished workflow run");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Per-run bookkeeping owned by the driving task.
struct RunState {
    steps: HashMap<StepId, WorkflowStep>,
    order: Vec<StepId>,
    deps: HashMap<StepId, Vec<StepId>>,
    group_of: HashMap<StepId, StepId>,
    resolver: DependencyResolver<StepId>,
    exec: WorkflowExecution,
    /// Steps skipped because something upstream failed.
    poisoned: HashSet<StepId>,
    /// Results of task steps that have started but not finished.
    active: HashMap<StepId, StepResult>,
    runnable: VecDeque<StepId>,
    strategy: FailureStrategy,
    default_retries: u32,
}

impl RunState {
    fn new(definition: WorkflowDefinition, exec: WorkflowExecution, default_retries: u32) -> Self {
        let deps: HashMap<StepId, Vec<StepId>> =
            definition.effective_dependencies().into_iter().collect();
        let mut group_of = HashMap::new();
        for step in &definition.steps {
            if let StepKind::ParallelGroup { members, .. } = &step.kind {
                for member in members {
                    group_of.insert(member.clone(), step.id.clone());
                }
            }
        }

        let mut resolver = DependencyResolver::new();
        for step in &definition.steps {
            let step_deps = deps.get(&step.id).cloned().unwrap_or_default();
            if let Err(e) = resolver.insert(step.id.clone(), &step_deps) {
                warn!(step = %step.id, error = %e, "Step could not be registered");
            }
        }

        Self {
            order: definition.steps.iter().map(|s| s.id.clone()).collect(),
            strategy: definition.config.failure_strategy,
            steps: definition
                .steps
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect(),
            deps,
            group_of,
            resolver,
            exec,
            poisoned: HashSet::new(),
            active: HashMap::new(),
            runnable: VecDeque::new(),
            default_retries,
        }
    }

    fn status(&self, step_id: &str) -> StepStatus {
        self.exec.status_of(step_id).unwrap_or(StepStatus::Pending)
    }

    fn all_terminal(&self) -> bool {
        self.exec.step_status.values().all(|s| s.is_terminal())
    }

    fn unfinished(&self) -> Vec<StepId> {
        self.order
            .iter()
            .filter(|id| !self.status(id).is_terminal())
            .cloned()
            .collect()
    }

    /// Activate every step whose dependencies have all executed, until no
    /// more become ready.
    fn absorb_ready(&mut self) {
        loop {
            let ready = self.resolver.take_ready();
            if ready.is_empty() {
                break;
            }
            for step_id in ready {
                self.activate(&step_id);
            }
        }
    }

    fn activate(&mut self, step_id: &str) {
        if self.status(step_id) != StepStatus::Pending {
            return;
        }
        let deps = self.deps.get(step_id).cloned().unwrap_or_default();
        let upstream_failed = deps.iter().any(|d| {
            self.poisoned.contains(d)
                || matches!(self.status(d), StepStatus::Failed | StepStatus::Cancelled)
        });
        if upstream_failed {
            self.skip(step_id, true);
            return;
        }
        if !deps.is_empty() && deps.iter().all(|d| self.status(d) == StepStatus::Skipped) {
            self.skip(step_id, false);
            return;
        }
        let Some(step) = self.steps.get(step_id).cloned() else {
            return;
        };
        if let Some(guard) = &step.guard {
            if !self.evaluate(step_id, guard) {
                debug!(step = %step_id, "Step guard is false, skipping");
                self.skip(step_id, false);
                return;
            }
        }

        match step.kind {
            StepKind::Task { .. } => self.runnable.push_back(step.id),
            StepKind::Decision {
                condition,
                if_true,
                if_false,
            } => {
                let branch = self.evaluate(step_id, &condition);
                let (chosen, unchosen) = if branch {
                    (if_true, if_false)
                } else {
                    (if_false, if_true)
                };
                debug!(step = %step_id, branch, "Decision evaluated");
                let mut result = StepResult::new(StepStatus::Completed);
                result.branch = Some(branch);
                result.started_at = Some(Utc::now());
                result.finished_at = result.started_at;
                result
                    .output
                    .insert("branch".into(), serde_json::Value::Bool(branch));
                for target in unchosen.iter().filter(|t| !chosen.contains(t)) {
                    self.skip(target, false);
                }
                self.exec.record(step_id, result);
                self.resolver.complete(&step.id);
                self.notify_group(step_id);
            }
            StepKind::ParallelGroup { .. } => {
                self.exec.set_status(step_id, StepStatus::Running);
                self.check_group(step_id);
            }
        }
    }

    /// Evaluate a condition against the run context; errors count as false.
    fn evaluate(&self, step_id: &str, condition: &Condition) -> bool {
        match condition.evaluate(&self.exec.context) {
            Ok(value) => value,
            Err(e) => {
                warn!(step = %step_id, error = %e, "Condition could not be evaluated, using false");
                false
            }
        }
    }

    fn skip(&mut self, step_id: &str, poisoned: bool) {
        if self.status(step_id) != StepStatus::Pending {
            return;
        }
        self.runnable.retain(|s| s != step_id);
        if poisoned {
            self.poisoned.insert(step_id.to_string());
        }
        self.exec.record(step_id, StepResult::new(StepStatus::Skipped));
        self.resolver.complete(&step_id.to_string());

        let nested: Vec<StepId> = self
            .steps
            .get(step_id)
            .map(|s| s.referenced_steps().into_iter().cloned().collect())
            .unwrap_or_default();
        for target in nested {
            self.skip(&target, poisoned);
        }
        self.notify_group(step_id);
    }

    fn notify_group(&mut self, step_id: &str) {
        if let Some(group) = self.group_of.get(step_id).cloned() {
            self.check_group(&group);
        }
    }

    /// Finish a running group once its members allow it.
    fn check_group(&mut self, group_id: &str) {
        if self.status(group_id) != StepStatus::Running {
            return;
        }
        let Some(StepKind::ParallelGroup {
            members,
            wait_for_all,
        }) = self.steps.get(group_id).map(|s| s.kind.clone())
        else {
            return;
        };
        let statuses: Vec<StepStatus> = members.iter().map(|m| self.status(m)).collect();
        let any_completed = statuses.contains(&StepStatus::Completed);
        let all_terminal = statuses.iter().all(|s| s.is_terminal());
        let any_failed = statuses
            .iter()
            .any(|s| matches!(s, StepStatus::Failed | StepStatus::Cancelled));

        let status = if !wait_for_all && any_completed {
            StepStatus::Completed
        } else if all_terminal {
            if any_failed {
                StepStatus::Failed
            } else if any_completed {
                StepStatus::Completed
            } else {
                StepStatus::Skipped
            }
        } else {
            return;
        };

        let mut result = StepResult::new(status);
        result.finished_at = Some(Utc::now());
        for member in &members {
            if let Some(output) = self.exec.context.get(member) {
                result.output.insert(member.clone(), output.clone());
            }
        }
        if status == StepStatus::Failed {
            result.error = Some("a group member failed".into());
        }
        self.exec.record(group_id, result);
        self.resolver.complete(&group_id.to_string());
        self.notify_group(group_id);
    }

    /// Build the next attempt of a runnable task step.
    fn next_invocation(&mut self, parent: &CancellationToken) -> Option<StepInvocation> {
        while let Some(step_id) = self.runnable.pop_front() {
            let Some(StepKind::Task { task: template }) = self.steps.get(&step_id).map(|s| &s.kind)
            else {
                continue;
            };
            let mut task = template.clone();
            task.id = Uuid::new_v4();
            task.dependencies.clear();
            task.input
                .entry("context".to_string())
                .or_insert_with(|| self.exec.context.clone());

            let result = self.active.entry(step_id.clone()).or_insert_with(|| {
                let mut r = StepResult::new(StepStatus::Running);
                r.started_at = Some(Utc::now());
                r
            });
            result.attempts += 1;
            result.task_ids.push(task.id);
            let attempt = result.attempts;
            self.exec.set_status(&step_id, StepStatus::Running);

            return Some(StepInvocation {
                run_id: self.exec.run_id,
                step_id,
                attempt,
                task,
                cancel: parent.child_token(),
            });
        }
        None
    }

    /// Apply a finished attempt. `Err` carries the reason to abort the run.
    fn on_outcome(&mut self, step_id: &str, outcome: StepOutcome) -> Result<(), String> {
        let mut result = self
            .active
            .remove(step_id)
            .unwrap_or_else(|| StepResult::new(StepStatus::Running));
        let message = match outcome {
            StepOutcome::Completed(output) => {
                result.status = StepStatus::Completed;
                result.output = output;
                result.finished_at = Some(Utc::now());
                self.exec.record(step_id, result);
                self.resolver.complete(&step_id.to_string());
                self.notify_group(step_id);
                return Ok(());
            }
            StepOutcome::Failed(message) => message,
            StepOutcome::Cancelled => "task was cancelled".to_string(),
        };

        if self.strategy == FailureStrategy::Retry {
            let budget = self
                .steps
                .get(step_id)
                .and_then(|s| s.max_retries)
                .unwrap_or(self.default_retries);
            if result.attempts <= budget {
                warn!(step = %step_id, attempt = result.attempts, error = %message, "Step attempt failed, retrying");
                self.exec.log_error(
                    Some(step_id),
                    format!("attempt {} failed: {message}", result.attempts),
                );
                self.active.insert(step_id.to_string(), result);
                self.runnable.push_front(step_id.to_string());
                return Ok(());
            }
        }

        result.status = StepStatus::Failed;
        result.error = Some(message.clone());
        result.finished_at = Some(Utc::now());
        self.exec.record(step_id, result);
        warn!(step = %step_id, error = %message, strategy = %self.strategy, "Step failed");

        match self.strategy {
            FailureStrategy::Continue => {
                self.resolver.complete(&step_id.to_string());
                self.notify_group(step_id);
                Ok(())
            }
            FailureStrategy::Stop | FailureStrategy::Retry => {
                Err(format!("step '{step_id}' failed: {message}"))
            }
        }
    }

    /// Record an attempt that finished while the run was aborting.
    fn on_drained(&mut self, step_id: &str, outcome: StepOutcome) {
        let mut result = self
            .active
            .remove(step_id)
            .unwrap_or_else(|| StepResult::new(StepStatus::Running));
        result.finished_at = Some(Utc::now());
        match outcome {
            StepOutcome::Completed(output) => {
                result.status = StepStatus::Completed;
                result.output = output;
            }
            StepOutcome::Failed(message) => {
                result.status = StepStatus::Failed;
                result.error = Some(message);
            }
            StepOutcome::Cancelled => {
                result.status = StepStatus::Cancelled;
                result.error = Some("cancelled".into());
            }
        }
        self.exec.record(step_id, result);
    }

    /// Settle every unfinished step and fail the run.
    fn abort(&mut self, reason: &str) {
        for step_id in self.order.clone() {
            match self.status(&step_id) {
                StepStatus::Pending => {
                    self.exec
                        .record(&step_id, StepResult::new(StepStatus::Skipped));
                }
                StepStatus::Running => {
                    let mut result = self
                        .active
                        .remove(&step_id)
                        .unwrap_or_else(|| StepResult::new(StepStatus::Running));
                    let is_group = self
                        .steps
                        .get(&step_id)
                        .is_some_and(|s| matches!(s.kind, StepKind::ParallelGroup { .. }));
                    result.status = if is_group {
                        StepStatus::Skipped
                    } else {
                        StepStatus::Cancelled
                    };
                    result.finished_at = Some(Utc::now());
                    self.exec.record(&step_id, result);
                }
                _ => {}
            }
        }
        self.exec.log_error(None, reason);
        self.exec.status = WorkflowStatus::Failed;
        self.exec.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::builder::{WorkflowBuilder, NO_DEPS};
    use crate::workflow::{RunOutcome, WorkflowStep};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Runner whose behaviour is scripted per task name.
    #[derive(Default)]
    struct ScriptedRunner {
        scripts: Mutex<HashMap<String, VecDeque<StepOutcome>>>,
        hang: HashSet<String>,
        delay: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
        seen: Mutex<Vec<StepInvocation>>,
    }

    impl ScriptedRunner {
        fn script(self, name: &str, outcomes: Vec<StepOutcome>) -> Self {
            self.scripts.lock().insert(name.into(), outcomes.into());
            self
        }

        fn hanging(mut self, name: &str) -> Self {
            self.hang.insert(name.into());
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn invocations(&self, step: &str) -> Vec<StepInvocation> {
            self.seen
                .lock()
                .iter()
                .filter(|i| i.step_id == step)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl StepRunner for ScriptedRunner {
        async fn run_task(&self, invocation: StepInvocation) -> StepOutcome {
            self.seen.lock().push(invocation.clone());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let outcome = if self.hang.contains(&invocation.task.name) {
                invocation.cancel.cancelled().await;
                StepOutcome::Cancelled
            } else {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                let scripted = self
                    .scripts
                    .lock()
                    .get_mut(&invocation.task.name)
                    .and_then(VecDeque::pop_front);
                scripted.unwrap_or_else(|| {
                    let mut out = Payload::new();
                    out.insert("step".into(), serde_json::json!(invocation.step_id));
                    StepOutcome::Completed(out)
                })
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    fn task(name: &str) -> TaskDefinition {
        TaskDefinition::new(name, "test")
    }

    fn engine(runner: ScriptedRunner) -> (Arc<WorkflowEngine>, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&runner) as Arc<dyn StepRunner>,
            EngineConfig::default(),
        ));
        (engine, runner)
    }

    fn failed(msg: &str) -> StepOutcome {
        StepOutcome::Failed(msg.into())
    }

    #[tokio::test]
    async fn test_stop_strategy_halts_run() {
        let (engine, runner) = engine(ScriptedRunner::default().script("s2", vec![failed("boom")]));
        let wf = WorkflowBuilder::new("pipeline")
            .task("s1", task("s1"), NO_DEPS)
            .task("s2", task("s2"), ["s1"])
            .task("s3", task("s3"), ["s2"])
            .build()
            .unwrap();

        let summary = engine.run(wf, Payload::new()).await.unwrap();
        assert_eq!(summary.status, WorkflowStatus::Failed);
        assert_eq!(summary.outcome, RunOutcome::Failure);
        assert_eq!(summary.completed_steps, 1);
        assert_eq!(summary.failed_steps, 1);
        assert_eq!(summary.skipped_steps, 1);
        assert!(runner.invocations("s3").is_empty());

        let exec = engine.get_run(summary.run_id).unwrap();
        assert_eq!(exec.status_of("s3"), Some(StepStatus::Skipped));
        assert!(exec.errors.iter().any(|e| e.message.contains("boom")));
    }

    #[tokio::test]
    async fn test_continue_strategy_partial_success() {
        let (engine, _) = engine(ScriptedRunner::default().script("a", vec![failed("bad input")]));
        let wf = WorkflowBuilder::new("fanout")
            .task("a", task("a"), NO_DEPS)
            .task("b", task("b"), NO_DEPS)
            .task("after_a", task("after_a"), ["a"])
            .task("after_b", task("after_b"), ["b"])
            .failure_strategy(FailureStrategy::Continue)
            .build()
            .unwrap();

        let summary = engine.run(wf, Payload::new()).await.unwrap();
        assert_eq!(summary.status, WorkflowStatus::Completed);
        assert_eq!(summary.outcome, RunOutcome::PartialSuccess);
        assert_eq!(summary.completed_steps, 2);
        assert_eq!(summary.failed_steps, 1);
        assert_eq!(summary.skipped_steps, 1);

        let exec = engine.get_run(summary.run_id).unwrap();
        assert_eq!(exec.status_of("after_a"), Some(StepStatus::Skipped));
        assert_eq!(exec.status_of("after_b"), Some(StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_retry_strategy_uses_fresh_task_per_attempt() {
        let (engine, runner) = engine(
            ScriptedRunner::default().script("flaky", vec![failed("one"), failed("two")]),
        );
        let wf = WorkflowBuilder::new("retrying")
            .step(WorkflowStep::task("flaky", task("flaky")).with_max_retries(2))
            .failure_strategy(FailureStrategy::Retry)
            .build()
            .unwrap();

        let summary = engine.run(wf, Payload::new()).await.unwrap();
        assert_eq!(summary.outcome, RunOutcome::Success);

        let exec = engine.get_run(summary.run_id).unwrap();
        let result = &exec.step_results["flaky"];
        assert_eq!(result.attempts, 3);
        assert_eq!(result.task_ids.len(), 3);
        let attempts: Vec<u32> = runner.invocations("flaky").iter().map(|i| i.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        let ids: HashSet<_> = result.task_ids.iter().collect();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_fails_run() {
        let (engine, runner) = engine(
            ScriptedRunner::default().script("flaky", vec![failed("1"), failed("2"), failed("3")]),
        );
        let wf = WorkflowBuilder::new("retrying")
            .step(WorkflowStep::task("flaky", task("flaky")).with_max_retries(1))
            .failure_strategy(FailureStrategy::Retry)
            .build()
            .unwrap();

        let summary = engine.run(wf, Payload::new()).await.unwrap();
        assert_eq!(summary.status, WorkflowStatus::Failed);
        assert_eq!(runner.invocations("flaky").len(), 2);
    }

    #[tokio::test]
    async fn test_decision_selects_branch_and_skips_other() {
        let (engine, runner) = engine(ScriptedRunner::default());
        let wf = WorkflowBuilder::new("release")
            .task("build", task("build"), NO_DEPS)
            .decision(
                "gate",
                Condition::equals("env", "prod"),
                ["approve"],
                ["smoke"],
                ["build"],
            )
            .task("approve", task("approve"), NO_DEPS)
            .task("smoke", task("smoke"), NO_DEPS)
            .task("deploy", task("deploy"), ["approve"])
            .task("report", task("report"), ["smoke"])
            .build()
            .unwrap();

        let mut inputs = Payload::new();
        inputs.insert("env".into(), serde_json::json!("prod"));
        let summary = engine.run(wf, inputs).await.unwrap();
        assert_eq!(summary.outcome, RunOutcome::Success);

        let exec = engine.get_run(summary.run_id).unwrap();
        assert_eq!(exec.step_results["gate"].branch, Some(true));
        assert_eq!(exec.status_of("deploy"), Some(StepStatus::Completed));
        assert_eq!(exec.status_of("smoke"), Some(StepStatus::Skipped));
        assert_eq!(exec.status_of("report"), Some(StepStatus::Skipped));
        assert!(runner.invocations("smoke").is_empty());
    }

    #[tokio::test]
    async fn test_guard_false_skips_step() {
        let (engine, runner) = engine(ScriptedRunner::default());
        let wf = WorkflowBuilder::new("guarded")
            .step(WorkflowStep::task("notify", task("notify")).when(Condition::truthy("notify")))
            .build()
            .unwrap();

        let summary = engine.run(wf, Payload::new()).await.unwrap();
        assert_eq!(summary.status, WorkflowStatus::Completed);
        assert_eq!(summary.skipped_steps, 1);
        assert!(runner.invocations("notify").is_empty());
    }

    #[tokio::test]
    async fn test_parallel_group_collects_member_outputs() {
        let (engine, _) = engine(ScriptedRunner::default());
        let wf = WorkflowBuilder::new("grouped")
            .task("prepare", task("prepare"), NO_DEPS)
            .parallel("checks", ["lint", "unit"], true, ["prepare"])
            .task("lint", task("lint"), NO_DEPS)
            .task("unit", task("unit"), NO_DEPS)
            .task("publish", task("publish"), ["checks"])
            .build()
            .unwrap();

        let summary = engine.run(wf, Payload::new()).await.unwrap();
        assert_eq!(summary.outcome, RunOutcome::Success);

        let exec = engine.get_run(summary.run_id).unwrap();
        let group = &exec.step_results["checks"];
        assert_eq!(group.status, StepStatus::Completed);
        assert!(group.output.contains_key("lint"));
        assert!(group.output.contains_key("unit"));
        assert_eq!(exec.status_of("publish"), Some(StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_step_sees_upstream_output_in_context() {
        let (engine, runner) = engine(ScriptedRunner::default());
        let wf = WorkflowBuilder::new("chain")
            .task("a", task("a"), NO_DEPS)
            .task("b", task("b"), ["a"])
            .build()
            .unwrap();

        engine.run(wf, Payload::new()).await.unwrap();
        let b = runner.invocations("b").pop().unwrap();
        assert_eq!(b.task.input["context"]["a"]["step"], serde_json::json!("a"));
        assert!(b.task.dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_max_parallel_bound() {
        let (engine, runner) =
            engine(ScriptedRunner::default().with_delay(Duration::from_millis(20)));
        let mut builder = WorkflowBuilder::new("wide").max_parallel(2);
        for i in 0..6 {
            let id = format!("s{i}");
            builder = builder.task(&id, task(&id), NO_DEPS);
        }
        let summary = engine.run(builder.build().unwrap(), Payload::new()).await.unwrap();
        assert_eq!(summary.completed_steps, 6);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_workflow_timeout_cancels_steps() {
        let (engine, _) = engine(ScriptedRunner::default().hanging("slow"));
        let wf = WorkflowBuilder::new("slow")
            .task("slow", task("slow"), NO_DEPS)
            .task("after", task("after"), ["slow"])
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();

        let summary = engine.run(wf, Payload::new()).await.unwrap();
        assert_eq!(summary.status, WorkflowStatus::Failed);
        assert!(summary.errors.iter().any(|e| e.contains("timed out")));

        let exec = engine.get_run(summary.run_id).unwrap();
        assert_eq!(exec.status_of("slow"), Some(StepStatus::Cancelled));
        assert_eq!(exec.status_of("after"), Some(StepStatus::Skipped));
    }

    #[tokio::test]
    async fn test_cancel_run() {
        let (engine, _) = engine(ScriptedRunner::default().hanging("wait"));
        let wf = WorkflowBuilder::new("cancellable")
            .task("wait", task("wait"), NO_DEPS)
            .build()
            .unwrap();

        let run_id = engine.submit(wf, Payload::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.cancel_run(run_id).unwrap();
        let summary = engine.wait(run_id).await.unwrap();
        assert_eq!(summary.status, WorkflowStatus::Failed);

        let err = engine.cancel_run(run_id).unwrap_err();
        assert!(matches!(err, ConductorError::InvalidTransition { .. }));
        assert!(engine.retire(run_id));
        assert!(engine.get_run(run_id).is_none());
    }

    #[tokio::test]
    async fn test_finished_runs_beyond_retention_are_retired() {
        let runner = Arc::new(ScriptedRunner::default());
        let config = EngineConfig {
            retain_runs: 1,
            ..EngineConfig::default()
        };
        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&runner) as Arc<dyn StepRunner>,
            config,
        ));
        let wf = || {
            WorkflowBuilder::new("short")
                .task("a", task("a"), NO_DEPS)
                .build()
                .unwrap()
        };

        let first = engine.submit(wf(), Payload::new()).unwrap();
        let first_summary = engine.wait(first).await.unwrap();
        let second = engine.run(wf(), Payload::new()).await.unwrap();

        assert_eq!(first_summary.status, WorkflowStatus::Completed);
        assert_eq!(second.status, WorkflowStatus::Completed);
        assert!(!engine.contains(first));
        assert!(engine.contains(second.run_id));
        assert_eq!(engine.run_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_returns_summary_of_retired_run() {
        let runner = Arc::new(ScriptedRunner::default().with_delay(Duration::from_millis(20)));
        let config = EngineConfig {
            retain_runs: 0,
            ..EngineConfig::default()
        };
        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&runner) as Arc<dyn StepRunner>,
            config,
        ));
        let wf = WorkflowBuilder::new("gone")
            .task("a", task("a"), NO_DEPS)
            .build()
            .unwrap();

        let run_id = engine.submit(wf, Payload::new()).unwrap();
        let summary = engine.wait(run_id).await.unwrap();
        assert_eq!(summary.status, WorkflowStatus::Completed);
        assert!(!engine.contains(run_id));
    }

    #[tokio::test]
    async fn test_invalid_workflow_rejected() {
        let (engine, _) = engine(ScriptedRunner::default());
        let mut wf = WorkflowDefinition::new("broken");
        wf.steps = vec![
            WorkflowStep::task("a", task("a")).depends_on(["b"]),
            WorkflowStep::task("b", task("b")).depends_on(["a"]),
        ];
        let err = engine.submit(wf, Payload::new()).unwrap_err();
        assert!(matches!(err, ConductorError::InvalidWorkflow { .. }));
        assert_eq!(engine.snapshot().runs_started, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let (engine, _) = engine(ScriptedRunner::default().script("bad", vec![failed("x")]));
        let ok = WorkflowBuilder::new("ok")
            .task("good", task("good"), NO_DEPS)
            .build()
            .unwrap();
        let bad = WorkflowBuilder::new("bad")
            .task("bad", task("bad"), NO_DEPS)
            .build()
            .unwrap();
        engine.run(ok, Payload::new()).await.unwrap();
        engine.run(bad, Payload::new()).await.unwrap();

        let stats = engine.snapshot();
        assert_eq!(stats.runs_started, 2);
        assert_eq!(stats.runs_completed, 1);
        assert_eq!(stats.runs_failed, 1);
        assert_eq!(stats.runs_active, 0);
        assert_eq!(stats.success_rate, 0.5);
        assert!(stats.to_map().contains_key("engine.steps_failed"));
    }
}
