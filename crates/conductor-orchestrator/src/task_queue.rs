use crate::config::RetryPolicy;
use crate::resolver::{DependencyResolver, ResolveError};
use chrono::{DateTime, Utc};
use conductor_core::{
    ConductorError, ConductorResult, Payload, Priority, ResourceSample, TaskDefinition,
    TaskExecution, TaskId, TaskStatus,
};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Ordering key of the eligible set: highest priority first, then the
/// earliest submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EligibleKey {
    priority: Reverse<Priority>,
    seq: u64,
    id: TaskId,
}

/// Running totals kept by the queue.
#[derive(Debug, Clone, Default)]
pub struct QueueCounters {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub retries: u64,
    pub total_duration_ms: u64,
}

/// A running task that was moved out of `Running` by the timeout check.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutEvent {
    pub task_id: TaskId,
    pub worker_id: Option<String>,
    /// `Pending` if the task will be retried, `TimedOut` otherwise.
    pub status: TaskStatus,
}

/// What `cancel` did to the task.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    pub was_running: bool,
    pub worker_id: Option<String>,
    /// Dependents cancelled along with the task.
    pub cascaded: Vec<TaskId>,
}

/// The scheduler's bookkeeping: definitions, execution records, the
/// dependency resolver and the priority-ordered eligible set.
///
/// All methods take the current time explicitly; locking and the clock are
/// handled by [`crate::scheduler::TaskScheduler`].
pub struct TaskQueue {
    definitions: HashMap<TaskId, TaskDefinition>,
    executions: HashMap<TaskId, TaskExecution>,
    seq: HashMap<TaskId, u64>,
    resolver: DependencyResolver<TaskId>,
    eligible: BTreeSet<EligibleKey>,
    claimed: HashSet<TaskId>,
    delayed: HashSet<TaskId>,
    finished: Vec<TaskId>,
    /// Ids of tasks that ended without completing, kept after retirement.
    unsuccessful: HashSet<TaskId>,
    /// Terminal tasks still on record, oldest first.
    terminal_order: VecDeque<TaskId>,
    retain_finished: usize,
    next_seq: u64,
    allow_forward_references: bool,
    counters: QueueCounters,
}

impl TaskQueue {
    pub fn new(allow_forward_references: bool) -> Self {
        Self {
            definitions: HashMap::new(),
            executions: HashMap::new(),
            seq: HashMap::new(),
            resolver: DependencyResolver::new(),
            eligible: BTreeSet::new(),
            claimed: HashSet::new(),
            delayed: HashSet::new(),
            finished: Vec::new(),
            unsuccessful: HashSet::new(),
            terminal_order: VecDeque::new(),
            retain_finished: usize::MAX,
            next_seq: 0,
            allow_forward_references,
            counters: QueueCounters::default(),
        }
    }

    /// Keep at most `limit` terminal tasks on record; older ones are retired
    /// once their ids were drained by [`take_finished`](Self::take_finished).
    pub fn with_retention(mut self, limit: usize) -> Self {
        self.retain_finished = limit;
        self
    }

    /// Add a task to the queue.
    pub fn add(&mut self, task: TaskDefinition, now: DateTime<Utc>) -> ConductorResult<TaskId> {
        self.enforce_retention();
        let result = self.try_add(task, now);
        if result.is_err() {
            self.counters.rejected += 1;
        }
        result
    }

    fn try_add(&mut self, task: TaskDefinition, now: DateTime<Utc>) -> ConductorResult<TaskId> {
        task.validate()?;
        let id = task.id;
        if self.definitions.contains_key(&id) || self.unsuccessful.contains(&id) {
            return Err(ConductorError::DuplicateTask { task_id: id });
        }
        if !self.allow_forward_references {
            if let Some(missing) = task.dependencies.iter().find(|dep| {
                !self.definitions.contains_key(*dep)
                    && !self.unsuccessful.contains(*dep)
                    && !self.resolver.is_completed(dep)
            }) {
                return Err(ConductorError::UnknownDependency {
                    task_id: id,
                    dependency: *missing,
                });
            }
        }

        if let Some(failed) = task
            .dependencies
            .iter()
            .find(|dep| self.unsuccessful.contains(*dep))
            .copied()
        {
            return Ok(self.add_cancelled(task, failed, now));
        }

        let deps: Vec<TaskId> = task.dependencies.iter().copied().collect();
        self.resolver.insert(id, &deps).map_err(|e| match e {
            ResolveError::Duplicate(task_id) => ConductorError::DuplicateTask { task_id },
            ResolveError::SelfDependency(task_id) => ConductorError::InvalidTask {
                task_id,
                reason: "task cannot depend on itself".into(),
            },
            ResolveError::Cycle(path) => ConductorError::CyclicDependency {
                cycle: path.iter().map(Uuid::to_string).collect(),
            },
        })?;

        let seq = self.next_seq;
        self.next_seq += 1;
        self.seq.insert(id, seq);
        self.executions.insert(id, TaskExecution::new(id, now));
        self.definitions.insert(id, task);
        self.counters.submitted += 1;
        self.absorb_ready();
        Ok(id)
    }

    /// Record a task whose dependency already ended without completing. It
    /// never enters the resolver; forward references to it cascade.
    fn add_cancelled(&mut self, task: TaskDefinition, failed: TaskId, now: DateTime<Utc>) -> TaskId {
        let id = task.id;
        let mut exec = TaskExecution::new(id, now);
        exec.status = TaskStatus::Cancelled;
        exec.error = Some(format!("dependency {failed} did not complete"));
        exec.finish(now);

        let seq = self.next_seq;
        self.next_seq += 1;
        self.seq.insert(id, seq);
        self.executions.insert(id, exec);
        self.definitions.insert(id, task);
        self.counters.submitted += 1;
        self.counters.cancelled += 1;
        self.settle(id, false);
        self.cascade(id, now);
        id
    }

    /// Claim the highest-priority eligible task.
    ///
    /// Retried tasks whose backoff elapsed are promoted first; tasks past
    /// their deadline are expired instead of returned.
    pub fn next_eligible(&mut self, now: DateTime<Utc>) -> Option<TaskDefinition> {
        self.promote_delayed(now);
        while let Some(key) = self.eligible.pop_first() {
            let Some(task) = self.definitions.get(&key.id) else {
                continue;
            };
            if task.is_expired(now) {
                self.expire(key.id, "deadline exceeded", now);
                continue;
            }
            self.claimed.insert(key.id);
            return Some(task.clone());
        }
        None
    }

    /// Put a claimed task back into the eligible set.
    pub fn release(&mut self, id: TaskId) -> bool {
        if !self.claimed.remove(&id) {
            return false;
        }
        if self.status(id) == Some(TaskStatus::Pending) {
            self.push_eligible(id);
            return true;
        }
        false
    }

    /// Pending -> Running, bound to `worker_id`.
    pub fn start(&mut self, id: TaskId, worker_id: &str, now: DateTime<Utc>) -> ConductorResult<()> {
        if !self.resolver.is_ready(&id) && self.status(id) == Some(TaskStatus::Pending) {
            return Err(ConductorError::InvalidTransition {
                id: id.to_string(),
                status: "pending with unresolved dependencies".into(),
                action: "start".into(),
            });
        }
        self.execution_mut(id)?.begin(worker_id, now)?;
        self.claimed.remove(&id);
        self.delayed.remove(&id);
        if let Some(key) = self.key_of(id) {
            self.eligible.remove(&key);
        }
        Ok(())
    }

    /// Running -> Pending without spending a retry; the attempt never
    /// reached a worker. The task stays claimed until [`release`](Self::release).
    pub fn requeue(&mut self, id: TaskId) -> ConductorResult<()> {
        let exec = self.execution_mut(id)?;
        exec.transition(TaskStatus::Pending, "requeue")?;
        exec.worker_id = None;
        exec.started_at = None;
        self.claimed.insert(id);
        Ok(())
    }

    /// Pending -> TimedOut for a task that can never be placed.
    pub fn abandon(&mut self, id: TaskId, reason: &str, now: DateTime<Utc>) -> ConductorResult<()> {
        let status = self
            .status(id)
            .ok_or_else(|| ConductorError::not_found("task", id))?;
        if status != TaskStatus::Pending {
            return Err(ConductorError::InvalidTransition {
                id: id.to_string(),
                status: status.to_string(),
                action: "abandon".into(),
            });
        }
        self.expire(id, reason, now);
        Ok(())
    }

    /// Running -> Completed. Returns the tasks that became eligible.
    pub fn complete(
        &mut self,
        id: TaskId,
        output: Payload,
        now: DateTime<Utc>,
    ) -> ConductorResult<Vec<TaskId>> {
        let exec = self.execution_mut(id)?;
        exec.transition(TaskStatus::Completed, "complete")?;
        exec.output = output;
        exec.progress = 100;
        exec.error = None;
        exec.finish(now);
        let duration = exec.duration_ms.unwrap_or(0);

        self.counters.completed += 1;
        self.counters.total_duration_ms += duration;
        self.settle(id, true);

        let newly = self.resolver.complete(&id);
        self.absorb_ready();
        Ok(newly)
    }

    /// Record a failed attempt. Returns `Pending` if the task goes back to
    /// the queue for another attempt, `Failed` once the retry budget is spent.
    pub fn fail(
        &mut self,
        id: TaskId,
        message: &str,
        details: Option<serde_json::Value>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> ConductorResult<TaskStatus> {
        if self.status(id) != Some(TaskStatus::Running) {
            let status = self
                .status(id)
                .ok_or_else(|| ConductorError::not_found("task", id))?;
            return Err(ConductorError::InvalidTransition {
                id: id.to_string(),
                status: status.to_string(),
                action: "fail".into(),
            });
        }
        if let Some(exec) = self.executions.get_mut(&id) {
            exec.error_details = details;
        }
        self.end_attempt(id, message, TaskStatus::Failed, policy, now)
    }

    /// Cancel a pending or running task and everything that depends on it.
    pub fn cancel(&mut self, id: TaskId, now: DateTime<Utc>) -> ConductorResult<CancelOutcome> {
        let exec = self.execution_mut(id)?;
        let was_running = exec.status == TaskStatus::Running;
        exec.transition(TaskStatus::Cancelled, "cancel")?;
        exec.cancel_requested = was_running;
        exec.error = Some("cancelled".into());
        exec.finish(now);
        let worker_id = exec.worker_id.clone();

        self.counters.cancelled += 1;
        self.drop_scheduling_state(id);
        self.settle(id, false);
        let cascaded = self.cascade(id, now);
        Ok(CancelOutcome {
            was_running,
            worker_id,
            cascaded,
        })
    }

    /// Time out running tasks whose timeout elapsed and expire pending tasks
    /// past their deadline.
    pub fn check_timeouts(&mut self, policy: &RetryPolicy, now: DateTime<Utc>) -> Vec<TimeoutEvent> {
        self.enforce_retention();
        let overdue: Vec<(TaskId, Option<String>)> = self
            .executions
            .values()
            .filter(|e| e.status == TaskStatus::Running)
            .filter_map(|e| {
                let task = self.definitions.get(&e.task_id)?;
                let started = e.started_at?;
                // a deadline past the representable range never comes due
                let limit = chrono::Duration::from_std(task.timeout).ok()?;
                let due = started.checked_add_signed(limit)?;
                (now >= due).then(|| (e.task_id, e.worker_id.clone()))
            })
            .collect();

        let mut events = Vec::new();
        for (id, worker_id) in overdue {
            let timeout = self
                .definitions
                .get(&id)
                .map(|t| t.timeout)
                .unwrap_or_default();
            let reason = format!("timed out after {timeout:?}");
            if let Ok(status) = self.end_attempt(id, &reason, TaskStatus::TimedOut, policy, now) {
                events.push(TimeoutEvent {
                    task_id: id,
                    worker_id,
                    status,
                });
            }
        }

        let expired: Vec<TaskId> = self
            .executions
            .values()
            .filter(|e| e.status == TaskStatus::Pending)
            .filter(|e| {
                self.definitions
                    .get(&e.task_id)
                    .is_some_and(|t| t.is_expired(now))
            })
            .map(|e| e.task_id)
            .collect();
        for id in expired {
            self.expire(id, "deadline exceeded", now);
            events.push(TimeoutEvent {
                task_id: id,
                worker_id: None,
                status: TaskStatus::TimedOut,
            });
        }
        events
    }

    /// Store a progress report for a running task.
    pub fn record_progress(
        &mut self,
        id: TaskId,
        percent: u8,
        message: &str,
        now: DateTime<Utc>,
    ) -> ConductorResult<()> {
        let exec = self.execution_mut(id)?;
        if exec.status != TaskStatus::Running {
            return Err(ConductorError::InvalidTransition {
                id: id.to_string(),
                status: exec.status.to_string(),
                action: "report progress".into(),
            });
        }
        exec.record_progress(percent, message, now);
        Ok(())
    }

    pub fn record_resource_sample(
        &mut self,
        id: TaskId,
        sample: ResourceSample,
    ) -> ConductorResult<()> {
        self.execution_mut(id)?.resource_samples.push(sample);
        Ok(())
    }

    /// Forget a task that reached a terminal state. Tasks added later may
    /// still depend on it.
    pub fn retire(&mut self, id: TaskId) -> bool {
        if !self.status(id).is_some_and(TaskStatus::is_terminal) {
            return false;
        }
        self.terminal_order.retain(|t| *t != id);
        self.forget(id);
        true
    }

    fn forget(&mut self, id: TaskId) {
        self.definitions.remove(&id);
        self.executions.remove(&id);
        self.seq.remove(&id);
        self.resolver.forget(&id);
    }

    /// Retire the oldest terminal tasks beyond the retention limit. A task
    /// whose id was not drained yet stops the sweep.
    fn enforce_retention(&mut self) {
        while self.terminal_order.len() > self.retain_finished {
            let Some(&oldest) = self.terminal_order.front() else {
                break;
            };
            if self.finished.contains(&oldest) {
                break;
            }
            self.terminal_order.pop_front();
            self.forget(oldest);
        }
    }

    /// Drain the ids of tasks that reached a terminal state since the last
    /// call.
    pub fn take_finished(&mut self) -> Vec<TaskId> {
        std::mem::take(&mut self.finished)
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskExecution> {
        self.executions.get(&id)
    }

    pub fn definition(&self, id: TaskId) -> Option<&TaskDefinition> {
        self.definitions.get(&id)
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.executions.get(&id).map(|e| e.status)
    }

    /// Count of tasks in the given status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.executions
            .values()
            .filter(|e| e.status == status)
            .count()
    }

    /// Tasks that are eligible right now (not counting claimed ones).
    pub fn eligible_count(&self) -> usize {
        self.eligible.len()
    }

    pub fn delayed_count(&self) -> usize {
        self.delayed.len()
    }

    pub fn total_count(&self) -> usize {
        self.executions.len()
    }

    /// Check if all tasks are in a terminal state.
    pub fn is_done(&self) -> bool {
        self.executions.values().all(|e| e.status.is_terminal())
    }

    /// `(task, missing dependency)` pairs for forward references.
    pub fn unknown_dependencies(&self) -> Vec<(TaskId, TaskId)> {
        self.resolver.unknown_dependencies()
    }

    pub fn counters(&self) -> &QueueCounters {
        &self.counters
    }

    fn end_attempt(
        &mut self,
        id: TaskId,
        reason: &str,
        terminal: TaskStatus,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> ConductorResult<TaskStatus> {
        let max_retries = self
            .definitions
            .get(&id)
            .map(|t| t.max_retries)
            .ok_or_else(|| ConductorError::not_found("task", id))?;
        let exec = self.execution_mut(id)?;
        exec.record_failure(reason, now);

        if exec.attempt <= max_retries {
            exec.transition(TaskStatus::Pending, "retry")?;
            exec.attempt += 1;
            exec.worker_id = None;
            exec.started_at = None;
            exec.progress = 0;
            exec.not_before = policy.not_before(exec.attempt, now);
            let delayed = exec.not_before.is_some();

            self.counters.retries += 1;
            if delayed {
                self.delayed.insert(id);
            } else {
                self.push_eligible(id);
            }
            return Ok(TaskStatus::Pending);
        }

        exec.transition(terminal, "fail")?;
        exec.finish(now);
        match terminal {
            TaskStatus::TimedOut => self.counters.timed_out += 1,
            _ => self.counters.failed += 1,
        }
        self.drop_scheduling_state(id);
        self.settle(id, false);
        self.cascade(id, now);
        Ok(terminal)
    }

    /// Pending -> TimedOut.
    fn expire(&mut self, id: TaskId, reason: &str, now: DateTime<Utc>) {
        let Some(exec) = self.executions.get_mut(&id) else {
            return;
        };
        if exec.transition(TaskStatus::TimedOut, "expire").is_err() {
            return;
        }
        exec.error = Some(reason.to_string());
        exec.finish(now);
        self.counters.timed_out += 1;
        self.drop_scheduling_state(id);
        self.settle(id, false);
        self.cascade(id, now);
    }

    /// Cancel every pending task that transitively depends on `id`; they can
    /// never become eligible.
    fn cascade(&mut self, id: TaskId, now: DateTime<Utc>) -> Vec<TaskId> {
        let dependents = self.resolver.transitive_dependents(&id);
        let mut cancelled = Vec::new();
        for dep in dependents {
            let Some(exec) = self.executions.get_mut(&dep) else {
                continue;
            };
            if exec.status != TaskStatus::Pending {
                continue;
            }
            exec.status = TaskStatus::Cancelled;
            exec.error = Some(format!("dependency {id} did not complete"));
            exec.finish(now);
            self.counters.cancelled += 1;
            cancelled.push(dep);
        }
        for dep in &cancelled {
            self.drop_scheduling_state(*dep);
            self.settle(*dep, false);
        }
        cancelled
    }

    fn settle(&mut self, id: TaskId, completed: bool) {
        if !completed {
            self.unsuccessful.insert(id);
        }
        self.finished.push(id);
        self.terminal_order.push_back(id);
    }

    fn drop_scheduling_state(&mut self, id: TaskId) {
        if let Some(key) = self.key_of(id) {
            self.eligible.remove(&key);
        }
        self.claimed.remove(&id);
        self.delayed.remove(&id);
        self.resolver.remove(&id);
    }

    fn promote_delayed(&mut self, now: DateTime<Utc>) {
        let due: Vec<TaskId> = self
            .delayed
            .iter()
            .filter(|id| {
                self.executions
                    .get(id)
                    .and_then(|e| e.not_before)
                    .map_or(true, |t| t <= now)
            })
            .copied()
            .collect();
        for id in due {
            self.delayed.remove(&id);
            self.push_eligible(id);
        }
    }

    fn absorb_ready(&mut self) {
        for id in self.resolver.take_ready() {
            if self.status(id) == Some(TaskStatus::Pending) && !self.delayed.contains(&id) {
                self.push_eligible(id);
            }
        }
    }

    fn push_eligible(&mut self, id: TaskId) {
        if let Some(key) = self.key_of(id) {
            self.eligible.insert(key);
        }
    }

    fn key_of(&self, id: TaskId) -> Option<EligibleKey> {
        let task = self.definitions.get(&id)?;
        let seq = *self.seq.get(&id)?;
        Some(EligibleKey {
            priority: Reverse(task.priority),
            seq,
            id,
        })
    }

    fn execution_mut(&mut self, id: TaskId) -> ConductorResult<&mut TaskExecution> {
        self.executions
            .get_mut(&id)
            .ok_or_else(|| ConductorError::not_found("task", id))
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(true)
    }
}
