use crate::config::SchedulerConfig;
use crate::monitor::{flatten, ratio, StatsMap};
use crate::task_queue::{CancelOutcome, TaskQueue, TimeoutEvent};
use chrono::{DateTime, Utc};
use conductor_core::{
    ConductorResult, Payload, ResourceSample, TaskDefinition, TaskExecution, TaskId, TaskStatus,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Point-in-time scheduler statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub rejected: u64,
    pub pending: usize,
    pub eligible: usize,
    pub delayed: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub retries: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    /// Tasks not yet in a terminal state.
    pub queue_depth: usize,
    pub unknown_dependencies: usize,
}

impl SchedulerStats {
    pub fn to_map(&self) -> StatsMap {
        flatten("scheduler", self)
    }
}

/// Single authority over which pending task is handed out next.
///
/// The queue lock is held only while bookkeeping changes, never across a
/// dispatch or an `.await`.
pub struct TaskScheduler {
    queue: Mutex<TaskQueue>,
    config: SchedulerConfig,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            queue: Mutex::new(
                TaskQueue::new(config.allow_forward_references)
                    .with_retention(config.retain_finished),
            ),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register a task as pending.
    pub fn submit(&self, task: TaskDefinition) -> ConductorResult<TaskId> {
        let name = task.name.clone();
        let priority = task.priority;
        let result = self.queue.lock().add(task, Utc::now());
        match &result {
            Ok(id) => info!(task_id = %id, task = %name, %priority, "Task submitted"),
            Err(e) => warn!(task = %name, error = %e, "Task submission rejected"),
        }
        result
    }

    /// Claim the highest-priority eligible task, or `None` if nothing is
    /// eligible right now. Never blocks.
    pub fn next_eligible(&self) -> Option<TaskDefinition> {
        self.next_eligible_at(Utc::now())
    }

    pub fn next_eligible_at(&self, now: DateTime<Utc>) -> Option<TaskDefinition> {
        self.queue.lock().next_eligible(now)
    }

    /// Return a claimed task to the eligible set.
    pub fn release(&self, task_id: TaskId) -> bool {
        self.queue.lock().release(task_id)
    }

    pub fn start(&self, task_id: TaskId, worker_id: &str) -> ConductorResult<()> {
        self.queue.lock().start(task_id, worker_id, Utc::now())?;
        info!(task_id = %task_id, worker = %worker_id, "Task started");
        Ok(())
    }

    /// Undo `start` for an attempt the worker never accepted. The task
    /// stays claimed until released.
    pub fn requeue(&self, task_id: TaskId) -> ConductorResult<()> {
        self.queue.lock().requeue(task_id)?;
        debug!(task_id = %task_id, "Task requeued");
        Ok(())
    }

    /// Give up on a pending task that cannot be placed.
    pub fn abandon(&self, task_id: TaskId, reason: &str) -> ConductorResult<()> {
        self.queue.lock().abandon(task_id, reason, Utc::now())?;
        warn!(task_id = %task_id, reason = %reason, "Task abandoned");
        Ok(())
    }

    /// Mark a running task completed. Returns the dependents that became
    /// eligible.
    pub fn complete(&self, task_id: TaskId, output: Payload) -> ConductorResult<Vec<TaskId>> {
        let newly = self.queue.lock().complete(task_id, output, Utc::now())?;
        info!(task_id = %task_id, unblocked = newly.len(), "Task completed");
        Ok(newly)
    }

    /// Record a failed attempt; see [`TaskQueue::fail`].
    pub fn fail(&self, task_id: TaskId, message: &str) -> ConductorResult<TaskStatus> {
        self.fail_with_details(task_id, message, None)
    }

    pub fn fail_with_details(
        &self,
        task_id: TaskId,
        message: &str,
        details: Option<serde_json::Value>,
    ) -> ConductorResult<TaskStatus> {
        let status =
            self.queue
                .lock()
                .fail(task_id, message, details, &self.config.retry, Utc::now())?;
        match status {
            TaskStatus::Pending => {
                warn!(task_id = %task_id, error = %message, "Task attempt failed, will retry");
            }
            _ => warn!(task_id = %task_id, error = %message, "Task failed permanently"),
        }
        Ok(status)
    }

    /// Cancel a pending or running task.
    ///
    /// Cancelling a running task only flags it; the worker is expected to
    /// notice and stop.
    pub fn cancel(&self, task_id: TaskId) -> ConductorResult<CancelOutcome> {
        let outcome = self.queue.lock().cancel(task_id, Utc::now())?;
        info!(
            task_id = %task_id,
            was_running = outcome.was_running,
            cascaded = outcome.cascaded.len(),
            "Task cancelled"
        );
        Ok(outcome)
    }

    /// Enforce task timeouts and deadlines.
    pub fn check_timeouts(&self) -> Vec<TimeoutEvent> {
        self.check_timeouts_at(Utc::now())
    }

    pub fn check_timeouts_at(&self, now: DateTime<Utc>) -> Vec<TimeoutEvent> {
        let events = self.queue.lock().check_timeouts(&self.config.retry, now);
        for event in &events {
            warn!(task_id = %event.task_id, status = %event.status, "Task timed out");
        }
        events
    }

    pub fn record_progress(&self, task_id: TaskId, percent: u8, message: &str) -> ConductorResult<()> {
        self.queue
            .lock()
            .record_progress(task_id, percent, message, Utc::now())?;
        debug!(task_id = %task_id, percent, "Task progress");
        Ok(())
    }

    pub fn record_resource_sample(
        &self,
        task_id: TaskId,
        sample: ResourceSample,
    ) -> ConductorResult<()> {
        self.queue.lock().record_resource_sample(task_id, sample)
    }

    /// Snapshot of the task's execution record.
    pub fn get_status(&self, task_id: TaskId) -> Option<TaskExecution> {
        self.queue.lock().get(task_id).cloned()
    }

    pub fn definition(&self, task_id: TaskId) -> Option<TaskDefinition> {
        self.queue.lock().definition(task_id).cloned()
    }

    /// Drop a terminal task's records.
    pub fn retire(&self, task_id: TaskId) -> bool {
        self.queue.lock().retire(task_id)
    }

    /// Tasks currently on record, terminal ones included.
    pub fn tracked_count(&self) -> usize {
        self.queue.lock().total_count()
    }

    /// Ids of tasks that reached a terminal state since the last call.
    pub fn take_finished(&self) -> Vec<TaskId> {
        self.queue.lock().take_finished()
    }

    pub fn is_done(&self) -> bool {
        self.queue.lock().is_done()
    }

    pub fn snapshot(&self) -> SchedulerStats {
        let queue = self.queue.lock();
        let c = queue.counters();
        let pending = queue.count(TaskStatus::Pending);
        let running = queue.count(TaskStatus::Running);
        let terminal = c.completed + c.failed + c.timed_out;
        SchedulerStats {
            submitted: c.submitted,
            rejected: c.rejected,
            pending,
            eligible: queue.eligible_count(),
            delayed: queue.delayed_count(),
            running,
            completed: c.completed,
            failed: c.failed,
            cancelled: c.cancelled,
            timed_out: c.timed_out,
            retries: c.retries,
            success_rate: ratio(c.completed, terminal),
            avg_duration_ms: if c.completed == 0 {
                0.0
            } else {
                c.total_duration_ms as f64 / c.completed as f64
            },
            queue_depth: pending + running,
            unknown_dependencies: queue.unknown_dependencies().len(),
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}
