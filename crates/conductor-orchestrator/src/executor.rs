use crate::config::ExecutorConfig;
use crate::dispatch::{AttemptRef, DispatchOutcome, Dispatcher};
use crate::monitor::{flatten, StatsMap};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult, TaskDefinition, TaskId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Declaration a worker registers with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Task types the worker accepts. Empty means any type.
    #[serde(default)]
    pub task_types: Vec<String>,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    1
}

impl WorkerSpec {
    pub fn new<I, S>(id: impl Into<String>, capabilities: I, capacity: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            task_types: Vec::new(),
            capacity,
        }
    }

    /// Restrict the worker to the given task types.
    pub fn with_task_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task_types = types.into_iter().map(Into::into).collect();
        self
    }
}

/// Public view of a registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub capabilities: Vec<String>,
    pub task_types: Vec<String>,
    pub capacity: usize,
    pub assigned: Vec<TaskId>,
    pub available: usize,
    pub registered_at: DateTime<Utc>,
}

/// An assignment that holds a worker slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub task_id: TaskId,
    pub worker_id: String,
    pub attempt: u32,
    pub assigned_at: DateTime<Utc>,
}

impl Placement {
    pub fn attempt_ref(&self) -> AttemptRef {
        AttemptRef {
            task_id: self.task_id,
            worker_id: self.worker_id.clone(),
            attempt: self.attempt,
        }
    }

    fn matches(&self, attempt: &AttemptRef) -> bool {
        self.task_id == attempt.task_id
            && self.worker_id == attempt.worker_id
            && self.attempt == attempt.attempt
    }
}

struct WorkerRecord {
    capabilities: BTreeSet<String>,
    task_types: BTreeSet<String>,
    capacity: usize,
    assigned: BTreeSet<TaskId>,
    seq: u64,
    registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    fn available(&self) -> usize {
        self.capacity.saturating_sub(self.assigned.len())
    }

    fn can_run(&self, task: &TaskDefinition) -> bool {
        let types_ok = self.task_types.is_empty() || self.task_types.contains(&task.task_type);
        types_ok
            && task
                .required_capabilities
                .iter()
                .all(|c| self.capabilities.contains(c))
    }
}

#[derive(Default)]
struct Counters {
    assigned: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    duplicate_completions: u64,
    workers_lost: u64,
    no_capable_worker: u64,
    no_capacity: u64,
    dispatch_rejected: u64,
}

#[derive(Default)]
struct Registry {
    workers: HashMap<String, WorkerRecord>,
    in_flight: HashMap<TaskId, Placement>,
    next_seq: u64,
    counters: Counters,
}

impl Registry {
    /// Most remaining capacity wins, ties go to the earliest registration.
    fn select(&mut self, task: &TaskDefinition) -> ConductorResult<String> {
        let capable: Vec<(&String, &WorkerRecord)> = self
            .workers
            .iter()
            .filter(|(_, w)| w.can_run(task))
            .collect();
        if capable.is_empty() {
            self.counters.no_capable_worker += 1;
            let mut required = task.required_capabilities.clone();
            required.push(format!("type:{}", task.task_type));
            return Err(ConductorError::NoCapableWorker {
                task_id: task.id,
                required,
            });
        }
        let best = capable
            .iter()
            .filter(|(_, w)| w.available() > 0)
            .max_by(|(_, a), (_, b)| {
                a.available()
                    .cmp(&b.available())
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|(id, _)| (*id).clone());
        match best {
            Some(id) => Ok(id),
            None => {
                let count = capable.len();
                self.counters.no_capacity += 1;
                Err(ConductorError::NoCapacity {
                    task_id: task.id,
                    capable: count,
                })
            }
        }
    }

    /// Release the slot only if `attempt` is the one currently placed.
    fn release_attempt(&mut self, attempt: &AttemptRef) -> Option<Placement> {
        if !self
            .in_flight
            .get(&attempt.task_id)
            .is_some_and(|p| p.matches(attempt))
        {
            return None;
        }
        self.release(attempt.task_id)
    }

    fn release(&mut self, task_id: TaskId) -> Option<Placement> {
        let placement = self.in_flight.remove(&task_id)?;
        if let Some(worker) = self.workers.get_mut(&placement.worker_id) {
            worker.assigned.remove(&task_id);
        }
        Some(placement)
    }
}

/// Point-in-time executor statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub workers: usize,
    pub total_capacity: usize,
    pub available_capacity: usize,
    pub in_flight: usize,
    pub assigned: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Duplicate results and late results from attempts no longer placed.
    pub duplicate_completions: u64,
    pub workers_lost: u64,
    pub no_capable_worker: u64,
    pub no_capacity: u64,
    pub dispatch_rejected: u64,
}

impl ExecutorStats {
    pub fn to_map(&self) -> StatsMap {
        flatten("executor", self)
    }
}

/// Matches tasks to capable workers and enforces per-worker capacity.
///
/// Slots are reserved under the registry lock; the dispatcher is always
/// called after the lock is released.
pub struct TaskExecutor {
    registry: Mutex<Registry>,
    dispatcher: Arc<dyn Dispatcher>,
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, config: ExecutorConfig) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Register a worker that accepts any task type.
    pub fn register_worker<I, S>(&self, id: &str, capabilities: I, capacity: usize) -> ConductorResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register(WorkerSpec::new(id, capabilities, capacity))
    }

    pub fn register(&self, spec: WorkerSpec) -> ConductorResult<()> {
        if spec.id.trim().is_empty() {
            return Err(ConductorError::Config("worker id must not be empty".into()));
        }
        if spec.capacity == 0 {
            return Err(ConductorError::Config(format!(
                "worker {} must have a capacity of at least 1",
                spec.id
            )));
        }
        let mut registry = self.registry.lock();
        if registry.workers.contains_key(&spec.id) {
            return Err(ConductorError::Config(format!(
                "worker {} is already registered",
                spec.id
            )));
        }
        let seq = registry.next_seq;
        registry.next_seq += 1;
        registry.workers.insert(
            spec.id.clone(),
            WorkerRecord {
                capabilities: spec.capabilities.iter().cloned().collect(),
                task_types: spec.task_types.iter().cloned().collect(),
                capacity: spec.capacity,
                assigned: BTreeSet::new(),
                seq,
                registered_at: Utc::now(),
            },
        );
        drop(registry);
        info!(worker = %spec.id, capacity = spec.capacity, capabilities = ?spec.capabilities, "Worker registered");
        Ok(())
    }

    /// Remove a worker. Returns the tasks it was holding; the caller is
    /// responsible for routing them through the retry path.
    pub fn unregister_worker(&self, id: &str) -> ConductorResult<Vec<TaskId>> {
        let mut registry = self.registry.lock();
        let worker = registry
            .workers
            .remove(id)
            .ok_or_else(|| ConductorError::not_found("worker", id))?;
        let lost: Vec<TaskId> = worker.assigned.into_iter().collect();
        for task_id in &lost {
            registry.in_flight.remove(task_id);
        }
        if !lost.is_empty() {
            registry.counters.workers_lost += 1;
        }
        drop(registry);
        if lost.is_empty() {
            info!(worker = %id, "Worker unregistered");
        } else {
            warn!(worker = %id, lost = lost.len(), "Worker lost with tasks in flight");
        }
        Ok(lost)
    }

    /// Reserve a slot on the best capable worker without dispatching.
    pub fn reserve(&self, task: &TaskDefinition, attempt: u32) -> ConductorResult<Placement> {
        let mut registry = self.registry.lock();
        if let Some(existing) = registry.in_flight.get(&task.id) {
            return Err(ConductorError::InvalidTransition {
                id: task.id.to_string(),
                status: format!("assigned to {}", existing.worker_id),
                action: "assign".into(),
            });
        }
        let worker_id = registry.select(task)?;
        let placement = Placement {
            task_id: task.id,
            worker_id: worker_id.clone(),
            attempt,
            assigned_at: Utc::now(),
        };
        if let Some(worker) = registry.workers.get_mut(&worker_id) {
            worker.assigned.insert(task.id);
        }
        registry.in_flight.insert(task.id, placement.clone());
        Ok(placement)
    }

    /// Hand a reserved task to its worker. A rejection frees the slot.
    pub async fn dispatch(&self, task: &TaskDefinition, placement: &Placement) -> ConductorResult<()> {
        let outcome = self
            .dispatcher
            .dispatch(&placement.worker_id, task, placement.attempt)
            .await;
        match outcome {
            DispatchOutcome::Accepted => {
                self.registry.lock().counters.assigned += 1;
                info!(
                    task_id = %task.id,
                    worker = %placement.worker_id,
                    attempt = placement.attempt,
                    "Task dispatched"
                );
                Ok(())
            }
            DispatchOutcome::Rejected(reason) => {
                {
                    let mut registry = self.registry.lock();
                    if registry
                        .in_flight
                        .get(&task.id)
                        .is_some_and(|p| p.worker_id == placement.worker_id)
                    {
                        registry.release(task.id);
                    }
                    registry.counters.dispatch_rejected += 1;
                }
                warn!(task_id = %task.id, worker = %placement.worker_id, reason = %reason, "Dispatch rejected");
                Err(ConductorError::DispatchRejected {
                    task_id: task.id,
                    worker_id: placement.worker_id.clone(),
                    reason,
                })
            }
        }
    }

    /// Pick a worker for `task` and dispatch it.
    pub async fn execute(&self, task: &TaskDefinition, attempt: u32) -> ConductorResult<Placement> {
        let placement = self.reserve(task, attempt)?;
        self.dispatch(task, &placement).await?;
        Ok(placement)
    }

    /// Release the slot held by a finished attempt. A second call, or a
    /// result from an attempt that is no longer placed, is a no-op that
    /// returns `None`.
    pub fn complete_execution(&self, attempt: &AttemptRef) -> Option<Placement> {
        let mut registry = self.registry.lock();
        match registry.release_attempt(attempt) {
            Some(placement) => {
                registry.counters.completed += 1;
                Some(placement)
            }
            None => {
                registry.counters.duplicate_completions += 1;
                drop(registry);
                warn!(
                    task_id = %attempt.task_id,
                    worker = %attempt.worker_id,
                    attempt = attempt.attempt,
                    "Completion for attempt with no active assignment ignored"
                );
                None
            }
        }
    }

    /// Release the slot held by a failed attempt. Idempotent like
    /// [`complete_execution`](Self::complete_execution).
    pub fn fail_execution(&self, attempt: &AttemptRef, message: &str) -> Option<Placement> {
        let mut registry = self.registry.lock();
        match registry.release_attempt(attempt) {
            Some(placement) => {
                registry.counters.failed += 1;
                drop(registry);
                warn!(task_id = %attempt.task_id, worker = %placement.worker_id, error = %message, "Execution failed");
                Some(placement)
            }
            None => {
                registry.counters.duplicate_completions += 1;
                drop(registry);
                warn!(
                    task_id = %attempt.task_id,
                    worker = %attempt.worker_id,
                    attempt = attempt.attempt,
                    "Failure for attempt with no active assignment ignored"
                );
                None
            }
        }
    }

    /// Release the slot and ask the worker to stop.
    pub async fn cancel_execution(&self, task_id: TaskId) -> Option<Placement> {
        let placement = {
            let mut registry = self.registry.lock();
            let placement = registry.release(task_id)?;
            registry.counters.cancelled += 1;
            placement
        };
        self.dispatcher.cancel(&placement.worker_id, task_id).await;
        info!(task_id = %task_id, worker = %placement.worker_id, "Execution cancelled");
        Some(placement)
    }

    /// Drop a slot without touching any counter, e.g. after a timeout the
    /// scheduler already recorded.
    pub fn release(&self, task_id: TaskId) -> Option<Placement> {
        self.registry.lock().release(task_id)
    }

    pub fn assignment(&self, task_id: TaskId) -> Option<Placement> {
        self.registry.lock().in_flight.get(&task_id).cloned()
    }

    /// Whether any registered worker could ever run `task`.
    pub fn has_capable_worker(&self, task: &TaskDefinition) -> bool {
        self.registry.lock().workers.values().any(|w| w.can_run(task))
    }

    pub fn worker(&self, id: &str) -> Option<WorkerInfo> {
        let registry = self.registry.lock();
        registry.workers.get(id).map(|w| worker_info(id, w))
    }

    /// Registered workers in registration order.
    pub fn workers(&self) -> Vec<WorkerInfo> {
        let registry = self.registry.lock();
        let mut records: Vec<(&String, &WorkerRecord)> = registry.workers.iter().collect();
        records.sort_by_key(|(_, w)| w.seq);
        records.into_iter().map(|(id, w)| worker_info(id, w)).collect()
    }

    pub fn snapshot(&self) -> ExecutorStats {
        let registry = self.registry.lock();
        let c = &registry.counters;
        ExecutorStats {
            workers: registry.workers.len(),
            total_capacity: registry.workers.values().map(|w| w.capacity).sum(),
            available_capacity: registry.workers.values().map(WorkerRecord::available).sum(),
            in_flight: registry.in_flight.len(),
            assigned: c.assigned,
            completed: c.completed,
            failed: c.failed,
            cancelled: c.cancelled,
            duplicate_completions: c.duplicate_completions,
            workers_lost: c.workers_lost,
            no_capable_worker: c.no_capable_worker,
            no_capacity: c.no_capacity,
            dispatch_rejected: c.dispatch_rejected,
        }
    }
}

fn worker_info(id: &str, w: &WorkerRecord) -> WorkerInfo {
    WorkerInfo {
        id: id.to_string(),
        capabilities: w.capabilities.iter().cloned().collect(),
        task_types: w.task_types.iter().cloned().collect(),
        capacity: w.capacity,
        assigned: w.assigned.iter().copied().collect(),
        available: w.available(),
        registered_at: w.registered_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct AcceptAll;

    #[async_trait]
    impl Dispatcher for AcceptAll {
        async fn dispatch(&self, _: &str, _: &TaskDefinition, _: u32) -> DispatchOutcome {
            DispatchOutcome::Accepted
        }
    }

    struct RejectAll;

    #[async_trait]
    impl Dispatcher for RejectAll {
        async fn dispatch(&self, _: &str, _: &TaskDefinition, _: u32) -> DispatchOutcome {
            DispatchOutcome::Rejected("busy".into())
        }
    }

    fn executor() -> TaskExecutor {
        TaskExecutor::new(Arc::new(AcceptAll), ExecutorConfig::default())
    }

    #[tokio::test]
    async fn test_least_loaded_then_registration_order() {
        let exec = executor();
        exec.register_worker("w1", ["x"], 2).unwrap();
        exec.register_worker("w2", ["x"], 2).unwrap();
        let task = || TaskDefinition::new("t", "job").with_capabilities(["x"]);

        // equal capacity: registration order
        assert_eq!(exec.execute(&task(), 1).await.unwrap().worker_id, "w1");
        // w2 now has more room
        assert_eq!(exec.execute(&task(), 1).await.unwrap().worker_id, "w2");
        assert_eq!(exec.execute(&task(), 1).await.unwrap().worker_id, "w1");
        assert_eq!(exec.execute(&task(), 1).await.unwrap().worker_id, "w2");

        let err = exec.execute(&task(), 1).await.unwrap_err();
        assert!(matches!(err, ConductorError::NoCapacity { capable: 2, .. }));
    }

    #[tokio::test]
    async fn test_capability_superset_and_task_types() {
        let exec = executor();
        exec.register(WorkerSpec::new("gpu", ["gpu", "x"], 1).with_task_types(["train"]))
            .unwrap();
        exec.register_worker("cpu", ["x"], 1).unwrap();

        let train = TaskDefinition::new("t", "train").with_capabilities(["gpu"]);
        assert_eq!(exec.execute(&train, 1).await.unwrap().worker_id, "gpu");

        let infer = TaskDefinition::new("i", "infer").with_capabilities(["gpu"]);
        let err = exec.execute(&infer, 1).await.unwrap_err();
        assert!(matches!(err, ConductorError::NoCapableWorker { .. }));
        assert_eq!(exec.snapshot().no_capable_worker, 1);
    }

    #[tokio::test]
    async fn test_completion_is_idempotent() {
        let exec = executor();
        exec.register_worker("w1", Vec::<String>::new(), 1).unwrap();
        let task = TaskDefinition::new("t", "x");
        let placement = exec.execute(&task, 1).await.unwrap();

        assert!(exec.complete_execution(&placement.attempt_ref()).is_some());
        assert!(exec.complete_execution(&placement.attempt_ref()).is_none());
        let stats = exec.snapshot();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.duplicate_completions, 1);
        assert_eq!(stats.available_capacity, 1);
    }

    #[tokio::test]
    async fn test_rejection_releases_slot() {
        let exec = TaskExecutor::new(Arc::new(RejectAll), ExecutorConfig::default());
        exec.register_worker("w1", Vec::<String>::new(), 1).unwrap();
        let task = TaskDefinition::new("t", "x");
        let err = exec.execute(&task, 1).await.unwrap_err();
        assert!(matches!(err, ConductorError::DispatchRejected { .. }));
        assert!(err.is_retryable());
        assert!(exec.assignment(task.id).is_none());
        assert_eq!(exec.snapshot().available_capacity, 1);
    }

    #[tokio::test]
    async fn test_unregister_returns_lost_tasks() {
        let exec = executor();
        exec.register_worker("w1", Vec::<String>::new(), 2).unwrap();
        let a = TaskDefinition::new("a", "x");
        let b = TaskDefinition::new("b", "x");
        let placed_a = exec.execute(&a, 1).await.unwrap();
        exec.execute(&b, 1).await.unwrap();

        let mut lost = exec.unregister_worker("w1").unwrap();
        lost.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(lost, expected);
        assert_eq!(exec.snapshot().workers_lost, 1);
        assert!(exec.complete_execution(&placed_a.attempt_ref()).is_none());
        assert!(exec.unregister_worker("w1").is_err());
    }

    #[tokio::test]
    async fn test_result_from_earlier_attempt_keeps_current_slot() {
        let exec = executor();
        exec.register_worker("a", Vec::<String>::new(), 1).unwrap();
        let task = TaskDefinition::new("t", "x");
        let first = exec.execute(&task, 1).await.unwrap();
        assert_eq!(first.worker_id, "a");

        // attempt 1 timed out; attempt 2 lands on a roomier worker
        exec.release(task.id);
        exec.register_worker("b", Vec::<String>::new(), 2).unwrap();
        let second = exec.execute(&task, 2).await.unwrap();
        assert_eq!(second.worker_id, "b");

        assert!(exec.complete_execution(&first.attempt_ref()).is_none());
        assert!(exec.fail_execution(&first.attempt_ref(), "late").is_none());
        assert_eq!(exec.assignment(task.id), Some(second.clone()));
        assert_eq!(exec.worker("b").unwrap().available, 1);
        assert_eq!(exec.snapshot().duplicate_completions, 2);

        let wrong_attempt = AttemptRef {
            attempt: 1,
            ..second.attempt_ref()
        };
        assert!(exec.complete_execution(&wrong_attempt).is_none());
        assert!(exec.complete_execution(&second.attempt_ref()).is_some());
        assert_eq!(exec.worker("b").unwrap().available, 2);
    }

    #[test]
    fn test_register_validation() {
        let exec = executor();
        assert!(exec.register_worker("w", ["x"], 0).is_err());
        exec.register_worker("w", ["x"], 1).unwrap();
        assert!(exec.register_worker("w", ["x"], 1).is_err());
        assert_eq!(exec.workers().len(), 1);
    }

    #[tokio::test]
    async fn test_reserve_twice_is_rejected() {
        let exec = executor();
        exec.register_worker("w", Vec::<String>::new(), 2).unwrap();
        let task = TaskDefinition::new("t", "x");
        exec.reserve(&task, 1).unwrap();
        assert!(exec.reserve(&task, 1).is_err());
        assert_eq!(exec.worker("w").unwrap().available, 1);
    }
}
