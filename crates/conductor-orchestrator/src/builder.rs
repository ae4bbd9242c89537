use crate::condition::Condition;
use crate::workflow::{
    FailureStrategy, StepId, StepKind, WorkflowConfig, WorkflowDefinition, WorkflowStep,
};
use conductor_core::{duration_ms, ConductorError, TaskDefinition};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

/// One problem found while validating a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ValidationIssue {
    EmptyWorkflowName,
    NoSteps,
    EmptyStepId { index: usize },
    EmptyStepName { step: StepId },
    DuplicateStep { step: StepId },
    UnknownReference {
        step: StepId,
        field: String,
        reference: StepId,
    },
    SelfReference { step: StepId },
    Cycle { path: Vec<StepId> },
    Unreachable { step: StepId },
    InvalidTask { step: StepId, reason: String },
    TaskLevelDependencies { step: StepId },
    MultipleGroups { step: StepId },
    InvalidConfig { reason: String },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::EmptyWorkflowName => write!(f, "workflow name must not be empty"),
            ValidationIssue::NoSteps => write!(f, "workflow has no steps"),
            ValidationIssue::EmptyStepId { index } => write!(f, "step #{index} has an empty id"),
            ValidationIssue::EmptyStepName { step } => write!(f, "step '{step}' has an empty name"),
            ValidationIssue::DuplicateStep { step } => write!(f, "duplicate step id '{step}'"),
            ValidationIssue::UnknownReference {
                step,
                field,
                reference,
            } => write!(f, "step '{step}' {field} references unknown step '{reference}'"),
            ValidationIssue::SelfReference { step } => write!(f, "step '{step}' references itself"),
            ValidationIssue::Cycle { path } => write!(f, "dependency cycle: {}", path.join(" -> ")),
            ValidationIssue::Unreachable { step } => {
                write!(f, "step '{step}' is not reachable from any root step")
            }
            ValidationIssue::InvalidTask { step, reason } => {
                write!(f, "step '{step}' has an invalid task: {reason}")
            }
            ValidationIssue::TaskLevelDependencies { step } => write!(
                f,
                "step '{step}' declares task-level dependencies; use depends_on instead"
            ),
            ValidationIssue::MultipleGroups { step } => {
                write!(f, "step '{step}' belongs to more than one parallel group")
            }
            ValidationIssue::InvalidConfig { reason } => write!(f, "invalid config: {reason}"),
        }
    }
}

/// Static checks run before a workflow is accepted by the engine.
pub struct WorkflowValidator;

impl WorkflowValidator {
    /// Run every check and collect all issues.
    pub fn validate(definition: &WorkflowDefinition) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        Self::check_structure(definition, &mut issues);
        let graph = Self::graph(definition);
        if let Some(path) = Self::find_cycle(definition, &graph) {
            issues.push(ValidationIssue::Cycle { path });
        }
        for step in Self::unreachable(definition, &graph) {
            issues.push(ValidationIssue::Unreachable { step });
        }
        issues
    }

    /// Validate and convert the issues into a [`ConductorError`].
    pub fn check(definition: &WorkflowDefinition) -> Result<(), ConductorError> {
        let issues = Self::validate(definition);
        if issues.is_empty() {
            return Ok(());
        }
        Err(ConductorError::InvalidWorkflow {
            workflow: definition.name.clone(),
            issues: issues.iter().map(ToString::to_string).collect(),
        })
    }

    fn check_structure(definition: &WorkflowDefinition, issues: &mut Vec<ValidationIssue>) {
        if definition.name.trim().is_empty() {
            issues.push(ValidationIssue::EmptyWorkflowName);
        }
        if definition.steps.is_empty() {
            issues.push(ValidationIssue::NoSteps);
        }
        if definition.config.max_parallel_steps == 0 {
            issues.push(ValidationIssue::InvalidConfig {
                reason: "max_parallel_steps must be at least 1".into(),
            });
        }
        if let Some(timeout) = definition.config.timeout {
            if timeout.is_zero() {
                issues.push(ValidationIssue::InvalidConfig {
                    reason: "timeout must be greater than zero".into(),
                });
            } else if !duration_ms::is_whole_millis(&timeout) {
                issues.push(ValidationIssue::InvalidConfig {
                    reason: "timeout must be a whole number of milliseconds".into(),
                });
            }
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (index, step) in definition.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                issues.push(ValidationIssue::EmptyStepId { index });
                continue;
            }
            if !seen.insert(step.id.as_str()) {
                issues.push(ValidationIssue::DuplicateStep {
                    step: step.id.clone(),
                });
            }
            if step.name.trim().is_empty() {
                issues.push(ValidationIssue::EmptyStepName {
                    step: step.id.clone(),
                });
            }
            if let StepKind::Task { task } = &step.kind {
                if let Err(ConductorError::InvalidTask { reason, .. }) = task.validate() {
                    issues.push(ValidationIssue::InvalidTask {
                        step: step.id.clone(),
                        reason,
                    });
                }
                if !task.dependencies.is_empty() {
                    issues.push(ValidationIssue::TaskLevelDependencies {
                        step: step.id.clone(),
                    });
                }
            }
        }

        let known: HashSet<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();
        let mut group_of: HashMap<&str, &str> = HashMap::new();
        for step in &definition.steps {
            let mut refs: Vec<(&str, &StepId)> =
                step.depends_on.iter().map(|d| ("depends_on", d)).collect();
            match &step.kind {
                StepKind::Task { .. } => {}
                StepKind::Decision {
                    if_true, if_false, ..
                } => {
                    refs.extend(if_true.iter().map(|r| ("if_true", r)));
                    refs.extend(if_false.iter().map(|r| ("if_false", r)));
                }
                StepKind::ParallelGroup { members, .. } => {
                    refs.extend(members.iter().map(|r| ("members", r)));
                    for member in members {
                        if group_of.insert(member.as_str(), step.id.as_str()).is_some() {
                            issues.push(ValidationIssue::MultipleGroups {
                                step: member.clone(),
                            });
                        }
                    }
                }
            }
            let mut self_ref = false;
            for (field, reference) in refs {
                if reference == &step.id {
                    self_ref = true;
                } else if !known.contains(reference.as_str()) {
                    issues.push(ValidationIssue::UnknownReference {
                        step: step.id.clone(),
                        field: field.to_string(),
                        reference: reference.clone(),
                    });
                }
            }
            if self_ref {
                issues.push(ValidationIssue::SelfReference {
                    step: step.id.clone(),
                });
            }
        }
    }

    /// Effective dependencies restricted to known steps, excluding
    /// self-edges (reported separately). A parallel group also waits on its
    /// members, so a member reaching back to its group closes a cycle.
    fn graph(definition: &WorkflowDefinition) -> HashMap<StepId, Vec<StepId>> {
        let known: HashSet<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();
        let mut graph: HashMap<StepId, Vec<StepId>> = definition
            .effective_dependencies()
            .into_iter()
            .map(|(id, deps)| {
                let deps = deps
                    .into_iter()
                    .filter(|d| d != &id && known.contains(d.as_str()))
                    .collect();
                (id, deps)
            })
            .collect();

        for step in &definition.steps {
            let StepKind::ParallelGroup { members, .. } = &step.kind else {
                continue;
            };
            let Some(deps) = graph.get_mut(&step.id) else {
                continue;
            };
            for member in members {
                if member != &step.id && known.contains(member.as_str()) && !deps.contains(member) {
                    deps.push(member.clone());
                }
            }
        }
        graph
    }

    /// Depth-first search with an explicit recursion stack. Returns the
    /// first cycle found, closed (first id repeated at the end).
    fn find_cycle(
        definition: &WorkflowDefinition,
        graph: &HashMap<StepId, Vec<StepId>>,
    ) -> Option<Vec<StepId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        for start in &definition.steps {
            if marks.contains_key(start.id.as_str()) {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start.id.as_str(), 0)];
            marks.insert(start.id.as_str(), Mark::Visiting);

            while let Some(&(node, next)) = stack.last() {
                let deps = graph.get(node).map(Vec::as_slice).unwrap_or_default();
                match deps.get(next) {
                    Some(dep) => {
                        if let Some(top) = stack.last_mut() {
                            top.1 += 1;
                        }
                        match marks.get(dep.as_str()) {
                            Some(Mark::Visiting) => {
                                let from = stack
                                    .iter()
                                    .position(|(n, _)| *n == dep.as_str())
                                    .unwrap_or(0);
                                let mut path: Vec<StepId> =
                                    stack[from..].iter().map(|(n, _)| n.to_string()).collect();
                                path.push(dep.clone());
                                return Some(path);
                            }
                            Some(Mark::Done) => {}
                            None => {
                                marks.insert(dep.as_str(), Mark::Visiting);
                                stack.push((dep.as_str(), 0));
                            }
                        }
                    }
                    None => {
                        marks.insert(node, Mark::Done);
                        stack.pop();
                    }
                }
            }
        }
        None
    }

    /// Breadth-first traversal from every root along dependent edges.
    fn unreachable(
        definition: &WorkflowDefinition,
        graph: &HashMap<StepId, Vec<StepId>>,
    ) -> Vec<StepId> {
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, deps) in graph {
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
            }
        }

        let mut reached: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = graph
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| id.as_str())
            .collect();
        while let Some(next) = queue.pop_front() {
            if !reached.insert(next) {
                continue;
            }
            if let Some(children) = dependents.get(next) {
                queue.extend(children.iter().copied());
            }
        }

        let mut reported: HashSet<&str> = HashSet::new();
        definition
            .steps
            .iter()
            .filter(|s| !s.id.trim().is_empty())
            .filter(|s| !reached.contains(s.id.as_str()))
            .filter(|s| reported.insert(s.id.as_str()))
            .map(|s| s.id.clone())
            .collect()
    }
}

/// Fluent construction of a [`WorkflowDefinition`].
///
/// ```ignore
/// let wf = WorkflowBuilder::new("release")
///     .task("build", TaskDefinition::new("build", "compile"), NO_DEPS)
///     .task("test", TaskDefinition::new("test", "test"), ["build"])
///     .failure_strategy(FailureStrategy::Stop)
///     .build()?;
/// ```
pub struct WorkflowBuilder {
    definition: WorkflowDefinition,
}

/// Empty dependency list for builder calls.
pub const NO_DEPS: [&str; 0] = [];

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            definition: WorkflowDefinition::new(name),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.definition.description = Some(description.into());
        self
    }

    /// Add a prepared step as is.
    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.definition.steps.push(step);
        self
    }

    pub fn task<D>(self, id: &str, task: TaskDefinition, depends_on: D) -> Self
    where
        D: IntoIterator,
        D::Item: Into<StepId>,
    {
        self.step(WorkflowStep::task(id, task).depends_on(depends_on))
    }

    pub fn decision<T, F, D>(
        self,
        id: &str,
        condition: Condition,
        if_true: T,
        if_false: F,
        depends_on: D,
    ) -> Self
    where
        T: IntoIterator,
        T::Item: Into<StepId>,
        F: IntoIterator,
        F::Item: Into<StepId>,
        D: IntoIterator,
        D::Item: Into<StepId>,
    {
        self.step(WorkflowStep::decision(id, condition, if_true, if_false).depends_on(depends_on))
    }

    pub fn parallel<M, D>(self, id: &str, members: M, wait_for_all: bool, depends_on: D) -> Self
    where
        M: IntoIterator,
        M::Item: Into<StepId>,
        D: IntoIterator,
        D::Item: Into<StepId>,
    {
        self.step(WorkflowStep::parallel(id, members, wait_for_all).depends_on(depends_on))
    }

    pub fn max_parallel(mut self, max: usize) -> Self {
        self.definition.config.max_parallel_steps = max;
        self
    }

    pub fn failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.definition.config.failure_strategy = strategy;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.definition.config.timeout = Some(timeout);
        self
    }

    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.definition.config = config;
        self
    }

    /// Validate and return the definition, or every issue found.
    pub fn build(self) -> Result<WorkflowDefinition, Vec<ValidationIssue>> {
        let issues = WorkflowValidator::validate(&self.definition);
        if issues.is_empty() {
            Ok(self.definition)
        } else {
            Err(issues)
        }
    }
}
