use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff applied between retried attempts of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RetryPolicy {
    /// No delay between attempts.
    pub fn immediate() -> Self {
        Self {
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    /// Delay before attempt number `next_attempt` (2 for the first retry).
    pub fn delay_for(&self, next_attempt: u32) -> Duration {
        if self.backoff_base_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = next_attempt.saturating_sub(2).min(16);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }

    /// Earliest time the next attempt may start, or `None` for no delay.
    /// Saturates at the latest representable time.
    pub fn not_before(&self, next_attempt: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let delay = self.delay_for(next_attempt);
        if delay.is_zero() {
            return None;
        }
        let due = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d));
        Some(due.unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

/// Settings for the task scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Accept dependencies on tasks that have not been submitted yet.
    #[serde(default = "default_true")]
    pub allow_forward_references: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_timeout_check_interval_ms")]
    pub timeout_check_interval_ms: u64,
    /// Terminal tasks kept on record before the oldest are retired.
    #[serde(default = "default_retain_finished")]
    pub retain_finished: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            allow_forward_references: true,
            retry: RetryPolicy::default(),
            timeout_check_interval_ms: default_timeout_check_interval_ms(),
            retain_finished: default_retain_finished(),
        }
    }
}

/// Settings for the task executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// How long a task may go without any capable worker before it fails.
    #[serde(default = "default_placement_timeout_ms")]
    pub placement_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            placement_timeout_ms: default_placement_timeout_ms(),
        }
    }
}

/// Settings for the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cap on concurrently running steps of any one run, applied on top of
    /// each workflow's own limit.
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
    /// Retry budget for steps that do not declare their own.
    #[serde(default = "default_step_retries")]
    pub default_step_retries: u32,
    /// Finished runs kept on record before the oldest are retired.
    #[serde(default = "default_retain_runs")]
    pub retain_runs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: default_max_parallel_steps(),
            default_step_retries: default_step_retries(),
            retain_runs: default_retain_runs(),
        }
    }
}

/// Top-level orchestrator configuration, usually loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Interval of the background loop that assigns eligible tasks.
    #[serde(default = "default_pump_interval_ms")]
    pub pump_interval_ms: u64,
}

impl OrchestratorConfig {
    /// Parse a TOML document and check value ranges.
    pub fn from_toml(src: &str) -> ConductorResult<Self> {
        let config: OrchestratorConfig =
            toml::from_str(src).map_err(|e| ConductorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConductorResult<()> {
        if self.engine.max_parallel_steps == 0 {
            return Err(ConductorError::Config(
                "engine.max_parallel_steps must be at least 1".into(),
            ));
        }
        if self.pump_interval_ms == 0 || self.scheduler.timeout_check_interval_ms == 0 {
            return Err(ConductorError::Config(
                "loop intervals must be greater than zero".into(),
            ));
        }
        if self.scheduler.retry.backoff_max_ms < self.scheduler.retry.backoff_base_ms {
            return Err(ConductorError::Config(
                "scheduler.retry.backoff_max_ms must be >= backoff_base_ms".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_check_interval_ms() -> u64 {
    250
}

fn default_retain_finished() -> usize {
    1_000
}

fn default_placement_timeout_ms() -> u64 {
    30_000
}

fn default_max_parallel_steps() -> usize {
    4
}

fn default_step_retries() -> u32 {
    2
}

fn default_retain_runs() -> usize {
    256
}

fn default_pump_interval_ms() -> u64 {
    100
}
