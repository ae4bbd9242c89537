use crate::ConductorResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Lifecycle phase a handler is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Startup,
    Shutdown,
}

/// Context passed to every handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleContext {
    pub phase: LifecyclePhase,
    pub at: DateTime<Utc>,
    /// Flat statistics snapshot taken just before the handlers run.
    #[serde(default)]
    pub stats: std::collections::BTreeMap<String, serde_json::Value>,
}

/// A startup or shutdown hook.
pub trait LifecycleHandler: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    fn invoke(&self, ctx: &LifecycleContext) -> ConductorResult<()>;
}

struct Registered {
    priority: i32,
    seq: u64,
    handler: Arc<dyn LifecycleHandler>,
}

/// Ordered list of handlers for one phase.
///
/// Handlers run in ascending `priority`; equal priorities run in the order
/// they were registered.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Registered>,
    next_seq: u64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler with an explicit sort key.
    pub fn register(&mut self, priority: i32, handler: Arc<dyn LifecycleHandler>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.handlers.push(Registered {
            priority,
            seq,
            handler,
        });
        self.handlers.sort_by_key(|r| (r.priority, r.seq));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handler names in invocation order.
    pub fn names(&self) -> Vec<String> {
        self.handlers
            .iter()
            .map(|r| r.handler.name().to_string())
            .collect()
    }

    /// Invoke every handler in order, stopping at the first error.
    pub fn invoke_all(&self, ctx: &LifecycleContext) -> ConductorResult<()> {
        for registered in &self.handlers {
            info!(handler = registered.handler.name(), phase = ?ctx.phase, "Invoking lifecycle handler");
            registered.handler.invoke(ctx)?;
        }
        Ok(())
    }

    /// Invoke every handler, logging failures instead of stopping.
    /// Returns the number of handlers that failed.
    pub fn invoke_all_lenient(&self, ctx: &LifecycleContext) -> usize {
        let mut failures = 0;
        for registered in &self.handlers {
            if let Err(e) = registered.handler.invoke(ctx) {
                warn!(handler = registered.handler.name(), error = %e, "Lifecycle handler failed");
                failures += 1;
            }
        }
        failures
    }
}
