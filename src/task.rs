//! Task abstraction.
//!
//! A Task is the unit of dispatch. Unlike the teacher's build-time
//! `kernel::task::Task` trait (one implementation per program), pool tasks
//! are submitted dynamically: either a registered method name or a
//! serialized function body under the reserved name `"run"`.

use std::fmt;
use std::time::{Duration, Instant};

use crate::promise::Resolver;

/// Unique, pool-scoped, monotonically increasing task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Reserved method name used when a caller submits a serialized function
/// instead of a registered method name.
pub const RUN_METHOD: &str = "run";

/// Either a registered method name, or a serialized function body hosted
/// under [`RUN_METHOD`].
#[derive(Debug, Clone)]
pub enum Method {
    Named(String),
    Function { source: String },
}

impl Method {
    pub fn name(&self) -> &str {
        match self {
            Method::Named(name) => name,
            Method::Function { .. } => RUN_METHOD,
        }
    }
}

impl From<&str> for Method {
    fn from(name: &str) -> Self {
        Method::Named(name.to_string())
    }
}

impl From<String> for Method {
    fn from(name: String) -> Self {
        Method::Named(name)
    }
}

/// One positional argument. The runtime doesn't interpret argument shapes;
/// worker-side method dispatch does.
pub type Params = Vec<crate::serializer::Value>;

/// Per-call retry override (§4.1.1). `None` fields fall back to the pool's
/// configured retry policy; `Disabled` turns retries off entirely for this
/// call.
#[derive(Debug, Clone)]
pub enum RetryOverride {
    Inherit,
    Disabled,
    Custom(crate::config::RetryConfig),
}

/// Fixed set of options recognised on `exec` (spec.md §4.1, §6).
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub timeout_ms: Option<u64>,
    pub transfer_handles: bool,
    pub metadata: Option<serde_json::Value>,
    pub data_transfer: Option<crate::config::DataTransfer>,
    pub estimated_size: Option<usize>,
    pub retry: Option<RetryOverride>,
    pub priority: Option<i32>,
    pub affinity_key: Option<String>,
    pub task_type: Option<String>,
    pub preferred_worker: Option<usize>,
}

/// A dispatchable unit of work. Created by `exec`, mutated only by the
/// dispatcher and the resolver, destroyed on resolution.
pub struct Task {
    pub task_id: TaskId,
    pub method: Method,
    pub params: Params,
    pub resolver: Resolver,
    pub submit_time: Instant,
    pub timeout_ms: Option<u64>,
    pub estimated_size_bytes: usize,
    pub retry: RetryOverride,
    pub priority: i32,
    pub affinity_key: Option<String>,
    pub task_type: Option<String>,
    pub preferred_worker: Option<usize>,
    /// Number of prior attempts for this task (0 on first dispatch).
    pub attempt: u32,
}

impl Task {
    pub fn new(task_id: TaskId, method: Method, params: Params, resolver: Resolver, opts: &ExecOptions) -> Self {
        Task {
            task_id,
            method,
            params,
            resolver,
            submit_time: Instant::now(),
            timeout_ms: opts.timeout_ms,
            estimated_size_bytes: opts.estimated_size.unwrap_or(0),
            retry: opts.retry.clone().unwrap_or(RetryOverride::Inherit),
            priority: opts.priority.unwrap_or(0),
            affinity_key: opts.affinity_key.clone(),
            task_type: opts.task_type.clone(),
            preferred_worker: opts.preferred_worker,
            attempt: 0,
        }
    }

    pub fn age(&self) -> Duration {
        self.submit_time.elapsed()
    }

    /// A queued task is live as long as its resolver hasn't already settled
    /// (e.g. via caller-side cancellation while still waiting to dispatch).
    pub fn is_live(&self) -> bool {
        self.resolver.is_pending()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("task_id", &self.task_id)
            .field("method", &self.method.name())
            .field("priority", &self.priority)
            .field("attempt", &self.attempt)
            .finish()
    }
}
