//! Error taxonomy for the pool.
//!
//! Every fallible public entry point returns `Result<T, PoolError>` (or a
//! narrower leaf type that converts into it via `#[from]`). No trait
//! objects, no `anyhow`. The shape matches the teacher's small hand-rolled
//! error enums (`kernel::pkg::error::PkgError`, `kernel::mount::MountError`),
//! rendered here with `thiserror` derives in the style of a pack example's
//! error modules.

use thiserror::Error;

/// Kinds a task failure can be classified as for retry matching (`retry_on`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Timeout,
    Cancellation,
    Termination,
    WorkerCreation,
    NoWorkersAvailable,
    MethodNotFound,
    TypeMismatch,
    UserError,
}

/// The top-level error type returned by pool operations.
///
/// `Clone` is load-bearing: settled `PendingResult`s hand the same outcome
/// to every subscriber and every `.wait()` caller.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("queue full: {pending}/{max} pending tasks")]
    QueueFull { pending: usize, max: usize },

    #[error("memory pressure: {used} bytes used, {max} byte bound exceeded")]
    MemoryPressure { used: usize, max: usize },

    #[error("circuit breaker is open")]
    CircuitBreaker,

    #[error("task {task_id} timed out after {ms}ms")]
    Timeout { task_id: u64, ms: u64 },

    #[error("task {task_id} was cancelled")]
    Cancellation { task_id: u64 },

    #[error("task {task_id} terminated: {reason}")]
    Termination { task_id: u64, reason: String },

    #[error("failed to create worker: {0}")]
    WorkerCreation(String),

    #[error("no workers available")]
    NoWorkersAvailable,

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("worker user error: {0}")]
    UserError(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] crate::serializer::SerializeError),

    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
}

impl FailureKind {
    /// Name used on the wire (`Value::Error.name`) and in `retry_on` lists,
    /// matching the error-kind names in spec.md §7.
    pub fn wire_name(self) -> &'static str {
        match self {
            FailureKind::Timeout => "TimeoutError",
            FailureKind::Cancellation => "CancellationError",
            FailureKind::Termination => "TerminationError",
            FailureKind::WorkerCreation => "WorkerCreationError",
            FailureKind::NoWorkersAvailable => "NoWorkersAvailableError",
            FailureKind::MethodNotFound => "MethodNotFoundError",
            FailureKind::TypeMismatch => "TypeMismatchError",
            FailureKind::UserError => "UserError",
        }
    }
}

impl PoolError {
    /// Classify this error for the retry engine's `retry_on` matching.
    pub fn kind(&self) -> FailureKind {
        match self {
            PoolError::Timeout { .. } => FailureKind::Timeout,
            PoolError::Cancellation { .. } => FailureKind::Cancellation,
            PoolError::Termination { .. } => FailureKind::Termination,
            PoolError::WorkerCreation(_) => FailureKind::WorkerCreation,
            PoolError::NoWorkersAvailable => FailureKind::NoWorkersAvailable,
            PoolError::MethodNotFound(_) => FailureKind::MethodNotFound,
            PoolError::TypeMismatch(_) => FailureKind::TypeMismatch,
            _ => FailureKind::UserError,
        }
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_timeout() {
        let e = PoolError::Timeout { task_id: 1, ms: 50 };
        assert_eq!(e.kind(), FailureKind::Timeout);
    }

    #[test]
    fn kind_defaults_to_user_error() {
        let e = PoolError::UserError("boom".into());
        assert_eq!(e.kind(), FailureKind::UserError);
    }
}
