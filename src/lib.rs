//! workpool - a worker-pool scheduling runtime.
//!
//! A `Pool` admits work (`exec`), dispatches it across a bounded set of
//! worker threads behind a transport abstraction, and carries the ambient
//! machinery a production scheduler needs: retries with backoff, a circuit
//! breaker, work-stealing with affinity routing, health-checked heartbeats,
//! pinned sessions, a batch/parallel executor, a cancelable result
//! primitive, a compact binary wire format, and windowed metrics.
//!
//! The [`pool`] module is the orchestrator; everything else is a piece it
//! composes. See `DESIGN.md` for how each piece traces back to its
//! grounding source.

pub mod affinity;
pub mod batch;
pub mod bitmap;
pub mod circuit;
pub mod config;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod metrics;
pub mod parallel;
pub mod pool;
pub mod promise;
pub mod queue;
pub mod serializer;
pub mod session;
pub mod task;
pub mod transport;
pub mod work_stealing;
pub mod worker;

pub use config::PoolConfig;
pub use error::{FailureKind, PoolError, PoolResult};
pub use metrics::MetricsSnapshot;
pub use pool::{MethodRegistry, ParallelOptions, Pool, PoolStats, ProxyMethod};
pub use promise::PendingResult;
pub use serializer::Value;
pub use session::SessionId;
pub use task::{ExecOptions, Method, Params, RetryOverride, TaskId};
