//! Pool configuration (spec.md §6).
//!
//! `PoolConfig` is `serde`-deserializable with `deny_unknown_fields`, so an
//! unrecognised or inherited option key fails synchronously at
//! construction, matching spec.md's "Unknown or inherited option keys cause
//! a synchronous ValidationError."

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    Auto,
    Thread,
    Process,
    Web,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    Fifo,
    Lifo,
    Priority,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataTransfer {
    Auto,
    Shared,
    Transferable,
    Binary,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMemoryPressure {
    Reject,
    Wait,
    Gc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckAction {
    Warn,
    Restart,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StealPolicy {
    Random,
    RoundRobin,
    BusiestFirst,
    Neighbor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    Central,
    Distributed,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub retry_on: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 0,
            retry_delay_ms: 0,
            backoff_multiplier: 1.0,
            retry_on: Vec::new(),
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `i` (0-indexed, i.e. the first retry is i=0).
    pub fn delay_for_attempt(&self, i: u32) -> std::time::Duration {
        let factor = self.backoff_multiplier.powi(i as i32);
        let ms = (self.retry_delay_ms as f64 * factor).round().max(0.0) as u64;
        std::time::Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub error_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            enabled: false,
            error_threshold: 5,
            reset_timeout_ms: 30_000,
            half_open_requests: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub action: HealthCheckAction,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        HealthCheckConfig {
            enabled: false,
            interval_ms: 10_000,
            timeout_ms: 2_000,
            action: HealthCheckAction::Warn,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct MemoryConfig {
    pub max_queue_memory_bytes: Option<usize>,
    pub on_memory_pressure: OnMemoryPressure,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            max_queue_memory_bytes: None,
            on_memory_pressure: OnMemoryPressure::Reject,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub worker_type: WorkerType,
    pub queue_strategy: QueueStrategy,
    pub max_queue_size: usize,
    pub worker_terminate_timeout_ms: u64,
    pub eager_init: bool,
    pub data_transfer: DataTransfer,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health_check: HealthCheckConfig,
    pub memory: MemoryConfig,
    pub enable_metrics: bool,
    pub metrics_interval_ms: u64,
    pub emit_std_streams: bool,
    pub scheduling_mode: SchedulingMode,
    pub steal_policy: StealPolicy,
    pub imbalance_threshold: f64,
    pub local_queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_workers: 0,
            max_workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            worker_type: WorkerType::Auto,
            queue_strategy: QueueStrategy::Fifo,
            max_queue_size: usize::MAX,
            worker_terminate_timeout_ms: 1_000,
            eager_init: false,
            data_transfer: DataTransfer::Auto,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health_check: HealthCheckConfig::default(),
            memory: MemoryConfig::default(),
            enable_metrics: true,
            metrics_interval_ms: 60_000,
            emit_std_streams: false,
            scheduling_mode: SchedulingMode::Central,
            steal_policy: StealPolicy::Random,
            imbalance_threshold: 2.0,
            local_queue_capacity: 256,
        }
    }
}

impl PoolConfig {
    /// Validate cross-field invariants not expressible via `serde` alone.
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_workers == 0 {
            return Err(PoolError::Validation("max_workers must be >= 1".into()));
        }
        if self.max_workers > crate::bitmap::CAPACITY {
            return Err(PoolError::Validation(format!(
                "max_workers must be <= {} (worker bitmap capacity)",
                crate::bitmap::CAPACITY
            )));
        }
        if self.min_workers > self.max_workers {
            return Err(PoolError::Validation("min_workers must be <= max_workers".into()));
        }
        if !self.local_queue_capacity.is_power_of_two() {
            return Err(PoolError::Validation("local_queue_capacity must be a power of two".into()));
        }
        if self.circuit_breaker.enabled && self.circuit_breaker.error_threshold == 0 {
            return Err(PoolError::Validation("circuit_breaker.error_threshold must be >= 1".into()));
        }
        Ok(())
    }

    /// Parse from a JSON value, rejecting unknown keys (spec.md §6).
    pub fn from_json(value: serde_json::Value) -> PoolResult<Self> {
        let cfg: PoolConfig = serde_json::from_value(value)
            .map_err(|e| PoolError::Validation(format!("invalid pool configuration: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_min_greater_than_max() {
        let mut cfg = PoolConfig::default();
        cfg.min_workers = 10;
        cfg.max_workers = 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_max_workers_past_bitmap_capacity() {
        let mut cfg = PoolConfig::default();
        cfg.max_workers = crate::bitmap::CAPACITY + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        let value = serde_json::json!({ "max_workers": 4, "bogus_option": true });
        assert!(PoolConfig::from_json(value).is_err());
    }

    #[test]
    fn retry_backoff_grows() {
        let retry = RetryConfig {
            max_retries: 3,
            retry_delay_ms: 10,
            backoff_multiplier: 2.0,
            retry_on: vec!["TimeoutError".into()],
        };
        assert_eq!(retry.delay_for_attempt(0).as_millis(), 10);
        assert_eq!(retry.delay_for_attempt(1).as_millis(), 20);
        assert_eq!(retry.delay_for_attempt(2).as_millis(), 40);
    }
}
