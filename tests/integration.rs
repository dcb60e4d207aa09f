//! End-to-end tests exercising `Pool` across admission, retry, circuit
//! breaking, parallel collection ops, session pinning, and the binary
//! serializer, matching the scenarios worked through in spec.md §8.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use workpool::config::{CircuitBreakerConfig, PoolConfig, QueueStrategy, RetryConfig};
use workpool::pool::{MethodRegistry, ParallelOptions};
use workpool::task::ExecOptions;
use workpool::{PoolError, Value};
use workpool::Pool;

fn registry_with_double() -> MethodRegistry {
    let mut methods = MethodRegistry::new();
    methods.register("double", |params: workpool::task::Params| match params.first() {
        Some(Value::F64(n)) => Ok(Value::F64(n * 2.0)),
        _ => Err(PoolError::TypeMismatch("expected a single number".into())),
    });
    methods
}

/// `map`/`filter`/`reduce`/etc. dispatch one chunk per task: the registered
/// method receives `Value::Array(chunk_items)` and must return a
/// `Value::Array` of per-item results, not a single value.
fn registry_with_double_chunk() -> MethodRegistry {
    let mut methods = MethodRegistry::new();
    methods.register("double_chunk", |params: workpool::task::Params| {
        let Some(Value::Array(chunk)) = params.into_iter().next() else {
            return Err(PoolError::TypeMismatch("expected a chunk array".into()));
        };
        let doubled = chunk
            .into_iter()
            .map(|v| match v {
                Value::F64(n) => Value::F64(n * 2.0),
                other => other,
            })
            .collect();
        Ok(Value::Array(doubled))
    });
    methods
}

/// `some`/`every`/`find`/`findIndex` dispatch `[Value::Array(chunk_items),
/// Value::F64(chunk_start_index)]` per chunk and require a
/// `Value::Object{found, index}` reply.
fn registry_with_is_even_indexed() -> MethodRegistry {
    let mut methods = MethodRegistry::new();
    methods.register("is_even_indexed", |params: workpool::task::Params| {
        let mut iter = params.into_iter();
        let (Some(Value::Array(chunk)), Some(Value::F64(start))) = (iter.next(), iter.next()) else {
            return Err(PoolError::TypeMismatch("expected [chunk, start_index]".into()));
        };
        let start = start as usize;
        let hit = chunk.iter().enumerate().find(|(_, v)| matches!(v, Value::F64(n) if *n as i64 % 2 == 0));
        match hit {
            Some((i, _)) => Ok(Value::Object(vec![("found".into(), Value::Bool(true)), ("index".into(), Value::F64((start + i) as f64))])),
            None => Ok(Value::Object(vec![("found".into(), Value::Bool(false)), ("index".into(), Value::F64(0.0))])),
        }
    });
    methods
}

#[test]
fn fifo_submission_order_resolves_in_order() {
    let methods = registry_with_double();
    let pool = Pool::new(PoolConfig { max_workers: 1, queue_strategy: QueueStrategy::Fifo, ..PoolConfig::default() }, methods).unwrap();

    let pendings: Vec<_> = (0..5)
        .map(|i| pool.exec("double", vec![Value::F64(i as f64)], ExecOptions::default()).unwrap())
        .collect();

    for (i, pending) in pendings.into_iter().enumerate() {
        assert_eq!(pending.wait(), Ok(Value::F64(i as f64 * 2.0)));
    }
    pool.terminate(true).unwrap();
}

#[test]
fn queue_full_rejects_synchronously() {
    let methods = registry_with_double();
    let pool = Pool::new(
        PoolConfig { max_workers: 1, max_queue_size: 1, ..PoolConfig::default() },
        methods,
    )
    .unwrap();

    // Saturate the single worker, then fill the one-slot queue.
    let _first = pool.exec("double", vec![Value::F64(1.0)], ExecOptions::default()).unwrap();
    let _queued = pool.exec("double", vec![Value::F64(2.0)], ExecOptions::default()).unwrap();

    let overflow = pool.exec("double", vec![Value::F64(3.0)], ExecOptions::default());
    assert!(matches!(overflow, Err(PoolError::QueueFull { .. })));

    pool.terminate(true).unwrap();
}

#[test]
fn retry_succeeds_after_configured_attempts() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = attempts.clone();
    let mut methods = MethodRegistry::new();
    methods.register("flaky", move |_: workpool::task::Params| {
        let n = counted.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
            Err(PoolError::UserError("not yet".into()))
        } else {
            Ok(Value::Bool(true))
        }
    });

    let pool = Pool::new(
        PoolConfig {
            max_workers: 1,
            retry: RetryConfig { max_retries: 2, retry_delay_ms: 1, backoff_multiplier: 1.0, retry_on: vec!["UserError".into()] },
            ..PoolConfig::default()
        },
        methods,
    )
    .unwrap();

    let pending = pool.exec("flaky", vec![], ExecOptions::default()).unwrap();
    assert_eq!(pending.wait(), Ok(Value::Bool(true)));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    pool.terminate(true).unwrap();
}

#[test]
fn circuit_breaker_opens_then_half_opens_then_closes() {
    let mut methods = MethodRegistry::new();
    methods.register("boom", |_: workpool::task::Params| Err(PoolError::UserError("boom".into())));
    methods.register("ok", |_: workpool::task::Params| Ok(Value::Bool(true)));

    let pool = Pool::new(
        PoolConfig {
            max_workers: 1,
            circuit_breaker: CircuitBreakerConfig { enabled: true, error_threshold: 2, reset_timeout_ms: 20, half_open_requests: 1 },
            ..PoolConfig::default()
        },
        methods,
    )
    .unwrap();

    for _ in 0..2 {
        let pending = pool.exec("boom", vec![], ExecOptions::default()).unwrap();
        assert!(pending.wait().is_err());
    }

    // Circuit is now open: further submissions reject synchronously.
    let rejected = pool.exec("ok", vec![], ExecOptions::default());
    assert!(matches!(rejected, Err(PoolError::CircuitBreaker)));

    // Past the reset timeout, a half-open probe is allowed through and
    // succeeds, closing the circuit again.
    std::thread::sleep(Duration::from_millis(40));
    let pending = pool.exec("ok", vec![], ExecOptions::default()).unwrap();
    assert_eq!(pending.wait(), Ok(Value::Bool(true)));

    pool.terminate(true).unwrap();
}

#[test]
fn parallel_map_preserves_original_order() {
    let methods = registry_with_double_chunk();
    let pool = Pool::new(PoolConfig { max_workers: 4, ..PoolConfig::default() }, methods).unwrap();

    let items: Vec<Value> = (0..20).map(|i| Value::F64(i as f64)).collect();
    let result = pool.map("double_chunk", items, ParallelOptions { chunk_size: Some(3), ..Default::default() }).unwrap();

    let expected: Vec<Value> = (0..20).map(|i| Value::F64(i as f64 * 2.0)).collect();
    assert_eq!(result, expected);

    pool.terminate(true).unwrap();
}

#[test]
fn parallel_find_returns_lowest_matching_index() {
    let methods = registry_with_is_even_indexed();
    let pool = Pool::new(PoolConfig { max_workers: 4, ..PoolConfig::default() }, methods).unwrap();

    let items: Vec<Value> = vec![1.0, 3.0, 4.0, 5.0, 6.0].into_iter().map(Value::F64).collect();
    let index = pool.find_index("is_even_indexed", items, ParallelOptions { chunk_size: Some(1), ..Default::default() }).unwrap();
    assert_eq!(index, Some(2));

    pool.terminate(true).unwrap();
}

#[test]
fn session_pinned_dispatch_reuses_the_same_worker() {
    let mut methods = MethodRegistry::new();
    methods.register("touch", |_: workpool::task::Params| Ok(Value::Bool(true)));
    let pool = Pool::new(PoolConfig { max_workers: 2, ..PoolConfig::default() }, methods).unwrap();

    let session = pool.create_session(Duration::from_secs(5), None).unwrap();
    for _ in 0..3 {
        let pending = pool.exec_in_session(session, "touch", vec![], ExecOptions::default()).unwrap();
        assert_eq!(pending.wait(), Ok(Value::Bool(true)));
    }
    pool.close_session(session);

    pool.terminate(true).unwrap();
}

#[test]
fn binary_serializer_round_trips_a_mixed_object() {
    use workpool::serializer::{deserialize, serialize};

    let value = Value::Object(vec![
        ("name".to_string(), Value::Str("widget".to_string())),
        ("count".to_string(), Value::F64(7.0)),
        ("tags".to_string(), Value::Array(vec![Value::Str("a".into()), Value::Str("b".into())])),
        ("missing".to_string(), Value::Null),
        ("enabled".to_string(), Value::Bool(true)),
    ]);

    let bytes = serialize(&value);
    let decoded = deserialize(&bytes).unwrap();
    assert_eq!(decoded, value);
}
