//! Pool Orchestrator (spec.md §4.1): the single coordinating point for
//! admission, retry, circuit breaking, health checks, and dispatch.
//!
//! Grounded on `kernel::executor::Executor`'s single-threaded tick loop,
//! generalised from "poll every registered future once" to "poll every
//! worker connection once, then run the admission/retry/health-check
//! housekeeping, then dispatch as much queued work as there is capacity
//! for" — the same one-thread-owns-all-mutable-state shape, just ticking
//! over `Transport` connections instead of `Future`s (spec.md §16's
//! "single orchestrator thread" redesign).
//!
//! All mutable scheduling state lives behind one `parking_lot::Mutex`,
//! exactly the way `kernel::process::Table` guards the process table: the
//! calling thread performs the synchronous half of admission itself (under
//! the lock) and the background reactor thread performs dispatch and
//! worker-response handling, woken by a `Condvar` rather than busy-polling.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use slab::Slab;

use crate::affinity::AffinityRouter;
use crate::batch::{BatchExecutor, BatchOptions, BatchResult};
use crate::bitmap::WorkerBitmap;
use crate::circuit::{CircuitBreaker, CircuitState, Transition as CircuitTransition};
use crate::config::{OnMemoryPressure, PoolConfig, QueueStrategy, SchedulingMode, WorkerType};
use crate::error::{PoolError, PoolResult};
use crate::events::{EventBus, PoolEvent, SubscriptionId};
use crate::heartbeat::{HealthOutcome, HeartbeatMonitor};
use crate::metrics::Metrics;
use crate::parallel;
use crate::promise::{defer, PendingResult, Resolver};
use crate::queue::{self, TaskQueueStrategy};
use crate::serializer::{self, Value};
use crate::session::{SessionId, SessionManager};
use crate::task::{ExecOptions, Method, Params, RetryOverride, Task, TaskId};
use crate::transport::{Frame, FrameKind, ThreadTransport, Transport, WorkerConn, WorkerParams};
use crate::work_stealing::{self, Scheduler};
use crate::worker::WorkerHandle;

/// A worker-side method implementation. The registry is the orchestrator's
/// stand-in for the out-of-scope worker runtime (`Transport::spawn`'s
/// `WorkerParams.handler` doc comment): rather than the original's
/// eval-a-serialized-function model, every worker thread shares one
/// `MethodRegistry` and looks functions up by name.
pub type MethodFn = Arc<dyn Fn(Params) -> PoolResult<Value> + Send + Sync>;

/// A caller-facing proxy call bound to one method name (spec.md §4.1
/// `proxy()`): `(params) -> PendingResult`.
pub type ProxyMethod = Arc<dyn Fn(Params) -> PoolResult<PendingResult> + Send + Sync>;

/// Methods a pool's workers can execute, keyed by name (spec.md §4.1
/// `get_capabilities`). `Method::Function` (a serialized function body)
/// dispatches through [`crate::task::RUN_METHOD`], which a caller may also
/// register directly if it wants to support that path.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, MethodFn>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        MethodRegistry::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Params) -> PoolResult<Value> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(f));
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    fn get(&self, name: &str) -> Option<MethodFn> {
        self.methods.get(name).cloned()
    }
}

/// Build the shared worker-side handler closure from a method registry.
/// `Frame` carries no method-name field (`crate::transport`'s doc comment),
/// so the call envelope is `Value::Array([Value::Str(name), Value::Array(params)])`
/// and this is the one place that convention is encoded and decoded.
fn make_handler(methods: MethodRegistry) -> Arc<dyn Fn(Frame) -> Frame + Send + Sync> {
    Arc::new(move |frame: Frame| match frame.kind {
        FrameKind::Call => {
            let task_id = frame.task_id.expect("call frame always carries a task_id");
            match dispatch_call(&methods, &frame.payload) {
                Ok(value) => Frame::result(task_id, serializer::serialize(&value)),
                Err(err) => {
                    let wire = Value::Error { name: err.kind().wire_name().to_string(), message: err.to_string() };
                    Frame::error(task_id, serializer::serialize(&wire))
                }
            }
        }
        FrameKind::Heartbeat => Frame::heartbeat(),
        // Cooperative cancellation has no worker-side effect to perform here
        // (spec.md §1 excludes a concrete worker runtime); echoing a
        // heartbeat keeps the connection's frame stream well-formed without
        // being mistaken for a real task result.
        FrameKind::Cancel => Frame::heartbeat(),
        FrameKind::Result | FrameKind::Error | FrameKind::Shutdown => Frame::heartbeat(),
    })
}

fn dispatch_call(methods: &MethodRegistry, payload: &[u8]) -> PoolResult<Value> {
    let envelope = serializer::deserialize(payload)?;
    let Value::Array(mut parts) = envelope else {
        return Err(PoolError::TypeMismatch("call envelope must be a 2-element array".into()));
    };
    if parts.len() != 2 {
        return Err(PoolError::TypeMismatch("call envelope must be [name, params]".into()));
    }
    let params_value = parts.pop().unwrap();
    let name_value = parts.pop().unwrap();
    let Value::Str(name) = name_value else {
        return Err(PoolError::TypeMismatch("call envelope name must be a string".into()));
    };
    let Value::Array(params) = params_value else {
        return Err(PoolError::TypeMismatch("call envelope params must be an array".into()));
    };
    let method = methods.get(&name).ok_or_else(|| PoolError::MethodNotFound(name.clone()))?;
    method(params)
}

fn encode_call(task: &Task) -> Vec<u8> {
    let name = task.method.name().to_string();
    let params = match &task.method {
        Method::Named(_) => task.params.clone(),
        Method::Function { source } => {
            let mut with_source = Vec::with_capacity(task.params.len() + 1);
            with_source.push(Value::Str(source.clone()));
            with_source.extend(task.params.iter().cloned());
            with_source
        }
    };
    serializer::serialize(&Value::Array(vec![Value::Str(name), Value::Array(params)]))
}

fn decode_outcome(frame: &Frame) -> Result<Value, PoolError> {
    let value = serializer::deserialize(&frame.payload)?;
    match frame.kind {
        FrameKind::Result => Ok(value),
        FrameKind::Error => Err(error_from_wire(value)),
        _ => unreachable!("decode_outcome only called for Result/Error frames"),
    }
}

fn error_from_wire(value: Value) -> PoolError {
    let Value::Error { name, message } = value else {
        return PoolError::UserError("worker returned a malformed error".into());
    };
    match name.as_str() {
        "TimeoutError" => PoolError::Timeout { task_id: 0, ms: 0 },
        "MethodNotFoundError" => PoolError::MethodNotFound(message),
        "TypeMismatchError" => PoolError::TypeMismatch(message),
        _ => PoolError::UserError(message),
    }
}

fn ts_ms(now: Instant, epoch: Instant, epoch_unix_ms: f64) -> f64 {
    epoch_unix_ms + now.duration_since(epoch).as_secs_f64() * 1000.0
}

const REACTOR_TICK: Duration = Duration::from_millis(2);
const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;
const DEFAULT_AFFINITY_TTL: Duration = Duration::from_secs(300);
const METRICS_WINDOW: Duration = Duration::from_secs(300);

struct InFlight {
    task: Task,
    worker_index: usize,
    dispatched_at: Instant,
    deadline: Option<Instant>,
}

struct RetryEntry {
    due: Instant,
    task: Task,
}

impl PartialEq for RetryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}
impl Eq for RetryEntry {}
impl PartialOrd for RetryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for RetryEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due)
    }
}

/// A point-in-time snapshot returned by [`Pool::stats`] (spec.md §6).
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub pending_tasks: usize,
    pub in_flight_tasks: usize,
    pub circuit_state: CircuitState,
    pub estimated_queue_memory_bytes: usize,
    pub active_sessions: usize,
}

/// Options for a chunked collection operation (spec.md §4.8); `None` picks
/// the per-operation default from [`parallel::default_chunk_size`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelOptions {
    pub chunk_size: Option<usize>,
    pub concurrency: Option<usize>,
    /// `fail_fast` for `some`/`every`/`find`/`findIndex` (spec.md §4.8):
    /// cancel remaining chunks once the answer is decided. `None` defaults
    /// to `true`; `count` ignores this, since it needs every chunk.
    pub short_circuit: Option<bool>,
}

struct Inner {
    workers: Slab<WorkerHandle>,
    bitmap: WorkerBitmap,
    scheduler: Option<Scheduler>,
    central_queue: Box<dyn TaskQueueStrategy>,
    circuit: CircuitBreaker,
    affinity: AffinityRouter,
    heartbeat: HeartbeatMonitor,
    sessions: SessionManager,
    metrics: Metrics,
    events: EventBus,
    estimated_memory: usize,
    next_task_id: u64,
    in_flight: HashMap<TaskId, InFlight>,
    pending_retries: BinaryHeap<Reverse<RetryEntry>>,
    /// Workers reserved by an open [`Session`](crate::session::Session):
    /// excluded from general idle-worker selection until the session closes
    /// (spec.md §3 invariant: a session's worker never serves other work).
    session_workers: HashMap<usize, SessionId>,
    terminating: bool,
    terminated: bool,
}

impl Inner {
    fn pending_count(&self, mode: SchedulingMode) -> usize {
        match mode {
            SchedulingMode::Central => self.central_queue.size(),
            SchedulingMode::Distributed => self.scheduler.as_ref().map(Scheduler::total_pending).unwrap_or(0),
        }
    }

    fn total_workers(&self) -> usize {
        self.workers.len()
    }

    fn idle_workers(&self) -> usize {
        self.workers.iter().filter(|(_, w)| w.is_idle()).count()
    }
}

struct PoolInner {
    config: PoolConfig,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn Fn(Frame) -> Frame + Send + Sync>,
    methods: MethodRegistry,
    state: Mutex<Inner>,
    cv: Condvar,
    shutdown: AtomicBool,
    epoch: Instant,
    epoch_unix_ms: f64,
}

/// The worker-pool scheduling runtime's public handle (spec.md §4.1, §6).
///
/// Cheaply `Clone`-able: every clone shares the same orchestrator state and
/// background reactor thread, the way a `kernel::ipc` `Sender` handle is
/// shared across callers.
pub struct Pool {
    inner: Arc<PoolInner>,
    reactor: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
}

impl Clone for Pool {
    fn clone(&self) -> Self {
        Pool { inner: self.inner.clone(), reactor: self.reactor.clone() }
    }
}

impl Pool {
    /// Construct a pool over the default [`ThreadTransport`].
    pub fn new(config: PoolConfig, methods: MethodRegistry) -> PoolResult<Self> {
        Self::with_transport(config, methods, Arc::new(ThreadTransport::new()))
    }

    pub fn with_transport(config: PoolConfig, methods: MethodRegistry, transport: Arc<dyn Transport>) -> PoolResult<Self> {
        let central_queue = queue::build(config.queue_strategy)
            .ok_or_else(|| PoolError::Validation("QueueStrategy::Custom requires Pool::with_custom_queue".into()))?;
        Self::build(config, methods, transport, central_queue)
    }

    /// Construct a pool with a caller-supplied queue strategy, for
    /// [`crate::config::QueueStrategy::Custom`] (spec.md §4.2).
    pub fn with_custom_queue(
        config: PoolConfig,
        methods: MethodRegistry,
        transport: Arc<dyn Transport>,
        queue: Box<dyn TaskQueueStrategy>,
    ) -> PoolResult<Self> {
        Self::build(config, methods, transport, queue)
    }

    fn build(config: PoolConfig, methods: MethodRegistry, transport: Arc<dyn Transport>, central_queue: Box<dyn TaskQueueStrategy>) -> PoolResult<Self> {
        config.validate()?;

        let scheduler = match config.scheduling_mode {
            SchedulingMode::Central => None,
            SchedulingMode::Distributed => Some(Scheduler::new(
                config.max_workers,
                config.local_queue_capacity,
                config.steal_policy,
                config.imbalance_threshold.round().max(0.0) as usize,
            )),
        };

        let inner = Inner {
            workers: Slab::with_capacity(config.max_workers),
            bitmap: WorkerBitmap::new(),
            scheduler,
            central_queue,
            circuit: CircuitBreaker::new(config.circuit_breaker.clone()),
            affinity: AffinityRouter::new(config.local_queue_capacity, DEFAULT_AFFINITY_TTL),
            heartbeat: HeartbeatMonitor::new(
                Duration::from_millis(config.health_check.interval_ms),
                Duration::from_millis(config.health_check.timeout_ms),
                DEFAULT_MAX_MISSED_HEARTBEATS,
                config.health_check.action,
            ),
            sessions: SessionManager::new(),
            metrics: Metrics::new(METRICS_WINDOW),
            events: EventBus::new(),
            estimated_memory: 0,
            next_task_id: 1,
            in_flight: HashMap::new(),
            pending_retries: BinaryHeap::new(),
            session_workers: HashMap::new(),
            terminating: false,
            terminated: false,
        };

        let handler = make_handler(methods.clone());
        let epoch = Instant::now();
        let epoch_unix_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64() * 1000.0;

        let pool_inner = Arc::new(PoolInner {
            config,
            transport,
            handler,
            methods,
            state: Mutex::new(inner),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            epoch,
            epoch_unix_ms,
        });

        let pool = Pool { inner: pool_inner, reactor: Arc::new(Mutex::new(None)) };

        {
            let mut state = pool.inner.state.lock();
            let min_workers = pool.inner.config.min_workers;
            for _ in 0..min_workers {
                let _ = spawn_worker(&pool.inner, &mut state);
            }
        }

        let reactor_inner = pool.inner.clone();
        let handle = thread::Builder::new()
            .name("workpool-reactor".into())
            .spawn(move || reactor_loop(reactor_inner))
            .map_err(|e| PoolError::WorkerCreation(e.to_string()))?;
        *pool.reactor.lock() = Some(handle);

        // spec.md §4.1 `ready`: "a latch fulfilled when either eager-init
        // probes complete or (if not eager) immediately after construction".
        if pool.inner.config.eager_init {
            let target = pool.inner.config.min_workers.max(1).min(pool.inner.config.max_workers);
            pool.warmup(target)?;
        }

        Ok(pool)
    }

    /// Resolves once construction's eager-init probes (if any) have
    /// completed; with `eager_init` off this is already resolved by the
    /// time `Pool::new` returns (spec.md §4.1 `ready`).
    pub fn ready(&self) -> PendingResult {
        let (resolver, pending) = defer();
        resolver.resolve(Value::Null);
        pending
    }

    fn now_ms(&self, now: Instant) -> f64 {
        ts_ms(now, self.inner.epoch, self.inner.epoch_unix_ms)
    }

    /// Submit one task (spec.md §4.1 admission pipeline). Synchronous
    /// rejection happens on the calling thread (circuit/queue-full/memory
    /// checks); successful admission hands back a [`PendingResult`] settled
    /// later by the reactor thread.
    pub fn exec(&self, method: impl Into<Method>, params: Params, opts: ExecOptions) -> PoolResult<PendingResult> {
        self.validate_options(&opts)?;
        let now = Instant::now();
        let mut state = self.inner.state.lock();

        if state.terminating || state.terminated {
            return Err(PoolError::Termination { task_id: 0, reason: "pool is shutting down".into() });
        }
        if !state.circuit.allow_request(now) {
            return Err(PoolError::CircuitBreaker);
        }

        let pending = state.pending_count(self.inner.config.scheduling_mode);
        if pending >= self.inner.config.max_queue_size {
            let ts = self.now_ms(now);
            state.events.emit(&PoolEvent::QueueFull { pending_tasks: pending, max_pending: self.inner.config.max_queue_size, ts_ms: ts });
            return Err(PoolError::QueueFull { pending, max: self.inner.config.max_queue_size });
        }

        let estimated = opts.estimated_size.unwrap_or(0);
        loop {
            let Some(max) = self.inner.config.memory.max_queue_memory_bytes else { break };
            if state.estimated_memory + estimated <= max {
                break;
            }
            match self.inner.config.memory.on_memory_pressure {
                OnMemoryPressure::Reject => {
                    let ts = self.now_ms(now);
                    state.events.emit(&PoolEvent::MemoryPressure {
                        used_bytes: state.estimated_memory,
                        max_bytes: max,
                        action: "reject",
                        ts_ms: ts,
                    });
                    return Err(PoolError::MemoryPressure { used: state.estimated_memory, max });
                }
                OnMemoryPressure::Wait => {
                    let ts = self.now_ms(now);
                    state.events.emit(&PoolEvent::MemoryPressure { used_bytes: state.estimated_memory, max_bytes: max, action: "wait", ts_ms: ts });
                    self.inner.cv.wait(&mut state);
                    continue;
                }
                OnMemoryPressure::Gc => {
                    let ts = self.now_ms(now);
                    state.events.emit(&PoolEvent::MemoryPressure { used_bytes: state.estimated_memory, max_bytes: max, action: "gc", ts_ms: ts });
                    break;
                }
            }
        }

        let task_id = TaskId(state.next_task_id);
        state.next_task_id += 1;
        let (resolver, pending_result) = defer();
        let task = Task::new(task_id, method.into(), params, resolver, &opts);
        state.estimated_memory += estimated;
        state.metrics.queue.on_enqueue();

        self.enqueue(&mut state, task);
        drop(state);
        self.inner.cv.notify_all();
        Ok(pending_result)
    }

    fn validate_options(&self, opts: &ExecOptions) -> PoolResult<()> {
        if let Some(idx) = opts.preferred_worker {
            if idx >= self.inner.config.max_workers {
                return Err(PoolError::Validation(format!(
                    "preferred_worker {idx} exceeds max_workers {}",
                    self.inner.config.max_workers
                )));
            }
        }
        Ok(())
    }

    fn enqueue(&self, state: &mut Inner, task: Task) {
        match self.inner.config.scheduling_mode {
            SchedulingMode::Central => state.central_queue.push(task),
            SchedulingMode::Distributed => {
                let hint = self.worker_hint(state, &task);
                state.scheduler.as_ref().unwrap().submit(task, hint);
            }
        }
    }

    fn worker_hint(&self, state: &mut Inner, task: &Task) -> Option<usize> {
        if let Some(idx) = task.preferred_worker {
            return Some(idx);
        }
        let num_workers = self.inner.config.max_workers.max(1);
        if let Some(key) = &task.affinity_key {
            let key = key.clone();
            return Some(state.affinity.resolve(&key, Instant::now(), || work_stealing::affinity_worker_index(&key, num_workers)));
        }
        None
    }

    /// Run `count` tasks through the batch executor (spec.md §4.7). Blocks
    /// the calling thread until every slot settles or `batch_timeout`
    /// elapses.
    pub fn exec_batch<F>(&self, count: usize, options: BatchOptions, mut make_call: F) -> PoolResult<BatchResult>
    where
        F: FnMut(usize) -> (Method, Params, ExecOptions),
    {
        let start = Instant::now();
        let batch_timeout = options.batch_timeout;
        let mut executor = BatchExecutor::new(count, options, start);
        let mut pendings: HashMap<usize, (PendingResult, Instant)> = HashMap::new();

        loop {
            while let Some(index) = executor.next_to_launch() {
                let (method, params, opts) = make_call(index);
                let launched_at = Instant::now();
                match self.exec(method, params, opts) {
                    Ok(pending) => {
                        pendings.insert(index, (pending, launched_at));
                    }
                    Err(_) => {
                        executor.on_settle(index, false, 0.0);
                    }
                }
            }

            if executor.is_finished() {
                break;
            }
            if let Some(timeout) = batch_timeout {
                if start.elapsed() >= timeout {
                    for idx in executor.cancel() {
                        if let Some((pending, _)) = pendings.remove(&idx) {
                            pending.cancel(0);
                        }
                    }
                    break;
                }
            }

            let mut settled_any = false;
            let indices: Vec<usize> = pendings.keys().copied().collect();
            for idx in indices {
                let (pending, launched_at) = &pendings[&idx];
                if pending.is_pending() {
                    continue;
                }
                let (pending, launched_at) = pendings.remove(&idx).unwrap();
                let success = matches!(pending.wait(), Ok(_));
                let duration_ms = launched_at.elapsed().as_secs_f64() * 1000.0;
                executor.on_settle(idx, success, duration_ms);
                settled_any = true;
            }
            if !settled_any {
                thread::sleep(Duration::from_millis(1));
            }
        }

        Ok(executor.finish(Instant::now()))
    }

    /// Default concurrency for a parallel op: the caller's explicit cap, or
    /// the pool's own worker count (spec.md §4.8: "default unbounded,
    /// effectively capped by pool size").
    fn chunk_concurrency(&self, options: &ParallelOptions) -> usize {
        options.concurrency.unwrap_or(self.inner.config.max_workers).max(1)
    }

    /// Dispatch `chunk_count` chunk tasks through [`BatchExecutor`] at the
    /// given concurrency, calling `build_params(index)` to build each
    /// chunk's call lazily (spec.md §2: parallel ops "forward to the Batch
    /// Executor with the given concurrency"). Bails out on the first chunk
    /// error, cancelling the rest, the same way `exec_batch` abandons an
    /// in-flight batch on `batch_timeout`.
    fn run_chunks<F>(&self, method: impl Into<Method> + Clone, chunk_count: usize, concurrency: usize, mut build_params: F) -> PoolResult<Vec<Value>>
    where
        F: FnMut(usize) -> Vec<Value>,
    {
        let options = BatchOptions { concurrency, ..BatchOptions::default() };
        let mut executor = BatchExecutor::new(chunk_count, options, Instant::now());
        let mut pendings: HashMap<usize, PendingResult> = HashMap::new();
        let mut results: Vec<Option<Value>> = vec![None; chunk_count];

        macro_rules! abort {
            ($err:expr) => {{
                executor.cancel();
                for (_, pending) in pendings.drain() {
                    pending.cancel(0);
                }
                return Err($err);
            }};
        }

        loop {
            while let Some(index) = executor.next_to_launch() {
                let params = build_params(index);
                match self.exec(method.clone(), params, ExecOptions::default()) {
                    Ok(pending) => {
                        pendings.insert(index, pending);
                    }
                    Err(err) => {
                        executor.on_settle(index, false, 0.0);
                        abort!(err);
                    }
                }
            }

            if executor.is_finished() {
                break;
            }

            let mut settled_any = false;
            let indices: Vec<usize> = pendings.keys().copied().collect();
            for idx in indices {
                if pendings[&idx].is_pending() {
                    continue;
                }
                let pending = pendings.remove(&idx).unwrap();
                match pending.wait() {
                    Ok(value) => {
                        results[idx] = Some(value);
                        executor.on_settle(idx, true, 0.0);
                        settled_any = true;
                    }
                    Err(err) => {
                        executor.on_settle(idx, false, 0.0);
                        abort!(err);
                    }
                }
            }
            if !settled_any {
                thread::sleep(Duration::from_millis(1));
            }
        }

        Ok(results.into_iter().map(|v| v.unwrap_or(Value::Null)).collect())
    }

    /// `map`: one task per chunk, merged back into original order
    /// (spec.md §4.8).
    pub fn map(&self, method: impl Into<Method> + Clone, items: Vec<Value>, options: ParallelOptions) -> PoolResult<Vec<Value>> {
        let n = items.len();
        let chunk_size = parallel::default_chunk_size(n, false, options.chunk_size);
        let chunks = parallel::make_chunks(n, chunk_size);
        let concurrency = self.chunk_concurrency(&options);
        let raw = self.run_chunks(method, chunks.len(), concurrency, |i| {
            let (start, len) = chunks[i];
            vec![Value::Array(items[start..start + len].to_vec())]
        })?;

        let mut per_chunk = Vec::with_capacity(chunks.len());
        for (i, value) in raw.into_iter().enumerate() {
            let Value::Array(values) = value else {
                return Err(PoolError::TypeMismatch("map chunk result must be an array".into()));
            };
            per_chunk.push((chunks[i].0, values));
        }
        Ok(parallel::merge_map(per_chunk))
    }

    /// `reduce`: chunk-local folds merged with `combine` (spec.md §4.8).
    pub fn reduce<F>(&self, method: impl Into<Method> + Clone, items: Vec<Value>, initial: Value, combine: F, options: ParallelOptions) -> PoolResult<Value>
    where
        F: FnMut(Value, Value) -> Value,
    {
        let n = items.len();
        let chunk_size = parallel::default_chunk_size(n, true, options.chunk_size);
        let chunks = parallel::make_chunks(n, chunk_size);
        let concurrency = self.chunk_concurrency(&options);
        let raw = self.run_chunks(method, chunks.len(), concurrency, |i| {
            let (start, len) = chunks[i];
            vec![Value::Array(items[start..start + len].to_vec())]
        })?;
        let partials = raw.into_iter().map(|v| if v == Value::Null { None } else { Some(v) }).collect();
        Ok(parallel::merge_reduce(partials, initial, combine))
    }

    /// `forEach`: like `map` but discards results, run for side effects.
    pub fn for_each(&self, method: impl Into<Method> + Clone, items: Vec<Value>, options: ParallelOptions) -> PoolResult<()> {
        self.map(method, items, options).map(|_| ())
    }

    /// `some`/`every`/`find`/`findIndex` share one dispatch shape: each
    /// chunk reports whether (and where) its predicate hit. Chunks launch
    /// through `BatchExecutor` in ascending order (the same order
    /// `make_chunks` hands out start indices), so once a chunk settles the
    /// question, every chunk whose slot index is still `Pending` also has a
    /// start index past the decisive one and can be skipped outright
    /// (spec.md §4.8, §8 scenario 6).
    fn scan_chunks(&self, method: impl Into<Method> + Clone, items: &[Value], options: ParallelOptions, is_decisive: impl Fn(&parallel::PredicateHit) -> bool) -> PoolResult<Vec<parallel::PredicateHit>> {
        let n = items.len();
        let chunk_size = parallel::default_chunk_size(n, false, options.chunk_size);
        let chunks = parallel::make_chunks(n, chunk_size);
        let concurrency = self.chunk_concurrency(&options);
        let short_circuit = options.short_circuit.unwrap_or(true);
        let batch_options = BatchOptions { concurrency, ..BatchOptions::default() };
        let mut executor = BatchExecutor::new(chunks.len(), batch_options, Instant::now());
        let mut pendings: HashMap<usize, PendingResult> = HashMap::new();
        let mut hits: Vec<Option<parallel::PredicateHit>> = vec![None; chunks.len()];
        let miss = parallel::PredicateHit { found: false, index: 0 };

        loop {
            while let Some(index) = executor.next_to_launch() {
                let (start, len) = chunks[index];
                let window = Value::Array(items[start..start + len].to_vec());
                match self.exec(method.clone(), vec![window, Value::F64(start as f64)], ExecOptions::default()) {
                    Ok(pending) => {
                        pendings.insert(index, pending);
                    }
                    Err(err) => {
                        for (_, pending) in pendings.drain() {
                            pending.cancel(0);
                        }
                        return Err(err);
                    }
                }
            }

            if executor.is_finished() {
                break;
            }

            let mut settled_any = false;
            let indices: Vec<usize> = pendings.keys().copied().collect();
            for idx in indices {
                if pendings[&idx].is_pending() {
                    continue;
                }
                let pending = pendings.remove(&idx).unwrap();
                let value = match pending.wait() {
                    Ok(value) => value,
                    Err(err) => {
                        for (_, pending) in pendings.drain() {
                            pending.cancel(0);
                        }
                        return Err(err);
                    }
                };
                let Value::Object(fields) = value else {
                    for (_, pending) in pendings.drain() {
                        pending.cancel(0);
                    }
                    return Err(PoolError::TypeMismatch("predicate chunk result must be an object".into()));
                };
                let found = fields.iter().find(|(k, _)| k == "found").is_some_and(|(_, v)| matches!(v, Value::Bool(true)));
                let index = fields
                    .iter()
                    .find(|(k, _)| k == "index")
                    .and_then(|(_, v)| if let Value::F64(n) = v { Some(*n as usize) } else { None })
                    .unwrap_or(0);
                let hit = parallel::PredicateHit { found, index };
                executor.on_settle(idx, true, 0.0);
                settled_any = true;
                let decisive = short_circuit && is_decisive(&hit);
                hits[idx] = Some(hit);

                if decisive {
                    for cancelled_idx in executor.cancel() {
                        hits[cancelled_idx] = Some(miss);
                    }
                    for (_, pending) in pendings.drain() {
                        pending.cancel(0);
                    }
                }
            }
            if !settled_any {
                thread::sleep(Duration::from_millis(1));
            }
        }

        Ok(hits.into_iter().map(|h| h.unwrap_or(miss)).collect())
    }

    pub fn some(&self, method: impl Into<Method> + Clone, items: Vec<Value>, options: ParallelOptions) -> PoolResult<bool> {
        Ok(parallel::merge_some(&self.scan_chunks(method, &items, options, |hit| hit.found)?))
    }

    pub fn every(&self, method: impl Into<Method> + Clone, items: Vec<Value>, options: ParallelOptions) -> PoolResult<bool> {
        Ok(parallel::merge_every(&self.scan_chunks(method, &items, options, |hit| hit.found)?))
    }

    pub fn find_index(&self, method: impl Into<Method> + Clone, items: Vec<Value>, options: ParallelOptions) -> PoolResult<Option<usize>> {
        Ok(parallel::merge_find(&self.scan_chunks(method, &items, options, |hit| hit.found)?))
    }

    pub fn find(&self, method: impl Into<Method> + Clone, items: Vec<Value>, options: ParallelOptions) -> PoolResult<Option<Value>> {
        let idx = self.find_index(method, items.clone(), options)?;
        Ok(idx.map(|i| items[i].clone()))
    }

    /// `count` needs every chunk's contribution, so it never short-circuits.
    pub fn count(&self, method: impl Into<Method> + Clone, items: Vec<Value>, options: ParallelOptions) -> PoolResult<usize> {
        Ok(self.scan_chunks(method, &items, options, |_| false)?.iter().filter(|h| h.found).count())
    }

    pub fn includes(&self, items: &[Value], needle: &Value) -> bool {
        items.contains(needle)
    }

    pub fn index_of(&self, items: &[Value], needle: &Value) -> Option<usize> {
        items.iter().position(|v| v == needle)
    }

    /// `filter`/`partition`/`unique`/`groupBy`/`flatMap` all route through
    /// one chunk-then-kway-merge shape; each worker method returns an array
    /// of `[original_index, value]` pairs already sorted ascending within
    /// the chunk.
    fn indexed_chunks(&self, method: impl Into<Method> + Clone, items: &[Value], options: ParallelOptions) -> PoolResult<Vec<Vec<(usize, Value)>>> {
        let n = items.len();
        let chunk_size = parallel::default_chunk_size(n, false, options.chunk_size);
        let chunks = parallel::make_chunks(n, chunk_size);
        let concurrency = self.chunk_concurrency(&options);
        let raw = self.run_chunks(method, chunks.len(), concurrency, |i| {
            let (start, len) = chunks[i];
            vec![Value::Array(items[start..start + len].to_vec()), Value::F64(start as f64)]
        })?;

        let mut streams = Vec::with_capacity(chunks.len());
        for value in raw {
            let Value::Array(pairs) = value else {
                return Err(PoolError::TypeMismatch("indexed chunk result must be an array".into()));
            };
            let mut stream = Vec::with_capacity(pairs.len());
            for pair in pairs {
                let Value::Array(mut kv) = pair else {
                    return Err(PoolError::TypeMismatch("indexed entry must be [index, value]".into()));
                };
                if kv.len() != 2 {
                    return Err(PoolError::TypeMismatch("indexed entry must have exactly 2 elements".into()));
                }
                let value = kv.pop().unwrap();
                let Value::F64(idx) = kv.pop().unwrap() else {
                    return Err(PoolError::TypeMismatch("indexed entry index must be a number".into()));
                };
                stream.push((idx as usize, value));
            }
            streams.push(stream);
        }
        Ok(streams)
    }

    pub fn filter(&self, method: impl Into<Method> + Clone, items: Vec<Value>, options: ParallelOptions) -> PoolResult<Vec<Value>> {
        Ok(parallel::kway_merge_by_index(self.indexed_chunks(method, &items, options)?))
    }

    /// `unique`: runs the chunk-local selection like `filter`, then a
    /// merge-time dedup pass, since no single chunk can see duplicates that
    /// straddle a chunk boundary. `Value` has no `Hash`/`Eq` (`F64` isn't
    /// total-ordered), so this is a linear `PartialEq` scan, not a set.
    pub fn unique(&self, method: impl Into<Method> + Clone, items: Vec<Value>, options: ParallelOptions) -> PoolResult<Vec<Value>> {
        let candidates = self.filter(method, items, options)?;
        let mut seen: Vec<Value> = Vec::with_capacity(candidates.len());
        for value in candidates {
            if !seen.contains(&value) {
                seen.push(value);
            }
        }
        Ok(seen)
    }

    /// `partition`: splits by the matched *index* set the workers actually
    /// reported, not by re-deriving membership from value equality. Two
    /// equal values at different indices must be able to land on opposite
    /// sides.
    pub fn partition(&self, method: impl Into<Method> + Clone, items: Vec<Value>, options: ParallelOptions) -> PoolResult<(Vec<Value>, Vec<Value>)> {
        let streams = self.indexed_chunks(method, &items, options)?;
        let matched_indices: std::collections::HashSet<usize> = streams.iter().flatten().map(|(idx, _)| *idx).collect();
        let matched = parallel::kway_merge_by_index(streams);
        let unmatched = (0..items.len()).filter(|i| !matched_indices.contains(i)).map(|i| items[i].clone()).collect();
        Ok((matched, unmatched))
    }

    pub fn group_by(&self, method: impl Into<Method> + Clone, items: Vec<Value>, options: ParallelOptions) -> PoolResult<Vec<(Value, Vec<Value>)>> {
        let n = items.len();
        let chunk_size = parallel::default_chunk_size(n, false, options.chunk_size);
        let chunks = parallel::make_chunks(n, chunk_size);
        let concurrency = self.chunk_concurrency(&options);
        let raw = self.run_chunks(method, chunks.len(), concurrency, |i| {
            let (start, len) = chunks[i];
            vec![Value::Array(items[start..start + len].to_vec())]
        })?;

        let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
        for value in raw {
            let Value::Array(pairs) = value else {
                return Err(PoolError::TypeMismatch("groupBy chunk result must be an array".into()));
            };
            for pair in pairs {
                let Value::Array(mut kv) = pair else { continue };
                if kv.len() != 2 {
                    continue;
                }
                let value = kv.pop().unwrap();
                let key = kv.pop().unwrap();
                match groups.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, bucket)) => bucket.push(value),
                    None => groups.push((key, vec![value])),
                }
            }
        }
        Ok(groups)
    }

    pub fn flat_map(&self, method: impl Into<Method> + Clone, items: Vec<Value>, options: ParallelOptions) -> PoolResult<Vec<Value>> {
        let n = items.len();
        let chunk_size = parallel::default_chunk_size(n, false, options.chunk_size);
        let chunks = parallel::make_chunks(n, chunk_size);
        let concurrency = self.chunk_concurrency(&options);
        let raw = self.run_chunks(method, chunks.len(), concurrency, |i| {
            let (start, len) = chunks[i];
            vec![Value::Array(items[start..start + len].to_vec())]
        })?;

        let mut per_chunk = Vec::with_capacity(chunks.len());
        for (chunk_index, value) in raw.into_iter().enumerate() {
            let Value::Array(values) = value else {
                return Err(PoolError::TypeMismatch("flatMap chunk result must be an array".into()));
            };
            per_chunk.push((chunk_index, values));
        }
        Ok(parallel::merge_flat_map(per_chunk))
    }

    pub fn reduce_right<F>(&self, method: impl Into<Method> + Clone, items: Vec<Value>, initial: Value, combine: F, options: ParallelOptions) -> PoolResult<Value>
    where
        F: FnMut(Value, Value) -> Value,
    {
        let mut reversed = items;
        reversed.reverse();
        let n = reversed.len();
        let chunk_size = parallel::default_chunk_size(n, true, options.chunk_size);
        let chunks = parallel::make_chunks(n, chunk_size);
        let concurrency = self.chunk_concurrency(&options);
        let raw = self.run_chunks(method, chunks.len(), concurrency, |i| {
            let (start, len) = chunks[i];
            vec![Value::Array(reversed[start..start + len].to_vec())]
        })?;
        let partials = raw.into_iter().map(|v| if v == Value::Null { None } else { Some(v) }).collect();
        Ok(parallel::merge_reduce_right(partials, initial, combine))
    }

    /// Force-spawn up to `count` workers and wait for each to answer a
    /// trivial heartbeat probe before returning (spec.md §4.1 "warmup").
    pub fn warmup(&self, count: usize) -> PoolResult<()> {
        let indices: Vec<usize> = {
            let mut state = self.inner.state.lock();
            let mut spawned = Vec::new();
            while state.total_workers() < count.min(self.inner.config.max_workers) {
                spawned.push(spawn_worker(&self.inner, &mut state)?);
            }
            spawned
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        for idx in indices {
            loop {
                let done = {
                    let state = self.inner.state.lock();
                    state.workers.get(idx).map(WorkerHandle::is_idle).unwrap_or(true)
                };
                if done || Instant::now() >= deadline {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(())
    }

    /// A snapshot of every method name this pool's workers can execute
    /// (spec.md §6 `get_capabilities`).
    pub fn get_capabilities(&self) -> Vec<String> {
        self.inner.methods.method_names()
    }

    /// On-demand metrics export (spec.md §4.6, §6 `get_metrics`). Returns
    /// `None` when `enable_metrics` is off at construction — callers opted
    /// out of paying for the histogram/window bookkeeping.
    pub fn get_metrics(&self) -> Option<crate::metrics::MetricsSnapshot> {
        if !self.inner.config.enable_metrics {
            return None;
        }
        let state = self.inner.state.lock();
        Some(state.metrics.snapshot(Instant::now()))
    }

    /// A facade routing each of the pool's registered methods through
    /// `exec` (spec.md §4.1 `proxy()`). Each returned closure submits with
    /// default [`ExecOptions`]; callers needing per-call options use `exec`
    /// directly.
    pub fn proxy(&self) -> HashMap<String, ProxyMethod> {
        self.inner
            .methods
            .method_names()
            .into_iter()
            .map(|name| {
                let pool = self.clone();
                let method_name = name.clone();
                let call: ProxyMethod = Arc::new(move |params: Params| pool.exec(method_name.clone(), params, ExecOptions::default()));
                (name, call)
            })
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            total_workers: state.total_workers(),
            idle_workers: state.idle_workers(),
            busy_workers: state.total_workers() - state.idle_workers(),
            pending_tasks: state.pending_count(self.inner.config.scheduling_mode),
            in_flight_tasks: state.in_flight.len(),
            circuit_state: state.circuit.state(),
            estimated_queue_memory_bytes: state.estimated_memory,
            active_sessions: state.sessions.active_count(),
        }
    }

    pub fn on<F>(&self, name: &'static str, listener: F) -> SubscriptionId
    where
        F: FnMut(&PoolEvent) + Send + 'static,
    {
        self.inner.state.lock().events.on(name, listener)
    }

    pub fn once<F>(&self, name: &'static str, listener: F) -> SubscriptionId
    where
        F: FnMut(&PoolEvent) + Send + 'static,
    {
        self.inner.state.lock().events.once(name, listener)
    }

    pub fn off(&self, name: &'static str, id: SubscriptionId) {
        self.inner.state.lock().events.off(name, id);
    }

    pub fn create_session(&self, timeout: Duration, max_tasks: Option<u64>) -> PoolResult<SessionId> {
        let mut state = self.inner.state.lock();
        let worker_index = pick_idle_or_spawn(&self.inner, &mut state)?;
        state.bitmap.set_idle(worker_index, false);
        let id = state.sessions.create(worker_index, Instant::now(), timeout, max_tasks);
        state.session_workers.insert(worker_index, id);
        Ok(id)
    }

    /// Dispatch one call pinned to `session`'s reserved worker, bypassing
    /// the general queue/scheduler entirely (spec.md §3: a session's calls
    /// always land on the same worker).
    pub fn exec_in_session(&self, session: SessionId, method: impl Into<Method>, params: Params, opts: ExecOptions) -> PoolResult<PendingResult> {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let worker_index = match state.sessions.get(session) {
            Some(s) => s.worker_index,
            None => return Err(PoolError::Validation("unknown or closed session".into())),
        };

        let task_id = TaskId(state.next_task_id);
        state.next_task_id += 1;
        let (resolver, pending_result) = defer();
        let task = Task::new(task_id, method.into(), params, resolver, &opts);
        state.sessions.record_task(session, now);
        dispatch_to_worker(&self.inner, &mut state, worker_index, task, now);
        drop(state);
        self.inner.cv.notify_all();
        Ok(pending_result)
    }

    /// Close the session and return its worker to the general idle pool.
    pub fn close_session(&self, id: SessionId) {
        let mut state = self.inner.state.lock();
        if let Some(session) = state.sessions.get(id) {
            let worker_index = session.worker_index;
            state.sessions.close(id);
            state.session_workers.remove(&worker_index);
            if state.workers.contains(worker_index) {
                state.bitmap.set_idle(worker_index, true);
            }
        }
        state.sessions.sweep_closed();
    }

    /// Settle every pending/in-flight task with a `TerminationError`, stop
    /// accepting new work, and join the reactor thread (spec.md §4.1
    /// "terminate").
    pub fn terminate(&self, force: bool) -> PoolResult<()> {
        {
            let mut state = self.inner.state.lock();
            state.terminating = true;

            let deadline = Instant::now() + Duration::from_millis(self.inner.config.worker_terminate_timeout_ms);
            while !state.central_queue.is_empty() {
                if let Some(task) = state.central_queue.pop() {
                    task.resolver.reject(PoolError::Termination { task_id: task.task_id.0, reason: "pool terminated".into() });
                }
            }
            if let Some(scheduler) = &state.scheduler {
                for worker_id in 0..scheduler.num_workers() {
                    while let Some(task) = scheduler.find_work(worker_id) {
                        task.resolver.reject(PoolError::Termination { task_id: task.task_id.0, reason: "pool terminated".into() });
                    }
                }
            }

            let in_flight_ids: Vec<TaskId> = state.in_flight.keys().copied().collect();
            for task_id in in_flight_ids {
                if force {
                    if let Some(flight) = state.in_flight.remove(&task_id) {
                        flight.task.resolver.reject(PoolError::Termination { task_id: task_id.0, reason: "pool force-terminated".into() });
                    }
                }
            }

            if force || self.inner.config.worker_terminate_timeout_ms == 0 {
                let indices: Vec<usize> = state.workers.iter().map(|(i, _)| i).collect();
                for idx in indices {
                    remove_worker(&self.inner, &mut state, idx, "terminate");
                }
            } else {
                drop(state);
                while Instant::now() < deadline {
                    let state = self.inner.state.lock();
                    if state.total_workers() == 0 || state.in_flight.is_empty() {
                        break;
                    }
                    drop(state);
                    thread::sleep(Duration::from_millis(5));
                }
                let mut state = self.inner.state.lock();
                let indices: Vec<usize> = state.workers.iter().map(|(i, _)| i).collect();
                for idx in indices {
                    remove_worker(&self.inner, &mut state, idx, "terminate");
                }
                for (_, flight) in state.in_flight.drain() {
                    flight.task.resolver.reject(PoolError::Termination { task_id: flight.task.task_id.0, reason: "worker abandoned".into() });
                }
            }

            let mut state = self.inner.state.lock();
            state.terminated = true;
        }

        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.cv.notify_all();
        if let Some(handle) = self.reactor.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn pick_idle_or_spawn(inner: &Arc<PoolInner>, state: &mut Inner) -> PoolResult<usize> {
    if let Some(idx) = state.bitmap.find_first_idle() {
        return Ok(idx);
    }
    if state.total_workers() < inner.config.max_workers {
        return spawn_worker(inner, state);
    }
    Err(PoolError::NoWorkersAvailable)
}

fn spawn_worker(inner: &Arc<PoolInner>, state: &mut Inner) -> PoolResult<usize> {
    let conn = inner
        .transport
        .spawn(WorkerParams { handler: inner.handler.clone() })
        .map_err(|e| PoolError::WorkerCreation(e.to_string()))?;
    let worker_type = match inner.config.worker_type {
        WorkerType::Auto => WorkerType::Thread,
        other => other,
    };
    let handle = WorkerHandle::new(0, worker_type, conn);
    let idx = state.workers.insert(handle);
    if let Some(w) = state.workers.get_mut(idx) {
        w.worker_index = idx;
    }
    state.bitmap.set_initialized(idx, true);
    state.bitmap.set_idle(idx, true);
    if inner.config.health_check.enabled {
        state.heartbeat.register(idx);
    }
    let ts = ts_ms(Instant::now(), inner.epoch, inner.epoch_unix_ms);
    state.events.emit(&PoolEvent::WorkerSpawn { worker_index: idx, ts_ms: ts });
    Ok(idx)
}

fn remove_worker(inner: &Arc<PoolInner>, state: &mut Inner, worker_index: usize, reason: &str) {
    if let Some(w) = state.workers.try_remove(worker_index) {
        w.conn.close();
    }
    state.bitmap.set_initialized(worker_index, false);
    state.heartbeat.unregister(worker_index);
    state.metrics.remove_worker(worker_index);
    state.session_workers.remove(&worker_index);
    for closed in state.sessions.close_sessions_for_worker(worker_index) {
        let _ = closed;
    }
    let ts = ts_ms(Instant::now(), inner.epoch, inner.epoch_unix_ms);
    state.events.emit(&PoolEvent::WorkerExit { worker_index, ts_ms: ts });
    tracing::info!(worker_index, reason, "worker removed");
}

fn restart_worker(inner: &Arc<PoolInner>, state: &mut Inner, worker_index: usize) {
    if let Some(flight) = state.in_flight.iter().find(|(_, f)| f.worker_index == worker_index).map(|(id, _)| *id) {
        if let Some(flight) = state.in_flight.remove(&flight) {
            flight.task.resolver.reject(PoolError::WorkerCreation("worker restarted".into()));
        }
    }
    remove_worker(inner, state, worker_index, "health check restart");
    let _ = spawn_worker(inner, state);
}

fn reactor_loop(inner: Arc<PoolInner>) {
    while !inner.shutdown.load(Ordering::Acquire) {
        {
            let mut state = inner.state.lock();
            if state.terminated {
                break;
            }
            tick(&inner, &mut state);
            inner.cv.wait_for(&mut state, REACTOR_TICK);
        }
    }
}

fn tick(inner: &Arc<PoolInner>, state: &mut Inner) {
    let now = Instant::now();
    poll_workers(inner, state, now);
    check_timeouts(inner, state, now);
    run_health_checks(inner, state, now);
    run_retries(inner, state, now);
    for _ in state.sessions.expire_idle(now) {}
    state.sessions.sweep_closed();
    dispatch_more(inner, state, now);
}

fn poll_workers(inner: &Arc<PoolInner>, state: &mut Inner, now: Instant) {
    let indices: Vec<usize> = state.workers.iter().map(|(i, _)| i).collect();
    for idx in indices {
        loop {
            let result = match state.workers.get(idx) {
                Some(w) => w.conn.try_recv(),
                None => break,
            };
            match result {
                Ok(Some(frame)) => handle_frame(inner, state, idx, frame, now),
                Ok(None) => break,
                Err(_) => {
                    handle_worker_gone(inner, state, idx);
                    break;
                }
            }
        }
    }
}

fn handle_frame(inner: &Arc<PoolInner>, state: &mut Inner, worker_idx: usize, frame: Frame, now: Instant) {
    match frame.kind {
        FrameKind::Heartbeat => {
            if let Some(request_id) = state.heartbeat.in_flight_request_id(worker_idx) {
                let outcome = state.heartbeat.on_response(worker_idx, request_id, now);
                apply_health_outcome(inner, state, outcome);
            }
        }
        FrameKind::Result | FrameKind::Error => {
            let Some(task_id) = frame.task_id else { return };
            settle_in_flight(inner, state, worker_idx, task_id, decode_outcome(&frame), now);
        }
        FrameKind::Call | FrameKind::Cancel | FrameKind::Shutdown => {}
    }
}

fn settle_in_flight(inner: &Arc<PoolInner>, state: &mut Inner, worker_idx: usize, task_id: TaskId, outcome: Result<Value, PoolError>, now: Instant) {
    let Some(flight) = state.in_flight.remove(&task_id) else {
        release_worker_if_current(state, worker_idx, task_id);
        return;
    };
    let duration_ms = flight.dispatched_at.elapsed().as_secs_f64() * 1000.0;
    let task_type = flight.task.task_type.clone().unwrap_or_else(|| flight.task.method.name().to_string());

    if let Some(w) = state.workers.get_mut(worker_idx) {
        w.record_task_duration(&task_type, duration_ms, outcome.is_ok());
        w.release();
    }
    if !state.session_workers.contains_key(&worker_idx) {
        state.bitmap.set_idle(worker_idx, true);
    }
    state.metrics.record_task_duration(now, worker_idx, duration_ms, outcome.is_ok());

    match outcome {
        Ok(value) => {
            let transition = state.circuit.record_success();
            emit_circuit_transition(inner, state, transition, now);
            let ts = ts_ms(now, inner.epoch, inner.epoch_unix_ms);
            state.events.emit(&PoolEvent::TaskComplete { task_id, duration_ms, ts_ms: ts });
            flight.task.resolver.resolve(value);
        }
        Err(err) => {
            state.metrics.record_error(now, err.kind(), err.to_string());
            maybe_retry_or_fail(inner, state, flight.task, err, now);
        }
    }
}

fn release_worker_if_current(state: &mut Inner, worker_idx: usize, task_id: TaskId) {
    if let Some(w) = state.workers.get_mut(worker_idx) {
        if w.current_task() == Some(task_id) {
            w.release();
            state.bitmap.set_idle(worker_idx, true);
        }
    }
}

fn maybe_retry_or_fail(inner: &Arc<PoolInner>, state: &mut Inner, mut task: Task, err: PoolError, now: Instant) {
    let retry_cfg = match &task.retry {
        RetryOverride::Disabled => None,
        RetryOverride::Custom(cfg) => Some(cfg.clone()),
        RetryOverride::Inherit => Some(inner.config.retry.clone()),
    };

    let should_retry = retry_cfg.as_ref().is_some_and(|cfg| {
        task.attempt < cfg.max_retries && cfg.retry_on.iter().any(|name| name == err.kind().wire_name())
    });

    if should_retry {
        let cfg = retry_cfg.unwrap();
        let attempt = task.attempt;
        task.attempt += 1;
        let delay = cfg.delay_for_attempt(attempt);
        let ts = ts_ms(now, inner.epoch, inner.epoch_unix_ms);
        state.events.emit(&PoolEvent::Retry { task_id: task.task_id, attempt: task.attempt, max_retries: cfg.max_retries, error: err, ts_ms: ts });
        state.pending_retries.push(Reverse(RetryEntry { due: now + delay, task }));
        return;
    }

    let transition = state.circuit.record_failure(now);
    emit_circuit_transition(inner, state, transition, now);
    let duration_ms = task.age().as_secs_f64() * 1000.0;
    let ts = ts_ms(now, inner.epoch, inner.epoch_unix_ms);
    state.events.emit(&PoolEvent::TaskError { task_id: task.task_id, error: err.clone(), duration_ms, ts_ms: ts });
    task.resolver.reject(err);
}

fn emit_circuit_transition(inner: &Arc<PoolInner>, state: &mut Inner, transition: CircuitTransition, now: Instant) {
    let ts = ts_ms(now, inner.epoch, inner.epoch_unix_ms);
    match transition {
        CircuitTransition::Opened => state.events.emit(&PoolEvent::CircuitOpen { ts_ms: ts }),
        CircuitTransition::HalfOpened => state.events.emit(&PoolEvent::CircuitHalfOpen { ts_ms: ts }),
        CircuitTransition::Closed => state.events.emit(&PoolEvent::CircuitClose { ts_ms: ts }),
        CircuitTransition::None => {}
    }
}

fn handle_worker_gone(inner: &Arc<PoolInner>, state: &mut Inner, worker_idx: usize) {
    if let Some((task_id, _)) = state.in_flight.iter().find(|(_, f)| f.worker_index == worker_idx).map(|(id, f)| (*id, f.dispatched_at)) {
        if let Some(flight) = state.in_flight.remove(&task_id) {
            maybe_retry_or_fail(inner, state, flight.task, PoolError::WorkerCreation("worker connection closed".into()), Instant::now());
        }
    }
    remove_worker(inner, state, worker_idx, "transport closed");
}

fn check_timeouts(inner: &Arc<PoolInner>, state: &mut Inner, now: Instant) {
    let timed_out: Vec<TaskId> = state
        .in_flight
        .iter()
        .filter(|(_, f)| f.deadline.is_some_and(|d| now >= d))
        .map(|(id, _)| *id)
        .collect();

    for task_id in timed_out {
        let Some(flight) = state.in_flight.remove(&task_id) else { continue };
        if let Some(w) = state.workers.get(flight.worker_index) {
            let _ = w.conn.send(Frame::cancel(task_id));
        }
        let ms = flight.task.timeout_ms.unwrap_or(0);
        maybe_retry_or_fail(inner, state, flight.task, PoolError::Timeout { task_id: task_id.0, ms }, now);
    }
}

fn run_health_checks(inner: &Arc<PoolInner>, state: &mut Inner, now: Instant) {
    if !inner.config.health_check.enabled {
        return;
    }
    let indices: Vec<usize> = state.workers.iter().map(|(i, _)| i).collect();
    for idx in indices {
        if state.heartbeat.has_timed_out(idx, now) {
            let outcome = state.heartbeat.on_timeout(idx);
            apply_health_outcome(inner, state, outcome);
        } else if state.heartbeat.due(idx, now) {
            if state.heartbeat.begin_probe(idx, now).is_some() {
                if let Some(w) = state.workers.get(idx) {
                    let _ = w.conn.send(Frame::heartbeat());
                }
            }
        }
    }
}

fn apply_health_outcome(inner: &Arc<PoolInner>, state: &mut Inner, outcome: HealthOutcome) {
    match outcome {
        HealthOutcome::Ok | HealthOutcome::Recovered { .. } => {}
        HealthOutcome::Warn { worker_index } => {
            tracing::warn!(worker_index, "worker missed its heartbeat budget");
        }
        HealthOutcome::Remove { worker_index } => {
            remove_worker(inner, state, worker_index, "health check remove");
        }
        HealthOutcome::Restart { worker_index } => {
            restart_worker(inner, state, worker_index);
        }
    }
}

fn run_retries(inner: &Arc<PoolInner>, state: &mut Inner, now: Instant) {
    loop {
        let due = matches!(state.pending_retries.peek(), Some(Reverse(entry)) if entry.due <= now);
        if !due {
            break;
        }
        let Some(Reverse(entry)) = state.pending_retries.pop() else { break };
        let task = entry.task;
        match inner.config.scheduling_mode {
            SchedulingMode::Central => state.central_queue.push(task),
            SchedulingMode::Distributed => {
                state.scheduler.as_ref().unwrap().submit(task, None);
            }
        }
    }
}

fn dispatch_more(inner: &Arc<PoolInner>, state: &mut Inner, now: Instant) {
    loop {
        let worker_idx = match state.bitmap.find_first_idle() {
            Some(idx) => idx,
            None => {
                if state.total_workers() < inner.config.max_workers && has_pending_work(state, inner.config.scheduling_mode) {
                    match spawn_worker(inner, state) {
                        Ok(idx) => idx,
                        Err(_) => break,
                    }
                } else {
                    break;
                }
            }
        };

        let task = match inner.config.scheduling_mode {
            SchedulingMode::Central => state.central_queue.pop(),
            SchedulingMode::Distributed => state.scheduler.as_ref().unwrap().find_work(worker_idx),
        };
        let Some(task) = task else { break };

        if !task.is_live() {
            state.metrics.queue.on_dequeue(task.age().as_secs_f64() * 1000.0);
            continue;
        }

        dispatch_to_worker(inner, state, worker_idx, task, now);
    }
}

fn has_pending_work(state: &Inner, mode: SchedulingMode) -> bool {
    state.pending_count(mode) > 0
}

fn dispatch_to_worker(inner: &Arc<PoolInner>, state: &mut Inner, worker_idx: usize, task: Task, now: Instant) {
    let armed = task.resolver.mark_dispatched();
    let deadline = armed.or_else(|| task.timeout_ms.map(Duration::from_millis)).map(|d| now + d);

    state.metrics.queue.on_dequeue(task.age().as_secs_f64() * 1000.0);
    state.bitmap.set_idle(worker_idx, false);

    let payload = encode_call(&task);
    let frame = Frame::call(task.task_id, payload);

    if let Some(w) = state.workers.get_mut(worker_idx) {
        w.assign(task.task_id);
        if let Err(err) = w.conn.send(frame) {
            w.release();
            state.bitmap.set_idle(worker_idx, true);
            maybe_retry_or_fail(inner, state, task, PoolError::Transport(err), now);
            return;
        }
    }

    let ts = ts_ms(now, inner.epoch, inner.epoch_unix_ms);
    state.events.emit(&PoolEvent::TaskStart { task_id: task.task_id, method: task.method.name().to_string(), worker_index: worker_idx, ts_ms: ts });
    state.in_flight.insert(task.task_id, InFlight { task, worker_index: worker_idx, dispatched_at: now, deadline });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, RetryConfig};

    fn test_methods() -> MethodRegistry {
        let mut methods = MethodRegistry::new();
        methods.register("add", |params: Params| match params.as_slice() {
            [Value::F64(a), Value::F64(b)] => Ok(Value::F64(a + b)),
            _ => Err(PoolError::TypeMismatch("add expects two numbers".into())),
        });
        methods.register("boom", |_: Params| Err(PoolError::UserError("boom".into())));
        methods.register("slow", |_: Params| {
            thread::sleep(Duration::from_millis(50));
            Ok(Value::Bool(true))
        });
        methods
    }

    fn test_pool(mut config: PoolConfig) -> Pool {
        config.min_workers = config.min_workers.max(1);
        config.max_workers = config.max_workers.max(2);
        Pool::new(config, test_methods()).expect("pool construction should succeed")
    }

    #[test]
    fn exec_resolves_a_registered_method() {
        let pool = test_pool(PoolConfig::default());
        let pending = pool.exec("add", vec![Value::F64(2.0), Value::F64(3.0)], ExecOptions::default()).unwrap();
        assert_eq!(pending.wait(), Ok(Value::F64(5.0)));
        pool.terminate(true).unwrap();
    }

    #[test]
    fn exec_surfaces_worker_user_errors() {
        let pool = test_pool(PoolConfig::default());
        let pending = pool.exec("boom", vec![], ExecOptions::default()).unwrap();
        assert!(matches!(pending.wait(), Err(PoolError::UserError(_))));
        pool.terminate(true).unwrap();
    }

    #[test]
    fn fifo_submission_order_resolves_in_submission_order() {
        let mut config = PoolConfig::default();
        config.max_workers = 1;
        config.min_workers = 1;
        let pool = test_pool(config);
        let a = pool.exec("add", vec![Value::F64(1.0), Value::F64(0.0)], ExecOptions::default()).unwrap();
        let b = pool.exec("add", vec![Value::F64(2.0), Value::F64(0.0)], ExecOptions::default()).unwrap();
        let c = pool.exec("add", vec![Value::F64(3.0), Value::F64(0.0)], ExecOptions::default()).unwrap();
        assert_eq!(a.wait(), Ok(Value::F64(1.0)));
        assert_eq!(b.wait(), Ok(Value::F64(2.0)));
        assert_eq!(c.wait(), Ok(Value::F64(3.0)));
        pool.terminate(true).unwrap();
    }

    #[test]
    fn queue_full_rejects_synchronously() {
        let mut config = PoolConfig::default();
        config.max_workers = 1;
        config.max_queue_size = 0;
        let pool = test_pool(config);
        let result = pool.exec("add", vec![Value::F64(1.0), Value::F64(1.0)], ExecOptions::default());
        assert!(matches!(result, Err(PoolError::QueueFull { .. })));
        pool.terminate(true).unwrap();
    }

    #[test]
    fn retry_reattempts_on_configured_failure_kind() {
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = attempts.clone();
        let mut methods = MethodRegistry::new();
        methods.register("flaky", move |_: Params| {
            let n = counted.fetch_add(1, Ordering::SeqCst);
            if n < 2 { Err(PoolError::UserError("not yet".into())) } else { Ok(Value::Bool(true)) }
        });
        let config = PoolConfig {
            max_workers: 1,
            retry: RetryConfig { max_retries: 2, retry_delay_ms: 1, backoff_multiplier: 1.0, retry_on: vec!["UserError".into()] },
            ..PoolConfig::default()
        };
        let pool = Pool::new(config, methods).unwrap();
        let pending = pool.exec("flaky", vec![], ExecOptions::default()).unwrap();
        assert_eq!(pending.wait(), Ok(Value::Bool(true)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        pool.terminate(true).unwrap();
    }

    #[test]
    fn circuit_breaker_opens_after_threshold_and_rejects() {
        let mut config = PoolConfig::default();
        config.max_workers = 1;
        config.circuit_breaker = CircuitBreakerConfig { enabled: true, error_threshold: 2, reset_timeout_ms: 50, half_open_requests: 1 };
        let pool = test_pool(config);

        for _ in 0..2 {
            let pending = pool.exec("boom", vec![], ExecOptions::default()).unwrap();
            let _ = pending.wait();
        }
        let rejected = pool.exec("add", vec![Value::F64(1.0), Value::F64(1.0)], ExecOptions::default());
        assert!(matches!(rejected, Err(PoolError::CircuitBreaker)));
        pool.terminate(true).unwrap();
    }

    #[test]
    fn parallel_map_preserves_original_order() {
        let mut methods = MethodRegistry::new();
        methods.register("double_chunk", |params: Params| {
            let Value::Array(chunk) = params.into_iter().next().unwrap() else { unreachable!() };
            let doubled = chunk
                .into_iter()
                .map(|v| match v {
                    Value::F64(n) => Value::F64(n * 2.0),
                    other => other,
                })
                .collect();
            Ok(Value::Array(doubled))
        });
        let pool = Pool::new(PoolConfig { max_workers: 4, ..PoolConfig::default() }, methods).unwrap();
        let items: Vec<Value> = (0..8).map(|n| Value::F64(n as f64)).collect();
        let result = pool.map("double_chunk", items, ParallelOptions { chunk_size: Some(2), ..Default::default() }).unwrap();
        let expected: Vec<Value> = (0..8).map(|n| Value::F64((n * 2) as f64)).collect();
        assert_eq!(result, expected);
        pool.terminate(true).unwrap();
    }

    #[test]
    fn stats_reports_worker_and_queue_counts() {
        let pool = test_pool(PoolConfig::default());
        let stats = pool.stats();
        assert!(stats.total_workers >= 1);
        pool.terminate(true).unwrap();
    }

    #[test]
    fn terminate_rejects_queued_tasks() {
        let mut config = PoolConfig::default();
        config.max_workers = 1;
        let pool = test_pool(config);
        let pending = pool.exec("slow", vec![], ExecOptions::default()).unwrap();
        let queued = pool.exec("add", vec![Value::F64(1.0), Value::F64(1.0)], ExecOptions::default()).unwrap();
        pool.terminate(true).unwrap();
        let _ = pending.wait();
        assert!(matches!(queued.wait(), Err(PoolError::Termination { .. })));
    }

    #[test]
    fn ready_resolves_immediately_without_eager_init() {
        let pool = test_pool(PoolConfig::default());
        assert_eq!(pool.ready().wait(), Ok(Value::Null));
        pool.terminate(true).unwrap();
    }

    #[test]
    fn ready_resolves_after_eager_init_warms_workers() {
        let mut config = PoolConfig::default();
        config.eager_init = true;
        config.min_workers = 2;
        config.max_workers = 2;
        let pool = test_pool(config);
        assert_eq!(pool.ready().wait(), Ok(Value::Null));
        assert_eq!(pool.stats().total_workers, 2);
        pool.terminate(true).unwrap();
    }

    #[test]
    fn proxy_routes_calls_through_exec() {
        let pool = test_pool(PoolConfig::default());
        let proxy = pool.proxy();
        let add = proxy.get("add").expect("add should be proxied");
        let pending = add(vec![Value::F64(4.0), Value::F64(5.0)]).unwrap();
        assert_eq!(pending.wait(), Ok(Value::F64(9.0)));
        pool.terminate(true).unwrap();
    }

    #[test]
    fn get_metrics_reports_latency_and_queue_samples() {
        let pool = test_pool(PoolConfig::default());
        pool.exec("add", vec![Value::F64(1.0), Value::F64(2.0)], ExecOptions::default()).unwrap().wait().unwrap();
        let snapshot = pool.get_metrics().expect("metrics enabled by default");
        assert_eq!(snapshot.sample_count, 1);
        assert_eq!(snapshot.queue_total_enqueued, 1);
        pool.terminate(true).unwrap();
    }

    #[test]
    fn get_metrics_is_none_when_disabled() {
        let mut config = PoolConfig::default();
        config.enable_metrics = false;
        let pool = test_pool(config);
        assert!(pool.get_metrics().is_none());
        pool.terminate(true).unwrap();
    }

    fn index_chunk_methods() -> MethodRegistry {
        let mut methods = MethodRegistry::new();
        methods.register("evens_indexed", |params: Params| {
            let mut iter = params.into_iter();
            let Some(Value::Array(chunk)) = iter.next() else { unreachable!() };
            let Some(Value::F64(start)) = iter.next() else { unreachable!() };
            let start = start as usize;
            let pairs = chunk
                .into_iter()
                .enumerate()
                .filter(|(_, v)| matches!(v, Value::F64(n) if *n as i64 % 2 == 0))
                .map(|(i, v)| Value::Array(vec![Value::F64((start + i) as f64), v]))
                .collect();
            Ok(Value::Array(pairs))
        });
        methods
    }

    #[test]
    fn reduce_folds_chunk_partials_with_combiner() {
        let mut methods = MethodRegistry::new();
        methods.register("sum_chunk", |params: Params| {
            let Value::Array(chunk) = params.into_iter().next().unwrap() else { unreachable!() };
            let total = chunk.into_iter().fold(0.0, |acc, v| match v {
                Value::F64(n) => acc + n,
                _ => acc,
            });
            Ok(Value::F64(total))
        });
        let pool = Pool::new(PoolConfig { max_workers: 4, ..PoolConfig::default() }, methods).unwrap();
        let items: Vec<Value> = (1..=10).map(|n| Value::F64(n as f64)).collect();
        let total = pool
            .reduce(
                "sum_chunk",
                items,
                Value::F64(0.0),
                |acc, v| match (acc, v) {
                    (Value::F64(a), Value::F64(b)) => Value::F64(a + b),
                    (a, _) => a,
                },
                ParallelOptions { chunk_size: Some(3), ..Default::default() },
            )
            .unwrap();
        assert_eq!(total, Value::F64(55.0));
        pool.terminate(true).unwrap();
    }

    #[test]
    fn map_honors_configured_concurrency_cap() {
        let in_flight = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (in_flight_m, peak_m) = (in_flight.clone(), peak.clone());
        let mut methods = MethodRegistry::new();
        methods.register("double_slow", move |params: Params| {
            let now = in_flight_m.fetch_add(1, Ordering::SeqCst) + 1;
            peak_m.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            in_flight_m.fetch_sub(1, Ordering::SeqCst);
            let Value::Array(chunk) = params.into_iter().next().unwrap() else { unreachable!() };
            Ok(Value::Array(chunk.into_iter().map(|v| match v {
                Value::F64(n) => Value::F64(n * 2.0),
                other => other,
            }).collect()))
        });
        let pool = Pool::new(PoolConfig { max_workers: 8, ..PoolConfig::default() }, methods).unwrap();
        let items: Vec<Value> = (0..6).map(|n| Value::F64(n as f64)).collect();
        pool.map("double_slow", items, ParallelOptions { chunk_size: Some(1), concurrency: Some(2), ..Default::default() }).unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2, "never more than {} chunks should run at once, saw {}", 2, peak.load(Ordering::SeqCst));
        pool.terminate(true).unwrap();
    }

    #[test]
    fn find_index_short_circuits_remaining_chunks() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let tracked = visited.clone();
        let mut methods = MethodRegistry::new();
        methods.register("is_target", move |params: Params| {
            let mut iter = params.into_iter();
            let Some(Value::Array(chunk)) = iter.next() else { unreachable!() };
            let Some(Value::F64(start)) = iter.next() else { unreachable!() };
            let start = start as usize;
            tracked.lock().push(start);
            let hit = chunk.iter().position(|v| matches!(v, Value::F64(n) if *n as i64 == 777));
            match hit {
                Some(i) => Ok(Value::Object(vec![("found".into(), Value::Bool(true)), ("index".into(), Value::F64((start + i) as f64))])),
                None => Ok(Value::Object(vec![("found".into(), Value::Bool(false)), ("index".into(), Value::F64(0.0))])),
            }
        });
        let config = PoolConfig { max_workers: 1, ..PoolConfig::default() };
        let pool = Pool::new(config, methods).unwrap();
        let items: Vec<Value> = (0..1000).map(|n| Value::F64(n as f64)).collect();
        let index = pool
            .find_index(
                "is_target",
                items,
                ParallelOptions { chunk_size: Some(100), concurrency: Some(1), short_circuit: Some(true) },
            )
            .unwrap();
        assert_eq!(index, Some(777));
        let visited = visited.lock();
        assert!(visited.iter().all(|&start| start <= 700), "chunks past the match must never run: {:?}", *visited);
        pool.terminate(true).unwrap();
    }

    #[test]
    fn unique_deduplicates_values_across_chunk_boundaries() {
        let mut methods = MethodRegistry::new();
        methods.register("all_indexed", |params: Params| {
            let mut iter = params.into_iter();
            let Some(Value::Array(chunk)) = iter.next() else { unreachable!() };
            let Some(Value::F64(start)) = iter.next() else { unreachable!() };
            let start = start as usize;
            let pairs = chunk.into_iter().enumerate().map(|(i, v)| Value::Array(vec![Value::F64((start + i) as f64), v])).collect();
            Ok(Value::Array(pairs))
        });
        let pool = Pool::new(PoolConfig { max_workers: 4, ..PoolConfig::default() }, methods).unwrap();
        // chunk_size=2 puts the duplicate `2.0` at index 1 (chunk 0) and
        // index 2 (chunk 1): a per-chunk-only dedup would miss it.
        let items = vec![Value::F64(1.0), Value::F64(2.0), Value::F64(2.0), Value::F64(3.0)];
        let result = pool.unique("all_indexed", items, ParallelOptions { chunk_size: Some(2), ..Default::default() }).unwrap();
        assert_eq!(result, vec![Value::F64(1.0), Value::F64(2.0), Value::F64(3.0)]);
        pool.terminate(true).unwrap();
    }

    #[test]
    fn partition_keeps_duplicate_values_on_their_own_matched_index() {
        let mut methods = MethodRegistry::new();
        methods.register("keep_first_only", |params: Params| {
            let mut iter = params.into_iter();
            let Some(Value::Array(chunk)) = iter.next() else { unreachable!() };
            let Some(Value::F64(start)) = iter.next() else { unreachable!() };
            let start = start as usize;
            // Matches only the first element of the whole input, even
            // though both elements are value-equal.
            let pairs = chunk
                .into_iter()
                .enumerate()
                .filter(|(i, _)| start + i == 0)
                .map(|(i, v)| Value::Array(vec![Value::F64((start + i) as f64), v]))
                .collect();
            Ok(Value::Array(pairs))
        });
        let pool = Pool::new(PoolConfig { max_workers: 2, ..PoolConfig::default() }, methods).unwrap();
        let items = vec![Value::F64(5.0), Value::F64(5.0)];
        let (matched, unmatched) = pool.partition("keep_first_only", items, ParallelOptions { chunk_size: Some(1), ..Default::default() }).unwrap();
        assert_eq!(matched, vec![Value::F64(5.0)]);
        assert_eq!(unmatched, vec![Value::F64(5.0)]);
        pool.terminate(true).unwrap();
    }

    #[test]
    fn filter_routes_through_indexed_chunks() {
        let pool = Pool::new(PoolConfig { max_workers: 4, ..PoolConfig::default() }, index_chunk_methods()).unwrap();
        let items: Vec<Value> = (0..9).map(|n| Value::F64(n as f64)).collect();
        let evens = pool.filter("evens_indexed", items, ParallelOptions { chunk_size: Some(4), ..Default::default() }).unwrap();
        let expected: Vec<Value> = (0..9).filter(|n| n % 2 == 0).map(|n| Value::F64(n as f64)).collect();
        assert_eq!(evens, expected);
        pool.terminate(true).unwrap();
    }
}
