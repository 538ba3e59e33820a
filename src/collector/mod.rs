mod worker;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::aggregator::Aggregator;
use crate::clock;
use crate::export::health::HealthMetrics;
use crate::queue::{MutexQueue, Queue, QueueEntry};
use crate::sink::{encode_snapshot, Sink, SinkError};
use crate::task::{CategoryId, TaskPack};

/// Flush interval used when the caller passes a non-positive one.
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Who drives `tick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadingMode {
    /// The embedder calls `tick` on its own schedule.
    Manual,
    /// A dedicated collector thread ticks once per interval.
    #[default]
    Worker,
}

/// Lifecycle of a collector. A collector runs at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Stopped,
}

/// Errors returned by [`Collector::run`]. No state is retained on error.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("collector already started (phase: {0:?})")]
    AlreadyStarted(Phase),

    #[error("opening sink: {0}")]
    Sink(#[from] SinkError),

    #[error("spawning collector thread: {0}")]
    Spawn(#[source] io::Error),
}

/// State touched only by the collector context.
struct Engine<S> {
    sink: S,
    aggregator: Option<Box<dyn Aggregator>>,
    interval_ms: u64,
    /// Epoch millis of the next flush; `None` until the first tick.
    next_flush_ms: Option<u64>,
    values: Vec<i32>,
    bytes: Vec<u8>,
}

/// State shared between the owning collector and its worker thread.
struct Shared<S, Q> {
    running: AtomicBool,
    queue: Q,
    engine: Mutex<Engine<S>>,
    health: Option<Arc<HealthMetrics>>,
}

struct Lifecycle {
    phase: Phase,
    mode: ThreadingMode,
    cancel: Option<CancellationToken>,
    worker: Option<JoinHandle<()>>,
}

/// Drains queued tasks into an aggregator and periodically publishes the
/// aggregate to a sink.
///
/// Producers call [`put`](Self::put) from any thread. Exactly one execution
/// context drives [`tick`](Self::tick): either the collector's own worker
/// thread ([`ThreadingMode::Worker`]) or the embedder
/// ([`ThreadingMode::Manual`]). Every tick drains the whole queue; the
/// aggregate is marshaled, reset and written only once per interval.
///
/// Telemetry must never take the host down: apart from setup failures in
/// [`run`](Self::run), every failure is logged and swallowed.
pub struct Collector<S: Sink, Q: Queue = MutexQueue> {
    shared: Arc<Shared<S, Q>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<S: Sink + 'static> Collector<S, MutexQueue> {
    /// Creates an idle collector publishing to `sink`.
    pub fn new(sink: S) -> Self {
        Self::with_queue(sink, MutexQueue::new())
    }
}

impl<S: Sink + 'static, Q: Queue + 'static> Collector<S, Q> {
    /// Creates an idle collector with a custom handoff queue.
    pub fn with_queue(sink: S, queue: Q) -> Self {
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                queue,
                engine: Mutex::new(Engine {
                    sink,
                    aggregator: None,
                    interval_ms: DEFAULT_INTERVAL_MS,
                    next_flush_ms: None,
                    values: Vec::new(),
                    bytes: Vec::new(),
                }),
                health: None,
            }),
            lifecycle: Mutex::new(Lifecycle {
                phase: Phase::Idle,
                mode: ThreadingMode::Manual,
                cancel: None,
                worker: None,
            }),
        }
    }

    /// Attaches pipeline self-metrics. Must be called before `run`.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.health = Some(health),
            None => warn!("collector already shared with a worker, health metrics not attached"),
        }
        self
    }

    /// Opens the sink and starts collecting.
    ///
    /// A non-positive `interval_ms` falls back to [`DEFAULT_INTERVAL_MS`].
    /// In [`ThreadingMode::Worker`] a dedicated thread is spawned; in
    /// [`ThreadingMode::Manual`] the caller must drive [`tick`](Self::tick).
    pub fn run<A: Aggregator + 'static>(
        &self,
        name: &str,
        aggregator: A,
        interval_ms: i64,
        mode: ThreadingMode,
    ) -> Result<(), RunError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.phase != Phase::Idle {
            return Err(RunError::AlreadyStarted(lifecycle.phase));
        }

        let interval_ms = normalize_interval(interval_ms);

        {
            let mut engine = self.shared.engine.lock();
            engine.sink.open(name)?;
            engine.aggregator = Some(Box::new(aggregator));
            engine.interval_ms = interval_ms;
            engine.next_flush_ms = None;
            engine.values.clear();
            engine.bytes.clear();
        }

        self.shared.running.store(true, Ordering::Release);

        if mode == ThreadingMode::Worker {
            let cancel = CancellationToken::new();
            let spawned = worker::spawn(
                Arc::clone(&self.shared),
                Duration::from_millis(interval_ms),
                cancel.clone(),
            );

            match spawned {
                Ok(handle) => {
                    lifecycle.cancel = Some(cancel);
                    lifecycle.worker = Some(handle);
                }
                Err(e) => {
                    self.shared.running.store(false, Ordering::Release);
                    let mut engine = self.shared.engine.lock();
                    engine.aggregator = None;
                    engine.sink.close();
                    return Err(RunError::Spawn(e));
                }
            }
        }

        lifecycle.phase = Phase::Running;
        lifecycle.mode = mode;

        info!(name, interval_ms, mode = ?mode, "collector started");

        Ok(())
    }

    /// Enqueues a task for aggregation.
    ///
    /// Silently dropped when the collector is not running. A put racing
    /// `stop` may land after the final drain; it then clears the queue
    /// itself, since nothing will drain it again.
    pub fn put(&self, category: CategoryId, task: TaskPack) {
        if !self.shared.running.load(Ordering::Acquire) {
            self.count_rejected();
            return;
        }

        self.shared.queue.put(QueueEntry::new(category, task));

        if !self.shared.running.load(Ordering::Acquire) {
            while self.shared.queue.try_pop().is_some() {}
            self.count_rejected();
            return;
        }

        if let Some(health) = &self.shared.health {
            health.tasks_enqueued.inc();
        }
    }

    fn count_rejected(&self) {
        if let Some(health) = &self.shared.health {
            health.tasks_rejected.inc();
        }
    }

    /// Drains the queue and flushes if the interval has elapsed.
    ///
    /// `now_ms` is wall-clock epoch milliseconds. The first tick after
    /// `run` only establishes the deadline, so the first published snapshot
    /// always covers a full interval.
    pub fn tick(&self, now_ms: u64) {
        self.shared.tick(now_ms);
    }

    /// [`tick`](Self::tick) with the current wall-clock time.
    pub fn tick_now(&self) {
        self.shared.tick(clock::now_millis());
    }

    /// Stops collecting, joins the worker and closes the sink.
    ///
    /// Tasks still queued are discarded. A no-op unless running.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.phase != Phase::Running {
            return;
        }

        self.shared.running.store(false, Ordering::Release);

        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }

        if let Some(handle) = lifecycle.worker.take() {
            if handle.join().is_err() {
                warn!("collector worker panicked");
            }
        }

        let discarded = {
            let mut engine = self.shared.engine.lock();
            engine.sink.close();
            engine.aggregator = None;

            let mut discarded = 0usize;
            while self.shared.queue.try_pop().is_some() {
                discarded += 1;
            }
            discarded
        };

        lifecycle.phase = Phase::Stopped;

        info!(mode = ?lifecycle.mode, discarded, "collector stopped");
    }

    pub fn phase(&self) -> Phase {
        self.lifecycle.lock().phase
    }

    /// Whether tasks are currently accepted.
    ///
    /// Can turn false while the phase is still `Running` if the worker
    /// thread exited on its own.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Effective flush interval.
    pub fn interval_ms(&self) -> u64 {
        self.shared.engine.lock().interval_ms
    }

    /// Tasks waiting to be drained.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }
}

impl<S: Sink, Q: Queue> Drop for Collector<S, Q> {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut();
        if lifecycle.phase != Phase::Running {
            return;
        }

        self.shared.running.store(false, Ordering::Release);
        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = lifecycle.worker.take() {
            let _ = handle.join();
        }

        let mut engine = self.shared.engine.lock();
        engine.sink.close();
        engine.aggregator = None;
    }
}

impl<S: Sink, Q: Queue> Shared<S, Q> {
    fn tick(&self, now_ms: u64) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        let mut guard = self.engine.lock();
        let engine = &mut *guard;
        let Some(aggregator) = engine.aggregator.as_mut() else {
            return;
        };

        if let Some(health) = &self.health {
            health.queue_depth.set(self.queue.len() as f64);
        }

        // Drain; a concurrent stop ends it early.
        let mut collected = 0u64;
        let mut unhandled = 0u64;
        while self.running.load(Ordering::Acquire) {
            let Some(entry) = self.queue.try_pop() else {
                break;
            };

            if aggregator.collect(entry.category, entry.task) {
                collected += 1;
            } else {
                unhandled += 1;
                trace!(category = entry.category, "task not handled by aggregator");
            }
        }

        if let Some(health) = &self.health {
            health.tasks_collected.inc_by(collected as f64);
            health.tasks_unhandled.inc_by(unhandled as f64);
        }

        let Some(deadline) = engine.next_flush_ms else {
            engine.next_flush_ms = Some(now_ms.saturating_add(engine.interval_ms));
            return;
        };

        if now_ms < deadline {
            return;
        }

        let started = Instant::now();

        engine.values.clear();
        if !aggregator.marshal(&mut engine.values) {
            debug!("aggregator reported an incomplete snapshot");
        }
        aggregator.reset();

        engine.bytes.clear();
        encode_snapshot(&engine.values, &mut engine.bytes);

        match engine.sink.write(&engine.bytes) {
            Ok(()) => {
                debug!(
                    sink = engine.sink.name(),
                    values = engine.values.len(),
                    bytes = engine.bytes.len(),
                    "snapshot published",
                );
                if let Some(health) = &self.health {
                    health.flushes.inc();
                    health.snapshot_values.set(engine.values.len() as f64);
                }
            }
            Err(e) => {
                warn!(sink = engine.sink.name(), error = %e, "snapshot write failed");
                if let Some(health) = &self.health {
                    health.sink_write_errors.inc();
                }
            }
        }

        engine.values.clear();
        engine.next_flush_ms = Some(now_ms.saturating_add(engine.interval_ms));

        if let Some(health) = &self.health {
            health
                .flush_duration
                .observe(started.elapsed().as_secs_f64());
        }
    }
}

fn normalize_interval(interval_ms: i64) -> u64 {
    u64::try_from(interval_ms)
        .ok()
        .filter(|&ms| ms > 0)
        .unwrap_or(DEFAULT_INTERVAL_MS)
}
