//! Scheduling layer over the layout and refresh pipeline.
//!
//! Four stages, each switchable through [`OptimizerConfig`]:
//!
//! * **deferral**: during the warm-up window after start, submissions are
//!   queued and drained in request order once the window ends;
//! * **batching**: identical submissions share one execution; a batch runs
//!   when it reaches `batch_size` or `batch_delay_ms` after it opened;
//! * **caching**: successful results are kept per key for `cache_ttl_ms`;
//! * **throttling**: [`PerformanceOptimizer::allow_refresh`] admits at most
//!   `max_updates_per_window` refreshes per node per rolling window.
//!
//! Nothing runs in the background. Time only moves when the caller invokes
//! [`PerformanceOptimizer::poll`], which makes every stage testable with a
//! [`ManualClock`].

pub mod scheduler;

pub use scheduler::{Clock, ManualClock, Scheduler, SharedClock, SystemClock, TimerHandle};

use serde::Serialize;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;

use crate::config::OptimizerConfig;
use crate::error::{EngineError, OptimizerError};
use crate::events::{EngineEvent, SharedSink, tracing_sink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Layout,
    Refresh,
    Sync,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Layout => "layout",
            Self::Refresh => "refresh",
            Self::Sync => "sync",
        }
    }
}

/// Identity used for coalescing and caching: the operation plus a content
/// hash of its context and options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub kind: OperationKind,
    pub fingerprint: u64,
}

impl OperationKey {
    pub fn new(kind: OperationKind, fingerprint: u64) -> Self {
        Self { kind, fingerprint }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:016x}", self.kind.as_str(), self.fingerprint)
    }
}

pub type Operation<T> = Box<dyn FnOnce() -> Result<T, EngineError>>;

type Slot<T> = Rc<RefCell<Option<Result<T, OptimizerError>>>>;

/// Handle to the eventual result of a submission. Clones observe the same result.
#[derive(Debug)]
pub struct Ticket<T> {
    slot: Slot<T>,
}

impl<T> Clone for Ticket<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Clone> Ticket<T> {
    fn pending() -> (Self, Slot<T>) {
        let slot: Slot<T> = Rc::new(RefCell::new(None));
        (Self { slot: slot.clone() }, slot)
    }

    fn ready(result: Result<T, OptimizerError>) -> Self {
        Self {
            slot: Rc::new(RefCell::new(Some(result))),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// The result once the operation ran or was cancelled.
    pub fn result(&self) -> Option<Result<T, OptimizerError>> {
        self.slot.borrow().clone()
    }
}

struct Pending<T> {
    key: OperationKey,
    operation: Operation<T>,
    waiters: Vec<Slot<T>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    WarmupEnd,
    BatchFlush,
}

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    stored_at: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizerMetrics {
    pub total_operations: u64,
    /// Submissions that did not cause their own execution: coalesced
    /// duplicates and throttled refreshes.
    pub skipped_operations: u64,
    pub batched_operations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub executed_operations: u64,
    pub average_execution_ms: f64,
    pub pending_operations: usize,
    pub queued_operations: usize,
    pub cache_size: usize,
    /// Nodes with refresh timestamps still inside the throttle window.
    pub throttled_nodes: usize,
    pub is_initial_load: bool,
}

pub struct PerformanceOptimizer<T> {
    config: OptimizerConfig,
    clock: SharedClock,
    sink: SharedSink,
    timers: Scheduler<Timer>,
    initial_load: bool,
    deferred: Vec<Pending<T>>,
    batch: Vec<Pending<T>>,
    batch_timer: Option<TimerHandle>,
    cache: HashMap<OperationKey, CacheEntry<T>>,
    throttle: HashMap<String, VecDeque<u64>>,
    metrics: OptimizerMetrics,
    total_execution_ms: u64,
}

impl<T: Clone> PerformanceOptimizer<T> {
    pub fn new(config: OptimizerConfig, clock: SharedClock) -> Self {
        let mut optimizer = Self {
            config,
            clock,
            sink: tracing_sink(),
            timers: Scheduler::new(),
            initial_load: false,
            deferred: Vec::new(),
            batch: Vec::new(),
            batch_timer: None,
            cache: HashMap::new(),
            throttle: HashMap::new(),
            metrics: OptimizerMetrics::default(),
            total_execution_ms: 0,
        };
        optimizer.arm_warmup();
        optimizer
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn is_initial_load(&self) -> bool {
        self.initial_load
    }

    /// When the next timer falls due; `None` when nothing is waiting.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_due()
    }

    /// Submits `operation` under `key`. The returned ticket is filled
    /// immediately when the operation runs inline or hits the cache,
    /// otherwise by a later [`poll`](Self::poll).
    pub fn submit(&mut self, key: OperationKey, operation: Operation<T>) -> Ticket<T> {
        self.metrics.total_operations += 1;

        if let Some(value) = self.cached(&key) {
            return Ticket::ready(Ok(value));
        }

        if self.initial_load {
            let (ticket, slot) = Ticket::pending();
            if let Some(pending) = self.deferred.iter_mut().find(|p| p.key == key) {
                pending.waiters.push(slot);
                self.metrics.skipped_operations += 1;
                self.sink.emit(&EngineEvent::OperationCoalesced {
                    id: key.to_string(),
                    kind: key.kind.as_str().to_string(),
                });
            } else {
                self.deferred.push(Pending {
                    key,
                    operation,
                    waiters: vec![slot],
                });
                self.sink.emit(&EngineEvent::OperationDeferred {
                    id: key.to_string(),
                    kind: key.kind.as_str().to_string(),
                });
            }
            return ticket;
        }

        if self.config.enable_batching {
            let (ticket, slot) = Ticket::pending();
            if let Some(pending) = self.batch.iter_mut().find(|p| p.key == key) {
                pending.waiters.push(slot);
                self.metrics.skipped_operations += 1;
                self.sink.emit(&EngineEvent::OperationCoalesced {
                    id: key.to_string(),
                    kind: key.kind.as_str().to_string(),
                });
                return ticket;
            }
            self.batch.push(Pending {
                key,
                operation,
                waiters: vec![slot],
            });
            if self.batch.len() >= self.config.batch_size.max(1) {
                self.flush_batch();
            } else if self.batch_timer.is_none() {
                let due = self
                    .clock
                    .now_ms()
                    .saturating_add(self.config.batch_delay_ms);
                self.batch_timer = Some(self.timers.schedule(due, Timer::BatchFlush));
            }
            return ticket;
        }

        let (ticket, slot) = Ticket::pending();
        self.execute(Pending {
            key,
            operation,
            waiters: vec![slot],
        });
        ticket
    }

    /// Fires every timer that is due. Returns the number of executions.
    pub fn poll(&mut self) -> usize {
        let now = self.clock.now_ms();
        let before = self.metrics.executed_operations;
        for timer in self.timers.take_due(now) {
            match timer {
                Timer::WarmupEnd => self.end_warmup(),
                Timer::BatchFlush => {
                    self.batch_timer = None;
                    self.flush_batch();
                }
            }
        }
        self.purge_expired(now);
        self.prune_throttle(now);
        usize::try_from(self.metrics.executed_operations - before).unwrap_or(usize::MAX)
    }

    /// Ends the warm-up window now and drains the deferred queue.
    pub fn finish_warmup(&mut self) -> usize {
        let before = self.metrics.executed_operations;
        self.end_warmup();
        usize::try_from(self.metrics.executed_operations - before).unwrap_or(usize::MAX)
    }

    /// Runs the open batch now.
    pub fn flush(&mut self) -> usize {
        let before = self.metrics.executed_operations;
        if let Some(handle) = self.batch_timer.take() {
            self.timers.cancel(handle);
        }
        self.flush_batch();
        usize::try_from(self.metrics.executed_operations - before).unwrap_or(usize::MAX)
    }

    /// Rolling-window rate limit for preview refreshes of one node. A
    /// rejected request is dropped, not queued.
    pub fn allow_refresh(&mut self, node_id: &str) -> bool {
        if !self.config.enable_throttling {
            return true;
        }
        let now = self.clock.now_ms();
        let window = self.config.throttle_window_ms;
        let stamps = self.throttle.entry(node_id.to_string()).or_default();
        while stamps.front().is_some_and(|t| now.saturating_sub(*t) >= window) {
            stamps.pop_front();
        }
        if stamps.len() >= self.config.max_updates_per_window {
            self.metrics.skipped_operations += 1;
            self.sink.emit(&EngineEvent::RefreshThrottled {
                node_id: node_id.to_string(),
            });
            return false;
        }
        stamps.push_back(now);
        true
    }

    /// Forgets the throttle history of a node that left the canvas.
    pub fn forget_node(&mut self, node_id: &str) {
        self.throttle.remove(node_id);
    }

    /// Drops every queued operation; their tickets resolve to
    /// [`OptimizerError::Cancelled`]. Timers, cache and throttle history are
    /// cleared and the warm-up window starts over.
    pub fn reset(&mut self) -> usize {
        let mut dropped = 0;
        for pending in self.deferred.drain(..).chain(self.batch.drain(..)) {
            dropped += 1;
            for waiter in pending.waiters {
                *waiter.borrow_mut() = Some(Err(OptimizerError::Cancelled(pending.key.to_string())));
            }
        }
        self.batch_timer = None;
        let timers = self.timers.clear();
        tracing::debug!(dropped, timers, "optimizer reset");
        self.cache.clear();
        self.throttle.clear();
        self.arm_warmup();
        self.sink.emit(&EngineEvent::OptimizerReset { dropped });
        dropped
    }

    /// Drops cached results of one kind. Returns how many were dropped.
    pub fn invalidate_cache(&mut self, kind: OperationKind) -> usize {
        let before = self.cache.len();
        self.cache.retain(|key, _| key.kind != kind);
        before - self.cache.len()
    }

    pub fn metrics(&self) -> OptimizerMetrics {
        OptimizerMetrics {
            pending_operations: self.deferred.len(),
            queued_operations: self.batch.len(),
            cache_size: self.cache.len(),
            throttled_nodes: self.throttle.len(),
            is_initial_load: self.initial_load,
            ..self.metrics
        }
    }

    fn cached(&mut self, key: &OperationKey) -> Option<T> {
        if !self.config.enable_cache {
            return None;
        }
        let now = self.clock.now_ms();
        let ttl = self.config.cache_ttl_ms;
        let hit = self
            .cache
            .get(key)
            .filter(|entry| now.saturating_sub(entry.stored_at) < ttl)
            .map(|entry| entry.value.clone());
        let kind = key.kind.as_str().to_string();
        match hit {
            Some(value) => {
                self.metrics.cache_hits += 1;
                self.sink.emit(&EngineEvent::CacheHit { kind });
                Some(value)
            }
            None => {
                self.cache.remove(key);
                self.metrics.cache_misses += 1;
                self.sink.emit(&EngineEvent::CacheMiss { kind });
                None
            }
        }
    }

    fn arm_warmup(&mut self) {
        self.initial_load = self.config.enable_deferred && self.config.initial_delay_ms > 0;
        if self.initial_load {
            let due = self.clock.now_ms().saturating_add(self.config.initial_delay_ms);
            self.timers.schedule(due, Timer::WarmupEnd);
        }
    }

    fn prune_throttle(&mut self, now: u64) {
        let window = self.config.throttle_window_ms;
        self.throttle
            .retain(|_, stamps| stamps.back().is_some_and(|t| now.saturating_sub(*t) < window));
    }

    fn purge_expired(&mut self, now: u64) {
        let ttl = self.config.cache_ttl_ms;
        self.cache
            .retain(|_, entry| now.saturating_sub(entry.stored_at) < ttl);
    }

    fn end_warmup(&mut self) {
        if !self.initial_load {
            return;
        }
        self.initial_load = false;
        let drained: Vec<Pending<T>> = std::mem::take(&mut self.deferred);
        tracing::debug!(queued = drained.len(), "warm-up finished");
        for pending in drained {
            self.execute(pending);
        }
    }

    fn flush_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch: Vec<Pending<T>> = std::mem::take(&mut self.batch);
        self.metrics.batched_operations += batch.len() as u64;
        self.sink.emit(&EngineEvent::BatchExecuted { size: batch.len() });
        for pending in batch {
            self.execute(pending);
        }
    }

    fn execute(&mut self, pending: Pending<T>) {
        let Pending {
            key,
            operation,
            waiters,
        } = pending;
        let started = self.clock.now_ms();
        let result = operation();
        let elapsed = self.clock.now_ms().saturating_sub(started);

        self.metrics.executed_operations += 1;
        self.total_execution_ms += elapsed;
        self.metrics.average_execution_ms =
            self.total_execution_ms as f64 / self.metrics.executed_operations as f64;

        let shared = match result {
            Ok(value) => {
                if self.config.enable_cache {
                    self.cache.insert(
                        key,
                        CacheEntry {
                            value: value.clone(),
                            stored_at: self.clock.now_ms(),
                        },
                    );
                }
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(operation = %key, error = %err, "operation failed");
                Err(OptimizerError::Failed {
                    id: key.to_string(),
                    message: err.to_string(),
                })
            }
        };
        for waiter in waiters {
            *waiter.borrow_mut() = Some(shared.clone());
        }
    }
}
