//! Scheduling state and publish/subscribe for one collector.
//!
//! A `Monitor<V>` holds the listener registry, the current value and a
//! bounded history per metric key, plus the bookkeeping for the collector's
//! timer. `V` is the collector's own value type, so each collector decides the
//! shape of its metrics once, at construction.
//!
//! Values and history are written only by the owning collector's refresh
//! tasks. Listeners get the metric key and pull the value themselves.

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// Callback invoked with the metric key after that metric was refreshed.
pub type ListenerCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Called when the first listener for a key registers.
pub type ActivationHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifies one subscriber across all of its registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SubscriberId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Freshness of a metric's current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricStatus {
    /// No sample since the collector started.
    Pending,
    /// The last refresh succeeded.
    Ready,
    /// Samples exist but the last `failures` refreshes failed.
    Stale { failures: u32 },
}

/// One history entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistorySample<V> {
    pub at: DateTime<Utc>,
    pub value: V,
}

struct Listener {
    subscriber: SubscriberId,
    key: String,
    callback: ListenerCallback,
}

struct MonitorState<V> {
    listeners: Vec<Listener>,
    values: HashMap<String, V>,
    history: HashMap<String, VecDeque<HistorySample<V>>>,
    status: HashMap<String, MetricStatus>,
    update_interval: Duration,
    history_window: Duration,
    next_tick: Option<Instant>,
}

impl<V> MonitorState<V> {
    fn history_capacity(&self) -> usize {
        let interval = self.update_interval.as_secs_f64();
        if interval <= 0.0 {
            return 1;
        }
        ((self.history_window.as_secs_f64() / interval).ceil() as usize).max(1)
    }

    fn trim_history(&mut self) {
        let capacity = self.history_capacity();
        for buffer in self.history.values_mut() {
            while buffer.len() > capacity {
                buffer.pop_front();
            }
        }
    }
}

/// Listener registry, value store and history for one collector.
pub struct Monitor<V> {
    name: &'static str,
    state: Mutex<MonitorState<V>>,
    activation: Mutex<Option<ActivationHook>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    /// Bumped by every stop; held while a tick schedules refreshes.
    lifecycle: Mutex<u64>,
}

impl<V: Clone> Monitor<V> {
    pub fn new(name: &'static str, update_interval: Duration, history_window: Duration) -> Self {
        Self {
            name,
            state: Mutex::new(MonitorState {
                listeners: Vec::new(),
                values: HashMap::new(),
                history: HashMap::new(),
                status: HashMap::new(),
                update_interval,
                history_window,
                next_tick: None,
            }),
            activation: Mutex::new(None),
            timer: Mutex::new(None),
            lifecycle: Mutex::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Registers `callback` for `key`.
    pub fn listen<F>(&self, subscriber: SubscriberId, key: &str, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let first = {
            let mut state = self.state.lock();
            let first = !state.listeners.iter().any(|l| l.key == key);
            state.listeners.push(Listener {
                subscriber,
                key: key.to_string(),
                callback: Arc::new(callback),
            });
            first
        };
        trace!("{}: {:?} listening for {}", self.name, subscriber, key);

        if first {
            let hook = self.activation.lock().clone();
            if let Some(hook) = hook {
                hook(key);
            }
        }
    }

    /// Removes the registrations of `subscriber`, for one key or all of them.
    pub fn unlisten(&self, subscriber: SubscriberId, key: Option<&str>) {
        let mut state = self.state.lock();
        state
            .listeners
            .retain(|l| l.subscriber != subscriber || key.is_some_and(|k| l.key != k));
    }

    pub fn is_listening_for(&self, key: &str) -> bool {
        self.state.lock().listeners.iter().any(|l| l.key == key)
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Calls every callback registered for `key`, in registration order.
    ///
    /// Callbacks run outside the lock; one that panics is logged and the
    /// others still run.
    pub fn notify(&self, key: &str) {
        let callbacks: Vec<ListenerCallback> = {
            let state = self.state.lock();
            state
                .listeners
                .iter()
                .filter(|l| l.key == key)
                .map(|l| l.callback.clone())
                .collect()
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(key))).is_err() {
                error!("{}: listener for {} panicked", self.name, key);
            }
        }
    }

    pub fn set_usage_value(&self, key: &str, value: V) {
        self.state.lock().values.insert(key.to_string(), value);
    }

    pub fn current_value(&self, key: &str) -> Option<V> {
        self.state.lock().values.get(key).cloned()
    }

    /// Appends to the history of `key`, dropping the oldest entry when full.
    pub fn push_usage_history(&self, key: &str, value: V) {
        let mut state = self.state.lock();
        let capacity = state.history_capacity();
        let buffer = state.history.entry(key.to_string()).or_default();
        while buffer.len() >= capacity {
            buffer.pop_front();
        }
        buffer.push_back(HistorySample {
            at: Utc::now(),
            value,
        });
    }

    /// History of `key`, oldest first.
    pub fn usage_history(&self, key: &str) -> Vec<HistorySample<V>> {
        self.state
            .lock()
            .history
            .get(key)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stores a fresh sample as current value and history entry.
    pub fn commit(&self, key: &str, value: V) {
        self.push_usage_history(key, value.clone());
        let mut state = self.state.lock();
        state.values.insert(key.to_string(), value);
        state.status.insert(key.to_string(), MetricStatus::Ready);
    }

    /// Records a failed refresh; the current value stays untouched.
    pub fn record_failure(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(status) = state.status.get_mut(key) {
            *status = match *status {
                MetricStatus::Ready => MetricStatus::Stale { failures: 1 },
                MetricStatus::Stale { failures } => MetricStatus::Stale {
                    failures: failures.saturating_add(1),
                },
                MetricStatus::Pending => MetricStatus::Pending,
            };
        }
    }

    pub fn status(&self, key: &str) -> MetricStatus {
        self.state
            .lock()
            .status
            .get(key)
            .copied()
            .unwrap_or(MetricStatus::Pending)
    }

    /// Time until the next scheduled tick, `None` while stopped.
    pub fn due_in(&self) -> Option<Duration> {
        self.state
            .lock()
            .next_tick
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn update_interval(&self) -> Duration {
        self.state.lock().update_interval
    }

    pub fn set_update_interval(&self, interval: Duration) {
        let mut state = self.state.lock();
        state.update_interval = interval;
        state.trim_history();
    }

    pub fn set_history_window(&self, window: Duration) {
        let mut state = self.state.lock();
        state.history_window = window;
        state.trim_history();
    }

    pub fn history_capacity(&self) -> usize {
        self.state.lock().history_capacity()
    }

    pub fn set_activation_hook(&self, hook: ActivationHook) {
        *self.activation.lock() = Some(hook);
    }

    /// Drops values, history and statuses; listeners stay registered.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.values.clear();
        state.history.clear();
        state.status.clear();
        state.next_tick = None;
        debug!("{}: cleared values and history", self.name);
    }

    pub(crate) fn mark_tick(&self, next: Instant) {
        self.state.lock().next_tick = Some(next);
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().is_some()
    }

    pub(crate) fn set_timer(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn take_timer(&self) -> Option<JoinHandle<()>> {
        self.timer.lock().take()
    }

    pub(crate) fn generation(&self) -> u64 {
        *self.lifecycle.lock()
    }

    /// Runs `f` if no stop happened since `generation` was read.
    ///
    /// A concurrent `end_generation` waits for `f` to return, so work `f`
    /// schedules is always visible to the stop's reset.
    pub(crate) fn within_generation(&self, generation: u64, f: impl FnOnce()) -> bool {
        let current = self.lifecycle.lock();
        if *current != generation {
            return false;
        }
        f();
        true
    }

    /// Starts a new generation and runs `f` before any older tick can
    /// schedule more work.
    pub(crate) fn end_generation(&self, f: impl FnOnce()) {
        let mut current = self.lifecycle.lock();
        *current += 1;
        f();
    }
}

impl<V> Drop for Monitor<V> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}
