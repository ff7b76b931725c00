//! Lifecycle shared by all resource collectors.
//!
//! A collector is Stopped until `start()`: then a tokio interval calls
//! `update()` on every tick. `stop()` aborts the timer and drops every piece
//! of sampling state, so nothing survives a stop/start cycle. A tick that was
//! already past its await when the stop came in sees the new lifecycle
//! generation and schedules nothing. Changing the interval of a running
//! collector restarts it.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::Debug;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::error::CollectResult;
use crate::monitor::{ActivationHook, Monitor};
use crate::procfs::SourcePaths;
use crate::task::{CancellableTaskManager, TaskContext};

/// Minimum spacing of unforced refreshes of expensive metrics.
pub const MIN_FORCED_REFRESH_SPACING: Duration = Duration::from_millis(500);

/// Settings every collector is constructed with.
#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub paths: SourcePaths,
    pub update_interval: Duration,
    pub history_window: Duration,
    pub top_processes_limit: usize,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            paths: SourcePaths::default(),
            update_interval: Duration::from_millis(1500),
            history_window: Duration::from_secs(60),
            top_processes_limit: 15,
        }
    }
}

/// Rate limit for on-demand refreshes of one expensive metric.
///
/// Timer ticks are never limited but still restart the window. A forced
/// request always runs; an unforced one inside the window is dropped.
#[derive(Debug, Default)]
pub struct RefreshGate {
    last: Mutex<Option<Instant>>,
}

impl RefreshGate {
    /// Records a timer-driven refresh.
    pub fn mark(&self) {
        *self.last.lock() = Some(Instant::now());
    }

    /// Whether an on-demand request may run now. Admitted requests restart
    /// the window.
    pub fn admit(&self, forced: bool) -> bool {
        let mut last = self.last.lock();
        let recent = last.is_some_and(|at| at.elapsed() < MIN_FORCED_REFRESH_SPACING);
        if recent && !forced {
            return false;
        }
        *last = Some(Instant::now());
        true
    }

    pub fn reset(&self) {
        *self.last.lock() = None;
    }
}

/// Activation hook that refreshes `lazy_key` as soon as its first listener
/// registers, instead of waiting for the next tick.
pub fn refresh_on_first_listen<C: Collector>(
    collector: Weak<C>,
    lazy_key: &'static str,
) -> ActivationHook {
    Arc::new(move |key: &str| {
        if key != lazy_key {
            return;
        }
        let Some(collector) = collector.upgrade() else {
            return;
        };
        if collector.is_running() && tokio::runtime::Handle::try_current().is_ok() {
            collector.request_update(key, false);
        }
    })
}

pub trait Collector: Send + Sync + Sized + 'static {
    type Value: Clone + Debug + Serialize + Send + Sync + 'static;

    fn monitor(&self) -> &Monitor<Self::Value>;

    /// Metric keys this collector publishes.
    fn metric_keys(&self) -> &'static [&'static str];

    /// Starts refreshes for the metrics somebody listens to.
    fn update(self: &Arc<Self>);

    /// Refreshes one metric outside the regular tick.
    ///
    /// Unforced requests are dropped while a refresh of the same metric is in
    /// flight; forced requests supersede it.
    fn request_update(self: &Arc<Self>, key: &str, forced: bool);

    /// Cancels in-flight refreshes and drops previous samples and caches.
    fn reset(&self);

    /// Lets the collector adapt interval-derived state (cache thresholds).
    fn on_interval_changed(&self, _interval: Duration) {}

    fn is_running(&self) -> bool {
        self.monitor().is_running()
    }

    /// Stopped → Running. No-op when already running.
    fn start(self: &Arc<Self>) {
        let monitor = self.monitor();
        if monitor.is_running() {
            return;
        }
        let interval = monitor.update_interval();
        let generation = monitor.generation();
        let weak = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(collector) = weak.upgrade() else {
                    break;
                };
                let monitor = collector.monitor();
                // abort() only lands at the next await, so a stop racing
                // this tick is caught here.
                let current = monitor.within_generation(generation, || {
                    monitor.mark_tick(Instant::now() + interval);
                    collector.update();
                });
                if !current {
                    break;
                }
            }
        });
        monitor.set_timer(handle);
        info!(
            "{} collector started ({:.1}s interval)",
            monitor.name(),
            interval.as_secs_f64()
        );
    }

    /// Running → Stopped: timer aborted, runs cancelled, state dropped.
    fn stop(self: &Arc<Self>) {
        let monitor = self.monitor();
        monitor.end_generation(|| {
            if let Some(timer) = monitor.take_timer() {
                timer.abort();
                info!("{} collector stopped", monitor.name());
            }
            self.reset();
            monitor.clear();
        });
    }

    fn restart(self: &Arc<Self>) {
        self.stop();
        self.start();
    }

    fn set_update_interval(self: &Arc<Self>, interval: Duration) {
        let monitor = self.monitor();
        if monitor.update_interval() == interval {
            return;
        }
        monitor.set_update_interval(interval);
        self.on_interval_changed(interval);
        if self.is_running() {
            debug!(
                "{}: update interval changed to {:.1}s, restarting",
                monitor.name(),
                interval.as_secs_f64()
            );
            self.restart();
        }
    }

    /// Runs `refresh` on `manager` and logs its failure for `keys`.
    ///
    /// Cancellation is silent. Any other error marks `keys` as failed and is
    /// logged; the current values stay as they were.
    fn spawn_refresh<F, Fut>(
        self: &Arc<Self>,
        manager: &CancellableTaskManager,
        keys: &'static [&'static str],
        refresh: F,
    ) where
        F: FnOnce(Arc<Self>, TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = CollectResult<()>> + Send + 'static,
    {
        let this = self.clone();
        let handle = manager.run(move |ctx| refresh(this, ctx));
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => trace!("refresh of {:?} superseded", keys),
                Err(e) => {
                    let Some(collector) = weak.upgrade() else {
                        return;
                    };
                    let monitor = collector.monitor();
                    warn!("{}: refresh of {:?} failed: {}", monitor.name(), keys, e);
                    for key in keys {
                        monitor.record_failure(key);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_drops_unforced_inside_window() {
        let gate = RefreshGate::default();
        assert!(gate.admit(false));
        assert!(!gate.admit(false));
        assert!(gate.admit(true));
        assert!(!gate.admit(false));

        gate.reset();
        assert!(gate.admit(false));
    }

    #[test]
    fn test_tick_restarts_window() {
        let gate = RefreshGate::default();
        gate.mark();
        assert!(!gate.admit(false));
    }

    #[test]
    fn test_gate_reopens_after_window() {
        let gate = RefreshGate::default();
        *gate.last.lock() = Some(Instant::now() - MIN_FORCED_REFRESH_SPACING);
        assert!(gate.admit(false));
    }
}
