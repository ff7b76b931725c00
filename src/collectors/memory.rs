//! Memory collector: RAM and swap usage from /proc/meminfo and the top
//! processes by resident set size.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

use super::{describe, scan_with_metadata, ProcessScan};
use crate::cache::TopProcessesCache;
use crate::collector::{refresh_on_first_listen, Collector, CollectorOptions, RefreshGate};
use crate::error::CollectResult;
use crate::monitor::Monitor;
use crate::process::{rank_top, uncached, ScanKind, TopProcess};
use crate::procfs::{self, MemInfo, SourcePaths};
use crate::task::{CancellableTaskManager, TaskContext};

pub const MEMORY_USAGE: &str = "memoryUsage";
pub const SWAP_USAGE: &str = "swapUsage";
pub const TOP_PROCESSES: &str = "topProcesses";

const METRIC_KEYS: &[&str] = &[MEMORY_USAGE, SWAP_USAGE, TOP_PROCESSES];

/// Usage of one memory pool, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub percent: f64,
}

impl MemoryUsage {
    pub fn new(total: u64, available: u64) -> Self {
        let available = available.min(total);
        let used = total - available;
        let percent = if total == 0 {
            0.0
        } else {
            used as f64 / total as f64 * 100.0
        };
        Self {
            total,
            available,
            used,
            percent,
        }
    }

    pub fn memory(info: &MemInfo) -> Self {
        Self::new(info.total, info.available)
    }

    pub fn swap(info: &MemInfo) -> Self {
        Self::new(info.swap_total, info.swap_free)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MemoryValue {
    Memory(MemoryUsage),
    Swap(MemoryUsage),
    /// `value` is resident bytes.
    TopProcesses(Vec<TopProcess>),
}

pub struct MemoryCollector {
    monitor: Monitor<MemoryValue>,
    paths: SourcePaths,
    top_processes_limit: usize,
    usage_task: CancellableTaskManager,
    top_task: CancellableTaskManager,
    cache: Mutex<TopProcessesCache>,
    top_gate: RefreshGate,
}

impl MemoryCollector {
    pub fn new(options: CollectorOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let monitor = Monitor::new("memory", options.update_interval, options.history_window);
            monitor.set_activation_hook(refresh_on_first_listen(weak.clone(), TOP_PROCESSES));
            Self {
                monitor,
                paths: options.paths,
                top_processes_limit: options.top_processes_limit,
                usage_task: CancellableTaskManager::new("memory.usage"),
                top_task: CancellableTaskManager::new("memory.top"),
                cache: Mutex::new(TopProcessesCache::new(
                    options.update_interval.as_secs_f64(),
                )),
                top_gate: RefreshGate::default(),
            }
        })
    }

    fn refresh_usage(self: &Arc<Self>) {
        self.spawn_refresh(
            &self.usage_task,
            &[MEMORY_USAGE, SWAP_USAGE],
            |this, ctx| async move { this.sample_usage(ctx).await },
        );
    }

    fn refresh_top_processes(self: &Arc<Self>) {
        self.spawn_refresh(
            &self.top_task,
            &[TOP_PROCESSES],
            |this, ctx| async move { this.sample_top_processes(ctx).await },
        );
    }

    async fn sample_usage(&self, ctx: TaskContext) -> CollectResult<()> {
        let info = procfs::read_meminfo(&self.paths.proc_root).await?;
        ctx.commit(|| {
            self.monitor
                .commit(MEMORY_USAGE, MemoryValue::Memory(MemoryUsage::memory(&info)));
            self.monitor
                .commit(SWAP_USAGE, MemoryValue::Swap(MemoryUsage::swap(&info)));
        })?;
        self.monitor.notify(MEMORY_USAGE);
        self.monitor.notify(SWAP_USAGE);
        Ok(())
    }

    async fn sample_top_processes(self: Arc<Self>, ctx: TaskContext) -> CollectResult<()> {
        let this = self.clone();
        let scan = scan_with_metadata(
            self.paths.proc_root.clone(),
            ScanKind::ResidentBytes,
            move |samples| uncached(samples, &this.cache.lock()),
        )
        .await?;
        ctx.commit(|| self.apply_process_scan(scan))?;
        self.monitor.notify(TOP_PROCESSES);
        Ok(())
    }

    fn apply_process_scan(&self, scan: ProcessScan) {
        let mut cache = self.cache.lock();
        scan.update_cache(&mut cache);
        let rows = scan
            .samples
            .iter()
            .filter(|s| s.value > 0)
            .map(|s| {
                let (name, cmdline) = describe(&cache, s);
                TopProcess {
                    pid: s.pid,
                    name,
                    cmdline,
                    value: s.value as f64,
                }
            })
            .collect();
        self.monitor.commit(
            TOP_PROCESSES,
            MemoryValue::TopProcesses(rank_top(rows, self.top_processes_limit)),
        );
    }
}

impl Collector for MemoryCollector {
    type Value = MemoryValue;

    fn monitor(&self) -> &Monitor<MemoryValue> {
        &self.monitor
    }

    fn metric_keys(&self) -> &'static [&'static str] {
        METRIC_KEYS
    }

    fn update(self: &Arc<Self>) {
        if self.monitor.is_listening_for(MEMORY_USAGE) || self.monitor.is_listening_for(SWAP_USAGE)
        {
            self.refresh_usage();
        }
        if self.monitor.is_listening_for(TOP_PROCESSES) {
            self.top_gate.mark();
            self.refresh_top_processes();
        }
    }

    fn request_update(self: &Arc<Self>, key: &str, forced: bool) {
        match key {
            MEMORY_USAGE | SWAP_USAGE => {
                if forced || !self.usage_task.is_running() {
                    self.refresh_usage();
                }
            }
            TOP_PROCESSES => {
                if !forced && self.top_task.is_running() {
                    trace!("memory: top processes refresh already in flight");
                    return;
                }
                if self.top_gate.admit(forced) {
                    self.refresh_top_processes();
                }
            }
            _ => debug!("memory: update requested for unknown metric {}", key),
        }
    }

    fn reset(&self) {
        self.usage_task.cancel();
        self.top_task.cancel();
        self.cache.lock().reset();
        self.top_gate.reset();
    }

    fn on_interval_changed(&self, interval: Duration) {
        self.cache.lock().set_update_interval(interval.as_secs_f64());
    }
}
