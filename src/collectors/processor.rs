//! Processor collector: CPU usage, per-core usage and frequency, load
//! average and the top processes by CPU share.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

use super::{describe, scan_with_metadata, ProcessScan};
use crate::cache::TopProcessesCache;
use crate::collector::{refresh_on_first_listen, Collector, CollectorOptions, RefreshGate};
use crate::delta::{CounterSeries, CpuUsage, KeyedSeries};
use crate::error::CollectResult;
use crate::monitor::Monitor;
use crate::process::{rank_top, uncached, ProcessTicksTracker, ScanKind, TopProcess};
use crate::procfs::{self, CpuInfo, CpuSnapshot, CpuStat, LoadAverage, SourcePaths};
use crate::task::{CancellableTaskManager, TaskContext};

pub const CPU_USAGE: &str = "cpuUsage";
pub const CPU_CORES_USAGE: &str = "cpuCoresUsage";
pub const CPU_CORES_FREQUENCY: &str = "cpuCoresFrequency";
pub const CPU_LOAD_AVERAGE: &str = "cpuLoadAverage";
pub const TOP_PROCESSES: &str = "topProcesses";

const METRIC_KEYS: &[&str] = &[
    CPU_USAGE,
    CPU_CORES_USAGE,
    CPU_CORES_FREQUENCY,
    CPU_LOAD_AVERAGE,
    TOP_PROCESSES,
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessorValue {
    Usage(CpuUsage),
    /// Busy percent per core, in core-id order. Offline cores are skipped.
    CoresUsage(Vec<f64>),
    /// MHz per core.
    CoresFrequency(Vec<f64>),
    LoadAverage(LoadAverage),
    TopProcesses(Vec<TopProcess>),
}

/// Previous samples; everything here is dropped on stop.
#[derive(Default)]
struct SamplingState {
    total: CounterSeries<CpuStat>,
    cores: KeyedSeries<usize, CpuStat>,
    /// System total as seen by the top-processes pass, kept apart from
    /// `total` so the two refreshes never steal each other's deltas.
    top_total: CounterSeries<CpuStat>,
    process_ticks: ProcessTicksTracker,
}

pub struct ProcessorCollector {
    monitor: Monitor<ProcessorValue>,
    paths: SourcePaths,
    top_processes_limit: usize,
    stat_task: CancellableTaskManager,
    frequency_task: CancellableTaskManager,
    load_task: CancellableTaskManager,
    top_task: CancellableTaskManager,
    state: Mutex<SamplingState>,
    cache: Mutex<TopProcessesCache>,
    top_gate: RefreshGate,
    cpu_info: OnceCell<CpuInfo>,
}

impl ProcessorCollector {
    pub fn new(options: CollectorOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let monitor = Monitor::new("processor", options.update_interval, options.history_window);
            monitor.set_activation_hook(refresh_on_first_listen(weak.clone(), TOP_PROCESSES));

            Self {
                monitor,
                paths: options.paths,
                top_processes_limit: options.top_processes_limit,
                stat_task: CancellableTaskManager::new("processor.stat"),
                frequency_task: CancellableTaskManager::new("processor.frequency"),
                load_task: CancellableTaskManager::new("processor.load"),
                top_task: CancellableTaskManager::new("processor.top"),
                state: Mutex::new(SamplingState::default()),
                cache: Mutex::new(TopProcessesCache::new(
                    options.update_interval.as_secs_f64(),
                )),
                top_gate: RefreshGate::default(),
                cpu_info: OnceCell::new(),
            }
        })
    }

    /// Model name and logical core count, read once per process.
    pub fn cpu_info(&self) -> &CpuInfo {
        self.cpu_info.get_or_init(|| {
            procfs::read_cpu_info(&self.paths.proc_root).unwrap_or_else(|e| {
                warn!("Failed to read CPU info: {}", e);
                CpuInfo {
                    model_name: "Unknown".into(),
                    logical_cores: std::thread::available_parallelism()
                        .map(|n| n.get())
                        .unwrap_or(1),
                }
            })
        })
    }

    pub fn core_count(&self) -> usize {
        self.cpu_info().logical_cores.max(1)
    }

    fn refresh_stat(self: &Arc<Self>) {
        self.spawn_refresh(
            &self.stat_task,
            &[CPU_USAGE, CPU_CORES_USAGE],
            |this, ctx| async move { this.sample_stat(ctx).await },
        );
    }

    fn refresh_frequency(self: &Arc<Self>) {
        self.spawn_refresh(
            &self.frequency_task,
            &[CPU_CORES_FREQUENCY],
            |this, ctx| async move { this.sample_frequency(ctx).await },
        );
    }

    fn refresh_load(self: &Arc<Self>) {
        self.spawn_refresh(
            &self.load_task,
            &[CPU_LOAD_AVERAGE],
            |this, ctx| async move { this.sample_load(ctx).await },
        );
    }

    fn refresh_top_processes(self: &Arc<Self>) {
        self.spawn_refresh(
            &self.top_task,
            &[TOP_PROCESSES],
            |this, ctx| async move { this.sample_top_processes(ctx).await },
        );
    }

    #[instrument(level = "trace", skip_all, fields(collector = "processor"))]
    async fn sample_stat(&self, ctx: TaskContext) -> CollectResult<()> {
        let snapshot = procfs::read_cpu_stats(&self.paths.proc_root).await?;
        let updated = ctx.commit(|| self.apply_snapshot(snapshot))?;
        for key in updated {
            self.monitor.notify(key);
        }
        Ok(())
    }

    /// Feeds one /proc/stat read through the aggregate and per-core series.
    fn apply_snapshot(&self, snapshot: CpuSnapshot) -> Vec<&'static str> {
        let mut state = self.state.lock();
        let mut updated = Vec::new();

        if let Some(usage) = state
            .total
            .sample(snapshot.total)
            .and_then(|delta| CpuUsage::from_delta(&delta))
        {
            self.monitor.commit(CPU_USAGE, ProcessorValue::Usage(usage));
            updated.push(CPU_USAGE);
        }

        let seen: Vec<usize> = snapshot.cores.keys().copied().collect();
        let mut cores = Vec::with_capacity(seen.len());
        let mut complete = true;
        for (id, stat) in snapshot.cores {
            match state
                .cores
                .entry(id)
                .sample(stat)
                .and_then(|delta| CpuUsage::from_delta(&delta))
            {
                Some(usage) => cores.push(usage.total),
                None => complete = false,
            }
        }
        state.cores.retain_seen(&seen);

        if complete && !cores.is_empty() {
            self.monitor
                .commit(CPU_CORES_USAGE, ProcessorValue::CoresUsage(cores));
            updated.push(CPU_CORES_USAGE);
        }
        updated
    }

    async fn sample_frequency(&self, ctx: TaskContext) -> CollectResult<()> {
        let freqs = procfs::read_core_frequencies(&self.paths, self.core_count()).await?;
        ctx.commit(|| {
            self.monitor
                .commit(CPU_CORES_FREQUENCY, ProcessorValue::CoresFrequency(freqs))
        })?;
        self.monitor.notify(CPU_CORES_FREQUENCY);
        Ok(())
    }

    async fn sample_load(&self, ctx: TaskContext) -> CollectResult<()> {
        let load = procfs::read_load_average(&self.paths.proc_root).await?;
        ctx.commit(|| {
            self.monitor
                .commit(CPU_LOAD_AVERAGE, ProcessorValue::LoadAverage(load))
        })?;
        self.monitor.notify(CPU_LOAD_AVERAGE);
        Ok(())
    }

    #[instrument(level = "trace", skip_all, fields(collector = "processor"))]
    async fn sample_top_processes(self: Arc<Self>, ctx: TaskContext) -> CollectResult<()> {
        let total = procfs::read_cpu_stats(&self.paths.proc_root).await?.total;
        let this = self.clone();
        let scan = scan_with_metadata(
            self.paths.proc_root.clone(),
            ScanKind::CpuTicks,
            move |samples| uncached(samples, &this.cache.lock()),
        )
        .await?;

        let published = ctx.commit(|| self.apply_process_scan(total, scan))?;
        if published {
            self.monitor.notify(TOP_PROCESSES);
        }
        Ok(())
    }

    /// Shares of the whole machine since the previous scan, ranked.
    ///
    /// Returns false while the system total is warming up.
    fn apply_process_scan(&self, total: CpuStat, scan: ProcessScan) -> bool {
        let mut state = self.state.lock();
        let mut cache = self.cache.lock();
        scan.update_cache(&mut cache);

        let total_delta = state.top_total.sample(total).map(|delta| delta.total());
        let mut rows = Vec::new();
        for sample in &scan.samples {
            let ticks = state.process_ticks.sample(sample.pid, sample.value);
            let (Some(total_delta), Some(ticks)) = (total_delta, ticks) else {
                continue;
            };
            let (name, cmdline) = describe(&cache, sample);
            rows.push(TopProcess {
                pid: sample.pid,
                name,
                cmdline,
                value: (ticks as f64 / total_delta as f64 * 100.0).min(100.0),
            });
        }
        state.process_ticks.retain_seen(&scan.seen_pids());

        if total_delta.is_none() {
            trace!("processor: top processes warming up");
            return false;
        }
        let top = rank_top(rows, self.top_processes_limit);
        self.monitor
            .commit(TOP_PROCESSES, ProcessorValue::TopProcesses(top));
        true
    }

    fn task_for(&self, key: &str) -> Option<&CancellableTaskManager> {
        match key {
            CPU_USAGE | CPU_CORES_USAGE => Some(&self.stat_task),
            CPU_CORES_FREQUENCY => Some(&self.frequency_task),
            CPU_LOAD_AVERAGE => Some(&self.load_task),
            TOP_PROCESSES => Some(&self.top_task),
            _ => None,
        }
    }
}

impl Collector for ProcessorCollector {
    type Value = ProcessorValue;

    fn monitor(&self) -> &Monitor<ProcessorValue> {
        &self.monitor
    }

    fn metric_keys(&self) -> &'static [&'static str] {
        METRIC_KEYS
    }

    fn update(self: &Arc<Self>) {
        let monitor = &self.monitor;
        if monitor.is_listening_for(CPU_USAGE) || monitor.is_listening_for(CPU_CORES_USAGE) {
            self.refresh_stat();
        }
        if monitor.is_listening_for(CPU_CORES_FREQUENCY) {
            self.refresh_frequency();
        }
        if monitor.is_listening_for(CPU_LOAD_AVERAGE) {
            self.refresh_load();
        }
        if monitor.is_listening_for(TOP_PROCESSES) {
            self.top_gate.mark();
            self.refresh_top_processes();
        }
    }

    fn request_update(self: &Arc<Self>, key: &str, forced: bool) {
        let Some(task) = self.task_for(key) else {
            debug!("processor: update requested for unknown metric {}", key);
            return;
        };
        if !forced && task.is_running() {
            trace!("processor: {} refresh already in flight", key);
            return;
        }

        match key {
            CPU_USAGE | CPU_CORES_USAGE => self.refresh_stat(),
            CPU_CORES_FREQUENCY => self.refresh_frequency(),
            CPU_LOAD_AVERAGE => self.refresh_load(),
            _ => {
                if !self.top_gate.admit(forced) {
                    trace!("processor: top processes refreshed recently, skipping");
                    return;
                }
                self.refresh_top_processes();
            }
        }
    }

    fn reset(&self) {
        for task in [
            &self.stat_task,
            &self.frequency_task,
            &self.load_task,
            &self.top_task,
        ] {
            task.cancel();
        }
        *self.state.lock() = SamplingState::default();
        self.cache.lock().reset();
        self.top_gate.reset();
    }

    fn on_interval_changed(&self, interval: Duration) {
        self.cache.lock().set_update_interval(interval.as_secs_f64());
    }
}
