//! Storage collector: disk throughput from /proc/diskstats and capacity of
//! one mount point.

use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

use crate::collector::{Collector, CollectorOptions};
use crate::delta::{Counters, KeyedRateSeries};
use crate::error::CollectResult;
use crate::monitor::Monitor;
use crate::procfs::{self, DiskStat, FsUsage, SourcePaths};
use crate::task::{CancellableTaskManager, TaskContext};

pub const STORAGE_IO: &str = "storageIO";
pub const STORAGE_DEVICES_IO: &str = "storageDevicesIO";
pub const STORAGE_USAGE: &str = "storageUsage";

const METRIC_KEYS: &[&str] = &[STORAGE_IO, STORAGE_DEVICES_IO, STORAGE_USAGE];

/// /proc/diskstats counts 512-byte sectors regardless of the device.
const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct DiskCounters {
    read: u64,
    written: u64,
}

impl Counters for DiskCounters {
    fn delta(&self, previous: &Self) -> Option<Self> {
        Some(DiskCounters {
            read: self.read.checked_sub(previous.read)?,
            written: self.written.checked_sub(previous.written)?,
        })
    }

    fn total(&self) -> u64 {
        self.read + self.written
    }
}

impl From<&DiskStat> for DiskCounters {
    fn from(stat: &DiskStat) -> Self {
        DiskCounters {
            read: stat.read_sectors * SECTOR_SIZE,
            written: stat.written_sectors * SECTOR_SIZE,
        }
    }
}

/// Bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IoRate {
    pub read: f64,
    pub write: f64,
}

impl IoRate {
    fn from_delta(delta: DiskCounters, elapsed: f64) -> Self {
        IoRate {
            read: delta.read as f64 / elapsed,
            write: delta.written as f64 / elapsed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceIo {
    pub name: String,
    #[serde(flatten)]
    pub rate: IoRate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageValue {
    Io(IoRate),
    DevicesIo(Vec<DeviceIo>),
    Usage(FsUsage),
}

#[derive(Default)]
struct SamplingState {
    devices: KeyedRateSeries<String, DiskCounters>,
}

pub struct StorageCollector {
    monitor: Monitor<StorageValue>,
    paths: SourcePaths,
    mount: PathBuf,
    io_task: CancellableTaskManager,
    usage_task: CancellableTaskManager,
    state: Mutex<SamplingState>,
}

impl StorageCollector {
    pub fn new(options: CollectorOptions, mount: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            monitor: Monitor::new("storage", options.update_interval, options.history_window),
            paths: options.paths,
            mount,
            io_task: CancellableTaskManager::new("storage.io"),
            usage_task: CancellableTaskManager::new("storage.usage"),
            state: Mutex::new(SamplingState::default()),
        })
    }

    fn refresh_io(self: &Arc<Self>) {
        self.spawn_refresh(
            &self.io_task,
            &[STORAGE_IO, STORAGE_DEVICES_IO],
            |this, ctx| async move { this.sample_io(ctx).await },
        );
    }

    fn refresh_usage(self: &Arc<Self>) {
        self.spawn_refresh(
            &self.usage_task,
            &[STORAGE_USAGE],
            |this, ctx| async move { this.sample_usage(ctx).await },
        );
    }

    async fn sample_io(&self, ctx: TaskContext) -> CollectResult<()> {
        let stats = procfs::read_diskstats(&self.paths.proc_root).await?;
        let whole_disks = match procfs::read_block_devices(&self.paths.sys_root).await {
            Ok(names) => Some(names),
            Err(e) => {
                debug!("storage: no block device list, using every disk: {}", e);
                None
            }
        };
        let now = Instant::now();
        let updated = ctx.commit(|| self.apply_diskstats(stats, whole_disks.as_deref(), now))?;
        for key in updated {
            self.monitor.notify(key);
        }
        Ok(())
    }

    /// Feeds one /proc/diskstats read through the rate series.
    ///
    /// Partitions are left out so their I/O is not counted twice; without a
    /// device list only loop and ram devices are dropped.
    fn apply_diskstats(
        &self,
        stats: Vec<DiskStat>,
        whole_disks: Option<&[String]>,
        now: Instant,
    ) -> Vec<&'static str> {
        let disks: Vec<DiskStat> = stats
            .into_iter()
            .filter(|d| match whole_disks {
                Some(names) => names.contains(&d.name),
                None => !d.name.starts_with("loop") && !d.name.starts_with("ram"),
            })
            .collect();

        let mut state = self.state.lock();
        let mut updated = Vec::new();

        let mut devices = Vec::with_capacity(disks.len());
        for disk in &disks {
            if let Some((delta, elapsed)) = state
                .devices
                .entry(disk.name.clone())
                .sample_at(DiskCounters::from(disk), now)
            {
                devices.push(DeviceIo {
                    name: disk.name.clone(),
                    rate: IoRate::from_delta(delta, elapsed),
                });
            }
        }
        let names: Vec<String> = disks.into_iter().map(|d| d.name).collect();
        state.devices.retain_seen(&names);

        // Summed from per-device rates so a disk that just appeared does not
        // add its lifetime I/O to the total.
        if devices.is_empty() {
            trace!("storage: aggregate I/O warming up");
        } else {
            let total = devices.iter().fold(IoRate { read: 0.0, write: 0.0 }, |acc, d| IoRate {
                read: acc.read + d.rate.read,
                write: acc.write + d.rate.write,
            });
            self.monitor.commit(STORAGE_IO, StorageValue::Io(total));
            updated.push(STORAGE_IO);
            self.monitor
                .commit(STORAGE_DEVICES_IO, StorageValue::DevicesIo(devices));
            updated.push(STORAGE_DEVICES_IO);
        }
        updated
    }

    async fn sample_usage(&self, ctx: TaskContext) -> CollectResult<()> {
        let usage = procfs::read_fs_usage(self.mount.clone()).await?;
        ctx.commit(|| self.monitor.commit(STORAGE_USAGE, StorageValue::Usage(usage)))?;
        self.monitor.notify(STORAGE_USAGE);
        Ok(())
    }
}

impl Collector for StorageCollector {
    type Value = StorageValue;

    fn monitor(&self) -> &Monitor<StorageValue> {
        &self.monitor
    }

    fn metric_keys(&self) -> &'static [&'static str] {
        METRIC_KEYS
    }

    fn update(self: &Arc<Self>) {
        if self.monitor.is_listening_for(STORAGE_IO)
            || self.monitor.is_listening_for(STORAGE_DEVICES_IO)
        {
            self.refresh_io();
        }
        if self.monitor.is_listening_for(STORAGE_USAGE) {
            self.refresh_usage();
        }
    }

    fn request_update(self: &Arc<Self>, key: &str, forced: bool) {
        match key {
            STORAGE_IO | STORAGE_DEVICES_IO => {
                if forced || !self.io_task.is_running() {
                    self.refresh_io();
                }
            }
            STORAGE_USAGE => {
                if forced || !self.usage_task.is_running() {
                    self.refresh_usage();
                }
            }
            _ => debug!("storage: update requested for unknown metric {}", key),
        }
    }

    fn reset(&self) {
        self.io_task.cancel();
        self.usage_task.cancel();
        let mut state = self.state.lock();
        state.devices.reset();
    }
}
