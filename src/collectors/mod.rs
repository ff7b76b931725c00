//! Resource collectors and the bundle the binary wires together.

pub mod memory;
pub mod network;
pub mod processor;
pub mod sensors;
pub mod storage;

pub use memory::{MemoryCollector, MemoryUsage, MemoryValue};
pub use network::{NetworkCollector, NetworkValue};
pub use processor::{ProcessorCollector, ProcessorValue};
pub use sensors::{SensorsCollector, SensorsValue};
pub use storage::{StorageCollector, StorageValue};

use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::cache::{CachedProcess, TopProcessesCache};
use crate::collector::Collector;
use crate::config::Config;
use crate::error::{CollectError, CollectResult};
use crate::monitor::{MetricStatus, SubscriberId};
use crate::process::{read_metadata, scan_processes, ProcSample, ScanKind};
use crate::procfs::PAGE_SIZE;
use crate::settings::{self, CollectorKind, SettingsBus};

/// Result of one process scan plus metadata for pids the cache lacks.
#[derive(Debug, Default)]
pub(crate) struct ProcessScan {
    pub(crate) samples: Vec<ProcSample>,
    pub(crate) metadata: Vec<CachedProcess>,
}

impl ProcessScan {
    pub(crate) fn seen_pids(&self) -> Vec<u32> {
        self.samples.iter().map(|s| s.pid).collect()
    }

    /// Stores new metadata and ages out pids missing from this scan.
    pub(crate) fn update_cache(&self, cache: &mut TopProcessesCache) {
        for entry in &self.metadata {
            cache.set_process(entry.clone());
        }
        cache.update_not_seen(&self.seen_pids());
    }
}

/// Scans `proc_root` on a blocking thread and reads metadata for the samples
/// `uncached` picks.
pub(crate) async fn scan_with_metadata<F>(
    proc_root: PathBuf,
    kind: ScanKind,
    uncached: F,
) -> CollectResult<ProcessScan>
where
    F: FnOnce(&[ProcSample]) -> Vec<ProcSample> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let samples = scan_processes(&proc_root, kind, *PAGE_SIZE);
        let missing = uncached(&samples);
        let metadata = read_metadata(&proc_root, &missing);
        ProcessScan { samples, metadata }
    })
    .await
    .map_err(|e| CollectError::Task(e.to_string()))
}

/// Display name and command line, from the cache or the scan itself.
pub(crate) fn describe(cache: &TopProcessesCache, sample: &ProcSample) -> (String, String) {
    match cache.get_process(sample.pid) {
        Some(entry) => (entry.name.clone(), entry.cmdline.clone()),
        None => (sample.comm.clone(), format!("[{}]", sample.comm)),
    }
}

/// One instance of every collector.
pub struct Collectors {
    pub processor: Arc<ProcessorCollector>,
    pub memory: Arc<MemoryCollector>,
    pub storage: Arc<StorageCollector>,
    pub network: Arc<NetworkCollector>,
    pub sensors: Arc<SensorsCollector>,
}

macro_rules! for_kind {
    ($self:ident, $kind:expr, |$c:ident| $body:expr) => {
        match $kind {
            CollectorKind::Processor => { let $c = &$self.processor; $body }
            CollectorKind::Memory => { let $c = &$self.memory; $body }
            CollectorKind::Storage => { let $c = &$self.storage; $body }
            CollectorKind::Network => { let $c = &$self.network; $body }
            CollectorKind::Sensors => { let $c = &$self.sensors; $body }
        }
    };
}

impl Collectors {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            processor: ProcessorCollector::new(cfg.collector_options(CollectorKind::Processor)),
            memory: MemoryCollector::new(cfg.collector_options(CollectorKind::Memory)),
            storage: StorageCollector::new(
                cfg.collector_options(CollectorKind::Storage),
                cfg.storage_mount(),
            ),
            network: NetworkCollector::new(cfg.collector_options(CollectorKind::Network)),
            sensors: SensorsCollector::new(
                cfg.collector_options(CollectorKind::Sensors),
                cfg.sensors_command.clone(),
            ),
        }
    }

    /// Applies the configured settings and spawns one dispatcher per collector.
    pub fn attach_all(&self, cfg: &Config, bus: &SettingsBus) -> Vec<JoinHandle<()>> {
        CollectorKind::ALL
            .iter()
            .map(|&kind| {
                let initial = cfg.collector_settings(kind);
                for_kind!(self, kind, |c| settings::attach(c, kind, initial, bus))
            })
            .collect()
    }

    pub fn stop_all(&self) {
        for kind in CollectorKind::ALL {
            for_kind!(self, kind, |c| c.stop());
        }
    }

    pub fn is_running(&self, kind: CollectorKind) -> bool {
        for_kind!(self, kind, |c| c.is_running())
    }

    pub fn metric_keys(&self, kind: CollectorKind) -> &'static [&'static str] {
        for_kind!(self, kind, |c| c.metric_keys())
    }

    /// Subscribes `callback` to `key` of one collector.
    ///
    /// Returns false when the collector has no such metric.
    pub fn listen<F>(
        &self,
        kind: CollectorKind,
        subscriber: SubscriberId,
        key: &str,
        callback: F,
    ) -> bool
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if !self.metric_keys(kind).iter().any(|k| *k == key) {
            return false;
        }
        for_kind!(self, kind, |c| c.monitor().listen(subscriber, key, callback));
        true
    }

    /// Listener count summed over all collectors.
    pub fn listener_count(&self) -> usize {
        CollectorKind::ALL
            .iter()
            .map(|&kind| for_kind!(self, kind, |c| c.monitor().listener_count()))
            .sum()
    }

    pub fn unlisten(&self, subscriber: SubscriberId) {
        for kind in CollectorKind::ALL {
            for_kind!(self, kind, |c| c.monitor().unlisten(subscriber, None));
        }
    }

    /// Current value of a metric as JSON.
    pub fn current_json(&self, kind: CollectorKind, key: &str) -> Option<serde_json::Value> {
        for_kind!(self, kind, |c| c
            .monitor()
            .current_value(key)
            .and_then(|v| serde_json::to_value(v).ok()))
    }

    pub fn status(&self, kind: CollectorKind, key: &str) -> MetricStatus {
        for_kind!(self, kind, |c| c.monitor().status(key))
    }

    /// Number of samples currently kept for a metric.
    pub fn history_len(&self, kind: CollectorKind, key: &str) -> usize {
        for_kind!(self, kind, |c| c.monitor().usage_history(key).len())
    }

    /// Forces a refresh of one metric outside the regular tick.
    pub fn request_update(&self, kind: CollectorKind, key: &str, forced: bool) {
        for_kind!(self, kind, |c| c.request_update(key, forced))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_prefers_cache() {
        let mut cache = TopProcessesCache::new(1.5);
        cache.set_process(CachedProcess::new(1, "init", "/sbin/init splash"));
        let cached = ProcSample {
            pid: 1,
            comm: "systemd".into(),
            value: 0,
        };
        let fresh = ProcSample {
            pid: 2,
            comm: "kthreadd".into(),
            value: 0,
        };
        assert_eq!(
            describe(&cache, &cached),
            ("init".to_string(), "/sbin/init splash".to_string())
        );
        assert_eq!(
            describe(&cache, &fresh),
            ("kthreadd".to_string(), "[kthreadd]".to_string())
        );
    }

    #[test]
    fn test_scan_updates_cache_and_ages_missing() {
        let mut cache = TopProcessesCache::new(150.0);
        cache.set_process(CachedProcess::new(9, "gone", "gone"));
        let scan = ProcessScan {
            samples: vec![ProcSample {
                pid: 1,
                comm: "a".into(),
                value: 1,
            }],
            metadata: vec![CachedProcess::new(1, "a", "/bin/a")],
        };
        scan.update_cache(&mut cache);
        assert!(cache.get_process(1).is_some());
        assert_eq!(cache.get_process(9).map(|p| p.not_seen), Some(1));
        assert_eq!(scan.seen_pids(), vec![1]);
    }

    #[test]
    fn test_listen_rejects_unknown_keys() {
        let collectors = Collectors::from_config(&Config::default());
        let sub = SubscriberId::next();
        assert!(!collectors.listen(CollectorKind::Memory, sub, "cpuUsage", |_| {}));
        assert!(collectors.listen(CollectorKind::Processor, sub, "cpuUsage", |_| {}));
        assert!(collectors.processor.monitor().is_listening_for("cpuUsage"));

        collectors.unlisten(sub);
        assert_eq!(collectors.processor.monitor().listener_count(), 0);
    }
}
