//! Identity cache for process display metadata.
//!
//! Reading `/proc/<pid>/cmdline` on every sample is wasteful since it never
//! changes for a live process. This module keeps the last-known name and
//! command line per pid and forgets pids that have not been seen for roughly
//! five minutes of wall-clock time, whatever the polling interval is.

use ahash::AHashMap as HashMap;
use tracing::trace;

/// Wall-clock absence after which a cached process is forgotten.
pub const ABSENCE_EVICTION_SECS: f64 = 300.0;

/// Last-known metadata for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedProcess {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
    pub not_seen: u32,
}

impl CachedProcess {
    pub fn new(pid: u32, name: impl Into<String>, cmdline: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
            cmdline: cmdline.into(),
            not_seen: 0,
        }
    }
}

/// Cache of process metadata keyed by pid.
#[derive(Debug, Clone)]
pub struct TopProcessesCache {
    processes: HashMap<u32, CachedProcess>,
    update_interval_secs: f64,
}

impl TopProcessesCache {
    pub fn new(update_interval_secs: f64) -> Self {
        Self {
            processes: HashMap::new(),
            update_interval_secs,
        }
    }

    pub fn get_process(&self, pid: u32) -> Option<&CachedProcess> {
        self.processes.get(&pid)
    }

    pub fn set_process(&mut self, process: CachedProcess) {
        self.processes.insert(process.pid, process);
    }

    pub fn set_update_interval(&mut self, update_interval_secs: f64) {
        self.update_interval_secs = update_interval_secs;
    }

    /// Number of consecutive absences tolerated before eviction.
    pub fn eviction_threshold(&self) -> u32 {
        let samples = ABSENCE_EVICTION_SECS / self.update_interval_secs.max(f64::EPSILON);
        samples.ceil().min(f64::from(u32::MAX)) as u32
    }

    /// Ages out pids missing from `seen`, resets the ones present.
    pub fn update_not_seen(&mut self, seen: &[u32]) {
        let threshold = self.eviction_threshold();
        let seen: ahash::AHashSet<u32> = seen.iter().copied().collect();
        for (pid, process) in self.processes.iter_mut() {
            if seen.contains(pid) {
                process.not_seen = 0;
            } else {
                process.not_seen = process.not_seen.saturating_add(1);
            }
        }

        let before = self.processes.len();
        self.processes.retain(|_, process| process.not_seen <= threshold);
        let evicted = before - self.processes.len();
        if evicted > 0 {
            trace!("Evicted {} stale processes from cache", evicted);
        }
    }

    pub fn reset(&mut self) {
        self.processes.clear();
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut cache = TopProcessesCache::new(1.5);
        cache.set_process(CachedProcess::new(42, "bash", "/bin/bash -l"));
        let entry = cache.get_process(42).unwrap();
        assert_eq!(entry.name, "bash");
        assert_eq!(entry.cmdline, "/bin/bash -l");
        assert!(cache.get_process(7).is_none());
    }

    #[test]
    fn test_eviction_after_threshold() {
        let interval = 7.0;
        let misses = (ABSENCE_EVICTION_SECS / interval).ceil() as usize + 1;
        let mut cache = TopProcessesCache::new(interval);
        cache.set_process(CachedProcess::new(1, "init", "/sbin/init"));

        for _ in 0..misses - 1 {
            cache.update_not_seen(&[]);
        }
        assert!(cache.get_process(1).is_some());

        cache.update_not_seen(&[]);
        assert!(cache.get_process(1).is_none());
    }

    #[test]
    fn test_reappearing_process_resets_counter() {
        let mut cache = TopProcessesCache::new(60.0);
        cache.set_process(CachedProcess::new(9, "sshd", "sshd: user"));

        for _ in 0..4 {
            cache.update_not_seen(&[]);
        }
        assert_eq!(cache.get_process(9).unwrap().not_seen, 4);

        cache.update_not_seen(&[9]);
        assert_eq!(cache.get_process(9).unwrap().not_seen, 0);

        // Threshold is 300 / 60 = 5 absences.
        for _ in 0..5 {
            cache.update_not_seen(&[1, 2]);
        }
        assert!(cache.get_process(9).is_some());
        cache.update_not_seen(&[]);
        assert!(cache.get_process(9).is_none());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut cache = TopProcessesCache::new(1.0);
        cache.set_process(CachedProcess::new(1, "a", "a"));
        cache.set_process(CachedProcess::new(2, "b", "b"));
        cache.reset();
        assert!(cache.is_empty());
    }
}
