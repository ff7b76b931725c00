//! Per-process sampling from /proc/<pid>.
//!
//! The scan fans out over pids with rayon and is meant to run on a blocking
//! thread. Processes that exit while being read are skipped.

use ahash::AHashMap as HashMap;
use rayon::prelude::*;
use serde::Serialize;
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::cache::{CachedProcess, TopProcessesCache};

/// Process entry representing a directory in /proc filesystem.
#[derive(Debug, Clone)]
pub struct ProcEntry {
    pub pid: u32,
    pub proc_path: PathBuf,
}

/// Scans the proc root for numeric (pid) directories.
pub fn collect_proc_entries(root: &Path) -> Vec<ProcEntry> {
    let mut out = Vec::new();
    if let Ok(entries) = fs::read_dir(root) {
        for entry in entries.flatten() {
            let p = entry.path();
            let Some(name) = p.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if !name.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let Ok(pid) = name.parse::<u32>() else {
                continue;
            };
            out.push(ProcEntry { pid, proc_path: p });
        }
    }
    out
}

/// Fields of interest from /proc/<pid>/stat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidStat {
    pub comm: String,
    pub utime: u64,
    pub stime: u64,
}

impl PidStat {
    pub fn ticks(&self) -> u64 {
        self.utime + self.stime
    }
}

/// Parses /proc/<pid>/stat.
///
/// The command name sits in parentheses and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
pub fn parse_pid_stat(content: &str) -> Option<PidStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    if close < open {
        return None;
    }
    let comm = content[open + 1..close].to_string();
    // After ")": state(3) ppid(4) ... utime(14) stime(15)
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    if rest.len() < 13 {
        return None;
    }
    Some(PidStat {
        comm,
        utime: rest[11].parse().ok()?,
        stime: rest[12].parse().ok()?,
    })
}

/// Resident pages from /proc/<pid>/statm (second field).
pub fn parse_statm_resident(content: &str) -> Option<u64> {
    content.split_whitespace().nth(1)?.parse().ok()
}

/// Reads process name from comm file or extracts from cmdline.
pub fn read_process_name(proc_path: &Path) -> Option<String> {
    if let Ok(s) = fs::read_to_string(proc_path.join("comm")) {
        let t = s.trim();
        if !t.is_empty() {
            return Some(t.into());
        }
    }

    let cmdline = read_cmdline(proc_path)?;
    let first = cmdline.split(' ').next()?;
    Path::new(first)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
}

/// Reads the NUL-separated command line, joined with spaces.
pub fn read_cmdline(proc_path: &Path) -> Option<String> {
    let content = fs::read(proc_path.join("cmdline")).ok()?;
    join_args(&content)
}

fn join_args(content: &[u8]) -> Option<String> {
    let parts: Vec<String> = content
        .split(|&b| b == 0u8)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// What a scan reads for every pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    /// utime + stime from /proc/<pid>/stat.
    CpuTicks,
    /// Resident set from /proc/<pid>/statm.
    ResidentBytes,
}

/// One successfully read process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcSample {
    pub pid: u32,
    pub comm: String,
    pub value: u64,
}

/// Reads every pid under `proc_root` in parallel. Blocking.
pub fn scan_processes(proc_root: &Path, kind: ScanKind, page_size: u64) -> Vec<ProcSample> {
    let entries = collect_proc_entries(proc_root);
    let samples: Vec<ProcSample> = entries
        .par_iter()
        .filter_map(|entry| match kind {
            ScanKind::CpuTicks => {
                let content = fs::read_to_string(entry.proc_path.join("stat")).ok()?;
                let stat = parse_pid_stat(&content)?;
                Some(ProcSample {
                    pid: entry.pid,
                    value: stat.ticks(),
                    comm: stat.comm,
                })
            }
            ScanKind::ResidentBytes => {
                let content = fs::read_to_string(entry.proc_path.join("statm")).ok()?;
                let pages = parse_statm_resident(&content)?;
                let comm = read_process_name(&entry.proc_path).unwrap_or_default();
                Some(ProcSample {
                    pid: entry.pid,
                    comm,
                    value: pages * page_size,
                })
            }
        })
        .collect();

    debug!(
        "Scanned {} of {} process entries under {}",
        samples.len(),
        entries.len(),
        proc_root.display()
    );
    samples
}

/// Reads display metadata for processes not yet cached. Blocking.
///
/// An empty command line (kernel thread) is cached as `[comm]`. Pids whose
/// command line cannot be read at all are left out so a later scan retries
/// them instead of caching a placeholder for good.
pub fn read_metadata(proc_root: &Path, uncached: &[ProcSample]) -> Vec<CachedProcess> {
    uncached
        .iter()
        .filter_map(|s| {
            let path = proc_root.join(s.pid.to_string());
            let content = match fs::read(path.join("cmdline")) {
                Ok(content) => content,
                Err(e) => {
                    trace!("pid {}: cmdline unreadable: {}", s.pid, e);
                    return None;
                }
            };
            let cmdline = join_args(&content).unwrap_or_else(|| format!("[{}]", s.comm));
            Some(CachedProcess::new(s.pid, s.comm.clone(), cmdline))
        })
        .collect()
}

/// Samples whose pid has no cache entry yet.
pub fn uncached(samples: &[ProcSample], cache: &TopProcessesCache) -> Vec<ProcSample> {
    samples
        .iter()
        .filter(|s| cache.get_process(s.pid).is_none())
        .cloned()
        .collect()
}

/// Previous cumulative ticks per pid.
#[derive(Debug, Clone, Default)]
pub struct ProcessTicksTracker {
    previous: HashMap<u32, u64>,
}

impl ProcessTicksTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `ticks` for `pid` and returns the delta since the last sample.
    ///
    /// `None` on the first sighting of a pid and when the counter went
    /// backwards (pid reused by a new process).
    pub fn sample(&mut self, pid: u32, ticks: u64) -> Option<u64> {
        let delta = self
            .previous
            .get(&pid)
            .and_then(|prev| ticks.checked_sub(*prev));
        self.previous.insert(pid, ticks);
        delta
    }

    pub fn retain_seen(&mut self, seen: &[u32]) {
        let seen: ahash::AHashSet<u32> = seen.iter().copied().collect();
        self.previous.retain(|pid, _| seen.contains(pid));
    }

    pub fn reset(&mut self) {
        self.previous.clear();
    }
}

/// One row of a top-processes ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopProcess {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
    /// CPU share of the whole machine in percent, or resident bytes,
    /// depending on the collector.
    pub value: f64,
}

/// Sorts descending by value and keeps the first `limit` rows.
pub fn rank_top(mut rows: Vec<TopProcess>, limit: usize) -> Vec<TopProcess> {
    rows.sort_by(|a, b| {
        b.value
            .partial_cmp(&a.value)
            .unwrap_or(Ordering::Equal)
            .then(a.pid.cmp(&b.pid))
    });
    rows.truncate(limit);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pid(root: &Path, pid: u32, comm: &str, utime: u64, stime: u64, cmdline: &[u8]) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("stat"),
            format!(
                "{} ({}) S 1 {} {} 0 -1 4194560 100 0 0 0 {} {} 0 0 20 0 1 0 100 0 0\n",
                pid, comm, pid, pid, utime, stime
            ),
        )
        .unwrap();
        fs::write(dir.join("statm"), "1000 250 100 10 0 200 0\n").unwrap();
        fs::write(dir.join("comm"), format!("{}\n", comm)).unwrap();
        fs::write(dir.join("cmdline"), cmdline).unwrap();
    }

    #[test]
    fn test_parse_pid_stat_with_spaces_in_comm() {
        let content = "1234 (Web Content (x)) S 1 1234 1234 0 -1 4194560 100 0 0 0 250 75 0 0 20 0 1 0";
        let stat = parse_pid_stat(content).unwrap();
        assert_eq!(stat.comm, "Web Content (x)");
        assert_eq!(stat.utime, 250);
        assert_eq!(stat.stime, 75);
        assert_eq!(stat.ticks(), 325);
    }

    #[test]
    fn test_parse_pid_stat_truncated() {
        assert!(parse_pid_stat("1234 (bash) S 1 2").is_none());
        assert!(parse_pid_stat("garbage").is_none());
    }

    #[test]
    fn test_scan_skips_non_pid_entries() {
        let root = tempfile::tempdir().unwrap();
        write_pid(root.path(), 10, "bash", 5, 5, b"/bin/bash\0-l\0");
        write_pid(root.path(), 11, "sleep", 1, 0, b"sleep\x0030\0");
        fs::create_dir_all(root.path().join("self")).unwrap();
        fs::create_dir_all(root.path().join("12")).unwrap(); // exited mid-scan

        let mut samples = scan_processes(root.path(), ScanKind::CpuTicks, 4096);
        samples.sort_by_key(|s| s.pid);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].value, 10);
        assert_eq!(samples[1].comm, "sleep");

        let resident = scan_processes(root.path(), ScanKind::ResidentBytes, 4096);
        assert!(resident.iter().all(|s| s.value == 250 * 4096));
    }

    #[test]
    fn test_read_cmdline_and_name() {
        let root = tempfile::tempdir().unwrap();
        write_pid(root.path(), 20, "bash", 0, 0, b"/bin/bash\0-l\0");
        let path = root.path().join("20");
        assert_eq!(read_cmdline(&path).unwrap(), "/bin/bash -l");
        assert_eq!(read_process_name(&path).unwrap(), "bash");

        write_pid(root.path(), 21, "kworker/0:1", 0, 0, b"");
        assert!(read_cmdline(&root.path().join("21")).is_none());
    }

    #[test]
    fn test_missing_metadata_only_for_uncached() {
        let root = tempfile::tempdir().unwrap();
        write_pid(root.path(), 30, "vim", 0, 0, b"vim\0notes.txt\0");
        let mut cache = TopProcessesCache::new(1.0);
        cache.set_process(CachedProcess::new(31, "cached", "cached"));

        let samples = vec![
            ProcSample { pid: 30, comm: "vim".into(), value: 0 },
            ProcSample { pid: 31, comm: "cached".into(), value: 0 },
            ProcSample { pid: 32, comm: "kthreadd".into(), value: 0 },
        ];
        write_pid(root.path(), 32, "kthreadd", 0, 0, b"");
        let missing = read_metadata(root.path(), &uncached(&samples, &cache));
        assert_eq!(missing.len(), 2);
        assert_eq!(missing[0].cmdline, "vim notes.txt");
        assert_eq!(missing[1].cmdline, "[kthreadd]");
    }

    #[test]
    fn test_unreadable_cmdline_is_not_cached() {
        let root = tempfile::tempdir().unwrap();
        write_pid(root.path(), 40, "postgres", 0, 0, b"postgres\0-D\0/data\0");
        write_pid(root.path(), 41, "racing", 0, 0, b"racing\0");
        fs::remove_file(root.path().join("41").join("cmdline")).unwrap();
        let samples = vec![
            ProcSample { pid: 40, comm: "postgres".into(), value: 0 },
            ProcSample { pid: 41, comm: "racing".into(), value: 0 },
            ProcSample { pid: 42, comm: "gone".into(), value: 0 },
        ];

        let mut cache = TopProcessesCache::new(1.0);
        for entry in read_metadata(root.path(), &uncached(&samples, &cache)) {
            cache.set_process(entry);
        }
        assert_eq!(cache.get_process(40).unwrap().cmdline, "postgres -D /data");
        assert!(cache.get_process(41).is_none());
        assert!(cache.get_process(42).is_none());

        // Once readable again the next scan picks it up.
        fs::write(root.path().join("41").join("cmdline"), b"racing\0--fast\0").unwrap();
        let retry = uncached(&samples, &cache);
        assert_eq!(retry.iter().map(|s| s.pid).collect::<Vec<_>>(), vec![41, 42]);
        for entry in read_metadata(root.path(), &retry) {
            cache.set_process(entry);
        }
        assert_eq!(cache.get_process(41).unwrap().cmdline, "racing --fast");
    }

    #[test]
    fn test_ticks_tracker() {
        let mut tracker = ProcessTicksTracker::new();
        assert_eq!(tracker.sample(1, 100), None);
        assert_eq!(tracker.sample(1, 130), Some(30));
        assert_eq!(tracker.sample(1, 10), None);
        tracker.retain_seen(&[]);
        assert_eq!(tracker.sample(1, 50), None);
    }

    #[test]
    fn test_rank_top_sorts_and_truncates() {
        let rows = (0..20)
            .map(|i| TopProcess {
                pid: i,
                name: format!("p{}", i),
                cmdline: String::new(),
                value: f64::from(i % 7),
            })
            .collect();
        let top = rank_top(rows, 15);
        assert_eq!(top.len(), 15);
        assert!(top.windows(2).all(|w| w[0].value >= w[1].value));
        assert_eq!(top[0].value, 6.0);
    }
}
