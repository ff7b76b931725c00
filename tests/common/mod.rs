//! Fake /proc and /sys trees for driving collectors end to end.

#![allow(dead_code)]

use herakles_res_monitor::procfs::SourcePaths;
use herakles_res_monitor::CollectorOptions;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub struct ProcFixture {
    dir: TempDir,
}

/// Writes through a temp file and a rename so a concurrent reader never sees
/// a half-written file.
fn write_atomic(path: &Path, content: impl AsRef<[u8]>) {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).unwrap();
    fs::rename(&tmp, path).unwrap();
}

impl ProcFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("proc")).unwrap();
        fs::create_dir_all(dir.path().join("sys")).unwrap();
        Self { dir }
    }

    pub fn proc_root(&self) -> PathBuf {
        self.dir.path().join("proc")
    }

    pub fn paths(&self) -> SourcePaths {
        SourcePaths {
            proc_root: self.proc_root(),
            sys_root: self.dir.path().join("sys"),
        }
    }

    pub fn options(&self, update_interval: Duration) -> CollectorOptions {
        CollectorOptions {
            paths: self.paths(),
            update_interval,
            history_window: Duration::from_secs(60),
            top_processes_limit: 2,
        }
    }

    /// /proc/stat with one core carrying all the load.
    pub fn write_stat(&self, user: u64, system: u64, idle: u64) {
        let line = |name: &str| format!("{name} {user} 0 {system} {idle} 0 0 0 0 0 0\n");
        let content = format!(
            "{}{}intr 0\nctxt 0\nbtime 0\nprocesses 1\n",
            line("cpu "),
            line("cpu0")
        );
        write_atomic(&self.proc_root().join("stat"), content);
    }

    pub fn write_meminfo(&self, total_kb: u64, available_kb: u64) {
        let content = format!(
            "MemTotal:       {total_kb} kB\n\
             MemFree:        {available_kb} kB\n\
             MemAvailable:   {available_kb} kB\n\
             SwapTotal:      0 kB\n\
             SwapFree:       0 kB\n"
        );
        write_atomic(&self.proc_root().join("meminfo"), content);
    }

    pub fn write_pid(&self, pid: u32, comm: &str, utime: u64, stime: u64, cmdline: &[u8]) {
        let dir = self.proc_root().join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        write_atomic(
            &dir.join("stat"),
            format!(
                "{pid} ({comm}) S 1 {pid} {pid} 0 -1 4194560 100 0 0 0 {utime} {stime} 0 0 20 0 1 0 100 0 0\n"
            ),
        );
        write_atomic(&dir.join("statm"), "1000 250 100 10 0 200 0\n");
        write_atomic(&dir.join("comm"), format!("{comm}\n"));
        write_atomic(&dir.join("cmdline"), cmdline);
    }
}

/// Listener callback that forwards notified keys into a channel.
pub fn key_channel() -> (
    impl Fn(&str) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<String>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |key: &str| {
            let _ = tx.send(key.to_string());
        },
        rx,
    )
}

pub async fn next_key(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no notification within 5s")
        .expect("listener dropped")
}

/// Polls `condition` for up to two seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
