//! System-wide counters read from the /proc and /sys filesystems.
//!
//! Each source has a pure `parse_*` function over the file content and an
//! async `read_*` wrapper taking the filesystem root, so collectors can be
//! pointed at fixture trees.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::trace;

use crate::error::{CollectError, CollectResult};

/// Memory page size in bytes, used for `/proc/<pid>/statm`.
pub static PAGE_SIZE: Lazy<u64> = Lazy::new(|| {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
});

/// Roots of the kernel pseudo-filesystems a collector reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePaths {
    pub proc_root: PathBuf,
    pub sys_root: PathBuf,
}

impl Default for SourcePaths {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            sys_root: PathBuf::from("/sys"),
        }
    }
}

pub(crate) async fn read_file(path: PathBuf) -> CollectResult<String> {
    trace!("Reading {}", path.display());
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| CollectError::read(path, e))
}

/// System load averages for 1, 5, and 15 minute intervals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadAverage {
    pub one_min: f64,
    pub five_min: f64,
    pub fifteen_min: f64,
}

/// CPU time counters from one `cpu*` line of /proc/stat, in clock ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuStat {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuStat {
    /// Calculate total CPU time (all fields).
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }
}

/// Aggregate and per-core counters from one read of /proc/stat.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CpuSnapshot {
    pub total: CpuStat,
    pub cores: BTreeMap<usize, CpuStat>,
}

/// Static processor facts from /proc/cpuinfo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuInfo {
    pub model_name: String,
    pub logical_cores: usize,
}

/// Memory counters from /proc/meminfo, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemInfo {
    pub total: u64,
    pub free: u64,
    pub available: u64,
    pub swap_total: u64,
    pub swap_free: u64,
}

/// Cumulative I/O counters of one block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskStat {
    pub name: String,
    pub read_sectors: u64,
    pub written_sectors: u64,
}

/// Cumulative traffic counters of one network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetDevStat {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Filesystem capacity figures, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsUsage {
    pub total: u64,
    pub available: u64,
    pub used: u64,
}

/// One temperature reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Temperature {
    pub chip: String,
    pub label: String,
    pub celsius: f64,
}

/// Parses /proc/loadavg. Format: "0.00 0.01 0.05 1/234 5678"
pub fn parse_load_average(content: &str) -> Result<LoadAverage, String> {
    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(format!(
            "expected at least 3 fields, got {}",
            parts.len()
        ));
    }

    let field = |i: usize| {
        parts[i]
            .parse::<f64>()
            .map_err(|e| format!("failed to parse field {}: {}", i + 1, e))
    };

    Ok(LoadAverage {
        one_min: field(0)?,
        five_min: field(1)?,
        fifteen_min: field(2)?,
    })
}

fn parse_cpu_line(parts: &[&str]) -> Result<CpuStat, String> {
    if parts.len() < 8 {
        return Err(format!(
            "{}: expected at least 7 counters, got {}",
            parts[0],
            parts.len() - 1
        ));
    }
    let field = |i: usize| {
        parts[i]
            .parse::<u64>()
            .map_err(|e| format!("{}: bad counter {:?}: {}", parts[0], parts[i], e))
    };
    let steal = if parts.len() > 8 { field(8)? } else { 0 };

    Ok(CpuStat {
        user: field(1)?,
        nice: field(2)?,
        system: field(3)?,
        idle: field(4)?,
        iowait: field(5)?,
        irq: field(6)?,
        softirq: field(7)?,
        steal,
    })
}

/// Parses the `cpu` and `cpuN` lines of /proc/stat.
pub fn parse_cpu_stats(content: &str) -> Result<CpuSnapshot, String> {
    let mut total = None;
    let mut cores = BTreeMap::new();

    for line in content.lines() {
        if !line.starts_with("cpu") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let stat = parse_cpu_line(&parts)?;
        match parts[0].strip_prefix("cpu") {
            Some("") => total = Some(stat),
            Some(id) => {
                let id = id
                    .parse::<usize>()
                    .map_err(|_| format!("unexpected cpu line {:?}", parts[0]))?;
                cores.insert(id, stat);
            }
            None => {}
        }
    }

    let total = total.ok_or_else(|| "no aggregate cpu line".to_string())?;
    Ok(CpuSnapshot { total, cores })
}

/// Parses model name and logical core count from /proc/cpuinfo.
pub fn parse_cpu_info(content: &str) -> CpuInfo {
    let mut model_name = None;
    let mut logical_cores = 0;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "processor" => logical_cores += 1,
            "model name" | "Model" | "cpu model" if model_name.is_none() => {
                model_name = Some(value.trim().to_string());
            }
            _ => {}
        }
    }

    CpuInfo {
        model_name: model_name.unwrap_or_else(|| "Unknown".to_string()),
        logical_cores: logical_cores.max(1),
    }
}

/// Collects the `cpu MHz` values of /proc/cpuinfo, in processor order.
pub fn parse_cpuinfo_frequencies(content: &str) -> Vec<f64> {
    content
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim() == "cpu MHz" {
                value.trim().parse::<f64>().ok()
            } else {
                None
            }
        })
        .collect()
}

/// Parses /proc/meminfo. Values are reported in kB.
pub fn parse_meminfo(content: &str) -> Result<MemInfo, String> {
    let mut info = MemInfo::default();
    let mut have_total = false;
    let mut have_available = false;

    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let Some(kb) = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
        else {
            continue;
        };
        let bytes = kb * 1024;
        match key {
            "MemTotal" => {
                info.total = bytes;
                have_total = true;
            }
            "MemFree" => info.free = bytes,
            "MemAvailable" => {
                info.available = bytes;
                have_available = true;
            }
            "SwapTotal" => info.swap_total = bytes,
            "SwapFree" => info.swap_free = bytes,
            _ => {}
        }
    }

    if !have_total {
        return Err("MemTotal missing".to_string());
    }
    if !have_available {
        // Kernels before 3.14 lack MemAvailable.
        info.available = info.free;
    }
    Ok(info)
}

/// Parses /proc/diskstats. Sectors are always 512 bytes there.
pub fn parse_diskstats(content: &str) -> Result<Vec<DiskStat>, String> {
    let mut out = Vec::new();
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        if parts.len() < 10 {
            return Err(format!("short diskstats line: {:?}", line));
        }
        let field = |i: usize| {
            parts[i]
                .parse::<u64>()
                .map_err(|e| format!("{}: bad counter {:?}: {}", parts[2], parts[i], e))
        };
        out.push(DiskStat {
            name: parts[2].to_string(),
            read_sectors: field(5)?,
            written_sectors: field(9)?,
        });
    }
    Ok(out)
}

/// Parses /proc/net/dev, skipping its two header lines.
pub fn parse_net_dev(content: &str) -> Result<Vec<NetDevStat>, String> {
    let mut out = Vec::new();
    for line in content.lines().skip(2) {
        let Some((name, counters)) = line.split_once(':') else {
            continue;
        };
        let parts: Vec<&str> = counters.split_whitespace().collect();
        if parts.len() < 9 {
            return Err(format!("short net/dev line for {}", name.trim()));
        }
        let field = |i: usize| {
            parts[i]
                .parse::<u64>()
                .map_err(|e| format!("{}: bad counter {:?}: {}", name.trim(), parts[i], e))
        };
        out.push(NetDevStat {
            name: name.trim().to_string(),
            rx_bytes: field(0)?,
            tx_bytes: field(8)?,
        });
    }
    Ok(out)
}

pub async fn read_load_average(proc_root: &Path) -> CollectResult<LoadAverage> {
    let path = proc_root.join("loadavg");
    let content = read_file(path.clone()).await?;
    parse_load_average(&content).map_err(|e| CollectError::malformed(path, e))
}

pub async fn read_cpu_stats(proc_root: &Path) -> CollectResult<CpuSnapshot> {
    let path = proc_root.join("stat");
    let content = read_file(path.clone()).await?;
    parse_cpu_stats(&content).map_err(|e| CollectError::malformed(path, e))
}

pub async fn read_meminfo(proc_root: &Path) -> CollectResult<MemInfo> {
    let path = proc_root.join("meminfo");
    let content = read_file(path.clone()).await?;
    parse_meminfo(&content).map_err(|e| CollectError::malformed(path, e))
}

pub async fn read_diskstats(proc_root: &Path) -> CollectResult<Vec<DiskStat>> {
    let path = proc_root.join("diskstats");
    let content = read_file(path.clone()).await?;
    parse_diskstats(&content).map_err(|e| CollectError::malformed(path, e))
}

pub async fn read_net_dev(proc_root: &Path) -> CollectResult<Vec<NetDevStat>> {
    let path = proc_root.join("net").join("dev");
    let content = read_file(path.clone()).await?;
    parse_net_dev(&content).map_err(|e| CollectError::malformed(path, e))
}

/// Synchronous, used once for the static processor facts.
pub fn read_cpu_info(proc_root: &Path) -> CollectResult<CpuInfo> {
    let path = proc_root.join("cpuinfo");
    let content = std::fs::read_to_string(&path).map_err(|e| CollectError::read(path, e))?;
    Ok(parse_cpu_info(&content))
}

/// Current frequency per core in MHz.
///
/// Prefers cpufreq's `scaling_cur_freq` (kHz); falls back to the `cpu MHz`
/// lines of /proc/cpuinfo when cpufreq is not exposed.
pub async fn read_core_frequencies(paths: &SourcePaths, cores: usize) -> CollectResult<Vec<f64>> {
    let cpu_dir = paths.sys_root.join("devices/system/cpu");
    let mut freqs = Vec::with_capacity(cores);
    for core in 0..cores {
        let path = cpu_dir.join(format!("cpu{}/cpufreq/scaling_cur_freq", core));
        let Ok(content) = tokio::fs::read_to_string(&path).await else {
            break;
        };
        match content.trim().parse::<f64>() {
            Ok(khz) => freqs.push(khz / 1000.0),
            Err(e) => return Err(CollectError::malformed(path, e.to_string())),
        }
    }
    if freqs.len() == cores {
        return Ok(freqs);
    }

    let path = paths.proc_root.join("cpuinfo");
    let content = read_file(path.clone()).await?;
    let freqs = parse_cpuinfo_frequencies(&content);
    if freqs.is_empty() {
        return Err(CollectError::malformed(path, "no frequency information"));
    }
    Ok(freqs)
}

/// Names of whole block devices (partitions are not listed in /sys/block).
pub async fn read_block_devices(sys_root: &Path) -> CollectResult<Vec<String>> {
    let dir = sys_root.join("block");
    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .map_err(|e| CollectError::read(dir.clone(), e))?;
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CollectError::read(dir.clone(), e))?
    {
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with("loop") && !name.starts_with("ram") {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Filesystem usage of the filesystem holding `mount`.
pub async fn read_fs_usage(mount: PathBuf) -> CollectResult<FsUsage> {
    tokio::task::spawn_blocking(move || statvfs(&mount))
        .await
        .map_err(|e| CollectError::Task(e.to_string()))?
}

fn statvfs(mount: &Path) -> CollectResult<FsUsage> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(mount.as_os_str().as_bytes())
        .map_err(|e| CollectError::malformed(mount, e.to_string()))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(CollectError::read(mount, std::io::Error::last_os_error()));
    }

    let fragment = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * fragment;
    let free = stat.f_bfree as u64 * fragment;
    let available = stat.f_bavail as u64 * fragment;
    Ok(FsUsage {
        total,
        available,
        used: total.saturating_sub(free),
    })
}

/// Reads every `temp*_input` of /sys/class/hwmon (millidegrees Celsius).
pub async fn read_hwmon_temperatures(sys_root: &Path) -> CollectResult<Vec<Temperature>> {
    let dir = sys_root.join("class/hwmon");
    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .map_err(|e| CollectError::read(dir.clone(), e))?;

    let mut chips = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        chips.push(entry.path());
    }
    chips.sort();

    let mut out = Vec::new();
    for chip_dir in chips {
        let chip = match tokio::fs::read_to_string(chip_dir.join("name")).await {
            Ok(name) => name.trim().to_string(),
            Err(_) => chip_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("hwmon")
                .to_string(),
        };

        let Ok(mut files) = tokio::fs::read_dir(&chip_dir).await else {
            continue;
        };
        let mut inputs = Vec::new();
        while let Ok(Some(file)) = files.next_entry().await {
            if let Some(name) = file.file_name().to_str() {
                if name.starts_with("temp") && name.ends_with("_input") {
                    inputs.push(name.to_string());
                }
            }
        }
        inputs.sort();

        for input in inputs {
            let Ok(raw) = tokio::fs::read_to_string(chip_dir.join(&input)).await else {
                continue;
            };
            let Ok(milli) = raw.trim().parse::<f64>() else {
                continue;
            };
            let base = input.trim_end_matches("_input");
            let label = tokio::fs::read_to_string(chip_dir.join(format!("{}_label", base)))
                .await
                .map(|l| l.trim().to_string())
                .unwrap_or_else(|_| base.to_string());
            out.push(Temperature {
                chip: chip.clone(),
                label,
                celsius: milli / 1000.0,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_STAT: &str = "cpu  4705 356 584 3699 23 23 0 0 0 0\n\
cpu0 1393 280 283 1789 8 8 0 0 0 0\n\
cpu1 3312 76 301 1910 15 15 0 0 0 0\n\
intr 114930548 113199788 3 0 5 263 0 4\n\
ctxt 1990473\n";

    #[test]
    fn test_page_size_is_a_power_of_two() {
        assert!(PAGE_SIZE.is_power_of_two());
        assert!(*PAGE_SIZE >= 4096);
    }

    #[test]
    fn test_parse_load_average() {
        let load = parse_load_average("0.52 0.58 0.59 2/1190 12345").unwrap();
        assert!((load.one_min - 0.52).abs() < 0.001);
        assert!((load.five_min - 0.58).abs() < 0.001);
        assert!((load.fifteen_min - 0.59).abs() < 0.001);
    }

    #[test]
    fn test_parse_load_average_invalid() {
        assert!(parse_load_average("0.52 0.58").is_err());
        assert!(parse_load_average("abc def ghi 1/2 3").is_err());
    }

    #[test]
    fn test_parse_cpu_stats() {
        let snapshot = parse_cpu_stats(PROC_STAT).unwrap();
        assert_eq!(snapshot.total.user, 4705);
        assert_eq!(snapshot.total.idle, 3699);
        assert_eq!(snapshot.total.total(), 4705 + 356 + 584 + 3699 + 23 + 23);
        assert_eq!(snapshot.cores.len(), 2);
        assert_eq!(snapshot.cores[&1].user, 3312);
    }

    #[test]
    fn test_parse_cpu_stats_rejects_short_lines() {
        assert!(parse_cpu_stats("cpu 1 2 3\n").is_err());
        assert!(parse_cpu_stats("cpu 1 2 x 4 5 6 7 8\n").is_err());
        assert!(parse_cpu_stats("intr 1 2 3\n").is_err());
    }

    #[test]
    fn test_parse_cpu_info() {
        let cpuinfo = "processor\t: 0\nmodel name\t: AMD Ryzen 7\ncpu MHz\t\t: 3400.000\n\n\
processor\t: 1\nmodel name\t: AMD Ryzen 7\ncpu MHz\t\t: 2200.500\n";
        let info = parse_cpu_info(cpuinfo);
        assert_eq!(info.logical_cores, 2);
        assert_eq!(info.model_name, "AMD Ryzen 7");
        assert_eq!(parse_cpuinfo_frequencies(cpuinfo), vec![3400.0, 2200.5]);
    }

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16384000 kB\nMemFree:         1024000 kB\n\
MemAvailable:    8192000 kB\nSwapTotal:       4096000 kB\nSwapFree:        2048000 kB\n";
        let mem = parse_meminfo(meminfo).unwrap();
        assert_eq!(mem.total, 16384000 * 1024);
        assert_eq!(mem.available, 8192000 * 1024);
        assert_eq!(mem.swap_total, 4096000 * 1024);
        assert_eq!(mem.swap_free, 2048000 * 1024);
    }

    #[test]
    fn test_parse_meminfo_missing_total() {
        assert!(parse_meminfo("MemFree:        8192000 kB\n").is_err());
    }

    #[test]
    fn test_parse_diskstats() {
        let content = "   8       0 sda 1000 10 2048 300 500 20 4096 600 0 900 900\n\
   8       1 sda1 900 10 1024 300 400 20 2048 600 0 900 900\n";
        let disks = parse_diskstats(content).unwrap();
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].name, "sda");
        assert_eq!(disks[0].read_sectors, 2048);
        assert_eq!(disks[0].written_sectors, 4096);
    }

    #[test]
    fn test_parse_net_dev() {
        let content = "Inter-|   Receive                            |  Transmit\n \
face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n    \
lo:    1000      10    0    0    0     0          0         0     1000      10    0    0    0     0       0          0\n  \
eth0: 5000000    4000    0    0    0     0          0         0   250000    2000    0    0    0     0       0          0\n";
        let devs = parse_net_dev(content).unwrap();
        assert_eq!(devs.len(), 2);
        assert_eq!(devs[1].name, "eth0");
        assert_eq!(devs[1].rx_bytes, 5_000_000);
        assert_eq!(devs[1].tx_bytes, 250_000);
    }

    #[tokio::test]
    async fn test_read_hwmon_temperatures() {
        let root = tempfile::tempdir().unwrap();
        let chip = root.path().join("class/hwmon/hwmon0");
        std::fs::create_dir_all(&chip).unwrap();
        std::fs::write(chip.join("name"), "k10temp\n").unwrap();
        std::fs::write(chip.join("temp1_input"), "45250\n").unwrap();
        std::fs::write(chip.join("temp1_label"), "Tctl\n").unwrap();
        std::fs::write(chip.join("temp2_input"), "38000\n").unwrap();

        let temps = read_hwmon_temperatures(root.path()).await.unwrap();
        assert_eq!(temps.len(), 2);
        assert_eq!(temps[0].chip, "k10temp");
        assert_eq!(temps[0].label, "Tctl");
        assert!((temps[0].celsius - 45.25).abs() < 1e-9);
        assert_eq!(temps[1].label, "temp2");
    }

    #[tokio::test]
    async fn test_core_frequencies_fall_back_to_cpuinfo() {
        let root = tempfile::tempdir().unwrap();
        let paths = SourcePaths {
            proc_root: root.path().join("proc"),
            sys_root: root.path().join("sys"),
        };
        std::fs::create_dir_all(&paths.proc_root).unwrap();
        std::fs::write(
            paths.proc_root.join("cpuinfo"),
            "processor : 0\ncpu MHz : 1800.0\nprocessor : 1\ncpu MHz : 2400.0\n",
        )
        .unwrap();

        let freqs = read_core_frequencies(&paths, 2).await.unwrap();
        assert_eq!(freqs, vec![1800.0, 2400.0]);
    }
}
