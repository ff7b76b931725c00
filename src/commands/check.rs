//! `check` subcommand: verifies that the kernel sources the collectors read
//! are present and parseable, and that the effective config is valid.

use herakles_res_monitor::config::validate_effective_config;
use herakles_res_monitor::process::collect_proc_entries;
use herakles_res_monitor::procfs::{self, SourcePaths};
use herakles_res_monitor::{CollectResult, Config};
use std::fmt::Display;

/// Prints one check line and returns whether it passed.
fn report<T, F>(what: &str, result: CollectResult<T>, describe: F) -> bool
where
    F: FnOnce(&T) -> String,
{
    match result {
        Ok(value) => {
            println!("   ✅ {}: {}", what, describe(&value));
            true
        }
        Err(e) => {
            println!("   ❌ {}: {}", what, e);
            false
        }
    }
}

fn plural<N: Display>(n: N, noun: &str) -> String {
    format!("{n} {noun}")
}

async fn check_proc(paths: &SourcePaths) -> bool {
    println!("\n📁 Checking {} ...", paths.proc_root.display());
    let root = &paths.proc_root;
    let mut ok = true;

    ok &= report(
        "stat",
        procfs::read_cpu_stats(root).await,
        |s| plural(s.cores.len(), "cores"),
    );
    ok &= report("loadavg", procfs::read_load_average(root).await, |l| {
        format!("{:.2} {:.2} {:.2}", l.one_min, l.five_min, l.fifteen_min)
    });
    ok &= report("meminfo", procfs::read_meminfo(root).await, |m| {
        format!("{} MB total", m.total / 1024 / 1024)
    });
    ok &= report("diskstats", procfs::read_diskstats(root).await, |d| {
        plural(d.len(), "devices")
    });
    ok &= report("net/dev", procfs::read_net_dev(root).await, |n| {
        plural(n.len(), "interfaces")
    });

    let entries = collect_proc_entries(root);
    if entries.is_empty() {
        println!("   ❌ Cannot read any process entries");
        ok = false;
    } else {
        println!("   ✅ Can read {} process entries", entries.len());
    }
    ok
}

async fn check_sys(paths: &SourcePaths) -> bool {
    println!("\n🔧 Checking {} ...", paths.sys_root.display());
    let mut ok = report(
        "block devices",
        procfs::read_block_devices(&paths.sys_root).await,
        |d| plural(d.len(), "whole disks"),
    );

    // Optional sources: missing sensors or cpufreq is not an error.
    match procfs::read_hwmon_temperatures(&paths.sys_root).await {
        Ok(temps) if !temps.is_empty() => {
            println!("   ✅ hwmon: {}", plural(temps.len(), "temperature inputs"))
        }
        Ok(_) => println!("   ⚠️  hwmon: no temperature inputs"),
        Err(e) => println!("   ⚠️  hwmon: {}", e),
    }
    match procfs::read_cpu_info(&paths.proc_root) {
        Ok(info) => {
            let freqs = procfs::read_core_frequencies(paths, info.logical_cores).await;
            ok &= report("core frequencies", freqs, |f| plural(f.len(), "cores"));
        }
        Err(e) => {
            println!("   ❌ cpuinfo: {}", e);
            ok = false;
        }
    }
    ok
}

/// Runs the selected checks; exits with status 1 when any of them fails.
pub async fn command_check(proc: bool, sys: bool, all: bool, config: &Config) -> anyhow::Result<()> {
    println!("🔍 Herakles Resource Monitor - System Check");
    println!("===========================================");

    let paths = config.source_paths();
    let mut all_ok = true;

    if proc || all {
        all_ok &= check_proc(&paths).await;
    }
    if sys || all {
        all_ok &= check_sys(&paths).await;
    }

    println!("\n⚙️  Checking configuration...");
    match validate_effective_config(config) {
        Ok(()) => println!("   ✅ Configuration is valid"),
        Err(e) => {
            println!("   ❌ Configuration invalid: {}", e);
            all_ok = false;
        }
    }

    println!("\n📋 Summary:");
    if all_ok {
        println!("   ✅ All checks passed - system is ready");
        Ok(())
    } else {
        println!("   ❌ Some checks failed - please review the output above");
        std::process::exit(1);
    }
}
