//! CLI arguments and subcommands for herakles-res-monitor.
//!
//! This module defines the command-line interface structure using the clap library,
//! including all flags, options, and subcommands.

use clap::{Parser, Subcommand, ValueEnum};
use herakles_res_monitor::CollectorKind;
use std::net::IpAddr;
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Configuration format options for output
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

/// Collector names as accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CollectorArg {
    Processor,
    Memory,
    Storage,
    Network,
    Sensors,
}

impl From<CollectorArg> for CollectorKind {
    fn from(arg: CollectorArg) -> Self {
        match arg {
            CollectorArg::Processor => CollectorKind::Processor,
            CollectorArg::Memory => CollectorKind::Memory,
            CollectorArg::Storage => CollectorKind::Storage,
            CollectorArg::Network => CollectorKind::Network,
            CollectorArg::Sensors => CollectorKind::Sensors,
        }
    }
}

/// A `collector.metricKey` pair, e.g. `processor.cpuUsage`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSpec {
    pub collector: CollectorKind,
    pub key: String,
}

/// A `collector=seconds` interval override, e.g. `network=0.5`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalSpec {
    pub collector: CollectorKind,
    pub seconds: f64,
}

fn parse_collector(name: &str) -> Result<CollectorKind, String> {
    CollectorArg::from_str(name, true)
        .map(CollectorKind::from)
        .map_err(|_| format!("unknown collector '{}'", name))
}

pub fn parse_metric_spec(s: &str) -> Result<MetricSpec, String> {
    let (collector, key) = s
        .split_once('.')
        .ok_or_else(|| format!("expected <collector>.<metric>, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("missing metric key in '{}'", s));
    }
    Ok(MetricSpec {
        collector: parse_collector(collector)?,
        key: key.to_string(),
    })
}

pub fn parse_interval_spec(s: &str) -> Result<IntervalSpec, String> {
    let (collector, secs) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <collector>=<seconds>, got '{}'", s))?;
    let seconds: f64 = secs
        .parse()
        .map_err(|_| format!("invalid interval '{}'", secs))?;
    Ok(IntervalSpec {
        collector: parse_collector(collector)?,
        seconds,
    })
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "herakles-res-monitor",
    about = "Resource monitor core: CPU, memory, storage, network and sensor collectors",
    long_about = "Resource monitor core: CPU, memory, storage, network and sensor collectors.\n\n\
                  Samples kernel counters on a per-collector interval, converts them into \
                  rates and percentages, keeps a rolling history and publishes values to \
                  subscribers. Optionally serves the current values as Prometheus metrics.",
    author = "Michael Moll <proc-mem@herakles.io> - Herakles IO",
    version = "0.1.0",
    propagate_version = true,
    after_help = "Project: https://github.com/herakles-io/herakles-res-monitor"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// HTTP listen port for the exporter
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Bind the exporter to specific interface/IP
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Serve /metrics and /health
    #[arg(long)]
    pub listen: bool,

    /// Log level (overrides the config file)
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Output format for --show-config
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,

    /// Log every update of a metric (repeatable), e.g. processor.cpuUsage
    #[arg(short = 'w', long, value_parser = parse_metric_spec)]
    pub watch: Vec<MetricSpec>,

    /// Override an update interval (repeatable), e.g. network=0.5
    #[arg(long, value_parser = parse_interval_spec)]
    pub interval: Vec<IntervalSpec>,

    /// Disable a collector (repeatable)
    #[arg(long, value_enum)]
    pub disable: Vec<CollectorArg>,

    /// Root of the proc filesystem
    #[arg(long)]
    pub proc_root: Option<PathBuf>,

    /// Root of the sys filesystem
    #[arg(long)]
    pub sys_root: Option<PathBuf>,

    /// Seconds of history kept per metric
    #[arg(long)]
    pub history_window: Option<f64>,

    /// Number of processes in topProcesses
    #[arg(long)]
    pub top: Option<usize>,

    /// Mount point reported by storageUsage
    #[arg(long)]
    pub storage_mount: Option<PathBuf>,
}

/// Subcommands for additional functionality
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate configuration and kernel sources
    Check {
        /// Check /proc sources
        #[arg(long)]
        proc: bool,

        /// Check /sys sources
        #[arg(long)]
        sys: bool,

        /// Check all system requirements
        #[arg(long)]
        all: bool,
    },

    /// Generate configuration files
    Config {
        /// Output file path ("-" for stdout)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,

        /// Include comments (YAML only)
        #[arg(long)]
        commented: bool,
    },

    /// Sample the live system and print the values
    Test {
        /// Number of sampling rounds
        #[arg(short = 'n', long, default_value_t = 2)]
        iterations: usize,

        /// Print metric history sizes and statuses too
        #[arg(long)]
        verbose: bool,

        /// Output format
        #[arg(long, value_enum, default_value = "json")]
        format: ConfigFormat,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_metric_spec() {
        let spec = parse_metric_spec("processor.cpuUsage").unwrap();
        assert_eq!(spec.collector, CollectorKind::Processor);
        assert_eq!(spec.key, "cpuUsage");
        assert!(parse_metric_spec("cpuUsage").is_err());
        assert!(parse_metric_spec("gpu.usage").is_err());
        assert!(parse_metric_spec("memory.").is_err());
    }

    #[test]
    fn test_interval_spec() {
        let spec = parse_interval_spec("Network=0.5").unwrap();
        assert_eq!(spec.collector, CollectorKind::Network);
        assert_eq!(spec.seconds, 0.5);
        assert!(parse_interval_spec("network").is_err());
        assert!(parse_interval_spec("network=fast").is_err());
    }

    #[test]
    fn test_parse_flags() {
        let args = Args::parse_from([
            "herakles-res-monitor",
            "--watch",
            "memory.memoryUsage",
            "--disable",
            "sensors",
            "--interval",
            "processor=2",
        ]);
        assert_eq!(args.watch.len(), 1);
        assert_eq!(args.disable, vec![CollectorArg::Sensors]);
        assert_eq!(args.interval[0].seconds, 2.0);
    }
}
