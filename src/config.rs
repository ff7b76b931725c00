//! Configuration file model and loading.
//!
//! All fields are optional; effective values are resolved with
//! `CLI > config file > defaults`. The file format is picked by extension
//! (`.json`, `.toml`, anything else is YAML).

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::collector::CollectorOptions;
use crate::procfs::SourcePaths;
use crate::settings::{CollectorKind, CollectorSettings, Setting, SettingChange};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9216;
pub const DEFAULT_HISTORY_WINDOW_SECS: f64 = 60.0;
pub const DEFAULT_TOP_PROCESSES_LIMIT: usize = 15;
pub const DEFAULT_STORAGE_MOUNT: &str = "/";

/// Lower bound for update intervals; anything faster just burns CPU.
pub const MIN_UPDATE_INTERVAL_SECS: f64 = 0.1;
pub const MAX_UPDATE_INTERVAL_SECS: f64 = 86_400.0;
pub const MAX_HISTORY_WINDOW_SECS: f64 = 7.0 * 86_400.0;

const DEFAULT_LOCATIONS: [&str; 6] = [
    "/etc/herakles/res-monitor.yaml",
    "/etc/herakles/res-monitor.yml",
    "/etc/herakles/res-monitor.json",
    "./herakles-res-monitor.yaml",
    "./herakles-res-monitor.yml",
    "./herakles-res-monitor.json",
];

/// Per-collector section of the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectorSection {
    pub enabled: Option<bool>,
    /// Seconds between ticks.
    #[serde(alias = "update-interval")]
    pub update_interval: Option<f64>,
}

impl CollectorSection {
    fn with(enabled: bool, update_interval: f64) -> Self {
        Self {
            enabled: Some(enabled),
            update_interval: Some(update_interval),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // Logging
    pub log_level: Option<String>,

    // Kernel sources
    pub proc_root: Option<PathBuf>,
    pub sys_root: Option<PathBuf>,

    // Sampling
    #[serde(alias = "history-window-secs")]
    pub history_window_secs: Option<f64>,
    #[serde(alias = "top-processes-limit")]
    pub top_processes_limit: Option<usize>,
    #[serde(alias = "storage-mount")]
    pub storage_mount: Option<PathBuf>,
    /// Helper printing `sensors -j` style JSON; hwmon is read when unset.
    #[serde(alias = "sensors-command")]
    pub sensors_command: Option<Vec<String>>,

    // Exporter
    #[serde(alias = "enable-exporter")]
    pub enable_exporter: Option<bool>,
    pub bind: Option<String>,
    pub port: Option<u16>,

    // Collectors (tables last, TOML wants values before tables)
    pub processor: Option<CollectorSection>,
    pub memory: Option<CollectorSection>,
    pub storage: Option<CollectorSection>,
    pub network: Option<CollectorSection>,
    pub sensors: Option<CollectorSection>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".into()),
            proc_root: Some(PathBuf::from("/proc")),
            sys_root: Some(PathBuf::from("/sys")),
            history_window_secs: Some(DEFAULT_HISTORY_WINDOW_SECS),
            top_processes_limit: Some(DEFAULT_TOP_PROCESSES_LIMIT),
            storage_mount: Some(PathBuf::from(DEFAULT_STORAGE_MOUNT)),
            sensors_command: None,
            enable_exporter: Some(false),
            bind: Some(DEFAULT_BIND_ADDR.to_string()),
            port: Some(DEFAULT_PORT),
            processor: Some(CollectorSection::with(true, 1.5)),
            memory: Some(CollectorSection::with(true, 3.0)),
            storage: Some(CollectorSection::with(true, 3.0)),
            network: Some(CollectorSection::with(true, 1.5)),
            sensors: Some(CollectorSection::with(true, 3.0)),
        }
    }
}

/// Built-in interval of each collector, in seconds.
pub fn default_update_interval(kind: CollectorKind) -> f64 {
    match kind {
        CollectorKind::Processor | CollectorKind::Network => 1.5,
        CollectorKind::Memory | CollectorKind::Storage | CollectorKind::Sensors => 3.0,
    }
}

impl Config {
    pub fn section(&self, kind: CollectorKind) -> Option<&CollectorSection> {
        match kind {
            CollectorKind::Processor => self.processor.as_ref(),
            CollectorKind::Memory => self.memory.as_ref(),
            CollectorKind::Storage => self.storage.as_ref(),
            CollectorKind::Network => self.network.as_ref(),
            CollectorKind::Sensors => self.sensors.as_ref(),
        }
    }

    pub fn section_mut(&mut self, kind: CollectorKind) -> &mut CollectorSection {
        let slot = match kind {
            CollectorKind::Processor => &mut self.processor,
            CollectorKind::Memory => &mut self.memory,
            CollectorKind::Storage => &mut self.storage,
            CollectorKind::Network => &mut self.network,
            CollectorKind::Sensors => &mut self.sensors,
        };
        slot.get_or_insert_with(CollectorSection::default)
    }

    /// Effective settings of one collector.
    pub fn collector_settings(&self, kind: CollectorKind) -> CollectorSettings {
        let section = self.section(kind);
        CollectorSettings {
            enabled: section.and_then(|s| s.enabled).unwrap_or(true),
            update_interval: section
                .and_then(|s| s.update_interval)
                .unwrap_or_else(|| default_update_interval(kind)),
        }
    }

    pub fn source_paths(&self) -> SourcePaths {
        let defaults = SourcePaths::default();
        SourcePaths {
            proc_root: self.proc_root.clone().unwrap_or(defaults.proc_root),
            sys_root: self.sys_root.clone().unwrap_or(defaults.sys_root),
        }
    }

    /// Construction options for one collector.
    pub fn collector_options(&self, kind: CollectorKind) -> CollectorOptions {
        let settings = self.collector_settings(kind);
        CollectorOptions {
            paths: self.source_paths(),
            update_interval: bounded_secs(
                settings.update_interval,
                MIN_UPDATE_INTERVAL_SECS,
                MAX_UPDATE_INTERVAL_SECS,
            ),
            history_window: bounded_secs(
                self.history_window_secs
                    .unwrap_or(DEFAULT_HISTORY_WINDOW_SECS),
                0.0,
                MAX_HISTORY_WINDOW_SECS,
            ),
            top_processes_limit: self
                .top_processes_limit
                .unwrap_or(DEFAULT_TOP_PROCESSES_LIMIT),
        }
    }

    pub fn storage_mount(&self) -> PathBuf {
        self.storage_mount
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_MOUNT))
    }

    /// Setting changes that turn `previous` into `self`, per collector.
    pub fn changes_since(&self, previous: &Config) -> Vec<SettingChange> {
        let mut changes = Vec::new();
        for kind in CollectorKind::ALL {
            let old = previous.collector_settings(kind);
            let new = self.collector_settings(kind);
            // Interval first so a collector enabled by the same reload starts
            // with its new interval.
            if old.update_interval != new.update_interval {
                changes.push(SettingChange::new(
                    kind,
                    Setting::UpdateInterval(new.update_interval),
                ));
            }
            if old.enabled != new.enabled {
                changes.push(SettingChange::new(kind, Setting::Enabled(new.enabled)));
            }
        }
        changes
    }

    /// Fills every unset field from `defaults`.
    pub fn merged_over(mut self, defaults: &Config) -> Config {
        macro_rules! fill {
            ($($field:ident),*) => {
                $(if self.$field.is_none() { self.$field = defaults.$field.clone(); })*
            };
        }
        fill!(
            log_level,
            proc_root,
            sys_root,
            history_window_secs,
            top_processes_limit,
            storage_mount,
            sensors_command,
            enable_exporter,
            bind,
            port
        );
        for kind in CollectorKind::ALL {
            let fallback = defaults.section(kind).cloned().unwrap_or_default();
            let section = self.section_mut(kind);
            if section.enabled.is_none() {
                section.enabled = fallback.enabled;
            }
            if section.update_interval.is_none() {
                section.update_interval = fallback.update_interval;
            }
        }
        self
    }
}

/// Seconds clamped into `[min, max]`; NaN maps to `min`.
fn bounded_secs(secs: f64, min: f64, max: f64) -> Duration {
    let secs = secs.max(min).min(max);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

/// Finds the config file: the explicit path or the first default location.
pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => DEFAULT_LOCATIONS
            .iter()
            .map(Path::new)
            .find(|p| p.exists())
            .map(Path::to_path_buf),
    }
}

/// Parses config content according to the file extension of `path`.
pub fn parse_config(path: &Path, content: &str) -> anyhow::Result<Config> {
    let config = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(content)
            .with_context(|| format!("invalid JSON in {}", path.display()))?,
        Some("toml") => toml::from_str(content)
            .with_context(|| format!("invalid TOML in {}", path.display()))?,
        _ => serde_yaml::from_str(content)
            .with_context(|| format!("invalid YAML in {}", path.display()))?,
    };
    Ok(config)
}

/// Loads the config file, or an empty config when there is none.
///
/// An explicitly named file must exist; default locations are optional.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let Some(path) = config_path(explicit) else {
        return Ok(Config::empty());
    };
    if explicit.is_some() && !path.exists() {
        bail!("config file {} does not exist", path.display());
    }

    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config = parse_config(&path, &content)?;
    info!("Loaded configuration from: {}", path.display());
    Ok(config)
}

impl Config {
    /// A config with every field unset.
    pub fn empty() -> Self {
        Self {
            log_level: None,
            proc_root: None,
            sys_root: None,
            history_window_secs: None,
            top_processes_limit: None,
            storage_mount: None,
            sensors_command: None,
            enable_exporter: None,
            bind: None,
            port: None,
            processor: None,
            memory: None,
            storage: None,
            network: None,
            sensors: None,
        }
    }
}

/// Rejects values no collector can run with.
pub fn validate_effective_config(cfg: &Config) -> anyhow::Result<()> {
    for kind in CollectorKind::ALL {
        let interval = cfg.collector_settings(kind).update_interval;
        if !(MIN_UPDATE_INTERVAL_SECS..=MAX_UPDATE_INTERVAL_SECS).contains(&interval) {
            bail!(
                "{}.update_interval must be between {}s and {}s, got {}",
                kind,
                MIN_UPDATE_INTERVAL_SECS,
                MAX_UPDATE_INTERVAL_SECS,
                interval
            );
        }
    }

    if let Some(window) = cfg.history_window_secs {
        if !(window > 0.0 && window <= MAX_HISTORY_WINDOW_SECS) {
            bail!(
                "history_window_secs must be positive and at most {}, got {}",
                MAX_HISTORY_WINDOW_SECS,
                window
            );
        }
    }

    if cfg.top_processes_limit == Some(0) {
        bail!("top_processes_limit must be at least 1");
    }

    if let Some(cmd) = &cfg.sensors_command {
        if cmd.first().map_or(true, |program| program.trim().is_empty()) {
            bail!("sensors_command must name a program");
        }
    }

    if let Some(level) = cfg.log_level.as_deref() {
        match level.to_ascii_lowercase().as_str() {
            "off" | "error" | "warn" | "info" | "debug" | "trace" => {}
            other => bail!("Invalid log_level '{}'", other),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_per_collector() {
        let cfg = Config::default();
        assert_eq!(
            cfg.collector_settings(CollectorKind::Processor).update_interval,
            1.5
        );
        assert_eq!(cfg.collector_settings(CollectorKind::Memory).update_interval, 3.0);
        assert!(cfg.collector_settings(CollectorKind::Sensors).enabled);
        validate_effective_config(&cfg).unwrap();
    }

    #[test]
    fn test_huge_values_are_rejected_and_never_panic() {
        let mut cfg = Config::default();
        cfg.section_mut(CollectorKind::Processor).update_interval = Some(1e20);
        cfg.history_window_secs = Some(f64::MAX);
        assert!(validate_effective_config(&cfg).is_err());

        let options = cfg.collector_options(CollectorKind::Processor);
        assert_eq!(options.update_interval, Duration::from_secs(86_400));
        assert_eq!(options.history_window, Duration::from_secs(7 * 86_400));

        cfg.section_mut(CollectorKind::Processor).update_interval = Some(f64::NAN);
        assert!(validate_effective_config(&cfg).is_err());
        assert_eq!(
            cfg.collector_options(CollectorKind::Processor).update_interval,
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_empty_config_falls_back_to_builtin_defaults() {
        let cfg = Config::empty();
        let settings = cfg.collector_settings(CollectorKind::Network);
        assert!(settings.enabled);
        assert_eq!(settings.update_interval, 1.5);
        assert_eq!(cfg.source_paths(), SourcePaths::default());
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "top_processes_limit: 5\nmemory:\n  update_interval: 2.0\nsensors:\n  enabled: false"
        )
        .unwrap();

        let cfg = load_config(Some(file.path()))
            .unwrap()
            .merged_over(&Config::default());
        assert_eq!(cfg.top_processes_limit, Some(5));
        assert_eq!(cfg.collector_settings(CollectorKind::Memory).update_interval, 2.0);
        assert!(!cfg.collector_settings(CollectorKind::Sensors).enabled);
        assert_eq!(cfg.collector_settings(CollectorKind::Storage).update_interval, 3.0);
    }

    #[test]
    fn test_toml_and_json_by_extension() {
        let toml_cfg = parse_config(
            Path::new("x.toml"),
            "port = 9300\n[processor]\nupdate_interval = 0.5\n",
        )
        .unwrap();
        assert_eq!(toml_cfg.port, Some(9300));
        assert_eq!(
            toml_cfg.collector_settings(CollectorKind::Processor).update_interval,
            0.5
        );

        let json_cfg =
            parse_config(Path::new("x.json"), r#"{"network": {"enabled": false}}"#).unwrap();
        assert!(!json_cfg.collector_settings(CollectorKind::Network).enabled);
    }

    #[test]
    fn test_default_config_serializes_to_every_format() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let json = serde_json::to_string(&cfg).unwrap();
        let toml_text = toml::to_string_pretty(&cfg).unwrap();

        assert_eq!(parse_config(Path::new("c.yaml"), &yaml).unwrap(), cfg);
        assert_eq!(parse_config(Path::new("c.json"), &json).unwrap(), cfg);
        assert_eq!(parse_config(Path::new("c.toml"), &toml_text).unwrap(), cfg);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/res-monitor.yaml"))).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.section_mut(CollectorKind::Storage).update_interval = Some(0.0);
        assert!(validate_effective_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.top_processes_limit = Some(0);
        assert!(validate_effective_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.sensors_command = Some(vec![]);
        assert!(validate_effective_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.log_level = Some("loud".into());
        assert!(validate_effective_config(&cfg).is_err());
    }

    #[test]
    fn test_changes_since_lists_only_differences() {
        let old = Config::default();
        let mut new = Config::default();
        new.section_mut(CollectorKind::Network).update_interval = Some(5.0);
        new.section_mut(CollectorKind::Network).enabled = Some(false);
        new.section_mut(CollectorKind::Memory).enabled = Some(false);

        let changes = new.changes_since(&old);
        assert_eq!(
            changes,
            vec![
                SettingChange::new(CollectorKind::Memory, Setting::Enabled(false)),
                SettingChange::new(CollectorKind::Network, Setting::UpdateInterval(5.0)),
                SettingChange::new(CollectorKind::Network, Setting::Enabled(false)),
            ]
        );
        assert!(old.changes_since(&old).is_empty());
    }
}
