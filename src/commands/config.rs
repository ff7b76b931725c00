//! `config` subcommand: writes a default configuration file.

use herakles_res_monitor::Config;
use std::fs;
use std::path::PathBuf;

use crate::cli::ConfigFormat;

/// Serializes a config in the requested format.
pub fn render_config(config: &Config, format: ConfigFormat) -> anyhow::Result<String> {
    Ok(match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    })
}

/// Generates configuration files
pub fn command_config(
    output: Option<PathBuf>,
    format: ConfigFormat,
    commented: bool,
) -> anyhow::Result<()> {
    let config = Config::default();
    let output = output.unwrap_or_else(|| PathBuf::from("herakles-res-monitor.yaml"));

    let mut content = render_config(&config, format)?;
    if commented && matches!(format, ConfigFormat::Yaml) {
        content = add_config_comments(content);
    }

    if output.to_string_lossy() == "-" {
        print!("{}", content);
    } else {
        fs::write(&output, content)?;
        println!("✅ Configuration written to: {}", output.display());
    }

    Ok(())
}

/// Adds comments to YAML configuration
fn add_config_comments(yaml: String) -> String {
    let comments = r#"# Herakles Resource Monitor Configuration
# ========================================
#
# Kernel Sources
# --------------
# proc_root: "/proc"            # Root of the proc filesystem
# sys_root: "/sys"              # Root of the sys filesystem
#
# Sampling
# --------
# history_window_secs: 60       # Seconds of history kept per metric
# top_processes_limit: 15       # Entries in topProcesses
# storage_mount: "/"            # Filesystem reported by storageUsage
# sensors_command: null         # Helper printing sensor JSON (null = read hwmon)
#
# Collectors
# ----------
# <collector>:
#   enabled: true               # Start sampling on launch
#   update_interval: 1.5        # Seconds between ticks (minimum 0.1)
#
# Collectors are processor, memory, storage, network and sensors.
# Sending SIGHUP reloads these sections without a restart.
#
# Exporter
# --------
# enable_exporter: false        # Serve /metrics and /health
# bind: "127.0.0.1"             # Bind IP
# port: 9216                    # HTTP port
#
# Logging
# -------
# log_level: "info"             # off, error, warn, info, debug, trace
"#;

    format!("{comments}\n{yaml}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use herakles_res_monitor::config::parse_config;
    use std::path::Path;

    #[test]
    fn test_rendered_config_parses_back() {
        let config = Config::default();
        for (format, file) in [
            (ConfigFormat::Yaml, "c.yaml"),
            (ConfigFormat::Json, "c.json"),
            (ConfigFormat::Toml, "c.toml"),
        ] {
            let text = render_config(&config, format).unwrap();
            let parsed = parse_config(Path::new(file), &text).unwrap();
            assert_eq!(parsed, config, "{:?}", format);
        }
    }

    #[test]
    fn test_commented_yaml_is_still_valid() {
        let text = add_config_comments(render_config(&Config::default(), ConfigFormat::Yaml).unwrap());
        assert!(text.starts_with("# Herakles Resource Monitor"));
        let parsed = parse_config(Path::new("c.yaml"), &text).unwrap();
        assert_eq!(parsed.port, Some(9216));
    }
}
