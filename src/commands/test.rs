//! `test` subcommand: runs every enabled collector against the live system
//! for a few rounds and prints what it published.

use anyhow::bail;
use herakles_res_monitor::{CollectorKind, Collectors, Config, SettingsBus, SubscriberId};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cli::ConfigFormat;

/// Extra wait per round so the last tick of the round has landed.
const ROUND_SLACK: Duration = Duration::from_millis(250);

/// Longest interval among the enabled collectors.
fn round_length(config: &Config) -> Duration {
    let secs = CollectorKind::ALL
        .iter()
        .map(|&kind| config.collector_settings(kind))
        .filter(|s| s.enabled)
        .map(|s| s.update_interval)
        .fold(0.0_f64, f64::max);
    Duration::from_secs_f64(secs) + ROUND_SLACK
}

/// Current values of every enabled collector, keyed by collector and metric.
fn snapshot(collectors: &Collectors, config: &Config) -> Value {
    let mut root = Map::new();
    for kind in CollectorKind::ALL {
        if !config.collector_settings(kind).enabled {
            continue;
        }
        let mut metrics = Map::new();
        for key in collectors.metric_keys(kind) {
            let value = collectors.current_json(kind, key).unwrap_or(Value::Null);
            metrics.insert(key.to_string(), value);
        }
        root.insert(kind.to_string(), Value::Object(metrics));
    }
    Value::Object(root)
}

fn render(value: &Value, format: ConfigFormat) -> anyhow::Result<String> {
    Ok(match format {
        ConfigFormat::Json => serde_json::to_string_pretty(value)?,
        ConfigFormat::Yaml => serde_yaml::to_string(value)?,
        ConfigFormat::Toml => bail!("toml output is not supported here, use json or yaml"),
    })
}

/// Samples the live system
pub async fn command_test(
    iterations: usize,
    verbose: bool,
    format: ConfigFormat,
    config: &Config,
) -> anyhow::Result<()> {
    if matches!(format, ConfigFormat::Toml) {
        bail!("toml output is not supported here, use json or yaml");
    }

    println!("🧪 Herakles Resource Monitor - Test Mode");
    println!("========================================");

    let collectors = Arc::new(Collectors::from_config(config));
    let notifications = Arc::new(AtomicU64::new(0));
    let subscriber = SubscriberId::next();

    // Collectors only sample metrics somebody listens to.
    for kind in CollectorKind::ALL {
        for key in collectors.metric_keys(kind) {
            let counter = Arc::clone(&notifications);
            collectors.listen(kind, subscriber, key, move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
    }

    let bus = SettingsBus::new();
    let dispatchers = collectors.attach_all(config, &bus);
    let round = round_length(config);

    for iteration in 1..=iterations {
        println!("\n🔄 Iteration {}/{}:", iteration, iterations);
        let start = Instant::now();
        tokio::time::sleep(round).await;

        println!(
            "   ⏱️  Waited {:.2}s, {} notifications so far",
            start.elapsed().as_secs_f64(),
            notifications.load(Ordering::Relaxed)
        );
        if verbose {
            for kind in CollectorKind::ALL {
                if !collectors.is_running(kind) {
                    continue;
                }
                for key in collectors.metric_keys(kind) {
                    println!(
                        "   ├─ {}.{}: {:?}, {} samples",
                        kind,
                        key,
                        collectors.status(kind, key),
                        collectors.history_len(kind, key)
                    );
                }
            }
        }
        println!("{}", render(&snapshot(&collectors, config), format)?);
    }

    collectors.unlisten(subscriber);
    collectors.stop_all();
    for handle in dispatchers {
        handle.abort();
    }

    println!("\n✅ Test completed successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_length_uses_slowest_enabled_collector() {
        let mut config = Config::default();
        assert_eq!(round_length(&config), Duration::from_secs(3) + ROUND_SLACK);

        for kind in [CollectorKind::Memory, CollectorKind::Storage, CollectorKind::Sensors] {
            config.section_mut(kind).enabled = Some(false);
        }
        assert_eq!(
            round_length(&config),
            Duration::from_secs_f64(1.5) + ROUND_SLACK
        );
    }

    #[test]
    fn test_snapshot_skips_disabled_collectors() {
        let mut config = Config::default();
        config.section_mut(CollectorKind::Sensors).enabled = Some(false);
        let collectors = Collectors::from_config(&config);

        let value = snapshot(&collectors, &config);
        let obj = value.as_object().unwrap();
        assert!(obj.contains_key("processor"));
        assert!(!obj.contains_key("sensors"));
        assert_eq!(obj["memory"]["memoryUsage"], Value::Null);
    }
}
