//! Sensors collector: temperatures from /sys/class/hwmon, or from an external
//! helper printing `sensors -j` style JSON.

use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use crate::collector::{Collector, CollectorOptions};
use crate::error::{CollectError, CollectResult};
use crate::monitor::Monitor;
use crate::procfs::{self, SourcePaths, Temperature};
use crate::task::{CancellableTaskManager, TaskContext};

pub const SENSORS_TEMPERATURES: &str = "sensorsTemperatures";

const METRIC_KEYS: &[&str] = &[SENSORS_TEMPERATURES];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SensorsValue {
    Temperatures(Vec<Temperature>),
}

pub struct SensorsCollector {
    monitor: Monitor<SensorsValue>,
    paths: SourcePaths,
    command: Option<Vec<String>>,
    task: CancellableTaskManager,
}

impl SensorsCollector {
    pub fn new(options: CollectorOptions, command: Option<Vec<String>>) -> Arc<Self> {
        Arc::new(Self {
            monitor: Monitor::new("sensors", options.update_interval, options.history_window),
            paths: options.paths,
            command: command.filter(|c| !c.is_empty()),
            task: CancellableTaskManager::new("sensors"),
        })
    }

    fn refresh(self: &Arc<Self>) {
        self.spawn_refresh(
            &self.task,
            METRIC_KEYS,
            |this, ctx| async move { this.sample(ctx).await },
        );
    }

    async fn sample(&self, ctx: TaskContext) -> CollectResult<()> {
        let temperatures = match &self.command {
            Some(command) => run_helper(&ctx, command).await?,
            None => procfs::read_hwmon_temperatures(&self.paths.sys_root).await?,
        };
        ctx.commit(|| {
            self.monitor
                .commit(SENSORS_TEMPERATURES, SensorsValue::Temperatures(temperatures))
        })?;
        self.monitor.notify(SENSORS_TEMPERATURES);
        Ok(())
    }
}

/// Runs the helper linked to `ctx` and parses its output.
async fn run_helper(ctx: &TaskContext, command: &[String]) -> CollectResult<Vec<Temperature>> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| CollectError::Helper("empty sensors command".into()))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CollectError::Helper(format!("failed to spawn {}: {}", program, e)))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| CollectError::Helper(format!("{}: no stdout", program)))?;
    ctx.set_subprocess(child)?;

    let mut output = String::new();
    stdout
        .read_to_string(&mut output)
        .await
        .map_err(|e| CollectError::Helper(format!("{}: read failed: {}", program, e)))?;
    let status = ctx.wait_subprocess().await?;
    if !status.success() {
        return Err(CollectError::Helper(format!("{} exited with {}", program, status)));
    }

    parse_sensors_json(&output).map_err(|e| CollectError::Helper(format!("{}: {}", program, e)))
}

/// Extracts temperatures from `sensors -j` output:
/// `{ chip: { feature: { "tempN_input": celsius, ... }, "Adapter": ... } }`.
pub fn parse_sensors_json(content: &str) -> Result<Vec<Temperature>, String> {
    let root: serde_json::Value =
        serde_json::from_str(content).map_err(|e| format!("invalid JSON: {}", e))?;
    let chips = root
        .as_object()
        .ok_or_else(|| "expected a JSON object".to_string())?;

    let mut out = Vec::new();
    for (chip, features) in chips {
        let Some(features) = features.as_object() else {
            continue;
        };
        for (label, readings) in features {
            let Some(readings) = readings.as_object() else {
                continue;
            };
            let input = readings
                .iter()
                .find(|(name, _)| name.starts_with("temp") && name.ends_with("_input"))
                .and_then(|(_, value)| value.as_f64());
            if let Some(celsius) = input {
                out.push(Temperature {
                    chip: chip.clone(),
                    label: label.clone(),
                    celsius,
                });
            }
        }
    }
    Ok(out)
}

impl Collector for SensorsCollector {
    type Value = SensorsValue;

    fn monitor(&self) -> &Monitor<SensorsValue> {
        &self.monitor
    }

    fn metric_keys(&self) -> &'static [&'static str] {
        METRIC_KEYS
    }

    fn update(self: &Arc<Self>) {
        if self.monitor.is_listening_for(SENSORS_TEMPERATURES) {
            self.refresh();
        }
    }

    fn request_update(self: &Arc<Self>, key: &str, forced: bool) {
        if key != SENSORS_TEMPERATURES {
            debug!("sensors: update requested for unknown metric {}", key);
            return;
        }
        if forced || !self.task.is_running() {
            self.refresh();
        }
    }

    fn reset(&self) {
        self.task.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENSORS_OUTPUT: &str = r#"{
        "coretemp-isa-0000": {
            "Adapter": "ISA adapter",
            "Package id 0": { "temp1_input": 48.0, "temp1_max": 100.0, "temp1_crit": 100.0 },
            "Core 0": { "temp2_input": 45.5, "temp2_max": 100.0 }
        },
        "nvme-pci-0100": {
            "Adapter": "PCI adapter",
            "Composite": { "temp1_input": 38.85, "temp1_alarm": 0.0 },
            "Voltage": { "in0_input": 1.2 }
        }
    }"#;

    #[test]
    fn test_parse_sensors_json() {
        let temps = parse_sensors_json(SENSORS_OUTPUT).unwrap();
        assert_eq!(temps.len(), 3);
        let package = temps.iter().find(|t| t.label == "Package id 0").unwrap();
        assert_eq!(package.chip, "coretemp-isa-0000");
        assert_eq!(package.celsius, 48.0);
        assert!(temps.iter().all(|t| t.label != "Voltage"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_sensors_json("not json").is_err());
        assert!(parse_sensors_json("[1, 2]").is_err());
        assert!(parse_sensors_json("{}").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_helper_output_is_collected() {
        let collector = SensorsCollector::new(
            CollectorOptions::default(),
            Some(vec![
                "sh".into(),
                "-c".into(),
                r#"echo '{"acpitz-acpi-0": {"temp1": {"temp1_input": 27.8}}}'"#.into(),
            ]),
        );
        let outcome = collector
            .task
            .run({
                let collector = collector.clone();
                move |ctx| async move { collector.sample(ctx).await }
            })
            .await;
        outcome.unwrap();

        let Some(SensorsValue::Temperatures(temps)) =
            collector.monitor.current_value(SENSORS_TEMPERATURES)
        else {
            panic!("no temperatures");
        };
        assert_eq!(temps.len(), 1);
        assert_eq!(temps[0].celsius, 27.8);
    }

    #[tokio::test]
    async fn test_failing_helper_is_an_error() {
        let collector = SensorsCollector::new(
            CollectorOptions::default(),
            Some(vec!["sh".into(), "-c".into(), "exit 3".into()]),
        );
        let outcome = collector
            .task
            .run({
                let collector = collector.clone();
                move |ctx| async move { collector.sample(ctx).await }
            })
            .await;
        assert!(matches!(outcome, Err(CollectError::Helper(_))));
        assert!(collector.monitor.current_value(SENSORS_TEMPERATURES).is_none());
    }
}
