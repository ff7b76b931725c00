//! herakles-res-monitor binary.
//!
//! Runs the resource collectors, optionally logs watched metrics and serves
//! the current values as Prometheus metrics. SIGHUP reloads the collector
//! settings from the config file without a restart.

mod cli;
mod commands;
mod handlers;
mod metrics;
mod state;

use anyhow::{bail, Context};
use axum::{routing::get, Router};
use clap::{Parser, ValueEnum};
use herakles_res_monitor::config::{load_config, validate_effective_config};
use herakles_res_monitor::{CollectorKind, Collectors, Config, SettingsBus, SubscriberId};
use prometheus::{Gauge, Registry};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::signal::{self, unix::SignalKind};
use tracing::{debug, error, info, warn, Level};

use crate::cli::{Args, Commands, LogLevel};
use crate::commands::config::render_config;
use crate::commands::{command_check, command_config, command_test};
use crate::handlers::{health_handler, metrics_handler};
use crate::metrics::ResourceMetrics;
use crate::state::{AppState, HealthStats, SharedState};

/// Applies command-line overrides on top of a config.
fn apply_cli_overrides(config: &mut Config, args: &Args) {
    if let Some(bind_ip) = args.bind {
        config.bind = Some(bind_ip.to_string());
    }
    if let Some(port) = args.port {
        config.port = Some(port);
    }
    if args.listen {
        config.enable_exporter = Some(true);
    }
    if let Some(root) = &args.proc_root {
        config.proc_root = Some(root.clone());
    }
    if let Some(root) = &args.sys_root {
        config.sys_root = Some(root.clone());
    }
    if let Some(window) = args.history_window {
        config.history_window_secs = Some(window);
    }
    if let Some(n) = args.top {
        config.top_processes_limit = Some(n);
    }
    if let Some(mount) = &args.storage_mount {
        config.storage_mount = Some(mount.clone());
    }
    if let Some(level) = args.log_level {
        if let Some(value) = level.to_possible_value() {
            config.log_level = Some(value.get_name().to_string());
        }
    }
    for spec in &args.interval {
        config.section_mut(spec.collector).update_interval = Some(spec.seconds);
    }
    for &collector in &args.disable {
        config.section_mut(collector.into()).enabled = Some(false);
    }
}

/// Effective config: CLI > config file > defaults.
fn resolve_config(args: &Args) -> anyhow::Result<Config> {
    let file = if args.no_config {
        Config::empty()
    } else {
        load_config(args.config.as_deref())?
    };
    let mut config = file.merged_over(&Config::default());
    apply_cli_overrides(&mut config, args);
    Ok(config)
}

fn effective_log_level(config: &Config) -> LogLevel {
    config
        .log_level
        .as_deref()
        .and_then(|s| LogLevel::from_str(s, true).ok())
        .unwrap_or(LogLevel::Info)
}

fn setup_logging(level: LogLevel) -> anyhow::Result<()> {
    let max_level = match level {
        LogLevel::Off => return Ok(()),
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set tracing subscriber: {e}"))?;

    info!("Logging initialized with level: {:?}", level);
    Ok(())
}

/// Logs every update of the metrics named with `--watch`.
fn install_watchers(collectors: &Arc<Collectors>, args: &Args) -> anyhow::Result<SubscriberId> {
    let subscriber = SubscriberId::next();
    for spec in &args.watch {
        let weak: Weak<Collectors> = Arc::downgrade(collectors);
        let kind = spec.collector;
        let listening = collectors.listen(kind, subscriber, &spec.key, move |key| {
            let Some(collectors) = weak.upgrade() else {
                return;
            };
            match collectors.current_json(kind, key) {
                Some(value) => info!("{}.{} = {}", kind, key, value),
                None => debug!("{}.{} has no value yet", kind, key),
            }
        });
        if !listening {
            bail!(
                "{} has no metric '{}' (available: {})",
                kind,
                spec.key,
                collectors.metric_keys(kind).join(", ")
            );
        }
        info!("Watching {}.{}", kind, spec.key);
    }
    Ok(subscriber)
}

/// Builds the exporter state and subscribes it to every metric so the
/// collectors keep sampling everything /metrics can show.
fn build_exporter_state(
    collectors: &Arc<Collectors>,
    subscriber: SubscriberId,
) -> anyhow::Result<SharedState> {
    let registry = Registry::new();
    let metrics = ResourceMetrics::new(&registry)?;
    let scrape_duration = Gauge::new(
        "herakles_res_scrape_duration_seconds",
        "Time spent rendering the last /metrics response",
    )?;
    registry.register(Box::new(scrape_duration.clone()))?;

    let state = Arc::new(AppState {
        registry,
        metrics,
        scrape_duration,
        collectors: Arc::clone(collectors),
        health_stats: HealthStats::new(),
    });

    for kind in CollectorKind::ALL {
        for key in collectors.metric_keys(kind) {
            let weak = Arc::downgrade(&state);
            collectors.listen(kind, subscriber, key, move |_| {
                if let Some(state) = weak.upgrade() {
                    state.health_stats.record_notification(kind);
                }
            });
        }
    }
    Ok(state)
}

/// Re-reads the config file and publishes collector setting changes.
fn reload_settings(args: &Args, current: &mut Config, bus: &SettingsBus) {
    let reloaded = match resolve_config(args) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Config reload failed, keeping current settings: {:#}", e);
            return;
        }
    };
    if let Err(e) = validate_effective_config(&reloaded) {
        error!("Reloaded config is invalid, keeping current settings: {:#}", e);
        return;
    }

    let changes = reloaded.changes_since(current);
    if changes.is_empty() {
        info!("Config reloaded, collector settings unchanged");
    }
    for change in changes {
        info!("Applying {:?} to {}", change.setting, change.collector);
        bus.publish(change);
    }

    if reloaded.bind != current.bind
        || reloaded.port != current.port
        || reloaded.enable_exporter != current.enable_exporter
        || reloaded.proc_root != current.proc_root
        || reloaded.sys_root != current.sys_root
    {
        warn!("Exporter and source path changes take effect after a restart");
    }
    *current = reloaded;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = resolve_config(&args)?;

    if args.show_config {
        println!("{}", render_config(&config, args.config_format)?);
        return Ok(());
    }
    if args.check_config {
        match validate_effective_config(&config) {
            Ok(()) => {
                println!("✅ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                eprintln!("❌ Configuration invalid: {:#}", e);
                std::process::exit(1);
            }
        }
    }

    setup_logging(effective_log_level(&config))?;

    match args.command {
        Some(Commands::Check { proc, sys, all }) => {
            return command_check(proc, sys, all, &config).await;
        }
        Some(Commands::Config {
            ref output,
            format,
            commented,
        }) => {
            return command_config(output.clone(), format, commented);
        }
        Some(Commands::Test {
            iterations,
            verbose,
            format,
        }) => {
            validate_effective_config(&config).context("invalid configuration")?;
            return command_test(iterations, verbose, format, &config).await;
        }
        None => {}
    }

    validate_effective_config(&config).context("invalid configuration")?;

    info!("Starting herakles-res-monitor");
    debug!("Effective configuration: {:?}", config);

    let collectors = Arc::new(Collectors::from_config(&config));
    let subscriber = install_watchers(&collectors, &args)?;

    let exporter = if config.enable_exporter.unwrap_or(false) {
        let state = build_exporter_state(&collectors, subscriber)?;
        let bind_ip: IpAddr = config
            .bind
            .as_deref()
            .unwrap_or(herakles_res_monitor::config::DEFAULT_BIND_ADDR)
            .parse()
            .context("invalid bind address")?;
        let port = config
            .port
            .unwrap_or(herakles_res_monitor::config::DEFAULT_PORT);
        let addr = SocketAddr::new(bind_ip, port);

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .with_state(state);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!("herakles-res-monitor listening on http://{}", addr);
        Some((listener, app))
    } else {
        None
    };

    if collectors.listener_count() == 0 {
        warn!("Nothing is listening to any metric; use --watch or --listen to start sampling");
    }

    let bus = SettingsBus::new();
    let dispatchers = collectors.attach_all(&config, &bus);

    let mut terminate = signal::unix::signal(SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    let mut hangup = signal::unix::signal(SignalKind::hangup())
        .context("failed to install SIGHUP handler")?;

    let server = async move {
        match exporter {
            Some((listener, app)) => axum::serve(listener, app).await,
            None => std::future::pending::<std::io::Result<()>>().await,
        }
    };
    tokio::pin!(server);

    let result = loop {
        tokio::select! {
            result = &mut server => {
                if let Err(e) = &result {
                    error!("Server error: {}", e);
                }
                break result.map_err(anyhow::Error::from);
            }
            _ = signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
                break Ok(());
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break Ok(());
            }
            _ = hangup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                reload_settings(&args, &mut config, &bus);
            }
        }
    };

    collectors.unlisten(subscriber);
    collectors.stop_all();
    for handle in dispatchers {
        handle.abort();
        let _ = handle.await;
    }

    info!("herakles-res-monitor stopped");
    result
}
