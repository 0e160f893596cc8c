use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use renogy_collector::app::{build_runner, build_timeseries};
use renogy_collector::prometheus::{self, PrometheusSink};
use renogy_collector::CollectorConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args();
    let config = CollectorConfig::load_with_path(args.config).context("load config failed")?;
    config.validate().context("config validation failed")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = prometheus::install_recorder()?;
    let metrics_handle = match config.metrics_listen.as_deref() {
        Some(listen) => {
            let addr: SocketAddr = listen.parse().context("metrics.listen")?;
            Some(tokio::spawn(prometheus::serve(addr, handle, shutdown_rx.clone())))
        }
        None => None,
    };

    let timeseries = build_timeseries(&config).await?;
    let metrics_sink = Arc::new(PrometheusSink::new(config.metrics_namespace.clone()));
    let runner = build_runner(&config, timeseries, metrics_sink)?;

    if args.once {
        let report = runner.run_once().await;
        info!(?report, "single cycle finished");
        return Ok(());
    }

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());
    let runner_handle = tokio::spawn(runner.run(shutdown_rx.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("listen for shutdown signal")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Err(err) = runner_handle.await {
        warn!(error = %err, "cycle loop task failed");
    }
    if let Some(handle) = metrics_handle {
        match handle.await {
            Ok(Err(err)) => warn!(error = %err, "metrics server exited with error"),
            Err(err) => warn!(error = %err, "metrics server task failed"),
            Ok(Ok(())) => {}
        }
    }
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

struct Args {
    config: Option<String>,
    once: bool,
}

fn parse_args() -> Args {
    let mut parsed = Args {
        config: None,
        once: false,
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            parsed.config = args.next();
        } else if let Some(path) = arg.strip_prefix("--config=") {
            parsed.config = Some(path.to_string());
        } else if arg == "--once" {
            parsed.once = true;
        } else {
            warn!(arg = %arg, "ignoring unknown argument");
        }
    }
    parsed
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(mut shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    let state = [sd_notify::NotifyState::Watchdog];
                    if let Err(err) = sd_notify::notify(false, &state) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    Some(Duration::from_micros(watchdog_usec.saturating_div(2).max(100_000)))
}
