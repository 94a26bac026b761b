//! x570-fanctl: closed-loop PID chassis fan controller for the ASRock
//! X570D4U-2L2T BMC.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use x570_fanctl::app::cli::Args;
use x570_fanctl::app::logging;
use x570_fanctl::config::load::load_config;
use x570_fanctl::config::types::Config;
use x570_fanctl::control::pid::PidController;
use x570_fanctl::control::runner::ControlLoop;
use x570_fanctl::hardware::ipmi::FanController;
use x570_fanctl::hardware::sensors::SensorProvider;
use x570_fanctl::metrics::{self, Metrics};
use x570_fanctl::system::executor::{CommandRunner, SystemCommandRunner};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(&args.config).await?;
    if let Some(level) = &args.log_level {
        config.server.log_level = level.clone();
        config.validate().context("config validation failed")?;
    }

    logging::init_tracing(&config.server.log_level);

    info!(
        "starting fan controller v{} (config: {})",
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
    let fans = Arc::new(FanController::new(Arc::clone(&runner)));

    if args.test_ipmi {
        fans.self_test().await.context("IPMI test failed")?;
        return Ok(());
    }

    let sensors = SensorProvider::new(Arc::clone(&runner));
    validate_environment(&sensors, &fans, &config, args.dry_run).await?;

    let metrics = Arc::new(Metrics::new().context("failed to initialize metrics")?);
    metrics::spawn_server(Arc::clone(&metrics), config.server.metrics_port)?;

    let mut pid = PidController::new(
        config.pid.kp,
        config.pid.ki,
        config.pid.kd,
        config.temperature.target_hdd,
        config.fans.min_duty as f64,
        config.fans.max_duty as f64,
        config.pid.integral_max,
    );
    for warning in pid.validate_gains() {
        warn!("PID tuning: {}", warning);
    }
    debug!("PID state at startup: {:?}", pid.state());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut control = ControlLoop::new(
        config.clone(),
        pid,
        sensors,
        Arc::clone(&fans),
        Arc::clone(&metrics),
        args.dry_run,
        shutdown_rx,
    );

    let loop_task = tokio::spawn(async move { control.run().await });

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received (SIGINT)"),
        _ = sigterm.recv() => info!("shutdown signal received (SIGTERM)"),
    }

    // Let the current tick drain, then push the fans to full as the parting
    // command.
    let _ = shutdown_tx.send(true);
    if let Err(e) = loop_task.await {
        error!("control loop task failed: {}", e);
    }

    if !args.dry_run {
        info!("setting fans to 100% for shutdown...");
        match fans.set_all_fans(100).await {
            Ok(()) => {
                info!("fans set to 100% for safety");
                info!("final fan speeds: {}", fans.fan_speeds_for_logging().await);
            }
            Err(e) => warn!("failed to set fans to 100% during shutdown: {}", e),
        }
    }

    info!("fan controller stopped");
    Ok(())
}

/// Confirm the host actually has the sensors and BMC this controller needs.
/// Any failure here refuses startup.
async fn validate_environment(
    sensors: &SensorProvider,
    fans: &FanController,
    config: &Config,
    dry_run: bool,
) -> Result<()> {
    sensors
        .get_cpu_temperature()
        .await
        .context("CPU temperature sensor not accessible")?;

    let disk_temps = sensors
        .get_all_disk_temperatures(&config.disks.exclude_patterns)
        .await
        .context("disk temperature sensors not accessible")?;

    if !dry_run {
        fans.get_fan_speeds()
            .await
            .context("IPMI not accessible")?;
    }

    info!(
        "environment validation passed: {} disks, CPU sensor OK",
        disk_temps.len()
    );
    Ok(())
}
