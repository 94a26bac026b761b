//! The control loop: sense -> decide -> actuate -> observe -> sleep.
//!
//! One tick runs to completion before the next begins; the loop owns the PID
//! state and is the only writer of the metrics snapshot. Shutdown is observed
//! at tick boundaries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::types::{Config, TemperatureConfig};
use crate::control::pid::{PidController, PidTerms};
use crate::hardware::ipmi::FanController;
use crate::hardware::sensors::{self, SensorProvider};
use crate::metrics::Metrics;

/// Consecutive actuation failures that force emergency mode.
const MAX_IPMI_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyReason {
    CpuTemp,
    HddTemp,
    IpmiFailure,
}

impl EmergencyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EmergencyReason::CpuTemp => "cpu_temp",
            EmergencyReason::HddTemp => "hdd_temp",
            EmergencyReason::IpmiFailure => "ipmi_failure",
        }
    }
}

/// Decide whether the current temperatures demand 100% duty.
/// The CPU threshold wins when both are exceeded.
pub fn check_emergency(
    cpu_temp: f64,
    max_disk_temp: i64,
    config: &TemperatureConfig,
) -> Option<EmergencyReason> {
    if cpu_temp > config.max_cpu {
        return Some(EmergencyReason::CpuTemp);
    }
    if max_disk_temp as f64 > config.max_hdd {
        return Some(EmergencyReason::HddTemp);
    }
    None
}

/// Outcome of one tick, used for the status line and by tests. None means the
/// tick was skipped because no temperatures could be read.
#[derive(Debug, Clone, Copy)]
pub struct TickSummary {
    pub cpu_temp: f64,
    pub max_disk_temp: i64,
    pub avg_disk_temp: f64,
    pub fan_duty: i64,
    pub pid_error: f64,
    pub emergency: Option<EmergencyReason>,
    pub loop_time: Duration,
}

pub struct ControlLoop {
    config: Config,
    pid: PidController,
    sensors: SensorProvider,
    fans: Arc<FanController>,
    metrics: Arc<Metrics>,
    dry_run: bool,
    shutdown: watch::Receiver<bool>,
    consecutive_ipmi_failures: u32,
}

impl ControlLoop {
    pub fn new(
        config: Config,
        pid: PidController,
        sensors: SensorProvider,
        fans: Arc<FanController>,
        metrics: Arc<Metrics>,
        dry_run: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            pid,
            sensors,
            fans,
            metrics,
            dry_run,
            shutdown,
            consecutive_ipmi_failures: 0,
        }
    }

    /// Run until shutdown is signalled. The final 100% safety command is
    /// issued by the caller after this returns.
    pub async fn run(&mut self) {
        info!(
            "starting control loop (target: {:.1}°C, interval: {})",
            self.config.temperature.target_hdd,
            humantime::format_duration(self.config.temperature.poll_interval)
        );

        // Prime the fans before the first sensor read settles.
        if !self.dry_run {
            match self.fans.set_all_fans(self.config.fans.startup_duty).await {
                Ok(()) => info!(
                    "set initial fan duty to {}%",
                    self.config.fans.startup_duty
                ),
                Err(e) => warn!("failed to set initial fan duty: {}", e),
            }
        }

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.tick().await;
            self.sleep_poll_interval().await;
        }

        info!("control loop stopped");
    }

    /// One full control iteration.
    async fn tick(&mut self) -> Option<TickSummary> {
        let loop_start = Instant::now();

        let (disk_temps, cpu_temp) = match self.read_all_temperatures().await {
            Ok(readings) => readings,
            Err(e) => {
                error!("error reading temperatures: {:#}", e);
                self.metrics.record_error("temperature");
                return None;
            }
        };

        let avg_temp =
            sensors::average_of_warmest(&disk_temps, self.config.temperature.warmest_disks);
        let max_temp = sensors::max_temperature(&disk_temps);

        let mut emergency = check_emergency(cpu_temp, max_temp, &self.config.temperature);

        let (mut fan_duty, pid_terms) = match emergency {
            Some(reason) => {
                warn!("EMERGENCY: {} - setting fans to 100%", reason.as_str());
                // Zeroed terms for observability; the PID keeps its integral
                // history so recovery resumes where it left off.
                (100, PidTerms::default())
            }
            None => {
                let (output, terms) = self.pid.calculate(avg_temp, Instant::now());
                let duty =
                    (output as i64).clamp(self.config.fans.min_duty, self.config.fans.max_duty);
                (duty, terms)
            }
        };

        if !self.dry_run {
            match self.fans.set_all_fans(fan_duty).await {
                Ok(()) => self.consecutive_ipmi_failures = 0,
                Err(e) => {
                    self.consecutive_ipmi_failures += 1;
                    self.metrics.record_error("ipmi");
                    error!(
                        "IPMI command failed ({}/{}): {}",
                        self.consecutive_ipmi_failures, MAX_IPMI_FAILURES, e
                    );

                    if self.consecutive_ipmi_failures >= MAX_IPMI_FAILURES {
                        error!(
                            "too many consecutive IPMI failures ({}), forcing emergency mode",
                            self.consecutive_ipmi_failures
                        );
                        emergency = Some(EmergencyReason::IpmiFailure);
                        fan_duty = 100;
                        if let Err(e) = self.fans.set_all_fans(100).await {
                            error!("critical: failed to set emergency fan duty: {}", e);
                        }
                    }
                }
            }
        }

        // Best-effort readback; an empty map just leaves the RPM gauges stale.
        let fan_speeds = match self.fans.get_fan_speeds().await {
            Ok(speeds) => speeds,
            Err(e) => {
                warn!("failed to read fan speeds: {}", e);
                HashMap::new()
            }
        };

        let loop_time = loop_start.elapsed();

        self.metrics.update_tick(
            &disk_temps,
            cpu_temp,
            &fan_speeds,
            fan_duty,
            &pid_terms,
            avg_temp,
            max_temp,
            emergency,
            loop_time,
        );

        let summary = TickSummary {
            cpu_temp,
            max_disk_temp: max_temp,
            avg_disk_temp: avg_temp,
            fan_duty,
            pid_error: pid_terms.error,
            emergency,
            loop_time,
        };
        self.log_status(&summary);

        Some(summary)
    }

    async fn read_all_temperatures(&self) -> Result<(HashMap<String, i64>, f64)> {
        let disk_temps = self
            .sensors
            .get_all_disk_temperatures(&self.config.disks.exclude_patterns)
            .await
            .context("failed to read disk temperatures")?;

        let cpu_temp = self
            .sensors
            .get_cpu_temperature()
            .await
            .context("failed to read CPU temperature")?;

        Ok((disk_temps, cpu_temp))
    }

    fn log_status(&self, summary: &TickSummary) {
        match summary.emergency {
            Some(reason) => warn!(
                "EMERGENCY: {} | CPU: {:.1}°C | max: {}°C | avg: {:.1}°C | duty: {}% | error: {:.1}°C | time: {:.2?}",
                reason.as_str(),
                summary.cpu_temp,
                summary.max_disk_temp,
                summary.avg_disk_temp,
                summary.fan_duty,
                summary.pid_error,
                summary.loop_time
            ),
            None => info!(
                "status: CPU: {:.1}°C | max: {}°C | avg: {:.1}°C | duty: {}% | error: {:.1}°C | time: {:.2?}",
                summary.cpu_temp,
                summary.max_disk_temp,
                summary.avg_disk_temp,
                summary.fan_duty,
                summary.pid_error,
                summary.loop_time
            ),
        }
    }

    /// Sleep one poll interval, waking early if shutdown is signalled.
    async fn sleep_poll_interval(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.temperature.poll_interval) => {}
            _ = self.shutdown.changed() => {}
        }
    }
}
