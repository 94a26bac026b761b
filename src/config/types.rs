//! Configuration structs and per-field defaults.
//!
//! Every field carries a serde default so a sparse YAML file (or a missing
//! section) still produces a fully-populated configuration.

use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub temperature: TemperatureConfig,
    #[serde(default)]
    pub fans: FanConfig,
    #[serde(default)]
    pub pid: PidConfig,
    #[serde(default)]
    pub disks: DiskConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemperatureConfig {
    /// Target for the warmest-N disk average (°C).
    #[serde(default = "default_target_hdd")]
    pub target_hdd: f64,
    /// Disk emergency threshold (°C).
    #[serde(default = "default_max_hdd")]
    pub max_hdd: f64,
    /// CPU emergency threshold (°C).
    #[serde(default = "default_max_cpu")]
    pub max_cpu: f64,
    /// How often to sample temperatures and adjust fans.
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "parse_go_duration"
    )]
    pub poll_interval: Duration,
    /// Average the temperatures of this many warmest disks.
    #[serde(default = "default_warmest_disks")]
    pub warmest_disks: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FanConfig {
    #[serde(default = "default_min_duty")]
    pub min_duty: i64,
    #[serde(default = "default_max_duty")]
    pub max_duty: i64,
    /// Duty commanded once at startup, before the first PID output.
    #[serde(default = "default_startup_duty")]
    pub startup_duty: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PidConfig {
    #[serde(default = "default_kp")]
    pub kp: f64,
    #[serde(default = "default_ki")]
    pub ki: f64,
    #[serde(default = "default_kd")]
    pub kd: f64,
    /// Anti-windup bound on the integral accumulator.
    #[serde(default = "default_integral_max")]
    pub integral_max: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskConfig {
    /// Regex patterns for block devices to ignore during discovery.
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
}

fn default_metrics_port() -> u16 {
    9090
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_target_hdd() -> f64 {
    38.0
}
fn default_max_hdd() -> f64 {
    40.0
}
fn default_max_cpu() -> f64 {
    75.0
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_warmest_disks() -> usize {
    4
}
fn default_min_duty() -> i64 {
    30
}
fn default_max_duty() -> i64 {
    100
}
fn default_startup_duty() -> i64 {
    50
}
fn default_kp() -> f64 {
    5.0
}
fn default_ki() -> f64 {
    0.1
}
fn default_kd() -> f64 {
    20.0
}
fn default_integral_max() -> f64 {
    50.0
}
fn default_exclude_patterns() -> Vec<String> {
    ["^loop", "^sr", "^zram", "^zd", "^dm-"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            log_level: default_log_level(),
        }
    }
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            target_hdd: default_target_hdd(),
            max_hdd: default_max_hdd(),
            max_cpu: default_max_cpu(),
            poll_interval: default_poll_interval(),
            warmest_disks: default_warmest_disks(),
        }
    }
}

impl Default for FanConfig {
    fn default() -> Self {
        Self {
            min_duty: default_min_duty(),
            max_duty: default_max_duty(),
            startup_duty: default_startup_duty(),
        }
    }
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: default_kp(),
            ki: default_ki(),
            kd: default_kd(),
            integral_max: default_integral_max(),
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            temperature: TemperatureConfig::default(),
            fans: FanConfig::default(),
            pid: PidConfig::default(),
            disks: DiskConfig::default(),
        }
    }
}

/// Deserialize Go-style duration strings (`30s`, `1m30s`).
fn parse_go_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

impl Config {
    /// Check all values for logical consistency. Any violation refuses
    /// startup.
    pub fn validate(&self) -> Result<()> {
        if self.temperature.target_hdd >= self.temperature.max_hdd {
            bail!(
                "target_hdd ({:.1}) must be less than max_hdd ({:.1})",
                self.temperature.target_hdd,
                self.temperature.max_hdd
            );
        }
        if self.temperature.target_hdd <= 0.0 {
            bail!(
                "target_hdd must be positive, got {:.1}",
                self.temperature.target_hdd
            );
        }
        if self.temperature.max_cpu <= 0.0 {
            bail!("max_cpu must be positive, got {:.1}", self.temperature.max_cpu);
        }
        if self.temperature.poll_interval.is_zero() {
            bail!("poll_interval must be positive");
        }
        if self.temperature.warmest_disks < 1 {
            bail!(
                "warmest_disks must be positive, got {}",
                self.temperature.warmest_disks
            );
        }

        if !(0..=100).contains(&self.fans.min_duty) {
            bail!("min_duty must be between 0-100, got {}", self.fans.min_duty);
        }
        if !(0..=100).contains(&self.fans.max_duty) {
            bail!("max_duty must be between 0-100, got {}", self.fans.max_duty);
        }
        if !(0..=100).contains(&self.fans.startup_duty) {
            bail!(
                "startup_duty must be between 0-100, got {}",
                self.fans.startup_duty
            );
        }
        if self.fans.min_duty >= self.fans.max_duty {
            bail!(
                "min_duty ({}) must be less than max_duty ({})",
                self.fans.min_duty,
                self.fans.max_duty
            );
        }

        if self.pid.kp < 0.0 {
            bail!("kp must be non-negative, got {:.3}", self.pid.kp);
        }
        if self.pid.ki < 0.0 {
            bail!("ki must be non-negative, got {:.3}", self.pid.ki);
        }
        if self.pid.kd < 0.0 {
            bail!("kd must be non-negative, got {:.3}", self.pid.kd);
        }
        if self.pid.integral_max <= 0.0 {
            bail!(
                "integral_max must be positive, got {:.3}",
                self.pid.integral_max
            );
        }

        if self.server.metrics_port == 0 {
            bail!("metrics_port must be between 1-65535, got 0");
        }
        match self.server.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => bail!(
                "log_level must be one of: debug, info, warn, error, got {}",
                other
            ),
        }

        Ok(())
    }
}
