//! Error taxonomy for the sensor and actuation layers.
//! The control loop matches on these kinds to decide retry vs skip; the
//! Display chains keep the human-readable context for logs.

use std::io;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum SensorError {
    #[error("k10temp sensor not found in /sys/class/hwmon")]
    SensorNotFound,

    #[error("failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    ParseFailed { path: PathBuf, reason: String },

    #[error("smartctl failed for {device}: {reason}")]
    SubprocessFailed { device: String, reason: String },

    #[error("no temperature found for device {0}")]
    NoTemperatureFound(String),

    #[error("no spinning disks found")]
    NoDisksFound,

    #[error("failed to read temperatures from any disk: {0}")]
    AllDisksFailed(String),
}

#[derive(thiserror::Error, Debug)]
pub enum IpmiError {
    #[error("duty cycle must be between 0-100, got {0}")]
    InvalidDuty(i64),

    #[error("IPMI command failed after {attempts} attempts: {last_failure}")]
    CommandFailed { attempts: u32, last_failure: String },

    #[error("failed to read IPMI sensors: {0}")]
    SensorReadFailed(String),

    #[error("no fan sensors found in IPMI output")]
    NoFanReadings,
}
