//! Temperature sensor provider: CPU via the k10temp hwmon chip, spinning
//! disks via sysfs discovery and smartctl.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, warn};

use crate::errors::SensorError;
use crate::system::executor::CommandRunner;
use crate::system::parser;

pub struct SensorProvider {
    hwmon_base: PathBuf,
    block_base: PathBuf,
    runner: Arc<dyn CommandRunner>,
    /// k10temp hwmon directory, resolved on first use and kept for the
    /// process lifetime (hwmon numbering is stable between boots only).
    cpu_hwmon: OnceLock<PathBuf>,
}

impl SensorProvider {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_roots(runner, "/sys/class/hwmon", "/sys/block")
    }

    /// Provider rooted at alternate sysfs paths. Tests point this at a
    /// scratch tree.
    pub fn with_roots(
        runner: Arc<dyn CommandRunner>,
        hwmon_base: impl Into<PathBuf>,
        block_base: impl Into<PathBuf>,
    ) -> Self {
        Self {
            hwmon_base: hwmon_base.into(),
            block_base: block_base.into(),
            runner,
            cpu_hwmon: OnceLock::new(),
        }
    }

    /// Read the CPU package temperature in degrees Celsius.
    pub async fn get_cpu_temperature(&self) -> Result<f64, SensorError> {
        let hwmon_dir = match self.cpu_hwmon.get() {
            Some(dir) => dir.clone(),
            None => {
                let found = self.find_k10temp_path()?;
                debug!("k10temp sensor found at {}", found.display());
                let _ = self.cpu_hwmon.set(found.clone());
                found
            }
        };

        self.read_cpu_temp_from(&hwmon_dir).await
    }

    /// Search /sys/class/hwmon/hwmon*/name for the k10temp chip.
    fn find_k10temp_path(&self) -> Result<PathBuf, SensorError> {
        let pattern = self.hwmon_base.join("hwmon*").join("name");
        let matches =
            glob::glob(&pattern.to_string_lossy()).map_err(|_| SensorError::SensorNotFound)?;

        for name_path in matches.filter_map(Result::ok) {
            let Ok(content) = std::fs::read_to_string(&name_path) else {
                continue;
            };
            if content.trim() == "k10temp" {
                if let Some(dir) = name_path.parent() {
                    return Ok(dir.to_path_buf());
                }
            }
        }

        Err(SensorError::SensorNotFound)
    }

    async fn read_cpu_temp_from(&self, hwmon_dir: &Path) -> Result<f64, SensorError> {
        let temp_path = hwmon_dir.join("temp1_input");
        let data =
            tokio::fs::read_to_string(&temp_path)
                .await
                .map_err(|e| SensorError::ReadFailed {
                    path: temp_path.clone(),
                    source: e,
                })?;

        let millidegrees: i64 =
            data.trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| SensorError::ParseFailed {
                    path: temp_path,
                    reason: e.to_string(),
                })?;

        Ok(millidegrees as f64 / 1000.0)
    }

    /// Read the temperature of a single disk via `smartctl -A`.
    pub async fn get_disk_temperature(&self, device: &str) -> Result<i64, SensorError> {
        let args = vec!["-A".to_string(), format!("/dev/{}", device)];
        let result = self
            .runner
            .run("smartctl", &args)
            .await
            .map_err(|e| SensorError::SubprocessFailed {
                device: device.to_string(),
                reason: e.to_string(),
            })?;

        if !result.status_ok {
            return Err(SensorError::SubprocessFailed {
                device: device.to_string(),
                reason: format!("non-zero exit: {}", result.output.trim()),
            });
        }

        let is_nvme = device.starts_with("nvme");
        parser::parse_smartctl_temperature(&result.output, is_nvme)
            .ok_or_else(|| SensorError::NoTemperatureFound(device.to_string()))
    }

    /// Discover spinning disks and read their temperatures.
    /// Errs only if discovery finds nothing or no disk produced a reading;
    /// individual disk failures are logged and skipped.
    pub async fn get_all_disk_temperatures(
        &self,
        exclude_patterns: &[String],
    ) -> Result<HashMap<String, i64>, SensorError> {
        let disks = self.discover_spinning_disks(exclude_patterns).await?;
        if disks.is_empty() {
            return Err(SensorError::NoDisksFound);
        }

        let mut temps = HashMap::new();
        let mut failures = Vec::new();

        for disk in &disks {
            match self.get_disk_temperature(disk).await {
                Ok(temp) => {
                    temps.insert(disk.clone(), temp);
                }
                Err(e) => {
                    warn!("failed to read temperature for {}: {}", disk, e);
                    failures.push(format!("{}: {}", disk, e));
                }
            }
        }

        if temps.is_empty() {
            return Err(SensorError::AllDisksFailed(failures.join("; ")));
        }

        if !failures.is_empty() {
            warn!(
                "partial disk temperature reading failures: {}",
                failures.join("; ")
            );
        }

        Ok(temps)
    }

    /// Enumerate /sys/block for rotational, non-removable devices, minus any
    /// matching an exclude pattern. Invalid patterns are logged and skipped.
    pub async fn discover_spinning_disks(
        &self,
        exclude_patterns: &[String],
    ) -> Result<Vec<String>, SensorError> {
        let excludes: Vec<Regex> = exclude_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("invalid exclude pattern {:?}: {}", p, e);
                    None
                }
            })
            .collect();

        let mut entries =
            tokio::fs::read_dir(&self.block_base)
                .await
                .map_err(|e| SensorError::ReadFailed {
                    path: self.block_base.clone(),
                    source: e,
                })?;

        let mut disks = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SensorError::ReadFailed {
                path: self.block_base.clone(),
                source: e,
            })?
        {
            let device = entry.file_name().to_string_lossy().into_owned();

            if excludes.iter().any(|re| re.is_match(&device)) {
                continue;
            }

            match self.is_spinning_disk(&device).await {
                Ok(true) => disks.push(device),
                Ok(false) => {}
                Err(e) => warn!("failed to check whether {} is spinning: {}", device, e),
            }
        }

        // Stable order keeps per-disk metrics and log lines consistent.
        disks.sort();
        Ok(disks)
    }

    /// A spinning disk has rotational == "1" and removable == "0".
    async fn is_spinning_disk(&self, device: &str) -> Result<bool, SensorError> {
        let rota_path = self.block_base.join(device).join("queue/rotational");
        let rota =
            tokio::fs::read_to_string(&rota_path)
                .await
                .map_err(|e| SensorError::ReadFailed {
                    path: rota_path,
                    source: e,
                })?;
        if rota.trim() != "1" {
            return Ok(false);
        }

        let removable_path = self.block_base.join(device).join("removable");
        let removable = tokio::fs::read_to_string(&removable_path).await.map_err(|e| {
            SensorError::ReadFailed {
                path: removable_path,
                source: e,
            }
        })?;

        Ok(removable.trim() == "0")
    }
}

/// Arithmetic mean of the `n` warmest temperatures. Empty input or n == 0
/// yields 0.0; fewer than `n` readings average whatever is present.
pub fn average_of_warmest(temps: &HashMap<String, i64>, n: usize) -> f64 {
    if temps.is_empty() || n == 0 {
        return 0.0;
    }

    let mut values: Vec<i64> = temps.values().copied().collect();
    values.sort_unstable_by(|a, b| b.cmp(a));

    let take = n.min(values.len());
    let sum: i64 = values[..take].iter().sum();

    sum as f64 / take as f64
}

/// Highest temperature in the map, or 0 when empty.
pub fn max_temperature(temps: &HashMap<String, i64>) -> i64 {
    temps.values().copied().max().unwrap_or(0)
}

/// Lowest temperature in the map, or 0 when empty.
pub fn min_temperature(temps: &HashMap<String, i64>) -> i64 {
    temps.values().copied().min().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::system::executor::testing::ScriptedRunner;

    fn temps(entries: &[(&str, i64)]) -> HashMap<String, i64> {
        entries
            .iter()
            .map(|(name, temp)| (name.to_string(), *temp))
            .collect()
    }

    #[test]
    fn warmest_average_of_nominal_sample() {
        let t = temps(&[
            ("sda", 35),
            ("sdb", 42),
            ("sdc", 38),
            ("sdd", 45),
            ("sde", 40),
            ("sdf", 37),
        ]);
        // Warmest four: 45, 42, 40, 38.
        assert!((average_of_warmest(&t, 4) - 41.25).abs() < 1e-9);
        assert_eq!(max_temperature(&t), 45);
        assert_eq!(min_temperature(&t), 35);
    }

    #[test]
    fn warmest_average_with_fewer_disks_than_n() {
        let t = temps(&[("sda", 35), ("sdb", 40)]);
        assert!((average_of_warmest(&t, 5) - 37.5).abs() < 1e-9);
    }

    #[test]
    fn aggregates_return_zero_for_empty_input() {
        let t = HashMap::new();
        assert_eq!(average_of_warmest(&t, 4), 0.0);
        assert_eq!(average_of_warmest(&t, 0), 0.0);
        assert_eq!(max_temperature(&t), 0);
        assert_eq!(min_temperature(&t), 0);
    }

    #[test]
    fn warmest_average_lies_between_min_and_max() {
        let t = temps(&[("sda", 31), ("sdb", 44), ("sdc", 39), ("sdd", 36)]);
        for n in 1..=6 {
            let avg = average_of_warmest(&t, n);
            assert!(avg >= min_temperature(&t) as f64);
            assert!(avg <= max_temperature(&t) as f64);
        }
    }

    fn write_block_device(root: &Path, name: &str, rotational: &str, removable: &str) {
        let dev = root.join(name);
        fs::create_dir_all(dev.join("queue")).unwrap();
        fs::write(dev.join("queue/rotational"), rotational).unwrap();
        fs::write(dev.join("removable"), removable).unwrap();
    }

    fn write_hwmon(root: &Path, index: u32, name: &str, temp_millis: &str) {
        let dir = root.join(format!("hwmon{}", index));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("name"), format!("{}\n", name)).unwrap();
        fs::write(dir.join("temp1_input"), format!("{}\n", temp_millis)).unwrap();
    }

    fn noop_runner() -> Arc<ScriptedRunner> {
        Arc::new(ScriptedRunner::new(|_, _| ScriptedRunner::ok("")))
    }

    #[tokio::test]
    async fn discovers_rotational_non_removable_disks() {
        let tmp = TempDir::new().unwrap();
        let block = tmp.path().join("block");
        write_block_device(&block, "sda", "1\n", "0\n");
        write_block_device(&block, "sdb", "1\n", "0\n");
        write_block_device(&block, "nvme0n1", "0\n", "0\n"); // flash
        write_block_device(&block, "sdc", "1\n", "1\n"); // removable
        write_block_device(&block, "loop0", "1\n", "0\n"); // excluded

        let provider =
            SensorProvider::with_roots(noop_runner(), tmp.path().join("hwmon"), &block);
        let disks = provider
            .discover_spinning_disks(&["^loop".to_string()])
            .await
            .unwrap();

        assert_eq!(disks, vec!["sda".to_string(), "sdb".to_string()]);
    }

    #[tokio::test]
    async fn invalid_exclude_pattern_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let block = tmp.path().join("block");
        write_block_device(&block, "sda", "1\n", "0\n");

        let provider =
            SensorProvider::with_roots(noop_runner(), tmp.path().join("hwmon"), &block);
        let disks = provider
            .discover_spinning_disks(&["[invalid".to_string()])
            .await
            .unwrap();

        assert_eq!(disks, vec!["sda".to_string()]);
    }

    #[tokio::test]
    async fn cpu_temperature_reads_k10temp_in_millidegrees() {
        let tmp = TempDir::new().unwrap();
        let hwmon = tmp.path().join("hwmon");
        write_hwmon(&hwmon, 0, "nvme", "41850");
        write_hwmon(&hwmon, 1, "k10temp", "54125");

        let provider =
            SensorProvider::with_roots(noop_runner(), &hwmon, tmp.path().join("block"));
        let temp = provider.get_cpu_temperature().await.unwrap();
        assert!((temp - 54.125).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_k10temp_is_sensor_not_found() {
        let tmp = TempDir::new().unwrap();
        let hwmon = tmp.path().join("hwmon");
        write_hwmon(&hwmon, 0, "acpitz", "30000");

        let provider =
            SensorProvider::with_roots(noop_runner(), &hwmon, tmp.path().join("block"));
        let err = provider.get_cpu_temperature().await.unwrap_err();
        assert!(matches!(err, SensorError::SensorNotFound));
    }

    #[tokio::test]
    async fn disk_read_dispatches_on_device_prefix() {
        let runner = Arc::new(ScriptedRunner::new(|program, args| {
            assert_eq!(program, "smartctl");
            match args[1].as_str() {
                "/dev/sda" => ScriptedRunner::ok(
                    "194 Temperature_Celsius 0x0002 171 171 000 Old_age Always - 38 (Min/Max 11/51)\n",
                ),
                "/dev/nvme0n1" => ScriptedRunner::ok("Temperature:  33 Celsius\n"),
                other => panic!("unexpected device {}", other),
            }
        }));
        let provider = SensorProvider::with_roots(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            "/nonexistent",
            "/nonexistent",
        );

        assert_eq!(provider.get_disk_temperature("sda").await.unwrap(), 38);
        assert_eq!(provider.get_disk_temperature("nvme0n1").await.unwrap(), 33);
    }

    #[tokio::test]
    async fn failed_smartctl_exit_is_subprocess_failure() {
        let runner = Arc::new(ScriptedRunner::new(|_, _| {
            ScriptedRunner::exit_failure("Smartctl open device: /dev/sda failed")
        }));
        let provider = SensorProvider::with_roots(runner, "/nonexistent", "/nonexistent");

        let err = provider.get_disk_temperature("sda").await.unwrap_err();
        assert!(matches!(err, SensorError::SubprocessFailed { .. }));
    }

    #[tokio::test]
    async fn all_disks_failing_is_an_aggregate_error() {
        let tmp = TempDir::new().unwrap();
        let block = tmp.path().join("block");
        write_block_device(&block, "sda", "1\n", "0\n");

        let runner = Arc::new(ScriptedRunner::new(|_, _| {
            ScriptedRunner::exit_failure("device open failed")
        }));
        let provider = SensorProvider::with_roots(runner, tmp.path().join("hwmon"), &block);

        let err = provider.get_all_disk_temperatures(&[]).await.unwrap_err();
        assert!(matches!(err, SensorError::AllDisksFailed(_)));
    }

    #[tokio::test]
    async fn partial_disk_failures_are_soft() {
        let tmp = TempDir::new().unwrap();
        let block = tmp.path().join("block");
        write_block_device(&block, "sda", "1\n", "0\n");
        write_block_device(&block, "sdb", "1\n", "0\n");

        let runner = Arc::new(ScriptedRunner::new(|_, args| {
            if args[1] == "/dev/sda" {
                ScriptedRunner::exit_failure("device open failed")
            } else {
                ScriptedRunner::ok(
                    "194 Temperature_Celsius 0x0002 171 171 000 Old_age Always - 42 (Min/Max 11/51)\n",
                )
            }
        }));
        let provider = SensorProvider::with_roots(runner, tmp.path().join("hwmon"), &block);

        let temps = provider.get_all_disk_temperatures(&[]).await.unwrap();
        assert_eq!(temps.len(), 1);
        assert_eq!(temps["sdb"], 42);
    }
}
