//! BMC fan actuation over raw IPMI commands.
//!
//! The ASRock X570D4U-2L2T drives all six fan headers through one vendor
//! command: `raw 0x3a 0xd6` followed by six duty bytes and ten padding bytes
//! fixed at 0x64. Confirmed against the board; other BMCs will not understand
//! this opcode.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::errors::IpmiError;
use crate::system::executor::CommandRunner;
use crate::system::parser;

const NUM_FANS: usize = 6;
const NUM_PADDING: usize = 10;
const MAX_ATTEMPTS: u32 = 3;

pub struct FanController {
    runner: Arc<dyn CommandRunner>,
    /// Pause between failed attempts within one set_all_fans() call.
    retry_delay: Duration,
    /// Spin-up settle time used by the self-test.
    settle_delay: Duration,
}

impl FanController {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            retry_delay: Duration::from_secs(2),
            settle_delay: Duration::from_secs(10),
        }
    }

    #[cfg(test)]
    pub fn with_delays(
        runner: Arc<dyn CommandRunner>,
        retry_delay: Duration,
        settle_delay: Duration,
    ) -> Self {
        Self {
            runner,
            retry_delay,
            settle_delay,
        }
    }

    /// Build the `ipmitool` argv for the given duty cycle.
    pub fn encode_duty_args(duty_percent: i64) -> Result<Vec<String>, IpmiError> {
        if !(0..=100).contains(&duty_percent) {
            return Err(IpmiError::InvalidDuty(duty_percent));
        }

        let duty_hex = format!("0x{:02x}", duty_percent);

        let mut args = vec!["raw".to_string(), "0x3a".to_string(), "0xd6".to_string()];
        args.extend(std::iter::repeat(duty_hex).take(NUM_FANS));
        args.extend(std::iter::repeat("0x64".to_string()).take(NUM_PADDING));

        Ok(args)
    }

    /// Set the duty cycle for all fans. Retries up to three times with a
    /// constant pause; the error carries the last attempt's output.
    pub async fn set_all_fans(&self, duty_percent: i64) -> Result<(), IpmiError> {
        let args = Self::encode_duty_args(duty_percent)?;

        let mut last_failure = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match self.runner.run("ipmitool", &args).await {
                Ok(out) if out.status_ok => return Ok(()),
                Ok(out) => {
                    last_failure = format!(
                        "attempt {} failed: non-zero exit, output: {}",
                        attempt,
                        out.output.trim()
                    );
                }
                Err(e) => {
                    last_failure = format!("attempt {} failed: {}", attempt, e);
                }
            }

            if attempt < MAX_ATTEMPTS {
                warn!(
                    "IPMI command failed, retrying in {:?}: {}",
                    self.retry_delay, last_failure
                );
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(IpmiError::CommandFailed {
            attempts: MAX_ATTEMPTS,
            last_failure,
        })
    }

    /// Read current fan speeds from the IPMI sensor table.
    pub async fn get_fan_speeds(&self) -> Result<HashMap<String, i64>, IpmiError> {
        let args = vec!["sensor".to_string()];
        let out = self
            .runner
            .run("ipmitool", &args)
            .await
            .map_err(|e| IpmiError::SensorReadFailed(e.to_string()))?;

        if !out.status_ok {
            return Err(IpmiError::SensorReadFailed(out.output.trim().to_string()));
        }

        let speeds = parser::parse_fan_speeds(&out.output);
        if speeds.is_empty() {
            return Err(IpmiError::NoFanReadings);
        }

        Ok(speeds)
    }

    /// Fan speeds as a single `FAN1:1600 FAN2:1700` log token.
    pub async fn fan_speeds_for_logging(&self) -> String {
        match self.get_fan_speeds().await {
            Ok(speeds) => {
                let mut parts: Vec<String> =
                    speeds.iter().map(|(fan, rpm)| format!("{}:{}", fan, rpm)).collect();
                parts.sort();
                parts.join(" ")
            }
            Err(e) => format!("error reading fan speeds: {}", e),
        }
    }

    /// Verify the 0xd6 command end-to-end: command 50% duty, confirm the fans
    /// slow to roughly half of baseline, then restore 100%.
    pub async fn self_test(&self) -> anyhow::Result<()> {
        info!("testing IPMI command format 0xd6...");

        info!("getting baseline fan speeds...");
        let baseline = self.get_fan_speeds().await?;
        info!("baseline speeds: {}", self.fan_speeds_for_logging().await);

        info!("setting fans to 50% duty cycle...");
        self.set_all_fans(50).await?;

        info!(
            "waiting {:?} for fans to adjust...",
            self.settle_delay
        );
        tokio::time::sleep(self.settle_delay).await;

        let adjusted = self.get_fan_speeds().await?;
        info!("adjusted speeds: {}", self.fan_speeds_for_logging().await);

        // A responding fan should sit in the 40-60% band of its baseline RPM.
        let mut changes_detected = 0;
        for (fan, new_rpm) in &adjusted {
            let Some(baseline_rpm) = baseline.get(fan) else {
                continue;
            };
            let expected_min = (*baseline_rpm as f64 * 0.4) as i64;
            let expected_max = (*baseline_rpm as f64 * 0.6) as i64;

            if (expected_min..=expected_max).contains(new_rpm) {
                changes_detected += 1;
                info!(
                    "OK {}: {} -> {} RPM ({:.1}% of baseline)",
                    fan,
                    baseline_rpm,
                    new_rpm,
                    *new_rpm as f64 / *baseline_rpm as f64 * 100.0
                );
            } else {
                warn!(
                    "{}: {} -> {} RPM (unexpected change)",
                    fan, baseline_rpm, new_rpm
                );
            }
        }

        if changes_detected == 0 {
            anyhow::bail!("no fan speed changes detected - IPMI command may not be working");
        }
        info!(
            "IPMI test successful: {} fans responded to command",
            changes_detected
        );

        info!("resetting fans to 100% duty cycle...");
        self.set_all_fans(100).await?;

        info!("waiting {:?} for fans to return to 100%...", self.settle_delay);
        tokio::time::sleep(self.settle_delay).await;

        self.get_fan_speeds().await?;
        info!("final speeds: {}", self.fan_speeds_for_logging().await);

        info!("IPMI test completed successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::system::executor::testing::ScriptedRunner;

    const SENSOR_TABLE: &str = "\
FAN1             | 1600.000   | RPM        | ok    | na
FAN2             | 1700.000   | RPM        | ok    | na
FAN3             | na         | RPM        | na    | na
CPU Temp         | 48.000     | degrees C  | ok    | na
";

    #[test]
    fn encodes_fifty_percent_duty_exactly() {
        let args = FanController::encode_duty_args(50).unwrap();
        let expected: Vec<String> = [
            "raw", "0x3a", "0xd6", "0x32", "0x32", "0x32", "0x32", "0x32", "0x32", "0x64",
            "0x64", "0x64", "0x64", "0x64", "0x64", "0x64", "0x64", "0x64", "0x64",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn encodes_boundary_duties() {
        let zero = FanController::encode_duty_args(0).unwrap();
        assert_eq!(zero[3], "0x00");
        let full = FanController::encode_duty_args(100).unwrap();
        assert_eq!(full[3], "0x64");
        assert_eq!(full.len(), 3 + 6 + 10);
    }

    #[test]
    fn out_of_range_duty_is_rejected() {
        assert!(matches!(
            FanController::encode_duty_args(-1),
            Err(IpmiError::InvalidDuty(-1))
        ));
        assert!(matches!(
            FanController::encode_duty_args(101),
            Err(IpmiError::InvalidDuty(101))
        ));
    }

    #[tokio::test]
    async fn set_all_fans_succeeds_first_try() {
        let runner = Arc::new(ScriptedRunner::new(|_, _| ScriptedRunner::ok("")));
        let fans = FanController::new(Arc::clone(&runner) as Arc<dyn CommandRunner>);

        fans.set_all_fans(75).await.unwrap();
        assert_eq!(runner.call_count(), 1);

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].0, "ipmitool");
        assert_eq!(calls[0].1[3], "0x4b");
    }

    #[tokio::test]
    async fn set_all_fans_retries_then_recovers() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let runner = Arc::new(ScriptedRunner::new(move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                ScriptedRunner::exit_failure("Unable to send RAW command")
            } else {
                ScriptedRunner::ok("")
            }
        }));
        let fans = FanController::with_delays(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            Duration::ZERO,
            Duration::ZERO,
        );

        fans.set_all_fans(40).await.unwrap();
        assert_eq!(runner.call_count(), 2);
    }

    #[tokio::test]
    async fn set_all_fans_gives_up_after_three_attempts() {
        let runner = Arc::new(ScriptedRunner::new(|_, _| {
            ScriptedRunner::exit_failure("Unable to send RAW command")
        }));
        let fans = FanController::with_delays(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            Duration::ZERO,
            Duration::ZERO,
        );

        let err = fans.set_all_fans(40).await.unwrap_err();
        assert_eq!(runner.call_count(), 3);
        match err {
            IpmiError::CommandFailed { attempts, last_failure } => {
                assert_eq!(attempts, 3);
                assert!(last_failure.contains("Unable to send RAW command"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn fan_speeds_skip_na_sensors() {
        let runner = Arc::new(ScriptedRunner::new(|_, _| ScriptedRunner::ok(SENSOR_TABLE)));
        let fans = FanController::new(runner);

        let speeds = fans.get_fan_speeds().await.unwrap();
        assert_eq!(speeds.len(), 2);
        assert_eq!(speeds["FAN1"], 1600);
        assert_eq!(speeds["FAN2"], 1700);
    }

    #[tokio::test]
    async fn empty_fan_table_is_an_error() {
        let runner = Arc::new(ScriptedRunner::new(|_, _| {
            ScriptedRunner::ok("CPU Temp | 48.000 | degrees C | ok | na\n")
        }));
        let fans = FanController::new(runner);

        assert!(matches!(
            fans.get_fan_speeds().await,
            Err(IpmiError::NoFanReadings)
        ));
    }

    #[tokio::test]
    async fn self_test_passes_when_fans_track_duty() {
        // Sensor reads return full speed until a 50% command lands, then half
        // speed until 100% is restored.
        let at_half = Arc::new(AtomicUsize::new(0));
        let state = Arc::clone(&at_half);
        let runner = Arc::new(ScriptedRunner::new(move |_, args| {
            if args[0] == "raw" {
                state.store(if args[3] == "0x32" { 1 } else { 0 }, Ordering::SeqCst);
                return ScriptedRunner::ok("");
            }
            if state.load(Ordering::SeqCst) == 1 {
                ScriptedRunner::ok("FAN1 | 800.000 | RPM | ok | na\n")
            } else {
                ScriptedRunner::ok("FAN1 | 1600.000 | RPM | ok | na\n")
            }
        }));
        let fans = FanController::with_delays(runner, Duration::ZERO, Duration::ZERO);

        fans.self_test().await.unwrap();
    }

    #[tokio::test]
    async fn self_test_fails_when_no_fan_responds() {
        let runner = Arc::new(ScriptedRunner::new(|_, args| {
            if args[0] == "raw" {
                ScriptedRunner::ok("")
            } else {
                ScriptedRunner::ok("FAN1 | 1600.000 | RPM | ok | na\n")
            }
        }));
        let fans = FanController::with_delays(runner, Duration::ZERO, Duration::ZERO);

        let err = fans.self_test().await.unwrap_err();
        assert!(err.to_string().contains("no fan speed changes detected"));
    }
}
