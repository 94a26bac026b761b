//! smartctl and `ipmitool sensor` output parsers.
//! Pure functions over captured subprocess output, kept separate from the
//! executor so tests can feed canned transcripts.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

/// Extract the temperature in Celsius from `smartctl -A` output.
///
/// NVMe devices report a line like `Temperature:  33 Celsius` (value is the
/// second field); ATA devices report the `Temperature_Celsius` attribute row
/// where the raw value is the 10th whitespace-separated field. Lines with a
/// malformed numeric field are skipped.
pub fn parse_smartctl_temperature(output: &str, is_nvme: bool) -> Option<i64> {
    for line in output.lines() {
        if is_nvme {
            if line.starts_with("Temperature:") {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() >= 2 {
                    if let Ok(temp) = fields[1].parse::<i64>() {
                        return Some(temp);
                    }
                }
            }
        } else if line.contains("Temperature_Celsius") {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() >= 10 {
                if let Ok(temp) = fields[9].parse::<i64>() {
                    return Some(temp);
                }
            }
        }
    }
    None
}

/// Matches fan sensor rows: `FAN1 | 1600.000 | RPM | ok | ...`
fn fan_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(FAN\w+)\s*\|\s*([0-9.]+|na)\s*\|\s*RPM").unwrap())
}

/// Parse `ipmitool sensor` output into a fan name -> RPM map.
/// Fans reporting `na` (no sensor connected) are omitted; RPM values are
/// truncated to whole revolutions.
pub fn parse_fan_speeds(output: &str) -> HashMap<String, i64> {
    let mut speeds = HashMap::new();

    for line in output.lines() {
        let Some(captures) = fan_line_regex().captures(line) else {
            continue;
        };

        let name = &captures[1];
        let rpm_str = &captures[2];

        if rpm_str == "na" {
            continue;
        }

        match rpm_str.parse::<f64>() {
            Ok(rpm) => {
                speeds.insert(name.to_string(), rpm as i64);
            }
            Err(e) => warn!("failed to parse RPM for {}: {}", name, e),
        }
    }

    speeds
}
