//! smartctl-backed temperature reader.

use super::TemperatureReader;
use crate::error::{self, ErrorKind};

use async_trait::async_trait;
use lazy_static::lazy_static;
use log::debug;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

lazy_static! {
    /// SMART attributes carrying a drive temperature, in order of preference
    static ref TEMPERATURE_ATTRIBUTES: [&'static str; 2] =
        ["Temperature_Celsius", "Airflow_Temperature_Cel"];
}

/// Reads drive temperatures by running `smartctl -A` on the device.
///
/// Each read is bounded by `read_timeout`; a drive that doesn't answer in
/// time yields a sensor error for this tick, the same as any other failed
/// read.
pub struct SmartReader {
    smartctl_path: String,
    read_timeout: Duration,
}

impl SmartReader {
    pub fn new(smartctl_path: String, read_timeout: Duration) -> Self {
        Self {
            smartctl_path,
            read_timeout,
        }
    }
}

/// Extract the temperature from a `smartctl -A` attribute table.
///
/// An attribute line looks like:
///
/// ```text
/// 194 Temperature_Celsius 0x0002  214  214  000  Old_age  Always  -  28 (Min/Max 21/32)
/// ```
///
/// The raw value is the tenth column; vendor annotations behind it are
/// ignored. Drives without `Temperature_Celsius` often report
/// `Airflow_Temperature_Cel` instead.
pub fn parse_temperature(output: &str) -> Option<i32> {
    for attribute in TEMPERATURE_ATTRIBUTES.iter() {
        for line in output.lines() {
            let mut fields = line.split_whitespace();

            // attribute lines start with a numeric attribute id
            match fields.next() {
                Some(id) if id.parse::<u16>().is_ok() => (),
                _ => continue,
            }
            if fields.next() != Some(*attribute) {
                continue;
            }

            // skip FLAG VALUE WORST THRESH TYPE UPDATED WHEN_FAILED
            if let Some(raw) = fields.nth(7) {
                if let Ok(value) = raw.parse::<i32>() {
                    return Some(value);
                }
            }
        }
    }
    None
}

#[async_trait]
impl TemperatureReader for SmartReader {
    async fn read_temperature(&self, drive: &str) -> error::Result<i32> {
        debug!("{} -A {}", self.smartctl_path, drive);

        let run = Command::new(&self.smartctl_path).arg("-A").arg(drive).output();
        let output = match timeout(self.read_timeout, run).await {
            Ok(result) => result.map_err(|e| {
                ErrorKind::Sensor(drive.to_string(), format!("cannot run smartctl: {}", e))
            })?,
            Err(_) => Err(ErrorKind::Sensor(
                drive.to_string(),
                format!("smartctl timed out after {:?}", self.read_timeout),
            ))?,
        };

        // smartctl sets informational bits in its exit status; trust the
        // attribute table instead of the status
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_temperature(&stdout).ok_or_else(|| {
            ErrorKind::Sensor(
                drive.to_string(),
                "no temperature attribute in smartctl output".to_string(),
            )
            .into()
        })
    }
}
