//! This module handles configuration file parsing and startup validation.
//!
//! The configuration is TOML with four sections: `[general]`, `[pid]`,
//! `[smart]` and `[chassis]`. Everything except the drive list and the fan
//! zones has a default. Validation is strict: the control loop is never
//! started from an invalid configuration.

use crate::error::{self, ErrorKind};
use crate::fan;

use failure::ResultExt;
use serde::{Deserialize, Serialize};

use std::collections::HashSet;
use std::fs;
use std::time::Duration;

/// Location of default config
pub const DEFAULT_CONFIG_PATH: &'static str = "/etc/storfand.toml";

/// Default path of the single-instance lock file
pub const DEFAULT_LOCK_PATH: &'static str = "/var/run/storfand.lock";

/// Default temperature the hottest drive is held at
pub const DEFAULT_TARGET_TEMPERATURE: f64 = 40.0;

/// Default seconds between control-loop ticks
pub const DEFAULT_POLLING_INTERVAL: f64 = 30.0;

/// Default PID gains, tuned for the slow thermal mass of spinning drives
pub const DEFAULT_KP: f64 = 2.0;
pub const DEFAULT_KI: f64 = 0.5;
pub const DEFAULT_KD: f64 = 1.0;

/// Default clamp band of the integral accumulator
pub const DEFAULT_INTEGRAL_MIN: f64 = -20.0;
pub const DEFAULT_INTEGRAL_MAX: f64 = 60.0;

pub const DEFAULT_SMARTCTL_PATH: &'static str = "/usr/sbin/smartctl";

/// Default seconds one smartctl invocation may take before the tick gives
/// up on that drive's sample
pub const DEFAULT_READ_TIMEOUT: f64 = 10.0;

pub const DEFAULT_IPMITOOL_PATH: &'static str = "/usr/bin/ipmitool";

/// Default raw-command prefix of the per-zone duty write
pub const DEFAULT_RAW_PREFIX: [u8; 4] = [0x30, 0x70, 0x66, 0x01];

/// Default device PWM scale; percent is mapped onto 0..=pwm_max
pub const DEFAULT_PWM_MAX: usize = 255;

/// Default duty band and operating point
pub const DEFAULT_DUTY_MIN: usize = 20;
pub const DEFAULT_DUTY_MAX: usize = 100;
pub const DEFAULT_DUTY_BASELINE: usize = 50;

/// Default duty the fans are parked at on shutdown
pub const DEFAULT_SAFETY_DUTY: usize = 60;

/// Range of sane target temperatures for spinning drives
pub const TARGET_TEMPERATURE_MIN: f64 = 20.0;
pub const TARGET_TEMPERATURE_MAX: f64 = 60.0;

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct General {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polling_interval: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_path: Option<String>,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Pid {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ki: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integral_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integral_max: Option<f64>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Smart {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smartctl_path: Option<String>,
    /// Devices to poll, e.g. `["/dev/sda", "/dev/sdb"]`
    pub drives: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_timeout: Option<f64>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ZoneEntry {
    pub name: String,
    pub address: u8,
    /// Fixed duty for this zone instead of the common decision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duty_override: Option<usize>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Chassis {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipmitool_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_prefix: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pwm_max: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duty_min: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duty_max: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duty_baseline: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_duty: Option<usize>,
    #[serde(rename = "zone")]
    pub zones: Vec<ZoneEntry>,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub general: Option<General>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<Pid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smart: Option<Smart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chassis: Option<Chassis>,
}

/// Fully validated runtime configuration
#[derive(Debug, Clone)]
pub struct Resolved {
    pub target_temperature: f64,
    pub polling_interval: Duration,
    pub lock_path: String,
    pub gains: fan::pid::Gains,
    pub smartctl_path: String,
    pub drives: Vec<String>,
    pub read_timeout: Duration,
    pub ipmitool_path: String,
    pub raw_prefix: Vec<u8>,
    pub pwm_max: usize,
    pub duty_min: usize,
    pub duty_max: usize,
    pub duty_baseline: usize,
    pub safety_duty: usize,
    pub zones: Vec<fan::Zone>,
}

fn check(condition: bool, message: &str) -> error::Result<()> {
    if condition {
        Ok(())
    } else {
        Err(ErrorKind::Config(message.to_string()))?
    }
}

impl Settings {
    /// Parse config file - either user specified or the default one
    pub fn parse(path: &str) -> error::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|_| ErrorKind::Config(format!("cannot read '{}'", path)))?;
        let settings = toml::from_str::<Self>(&content)
            .with_context(|_| ErrorKind::Config(format!("cannot parse '{}'", path)))?;
        Ok(settings)
    }

    /// Apply defaults and validate everything. Any violation is fatal; the
    /// control loop must not start on a half-usable configuration.
    pub fn resolve(&self) -> error::Result<Resolved> {
        let general = self.general.clone().unwrap_or_default();
        let pid = self.pid.clone().unwrap_or_default();
        let smart = self
            .smart
            .as_ref()
            .ok_or_else(|| ErrorKind::Config("missing [smart] section".to_string()))?;
        let chassis = self
            .chassis
            .as_ref()
            .ok_or_else(|| ErrorKind::Config("missing [chassis] section".to_string()))?;

        let target_temperature = general
            .target_temperature
            .unwrap_or(DEFAULT_TARGET_TEMPERATURE);
        let polling_interval = general.polling_interval.unwrap_or(DEFAULT_POLLING_INTERVAL);
        let lock_path = general
            .lock_path
            .clone()
            .unwrap_or_else(|| DEFAULT_LOCK_PATH.to_string());

        let gains = fan::pid::Gains {
            kp: pid.kp.unwrap_or(DEFAULT_KP),
            ki: pid.ki.unwrap_or(DEFAULT_KI),
            kd: pid.kd.unwrap_or(DEFAULT_KD),
            integral_min: pid.integral_min.unwrap_or(DEFAULT_INTEGRAL_MIN),
            integral_max: pid.integral_max.unwrap_or(DEFAULT_INTEGRAL_MAX),
        };

        let read_timeout = smart.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT);
        let pwm_max = chassis.pwm_max.unwrap_or(DEFAULT_PWM_MAX);
        let duty_min = chassis.duty_min.unwrap_or(DEFAULT_DUTY_MIN);
        let duty_max = chassis.duty_max.unwrap_or(DEFAULT_DUTY_MAX);
        let duty_baseline = chassis.duty_baseline.unwrap_or(DEFAULT_DUTY_BASELINE);
        let safety_duty = chassis.safety_duty.unwrap_or(DEFAULT_SAFETY_DUTY);
        let raw_prefix = chassis
            .raw_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_RAW_PREFIX.to_vec());

        check(
            (TARGET_TEMPERATURE_MIN..=TARGET_TEMPERATURE_MAX).contains(&target_temperature),
            "target_temperature out of range",
        )?;
        check(
            polling_interval.is_finite() && polling_interval > 0.0,
            "polling_interval must be positive",
        )?;
        check(
            read_timeout.is_finite() && read_timeout > 0.0,
            "read_timeout must be positive",
        )?;
        check(
            gains.kp.is_finite() && gains.ki.is_finite() && gains.kd.is_finite(),
            "PID gains must be finite",
        )?;
        check(
            gains.kp >= 0.0 && gains.ki >= 0.0 && gains.kd >= 0.0,
            "PID gains must not be negative",
        )?;
        check(
            gains.integral_min.is_finite()
                && gains.integral_max.is_finite()
                && gains.integral_min <= gains.integral_max,
            "integral clamp band is inverted",
        )?;
        check(!smart.drives.is_empty(), "drive list is empty")?;
        check(!chassis.zones.is_empty(), "fan zone list is empty")?;
        check(!raw_prefix.is_empty(), "raw_prefix is empty")?;
        check(pwm_max >= 1 && pwm_max <= 255, "pwm_max out of range")?;
        check(
            duty_min <= duty_max && duty_max <= 100,
            "duty band is invalid",
        )?;
        check(
            duty_min <= duty_baseline && duty_baseline <= duty_max,
            "duty_baseline outside the duty band",
        )?;
        check(safety_duty <= 100, "safety_duty out of range")?;

        let mut names = HashSet::new();
        let mut zones = Vec::new();
        for entry in chassis.zones.iter() {
            check(
                names.insert(entry.name.clone()),
                "duplicate fan zone name",
            )?;
            if let Some(duty) = entry.duty_override {
                check(duty <= 100, "zone duty_override out of range")?;
            }
            zones.push(fan::Zone {
                name: entry.name.clone(),
                address: entry.address,
                duty_override: entry.duty_override.map(fan::Speed::new),
            });
        }

        Ok(Resolved {
            target_temperature,
            polling_interval: Duration::from_secs_f64(polling_interval),
            lock_path,
            gains,
            smartctl_path: smart
                .smartctl_path
                .clone()
                .unwrap_or_else(|| DEFAULT_SMARTCTL_PATH.to_string()),
            drives: smart.drives.clone(),
            read_timeout: Duration::from_secs_f64(read_timeout),
            ipmitool_path: chassis
                .ipmitool_path
                .clone()
                .unwrap_or_else(|| DEFAULT_IPMITOOL_PATH.to_string()),
            raw_prefix,
            pwm_max,
            duty_min,
            duty_max,
            duty_baseline,
            safety_duty,
            zones,
        })
    }
}
