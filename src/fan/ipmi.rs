//! ipmitool-backed fan actuation.
//!
//! The rest of the crate works in percent of full speed; this adapter owns
//! the translation to the BMC raw command, one invocation per zone:
//! `ipmitool raw <prefix bytes> <zone address> <duty byte>`.

use super::{FanActuator, Speed, Zone};
use crate::error::{self, ErrorKind};

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

pub struct IpmiActuator {
    ipmitool_path: String,
    raw_prefix: Vec<u8>,
    /// Device PWM scale; the duty byte is percent mapped onto 0..=pwm_max
    pwm_max: usize,
}

impl IpmiActuator {
    pub fn new(ipmitool_path: String, raw_prefix: Vec<u8>, pwm_max: usize) -> Self {
        assert!(!raw_prefix.is_empty());
        assert!(pwm_max >= 1 && pwm_max <= 255);

        Self {
            ipmitool_path,
            raw_prefix,
            pwm_max,
        }
    }

    /// Argument vector of the duty-write command for one zone,
    /// e.g. `raw 0x30 0x70 0x66 0x01 0x01 0x82`
    fn raw_args(&self, zone: &Zone, speed: Speed) -> Vec<String> {
        let mut args = vec!["raw".to_string()];
        args.extend(self.raw_prefix.iter().map(|byte| format!("{:#04x}", byte)));
        args.push(format!("{:#04x}", zone.address));
        args.push(format!("{:#04x}", speed.to_raw(self.pwm_max)));
        args
    }
}

#[async_trait]
impl FanActuator for IpmiActuator {
    async fn set_duty_cycle(&self, zone: &Zone, speed: Speed) -> error::Result<()> {
        let args = self.raw_args(zone, speed);
        debug!("zone {}: {} {}", zone.name, self.ipmitool_path, args.join(" "));

        let output = Command::new(&self.ipmitool_path)
            .args(&args)
            .output()
            .await
            .map_err(|e| {
                ErrorKind::Fan(zone.name.clone(), format!("cannot run ipmitool: {}", e))
            })?;

        if !output.status.success() {
            Err(ErrorKind::Fan(
                zone.name.clone(),
                format!(
                    "ipmitool failed ({}): {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ))?;
        }
        Ok(())
    }
}
