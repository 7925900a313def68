use clap::Parser;
use log::info;
use nix::fcntl::{flock, FlockArg};

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use storfand::error::{self, ErrorKind};
use storfand::{config, fan, halt, monitor, sensor};

use crate::cli::Opt;

mod cli;

/// Take a non-blocking exclusive lock so two instances never fight over the
/// fan controller. The lock lives as long as the returned file.
fn acquire_instance_lock(path: &str) -> error::Result<File> {
    let file = OpenOptions::new().write(true).create(true).open(path)?;
    flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|_| {
        ErrorKind::General(format!("another instance already running (lock '{}' held)", path))
    })?;
    Ok(file)
}

#[tokio::main]
async fn main() -> error::Result<()> {
    let opt = Opt::parse();
    env_logger::builder()
        .filter_level(opt.log_level())
        .parse_default_env()
        .init();

    let config_path = opt
        .config
        .as_deref()
        .unwrap_or(config::DEFAULT_CONFIG_PATH);
    let settings = config::Settings::parse(config_path)?.resolve()?;

    let _lock = acquire_instance_lock(&settings.lock_path)?;

    let reader = Arc::new(sensor::smart::SmartReader::new(
        settings.smartctl_path.clone(),
        settings.read_timeout,
    ));
    let actuator = Box::new(fan::ipmi::IpmiActuator::new(
        settings.ipmitool_path.clone(),
        settings.raw_prefix.clone(),
        settings.pwm_max,
    ));
    let dispatcher = fan::Dispatcher::new(settings.zones.clone(), actuator);
    let mapper = fan::DutyMapper::new(settings.duty_baseline, settings.duty_min, settings.duty_max);

    let monitor = monitor::Monitor::new(
        monitor::Config {
            target_temperature: settings.target_temperature,
            tick_interval: settings.polling_interval,
            gains: settings.gains,
            drives: settings.drives.clone(),
            pwm_max: settings.pwm_max,
            safety_speed: fan::Speed::new(settings.safety_duty),
        },
        reader,
        dispatcher,
        mapper,
    );

    let (halt_sender, halt_receiver) = halt::make_pair();
    halt_sender.hook_termination_signals();

    info!(
        "starting control loop: target {}°C, interval {:?}, {} drives, {} zones",
        settings.target_temperature,
        settings.polling_interval,
        settings.drives.len(),
        settings.zones.len(),
    );
    monitor.run(halt_receiver).await;
    info!("exited");

    Ok(())
}
