//! This module is responsible for collecting drive temperatures and driving
//! the fan zones: the periodic read-decide-actuate loop.

use crate::fan::{self, Speed};
use crate::halt;
use crate::sensor::{TemperatureReader, TemperatureSample};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, select, Either};
use futures::FutureExt;
use log::{error, info, warn};

/// Aggregates one tick's per-drive read results into the hottest valid
/// sample. Failed reads are counted and excluded; they never stand in as a
/// zero reading and a single bad drive never suppresses the others.
#[derive(Debug)]
pub struct TemperatureAccumulator {
    hottest: Option<TemperatureSample>,
    valid: usize,
    failed: usize,
}

impl TemperatureAccumulator {
    pub fn new() -> Self {
        Self {
            hottest: None,
            valid: 0,
            failed: 0,
        }
    }

    pub fn add_sample(&mut self, sample: TemperatureSample) {
        self.valid += 1;
        let hotter = match &self.hottest {
            Some(current) => sample.celsius > current.celsius,
            None => true,
        };
        if hotter {
            self.hottest = Some(sample);
        }
    }

    pub fn add_failure(&mut self) {
        self.failed += 1;
    }

    pub fn hottest(&self) -> Option<&TemperatureSample> {
        self.hottest.as_ref()
    }

    pub fn valid(&self) -> usize {
        self.valid
    }

    pub fn failed(&self) -> usize {
        self.failed
    }
}

/// Output of the per-tick decision step
#[derive(Debug, PartialEq)]
pub enum ControlDecision {
    /// Feed the hottest temperature to the PID controller
    UsePid(i32),
    /// No drive produced a usable reading; command maximum duty rather than
    /// guess a temperature
    FailSafe(&'static str),
}

impl ControlDecision {
    /// Decide what to do with the tick's aggregated readings.
    /// This function has been factored out of the tick to facilitate testing.
    fn decide(acc: &TemperatureAccumulator) -> Self {
        match acc.hottest() {
            Some(sample) => Self::UsePid(sample.celsius),
            None => Self::FailSafe("no drive reported a temperature"),
        }
    }
}

/// Observable record of one completed tick, rendered as a stable
/// key=value line for the log stream
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub tick: u64,
    /// Hottest valid drive temperature; `None` when the tick failed safe
    pub temp: Option<i32>,
    pub error: f64,
    pub p: f64,
    pub i: f64,
    pub d: f64,
    pub fan_pct: usize,
    pub pwm_raw: u8,
    pub drives_failed: usize,
    pub zones_ok: usize,
    pub zones_failed: usize,
    pub fail_safe: bool,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.temp {
            Some(celsius) => write!(f, "temp={}", celsius)?,
            None => write!(f, "temp=-")?,
        }
        write!(
            f,
            " err={:.2} p={:.2} i={:.2} d={:.2} fan_pct={} pwm={} drives_failed={} zones_ok={} zones_failed={} fail_safe={}",
            self.error,
            self.p,
            self.i,
            self.d,
            self.fan_pct,
            self.pwm_raw,
            self.drives_failed,
            self.zones_ok,
            self.zones_failed,
            self.fail_safe,
        )
    }
}

/// Control-loop configuration, resolved and validated at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub target_temperature: f64,
    pub tick_interval: Duration,
    pub gains: fan::pid::Gains,
    pub drives: Vec<String>,
    /// Device PWM scale, only used to report the raw duty value
    pub pwm_max: usize,
    /// Duty the fans are parked at when the loop exits
    pub safety_speed: Speed,
}

/// Monitor - owns the controller state and everything needed to run ticks.
///
/// One instance exists per process; the loop is strictly sequential, so a
/// slow tick delays the next one instead of overlapping it.
pub struct Monitor {
    config: Config,
    reader: Arc<dyn TemperatureReader>,
    dispatcher: fan::Dispatcher,
    mapper: fan::DutyMapper,
    pid: fan::pid::TempControl,
    ticks: u64,
}

impl Monitor {
    pub fn new(
        config: Config,
        reader: Arc<dyn TemperatureReader>,
        dispatcher: fan::Dispatcher,
        mapper: fan::DutyMapper,
    ) -> Self {
        let pid = fan::pid::TempControl::new(
            config.gains,
            config.target_temperature,
            config.tick_interval.as_secs_f64(),
        );

        Self {
            config,
            reader,
            dispatcher,
            mapper,
            pid,
            ticks: 0,
        }
    }

    /// Read all configured drives concurrently. Every read completes (or
    /// fails) before selection starts; there are no partial-tick decisions.
    async fn read_temperatures(&self) -> TemperatureAccumulator {
        let mut reads = Vec::new();
        for drive in self.config.drives.iter() {
            let reader = self.reader.clone();
            let drive = drive.clone();
            reads.push(async move {
                let result = reader.read_temperature(&drive).await;
                (drive, result)
            });
        }

        let mut acc = TemperatureAccumulator::new();
        for (drive, result) in join_all(reads).await {
            match result {
                Ok(celsius) => acc.add_sample(TemperatureSample {
                    drive,
                    celsius,
                    tick: self.ticks,
                }),
                Err(e) => {
                    warn!("{}", e);
                    acc.add_failure();
                }
            }
        }
        acc
    }

    /// One full read-decide-actuate cycle.
    ///
    /// A fully failed tick commands maximum duty and leaves the controller
    /// state untouched; its contribution to the integral is zero.
    pub async fn tick(&mut self) -> Status {
        self.ticks += 1;

        let acc = self.read_temperatures().await;

        let status = match ControlDecision::decide(&acc) {
            ControlDecision::FailSafe(reason) => {
                error!("fail safe: {}, commanding maximum duty", reason);
                let speed = self.mapper.max_duty();
                let summary = self.dispatcher.dispatch_all(speed).await;
                Status {
                    tick: self.ticks,
                    temp: None,
                    error: 0.0,
                    p: 0.0,
                    i: 0.0,
                    d: 0.0,
                    fan_pct: speed.percent(),
                    pwm_raw: speed.to_raw(self.config.pwm_max),
                    drives_failed: acc.failed(),
                    zones_ok: summary.commanded(),
                    zones_failed: summary.failed,
                    fail_safe: true,
                }
            }
            ControlDecision::UsePid(celsius) => {
                let out = self.pid.update(f64::from(celsius));
                let speed = self.mapper.map(out.raw);
                let summary = self.dispatcher.dispatch(speed).await;
                Status {
                    tick: self.ticks,
                    temp: Some(celsius),
                    error: out.error,
                    p: out.p,
                    i: out.i,
                    d: out.d,
                    fan_pct: speed.percent(),
                    pwm_raw: speed.to_raw(self.config.pwm_max),
                    drives_failed: acc.failed(),
                    zones_ok: summary.commanded(),
                    zones_failed: summary.failed,
                    fail_safe: false,
                }
            }
        };

        info!("{}", status);
        status
    }

    /// Run ticks until halted, then park the fans at the safety duty.
    /// The interval sleep is cancelled by the halt notification, so
    /// termination never waits out a full polling interval.
    pub async fn run(mut self, mut halt_receiver: halt::Receiver) {
        loop {
            self.tick().await;

            let sleep = tokio::time::sleep(self.config.tick_interval);
            match select(sleep.boxed(), halt_receiver.wait_for_halt().boxed()).await {
                Either::Left(_) => continue,
                Either::Right(_) => break,
            }
        }

        info!(
            "halted, parking fans at {}%",
            self.config.safety_speed.percent()
        );
        self.dispatcher.dispatch_all(self.config.safety_speed).await;
    }
}
