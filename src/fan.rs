//! Fan speed types and dispatch of duty-cycle decisions to PWM fan zones.

pub mod ipmi;
pub mod pid;

use crate::error;

use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;

/// Structure representing PWM duty cycle of fans, in percent of full speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Speed(usize);

impl Speed {
    pub const FULL_SPEED: Self = Self(100);
    pub const STOPPED: Self = Self(0);

    pub fn new(speed: usize) -> Self {
        assert!(speed <= 100);

        Speed(speed)
    }

    pub fn percent(&self) -> usize {
        self.0
    }

    /// Scale the percentage onto a device PWM range (e.g. 0..=255 or 0..=0x64)
    pub fn to_raw(&self, pwm_max: usize) -> u8 {
        assert!(pwm_max <= 255);
        (self.0 * pwm_max / 100) as u8
    }
}

/// One independently addressable PWM fan zone
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    /// Human-readable name used in logs and error reports
    pub name: String,
    /// Zone selector byte of the raw duty-write command
    pub address: u8,
    /// Fixed duty for this zone instead of the common decision
    pub duty_override: Option<Speed>,
}

/// Maps raw controller output onto a valid duty cycle.
///
/// The mapping is `baseline + raw` rounded and clamped into `[min, max]`,
/// which makes it monotonic non-decreasing in the raw output and total for
/// any input magnitude.
#[derive(Debug, Clone)]
pub struct DutyMapper {
    baseline: f64,
    min: usize,
    max: usize,
}

impl DutyMapper {
    pub fn new(baseline: usize, min: usize, max: usize) -> Self {
        assert!(min <= max && max <= 100);

        Self {
            baseline: baseline as f64,
            min,
            max,
        }
    }

    pub fn max_duty(&self) -> Speed {
        Speed::new(self.max)
    }

    pub fn map(&self, raw_output: f64) -> Speed {
        let duty = self.baseline + raw_output;
        // NaN carries no control information; stay at the baseline
        let duty = if duty.is_nan() { self.baseline } else { duty };
        let duty = duty.round();

        if duty < self.min as f64 {
            Speed::new(self.min)
        } else if duty > self.max as f64 {
            Speed::new(self.max)
        } else {
            Speed::new(duty as usize)
        }
    }
}

/// Sets the duty cycle of one PWM fan zone
#[async_trait]
pub trait FanActuator: Send + Sync {
    async fn set_duty_cycle(&self, zone: &Zone, speed: Speed) -> error::Result<()>;
}

/// Outcome of pushing one duty-cycle decision to all zones
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DispatchSummary {
    /// Zones that received the command this time
    pub ok: usize,
    /// Zones whose actuation failed
    pub failed: usize,
    /// Zones already at the requested duty; no hardware call was made
    pub skipped: usize,
}

impl DispatchSummary {
    /// Zones whose commanded duty is in effect after the dispatch
    pub fn commanded(&self) -> usize {
        self.ok + self.skipped
    }
}

/// Applies one duty-cycle decision to every configured zone.
///
/// Zones fail independently: an actuation error on one zone is reported and
/// the remaining zones still receive their command. A zone whose last
/// actuation failed is always re-actuated, even when the duty is unchanged.
pub struct Dispatcher {
    zones: Vec<Zone>,
    actuator: Box<dyn FanActuator>,
    /// Duty most recently written per zone name; absent entries are always written
    last_sent: HashMap<String, Speed>,
}

impl Dispatcher {
    pub fn new(zones: Vec<Zone>, actuator: Box<dyn FanActuator>) -> Self {
        Self {
            zones,
            actuator,
            last_sent: HashMap::new(),
        }
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// Send `speed` to all zones, honoring per-zone fixed overrides.
    pub async fn dispatch(&mut self, speed: Speed) -> DispatchSummary {
        self.dispatch_inner(speed, true).await
    }

    /// Send `speed` to all zones, ignoring overrides. Used for the fail-safe
    /// and shutdown paths where every zone must follow the common command.
    pub async fn dispatch_all(&mut self, speed: Speed) -> DispatchSummary {
        self.dispatch_inner(speed, false).await
    }

    async fn dispatch_inner(&mut self, speed: Speed, honor_overrides: bool) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        for zone in self.zones.iter() {
            let duty = if honor_overrides {
                zone.duty_override.unwrap_or(speed)
            } else {
                speed
            };

            if self.last_sent.get(&zone.name) == Some(&duty) {
                debug!("zone {}: duty unchanged at {}%", zone.name, duty.percent());
                summary.skipped += 1;
                continue;
            }

            match self.actuator.set_duty_cycle(zone, duty).await {
                Ok(()) => {
                    self.last_sent.insert(zone.name.clone(), duty);
                    summary.ok += 1;
                }
                Err(e) => {
                    warn!("{}", e);
                    self.last_sent.remove(&zone.name);
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_fan_speed() {
        assert_eq!(Speed::STOPPED.percent(), 0);
        assert_eq!(Speed::FULL_SPEED.percent(), 100);
        assert_eq!(Speed::new(70).percent(), 70);
    }

    #[test]
    #[should_panic]
    fn test_fan_speed_fail() {
        Speed::new(101);
    }

    #[test]
    fn test_fan_speed_to_raw() {
        assert_eq!(Speed::new(100).to_raw(255), 255);
        assert_eq!(Speed::new(51).to_raw(255), 130);
        assert_eq!(Speed::new(50).to_raw(100), 50);
        assert_eq!(Speed::STOPPED.to_raw(255), 0);
    }

    #[test]
    fn test_mapper_clamps_extreme_output() {
        let mapper = DutyMapper::new(50, 20, 100);
        assert_eq!(mapper.map(1e12).percent(), 100);
        assert_eq!(mapper.map(-1e12).percent(), 20);
        assert_eq!(mapper.map(f64::INFINITY).percent(), 100);
        assert_eq!(mapper.map(f64::NEG_INFINITY).percent(), 20);
        assert_eq!(mapper.map(f64::NAN).percent(), 50);
    }

    #[test]
    fn test_mapper_is_monotonic() {
        let mapper = DutyMapper::new(50, 20, 100);
        let mut previous = 0;
        for step in -200..200 {
            let duty = mapper.map(step as f64 * 0.5).percent();
            assert!(duty >= previous, "duty decreased at raw={}", step);
            previous = duty;
        }
    }

    #[test]
    fn test_mapper_stays_inside_band() {
        let mapper = DutyMapper::new(30, 25, 80);
        for raw in [-1e9, -100.0, -7.4, 0.0, 3.3, 55.0, 1e9] {
            let duty = mapper.map(raw).percent();
            assert!((25..=80).contains(&duty), "duty {} escaped band", duty);
        }
        assert_eq!(mapper.max_duty().percent(), 80);
    }

    /// Records every actuation; zone names listed in `failing` report an error
    struct FakeActuator {
        calls: Arc<Mutex<Vec<(String, usize)>>>,
        failing: HashSet<String>,
    }

    impl FakeActuator {
        fn new(calls: Arc<Mutex<Vec<(String, usize)>>>, failing: &[&str]) -> Self {
            Self {
                calls,
                failing: failing.iter().map(|name| name.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl FanActuator for FakeActuator {
        async fn set_duty_cycle(&self, zone: &Zone, speed: Speed) -> error::Result<()> {
            if self.failing.contains(&zone.name) {
                Err(ErrorKind::Fan(zone.name.clone(), "injected".to_string()))?;
            }
            self.calls
                .lock()
                .unwrap()
                .push((zone.name.clone(), speed.percent()));
            Ok(())
        }
    }

    fn zone(name: &str, address: u8, duty_override: Option<usize>) -> Zone {
        Zone {
            name: name.to_string(),
            address,
            duty_override: duty_override.map(Speed::new),
        }
    }

    fn three_zones() -> Vec<Zone> {
        vec![
            zone("cpu", 0x00, None),
            zone("rear", 0x01, None),
            zone("front", 0x02, None),
        ]
    }

    #[tokio::test]
    async fn test_dispatch_reaches_all_zones() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let actuator = FakeActuator::new(calls.clone(), &[]);
        let mut dispatcher = Dispatcher::new(three_zones(), Box::new(actuator));

        let summary = dispatcher.dispatch(Speed::new(55)).await;
        assert_eq!(summary.ok, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                ("cpu".to_string(), 55),
                ("rear".to_string(), 55),
                ("front".to_string(), 55)
            ]
        );
    }

    #[tokio::test]
    async fn test_dispatch_zone_failure_does_not_stop_others() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let actuator = FakeActuator::new(calls.clone(), &["rear"]);
        let mut dispatcher = Dispatcher::new(three_zones(), Box::new(actuator));

        let summary = dispatcher.dispatch(Speed::new(60)).await;
        assert_eq!(summary.ok, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![("cpu".to_string(), 60), ("front".to_string(), 60)]
        );
    }

    #[tokio::test]
    async fn test_dispatch_honors_zone_override() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let actuator = FakeActuator::new(calls.clone(), &[]);
        let zones = vec![zone("cpu", 0x00, Some(30)), zone("front", 0x02, None)];
        let mut dispatcher = Dispatcher::new(zones, Box::new(actuator));

        dispatcher.dispatch(Speed::new(75)).await;
        assert_eq!(
            *calls.lock().unwrap(),
            vec![("cpu".to_string(), 30), ("front".to_string(), 75)]
        );
    }

    #[tokio::test]
    async fn test_dispatch_all_ignores_overrides() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let actuator = FakeActuator::new(calls.clone(), &[]);
        let zones = vec![zone("cpu", 0x00, Some(30)), zone("front", 0x02, None)];
        let mut dispatcher = Dispatcher::new(zones, Box::new(actuator));

        dispatcher.dispatch_all(Speed::FULL_SPEED).await;
        assert_eq!(
            *calls.lock().unwrap(),
            vec![("cpu".to_string(), 100), ("front".to_string(), 100)]
        );
    }

    #[tokio::test]
    async fn test_dispatch_skips_unchanged_duty() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let actuator = FakeActuator::new(calls.clone(), &[]);
        let mut dispatcher = Dispatcher::new(three_zones(), Box::new(actuator));

        dispatcher.dispatch(Speed::new(40)).await;
        let summary = dispatcher.dispatch(Speed::new(40)).await;
        assert_eq!(summary.ok, 0);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.commanded(), 3);
        assert_eq!(calls.lock().unwrap().len(), 3);

        let summary = dispatcher.dispatch(Speed::new(45)).await;
        assert_eq!(summary.ok, 3);
        assert_eq!(calls.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_dispatch_retries_failed_zone_with_unchanged_duty() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let actuator = FakeActuator::new(calls.clone(), &["rear"]);
        let mut dispatcher = Dispatcher::new(three_zones(), Box::new(actuator));

        dispatcher.dispatch(Speed::new(40)).await;
        let summary = dispatcher.dispatch(Speed::new(40)).await;
        // "rear" keeps being retried, the healthy zones are skipped
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 2);
    }
}
