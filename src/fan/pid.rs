//! Implementation of fan control using PID with a clamped integral term.

/// Controller gains and the clamp band of the integral accumulator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub integral_min: f64,
    pub integral_max: f64,
}

/// Per-term breakdown of one controller update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Output {
    /// measured - target, in degrees Celsius
    pub error: f64,
    pub p: f64,
    pub i: f64,
    pub d: f64,
    /// Sum of the three terms; still unmapped to a duty cycle
    pub raw: f64,
}

/// Temperature-to-fan-speed controller.
///
/// Sign convention: error = measured - target with positive gains, so the raw
/// output rises as the temperature climbs above the target.
///
/// `dt` is the nominal tick interval, which makes the output a pure function
/// of the measured-temperature sequence. The state lives for the whole
/// process; there is no reset once the loop has started.
pub struct TempControl {
    gains: Gains,
    target: f64,
    dt: f64,
    integral: f64,
    /// `None` until the first update; the first derivative term is zero
    prev_error: Option<f64>,
}

impl TempControl {
    pub fn new(gains: Gains, target: f64, dt: f64) -> Self {
        assert!(dt > 0.0);
        assert!(gains.integral_min <= gains.integral_max);

        Self {
            gains,
            target,
            dt,
            integral: 0.0,
            prev_error: None,
        }
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn update(&mut self, measured: f64) -> Output {
        let error = measured - self.target;

        self.integral = (self.integral + error * self.dt)
            .max(self.gains.integral_min)
            .min(self.gains.integral_max);

        let derivative = match self.prev_error {
            Some(prev) => (error - prev) / self.dt,
            None => 0.0,
        };
        self.prev_error = Some(error);

        let p = self.gains.kp * error;
        let i = self.gains.ki * self.integral;
        let d = self.gains.kd * derivative;

        Output {
            error,
            p,
            i,
            d,
            raw: p + i + d,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn gains(kp: f64, ki: f64, kd: f64) -> Gains {
        Gains {
            kp,
            ki,
            kd,
            integral_min: -50.0,
            integral_max: 50.0,
        }
    }

    #[test]
    fn test_pid_first_update_has_zero_derivative() {
        let mut pid = TempControl::new(gains(0.0, 0.0, 10.0), 40.0, 1.0);
        let out = pid.update(45.0);
        assert_relative_eq!(out.d, 0.0);

        // the second update sees a previous error and reacts to its change
        let out = pid.update(47.0);
        assert_relative_eq!(out.d, 20.0);
    }

    #[test]
    fn test_pid_output_rises_with_temperature() {
        let mut pid = TempControl::new(gains(2.0, 0.5, 1.0), 40.0, 1.0);
        let hot = pid.update(45.0);
        assert!(hot.error > 0.0);
        assert!(hot.raw > 0.0);

        let mut pid = TempControl::new(gains(2.0, 0.5, 1.0), 40.0, 1.0);
        let cool = pid.update(35.0);
        assert!(cool.error < 0.0);
        assert!(cool.raw < 0.0);
    }

    #[test]
    fn test_pid_integral_clamped_under_saturation() {
        let mut pid = TempControl::new(gains(0.0, 1.0, 0.0), 40.0, 1.0);

        // sustained overshoot: integral must stop at the upper clamp
        for _ in 0..1000 {
            let out = pid.update(50.0);
            assert!(out.i <= 50.0 * 10.0);
        }
        assert_relative_eq!(pid.update(50.0).i, 50.0);

        // sustained undershoot: must come back down and stop at the lower clamp
        for _ in 0..1000 {
            pid.update(30.0);
        }
        assert_relative_eq!(pid.update(30.0).i, -50.0);
    }

    #[test]
    fn test_pid_deterministic_replay() {
        let sequence = [42.0, 44.0, 43.0, 41.0, 40.0, 39.0, 40.0, 45.0];

        let mut first = TempControl::new(gains(2.0, 0.5, 1.0), 40.0, 5.0);
        let mut second = TempControl::new(gains(2.0, 0.5, 1.0), 40.0, 5.0);
        for measured in sequence {
            assert_eq!(first.update(measured), second.update(measured));
        }
    }

    /// Trace with Kp=0, Ki=1, Kd=1, dt=1 against target 40:
    /// measured [40,40,40,39,39,40] gives errors [0,0,0,-1,-1,0] and the
    /// integral accumulates [0,0,0,-1,-2,-2].
    #[test]
    fn test_pid_documented_trace() {
        let mut pid = TempControl::new(gains(0.0, 1.0, 1.0), 40.0, 1.0);

        let measured = [40.0, 40.0, 40.0, 39.0, 39.0, 40.0];
        let expected_error = [0.0, 0.0, 0.0, -1.0, -1.0, 0.0];
        let expected_i = [0.0, 0.0, 0.0, -1.0, -2.0, -2.0];
        let expected_d = [0.0, 0.0, 0.0, -1.0, 0.0, 1.0];

        for tick in 0..measured.len() {
            let out = pid.update(measured[tick]);
            assert_relative_eq!(out.error, expected_error[tick]);
            assert_relative_eq!(out.i, expected_i[tick]);
            assert_relative_eq!(out.d, expected_d[tick]);
            assert_relative_eq!(out.raw, out.p + out.i + out.d);
        }
    }

    /// The documented trace mapped onto a duty band: baseline 53 yields the
    /// 53/51/52 sequence, and 51% on a 255 scale is raw PWM 130.
    #[test]
    fn test_pid_documented_trace_duty_cycle() {
        use crate::fan::DutyMapper;

        let mut pid = TempControl::new(gains(0.0, 1.0, 1.0), 40.0, 1.0);
        let mapper = DutyMapper::new(53, 20, 100);

        let measured = [40.0, 40.0, 40.0, 39.0, 39.0, 40.0];
        let expected_duty = [53, 53, 53, 51, 51, 52];

        for tick in 0..measured.len() {
            let duty = mapper.map(pid.update(measured[tick]).raw);
            assert_eq!(duty.percent(), expected_duty[tick]);
        }

        assert_eq!(crate::fan::Speed::new(51).to_raw(255), 130);
    }
}
