//! Dosing controllers
//!
//! A controller turns the pair (expected pH, measured pH) into the number of
//! `RUN` commands to issue this tick. All controller state lives inside the
//! instance attached to one task; vessels never share state.

use std::collections::VecDeque;

/// Hard cap on what a legacy controller may request in a single tick.
const LEGACY_OUTPUT_LIMIT: f64 = 50.0;

#[derive(Debug, Clone)]
pub enum Controller {
    /// One dose whenever the vessel is below target; the conservative
    /// strategy used until adaptive pumping engages.
    SingleDose,
    /// Kept for legacy runs.
    Proportional(Proportional),
    /// Kept for legacy runs.
    Pid(Pid),
    /// Windowed derivative with memory; the default for adaptive mode.
    WindowedDerivative(WindowedDerivative),
}

impl Controller {
    pub fn step(&mut self, setpoint: f64, measured: f64) -> u32 {
        match self {
            Self::SingleDose => u32::from(measured < setpoint),
            Self::Proportional(c) => c.step(setpoint, measured),
            Self::Pid(c) => c.step(setpoint, measured),
            Self::WindowedDerivative(c) => c.step(setpoint, measured),
        }
    }
}

fn clamp_legacy_output(raw: f64) -> u32 {
    let clamped = raw.clamp(-LEGACY_OUTPUT_LIMIT, LEGACY_OUTPUT_LIMIT).round();
    if clamped <= 0.0 {
        0
    } else {
        clamped as u32
    }
}

#[derive(Debug, Clone)]
pub struct Proportional {
    pub gain: f64,
}

impl Proportional {
    fn step(&mut self, setpoint: f64, measured: f64) -> u32 {
        clamp_legacy_output(self.gain * (setpoint - measured))
    }
}

#[derive(Debug, Clone)]
pub struct Pid {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    integral: f64,
    last_error: Option<f64>,
}

impl Pid {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            integral: 0.0,
            last_error: None,
        }
    }

    fn step(&mut self, setpoint: f64, measured: f64) -> u32 {
        let error = setpoint - measured;
        self.integral += error;
        let derivative = error - self.last_error.unwrap_or(error);
        self.last_error = Some(error);
        clamp_legacy_output(self.kp * error + self.ki * self.integral + self.kd * derivative)
    }
}

/// Ring length of remembered measurements.
const WINDOW_LEN: usize = 5;

/// Largest pH rise per tick considered "still too slow".
const MAX_ALLOWED_DELTA: f64 = 0.01;

/// Slack for the overshoot-band comparison. Subtracting nearby pH values
/// loses up to an ULP (7.05 - 7.0 lands just under 0.05 in f64), and a
/// measurement sitting nominally on the band edge must count as past it.
const BAND_TOLERANCE: f64 = 1e-12;

/// Ramps the dose count up while the vessel rises too slowly or sits far
/// below target, and backs off sharply on overshoot.
#[derive(Debug, Clone, Default)]
pub struct WindowedDerivative {
    window: VecDeque<f64>,
    last_dose: u32,
}

impl WindowedDerivative {
    pub fn new() -> Self {
        Self::default()
    }

    fn step(&mut self, setpoint: f64, measured: f64) -> u32 {
        if self.window.is_empty() {
            // First real measurement seeds the whole window.
            self.window = std::iter::repeat(measured).take(WINDOW_LEN).collect();
        }
        let oldest = *self.window.front().unwrap();
        let newest = *self.window.back().unwrap();
        let delta = measured - oldest;
        let window_rise = newest - oldest;

        if measured < setpoint {
            let too_slow = delta < MAX_ALLOWED_DELTA || setpoint - measured > 0.5;
            if too_slow && window_rise < 5.0 * MAX_ALLOWED_DELTA {
                self.last_dose += 1;
            } else if self.last_dose > 0 && window_rise >= 5.0 * MAX_ALLOWED_DELTA {
                self.last_dose -= 1;
            }
        } else if measured - setpoint + BAND_TOLERANCE >= 5.0 * MAX_ALLOWED_DELTA {
            self.last_dose /= 2;
        } else {
            self.last_dose = self.last_dose.saturating_sub(1);
        }

        self.window.pop_front();
        self.window.push_back(measured);
        self.last_dose
    }
}

#[cfg(test)]
mod tests {
    use super::{Controller, Pid, Proportional, WindowedDerivative};

    #[test]
    fn single_dose_pumps_exactly_when_below_target() {
        let mut controller = Controller::SingleDose;
        assert_eq!(controller.step(7.0, 6.5), 1);
        assert_eq!(controller.step(7.0, 7.0), 0);
        assert_eq!(controller.step(7.0, 7.5), 0);
    }

    #[test]
    fn windowed_derivative_ramps_then_halves_on_overshoot() {
        let mut controller = Controller::WindowedDerivative(WindowedDerivative::new());
        // Flat at 6.5 below a 7.0 target: dose count climbs one per tick.
        let doses: Vec<u32> = (0..5).map(|_| controller.step(7.0, 6.5)).collect();
        assert_eq!(doses, [1, 2, 3, 4, 5]);
        // Overshoot past target by more than the allowed band halves it.
        assert_eq!(controller.step(7.0, 7.05), 2);
    }

    #[test]
    fn windowed_derivative_eases_off_near_target() {
        let mut controller = WindowedDerivative::new();
        for _ in 0..4 {
            controller.step(7.0, 6.5);
        }
        // Just over target but inside the band: decrement instead of halve.
        assert_eq!(controller.step(7.0, 7.01), 3);
        assert_eq!(controller.step(7.0, 7.01), 2);
    }

    #[test]
    fn windowed_derivative_backs_off_when_rising_steeply() {
        let mut controller = WindowedDerivative::new();
        assert_eq!(controller.step(7.0, 6.6), 1);
        // Rising briskly close to target: hold, then shed doses once the
        // rise across the remembered window gets steep.
        assert_eq!(controller.step(7.0, 6.65), 1);
        assert_eq!(controller.step(7.0, 6.7), 0);
    }

    #[test]
    fn windowed_derivative_never_goes_negative() {
        let mut controller = WindowedDerivative::new();
        for _ in 0..3 {
            assert_eq!(controller.step(7.0, 8.0), 0);
        }
    }

    #[test]
    fn controller_state_is_scoped_per_instance() {
        let mut a = Controller::WindowedDerivative(WindowedDerivative::new());
        let mut b = Controller::WindowedDerivative(WindowedDerivative::new());
        for _ in 0..3 {
            a.step(7.0, 6.5);
        }
        // b starts fresh; it must not see a's ramped-up dose count.
        assert_eq!(b.step(7.0, 6.5), 1);
    }

    #[test]
    fn proportional_output_is_clamped_and_floored() {
        let mut c = Controller::Proportional(Proportional { gain: 100.0 });
        assert_eq!(c.step(14.0, 0.0), 50);
        assert_eq!(c.step(0.0, 14.0), 0);
        assert_eq!(c.step(7.0, 6.98), 2);
    }

    #[test]
    fn pid_accumulates_integral_error() {
        let mut c = Controller::Pid(Pid::new(0.0, 1.0, 0.0));
        assert_eq!(c.step(7.0, 6.0), 1);
        assert_eq!(c.step(7.0, 6.0), 2);
        assert_eq!(c.step(7.0, 6.0), 3);
    }
}
