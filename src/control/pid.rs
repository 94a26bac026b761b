//! Discrete-time PID controller with anti-windup.
//!
//! Pure computation, no I/O. The integral accumulator stores `Ki * error * dt`
//! per step, so the anti-windup clamp bounds the gain-weighted accumulator and
//! the exposed I term is the clamped accumulator itself:
//! `output = clamp(P + I + D, min, max)`.

use std::time::Instant;

pub struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,

    target: f64,

    integral: f64,
    prev_error: f64,
    /// None until the first calculate() call; doubles as the first-run flag.
    prev_time: Option<Instant>,

    min_output: f64,
    max_output: f64,

    /// Anti-windup bound on the integral accumulator.
    integral_max: f64,
}

/// Individual PID components of one calculation, for observability only.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PidTerms {
    pub p: f64,
    pub i: f64,
    pub d: f64,
    pub error: f64,
}

impl PidController {
    pub fn new(
        kp: f64,
        ki: f64,
        kd: f64,
        target: f64,
        min_output: f64,
        max_output: f64,
        integral_max: f64,
    ) -> Self {
        Self {
            kp,
            ki,
            kd,
            target,
            integral: 0.0,
            prev_error: 0.0,
            prev_time: None,
            min_output,
            max_output,
            integral_max,
        }
    }

    /// Compute the controller output for `current` at time `now`.
    ///
    /// The first call uses dt = 1.0 and a zero derivative; subsequent calls
    /// derive dt from the wall clock. A zero dt also yields a zero derivative.
    pub fn calculate(&mut self, current: f64, now: Instant) -> (f64, PidTerms) {
        let error = current - self.target;

        let dt = match self.prev_time {
            Some(prev) => now.duration_since(prev).as_secs_f64(),
            None => 1.0,
        };

        let proportional = self.kp * error;

        let integral = clamp(
            self.integral + self.ki * error * dt,
            -self.integral_max,
            self.integral_max,
        );

        let derivative = match self.prev_time {
            Some(_) if dt > 0.0 => self.kd * (error - self.prev_error) / dt,
            _ => 0.0,
        };

        let output = clamp(
            proportional + integral + derivative,
            self.min_output,
            self.max_output,
        );

        self.integral = integral;
        self.prev_error = error;
        self.prev_time = Some(now);

        let terms = PidTerms {
            p: proportional,
            i: integral,
            d: derivative,
            error,
        };

        (output, terms)
    }

    /// Clear accumulated state; the next calculate() behaves like a first run.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = 0.0;
        self.prev_time = None;
    }

    pub fn set_target(&mut self, target: f64) {
        self.target = target;
    }

    pub fn set_gains(&mut self, kp: f64, ki: f64, kd: f64) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    pub fn set_limits(&mut self, min_output: f64, max_output: f64) {
        self.min_output = min_output;
        self.max_output = max_output;
    }

    pub fn set_integral_max(&mut self, integral_max: f64) {
        self.integral_max = integral_max;
    }

    /// Snapshot of the controller state for debug logging and tests.
    pub fn state(&self) -> PidState {
        PidState {
            kp: self.kp,
            ki: self.ki,
            kd: self.kd,
            target: self.target,
            integral: self.integral,
            prev_error: self.prev_error,
            min_output: self.min_output,
            max_output: self.max_output,
            integral_max: self.integral_max,
        }
    }

    // Tuning presets. Starting values for this chassis; they may need
    // adjustment based on observed behavior.

    /// Conservative gains for temperature control.
    pub fn tune_for_temperature_control(&mut self) {
        self.set_gains(5.0, 0.1, 20.0);
        self.set_integral_max(50.0);
    }

    /// More aggressive gains for faster response. May oscillate.
    pub fn tune_for_responsive_control(&mut self) {
        self.set_gains(8.0, 0.2, 30.0);
        self.set_integral_max(75.0);
    }

    /// Slow but stable gains.
    pub fn tune_for_stable_control(&mut self) {
        self.set_gains(3.0, 0.05, 15.0);
        self.set_integral_max(25.0);
    }

    /// Check whether the current gains are in reasonable ranges for
    /// temperature control. Returns warnings, not errors.
    pub fn validate_gains(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.kp < 0.0 || self.kp > 20.0 {
            warnings.push("Kp should typically be between 0-20".to_string());
        }
        if self.ki < 0.0 || self.ki > 2.0 {
            warnings.push("Ki should typically be between 0-2".to_string());
        }
        if self.kd < 0.0 || self.kd > 100.0 {
            warnings.push("Kd should typically be between 0-100".to_string());
        }
        if self.kp > 10.0 && self.ki > 0.5 {
            warnings.push("High Kp with high Ki may cause oscillation".to_string());
        }

        warnings
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidState {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub target: f64,
    pub integral: f64,
    pub prev_error: f64,
    pub min_output: f64,
    pub max_output: f64,
    pub integral_max: f64,
}

/// Limit `value` to `[min, max]`.
pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    if value < min {
        return min;
    }
    if value > max {
        return max;
    }
    value
}
