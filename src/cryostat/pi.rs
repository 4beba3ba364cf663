//! Sampled PI controller with output clamping and anti-windup.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// PI controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiController {
    /// Proportional gain (output units per kelvin).
    pub kp: f64,
    /// Integral time constant (seconds). Larger values reduce integral action.
    pub ti: f64,
    /// Minimum output value.
    pub out_min: f64,
    /// Maximum output value.
    pub out_max: f64,
}

impl PiController {
    /// Create a new PI controller.
    ///
    /// # Arguments
    ///
    /// * `kp` - Proportional gain
    /// * `ti` - Integral time constant (seconds)
    /// * `out_min` - Minimum output (device-safe lower limit)
    /// * `out_max` - Maximum output (device-safe upper limit)
    pub fn new(kp: f64, ti: f64, out_min: f64, out_max: f64) -> AppResult<Self> {
        if ti <= 0.0 {
            return Err(DaqError::Configuration("ti must be positive".into()));
        }
        if out_min >= out_max {
            return Err(DaqError::Configuration(
                "output_min must be less than output_max".into(),
            ));
        }
        Ok(Self {
            kp,
            ti,
            out_min,
            out_max,
        })
    }

    /// Compute the clamped output for measurement `pv` against setpoint `sp`.
    ///
    /// Returns the updated state and the output. `dt` is the time since the
    /// previous update in seconds.
    pub fn update(&self, state: &PiState, pv: f64, sp: f64, dt: f64) -> (PiState, f64) {
        // positive error: reading below setpoint, heat more
        let error = sp - pv;
        let p_term = self.kp * error;

        let ki = self.kp / self.ti;
        let new_integral = state.integral + error * dt.max(0.0);
        let output_raw = p_term + ki * new_integral;
        let output = output_raw.clamp(self.out_min, self.out_max);

        // no integration while saturated
        let integral = if output == output_raw {
            new_integral
        } else {
            state.integral
        };
        (PiState { integral }, output)
    }
}

/// PI controller state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PiState {
    /// Integral accumulator (kelvin seconds).
    pub integral: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_parameters() {
        assert!(PiController::new(1.0, 0.0, 0.0, 1.0).is_err());
        assert!(PiController::new(1.0, 1.0, 1.0, 1.0).is_err());
    }

    #[test]
    fn output_is_clamped() {
        let pi = PiController::new(10.0, 1.0, 0.0, 1.0).unwrap();
        let (_, out) = pi.update(&PiState::default(), 0.0, 100.0, 0.1);
        assert_eq!(out, 1.0);
        let (_, out) = pi.update(&PiState::default(), 100.0, 0.0, 0.1);
        assert_eq!(out, 0.0);
    }

    #[test]
    fn saturation_freezes_integral() {
        let pi = PiController::new(10.0, 1.0, 0.0, 1.0).unwrap();
        let state = PiState { integral: 0.5 };
        let (next, _) = pi.update(&state, 0.0, 100.0, 1.0);
        assert_eq!(next.integral, 0.5);
    }

    #[test]
    fn integral_accumulates_inside_limits() {
        let pi = PiController::new(0.01, 2.0, 0.0, 1.0).unwrap();
        let (next, out) = pi.update(&PiState::default(), 10.0, 11.0, 0.5);
        assert!((next.integral - 0.5).abs() < 1e-12);
        // p = 0.01, i = 0.005 * 0.5
        assert!((out - 0.0125).abs() < 1e-12);
    }
}
