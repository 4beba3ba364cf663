//! Cryostat temperature control.
//!
//! The [`CryostatControlLoop`] runs for the lifetime of the application,
//! independent of any measurement job. The only state written from outside the
//! loop is the [`CryostatSetpoint`], and the loop picks up a new value at the
//! next control period.

mod control_loop;
pub mod pi;

pub use control_loop::{CryostatControl, CryostatControlLoop, CryostatLoopHandle};
pub use pi::{PiController, PiState};

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Target temperature and tolerance band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CryostatSetpoint {
    /// Target temperature in kelvin.
    pub target_k: f64,
    /// Half-width of the acceptance band in kelvin.
    pub tolerance_k: f64,
}

impl CryostatSetpoint {
    /// Whether `temperature_k` lies inside the band.
    pub fn contains(&self, temperature_k: f64) -> bool {
        (temperature_k - self.target_k).abs() <= self.tolerance_k
    }
}

/// Settings of one control loop.
#[derive(Debug, Clone)]
pub struct CryostatLoopConfig {
    /// Control period.
    pub period: Duration,
    /// Heater controller; its limits are the device-safe output range.
    pub controller: PiController,
    /// Setpoint in force at start.
    pub initial_setpoint: CryostatSetpoint,
    /// Lowest accepted target.
    pub min_setpoint_k: f64,
    /// Highest accepted target.
    pub max_setpoint_k: f64,
    /// Capacity of the lossy monitor channel.
    pub monitor_capacity: usize,
}

impl CryostatLoopConfig {
    /// Check a setpoint against the safe range.
    pub fn validate_setpoint(&self, setpoint: &CryostatSetpoint) -> AppResult<()> {
        if !setpoint.target_k.is_finite()
            || setpoint.target_k < self.min_setpoint_k
            || setpoint.target_k > self.max_setpoint_k
        {
            return Err(DaqError::PreconditionFailed(format!(
                "setpoint {} K outside safe range {}..={} K",
                setpoint.target_k, self.min_setpoint_k, self.max_setpoint_k
            )));
        }
        if setpoint.tolerance_k.is_nan() || setpoint.tolerance_k <= 0.0 {
            return Err(DaqError::PreconditionFailed(format!(
                "tolerance must be positive, got {} K",
                setpoint.tolerance_k
            )));
        }
        Ok(())
    }
}

/// Latest state of the control loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CryostatStatus {
    /// Last temperature reading.
    pub temperature_k: Option<f64>,
    /// Setpoint used in the last cycle.
    pub setpoint: Option<CryostatSetpoint>,
    /// Last heater command.
    pub output: f64,
    /// `setpoint - reading` in the last cycle.
    pub error_k: f64,
    /// Whether the last reading was inside the band.
    pub in_band: bool,
    /// Completed control cycles.
    pub cycles: u64,
    /// Cycles lost to device faults.
    pub faults: u64,
    /// Most recent device fault.
    pub last_fault: Option<String>,
}
