//! Rig configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `SPECTRO_DAQ_`, nested keys split on `__`
//!
//! Every section carries serde defaults, so an empty file yields a usable
//! (device-less) configuration.
//!
//! # Example
//! ```no_run
//! use spectro_daq::config::RigConfig;
//!
//! let config = RigConfig::load_from("config/spectro_daq.toml")?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Environment overrides address nested keys with a double underscore:
//! `SPECTRO_DAQ_ACQUISITION__LIVE_CAPACITY=512`.

use crate::cryostat::{CryostatLoopConfig, CryostatSetpoint, PiController};
use crate::data::{OverflowPolicy, PersistenceConfig};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::hardware::InstrumentKind;
use crate::logging::LogFormat;
use crate::measurement::MeasurementSettings;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "SPECTRO_DAQ_";

/// Top-level rig configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Acquisition and channel settings
    pub acquisition: AcquisitionSection,
    /// Persistence settings
    pub storage: StorageConfig,
    /// Cryostat control loop
    pub cryostat: CryostatSection,
    /// Vertical beam calibration
    pub calibration: CalibrationSection,
    /// Default device for each measurement role
    pub roles: RolesConfig,
    /// Instrument definitions
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Spectro DAQ".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
        }
    }
}

/// Acquisition worker and channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSection {
    /// Period used by jobs that name none
    pub default_period_ms: u64,
    /// Live channel capacity
    pub live_capacity: usize,
    /// Live channel overflow policy
    pub live_overflow: OverflowPolicy,
    /// Persistence channel capacity
    pub persist_capacity: usize,
    /// Persistence channel overflow policy
    pub persist_overflow: OverflowPolicy,
    /// Retry policy for transient device faults
    pub retry: RetrySection,
}

impl Default for AcquisitionSection {
    fn default() -> Self {
        Self {
            default_period_ms: 100,
            live_capacity: 256,
            live_overflow: OverflowPolicy::DropOldest,
            persist_capacity: 1024,
            persist_overflow: OverflowPolicy::Block,
            retry: RetrySection::default(),
        }
    }
}

/// Retry bound and backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Retries after the first failed attempt
    pub max_attempts: u32,
    /// First backoff delay
    pub backoff_ms: u64,
    /// Backoff growth factor
    pub backoff_multiplier: f64,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1000,
        }
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        RetryPolicy {
            max_attempts: section.max_attempts,
            backoff_delay: Duration::from_millis(section.backoff_ms),
            backoff_multiplier: section.backoff_multiplier,
            max_backoff: Duration::from_millis(section.max_backoff_ms),
        }
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output directory for data files
    pub output_dir: PathBuf,
    /// Largest batch written at once
    pub batch_size: usize,
    /// Flush interval in milliseconds
    pub flush_interval_ms: u64,
    /// Write a metadata sidecar next to each data file
    pub write_metadata: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            batch_size: 64,
            flush_interval_ms: 500,
            write_metadata: true,
        }
    }
}

/// Cryostat control loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryostatSection {
    /// Start the loop with the application
    pub enabled: bool,
    /// Cryostat device id; falls back to `roles.cryostat`
    pub device: Option<String>,
    /// Control period in milliseconds
    pub period_ms: u64,
    /// Proportional gain
    pub kp: f64,
    /// Integral time in seconds
    pub ti_s: f64,
    /// Lowest heater command
    pub output_min: f64,
    /// Highest heater command
    pub output_max: f64,
    /// Setpoint at start
    pub initial_setpoint_k: f64,
    /// Half-width of the in-band window
    pub tolerance_k: f64,
    /// Lowest accepted setpoint
    pub min_setpoint_k: f64,
    /// Highest accepted setpoint
    pub max_setpoint_k: f64,
    /// Capacity of the monitor channel
    pub monitor_capacity: usize,
}

impl Default for CryostatSection {
    fn default() -> Self {
        Self {
            enabled: false,
            device: None,
            period_ms: 500,
            kp: 0.05,
            ti_s: 20.0,
            output_min: 0.0,
            output_max: 1.0,
            initial_setpoint_k: 295.0,
            tolerance_k: 0.5,
            min_setpoint_k: 3.0,
            max_setpoint_k: 350.0,
            monitor_capacity: 512,
        }
    }
}

/// Calibration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSection {
    /// Fewest valid points accepted by a fit
    pub min_points: usize,
    /// Settle delay after each beam move
    pub settle_ms: u64,
    /// Unit recorded with fitted readings
    pub unit: String,
}

impl Default for CalibrationSection {
    fn default() -> Self {
        Self {
            min_points: crate::calibration::MIN_FIT_POINTS,
            settle_ms: 200,
            unit: "counts".to_string(),
        }
    }
}

/// Device ids bound to measurement roles.
///
/// An unset role resolves to the first enabled instrument of a fitting kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RolesConfig {
    /// Spectral device used by background, kinetic and run jobs
    pub spectrometer: Option<String>,
    /// SLM steered by calibration jobs
    pub beam_positioner: Option<String>,
    /// Temperature controller driven by the control loop
    pub cryostat: Option<String>,
}

/// Instrument definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier
    pub id: String,
    /// Instrument type (e.g., "spectrometer", "slm", "cryostat")
    pub r#type: String,
    /// Whether this instrument is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Upper bound on a single driver call
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
    /// Instrument-specific configuration (dynamic)
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

impl InstrumentDefinition {
    /// Parsed device family, if the type is known.
    pub fn kind(&self) -> Option<InstrumentKind> {
        InstrumentKind::from_type_name(&self.r#type)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_io_timeout() -> u64 {
    5000
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl RigConfig {
    /// Load configuration from a TOML file and `SPECTRO_DAQ_` environment variables.
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Parse configuration from a TOML string, without environment overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self, figment::Error> {
        Figment::new().merge(Toml::string(toml)).extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        if !LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            ));
        }

        let acq = &self.acquisition;
        if acq.default_period_ms == 0 {
            return invalid("acquisition.default_period_ms must be positive".into());
        }
        if acq.live_capacity == 0 || acq.persist_capacity == 0 {
            return invalid("channel capacities must be positive".into());
        }
        if acq.retry.backoff_multiplier < 1.0 {
            return invalid("retry.backoff_multiplier must be at least 1".into());
        }
        if self.storage.batch_size == 0 {
            return invalid("storage.batch_size must be positive".into());
        }

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if !ids.insert(instrument.id.as_str()) {
                return invalid(format!("Duplicate instrument ID: {}", instrument.id));
            }
            if instrument.kind().is_none() {
                return invalid(format!(
                    "Instrument '{}' has unknown type '{}'",
                    instrument.id, instrument.r#type
                ));
            }
        }

        self.check_role("spectrometer", self.roles.spectrometer.as_deref(), |k| {
            k.is_spectral()
        })?;
        self.check_role("beam_positioner", self.roles.beam_positioner.as_deref(), |k| {
            k == InstrumentKind::Slm
        })?;
        self.check_role("cryostat", self.cryostat_device(), |k| {
            k == InstrumentKind::Cryostat
        })?;

        let cryo = &self.cryostat;
        if cryo.output_min >= cryo.output_max {
            return invalid(format!(
                "cryostat output_min ({}) must be less than output_max ({})",
                cryo.output_min, cryo.output_max
            ));
        }
        if cryo.min_setpoint_k >= cryo.max_setpoint_k {
            return invalid("cryostat min_setpoint_k must be less than max_setpoint_k".into());
        }
        if cryo.enabled {
            if self.resolved_cryostat().is_none() {
                return invalid("cryostat loop enabled but no cryostat instrument".into());
            }
            // gains, period and initial setpoint
            self.cryostat_loop_config()?;
        }
        Ok(())
    }

    fn check_role(
        &self,
        role: &str,
        id: Option<&str>,
        fits: impl Fn(InstrumentKind) -> bool,
    ) -> AppResult<()> {
        let Some(id) = id else {
            return Ok(());
        };
        let instrument = self
            .enabled_instruments()
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| {
                DaqError::Configuration(format!("role {role} names no enabled instrument '{id}'"))
            })?;
        match instrument.kind() {
            Some(kind) if fits(kind) => Ok(()),
            _ => Err(DaqError::Configuration(format!(
                "role {role} cannot be filled by '{id}' of type '{}'",
                instrument.r#type
            ))),
        }
    }

    /// Get all enabled instruments
    pub fn enabled_instruments(&self) -> Vec<&InstrumentDefinition> {
        self.instruments
            .iter()
            .filter(|inst| inst.enabled)
            .collect()
    }

    fn first_enabled(&self, fits: impl Fn(InstrumentKind) -> bool) -> Option<String> {
        self.enabled_instruments()
            .into_iter()
            .find(|i| i.kind().is_some_and(&fits))
            .map(|i| i.id.clone())
    }

    fn cryostat_device(&self) -> Option<&str> {
        self.cryostat
            .device
            .as_deref()
            .or(self.roles.cryostat.as_deref())
    }

    /// Device id of the spectrometer role.
    pub fn resolved_spectrometer(&self) -> Option<String> {
        self.roles
            .spectrometer
            .clone()
            .or_else(|| self.first_enabled(|k| k.is_spectral()))
    }

    /// Device id of the beam positioner role.
    pub fn resolved_beam_positioner(&self) -> Option<String> {
        self.roles
            .beam_positioner
            .clone()
            .or_else(|| self.first_enabled(|k| k == InstrumentKind::Slm))
    }

    /// Device id driven by the cryostat loop.
    pub fn resolved_cryostat(&self) -> Option<String> {
        self.cryostat_device()
            .map(str::to_string)
            .or_else(|| self.first_enabled(|k| k == InstrumentKind::Cryostat))
    }

    /// Batching of persistence workers.
    pub fn persistence_config(&self) -> PersistenceConfig {
        PersistenceConfig {
            batch_size: self.storage.batch_size,
            flush_interval: Duration::from_millis(self.storage.flush_interval_ms),
        }
    }

    /// Settings handed to the measurement controller.
    pub fn measurement_settings(&self) -> MeasurementSettings {
        let acq = &self.acquisition;
        MeasurementSettings {
            default_period: Duration::from_millis(acq.default_period_ms),
            live_capacity: acq.live_capacity,
            live_overflow: acq.live_overflow,
            persist_capacity: acq.persist_capacity,
            persist_overflow: acq.persist_overflow,
            retry: RetryPolicy::from(&acq.retry),
            persistence: self.persistence_config(),
            calibration_min_points: self.calibration.min_points,
            calibration_unit: self.calibration.unit.clone(),
            settle: Duration::from_millis(self.calibration.settle_ms),
            spectrometer: self.resolved_spectrometer(),
            beam_positioner: self.resolved_beam_positioner(),
        }
    }

    /// Settings of the cryostat control loop.
    pub fn cryostat_loop_config(&self) -> AppResult<CryostatLoopConfig> {
        let cryo = &self.cryostat;
        if cryo.period_ms == 0 {
            return Err(DaqError::Configuration(
                "cryostat period_ms must be positive".into(),
            ));
        }
        let config = CryostatLoopConfig {
            period: Duration::from_millis(cryo.period_ms),
            controller: PiController::new(cryo.kp, cryo.ti_s, cryo.output_min, cryo.output_max)?,
            initial_setpoint: CryostatSetpoint {
                target_k: cryo.initial_setpoint_k,
                tolerance_k: cryo.tolerance_k,
            },
            min_setpoint_k: cryo.min_setpoint_k,
            max_setpoint_k: cryo.max_setpoint_k,
            monitor_capacity: cryo.monitor_capacity.max(1),
        };
        config
            .validate_setpoint(&config.initial_setpoint)
            .map_err(|e| DaqError::Configuration(format!("cryostat initial setpoint: {e}")))?;
        Ok(config)
    }
}
