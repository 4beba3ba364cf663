//! Measurement coordination.
//!
//! A [`MeasurementController`] accepts [`MeasurementRequest`]s, validates their
//! preconditions and runs each accepted request as one supervised job:
//!
//! ```text
//! start(request) ─▶ Created ─▶ Validating ─▶ Running ⇄ Retrying
//!                                   │            │
//!                                   ▼            ▼
//!                                 Failed   Completed | Failed | Cancelled
//! ```
//!
//! Each kind sequences acquisition workers and device reconfiguration steps:
//!
//! - **Background**: averages `scans` spectra with the shutter closed and
//!   stores the result as the device baseline.
//! - **Calibration**: steps the beam positioner through a list of positions,
//!   samples once per position after a settle delay and fits the series.
//! - **Spectral calibration**: steps a grating stripe across SLM columns,
//!   takes the peak wavelength of each spectrum and fits a polynomial.
//! - **Kinetic**: acquires for a count, a duration or an explicit schedule with
//!   inline background subtraction and optional correction.
//! - **Run**: acquires until stopped, optionally persisted.
//! - **View**: live display only, never persisted.
//! - **Temperature series**: steps the cryostat through a list of setpoints
//!   and averages spectra at each once the temperature is stable.
//!
//! Status changes are pushed to a broadcast channel and an optional callback
//! as [`JobStatus`] values; terminal statuses carry the [`JobReport`].

mod background;
mod controller;
pub mod correction;
mod job;
mod scan;
mod spectral_beam;
pub mod state;
mod stream;
mod temperature_series;
mod vertical_beam;

pub use controller::{MeasurementController, StatusCallback};
pub use correction::Correction;
pub use state::JobState;

use crate::acquisition::AcquisitionLimit;
use crate::calibration::{CalibrationResult, SpectralCalibration};
use crate::core::JobId;
use crate::data::{OverflowPolicy, PersistReport, PersistenceConfig};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::hardware::InstrumentSettings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// =============================================================================
// Requests
// =============================================================================

/// Measurement kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    /// Baseline capture with the source blocked.
    Background,
    /// Vertical beam calibration.
    Calibration,
    /// Time-limited acquisition.
    Kinetic,
    /// Open-ended acquisition.
    Run,
    /// Live view.
    View,
    /// Grating column to wavelength calibration.
    SpectralCalibration,
    /// Spectra at a list of cryostat temperatures.
    TemperatureSeries,
}

impl MeasurementKind {
    /// Lower-case label used in logs, worker names and metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementKind::Background => "background",
            MeasurementKind::Calibration => "calibration",
            MeasurementKind::Kinetic => "kinetic",
            MeasurementKind::Run => "run",
            MeasurementKind::View => "view",
            MeasurementKind::SpectralCalibration => "spectral_calibration",
            MeasurementKind::TemperatureSeries => "temperature_series",
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A measurement to start, with its kind-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeasurementRequest {
    /// Baseline capture.
    Background(BackgroundParams),
    /// Beam calibration.
    Calibration(CalibrationParams),
    /// Time-limited acquisition.
    Kinetic(KineticParams),
    /// Open-ended acquisition.
    Run(RunParams),
    /// Live view.
    View(ViewParams),
    /// Spectral beam calibration.
    SpectralCalibration(SpectralCalibrationParams),
    /// Temperature series.
    TemperatureSeries(TemperatureSeriesParams),
}

impl MeasurementRequest {
    /// Kind of the request.
    pub fn kind(&self) -> MeasurementKind {
        match self {
            MeasurementRequest::Background(_) => MeasurementKind::Background,
            MeasurementRequest::Calibration(_) => MeasurementKind::Calibration,
            MeasurementRequest::Kinetic(_) => MeasurementKind::Kinetic,
            MeasurementRequest::Run(_) => MeasurementKind::Run,
            MeasurementRequest::View(_) => MeasurementKind::View,
            MeasurementRequest::SpectralCalibration(_) => MeasurementKind::SpectralCalibration,
            MeasurementRequest::TemperatureSeries(_) => MeasurementKind::TemperatureSeries,
        }
    }

    /// Parameters as JSON, for the metadata sidecar.
    pub fn parameters(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn default_scans() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

/// Parameters of a background capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundParams {
    /// Spectral device; defaults to the spectrometer role.
    #[serde(default)]
    pub device: Option<String>,
    /// Spectra averaged into the baseline.
    #[serde(default = "default_scans")]
    pub scans: u32,
    /// Period between scans; defaults to the acquisition default.
    #[serde(default)]
    pub period_ms: Option<u64>,
    /// Device settings for the scans. The shutter is always closed.
    #[serde(default)]
    pub settings: InstrumentSettings,
    /// Persist the raw scans.
    #[serde(default)]
    pub persist: bool,
    /// Operator comments for the metadata sidecar.
    #[serde(default)]
    pub comments: String,
}

impl Default for BackgroundParams {
    fn default() -> Self {
        Self {
            device: None,
            scans: default_scans(),
            period_ms: None,
            settings: InstrumentSettings::default(),
            persist: false,
            comments: String::new(),
        }
    }
}

/// Parameters of a vertical beam calibration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    /// Spectral device; defaults to the spectrometer role.
    #[serde(default)]
    pub spectrometer: Option<String>,
    /// Beam positioner; defaults to the beam positioner role.
    #[serde(default)]
    pub positioner: Option<String>,
    /// Beam positions in visiting order.
    pub positions: Vec<f64>,
    /// Settle delay after each move; defaults to the calibration default.
    #[serde(default)]
    pub settle_ms: Option<u64>,
    /// Spectrometer settings.
    #[serde(default)]
    pub settings: InstrumentSettings,
    /// Persist the `[position, reading]` series.
    #[serde(default)]
    pub persist: bool,
    /// Operator comments for the metadata sidecar.
    #[serde(default)]
    pub comments: String,
}

impl CalibrationParams {
    /// Evenly spaced positions from `start` to `end` inclusive.
    pub fn linear(start: f64, end: f64, steps: usize) -> Self {
        let positions = match steps {
            0 => Vec::new(),
            1 => vec![start],
            n => (0..n)
                .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
                .collect(),
        };
        Self {
            positions,
            ..Self::default()
        }
    }
}

fn default_degree() -> usize {
    2
}

/// Parameters of a spectral beam calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralCalibrationParams {
    /// Spectral device; defaults to the spectrometer role.
    #[serde(default)]
    pub spectrometer: Option<String>,
    /// Beam positioner; defaults to the beam positioner role.
    #[serde(default)]
    pub positioner: Option<String>,
    /// Grating columns in visiting order.
    pub columns: Vec<f64>,
    /// Settle delay after each move; defaults to the calibration default.
    #[serde(default)]
    pub settle_ms: Option<u64>,
    /// Peaks outside this window are discarded.
    pub wavelength_bounds_nm: (f64, f64),
    /// Polynomial degree of the fit.
    #[serde(default = "default_degree")]
    pub degree: usize,
    /// Spectrometer settings.
    #[serde(default)]
    pub settings: InstrumentSettings,
    /// Persist the spectrum taken at each kept column.
    #[serde(default)]
    pub persist: bool,
    /// Operator comments for the metadata sidecar.
    #[serde(default)]
    pub comments: String,
}

impl SpectralCalibrationParams {
    /// Columns from `start` up to, but excluding, `end` every `increment`.
    pub fn stepped(start: f64, end: f64, increment: f64, wavelength_bounds_nm: (f64, f64)) -> Self {
        let mut columns = Vec::new();
        if increment > 0.0 && increment.is_finite() {
            let mut column = start;
            while column < end {
                columns.push(column);
                column = start + increment * columns.len() as f64;
            }
        }
        Self {
            spectrometer: None,
            positioner: None,
            columns,
            settle_ms: None,
            wavelength_bounds_nm,
            degree: default_degree(),
            settings: InstrumentSettings::default(),
            persist: false,
            comments: String::new(),
        }
    }
}

/// Stop condition of a kinetic job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KineticLimit {
    /// A fixed number of spectra.
    Count {
        /// Spectra to acquire.
        samples: u64,
    },
    /// A fixed duration.
    Duration {
        /// Seconds from start.
        seconds: f64,
    },
    /// Explicit offsets from start.
    Schedule {
        /// Seconds from start, one acquisition each.
        offsets_s: Vec<f64>,
    },
}

impl KineticLimit {
    /// Reject empty or non-finite limits.
    pub fn validate(&self) -> AppResult<()> {
        let ok = match self {
            KineticLimit::Count { samples } => *samples > 0,
            KineticLimit::Duration { seconds } => {
                *seconds > 0.0 && Duration::try_from_secs_f64(*seconds).is_ok()
            }
            KineticLimit::Schedule { offsets_s } => {
                !offsets_s.is_empty()
                    && offsets_s.iter().all(|o| Duration::try_from_secs_f64(*o).is_ok())
            }
        };
        if ok {
            Ok(())
        } else {
            Err(DaqError::PreconditionFailed(format!(
                "invalid kinetic limit {self:?}"
            )))
        }
    }

    /// Worker stop condition. Schedule offsets are sorted.
    pub fn to_acquisition_limit(&self) -> AcquisitionLimit {
        match self {
            KineticLimit::Count { samples } => AcquisitionLimit::Count(*samples),
            KineticLimit::Duration { seconds } => {
                AcquisitionLimit::Duration(seconds_to_duration(*seconds))
            }
            KineticLimit::Schedule { offsets_s } => {
                let mut offsets: Vec<Duration> =
                    offsets_s.iter().map(|s| seconds_to_duration(*s)).collect();
                offsets.sort();
                AcquisitionLimit::Schedule(offsets)
            }
        }
    }
}

/// Seconds as a `Duration`, saturating instead of panicking on values
/// `validate` would reject.
pub(crate) fn seconds_to_duration(seconds: f64) -> Duration {
    match Duration::try_from_secs_f64(seconds) {
        Ok(duration) => duration,
        Err(_) if seconds > 0.0 => Duration::MAX,
        Err(_) => Duration::ZERO,
    }
}

/// Parameters of a kinetic job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KineticParams {
    /// Spectral device; defaults to the spectrometer role.
    #[serde(default)]
    pub device: Option<String>,
    /// Period between spectra; defaults to the acquisition default.
    #[serde(default)]
    pub period_ms: Option<u64>,
    /// Stop condition.
    pub limit: KineticLimit,
    /// Correction after background subtraction.
    #[serde(default)]
    pub correction: Correction,
    /// Run without a stored background.
    #[serde(default)]
    pub override_background: bool,
    /// Device settings.
    #[serde(default)]
    pub settings: InstrumentSettings,
    /// Persist the spectra.
    #[serde(default = "default_true")]
    pub persist: bool,
    /// Operator comments for the metadata sidecar.
    #[serde(default)]
    pub comments: String,
}

impl KineticParams {
    /// Persisted kinetic job with default settings.
    pub fn new(limit: KineticLimit) -> Self {
        Self {
            device: None,
            period_ms: None,
            limit,
            correction: Correction::None,
            override_background: false,
            settings: InstrumentSettings::default(),
            persist: true,
            comments: String::new(),
        }
    }
}

/// Parameters of an open-ended run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    /// Spectral device; defaults to the spectrometer role.
    #[serde(default)]
    pub device: Option<String>,
    /// Period between spectra; defaults to the acquisition default.
    #[serde(default)]
    pub period_ms: Option<u64>,
    /// Correction after background subtraction.
    #[serde(default)]
    pub correction: Correction,
    /// Run without a stored background.
    #[serde(default)]
    pub override_background: bool,
    /// Device settings.
    #[serde(default)]
    pub settings: InstrumentSettings,
    /// Persist the spectra.
    #[serde(default)]
    pub persist: bool,
    /// Operator comments for the metadata sidecar.
    #[serde(default)]
    pub comments: String,
}

/// Parameters of a live view. Views have no persistence option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewParams {
    /// Device to show; defaults to the spectrometer role.
    #[serde(default)]
    pub device: Option<String>,
    /// Period between frames; defaults to the acquisition default.
    #[serde(default)]
    pub period_ms: Option<u64>,
    /// Subtract the stored background when there is one.
    #[serde(default = "default_true")]
    pub subtract_background: bool,
    /// Device settings.
    #[serde(default)]
    pub settings: InstrumentSettings,
}

impl Default for ViewParams {
    fn default() -> Self {
        Self {
            device: None,
            period_ms: None,
            subtract_background: true,
            settings: InstrumentSettings::default(),
        }
    }
}

fn default_tolerance_k() -> f64 {
    0.5
}

fn default_hold_ms() -> u64 {
    1_000
}

fn default_stable_timeout_s() -> f64 {
    600.0
}

fn default_spectra() -> u32 {
    1
}

/// Parameters of a temperature series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSeriesParams {
    /// Spectral device; defaults to the spectrometer role.
    #[serde(default)]
    pub device: Option<String>,
    /// Setpoints in visiting order (K).
    pub temperatures_k: Vec<f64>,
    /// Band the temperature must stay in before acquiring (K).
    #[serde(default = "default_tolerance_k")]
    pub tolerance_k: f64,
    /// Time the temperature must stay in band.
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,
    /// Give up on a setpoint after this long.
    #[serde(default = "default_stable_timeout_s")]
    pub timeout_s: f64,
    /// Spectra averaged at each temperature.
    #[serde(default = "default_spectra")]
    pub spectra: u32,
    /// Period between spectra; defaults to the acquisition default.
    #[serde(default)]
    pub period_ms: Option<u64>,
    /// Correction after background subtraction.
    #[serde(default)]
    pub correction: Correction,
    /// Run without a stored background.
    #[serde(default)]
    pub override_background: bool,
    /// Device settings.
    #[serde(default)]
    pub settings: InstrumentSettings,
    /// Persist every spectrum.
    #[serde(default = "default_true")]
    pub persist: bool,
    /// Operator comments for the metadata sidecar.
    #[serde(default)]
    pub comments: String,
}

impl TemperatureSeriesParams {
    /// Persisted series over `temperatures_k` with default settings.
    pub fn new(temperatures_k: Vec<f64>) -> Self {
        Self {
            device: None,
            temperatures_k,
            tolerance_k: default_tolerance_k(),
            hold_ms: default_hold_ms(),
            timeout_s: default_stable_timeout_s(),
            spectra: default_spectra(),
            period_ms: None,
            correction: Correction::None,
            override_background: false,
            settings: InstrumentSettings::default(),
            persist: true,
            comments: String::new(),
        }
    }
}

// =============================================================================
// Controller settings
// =============================================================================

/// Tuning shared by every job of one controller.
#[derive(Debug, Clone)]
pub struct MeasurementSettings {
    /// Period used when a request names none.
    pub default_period: Duration,
    /// Capacity of each job's live channel.
    pub live_capacity: usize,
    /// Overflow policy of live channels.
    pub live_overflow: OverflowPolicy,
    /// Capacity of each job's persistence channel.
    pub persist_capacity: usize,
    /// Overflow policy of persistence channels.
    pub persist_overflow: OverflowPolicy,
    /// Retry bound and backoff for transient device faults.
    pub retry: RetryPolicy,
    /// Batching of persistence workers.
    pub persistence: PersistenceConfig,
    /// Minimum valid calibration points.
    pub calibration_min_points: usize,
    /// Unit of calibration readings.
    pub calibration_unit: String,
    /// Settle delay after a beam move.
    pub settle: Duration,
    /// Default spectral device.
    pub spectrometer: Option<String>,
    /// Default beam positioner.
    pub beam_positioner: Option<String>,
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        Self {
            default_period: Duration::from_millis(100),
            live_capacity: 256,
            live_overflow: OverflowPolicy::DropOldest,
            persist_capacity: 1024,
            persist_overflow: OverflowPolicy::Block,
            retry: RetryPolicy::default(),
            persistence: PersistenceConfig::default(),
            calibration_min_points: crate::calibration::MIN_FIT_POINTS,
            calibration_unit: "counts".to_string(),
            settle: Duration::from_millis(200),
            spectrometer: Some("spectrometer".to_string()),
            beam_positioner: Some("slm".to_string()),
        }
    }
}

// =============================================================================
// Results and status
// =============================================================================

/// Stored background of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    /// Device the baseline belongs to.
    pub device: String,
    /// Bin-wise average of the scans.
    pub payload: Vec<f64>,
    /// Scans averaged.
    pub scans: u32,
    /// When the baseline was captured.
    pub created_at: DateTime<Utc>,
}

/// Largest value of the most recent spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakInfo {
    /// Peak value.
    pub value: f64,
    /// Bin index of the peak.
    pub index: usize,
    /// Seconds since the job started.
    pub elapsed_s: f64,
}

/// What a successful job produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobResult {
    /// Baseline stored for later subtraction.
    Baseline(Baseline),
    /// Calibration stored for unit conversion.
    Calibration(CalibrationResult),
    /// Column to wavelength mapping stored for the SLM.
    SpectralCalibration(SpectralCalibration),
    /// One averaged spectrum per reached temperature.
    TemperatureSeries {
        /// Producing device.
        device: String,
        /// Points in visiting order; fewer than requested after a stop.
        points: Vec<TemperaturePoint>,
    },
    /// Last processed spectrum of a streaming job.
    Spectrum {
        /// Producing device.
        device: String,
        /// Spectrum after subtraction and correction, empty if none arrived.
        payload: Vec<f64>,
    },
}

/// Averaged spectrum taken at one stable temperature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperaturePoint {
    /// Setpoint (K).
    pub target_k: f64,
    /// Temperature read when the band was reached (K).
    pub temperature_k: Option<f64>,
    /// Spectra in the average.
    pub spectra: u32,
    /// Averaged spectrum after subtraction and correction.
    pub payload: Vec<f64>,
}

/// Final account of one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    /// Job id.
    pub job_id: JobId,
    /// Kind.
    pub kind: MeasurementKind,
    /// Terminal state.
    pub state: JobState,
    /// Cause of `Failed` (or `Cancelled`).
    pub error: Option<DaqError>,
    /// Samples acquired.
    pub samples: u64,
    /// Transient device faults retried.
    pub retries: u64,
    /// Samples the live channel dropped.
    pub live_dropped: u64,
    /// Persistence outcome, if the job persisted.
    pub persist: Option<PersistReport>,
    /// Peak of the most recent spectrum.
    pub peak: Option<PeakInfo>,
    /// Result, also present for partial runs that ended by `stop`.
    pub result: Option<JobResult>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
}

impl JobReport {
    /// Whether the job completed.
    pub fn is_success(&self) -> bool {
        self.state == JobState::Completed
    }

    /// Total samples lost before persistence, over all channels of the job.
    pub fn dropped(&self) -> u64 {
        self.live_dropped + self.persist.as_ref().map_or(0, |p| p.channel_dropped)
    }

    /// Number of persistence faults.
    pub fn persist_faults(&self) -> u64 {
        self.persist.as_ref().map_or(0, |p| p.fault_count)
    }
}

/// Status update pushed to subscribers and the callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    /// Job id.
    pub job_id: JobId,
    /// Kind.
    pub kind: MeasurementKind,
    /// Current state.
    pub state: JobState,
    /// Whether acquisition is paused.
    pub paused: bool,
    /// Progress in percent, for jobs with a known end.
    pub progress: Option<f64>,
    /// Samples acquired so far.
    pub samples: u64,
    /// Persistence faults so far.
    pub persist_faults: u64,
    /// Error cause, for `Failed` and `Cancelled`.
    pub error: Option<DaqError>,
    /// Final report, on terminal states.
    pub report: Option<JobReport>,
}

impl JobStatus {
    pub(crate) fn new(job_id: JobId, kind: MeasurementKind) -> Self {
        Self {
            job_id,
            kind,
            state: JobState::Created,
            paused: false,
            progress: None,
            samples: 0,
            persist_faults: 0,
            error: None,
            report: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_tagged_json() {
        let json = serde_json::json!({
            "kind": "kinetic",
            "limit": { "type": "count", "samples": 5 },
            "correction": "absorbance"
        });
        let request: MeasurementRequest = serde_json::from_value(json).unwrap();
        let MeasurementRequest::Kinetic(params) = &request else {
            panic!("expected kinetic request");
        };
        assert_eq!(params.limit, KineticLimit::Count { samples: 5 });
        assert_eq!(params.correction, Correction::Absorbance);
        assert!(params.persist);
        assert_eq!(request.kind(), MeasurementKind::Kinetic);
        assert_eq!(request.parameters()["kind"], "kinetic");
    }

    #[test]
    fn new_kinds_fill_their_defaults_from_json() {
        let request: MeasurementRequest = serde_json::from_value(serde_json::json!({
            "kind": "temperature_series",
            "temperatures_k": [80.0, 90.0]
        }))
        .unwrap();
        assert_eq!(request.kind(), MeasurementKind::TemperatureSeries);
        assert_eq!(
            request,
            MeasurementRequest::TemperatureSeries(TemperatureSeriesParams::new(vec![80.0, 90.0]))
        );

        let request: MeasurementRequest = serde_json::from_value(serde_json::json!({
            "kind": "spectral_calibration",
            "columns": [0.0, 10.0, 20.0],
            "wavelength_bounds_nm": [550.0, 650.0]
        }))
        .unwrap();
        let MeasurementRequest::SpectralCalibration(params) = &request else {
            panic!("expected spectral calibration request");
        };
        assert_eq!(params.degree, 2);
        assert_eq!(request.kind().as_str(), "spectral_calibration");
    }

    #[test]
    fn stepped_columns_exclude_the_end() {
        let params = SpectralCalibrationParams::stepped(0.0, 100.0, 25.0, (500.0, 700.0));
        assert_eq!(params.columns, vec![0.0, 25.0, 50.0, 75.0]);
        assert!(SpectralCalibrationParams::stepped(0.0, 100.0, 0.0, (500.0, 700.0))
            .columns
            .is_empty());
    }

    #[test]
    fn kinetic_limits_are_checked() {
        assert!(KineticLimit::Count { samples: 0 }.validate().is_err());
        assert!(KineticLimit::Duration { seconds: f64::NAN }.validate().is_err());
        assert!(KineticLimit::Schedule { offsets_s: vec![] }.validate().is_err());
        assert!(KineticLimit::Duration { seconds: 1e20 }.validate().is_err());
        assert!(KineticLimit::Schedule {
            offsets_s: vec![0.1, f64::MAX]
        }
        .validate()
        .is_err());
        assert_eq!(seconds_to_duration(1e20), Duration::MAX);
        assert!(KineticLimit::Schedule {
            offsets_s: vec![0.2, 0.0]
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn schedule_offsets_are_sorted() {
        let limit = KineticLimit::Schedule {
            offsets_s: vec![0.5, 0.1],
        };
        assert_eq!(
            limit.to_acquisition_limit(),
            AcquisitionLimit::Schedule(vec![
                Duration::from_millis(100),
                Duration::from_millis(500)
            ])
        );
    }

    #[test]
    fn linear_positions_include_both_ends() {
        let params = CalibrationParams::linear(0.0, 100.0, 5);
        assert_eq!(params.positions, vec![0.0, 25.0, 50.0, 75.0, 100.0]);
        assert_eq!(CalibrationParams::linear(3.0, 9.0, 1).positions, vec![3.0]);
    }
}
