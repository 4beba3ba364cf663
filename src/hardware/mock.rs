//! Mock Hardware Implementations
//!
//! Simulated versions of every device on the rig, used by tests, the `demo`
//! command and any configuration that lists `mock_*` instrument types.
//! All mock devices use async-safe operations (`tokio::time::sleep`, never
//! `std::thread::sleep`).
//!
//! # Available Mocks
//!
//! - [`MockSpectrometer`] - Gaussian emission line over a dark level; camera
//!   variant returns a flattened frame
//! - [`MockSlm`] - vertical beam positioner; readback is the written row
//! - [`MockMonochromator`] - reports its centre wavelength
//! - [`MockOscilloscope`] - damped sine trace
//! - [`MockCryostat`] - first-order thermal model driven by the heater output
//!
//! Every mock carries a [`FaultInjector`] that tests keep a clone of after the
//! driver has been moved into its handle.
//!
//! The SLM and the spectrometer can share an [`OpticalBench`]: the beam row
//! written to the SLM shifts and brightens the simulated emission line, which
//! gives calibration runs a monotonic response. A grating stripe written at an
//! SLM column diffracts [`NM_PER_COLUMN`] nanometres per column onto the
//! spectrometer, which is what spectral beam calibration measures.

use super::{bin_wavelength, Instrument, InstrumentKind, InstrumentSettings, DEFAULT_WAVELENGTH_RANGE_NM};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

// =============================================================================
// Fault injection
// =============================================================================

/// `fail_after` value meaning "not armed".
const DISARMED: u32 = u32::MAX;

#[derive(Debug)]
struct FaultState {
    fail_next: AtomicU32,
    fail_always: AtomicBool,
    fail_after: AtomicU32,
    io_calls: AtomicU64,
}

impl Default for FaultState {
    fn default() -> Self {
        Self {
            fail_next: AtomicU32::new(0),
            fail_always: AtomicBool::new(false),
            fail_after: AtomicU32::new(DISARMED),
            io_calls: AtomicU64::new(0),
        }
    }
}

/// Shared switchboard for simulated device faults.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    inner: Arc<FaultState>,
}

impl FaultInjector {
    /// Fail the next `n` device calls with a transient fault.
    pub fn fail_next(&self, n: u32) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every device call until switched off again.
    pub fn fail_always(&self, enabled: bool) {
        self.inner.fail_always.store(enabled, Ordering::SeqCst);
    }

    /// Let the next `n` device calls through, then fail every call with a
    /// transient fault.
    pub fn fail_after(&self, n: u32) {
        self.inner.fail_after.store(n.min(DISARMED - 1), Ordering::SeqCst);
    }

    /// Number of acquire and apply-settings calls that reached the driver.
    pub fn io_calls(&self) -> u64 {
        self.inner.io_calls.load(Ordering::SeqCst)
    }

    fn check(&self, op: &str) -> AppResult<()> {
        self.inner.io_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_always.load(Ordering::SeqCst) {
            return Err(DaqError::device_fault("mock", format!("simulated {op} failure")));
        }
        let budget = self
            .inner
            .fail_after
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 | DISARMED => None,
                n => Some(n - 1),
            });
        if budget == Err(0) {
            return Err(DaqError::device_fault("mock", format!("simulated {op} failure")));
        }
        let pending = self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(DaqError::device_fault("mock", format!("simulated {op} timeout")));
        }
        Ok(())
    }
}

/// Line shift per SLM column of the grating stripe.
pub const NM_PER_COLUMN: f64 = 0.1;

/// State shared between the beam positioner and the detectors on one bench.
#[derive(Debug, Clone, Default)]
pub struct OpticalBench {
    beam_position: Arc<Mutex<f64>>,
    grating_column: Arc<Mutex<Option<f64>>>,
}

impl OpticalBench {
    /// Fresh bench with the beam at row 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current beam row.
    pub fn beam_position(&self) -> f64 {
        *self.beam_position.lock()
    }

    fn set_beam_position(&self, position: f64) {
        *self.beam_position.lock() = position;
    }

    /// Column of the grating stripe, if one has been written.
    pub fn grating_column(&self) -> Option<f64> {
        *self.grating_column.lock()
    }

    fn set_grating_column(&self, column: f64) {
        *self.grating_column.lock() = Some(column);
    }
}

/// Options accepted in the `config` table of a mock instrument definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockOptions {
    /// Spectrum bins (spectrometer) or frame width (camera).
    pub bins: usize,
    /// Camera frame height.
    pub height: usize,
    /// Emission line centre in nanometres.
    pub peak_nm: f64,
    /// SLM row count.
    pub rows: u32,
    /// SLM column count.
    pub columns: u32,
    /// Monochromator start wavelength.
    pub center_nm: f64,
    /// Oscilloscope trace length.
    pub points: usize,
    /// Cryostat starting temperature.
    pub initial_k: f64,
    /// Cryostat cold-head temperature with the heater off.
    pub base_k: f64,
    /// Cryostat thermal time constant.
    pub time_constant_s: f64,
    /// Cryostat heating rate at full heater output.
    pub heater_gain_k_per_s: f64,
    /// Artificial latency of every acquisition.
    pub acquire_delay_ms: u64,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            bins: 256,
            height: 1,
            peak_nm: 600.0,
            rows: 1080,
            columns: 1920,
            center_nm: 550.0,
            points: 500,
            initial_k: 295.0,
            base_k: 4.0,
            time_constant_s: 2.0,
            heater_gain_k_per_s: 150.0,
            acquire_delay_ms: 0,
        }
    }
}

/// Build a mock driver of `kind` from configuration options.
pub fn build(kind: InstrumentKind, options: &MockOptions, bench: &OpticalBench) -> Box<dyn Instrument> {
    let delay = Duration::from_millis(options.acquire_delay_ms);
    match kind {
        InstrumentKind::Spectrometer => Box::new(
            MockSpectrometer::new(options.bins)
                .with_peak_nm(options.peak_nm)
                .with_bench(bench.clone())
                .with_acquire_delay(delay),
        ),
        InstrumentKind::Camera => Box::new(
            MockSpectrometer::camera(options.bins, options.height)
                .with_peak_nm(options.peak_nm)
                .with_bench(bench.clone())
                .with_acquire_delay(delay),
        ),
        InstrumentKind::Slm => Box::new(
            MockSlm::new(options.rows)
                .with_columns(options.columns)
                .with_bench(bench.clone()),
        ),
        InstrumentKind::Monochromator => Box::new(MockMonochromator::new(options.center_nm)),
        InstrumentKind::Oscilloscope => {
            Box::new(MockOscilloscope::new(options.points).with_acquire_delay(delay))
        }
        InstrumentKind::Cryostat => Box::new(
            MockCryostat::new(options.initial_k)
                .with_base_k(options.base_k)
                .with_time_constant(
                    Duration::try_from_secs_f64(options.time_constant_s.max(1e-3))
                        .unwrap_or(Duration::MAX),
                )
                .with_heater_gain(options.heater_gain_k_per_s),
        ),
    }
}

// =============================================================================
// MockSpectrometer - Simulated spectrometer / camera
// =============================================================================

/// Mock spectrometer with a single Gaussian emission line.
///
/// - dark level of 100 counts plus ~1% noise
/// - line amplitude scales with exposure (reference 10 ms) and gain
/// - shutter closed returns dark counts only
/// - bins span `wavelength_range_nm` linearly (400-800 nm by default)
/// - on a bench, the line follows the SLM beam row and grating column
pub struct MockSpectrometer {
    kind: InstrumentKind,
    bins: usize,
    rows: usize,
    peak_nm: f64,
    settings: InstrumentSettings,
    bench: Option<OpticalBench>,
    acquire_delay: Duration,
    faults: FaultInjector,
}

impl MockSpectrometer {
    /// Spectrometer with `bins` spectral bins.
    pub fn new(bins: usize) -> Self {
        Self {
            kind: InstrumentKind::Spectrometer,
            bins: bins.max(1),
            rows: 1,
            peak_nm: 600.0,
            settings: InstrumentSettings::default(),
            bench: None,
            acquire_delay: Duration::ZERO,
            faults: FaultInjector::default(),
        }
    }

    /// Imaging variant: every row carries the same spectrum.
    pub fn camera(width: usize, height: usize) -> Self {
        Self {
            kind: InstrumentKind::Camera,
            rows: height.max(1),
            ..Self::new(width)
        }
    }

    /// Move the emission line.
    pub fn with_peak_nm(mut self, peak_nm: f64) -> Self {
        self.peak_nm = peak_nm;
        self
    }

    /// Couple the line to the beam position of a shared bench.
    pub fn with_bench(mut self, bench: OpticalBench) -> Self {
        self.bench = Some(bench);
        self
    }

    /// Add artificial latency to every acquisition.
    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = delay;
        self
    }

    /// Fault switchboard for this device.
    pub fn faults(&self) -> FaultInjector {
        self.faults.clone()
    }

    fn spectrum(&self) -> Vec<f64> {
        let range = self
            .settings
            .wavelength_range_nm
            .unwrap_or(DEFAULT_WAVELENGTH_RANGE_NM);
        let exposure = self.settings.exposure_ms.unwrap_or(10.0) / 10.0;
        let gain = self.settings.gain.unwrap_or(1.0);
        let shutter_open = self.settings.shutter_open.unwrap_or(true);
        let beam = self.bench.as_ref().map(|b| b.beam_position()).unwrap_or(0.0);
        let column = self.bench.as_ref().and_then(|b| b.grating_column()).unwrap_or(0.0);

        let center = self.peak_nm + 0.05 * beam + NM_PER_COLUMN * column;
        let amplitude = 1000.0 * exposure * gain * (1.0 + 0.01 * beam);
        let width_nm = 8.0;

        let mut rng = rand::thread_rng();
        let row: Vec<f64> = (0..self.bins)
            .map(|i| {
                let wl = bin_wavelength(range, self.bins, i);
                let dark = 100.0 * (1.0 + rng.gen_range(-0.01..0.01));
                let line = if shutter_open {
                    amplitude * (-((wl - center) / width_nm).powi(2) / 2.0).exp()
                } else {
                    0.0
                };
                dark + line
            })
            .collect();

        let mut frame = Vec::with_capacity(self.bins * self.rows);
        for _ in 0..self.rows {
            frame.extend_from_slice(&row);
        }
        frame
    }
}

#[async_trait]
impl Instrument for MockSpectrometer {
    fn kind(&self) -> InstrumentKind {
        self.kind
    }

    async fn connect(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn apply_settings(&mut self, settings: &InstrumentSettings) -> AppResult<()> {
        self.faults.check("apply_settings")?;
        if let Some(exposure) = settings.exposure_ms {
            if exposure <= 0.0 {
                return Err(DaqError::Configuration(format!(
                    "exposure must be positive, got {exposure} ms"
                )));
            }
        }
        self.settings = settings.clone();
        Ok(())
    }

    async fn acquire(&mut self) -> AppResult<Vec<f64>> {
        self.faults.check("acquire")?;
        if !self.acquire_delay.is_zero() {
            sleep(self.acquire_delay).await;
        }
        Ok(self.spectrum())
    }
}

// =============================================================================
// MockSlm - Simulated beam positioner
// =============================================================================

/// Mock spatial light modulator steering the beam to a row.
pub struct MockSlm {
    rows: u32,
    columns: u32,
    position: f64,
    bench: Option<OpticalBench>,
    faults: FaultInjector,
}

impl MockSlm {
    /// SLM with `rows` addressable rows and 1920 columns.
    pub fn new(rows: u32) -> Self {
        Self {
            rows,
            columns: 1920,
            position: 0.0,
            bench: None,
            faults: FaultInjector::default(),
        }
    }

    /// Override the column count.
    pub fn with_columns(mut self, columns: u32) -> Self {
        self.columns = columns;
        self
    }

    /// Publish the beam position to a shared bench.
    pub fn with_bench(mut self, bench: OpticalBench) -> Self {
        self.bench = Some(bench);
        self
    }

    /// Fault switchboard for this device.
    pub fn faults(&self) -> FaultInjector {
        self.faults.clone()
    }
}

#[async_trait]
impl Instrument for MockSlm {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Slm
    }

    async fn connect(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn apply_settings(&mut self, settings: &InstrumentSettings) -> AppResult<()> {
        self.faults.check("apply_settings")?;
        if let Some(position) = settings.beam_position {
            if position < 0.0 || position >= f64::from(self.rows) {
                return Err(DaqError::Configuration(format!(
                    "beam position {position} outside 0..{}",
                    self.rows
                )));
            }
            self.position = position;
            if let Some(bench) = &self.bench {
                bench.set_beam_position(position);
            }
        }
        if let Some(column) = settings.grating_column {
            if column < 0.0 || column >= f64::from(self.columns) {
                return Err(DaqError::Configuration(format!(
                    "grating column {column} outside 0..{}",
                    self.columns
                )));
            }
            if let Some(bench) = &self.bench {
                bench.set_grating_column(column);
            }
        }
        Ok(())
    }

    async fn acquire(&mut self) -> AppResult<Vec<f64>> {
        self.faults.check("acquire")?;
        Ok(vec![self.position])
    }
}

// =============================================================================
// MockMonochromator
// =============================================================================

/// Mock monochromator; readback is the centre wavelength in nanometres.
pub struct MockMonochromator {
    center_nm: f64,
    faults: FaultInjector,
}

impl MockMonochromator {
    /// Monochromator parked at `center_nm`.
    pub fn new(center_nm: f64) -> Self {
        Self {
            center_nm,
            faults: FaultInjector::default(),
        }
    }

    /// Fault switchboard for this device.
    pub fn faults(&self) -> FaultInjector {
        self.faults.clone()
    }
}

#[async_trait]
impl Instrument for MockMonochromator {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Monochromator
    }

    async fn connect(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn apply_settings(&mut self, settings: &InstrumentSettings) -> AppResult<()> {
        self.faults.check("apply_settings")?;
        if let Some(center) = settings.center_wavelength_nm {
            // grating drive
            let travel = (center - self.center_nm).abs();
            sleep(Duration::from_micros((travel * 10.0) as u64)).await;
            self.center_nm = center;
        }
        Ok(())
    }

    async fn acquire(&mut self) -> AppResult<Vec<f64>> {
        self.faults.check("acquire")?;
        Ok(vec![self.center_nm])
    }
}

// =============================================================================
// MockOscilloscope
// =============================================================================

/// Mock oscilloscope returning a damped sine trace.
pub struct MockOscilloscope {
    points: usize,
    shots: u64,
    acquire_delay: Duration,
    faults: FaultInjector,
}

impl MockOscilloscope {
    /// Oscilloscope with `points` samples per trace.
    pub fn new(points: usize) -> Self {
        Self {
            points: points.max(1),
            shots: 0,
            acquire_delay: Duration::ZERO,
            faults: FaultInjector::default(),
        }
    }

    /// Add artificial latency to every acquisition.
    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = delay;
        self
    }

    /// Fault switchboard for this device.
    pub fn faults(&self) -> FaultInjector {
        self.faults.clone()
    }

    fn trace(&self) -> Vec<f64> {
        let phase = self.shots as f64 * 0.1;
        let mut rng = rand::thread_rng();
        (0..self.points)
            .map(|i| {
                let t = i as f64 / self.points as f64;
                (-(3.0 * t)).exp() * (40.0 * t + phase).sin() + rng.gen_range(-0.005..0.005)
            })
            .collect()
    }
}

#[async_trait]
impl Instrument for MockOscilloscope {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Oscilloscope
    }

    async fn connect(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn apply_settings(&mut self, _settings: &InstrumentSettings) -> AppResult<()> {
        self.faults.check("apply_settings")
    }

    async fn acquire(&mut self) -> AppResult<Vec<f64>> {
        self.faults.check("acquire")?;
        if !self.acquire_delay.is_zero() {
            sleep(self.acquire_delay).await;
        }
        self.shots += 1;
        Ok(self.trace())
    }
}

// =============================================================================
// MockCryostat - first-order thermal model
// =============================================================================

/// Mock cryostat.
///
/// The sample temperature relaxes towards `base_k + tau * gain * heater` with
/// time constant `tau`. The model is advanced in wall-clock time on every call,
/// using the exact exponential step so any call cadence is stable.
pub struct MockCryostat {
    temperature_k: f64,
    base_k: f64,
    tau: Duration,
    heater_gain_k_per_s: f64,
    heater_output: f64,
    last_update: Instant,
    faults: FaultInjector,
}

impl MockCryostat {
    /// Cryostat starting at `initial_k` with the heater off.
    pub fn new(initial_k: f64) -> Self {
        Self {
            temperature_k: initial_k,
            base_k: 4.0,
            tau: Duration::from_secs(2),
            heater_gain_k_per_s: 150.0,
            heater_output: 0.0,
            last_update: Instant::now(),
            faults: FaultInjector::default(),
        }
    }

    /// Cold-head temperature reached with the heater off.
    pub fn with_base_k(mut self, base_k: f64) -> Self {
        self.base_k = base_k;
        self
    }

    /// Thermal time constant.
    pub fn with_time_constant(mut self, tau: Duration) -> Self {
        self.tau = tau;
        self
    }

    /// Heating rate at full heater output.
    pub fn with_heater_gain(mut self, gain_k_per_s: f64) -> Self {
        self.heater_gain_k_per_s = gain_k_per_s;
        self
    }

    /// Fault switchboard for this device.
    pub fn faults(&self) -> FaultInjector {
        self.faults.clone()
    }

    fn advance(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        let tau = self.tau.as_secs_f64().max(1e-6);
        let equilibrium = self.base_k + tau * self.heater_gain_k_per_s * self.heater_output;
        self.temperature_k = equilibrium + (self.temperature_k - equilibrium) * (-dt / tau).exp();
    }
}

#[async_trait]
impl Instrument for MockCryostat {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Cryostat
    }

    async fn connect(&mut self) -> AppResult<()> {
        self.last_update = Instant::now();
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn apply_settings(&mut self, settings: &InstrumentSettings) -> AppResult<()> {
        self.faults.check("apply_settings")?;
        self.advance();
        if let Some(output) = settings.heater_output {
            self.heater_output = output.clamp(0.0, 1.0);
        }
        Ok(())
    }

    async fn acquire(&mut self) -> AppResult<Vec<f64>> {
        self.faults.check("acquire")?;
        self.advance();
        Ok(vec![self.temperature_k])
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_shutter_returns_dark_counts_only() {
        let mut spectro = MockSpectrometer::new(64);
        let open = spectro.acquire().await.unwrap();

        spectro.apply_settings(&InstrumentSettings::default().with_shutter(false))
            .await
            .unwrap();
        let dark = spectro.acquire().await.unwrap();

        let open_sum: f64 = open.iter().sum();
        let dark_sum: f64 = dark.iter().sum();
        assert!(open_sum > dark_sum + 1000.0, "open {open_sum} dark {dark_sum}");
        assert!(dark.iter().all(|v| (*v - 100.0).abs() < 2.0));
    }

    #[tokio::test]
    async fn camera_frame_is_flattened() {
        let mut cam = MockSpectrometer::camera(32, 4);
        assert_eq!(cam.kind(), InstrumentKind::Camera);
        assert_eq!(cam.acquire().await.unwrap().len(), 128);
    }

    #[tokio::test]
    async fn fault_injector_counts_down() {
        let mut spectro = MockSpectrometer::new(8);
        let faults = spectro.faults();
        faults.fail_next(2);
        assert!(spectro.acquire().await.is_err());
        assert!(spectro.acquire().await.is_err());
        assert!(spectro.acquire().await.is_ok());

        faults.fail_always(true);
        assert!(spectro.acquire().await.is_err());
        faults.fail_always(false);
        assert!(spectro.acquire().await.is_ok());
        assert_eq!(faults.io_calls(), 5);
    }

    #[tokio::test]
    async fn fail_after_lets_calls_through_then_fails_for_good() {
        let mut slm = MockSlm::new(100);
        let faults = slm.faults();
        faults.fail_after(2);
        let to = |row| InstrumentSettings::default().with_beam_position(row);
        assert!(slm.apply_settings(&to(1.0)).await.is_ok());
        assert!(slm.apply_settings(&to(2.0)).await.is_ok());
        for row in [3.0, 4.0, 5.0] {
            let err = slm.apply_settings(&to(row)).await.unwrap_err();
            assert!(err.is_transient());
        }
        assert!(slm.acquire().await.is_err());
    }

    #[tokio::test]
    async fn slm_rejects_rows_outside_panel() {
        let bench = OpticalBench::new();
        let mut slm = MockSlm::new(100).with_bench(bench.clone());
        slm.apply_settings(&InstrumentSettings::default().with_beam_position(42.0))
            .await
            .unwrap();
        assert_eq!(slm.acquire().await.unwrap(), vec![42.0]);
        assert_eq!(bench.beam_position(), 42.0);

        let err = slm
            .apply_settings(&InstrumentSettings::default().with_beam_position(100.0))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[tokio::test]
    async fn beam_position_brightens_coupled_spectrum() {
        let bench = OpticalBench::new();
        let mut spectro = MockSpectrometer::new(128).with_bench(bench.clone());
        let low: f64 = spectro.acquire().await.unwrap().iter().sum();
        bench.set_beam_position(200.0);
        let high: f64 = spectro.acquire().await.unwrap().iter().sum();
        assert!(high > low);
    }

    #[tokio::test]
    async fn grating_column_moves_the_line_on_the_bench() {
        let bench = OpticalBench::new();
        let mut slm = MockSlm::new(1080).with_columns(1000).with_bench(bench.clone());
        let mut spectro = MockSpectrometer::new(401).with_bench(bench.clone());

        slm.apply_settings(&InstrumentSettings::default().with_grating_column(500.0))
            .await
            .unwrap();
        assert_eq!(bench.grating_column(), Some(500.0));
        let frame = spectro.acquire().await.unwrap();
        let peak = frame
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        // 1 nm bins from 400 nm; line at 600 + 0.1 * 500
        assert_eq!(peak, 250);

        let err = slm
            .apply_settings(&InstrumentSettings::default().with_grating_column(1000.0))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[tokio::test]
    async fn cryostat_relaxes_towards_heater_equilibrium() {
        let mut cryo = MockCryostat::new(10.0)
            .with_base_k(4.0)
            .with_time_constant(Duration::from_millis(20))
            .with_heater_gain(1000.0);
        cryo.apply_settings(&InstrumentSettings::default().with_heater_output(1.0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let t = cryo.acquire().await.unwrap()[0];
        // equilibrium = 4 + 0.02 * 1000 = 24 K
        assert!((t - 24.0).abs() < 0.5, "temperature {t}");
    }

    #[test]
    fn options_fill_defaults() {
        let table: toml::Table = toml::from_str("bins = 64\nacquire_delay_ms = 5").unwrap();
        let options = toml::Value::Table(table).try_into::<MockOptions>().unwrap();
        assert_eq!(options.bins, 64);
        assert_eq!(options.acquire_delay_ms, 5);
        assert_eq!(options.rows, 1080);
    }
}
