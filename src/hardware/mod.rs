//! Instrument layer.
//!
//! Every physical device of the rig plugs into the acquisition core through the
//! [`Instrument`] driver trait. Drivers know nothing about leases, workers or
//! channels; they only talk to hardware. The [`InstrumentHandle`] wraps one driver
//! and adds the shared concerns:
//!
//! - connection state tracking ([`ConnectionState`])
//! - the exclusive [`Lease`] that serialises command access between workers
//! - the merged settings snapshot ([`InstrumentSettings`])
//! - a `watch` channel carrying the most recent [`Sample`](crate::core::Sample)
//!
//! Handles are owned by a [`DeviceRegistry`] and injected into workers and
//! measurement jobs; nothing looks devices up through global state.
//!
//! # Example
//!
//! ```rust,no_run
//! use spectro_daq::hardware::{InstrumentHandle, InstrumentSettings};
//! use spectro_daq::hardware::mock::MockSpectrometer;
//! use std::sync::Arc;
//!
//! # async fn run() -> spectro_daq::error::AppResult<()> {
//! let handle = Arc::new(InstrumentHandle::new("spectrometer", MockSpectrometer::new(512)));
//! handle.connect().await?;
//! let lease = handle.try_lease("kinetic")?;
//! lease.apply_settings(&InstrumentSettings::default().with_exposure_ms(20.0)).await?;
//! let sample = lease.acquire().await?;
//! assert_eq!(sample.width(), 512);
//! # Ok(())
//! # }
//! ```

pub mod handle;
pub mod mock;
pub mod registry;

pub use handle::{ConnectionState, InstrumentHandle, Lease};
pub use registry::DeviceRegistry;

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The device families the rig knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// Fibre or grating spectrometer returning one spectrum per acquisition.
    Spectrometer,
    /// Imaging detector; frames are flattened row-major.
    Camera,
    /// Spatial light modulator used as the vertical beam positioner.
    Slm,
    /// Scanning monochromator; reports its centre wavelength.
    Monochromator,
    /// Oscilloscope returning one trace per acquisition.
    Oscilloscope,
    /// Temperature controlled cryostat; scalar temperature readback in kelvin.
    Cryostat,
}

impl InstrumentKind {
    /// Parse the `type` string used in instrument configuration.
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "spectrometer" | "mock_spectrometer" => Some(Self::Spectrometer),
            "camera" | "mock_camera" => Some(Self::Camera),
            "slm" | "mock_slm" | "beam_positioner" => Some(Self::Slm),
            "monochromator" | "mock_monochromator" => Some(Self::Monochromator),
            "oscilloscope" | "scope" | "mock_oscilloscope" => Some(Self::Oscilloscope),
            "cryostat" | "mock_cryostat" => Some(Self::Cryostat),
            _ => None,
        }
    }

    /// Whether acquisitions from this kind produce spectra that can be
    /// background-subtracted.
    pub fn is_spectral(&self) -> bool {
        matches!(self, Self::Spectrometer | Self::Camera)
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Spectrometer => "spectrometer",
            Self::Camera => "camera",
            Self::Slm => "slm",
            Self::Monochromator => "monochromator",
            Self::Oscilloscope => "oscilloscope",
            Self::Cryostat => "cryostat",
        };
        f.write_str(name)
    }
}

/// Spectral window assumed when a device has no `wavelength_range_nm` set.
pub const DEFAULT_WAVELENGTH_RANGE_NM: (f64, f64) = (400.0, 800.0);

/// Wavelength of bin `index` when `bins` bins span `range` linearly.
pub fn bin_wavelength(range: (f64, f64), bins: usize, index: usize) -> f64 {
    if bins < 2 {
        return range.0;
    }
    range.0 + (range.1 - range.0) * index as f64 / (bins - 1) as f64
}

/// Sparse device settings.
///
/// Every field is optional. Applying an overlay merges the fields that are set
/// into the handle's current settings and leaves the others untouched, so
/// applying the same overlay twice leaves the device in the same state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSettings {
    /// Integration time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure_ms: Option<f64>,
    /// Detector gain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain: Option<f64>,
    /// Spectral window `(start, end)` in nanometres.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wavelength_range_nm: Option<(f64, f64)>,
    /// Monochromator centre wavelength in nanometres.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center_wavelength_nm: Option<f64>,
    /// Light source shutter. `false` blocks the beam for background scans.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutter_open: Option<bool>,
    /// Beam position written to the SLM (row index).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beam_position: Option<f64>,
    /// Centre column of the grating stripe written to the SLM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grating_column: Option<f64>,
    /// Cryostat heater command, normalised to the controller output range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heater_output: Option<f64>,
    /// Hardware averages per acquisition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub averages: Option<u32>,
}

impl InstrumentSettings {
    /// Merge every field set in `overlay` into `self`.
    pub fn merge(&mut self, overlay: &InstrumentSettings) {
        fn take<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if let Some(v) = value {
                *slot = Some(v.clone());
            }
        }
        take(&mut self.exposure_ms, &overlay.exposure_ms);
        take(&mut self.gain, &overlay.gain);
        take(&mut self.wavelength_range_nm, &overlay.wavelength_range_nm);
        take(&mut self.center_wavelength_nm, &overlay.center_wavelength_nm);
        take(&mut self.shutter_open, &overlay.shutter_open);
        take(&mut self.beam_position, &overlay.beam_position);
        take(&mut self.grating_column, &overlay.grating_column);
        take(&mut self.heater_output, &overlay.heater_output);
        take(&mut self.averages, &overlay.averages);
    }

    /// Return `self` merged with `overlay`.
    pub fn merged(&self, overlay: &InstrumentSettings) -> Self {
        let mut out = self.clone();
        out.merge(overlay);
        out
    }

    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        *self == InstrumentSettings::default()
    }

    /// Builder: set the exposure.
    pub fn with_exposure_ms(mut self, exposure_ms: f64) -> Self {
        self.exposure_ms = Some(exposure_ms);
        self
    }

    /// Builder: set the shutter.
    pub fn with_shutter(mut self, open: bool) -> Self {
        self.shutter_open = Some(open);
        self
    }

    /// Builder: set the beam position.
    pub fn with_beam_position(mut self, position: f64) -> Self {
        self.beam_position = Some(position);
        self
    }

    /// Builder: set the grating stripe column.
    pub fn with_grating_column(mut self, column: f64) -> Self {
        self.grating_column = Some(column);
        self
    }

    /// Builder: set the heater output.
    pub fn with_heater_output(mut self, output: f64) -> Self {
        self.heater_output = Some(output);
        self
    }
}

/// Driver contract every physical device must satisfy.
///
/// Implementations only perform device I/O. Errors from the transport are
/// reported as [`DaqError::DeviceFault`](crate::error::DaqError::DeviceFault);
/// connection and lease bookkeeping is done by [`InstrumentHandle`].
#[async_trait]
pub trait Instrument: Send {
    /// Device family.
    fn kind(&self) -> InstrumentKind;

    /// Open the transport. Calling it on an open device is a no-op.
    async fn connect(&mut self) -> AppResult<()>;

    /// Close the transport.
    async fn disconnect(&mut self) -> AppResult<()>;

    /// Bring the device into the state described by `settings`.
    ///
    /// `settings` is always the complete merged snapshot, never a partial
    /// overlay, so drivers can apply it absolutely.
    async fn apply_settings(&mut self, settings: &InstrumentSettings) -> AppResult<()>;

    /// Take one reading.
    async fn acquire(&mut self) -> AppResult<Vec<f64>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_only_overwrites_set_fields() {
        let mut current = InstrumentSettings::default()
            .with_exposure_ms(10.0)
            .with_shutter(true);
        current.merge(&InstrumentSettings::default().with_shutter(false));
        assert_eq!(current.exposure_ms, Some(10.0));
        assert_eq!(current.shutter_open, Some(false));
    }

    #[test]
    fn merge_is_idempotent() {
        let base = InstrumentSettings::default().with_exposure_ms(5.0);
        let overlay = InstrumentSettings {
            gain: Some(2.0),
            wavelength_range_nm: Some((400.0, 700.0)),
            ..Default::default()
        };
        let once = base.merged(&overlay);
        let twice = once.merged(&overlay);
        assert_eq!(once, twice);
    }

    #[test]
    fn kind_parses_config_type_names() {
        assert_eq!(
            InstrumentKind::from_type_name("Mock_Spectrometer"),
            Some(InstrumentKind::Spectrometer)
        );
        assert_eq!(InstrumentKind::from_type_name("SLM"), Some(InstrumentKind::Slm));
        assert_eq!(InstrumentKind::from_type_name("laser"), None);
        assert!(InstrumentKind::Camera.is_spectral());
        assert!(!InstrumentKind::Cryostat.is_spectral());
    }

    #[test]
    fn bins_span_the_window_linearly() {
        assert_eq!(bin_wavelength((400.0, 800.0), 5, 0), 400.0);
        assert_eq!(bin_wavelength((400.0, 800.0), 5, 2), 600.0);
        assert_eq!(bin_wavelength((400.0, 800.0), 5, 4), 800.0);
        assert_eq!(bin_wavelength((500.0, 700.0), 1, 0), 500.0);
    }
}
