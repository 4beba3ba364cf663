//! # Spectro DAQ Core Library
//!
//! Acquisition and measurement coordination for an optical spectroscopy rig:
//! a spectrometer (or camera), a spatial light modulator steering the beam, and
//! a temperature-controlled cryostat. The crate owns the concurrency between
//! instrument I/O, data movement, persistence and measurement sequencing; the
//! binary (`main.rs`) is a thin CLI that drives it against simulated hardware.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: the `Instrument` driver trait, `InstrumentHandle` with its
//!   exclusive lease, the `DeviceRegistry`, and mock drivers for every device family.
//! - **`acquisition`**: `AcquisitionWorker`, the task that acquires from one leased
//!   device at a fixed period and fans samples out to its channels.
//! - **`data`**: bounded `DataChannel`s with explicit overflow policy, the
//!   `RecordSink` trait with CSV and in-memory sinks, and the `PersistenceWorker`.
//! - **`measurement`**: `MeasurementController` and the job kinds it sequences
//!   (background, calibration, spectral calibration, kinetic, run, view,
//!   temperature series).
//! - **`cryostat`**: the PI temperature control loop that runs beside all jobs.
//! - **`calibration`**: the pure vertical and spectral beam calibration fits.
//! - **`config`** / **`logging`**: figment-based rig configuration and the tracing
//!   subscriber setup.
//! - **`error`** / **`error_recovery`**: the `DaqError` taxonomy and retry policy.
//!
//! ## Data flow
//!
//! ```text
//!  Instrument ──lease──▶ AcquisitionWorker ──▶ DataChannel (live, drop_oldest) ──▶ viewers
//!                                   │
//!                                   └──────▶ DataChannel (persist, block) ──▶ PersistenceWorker ──▶ RecordSink
//! ```

pub mod acquisition;
pub mod calibration;
pub mod config;
pub mod core;
pub mod cryostat;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod logging;
pub mod measurement;

pub use error::{AppResult, DaqError};
