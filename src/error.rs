//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the acquisition core.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur while driving instruments, moving samples through
//! channels, persisting records, and sequencing measurement jobs.
//!
//! ## Error Hierarchy
//!
//! - **Device errors**: `NotConnected`, `Busy`, `DeviceFault`. Only `DeviceFault` is
//!   transient; acquisition workers retry it locally with backoff before escalating.
//! - **Pipeline errors**: `PersistFault`, `ChannelClosed`, `Storage`. A persistence
//!   fault never aborts acquisition; it is accumulated and reported when the job ends.
//! - **Measurement errors**: `InsufficientPoints`, `NonMonotonicInput`,
//!   `PreconditionFailed`, `AlreadyRunning`, `InvalidState`, `Cancelled`.
//! - **Setup errors**: `Configuration`, `UnknownDevice`, `UnknownJob`.
//!
//! `DaqError` is `Clone` so it can travel inside broadcast status messages. Sources
//! such as `std::io::Error` are therefore captured by message.

use serde::Serialize;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition core.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DaqError {
    /// The device has not been connected yet (or was disconnected).
    #[error("Device '{0}' is not connected")]
    NotConnected(String),

    /// The device lease is held by another worker.
    ///
    /// **Recovery Strategy**: wait for the holder to stop, or cancel the job that owns it.
    #[error("Device '{device}' is busy (leased by {holder})")]
    Busy {
        /// Device identifier.
        device: String,
        /// Owner label of the current lease.
        holder: String,
    },

    /// I/O or timeout error while talking to the hardware.
    ///
    /// **Error Type**: Transient. Workers retry up to their `RetryPolicy` bound before
    /// escalating to the owning measurement job.
    #[error("Device '{device}' fault: {message}")]
    DeviceFault {
        /// Device identifier.
        device: String,
        /// Driver supplied description.
        message: String,
    },

    /// A batch could not be written to durable storage.
    ///
    /// **Error Type**: Non-fatal to acquisition. Accumulated in the job report.
    #[error("Persistence fault: {0}")]
    PersistFault(String),

    /// A calibration run produced too few valid points.
    #[error("Insufficient calibration points: got {got}, need at least {needed}")]
    InsufficientPoints {
        /// Number of valid points collected.
        got: usize,
        /// Minimum required.
        needed: usize,
    },

    /// Calibration input is not monotonic in the independent variable.
    #[error("Non-monotonic calibration input at index {index}")]
    NonMonotonicInput {
        /// Index of the first offending point.
        index: usize,
    },

    /// A worker or loop was started while not idle.
    #[error("Worker '{0}' is already running")]
    AlreadyRunning(String),

    /// A measurement precondition was not met during validation.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// An operation was attempted in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// Push on a closed data channel.
    #[error("Data channel '{0}' is closed")]
    ChannelClosed(String),

    /// No device with this id is registered.
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    /// No job with this id is known to the controller.
    #[error("Unknown measurement job '{0}'")]
    UnknownJob(String),

    /// Configuration values parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Storage backend error outside a running persistence worker.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl DaqError {
    /// Build a `DeviceFault` for `device`.
    pub fn device_fault(device: impl Into<String>, message: impl Into<String>) -> Self {
        DaqError::DeviceFault {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Whether the error is worth retrying locally.
    pub fn is_transient(&self) -> bool {
        matches!(self, DaqError::DeviceFault { .. })
    }

    /// Short machine-friendly label for logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            DaqError::NotConnected(_) => "not_connected",
            DaqError::Busy { .. } => "busy",
            DaqError::DeviceFault { .. } => "device_fault",
            DaqError::PersistFault(_) => "persist_fault",
            DaqError::InsufficientPoints { .. } => "insufficient_points",
            DaqError::NonMonotonicInput { .. } => "non_monotonic_input",
            DaqError::AlreadyRunning(_) => "already_running",
            DaqError::PreconditionFailed(_) => "precondition_failed",
            DaqError::InvalidState(_) => "invalid_state",
            DaqError::Cancelled => "cancelled",
            DaqError::ChannelClosed(_) => "channel_closed",
            DaqError::UnknownDevice(_) => "unknown_device",
            DaqError::UnknownJob(_) => "unknown_job",
            DaqError::Configuration(_) => "configuration",
            DaqError::Storage(_) => "storage",
        }
    }
}

impl From<std::io::Error> for DaqError {
    fn from(err: std::io::Error) -> Self {
        DaqError::Storage(err.to_string())
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Configuration(err.to_string())
    }
}
