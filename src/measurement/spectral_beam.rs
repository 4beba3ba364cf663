//! Spectral beam calibration.
//!
//! A grating stripe is written at each SLM column in turn and the wavelength
//! of the strongest bin of the resulting spectrum is taken as the wavelength
//! that column diffracts onto the detector. Peaks outside the requested
//! window are noise and are dropped; the remaining pairs are fitted with a
//! polynomial that is stored on the controller.

use super::controller::ControllerShared;
use super::job::JobContext;
use super::scan::{check_finite, Scan, ScanDevices};
use super::{JobResult, SpectralCalibrationParams};
use crate::calibration::{CalibrationEngine, MIN_FIT_POINTS};
use crate::core::Sample;
use crate::error::{AppResult, DaqError};
use crate::hardware::{bin_wavelength, InstrumentSettings, DEFAULT_WAVELENGTH_RANGE_NM};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub(crate) struct SpectralCalibrationPlan {
    devices: ScanDevices,
    columns: Vec<f64>,
    settle: Duration,
    bounds_nm: (f64, f64),
    degree: usize,
    settings: InstrumentSettings,
    persist: bool,
}

pub(crate) fn validate(
    params: &SpectralCalibrationParams,
    shared: &ControllerShared,
) -> AppResult<SpectralCalibrationPlan> {
    let devices = ScanDevices::resolve(
        params.spectrometer.as_deref(),
        params.positioner.as_deref(),
        shared,
    )?;
    if params.degree == 0 {
        return Err(DaqError::PreconditionFailed(
            "polynomial degree must be at least 1".into(),
        ));
    }
    let (low, high) = params.wavelength_bounds_nm;
    if !(low.is_finite() && high.is_finite() && low < high) {
        return Err(DaqError::PreconditionFailed(format!(
            "wavelength bounds {low}..{high} are empty"
        )));
    }
    let needed = shared
        .settings
        .calibration_min_points
        .max(MIN_FIT_POINTS)
        .max(params.degree + 1);
    if params.columns.len() < needed {
        return Err(DaqError::InsufficientPoints {
            got: params.columns.len(),
            needed,
        });
    }
    check_finite(&params.columns, "grating column")?;
    shared.require_sink(params.persist)?;

    Ok(SpectralCalibrationPlan {
        devices,
        columns: params.columns.clone(),
        settle: params
            .settle_ms
            .map_or(shared.settings.settle, Duration::from_millis),
        bounds_nm: params.wavelength_bounds_nm,
        degree: params.degree,
        settings: params.settings.clone(),
        persist: params.persist,
    })
}

pub(crate) async fn run(
    plan: SpectralCalibrationPlan,
    ctx: &mut JobContext,
) -> AppResult<JobResult> {
    let (spectrometer, positioner) = plan.devices.lease(ctx)?;
    let pipe = if plan.persist {
        Some(ctx.open_persistence(&[&plan.devices.spectrometer, &plan.devices.positioner])?)
    } else {
        None
    };

    let range = plan
        .settings
        .wavelength_range_nm
        .or(spectrometer.read_settings().wavelength_range_nm)
        .unwrap_or(DEFAULT_WAVELENGTH_RANGE_NM);
    let (low, high) = plan.bounds_nm;
    let mut columns = Vec::with_capacity(plan.columns.len());
    let mut wavelengths = Vec::with_capacity(plan.columns.len());
    let job_id = ctx.id.clone();
    let scan = Scan {
        spectrometer: &spectrometer,
        positioner: &positioner,
        settings: &plan.settings,
        settle: plan.settle,
    };
    let scanned = scan
        .run(
            ctx,
            &plan.columns,
            pipe.as_ref(),
            |column| InstrumentSettings::default().with_grating_column(column),
            |column, spectrum| {
                let (index, _) = spectrum.peak()?;
                let wavelength = bin_wavelength(range, spectrum.width(), index);
                if !(low..=high).contains(&wavelength) {
                    debug!(job_id = %job_id, column, wavelength, "Peak outside bounds, skipping column");
                    return None;
                }
                debug!(job_id = %job_id, column, wavelength, "Spectral calibration point");
                columns.push(column);
                wavelengths.push(wavelength);
                Some(Sample::clone(spectrum))
            },
        )
        .await;
    drop(positioner);
    drop(spectrometer);
    ctx.finish_persistence(pipe).await;

    scanned?;
    let engine = CalibrationEngine::new(ctx.shared.settings.calibration_min_points, "nm");
    let calibration = engine.fit_spectral(&columns, &wavelengths, plan.bounds_nm, plan.degree)?;
    info!(
        job_id = %ctx.id,
        points = calibration.columns.len(),
        degree = plan.degree,
        r_squared = calibration.fit.r_squared,
        "Spectral calibration stored"
    );
    *ctx.shared.spectral_calibration.lock() = Some(Arc::new(calibration.clone()));
    Ok(JobResult::SpectralCalibration(calibration))
}
