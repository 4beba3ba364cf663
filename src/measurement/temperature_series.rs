//! Temperature series.
//!
//! For each temperature the job moves the attached cryostat loop's setpoint,
//! waits until the temperature has held inside the band, then averages a
//! fixed number of spectra. The cryostat keeps the last setpoint afterwards.
//! A stop ends the series at the next temperature boundary, or mid-average
//! with a partial point, and still completes the job with what was taken.

use super::controller::ControllerShared;
use super::job::{raised, Ending, JobContext, PersistPipe};
use super::stream::{period, resolve_spectral};
use super::{JobResult, TemperaturePoint, TemperatureSeriesParams};
use crate::acquisition::{AcquisitionConfig, AcquisitionLimit, SampleTransform};
use crate::core::{average_payloads, SharedSample};
use crate::cryostat::{CryostatControl, CryostatSetpoint};
use crate::error::{AppResult, DaqError};
use crate::hardware::{InstrumentHandle, InstrumentSettings};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub(crate) struct TemperatureSeriesPlan {
    handle: Arc<InstrumentHandle>,
    cryostat: CryostatControl,
    temperatures_k: Vec<f64>,
    tolerance_k: f64,
    hold: Duration,
    timeout: Duration,
    spectra: u32,
    period: Duration,
    settings: InstrumentSettings,
    transform: Option<SampleTransform>,
    persist: bool,
}

pub(crate) fn validate(
    params: &TemperatureSeriesParams,
    shared: &ControllerShared,
) -> AppResult<TemperatureSeriesPlan> {
    let cryostat = shared.cryostat.lock().clone().ok_or_else(|| {
        DaqError::PreconditionFailed("no cryostat control loop attached".into())
    })?;
    if !cryostat.is_running() {
        return Err(DaqError::PreconditionFailed(format!(
            "cryostat loop on '{}' has stopped",
            cryostat.device_id()
        )));
    }
    if params.temperatures_k.is_empty() {
        return Err(DaqError::PreconditionFailed(
            "temperature series needs at least one temperature".into(),
        ));
    }
    for &target_k in &params.temperatures_k {
        cryostat.config().validate_setpoint(&CryostatSetpoint {
            target_k,
            tolerance_k: params.tolerance_k,
        })?;
    }
    if params.spectra == 0 {
        return Err(DaqError::PreconditionFailed(
            "at least one spectrum per temperature is needed".into(),
        ));
    }
    let timeout = Duration::try_from_secs_f64(params.timeout_s)
        .ok()
        .filter(|t| !t.is_zero())
        .ok_or_else(|| {
            DaqError::PreconditionFailed(format!(
                "stabilisation timeout {} s is not a positive duration",
                params.timeout_s
            ))
        })?;

    let (handle, transform) = resolve_spectral(
        params.device.as_deref(),
        params.correction,
        params.override_background,
        params.persist,
        shared,
    )?;
    Ok(TemperatureSeriesPlan {
        handle,
        cryostat,
        temperatures_k: params.temperatures_k.clone(),
        tolerance_k: params.tolerance_k,
        hold: Duration::from_millis(params.hold_ms),
        timeout,
        spectra: params.spectra,
        period: period(params.period_ms, shared),
        settings: params.settings.clone(),
        transform,
        persist: params.persist,
    })
}

pub(crate) async fn run(plan: TemperatureSeriesPlan, ctx: &mut JobContext) -> AppResult<JobResult> {
    let pipe = if plan.persist {
        Some(ctx.open_persistence(&[&plan.handle])?)
    } else {
        None
    };
    let measured = measure(&plan, ctx, pipe.as_ref()).await;
    ctx.finish_persistence(pipe).await;

    Ok(JobResult::TemperatureSeries {
        device: plan.handle.id().to_string(),
        points: measured?,
    })
}

async fn measure(
    plan: &TemperatureSeriesPlan,
    ctx: &mut JobContext,
    pipe: Option<&PersistPipe>,
) -> AppResult<Vec<TemperaturePoint>> {
    let total = plan.temperatures_k.len();
    let share = 100.0 / total as f64;
    let mut points = Vec::with_capacity(total);
    let mut stop = ctx.signals.stop.clone();

    for (i, &target_k) in plan.temperatures_k.iter().enumerate() {
        ctx.wait_while_paused().await?;
        if ctx.cancel_requested() {
            return Err(DaqError::Cancelled);
        }
        if ctx.stop_requested() {
            info!(job_id = %ctx.id, done = i, total, "Temperature series stopped early");
            break;
        }

        plan.cryostat.set_setpoint(target_k, plan.tolerance_k)?;
        info!(job_id = %ctx.id, target_k, "Waiting for temperature");
        let cancel = ctx.signals.cancel.clone();
        let status = tokio::select! {
            status = plan.cryostat.wait_until_stable(plan.hold, plan.timeout, Some(cancel)) => status?,
            _ = raised(&mut stop) => {
                info!(job_id = %ctx.id, done = i, total, "Temperature series stopped while settling");
                break;
            }
        };

        let start = i as f64 * share;
        ctx.begin_segment(start, start + share);
        let mut config = AcquisitionConfig::new(plan.period)
            .with_retry(ctx.shared.settings.retry.clone())
            .with_limit(AcquisitionLimit::Count(u64::from(plan.spectra)));
        if !plan.settings.is_empty() {
            config = config.with_settings(plan.settings.clone());
        }
        if let Some(transform) = &plan.transform {
            config = config.with_transform(Arc::clone(transform));
        }

        let mut spectra: Vec<SharedSample> = Vec::with_capacity(plan.spectra as usize);
        let outputs = ctx.outputs(pipe);
        let driven = ctx
            .drive_worker(&plan.handle, outputs, config, |s| spectra.push(Arc::clone(s)))
            .await?;
        let ending = driven.ending;
        driven.into_result()?;

        if let Some(payload) = average_payloads(spectra.iter().map(Arc::as_ref)) {
            info!(
                job_id = %ctx.id,
                target_k,
                temperature_k = ?status.temperature_k,
                spectra = spectra.len(),
                "Temperature point taken"
            );
            points.push(TemperaturePoint {
                target_k,
                temperature_k: status.temperature_k,
                spectra: u32::try_from(spectra.len()).unwrap_or(u32::MAX),
                payload,
            });
        }
        if ending == Ending::Stopped {
            break;
        }
        ctx.set_progress(start + share);
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use crate::cryostat::{
        CryostatControlLoop, CryostatLoopConfig, CryostatLoopHandle, CryostatSetpoint,
        PiController,
    };
    use crate::data::MemorySink;
    use crate::error::DaqError;
    use crate::error_recovery::RetryPolicy;
    use crate::hardware::mock::{MockCryostat, MockSpectrometer};
    use crate::hardware::{DeviceRegistry, InstrumentHandle};
    use crate::measurement::{
        JobResult, JobState, MeasurementController, MeasurementRequest, MeasurementSettings,
        TemperatureSeriesParams,
    };
    use std::sync::Arc;
    use std::time::Duration;

    struct Rig {
        controller: MeasurementController,
        sink: MemorySink,
        cryo: CryostatLoopHandle,
    }

    // plant reaches 4..54 K within a few tens of milliseconds
    async fn rig() -> Rig {
        let mut registry = DeviceRegistry::new();
        registry
            .insert(InstrumentHandle::new("spectrometer", MockSpectrometer::new(16)))
            .unwrap();
        registry
            .insert(InstrumentHandle::new(
                "cryostat",
                MockCryostat::new(10.0)
                    .with_base_k(4.0)
                    .with_time_constant(Duration::from_millis(50))
                    .with_heater_gain(1000.0),
            ))
            .unwrap();
        registry.connect_all().await.unwrap();

        let config = CryostatLoopConfig {
            period: Duration::from_millis(5),
            controller: PiController::new(0.1, 0.1, 0.0, 1.0).unwrap(),
            initial_setpoint: CryostatSetpoint {
                target_k: 10.0,
                tolerance_k: 1.0,
            },
            min_setpoint_k: 3.0,
            max_setpoint_k: 300.0,
            monitor_capacity: 16,
        };
        let cryo = CryostatControlLoop::spawn(&registry.get("cryostat").unwrap(), config).unwrap();

        let settings = MeasurementSettings {
            default_period: Duration::from_millis(2),
            retry: RetryPolicy::fixed(1, Duration::from_millis(1)),
            ..MeasurementSettings::default()
        };
        let sink = MemorySink::new();
        let controller = MeasurementController::new(Arc::new(registry), settings)
            .with_sink_factory(sink.factory());
        controller.attach_cryostat(cryo.control());
        Rig {
            controller,
            sink,
            cryo,
        }
    }

    fn series(temperatures_k: Vec<f64>) -> TemperatureSeriesParams {
        let mut params = TemperatureSeriesParams::new(temperatures_k);
        params.override_background = true;
        params.tolerance_k = 1.0;
        params.hold_ms = 20;
        params.timeout_s = 5.0;
        params
    }

    #[tokio::test]
    async fn spectra_are_averaged_at_each_stable_temperature() {
        let rig = rig().await;
        let mut params = series(vec![15.0, 25.0]);
        params.spectra = 3;
        let id = rig
            .controller
            .start(MeasurementRequest::TemperatureSeries(params))
            .unwrap();
        let report = rig.controller.wait(&id).await.unwrap();

        assert_eq!(report.state, JobState::Completed);
        let Some(JobResult::TemperatureSeries { device, points }) = report.result else {
            panic!("expected a temperature series result");
        };
        assert_eq!(device, "spectrometer");
        assert_eq!(points.len(), 2);
        for (point, target) in points.iter().zip([15.0, 25.0]) {
            assert_eq!(point.target_k, target);
            assert!((point.temperature_k.unwrap() - target).abs() <= 1.0);
            assert_eq!(point.spectra, 3);
            assert_eq!(point.payload.len(), 16);
        }
        assert_eq!(report.samples, 6);
        assert_eq!(rig.sink.records_for(&id).len(), 6);
        assert_eq!(rig.cryo.setpoint().target_k, 25.0);
        assert_eq!(
            rig.controller.registry().get("spectrometer").unwrap().lease_holder(),
            None
        );
        rig.cryo.stop().await;
    }

    #[tokio::test]
    async fn series_is_rejected_without_a_usable_cryostat() {
        let rig = rig().await;
        let err = rig
            .controller
            .start(MeasurementRequest::TemperatureSeries(series(vec![20.0, 500.0])))
            .unwrap_err();
        assert!(matches!(err, DaqError::PreconditionFailed(_)));

        let mut params = series(vec![20.0]);
        params.override_background = false;
        let err = rig
            .controller
            .start(MeasurementRequest::TemperatureSeries(params))
            .unwrap_err();
        assert!(matches!(err, DaqError::PreconditionFailed(_)));

        let control = rig.controller.detach_cryostat().unwrap();
        let err = rig
            .controller
            .start(MeasurementRequest::TemperatureSeries(series(vec![20.0])))
            .unwrap_err();
        assert!(matches!(err, DaqError::PreconditionFailed(_)));

        rig.controller.attach_cryostat(control);
        rig.cryo.stop().await;
        let err = rig
            .controller
            .start(MeasurementRequest::TemperatureSeries(series(vec![20.0])))
            .unwrap_err();
        assert!(matches!(err, DaqError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn unreachable_temperature_fails_the_job() {
        let rig = rig().await;
        let mut params = series(vec![250.0]);
        params.timeout_s = 0.1;
        let id = rig
            .controller
            .start(MeasurementRequest::TemperatureSeries(params))
            .unwrap();
        let report = rig.controller.wait(&id).await.unwrap();
        assert_eq!(report.state, JobState::Failed);
        assert!(matches!(report.error, Some(DaqError::PreconditionFailed(_))));
        assert_eq!(report.samples, 0);
        rig.cryo.stop().await;
    }

    #[tokio::test]
    async fn stop_while_settling_keeps_the_points_taken() {
        let rig = rig().await;
        let mut params = series(vec![15.0, 250.0]);
        params.spectra = 2;
        params.timeout_s = 30.0;
        let id = rig
            .controller
            .start(MeasurementRequest::TemperatureSeries(params))
            .unwrap();
        while rig.controller.status(&id).unwrap().samples < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let report = rig.controller.stop(&id).await.unwrap();

        assert_eq!(report.state, JobState::Completed);
        let Some(JobResult::TemperatureSeries { points, .. }) = report.result else {
            panic!("expected a temperature series result");
        };
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].target_k, 15.0);
        rig.cryo.stop().await;
    }

    #[tokio::test]
    async fn cancel_while_settling_cancels_the_job() {
        let rig = rig().await;
        let mut params = series(vec![250.0]);
        params.timeout_s = 30.0;
        let id = rig
            .controller
            .start(MeasurementRequest::TemperatureSeries(params))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = rig.controller.cancel(&id).await.unwrap();
        assert_eq!(report.state, JobState::Cancelled);
        assert!(report.result.is_none());
        rig.cryo.stop().await;
    }
}
