//! Measurement controller integration tests
//!
//! Runs whole job sequences against a mock rig built from configuration, the
//! way the `spectro-daq demo` command does.

use spectro_daq::config::RigConfig;
use spectro_daq::data::MemorySink;
use spectro_daq::error::DaqError;
use spectro_daq::hardware::DeviceRegistry;
use spectro_daq::measurement::{
    BackgroundParams, CalibrationParams, JobResult, JobState, JobStatus, KineticLimit,
    KineticParams, MeasurementController, MeasurementKind, MeasurementRequest, RunParams,
    StatusCallback, ViewParams,
};
use std::sync::Arc;
use std::time::Duration;

const RIG: &str = r#"
    [acquisition]
    default_period_ms = 2

    [acquisition.retry]
    max_attempts = 2
    backoff_ms = 1
    max_backoff_ms = 2

    [calibration]
    settle_ms = 1

    [[instruments]]
    id = "spectrometer"
    type = "spectrometer"
    config = { bins = 64 }

    [[instruments]]
    id = "slm"
    type = "slm"
    config = { rows = 600 }

    [[instruments]]
    id = "cryostat"
    type = "cryostat"
"#;

async fn rig() -> anyhow::Result<(MeasurementController, MemorySink)> {
    let config = RigConfig::from_toml_str(RIG)?;
    config.validate()?;
    let registry = Arc::new(DeviceRegistry::from_config(&config.instruments)?);
    registry.connect_all().await?;
    let sink = MemorySink::new();
    let controller = MeasurementController::new(registry, config.measurement_settings())
        .with_sink_factory(sink.factory());
    Ok((controller, sink))
}

#[tokio::test]
async fn background_then_kinetic_subtracts_the_baseline() -> anyhow::Result<()> {
    let (controller, sink) = rig().await?;

    let bg = controller.start(MeasurementRequest::Background(BackgroundParams {
        scans: 3,
        ..BackgroundParams::default()
    }))?;
    let bg = controller.wait(&bg).await?;
    assert_eq!(bg.state, JobState::Completed);
    assert!(controller.baseline("spectrometer").is_some());

    let mut params = KineticParams::new(KineticLimit::Count { samples: 8 });
    params.comments = "integration".into();
    let id = controller.start(MeasurementRequest::Kinetic(params))?;
    let report = controller.wait(&id).await?;

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.samples, 8);
    assert_eq!(report.kind, MeasurementKind::Kinetic);
    let records = sink.records_for(&id);
    assert_eq!(records.len(), 8);
    // dark level removed: off-peak bins sit near zero
    assert!(records.iter().all(|r| r.payload[0].abs() < 20.0));

    let metadata = sink.metadata();
    let meta = metadata
        .iter()
        .find(|m| m.job_id == id.as_str())
        .expect("kinetic metadata");
    assert_eq!(meta.comments, "integration");
    assert!(meta.instruments.contains_key("spectrometer"));
    Ok(())
}

#[tokio::test]
async fn kinetic_without_background_fails_and_is_published() -> anyhow::Result<()> {
    let (controller, _) = rig().await?;
    let mut updates = controller.subscribe();

    let err = controller
        .start(MeasurementRequest::Kinetic(KineticParams::new(
            KineticLimit::Duration { seconds: 1.0 },
        )))
        .unwrap_err();
    assert!(matches!(err, DaqError::PreconditionFailed(_)));

    let mut states = Vec::new();
    while let Ok(status) = updates.try_recv() {
        states.push(status.state);
        if let Some(report) = status.report {
            assert!(matches!(report.error, Some(DaqError::PreconditionFailed(_))));
        }
    }
    assert_eq!(
        states,
        vec![JobState::Created, JobState::Validating, JobState::Failed]
    );
    Ok(())
}

#[tokio::test]
async fn oversized_kinetic_duration_is_rejected_before_start() -> anyhow::Result<()> {
    let (controller, _) = rig().await?;
    let mut params = KineticParams::new(KineticLimit::Duration { seconds: 1e20 });
    params.override_background = true;

    let err = controller
        .start(MeasurementRequest::Kinetic(params))
        .unwrap_err();
    assert!(matches!(err, DaqError::PreconditionFailed(_)));
    assert!(controller.active_jobs().is_empty());
    Ok(())
}

#[tokio::test]
async fn busy_device_rejects_a_second_job() -> anyhow::Result<()> {
    let (controller, _) = rig().await?;
    let view = controller.start(MeasurementRequest::View(ViewParams::default()))?;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = controller
        .start(MeasurementRequest::Run(RunParams {
            override_background: true,
            ..RunParams::default()
        }))
        .unwrap_err();
    assert!(matches!(err, DaqError::Busy { .. }));

    controller.stop(&view).await?;
    let run = controller.start(MeasurementRequest::Run(RunParams {
        override_background: true,
        ..RunParams::default()
    }))?;
    let report = controller.stop(&run).await?;
    assert_eq!(report.state, JobState::Completed);
    Ok(())
}

#[tokio::test]
async fn calibration_on_shared_bench_is_monotonic() -> anyhow::Result<()> {
    let (controller, sink) = rig().await?;
    let mut params = CalibrationParams::linear(0.0, 599.0, 7);
    params.persist = true;
    let id = controller.start(MeasurementRequest::Calibration(params))?;
    let report = controller.wait(&id).await?;

    assert_eq!(report.state, JobState::Completed, "{:?}", report.error);
    let Some(JobResult::Calibration(result)) = report.result else {
        panic!("expected a calibration result");
    };
    assert_eq!(result.points.len(), 7);
    assert!(result.linear.r_squared.is_finite());
    let stored = controller.calibration().expect("stored calibration");
    assert_eq!(stored.points, result.points);

    let records = sink.records_for(&id);
    assert_eq!(records.len(), 7);
    assert!(records.iter().all(|r| r.channel == "slm" && r.payload.len() == 2));
    Ok(())
}

#[tokio::test]
async fn callback_and_broadcast_see_the_same_terminal_status() -> anyhow::Result<()> {
    let (controller, _) = rig().await?;
    let seen: Arc<parking_lot::Mutex<Vec<JobStatus>>> = Arc::default();
    let callback: StatusCallback = {
        let seen = Arc::clone(&seen);
        Arc::new(move |status: &JobStatus| seen.lock().push(status.clone()))
    };
    controller.set_status_callback(Some(callback));
    let mut updates = controller.subscribe();

    let id = controller.start(MeasurementRequest::Background(BackgroundParams {
        scans: 2,
        ..BackgroundParams::default()
    }))?;
    let report = controller.wait(&id).await?;

    let mut last = None;
    while let Ok(status) = updates.try_recv() {
        last = Some(status);
    }
    let last = last.expect("broadcast updates");
    assert_eq!(last.state, JobState::Completed);
    assert_eq!(last.report.as_ref(), Some(&report));

    let seen = seen.lock();
    let terminal: Vec<_> = seen.iter().filter(|s| s.state.is_terminal()).collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].report.as_ref(), Some(&report));
    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_every_active_job() -> anyhow::Result<()> {
    let (controller, _) = rig().await?;
    let view = controller.start(MeasurementRequest::View(ViewParams::default()))?;
    assert_eq!(controller.active_jobs(), vec![view.clone()]);

    let reports = controller.shutdown().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].state, JobState::Cancelled);
    assert!(controller.active_jobs().is_empty());
    assert_eq!(controller.forget_finished(), 1);
    assert!(matches!(
        controller.status(&view),
        Err(DaqError::UnknownJob(_))
    ));
    Ok(())
}
