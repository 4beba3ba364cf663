//! Cryostat control loop integration tests
//!
//! The loop is configured and spawned the way the binary does it, then runs
//! beside measurement jobs on the same registry.

use spectro_daq::config::RigConfig;
use spectro_daq::cryostat::CryostatControlLoop;
use spectro_daq::error::DaqError;
use spectro_daq::hardware::DeviceRegistry;
use spectro_daq::measurement::{
    JobState, KineticLimit, KineticParams, MeasurementController, MeasurementRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const RIG: &str = r#"
    [acquisition]
    default_period_ms = 2

    [cryostat]
    enabled = true
    period_ms = 5
    kp = 0.1
    ti_s = 0.1
    initial_setpoint_k = 20.0
    tolerance_k = 1.0
    min_setpoint_k = 3.0
    max_setpoint_k = 300.0

    [[instruments]]
    id = "spectrometer"
    type = "spectrometer"
    config = { bins = 32 }

    [[instruments]]
    id = "cryostat"
    type = "cryostat"
    config = { initial_k = 10.0, base_k = 4.0, time_constant_s = 0.05, heater_gain_k_per_s = 1000.0 }
"#;

async fn registry(config: &RigConfig) -> anyhow::Result<Arc<DeviceRegistry>> {
    let registry = Arc::new(DeviceRegistry::from_config(&config.instruments)?);
    registry.connect_all().await?;
    Ok(registry)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loop_settles_and_follows_a_new_setpoint() -> anyhow::Result<()> {
    let config = RigConfig::from_toml_str(RIG)?;
    config.validate()?;
    let registry = registry(&config).await?;
    let cryostat = registry.get(&config.resolved_cryostat().expect("cryostat role"))?;

    let handle = CryostatControlLoop::spawn(&cryostat, config.cryostat_loop_config()?)?;
    let status = handle
        .wait_until_stable(Duration::from_millis(50), Duration::from_secs(5), None)
        .await?;
    assert!((status.temperature_k.expect("reading") - 20.0).abs() <= 1.0);

    handle.set_setpoint(30.0, 1.0)?;
    let status = handle
        .wait_until_stable(Duration::from_millis(50), Duration::from_secs(5), None)
        .await?;
    assert_eq!(status.setpoint.map(|s| s.target_k), Some(30.0));
    assert!(!handle.monitor().is_empty());

    let last = handle.stop().await;
    assert!(last.cycles > 0);
    assert_eq!(cryostat.lease_holder(), None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loop_runs_beside_a_kinetic_job() -> anyhow::Result<()> {
    let config = RigConfig::from_toml_str(RIG)?;
    let registry = registry(&config).await?;
    let cryostat = registry.get("cryostat")?;
    let handle = CryostatControlLoop::spawn(&cryostat, config.cryostat_loop_config()?)?;

    let controller =
        MeasurementController::new(Arc::clone(&registry), config.measurement_settings());
    let mut params = KineticParams::new(KineticLimit::Count { samples: 20 });
    params.override_background = true;
    params.persist = false;
    let id = controller.start(MeasurementRequest::Kinetic(params))?;
    let before = handle.status().cycles;
    let report = controller.wait(&id).await?;

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.samples, 20);
    assert!(handle.status().cycles > before);
    assert!(handle.is_running());
    handle.stop().await;
    Ok(())
}

#[tokio::test]
async fn unsafe_setpoints_are_rejected_and_waits_can_be_cancelled() -> anyhow::Result<()> {
    let config = RigConfig::from_toml_str(RIG)?;
    let registry = registry(&config).await?;
    let cryostat = registry.get("cryostat")?;
    let handle = CryostatControlLoop::spawn(&cryostat, config.cryostat_loop_config()?)?;

    assert!(matches!(
        handle.set_setpoint(500.0, 1.0),
        Err(DaqError::PreconditionFailed(_))
    ));
    assert_eq!(handle.setpoint().target_k, 20.0);

    // 250 K is out of the heater's reach in this model
    handle.set_setpoint(250.0, 0.1)?;
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let wait = handle.wait_until_stable(
        Duration::from_millis(50),
        Duration::from_secs(10),
        Some(cancel_rx),
    );
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_tx.send_replace(true);
    };
    let (result, ()) = tokio::join!(wait, cancel);
    assert!(matches!(result, Err(DaqError::Cancelled)));

    handle.stop().await;
    Ok(())
}
