//! Instrument handle and lease.
//!
//! An [`InstrumentHandle`] owns one driver. Device I/O goes through a
//! `tokio::sync::Mutex` because it is held across `.await`; the bookkeeping
//! (connection flags, lease slot, settings snapshot) sits behind short
//! `parking_lot` locks that are never held across an await point.
//!
//! A [`Lease`] is the only mutual exclusion mechanism between workers touching
//! the same device. While a lease is outstanding, unleased callers and other
//! workers get [`DaqError::Busy`]. Dropping the lease frees the device.

use super::{Instrument, InstrumentKind, InstrumentSettings};
use crate::core::{Sample, SharedSample};
use crate::error::{AppResult, DaqError};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default bound on a single driver call.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Observable connection state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// `connect()` has not been called, or the device was disconnected.
    Disconnected,
    /// Connected and free.
    Connected,
    /// Connected and leased by a worker.
    Busy,
    /// The last driver call failed; the next successful call clears it.
    Faulted,
}

#[derive(Debug)]
struct LeaseSlot {
    id: u64,
    owner: String,
}

#[derive(Debug, Default)]
struct HandleState {
    connected: bool,
    faulted: bool,
    lease: Option<LeaseSlot>,
}

/// Shared wrapper around one physical device.
pub struct InstrumentHandle {
    id: String,
    kind: InstrumentKind,
    io_timeout: Duration,
    driver: tokio::sync::Mutex<Box<dyn Instrument>>,
    state: Mutex<HandleState>,
    settings: Mutex<InstrumentSettings>,
    latest: watch::Sender<Option<SharedSample>>,
    next_lease_id: AtomicU64,
}

impl fmt::Debug for InstrumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl InstrumentHandle {
    /// Wrap `driver` under the device id `id`.
    pub fn new(id: impl Into<String>, driver: impl Instrument + 'static) -> Self {
        Self::from_boxed(id, Box::new(driver))
    }

    /// Wrap an already boxed driver.
    pub fn from_boxed(id: impl Into<String>, driver: Box<dyn Instrument>) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            id: id.into(),
            kind: driver.kind(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            driver: tokio::sync::Mutex::new(driver),
            state: Mutex::new(HandleState::default()),
            settings: Mutex::new(InstrumentSettings::default()),
            latest,
            next_lease_id: AtomicU64::new(1),
        }
    }

    /// Override the per-call I/O timeout.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Device id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Device family.
    pub fn kind(&self) -> InstrumentKind {
        self.kind
    }

    /// Bound on a single driver call.
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        let state = self.state.lock();
        if !state.connected {
            ConnectionState::Disconnected
        } else if state.faulted {
            ConnectionState::Faulted
        } else if state.lease.is_some() {
            ConnectionState::Busy
        } else {
            ConnectionState::Connected
        }
    }

    /// Whether `connect()` succeeded and no disconnect followed.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Owner label of the outstanding lease, if any.
    pub fn lease_holder(&self) -> Option<String> {
        self.state.lock().lease.as_ref().map(|l| l.owner.clone())
    }

    /// Open the device.
    pub async fn connect(&self) -> AppResult<()> {
        let mut driver = self.driver.lock().await;
        self.with_timeout("connect", driver.connect()).await?;
        {
            let mut state = self.state.lock();
            state.connected = true;
            state.faulted = false;
        }
        info!(device = %self.id, kind = %self.kind, "Instrument connected");
        Ok(())
    }

    /// Close the device. Outstanding leases stay valid but every call through
    /// them fails with `NotConnected` until the device is connected again.
    pub async fn disconnect(&self) -> AppResult<()> {
        let mut driver = self.driver.lock().await;
        let result = self.with_timeout("disconnect", driver.disconnect()).await;
        self.state.lock().connected = false;
        info!(device = %self.id, "Instrument disconnected");
        result
    }

    /// Merged settings snapshot.
    pub fn read_settings(&self) -> InstrumentSettings {
        self.settings.lock().clone()
    }

    /// Apply a settings overlay without a lease. Fails with `Busy` while any
    /// worker holds the lease.
    pub async fn apply_settings(&self, overlay: &InstrumentSettings) -> AppResult<()> {
        self.apply_settings_as(None, overlay).await
    }

    /// Take one reading without a lease. Fails with `Busy` while any worker holds
    /// the lease.
    pub async fn acquire(&self) -> AppResult<SharedSample> {
        self.acquire_as(None).await
    }

    /// Claim the exclusive lease for `owner`.
    pub fn try_lease(self: &Arc<Self>, owner: impl Into<String>) -> AppResult<Lease> {
        let owner = owner.into();
        let mut state = self.state.lock();
        if let Some(slot) = &state.lease {
            return Err(DaqError::Busy {
                device: self.id.clone(),
                holder: slot.owner.clone(),
            });
        }
        let id = self.next_lease_id.fetch_add(1, Ordering::Relaxed);
        state.lease = Some(LeaseSlot {
            id,
            owner: owner.clone(),
        });
        debug!(device = %self.id, owner = %owner, "Lease granted");
        Ok(Lease {
            handle: Arc::clone(self),
            id,
            owner,
        })
    }

    /// Most recent sample acquired through this handle.
    pub fn latest(&self) -> Option<SharedSample> {
        self.latest.borrow().clone()
    }

    /// Subscribe to every new sample acquired through this handle.
    pub fn subscribe(&self) -> watch::Receiver<Option<SharedSample>> {
        self.latest.subscribe()
    }

    fn check_access(&self, lease_id: Option<u64>) -> AppResult<()> {
        let state = self.state.lock();
        if !state.connected {
            return Err(DaqError::NotConnected(self.id.clone()));
        }
        match (&state.lease, lease_id) {
            (None, _) => Ok(()),
            (Some(slot), Some(id)) if slot.id == id => Ok(()),
            (Some(slot), _) => Err(DaqError::Busy {
                device: self.id.clone(),
                holder: slot.owner.clone(),
            }),
        }
    }

    async fn apply_settings_as(
        &self,
        lease_id: Option<u64>,
        overlay: &InstrumentSettings,
    ) -> AppResult<()> {
        let mut driver = self.driver.lock().await;
        self.check_access(lease_id)?;
        let merged = self.read_settings().merged(overlay);
        self.with_timeout("apply_settings", driver.apply_settings(&merged))
            .await
            .map_err(|err| self.record_fault(err))?;
        *self.settings.lock() = merged;
        debug!(device = %self.id, ?overlay, "Settings applied");
        Ok(())
    }

    async fn acquire_as(&self, lease_id: Option<u64>) -> AppResult<SharedSample> {
        let mut driver = self.driver.lock().await;
        self.check_access(lease_id)?;
        let payload = self
            .with_timeout("acquire", driver.acquire())
            .await
            .map_err(|err| self.record_fault(err))?;
        drop(driver);

        self.state.lock().faulted = false;
        let sample = Arc::new(Sample::new(self.id.as_str(), payload));
        self.latest.send_replace(Some(Arc::clone(&sample)));
        Ok(sample)
    }

    async fn with_timeout<T, F>(&self, op: &str, fut: F) -> AppResult<T>
    where
        F: std::future::Future<Output = AppResult<T>>,
    {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DaqError::device_fault(
                self.id.as_str(),
                format!("{op} timed out after {:?}", self.io_timeout),
            )),
        }
    }

    fn record_fault(&self, err: DaqError) -> DaqError {
        let err = match err {
            DaqError::DeviceFault { message, .. } => DaqError::device_fault(self.id.as_str(), message),
            other => other,
        };
        if err.is_transient() {
            self.state.lock().faulted = true;
            warn!(device = %self.id, error = %err, "Instrument fault");
        }
        err
    }

    fn release(&self, lease_id: u64) {
        let mut state = self.state.lock();
        if state.lease.as_ref().is_some_and(|slot| slot.id == lease_id) {
            if let Some(slot) = state.lease.take() {
                debug!(device = %self.id, owner = %slot.owner, "Lease released");
            }
        }
    }
}

/// Exclusive command right on one [`InstrumentHandle`].
///
/// Released when dropped.
pub struct Lease {
    handle: Arc<InstrumentHandle>,
    id: u64,
    owner: String,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("device", &self.handle.id)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Lease {
    /// The leased handle.
    pub fn handle(&self) -> &Arc<InstrumentHandle> {
        &self.handle
    }

    /// Device id of the leased handle.
    pub fn device_id(&self) -> &str {
        self.handle.id()
    }

    /// Owner label this lease was granted to.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Take one reading as the lease holder.
    pub async fn acquire(&self) -> AppResult<SharedSample> {
        self.handle.acquire_as(Some(self.id)).await
    }

    /// Apply a settings overlay as the lease holder.
    pub async fn apply_settings(&self, overlay: &InstrumentSettings) -> AppResult<()> {
        self.handle.apply_settings_as(Some(self.id), overlay).await
    }

    /// Merged settings snapshot of the leased device.
    pub fn read_settings(&self) -> InstrumentSettings {
        self.handle.read_settings()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.handle.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCryostat, MockSpectrometer};

    fn spectrometer() -> (Arc<InstrumentHandle>, crate::hardware::mock::FaultInjector) {
        let driver = MockSpectrometer::new(16);
        let faults = driver.faults();
        (Arc::new(InstrumentHandle::new("spectro1", driver)), faults)
    }

    #[tokio::test]
    async fn acquire_before_connect_is_not_connected() {
        let (handle, _) = spectrometer();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        let err = handle.acquire().await.unwrap_err();
        assert_eq!(err, DaqError::NotConnected("spectro1".into()));
    }

    #[tokio::test]
    async fn lease_excludes_other_callers() {
        let (handle, _) = spectrometer();
        handle.connect().await.unwrap();

        let lease = handle.try_lease("worker-a").unwrap();
        assert_eq!(handle.state(), ConnectionState::Busy);
        assert!(lease.acquire().await.is_ok());

        match handle.try_lease("worker-b") {
            Err(DaqError::Busy { holder, .. }) => assert_eq!(holder, "worker-a"),
            other => panic!("expected Busy, got {other:?}"),
        }
        assert!(matches!(handle.acquire().await, Err(DaqError::Busy { .. })));

        drop(lease);
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert!(handle.try_lease("worker-b").is_ok());
    }

    #[tokio::test]
    async fn applying_settings_twice_is_idempotent() {
        let (handle, _) = spectrometer();
        handle.connect().await.unwrap();
        let overlay = InstrumentSettings::default()
            .with_exposure_ms(25.0)
            .with_shutter(false);

        handle.apply_settings(&overlay).await.unwrap();
        let first = handle.read_settings();
        handle.apply_settings(&overlay).await.unwrap();
        assert_eq!(handle.read_settings(), first);
        assert_eq!(first.exposure_ms, Some(25.0));
    }

    #[tokio::test]
    async fn fault_marks_handle_until_next_success() {
        let (handle, faults) = spectrometer();
        handle.connect().await.unwrap();
        faults.fail_next(1);

        let err = handle.acquire().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(handle.state(), ConnectionState::Faulted);

        handle.acquire().await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn slow_driver_times_out_as_device_fault() {
        let driver = MockSpectrometer::new(4).with_acquire_delay(Duration::from_millis(200));
        let handle = InstrumentHandle::new("slow", driver).with_io_timeout(Duration::from_millis(20));
        handle.connect().await.unwrap();
        let err = handle.acquire().await.unwrap_err();
        assert!(matches!(err, DaqError::DeviceFault { .. }));
    }

    #[tokio::test]
    async fn readback_is_visible_to_all_holders() {
        let handle = Arc::new(InstrumentHandle::new("cryo", MockCryostat::new(295.0)));
        handle.connect().await.unwrap();
        let mut rx = handle.subscribe();

        let lease = handle.try_lease("cryostat-loop").unwrap();
        let sample = lease.acquire().await.unwrap();

        rx.changed().await.unwrap();
        let seen = rx.borrow().clone().unwrap();
        assert_eq!(seen.value(), sample.value());
        assert_eq!(handle.latest().unwrap().value(), sample.value());
    }
}
