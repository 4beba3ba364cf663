//! Device Registry
//!
//! Maps device ids to their exclusively owned [`InstrumentHandle`]s. The
//! registry is built once at startup (from configuration or by explicit
//! [`DeviceRegistry::insert`]) and then shared read-only, usually as
//! `Arc<DeviceRegistry>`, with the measurement controller and the cryostat loop.
//!
//! ```rust,ignore
//! let mut registry = DeviceRegistry::new();
//! registry.insert(InstrumentHandle::new("spectrometer", MockSpectrometer::new(512)))?;
//! registry.connect_all().await?;
//! let spectrometer = registry.get("spectrometer")?;
//! ```

use super::mock::{self, MockOptions, OpticalBench};
use super::{InstrumentHandle, InstrumentKind};
use crate::config::InstrumentDefinition;
use crate::error::{AppResult, DaqError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Central registry of the rig's instruments.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, Arc<InstrumentHandle>>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build mock drivers for every enabled instrument definition.
    ///
    /// All mocks built by one call share a single [`OpticalBench`], so the SLM
    /// steers the beam seen by the spectrometer and camera.
    pub fn from_config(definitions: &[InstrumentDefinition]) -> AppResult<Self> {
        let bench = OpticalBench::new();
        let mut registry = Self::new();
        for def in definitions.iter().filter(|d| d.enabled) {
            let kind = InstrumentKind::from_type_name(&def.r#type).ok_or_else(|| {
                DaqError::Configuration(format!(
                    "instrument '{}' has unknown type '{}'",
                    def.id, def.r#type
                ))
            })?;
            let options = def.config.clone().try_into::<MockOptions>().map_err(|e| {
                DaqError::Configuration(format!("instrument '{}' options: {e}", def.id))
            })?;
            let driver = mock::build(kind, &options, &bench);
            let handle = InstrumentHandle::from_boxed(def.id.as_str(), driver)
                .with_io_timeout(Duration::from_millis(def.io_timeout_ms));
            registry.insert(handle)?;
            info!(device = %def.id, %kind, "Registered instrument");
        }
        Ok(registry)
    }

    /// Add a handle. Fails when the id is already taken.
    pub fn insert(&mut self, handle: InstrumentHandle) -> AppResult<Arc<InstrumentHandle>> {
        let id = handle.id().to_string();
        if self.devices.contains_key(&id) {
            return Err(DaqError::Configuration(format!("duplicate device id '{id}'")));
        }
        let handle = Arc::new(handle);
        self.devices.insert(id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Look up a handle by id.
    pub fn get(&self, id: &str) -> AppResult<Arc<InstrumentHandle>> {
        self.devices
            .get(id)
            .cloned()
            .ok_or_else(|| DaqError::UnknownDevice(id.to_string()))
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// Handles of one device family.
    pub fn by_kind(&self, kind: InstrumentKind) -> Vec<Arc<InstrumentHandle>> {
        self.devices
            .values()
            .filter(|h| h.kind() == kind)
            .cloned()
            .collect()
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device is registered.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Connect every device. All devices are attempted; the first error is returned.
    pub async fn connect_all(&self) -> AppResult<()> {
        let mut first_error = None;
        for handle in self.devices.values() {
            if let Err(err) = handle.connect().await {
                warn!(device = %handle.id(), error = %err, "Connect failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Disconnect every device, logging failures.
    pub async fn disconnect_all(&self) {
        for handle in self.devices.values() {
            if let Err(err) = handle.disconnect().await {
                warn!(device = %handle.id(), error = %err, "Disconnect failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockSpectrometer;
    use crate::hardware::ConnectionState;

    fn definition(id: &str, ty: &str) -> InstrumentDefinition {
        InstrumentDefinition {
            id: id.to_string(),
            r#type: ty.to_string(),
            enabled: true,
            io_timeout_ms: 1000,
            config: toml::Value::Table(toml::map::Map::new()),
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut registry = DeviceRegistry::new();
        registry
            .insert(InstrumentHandle::new("spectro1", MockSpectrometer::new(4)))
            .unwrap();
        let err = registry
            .insert(InstrumentHandle::new("spectro1", MockSpectrometer::new(4)))
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn unknown_device_lookup_fails() {
        let registry = DeviceRegistry::new();
        assert_eq!(
            registry.get("nope").unwrap_err(),
            DaqError::UnknownDevice("nope".into())
        );
    }

    #[tokio::test]
    async fn builds_and_connects_mock_rig() {
        let mut disabled = definition("scope", "mock_oscilloscope");
        disabled.enabled = false;
        let defs = vec![
            definition("spectrometer", "mock_spectrometer"),
            definition("slm", "mock_slm"),
            definition("cryostat", "mock_cryostat"),
            disabled,
        ];
        let registry = DeviceRegistry::from_config(&defs).unwrap();
        assert_eq!(registry.ids(), vec!["cryostat", "slm", "spectrometer"]);
        assert_eq!(registry.by_kind(InstrumentKind::Slm).len(), 1);

        registry.connect_all().await.unwrap();
        assert_eq!(
            registry.get("cryostat").unwrap().state(),
            ConnectionState::Connected
        );
        registry.disconnect_all().await;
        assert!(!registry.get("slm").unwrap().is_connected());
    }

    #[test]
    fn unknown_type_is_a_configuration_error() {
        let err = DeviceRegistry::from_config(&[definition("laser", "maitai")]).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }
}
