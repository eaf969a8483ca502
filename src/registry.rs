//! In-memory registry of known devices, backed by a [`SettingsStore`].
//!
//! The registry also owns the process-wide [`ThrottleState`], so every send goes
//! through [`DeviceRegistry::send`] and shares the same global gap.

use crate::crypto::Key;
use crate::device::{DeviceRecord, StoredRecord, TuyaDevice};
use crate::error::{Result, TuyaError};
use crate::protocol::MessageType;
use crate::scheduler::{SendOutcome, ThrottleState, TransmissionScheduler};
use crate::store::SettingsStore;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub struct DeviceRegistry {
    devices: HashMap<String, TuyaDevice>,
    throttle: ThrottleState,
    store: Arc<dyn SettingsStore>,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn SettingsStore>, throttle: ThrottleState) -> Self {
        Self {
            devices: HashMap::new(),
            throttle,
            store,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&TuyaDevice> {
        self.devices.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TuyaDevice> {
        self.devices.get_mut(id)
    }

    pub fn record(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.get(id).map(TuyaDevice::record)
    }

    /// Sorted ids, so callers iterate devices in a stable order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn throttle(&self) -> &ThrottleState {
        &self.throttle
    }

    pub fn insert(&mut self, device: TuyaDevice) -> Result<()> {
        let id = device.id().to_string();
        if self.devices.contains_key(&id) {
            return Err(TuyaError::DuplicateDevice(id));
        }
        info!("Device {} registered", id);
        self.devices.insert(id, device);
        Ok(())
    }

    /// Drops the device and its socket. The persisted record is kept.
    pub fn remove(&mut self, id: &str) -> Option<TuyaDevice> {
        let removed = self.devices.remove(id);
        if removed.is_some() {
            info!("Device {} removed from registry", id);
        }
        removed
    }

    /// Reads the cached record for `id`. Unreadable entries are logged and skipped.
    pub fn load_cached(&self, id: &str) -> Option<StoredRecord> {
        let json = match self.store.load(id) {
            Ok(Some(json)) => json,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read cached record for {}: {}", id, e);
                return None;
            }
        };
        match serde_json::from_str(&json) {
            Ok(stored) => Some(stored),
            Err(e) => {
                warn!("Ignoring corrupt cached record for {}: {}", id, e);
                None
            }
        }
    }

    pub fn persist(&self, id: &str) -> Result<()> {
        let record = self
            .record(id)
            .ok_or_else(|| TuyaError::DeviceNotFound(id.to_string()))?;
        debug!("Saving device {} to cache", id);
        self.store.save(id, &record.to_json()?)
    }

    /// Applies external configuration and persists when anything changed.
    pub fn update_device(
        &mut self,
        id: &str,
        enabled: bool,
        device_type: u32,
        local_key: Option<String>,
    ) -> Result<bool> {
        let device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| TuyaError::DeviceNotFound(id.to_string()))?;
        if !device.record_mut().update_config(enabled, device_type, local_key) {
            return Ok(false);
        }
        self.persist(id)?;
        Ok(true)
    }

    /// Stores negotiated keys and persists the record.
    pub fn start_session(&mut self, id: &str, session_key: &Key, negotiation_key: &Key) -> Result<()> {
        let device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| TuyaError::DeviceNotFound(id.to_string()))?;
        device.record_mut().start_session(session_key, negotiation_key);
        info!("Keys successfully negotiated for {}, starting session", id);
        self.persist(id)
    }

    /// Sends through `scheduler`, sharing the registry's global throttle.
    pub fn send(
        &mut self,
        scheduler: &TransmissionScheduler,
        id: &str,
        message_type: MessageType,
        key: &Key,
        plaintext: &[u8],
        now: Instant,
    ) -> Result<SendOutcome> {
        let device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| TuyaError::DeviceNotFound(id.to_string()))?;
        scheduler.send(
            &mut self.throttle,
            device,
            message_type,
            key,
            plaintext,
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AesGcmEncryptor;
    use crate::device::DiscoveryEvent;
    use crate::scheduler::DeviceThrottle;
    use crate::store::MemoryStore;

    fn registry() -> (DeviceRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            DeviceRegistry::new(store.clone(), ThrottleState::default()),
            store,
        )
    }

    fn device(id: &str) -> TuyaDevice {
        TuyaDevice::new(
            DeviceRecord::from_discovery(&DiscoveryEvent::new(id, "10.0.0.3"), 1),
            Arc::new(AesGcmEncryptor),
            DeviceThrottle::default(),
        )
    }

    #[test]
    fn insert_rejects_duplicates() {
        let (mut reg, _) = registry();
        reg.insert(device("b")).unwrap();
        reg.insert(device("a")).unwrap();
        assert_eq!(
            reg.insert(device("a")),
            Err(TuyaError::DuplicateDevice("a".into()))
        );
        assert_eq!(reg.ids(), vec!["a", "b"]);
        assert!(reg.remove("a").is_some());
        assert!(reg.remove("a").is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn update_persists_only_on_change() {
        let (mut reg, store) = registry();
        reg.insert(device("a")).unwrap();

        assert!(!reg.update_device("a", false, 0, None).unwrap());
        assert!(store.is_empty());

        assert!(reg.update_device("a", true, 2, Some("0123456789abcdef".into())).unwrap());
        let saved = store.load("a").unwrap().unwrap();
        let restored = DeviceRecord::from_json(&saved, 0).unwrap();
        assert!(restored.enabled());
        assert_eq!(restored.device_type(), 2);

        assert!(matches!(
            reg.update_device("missing", true, 0, None),
            Err(TuyaError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn start_session_marks_initialized_and_persists() {
        let (mut reg, store) = registry();
        reg.insert(device("a")).unwrap();
        reg.start_session("a", &[9u8; 16], &[8u8; 16]).unwrap();

        let record = reg.record("a").unwrap();
        assert!(record.initialized());
        assert_eq!(record.session_key(), Some([9u8; 16]));

        let saved = DeviceRecord::from_json(&store.load("a").unwrap().unwrap(), 0).unwrap();
        assert!(saved.initialized());
        assert_eq!(saved.negotiation_key(), Some(hex::encode([8u8; 16]).as_str()));
    }

    #[test]
    fn corrupt_cache_is_ignored() {
        let (reg, store) = registry();
        store.save("a", "{not json").unwrap();
        assert!(reg.load_cached("a").is_none());
        store.save("b", r#"{"gwId":"b","enabled":true}"#).unwrap();
        assert_eq!(reg.load_cached("b").unwrap().enabled, Some(true));
    }
}
