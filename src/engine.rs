//! The lighting engine: the one object a host talks to.
//!
//! All protocol work happens inside `&mut self` calls driven by the host's
//! tick (`update`, `render`), so sends are serialised and no locking is needed.
//! The optional [`ListenerHandle`] is the only asynchronous piece; its events
//! are drained without waiting on every `update`.

use crate::catalog::{DeviceCatalog, StaticCatalog};
use crate::color::ColorEncoder;
use crate::config::EngineConfig;
use crate::crypto::{AesGcmEncryptor, Encryptor, KeyDerivation, LocalKeyDerivation};
use crate::device::{DeviceRecord, DiscoveryEvent, TuyaDevice};
use crate::error::{Result, TuyaError};
use crate::negotiator::{NegotiationState, Negotiator};
use crate::protocol::MessageType;
use crate::registry::DeviceRegistry;
use crate::render::{CapabilitySink, PixelSampler, RenderSettings, VirtualDevice};
use crate::scanner::{ListenerEvent, ListenerHandle};
use crate::scheduler::{
    DeviceThrottle, SendOutcome, ThrottleState, TransmissionScheduler, Transport,
    UdpTransport,
};
use crate::store::{MemoryStore, SettingsStore};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Builder for [`LightingEngine`]. Every seam has an in-crate default.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Arc<dyn SettingsStore>,
    catalog: Arc<dyn DeviceCatalog>,
    transport: Arc<dyn Transport>,
    encryptor: Arc<dyn Encryptor>,
    key_derivation: Arc<dyn KeyDerivation>,
    seed: Option<u32>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            store: Arc::new(MemoryStore::new()),
            catalog: Arc::new(StaticCatalog::default()),
            transport: Arc::new(UdpTransport::default()),
            encryptor: Arc::new(AesGcmEncryptor),
            key_derivation: Arc::new(LocalKeyDerivation),
            seed: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn DeviceCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = encryptor;
        self
    }

    pub fn with_key_derivation(mut self, key_derivation: Arc<dyn KeyDerivation>) -> Self {
        self.key_derivation = key_derivation;
        self
    }

    /// Fixes the CRC seed given to newly discovered devices (random otherwise).
    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> LightingEngine {
        let mut negotiator = Negotiator::new(self.key_derivation)
            .with_retry_interval(self.config.negotiation_retry());
        if let Some(seed) = self.seed {
            negotiator = negotiator.with_seed(seed);
        }
        LightingEngine {
            registry: DeviceRegistry::new(self.store, ThrottleState::new(self.config.global_gap())),
            scheduler: TransmissionScheduler::new(self.transport, self.config.broadcast_port),
            encoder: ColorEncoder::new(self.config.fallback_color),
            negotiator,
            catalog: self.catalog,
            encryptor: self.encryptor,
            settings: RenderSettings::default(),
            virtual_devices: HashMap::new(),
            listener: None,
            config: self.config,
        }
    }
}

pub struct LightingEngine {
    config: EngineConfig,
    registry: DeviceRegistry,
    negotiator: Negotiator,
    scheduler: TransmissionScheduler,
    encoder: ColorEncoder,
    catalog: Arc<dyn DeviceCatalog>,
    encryptor: Arc<dyn Encryptor>,
    settings: RenderSettings,
    virtual_devices: HashMap<String, VirtualDevice>,
    listener: Option<ListenerHandle>,
}

impl LightingEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Feeds listener events into the engine on every [`update`](Self::update).
    pub fn attach_listener(&mut self, handle: ListenerHandle) {
        self.listener = Some(handle);
    }

    pub fn detach_listener(&mut self) -> Option<ListenerHandle> {
        self.listener.take()
    }

    /// Registers a newly announced device or refreshes a known one.
    ///
    /// An unknown id is restored from the store when a cached record exists,
    /// with the live network facts laid over it. A known device that is not
    /// paired yet but has a local key gets an immediate negotiation retry.
    pub fn handle_discovery(&mut self, event: &DiscoveryEvent) -> Result<()> {
        let id = event.gw_id.as_str();
        if id.is_empty() {
            return Err(TuyaError::InvalidPayload);
        }

        if let Some(device) = self.registry.get_mut(id) {
            let record = device.record_mut();
            if record.merge_announcement(event) {
                debug!("Device {} now at {}", id, record.ip());
            }
            if !record.initialized() && record.local_key().is_some() {
                self.negotiator.negotiate(id);
            }
            return Ok(());
        }

        info!("Creating device for {}", id);
        let seed = self.negotiator.seed();
        let record = match self.registry.load_cached(id) {
            Some(stored) => {
                let mut record = DeviceRecord::from_stored(stored, seed)?;
                record.merge_announcement(event);
                record
            }
            None => DeviceRecord::from_discovery(event, seed),
        };

        self.negotiator.add_device(&record);
        let throttle =
            DeviceThrottle::with_random_jitter(self.config.device_gap(), self.config.max_jitter());
        self.registry
            .insert(TuyaDevice::new(record, self.encryptor.clone(), throttle))?;
        self.sync_virtual_device(id);
        Ok(())
    }

    /// Drains listener events and advances pending negotiations.
    /// Returns the number of negotiation requests sent.
    pub fn update(&mut self, now: Instant) -> usize {
        let mut events = Vec::new();
        if let Some(listener) = self.listener.as_mut() {
            while let Some(event) = listener.try_next() {
                events.push(event);
            }
        }
        for event in events {
            match event {
                ListenerEvent::Announcement(ev) => {
                    if let Err(e) = self.handle_discovery(&ev) {
                        warn!("Discarding announcement from {}: {}", ev.gw_id, e);
                    }
                }
                ListenerEvent::Datagram(data) => {
                    if let Err(e) = self.handle_datagram(&data) {
                        debug!("Ignoring datagram: {}", e);
                    }
                }
            }
        }
        self.negotiator
            .handle_queue(&mut self.registry, &self.scheduler, now)
    }

    /// Offers a received datagram to the negotiator.
    pub fn handle_datagram(&mut self, data: &[u8]) -> Result<Option<String>> {
        self.negotiator.handle_datagram(&mut self.registry, data)
    }

    /// Applies host configuration for a device, persisting it when it changed.
    pub fn update_device(
        &mut self,
        id: &str,
        enabled: bool,
        device_type: u32,
        local_key: Option<String>,
    ) -> Result<bool> {
        if !self
            .registry
            .update_device(id, enabled, device_type, local_key)?
        {
            return Ok(false);
        }
        if let Some(record) = self.registry.record(id)
            && !record.initialized()
            && record.local_key().is_some()
        {
            self.negotiator.negotiate(id);
        }
        self.sync_virtual_device(id);
        Ok(true)
    }

    /// Creates, rebuilds or drops the virtual device to match the record.
    fn sync_virtual_device(&mut self, id: &str) {
        let Some(record) = self.registry.record(id) else {
            self.virtual_devices.remove(id);
            return;
        };
        if !record.enabled() {
            if self.virtual_devices.remove(id).is_some() {
                debug!("Virtual device {} disabled", id);
            }
            return;
        }
        let topology = self.catalog.topology_for(record.device_type());
        let name = self.catalog.display_name(record.device_type(), id);
        if let Some(existing) = self.virtual_devices.get(id)
            && existing.topology() == &topology
            && existing.name() == name
        {
            return;
        }
        info!("Virtual device {} ({}) with {} channels", id, name, topology.channels());
        self.virtual_devices
            .insert(id.to_string(), VirtualDevice::new(id, name, topology));
    }

    pub fn render_settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn set_render_settings(&mut self, settings: RenderSettings) {
        self.settings = settings;
    }

    /// Renders and streams one frame to `id` when its frame delay has passed.
    ///
    /// Returns `None` when nothing was due: disabled, not yet negotiated or
    /// paced out by the frame delay.
    pub fn render(
        &mut self,
        id: &str,
        sampler: &dyn PixelSampler,
        now: Instant,
    ) -> Result<Option<SendOutcome>> {
        let Some(virtual_device) = self.virtual_devices.get_mut(id) else {
            return Ok(None);
        };
        let Some(session_key) = self.registry.record(id).and_then(DeviceRecord::session_key)
        else {
            return Ok(None);
        };
        let Some(frame) = virtual_device.render(&self.settings, sampler, &self.encoder, now)?
        else {
            return Ok(None);
        };
        self.stream(id, &session_key, &frame, now).map(Some)
    }

    /// Renders every enabled device. Returns the number of frames sent.
    pub fn render_all(&mut self, sampler: &dyn PixelSampler, now: Instant) -> usize {
        let mut ids: Vec<String> = self.virtual_devices.keys().cloned().collect();
        ids.sort();
        ids.iter()
            .filter(|id| matches!(self.render(id, sampler, now), Ok(Some(SendOutcome::Sent(_)))))
            .count()
    }

    /// Sends the configured shutdown frame and drops the virtual device.
    ///
    /// A throttled shutdown frame keeps the virtual device so the call can be
    /// retried on the next tick.
    pub fn shutdown(&mut self, id: &str, now: Instant) -> Result<Option<SendOutcome>> {
        let Some(virtual_device) = self.virtual_devices.get(id) else {
            return Ok(None);
        };
        let frame = virtual_device.shutdown_frame(&self.settings, &self.encoder)?;
        let session_key = self.registry.record(id).and_then(DeviceRecord::session_key);

        let outcome = match (frame, session_key) {
            (Some(frame), Some(key)) => Some(self.stream(id, &key, &frame, now)?),
            _ => None,
        };
        if outcome != Some(SendOutcome::Throttled) {
            info!("Shutting down virtual device {}", id);
            self.virtual_devices.remove(id);
        }
        Ok(outcome)
    }

    fn stream(
        &mut self,
        id: &str,
        key: &crate::crypto::Key,
        frame: &[u8],
        now: Instant,
    ) -> Result<SendOutcome> {
        self.registry
            .send(
                &self.scheduler,
                id,
                MessageType::Stream,
                key,
                frame,
                now,
            )
            .inspect_err(|e| warn!("Failed to send frame to {}: {}", id, e))
    }

    /// Forgets a device: stops negotiating and closes its socket.
    pub fn remove_device(&mut self, id: &str) -> bool {
        self.negotiator.abandon(id);
        self.virtual_devices.remove(id);
        self.registry.remove(id).is_some()
    }

    pub fn device(&self, id: &str) -> Option<&DeviceRecord> {
        self.registry.record(id)
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.registry.ids()
    }

    pub fn negotiation_state(&self, id: &str) -> Option<NegotiationState> {
        self.negotiator.state(id)
    }

    pub fn virtual_device(&self, id: &str) -> Option<&VirtualDevice> {
        self.virtual_devices.get(id)
    }

    pub fn display_name(&self, id: &str) -> Option<String> {
        self.registry
            .record(id)
            .map(|r| self.catalog.display_name(r.device_type(), id))
    }

    /// Declares the device's controllable LEDs to the host. False if it is not enabled.
    pub fn declare(&self, id: &str, sink: &mut dyn CapabilitySink) -> bool {
        match self.virtual_devices.get(id) {
            Some(device) => {
                device.declare(sink);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for LightingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightingEngine")
            .field("config", &self.config)
            .field("devices", &self.registry.ids())
            .field("negotiator", &self.negotiator)
            .field("settings", &self.settings)
            .field("listener", &self.listener)
            .finish()
    }
}
