//! Per-device identity, pairing material and persisted record.
//!
//! A [`DeviceRecord`] is the JSON-serialisable state of one light. A
//! [`TuyaDevice`] wraps the record together with the injected encryption
//! capability, its send throttle and its lazily opened socket.

use crate::address::{address_value, compute_address};
use crate::crypto::{Encryptor, Key, key_from_hex, random_hex_bytes, random_nonce};
use crate::error::{Result, TuyaError};
use crate::protocol::{MessageType, Packet};
use crate::scheduler::{DatagramSocket, DeviceThrottle, Transport};
use log::debug;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

const TOKEN_HEX_LEN: usize = 32;

/// Announcement consumed to create or refresh a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryEvent {
    #[serde(alias = "devId")]
    pub gw_id: String,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rnd: Option<String>,
}

impl DiscoveryEvent {
    pub fn new(gw_id: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            gw_id: gw_id.into(),
            ip: ip.into(),
            uuid: None,
            version: None,
            product_key: None,
            token: None,
            rnd: None,
        }
    }
}

/// Persisted form with every field optional; see [`DeviceRecord::from_stored`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub id: Option<String>,
    pub gw_id: Option<String>,
    pub enabled: Option<bool>,
    pub ip: Option<String>,
    pub uuid: Option<String>,
    pub version: Option<String>,
    pub product_key: Option<String>,
    pub device_type: Option<u32>,
    pub local_key: Option<String>,
    pub token: Option<String>,
    pub rnd: Option<String>,
    pub crc: Option<String>,
    pub negotiation_key: Option<String>,
    pub session_key: Option<String>,
    pub initialized: Option<bool>,
    pub negotiator_crc: Option<u32>,
}

/// Everything known about one physical light.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    id: String,
    enabled: bool,
    ip: String,
    uuid: Option<String>,
    gw_id: String,
    version: Option<String>,
    product_key: Option<String>,
    device_type: u32,
    local_key: Option<String>,
    token: String,
    rnd: String,
    crc: String,
    negotiation_key: Option<String>,
    session_key: Option<String>,
    initialized: bool,
    negotiator_crc: u32,
}

impl DeviceRecord {
    /// Creates a fresh record from a live announcement.
    pub fn from_discovery(event: &DiscoveryEvent, seed: u32) -> Self {
        Self {
            id: event.gw_id.clone(),
            enabled: false,
            ip: event.ip.clone(),
            uuid: event.uuid.clone(),
            gw_id: event.gw_id.clone(),
            version: event.version.clone(),
            product_key: event.product_key.clone(),
            device_type: 0,
            local_key: None,
            token: token_or_random(event.token.as_deref()),
            rnd: token_or_random(event.rnd.as_deref()),
            crc: compute_address(&event.gw_id, seed),
            negotiation_key: None,
            session_key: None,
            initialized: false,
            negotiator_crc: seed,
        }
    }

    /// Decodes a cached record, applying defaults for absent fields.
    ///
    /// `seed` is used only when the record has no `negotiatorCrc`. The stored `crc`
    /// is ignored and recomputed, and a record claiming to be initialized without a
    /// usable session key is reset to unpaired.
    pub fn from_stored(stored: StoredRecord, seed: u32) -> Result<Self> {
        let gw_id = stored
            .gw_id
            .or(stored.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TuyaError::Json("stored record has no gwId".into()))?;
        let negotiator_crc = stored.negotiator_crc.unwrap_or(seed);
        let crc = compute_address(&gw_id, negotiator_crc);
        if let Some(cached) = stored.crc.as_deref()
            && cached != crc
        {
            debug!("Cached CRC {} for {} is stale, using {}", cached, gw_id, crc);
        }

        let session_ok = stored
            .session_key
            .as_deref()
            .is_some_and(|k| key_from_hex(k).is_ok());
        let initialized = stored.initialized.unwrap_or(false) && session_ok;

        Ok(Self {
            id: gw_id.clone(),
            enabled: stored.enabled.unwrap_or(false),
            ip: stored.ip.unwrap_or_default(),
            uuid: stored.uuid,
            gw_id,
            version: stored.version,
            product_key: stored.product_key,
            device_type: stored.device_type.unwrap_or(0),
            local_key: stored.local_key.filter(|k| !k.is_empty()),
            token: token_or_random(stored.token.as_deref()),
            rnd: token_or_random(stored.rnd.as_deref()),
            crc,
            negotiation_key: if initialized { stored.negotiation_key } else { None },
            session_key: if initialized { stored.session_key } else { None },
            initialized,
            negotiator_crc,
        })
    }

    pub fn from_json(json: &str, seed: u32) -> Result<Self> {
        Self::from_stored(serde_json::from_str(json)?, seed)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Refreshes network facts from a live announcement. Returns true if anything changed.
    pub fn merge_announcement(&mut self, event: &DiscoveryEvent) -> bool {
        let mut changed = false;
        if !event.ip.is_empty() && event.ip != self.ip {
            self.ip = event.ip.clone();
            changed = true;
        }
        for (field, value) in [
            (&mut self.uuid, &event.uuid),
            (&mut self.version, &event.version),
            (&mut self.product_key, &event.product_key),
        ] {
            if value.is_some() && field != value {
                *field = value.clone();
                changed = true;
            }
        }
        changed
    }

    /// Applies external configuration. Returns true when the record changed.
    pub fn update_config(
        &mut self,
        enabled: bool,
        device_type: u32,
        local_key: Option<String>,
    ) -> bool {
        let local_key = local_key.filter(|k| !k.is_empty());
        if self.enabled == enabled && self.device_type == device_type && self.local_key == local_key
        {
            return false;
        }
        self.enabled = enabled;
        self.device_type = device_type;
        self.local_key = local_key;
        true
    }

    /// Records negotiated keys and marks the device ready to stream.
    pub fn start_session(&mut self, session_key: &Key, negotiation_key: &Key) {
        self.session_key = Some(hex::encode(session_key));
        self.negotiation_key = Some(hex::encode(negotiation_key));
        self.initialized = true;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn gw_id(&self) -> &str {
        &self.gw_id
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn product_key(&self) -> Option<&str> {
        self.product_key.as_deref()
    }

    pub fn device_type(&self) -> u32 {
        self.device_type
    }

    pub fn local_key(&self) -> Option<&str> {
        self.local_key.as_deref()
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn rnd(&self) -> &str {
        &self.rnd
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn negotiator_crc(&self) -> u32 {
        self.negotiator_crc
    }

    /// CRC address as 8 hex characters.
    pub fn crc(&self) -> &str {
        &self.crc
    }

    pub fn crc_value(&self) -> u32 {
        address_value(&self.id, self.negotiator_crc)
    }

    pub fn negotiation_key(&self) -> Option<&str> {
        self.negotiation_key.as_deref()
    }

    pub fn session_key(&self) -> Option<Key> {
        self.session_key.as_deref().and_then(|k| key_from_hex(k).ok())
    }

    pub fn token_bytes(&self) -> Result<[u8; 16]> {
        key_from_hex(&self.token)
    }

    pub fn rnd_bytes(&self) -> Result<[u8; 16]> {
        key_from_hex(&self.rnd)
    }

    /// Subnet broadcast address (`a.b.c.255`) of the device on `port`.
    pub fn broadcast_addr(&self, port: u16) -> Result<SocketAddr> {
        let ip: Ipv4Addr = self
            .ip
            .parse()
            .map_err(|_| TuyaError::InvalidAddress(self.ip.clone()))?;
        let [a, b, c, _] = ip.octets();
        Ok(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(a, b, c, 255),
            port,
        )))
    }
}

/// Keeps `value` if it is exactly 32 hex characters, otherwise draws 16 random bytes.
fn token_or_random(value: Option<&str>) -> String {
    match value {
        Some(v) if v.len() == TOKEN_HEX_LEN && v.chars().all(|c| c.is_ascii_hexdigit()) => {
            v.to_ascii_lowercase()
        }
        _ => random_hex_bytes(TOKEN_HEX_LEN / 2),
    }
}

/// A known device: its record plus the capabilities used to reach it.
pub struct TuyaDevice {
    record: DeviceRecord,
    encryptor: Arc<dyn Encryptor>,
    throttle: DeviceThrottle,
    socket: Option<Box<dyn DatagramSocket>>,
}

impl TuyaDevice {
    pub fn new(record: DeviceRecord, encryptor: Arc<dyn Encryptor>, throttle: DeviceThrottle) -> Self {
        Self {
            record,
            encryptor,
            throttle,
            socket: None,
        }
    }

    pub fn id(&self) -> &str {
        self.record.id()
    }

    pub fn record(&self) -> &DeviceRecord {
        &self.record
    }

    pub(crate) fn record_mut(&mut self) -> &mut DeviceRecord {
        &mut self.record
    }

    pub fn encryptor(&self) -> &dyn Encryptor {
        self.encryptor.as_ref()
    }

    pub fn throttle(&self) -> &DeviceThrottle {
        &self.throttle
    }

    pub(crate) fn throttle_mut(&mut self) -> &mut DeviceThrottle {
        &mut self.throttle
    }

    pub fn has_socket(&self) -> bool {
        self.socket.is_some()
    }

    /// Seals `plaintext` for this device with a fresh nonce.
    pub fn seal(&self, message_type: MessageType, key: &Key, plaintext: &[u8]) -> Result<Packet> {
        Packet::seal(
            self.encryptor.as_ref(),
            key,
            self.record.crc_value(),
            message_type,
            random_nonce(),
            plaintext,
        )
    }

    /// Returns the device socket, opening it on first use.
    pub(crate) fn socket(&mut self, transport: &dyn Transport) -> Result<&mut dyn DatagramSocket> {
        if self.socket.is_none() {
            debug!("Opening socket for device {}", self.record.id);
            self.socket = Some(transport.open()?);
        }
        match self.socket.as_deref_mut() {
            Some(socket) => Ok(socket),
            None => Err(TuyaError::Io("socket unavailable".into())),
        }
    }
}

impl std::fmt::Debug for TuyaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TuyaDevice")
            .field("record", &self.record)
            .field("throttle", &self.throttle)
            .field("socket", &self.socket.is_some())
            .finish()
    }
}
