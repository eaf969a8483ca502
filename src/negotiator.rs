//! Session key negotiation.
//!
//! Each unpaired device gets a broadcast request `00000000 ‖ token ‖ rnd`
//! sealed under the key derived from its local key. The device answers with
//! `remote_rnd ‖ HMAC-SHA256(key, rnd)`; once the proof checks out, the session
//! key is `AES-GCM(key, nonce = rnd[..12], rnd ^ remote_rnd)` and the record is
//! persisted as initialized.
//!
//! Everything here is polled from the engine tick. Nothing blocks or waits.

use crate::crypto::{Encryptor, KEY_LEN, Key, KeyDerivation, NONCE_LEN};
use crate::device::DeviceRecord;
use crate::error::{Result, TuyaError};
use crate::protocol::{MessageType, Packet};
use crate::registry::DeviceRegistry;
use crate::scheduler::{SendOutcome, TransmissionScheduler};
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

const PROOF_LEN: usize = 32;
const REQUEST_PREFIX: [u8; 4] = [0u8; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No session key. May or may not have a usable local key.
    Unpaired,
    /// Request built, not yet written to the socket.
    Requested,
    /// Request written, waiting for the device's reply.
    AwaitingKey,
    /// Session key stored in the device record.
    Negotiated,
}

#[derive(Debug, Clone)]
struct Session {
    state: NegotiationState,
    last_attempt: Option<Instant>,
}

pub struct Negotiator {
    sessions: HashMap<String, Session>,
    seed: u32,
    retry_interval: Duration,
    derivation: Arc<dyn KeyDerivation>,
}

impl Negotiator {
    /// Creates a negotiator with a random CRC seed.
    pub fn new(derivation: Arc<dyn KeyDerivation>) -> Self {
        Self {
            sessions: HashMap::new(),
            seed: rand::random(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            derivation,
        }
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// CRC seed given to devices discovered during this run.
    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Starts tracking a device. Already initialized records go straight to `Negotiated`.
    pub fn add_device(&mut self, record: &DeviceRecord) {
        let state = if record.initialized() {
            NegotiationState::Negotiated
        } else {
            NegotiationState::Unpaired
        };
        debug!("Tracking {} for negotiation ({:?})", record.id(), state);
        self.sessions.insert(
            record.id().to_string(),
            Session {
                state,
                last_attempt: None,
            },
        );
    }

    pub fn state(&self, id: &str) -> Option<NegotiationState> {
        self.sessions.get(id).map(|s| s.state)
    }

    /// Clears the backoff so the next tick sends a request right away.
    pub fn negotiate(&mut self, id: &str) {
        if let Some(session) = self.sessions.get_mut(id)
            && session.state != NegotiationState::Negotiated
        {
            debug!("Negotiation with {} requested", id);
            session.last_attempt = None;
        }
    }

    /// Forgets a device. Returns false if it was not tracked.
    pub fn abandon(&mut self, id: &str) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            debug!("Negotiation with {} abandoned", id);
        }
        removed
    }

    /// Advances every pending negotiation. Returns the number of requests written.
    pub fn handle_queue(
        &mut self,
        registry: &mut DeviceRegistry,
        scheduler: &TransmissionScheduler,
        now: Instant,
    ) -> usize {
        let mut pending: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state != NegotiationState::Negotiated)
            .map(|(id, _)| id.clone())
            .collect();
        pending.sort();

        pending
            .iter()
            .filter(|id| self.advance(id, registry, scheduler, now))
            .count()
    }

    fn advance(
        &mut self,
        id: &str,
        registry: &mut DeviceRegistry,
        scheduler: &TransmissionScheduler,
        now: Instant,
    ) -> bool {
        let Some(session) = self.sessions.get_mut(id) else {
            return false;
        };
        let Some(record) = registry.record(id) else {
            return false;
        };
        if record.initialized() {
            session.state = NegotiationState::Negotiated;
            return false;
        }
        if let Some(last) = session.last_attempt
            && now.saturating_duration_since(last) < self.retry_interval
        {
            return false;
        }
        let Some(local_key) = record.local_key() else {
            return false;
        };
        let key = match self.derivation.derive(local_key) {
            Ok(key) => key,
            Err(e) => {
                debug!("Not negotiating with {}: {}", id, e);
                return false;
            }
        };
        let request = match (record.token_bytes(), record.rnd_bytes()) {
            (Ok(token), Ok(rnd)) => negotiation_request(&token, &rnd),
            _ => return false,
        };

        session.state = NegotiationState::Requested;
        match registry.send(
            scheduler,
            id,
            MessageType::NegotiationRequest,
            &key,
            &request,
            now,
        ) {
            Ok(SendOutcome::Sent(_)) => {
                info!("Negotiation request sent to {}", id);
                session.state = NegotiationState::AwaitingKey;
                session.last_attempt = Some(now);
                true
            }
            Ok(SendOutcome::Throttled) => false,
            Err(e) => {
                warn!("Failed to send negotiation request to {}: {}", id, e);
                session.last_attempt = Some(now);
                false
            }
        }
    }

    /// Processes a datagram that may be a negotiation reply.
    ///
    /// Returns the id of the device that just became `Negotiated`, or `None` when
    /// the datagram is not a reply for a pending device. A reply that fails
    /// authentication is rejected and the device keeps waiting.
    pub fn handle_datagram(
        &mut self,
        registry: &mut DeviceRegistry,
        data: &[u8],
    ) -> Result<Option<String>> {
        let packet = Packet::parse(data)?;
        if packet.message_type != MessageType::NegotiationResponse {
            return Ok(None);
        }
        let Some(id) = self.pending_for(registry, packet.crc) else {
            debug!("No pending negotiation for CRC {:08x}", packet.crc);
            return Ok(None);
        };

        if let Err(e) = self.complete(registry, &id, &packet) {
            warn!("Rejected negotiation reply for {}: {}", id, e);
            return Err(e);
        }
        if let Some(session) = self.sessions.get_mut(&id) {
            session.state = NegotiationState::Negotiated;
            session.last_attempt = None;
        }
        Ok(Some(id))
    }

    fn pending_for(&self, registry: &DeviceRegistry, crc: u32) -> Option<String> {
        self.sessions
            .iter()
            .filter(|(_, s)| {
                matches!(
                    s.state,
                    NegotiationState::Requested | NegotiationState::AwaitingKey
                )
            })
            .find(|(id, _)| registry.record(id).is_some_and(|r| r.crc_value() == crc))
            .map(|(id, _)| id.clone())
    }

    fn complete(&self, registry: &mut DeviceRegistry, id: &str, packet: &Packet) -> Result<()> {
        let device = registry
            .get(id)
            .ok_or_else(|| TuyaError::DeviceNotFound(id.to_string()))?;
        let record = device.record();
        let local_key = record
            .local_key()
            .ok_or_else(|| TuyaError::InvalidKey(format!("{} has no local key", id)))?;
        let key = self.derivation.derive(local_key)?;
        let rnd = record.rnd_bytes()?;

        let plaintext = packet.open(device.encryptor(), &key)?;
        if plaintext.len() < KEY_LEN + PROOF_LEN {
            return Err(TuyaError::InvalidPayload);
        }
        let mut remote_rnd = [0u8; KEY_LEN];
        remote_rnd.copy_from_slice(&plaintext[..KEY_LEN]);

        let mut mac =
            Hmac::<Sha256>::new_from_slice(&key).map_err(|_| TuyaError::HandshakeFailed)?;
        mac.update(&rnd);
        mac.verify_slice(&plaintext[KEY_LEN..KEY_LEN + PROOF_LEN])
            .map_err(|_| TuyaError::HandshakeFailed)?;

        let session_key = derive_session(device.encryptor(), &key, &rnd, &remote_rnd)?;
        registry.start_session(id, &session_key, &remote_rnd)
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("sessions", &self.sessions)
            .field("seed", &self.seed)
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}

/// Plaintext of a negotiation request.
pub fn negotiation_request(token: &[u8; KEY_LEN], rnd: &[u8; KEY_LEN]) -> Vec<u8> {
    let mut body = Vec::with_capacity(REQUEST_PREFIX.len() + 2 * KEY_LEN);
    body.extend_from_slice(&REQUEST_PREFIX);
    body.extend_from_slice(token);
    body.extend_from_slice(rnd);
    body
}

/// HMAC-SHA256 over `rnd`, the proof a device returns with its reply.
pub fn negotiation_proof(key: &Key, rnd: &[u8; KEY_LEN]) -> Result<[u8; PROOF_LEN]> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
    mac.update(rnd);
    let mut proof = [0u8; PROOF_LEN];
    proof.copy_from_slice(&mac.finalize().into_bytes());
    Ok(proof)
}

/// Session key: `rnd ^ remote_rnd` encrypted under `key` with `rnd[..12]` as nonce.
pub fn derive_session(
    encryptor: &dyn Encryptor,
    key: &Key,
    rnd: &[u8; KEY_LEN],
    remote_rnd: &[u8; KEY_LEN],
) -> Result<Key> {
    let mut mixed = [0u8; KEY_LEN];
    for (out, (a, b)) in mixed.iter_mut().zip(rnd.iter().zip(remote_rnd)) {
        *out = a ^ b;
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&rnd[..NONCE_LEN]);

    let (ciphertext, _) = encryptor.encrypt(key, &nonce, &[], &mixed)?;
    ciphertext
        .as_slice()
        .try_into()
        .map_err(|_| TuyaError::EncryptionFailed)
}
