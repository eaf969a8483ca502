//! Engine configuration.
//!
//! Every field has a default, so an empty JSON object is a valid configuration.

use crate::color::{DEFAULT_FALLBACK, Rgb};
use crate::error::Result;
use crate::negotiator::DEFAULT_RETRY_INTERVAL;
use crate::scheduler::{DEFAULT_DEVICE_GAP, DEFAULT_GLOBAL_GAP, DEFAULT_MAX_JITTER};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BROADCAST_PORT: u16 = 6667;
/// Ports Tuya devices announce themselves on.
pub const DEFAULT_LISTEN_PORTS: [u16; 3] = [6666, 6667, 7000];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Minimum spacing between any two sends
    pub global_gap_ms: u64,
    /// Minimum spacing between two frames to the same device
    pub device_gap_ms: u64,
    /// Upper bound of the per-device jitter added to `device_gap_ms`
    pub max_jitter_ms: u64,
    /// Backoff between negotiation attempts
    #[serde(alias = "retryMs")]
    pub negotiation_retry_ms: u64,
    /// Destination port of outbound datagrams
    #[serde(alias = "port")]
    pub broadcast_port: u16,
    pub listen_ports: Vec<u16>,
    pub fallback_color: Rgb,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            global_gap_ms: DEFAULT_GLOBAL_GAP.as_millis() as u64,
            device_gap_ms: DEFAULT_DEVICE_GAP.as_millis() as u64,
            max_jitter_ms: DEFAULT_MAX_JITTER.as_millis() as u64,
            negotiation_retry_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            broadcast_port: DEFAULT_BROADCAST_PORT,
            listen_ports: DEFAULT_LISTEN_PORTS.to_vec(),
            fallback_color: DEFAULT_FALLBACK,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_global_gap(mut self, gap: Duration) -> Self {
        self.global_gap_ms = gap.as_millis() as u64;
        self
    }

    pub fn with_device_gap(mut self, gap: Duration) -> Self {
        self.device_gap_ms = gap.as_millis() as u64;
        self
    }

    pub fn with_max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter_ms = jitter.as_millis() as u64;
        self
    }

    pub fn with_negotiation_retry(mut self, retry: Duration) -> Self {
        self.negotiation_retry_ms = retry.as_millis() as u64;
        self
    }

    pub fn with_broadcast_port(mut self, port: u16) -> Self {
        self.broadcast_port = port;
        self
    }

    pub fn with_listen_ports(mut self, ports: Vec<u16>) -> Self {
        self.listen_ports = ports;
        self
    }

    pub fn with_fallback_color(mut self, color: Rgb) -> Self {
        self.fallback_color = color;
        self
    }

    pub fn global_gap(&self) -> Duration {
        Duration::from_millis(self.global_gap_ms)
    }

    pub fn device_gap(&self) -> Duration {
        Duration::from_millis(self.device_gap_ms)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }

    pub fn negotiation_retry(&self) -> Duration {
        Duration::from_millis(self.negotiation_retry_ms)
    }
}
