//! # tuya-razer
//!
//! Real-time color streaming to Tuya Wi-Fi lights over the local network,
//! without the vendor cloud: discovery, session key negotiation, and
//! authenticated UDP broadcast frames paced to what the devices can take.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Instant;
//! use tuya_razer::{DiscoveryEvent, LightingEngine};
//!
//! let mut engine = LightingEngine::builder().build();
//! engine.handle_discovery(&DiscoveryEvent::new("DEVICE_ID", "192.168.1.20")).unwrap();
//! engine
//!     .update_device("DEVICE_ID", true, 0, Some("DEVICE_LOCAL_KEY".into()))
//!     .unwrap();
//! engine.update(Instant::now()); // negotiation runs on every tick
//! ```
//!
#[macro_use]
mod macros;
pub mod address;
pub mod catalog;
pub mod color;
pub mod config;
pub mod crypto;
pub mod device;
pub mod engine;
pub mod error;
pub mod negotiator;
pub mod protocol;
pub mod registry;
pub mod render;
pub mod scanner;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testing;

pub use address::compute_address;
pub use catalog::{DeviceCatalog, StaticCatalog};
pub use color::{ColorEncoder, LedTopology, Rgb};
pub use config::EngineConfig;
pub use device::{DeviceRecord, DiscoveryEvent};
pub use engine::{EngineBuilder, LightingEngine};
pub use error::TuyaError;
pub use negotiator::NegotiationState;
pub use render::{LightingMode, PixelSampler, RenderSettings, ShutdownAction};
pub use scanner::{BroadcastListener, ListenerEvent};
pub use scheduler::SendOutcome;
pub use store::{JsonDirStore, MemoryStore, SettingsStore};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
