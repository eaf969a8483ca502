//! Streams a fixed color to every paired device found on the network.
//!
//! Local keys are read from `TUYA_KEYS` as `id=key,id=key`. Device records are
//! cached in `./tuya-devices`.
//!
//! ```text
//! RUST_LOG=debug TUYA_KEYS=bf123...=0123456789abcdef cargo run --example forced_color
//! ```

use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tuya_razer::render::PixelSampler;
use tuya_razer::{
    BroadcastListener, EngineConfig, JsonDirStore, LightingEngine, LightingMode, RenderSettings,
    Rgb, SendOutcome,
};

struct Unused;

impl PixelSampler for Unused {
    fn sample(&self, _x: u32, _y: u32) -> Rgb {
        Rgb::black()
    }
}

fn local_keys() -> HashMap<String, String> {
    std::env::var("TUYA_KEYS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(id, key)| (id.trim().to_string(), key.trim().to_string()))
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = EngineConfig::default();
    let listener = BroadcastListener::new()
        .with_ports(config.listen_ports.clone())
        .start()?;

    let mut engine = LightingEngine::builder()
        .with_config(config)
        .with_store(Arc::new(JsonDirStore::new("tuya-devices")))
        .build();
    engine.attach_listener(listener);
    engine.set_render_settings(RenderSettings {
        lighting_mode: LightingMode::Forced,
        forced_color: "#8000ff".parse()?,
        ..RenderSettings::default()
    });

    let keys = local_keys();
    let mut ticker = tokio::time::interval(Duration::from_millis(10));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                engine.update(now);
                for id in engine.device_ids() {
                    let Some(key) = keys.get(&id) else { continue };
                    if engine.virtual_device(&id).is_none() {
                        info!("Enabling {}", id);
                        if let Err(e) = engine.update_device(&id, true, 0, Some(key.clone())) {
                            warn!("Could not enable {}: {}", id, e);
                        }
                    }
                }
                engine.render_all(&Unused, now);
            }
        }
    }

    for id in engine.device_ids() {
        for _ in 0..5 {
            match engine.shutdown(&id, Instant::now()) {
                Ok(Some(SendOutcome::Throttled)) => {
                    tokio::time::sleep(Duration::from_millis(100)).await
                }
                Ok(_) => break,
                Err(e) => {
                    warn!("Shutdown of {} failed: {}", id, e);
                    break;
                }
            }
        }
    }
    Ok(())
}
