//! Host-facing side of a light: render settings, the pixel sampler seam and the
//! [`VirtualDevice`] that turns sampled pixels into encoded frames.

use crate::color::{ColorEncoder, LedTopology, Rgb};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub const DEFAULT_FRAME_DELAY_MS: u64 = 50;
pub const MIN_FRAME_DELAY_MS: u64 = 20;
pub const MAX_FRAME_DELAY_MS: u64 = 200;
pub const DEFAULT_SHUTDOWN_COLOR: Rgb = Rgb::new(128.0, 0.0, 255.0);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LightingMode {
    /// Sample the host canvas at each LED position.
    #[default]
    Canvas,
    /// Paint every channel with the forced color.
    Forced,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownAction {
    #[serde(rename = "Do nothing")]
    DoNothing,
    #[serde(rename = "Single color")]
    SingleColor,
    #[default]
    #[serde(rename = "Turn device off")]
    TurnOff,
}

/// User-facing render parameters, in the shape hosts store them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenderSettings {
    pub lighting_mode: LightingMode,
    pub forced_color: Rgb,
    /// Milliseconds between frames, clamped to `20..=200` when used.
    pub frame_delay: u64,
    pub turn_off: ShutdownAction,
    pub shut_down_color: Rgb,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            lighting_mode: LightingMode::Canvas,
            forced_color: crate::color::DEFAULT_FALLBACK,
            frame_delay: DEFAULT_FRAME_DELAY_MS,
            turn_off: ShutdownAction::TurnOff,
            shut_down_color: DEFAULT_SHUTDOWN_COLOR,
        }
    }
}

impl RenderSettings {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(
            self.frame_delay
                .clamp(MIN_FRAME_DELAY_MS, MAX_FRAME_DELAY_MS),
        )
    }
}

/// Reads the host's rendered canvas.
pub trait PixelSampler {
    fn sample(&self, x: u32, y: u32) -> Rgb;
}

/// Receives what a device exposes to the host.
pub trait CapabilitySink {
    fn set_name(&mut self, name: &str);
    fn set_size(&mut self, width: u32, height: u32);
    fn set_controllable_leds(&mut self, names: &[String], positions: &[(u32, u32)]);
}

/// One enabled light as seen by the host renderer.
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    id: String,
    name: String,
    topology: LedTopology,
    last_render: Option<Instant>,
}

impl VirtualDevice {
    pub fn new(id: impl Into<String>, name: impl Into<String>, topology: LedTopology) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            topology,
            last_render: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topology(&self) -> &LedTopology {
        &self.topology
    }

    pub fn last_render(&self) -> Option<Instant> {
        self.last_render
    }

    pub fn declare(&self, sink: &mut dyn CapabilitySink) {
        let (width, height) = self.topology.size();
        sink.set_name(&self.name);
        sink.set_size(width, height);
        sink.set_controllable_leds(&self.topology.led_names(), &self.topology.led_positions());
    }

    /// One color per channel, from the canvas or the forced color.
    pub fn samples(&self, settings: &RenderSettings, sampler: &dyn PixelSampler) -> Vec<Rgb> {
        match settings.lighting_mode {
            LightingMode::Canvas => self
                .topology
                .led_positions()
                .into_iter()
                .map(|(x, y)| sampler.sample(x, y))
                .collect(),
            LightingMode::Forced => vec![settings.forced_color; self.topology.channels()],
        }
    }

    /// Produces the next frame when more than the frame delay has passed since
    /// the previous one, `None` otherwise.
    pub fn render(
        &mut self,
        settings: &RenderSettings,
        sampler: &dyn PixelSampler,
        encoder: &ColorEncoder,
        now: Instant,
    ) -> Result<Option<Vec<u8>>> {
        if let Some(last) = self.last_render
            && now.saturating_duration_since(last) <= settings.frame_interval()
        {
            return Ok(None);
        }
        self.last_render = Some(now);
        let samples = self.samples(settings, sampler);
        encoder.encode_bytes(&self.topology, &samples).map(Some)
    }

    /// Frame with every channel set to `color`.
    pub fn frame(&self, encoder: &ColorEncoder, color: Rgb) -> Result<Vec<u8>> {
        encoder.encode_bytes(&self.topology, &vec![color; self.topology.channels()])
    }

    /// Final frame to send on shutdown, if the action sends one.
    pub fn shutdown_frame(
        &self,
        settings: &RenderSettings,
        encoder: &ColorEncoder,
    ) -> Result<Option<Vec<u8>>> {
        match settings.turn_off {
            ShutdownAction::DoNothing => Ok(None),
            ShutdownAction::SingleColor => self.frame(encoder, settings.shut_down_color).map(Some),
            ShutdownAction::TurnOff => self.frame(encoder, Rgb::black()).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Gradient;

    impl PixelSampler for Gradient {
        fn sample(&self, x: u32, _y: u32) -> Rgb {
            match x {
                0 => Rgb::new(255.0, 0.0, 0.0),
                1 => Rgb::new(0.0, 255.0, 0.0),
                2 => Rgb::new(0.0, 0.0, 255.0),
                _ => Rgb::new(f64::NAN, 0.0, 0.0),
            }
        }
    }

    #[derive(Default)]
    struct Caps {
        name: String,
        size: (u32, u32),
        names: Vec<String>,
        positions: Vec<(u32, u32)>,
    }

    impl CapabilitySink for Caps {
        fn set_name(&mut self, name: &str) {
            self.name = name.to_string();
        }
        fn set_size(&mut self, width: u32, height: u32) {
            self.size = (width, height);
        }
        fn set_controllable_leds(&mut self, names: &[String], positions: &[(u32, u32)]) {
            self.names = names.to_vec();
            self.positions = positions.to_vec();
        }
    }

    #[test]
    fn declares_topology() {
        let device = VirtualDevice::new("abc", "Strip - abc", LedTopology::new(6));
        let mut caps = Caps::default();
        device.declare(&mut caps);
        assert_eq!(caps.name, "Strip - abc");
        assert_eq!(caps.size, (4, 1));
        assert_eq!(caps.names, vec!["Led 1", "Led 2", "Led 3", "Led 4"]);
        assert_eq!(caps.positions, vec![(0, 0), (1, 0), (2, 0), (3, 0)]);
    }

    #[test]
    fn canvas_samples_each_position() {
        let device = VirtualDevice::new("abc", "x", LedTopology::new(4));
        let samples = device.samples(&RenderSettings::default(), &Gradient);
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[1], Rgb::new(0.0, 255.0, 0.0));
    }

    #[test]
    fn canvas_frame_replaces_invalid_pixels() {
        let mut device = VirtualDevice::new("abc", "x", LedTopology::new(4));
        let encoder = ColorEncoder::default();
        let frame = device
            .render(&RenderSettings::default(), &Gradient, &encoder, Instant::now())
            .unwrap()
            .unwrap();
        let hex = hex::encode(frame);
        // fourth channel sampled NaN, replaced by #009bde
        assert_eq!(hex, "0004006464786464f06464c6645704".to_string() + "01010101");
    }

    #[test]
    fn forced_mode_repeats_color() {
        let device = VirtualDevice::new("abc", "x", LedTopology::new(2));
        let settings = RenderSettings {
            lighting_mode: LightingMode::Forced,
            forced_color: Rgb::new(255.0, 0.0, 0.0),
            ..RenderSettings::default()
        };
        assert_eq!(
            device.samples(&settings, &Gradient),
            vec![Rgb::new(255.0, 0.0, 0.0); 2]
        );
    }

    #[test]
    fn frame_delay_paces_renders() {
        let mut device = VirtualDevice::new("abc", "x", LedTopology::new(1));
        let encoder = ColorEncoder::default();
        let settings = RenderSettings::default();
        let t0 = Instant::now();

        assert!(device.render(&settings, &Gradient, &encoder, t0).unwrap().is_some());
        let at_delay = t0 + Duration::from_millis(DEFAULT_FRAME_DELAY_MS);
        assert!(device.render(&settings, &Gradient, &encoder, at_delay).unwrap().is_none());
        let after = t0 + Duration::from_millis(DEFAULT_FRAME_DELAY_MS + 1);
        assert!(device.render(&settings, &Gradient, &encoder, after).unwrap().is_some());
        assert_eq!(device.last_render(), Some(after));
    }

    #[test]
    fn frame_delay_is_clamped() {
        let fast = RenderSettings {
            frame_delay: 1,
            ..RenderSettings::default()
        };
        assert_eq!(fast.frame_interval(), Duration::from_millis(MIN_FRAME_DELAY_MS));
        let slow = RenderSettings {
            frame_delay: 10_000,
            ..RenderSettings::default()
        };
        assert_eq!(slow.frame_interval(), Duration::from_millis(MAX_FRAME_DELAY_MS));
    }

    #[test]
    fn shutdown_frames() {
        let device = VirtualDevice::new("abc", "x", LedTopology::new(1));
        let encoder = ColorEncoder::default();
        let mut settings = RenderSettings::default();

        let off = device.shutdown_frame(&settings, &encoder).unwrap().unwrap();
        assert_eq!(hex::encode(off), "000000000100");

        settings.turn_off = ShutdownAction::SingleColor;
        let purple = device.shutdown_frame(&settings, &encoder).unwrap().unwrap();
        assert!(hex::encode(purple).ends_with("00000100"));

        settings.turn_off = ShutdownAction::DoNothing;
        assert!(device.shutdown_frame(&settings, &encoder).unwrap().is_none());
    }

    #[test]
    fn settings_use_host_labels() {
        let settings: RenderSettings = serde_json::from_str(
            r##"{"lightingMode":"Forced","forcedColor":"#ff0000","turnOff":"Single color"}"##,
        )
        .unwrap();
        assert_eq!(settings.lighting_mode, LightingMode::Forced);
        assert_eq!(settings.forced_color, Rgb::new(255.0, 0.0, 0.0));
        assert_eq!(settings.turn_off, ShutdownAction::SingleColor);
        assert_eq!(settings.frame_delay, DEFAULT_FRAME_DELAY_MS);
        assert_eq!(settings.shut_down_color, DEFAULT_SHUTDOWN_COLOR);
    }
}
