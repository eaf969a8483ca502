//! Color sampling model and the packed HSV payload understood by the lights.

use crate::error::{Result, TuyaError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Suffix marking single-zone addressing.
pub const SINGLE_ZONE_SUFFIX: &str = "00000100";
/// Prefix of a multi-segment payload.
pub const MULTI_ZONE_PREFIX: &str = "0004";
/// Most logical channels a device is driven with.
pub const MAX_CHANNELS: usize = 4;

/// Fallback used when a sampled color is unusable.
pub const DEFAULT_FALLBACK: Rgb = Rgb::new(0.0, 155.0, 222.0);

/// An RGB sample with components nominally in `0..=255`.
///
/// Components are `f64` because host samplers may hand back NaN or values out of
/// range; [`Rgb::is_valid`] tells whether a sample can be encoded as-is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgb {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl Rgb {
    pub const fn new(r: f64, g: f64, b: f64) -> Self {
        Self { r, g, b }
    }

    pub const fn black() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn is_valid(&self) -> bool {
        [self.r, self.g, self.b]
            .iter()
            .all(|c| c.is_finite() && (0.0..=255.0).contains(c))
    }

    /// Standard max/min/delta conversion, rounded to whole degrees and percent.
    pub fn to_hsv(&self) -> Hsv {
        let r = self.r / 255.0;
        let g = self.g / 255.0;
        let b = self.b / 255.0;

        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let delta = max - min;

        let s = if max == 0.0 { 0.0 } else { delta / max };
        let sector = if delta == 0.0 {
            0.0
        } else if max == r {
            (g - b) / delta + if g < b { 6.0 } else { 0.0 }
        } else if max == g {
            (b - r) / delta + 2.0
        } else {
            (r - g) / delta + 4.0
        };

        let hue = (sector * 60.0).round() as u16 % 360;
        Hsv {
            h: hue,
            s: (s * 100.0).round() as u8,
            v: (max * 100.0).round() as u8,
        }
    }
}

impl FromStr for Rgb {
    type Err = TuyaError;

    /// Parses `#rrggbb` or `rrggbb`.
    fn from_str(s: &str) -> Result<Self> {
        let digits = s.trim().trim_start_matches('#');
        let bytes = hex::decode(digits)?;
        if bytes.len() != 3 {
            return Err(TuyaError::DecodeError(format!("Invalid color: {}", s)));
        }
        Ok(Self::new(bytes[0] as f64, bytes[1] as f64, bytes[2] as f64))
    }
}

impl TryFrom<String> for Rgb {
    type Error = TuyaError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Rgb> for String {
    fn from(value: Rgb) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = |v: f64| v.clamp(0.0, 255.0).round() as u8;
        write!(f, "#{:02x}{:02x}{:02x}", c(self.r), c(self.g), c(self.b))
    }
}

/// Hue in degrees `[0, 360)`, saturation and value in percent `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hsv {
    pub h: u16,
    pub s: u8,
    pub v: u8,
}

/// Physical LED layout of a device and the channels it is driven with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedTopology {
    physical: usize,
    channels: usize,
}

impl LedTopology {
    /// A device always exposes at least one LED.
    pub fn new(physical_leds: usize) -> Self {
        let physical = physical_leds.max(1);
        Self {
            physical,
            channels: physical.min(MAX_CHANNELS),
        }
    }

    pub fn physical_leds(&self) -> usize {
        self.physical
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn led_names(&self) -> Vec<String> {
        (1..=self.channels).map(|i| format!("Led {}", i)).collect()
    }

    pub fn led_positions(&self) -> Vec<(u32, u32)> {
        (0..self.channels as u32).map(|i| (i, 0)).collect()
    }

    pub fn size(&self) -> (u32, u32) {
        (self.channels as u32, 1)
    }
}

/// Packs sampled colors into the hex payload streamed to a device.
#[derive(Debug, Clone)]
pub struct ColorEncoder {
    fallback: Rgb,
}

impl Default for ColorEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK)
    }
}

impl ColorEncoder {
    /// `fallback` replaces any sample with a missing or out-of-range component.
    /// An invalid fallback is itself replaced by [`DEFAULT_FALLBACK`].
    pub fn new(fallback: Rgb) -> Self {
        let fallback = if fallback.is_valid() {
            fallback
        } else {
            DEFAULT_FALLBACK
        };
        Self { fallback }
    }

    pub fn fallback(&self) -> Rgb {
        self.fallback
    }

    /// Encodes `samples` (one per channel) for a device laid out as `topology`.
    ///
    /// An empty sample list is encoded as a single fallback sample.
    pub fn encode(&self, topology: &LedTopology, samples: &[Rgb]) -> String {
        let hsv: Vec<Hsv> = if samples.is_empty() {
            vec![self.fallback.to_hsv()]
        } else {
            samples.iter().map(|c| self.sanitize(c).to_hsv()).collect()
        };

        if hsv.len() == 1 {
            let c = hsv[0];
            format!(
                "{}{}{}{}",
                hex_field(c.h as u32, 2),
                hex_field(c.s as u32 / 10, 1),
                hex_field(c.v as u32 / 10, 1),
                SINGLE_ZONE_SUFFIX
            )
        } else {
            let mut out = String::from(MULTI_ZONE_PREFIX);
            for c in &hsv {
                out.push_str(&hex_field(c.h as u32, 2));
                out.push_str(&hex_field(c.s as u32, 2));
                out.push_str(&hex_field(c.v as u32, 2));
            }
            out.push_str(&hex_field(hsv.len() as u32, 2));
            out.push_str(&channel_map(topology.physical_leds()));
            out
        }
    }

    /// Binary form of [`encode`](Self::encode), ready for encryption.
    pub fn encode_bytes(&self, topology: &LedTopology, samples: &[Rgb]) -> Result<Vec<u8>> {
        Ok(hex::decode(self.encode(topology, samples))?)
    }

    fn sanitize(&self, color: &Rgb) -> Rgb {
        if color.is_valid() {
            *color
        } else {
            log::debug!("Replacing invalid color {:?} with fallback {}", color, self.fallback);
            self.fallback
        }
    }
}

/// One segment code per physical LED: `01` for LEDs 1-4, `02` for 5-8,
/// `03` for 9-12, `04` for 13-16, and `01` past 16.
pub fn channel_map(physical_leds: usize) -> String {
    (1..=physical_leds)
        .map(|i| match i {
            1..=4 => "01",
            5..=8 => "02",
            9..=12 => "03",
            13..=16 => "04",
            _ => "01",
        })
        .collect()
}

/// Lowercase hex of `value`, zero padded to `width`, truncated to its first
/// `width` characters when wider (hue 300 becomes `12`).
pub fn hex_field(value: u32, width: usize) -> String {
    let text = format!("{:x}", value);
    if text.len() >= width {
        text[..width].to_string()
    } else {
        format!("{:0>width$}", text, width = width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb(r: f64, g: f64, b: f64) -> Rgb {
        Rgb::new(r, g, b)
    }

    #[test]
    fn converts_primary_colors() {
        assert_eq!(rgb(255.0, 0.0, 0.0).to_hsv(), Hsv { h: 0, s: 100, v: 100 });
        assert_eq!(rgb(0.0, 255.0, 0.0).to_hsv(), Hsv { h: 120, s: 100, v: 100 });
        assert_eq!(rgb(0.0, 0.0, 255.0).to_hsv(), Hsv { h: 240, s: 100, v: 100 });
        assert_eq!(rgb(0.0, 0.0, 0.0).to_hsv(), Hsv { h: 0, s: 0, v: 0 });
        assert_eq!(rgb(255.0, 255.0, 255.0).to_hsv(), Hsv { h: 0, s: 0, v: 100 });
    }

    #[test]
    fn hue_never_reaches_360() {
        // just below red on the magenta side
        let hsv = rgb(255.0, 0.0, 1.0).to_hsv();
        assert_eq!(hsv.h, 0);
    }

    #[test]
    fn single_channel_brand_blue() {
        let color: Rgb = "#009BDE".parse().unwrap();
        let hsv = color.to_hsv();
        assert_eq!(hsv, Hsv { h: 198, s: 100, v: 87 });

        let payload = ColorEncoder::default().encode(&LedTopology::new(1), &[color]);
        assert_eq!(payload, "c6a800000100");
        assert!(payload.ends_with(SINGLE_ZONE_SUFFIX));
    }

    #[test]
    fn single_channel_hue_field_is_two_hex_wide() {
        // hue 200
        let color = rgb(0.0, 170.0, 255.0);
        assert_eq!(color.to_hsv().h, 200);
        let payload = ColorEncoder::default().encode(&LedTopology::new(1), &[color]);
        assert_eq!(&payload[..2], "c8");

        // hue 300 = 0x12c, truncated to its first two digits
        let magenta = rgb(255.0, 0.0, 255.0);
        let payload = ColorEncoder::default().encode(&LedTopology::new(1), &[magenta]);
        assert_eq!(&payload[..4], "12aa");
    }

    #[test]
    fn multi_channel_layout() {
        let topology = LedTopology::new(10);
        assert_eq!(topology.channels(), 4);
        let samples = [
            rgb(255.0, 0.0, 0.0),
            rgb(0.0, 255.0, 0.0),
            rgb(0.0, 0.0, 255.0),
            rgb(0.0, 0.0, 0.0),
        ];
        let payload = ColorEncoder::default().encode(&topology, &samples);

        let expected = concat!(
            "0004",
            "006464", "786464", "f06464", "000000",
            "04",
            "01010101", "02020202", "0303",
        );
        assert_eq!(payload, expected);
        assert_eq!(payload.len() % 2, 0);
    }

    #[test]
    fn channel_map_blocks_of_four() {
        for physical in 2..=16 {
            let map = channel_map(physical);
            assert_eq!(map.len(), physical * 2);
            for (i, code) in map.as_bytes().chunks(2).enumerate() {
                let expected = format!("{:02x}", i / 4 + 1);
                assert_eq!(std::str::from_utf8(code).unwrap(), expected);
            }
        }
        assert_eq!(&channel_map(18)[32..], "0101");
    }

    #[test]
    fn invalid_samples_use_fallback() {
        let encoder = ColorEncoder::default();
        let topology = LedTopology::new(1);
        let expected = encoder.encode(&topology, &[DEFAULT_FALLBACK]);

        for bad in [
            rgb(f64::NAN, 0.0, 0.0),
            rgb(0.0, f64::INFINITY, 0.0),
            rgb(0.0, 0.0, 256.0),
            rgb(-1.0, 0.0, 0.0),
        ] {
            let payload = encoder.encode(&topology, &[bad]);
            assert_eq!(payload, expected);
            assert!(payload.chars().all(|c| c.is_ascii_hexdigit()));
        }

        let custom = ColorEncoder::new(rgb(255.0, 0.0, 0.0));
        let payload = custom.encode(&LedTopology::new(2), &[rgb(f64::NAN, 1.0, 1.0), rgb(0.0, 0.0, 0.0)]);
        assert_eq!(&payload[4..10], "006464");
    }

    #[test]
    fn invalid_fallback_is_replaced() {
        let encoder = ColorEncoder::new(rgb(f64::NAN, 0.0, 0.0));
        assert_eq!(encoder.fallback(), DEFAULT_FALLBACK);
    }

    #[test]
    fn empty_samples_encode_fallback() {
        let encoder = ColorEncoder::default();
        assert_eq!(
            encoder.encode(&LedTopology::new(1), &[]),
            encoder.encode(&LedTopology::new(1), &[DEFAULT_FALLBACK])
        );
    }

    #[test]
    fn topology_caps_channels() {
        let t = LedTopology::new(3);
        assert_eq!(t.channels(), 3);
        assert_eq!(t.led_names(), vec!["Led 1", "Led 2", "Led 3"]);
        assert_eq!(t.led_positions(), vec![(0, 0), (1, 0), (2, 0)]);
        assert_eq!(LedTopology::new(0).physical_leds(), 1);
        assert_eq!(LedTopology::new(20).size(), (4, 1));
    }

    #[test]
    fn hex_field_pads_and_truncates() {
        assert_eq!(hex_field(200, 2), "c8");
        assert_eq!(hex_field(8, 2), "08");
        assert_eq!(hex_field(300, 2), "12");
        assert_eq!(hex_field(10, 1), "a");
        assert_eq!(hex_field(0, 1), "0");
    }

    #[test]
    fn rgb_parses_and_serializes_as_hex() {
        let c: Rgb = serde_json::from_str("\"#8000FF\"").unwrap();
        assert_eq!(c, rgb(128.0, 0.0, 255.0));
        assert_eq!(serde_json::to_string(&c).unwrap(), "\"#8000ff\"");
        assert!("#12345".parse::<Rgb>().is_err());
        assert!(serde_json::from_str::<Rgb>("\"nothex\"").is_err());
    }
}
