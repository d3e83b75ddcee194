use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::pixel_format::ChannelOrder;

/// Bytes per LED on the wire
pub const BYTES_PER_LED: usize = 3;

/// A single RGB color
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "ColorRepr", into = "String")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Rgb { r, g, b }
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl From<Rgb> for String {
    fn from(c: Rgb) -> Self {
        c.to_string()
    }
}

impl FromStr for Rgb {
    type Err = String;

    /// Parses `#rrggbb` (the leading `#` is optional)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(format!("invalid color {:?}: expected #rrggbb", s));
        }
        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| format!("invalid color {:?}: bad hex digits", s))
        };
        Ok(Rgb::new(channel(0)?, channel(2)?, channel(4)?))
    }
}

/// Accepted config spellings of a color
#[derive(Deserialize)]
#[serde(untagged)]
enum ColorRepr {
    Hex(String),
    Channels([u8; 3]),
}

impl TryFrom<ColorRepr> for Rgb {
    type Error = String;

    fn try_from(repr: ColorRepr) -> Result<Self, Self::Error> {
        match repr {
            ColorRepr::Hex(s) => s.parse(),
            ColorRepr::Channels([r, g, b]) => Ok(Rgb::new(r, g, b)),
        }
    }
}

/// State of the whole strip. The length is fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pixels: Vec<Rgb>,
}

impl PixelBuffer {
    /// Create a strip of `num_leds` pixels, all off
    pub fn new(num_leds: usize) -> Self {
        PixelBuffer {
            pixels: vec![Rgb::BLACK; num_leds],
        }
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn as_slice(&self) -> &[Rgb] {
        &self.pixels
    }

    /// Turn every pixel off
    pub fn clear(&mut self) {
        self.pixels.fill(Rgb::BLACK);
    }

    /// Mutable sub-view over `range`, clamped to the strip.
    /// Returns `None` when the range starts past the end.
    pub fn view_mut(&mut self, range: Range<usize>) -> Option<&mut [Rgb]> {
        let end = range.end.min(self.pixels.len());
        if range.start > end {
            return None;
        }
        Some(&mut self.pixels[range.start..end])
    }

    /// Serialize the strip into `out` (cleared first), one channel at a time
    pub fn write_channels(&self, order: ChannelOrder, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(self.pixels.len() * BYTES_PER_LED);
        for &pixel in &self.pixels {
            out.extend_from_slice(&order.encode(pixel));
        }
    }

    /// Load the strip from wire bytes. Trailing bytes that do not fill a whole
    /// pixel, or pixels beyond the strip, are ignored. Returns pixels loaded.
    pub fn load_channels(&mut self, order: ChannelOrder, data: &[u8]) -> usize {
        let mut loaded = 0;
        for (pixel, chunk) in self.pixels.iter_mut().zip(data.chunks_exact(BYTES_PER_LED)) {
            *pixel = order.decode([chunk[0], chunk[1], chunk[2]]);
            loaded += 1;
        }
        loaded
    }
}
