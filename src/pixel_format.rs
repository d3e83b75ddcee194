use serde::{Deserialize, Serialize};

use crate::pixel::Rgb;

/// Order in which a pixel's channels go on the wire.
/// WS2812-style strips usually want GRB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum ChannelOrder {
    #[default]
    #[serde(rename = "RGB")]
    Rgb,
    #[serde(rename = "GRB")]
    Grb,
    #[serde(rename = "BGR")]
    Bgr,
}

impl ChannelOrder {
    /// Wire bytes for one pixel
    pub fn encode(self, c: Rgb) -> [u8; 3] {
        match self {
            ChannelOrder::Rgb => [c.r, c.g, c.b],
            ChannelOrder::Grb => [c.g, c.r, c.b], // Swap R and G
            ChannelOrder::Bgr => [c.b, c.g, c.r], // Swap R and B
        }
    }

    /// Inverse of [`ChannelOrder::encode`]
    pub fn decode(self, bytes: [u8; 3]) -> Rgb {
        let [a, b, c] = bytes;
        match self {
            ChannelOrder::Rgb => Rgb::new(a, b, c),
            ChannelOrder::Grb => Rgb::new(b, a, c),
            ChannelOrder::Bgr => Rgb::new(c, b, a),
        }
    }
}
