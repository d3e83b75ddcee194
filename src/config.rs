use std::fmt;
use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pixel::Rgb;
use crate::pixel_format::ChannelOrder;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Serial device, usually /dev/ttyUSB0 or /dev/ttyACM0
    pub device: String,
    pub baud_rate: u32,
    /// Frames per second
    pub rate: u32,
    #[serde(default)]
    pub pacing: Pacing,
    /// How long an unacknowledged frame may hold back the next one.
    /// `null` waits forever.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: Option<u64>,
    /// How long the controller gets to acknowledge the initialize packet
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    #[serde(default)]
    pub pixel_format: ChannelOrder,
    /// Send a clear packet when shutting down
    #[serde(default = "default_clear_on_exit")]
    pub clear_on_exit: bool,
    pub leds: Vec<LedConfig>,
}

fn default_ack_timeout_ms() -> Option<u64> {
    Some(1000)
}

fn default_init_timeout_ms() -> u64 {
    2000
}

fn default_clear_on_exit() -> bool {
    true
}

/// How frame sends are paced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pacing {
    /// Hold back frames until the previous one is acknowledged
    #[default]
    Ack,
    /// Send on every tick regardless of acknowledgements
    Timer,
}

/// One contiguous range of LEDs and what to show on it.
/// At most one of `color`, `snake` and `visualizer` may be set; with none the
/// range stays dark.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedConfig {
    /// Half-open `[start, end)`
    pub range: [usize; 2],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Rgb>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snake: Option<SnakeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visualizer: Option<VisualizerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnakeConfig {
    pub chunks: Vec<SnakeChunk>,
    /// Time per one-LED step
    pub speed_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnakeChunk {
    pub color: Rgb,
    #[serde(default = "default_chunk_length")]
    pub length: usize,
}

fn default_chunk_length() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VisualizerConfig {
    pub kind: VisualizerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VisualizerKind {
    Glowing,
    Blinking,
    Meter,
}

impl fmt::Display for VisualizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VisualizerKind::Glowing => "glowing",
            VisualizerKind::Blinking => "blinking",
            VisualizerKind::Meter => "meter",
        })
    }
}

/// What a [`LedConfig`] shows
#[derive(Debug, Clone, Copy)]
pub enum Content<'a> {
    Color(Rgb),
    Snake(&'a SnakeConfig),
    Visualizer(&'a VisualizerConfig),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no LEDs configured")]
    NoLeds,

    #[error("{count} LEDs configured, at most {max} supported")]
    TooManyLeds { count: usize, max: usize },

    #[error("LED range {0:?} is empty")]
    EmptyRange([usize; 2]),

    #[error("LED range {0:?} overlaps with {1:?}")]
    OverlappingRanges([usize; 2], [usize; 2]),

    #[error("LED range {0:?} sets more than one of color, snake and visualizer")]
    MultipleContents([usize; 2]),

    #[error("refresh rate must be above zero")]
    ZeroRate,

    #[error("invalid snake animation on LED range {range:?}: {reason}")]
    InvalidSnake {
        range: [usize; 2],
        reason: &'static str,
    },

    #[error("{0} animations are not supported")]
    UnsupportedAnimation(String),
}

impl Config {
    /// Read and parse a JSON config file. Does not validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate == 0 {
            return Err(ConfigError::ZeroRate);
        }

        for led in &self.leds {
            if led.range[0] >= led.range[1] {
                return Err(ConfigError::EmptyRange(led.range));
            }
            if let Some(Content::Snake(snake)) = led.content()? {
                validate_snake(led.range, snake)?;
            }
        }

        let count = self.num_leds();
        if count == 0 {
            return Err(ConfigError::NoLeds);
        }
        if count > u16::MAX as usize {
            return Err(ConfigError::TooManyLeds {
                count,
                max: u16::MAX as usize,
            });
        }

        // Check for overlapping LED ranges
        for (i, a) in self.leds.iter().enumerate() {
            for b in &self.leds[i + 1..] {
                if a.range[0] < b.range[1] && b.range[0] < a.range[1] {
                    return Err(ConfigError::OverlappingRanges(a.range, b.range));
                }
            }
        }

        Ok(())
    }

    /// Strip length: the end of the highest range
    pub fn num_leds(&self) -> usize {
        self.leds.iter().map(|led| led.range[1]).max().unwrap_or(0)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(1) / self.rate.max(1)
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_ms.map(Duration::from_millis)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

fn validate_snake(range: [usize; 2], snake: &SnakeConfig) -> Result<(), ConfigError> {
    let reason = if snake.speed_ms == 0 {
        "speed_ms must be above zero"
    } else if snake.chunks.is_empty() {
        "no chunks"
    } else if snake.chunks.iter().any(|c| c.length == 0) {
        "chunk length must be above zero"
    } else {
        return Ok(());
    };
    Err(ConfigError::InvalidSnake { range, reason })
}

impl LedConfig {
    pub fn led_range(&self) -> Range<usize> {
        self.range[0]..self.range[1]
    }

    pub fn content(&self) -> Result<Option<Content<'_>>, ConfigError> {
        let mut found = None;
        let candidates = [
            self.color.map(Content::Color),
            self.snake.as_ref().map(Content::Snake),
            self.visualizer.as_ref().map(Content::Visualizer),
        ];
        for content in candidates.into_iter().flatten() {
            if found.is_some() {
                return Err(ConfigError::MultipleContents(self.range));
            }
            found = Some(content);
        }
        Ok(found)
    }
}
