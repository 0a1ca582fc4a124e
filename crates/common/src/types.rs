//! Core value types: resolution, rotation, and microsecond timestamps.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Video resolution in pixels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Self = Self {
        width: 1920,
        height: 1080,
    };

    /// Substituted when a source does not declare its dimensions.
    pub const FALLBACK: Self = Self {
        width: 368,
        height: 640,
    };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect_ratio(self) -> f64 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f64 / self.height as f64
    }

    /// Same resolution with width and height exchanged.
    pub fn transposed(self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Display rotation of a video track, clockwise.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    /// Parse a rotation in degrees. Only the four right angles are accepted.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Self::None),
            90 => Some(Self::Cw90),
            180 => Some(Self::Cw180),
            270 => Some(Self::Cw270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Cw90 => 90,
            Self::Cw180 => 180,
            Self::Cw270 => 270,
        }
    }

    /// Quarter turns exchange the displayed width and height.
    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Self::Cw90 | Self::Cw270)
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

/// Timestamp or duration in microseconds.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Micros(pub u64);

impl Micros {
    pub const ZERO: Self = Self(0);

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Convert to ticks of `timescale`, rounding to nearest.
    pub fn to_timescale(self, timescale: u32) -> u64 {
        ((self.0 as u128 * timescale as u128 + 500_000) / 1_000_000) as u64
    }

    /// Whole ticks of `timescale` at or before this time.
    pub fn to_timescale_floor(self, timescale: u32) -> u64 {
        (self.0 as u128 * timescale as u128 / 1_000_000) as u64
    }

    /// Fewest ticks of `timescale` at or after this time.
    pub fn to_timescale_ceil(self, timescale: u32) -> u64 {
        (self.0 as u128 * timescale as u128).div_ceil(1_000_000) as u64
    }

    /// Convert from ticks of `timescale`.
    pub fn from_timescale(ticks: u64, timescale: u32) -> Self {
        if timescale == 0 {
            return Self::ZERO;
        }
        Self((ticks as u128 * 1_000_000 / timescale as u128) as u64)
    }
}

impl fmt::Display for Micros {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_ms = self.0 / 1000;
        let mins = total_ms / 60_000;
        let secs = (total_ms / 1000) % 60;
        let ms = total_ms % 1000;
        write!(f, "{mins:02}:{secs:02}.{ms:03}")
    }
}
