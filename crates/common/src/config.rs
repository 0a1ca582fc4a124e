//! User-facing compression settings.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Quality tier. The only quality knob: selects the bitrate factor.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoQuality {
    VeryLow,
    Low,
    #[default]
    Medium,
    High,
    VeryHigh,
}

impl VideoQuality {
    pub const ALL: [Self; 5] = [
        Self::VeryLow,
        Self::Low,
        Self::Medium,
        Self::High,
        Self::VeryHigh,
    ];
}

/// How output dimensions are derived from the source dimensions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resizer {
    /// Scale by a factor chosen from the larger source dimension.
    #[default]
    Auto,
    /// Scale both dimensions by a fixed factor.
    Scale { factor: f64 },
    /// Shrink to fit inside the box if either dimension reaches it.
    LimitSize { max_width: f64, max_height: f64 },
    /// Fit to the box, or fill it exactly when `stretch` is set.
    MatchSize {
        width: f64,
        height: f64,
        #[serde(default)]
        stretch: bool,
    },
}

impl Resizer {
    pub fn scale(factor: f64) -> Self {
        Self::Scale { factor }
    }

    pub fn limit_size(limit: f64) -> Self {
        Self::LimitSize {
            max_width: limit,
            max_height: limit,
        }
    }

    pub fn match_size(width: f64, height: f64, stretch: bool) -> Self {
        Self::MatchSize {
            width,
            height,
            stretch,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        match self {
            Self::Auto => Ok(()),
            Self::Scale { factor } if positive(*factor) => Ok(()),
            Self::LimitSize {
                max_width,
                max_height,
            } if positive(*max_width) && positive(*max_height) => Ok(()),
            Self::MatchSize { width, height, .. } if positive(*width) && positive(*height) => {
                Ok(())
            }
            other => Err(ConfigError::InvalidResizer(format!("{other:?}"))),
        }
    }
}

/// Settings for one compression call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub quality: VideoQuality,
    /// Reject sources at or below the minimum bitrate instead of compressing.
    pub min_bitrate_check: bool,
    /// Explicit target bitrate in bits per second.
    pub video_bitrate: Option<u64>,
    /// Explicit target width. Must be set together with `video_height`.
    pub video_width: Option<f64>,
    /// Explicit target height. Must be set together with `video_width`.
    pub video_height: Option<f64>,
    pub disable_audio: bool,
    /// `None` keeps the source resolution.
    pub resizer: Option<Resizer>,
    /// Run the fast-start pass on the finished file.
    pub streamable: bool,
    /// Used when the source does not declare a frame rate.
    pub frame_rate: u32,
    /// Seconds between key frames, used when the source does not declare it.
    pub i_frame_interval: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            quality: VideoQuality::Medium,
            min_bitrate_check: true,
            video_bitrate: None,
            video_width: None,
            video_height: None,
            disable_audio: false,
            resizer: Some(Resizer::Auto),
            streamable: false,
            frame_rate: 30,
            i_frame_interval: 1,
        }
    }
}

impl CompressionConfig {
    pub fn with_quality(mut self, quality: VideoQuality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_bitrate_mbps(mut self, mbps: f64) -> Self {
        self.video_bitrate = Some((mbps * 1_000_000.0).round() as u64);
        self
    }

    pub fn with_dimensions(mut self, width: f64, height: f64) -> Self {
        self.video_width = Some(width);
        self.video_height = Some(height);
        self
    }

    /// Explicit target dimensions, if both are set.
    pub fn explicit_dimensions(&self) -> Option<(f64, f64)> {
        self.video_width.zip(self.video_height)
    }

    /// Check the settings before any I/O happens.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (self.video_width, self.video_height) {
            (Some(width), Some(height)) => {
                if !(width.is_finite() && height.is_finite() && width >= 1.0 && height >= 1.0) {
                    return Err(ConfigError::InvalidDimensions { width, height });
                }
            }
            (None, None) => {}
            _ => return Err(ConfigError::PartialDimensions),
        }

        if self.video_bitrate == Some(0) {
            return Err(ConfigError::InvalidBitrate);
        }

        if let Some(resizer) = &self.resizer {
            resizer.validate()?;
        }

        Ok(())
    }
}
