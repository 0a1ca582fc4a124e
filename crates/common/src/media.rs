//! Track formats and per-buffer metadata exchanged between demuxer, codecs,
//! and muxer.

use std::fmt;
use std::ops::BitOr;

use crate::codec::{is_audio_mime, is_video_mime};

/// Format parameters of one track, as read from a container or reported by
/// a codec after a format change.
///
/// Every field except `mime` is optional; consumers fall back to their own
/// defaults when a value is absent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackFormat {
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channel_count: Option<u32>,
    /// First codec-specific blob: SPS for AVC, AudioSpecificConfig for AAC.
    pub csd0: Option<Vec<u8>>,
    /// Second codec-specific blob: PPS for AVC.
    pub csd1: Option<Vec<u8>>,
    /// Largest sample in the track, in bytes.
    pub max_input_size: Option<usize>,
    pub frame_rate: Option<u32>,
    /// Seconds between key frames requested from an encoder.
    pub i_frame_interval: Option<u32>,
    pub bitrate: Option<u64>,
    pub duration_us: Option<u64>,
    pub color_standard: Option<i32>,
    pub color_transfer: Option<i32>,
    pub color_range: Option<i32>,
}

impl TrackFormat {
    pub fn video(mime: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            mime: mime.into(),
            width: Some(width),
            height: Some(height),
            ..Self::default()
        }
    }

    pub fn audio(mime: impl Into<String>, sample_rate: u32, channel_count: u32) -> Self {
        Self {
            mime: mime.into(),
            sample_rate: Some(sample_rate),
            channel_count: Some(channel_count),
            ..Self::default()
        }
    }

    pub fn is_video(&self) -> bool {
        is_video_mime(&self.mime)
    }

    pub fn is_audio(&self) -> bool {
        is_audio_mime(&self.mime)
    }
}

/// Flags attached to a codec buffer.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    pub const KEY_FRAME: Self = Self(1);
    pub const CODEC_CONFIG: Self = Self(2);
    pub const END_OF_STREAM: Self = Self(4);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits & 0x7)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_key_frame(self) -> bool {
        self.contains(Self::KEY_FRAME)
    }

    pub fn is_codec_config(self) -> bool {
        self.contains(Self::CODEC_CONFIG)
    }

    pub fn is_end_of_stream(self) -> bool {
        self.contains(Self::END_OF_STREAM)
    }
}

impl BitOr for BufferFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for BufferFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.is_key_frame() {
            names.push("KEY_FRAME");
        }
        if self.is_codec_config() {
            names.push("CODEC_CONFIG");
        }
        if self.is_end_of_stream() {
            names.push("END_OF_STREAM");
        }
        if names.is_empty() {
            write!(f, "BufferFlags(NONE)")
        } else {
            write!(f, "BufferFlags({})", names.join(" | "))
        }
    }
}

/// Describes the valid region and timing of a codec or sample buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferInfo {
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: u64,
    pub flags: BufferFlags,
}

impl BufferInfo {
    pub fn new(offset: usize, size: usize, presentation_time_us: u64, flags: BufferFlags) -> Self {
        Self {
            offset,
            size,
            presentation_time_us,
            flags,
        }
    }

    /// End of the valid region within the buffer.
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}
