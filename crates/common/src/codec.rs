//! Codec and container identifiers, with their MIME strings.

use serde::{Deserialize, Serialize};

/// MIME type of H.264/AVC video.
pub const MIME_VIDEO_AVC: &str = "video/avc";
/// MIME type of AAC audio.
pub const MIME_AUDIO_AAC: &str = "audio/mp4a-latm";
/// MIME type of MPEG-1/2 layer III audio.
pub const MIME_AUDIO_MPEG: &str = "audio/mpeg";

/// Video codec identifier. Only AVC is produced by the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
}

impl VideoCodec {
    pub fn mime(self) -> &'static str {
        match self {
            Self::H264 => MIME_VIDEO_AVC,
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            MIME_VIDEO_AVC => Some(Self::H264),
            _ => None,
        }
    }
}

/// Audio codec identifier for passthrough tracks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioCodec {
    Aac,
    Mp3,
}

impl AudioCodec {
    pub fn mime(self) -> &'static str {
        match self {
            Self::Aac => MIME_AUDIO_AAC,
            Self::Mp3 => MIME_AUDIO_MPEG,
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            MIME_AUDIO_AAC => Some(Self::Aac),
            MIME_AUDIO_MPEG => Some(Self::Mp3),
            _ => None,
        }
    }

    /// MPEG-4 `objectTypeIndication` used in the `esds` decoder config.
    pub fn object_type_indication(self) -> u8 {
        match self {
            Self::Aac => 0x40,
            Self::Mp3 => 0x69,
        }
    }

    pub fn from_object_type_indication(oti: u8) -> Option<Self> {
        match oti {
            0x40 | 0x66 | 0x67 | 0x68 => Some(Self::Aac),
            0x69 | 0x6B => Some(Self::Mp3),
            _ => None,
        }
    }
}

/// Container format.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerFormat {
    /// ISO BMFF (MP4, M4V).
    Mp4,
    /// QuickTime (MOV), same box structure.
    QuickTime,
}

impl ContainerFormat {
    pub fn file_extensions(self) -> &'static [&'static str] {
        match self {
            Self::Mp4 => &["mp4", "m4v"],
            Self::QuickTime => &["mov"],
        }
    }
}

/// True if the MIME type names a video track.
pub fn is_video_mime(mime: &str) -> bool {
    mime.starts_with("video/")
}

/// True if the MIME type names an audio track.
pub fn is_audio_mime(mime: &str) -> bool {
    mime.starts_with("audio/")
}
