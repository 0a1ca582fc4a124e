//! Shared error types (thiserror-based).

use thiserror::Error;

/// Failure to read the metadata a compression job needs from its source.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Failed to open source: {0}")]
    Unreadable(String),

    #[error("Unsupported container format")]
    UnsupportedContainer,

    #[error("Failed to extract video meta-data: missing {0}")]
    MissingField(&'static str),

    #[error("Unsupported rotation matrix ({0} degrees)")]
    InvalidRotation(i32),

    #[error("Malformed container: {0}")]
    Demux(#[from] DemuxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source container parsing errors.
#[derive(Error, Debug)]
pub enum DemuxError {
    #[error("Unsupported container format")]
    UnsupportedContainer,

    #[error("Invalid box at offset {offset}: {reason}")]
    InvalidStructure { offset: u64, reason: String },

    #[error("No video track found")]
    NoVideoTrack,

    #[error("Track index {0} out of range")]
    NoSuchTrack(usize),

    #[error("Sample of {needed} bytes does not fit a {capacity} byte buffer")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("Truncated data: expected {expected} bytes, got {got}")]
    TruncatedData { expected: usize, got: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Compression settings rejected before any I/O.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Both video width and height must be set, or neither")]
    PartialDimensions,

    #[error("Video dimensions must be positive, got {width}x{height}")]
    InvalidDimensions { width: f64, height: f64 },

    #[error("Video bitrate override must be positive")]
    InvalidBitrate,

    #[error("Invalid resizer: {0}")]
    InvalidResizer(String),
}

/// Errors reported by a hardware codec or the frame transfer path.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Codec configuration failed: {0}")]
    Configure(String),

    #[error("No codec available for {0}")]
    Unsupported(String),

    #[error("Unexpected {stage} output status: {status}")]
    UnexpectedStatus { stage: &'static str, status: i32 },

    #[error("{stage} buffer {index} was null")]
    NullBuffer { stage: &'static str, index: usize },

    #[error("Frame transfer failed: {0}")]
    FrameTransfer(String),

    #[error("Codec failed: {0}")]
    Failed(String),
}
