//! Engine error type.

use sq_common::{CodecError, ConfigError, DemuxError, MetadataError};
use sq_mux::MuxError;
use thiserror::Error;

/// Message reported for a job stopped through its cancellation token.
pub const CANCELLED_MESSAGE: &str = "stopped";

/// Failure message of a job whose worker thread panicked.
pub const PANICKED_MESSAGE: &str = "compression thread panicked";

/// Everything that can end a compression job early.
#[derive(Error, Debug)]
pub enum CompressError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Demux(#[from] DemuxError),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(
        "Source bitrate {bitrate} bps is too low to compress further; \
         disable min_bitrate_check to compress it anyway"
    )]
    BitrateTooLow { bitrate: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Source has no video track")]
    NoVideoTrack,

    #[error("{}", CANCELLED_MESSAGE)]
    Cancelled,

    #[error("Failed to place output: {0}")]
    Placement(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompressError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Errors raised before any job thread exists.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::InvalidConfig(_) | Self::BitrateTooLow { .. }
        )
    }
}

pub type CompressResult<T> = Result<T, CompressError>;
