//! `sq-common`: shared types, traits, and errors for the Squeeze video compressor.
//!
//! Every other crate in the workspace depends on this one. It defines:
//!
//! - **Types**: `Resolution`, `Rotation`, `Micros`
//! - **Media**: `TrackFormat`, `BufferInfo`, `BufferFlags` (data flow between demuxer, codecs, muxer)
//! - **Codec traits**: `VideoDecoder`, `VideoEncoder`, `FrameTransfer`, `CodecFactory`
//! - **Source**: `VideoMetadata`, `SourceDescriptor`
//! - **Config**: `CompressionConfig`, `VideoQuality`, `Resizer`
//! - **Errors**: `MetadataError`, `DemuxError`, `ConfigError`, `CodecError` (thiserror-based)

pub mod codec;
pub mod codec_api;
pub mod config;
pub mod error;
pub mod media;
pub mod source;
pub mod types;

// Re-export commonly used items at crate root
pub use codec::{AudioCodec, ContainerFormat, VideoCodec};
pub use codec_api::{
    Codec, CodecFactory, FrameTransfer, OutputStatus, VideoDecoder, VideoEncoder,
    DEFAULT_CODEC_TIMEOUT,
};
pub use config::{CompressionConfig, Resizer, VideoQuality};
pub use error::{CodecError, ConfigError, DemuxError, MetadataError};
pub use media::{BufferFlags, BufferInfo, TrackFormat};
pub use source::{SourceDescriptor, VideoMetadata};
pub use types::{Micros, Resolution, Rotation};
