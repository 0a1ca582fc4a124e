//! `sq-demux`: MP4 source parser and metadata prober.
//!
//! Reads ISO BMFF containers without decoding: `probe` extracts the
//! metadata a compression job is planned from, and [`Mp4Demuxer`] serves
//! individual samples to the transcode engine. No FFmpeg dependency.

pub mod mp4;
pub mod nal;
pub mod probe;
pub mod traits;

pub use mp4::Mp4Demuxer;
pub use probe::{detect_format, detect_format_from_magic, open_source, probe, probe_reader};
pub use traits::{SeekMode, SourceDemuxer};
