//! `sq-mux`: MP4 writer and fast-start rewriter for Squeeze.
//!
//! - **Box model** ([`boxes`]): ftyp/moov/mdat writers. moov is serialized
//!   into a [`BoxWriter`] and its chunk offsets patched once the payload
//!   position is known, switching to co64 when needed.
//! - **Multiplexer** ([`MediaMuxer`]): takes encoded samples per track and
//!   lays out `ftyp, moov, mdat` (default) or `ftyp, mdat, moov`.
//! - **Fast start** ([`make_fast_start`]): moves a trailing moov ahead of
//!   mdat without touching the media data.
//!
//! ```ignore
//! use sq_mux::{MediaMuxer, Mp4Movie};
//!
//! let mut muxer = MediaMuxer::create_movie(Mp4Movie::new("out.mp4"))?;
//! let video = muxer.add_track(&encoder_output_format, false)?;
//! muxer.write_sample_data(video, &buffer, &info)?;
//! muxer.finish_movie()?;
//! ```

pub mod atoms;
pub mod boxes;
pub mod error;
pub mod faststart;
pub mod muxer;
pub mod nal;
pub mod track;

pub use boxes::{BoxWriter, ChunkOffsetSlots};
pub use error::{MuxError, MuxResult};
pub use faststart::{faststart_in_place, make_fast_start, FastStart};
pub use muxer::{MediaMuxer, MoovPlacement, Mp4Movie};
pub use track::{Sample, SampleDescription, Track};
