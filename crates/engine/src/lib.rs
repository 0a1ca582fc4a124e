//! `sq-engine`: the Squeeze compression engine.
//!
//! Takes a probed source and a [`CompressionConfig`](sq_common::CompressionConfig),
//! decides the target bitrate and resolution ([`policy`]), re-encodes the
//! video track through host-provided codecs ([`transcoder`]), copies audio
//! verbatim ([`audio`]), and writes an MP4 through `sq-mux`.
//!
//! Jobs run on worker threads started by [`Compressor`]; callers follow them
//! through [`JobHandle`] / [`BatchHandle`] events and cancel them with a
//! per-job token.
//!
//! ```ignore
//! let compressor = Compressor::new(Arc::new(host_codecs));
//! let source = sq_demux::open_source(Path::new("in.mp4"))?;
//! let job = compressor.compress(source, "out.mp4", CompressionConfig::default())?;
//! while let Some(event) = job.recv_event() {
//!     println!("{event:?}");
//! }
//! let result = job.join();
//! ```

pub mod audio;
pub mod compressor;
pub mod error;
pub mod job;
pub mod policy;
pub mod session;
pub mod storage;
pub mod transcoder;

pub use compressor::{Compressor, EngineOptions};
pub use error::{CompressError, CompressResult};
pub use job::{
    BatchHandle, CancellationToken, CompressionEvent, CompressionResult, EventKind,
    EventListener, JobHandle, JobState,
};
pub use policy::{plan, CompressionPlan, MIN_BITRATE};
pub use session::CodecSession;
pub use storage::{
    validated_file_name, AppSpecificStorage, CacheStorage, KeepInPlace, OutputPlacement,
    SaveLocation, SharedStorage,
};
pub use transcoder::VideoTranscoder;
