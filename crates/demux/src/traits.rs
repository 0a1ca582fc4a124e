//! Demuxer trait definition.

use sq_common::{BufferFlags, DemuxError, Micros, TrackFormat};

/// Where `seek_to` lands relative to the requested time.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SeekMode {
    /// Last sync sample at or before the time.
    #[default]
    PreviousSync,
    /// First sync sample at or after the time.
    NextSync,
    /// Whichever of the two is nearer.
    ClosestSync,
}

/// Sample-level access to a source container.
///
/// Tracks are addressed by index. Only selected tracks contribute samples;
/// when several are selected, samples come out ordered by decode time.
/// Video samples are delivered in Annex-B form, audio samples as stored.
pub trait SourceDemuxer {
    fn track_count(&self) -> usize;

    fn track_format(&self, index: usize) -> Result<TrackFormat, DemuxError>;

    fn select_track(&mut self, index: usize) -> Result<(), DemuxError>;

    fn unselect_track(&mut self, index: usize) -> Result<(), DemuxError>;

    /// Reposition every selected track near `time`.
    fn seek_to(&mut self, time: Micros, mode: SeekMode) -> Result<(), DemuxError>;

    /// Copy the current sample into `buf` and return its length, or `None`
    /// when no selected track has samples left.
    ///
    /// Fails with [`DemuxError::BufferTooSmall`] when the sample does not fit;
    /// the position is left unchanged in that case.
    fn read_sample_data(&mut self, buf: &mut [u8]) -> Result<Option<usize>, DemuxError>;

    /// Track index of the current sample.
    fn sample_track_index(&self) -> Option<usize>;

    /// Presentation time of the current sample.
    fn sample_time(&self) -> Option<Micros>;

    fn sample_flags(&self) -> BufferFlags;

    /// Stored size of the current sample in bytes.
    fn sample_size(&self) -> Option<usize>;

    /// Move to the next sample. Returns false once the selected tracks
    /// are exhausted.
    fn advance(&mut self) -> bool;
}
