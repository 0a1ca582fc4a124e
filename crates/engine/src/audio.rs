//! Audio passthrough: copies compressed audio samples into the output
//! unchanged.

use sq_common::{BufferFlags, BufferInfo, DemuxError, Micros};
use sq_demux::{SeekMode, SourceDemuxer};
use sq_mux::MediaMuxer;
use tracing::{info, trace, warn};

use crate::error::{CompressError, CompressResult};
use crate::job::CancellationToken;

/// Read buffer size when the source does not declare its largest sample.
pub const DEFAULT_AUDIO_BUFFER_SIZE: usize = 64 * 1024;

/// Copy every sample of audio track `track_index` into a new muxer track.
/// Returns the number of samples copied.
///
/// The muxer track is created with the first sample, so a track without
/// samples leaves the output without audio.
pub fn copy_audio_track<D: SourceDemuxer + ?Sized>(
    demuxer: &mut D,
    muxer: &mut MediaMuxer,
    track_index: usize,
    cancel: &CancellationToken,
) -> CompressResult<u64> {
    let format = demuxer.track_format(track_index)?;
    let mut track_id = None;

    let initial = format
        .max_input_size
        .filter(|&size| size > 0)
        .unwrap_or(DEFAULT_AUDIO_BUFFER_SIZE);
    let mut buffer = vec![0u8; initial];

    demuxer.select_track(track_index)?;
    demuxer.seek_to(Micros::ZERO, SeekMode::PreviousSync)?;

    let mut copied = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(CompressError::Cancelled);
        }
        match demuxer.sample_track_index() {
            Some(index) if index == track_index => {}
            Some(_) => {
                demuxer.advance();
                continue;
            }
            None => break,
        }

        if let Some(size) = demuxer.sample_size() {
            if size > buffer.len() {
                buffer.resize(size, 0);
            }
        }
        let Some(size) = demuxer.read_sample_data(&mut buffer)? else {
            break;
        };
        if size > buffer.len() {
            return Err(DemuxError::BufferTooSmall {
                needed: size,
                capacity: buffer.len(),
            }
            .into());
        }

        let track_id = match track_id {
            Some(id) => id,
            None => *track_id.insert(muxer.add_track(&format, true)?),
        };
        let pts = demuxer.sample_time().unwrap_or(Micros::ZERO);
        let info = BufferInfo::new(0, size, pts.0, BufferFlags::KEY_FRAME);
        muxer.write_sample_data(track_id, &buffer, &info)?;
        trace!(track_id, size, pts = pts.0, "audio sample");
        copied += 1;

        if !demuxer.advance() {
            break;
        }
    }

    demuxer.unselect_track(track_index)?;
    match track_id {
        Some(track_id) => {
            info!(track_id, samples = copied, buffer = buffer.len(), "Copied audio track")
        }
        None => warn!(track_index, "Audio track has no samples, output has no audio"),
    }
    Ok(copied)
}
