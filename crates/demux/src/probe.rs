//! File probing: detect the container format and read the metadata a
//! compression job needs, without decoding any sample.

use crate::mp4::Mp4Demuxer;
use sq_common::{
    ContainerFormat, DemuxError, MetadataError, Resolution, Rotation, SourceDescriptor,
    VideoMetadata,
};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{info, warn};

/// Top-level box types a source file may start with.
const LEADING_BOXES: [&[u8; 4]; 6] = [b"ftyp", b"moov", b"mdat", b"wide", b"free", b"skip"];

/// Detect container format from file extension.
pub fn detect_format(path: &Path) -> Result<ContainerFormat, DemuxError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    [ContainerFormat::Mp4, ContainerFormat::QuickTime]
        .into_iter()
        .find(|f| f.file_extensions().contains(&ext.as_str()))
        .ok_or(DemuxError::UnsupportedContainer)
}

/// Detect container format from the first bytes of the file.
pub fn detect_format_from_magic<R: Read>(reader: &mut R) -> Result<ContainerFormat, DemuxError> {
    let mut header = [0u8; 12];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..])? {
            0 => break,
            n => filled += n,
        }
    }

    if filled < 8 || !LEADING_BOXES.iter().any(|b| header[4..8] == b[..]) {
        return Err(DemuxError::UnsupportedContainer);
    }

    if &header[4..8] == b"ftyp" && filled >= 12 && &header[8..12] == b"qt  " {
        return Ok(ContainerFormat::QuickTime);
    }
    Ok(ContainerFormat::Mp4)
}

/// Read width, height, rotation, bitrate, duration and audio presence.
///
/// Missing dimensions fall back to [`Resolution::FALLBACK`]. A missing
/// duration or bitrate, or a display matrix that is not a right-angle
/// rotation, is an error.
pub fn probe(path: &Path) -> Result<VideoMetadata, MetadataError> {
    let file = File::open(path)
        .map_err(|e| MetadataError::Unreadable(format!("{}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let metadata = probe_reader(&mut reader)?;

    info!(
        path = %path.display(),
        resolution = %metadata.resolution,
        rotation = %metadata.rotation,
        bitrate = metadata.bitrate,
        duration = %metadata.duration,
        has_audio = metadata.has_audio,
        "probed source"
    );
    Ok(metadata)
}

/// Probe `path` and wrap the result with it.
pub fn open_source(path: &Path) -> Result<SourceDescriptor, MetadataError> {
    Ok(SourceDescriptor::new(path, probe(path)?))
}

/// Probe an already opened source.
pub fn probe_reader<R: Read + Seek>(reader: &mut R) -> Result<VideoMetadata, MetadataError> {
    match detect_format_from_magic(reader) {
        Ok(_) => {}
        Err(DemuxError::UnsupportedContainer) => return Err(MetadataError::UnsupportedContainer),
        Err(e) => return Err(e.into()),
    }
    reader.seek(SeekFrom::Start(0))?;

    let demuxer = Mp4Demuxer::from_reader(reader)?;
    let video_idx = demuxer.first_video_track().ok_or(DemuxError::NoVideoTrack)?;
    let video = &demuxer.tracks()[video_idx];

    let resolution = Resolution::new(video.parsed.width, video.parsed.height);
    let resolution = if resolution.is_empty() {
        warn!("source has no usable dimensions, assuming {}", Resolution::FALLBACK);
        Resolution::FALLBACK
    } else {
        resolution
    };

    let degrees = video
        .parsed
        .rotation
        .ok_or(MetadataError::MissingField("rotation"))?;
    let rotation = Rotation::from_degrees(degrees).ok_or(MetadataError::InvalidRotation(degrees))?;

    let duration = demuxer
        .movie_duration()
        .filter(|d| d.0 > 0)
        .or_else(|| {
            demuxer
                .tracks()
                .iter()
                .map(|t| t.table.duration_micros())
                .max()
        })
        .filter(|d| d.0 > 0)
        .ok_or(MetadataError::MissingField("duration"))?;

    let total_bytes: u64 = demuxer.tracks().iter().map(|t| t.table.total_bytes()).sum();
    if total_bytes == 0 {
        return Err(MetadataError::MissingField("bitrate"));
    }
    let bitrate = (total_bytes as u128 * 8 * 1_000_000 / duration.0 as u128) as u64;

    Ok(VideoMetadata {
        resolution,
        rotation,
        bitrate,
        duration,
        has_audio: demuxer.first_audio_track().is_some(),
        frame_rate: video.format.frame_rate,
    })
}
