//! High-level MP4 muxer API.
//!
//! Usage:
//! ```ignore
//! let movie = Mp4Movie::new("out.mp4").with_rotation(Rotation::None);
//! let mut muxer = MediaMuxer::create_movie(movie)?;
//! let video = muxer.add_track(&encoder_format, false)?;
//! muxer.write_sample_data(video, &buffer, &info)?;
//! let size = muxer.finish_movie()?;
//! ```

use sq_common::{BufferInfo, Rotation, TrackFormat};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, trace, warn};

use crate::atoms::LARGE_HEADER_SIZE;
use crate::boxes::{build_moov, write_ftyp, write_mdat_header, MovieHeader, FTYP_SIZE};
use crate::error::{MuxError, MuxResult};
use crate::nal::annexb_to_avcc;
use crate::track::Track;

/// Where moov goes relative to mdat.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MoovPlacement {
    /// ftyp, moov, mdat. Samples are spooled to a scratch file until finish.
    #[default]
    Start,
    /// ftyp, mdat, moov. Can be relocated later with the fast-start pass.
    End,
}

/// The movie being written: its tracks, display rotation and output path.
#[derive(Clone, Debug)]
pub struct Mp4Movie {
    output: PathBuf,
    rotation: Rotation,
    placement: MoovPlacement,
    tracks: Vec<Track>,
}

impl Mp4Movie {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            rotation: Rotation::None,
            placement: MoovPlacement::default(),
            tracks: Vec::new(),
        }
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_placement(mut self, placement: MoovPlacement) -> Self {
        self.placement = placement;
        self
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn placement(&self) -> MoovPlacement {
        self.placement
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }
}

/// Scratch file for the mdat payload, placed next to `output`.
fn scratch_path_for(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "movie".to_string());
    output.with_file_name(format!(".{name}.payload"))
}

/// Writes samples into an MP4 file and lays out moov at finish.
pub struct MediaMuxer {
    movie: Mp4Movie,
    output: BufWriter<File>,
    /// Payload sink for [`MoovPlacement::Start`].
    scratch: Option<(PathBuf, BufWriter<File>)>,
    payload_len: u64,
    avcc_buf: Vec<u8>,
    finished: bool,
}

impl MediaMuxer {
    /// Create the output file (and the scratch payload file for the
    /// moov-first layout).
    pub fn create_movie(movie: Mp4Movie) -> MuxResult<Self> {
        let file = File::create(movie.output()).map_err(|e| {
            MuxError::Io(io::Error::new(
                e.kind(),
                format!("failed to create {}: {e}", movie.output().display()),
            ))
        })?;
        let mut output = BufWriter::new(file);

        let scratch = match movie.placement {
            MoovPlacement::Start => {
                let path = scratch_path_for(movie.output());
                let file = File::create(&path)?;
                Some((path, BufWriter::new(file)))
            }
            MoovPlacement::End => {
                write_ftyp(&mut output)?;
                // size patched at finish
                write_mdat_header(&mut output, 0)?;
                None
            }
        };

        info!(
            output = %movie.output().display(),
            placement = ?movie.placement,
            rotation = %movie.rotation,
            "movie created"
        );
        Ok(Self {
            movie,
            output,
            scratch,
            payload_len: 0,
            avcc_buf: Vec::new(),
            finished: false,
        })
    }

    /// Add a track described by `format`. Returns its 1-based id.
    pub fn add_track(&mut self, format: &TrackFormat, is_audio: bool) -> MuxResult<u32> {
        self.ensure_open()?;
        let track_id = self.movie.tracks.len() as u32 + 1;
        let track = Track::new(track_id, format, is_audio)?;
        info!(track_id, is_audio, timescale = track.timescale(), "added track");
        self.movie.tracks.push(track);
        Ok(track_id)
    }

    /// Append the valid region of `data` (per `info`) as one sample.
    ///
    /// Video samples in Annex-B form are rewritten with 4-byte NAL lengths.
    pub fn write_sample_data(
        &mut self,
        track_id: u32,
        data: &[u8],
        info: &BufferInfo,
    ) -> MuxResult<()> {
        self.ensure_open()?;
        let index = self.track_index(track_id)?;
        let payload = data.get(info.offset..info.end()).ok_or_else(|| {
            MuxError::Malformed(format!(
                "sample region {}..{} outside buffer of {} bytes",
                info.offset,
                info.end(),
                data.len()
            ))
        })?;
        if payload.is_empty() {
            warn!(track_id, pts = info.presentation_time_us, "skipping empty sample");
            return Ok(());
        }

        let bytes: &[u8] = if self.movie.tracks[index].is_audio() {
            payload
        } else {
            annexb_to_avcc(payload, &mut self.avcc_buf);
            &self.avcc_buf
        };

        let offset = self.payload_len;
        match self.scratch.as_mut() {
            Some((_, scratch)) => scratch.write_all(bytes)?,
            None => self.output.write_all(bytes)?,
        }
        self.payload_len += bytes.len() as u64;

        let mut recorded = *info;
        recorded.offset = 0;
        recorded.size = bytes.len();
        self.movie.tracks[index].add_sample(offset, &recorded);
        trace!(track_id, offset, size = bytes.len(), pts = info.presentation_time_us, "sample");
        Ok(())
    }

    /// Lay out moov and close the file. Returns the final file size.
    pub fn finish_movie(&mut self) -> MuxResult<u64> {
        self.ensure_open()?;
        if self.movie.tracks.is_empty() {
            return Err(MuxError::Finalize("movie has no tracks".into()));
        }
        if let Some(empty) = self.movie.tracks.iter().find(|t| t.samples().is_empty()) {
            return Err(MuxError::Finalize(format!(
                "track {} has no samples",
                empty.track_id()
            )));
        }
        self.finished = true;

        let header = MovieHeader {
            rotation: self.movie.rotation,
            creation_time: SystemTime::now(),
        };
        let payload_len = self.payload_len;

        let size = match self.scratch.take() {
            Some((path, scratch)) => {
                let result = self.finish_moov_first(&header, scratch, &path);
                fs::remove_file(&path).ok();
                result?
            }
            None => self.finish_moov_last(&header)?,
        };

        info!(
            output = %self.movie.output().display(),
            tracks = self.movie.tracks.len(),
            payload = payload_len,
            size,
            "movie finalized"
        );
        Ok(size)
    }

    fn finish_moov_first(
        &mut self,
        header: &MovieHeader,
        scratch: BufWriter<File>,
        scratch_path: &Path,
    ) -> MuxResult<u64> {
        scratch.into_inner().map_err(|e| e.into_error())?.sync_all()?;

        let layout = build_moov(header, &self.movie.tracks, |moov_size| {
            FTYP_SIZE + moov_size + LARGE_HEADER_SIZE
        })?;
        debug!(moov_size = layout.bytes.len(), co64 = layout.uses_co64, "moov before mdat");

        write_ftyp(&mut self.output)?;
        self.output.write_all(&layout.bytes)?;
        write_mdat_header(&mut self.output, self.payload_len)?;
        let mut payload = BufReader::new(File::open(scratch_path)?);
        let copied = io::copy(&mut payload, &mut self.output)?;
        if copied != self.payload_len {
            return Err(MuxError::Malformed(format!(
                "payload spool holds {copied} bytes, expected {}",
                self.payload_len
            )));
        }
        self.output.flush()?;
        Ok(FTYP_SIZE + layout.bytes.len() as u64 + LARGE_HEADER_SIZE + self.payload_len)
    }

    fn finish_moov_last(&mut self, header: &MovieHeader) -> MuxResult<u64> {
        let layout = build_moov(header, &self.movie.tracks, |_| FTYP_SIZE + LARGE_HEADER_SIZE)?;
        debug!(moov_size = layout.bytes.len(), co64 = layout.uses_co64, "moov after mdat");

        self.output.seek(SeekFrom::Start(FTYP_SIZE))?;
        write_mdat_header(&mut self.output, self.payload_len)?;
        self.output.seek(SeekFrom::End(0))?;
        self.output.write_all(&layout.bytes)?;
        self.output.flush()?;
        Ok(FTYP_SIZE + LARGE_HEADER_SIZE + self.payload_len + layout.bytes.len() as u64)
    }

    pub fn movie(&self) -> &Mp4Movie {
        &self.movie
    }

    /// Bytes of sample data written so far.
    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    fn ensure_open(&self) -> MuxResult<()> {
        if self.finished {
            return Err(MuxError::Finalize("movie already finalized".into()));
        }
        Ok(())
    }

    fn track_index(&self, track_id: u32) -> MuxResult<usize> {
        self.movie
            .tracks
            .iter()
            .position(|t| t.track_id() == track_id)
            .ok_or_else(|| MuxError::InvalidTrack(format!("track {track_id} not found")))
    }
}

impl Drop for MediaMuxer {
    fn drop(&mut self) {
        if let Some((path, _)) = self.scratch.take() {
            if let Err(e) = fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "scratch file not removed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sq_common::codec::{MIME_AUDIO_AAC, MIME_VIDEO_AVC};
    use sq_common::BufferFlags;

    fn temp_mp4_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sq_mux_test_{}_{name}.mp4", std::process::id()))
    }

    fn video_format() -> TrackFormat {
        let mut f = TrackFormat::video(MIME_VIDEO_AVC, 640, 480);
        f.csd0 = Some(vec![0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1F, 0xDA, 0x02]);
        f.csd1 = Some(vec![0, 0, 0, 1, 0x68, 0xCE, 0x38, 0x80]);
        f
    }

    fn frame(pts: u64, key: bool) -> (Vec<u8>, BufferInfo) {
        let data = vec![0, 0, 0, 1, 0x65, 0xAA, 0xBB, 0xCC];
        let flags = if key {
            BufferFlags::KEY_FRAME
        } else {
            BufferFlags::NONE
        };
        let info = BufferInfo::new(0, data.len(), pts, flags);
        (data, info)
    }

    fn top_level_types(buf: &[u8]) -> Vec<[u8; 4]> {
        let mut types = Vec::new();
        let mut pos = 0usize;
        while pos + 8 <= buf.len() {
            let size32 = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as u64;
            let size = if size32 == 1 {
                u64::from_be_bytes(buf[pos + 8..pos + 16].try_into().unwrap())
            } else {
                size32
            };
            types.push(buf[pos + 4..pos + 8].try_into().unwrap());
            pos += size as usize;
        }
        types
    }

    #[test]
    fn moov_first_layout() {
        let path = temp_mp4_path("moov_first");
        let mut muxer = MediaMuxer::create_movie(Mp4Movie::new(&path)).unwrap();
        let video = muxer.add_track(&video_format(), false).unwrap();
        let audio = muxer
            .add_track(&TrackFormat::audio(MIME_AUDIO_AAC, 44_100, 2), true)
            .unwrap();
        assert_eq!((video, audio), (1, 2));

        for i in 0..10u64 {
            let (data, info) = frame(i * 33_333, i % 5 == 0);
            muxer.write_sample_data(video, &data, &info).unwrap();
            let aac = [0x21u8; 12];
            let info = BufferInfo::new(0, aac.len(), i * 23_220, BufferFlags::NONE);
            muxer.write_sample_data(audio, &aac, &info).unwrap();
        }
        // 4-byte length replaces the 4-byte start code
        assert_eq!(muxer.payload_len(), 10 * 8 + 10 * 12);
        assert_eq!(muxer.movie().tracks()[0].sync_samples(), &[1, 6]);

        let size = muxer.finish_movie().unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, size);
        assert_eq!(
            top_level_types(&bytes),
            vec![*b"ftyp", *b"moov", *b"mdat"]
        );
        assert!(!scratch_path_for(&path).exists());
        fs::remove_file(&path).ok();
    }

    #[test]
    fn moov_last_layout_patches_mdat_size() {
        let path = temp_mp4_path("moov_last");
        let movie = Mp4Movie::new(&path).with_placement(MoovPlacement::End);
        let mut muxer = MediaMuxer::create_movie(movie).unwrap();
        let video = muxer.add_track(&video_format(), false).unwrap();
        for i in 0..3u64 {
            let (data, info) = frame(i * 33_333, i == 0);
            muxer.write_sample_data(video, &data, &info).unwrap();
        }
        muxer.finish_movie().unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(
            top_level_types(&bytes),
            vec![*b"ftyp", *b"mdat", *b"moov"]
        );
        let mdat_size = u64::from_be_bytes(bytes[40..48].try_into().unwrap());
        assert_eq!(mdat_size, 16 + 3 * 8);
        // first sample sits right after the mdat header, length-prefixed
        assert_eq!(&bytes[48..56], &[0, 0, 0, 4, 0x65, 0xAA, 0xBB, 0xCC]);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn finish_is_single_shot() {
        let path = temp_mp4_path("single_shot");
        let mut muxer = MediaMuxer::create_movie(Mp4Movie::new(&path)).unwrap();
        let video = muxer.add_track(&video_format(), false).unwrap();
        let (data, info) = frame(0, true);
        muxer.write_sample_data(video, &data, &info).unwrap();
        muxer.finish_movie().unwrap();
        assert!(matches!(muxer.finish_movie(), Err(MuxError::Finalize(_))));
        assert!(matches!(
            muxer.write_sample_data(video, &data, &info),
            Err(MuxError::Finalize(_))
        ));
        drop(muxer);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn finish_rejects_missing_or_empty_tracks() {
        let path = temp_mp4_path("empty");
        let mut muxer = MediaMuxer::create_movie(Mp4Movie::new(&path)).unwrap();
        assert!(matches!(muxer.finish_movie(), Err(MuxError::Finalize(_))));
        muxer.add_track(&video_format(), false).unwrap();
        let err = muxer.finish_movie().unwrap_err();
        assert!(err.to_string().contains("track 1 has no samples"));
        drop(muxer);
        assert!(!scratch_path_for(&path).exists());
        fs::remove_file(&path).ok();
    }

    #[test]
    fn unknown_track_is_rejected() {
        let path = temp_mp4_path("unknown_track");
        let mut muxer = MediaMuxer::create_movie(Mp4Movie::new(&path)).unwrap();
        let (data, info) = frame(0, true);
        assert!(matches!(
            muxer.write_sample_data(7, &data, &info),
            Err(MuxError::InvalidTrack(_))
        ));
        drop(muxer);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn sample_region_is_bounds_checked() {
        let path = temp_mp4_path("bounds");
        let mut muxer = MediaMuxer::create_movie(Mp4Movie::new(&path)).unwrap();
        let video = muxer.add_track(&video_format(), false).unwrap();
        let info = BufferInfo::new(4, 100, 0, BufferFlags::KEY_FRAME);
        assert!(matches!(
            muxer.write_sample_data(video, &[0u8; 16], &info),
            Err(MuxError::Malformed(_))
        ));
        drop(muxer);
        fs::remove_file(&path).ok();
    }
}
