//! MP4/MOV (ISO BMFF) demuxer.
//!
//! Parses the moov box once at open time, builds a flat sample table per
//! track, and serves samples through [`SourceDemuxer`]. Video samples are
//! rewritten from AVCC to Annex-B form as they are read.

pub mod boxes;
pub mod sample;

use boxes::{find_and_parse_moov, fourcc_to_string, ParsedMoov, ParsedTrack, SampleEntryDesc};
use sample::SampleTable;
use sq_common::codec::{MIME_AUDIO_AAC, MIME_VIDEO_AVC};
use sq_common::{AudioCodec, BufferFlags, DemuxError, Micros, TrackFormat};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info};

use crate::nal;
use crate::traits::{SeekMode, SourceDemuxer};

/// One demuxable track: parsed boxes, flat sample table, derived format.
#[derive(Clone, Debug)]
pub struct DemuxTrack {
    pub parsed: ParsedTrack,
    pub table: SampleTable,
    pub format: TrackFormat,
    /// NAL length field size for AVC tracks.
    nal_length_size: Option<u8>,
}

impl DemuxTrack {
    fn new(parsed: ParsedTrack) -> Result<Self, DemuxError> {
        let table = SampleTable::build(&parsed)?;
        let format = track_format(&parsed, &table);
        let nal_length_size = match &parsed.sample_entry {
            Some(SampleEntryDesc::Avc { avcc, .. }) => {
                Some(avcc.as_ref().map_or(4, |c| c.length_size_minus_one + 1))
            }
            _ => None,
        };
        Ok(Self {
            parsed,
            table,
            format,
            nal_length_size,
        })
    }
}

/// MP4 demuxer over any seekable byte source.
pub struct Mp4Demuxer<R = BufReader<File>> {
    reader: R,
    movie_duration: Option<Micros>,
    tracks: Vec<DemuxTrack>,
    selected: Vec<bool>,
    /// Next sample index per track.
    cursors: Vec<usize>,
    scratch: Vec<u8>,
}

impl Mp4Demuxer {
    /// Open an MP4 file and parse its structure.
    pub fn open(path: &Path) -> Result<Self, DemuxError> {
        info!("Opening MP4 file: {}", path.display());
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }
}

impl<R: Read + Seek> Mp4Demuxer<R> {
    pub fn from_reader(mut reader: R) -> Result<Self, DemuxError> {
        let ParsedMoov {
            movie_timing,
            tracks,
        } = find_and_parse_moov(&mut reader)?;

        let tracks = tracks
            .into_iter()
            .map(DemuxTrack::new)
            .collect::<Result<Vec<_>, _>>()?;

        for (i, t) in tracks.iter().enumerate() {
            info!(
                track = i,
                mime = %t.format.mime,
                samples = t.table.len(),
                duration = %t.table.duration_micros(),
                "MP4 track"
            );
        }

        let movie_duration = movie_timing
            .filter(|t| t.timescale != 0)
            .map(|t| Micros::from_timescale(t.duration, t.timescale));

        let count = tracks.len();
        Ok(Self {
            reader,
            movie_duration,
            tracks,
            selected: vec![false; count],
            cursors: vec![0; count],
            scratch: Vec::new(),
        })
    }

    /// Duration declared by mvhd.
    pub fn movie_duration(&self) -> Option<Micros> {
        self.movie_duration
    }

    pub fn tracks(&self) -> &[DemuxTrack] {
        &self.tracks
    }

    /// Index of the first track whose format is video.
    pub fn first_video_track(&self) -> Option<usize> {
        self.tracks.iter().position(|t| t.format.is_video())
    }

    pub fn first_audio_track(&self) -> Option<usize> {
        self.tracks.iter().position(|t| t.format.is_audio())
    }

    fn check_index(&self, index: usize) -> Result<(), DemuxError> {
        if index < self.tracks.len() {
            Ok(())
        } else {
            Err(DemuxError::NoSuchTrack(index))
        }
    }

    /// (track, sample) of the selected sample with the earliest decode time.
    fn current(&self) -> Option<(usize, usize)> {
        self.tracks
            .iter()
            .enumerate()
            .filter(|(i, t)| self.selected[*i] && self.cursors[*i] < t.table.len())
            .map(|(i, t)| {
                let s = &t.table.samples[self.cursors[i]];
                let dts = Micros::from_timescale(s.dts, t.table.timescale);
                (dts, i)
            })
            .min()
            .map(|(_, i)| (i, self.cursors[i]))
    }

    fn read_raw(&mut self, offset: u64, size: usize, track: usize) -> Result<(), DemuxError> {
        self.scratch.resize(size, 0);
        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader.read_exact(&mut self.scratch).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                DemuxError::TruncatedData {
                    expected: size,
                    got: 0,
                }
            } else {
                DemuxError::Io(e)
            }
        })?;
        debug!(track, offset, size, "read sample");
        Ok(())
    }
}

impl<R: Read + Seek> SourceDemuxer for Mp4Demuxer<R> {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, index: usize) -> Result<TrackFormat, DemuxError> {
        self.check_index(index)?;
        Ok(self.tracks[index].format.clone())
    }

    fn select_track(&mut self, index: usize) -> Result<(), DemuxError> {
        self.check_index(index)?;
        self.selected[index] = true;
        Ok(())
    }

    fn unselect_track(&mut self, index: usize) -> Result<(), DemuxError> {
        self.check_index(index)?;
        self.selected[index] = false;
        Ok(())
    }

    fn seek_to(&mut self, time: Micros, mode: SeekMode) -> Result<(), DemuxError> {
        for (i, track) in self.tracks.iter().enumerate() {
            if !self.selected[i] {
                continue;
            }
            let table = &track.table;
            let before = table.find_sync_at_or_before(time);
            let after = table.find_sync_at_or_after(time);
            let target = match mode {
                SeekMode::PreviousSync => before.or(after),
                SeekMode::NextSync => after.or(before),
                SeekMode::ClosestSync => match (before, after) {
                    (Some(b), Some(a)) => {
                        let t = time.0 as i64;
                        let dist = |idx: usize| {
                            (table.presentation_time(idx).map_or(0, |m| m.0 as i64) - t).abs()
                        };
                        Some(if dist(a) < dist(b) { a } else { b })
                    }
                    (b, a) => b.or(a),
                },
            };
            let target = target.unwrap_or(table.len());
            debug!(track = i, %time, ?mode, sample = target, "seek");
            self.cursors[i] = target;
        }
        Ok(())
    }

    fn read_sample_data(&mut self, buf: &mut [u8]) -> Result<Option<usize>, DemuxError> {
        let Some((track_idx, sample_idx)) = self.current() else {
            return Ok(None);
        };
        let track = &self.tracks[track_idx];
        let entry = &track.table.samples[sample_idx];
        let (offset, size) = (entry.offset, entry.size as usize);
        let length_size = track.nal_length_size;

        match length_size {
            // Same-size rewrite: read straight into the caller's buffer.
            Some(4) | None => {
                if size > buf.len() {
                    return Err(DemuxError::BufferTooSmall {
                        needed: size,
                        capacity: buf.len(),
                    });
                }
                self.read_raw(offset, size, track_idx)?;
                let out = &mut buf[..size];
                out.copy_from_slice(&self.scratch);
                if length_size.is_some() && !nal::avcc4_to_annexb_in_place(out) {
                    debug!(track = track_idx, sample = sample_idx, "NAL length overruns sample");
                }
                Ok(Some(size))
            }
            Some(ls) => {
                self.read_raw(offset, size, track_idx)?;
                let converted = nal::avcc_to_annexb(&self.scratch, ls);
                if converted.len() > buf.len() {
                    return Err(DemuxError::BufferTooSmall {
                        needed: converted.len(),
                        capacity: buf.len(),
                    });
                }
                buf[..converted.len()].copy_from_slice(&converted);
                Ok(Some(converted.len()))
            }
        }
    }

    fn sample_track_index(&self) -> Option<usize> {
        self.current().map(|(t, _)| t)
    }

    fn sample_time(&self) -> Option<Micros> {
        let (t, s) = self.current()?;
        self.tracks[t].table.presentation_time(s)
    }

    fn sample_flags(&self) -> BufferFlags {
        match self.current() {
            Some((t, s)) if self.tracks[t].table.samples[s].is_sync => BufferFlags::KEY_FRAME,
            _ => BufferFlags::NONE,
        }
    }

    fn sample_size(&self) -> Option<usize> {
        let (t, s) = self.current()?;
        Some(self.tracks[t].table.samples[s].size as usize)
    }

    fn advance(&mut self) -> bool {
        match self.current() {
            Some((t, _)) => {
                self.cursors[t] += 1;
                self.current().is_some()
            }
            None => false,
        }
    }
}

// ─── Helper functions ───────────────────────────────────────────────

/// Derive the codec-facing format of a parsed track.
fn track_format(track: &ParsedTrack, table: &SampleTable) -> TrackFormat {
    let mut format = match &track.sample_entry {
        Some(SampleEntryDesc::Avc { avcc, .. }) => {
            let mut f = TrackFormat::video(MIME_VIDEO_AVC, track.width, track.height);
            if let Some(avcc) = avcc {
                f.csd0 = avcc.sps_list.first().map(|sps| nal::with_start_code(sps));
                f.csd1 = avcc.pps_list.first().map(|pps| nal::with_start_code(pps));
            }
            f
        }
        Some(SampleEntryDesc::Mp4a {
            channel_count,
            sample_rate,
            esds,
        }) => {
            let mime = esds
                .as_ref()
                .and_then(|e| AudioCodec::from_object_type_indication(e.object_type_indication))
                .map_or(MIME_AUDIO_AAC, AudioCodec::mime);
            let mut f = TrackFormat::audio(mime, *sample_rate, *channel_count as u32);
            if let Some(esds) = esds {
                if !esds.decoder_specific_info.is_empty() {
                    f.csd0 = Some(esds.decoder_specific_info.clone());
                }
                f.bitrate = (esds.avg_bitrate > 0).then_some(esds.avg_bitrate as u64);
            }
            f
        }
        other => {
            let codec = match other {
                Some(SampleEntryDesc::Other(cc)) => fourcc_to_string(*cc),
                _ => "unknown".to_string(),
            };
            if track.is_video() {
                TrackFormat::video(format!("video/x-{codec}"), track.width, track.height)
            } else {
                TrackFormat {
                    mime: format!("audio/x-{codec}"),
                    ..TrackFormat::default()
                }
            }
        }
    };

    let duration = table.duration_micros();
    if duration.0 > 0 {
        format.duration_us = Some(duration.0);
        if format.bitrate.is_none() {
            format.bitrate = Some((table.total_bytes() as u128 * 8 * 1_000_000 / duration.0 as u128) as u64);
        }
        if track.is_video() && !table.is_empty() {
            let fps = table.len() as f64 / duration.as_secs_f64();
            format.frame_rate = Some(fps.round() as u32);
        }
    }
    if !table.is_empty() {
        format.max_input_size = Some(table.max_sample_size());
    }
    format
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use boxes::*;
    use std::io::Cursor;

    fn make_box(box_type: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
        buf.extend_from_slice(&box_type.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    fn full(version: u8, body: &[u8]) -> Vec<u8> {
        let mut p = vec![version, 0, 0, 0];
        p.extend_from_slice(body);
        p
    }

    fn u32s(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    fn timing_box(box_type: u32, timescale: u32, duration: u32) -> Vec<u8> {
        make_box(box_type, &full(0, &u32s(&[0, 0, timescale, duration])))
    }

    fn tkhd(track_id: u32, width: u32, height: u32) -> Vec<u8> {
        let mut body = u32s(&[0, 0, track_id, 0, 0]);
        body.extend_from_slice(&[0u8; 16]);
        body.extend_from_slice(&u32s(&[0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000]));
        body.extend_from_slice(&u32s(&[width << 16, height << 16]));
        make_box(TKHD, &full(0, &body))
    }

    fn hdlr(handler: u32) -> Vec<u8> {
        let mut body = u32s(&[0, handler, 0, 0, 0]);
        body.push(0);
        make_box(HDLR, &full(0, &body))
    }

    fn avc1_entry() -> Vec<u8> {
        let mut body = vec![0u8; 24];
        body.extend_from_slice(&64u16.to_be_bytes());
        body.extend_from_slice(&48u16.to_be_bytes());
        body.extend_from_slice(&[0u8; 50]);
        let avcc = [
            0x01, 0x42, 0xC0, 0x1E, 0xFF, 0xE1, 0x00, 0x02, 0x67, 0x42, 0x01, 0x00, 0x02, 0x68,
            0xCE,
        ];
        body.extend_from_slice(&make_box(AVCC, &avcc));
        make_box(AVC1, &body)
    }

    fn mp4a_entry() -> Vec<u8> {
        let mut body = vec![0u8; 16];
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0u8; 6]);
        body.extend_from_slice(&(44_100u32 << 16).to_be_bytes());
        let esds = [
            0x03, 0x19, 0x00, 0x01, 0x00, 0x04, 0x11, 0x40, 0x15, 0x00, 0x06, 0x00, 0x00, 0x01,
            0x77, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x02, 0x12, 0x10, 0x06, 0x01, 0x02,
        ];
        body.extend_from_slice(&make_box(ESDS, &full(0, &esds)));
        make_box(MP4A, &body)
    }

    struct TrakSpec {
        id: u32,
        handler: u32,
        timescale: u32,
        delta: u32,
        sizes: Vec<u32>,
        chunk_offset: u32,
        sync: Option<Vec<u32>>,
        entry: Vec<u8>,
    }

    fn trak(spec: &TrakSpec) -> Vec<u8> {
        let n = spec.sizes.len() as u32;
        let mut stbl = make_box(STSD, &full(0, &[u32s(&[1]), spec.entry.clone()].concat()));
        stbl.extend(make_box(STTS, &full(0, &u32s(&[1, n, spec.delta]))));
        stbl.extend(make_box(STSC, &full(0, &u32s(&[1, 1, n, 1]))));
        stbl.extend(make_box(STSZ, &full(0, &[u32s(&[0, n]), u32s(&spec.sizes)].concat())));
        stbl.extend(make_box(STCO, &full(0, &u32s(&[1, spec.chunk_offset]))));
        if let Some(sync) = &spec.sync {
            let body = [u32s(&[sync.len() as u32]), u32s(sync)].concat();
            stbl.extend(make_box(STSS, &full(0, &body)));
        }
        let minf = make_box(MINF, &make_box(STBL, &stbl));
        let mut mdia = timing_box(MDHD, spec.timescale, spec.delta * n);
        mdia.extend(hdlr(spec.handler));
        mdia.extend(minf);
        let mut trak = tkhd(spec.id, 64, 48);
        trak.extend(make_box(MDIA, &mdia));
        make_box(TRAK, &trak)
    }

    /// ftyp + mdat (3 video samples of 4-byte-length NALs, 2 audio samples) + moov.
    pub(crate) fn sample_file() -> Vec<u8> {
        let ftyp = make_box(FTYP, b"isom\0\0\0\0isom");
        let video: Vec<Vec<u8>> = vec![
            vec![0, 0, 0, 2, 0x65, 0x11],
            vec![0, 0, 0, 2, 0x41, 0x22],
            vec![0, 0, 0, 2, 0x41, 0x33],
        ];
        let audio: Vec<Vec<u8>> = vec![vec![0xA1; 5], vec![0xA2; 7]];
        let mut payload = Vec::new();
        for v in &video {
            payload.extend_from_slice(v);
        }
        for a in &audio {
            payload.extend_from_slice(a);
        }
        let mdat = make_box(MDAT, &payload);
        let video_offset = (ftyp.len() + 8) as u32;
        let audio_offset = video_offset + 18;

        let mut moov = timing_box(MVHD, 1000, 100);
        moov.extend(trak(&TrakSpec {
            id: 1,
            handler: VIDE,
            timescale: 90_000,
            delta: 3000,
            sizes: video.iter().map(|v| v.len() as u32).collect(),
            chunk_offset: video_offset,
            sync: Some(vec![1]),
            entry: avc1_entry(),
        }));
        moov.extend(trak(&TrakSpec {
            id: 2,
            handler: SOUN,
            timescale: 44_100,
            delta: 1024,
            sizes: audio.iter().map(|a| a.len() as u32).collect(),
            chunk_offset: audio_offset,
            sync: None,
            entry: mp4a_entry(),
        }));

        [ftyp, mdat, make_box(MOOV, &moov)].concat()
    }

    fn open() -> Mp4Demuxer<Cursor<Vec<u8>>> {
        Mp4Demuxer::from_reader(Cursor::new(sample_file())).unwrap()
    }

    #[test]
    fn formats_are_derived() {
        let demuxer = open();
        assert_eq!(demuxer.track_count(), 2);
        assert_eq!(demuxer.movie_duration(), Some(Micros(100_000)));

        let video = demuxer.track_format(0).unwrap();
        assert_eq!(video.mime, MIME_VIDEO_AVC);
        assert_eq!((video.width, video.height), (Some(64), Some(48)));
        assert_eq!(video.csd0, Some(vec![0, 0, 0, 1, 0x67, 0x42]));
        assert_eq!(video.csd1, Some(vec![0, 0, 0, 1, 0x68, 0xCE]));
        assert_eq!(video.max_input_size, Some(6));
        assert_eq!(video.frame_rate, Some(30));

        let audio = demuxer.track_format(1).unwrap();
        assert_eq!(audio.mime, MIME_AUDIO_AAC);
        assert_eq!(audio.sample_rate, Some(44_100));
        assert_eq!(audio.channel_count, Some(2));
        assert_eq!(audio.csd0, Some(vec![0x12, 0x10]));

        assert!(matches!(
            demuxer.track_format(5),
            Err(DemuxError::NoSuchTrack(5))
        ));
    }

    #[test]
    fn reads_video_as_annexb() {
        let mut demuxer = open();
        demuxer.select_track(0).unwrap();
        let mut buf = [0u8; 16];

        assert_eq!(demuxer.sample_flags(), BufferFlags::KEY_FRAME);
        let n = demuxer.read_sample_data(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], &[0, 0, 0, 1, 0x65, 0x11]);
        assert!(demuxer.advance());

        assert_eq!(demuxer.sample_time(), Some(Micros(33_333)));
        assert_eq!(demuxer.sample_flags(), BufferFlags::NONE);
        assert!(demuxer.advance());
        assert!(!demuxer.advance());
        assert_eq!(demuxer.read_sample_data(&mut buf).unwrap(), None);
        assert_eq!(demuxer.sample_time(), None);
    }

    #[test]
    fn audio_samples_pass_through() {
        let mut demuxer = open();
        demuxer.select_track(1).unwrap();
        let mut buf = [0u8; 16];
        let mut sizes = Vec::new();
        while let Some(n) = demuxer.read_sample_data(&mut buf).unwrap() {
            assert_eq!(demuxer.sample_track_index(), Some(1));
            sizes.push(n);
            demuxer.advance();
        }
        assert_eq!(sizes, vec![5, 7]);
    }

    #[test]
    fn small_buffer_is_rejected_without_advancing() {
        let mut demuxer = open();
        demuxer.select_track(1).unwrap();
        demuxer.advance();
        let mut buf = [0u8; 4];
        assert!(matches!(
            demuxer.read_sample_data(&mut buf),
            Err(DemuxError::BufferTooSmall {
                needed: 7,
                capacity: 4
            })
        ));
        assert_eq!(demuxer.sample_size(), Some(7));
    }

    #[test]
    fn seek_returns_to_sync_sample() {
        let mut demuxer = open();
        demuxer.select_track(0).unwrap();
        demuxer.advance();
        demuxer.advance();
        demuxer.seek_to(Micros(60_000), SeekMode::PreviousSync).unwrap();
        assert_eq!(demuxer.sample_time(), Some(Micros::ZERO));
    }

    #[test]
    fn unselected_tracks_yield_nothing() {
        let mut demuxer = open();
        let mut buf = [0u8; 16];
        assert_eq!(demuxer.read_sample_data(&mut buf).unwrap(), None);
        demuxer.select_track(0).unwrap();
        demuxer.unselect_track(0).unwrap();
        assert!(!demuxer.advance());
    }
}
