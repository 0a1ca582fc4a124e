//! MP4 box (atom) writers for the output movie (ISO 14496-12).
//!
//! `moov` is serialized into a [`BoxWriter`]. Chunk offsets are written as
//! placeholders whose buffer indices are kept in [`ChunkOffsetSlots`]; once
//! the position of the mdat payload is known they are patched in place.

use byteorder::{BigEndian, WriteBytesExt};
use sq_common::Rotation;
use std::io::{self, Cursor, Seek, SeekFrom, Write};
use std::time::SystemTime;
use tracing::debug;

use crate::atoms::{
    begin_box, encode_language, end_box, mp4_time, write_box_header, write_fixed_point_16_16,
    write_fixed_point_8_8, write_full_box_header, write_large_box_header, write_pascal_string,
    write_version_flags, write_zeros, LARGE_HEADER_SIZE, MOVIE_TIMESCALE,
};
use crate::error::{MuxError, MuxResult};
use crate::track::{SampleDescription, Track};

/// Size of the `ftyp` box written by [`write_ftyp`].
pub const FTYP_SIZE: u64 = 32;

const COMPATIBLE_BRANDS: [&[u8; 4]; 4] = [b"isom", b"iso2", b"avc1", b"mp41"];

/// Write the ftyp box: major brand isom, minor version 512.
pub fn write_ftyp<W: Write>(writer: &mut W) -> MuxResult<()> {
    write_box_header(writer, b"ftyp", FTYP_SIZE as u32)?;
    writer.write_all(b"isom")?;
    writer.write_u32::<BigEndian>(512)?;
    for brand in COMPATIBLE_BRANDS {
        writer.write_all(brand)?;
    }
    Ok(())
}

/// Write an mdat header for `payload_len` bytes. Always the 16-byte form.
pub fn write_mdat_header<W: Write>(writer: &mut W, payload_len: u64) -> MuxResult<()> {
    write_large_box_header(writer, b"mdat", LARGE_HEADER_SIZE + payload_len)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct ChunkOffsetSlot {
    /// Index of the placeholder in the moov buffer.
    position: usize,
    /// Offset relative to the mdat payload.
    relative: u64,
    wide: bool,
}

/// Placeholders for chunk offsets inside a serialized moov.
#[derive(Clone, Debug, Default)]
pub struct ChunkOffsetSlots {
    slots: Vec<ChunkOffsetSlot>,
}

impl ChunkOffsetSlots {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Largest absolute offset the slots resolve to for `payload_start`.
    pub fn max_absolute(&self, payload_start: u64) -> Option<u64> {
        self.slots
            .iter()
            .map(|s| payload_start.saturating_add(s.relative))
            .max()
    }

    /// Write every absolute offset (`payload_start + relative`) into `buf`.
    pub fn patch(&self, buf: &mut [u8], payload_start: u64) -> MuxResult<()> {
        for slot in &self.slots {
            let absolute = payload_start + slot.relative;
            if slot.wide {
                buf[slot.position..slot.position + 8].copy_from_slice(&absolute.to_be_bytes());
            } else {
                let narrow = u32::try_from(absolute).map_err(|_| MuxError::OffsetOverflow {
                    offset: slot.relative,
                    shift: payload_start,
                })?;
                buf[slot.position..slot.position + 4].copy_from_slice(&narrow.to_be_bytes());
            }
        }
        Ok(())
    }
}

/// Growable in-memory box buffer that remembers chunk-offset placeholders.
#[derive(Debug, Default)]
pub struct BoxWriter {
    cursor: Cursor<Vec<u8>>,
    slots: ChunkOffsetSlots,
}

impl BoxWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cursor.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.get_ref().is_empty()
    }

    /// Write a zero placeholder for a chunk offset and record where it lives.
    pub fn chunk_offset(&mut self, relative: u64, wide: bool) -> MuxResult<()> {
        let position = self.cursor.position() as usize;
        if wide {
            self.cursor.write_u64::<BigEndian>(0)?;
        } else {
            self.cursor.write_u32::<BigEndian>(0)?;
        }
        self.slots.slots.push(ChunkOffsetSlot {
            position,
            relative,
            wide,
        });
        Ok(())
    }

    pub fn into_parts(self) -> (Vec<u8>, ChunkOffsetSlots) {
        (self.cursor.into_inner(), self.slots)
    }
}

impl Write for BoxWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for BoxWriter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

/// Movie-level inputs of the moov box.
#[derive(Clone, Debug)]
pub struct MovieHeader {
    pub rotation: Rotation,
    pub creation_time: SystemTime,
}

/// A fully patched moov box.
#[derive(Clone, Debug)]
pub struct MoovLayout {
    pub bytes: Vec<u8>,
    pub uses_co64: bool,
}

/// Serialize and patch moov.
///
/// `payload_start` maps the moov size to the absolute file position of the
/// first mdat payload byte. The box is first laid out with 32-bit chunk
/// offsets; if any resolved offset does not fit it is laid out again with
/// co64, whose size change is reflected in the second call.
pub fn build_moov<F>(header: &MovieHeader, tracks: &[Track], payload_start: F) -> MuxResult<MoovLayout>
where
    F: Fn(u64) -> u64,
{
    let (mut bytes, slots) = serialize_moov(header, tracks, false)?;
    let base = payload_start(bytes.len() as u64);
    let fits = slots
        .max_absolute(base)
        .map_or(true, |max| max <= u32::MAX as u64);
    if fits {
        slots.patch(&mut bytes, base)?;
        debug!(moov_size = bytes.len(), chunks = slots.len(), "moov laid out with stco");
        return Ok(MoovLayout {
            bytes,
            uses_co64: false,
        });
    }

    let (mut bytes, slots) = serialize_moov(header, tracks, true)?;
    let base = payload_start(bytes.len() as u64);
    slots.patch(&mut bytes, base)?;
    debug!(moov_size = bytes.len(), chunks = slots.len(), "moov laid out with co64");
    Ok(MoovLayout {
        bytes,
        uses_co64: true,
    })
}

fn serialize_moov(
    header: &MovieHeader,
    tracks: &[Track],
    wide_offsets: bool,
) -> MuxResult<(Vec<u8>, ChunkOffsetSlots)> {
    let mut w = BoxWriter::new();
    let moov = begin_box(&mut w, b"moov")?;

    let movie_duration = tracks
        .iter()
        .map(|t| to_movie_timescale(t.duration(), t.timescale()))
        .max()
        .unwrap_or(0);
    write_mvhd(&mut w, header, movie_duration, tracks.len() as u32 + 1)?;
    for track in tracks {
        write_trak(&mut w, header, track, wide_offsets)?;
    }

    end_box(&mut w, moov)?;
    Ok(w.into_parts())
}

fn to_movie_timescale(duration: u64, timescale: u32) -> u64 {
    if timescale == 0 {
        return 0;
    }
    (duration as u128 * MOVIE_TIMESCALE as u128 / timescale as u128) as u64
}

/// Creation/modification time plus an extra field and a duration, in the
/// version-0 or version-1 width.
fn write_times<W: Write>(
    w: &mut W,
    version: u8,
    time: u64,
    middle: u32,
    duration: u64,
) -> MuxResult<()> {
    if version == 1 {
        w.write_u64::<BigEndian>(time)?;
        w.write_u64::<BigEndian>(time)?;
        w.write_u32::<BigEndian>(middle)?;
        w.write_u64::<BigEndian>(duration)?;
    } else {
        w.write_u32::<BigEndian>(time as u32)?;
        w.write_u32::<BigEndian>(time as u32)?;
        w.write_u32::<BigEndian>(middle)?;
        w.write_u32::<BigEndian>(duration as u32)?;
    }
    Ok(())
}

fn version_for(time: u64, duration: u64) -> u8 {
    if time > u32::MAX as u64 || duration > u32::MAX as u64 {
        1
    } else {
        0
    }
}

/// Rotation as the (a, b, c, d) part of the display matrix.
fn rotation_matrix(rotation: Rotation) -> [f64; 4] {
    match rotation {
        Rotation::None => [1.0, 0.0, 0.0, 1.0],
        Rotation::Cw90 => [0.0, 1.0, -1.0, 0.0],
        Rotation::Cw180 => [-1.0, 0.0, 0.0, -1.0],
        Rotation::Cw270 => [0.0, -1.0, 1.0, 0.0],
    }
}

fn write_matrix<W: Write>(w: &mut W, rotation: Rotation) -> MuxResult<()> {
    let [a, b, c, d] = rotation_matrix(rotation);
    write_fixed_point_16_16(w, a)?;
    write_fixed_point_16_16(w, b)?;
    w.write_u32::<BigEndian>(0)?; // u (2.30)
    write_fixed_point_16_16(w, c)?;
    write_fixed_point_16_16(w, d)?;
    w.write_u32::<BigEndian>(0)?; // v
    write_fixed_point_16_16(w, 0.0)?; // x
    write_fixed_point_16_16(w, 0.0)?; // y
    w.write_u32::<BigEndian>(0x4000_0000)?; // w = 1.0 in 2.30
    Ok(())
}

fn write_mvhd<W: Write + Seek>(
    w: &mut W,
    header: &MovieHeader,
    duration: u64,
    next_track_id: u32,
) -> MuxResult<()> {
    let time = mp4_time(header.creation_time);
    let version = version_for(time, duration);
    let pos = begin_box(w, b"mvhd")?;
    write_version_flags(w, version, 0)?;
    write_times(w, version, time, MOVIE_TIMESCALE, duration)?;
    write_fixed_point_16_16(w, 1.0)?; // rate
    write_fixed_point_8_8(w, 1.0)?; // volume
    write_zeros(w, 10)?;
    write_matrix(w, Rotation::None)?;
    write_zeros(w, 24)?; // pre_defined
    w.write_u32::<BigEndian>(next_track_id)?;
    end_box(w, pos)
}

fn write_tkhd<W: Write + Seek>(
    w: &mut W,
    header: &MovieHeader,
    track: &Track,
) -> MuxResult<()> {
    let time = mp4_time(track.creation_time());
    let duration = to_movie_timescale(track.duration(), track.timescale());
    let version = version_for(time, duration);
    let pos = begin_box(w, b"tkhd")?;
    // track_enabled | track_in_movie
    write_version_flags(w, version, 0x000003)?;
    if version == 1 {
        w.write_u64::<BigEndian>(time)?;
        w.write_u64::<BigEndian>(time)?;
        w.write_u32::<BigEndian>(track.track_id())?;
        write_zeros(w, 4)?;
        w.write_u64::<BigEndian>(duration)?;
    } else {
        w.write_u32::<BigEndian>(time as u32)?;
        w.write_u32::<BigEndian>(time as u32)?;
        w.write_u32::<BigEndian>(track.track_id())?;
        write_zeros(w, 4)?;
        w.write_u32::<BigEndian>(duration as u32)?;
    }
    write_zeros(w, 8)?;
    w.write_i16::<BigEndian>(0)?; // layer
    w.write_i16::<BigEndian>(0)?; // alternate_group
    write_fixed_point_8_8(w, track.volume())?;
    write_zeros(w, 2)?;
    let rotation = if track.is_audio() {
        Rotation::None
    } else {
        header.rotation
    };
    write_matrix(w, rotation)?;
    write_fixed_point_16_16(w, track.width() as f64)?;
    write_fixed_point_16_16(w, track.height() as f64)?;
    end_box(w, pos)
}

fn write_mdhd<W: Write + Seek>(w: &mut W, track: &Track) -> MuxResult<()> {
    let time = mp4_time(track.creation_time());
    let version = version_for(time, track.duration());
    let pos = begin_box(w, b"mdhd")?;
    write_version_flags(w, version, 0)?;
    write_times(w, version, time, track.timescale(), track.duration())?;
    w.write_u16::<BigEndian>(encode_language("und"))?;
    w.write_u16::<BigEndian>(0)?;
    end_box(w, pos)
}

fn write_hdlr<W: Write + Seek>(w: &mut W, is_audio: bool) -> MuxResult<()> {
    let (handler, name): (&[u8; 4], &str) = if is_audio {
        (b"soun", "SoundHandler\0")
    } else {
        (b"vide", "VideoHandler\0")
    };
    let pos = begin_box(w, b"hdlr")?;
    write_version_flags(w, 0, 0)?;
    write_zeros(w, 4)?; // pre_defined
    w.write_all(handler)?;
    write_zeros(w, 12)?;
    w.write_all(name.as_bytes())?;
    end_box(w, pos)
}

fn write_trak(w: &mut BoxWriter, header: &MovieHeader, track: &Track, wide: bool) -> MuxResult<()> {
    let trak = begin_box(w, b"trak")?;
    write_tkhd(w, header, track)?;

    let mdia = begin_box(w, b"mdia")?;
    write_mdhd(w, track)?;
    write_hdlr(w, track.is_audio())?;

    let minf = begin_box(w, b"minf")?;
    if track.is_audio() {
        write_full_box_header(w, b"smhd", 16, 0, 0)?;
        w.write_i16::<BigEndian>(0)?; // balance
        write_zeros(w, 2)?;
    } else {
        write_full_box_header(w, b"vmhd", 20, 0, 0x000001)?;
        w.write_u16::<BigEndian>(0)?; // graphicsmode
        write_zeros(w, 6)?; // opcolor
    }
    write_dinf(w)?;
    write_stbl(w, track, wide)?;
    end_box(w, minf)?;

    end_box(w, mdia)?;
    end_box(w, trak)
}

fn write_dinf<W: Write + Seek>(w: &mut W) -> MuxResult<()> {
    let dinf = begin_box(w, b"dinf")?;
    let dref = begin_box(w, b"dref")?;
    write_version_flags(w, 0, 0)?;
    w.write_u32::<BigEndian>(1)?;
    // self-contained: data lives in this file
    write_full_box_header(w, b"url ", 12, 0, 0x000001)?;
    end_box(w, dref)?;
    end_box(w, dinf)
}

fn write_stbl(w: &mut BoxWriter, track: &Track, wide: bool) -> MuxResult<()> {
    let stbl = begin_box(w, b"stbl")?;
    write_stsd(w, track)?;
    write_stts(w, &track.sample_durations())?;
    if !track.is_audio() && !track.sync_samples().is_empty() {
        write_stss(w, track.sync_samples())?;
    }
    write_stsc(w, track.samples().len())?;
    write_stsz(w, track)?;
    write_chunk_offsets(w, track, wide)?;
    end_box(w, stbl)
}

fn write_stsd<W: Write + Seek>(w: &mut W, track: &Track) -> MuxResult<()> {
    let stsd = begin_box(w, b"stsd")?;
    write_version_flags(w, 0, 0)?;
    w.write_u32::<BigEndian>(1)?; // entry_count

    match track.description() {
        SampleDescription::Avc {
            width,
            height,
            sps,
            pps,
            profile,
        } => {
            let entry = begin_box(w, b"avc1")?;
            write_zeros(w, 6)?;
            w.write_u16::<BigEndian>(1)?; // data_reference_index
            write_zeros(w, 16)?; // pre_defined + reserved
            w.write_u16::<BigEndian>(*width as u16)?;
            w.write_u16::<BigEndian>(*height as u16)?;
            w.write_u32::<BigEndian>(0x0048_0000)?; // 72 dpi
            w.write_u32::<BigEndian>(0x0048_0000)?;
            write_zeros(w, 4)?;
            w.write_u16::<BigEndian>(1)?; // frame_count
            write_pascal_string(w, "AVC Coding", 32)?;
            w.write_u16::<BigEndian>(0x0018)?; // depth
            w.write_i16::<BigEndian>(-1)?;

            let avcc = begin_box(w, b"avcC")?;
            w.write_u8(1)?; // configurationVersion
            w.write_u8(profile.profile_idc)?;
            w.write_u8(profile.constraint_flags)?;
            w.write_u8(profile.level_idc)?;
            w.write_u8(0xFC | 3)?; // lengthSizeMinusOne
            w.write_u8(0xE0 | 1)?; // one SPS
            w.write_u16::<BigEndian>(sps.len() as u16)?;
            w.write_all(sps)?;
            w.write_u8(1)?; // one PPS
            w.write_u16::<BigEndian>(pps.len() as u16)?;
            w.write_all(pps)?;
            end_box(w, avcc)?;

            end_box(w, entry)?;
        }
        SampleDescription::Mp4a {
            object_type_indication,
            sample_rate,
            channel_count,
            max_bitrate,
            decoder_config,
        } => {
            let entry = begin_box(w, b"mp4a")?;
            write_zeros(w, 6)?;
            w.write_u16::<BigEndian>(1)?; // data_reference_index
            write_zeros(w, 8)?;
            w.write_u16::<BigEndian>(*channel_count)?;
            w.write_u16::<BigEndian>(16)?; // samplesize
            write_zeros(w, 4)?;
            w.write_u32::<BigEndian>((*sample_rate).min(0xFFFF) << 16)?;
            write_esds(
                w,
                track.track_id(),
                *object_type_indication,
                *max_bitrate,
                decoder_config,
            )?;
            end_box(w, entry)?;
        }
    }

    end_box(w, stsd)
}

fn write_esds<W: Write + Seek>(
    w: &mut W,
    es_id: u32,
    object_type_indication: u8,
    bitrate: u32,
    decoder_config: &[u8],
) -> MuxResult<()> {
    let dsi_len = if decoder_config.is_empty() {
        0
    } else {
        2 + decoder_config.len()
    };
    let dec_config_len = 13 + dsi_len;
    // ES_ID + flags, DecoderConfigDescriptor, SLConfigDescriptor
    let es_len = 3 + (2 + dec_config_len) + 3;

    let esds = begin_box(w, b"esds")?;
    write_version_flags(w, 0, 0)?;

    w.write_u8(0x03)?; // ES_DescrTag
    write_descr_length(w, es_len)?;
    w.write_u16::<BigEndian>(es_id as u16)?;
    w.write_u8(0)?; // flags

    w.write_u8(0x04)?; // DecoderConfigDescrTag
    write_descr_length(w, dec_config_len)?;
    w.write_u8(object_type_indication)?;
    w.write_u8(0x15)?; // streamType audio, upstream 0, reserved 1
    w.write_u24::<BigEndian>(1536)?; // bufferSizeDB
    w.write_u32::<BigEndian>(bitrate)?; // maxBitrate
    w.write_u32::<BigEndian>(bitrate)?; // avgBitrate

    if !decoder_config.is_empty() {
        w.write_u8(0x05)?; // DecSpecificInfoTag
        write_descr_length(w, decoder_config.len())?;
        w.write_all(decoder_config)?;
    }

    w.write_u8(0x06)?; // SLConfigDescrTag
    write_descr_length(w, 1)?;
    w.write_u8(0x02)?;

    end_box(w, esds)
}

/// Descriptor sizes are small here; the one-byte form covers them.
fn write_descr_length<W: Write>(w: &mut W, len: usize) -> MuxResult<()> {
    if len > 0x7F {
        return Err(MuxError::Malformed(format!(
            "descriptor length {len} does not fit one byte"
        )));
    }
    w.write_u8(len as u8)?;
    Ok(())
}

/// Run-length encode sample durations into `(count, delta)` entries.
pub fn run_length_encode(durations: &[u32]) -> Vec<(u32, u32)> {
    let mut entries: Vec<(u32, u32)> = Vec::new();
    for &d in durations {
        match entries.last_mut() {
            Some((count, delta)) if *delta == d => *count += 1,
            _ => entries.push((1, d)),
        }
    }
    entries
}

fn write_stts<W: Write + Seek>(w: &mut W, durations: &[u32]) -> MuxResult<()> {
    let entries = run_length_encode(durations);
    let pos = begin_box(w, b"stts")?;
    write_version_flags(w, 0, 0)?;
    w.write_u32::<BigEndian>(entries.len() as u32)?;
    for (count, delta) in entries {
        w.write_u32::<BigEndian>(count)?;
        w.write_u32::<BigEndian>(delta)?;
    }
    end_box(w, pos)
}

fn write_stss<W: Write + Seek>(w: &mut W, sync_samples: &[u32]) -> MuxResult<()> {
    let pos = begin_box(w, b"stss")?;
    write_version_flags(w, 0, 0)?;
    w.write_u32::<BigEndian>(sync_samples.len() as u32)?;
    for &n in sync_samples {
        w.write_u32::<BigEndian>(n)?;
    }
    end_box(w, pos)
}

/// One sample per chunk.
fn write_stsc<W: Write + Seek>(w: &mut W, sample_count: usize) -> MuxResult<()> {
    let pos = begin_box(w, b"stsc")?;
    write_version_flags(w, 0, 0)?;
    if sample_count == 0 {
        w.write_u32::<BigEndian>(0)?;
    } else {
        w.write_u32::<BigEndian>(1)?;
        w.write_u32::<BigEndian>(1)?; // first_chunk
        w.write_u32::<BigEndian>(1)?; // samples_per_chunk
        w.write_u32::<BigEndian>(1)?; // sample_description_index
    }
    end_box(w, pos)
}

fn write_stsz<W: Write + Seek>(w: &mut W, track: &Track) -> MuxResult<()> {
    let samples = track.samples();
    let pos = begin_box(w, b"stsz")?;
    write_version_flags(w, 0, 0)?;
    let uniform = samples
        .first()
        .filter(|first| samples.iter().all(|s| s.size == first.size))
        .map(|first| first.size);
    match uniform {
        Some(size) => {
            w.write_u32::<BigEndian>(size)?;
            w.write_u32::<BigEndian>(samples.len() as u32)?;
        }
        None => {
            w.write_u32::<BigEndian>(0)?;
            w.write_u32::<BigEndian>(samples.len() as u32)?;
            for sample in samples {
                w.write_u32::<BigEndian>(sample.size)?;
            }
        }
    }
    end_box(w, pos)
}

fn write_chunk_offsets(w: &mut BoxWriter, track: &Track, wide: bool) -> MuxResult<()> {
    let pos = begin_box(w, if wide { b"co64" } else { b"stco" })?;
    write_version_flags(w, 0, 0)?;
    w.write_u32::<BigEndian>(track.samples().len() as u32)?;
    for sample in track.samples() {
        w.chunk_offset(sample.offset, wide)?;
    }
    end_box(w, pos)
}
