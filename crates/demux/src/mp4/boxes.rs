//! ISO BMFF box (atom) parser.
//!
//! Reads the parts of the box hierarchy the compressor needs:
//! ftyp, moov, mvhd, trak, tkhd, mdia, mdhd, hdlr, minf, stbl, and the
//! sample table boxes below it.
//!
//! Reference: ISO 14496-12 (ISO Base Media File Format).

use byteorder::{BigEndian, ReadBytesExt};
use sq_common::DemuxError;
use std::io::{Read, Seek, SeekFrom};
use tracing::{debug, trace};

// ─── Box FourCC constants ────────────────────────────────────────────

/// Convert 4 ASCII bytes to a u32 FourCC code.
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*code)
}

pub const FTYP: u32 = fourcc(b"ftyp");
pub const MOOV: u32 = fourcc(b"moov");
pub const MVHD: u32 = fourcc(b"mvhd");
pub const TRAK: u32 = fourcc(b"trak");
pub const TKHD: u32 = fourcc(b"tkhd");
pub const MDIA: u32 = fourcc(b"mdia");
pub const MDHD: u32 = fourcc(b"mdhd");
pub const HDLR: u32 = fourcc(b"hdlr");
pub const MINF: u32 = fourcc(b"minf");
pub const STBL: u32 = fourcc(b"stbl");
pub const STSD: u32 = fourcc(b"stsd");
pub const STTS: u32 = fourcc(b"stts");
pub const CTTS: u32 = fourcc(b"ctts");
pub const STSC: u32 = fourcc(b"stsc");
pub const STSZ: u32 = fourcc(b"stsz");
pub const STCO: u32 = fourcc(b"stco");
pub const CO64: u32 = fourcc(b"co64");
pub const STSS: u32 = fourcc(b"stss");
pub const MDAT: u32 = fourcc(b"mdat");
pub const AVC1: u32 = fourcc(b"avc1");
pub const AVC3: u32 = fourcc(b"avc3");
pub const AVCC: u32 = fourcc(b"avcC");
pub const MP4A: u32 = fourcc(b"mp4a");
pub const ESDS: u32 = fourcc(b"esds");
pub const WAVE: u32 = fourcc(b"wave");
pub const VIDE: u32 = fourcc(b"vide");
pub const SOUN: u32 = fourcc(b"soun");

/// Convert a FourCC u32 to a printable string for logging.
pub fn fourcc_to_string(cc: u32) -> String {
    cc.to_be_bytes()
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            }
        })
        .collect()
}

fn invalid(offset: u64, reason: impl Into<String>) -> DemuxError {
    DemuxError::InvalidStructure {
        offset,
        reason: reason.into(),
    }
}

// ─── Box Header ─────────────────────────────────────────────────────

/// A parsed ISO BMFF box header.
#[derive(Clone, Debug)]
pub struct BoxHeader {
    pub box_type: u32,
    /// Total box size including the header. 0 means "extends to EOF".
    pub size: u64,
    /// Offset of the box start in the file.
    pub offset: u64,
    /// 8, or 16 for boxes with a 64-bit size.
    pub header_size: u8,
}

impl BoxHeader {
    pub fn content_offset(&self) -> u64 {
        self.offset + self.header_size as u64
    }

    /// Payload size. `None` if the box extends to EOF.
    pub fn content_size(&self) -> Option<u64> {
        (self.size != 0).then(|| self.size - self.header_size as u64)
    }

    /// Offset of the first byte after this box. `None` if it extends to EOF.
    pub fn end_offset(&self) -> Option<u64> {
        (self.size != 0).then(|| self.offset + self.size)
    }

    fn require_end(&self, what: &str) -> Result<u64, DemuxError> {
        self.end_offset()
            .ok_or_else(|| invalid(self.offset, format!("{what} box has no definite size")))
    }
}

/// Read a box header from the current position. Returns `None` at EOF.
pub fn read_box_header<R: Read + Seek>(reader: &mut R) -> Result<Option<BoxHeader>, DemuxError> {
    let offset = reader.stream_position()?;

    let size32 = match reader.read_u32::<BigEndian>() {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(DemuxError::Io(e)),
    };
    let box_type = reader.read_u32::<BigEndian>()?;

    let (size, header_size) = match size32 {
        0 => (0u64, 8u8),
        1 => (reader.read_u64::<BigEndian>()?, 16u8),
        _ => (size32 as u64, 8u8),
    };

    if size != 0 && size < header_size as u64 {
        return Err(invalid(
            offset,
            format!(
                "Box '{}' has invalid size {} (less than header)",
                fourcc_to_string(box_type),
                size
            ),
        ));
    }

    trace!(
        box_type = %fourcc_to_string(box_type),
        offset,
        size,
        "box header"
    );

    Ok(Some(BoxHeader {
        box_type,
        size,
        offset,
        header_size,
    }))
}

/// Seek to the end of `header`'s box.
pub fn skip_box<R: Read + Seek>(reader: &mut R, header: &BoxHeader) -> Result<(), DemuxError> {
    match header.end_offset() {
        Some(end) => reader.seek(SeekFrom::Start(end))?,
        None => reader.seek(SeekFrom::End(0))?,
    };
    Ok(())
}

fn skip_bytes<R: Read>(reader: &mut R, count: usize) -> Result<(), DemuxError> {
    let copied = std::io::copy(&mut reader.by_ref().take(count as u64), &mut std::io::sink())?;
    if copied as usize != count {
        return Err(DemuxError::TruncatedData {
            expected: count,
            got: copied as usize,
        });
    }
    Ok(())
}

/// Read the version byte of a full box and skip its 24-bit flags.
fn read_version<R: Read>(reader: &mut R) -> Result<u8, DemuxError> {
    let version = reader.read_u8()?;
    skip_bytes(reader, 3)?;
    Ok(version)
}

// ─── ftyp ───────────────────────────────────────────────────────────

/// Parsed ftyp (File Type) box.
#[derive(Clone, Debug)]
pub struct FtypBox {
    pub major_brand: u32,
    pub minor_version: u32,
    pub compatible_brands: Vec<u32>,
}

/// Parse an ftyp box. Reader must be positioned after the header.
pub fn parse_ftyp<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
) -> Result<FtypBox, DemuxError> {
    let content_size = header
        .content_size()
        .ok_or_else(|| invalid(header.offset, "ftyp box cannot extend to EOF"))?;

    let major_brand = reader.read_u32::<BigEndian>()?;
    let minor_version = reader.read_u32::<BigEndian>()?;

    let brand_count = content_size.saturating_sub(8) / 4;
    let mut compatible_brands = Vec::with_capacity(brand_count as usize);
    for _ in 0..brand_count {
        compatible_brands.push(reader.read_u32::<BigEndian>()?);
    }

    debug!(
        major_brand = %fourcc_to_string(major_brand),
        minor_version,
        compatible = compatible_brands.len(),
        "ftyp"
    );

    Ok(FtypBox {
        major_brand,
        minor_version,
        compatible_brands,
    })
}

// ─── Headers: mvhd / mdhd / tkhd / hdlr ─────────────────────────────

/// Timescale and duration, shared layout of mvhd and mdhd.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MediaTiming {
    pub timescale: u32,
    pub duration: u64,
}

/// Parse the timing fields of an mvhd or mdhd box.
pub fn parse_timing<R: Read>(reader: &mut R) -> Result<MediaTiming, DemuxError> {
    let version = read_version(reader)?;
    let (timescale, duration) = if version == 1 {
        skip_bytes(reader, 16)?;
        let timescale = reader.read_u32::<BigEndian>()?;
        (timescale, reader.read_u64::<BigEndian>()?)
    } else {
        skip_bytes(reader, 8)?;
        let timescale = reader.read_u32::<BigEndian>()?;
        (timescale, reader.read_u32::<BigEndian>()? as u64)
    };
    Ok(MediaTiming {
        timescale,
        duration,
    })
}

/// Parsed tkhd (Track Header) box.
#[derive(Clone, Debug)]
pub struct TkhdBox {
    pub track_id: u32,
    pub duration: u64,
    pub width: u32,
    pub height: u32,
    /// Rotation encoded by the display matrix, if it is a right angle.
    pub rotation: Option<i32>,
}

/// Map the 2x2 part of a display matrix (16.16 fixed point) to degrees.
pub fn rotation_from_matrix(a: i32, b: i32, c: i32, d: i32) -> Option<i32> {
    const ONE: i32 = 0x0001_0000;
    match (a, b, c, d) {
        (ONE, 0, 0, ONE) => Some(0),
        (0, ONE, x, 0) if x == -ONE => Some(90),
        (x, 0, 0, y) if x == -ONE && y == -ONE => Some(180),
        (0, x, ONE, 0) if x == -ONE => Some(270),
        _ => None,
    }
}

/// Parse a tkhd box. Reader must be positioned after the header.
pub fn parse_tkhd<R: Read>(reader: &mut R) -> Result<TkhdBox, DemuxError> {
    let version = read_version(reader)?;

    let (track_id, duration) = if version == 1 {
        skip_bytes(reader, 16)?;
        let track_id = reader.read_u32::<BigEndian>()?;
        skip_bytes(reader, 4)?;
        (track_id, reader.read_u64::<BigEndian>()?)
    } else {
        skip_bytes(reader, 8)?;
        let track_id = reader.read_u32::<BigEndian>()?;
        skip_bytes(reader, 4)?;
        (track_id, reader.read_u32::<BigEndian>()? as u64)
    };

    // reserved (8), layer (2), alternate_group (2), volume (2), reserved (2)
    skip_bytes(reader, 16)?;

    // matrix {a, b, u, c, d, v, x, y, w}
    let mut matrix = [0i32; 9];
    for value in matrix.iter_mut() {
        *value = reader.read_i32::<BigEndian>()?;
    }
    let rotation = rotation_from_matrix(matrix[0], matrix[1], matrix[3], matrix[4]);

    let width = reader.read_u32::<BigEndian>()? >> 16;
    let height = reader.read_u32::<BigEndian>()? >> 16;

    debug!(track_id, duration, width, height, ?rotation, "tkhd");

    Ok(TkhdBox {
        track_id,
        duration,
        width,
        height,
        rotation,
    })
}

/// Parse an hdlr box and return its handler type.
pub fn parse_hdlr<R: Read>(reader: &mut R) -> Result<u32, DemuxError> {
    read_version(reader)?;
    let _pre_defined = reader.read_u32::<BigEndian>()?;
    let handler_type = reader.read_u32::<BigEndian>()?;
    debug!(handler = %fourcc_to_string(handler_type), "hdlr");
    Ok(handler_type)
}

// ─── stsd ───────────────────────────────────────────────────────────

/// AVC Decoder Configuration Record (avcC).
#[derive(Clone, Debug, PartialEq)]
pub struct AvccConfig {
    pub profile: u8,
    pub profile_compat: u8,
    pub level: u8,
    pub length_size_minus_one: u8,
    pub sps_list: Vec<Vec<u8>>,
    pub pps_list: Vec<Vec<u8>>,
}

/// Audio decoder configuration from an esds box.
#[derive(Clone, Debug, PartialEq)]
pub struct EsdsConfig {
    pub object_type_indication: u8,
    pub avg_bitrate: u32,
    pub max_bitrate: u32,
    /// DecoderSpecificInfo payload (AudioSpecificConfig for AAC).
    pub decoder_specific_info: Vec<u8>,
}

/// First sample entry of an stsd box.
#[derive(Clone, Debug, PartialEq)]
pub enum SampleEntryDesc {
    Avc {
        width: u16,
        height: u16,
        avcc: Option<AvccConfig>,
    },
    Mp4a {
        channel_count: u16,
        sample_rate: u32,
        esds: Option<EsdsConfig>,
    },
    Other(u32),
}

/// Parse an stsd box and return its first sample entry.
pub fn parse_stsd<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
) -> Result<Option<SampleEntryDesc>, DemuxError> {
    let box_end = header.require_end("stsd")?;
    read_version(reader)?;
    let entry_count = reader.read_u32::<BigEndian>()?;
    debug!(entries = entry_count, "stsd");

    let mut result = None;
    if entry_count > 0 {
        let entry = read_box_header(reader)?
            .ok_or_else(|| invalid(header.offset, "Unexpected EOF in stsd entries"))?;
        result = Some(match entry.box_type {
            AVC1 | AVC3 => parse_avc_sample_entry(reader, &entry)?,
            MP4A => parse_mp4a_sample_entry(reader, &entry)?,
            other => {
                debug!(codec = %fourcc_to_string(other), "stsd: unsupported sample entry");
                SampleEntryDesc::Other(other)
            }
        });
    }

    reader.seek(SeekFrom::Start(box_end))?;
    Ok(result)
}

fn parse_avc_sample_entry<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
) -> Result<SampleEntryDesc, DemuxError> {
    let entry_end = header.require_end("avc1")?;

    // reserved (6), data_ref_index (2), pre_defined/reserved (16)
    skip_bytes(reader, 24)?;
    let width = reader.read_u16::<BigEndian>()?;
    let height = reader.read_u16::<BigEndian>()?;
    // resolutions (8), reserved (4), frame_count (2), compressor (32), depth (2), pre_defined (2)
    skip_bytes(reader, 50)?;

    let mut avcc = None;
    while reader.stream_position()? < entry_end {
        let Some(sub) = read_box_header(reader)? else {
            break;
        };
        if sub.box_type == AVCC {
            avcc = Some(parse_avcc(reader)?);
        }
        skip_box(reader, &sub)?;
    }

    reader.seek(SeekFrom::Start(entry_end))?;
    debug!(width, height, has_avcc = avcc.is_some(), "avc1 sample entry");
    Ok(SampleEntryDesc::Avc {
        width,
        height,
        avcc,
    })
}

/// Parse an AVCDecoderConfigurationRecord.
pub fn parse_avcc<R: Read>(reader: &mut R) -> Result<AvccConfig, DemuxError> {
    let version = reader.read_u8()?;
    if version != 1 {
        return Err(invalid(0, format!("Unexpected avcC version: {version}")));
    }

    let profile = reader.read_u8()?;
    let profile_compat = reader.read_u8()?;
    let level = reader.read_u8()?;
    let length_size_minus_one = reader.read_u8()? & 0x03;

    let sps_count = (reader.read_u8()? & 0x1F) as usize;
    let mut sps_list = Vec::with_capacity(sps_count);
    for _ in 0..sps_count {
        sps_list.push(read_u16_prefixed(reader)?);
    }

    let pps_count = reader.read_u8()? as usize;
    let mut pps_list = Vec::with_capacity(pps_count);
    for _ in 0..pps_count {
        pps_list.push(read_u16_prefixed(reader)?);
    }

    Ok(AvccConfig {
        profile,
        profile_compat,
        level,
        length_size_minus_one,
        sps_list,
        pps_list,
    })
}

fn read_u16_prefixed<R: Read>(reader: &mut R) -> Result<Vec<u8>, DemuxError> {
    let len = reader.read_u16::<BigEndian>()? as usize;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    Ok(data)
}

fn parse_mp4a_sample_entry<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
) -> Result<SampleEntryDesc, DemuxError> {
    let entry_end = header.require_end("mp4a")?;

    // reserved (6), data_ref_index (2), version/revision/vendor (8)
    skip_bytes(reader, 16)?;
    let channel_count = reader.read_u16::<BigEndian>()?;
    // sample_size (2), compression_id (2), packet_size (2)
    skip_bytes(reader, 6)?;
    let sample_rate = reader.read_u32::<BigEndian>()? >> 16;

    let mut esds = None;
    while reader.stream_position()? < entry_end {
        let Some(sub) = read_box_header(reader)? else {
            break;
        };
        match sub.box_type {
            ESDS => esds = Some(parse_esds(reader, &sub)?),
            WAVE => {
                // QuickTime wraps esds inside a wave box.
                let wave_end = sub.end_offset().unwrap_or(entry_end);
                while reader.stream_position()? < wave_end {
                    let Some(child) = read_box_header(reader)? else {
                        break;
                    };
                    if child.box_type == ESDS {
                        esds = Some(parse_esds(reader, &child)?);
                    }
                    skip_box(reader, &child)?;
                }
            }
            _ => {}
        }
        skip_box(reader, &sub)?;
    }

    reader.seek(SeekFrom::Start(entry_end))?;
    debug!(channel_count, sample_rate, "mp4a sample entry");
    Ok(SampleEntryDesc::Mp4a {
        channel_count,
        sample_rate,
        esds,
    })
}

fn parse_esds<R: Read + Seek>(reader: &mut R, header: &BoxHeader) -> Result<EsdsConfig, DemuxError> {
    let box_end = header.require_end("esds")?;
    read_version(reader)?;
    let remaining = box_end.saturating_sub(reader.stream_position()?) as usize;
    let mut data = vec![0u8; remaining];
    reader.read_exact(&mut data)?;
    parse_es_descriptor(&data).ok_or_else(|| invalid(header.offset, "esds: malformed ES_Descriptor"))
}

/// Walk ES_Descriptor (0x03) → DecoderConfigDescriptor (0x04) →
/// DecoderSpecificInfo (0x05).
fn parse_es_descriptor(data: &[u8]) -> Option<EsdsConfig> {
    let mut pos = 0;
    if *data.get(pos)? != 0x03 {
        return None;
    }
    pos += 1;
    read_descriptor_length(data, &mut pos);
    let flags = *data.get(pos + 2)?;
    // ES_ID (2) + flags (1), then optional dependsOn / URL / OCR fields
    pos += 3;
    if flags & 0x80 != 0 {
        pos += 2;
    }
    if flags & 0x40 != 0 {
        pos += 1 + *data.get(pos)? as usize;
    }
    if flags & 0x20 != 0 {
        pos += 2;
    }

    if *data.get(pos)? != 0x04 {
        return None;
    }
    pos += 1;
    read_descriptor_length(data, &mut pos);
    let header = data.get(pos..pos + 13)?;
    let object_type_indication = header[0];
    let max_bitrate = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
    let avg_bitrate = u32::from_be_bytes([header[9], header[10], header[11], header[12]]);
    pos += 13;

    let mut decoder_specific_info = Vec::new();
    if data.get(pos) == Some(&0x05) {
        pos += 1;
        let len = read_descriptor_length(data, &mut pos);
        decoder_specific_info = data.get(pos..pos + len)?.to_vec();
    }

    Some(EsdsConfig {
        object_type_indication,
        avg_bitrate,
        max_bitrate,
        decoder_specific_info,
    })
}

/// Variable-length descriptor size: 7 bits per byte, high bit continues.
fn read_descriptor_length(data: &[u8], pos: &mut usize) -> usize {
    let mut len = 0usize;
    for _ in 0..4 {
        let Some(&b) = data.get(*pos) else {
            break;
        };
        *pos += 1;
        len = (len << 7) | (b & 0x7F) as usize;
        if b & 0x80 == 0 {
            break;
        }
    }
    len
}

// ─── Sample table boxes ─────────────────────────────────────────────

/// stts (Decoding Time to Sample) entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SttsEntry {
    pub sample_count: u32,
    pub sample_delta: u32,
}

/// ctts (Composition Time to Sample) entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CttsEntry {
    pub sample_count: u32,
    pub sample_offset: i32,
}

/// stsc (Sample to Chunk) entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StscEntry {
    /// 1-based.
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_description_index: u32,
}

/// Parsed stsz (Sample Size) box.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StszBox {
    /// Non-zero when every sample has this size.
    pub default_sample_size: u32,
    /// Per-sample sizes, empty when `default_sample_size` is set.
    pub sample_sizes: Vec<u32>,
    pub sample_count: u32,
}

fn read_table<R: Read, T>(
    reader: &mut R,
    mut read_entry: impl FnMut(&mut R, u8) -> Result<T, DemuxError>,
) -> Result<Vec<T>, DemuxError> {
    let version = read_version(reader)?;
    let count = reader.read_u32::<BigEndian>()? as usize;
    // Cap preallocation; a corrupt count fails on read instead.
    let mut entries = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        entries.push(read_entry(reader, version)?);
    }
    Ok(entries)
}

pub fn parse_stts<R: Read>(reader: &mut R) -> Result<Vec<SttsEntry>, DemuxError> {
    read_table(reader, |r, _| {
        Ok(SttsEntry {
            sample_count: r.read_u32::<BigEndian>()?,
            sample_delta: r.read_u32::<BigEndian>()?,
        })
    })
}

pub fn parse_ctts<R: Read>(reader: &mut R) -> Result<Vec<CttsEntry>, DemuxError> {
    read_table(reader, |r, version| {
        let sample_count = r.read_u32::<BigEndian>()?;
        let sample_offset = if version == 0 {
            r.read_u32::<BigEndian>()? as i32
        } else {
            r.read_i32::<BigEndian>()?
        };
        Ok(CttsEntry {
            sample_count,
            sample_offset,
        })
    })
}

pub fn parse_stsc<R: Read>(reader: &mut R) -> Result<Vec<StscEntry>, DemuxError> {
    read_table(reader, |r, _| {
        Ok(StscEntry {
            first_chunk: r.read_u32::<BigEndian>()?,
            samples_per_chunk: r.read_u32::<BigEndian>()?,
            sample_description_index: r.read_u32::<BigEndian>()?,
        })
    })
}

pub fn parse_stsz<R: Read>(reader: &mut R) -> Result<StszBox, DemuxError> {
    read_version(reader)?;
    let default_sample_size = reader.read_u32::<BigEndian>()?;
    let sample_count = reader.read_u32::<BigEndian>()?;
    let mut sample_sizes = Vec::new();
    if default_sample_size == 0 {
        sample_sizes.reserve((sample_count as usize).min(1 << 16));
        for _ in 0..sample_count {
            sample_sizes.push(reader.read_u32::<BigEndian>()?);
        }
    }
    Ok(StszBox {
        default_sample_size,
        sample_sizes,
        sample_count,
    })
}

pub fn parse_stco<R: Read>(reader: &mut R) -> Result<Vec<u64>, DemuxError> {
    read_table(reader, |r, _| Ok(r.read_u32::<BigEndian>()? as u64))
}

pub fn parse_co64<R: Read>(reader: &mut R) -> Result<Vec<u64>, DemuxError> {
    read_table(reader, |r, _| Ok(r.read_u64::<BigEndian>()?))
}

/// Returns 1-based sync sample numbers.
pub fn parse_stss<R: Read>(reader: &mut R) -> Result<Vec<u32>, DemuxError> {
    read_table(reader, |r, _| Ok(r.read_u32::<BigEndian>()?))
}

// ─── moov / trak ────────────────────────────────────────────────────

/// Everything parsed from one trak box.
#[derive(Clone, Debug)]
pub struct ParsedTrack {
    pub track_id: u32,
    pub handler_type: u32,
    pub timescale: u32,
    pub duration: u64,
    pub width: u32,
    pub height: u32,
    pub rotation: Option<i32>,
    pub sample_entry: Option<SampleEntryDesc>,
    pub stts: Vec<SttsEntry>,
    pub ctts: Vec<CttsEntry>,
    pub stsc: Vec<StscEntry>,
    pub stsz: StszBox,
    pub chunk_offsets: Vec<u64>,
    /// 1-based sync sample numbers. Empty means every sample is sync.
    pub sync_samples: Vec<u32>,
}

impl ParsedTrack {
    pub fn is_video(&self) -> bool {
        self.handler_type == VIDE
    }

    pub fn is_audio(&self) -> bool {
        self.handler_type == SOUN
    }
}

/// All parsed data from the moov box.
#[derive(Clone, Debug)]
pub struct ParsedMoov {
    /// `None` when the moov has no mvhd.
    pub movie_timing: Option<MediaTiming>,
    /// Tracks in file order, video and audio only.
    pub tracks: Vec<ParsedTrack>,
}

/// Accumulates the boxes found while walking a trak subtree.
#[derive(Default)]
struct TrakBuilder {
    tkhd: Option<TkhdBox>,
    mdhd: Option<MediaTiming>,
    handler_type: Option<u32>,
    sample_entry: Option<SampleEntryDesc>,
    stts: Vec<SttsEntry>,
    ctts: Vec<CttsEntry>,
    stsc: Vec<StscEntry>,
    stsz: StszBox,
    chunk_offsets: Vec<u64>,
    sync_samples: Vec<u32>,
}

impl TrakBuilder {
    fn walk<R: Read + Seek>(&mut self, reader: &mut R, container_end: u64) -> Result<(), DemuxError> {
        while reader.stream_position()? < container_end {
            let Some(child) = read_box_header(reader)? else {
                break;
            };
            match child.box_type {
                MDIA | MINF | STBL => {
                    let end = child.end_offset().unwrap_or(container_end);
                    self.walk(reader, end)?;
                }
                TKHD => self.tkhd = Some(parse_tkhd(reader)?),
                MDHD => self.mdhd = Some(parse_timing(reader)?),
                HDLR => self.handler_type = Some(parse_hdlr(reader)?),
                STSD => self.sample_entry = parse_stsd(reader, &child)?,
                STTS => self.stts = parse_stts(reader)?,
                CTTS => self.ctts = parse_ctts(reader)?,
                STSC => self.stsc = parse_stsc(reader)?,
                STSZ => self.stsz = parse_stsz(reader)?,
                STCO => self.chunk_offsets = parse_stco(reader)?,
                CO64 => self.chunk_offsets = parse_co64(reader)?,
                STSS => self.sync_samples = parse_stss(reader)?,
                _ => {}
            }
            skip_box(reader, &child)?;
        }
        Ok(())
    }

    fn finish(self, offset: u64) -> Result<Option<ParsedTrack>, DemuxError> {
        let handler_type = match self.handler_type {
            Some(h @ (VIDE | SOUN)) => h,
            _ => return Ok(None),
        };
        let tkhd = self
            .tkhd
            .ok_or_else(|| invalid(offset, "Track missing tkhd"))?;
        let mdhd = self
            .mdhd
            .ok_or_else(|| invalid(offset, "Track missing mdhd"))?;

        let (mut width, mut height) = (tkhd.width, tkhd.height);
        if let Some(SampleEntryDesc::Avc {
            width: w,
            height: h,
            ..
        }) = &self.sample_entry
        {
            if width == 0 {
                width = *w as u32;
            }
            if height == 0 {
                height = *h as u32;
            }
        }

        Ok(Some(ParsedTrack {
            track_id: tkhd.track_id,
            handler_type,
            timescale: mdhd.timescale,
            duration: mdhd.duration,
            width,
            height,
            rotation: tkhd.rotation,
            sample_entry: self.sample_entry,
            stts: self.stts,
            ctts: self.ctts,
            stsc: self.stsc,
            stsz: self.stsz,
            chunk_offsets: self.chunk_offsets,
            sync_samples: self.sync_samples,
        }))
    }
}

/// Parse the moov hierarchy. Reader must be positioned after the moov header.
pub fn parse_moov<R: Read + Seek>(
    reader: &mut R,
    moov_header: &BoxHeader,
) -> Result<ParsedMoov, DemuxError> {
    let moov_end = moov_header.require_end("moov")?;
    let mut movie_timing = None;
    let mut tracks = Vec::new();

    while reader.stream_position()? < moov_end {
        let Some(child) = read_box_header(reader)? else {
            break;
        };
        match child.box_type {
            MVHD => movie_timing = Some(parse_timing(reader)?),
            TRAK => {
                let trak_end = child.require_end("trak")?;
                let mut builder = TrakBuilder::default();
                builder.walk(reader, trak_end)?;
                if let Some(track) = builder.finish(child.offset)? {
                    tracks.push(track);
                }
            }
            _ => {}
        }
        skip_box(reader, &child)?;
    }

    debug!(
        timing = ?movie_timing,
        tracks = tracks.len(),
        "moov parsed"
    );

    Ok(ParsedMoov {
        movie_timing,
        tracks,
    })
}

/// Scan top-level boxes for moov and parse it.
pub fn find_and_parse_moov<R: Read + Seek>(reader: &mut R) -> Result<ParsedMoov, DemuxError> {
    reader.seek(SeekFrom::Start(0))?;
    while let Some(header) = read_box_header(reader)? {
        if header.box_type == MOOV {
            return parse_moov(reader, &header);
        }
        if header.size == 0 {
            break;
        }
        skip_box(reader, &header)?;
    }
    Err(invalid(0, "No moov box found"))
}

// ─── Tests ──────────────────────────────────────────────────────────
