//! Low-level MP4 atom/box writing primitives.
//!
//! MP4 files are structured as nested boxes (atoms). Each box has:
//! - 4-byte big-endian size (includes header)
//! - 4-byte ASCII type (e.g. "ftyp", "moov", "mdat")
//!
//! "Full boxes" additionally have:
//! - 1-byte version
//! - 3-byte flags

use byteorder::{BigEndian, WriteBytesExt};
use std::io::{Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{MuxError, MuxResult};

/// Size of an mdat header with a 64-bit size field.
pub const LARGE_HEADER_SIZE: u64 = 16;

/// Standard video timescale (90kHz, same as MPEG-TS).
pub const VIDEO_TIMESCALE: u32 = 90_000;

/// Movie-level timescale (1000 = millisecond precision).
pub const MOVIE_TIMESCALE: u32 = 1000;

/// Seconds between 1904-01-01 (MP4 epoch) and 1970-01-01 (Unix epoch).
pub const MP4_EPOCH_OFFSET: u64 = 2_082_844_800;

/// Write a standard box header: 4-byte size + 4-byte type.
pub fn write_box_header<W: Write>(writer: &mut W, box_type: &[u8; 4], size: u32) -> MuxResult<()> {
    writer.write_u32::<BigEndian>(size)?;
    writer.write_all(box_type)?;
    Ok(())
}

/// Write a "full box" header: size + type + 1-byte version + 3-byte flags.
pub fn write_full_box_header<W: Write>(
    writer: &mut W,
    box_type: &[u8; 4],
    size: u32,
    version: u8,
    flags: u32,
) -> MuxResult<()> {
    write_box_header(writer, box_type, size)?;
    write_version_flags(writer, version, flags)
}

pub fn write_version_flags<W: Write>(writer: &mut W, version: u8, flags: u32) -> MuxResult<()> {
    writer.write_u32::<BigEndian>(((version as u32) << 24) | (flags & 0x00FF_FFFF))?;
    Ok(())
}

/// Start a box whose size is patched by [`end_box`]. Returns the position
/// of the size field.
pub fn begin_box<W: Write + Seek>(writer: &mut W, box_type: &[u8; 4]) -> MuxResult<u64> {
    let pos = writer.stream_position()?;
    writer.write_u32::<BigEndian>(0)?;
    writer.write_all(box_type)?;
    Ok(pos)
}

/// Patch the size of the box started at `size_pos` to end at the current position.
pub fn end_box<W: Write + Seek>(writer: &mut W, size_pos: u64) -> MuxResult<()> {
    let current = writer.stream_position()?;
    let size = current - size_pos;
    let size = u32::try_from(size)
        .map_err(|_| MuxError::Malformed(format!("Box size {size} exceeds 32-bit limit")))?;

    writer.seek(SeekFrom::Start(size_pos))?;
    writer.write_u32::<BigEndian>(size)?;
    writer.seek(SeekFrom::Start(current))?;
    Ok(())
}

/// Write a 64-bit box header (size field 1, then the 64-bit size).
pub fn write_large_box_header<W: Write>(
    writer: &mut W,
    box_type: &[u8; 4],
    large_size: u64,
) -> MuxResult<()> {
    writer.write_u32::<BigEndian>(1)?;
    writer.write_all(box_type)?;
    writer.write_u64::<BigEndian>(large_size)?;
    Ok(())
}

/// Write a 16.16 fixed-point number.
pub fn write_fixed_point_16_16<W: Write>(writer: &mut W, value: f64) -> MuxResult<()> {
    writer.write_i32::<BigEndian>((value * 65536.0).round() as i32)?;
    Ok(())
}

/// Write an 8.8 fixed-point number.
pub fn write_fixed_point_8_8<W: Write>(writer: &mut W, value: f64) -> MuxResult<()> {
    writer.write_i16::<BigEndian>((value * 256.0).round() as i16)?;
    Ok(())
}

pub fn write_zeros<W: Write>(writer: &mut W, count: usize) -> MuxResult<()> {
    writer.write_all(&vec![0u8; count])?;
    Ok(())
}

/// Write `s` into a Pascal-style fixed field: length byte, text, zero padding.
pub fn write_pascal_string<W: Write>(writer: &mut W, s: &str, len: usize) -> MuxResult<()> {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len - 1);
    writer.write_u8(n as u8)?;
    writer.write_all(&bytes[..n])?;
    write_zeros(writer, len - 1 - n)
}

/// ISO 639-2/T language code packed into 3x5 bits. Falls back to "und".
pub fn encode_language(lang: &str) -> u16 {
    let bytes = lang.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(|b| b.is_ascii_lowercase()) {
        return encode_language("und");
    }
    let a = (bytes[0] - 0x60) as u16;
    let b = (bytes[1] - 0x60) as u16;
    let c = (bytes[2] - 0x60) as u16;
    (a << 10) | (b << 5) | c
}

/// Convert a wall-clock time to seconds since 1904-01-01.
pub fn mp4_time(time: SystemTime) -> u64 {
    let unix = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    MP4_EPOCH_OFFSET + unix
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    #[test]
    fn test_write_box_header() {
        let mut buf = Vec::new();
        write_box_header(&mut buf, b"ftyp", 20).unwrap();
        assert_eq!(&buf[0..4], &[0x00, 0x00, 0x00, 0x14]);
        assert_eq!(&buf[4..8], b"ftyp");
    }

    #[test]
    fn test_full_box_header_with_flags() {
        let mut buf = Vec::new();
        write_full_box_header(&mut buf, b"tkhd", 100, 0, 0x000003).unwrap();
        assert_eq!(buf.len(), 12);
        assert_eq!(&buf[8..12], &[0x00, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn test_begin_and_end_box() {
        let mut cursor = Cursor::new(Vec::new());
        cursor.write_all(&[0xFF; 3]).unwrap();
        let pos = begin_box(&mut cursor, b"moov").unwrap();
        cursor.write_all(&[0xAA; 20]).unwrap();
        end_box(&mut cursor, pos).unwrap();

        let buf = cursor.into_inner();
        assert_eq!(buf.len(), 31);
        assert_eq!(&buf[3..7], &[0x00, 0x00, 0x00, 28]);
        assert_eq!(&buf[7..11], b"moov");
    }

    #[test]
    fn test_write_large_box_header() {
        let mut buf = Vec::new();
        write_large_box_header(&mut buf, b"mdat", 0x1_0000_0000).unwrap();
        assert_eq!(buf.len() as u64, LARGE_HEADER_SIZE);
        assert_eq!(&buf[0..4], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&buf[4..8], b"mdat");
        assert_eq!(&buf[8..16], &[0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_fixed_point() {
        let mut buf = Vec::new();
        write_fixed_point_16_16(&mut buf, 1.0).unwrap();
        write_fixed_point_8_8(&mut buf, 1.0).unwrap();
        write_fixed_point_16_16(&mut buf, -1.0).unwrap();
        assert_eq!(&buf[..6], &[0x00, 0x01, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(&buf[6..], &[0xFF, 0xFF, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_language() {
        assert_eq!(encode_language("und"), 0x55C4);
        assert_eq!(encode_language("eng"), 5575);
        assert_eq!(encode_language("x"), 0x55C4);
    }

    #[test]
    fn test_pascal_string() {
        let mut buf = Vec::new();
        write_pascal_string(&mut buf, "AVC Coding", 32).unwrap();
        assert_eq!(buf.len(), 32);
        assert_eq!(buf[0], 10);
        assert_eq!(&buf[1..11], b"AVC Coding");
        assert!(buf[11..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_mp4_time() {
        let t = UNIX_EPOCH + Duration::from_secs(1_704_067_200);
        assert_eq!(mp4_time(t), MP4_EPOCH_OFFSET + 1_704_067_200);
    }
}
