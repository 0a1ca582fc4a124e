//! Fast-start rewrite: move a trailing moov in front of the media data so
//! players can start before the whole file has arrived.
//!
//! The moov atom is loaded into memory, every `stco`/`co64` entry is shifted
//! by the moov size, and the file is rewritten as ftyp, moov, then
//! everything that sat between ftyp and moov.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{MuxError, MuxResult};

const COPY_CHUNK: usize = 64 * 1024;

/// Top-level atoms the rewriter knows how to carry along.
const KNOWN_TOP_LEVEL: [&[u8; 4]; 10] = [
    b"free", b"junk", b"mdat", b"moov", b"pnot", b"skip", b"wide", b"PICT", b"uuid", b"ftyp",
];

/// Containers on the path from moov to the chunk offset tables.
const OFFSET_CONTAINERS: [&[u8; 4]; 4] = [b"trak", b"mdia", b"minf", b"stbl"];

/// Outcome of [`make_fast_start`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FastStart {
    /// moov was moved in front of mdat and the output written.
    Relocated,
    /// moov already precedes mdat; no output was written.
    AlreadyFastStart,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct TopLevelAtom {
    kind: [u8; 4],
    offset: u64,
    size: u64,
}

impl TopLevelAtom {
    fn end(&self) -> u64 {
        self.offset + self.size
    }

    fn name(&self) -> String {
        String::from_utf8_lossy(&self.kind).into_owned()
    }
}

/// Read the top-level atom list of a file of `file_len` bytes.
fn scan_top_level<R: Read + Seek>(reader: &mut R, file_len: u64) -> MuxResult<Vec<TopLevelAtom>> {
    let mut atoms = Vec::new();
    let mut offset = 0u64;
    while offset + 8 <= file_len {
        reader.seek(SeekFrom::Start(offset))?;
        let size32 = reader.read_u32::<BigEndian>()?;
        let mut kind = [0u8; 4];
        reader.read_exact(&mut kind)?;

        let size = match size32 {
            0 => file_len - offset,
            1 => reader.read_u64::<BigEndian>()?,
            n => n as u64,
        };
        let atom = TopLevelAtom { kind, offset, size };

        if !KNOWN_TOP_LEVEL.iter().any(|k| **k == kind) {
            return Err(MuxError::UnsupportedLayout(atom.name()));
        }
        if size < 8 || atom.end() > file_len {
            return Err(MuxError::Malformed(format!(
                "top-level atom '{}' at {offset} has bad size {size}",
                atom.name()
            )));
        }
        debug!(atom = %atom.name(), offset, size, "top-level atom");
        atoms.push(atom);
        offset = atom.end();
    }
    if offset != file_len {
        warn!(trailing = file_len - offset, "ignoring trailing bytes after last atom");
    }
    Ok(atoms)
}

/// Shift every chunk offset inside `moov` by `shift` bytes.
///
/// Returns the number of tables patched.
fn patch_chunk_offsets(moov: &mut [u8], shift: u64) -> MuxResult<usize> {
    let header_len = if BigEndian::read_u32(&moov[0..4]) == 1 { 16 } else { 8 };
    patch_children(moov, header_len, shift)
}

fn patch_children(buf: &mut [u8], start: usize, shift: u64) -> MuxResult<usize> {
    let mut patched = 0;
    let mut pos = start;
    while pos + 8 <= buf.len() {
        let size = BigEndian::read_u32(&buf[pos..pos + 4]) as usize;
        let kind: [u8; 4] = [buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]];
        if size < 8 || pos + size > buf.len() {
            return Err(MuxError::Malformed(format!(
                "atom '{}' inside moov overruns its parent",
                String::from_utf8_lossy(&kind)
            )));
        }
        let atom = &mut buf[pos..pos + size];
        match &kind {
            b"stco" => {
                patch_table(atom, 4, shift)?;
                patched += 1;
            }
            b"co64" => {
                patch_table(atom, 8, shift)?;
                patched += 1;
            }
            k if OFFSET_CONTAINERS.contains(&k) => {
                patched += patch_children(atom, 8, shift)?;
            }
            _ => {}
        }
        pos += size;
    }
    Ok(patched)
}

fn patch_table(atom: &mut [u8], width: usize, shift: u64) -> MuxResult<()> {
    if atom.len() < 16 {
        return Err(MuxError::Malformed("chunk offset table too short".into()));
    }
    let count = BigEndian::read_u32(&atom[12..16]) as usize;
    let entries = &mut atom[16..];
    if count.saturating_mul(width) > entries.len() {
        return Err(MuxError::Malformed(format!(
            "chunk offset table with {count} entries extends past its atom"
        )));
    }

    for entry in entries.chunks_exact_mut(width).take(count) {
        if width == 4 {
            let offset = BigEndian::read_u32(entry) as u64;
            let shifted = u32::try_from(offset + shift)
                .map_err(|_| MuxError::OffsetOverflow { offset, shift })?;
            BigEndian::write_u32(entry, shifted);
        } else {
            let offset = BigEndian::read_u64(entry);
            let shifted = offset
                .checked_add(shift)
                .ok_or(MuxError::OffsetOverflow { offset, shift })?;
            BigEndian::write_u64(entry, shifted);
        }
    }
    Ok(())
}

fn copy_range<R: Read + Seek, W: Write>(
    reader: &mut R,
    writer: &mut W,
    start: u64,
    len: u64,
) -> MuxResult<()> {
    reader.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(COPY_CHUNK as u64) as usize;
        reader.read_exact(&mut buf[..want])?;
        writer.write_all(&buf[..want])?;
        remaining -= want as u64;
    }
    Ok(())
}

/// Rewrite `input` into `output` with moov ahead of mdat.
///
/// Nothing is written when the input is already fast-start. A partially
/// written output is removed on error.
pub fn make_fast_start(input: &Path, output: &Path) -> MuxResult<FastStart> {
    let mut reader = File::open(input)?;
    let file_len = reader.metadata()?.len();
    let atoms = scan_top_level(&mut reader, file_len)?;

    let moov_index = atoms.iter().position(|a| &a.kind == b"moov");
    let mdat_index = atoms.iter().position(|a| &a.kind == b"mdat");
    if let (Some(moov), Some(mdat)) = (moov_index, mdat_index) {
        if moov < mdat {
            info!(input = %input.display(), "already fast-start");
            return Ok(FastStart::AlreadyFastStart);
        }
    }

    // Everything between ftyp and moov shifts by the moov size; atoms ahead
    // of ftyp would shift by more.
    let ftyp = atoms.iter().find(|a| &a.kind == b"ftyp").copied();
    if let Some(f) = ftyp.filter(|f| f.offset != 0) {
        warn!(input = %input.display(), offset = f.offset, "ftyp is not the first atom");
        return Err(MuxError::UnsupportedLayout(format!(
            "{} (ftyp must come first)",
            atoms[0].name()
        )));
    }

    let last = atoms
        .last()
        .ok_or_else(|| MuxError::Malformed("file contains no atoms".into()))?;
    if &last.kind != b"moov" {
        return Err(MuxError::NotFastStartable(last.name()));
    }
    let moov = *last;
    let moov_len = usize::try_from(moov.size)
        .ok()
        .filter(|&n| n <= u32::MAX as usize)
        .ok_or_else(|| MuxError::Malformed(format!("moov of {} bytes is too large", moov.size)))?;

    let mut moov_bytes = vec![0u8; moov_len];
    reader.seek(SeekFrom::Start(moov.offset))?;
    reader.read_exact(&mut moov_bytes)?;
    if moov_bytes.len() >= 16 && &moov_bytes[12..16] == b"cmov" {
        return Err(MuxError::CompressedMoov);
    }
    let tables = patch_chunk_offsets(&mut moov_bytes, moov.size)?;

    let start = ftyp.map_or(0, |f| f.end());
    let rest_len = moov.offset.saturating_sub(start);

    let result = write_relocated(&mut reader, output, ftyp, &moov_bytes, start, rest_len);
    if let Err(e) = result {
        if let Err(rm) = fs::remove_file(output) {
            if rm.kind() != ErrorKind::NotFound {
                warn!(output = %output.display(), error = %rm, "could not remove partial output");
            }
        }
        return Err(e);
    }

    info!(
        input = %input.display(),
        output = %output.display(),
        moov_size = moov.size,
        tables,
        "moov relocated"
    );
    Ok(FastStart::Relocated)
}

fn write_relocated(
    reader: &mut File,
    output: &Path,
    ftyp: Option<TopLevelAtom>,
    moov: &[u8],
    rest_start: u64,
    rest_len: u64,
) -> MuxResult<()> {
    let mut writer = BufWriter::new(File::create(output)?);
    if let Some(ftyp) = ftyp {
        copy_range(reader, &mut writer, ftyp.offset, ftyp.size)?;
    }
    writer.write_all(moov)?;
    copy_range(reader, &mut writer, rest_start, rest_len)?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;
    Ok(())
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "movie".to_string());
    path.with_file_name(format!(".{name}.faststart"))
}

/// Make `path` fast-start, replacing it only when moov was moved.
pub fn faststart_in_place(path: &Path) -> MuxResult<FastStart> {
    let temp = sibling_temp_path(path);
    let outcome = make_fast_start(path, &temp)?;
    match outcome {
        FastStart::Relocated => fs::rename(&temp, path)?,
        FastStart::AlreadyFastStart => match fs::remove_file(&temp) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        },
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sq_faststart_{}_{name}.mp4", std::process::id()))
    }

    fn atom(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<BigEndian>(8 + body.len() as u32).unwrap();
        out.extend_from_slice(kind);
        out.extend_from_slice(body);
        out
    }

    fn stco(offsets: &[u32]) -> Vec<u8> {
        let mut body = vec![0, 0, 0, 0];
        body.write_u32::<BigEndian>(offsets.len() as u32).unwrap();
        for &o in offsets {
            body.write_u32::<BigEndian>(o).unwrap();
        }
        atom(b"stco", &body)
    }

    fn moov_with(table: Vec<u8>) -> Vec<u8> {
        let stbl = atom(b"stbl", &table);
        let minf = atom(b"minf", &stbl);
        let mdia = atom(b"mdia", &minf);
        let trak = atom(b"trak", &mdia);
        let mvhd = atom(b"mvhd", &[0u8; 100]);
        atom(b"moov", &[mvhd, trak].concat())
    }

    fn ftyp() -> Vec<u8> {
        atom(b"ftyp", b"isom\0\0\x02\0isommp41")
    }

    #[test]
    fn relocates_trailing_moov() {
        let input = temp_path("reloc_in");
        let output = temp_path("reloc_out");
        let ftyp = ftyp();
        let mdat = atom(b"mdat", &[1, 2, 3, 4, 5, 6]);
        let first_sample = (ftyp.len() + 8) as u32;
        let moov = moov_with(stco(&[first_sample, first_sample + 3]));
        fs::write(&input, [ftyp.clone(), mdat.clone(), moov.clone()].concat()).unwrap();

        assert_eq!(make_fast_start(&input, &output).unwrap(), FastStart::Relocated);

        let out = fs::read(&output).unwrap();
        assert_eq!(out.len(), ftyp.len() + moov.len() + mdat.len());
        assert_eq!(&out[..ftyp.len()], &ftyp[..]);
        assert_eq!(&out[ftyp.len() + 4..ftyp.len() + 8], b"moov");
        assert_eq!(&out[ftyp.len() + moov.len()..], &mdat[..]);

        let table_at = out.windows(4).position(|w| w == b"stco").unwrap() + 12;
        let first = BigEndian::read_u32(&out[table_at..]);
        let second = BigEndian::read_u32(&out[table_at + 4..]);
        assert_eq!(first, first_sample + moov.len() as u32);
        assert_eq!(second, first_sample + 3 + moov.len() as u32);
        // the shifted offset still points at the first payload byte
        assert_eq!(out[first as usize], 1);

        fs::remove_file(&input).ok();
        fs::remove_file(&output).ok();
    }

    #[test]
    fn already_fast_start_writes_nothing() {
        let input = temp_path("already_in");
        let output = temp_path("already_out");
        let data = [ftyp(), moov_with(stco(&[0])), atom(b"mdat", &[9; 4])].concat();
        fs::write(&input, data).unwrap();

        assert_eq!(
            make_fast_start(&input, &output).unwrap(),
            FastStart::AlreadyFastStart
        );
        assert!(!output.exists());
        fs::remove_file(&input).ok();
    }

    #[test]
    fn last_atom_must_be_moov() {
        let input = temp_path("not_last_in");
        let output = temp_path("not_last_out");
        let data = [
            ftyp(),
            atom(b"mdat", &[0; 4]),
            moov_with(stco(&[0])),
            atom(b"free", &[0; 4]),
        ]
        .concat();
        fs::write(&input, data).unwrap();
        // moov follows mdat but is not the last atom
        assert!(matches!(
            make_fast_start(&input, &output),
            Err(MuxError::NotFastStartable(name)) if name == "free"
        ));
        assert!(!output.exists());
        fs::remove_file(&input).ok();
    }

    #[test]
    fn unknown_top_level_atom_is_rejected() {
        let input = temp_path("unknown_in");
        let output = temp_path("unknown_out");
        let data = [ftyp(), atom(b"abcd", &[0; 4]), moov_with(stco(&[0]))].concat();
        fs::write(&input, data).unwrap();
        assert!(matches!(
            make_fast_start(&input, &output),
            Err(MuxError::UnsupportedLayout(name)) if name == "abcd"
        ));
        fs::remove_file(&input).ok();
    }

    #[test]
    fn atoms_before_ftyp_are_rejected() {
        let input = temp_path("late_ftyp_in");
        let output = temp_path("late_ftyp_out");
        let free = atom(b"free", &[0; 4]);
        let ftyp = ftyp();
        let first_sample = (free.len() + ftyp.len() + 8) as u32;
        let data = [
            free,
            ftyp,
            atom(b"mdat", &[1, 2, 3, 4]),
            moov_with(stco(&[first_sample])),
        ]
        .concat();
        fs::write(&input, &data).unwrap();

        assert!(matches!(
            make_fast_start(&input, &output),
            Err(MuxError::UnsupportedLayout(name)) if name.starts_with("free")
        ));
        assert!(!output.exists());
        assert_eq!(fs::read(&input).unwrap(), data);
        fs::remove_file(&input).ok();
    }

    #[test]
    fn compressed_moov_is_rejected() {
        let input = temp_path("cmov_in");
        let output = temp_path("cmov_out");
        let cmov = atom(b"cmov", &[0; 8]);
        let data = [ftyp(), atom(b"mdat", &[0; 4]), atom(b"moov", &cmov)].concat();
        fs::write(&input, data).unwrap();
        assert!(matches!(
            make_fast_start(&input, &output),
            Err(MuxError::CompressedMoov)
        ));
        assert!(!output.exists());
        fs::remove_file(&input).ok();
    }

    #[test]
    fn stco_overflow_is_reported() {
        let mut moov = moov_with(stco(&[u32::MAX - 4]));
        let shift = moov.len() as u64;
        assert!(matches!(
            patch_chunk_offsets(&mut moov, shift),
            Err(MuxError::OffsetOverflow { .. })
        ));
    }

    #[test]
    fn co64_entries_are_shifted() {
        let mut body = vec![0, 0, 0, 0, 0, 0, 0, 1];
        body.write_u64::<BigEndian>(5_000_000_000).unwrap();
        let mut moov = moov_with(atom(b"co64", &body));
        assert_eq!(patch_chunk_offsets(&mut moov, 100).unwrap(), 1);
        let at = moov.windows(4).position(|w| w == b"co64").unwrap() + 12;
        assert_eq!(BigEndian::read_u64(&moov[at..]), 5_000_000_100);
    }

    #[test]
    fn truncated_table_is_malformed() {
        let mut body = vec![0, 0, 0, 0];
        body.write_u32::<BigEndian>(10).unwrap();
        body.write_u32::<BigEndian>(42).unwrap();
        let mut moov = moov_with(atom(b"stco", &body));
        assert!(matches!(
            patch_chunk_offsets(&mut moov, 8),
            Err(MuxError::Malformed(_))
        ));
    }

    #[test]
    fn in_place_rewrite_replaces_file() {
        let path = temp_path("in_place");
        let ftyp = ftyp();
        let mdat = atom(b"mdat", &[7; 10]);
        let moov = moov_with(stco(&[(ftyp.len() + 8) as u32]));
        fs::write(&path, [ftyp, mdat, moov].concat()).unwrap();

        assert_eq!(faststart_in_place(&path).unwrap(), FastStart::Relocated);
        let out = fs::read(&path).unwrap();
        assert_eq!(&out[out.len() - 18..out.len() - 10], &[0, 0, 0, 18, b'm', b'd', b'a', b't']);
        assert!(!sibling_temp_path(&path).exists());

        assert_eq!(
            faststart_in_place(&path).unwrap(),
            FastStart::AlreadyFastStart
        );
        fs::remove_file(&path).ok();
    }
}
