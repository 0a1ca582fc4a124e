//! Length-prefixed (AVCC) to Annex-B conversion for decoder input.

/// Annex-B start code (4 bytes).
pub const ANNEXB_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Convert AVCC-formatted NAL units to Annex-B format.
///
/// AVCC: `[length_size bytes length][NAL data]...`
/// Annex-B: `[0x00 0x00 0x00 0x01][NAL data]...`
///
/// A trailing NAL whose length runs past the data is dropped.
pub fn avcc_to_annexb(avcc_data: &[u8], length_size: u8) -> Vec<u8> {
    let mut output = Vec::with_capacity(avcc_data.len() + 64);
    let ls = length_size as usize;
    let mut offset = 0;

    while offset + ls <= avcc_data.len() {
        let nal_len = read_nal_length(&avcc_data[offset..], ls);
        offset += ls;

        if offset + nal_len > avcc_data.len() {
            break;
        }

        output.extend_from_slice(&ANNEXB_START_CODE);
        output.extend_from_slice(&avcc_data[offset..offset + nal_len]);
        offset += nal_len;
    }

    output
}

/// Rewrite 4-byte length prefixes as start codes without moving data.
///
/// Returns false if a length field points past the end of `data`; the
/// NAL units before it are already rewritten.
pub fn avcc4_to_annexb_in_place(data: &mut [u8]) -> bool {
    let mut offset = 0;
    while offset + 4 <= data.len() {
        let nal_len = read_nal_length(&data[offset..], 4);
        if offset + 4 + nal_len > data.len() {
            return false;
        }
        data[offset..offset + 4].copy_from_slice(&ANNEXB_START_CODE);
        offset += 4 + nal_len;
    }
    offset == data.len()
}

/// Prefix a parameter set with a start code, the form codecs expect for
/// codec-specific data.
pub fn with_start_code(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len() + 4);
    out.extend_from_slice(&ANNEXB_START_CODE);
    out.extend_from_slice(nal);
    out
}

/// Read a big-endian NAL unit size of 1 to 4 bytes.
fn read_nal_length(data: &[u8], length_size: usize) -> usize {
    data[..length_size]
        .iter()
        .fold(0usize, |val, &byte| (val << 8) | byte as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avcc_to_annexb_basic() {
        let avcc = [0x00, 0x00, 0x00, 0x05, 0x67, 0x01, 0x02, 0x03, 0x04];
        let annexb = avcc_to_annexb(&avcc, 4);
        assert_eq!(&annexb[..4], &ANNEXB_START_CODE);
        assert_eq!(&annexb[4..], &[0x67, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn avcc_to_annexb_two_byte_lengths() {
        let avcc = [0x00, 0x02, 0x65, 0xAA, 0x00, 0x01, 0x41];
        let annexb = avcc_to_annexb(&avcc, 2);
        assert_eq!(
            annexb,
            vec![0, 0, 0, 1, 0x65, 0xAA, 0, 0, 0, 1, 0x41]
        );
    }

    #[test]
    fn in_place_rewrites_every_prefix() {
        let mut data = vec![0, 0, 0, 2, 0x65, 0xAA, 0, 0, 0, 1, 0x41];
        assert!(avcc4_to_annexb_in_place(&mut data));
        assert_eq!(data, vec![0, 0, 0, 1, 0x65, 0xAA, 0, 0, 0, 1, 0x41]);
    }

    #[test]
    fn in_place_detects_overrun() {
        let mut data = vec![0, 0, 0, 9, 0x65];
        assert!(!avcc4_to_annexb_in_place(&mut data));
    }

    #[test]
    fn start_code_prefix() {
        assert_eq!(with_start_code(&[0x67, 0x42]), vec![0, 0, 0, 1, 0x67, 0x42]);
    }
}
