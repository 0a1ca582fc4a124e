//! H.264 NAL helpers for the muxer: Annex-B to length-prefixed samples and
//! parameter-set inspection.

/// NAL unit type for H.264.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum H264NalType {
    Slice,
    Idr,
    Sei,
    Sps,
    Pps,
    Aud,
    Other(u8),
}

impl From<u8> for H264NalType {
    fn from(val: u8) -> Self {
        match val & 0x1F {
            1 => Self::Slice,
            5 => Self::Idr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            other => Self::Other(other),
        }
    }
}

/// Length of the start code at the beginning of `data`, if any.
fn start_code_len(data: &[u8]) -> Option<usize> {
    match data {
        [0, 0, 0, 1, ..] => Some(4),
        [0, 0, 1, ..] => Some(3),
        _ => None,
    }
}

/// Strip a leading 3- or 4-byte start code.
pub fn strip_start_code(data: &[u8]) -> &[u8] {
    start_code_len(data).map_or(data, |n| &data[n..])
}

/// Split an Annex-B stream into NAL unit payloads.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push((i, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (n, &(_, payload_start)) in starts.iter().enumerate() {
        let mut end = starts.get(n + 1).map_or(data.len(), |&(code_start, _)| code_start);
        // A zero before the next 3-byte code belongs to a 4-byte start code.
        while end > payload_start && n + 1 < starts.len() && data[end - 1] == 0 {
            end -= 1;
        }
        if end > payload_start {
            nals.push(&data[payload_start..end]);
        }
    }
    nals
}

/// Rewrite an Annex-B sample as 4-byte length-prefixed NAL units.
///
/// Data without any start code is treated as one NAL unit.
pub fn annexb_to_avcc(data: &[u8], out: &mut Vec<u8>) {
    out.clear();
    if start_code_len(data).is_none() {
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(data);
        return;
    }
    for nal in split_annexb(data) {
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
}

/// Profile and level bytes of an SPS NAL unit (with its header byte).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpsProfile {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
}

impl SpsProfile {
    /// High profile, level 3.1, used when the SPS is too short to read.
    pub const DEFAULT: Self = Self {
        profile_idc: 100,
        constraint_flags: 0,
        level_idc: 31,
    };

    pub fn parse(sps: &[u8]) -> Option<Self> {
        match sps {
            [header, profile_idc, constraint_flags, level_idc, ..]
                if H264NalType::from(*header) == H264NalType::Sps =>
            {
                Some(Self {
                    profile_idc: *profile_idc,
                    constraint_flags: *constraint_flags,
                    level_idc: *level_idc,
                })
            }
            _ => None,
        }
    }
}
