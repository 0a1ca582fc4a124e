//! Sample table interpretation: maps sample indices to file byte offsets,
//! sizes, timestamps, and sync status.

use crate::mp4::boxes::{CttsEntry, ParsedTrack, StscEntry, SttsEntry};
use sq_common::{DemuxError, Micros};
use tracing::debug;

/// Flat entry for a single sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleEntry {
    /// Byte offset of the sample data in the file.
    pub offset: u64,
    pub size: u32,
    /// Decoding timestamp in media timescale units.
    pub dts: u64,
    /// Composition timestamp in media timescale units.
    pub cts: i64,
    pub is_sync: bool,
}

/// Pre-computed sample table for one track, in decode order.
#[derive(Clone, Debug)]
pub struct SampleTable {
    pub samples: Vec<SampleEntry>,
    pub timescale: u32,
    /// Media duration in timescale units (from mdhd).
    pub duration: u64,
}

impl SampleTable {
    pub fn build(track: &ParsedTrack) -> Result<Self, DemuxError> {
        let sample_count = track.stsz.sample_count as usize;
        if sample_count == 0 {
            return Ok(SampleTable {
                samples: Vec::new(),
                timescale: track.timescale,
                duration: track.duration,
            });
        }

        let offsets_and_sizes = build_sample_offsets(
            &track.stsc,
            &track.chunk_offsets,
            &track.stsz.sample_sizes,
            track.stsz.default_sample_size,
            sample_count,
        )?;
        let dts_array = build_dts_array(&track.stts, sample_count);
        let cts_offsets = build_cts_offsets(&track.ctts, sample_count);

        let samples: Vec<SampleEntry> = offsets_and_sizes
            .into_iter()
            .zip(dts_array)
            .zip(cts_offsets)
            .enumerate()
            .map(|(i, (((offset, size), dts), cts_offset))| SampleEntry {
                offset,
                size,
                dts,
                cts: dts as i64 + cts_offset as i64,
                // stss numbers are 1-based and sorted; absent stss means all sync
                is_sync: track.sync_samples.is_empty()
                    || track.sync_samples.binary_search(&(i as u32 + 1)).is_ok(),
            })
            .collect();

        debug!(
            track_id = track.track_id,
            samples = samples.len(),
            timescale = track.timescale,
            duration = track.duration,
            "sample table built"
        );

        Ok(SampleTable {
            samples,
            timescale: track.timescale,
            duration: track.duration,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Convert media ticks to microseconds. Negative ticks clamp to zero.
    pub fn ticks_to_micros(&self, ticks: i64) -> Micros {
        if self.timescale == 0 || ticks <= 0 {
            return Micros::ZERO;
        }
        Micros::from_timescale(ticks as u64, self.timescale)
    }

    /// Presentation time of sample `index`.
    pub fn presentation_time(&self, index: usize) -> Option<Micros> {
        self.samples.get(index).map(|s| self.ticks_to_micros(s.cts))
    }

    /// Media duration as microseconds.
    pub fn duration_micros(&self) -> Micros {
        if self.timescale == 0 {
            return Micros::ZERO;
        }
        Micros::from_timescale(self.duration, self.timescale)
    }

    /// Sum of all sample sizes in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.samples.iter().map(|s| s.size as u64).sum()
    }

    pub fn max_sample_size(&self) -> usize {
        self.samples.iter().map(|s| s.size as usize).max().unwrap_or(0)
    }

    /// Last sync sample whose presentation time is at or before `time`.
    pub fn find_sync_at_or_before(&self, time: Micros) -> Option<usize> {
        let target = time.to_timescale_floor(self.timescale) as i64;
        self.samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_sync && s.cts <= target)
            .map(|(i, _)| i)
            .last()
    }

    /// First sync sample whose presentation time is at or after `time`.
    pub fn find_sync_at_or_after(&self, time: Micros) -> Option<usize> {
        let target = time.to_timescale_ceil(self.timescale) as i64;
        self.samples
            .iter()
            .position(|s| s.is_sync && s.cts >= target)
    }
}

/// Compute (file_offset, size) for each sample from stsc + stco + stsz.
fn build_sample_offsets(
    stsc: &[StscEntry],
    chunk_offsets: &[u64],
    sample_sizes: &[u32],
    default_sample_size: u32,
    sample_count: usize,
) -> Result<Vec<(u64, u32)>, DemuxError> {
    let mut result = Vec::with_capacity(sample_count);

    'chunks: for (chunk_idx, &chunk_offset) in chunk_offsets.iter().enumerate() {
        let samples_in_chunk = samples_per_chunk_for(stsc, chunk_idx as u32 + 1);
        let mut offset = chunk_offset;

        for _ in 0..samples_in_chunk {
            let sample_idx = result.len();
            if sample_idx >= sample_count {
                break 'chunks;
            }
            let size = if default_sample_size > 0 {
                default_sample_size
            } else {
                *sample_sizes.get(sample_idx).ok_or_else(|| DemuxError::InvalidStructure {
                    offset: 0,
                    reason: format!(
                        "Sample index {} exceeds stsz table length {}",
                        sample_idx,
                        sample_sizes.len()
                    ),
                })?
            };
            result.push((offset, size));
            offset += size as u64;
        }
    }

    if result.len() != sample_count {
        return Err(DemuxError::InvalidStructure {
            offset: 0,
            reason: format!(
                "Built {} sample offsets but expected {} (stsc/stco/stsz mismatch)",
                result.len(),
                sample_count
            ),
        });
    }

    Ok(result)
}

/// Samples in the given 1-based chunk: the last stsc entry whose
/// `first_chunk` is at or before it applies.
fn samples_per_chunk_for(stsc: &[StscEntry], chunk_num: u32) -> u32 {
    stsc.iter()
        .take_while(|e| e.first_chunk <= chunk_num)
        .last()
        .map(|e| e.samples_per_chunk)
        .unwrap_or(1)
}

fn build_dts_array(stts: &[SttsEntry], sample_count: usize) -> Vec<u64> {
    let mut dts_array = Vec::with_capacity(sample_count);
    let mut dts: u64 = 0;

    for entry in stts {
        for _ in 0..entry.sample_count {
            if dts_array.len() >= sample_count {
                return dts_array;
            }
            dts_array.push(dts);
            dts += entry.sample_delta as u64;
        }
    }

    // Pad with the last delta if stts is short.
    let last_delta = stts.last().map(|e| e.sample_delta as u64).unwrap_or(1);
    while dts_array.len() < sample_count {
        dts_array.push(dts);
        dts += last_delta;
    }
    dts_array
}

fn build_cts_offsets(ctts: &[CttsEntry], sample_count: usize) -> Vec<i32> {
    let mut offsets: Vec<i32> = ctts
        .iter()
        .flat_map(|e| std::iter::repeat(e.sample_offset).take(e.sample_count as usize))
        .take(sample_count)
        .collect();
    offsets.resize(sample_count, 0);
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4::boxes::{StszBox, VIDE};

    fn make_track(
        stts: Vec<SttsEntry>,
        stsc: Vec<StscEntry>,
        sample_sizes: Vec<u32>,
        chunk_offsets: Vec<u64>,
        sync_samples: Vec<u32>,
    ) -> ParsedTrack {
        ParsedTrack {
            track_id: 1,
            handler_type: VIDE,
            timescale: 90_000,
            duration: 0,
            width: 1920,
            height: 1080,
            rotation: Some(0),
            sample_entry: None,
            stts,
            ctts: Vec::new(),
            stsc,
            stsz: StszBox {
                default_sample_size: 0,
                sample_count: sample_sizes.len() as u32,
                sample_sizes,
            },
            chunk_offsets,
            sync_samples,
        }
    }

    fn stsc(first_chunk: u32, samples_per_chunk: u32) -> StscEntry {
        StscEntry {
            first_chunk,
            samples_per_chunk,
            sample_description_index: 1,
        }
    }

    fn stts(sample_count: u32, sample_delta: u32) -> SttsEntry {
        SttsEntry {
            sample_count,
            sample_delta,
        }
    }

    #[test]
    fn offsets_follow_chunks() {
        let track = make_track(
            vec![stts(4, 3000)],
            vec![stsc(1, 2)],
            vec![100, 200, 300, 400],
            vec![1000, 5000],
            vec![1, 3],
        );
        let table = SampleTable::build(&track).unwrap();
        let offsets: Vec<u64> = table.samples.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![1000, 1100, 5000, 5300]);
        assert_eq!(table.total_bytes(), 1000);
        assert_eq!(table.max_sample_size(), 400);
        assert!(table.samples[0].is_sync);
        assert!(!table.samples[1].is_sync);
        assert!(table.samples[2].is_sync);
    }

    #[test]
    fn varying_samples_per_chunk() {
        let track = make_track(
            vec![stts(5, 1024)],
            vec![stsc(1, 3), stsc(2, 1)],
            vec![10; 5],
            vec![0, 100, 200],
            Vec::new(),
        );
        let table = SampleTable::build(&track).unwrap();
        let offsets: Vec<u64> = table.samples.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 10, 20, 100, 200]);
        assert!(table.samples.iter().all(|s| s.is_sync));
    }

    #[test]
    fn mismatched_tables_rejected() {
        let track = make_track(
            vec![stts(3, 3000)],
            vec![stsc(1, 1)],
            vec![10, 10, 10],
            vec![0, 10],
            Vec::new(),
        );
        assert!(SampleTable::build(&track).is_err());
    }

    #[test]
    fn dts_pads_short_stts() {
        assert_eq!(build_dts_array(&[stts(2, 10)], 4), vec![0, 10, 20, 30]);
    }

    #[test]
    fn cts_offsets_apply() {
        let ctts = [
            CttsEntry {
                sample_count: 1,
                sample_offset: 6000,
            },
            CttsEntry {
                sample_count: 1,
                sample_offset: -3000,
            },
        ];
        assert_eq!(build_cts_offsets(&ctts, 3), vec![6000, -3000, 0]);
    }

    #[test]
    fn sync_lookup_by_time() {
        let track = make_track(
            vec![stts(6, 3000)],
            vec![stsc(1, 6)],
            vec![1; 6],
            vec![0],
            vec![1, 4],
        );
        let table = SampleTable::build(&track).unwrap();
        // sample 4 (index 3) starts at 9000 ticks = 100ms
        assert_eq!(table.find_sync_at_or_before(Micros(99_000)), Some(0));
        assert_eq!(table.find_sync_at_or_before(Micros(100_000)), Some(3));
        assert_eq!(table.find_sync_at_or_after(Micros(1)), Some(3));
        // 5us is under half a tick before sample 4
        assert_eq!(table.find_sync_at_or_before(Micros(99_995)), Some(0));
        assert_eq!(table.find_sync_at_or_after(Micros(99_995)), Some(3));
        assert_eq!(table.find_sync_at_or_after(Micros::ZERO), Some(0));
        assert_eq!(table.find_sync_at_or_after(Micros(200_000)), None);
        assert_eq!(table.presentation_time(3), Some(Micros(100_000)));
    }

    #[test]
    fn empty_track() {
        let track = make_track(Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new());
        let table = SampleTable::build(&track).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.find_sync_at_or_before(Micros::ZERO), None);
    }
}
