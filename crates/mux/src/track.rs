//! Per-track sample accounting for the muxer.

use std::time::SystemTime;

use sq_common::{AudioCodec, BufferInfo, TrackFormat};
use tracing::debug;

use crate::atoms::VIDEO_TIMESCALE;
use crate::error::{MuxError, MuxResult};
use crate::nal::{strip_start_code, SpsProfile};

/// Duration given to the last video sample, in 90 kHz ticks.
pub const DEFAULT_VIDEO_SAMPLE_DURATION: u32 = 3015;

/// Duration given to the last audio sample: one AAC frame.
pub const DEFAULT_AUDIO_SAMPLE_DURATION: u32 = 1024;

/// AAC sampling frequency table (ISO 14496-3).
const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// One sample in the mdat payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    /// Offset relative to the start of the mdat payload.
    pub offset: u64,
    pub size: u32,
}

/// Codec description written into stsd.
#[derive(Clone, Debug, PartialEq)]
pub enum SampleDescription {
    Avc {
        width: u32,
        height: u32,
        sps: Vec<u8>,
        pps: Vec<u8>,
        profile: SpsProfile,
    },
    Mp4a {
        object_type_indication: u8,
        sample_rate: u32,
        channel_count: u16,
        max_bitrate: u32,
        /// AudioSpecificConfig.
        decoder_config: Vec<u8>,
    },
}

impl SampleDescription {
    fn video(format: &TrackFormat) -> MuxResult<Self> {
        let (width, height) = format
            .width
            .zip(format.height)
            .ok_or_else(|| MuxError::InvalidTrack("video format has no dimensions".into()))?;
        let sps = format
            .csd0
            .as_deref()
            .map(strip_start_code)
            .ok_or_else(|| MuxError::InvalidTrack("video format has no SPS (csd0)".into()))?
            .to_vec();
        let pps = format
            .csd1
            .as_deref()
            .map(strip_start_code)
            .ok_or_else(|| MuxError::InvalidTrack("video format has no PPS (csd1)".into()))?
            .to_vec();
        let profile = SpsProfile::parse(&sps).unwrap_or(SpsProfile::DEFAULT);
        Ok(Self::Avc {
            width,
            height,
            sps,
            pps,
            profile,
        })
    }

    fn audio(format: &TrackFormat) -> MuxResult<Self> {
        let sample_rate = format
            .sample_rate
            .ok_or_else(|| MuxError::InvalidTrack("audio format has no sample rate".into()))?;
        let channel_count = format
            .channel_count
            .ok_or_else(|| MuxError::InvalidTrack("audio format has no channel count".into()))?;
        let codec = AudioCodec::from_mime(&format.mime).unwrap_or(AudioCodec::Aac);
        let decoder_config = match &format.csd0 {
            Some(csd) if !csd.is_empty() => csd.clone(),
            _ if codec == AudioCodec::Aac => aac_lc_config(sample_rate, channel_count)?,
            _ => Vec::new(),
        };
        Ok(Self::Mp4a {
            object_type_indication: codec.object_type_indication(),
            sample_rate,
            channel_count: channel_count as u16,
            max_bitrate: format
                .bitrate
                .and_then(|b| u32::try_from(b).ok())
                .unwrap_or(96_000),
            decoder_config,
        })
    }
}

/// Two-byte AudioSpecificConfig for AAC-LC.
fn aac_lc_config(sample_rate: u32, channel_count: u32) -> MuxResult<Vec<u8>> {
    let index = AAC_SAMPLE_RATES
        .iter()
        .position(|&r| r == sample_rate)
        .ok_or_else(|| {
            MuxError::InvalidTrack(format!("no AAC frequency index for {sample_rate} Hz"))
        })? as u8;
    let object_type = 2u8;
    let channels = (channel_count & 0x0F) as u8;
    Ok(vec![
        (object_type << 3) | (index >> 1),
        ((index & 1) << 7) | (channels << 3),
    ])
}

/// One track of an [`crate::Mp4Movie`].
#[derive(Clone, Debug)]
pub struct Track {
    track_id: u32,
    is_audio: bool,
    timescale: u32,
    description: SampleDescription,
    samples: Vec<Sample>,
    /// Deltas between consecutive samples; the last sample's duration is
    /// appended in [`Track::sample_durations`].
    deltas: Vec<u32>,
    /// 1-based.
    sync_samples: Vec<u32>,
    last_pts_us: Option<u64>,
    creation_time: SystemTime,
}

impl Track {
    pub fn new(track_id: u32, format: &TrackFormat, is_audio: bool) -> MuxResult<Self> {
        let (timescale, description) = if is_audio {
            let description = SampleDescription::audio(format)?;
            let timescale = format.sample_rate.unwrap_or(44_100);
            (timescale, description)
        } else {
            (VIDEO_TIMESCALE, SampleDescription::video(format)?)
        };
        debug!(track_id, is_audio, timescale, mime = %format.mime, "track created");
        Ok(Self {
            track_id,
            is_audio,
            timescale,
            description,
            samples: Vec::new(),
            deltas: Vec::new(),
            sync_samples: Vec::new(),
            last_pts_us: None,
            creation_time: SystemTime::now(),
        })
    }

    /// Record a sample written at `offset` in the payload.
    ///
    /// The first sample adds no delta. Each later sample closes the
    /// duration of its predecessor with `round(Δpts × timescale / 1e6)`.
    pub fn add_sample(&mut self, offset: u64, info: &BufferInfo) {
        self.samples.push(Sample {
            offset,
            size: info.size as u32,
        });
        if !self.is_audio && info.flags.is_key_frame() {
            self.sync_samples.push(self.samples.len() as u32);
        }

        let pts = info.presentation_time_us;
        if let Some(last) = self.last_pts_us {
            let delta_us = pts.saturating_sub(last) as u128;
            let delta = (delta_us * self.timescale as u128 + 500_000) / 1_000_000;
            self.deltas.push(delta as u32);
        }
        self.last_pts_us = Some(pts);
    }

    pub fn track_id(&self) -> u32 {
        self.track_id
    }

    pub fn is_audio(&self) -> bool {
        self.is_audio
    }

    pub fn timescale(&self) -> u32 {
        self.timescale
    }

    pub fn description(&self) -> &SampleDescription {
        &self.description
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn sync_samples(&self) -> &[u32] {
        &self.sync_samples
    }

    pub fn creation_time(&self) -> SystemTime {
        self.creation_time
    }

    pub fn default_sample_duration(&self) -> u32 {
        if self.is_audio {
            DEFAULT_AUDIO_SAMPLE_DURATION
        } else {
            DEFAULT_VIDEO_SAMPLE_DURATION
        }
    }

    /// One duration per sample.
    pub fn sample_durations(&self) -> Vec<u32> {
        if self.samples.is_empty() {
            return Vec::new();
        }
        let mut durations = self.deltas.clone();
        durations.push(self.default_sample_duration());
        durations
    }

    /// Sum of all sample durations, in track timescale units.
    pub fn duration(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        self.deltas.iter().map(|&d| d as u64).sum::<u64>() + self.default_sample_duration() as u64
    }

    pub fn width(&self) -> u32 {
        match self.description {
            SampleDescription::Avc { width, .. } => width,
            SampleDescription::Mp4a { .. } => 0,
        }
    }

    pub fn height(&self) -> u32 {
        match self.description {
            SampleDescription::Avc { height, .. } => height,
            SampleDescription::Mp4a { .. } => 0,
        }
    }

    pub fn volume(&self) -> f64 {
        if self.is_audio {
            1.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sq_common::codec::{MIME_AUDIO_AAC, MIME_AUDIO_MPEG, MIME_VIDEO_AVC};
    use sq_common::BufferFlags;

    fn video_format() -> TrackFormat {
        let mut f = TrackFormat::video(MIME_VIDEO_AVC, 960, 540);
        f.csd0 = Some(vec![0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1F]);
        f.csd1 = Some(vec![0, 0, 0, 1, 0x68, 0xEE, 0x3C]);
        f
    }

    fn info(pts: u64, flags: BufferFlags) -> BufferInfo {
        BufferInfo::new(0, 100, pts, flags)
    }

    #[test]
    fn video_description_strips_start_codes() {
        let track = Track::new(1, &video_format(), false).unwrap();
        match track.description() {
            SampleDescription::Avc {
                sps, pps, profile, ..
            } => {
                assert_eq!(sps, &vec![0x67, 0x64, 0x00, 0x1F]);
                assert_eq!(pps, &vec![0x68, 0xEE, 0x3C]);
                assert_eq!(profile.profile_idc, 100);
                assert_eq!(profile.level_idc, 31);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(track.timescale(), 90_000);
        assert_eq!((track.width(), track.height()), (960, 540));
    }

    #[test]
    fn video_without_csd_rejected() {
        let f = TrackFormat::video(MIME_VIDEO_AVC, 960, 540);
        assert!(matches!(
            Track::new(1, &f, false),
            Err(MuxError::InvalidTrack(_))
        ));
    }

    #[test]
    fn first_sample_adds_no_delta() {
        let mut track = Track::new(1, &video_format(), false).unwrap();
        track.add_sample(0, &info(0, BufferFlags::KEY_FRAME));
        assert_eq!(track.sample_durations(), vec![DEFAULT_VIDEO_SAMPLE_DURATION]);
        assert_eq!(track.duration(), DEFAULT_VIDEO_SAMPLE_DURATION as u64);
    }

    #[test]
    fn deltas_are_rounded_to_timescale() {
        let mut track = Track::new(1, &video_format(), false).unwrap();
        for (i, pts) in [0u64, 33_333, 66_667, 100_000].into_iter().enumerate() {
            let flags = if i == 0 {
                BufferFlags::KEY_FRAME
            } else {
                BufferFlags::NONE
            };
            track.add_sample(i as u64 * 100, &info(pts, flags));
        }
        assert_eq!(track.sample_durations(), vec![3000, 3000, 3000, 3015]);
        let sum: u64 = track.sample_durations().iter().map(|&d| d as u64).sum();
        assert_eq!(sum, track.duration());
        assert_eq!(track.sync_samples(), &[1]);
    }

    #[test]
    fn audio_never_records_sync_samples() {
        let f = TrackFormat::audio(MIME_AUDIO_AAC, 44_100, 2);
        let mut track = Track::new(2, &f, true).unwrap();
        track.add_sample(0, &info(0, BufferFlags::KEY_FRAME));
        track.add_sample(10, &info(23_220, BufferFlags::KEY_FRAME));
        assert!(track.sync_samples().is_empty());
        assert_eq!(track.timescale(), 44_100);
        assert_eq!(track.sample_durations(), vec![1024, 1024]);
        assert_eq!(track.volume(), 1.0);
    }

    #[test]
    fn synthesized_aac_config() {
        assert_eq!(aac_lc_config(44_100, 2).unwrap(), vec![0x12, 0x10]);
        assert_eq!(aac_lc_config(48_000, 1).unwrap(), vec![0x11, 0x88]);
        assert!(aac_lc_config(12_345, 2).is_err());
    }

    #[test]
    fn mpeg_audio_uses_its_object_type() {
        let f = TrackFormat::audio(MIME_AUDIO_MPEG, 44_100, 2);
        let track = Track::new(2, &f, true).unwrap();
        match track.description() {
            SampleDescription::Mp4a {
                object_type_indication,
                decoder_config,
                max_bitrate,
                ..
            } => {
                assert_eq!(*object_type_indication, 0x69);
                assert!(decoder_config.is_empty());
                assert_eq!(*max_bitrate, 96_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
