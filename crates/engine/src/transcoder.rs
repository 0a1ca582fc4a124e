//! Video transcode pump.
//!
//! Drives one decoder and one encoder in lock step without blocking on
//! either: each outer iteration feeds at most one compressed sample to the
//! decoder, then drains encoder output until it has nothing ready, polling
//! the decoder only after the encoder reports `TryAgainLater`. Decoded frames
//! reach the encoder through the session's frame transfer.
//!
//! ```text
//! demuxer ──sample──▶ decoder ──frame──▶ transfer ──▶ encoder ──sample──▶ muxer
//! ```
//!
//! End of stream ripples through the same path: source exhaustion queues an
//! EOS input buffer, the decoder's EOS output signals end of input to the
//! encoder, and the encoder's EOS output ends the pump.

use std::time::Duration;

use sq_common::codec::MIME_VIDEO_AVC;
use sq_common::{
    BufferFlags, CodecError, CodecFactory, CompressionConfig, Micros, OutputStatus, TrackFormat,
};
use sq_demux::{SeekMode, SourceDemuxer};
use sq_mux::MediaMuxer;
use tracing::{debug, info, trace};

use crate::compressor::EngineOptions;
use crate::error::{CompressError, CompressResult};
use crate::job::CancellationToken;
use crate::policy::CompressionPlan;
use crate::session::CodecSession;

/// Turns presentation times into non-decreasing percentages of the source
/// duration.
#[derive(Debug)]
pub struct ProgressTracker {
    duration: Micros,
    last: Option<f32>,
}

impl ProgressTracker {
    pub fn new(duration: Micros) -> Self {
        Self {
            duration,
            last: None,
        }
    }

    /// Percent for a frame at `pts`, or `None` when it would not move the
    /// reported progress forward.
    pub fn update(&mut self, pts: Micros) -> Option<f32> {
        let percent = if self.duration.0 == 0 {
            100.0
        } else {
            (pts.0 as f64 / self.duration.0 as f64 * 100.0).clamp(0.0, 100.0) as f32
        };
        match self.last {
            Some(last) if percent <= last => None,
            _ => {
                self.last = Some(percent);
                Some(percent)
            }
        }
    }

    /// Report completion unless 100 was already reported.
    pub fn finish(&mut self) -> Option<f32> {
        self.update(self.duration)
    }

    pub fn last(&self) -> Option<f32> {
        self.last
    }
}

/// Encoder configuration for the planned output. Frame rate, key frame
/// interval and color description come from the source when it declares
/// them.
pub fn encoder_format(
    input: &TrackFormat,
    plan: &CompressionPlan,
    config: &CompressionConfig,
    options: &EngineOptions,
) -> TrackFormat {
    let fallback = |configured: u32, default: u32| if configured > 0 { configured } else { default };

    let mut format = TrackFormat::video(MIME_VIDEO_AVC, plan.resolution.width, plan.resolution.height);
    format.bitrate = Some(plan.bitrate);
    format.frame_rate = Some(
        input
            .frame_rate
            .filter(|&fps| fps > 0)
            .unwrap_or_else(|| fallback(config.frame_rate, options.default_frame_rate)),
    );
    format.i_frame_interval = Some(input.i_frame_interval.unwrap_or_else(|| {
        fallback(config.i_frame_interval, options.default_i_frame_interval)
    }));
    format.color_standard = input.color_standard;
    format.color_transfer = input.color_transfer;
    format.color_range = input.color_range;
    format.duration_us = input.duration_us;
    format
}

/// What one poll of the encoder output produced.
enum EncoderStep {
    TryAgain,
    Continue,
    EndOfStream,
}

/// What one poll of the decoder output produced.
enum DecoderStep {
    TryAgain,
    Continue,
    EndOfStream,
}

/// Re-encodes the video track of a source into a muxer.
pub struct VideoTranscoder<'a> {
    factory: &'a dyn CodecFactory,
    options: &'a EngineOptions,
    cancel: &'a CancellationToken,
}

impl<'a> VideoTranscoder<'a> {
    pub fn new(
        factory: &'a dyn CodecFactory,
        options: &'a EngineOptions,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            factory,
            options,
            cancel,
        }
    }

    /// Transcode track `video_index` of `demuxer` into a new video track of
    /// `muxer`, reporting progress through `on_progress`. Returns the muxer
    /// track id.
    ///
    /// The codec session is torn down before this returns, on every path.
    pub fn run<D: SourceDemuxer + ?Sized>(
        &self,
        demuxer: &mut D,
        muxer: &mut MediaMuxer,
        video_index: usize,
        plan: &CompressionPlan,
        config: &CompressionConfig,
        on_progress: &mut dyn FnMut(f32),
    ) -> CompressResult<u32> {
        let input = demuxer.track_format(video_index)?;
        demuxer.select_track(video_index)?;
        demuxer.seek_to(Micros::ZERO, SeekMode::PreviousSync)?;

        let output = encoder_format(&input, plan, config, self.options);
        debug!(?output, "Encoder format");
        let session = CodecSession::open(self.factory, &input, &output, plan.resolution)?;

        let mut pump = Pump {
            demuxer: &mut *demuxer,
            muxer,
            session,
            video_index,
            video_track: None,
            timeout: self.options.codec_timeout,
            cancel: self.cancel,
            progress: ProgressTracker::new(plan.duration),
            on_progress,
        };
        let track = pump.run();
        let stats = pump.session.stats().clone();
        drop(pump);

        demuxer.unselect_track(video_index)?;
        let track = track?;
        info!(
            track,
            frames = stats.frames_rendered,
            samples = stats.encoded_samples,
            bytes = stats.encoded_bytes,
            "Video transcoded"
        );
        Ok(track)
    }
}

struct Pump<'p, D: SourceDemuxer + ?Sized> {
    demuxer: &'p mut D,
    muxer: &'p mut MediaMuxer,
    session: CodecSession,
    video_index: usize,
    /// Muxer track, added once the encoder settles its output format.
    video_track: Option<u32>,
    timeout: Duration,
    cancel: &'p CancellationToken,
    progress: ProgressTracker,
    on_progress: &'p mut dyn FnMut(f32),
}

impl<D: SourceDemuxer + ?Sized> Pump<'_, D> {
    fn run(&mut self) -> CompressResult<u32> {
        let mut input_done = false;
        let mut output_done = false;

        while !output_done {
            if !input_done {
                input_done = self.feed_decoder()?;
            }

            let mut decoder_output_available = true;
            let mut encoder_output_available = true;
            while (decoder_output_available || encoder_output_available) && !output_done {
                if self.cancel.is_cancelled() {
                    info!("Transcode cancelled");
                    return Err(CompressError::Cancelled);
                }

                match self.drain_encoder()? {
                    EncoderStep::TryAgain => encoder_output_available = false,
                    EncoderStep::Continue => continue,
                    EncoderStep::EndOfStream => {
                        output_done = true;
                        continue;
                    }
                }

                match self.drain_decoder()? {
                    DecoderStep::TryAgain | DecoderStep::EndOfStream => {
                        decoder_output_available = false
                    }
                    DecoderStep::Continue => {}
                }
            }
        }

        let track = self
            .video_track
            .ok_or_else(|| CodecError::Failed("encoder never reported an output format".into()))?;
        if let Some(percent) = self.progress.finish() {
            (self.on_progress)(percent);
        }
        Ok(track)
    }

    /// Queue the next source sample, or EOS once the track is exhausted.
    /// Returns true after EOS was queued.
    fn feed_decoder(&mut self) -> CompressResult<bool> {
        match self.demuxer.sample_track_index() {
            Some(index) if index == self.video_index => {}
            Some(other) => {
                trace!(track = other, "skipping sample of unselected track");
                self.demuxer.advance();
                return Ok(false);
            }
            None => return self.queue_end_of_stream(),
        }

        let Some(index) = self.session.decoder().dequeue_input_buffer(self.timeout)? else {
            return Ok(false);
        };
        let read = {
            let buffer = self.session.decoder().input_buffer(index)?;
            self.demuxer.read_sample_data(buffer)?
        };
        let Some(size) = read else {
            let decoder = self.session.decoder();
            decoder.queue_input_buffer(index, 0, 0, BufferFlags::END_OF_STREAM)?;
            debug!("Decoder input done");
            return Ok(true);
        };

        let pts = self.demuxer.sample_time().unwrap_or(Micros::ZERO);
        let flags = self.demuxer.sample_flags();
        self.session
            .decoder()
            .queue_input_buffer(index, size, pts.0, flags)?;
        self.session.stats_mut().samples_queued += 1;
        trace!(index, size, pts = pts.0, "queued decoder input");
        self.demuxer.advance();
        Ok(false)
    }

    fn queue_end_of_stream(&mut self) -> CompressResult<bool> {
        let decoder = self.session.decoder();
        match decoder.dequeue_input_buffer(self.timeout)? {
            Some(index) => {
                decoder.queue_input_buffer(index, 0, 0, BufferFlags::END_OF_STREAM)?;
                debug!("Decoder input done");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn drain_encoder(&mut self) -> CompressResult<EncoderStep> {
        let status = self.session.encoder().dequeue_output_buffer(self.timeout)?;
        match status {
            OutputStatus::TryAgainLater => Ok(EncoderStep::TryAgain),
            OutputStatus::FormatChanged => {
                let format = self.session.encoder().output_format()?;
                debug!(?format, "Encoder output format changed");
                if self.video_track.is_none() {
                    self.video_track = Some(self.muxer.add_track(&format, false)?);
                }
                Ok(EncoderStep::Continue)
            }
            OutputStatus::BuffersChanged => Ok(EncoderStep::Continue),
            OutputStatus::Unknown(status) => Err(CodecError::UnexpectedStatus {
                stage: "encoder",
                status,
            }
            .into()),
            OutputStatus::Buffer { index, info } => {
                if info.size > 1 && !info.flags.is_codec_config() {
                    let track = self.video_track.ok_or_else(|| {
                        CodecError::Failed("encoder produced data before its output format".into())
                    })?;
                    let data = self.session.encoder().output_buffer(index)?;
                    self.muxer.write_sample_data(track, data, &info)?;
                    let stats = self.session.stats_mut();
                    stats.encoded_samples += 1;
                    stats.encoded_bytes += info.size as u64;
                }
                self.session.encoder().release_output_buffer(index)?;

                if info.flags.is_end_of_stream() {
                    debug!("Encoder output done");
                    Ok(EncoderStep::EndOfStream)
                } else {
                    Ok(EncoderStep::Continue)
                }
            }
        }
    }

    fn drain_decoder(&mut self) -> CompressResult<DecoderStep> {
        let status = self.session.decoder().dequeue_output_buffer(self.timeout)?;
        match status {
            OutputStatus::TryAgainLater => Ok(DecoderStep::TryAgain),
            OutputStatus::FormatChanged | OutputStatus::BuffersChanged => Ok(DecoderStep::Continue),
            OutputStatus::Unknown(status) => Err(CodecError::UnexpectedStatus {
                stage: "decoder",
                status,
            }
            .into()),
            OutputStatus::Buffer { index, info } => {
                let render = info.size != 0;
                self.session.decoder().release_output_buffer(index, render)?;

                if render {
                    let transfer = self.session.transfer();
                    transfer.await_new_frame()?;
                    transfer.draw_frame()?;
                    transfer.set_presentation_time(info.presentation_time_us * 1000)?;
                    transfer.swap_buffers()?;
                    self.session.stats_mut().frames_rendered += 1;

                    if let Some(percent) = self.progress.update(Micros(info.presentation_time_us)) {
                        (self.on_progress)(percent);
                    }
                }

                if info.flags.is_end_of_stream() {
                    debug!("Decoder output done");
                    self.session.encoder().signal_end_of_input_stream()?;
                    return Ok(DecoderStep::EndOfStream);
                }
                Ok(DecoderStep::Continue)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sq_common::{Resolution, Rotation};

    fn plan() -> CompressionPlan {
        CompressionPlan {
            resolution: Resolution::new(960, 544),
            bitrate: 3_000_000,
            rotation: Rotation::None,
            duration: Micros(2_000_000),
        }
    }

    #[test]
    fn progress_is_clamped_and_monotonic() {
        let mut progress = ProgressTracker::new(Micros(2_000_000));
        assert_eq!(progress.update(Micros(0)), Some(0.0));
        assert_eq!(progress.update(Micros(1_000_000)), Some(50.0));
        // reordered frame
        assert_eq!(progress.update(Micros(900_000)), None);
        assert_eq!(progress.update(Micros(1_000_000)), None);
        assert_eq!(progress.update(Micros(5_000_000)), Some(100.0));
        assert_eq!(progress.update(Micros(6_000_000)), None);
        assert_eq!(progress.last(), Some(100.0));
    }

    #[test]
    fn finish_reports_completion_once() {
        let mut progress = ProgressTracker::new(Micros(1_000_000));
        assert_eq!(progress.update(Micros(500_000)), Some(50.0));
        assert_eq!(progress.finish(), Some(100.0));
        assert_eq!(progress.finish(), None);
    }

    #[test]
    fn zero_duration_reports_done() {
        let mut progress = ProgressTracker::new(Micros::ZERO);
        assert_eq!(progress.update(Micros(10)), Some(100.0));
    }

    #[test]
    fn encoder_format_prefers_source_values() {
        let mut input = TrackFormat::video(MIME_VIDEO_AVC, 1920, 1080);
        input.frame_rate = Some(24);
        input.i_frame_interval = Some(2);
        input.color_standard = Some(1);

        let format = encoder_format(
            &input,
            &plan(),
            &CompressionConfig::default(),
            &EngineOptions::default(),
        );
        assert_eq!(format.mime, MIME_VIDEO_AVC);
        assert_eq!((format.width, format.height), (Some(960), Some(544)));
        assert_eq!(format.bitrate, Some(3_000_000));
        assert_eq!(format.frame_rate, Some(24));
        assert_eq!(format.i_frame_interval, Some(2));
        assert_eq!(format.color_standard, Some(1));
    }

    #[test]
    fn encoder_format_falls_back_to_defaults() {
        let input = TrackFormat::video(MIME_VIDEO_AVC, 1920, 1080);
        let config = CompressionConfig {
            frame_rate: 0,
            i_frame_interval: 3,
            ..Default::default()
        };
        let format = encoder_format(&input, &plan(), &config, &EngineOptions::default());
        assert_eq!(format.frame_rate, Some(30));
        assert_eq!(format.i_frame_interval, Some(3));
    }
}
