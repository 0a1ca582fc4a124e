//! Codec session: the decoder, encoder and frame transfer of one job.
//!
//! `CodecSession` owns the three instances a [`CodecFactory`] hands out for a
//! job and tears them down when dropped, whether the pump finished, failed or
//! was cancelled. Nothing else in the engine calls `stop` or `release`.

use std::fmt;

use sq_common::codec::MIME_VIDEO_AVC;
use sq_common::{
    CodecError, CodecFactory, FrameTransfer, Resolution, TrackFormat, VideoDecoder, VideoEncoder,
};
use tracing::{debug, info, warn};

/// Counters kept while a session pumps frames.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Compressed samples handed to the decoder.
    pub samples_queued: u64,
    /// Decoded frames pushed through the frame transfer.
    pub frames_rendered: u64,
    /// Encoded samples written to the muxer.
    pub encoded_samples: u64,
    pub encoded_bytes: u64,
}

pub struct CodecSession {
    decoder: Box<dyn VideoDecoder>,
    encoder: Box<dyn VideoEncoder>,
    transfer: Box<dyn FrameTransfer>,
    decoder_started: bool,
    encoder_started: bool,
    target: Resolution,
    stats: SessionStats,
}

impl fmt::Debug for CodecSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecSession")
            .field("target", &self.target)
            .field("decoder_started", &self.decoder_started)
            .field("encoder_started", &self.encoder_started)
            .field("stats", &self.stats)
            .finish()
    }
}

impl CodecSession {
    /// Create, configure and start the codecs for one job.
    ///
    /// The encoder is configured with `output` first so the frame transfer
    /// can attach to its input; the decoder is configured with `input` and
    /// started last. Instances created before a failure are released before
    /// the error is returned.
    pub fn open(
        factory: &dyn CodecFactory,
        input: &TrackFormat,
        output: &TrackFormat,
        target: Resolution,
    ) -> Result<Self, CodecError> {
        let mut encoder = factory.create_encoder(MIME_VIDEO_AVC)?;
        if let Err(e) = encoder.configure(output) {
            encoder.release();
            return Err(e);
        }

        let mut transfer = match factory.create_frame_transfer(encoder.as_mut(), target) {
            Ok(transfer) => transfer,
            Err(e) => {
                encoder.release();
                return Err(e);
            }
        };

        let decoder = match factory.create_decoder(&input.mime) {
            Ok(decoder) => decoder,
            Err(e) => {
                transfer.release();
                encoder.release();
                return Err(e);
            }
        };

        let mut session = Self {
            decoder,
            encoder,
            transfer,
            decoder_started: false,
            encoder_started: false,
            target,
            stats: SessionStats::default(),
        };

        session.encoder.start()?;
        session.encoder_started = true;
        session.decoder.configure(input)?;
        session.decoder.start()?;
        session.decoder_started = true;

        info!(
            decoder = %input.mime,
            target = %target,
            bitrate = output.bitrate.unwrap_or_default(),
            "Codec session started"
        );
        Ok(session)
    }

    pub fn decoder(&mut self) -> &mut dyn VideoDecoder {
        self.decoder.as_mut()
    }

    pub fn encoder(&mut self) -> &mut dyn VideoEncoder {
        self.encoder.as_mut()
    }

    pub fn transfer(&mut self) -> &mut dyn FrameTransfer {
        self.transfer.as_mut()
    }

    pub fn target(&self) -> Resolution {
        self.target
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut SessionStats {
        &mut self.stats
    }
}

impl Drop for CodecSession {
    fn drop(&mut self) {
        if self.decoder_started {
            if let Err(e) = self.decoder.stop() {
                warn!("Failed to stop decoder: {e}");
            }
        }
        self.decoder.release();

        if self.encoder_started {
            if let Err(e) = self.encoder.stop() {
                warn!("Failed to stop encoder: {e}");
            }
        }
        self.encoder.release();
        self.transfer.release();

        debug!(
            samples = self.stats.samples_queued,
            frames = self.stats.frames_rendered,
            encoded = self.stats.encoded_samples,
            bytes = self.stats.encoded_bytes,
            "Codec session released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use sq_common::{Codec, OutputStatus};
    use std::sync::Arc;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
        fail_configure: bool,
    }

    impl Recorder {
        fn push(&self, what: &str) {
            self.log.lock().push(format!("{}.{what}", self.name));
        }
    }

    impl Codec for Recorder {
        fn configure(&mut self, _: &TrackFormat) -> Result<(), CodecError> {
            self.push("configure");
            if self.fail_configure {
                return Err(CodecError::Configure("rejected".into()));
            }
            Ok(())
        }
        fn start(&mut self) -> Result<(), CodecError> {
            self.push("start");
            Ok(())
        }
        fn stop(&mut self) -> Result<(), CodecError> {
            self.push("stop");
            Ok(())
        }
        fn release(&mut self) {
            self.push("release");
        }
        fn dequeue_output_buffer(&mut self, _: Duration) -> Result<OutputStatus, CodecError> {
            Ok(OutputStatus::TryAgainLater)
        }
        fn output_format(&self) -> Result<TrackFormat, CodecError> {
            Ok(TrackFormat::default())
        }
    }

    impl VideoDecoder for Recorder {
        fn dequeue_input_buffer(&mut self, _: Duration) -> Result<Option<usize>, CodecError> {
            Ok(None)
        }
        fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], CodecError> {
            Err(CodecError::NullBuffer {
                stage: "decoder",
                index,
            })
        }
        fn queue_input_buffer(
            &mut self,
            _: usize,
            _: usize,
            _: u64,
            _: sq_common::BufferFlags,
        ) -> Result<(), CodecError> {
            Ok(())
        }
        fn release_output_buffer(&mut self, _: usize, _: bool) -> Result<(), CodecError> {
            Ok(())
        }
    }

    impl VideoEncoder for Recorder {
        fn output_buffer(&mut self, index: usize) -> Result<&[u8], CodecError> {
            Err(CodecError::NullBuffer {
                stage: "encoder",
                index,
            })
        }
        fn release_output_buffer(&mut self, _: usize) -> Result<(), CodecError> {
            Ok(())
        }
        fn signal_end_of_input_stream(&mut self) -> Result<(), CodecError> {
            Ok(())
        }
    }

    struct Transfer(Log);

    impl FrameTransfer for Transfer {
        fn await_new_frame(&mut self) -> Result<(), CodecError> {
            Ok(())
        }
        fn draw_frame(&mut self) -> Result<(), CodecError> {
            Ok(())
        }
        fn set_presentation_time(&mut self, _: u64) -> Result<(), CodecError> {
            Ok(())
        }
        fn swap_buffers(&mut self) -> Result<(), CodecError> {
            Ok(())
        }
        fn release(&mut self) {
            self.0.lock().push("transfer.release".into());
        }
    }

    struct Factory {
        log: Log,
        fail_decoder_configure: bool,
    }

    impl CodecFactory for Factory {
        fn create_decoder(&self, _: &str) -> Result<Box<dyn VideoDecoder>, CodecError> {
            Ok(Box::new(Recorder {
                name: "decoder",
                log: self.log.clone(),
                fail_configure: self.fail_decoder_configure,
            }))
        }
        fn create_encoder(&self, _: &str) -> Result<Box<dyn VideoEncoder>, CodecError> {
            Ok(Box::new(Recorder {
                name: "encoder",
                log: self.log.clone(),
                fail_configure: false,
            }))
        }
        fn create_frame_transfer(
            &self,
            _: &mut dyn VideoEncoder,
            _: Resolution,
        ) -> Result<Box<dyn FrameTransfer>, CodecError> {
            Ok(Box::new(Transfer(self.log.clone())))
        }
    }

    fn formats() -> (TrackFormat, TrackFormat) {
        (
            TrackFormat::video(MIME_VIDEO_AVC, 1920, 1080),
            TrackFormat::video(MIME_VIDEO_AVC, 960, 544),
        )
    }

    #[test]
    fn drop_stops_and_releases_everything() {
        let log = Log::default();
        let factory = Factory {
            log: log.clone(),
            fail_decoder_configure: false,
        };
        let (input, output) = formats();
        let session =
            CodecSession::open(&factory, &input, &output, Resolution::new(960, 544)).unwrap();
        assert_eq!(session.target(), Resolution::new(960, 544));
        drop(session);

        assert_eq!(
            *log.lock(),
            vec![
                "encoder.configure",
                "encoder.start",
                "decoder.configure",
                "decoder.start",
                "decoder.stop",
                "decoder.release",
                "encoder.stop",
                "encoder.release",
                "transfer.release",
            ]
        );
    }

    #[test]
    fn failed_configure_still_releases() {
        let log = Log::default();
        let factory = Factory {
            log: log.clone(),
            fail_decoder_configure: true,
        };
        let (input, output) = formats();
        let err = CodecSession::open(&factory, &input, &output, Resolution::new(960, 544))
            .unwrap_err();
        assert!(matches!(err, CodecError::Configure(_)));

        let log = log.lock();
        // the decoder never started, so it is released without a stop
        assert!(!log.contains(&"decoder.stop".to_string()));
        assert!(log.contains(&"decoder.release".to_string()));
        assert!(log.contains(&"encoder.stop".to_string()));
        assert!(log.contains(&"encoder.release".to_string()));
        assert!(log.contains(&"transfer.release".to_string()));
    }
}
