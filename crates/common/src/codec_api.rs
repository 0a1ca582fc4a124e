//! Codec abstraction traits.
//!
//! The transcode engine drives decoders and encoders through these traits,
//! never through a concrete backend. A host supplies the backend through a
//! [`CodecFactory`]. The contract follows the queue model of platform
//! hardware codecs: buffers are dequeued with a bounded-wait timeout,
//! filled or drained, and handed back by index.

use std::time::Duration;

use crate::error::CodecError;
use crate::media::{BufferFlags, BufferInfo, TrackFormat};
use crate::types::Resolution;

/// Bounded wait used for every dequeue call made by the engine.
pub const DEFAULT_CODEC_TIMEOUT: Duration = Duration::from_millis(100);

/// Result of polling a codec's output queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputStatus {
    /// Nothing ready within the timeout.
    TryAgainLater,
    /// The codec settled its output format; read it with `output_format()`.
    FormatChanged,
    /// The set of output buffers was replaced. Carries no data.
    BuffersChanged,
    /// A filled output buffer.
    Buffer { index: usize, info: BufferInfo },
    /// A status code the engine does not understand.
    Unknown(i32),
}

/// Common lifecycle of decoder and encoder instances.
pub trait Codec: Send {
    /// Configure the codec for `format`. Must precede `start`.
    fn configure(&mut self, format: &TrackFormat) -> Result<(), CodecError>;

    fn start(&mut self) -> Result<(), CodecError>;

    fn stop(&mut self) -> Result<(), CodecError>;

    /// Free the codec's native resources. The instance is unusable afterwards.
    fn release(&mut self);

    /// Poll the output queue, waiting at most `timeout`.
    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<OutputStatus, CodecError>;

    /// Current output format, valid after [`OutputStatus::FormatChanged`].
    fn output_format(&self) -> Result<TrackFormat, CodecError>;
}

/// A hardware video decoder. Decoded frames are delivered to the frame
/// transfer attached at creation, not copied back to the engine.
pub trait VideoDecoder: Codec {
    /// Poll for a free input buffer, waiting at most `timeout`.
    fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<Option<usize>, CodecError>;

    /// Writable view of input buffer `index`.
    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], CodecError>;

    /// Submit `size` bytes of input buffer `index`.
    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: u64,
        flags: BufferFlags,
    ) -> Result<(), CodecError>;

    /// Return output buffer `index`, rendering it to the frame transfer when
    /// `render` is true.
    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), CodecError>;
}

/// A hardware video encoder fed through a frame transfer.
pub trait VideoEncoder: Codec {
    /// Encoded bytes of output buffer `index`.
    fn output_buffer(&mut self, index: usize) -> Result<&[u8], CodecError>;

    fn release_output_buffer(&mut self, index: usize) -> Result<(), CodecError>;

    /// Tell the encoder no more frames will arrive.
    fn signal_end_of_input_stream(&mut self) -> Result<(), CodecError>;
}

/// Moves decoded frames into the encoder's input, scaling them to the
/// target resolution on the way.
///
/// For every rendered decoder frame the engine calls, in order,
/// `await_new_frame`, `draw_frame`, `set_presentation_time` and
/// `swap_buffers`, exactly once each.
pub trait FrameTransfer: Send {
    /// Block until the frame released by the decoder is available.
    fn await_new_frame(&mut self) -> Result<(), CodecError>;

    /// Draw the latest frame into the encoder's input surface.
    fn draw_frame(&mut self) -> Result<(), CodecError>;

    /// Stamp the pending encoder input with `nanos`.
    fn set_presentation_time(&mut self, nanos: u64) -> Result<(), CodecError>;

    /// Submit the pending frame to the encoder.
    fn swap_buffers(&mut self) -> Result<(), CodecError>;

    fn release(&mut self);
}

/// Creates the codec instances for one compression job.
///
/// Each job asks for exactly one decoder, one encoder, and one frame transfer;
/// instances are never shared between jobs.
pub trait CodecFactory: Send + Sync {
    fn create_decoder(&self, mime: &str) -> Result<Box<dyn VideoDecoder>, CodecError>;

    fn create_encoder(&self, mime: &str) -> Result<Box<dyn VideoEncoder>, CodecError>;

    /// Build the transfer path between the decoder and an encoder that has
    /// already been configured for `target`.
    fn create_frame_transfer(
        &self,
        encoder: &mut dyn VideoEncoder,
        target: Resolution,
    ) -> Result<Box<dyn FrameTransfer>, CodecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_is_bounded() {
        assert_eq!(DEFAULT_CODEC_TIMEOUT, Duration::from_millis(100));
    }

    #[test]
    fn output_status_carries_buffer_info() {
        let info = BufferInfo::new(0, 128, 33_333, BufferFlags::KEY_FRAME);
        let status = OutputStatus::Buffer { index: 3, info };
        match status {
            OutputStatus::Buffer { index, info } => {
                assert_eq!(index, 3);
                assert!(info.flags.is_key_frame());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
