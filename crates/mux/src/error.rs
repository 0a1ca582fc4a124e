//! Muxer and fast-start error types.

use thiserror::Error;

/// Errors from writing or rewriting an MP4 file.
#[derive(Error, Debug)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Track could not be created or addressed (unknown id, missing codec config).
    #[error("Track error: {0}")]
    InvalidTrack(String),

    /// `finish_movie` called twice, or with no tracks or an empty track.
    #[error("Cannot finalize movie: {0}")]
    Finalize(String),

    /// Top-level atom the fast-start pass does not know how to move.
    #[error("Unsupported top-level atom '{0}'")]
    UnsupportedLayout(String),

    /// The last top-level atom is not moov.
    #[error("File is not fast-startable: last atom is '{0}', expected 'moov'")]
    NotFastStartable(String),

    #[error("Compressed moov atoms are not supported")]
    CompressedMoov,

    /// A patched 32-bit chunk offset no longer fits.
    #[error("Chunk offset {offset} plus moov size {shift} overflows 32 bits")]
    OffsetOverflow { offset: u64, shift: u64 },

    #[error("Malformed MP4: {0}")]
    Malformed(String),
}

/// Convenience Result type for mux operations.
pub type MuxResult<T> = Result<T, MuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mux_error_display_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let mux_err = MuxError::from(io_err);
        assert!(mux_err.to_string().contains("IO error"));
        assert!(mux_err.to_string().contains("file not found"));
    }

    #[test]
    fn mux_error_display_finalize() {
        let err = MuxError::Finalize("movie already finalized".into());
        assert_eq!(
            err.to_string(),
            "Cannot finalize movie: movie already finalized"
        );
    }

    #[test]
    fn mux_error_display_overflow() {
        let err = MuxError::OffsetOverflow {
            offset: 4_294_967_000,
            shift: 1_000,
        };
        assert!(err.to_string().contains("overflows 32 bits"));
    }

    #[test]
    fn mux_error_display_not_fast_startable() {
        let err = MuxError::NotFastStartable("free".into());
        assert!(err.to_string().contains("'free'"));
    }
}
