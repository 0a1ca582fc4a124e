//! Probed source metadata.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{Micros, Resolution, Rotation};

/// Metadata read from a source container without decoding any sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub resolution: Resolution,
    pub rotation: Rotation,
    /// Overall bitrate in bits per second.
    pub bitrate: u64,
    pub duration: Micros,
    pub has_audio: bool,
    /// Average video frame rate, when the track has samples.
    pub frame_rate: Option<u32>,
}

/// A source file together with its probed metadata. Immutable once built.
#[derive(Clone, Debug)]
pub struct SourceDescriptor {
    path: PathBuf,
    metadata: VideoMetadata,
}

impl SourceDescriptor {
    pub fn new(path: impl Into<PathBuf>, metadata: VideoMetadata) -> Self {
        Self {
            path: path.into(),
            metadata,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    /// File name without directories, used as the default output name.
    pub fn file_stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string())
    }
}
