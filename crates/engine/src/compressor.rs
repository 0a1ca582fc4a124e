//! Compression job orchestration.
//!
//! [`Compressor`] validates a request on the caller's thread, then spawns one
//! worker thread per source. Each worker:
//!
//! ```text
//! open demuxer ─▶ plan ─▶ create muxer ─▶ transcode video ─▶ copy audio
//!              ─▶ finish movie ─▶ fast start (optional) ─▶ place output
//! ```
//!
//! Any error after the thread is spawned becomes a single terminal event
//! and a [`CompressionResult`]; the partial output is deleted.

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use sq_common::{CodecFactory, CompressionConfig, SourceDescriptor, DEFAULT_CODEC_TIMEOUT};
use sq_demux::Mp4Demuxer;
use sq_mux::{faststart_in_place, FastStart, MediaMuxer, MoovPlacement, Mp4Movie};

use crate::audio::copy_audio_track;
use crate::error::{CompressError, CompressResult, CANCELLED_MESSAGE, PANICKED_MESSAGE};
use crate::job::{
    BatchHandle, BatchJob, CancellationToken, CompressionResult, EventKind, EventSink, JobHandle,
    JobState, JobTracker,
};
use crate::policy;
use crate::storage::{validated_file_name, OutputPlacement};
use crate::transcoder::VideoTranscoder;

/// Engine-wide tunables.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Bounded wait for every codec dequeue call.
    pub codec_timeout: Duration,
    pub moov_placement: MoovPlacement,
    /// Used when neither the source nor the config gives a frame rate.
    pub default_frame_rate: u32,
    /// Seconds between key frames when neither the source nor the config
    /// gives one.
    pub default_i_frame_interval: u32,
    /// Where batch jobs write before their output is placed.
    pub scratch_dir: PathBuf,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            codec_timeout: DEFAULT_CODEC_TIMEOUT,
            moov_placement: MoovPlacement::Start,
            default_frame_rate: 30,
            default_i_frame_interval: 1,
            scratch_dir: std::env::temp_dir(),
        }
    }
}

/// Starts compression jobs on worker threads.
pub struct Compressor {
    factory: Arc<dyn CodecFactory>,
    options: EngineOptions,
    next_job: AtomicUsize,
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("options", &self.options)
            .field("jobs_started", &self.next_job.load(Ordering::Relaxed))
            .finish()
    }
}

impl Compressor {
    pub fn new(factory: Arc<dyn CodecFactory>) -> Self {
        Self::with_options(factory, EngineOptions::default())
    }

    pub fn with_options(factory: Arc<dyn CodecFactory>, options: EngineOptions) -> Self {
        Self {
            factory,
            options,
            next_job: AtomicUsize::new(0),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Compress `source` into `destination` on a new thread.
    ///
    /// Invalid settings are rejected here, before any thread exists.
    pub fn compress(
        &self,
        source: SourceDescriptor,
        destination: impl Into<PathBuf>,
        config: CompressionConfig,
    ) -> CompressResult<JobHandle> {
        config.validate()?;
        let destination = destination.into();
        if destination.as_os_str().is_empty() {
            return Err(CompressError::InvalidConfig(
                "destination path must not be empty".into(),
            ));
        }

        let (tx, rx) = channel::unbounded();
        let cancel = CancellationToken::new();
        let job = Job {
            id: self.next_job.fetch_add(1, Ordering::SeqCst),
            source,
            output: JobOutput::Path(destination),
            config,
            options: self.options.clone(),
            factory: self.factory.clone(),
            cancel: cancel.clone(),
            events: EventSink::new(None, tx),
            slot: None,
        };
        let thread = job.spawn()?;
        Ok(JobHandle::new(rx, cancel, thread))
    }

    /// Compress every source with the same settings, one thread each.
    /// Finished files are handed to `placement` under
    /// `<source stem>.mp4`.
    pub fn start(
        &self,
        sources: Vec<SourceDescriptor>,
        config: CompressionConfig,
        placement: Arc<dyn OutputPlacement>,
    ) -> CompressResult<BatchHandle> {
        config.validate()?;

        let (tx, rx) = channel::unbounded();
        let results: Arc<Vec<Mutex<Option<CompressionResult>>>> =
            Arc::new(sources.iter().map(|_| Mutex::new(None)).collect());

        info!(sources = sources.len(), quality = ?config.quality, "Starting batch");

        let mut jobs: Vec<BatchJob> = Vec::with_capacity(sources.len());
        for (index, source) in sources.into_iter().enumerate() {
            let id = self.next_job.fetch_add(1, Ordering::SeqCst);
            let name = source.file_stem();
            let scratch = self.options.scratch_dir.join(format!(
                "squeeze-{}-{id}-{}",
                std::process::id(),
                validated_file_name(&name, config.streamable)
            ));
            let cancel = CancellationToken::new();
            let job = Job {
                id,
                source,
                output: JobOutput::Placed {
                    scratch,
                    name: validated_file_name(&name, false),
                    placement: placement.clone(),
                },
                config: config.clone(),
                options: self.options.clone(),
                factory: self.factory.clone(),
                cancel: cancel.clone(),
                events: EventSink::new(Some(index), tx.clone()),
                slot: Some((results.clone(), index)),
            };
            let thread = match job.spawn() {
                Ok(thread) => thread,
                Err(e) => {
                    for job in &jobs {
                        job.cancel.cancel();
                    }
                    return Err(e);
                }
            };
            jobs.push(BatchJob { cancel, thread });
        }

        Ok(BatchHandle::new(rx, jobs, results))
    }
}

enum JobOutput {
    Path(PathBuf),
    Placed {
        scratch: PathBuf,
        name: String,
        placement: Arc<dyn OutputPlacement>,
    },
}

impl JobOutput {
    /// File the muxer writes to.
    fn write_path(&self) -> &Path {
        match self {
            Self::Path(path) => path,
            Self::Placed { scratch, .. } => scratch,
        }
    }
}

/// Everything one worker thread needs.
struct Job {
    id: usize,
    source: SourceDescriptor,
    output: JobOutput,
    config: CompressionConfig,
    options: EngineOptions,
    factory: Arc<dyn CodecFactory>,
    cancel: CancellationToken,
    events: EventSink,
    /// Batch result slot to fill before the thread exits.
    slot: Option<(Arc<Vec<Mutex<Option<CompressionResult>>>>, usize)>,
}

impl Job {
    fn spawn(self) -> CompressResult<JoinHandle<CompressionResult>> {
        let name = format!("squeeze-job-{}", self.id);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let id = self.id;
                let events = self.events.clone();
                let slot = self.slot.clone();
                let output = self.output.write_path().to_path_buf();
                match panic::catch_unwind(AssertUnwindSafe(|| self.run())) {
                    Ok(result) => result,
                    Err(_) => {
                        error!(job = id, "Compression thread panicked");
                        remove_partial_output(id, &output);
                        events.send(EventKind::Failed {
                            message: PANICKED_MESSAGE.into(),
                        });
                        let result = CompressionResult::failed(events.index(), PANICKED_MESSAGE);
                        if let Some((slots, slot)) = slot {
                            *slots[slot].lock() = Some(result.clone());
                        }
                        result
                    }
                }
            })
            .map_err(|e| {
                CompressError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to spawn job thread: {e}"),
                ))
            })
    }

    fn run(self) -> CompressionResult {
        let index = self.events.index();
        let started = Instant::now();
        let mut tracker = JobTracker::new(self.id);

        info!(
            job = self.id,
            ?index,
            source = %self.source.path().display(),
            output = %self.output.write_path().display(),
            "Compression started"
        );
        self.events.send(EventKind::Started);

        let result = match self.execute(&mut tracker) {
            Ok((path, size)) => {
                tracker.transition(JobState::Succeeded);
                info!(
                    job = self.id,
                    path = %path.display(),
                    size,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "Compression succeeded"
                );
                self.events.send(EventKind::Succeeded {
                    size,
                    path: path.clone(),
                });
                CompressionResult::succeeded(index, size, path)
            }
            Err(e) => {
                let failed_in = tracker.state();
                self.remove_partial_output();
                if e.is_cancelled() {
                    tracker.transition(JobState::Cancelled);
                    self.events.send(EventKind::Cancelled);
                    CompressionResult::failed(index, CANCELLED_MESSAGE)
                } else {
                    tracker.transition(JobState::Failed);
                    error!(job = self.id, state = %failed_in, "Compression failed: {e}");
                    let message = e.to_string();
                    self.events.send(EventKind::Failed {
                        message: message.clone(),
                    });
                    CompressionResult::failed(index, message)
                }
            }
        };

        if let Some((slots, slot)) = &self.slot {
            *slots[*slot].lock() = Some(result.clone());
        }
        result
    }

    fn execute(&self, tracker: &mut JobTracker) -> CompressResult<(PathBuf, u64)> {
        tracker.transition(JobState::Probing);
        let mut demuxer = Mp4Demuxer::open(self.source.path())?;
        let video_index = demuxer.first_video_track().ok_or(CompressError::NoVideoTrack)?;

        tracker.transition(JobState::Configuring);
        let plan = policy::plan(self.source.metadata(), &self.config)?;
        let output = self.output.write_path();
        let movie = Mp4Movie::new(output)
            .with_rotation(plan.rotation)
            .with_placement(self.options.moov_placement);
        let mut muxer = MediaMuxer::create_movie(movie)?;

        if self.cancel.is_cancelled() {
            return Err(CompressError::Cancelled);
        }

        tracker.transition(JobState::Transcoding);
        let transcoder = VideoTranscoder::new(self.factory.as_ref(), &self.options, &self.cancel);
        let mut on_progress = |percent: f32| self.events.send(EventKind::Progress(percent));
        transcoder.run(
            &mut demuxer,
            &mut muxer,
            video_index,
            &plan,
            &self.config,
            &mut on_progress,
        )?;

        if self.config.disable_audio {
            info!(job = self.id, "Audio disabled");
        } else if let Some(audio_index) = demuxer.first_audio_track() {
            copy_audio_track(&mut demuxer, &mut muxer, audio_index, &self.cancel)?;
        }

        tracker.transition(JobState::Finalizing);
        muxer.finish_movie()?;
        drop(muxer);

        if self.config.streamable {
            match faststart_in_place(output)? {
                FastStart::Relocated => info!(job = self.id, "Moved moov to the front"),
                FastStart::AlreadyFastStart => {}
            }
        }

        let path = match &self.output {
            JobOutput::Path(path) => path.clone(),
            JobOutput::Placed {
                scratch,
                name,
                placement,
            } => placement.materialize(scratch, name)?,
        };
        let size = fs::metadata(&path)?.len();
        Ok((path, size))
    }

    fn remove_partial_output(&self) {
        remove_partial_output(self.id, self.output.write_path());
    }
}

fn remove_partial_output(job: usize, path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!(job, path = %path.display(), "Removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(job, path = %path.display(), "Failed to remove partial output: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = EngineOptions::default();
        assert_eq!(options.codec_timeout, Duration::from_millis(100));
        assert_eq!(options.moov_placement, MoovPlacement::Start);
        assert_eq!(options.default_frame_rate, 30);
        assert_eq!(options.default_i_frame_interval, 1);
    }

    #[test]
    fn job_output_paths() {
        let direct = JobOutput::Path(PathBuf::from("/out/a.mp4"));
        assert_eq!(direct.write_path(), Path::new("/out/a.mp4"));

        let placed = JobOutput::Placed {
            scratch: PathBuf::from("/tmp/squeeze-1-a.mp4"),
            name: "a.mp4".into(),
            placement: Arc::new(crate::storage::KeepInPlace),
        };
        assert_eq!(placed.write_path(), Path::new("/tmp/squeeze-1-a.mp4"));
    }
}
