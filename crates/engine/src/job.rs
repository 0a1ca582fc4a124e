//! Job handles, events and cancellation.
//!
//! Every compression job runs on its own thread and reports through an
//! unbounded crossbeam channel. A job emits exactly one
//! [`EventKind::Started`], then non-decreasing [`EventKind::Progress`]
//! values, then exactly one terminal event.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use crate::error::PANICKED_MESSAGE;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative stop flag shared between a job and its handle.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// Lifecycle of one compression job.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum JobState {
    #[default]
    Idle,
    Probing,
    Configuring,
    Transcoding,
    Finalizing,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Probing => "probing",
            Self::Configuring => "configuring",
            Self::Transcoding => "transcoding",
            Self::Finalizing => "finalizing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Logs every state change of a job.
#[derive(Debug)]
pub(crate) struct JobTracker {
    job: usize,
    state: JobState,
}

impl JobTracker {
    pub(crate) fn new(job: usize) -> Self {
        Self {
            job,
            state: JobState::Idle,
        }
    }

    pub(crate) fn transition(&mut self, next: JobState) {
        info!(job = self.job, from = %self.state, to = %next, "Job state changed");
        self.state = next;
    }

    pub(crate) fn state(&self) -> JobState {
        self.state
    }
}

// ---------------------------------------------------------------------------
// Events and results
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    Started,
    /// Percent of the source duration transcoded, 0 to 100.
    Progress(f32),
    Succeeded { size: u64, path: PathBuf },
    Failed { message: String },
    Cancelled,
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }
}

/// An event from one job. `index` is the source's position in a batch, or
/// `None` for a single [`Compressor::compress`](crate::Compressor::compress)
/// call.
#[derive(Clone, Debug, PartialEq)]
pub struct CompressionEvent {
    pub index: Option<usize>,
    pub kind: EventKind,
}

/// Terminal outcome of one job.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompressionResult {
    pub index: Option<usize>,
    pub success: bool,
    pub failure_message: Option<String>,
    /// Size of the output file in bytes. Zero on failure.
    pub size: u64,
    pub path: Option<PathBuf>,
}

impl CompressionResult {
    pub fn succeeded(index: Option<usize>, size: u64, path: PathBuf) -> Self {
        Self {
            index,
            success: true,
            failure_message: None,
            size,
            path: Some(path),
        }
    }

    pub fn failed(index: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            index,
            success: false,
            failure_message: Some(message.into()),
            size: 0,
            path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Callback adapter
// ---------------------------------------------------------------------------

/// Callback view of the event stream, for hosts that prefer listeners over
/// polling a channel.
pub trait EventListener {
    fn on_start(&mut self, _index: Option<usize>) {}

    fn on_progress(&mut self, _index: Option<usize>, _percent: f32) {}

    fn on_success(&mut self, _index: Option<usize>, _size: u64, _path: &Path) {}

    fn on_failure(&mut self, _index: Option<usize>, _message: &str) {}

    fn on_cancelled(&mut self, _index: Option<usize>) {}
}

impl CompressionEvent {
    pub fn dispatch(&self, listener: &mut dyn EventListener) {
        match &self.kind {
            EventKind::Started => listener.on_start(self.index),
            EventKind::Progress(percent) => listener.on_progress(self.index, *percent),
            EventKind::Succeeded { size, path } => listener.on_success(self.index, *size, path),
            EventKind::Failed { message } => listener.on_failure(self.index, message),
            EventKind::Cancelled => listener.on_cancelled(self.index),
        }
    }
}

/// Feed events to `listener` until `jobs` terminal events have been seen or
/// every sender is gone.
fn listen(events: &Receiver<CompressionEvent>, jobs: usize, listener: &mut dyn EventListener) {
    let mut finished = 0;
    while finished < jobs {
        let Ok(event) = events.recv() else {
            break;
        };
        if event.kind.is_terminal() {
            finished += 1;
        }
        event.dispatch(listener);
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Sends one job's events tagged with its index.
#[derive(Clone, Debug)]
pub(crate) struct EventSink {
    index: Option<usize>,
    tx: Sender<CompressionEvent>,
}

impl EventSink {
    pub(crate) fn new(index: Option<usize>, tx: Sender<CompressionEvent>) -> Self {
        Self { index, tx }
    }

    pub(crate) fn index(&self) -> Option<usize> {
        self.index
    }

    /// Receivers may be dropped at any time; undelivered events are discarded.
    pub(crate) fn send(&self, kind: EventKind) {
        let _ = self.tx.send(CompressionEvent {
            index: self.index,
            kind,
        });
    }
}

fn join_thread(thread: JoinHandle<CompressionResult>, index: Option<usize>) -> CompressionResult {
    thread.join().unwrap_or_else(|_| {
        error!(?index, "Compression thread panicked");
        CompressionResult::failed(index, PANICKED_MESSAGE)
    })
}

/// Handle to a single running job.
#[derive(Debug)]
pub struct JobHandle {
    events: Receiver<CompressionEvent>,
    cancel: CancellationToken,
    thread: JoinHandle<CompressionResult>,
}

impl JobHandle {
    pub(crate) fn new(
        events: Receiver<CompressionEvent>,
        cancel: CancellationToken,
        thread: JoinHandle<CompressionResult>,
    ) -> Self {
        Self {
            events,
            cancel,
            thread,
        }
    }

    /// Ask the job to stop at its next pump iteration.
    pub fn cancel(&self) {
        self.cancel.cancel();
        info!("Compression cancellation requested");
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Next event, if one is pending (non-blocking).
    pub fn try_recv_event(&self) -> Option<CompressionEvent> {
        self.events.try_recv().ok()
    }

    /// Wait for the next event. `None` once the job has finished and every
    /// event has been received.
    pub fn recv_event(&self) -> Option<CompressionEvent> {
        self.events.recv().ok()
    }

    /// All pending events.
    pub fn drain_events(&self) -> Vec<CompressionEvent> {
        self.events.try_iter().collect()
    }

    /// Deliver the remaining events to `listener`, returning after the
    /// terminal one.
    pub fn listen(&self, listener: &mut dyn EventListener) {
        listen(&self.events, 1, listener);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the job and return its result.
    pub fn join(self) -> CompressionResult {
        join_thread(self.thread, None)
    }
}

pub(crate) struct BatchJob {
    pub(crate) cancel: CancellationToken,
    pub(crate) thread: JoinHandle<CompressionResult>,
}

/// Handle to one job per source, started together.
pub struct BatchHandle {
    events: Receiver<CompressionEvent>,
    jobs: Vec<BatchJob>,
    results: Arc<Vec<Mutex<Option<CompressionResult>>>>,
}

impl fmt::Debug for BatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchHandle")
            .field("jobs", &self.jobs.len())
            .field("finished", &self.finished_count())
            .finish()
    }
}

impl BatchHandle {
    pub(crate) fn new(
        events: Receiver<CompressionEvent>,
        jobs: Vec<BatchJob>,
        results: Arc<Vec<Mutex<Option<CompressionResult>>>>,
    ) -> Self {
        Self {
            events,
            jobs,
            results,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Cancel one job. Other jobs keep running.
    pub fn cancel(&self, index: usize) {
        if let Some(job) = self.jobs.get(index) {
            job.cancel.cancel();
            info!(index, "Compression cancellation requested");
        }
    }

    pub fn cancel_all(&self) {
        for job in &self.jobs {
            job.cancel.cancel();
        }
        info!(jobs = self.jobs.len(), "Batch cancellation requested");
    }

    /// Events from every job, interleaved.
    pub fn events(&self) -> &Receiver<CompressionEvent> {
        &self.events
    }

    /// Deliver events to `listener` until every job has finished.
    pub fn listen(&self, listener: &mut dyn EventListener) {
        listen(&self.events, self.jobs.len(), listener);
    }

    /// Jobs whose result slot is filled.
    pub fn finished_count(&self) -> usize {
        self.results.iter().filter(|slot| slot.lock().is_some()).count()
    }

    /// Wait for every job. Results are ordered by source index.
    pub fn join_all(self) -> Vec<CompressionResult> {
        let Self { jobs, results, .. } = self;
        jobs.into_iter()
            .enumerate()
            .map(|(index, job)| {
                let joined = join_thread(job.thread, Some(index));
                results[index].lock().take().unwrap_or(joined)
            })
            .collect()
    }
}
