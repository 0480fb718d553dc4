pub mod cache;
pub mod http_pool;
pub mod manager;
pub mod queue;
pub mod strategies;

use crate::api::SourceRef;
use crate::errors::Result;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Now-playing jobs are always dequeued before prefetch jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Prefetch,
    NowPlaying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }
}

/// One scheduled download of a single track.
///
/// State only moves forward (`Queued -> Running -> terminal`, or `Queued -> Cancelled`); every
/// transition goes through [`Job::transition`], so no state is entered twice.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub source: SourceRef,
    pub priority: Priority,
    attempt: AtomicU32,
    state: watch::Sender<JobState>,
    cancel: CancellationToken,
    error: Mutex<Option<String>>,
}

pub type JobHandle = Arc<Job>;

impl Job {
    pub fn new(id: impl Into<String>, source: SourceRef, priority: Priority) -> JobHandle {
        let (state, _) = watch::channel(JobState::Queued);
        Arc::new(Self {
            id: id.into(),
            source,
            priority,
            attempt: AtomicU32::new(0),
            state,
            cancel: CancellationToken::new(),
            error: Mutex::new(None),
        })
    }

    /// A job that never ran because its track was already playable.
    pub(crate) fn completed(id: &str, source: SourceRef, priority: Priority) -> JobHandle {
        let job = Self::new(id, source, priority);
        job.transition(&[JobState::Queued], JobState::Running);
        job.transition(&[JobState::Running], JobState::Succeeded);
        job
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Number of fetch attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().ok().and_then(|e| e.clone())
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Requests cancellation. A queued job is cancelled on the spot; a running job is flagged and
    /// its worker aborts at the next chunk boundary. Returns whether the job was still live.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel();
        if self.transition(&[JobState::Queued], JobState::Cancelled) {
            return true;
        }
        self.state() == JobState::Running
    }

    /// Moves `from -> to` atomically; false when the current state is not in `from`.
    pub(crate) fn transition(&self, from: &[JobState], to: JobState) -> bool {
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn start_attempt(&self) -> u32 {
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn set_error(&self, message: String) {
        if let Ok(mut error) = self.error.lock() {
            *error = Some(message);
        }
    }

    /// Resolves once the job reaches a terminal state.
    pub async fn wait_terminal(&self) -> JobState {
        let mut rx = self.state.subscribe();
        let result = rx.wait_for(|state| state.is_terminal()).await.map(|state| *state);
        match result {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }
}

/// Audio bytes delivered chunk by chunk, so the worker can check for cancellation between reads.
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>>>;

pub struct Fetched {
    pub stream: ChunkStream,
    pub content_length: Option<u64>,
}

/// A backend able to turn a [`SourceRef`] into decodable audio bytes.
///
/// Failures must be classified: [`crate::errors::AppError::is_transient`] decides whether the
/// worker pool retries.
#[async_trait::async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, source: &SourceRef) -> Result<Fetched>;
    fn supports(&self, source: &SourceRef) -> bool;
    fn get_name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadEvent {
    Succeeded { id: String, cached: bool },
    Failed { id: String, error: String },
    Cancelled { id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobHandle {
        Job::new("t1", SourceRef::Http("http://x/a.mp3".into()), Priority::Prefetch)
    }

    #[test]
    fn priority_order() {
        assert!(Priority::NowPlaying > Priority::Prefetch);
    }

    #[test]
    fn queued_job_cancels_immediately() {
        let job = job();
        assert!(job.cancel());
        assert_eq!(job.state(), JobState::Cancelled);
        assert!(job.is_cancel_requested());
    }

    #[test]
    fn running_job_cancel_is_cooperative() {
        let job = job();
        assert!(job.transition(&[JobState::Queued], JobState::Running));
        assert!(job.cancel());
        assert_eq!(job.state(), JobState::Running);
        assert!(job.is_cancel_requested());
    }

    #[test]
    fn transitions_are_monotonic() {
        let job = job();
        assert!(job.transition(&[JobState::Queued], JobState::Running));
        assert!(job.transition(&[JobState::Running], JobState::Succeeded));
        assert!(!job.transition(&[JobState::Running], JobState::Failed));
        assert!(!job.transition(&[JobState::Queued], JobState::Running));
        assert!(!job.cancel());
        assert_eq!(job.state(), JobState::Succeeded);
    }

    #[tokio::test]
    async fn wait_terminal_sees_final_state() {
        let job = job();
        let waiter = {
            let job = job.clone();
            tokio::spawn(async move { job.wait_terminal().await })
        };
        job.transition(&[JobState::Queued], JobState::Running);
        job.transition(&[JobState::Running], JobState::Failed);
        assert_eq!(waiter.await.unwrap(), JobState::Failed);
    }
}
