use crate::api::{SourceRef, TrackInfo};
use crate::config::AppConfig;
use crate::downloader::cache::ContentCache;
use crate::downloader::queue::JobQueue;
use crate::downloader::{DownloadEvent, DownloadStats, Job, JobHandle, JobState, Priority, Resolver};
use crate::errors::{AppError, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_count: usize,
    pub max_concurrent: usize,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub attempt_timeout: Duration,
}

impl From<&AppConfig> for WorkerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            max_concurrent: config.max_concurrent_downloads,
            max_retries: config.max_download_retries,
            retry_delay: config.retry_delay(),
            attempt_timeout: config.download_timeout(),
        }
    }
}

enum Outcome {
    Succeeded { cached: bool },
    Failed(String),
    Cancelled,
}

#[derive(Default)]
struct Counters {
    running: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

struct Shared {
    queue: JobQueue,
    cache: Arc<ContentCache>,
    resolver: Arc<dyn Resolver>,
    settings: WorkerSettings,
    permits: Arc<Semaphore>,
    live: Mutex<HashMap<String, JobHandle>>,
    events: broadcast::Sender<DownloadEvent>,
    counters: Counters,
    shutdown: CancellationToken,
}

/// Fixed pool of download workers fed by a bounded [`JobQueue`].
pub struct DownloadManager {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadManager {
    pub fn new(config: &AppConfig, cache: Arc<ContentCache>, resolver: Arc<dyn Resolver>) -> Arc<Self> {
        Self::with_settings(WorkerSettings::from(config), config.queue_capacity, cache, resolver)
    }

    /// Spawns the workers immediately; must be called inside a tokio runtime.
    pub fn with_settings(
        settings: WorkerSettings,
        queue_capacity: usize,
        cache: Arc<ContentCache>,
        resolver: Arc<dyn Resolver>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            queue: JobQueue::new(queue_capacity),
            cache,
            resolver,
            permits: Arc::new(Semaphore::new(settings.max_concurrent)),
            settings,
            live: Mutex::new(HashMap::new()),
            events,
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
        });

        let workers = (1..=shared.settings.worker_count)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move { shared.worker_loop(worker_id).await })
            })
            .collect();

        log::info!(
            "🚀 [DOWNLOAD] Started {} workers (max {} concurrent, {} retries, queue capacity {})",
            shared.settings.worker_count,
            shared.settings.max_concurrent,
            shared.settings.max_retries,
            queue_capacity
        );

        Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Schedules a download, waiting for queue space if needed.
    pub async fn schedule(&self, track: &TrackInfo, priority: Priority) -> Result<JobHandle> {
        self.submit(track, priority, true).await
    }

    /// Schedules a download, failing with `QueueFull` instead of waiting.
    pub async fn try_schedule(&self, track: &TrackInfo, priority: Priority) -> Result<JobHandle> {
        self.submit(track, priority, false).await
    }

    async fn submit(&self, track: &TrackInfo, priority: Priority, blocking: bool) -> Result<JobHandle> {
        let shared = &self.shared;
        if shared.queue.is_closed().await {
            return Err(AppError::QueueClosed);
        }
        let job = {
            let mut live = shared.live.lock().await;
            if let Some(existing) = live.get(&track.id) {
                let state = existing.state();
                let upgrade = state == JobState::Queued && priority > existing.priority;
                if !state.is_terminal() && !upgrade {
                    return Ok(existing.clone());
                }
                if upgrade && existing.cancel() {
                    log::debug!("⬆️ [DOWNLOAD] Upgrading {} to {:?}", track.id, priority);
                    // Replaced below, so the live table is not touched here.
                    shared.announce_cancelled(existing);
                }
            }

            if shared.cache.lookup_playable(&track.id).await.is_some() {
                live.remove(&track.id);
                return Ok(Job::completed(&track.id, track.source.clone(), priority));
            }

            let job = Job::new(track.id.clone(), track.source.clone(), priority);
            live.insert(track.id.clone(), job.clone());
            job
        };

        let enqueued = if blocking {
            shared.queue.enqueue(job.clone(), &shared.shutdown).await
        } else {
            shared.queue.try_enqueue(job.clone()).await
        };

        if let Err(e) = enqueued {
            job.cancel();
            shared.forget(&job).await;
            return Err(e);
        }
        log::info!("📥 [DOWNLOAD] Scheduled {} ({:?}) from {}", track.id, priority, track.source);
        Ok(job)
    }

    /// Drops any cached copy and fetches the track again. Refused with `InvalidInput` while the
    /// track is pinned by playback, before any live job is touched.
    pub async fn redownload(&self, track: &TrackInfo) -> Result<JobHandle> {
        if self.shared.cache.is_pinned(&track.id).await {
            return Err(AppError::InvalidInput(format!("{} is in use by playback", track.id)));
        }
        self.cancel(&track.id).await;
        if let Some(job) = self.job(&track.id).await {
            job.wait_terminal().await;
        }
        self.shared.cache.remove(&track.id).await?;
        log::info!("🔄 [DOWNLOAD] Re-downloading {}", track.id);
        self.schedule(track, Priority::NowPlaying).await
    }

    /// Cancels the live job for `track_id`. Returns false when there was nothing to cancel.
    pub async fn cancel(&self, track_id: &str) -> bool {
        let job = match self.job(track_id).await {
            Some(job) => job,
            None => return false,
        };
        if !job.cancel() {
            return false;
        }
        if job.state() == JobState::Cancelled {
            // Never reached a worker.
            self.shared.record(&job, Outcome::Cancelled).await;
        }
        log::info!("🛑 [DOWNLOAD] Cancel requested for {}", track_id);
        true
    }

    pub async fn job(&self, track_id: &str) -> Option<JobHandle> {
        self.shared.live.lock().await.get(track_id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.shared.events.subscribe()
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.shared.cache
    }

    pub async fn stats(&self) -> DownloadStats {
        let queued = self
            .shared
            .live
            .lock()
            .await
            .values()
            .filter(|job| job.state() == JobState::Queued)
            .count();
        let counters = &self.shared.counters;
        DownloadStats {
            queued,
            running: counters.running.load(Ordering::SeqCst),
            succeeded: counters.succeeded.load(Ordering::SeqCst),
            failed: counters.failed.load(Ordering::SeqCst),
            cancelled: counters.cancelled.load(Ordering::SeqCst),
        }
    }

    /// Stops accepting work, cancels everything in flight and waits for the workers to exit.
    pub async fn shutdown(&self) {
        log::info!("🛑 [DOWNLOAD] Shutting down");
        self.shared.shutdown.cancel();
        self.shared.queue.close().await;
        for job in self.shared.live.lock().await.values() {
            job.cancel();
        }

        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
    }
}

impl Shared {
    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            let job = tokio::select! {
                dequeued = self.queue.dequeue() => match dequeued {
                    Ok(job) => job,
                    Err(_) => break,
                },
                _ = self.shutdown.cancelled() => break,
            };

            let permit = tokio::select! {
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = job.cancel_token().cancelled() => {
                    if job.state() == JobState::Queued {
                        job.transition(&[JobState::Queued], JobState::Cancelled);
                    }
                    self.record(&job, Outcome::Cancelled).await;
                    continue;
                }
            };

            if !job.transition(&[JobState::Queued], JobState::Running) {
                drop(permit);
                continue;
            }
            self.counters.running.fetch_add(1, Ordering::SeqCst);

            let started = Instant::now();
            let outcome = self.run_job(&job, worker_id).await;
            log::debug!(
                "[WORKER {}] {} finished after {} attempt(s) in {:.2}s",
                worker_id,
                job.id,
                job.attempts(),
                started.elapsed().as_secs_f64()
            );

            self.record(&job, outcome).await;
            self.counters.running.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        }
        log::debug!("[WORKER {}] Exiting", worker_id);
    }

    async fn run_job(&self, job: &JobHandle, worker_id: usize) -> Outcome {
        let max_attempts = self.settings.max_retries + 1;
        loop {
            if job.is_cancel_requested() {
                return Outcome::Cancelled;
            }
            let attempt = job.start_attempt();
            log::info!("⬇️ [WORKER {}] {} attempt {}/{}", worker_id, job.id, attempt, max_attempts);

            let result = match tokio::time::timeout(self.settings.attempt_timeout, self.fetch_once(job)).await {
                Ok(result) => result,
                Err(_) => Err(AppError::TransientFetch(format!(
                    "attempt timed out after {:?}",
                    self.settings.attempt_timeout
                ))),
            };

            let error = match result {
                Ok(cached) => return Outcome::Succeeded { cached },
                Err(AppError::Cancelled) => return Outcome::Cancelled,
                Err(e) => e,
            };

            if !error.is_transient() {
                log::warn!("⚠️ [WORKER {}] {} permanent failure: {}", worker_id, job.id, error);
                return Outcome::Failed(error.to_string());
            }
            if attempt >= max_attempts {
                log::warn!("⚠️ [WORKER {}] {} attempt {} failed: {}", worker_id, job.id, attempt, error);
                return Outcome::Failed(format!("gave up after {} attempts: {}", attempt, error));
            }

            log::warn!(
                "⚠️ [WORKER {}] {} attempt {} failed: {}, retrying in {:?}",
                worker_id, job.id, attempt, error, self.settings.retry_delay
            );
            tokio::select! {
                _ = tokio::time::sleep(self.settings.retry_delay) => {}
                _ = job.cancel_token().cancelled() => return Outcome::Cancelled,
            }
        }
    }

    /// One resolve-and-store attempt. `Ok(true)` when the payload landed in the cache, `Ok(false)`
    /// when the fetch worked but caching did not.
    async fn fetch_once(&self, job: &JobHandle) -> Result<bool> {
        let fetched = self.resolver.resolve(&job.source).await?;
        let mut stream = fetched.stream;

        let mut writer = match self.cache.begin_write(&job.id).await {
            Ok(writer) => Some(writer),
            Err(e) => {
                log::warn!("⚠️ [CACHE] Cannot cache {}: {}", job.id, e);
                None
            }
        };

        let mut received: u64 = 0;
        loop {
            if job.is_cancel_requested() {
                if let Some(writer) = writer.take() {
                    writer.abort().await;
                }
                return Err(AppError::Cancelled);
            }
            let chunk = match stream.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    if let Some(writer) = writer.take() {
                        writer.abort().await;
                    }
                    return Err(e);
                }
                None => break,
            };
            received += chunk.len() as u64;

            if let Some(active) = writer.as_mut() {
                if let Err(e) = active.write_chunk(&chunk).await {
                    log::warn!("⚠️ [CACHE] Write failed for {}: {}", job.id, e);
                    if let Some(failed) = writer.take() {
                        failed.abort().await;
                    }
                }
            }
        }

        let incomplete = match fetched.content_length {
            _ if received == 0 => Some(format!("empty payload for {}", job.id)),
            Some(expected) if received < expected => Some(format!(
                "truncated payload for {}: {} of {} bytes",
                job.id, received, expected
            )),
            _ => None,
        };
        if let Some(reason) = incomplete {
            if let Some(writer) = writer.take() {
                writer.abort().await;
            }
            return Err(AppError::TransientFetch(reason));
        }

        let mut writer = match writer {
            Some(writer) => writer,
            None => {
                self.fallback_direct(job).await;
                return Ok(false);
            }
        };
        match writer.commit(&self.cache).await {
            Ok(_) => Ok(true),
            Err(e) => {
                log::warn!("⚠️ [CACHE] Publish failed for {}: {}", job.id, e);
                if let Err(e) = writer.spill_direct(&self.cache).await {
                    log::warn!("⚠️ [CACHE] Could not keep payload for {}: {}", job.id, e);
                    self.fallback_direct(job).await;
                }
                Ok(false)
            }
        }
    }

    /// Local files can still be streamed from where they are when caching them failed.
    async fn fallback_direct(&self, job: &JobHandle) {
        match &job.source {
            SourceRef::File(original) => self.cache.register_direct(&job.id, original.clone()).await,
            _ => log::warn!("⚠️ [CACHE] No direct-stream fallback for {}", job.id),
        }
    }

    /// Moves the job to its terminal state, updates counters and notifies subscribers.
    async fn record(&self, job: &JobHandle, outcome: Outcome) {
        let event = match outcome {
            Outcome::Succeeded { cached } => {
                if !job.transition(&[JobState::Running], JobState::Succeeded) {
                    return;
                }
                self.counters.succeeded.fetch_add(1, Ordering::SeqCst);
                log::info!("✅ [DOWNLOAD] {} ready (cached: {})", job.id, cached);
                DownloadEvent::Succeeded { id: job.id.clone(), cached }
            }
            Outcome::Failed(error) => {
                job.set_error(error.clone());
                if !job.transition(&[JobState::Running], JobState::Failed) {
                    return;
                }
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                log::error!("❌ [DOWNLOAD] {} failed: {}", job.id, error);
                DownloadEvent::Failed { id: job.id.clone(), error }
            }
            Outcome::Cancelled => {
                job.transition(&[JobState::Running], JobState::Cancelled);
                if job.state() != JobState::Cancelled || !self.forget(job).await {
                    return;
                }
                self.announce_cancelled(job);
                return;
            }
        };
        self.forget(job).await;
        let _ = self.events.send(event);
    }

    fn announce_cancelled(&self, job: &JobHandle) {
        self.counters.cancelled.fetch_add(1, Ordering::SeqCst);
        log::info!("🛑 [DOWNLOAD] {} cancelled", job.id);
        let _ = self.events.send(DownloadEvent::Cancelled { id: job.id.clone() });
    }

    /// Removes `job` from the live table if it is still the registered one.
    async fn forget(&self, job: &JobHandle) -> bool {
        let mut live = self.live.lock().await;
        match live.get(&job.id) {
            Some(current) if Arc::ptr_eq(current, job) => {
                live.remove(&job.id);
                true
            }
            _ => false,
        }
    }
}
