//! Bounded job queue between the playlist and the worker pool.
//!
//! Ordering is by [`Priority`] first and submission order second, so a now-playing job overtakes
//! prefetch jobs that were queued earlier. Cancelling a queued job only flips its state; the dead
//! entry is dropped when a worker pops it, or purged early when the queue is full.

use crate::downloader::{JobHandle, JobState, Priority};
use crate::errors::{AppError, Result};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

struct Entry {
    priority: Priority,
    seq: u64,
    job: JobHandle,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: higher priority first, then the lower (older) sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    closed: bool,
}

pub struct JobQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::with_capacity(capacity.min(1024)),
                next_seq: 0,
                closed: false,
            }),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries currently held, including cancelled ones not yet discarded.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Non-blocking submit: fails with `QueueFull` when at capacity.
    pub async fn try_enqueue(&self, job: JobHandle) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.push_locked(&mut inner, job)
    }

    /// Blocking submit: waits for a free slot unless `cancel` fires first.
    pub async fn enqueue(&self, job: JobHandle, cancel: &CancellationToken) -> Result<()> {
        loop {
            let space = self.not_full.notified();
            {
                let mut inner = self.inner.lock().await;
                match self.push_locked(&mut inner, job.clone()) {
                    Err(AppError::QueueFull(_)) => {}
                    other => return other,
                }
            }

            tokio::select! {
                _ = space => {}
                _ = cancel.cancelled() => {
                    log::debug!("[QUEUE] Submit of {} cancelled while waiting for space", job.id);
                    return Err(AppError::Cancelled);
                }
            }
        }
    }

    fn push_locked(&self, inner: &mut Inner, job: JobHandle) -> Result<()> {
        if inner.closed {
            return Err(AppError::QueueClosed);
        }
        if inner.heap.len() >= self.capacity {
            Self::purge_cancelled(inner);
        }
        if inner.heap.len() >= self.capacity {
            return Err(AppError::QueueFull(self.capacity));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        log::debug!("[QUEUE] Queued {} ({:?}, seq {})", job.id, job.priority, seq);
        inner.heap.push(Entry {
            priority: job.priority,
            seq,
            job,
        });
        self.not_empty.notify_one();
        Ok(())
    }

    fn purge_cancelled(inner: &mut Inner) {
        let before = inner.heap.len();
        inner.heap.retain(|entry| entry.job.state() == JobState::Queued);
        let purged = before - inner.heap.len();
        if purged > 0 {
            log::debug!("[QUEUE] Purged {} cancelled entries", purged);
        }
    }

    /// Waits for the highest-priority live job. Returns `QueueClosed` once the queue is shut down.
    pub async fn dequeue(&self) -> Result<JobHandle> {
        loop {
            let available = self.not_empty.notified();
            {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(AppError::QueueClosed);
                }
                while let Some(entry) = inner.heap.pop() {
                    self.not_full.notify_one();
                    if entry.job.state() == JobState::Queued {
                        return Ok(entry.job);
                    }
                }
            }
            available.await;
        }
    }

    /// Shuts the queue down: pending jobs are cancelled and every waiter is released.
    pub async fn close(&self) {
        let drained: Vec<Entry> = {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
            inner.heap.drain().collect()
        };
        for entry in drained {
            entry.job.cancel();
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        log::info!("[QUEUE] Closed");
    }
}
