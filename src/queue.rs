//! Single-lane job queue with admission control.
//!
//! `QueueState` holds the raw counters and the FIFO of pending jobs.
//! `QueueService` wraps it in a mutex so every admission and drain decision
//! is made under one lock; callers never see a half-applied batch.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{MedisError, Result};

/// One request to download a single video. Lives only in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub url: String,
    pub id: Uuid,
}

impl Job {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            id: Uuid::new_v4(),
        }
    }
}

/// Read-only snapshot of the lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub active: usize,
    pub queued: usize,
}

#[derive(Debug, Default)]
pub struct QueueState {
    active: usize,
    pending: VecDeque<Job>,
}

impl QueueState {
    /// `None` means no limit is configured.
    pub fn is_full(&self, max_limit: Option<usize>, incoming: usize) -> bool {
        match max_limit {
            None => false,
            Some(limit) => self.active + self.pending.len() + incoming > limit,
        }
    }

    pub fn enqueue(&mut self, job: Job) {
        self.pending.push_back(job);
    }

    /// Pops the oldest pending job, but only while the lane is free.
    pub fn dequeue_next(&mut self) -> Option<Job> {
        if self.active > 0 {
            return None;
        }
        self.pending.pop_front()
    }

    pub fn increment_active(&mut self) {
        self.active += 1;
    }

    pub fn decrement_active(&mut self) {
        self.active = self.active.saturating_sub(1);
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            active: self.active,
            queued: self.pending.len(),
        }
    }
}

/// Outcome of a successful admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Job that claimed the free lane and must be started by the caller.
    pub started: Option<Job>,
    pub admitted: usize,
    pub stats: QueueStats,
}

/// Owned queue state, constructed once at startup and shared by reference.
#[derive(Debug)]
pub struct QueueService {
    state: Mutex<QueueState>,
    max_limit: Option<usize>,
}

impl QueueService {
    pub fn new(max_limit: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_limit,
        }
    }

    pub fn max_limit(&self) -> Option<usize> {
        self.max_limit
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats()
    }

    pub fn is_full(&self, incoming: usize) -> bool {
        self.state.lock().is_full(self.max_limit, incoming)
    }

    /// Admits a batch atomically: either every job is enqueued or none is.
    /// When the lane is free the oldest pending job claims it immediately.
    ///
    /// `report` sees the new counters before the lock is released, so
    /// snapshots reach it in the order they were taken.
    pub fn admit(&self, jobs: Vec<Job>, report: impl FnOnce(QueueStats)) -> Result<Admission> {
        let mut state = self.state.lock();
        if state.is_full(self.max_limit, jobs.len()) {
            let limit = self.max_limit.unwrap_or_default();
            return Err(if jobs.len() > 1 {
                MedisError::Capacity(format!(
                    "Adding {} videos would exceed the queue limit (max: {limit})",
                    jobs.len()
                ))
            } else {
                MedisError::Capacity(format!(
                    "Queue limit reached (max: {limit}). Please try again later"
                ))
            });
        }

        let admitted = jobs.len();
        for job in jobs {
            state.enqueue(job);
        }
        let started = Self::claim_lane(&mut state);
        let stats = state.stats();
        report(stats);
        Ok(Admission {
            started,
            admitted,
            stats,
        })
    }

    /// Releases the lane after a job reached a terminal state. Returns the
    /// counters after the release and, if one was waiting, the next job that
    /// now owns the lane. `report` is called under the lock for each of
    /// those snapshots.
    pub fn release(
        &self,
        mut report: impl FnMut(QueueStats),
    ) -> (QueueStats, Option<(Job, QueueStats)>) {
        let mut state = self.state.lock();
        state.decrement_active();
        let released = state.stats();
        report(released);
        let next = Self::claim_lane(&mut state).map(|job| {
            let stats = state.stats();
            report(stats);
            (job, stats)
        });
        (released, next)
    }

    /// Drops every pending job and frees the lane. Used at startup only.
    pub fn reset(&self) {
        *self.state.lock() = QueueState::default();
    }

    fn claim_lane(state: &mut QueueState) -> Option<Job> {
        let job = state.dequeue_next()?;
        state.increment_active();
        Some(job)
    }
}
