//! In-memory scheduling index.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::pick_due;
use crate::domain::{Job, JobId, JobState};
use crate::error::{Result, SpindleError};
use crate::observability::QueueCounts;

/// In-memory job index.
///
/// Design:
/// - `jobs` is the single source of truth for job data.
/// - `states` / `by_state` mirror each job's state for O(1) membership.
/// - `sequence` records insertion order; it breaks due-time ties.
/// - All state changes go through the job's own transition methods.
#[derive(Debug, Default)]
pub struct Queue {
    jobs: HashMap<JobId, Job>,
    states: HashMap<JobId, JobState>,
    by_state: HashMap<JobState, HashSet<JobId>>,
    sequence: HashMap<JobId, u64>,
    next_seq: u64,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new `pending` job.
    pub fn enqueue(&mut self, job: Job) -> Result<()> {
        if self.jobs.contains_key(job.id()) {
            return Err(SpindleError::DuplicateJob(job.id().clone()));
        }
        if job.state() != JobState::Pending {
            return Err(SpindleError::IllegalTransition {
                id: job.id().clone(),
                from: job.state(),
                action: "enqueue",
            });
        }
        let id = job.id().clone();
        self.sequence.insert(id.clone(), self.next_seq);
        self.next_seq += 1;
        self.index(&id, JobState::Pending);
        self.jobs.insert(id, job);
        Ok(())
    }

    /// Lease the due job with the smallest `(effective due time, insertion
    /// order)` and return a copy of it in `processing`.
    ///
    /// Full scan over pending + failed; fine for a local, bounded queue.
    pub fn dequeue(&mut self, at: DateTime<Utc>) -> Result<Option<Job>> {
        let candidates = [JobState::Pending, JobState::Failed]
            .into_iter()
            .filter_map(|state| self.by_state.get(&state))
            .flatten()
            .filter_map(|id| Some((id, *self.sequence.get(id)?, self.jobs.get(id)?)));

        let Some(id) = pick_due(candidates, at).cloned() else {
            return Ok(None);
        };
        self.transition(&id, |job| job.mark_processing(at)).map(Some)
    }

    pub fn complete(&mut self, id: &JobId, now: DateTime<Utc>) -> Result<Job> {
        self.require_processing(id, "complete")?;
        self.transition(id, |job| job.mark_completed(now))
    }

    /// Record a failure; the job ends up `failed` or `dead`.
    pub fn fail(&mut self, id: &JobId, error: &str, now: DateTime<Utc>) -> Result<Job> {
        self.require_processing(id, "fail")?;
        self.transition(id, |job| job.mark_failed(error, now).map(|_| ()))
    }

    pub fn requeue(&mut self, id: &JobId, now: DateTime<Utc>) -> Result<Job> {
        self.transition(id, |job| job.requeue(now))
    }

    pub fn reset_for_retry(&mut self, id: &JobId, keep_attempts: bool, now: DateTime<Utc>) -> Result<Job> {
        self.transition(id, |job| job.reset_for_retry(keep_attempts, now))
    }

    /// Replace the stored job, repairing the state index when the incoming
    /// copy moved to another state.
    pub fn update_job(&mut self, job: Job) -> Result<()> {
        let id = job.id().clone();
        let Some(slot) = self.jobs.get_mut(&id) else {
            return Err(SpindleError::not_found(&id));
        };
        let state = job.state();
        *slot = job;
        if self.states.get(&id) != Some(&state) {
            self.index(&id, state);
        }
        Ok(())
    }

    /// Drop a job from the index entirely (DLQ move).
    pub fn remove(&mut self, id: &JobId) -> Result<Job> {
        let job = self.jobs.remove(id).ok_or_else(|| SpindleError::not_found(id))?;
        if let Some(state) = self.states.remove(id)
            && let Some(ids) = self.by_state.get_mut(&state)
        {
            ids.remove(id);
        }
        self.sequence.remove(id);
        Ok(job)
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn state_of(&self, id: &JobId) -> Option<JobState> {
        self.states.get(id).copied()
    }

    /// Jobs in insertion order, optionally filtered by state.
    pub fn list(&self, state: Option<JobState>) -> Vec<Job> {
        let mut jobs: Vec<(u64, &Job)> = self
            .jobs
            .iter()
            .filter(|(id, _)| state.is_none_or(|s| self.states.get(*id) == Some(&s)))
            .map(|(id, job)| (self.sequence.get(id).copied().unwrap_or(u64::MAX), job))
            .collect();
        jobs.sort_by_key(|(seq, _)| *seq);
        jobs.into_iter().map(|(_, job)| job.clone()).collect()
    }

    pub fn size(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for (state, ids) in &self.by_state {
            counts.add(*state, ids.len());
        }
        counts
    }

    fn require_processing(&self, id: &JobId, action: &'static str) -> Result<()> {
        match self.states.get(id) {
            None => Err(SpindleError::not_found(id)),
            Some(JobState::Processing) => Ok(()),
            Some(&from) => Err(SpindleError::IllegalTransition {
                id: id.clone(),
                from,
                action,
            }),
        }
    }

    /// Apply a transition to the stored job and keep the index in step.
    fn transition(&mut self, id: &JobId, apply: impl FnOnce(&mut Job) -> Result<()>) -> Result<Job> {
        let job = self.jobs.get_mut(id).ok_or_else(|| SpindleError::not_found(id))?;
        apply(job)?;
        let job = job.clone();
        self.index(id, job.state());
        Ok(job)
    }

    fn index(&mut self, id: &JobId, state: JobState) {
        if let Some(old) = self.states.insert(id.clone(), state)
            && let Some(ids) = self.by_state.get_mut(&old)
        {
            ids.remove(id);
        }
        self.by_state.entry(state).or_default().insert(id.clone());
    }
}
