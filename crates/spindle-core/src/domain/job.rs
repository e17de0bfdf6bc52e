//! Job entity and its state machine.
//!
//! Every state change goes through a transition method that checks its
//! precondition. Fields are private; persisted records come back in through
//! `TryFrom<JobRecord>`, which re-validates them.
//!
//! Transitions never read a clock: callers pass `now`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::backoff::Backoff;
use super::ids::JobId;
use super::state::JobState;
use super::timestamp;
use crate::error::{MAX_ERROR_LEN, Result, SpindleError, truncate_message};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Creation parameters for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    pub max_retries: u32,
    pub backoff_base: u32,
    /// Not leasable before this instant.
    pub run_at: Option<DateTime<Utc>>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: Backoff::DEFAULT_BASE,
            run_at: None,
        }
    }
}

impl JobOptions {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn backoff_base(mut self, backoff_base: u32) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

/// The unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "JobRecord", into = "JobRecord")]
pub struct Job {
    id: JobId,
    command: String,
    state: JobState,
    attempts: u32,
    max_retries: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    run_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    backoff_base: u32,
    last_error: Option<String>,
}

/// Persisted form of a job (backend-agnostic field set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

fn default_backoff_base() -> u32 {
    Backoff::DEFAULT_BASE
}

impl Job {
    /// Create a new `pending` job with a generated id.
    pub fn create(command: impl Into<String>, options: JobOptions, now: DateTime<Utc>) -> Result<Self> {
        Self::create_with_id(JobId::generate(now), command, options, now)
    }

    pub fn create_with_id(
        id: JobId,
        command: impl Into<String>,
        options: JobOptions,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let command = command.into();
        if id.as_str().trim().is_empty() {
            return Err(SpindleError::Validation("id must not be empty".into()));
        }
        if command.trim().is_empty() {
            return Err(SpindleError::Validation("command must not be empty".into()));
        }
        Backoff::new(options.backoff_base)?;

        Ok(Self {
            id,
            command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: options.max_retries,
            created_at: now,
            updated_at: now,
            run_at: options.run_at,
            next_attempt_at: None,
            backoff_base: options.backoff_base,
            last_error: None,
        })
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn run_at(&self) -> Option<DateTime<Utc>> {
        self.run_at
    }

    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.next_attempt_at
    }

    pub fn backoff_base(&self) -> u32 {
        self.backoff_base
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn backoff(&self) -> Backoff {
        // validated on construction
        Backoff::new(self.backoff_base).unwrap_or_default()
    }

    /// `backoff_base ^ attempts` seconds.
    pub fn backoff_delay_seconds(&self, attempts: u32) -> u64 {
        self.backoff().delay_secs(attempts)
    }

    /// Take the lease: `pending | failed -> processing`.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.state.is_leasable() {
            return Err(self.illegal("mark processing"));
        }
        self.state = JobState::Processing;
        self.next_attempt_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// `processing -> completed`.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.state != JobState::Processing {
            return Err(self.illegal("mark completed"));
        }
        self.state = JobState::Completed;
        self.last_error = None;
        self.next_attempt_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// `processing -> failed | dead`. Returns the resulting state.
    ///
    /// The retry delay uses the post-increment attempt count, anchored at
    /// `now` (not `updated_at`).
    pub fn mark_failed(&mut self, error: impl AsRef<str>, now: DateTime<Utc>) -> Result<JobState> {
        if self.state != JobState::Processing {
            return Err(self.illegal("mark failed"));
        }
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(truncate_message(error.as_ref(), MAX_ERROR_LEN));
        self.updated_at = now;

        if self.attempts > self.max_retries {
            self.state = JobState::Dead;
            self.next_attempt_at = None;
        } else {
            self.state = JobState::Failed;
            self.next_attempt_at = Some(retry_at(now, self.backoff_delay_seconds(self.attempts)));
        }
        Ok(self.state)
    }

    /// `dead | failed -> pending`, zeroing attempts unless `keep_attempts`.
    pub fn reset_for_retry(&mut self, keep_attempts: bool, now: DateTime<Utc>) -> Result<()> {
        if !matches!(self.state, JobState::Dead | JobState::Failed) {
            return Err(self.illegal("reset for retry"));
        }
        self.state = JobState::Pending;
        self.last_error = None;
        self.next_attempt_at = None;
        if !keep_attempts {
            self.attempts = 0;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Give the job back without recording an attempt:
    /// `processing | failed -> pending`, attempts kept.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !matches!(self.state, JobState::Processing | JobState::Failed) {
            return Err(self.illegal("requeue"));
        }
        self.state = JobState::Pending;
        self.next_attempt_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// `attempts < max_retries`, and not dead or completed.
    pub fn is_retryable(&self) -> bool {
        self.attempts < self.max_retries && !self.state.is_terminal()
    }

    /// Whether a lease taken at `at` may pick this job.
    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Pending => self.run_at.is_none_or(|run_at| run_at <= at),
            JobState::Failed => {
                self.has_retry_budget() && self.next_attempt_at.is_none_or(|next| next <= at)
            }
            JobState::Processing | JobState::Completed | JobState::Dead => false,
        }
    }

    /// Ordering key among due jobs: `run_at` (or creation) for pending jobs,
    /// `next_attempt_at` (or `at`) for failed ones. `None` when not due.
    pub fn effective_due_at(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_due(at) {
            return None;
        }
        match self.state {
            JobState::Pending => Some(self.run_at.unwrap_or(self.created_at)),
            JobState::Failed => Some(self.next_attempt_at.unwrap_or(at)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_record(&self) -> JobRecord {
        JobRecord::from(self.clone())
    }

    /// A `failed` job only exists while `attempts <= max_retries`
    /// (`mark_failed` sends it to `dead` otherwise).
    fn has_retry_budget(&self) -> bool {
        self.attempts <= self.max_retries
    }

    fn illegal(&self, action: &'static str) -> SpindleError {
        SpindleError::IllegalTransition {
            id: self.id.clone(),
            from: self.state,
            action,
        }
    }
}

fn retry_at(now: DateTime<Utc>, delay_secs: u64) -> DateTime<Utc> {
    // 9999-12-31T23:59:59Z keeps the text form four-digit (and sortable).
    let far_future = DateTime::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC);
    i64::try_from(delay_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|delay| now.checked_add_signed(delay))
        .map_or(far_future, |at| at.min(far_future))
}

impl TryFrom<JobRecord> for Job {
    type Error = SpindleError;

    fn try_from(r: JobRecord) -> Result<Self> {
        if r.id.as_str().trim().is_empty() {
            return Err(SpindleError::Validation("id must not be empty".into()));
        }
        if r.command.trim().is_empty() {
            return Err(SpindleError::Validation(format!("{}: command must not be empty", r.id)));
        }
        Backoff::new(r.backoff_base)?;
        if r.next_attempt_at.is_some() && r.state != JobState::Failed {
            return Err(SpindleError::Validation(format!(
                "{}: next_attempt_at set while {}",
                r.id, r.state
            )));
        }
        Ok(Self {
            id: r.id,
            command: r.command,
            state: r.state,
            attempts: r.attempts,
            max_retries: r.max_retries,
            created_at: r.created_at,
            updated_at: r.updated_at,
            run_at: r.run_at,
            next_attempt_at: r.next_attempt_at,
            backoff_base: r.backoff_base,
            last_error: r.last_error,
        })
    }
}

impl From<Job> for JobRecord {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            command: job.command,
            state: job.state,
            attempts: job.attempts,
            max_retries: job.max_retries,
            created_at: job.created_at,
            updated_at: job.updated_at,
            run_at: job.run_at,
            next_attempt_at: job.next_attempt_at,
            backoff_base: job.backoff_base,
            last_error: job.last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn job(max_retries: u32, base: u32) -> Job {
        let options = JobOptions::default().max_retries(max_retries).backoff_base(base);
        Job::create_with_id(JobId::new("j1"), "echo hi", options, t0()).unwrap()
    }

    /// Drive a job into `state` through legal transitions only.
    fn job_in(state: JobState) -> Job {
        let mut j = job(1, 2);
        match state {
            JobState::Pending => {}
            JobState::Processing => j.mark_processing(t0()).unwrap(),
            JobState::Completed => {
                j.mark_processing(t0()).unwrap();
                j.mark_completed(t0()).unwrap();
            }
            JobState::Failed => {
                j.mark_processing(t0()).unwrap();
                j.mark_failed("boom", t0()).unwrap();
            }
            JobState::Dead => {
                j.mark_processing(t0()).unwrap();
                j.mark_failed("boom", t0()).unwrap();
                j.mark_processing(t0()).unwrap();
                j.mark_failed("boom", t0()).unwrap();
            }
        }
        assert_eq!(j.state(), state);
        j
    }

    #[test]
    fn create_starts_pending() {
        let j = job(3, 2);
        assert_eq!(j.state(), JobState::Pending);
        assert_eq!(j.attempts(), 0);
        assert_eq!(j.created_at(), j.updated_at());
        assert!(j.next_attempt_at().is_none());
        assert!(j.last_error().is_none());
    }

    #[test]
    fn create_generates_an_id() {
        let j = Job::create("true", JobOptions::default(), t0()).unwrap();
        assert!(j.id().as_str().starts_with("job-"));
        assert_eq!(j.max_retries(), 3);
        assert_eq!(j.backoff_base(), 2);
    }

    #[rstest]
    #[case::empty_command("", 2)]
    #[case::blank_command("   ", 2)]
    #[case::zero_base("echo", 0)]
    fn create_validates(#[case] command: &str, #[case] base: u32) {
        let options = JobOptions::default().backoff_base(base);
        let err = Job::create(command, options, t0()).unwrap_err();
        assert!(matches!(err, SpindleError::Validation(_)));
    }

    #[rstest]
    #[case::completed(JobState::Completed)]
    #[case::processing(JobState::Processing)]
    #[case::dead(JobState::Dead)]
    fn mark_processing_rejects(#[case] state: JobState) {
        let mut j = job_in(state);
        let err = j.mark_processing(t0()).unwrap_err();
        assert!(matches!(err, SpindleError::IllegalTransition { from, .. } if from == state));
        assert_eq!(j.state(), state);
    }

    #[rstest]
    #[case::pending(JobState::Pending)]
    #[case::completed(JobState::Completed)]
    #[case::failed(JobState::Failed)]
    #[case::dead(JobState::Dead)]
    fn finishing_requires_processing(#[case] state: JobState) {
        let mut j = job_in(state);
        assert!(j.mark_completed(t0()).is_err());
        assert!(j.mark_failed("x", t0()).is_err());
        assert_eq!(j.state(), state);
    }

    #[rstest]
    #[case::pending(JobState::Pending)]
    #[case::processing(JobState::Processing)]
    #[case::completed(JobState::Completed)]
    fn reset_for_retry_rejects(#[case] state: JobState) {
        let mut j = job_in(state);
        assert!(j.reset_for_retry(false, t0()).is_err());
    }

    #[test]
    fn completing_clears_error() {
        let mut j = job_in(JobState::Failed);
        j.mark_processing(t0()).unwrap();
        assert!(j.next_attempt_at().is_none());
        j.mark_completed(t0() + Duration::seconds(1)).unwrap();
        assert_eq!(j.state(), JobState::Completed);
        assert!(j.last_error().is_none());
        assert_eq!(j.updated_at(), t0() + Duration::seconds(1));
    }

    #[test]
    fn first_failure_waits_base_to_the_one() {
        let mut j = job(3, 2);
        j.mark_processing(t0()).unwrap();
        let state = j.mark_failed("boom", t0()).unwrap();
        assert_eq!(state, JobState::Failed);
        assert_eq!(j.attempts(), 1);
        assert_eq!(j.last_error(), Some("boom"));
        assert_eq!(j.next_attempt_at(), Some(t0() + Duration::seconds(2)));
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 2)]
    #[case(3, 2)]
    #[case(5, 3)]
    #[case(2, 1)]
    fn m_failed_states_then_dead(#[case] max_retries: u32, #[case] base: u32) {
        let mut j = job(max_retries, base);
        let mut now = t0();
        for n in 1..=max_retries {
            j.mark_processing(now).unwrap();
            assert_eq!(j.mark_failed("boom", now).unwrap(), JobState::Failed);
            assert_eq!(j.attempts(), n);
            let delay = Duration::seconds(i64::from(base).pow(n));
            assert_eq!(j.next_attempt_at(), Some(now + delay));
            now = now + delay;
            assert!(j.is_due(now));
        }
        j.mark_processing(now).unwrap();
        assert_eq!(j.mark_failed("boom", now).unwrap(), JobState::Dead);
        assert_eq!(j.attempts(), max_retries + 1);
        assert!(j.next_attempt_at().is_none());
        assert!(!j.is_due(now + Duration::days(365)));
    }

    #[test]
    fn reset_for_retry_zeroes_or_keeps_attempts() {
        let mut dead = job_in(JobState::Dead);
        dead.reset_for_retry(false, t0()).unwrap();
        assert_eq!(dead.state(), JobState::Pending);
        assert_eq!(dead.attempts(), 0);
        assert!(dead.last_error().is_none());

        let mut failed = job_in(JobState::Failed);
        failed.reset_for_retry(true, t0()).unwrap();
        assert_eq!(failed.state(), JobState::Pending);
        assert_eq!(failed.attempts(), 1);
        assert!(failed.next_attempt_at().is_none());
    }

    #[test]
    fn requeue_keeps_attempts() {
        let mut j = job_in(JobState::Failed);
        j.requeue(t0()).unwrap();
        assert_eq!(j.state(), JobState::Pending);
        assert_eq!(j.attempts(), 1);

        let mut leased = job_in(JobState::Processing);
        leased.requeue(t0()).unwrap();
        assert_eq!(leased.state(), JobState::Pending);

        assert!(job_in(JobState::Dead).requeue(t0()).is_err());
    }

    #[test]
    fn pending_due_respects_run_at() {
        let options = JobOptions::default().run_at(t0() + Duration::seconds(10));
        let j = Job::create_with_id(JobId::new("later"), "true", options, t0()).unwrap();
        assert!(!j.is_due(t0()));
        assert!(j.is_due(t0() + Duration::seconds(10)));
        assert_eq!(j.effective_due_at(t0()), None);
        assert_eq!(
            j.effective_due_at(t0() + Duration::seconds(11)),
            Some(t0() + Duration::seconds(10))
        );
        assert_eq!(job(1, 2).effective_due_at(t0()), Some(t0()));
    }

    #[test]
    fn failed_due_respects_next_attempt_at() {
        let j = job_in(JobState::Failed);
        assert!(!j.is_due(t0() + Duration::seconds(1)));
        assert!(j.is_due(t0() + Duration::seconds(2)));
    }

    #[rstest]
    #[case::processing(JobState::Processing)]
    #[case::completed(JobState::Completed)]
    #[case::dead(JobState::Dead)]
    fn never_due(#[case] state: JobState) {
        assert!(!job_in(state).is_due(t0() + Duration::days(1)));
    }

    #[test]
    fn retryable_is_strictly_below_max_retries() {
        let mut j = job(2, 2);
        assert!(j.is_retryable());
        j.mark_processing(t0()).unwrap();
        j.mark_failed("1", t0()).unwrap();
        assert!(j.is_retryable());
        j.mark_processing(t0()).unwrap();
        j.mark_failed("2", t0()).unwrap();
        assert_eq!(j.state(), JobState::Failed);
        assert!(!j.is_retryable());
        assert!(!job_in(JobState::Completed).is_retryable());
    }

    #[test]
    fn long_errors_are_truncated() {
        let mut j = job_in(JobState::Processing);
        j.mark_failed("x".repeat(2_000), t0()).unwrap();
        assert_eq!(j.last_error().unwrap().chars().count(), MAX_ERROR_LEN);
    }

    #[test]
    fn huge_delays_stay_representable() {
        let mut j = job(100, 10);
        for _ in 0..30 {
            j.mark_processing(t0()).unwrap();
            j.mark_failed("boom", t0()).unwrap();
        }
        let next = j.next_attempt_at().unwrap();
        assert_eq!(Job::from_json(&j.to_json().unwrap()).unwrap().next_attempt_at(), Some(next));
    }

    #[rstest]
    #[case::pending(JobState::Pending)]
    #[case::processing(JobState::Processing)]
    #[case::completed(JobState::Completed)]
    #[case::failed(JobState::Failed)]
    #[case::dead(JobState::Dead)]
    fn json_round_trip(#[case] state: JobState) {
        let j = job_in(state);
        let back = Job::from_json(&j.to_json().unwrap()).unwrap();
        assert_eq!(back, j);
    }

    #[test]
    fn json_round_trip_keeps_optional_fields() {
        let options = JobOptions::default().run_at(t0() + Duration::minutes(5));
        let j = Job::create_with_id(JobId::new("j"), "sleep 1", options, Utc::now()).unwrap();
        let back = Job::from_json(&j.to_json().unwrap()).unwrap();
        assert_eq!(back, j);
        assert!(back.run_at().is_some());
        assert!(back.last_error().is_none());
    }

    #[test]
    fn persisted_record_uses_snake_case_and_lowercase_state() {
        let value: serde_json::Value = serde_json::from_str(&job_in(JobState::Failed).to_json().unwrap()).unwrap();
        assert_eq!(value["state"], "failed");
        assert_eq!(value["max_retries"], 1);
        assert_eq!(value["next_attempt_at"], "2024-01-01T12:00:02.000000000Z");
        assert!(value["run_at"].is_null());
    }

    #[test]
    fn from_json_rejects_inconsistent_records() {
        let mut record = job_in(JobState::Failed).to_record();
        record.state = JobState::Dead;
        let json = serde_json::to_string(&record).unwrap();
        assert!(Job::from_json(&json).is_err());

        let mut record = job(1, 2).to_record();
        record.command = String::new();
        assert!(Job::try_from(record).is_err());
    }

    #[test]
    fn missing_backoff_base_defaults_to_two() {
        let json = r#"{"id":"a","command":"true","state":"pending","attempts":0,"max_retries":3,
            "created_at":"2024-01-01T12:00:00Z","updated_at":"2024-01-01T12:00:00Z"}"#;
        let j = Job::from_json(json).unwrap();
        assert_eq!(j.backoff_base(), 2);
        assert!(j.run_at().is_none());
    }
}
