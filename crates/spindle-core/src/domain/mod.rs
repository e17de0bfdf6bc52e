//! Domain model: job entity, state machine, identifiers, backoff.

pub mod backoff;
pub mod ids;
pub mod job;
pub mod state;
pub mod timestamp;

pub use backoff::Backoff;
pub use ids::JobId;
pub use job::{DEFAULT_MAX_RETRIES, Job, JobOptions, JobRecord};
pub use state::JobState;
