//! Queue module: in-memory scheduling index and its async-shared lease source.

mod index;
mod shared;

pub use index::Queue;
pub use shared::SharedQueue;

use chrono::{DateTime, Utc};

use crate::domain::Job;

/// Pick the due candidate with the smallest `(effective due time, sequence)`.
///
/// Shared by every leasing path so they all order jobs the same way:
/// earliest due time first, ties broken by insertion sequence, never by
/// which state the job came from.
pub(crate) fn pick_due<'a, K>(
    candidates: impl IntoIterator<Item = (K, u64, &'a Job)>,
    at: DateTime<Utc>,
) -> Option<K> {
    candidates
        .into_iter()
        .filter_map(|(key, seq, job)| job.effective_due_at(at).map(|due| (due, seq, key)))
        .min_by_key(|(due, seq, _)| (*due, *seq))
        .map(|(_, _, key)| key)
}
