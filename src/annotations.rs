//! Constants and typed accessors for the pruner-managed annotations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::PrunerError;

pub const TTL_SECONDS: &str = "pruner.tekton.dev/ttlSecondsAfterFinished";
pub const SUCCESSFUL_HISTORY_LIMIT: &str = "pruner.tekton.dev/successfulHistoryLimit";
pub const FAILED_HISTORY_LIMIT: &str = "pruner.tekton.dev/failedHistoryLimit";
pub const TTL_SCHEDULE_AT: &str = "pruner.tekton.dev/ttl-schedule-at";
pub const HISTORY_CHECKED_AT: &str = "pruner.tekton.dev/history-checked-at";

/// Read an `i64` annotation, treating a missing key as `Ok(None)` and a
/// malformed value as `PrunerError::Validation`.
pub fn read_i64(
    annotations: &BTreeMap<String, String>,
    key: &'static str,
) -> Result<Option<i64>, PrunerError> {
    match annotations.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| PrunerError::Validation {
                annotation: key,
                raw: raw.clone(),
            }),
    }
}

/// Read an RFC3339 timestamp annotation, with the same missing/malformed
/// disposition as [`read_i64`].
pub fn read_time(
    annotations: &BTreeMap<String, String>,
    key: &'static str,
) -> Result<Option<DateTime<Utc>>, PrunerError> {
    match annotations.get(key) {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| PrunerError::Validation {
                annotation: key,
                raw: raw.clone(),
            }),
    }
}
