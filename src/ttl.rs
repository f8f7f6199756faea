//! TTL Engine: the three-state machine (Unmarked → Scheduled →
//! Expiring) for one finished Run, memoized entirely via annotations.

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};

use crate::annotations::{self, TTL_SCHEDULE_AT, TTL_SECONDS};
use crate::clock::Clock;
use crate::error::PrunerError;
use crate::metrics::Reporter;
use crate::policy::{Field, PolicyStore};
use crate::resource::{DeleteOutcome, Run, RunAdapter};
use tokio_util::sync::CancellationToken;

/// Result of one TTL Engine pass over a Run: a typed value carrying the
/// requeue delay instead of a thread sleep or a logged error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtlOutcome {
    /// No effective TTL (absent or `-1`): this Run is never scheduled.
    Ignored,
    /// `ttl-schedule-at` was just written; deletion is due at this time.
    Scheduled { due_at: DateTime<Utc> },
    /// Already scheduled, not yet due. The host should re-enqueue after `delay`.
    Requeue { delay: StdDuration },
    /// The Run was deleted (or already gone) on this pass.
    Deleted { reason: &'static str },
    /// Not completed, or nothing to do.
    Unchanged,
}

fn effective_ttl(
    policy: &PolicyStore,
    run: &Run,
    kind: crate::policy::RunKind,
) -> Result<Option<i64>, (PrunerError, bool)> {
    match annotations::read_i64(&run.annotations, TTL_SECONDS) {
        Ok(annotation) => Ok(policy.resolve(&run.namespace, kind, &run.name, Field::Ttl, annotation)),
        Err(err) => Err((err, true)),
    }
}

/// Run the TTL Engine once for `run`. `run` must already satisfy the
/// reconciler's completion fast-path; a non-completed Run is a no-op here.
pub async fn process<A: RunAdapter + ?Sized>(
    adapter: &A,
    policy: &PolicyStore,
    clock: &dyn Clock,
    reporter: &dyn Reporter,
    run: &Run,
    cancel: &CancellationToken,
) -> Result<TtlOutcome, PrunerError> {
    let Some(completed_at) = run.completed_at() else {
        return Ok(TtlOutcome::Unchanged);
    };
    let kind = adapter.kind();

    let scheduled_at = match annotations::read_time(&run.annotations, TTL_SCHEDULE_AT) {
        Ok(value) => value,
        Err(_) => {
            // Malformed schedule annotation: strip it and fall through to Unmarked.
            adapter
                .patch_annotations(&run.namespace, &run.name, &[TTL_SCHEDULE_AT], &BTreeMap::new(), cancel)
                .await?;
            reporter.resource_error(&run.namespace, kind, "validation_error");
            None
        }
    };

    match scheduled_at {
        None => {
            let ttl = match effective_ttl(policy, run, kind) {
                Ok(ttl) => ttl,
                Err((err, strip)) => {
                    if strip {
                        adapter
                            .patch_annotations(&run.namespace, &run.name, &[TTL_SECONDS], &BTreeMap::new(), cancel)
                            .await?;
                    }
                    reporter.resource_error(&run.namespace, kind, "validation_error");
                    return Err(err);
                }
            };

            let Some(ttl) = ttl.filter(|&v| v != -1) else {
                reporter.resource_processed(&run.namespace, kind, "ttl_ignored");
                return Ok(TtlOutcome::Ignored);
            };

            let due_at = completed_at + Duration::seconds(ttl);
            let mut additions = BTreeMap::new();
            additions.insert(TTL_SCHEDULE_AT.to_string(), due_at.to_rfc3339());
            adapter
                .patch_annotations(&run.namespace, &run.name, &[], &additions, cancel)
                .await?;
            reporter.resource_processed(&run.namespace, kind, "ttl_scheduled");
            Ok(TtlOutcome::Scheduled { due_at })
        }
        Some(due_at) => {
            let now = clock.now();
            if now < due_at {
                let delay = (due_at - now)
                    .to_std()
                    .unwrap_or(StdDuration::from_secs(0));
                return Ok(TtlOutcome::Requeue { delay });
            }

            match adapter.delete(&run.namespace, &run.name, cancel).await {
                Ok(outcome) => {
                    let reason = match outcome {
                        DeleteOutcome::Deleted => "ttl_expired",
                        DeleteOutcome::AlreadyGone => "already_gone",
                    };
                    reporter.resource_deleted(&run.namespace, kind, reason);
                    if let Some(created_at) = run.created_at {
                        if let Ok(age) = (completed_at - created_at).to_std() {
                            reporter.resource_age_at_deletion(&run.namespace, kind, age);
                        }
                    }
                    Ok(TtlOutcome::Deleted { reason })
                }
                Err(err) => {
                    // Retryable: stays Scheduled, the next event retries the delete.
                    // Not retryable: surfaced up for the host to report/log.
                    Err(err)
                }
            }
        }
    }
}
