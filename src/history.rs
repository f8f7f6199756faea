//! History Limiter: rank completed siblings within a family and delete
//! the overflow.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::annotations::{FAILED_HISTORY_LIMIT, HISTORY_CHECKED_AT, SUCCESSFUL_HISTORY_LIMIT};
use crate::clock::Clock;
use crate::error::PrunerError;
use crate::metrics::Reporter;
use crate::policy::{Field, PolicyStore};
use crate::resource::{DeleteOutcome, Run, RunAdapter};
use tokio_util::sync::CancellationToken;

/// Outcome of one History Limiter pass, reported back to the caller for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryReport {
    pub successful_deleted: usize,
    pub failed_deleted: usize,
}

fn sort_key(run: &Run) -> (std::cmp::Reverse<DateTime<Utc>>, &str) {
    (std::cmp::Reverse(run.completed_at().unwrap_or_default()), run.name.as_str())
}

fn overflow_of<'a>(mut siblings: Vec<&'a Run>, limit: i64) -> Vec<&'a Run> {
    siblings.sort_by_key(sort_key);
    let keep = limit.max(0) as usize;
    if siblings.len() > keep {
        siblings.split_off(keep)
    } else {
        Vec::new()
    }
}

/// Enforce retention for `run`'s family. `run` must already satisfy
/// the reconciler's completion and non-owned fast-paths.
pub async fn process<A: RunAdapter + ?Sized>(
    adapter: &A,
    policy: &PolicyStore,
    clock: &dyn Clock,
    reporter: &dyn Reporter,
    run: &Run,
    cancel: &CancellationToken,
) -> Result<HistoryReport, PrunerError> {
    if run.owned_by_pipeline_run() {
        return Ok(HistoryReport::default());
    }
    let kind = adapter.kind();
    let family_key = adapter.family_label_key();
    let Some(family_value) = run.labels.get(family_key) else {
        return Ok(HistoryReport::default());
    };

    let successful_limit = policy.resolve(
        &run.namespace,
        kind,
        &run.name,
        Field::SuccessfulHistoryLimit,
        crate::annotations::read_i64(&run.annotations, SUCCESSFUL_HISTORY_LIMIT)?,
    );
    let failed_limit = policy.resolve(
        &run.namespace,
        kind,
        &run.name,
        Field::FailedHistoryLimit,
        crate::annotations::read_i64(&run.annotations, FAILED_HISTORY_LIMIT)?,
    );

    if successful_limit == Some(-1) && failed_limit == Some(-1) {
        return Ok(HistoryReport::default());
    }

    let selector = format!("{family_key}={family_value}");
    let siblings = adapter.list(&run.namespace, Some(&selector), cancel).await?;
    let eligible: Vec<&Run> = siblings
        .iter()
        .filter(|r| r.is_completed() && !r.owned_by_pipeline_run())
        .collect();

    let mut successful_deleted = 0usize;
    let mut failed_deleted = 0usize;
    let mut deleted_names = Vec::new();

    if let Some(limit) = successful_limit.filter(|&v| v != -1) {
        let successful: Vec<&Run> = eligible.iter().filter(|r| r.is_successful()).copied().collect();
        for victim in overflow_of(successful, limit) {
            let outcome = adapter.delete(&victim.namespace, &victim.name, cancel).await?;
            let reason = if outcome == DeleteOutcome::Deleted { "history_overflow" } else { "already_gone" };
            reporter.resource_deleted(&run.namespace, kind, reason);
            successful_deleted += 1;
            deleted_names.push(victim.name.clone());
        }
    }

    if let Some(limit) = failed_limit.filter(|&v| v != -1) {
        let failed: Vec<&Run> = eligible.iter().filter(|r| !r.is_successful()).copied().collect();
        for victim in overflow_of(failed, limit) {
            let outcome = adapter.delete(&victim.namespace, &victim.name, cancel).await?;
            let reason = if outcome == DeleteOutcome::Deleted { "history_overflow" } else { "already_gone" };
            reporter.resource_deleted(&run.namespace, kind, reason);
            failed_deleted += 1;
            deleted_names.push(victim.name.clone());
        }
    }

    if !deleted_names.contains(&run.name) {
        let mut additions = BTreeMap::new();
        additions.insert(HISTORY_CHECKED_AT.to_string(), clock.now().to_rfc3339());
        adapter
            .patch_annotations(&run.namespace, &run.name, &[], &additions, cancel)
            .await?;
    }

    Ok(HistoryReport { successful_deleted, failed_deleted })
}
