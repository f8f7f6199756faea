//! Event Reconciler: the per-event entry point the host's informer
//! callback invokes for one PipelineRun or TaskRun.

use std::panic::AssertUnwindSafe;
use std::time::{Duration as StdDuration, Instant};

use futures::FutureExt;

use crate::annotations::TTL_SECONDS;
use crate::clock::Clock;
use crate::error::PrunerError;
use crate::history::{self, HistoryReport};
use crate::metrics::Reporter;
use crate::policy::PolicyStore;
use crate::resource::{Run, RunAdapter};
use crate::ttl::{self, TtlOutcome};
use tokio_util::sync::CancellationToken;

/// What the reconciler decided to do with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// One of the fast-path exits fired; nothing was evaluated.
    Skipped { reason: &'static str },
    /// History then TTL both ran; `ttl` carries any pending requeue.
    Processed { history: HistoryReport, ttl: TtlOutcome },
}

/// Run History Limiter then TTL Engine for one event, in that order, within
/// one namespace-family. A panic anywhere inside is caught at this boundary
/// and surfaced as `PrunerError::Panic` rather than taking down the caller.
pub async fn reconcile_run<A: RunAdapter + ?Sized>(
    adapter: &A,
    policy: &PolicyStore,
    clock: &dyn Clock,
    reporter: &dyn Reporter,
    run: &Run,
    cancel: &CancellationToken,
) -> Result<ReconcileOutcome, PrunerError> {
    let kind = adapter.kind();
    match AssertUnwindSafe(reconcile_run_inner(adapter, policy, clock, reporter, run, cancel))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            reporter.resource_processed(&run.namespace, kind, "panic");
            Err(PrunerError::Panic(message))
        }
    }
}

async fn reconcile_run_inner<A: RunAdapter + ?Sized>(
    adapter: &A,
    policy: &PolicyStore,
    clock: &dyn Clock,
    reporter: &dyn Reporter,
    run: &Run,
    cancel: &CancellationToken,
) -> Result<ReconcileOutcome, PrunerError> {
    let kind = adapter.kind();
    let start = Instant::now();

    if run.labels.is_empty() && !run.annotations.contains_key(TTL_SECONDS) {
        reporter.resource_processed(&run.namespace, kind, "skipped_unmaterialized");
        return Ok(ReconcileOutcome::Skipped { reason: "policy_not_materialized" });
    }
    if run.owned_by_pipeline_run() {
        reporter.resource_processed(&run.namespace, kind, "skipped_owned");
        return Ok(ReconcileOutcome::Skipped { reason: "owned_by_pipeline_run" });
    }
    if !run.is_completed() {
        reporter.resource_processed(&run.namespace, kind, "skipped_incomplete");
        return Ok(ReconcileOutcome::Skipped { reason: "not_completed" });
    }

    let history_start = Instant::now();
    let history_report = history::process(adapter, policy, clock, reporter, run, cancel).await?;
    reporter.history_processing_duration(&run.namespace, kind, history_start.elapsed());

    let ttl_start = Instant::now();
    let ttl_outcome = ttl::process(adapter, policy, clock, reporter, run, cancel).await?;
    reporter.ttl_processing_duration(&run.namespace, kind, ttl_start.elapsed());

    reporter.resource_processed(&run.namespace, kind, "reconciled");
    reporter.reconciliation_duration(&run.namespace, kind, start.elapsed());

    Ok(ReconcileOutcome::Processed { history: history_report, ttl: ttl_outcome })
}

/// Best-effort extraction of a panic payload's message; `panic!` with a
/// `&str` or `String` covers the overwhelming majority of real panics.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The delay the host should re-enqueue after, if any. TTL Engine requeue
/// signals are surfaced this way rather than as errors.
pub fn requeue_delay(outcome: &ReconcileOutcome) -> Option<StdDuration> {
    match outcome {
        ReconcileOutcome::Processed { ttl: TtlOutcome::Requeue { delay }, .. } => Some(*delay),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::policy::RunKind;
    use crate::resource::DeleteOutcome;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct FakeAdapter;

    #[async_trait]
    impl RunAdapter for FakeAdapter {
        fn kind(&self) -> RunKind {
            RunKind::TaskRun
        }
        async fn list(
            &self,
            _namespace: &str,
            _label_selector: Option<&str>,
            _cancel: &CancellationToken,
        ) -> Result<Vec<Run>, PrunerError> {
            Ok(vec![])
        }
        async fn get(&self, _namespace: &str, _name: &str, _cancel: &CancellationToken) -> Result<Option<Run>, PrunerError> {
            Ok(None)
        }
        async fn delete(&self, _namespace: &str, _name: &str, _cancel: &CancellationToken) -> Result<DeleteOutcome, PrunerError> {
            Ok(DeleteOutcome::Deleted)
        }
        async fn patch_annotations(
            &self,
            _namespace: &str,
            _name: &str,
            _removals: &[&str],
            _additions: &BTreeMap<String, String>,
            _cancel: &CancellationToken,
        ) -> Result<(), PrunerError> {
            Ok(())
        }
    }

    fn base_run() -> Run {
        Run {
            namespace: "ns-1".to_string(),
            name: "tr-a".to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            owner_kinds: vec![],
            created_at: None,
            status: crate::crd::RunStatus::default(),
        }
    }

    #[tokio::test]
    async fn test_skips_when_policy_not_materialized() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let policy = PolicyStore::new(&clock);
        let adapter = FakeAdapter;
        let reporter = crate::metrics::NoopReporter;
        let run = base_run();

        let outcome = reconcile_run(&adapter, &policy, &clock, &reporter, &run, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Skipped { reason: "policy_not_materialized" });
    }

    #[tokio::test]
    async fn test_skips_owned_task_run() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let policy = PolicyStore::new(&clock);
        let adapter = FakeAdapter;
        let reporter = crate::metrics::NoopReporter;
        let mut run = base_run();
        run.labels.insert("tekton.dev/task".to_string(), "build".to_string());
        run.owner_kinds = vec!["PipelineRun".to_string()];

        let outcome = reconcile_run(&adapter, &policy, &clock, &reporter, &run, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Skipped { reason: "owned_by_pipeline_run" });
    }

    #[tokio::test]
    async fn test_skips_incomplete_run() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let policy = PolicyStore::new(&clock);
        let adapter = FakeAdapter;
        let reporter = crate::metrics::NoopReporter;
        let mut run = base_run();
        run.labels.insert("tekton.dev/task".to_string(), "build".to_string());

        let outcome = reconcile_run(&adapter, &policy, &clock, &reporter, &run, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Skipped { reason: "not_completed" });
    }

    struct PanickingAdapter;

    #[async_trait]
    impl RunAdapter for PanickingAdapter {
        fn kind(&self) -> RunKind {
            RunKind::TaskRun
        }
        async fn list(&self, _namespace: &str, _label_selector: Option<&str>, _cancel: &CancellationToken) -> Result<Vec<Run>, PrunerError> {
            panic!("adapter exploded");
        }
        async fn get(&self, _namespace: &str, _name: &str, _cancel: &CancellationToken) -> Result<Option<Run>, PrunerError> {
            Ok(None)
        }
        async fn delete(&self, _namespace: &str, _name: &str, _cancel: &CancellationToken) -> Result<DeleteOutcome, PrunerError> {
            Ok(DeleteOutcome::Deleted)
        }
        async fn patch_annotations(
            &self,
            _namespace: &str,
            _name: &str,
            _removals: &[&str],
            _additions: &BTreeMap<String, String>,
            _cancel: &CancellationToken,
        ) -> Result<(), PrunerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panic_in_inner_logic_is_caught_as_panic_error() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let policy = PolicyStore::new(&clock);
        let adapter = PanickingAdapter;
        let reporter = crate::metrics::NoopReporter;
        let mut run = base_run();
        run.labels.insert("tekton.dev/task".to_string(), "build".to_string());
        run.status.completion_time = Some(Time(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));

        let result = reconcile_run(&adapter, &policy, &clock, &reporter, &run, &CancellationToken::new()).await;
        match result {
            Err(PrunerError::Panic(message)) => assert!(message.contains("adapter exploded")),
            other => panic!("expected Panic error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_processes_completed_run_and_exposes_requeue_delay() {
        let completed = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = FixedClock::new(completed + chrono::Duration::seconds(30));
        let policy = PolicyStore::new(&clock);
        policy.load("ttlSecondsAfterFinished: 90\n", &clock).unwrap();
        let adapter = FakeAdapter;
        let reporter = crate::metrics::NoopReporter;
        let mut run = base_run();
        run.labels.insert("tekton.dev/task".to_string(), "build".to_string());
        run.status.completion_time = Some(Time(completed));

        let outcome = reconcile_run(&adapter, &policy, &clock, &reporter, &run, &CancellationToken::new()).await.unwrap();
        match &outcome {
            ReconcileOutcome::Processed { ttl: TtlOutcome::Scheduled { .. }, .. } => {}
            other => panic!("expected Processed/Scheduled, got {other:?}"),
        }
        assert_eq!(requeue_delay(&outcome), None);
    }
}
