//! Periodic Sweeper: the config-change-triggered, worker-pooled pass
//! over every watched namespace.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};
use kube::Client;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::annotations::HISTORY_CHECKED_AT;
use crate::clock::Clock;
use crate::error::PrunerError;
use crate::metrics::Reporter;
use crate::policy::PolicyStore;
use crate::resource::RunAdapter;
use crate::{history, ttl};

const EXCLUDED_NAMESPACE_PREFIXES: &[&str] = &["kube", "openshift", "tekton"];

fn is_swept(namespace: &str) -> bool {
    !EXCLUDED_NAMESPACE_PREFIXES.iter().any(|prefix| namespace.starts_with(prefix))
}

/// Summary of one completed sweep, for logging at the call site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub namespaces_swept: usize,
    pub coalesced: bool,
}

/// Drives Policy Store reload + namespace fan-out. One instance is
/// shared for the process lifetime; `trigger` is called by the config-map
/// watcher callback.
pub struct Sweeper {
    client: Client,
    pipeline_adapter: Arc<dyn RunAdapter>,
    task_adapter: Arc<dyn RunAdapter>,
    policy: Arc<PolicyStore>,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn Reporter>,
    running: AsyncMutex<()>,
    pending: AtomicBool,
    latest_yaml: AsyncMutex<String>,
    cancel: CancellationToken,
}

impl Sweeper {
    pub fn new(
        client: Client,
        pipeline_adapter: Arc<dyn RunAdapter>,
        task_adapter: Arc<dyn RunAdapter>,
        policy: Arc<PolicyStore>,
        clock: Arc<dyn Clock>,
        reporter: Arc<dyn Reporter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            pipeline_adapter,
            task_adapter,
            policy,
            clock,
            reporter,
            running: AsyncMutex::new(()),
            pending: AtomicBool::new(false),
            latest_yaml: AsyncMutex::new(String::new()),
            cancel,
        }
    }

    /// Reload the Policy Store from `yaml` and sweep every watched namespace.
    /// A trigger arriving while a sweep is in progress is coalesced into a
    /// single follow-up run against the most recently arrived document,
    /// rather than running concurrently or replaying the stale one.
    pub async fn trigger(&self, yaml: &str) -> Result<SweepReport, PrunerError> {
        *self.latest_yaml.lock().await = yaml.to_string();
        match self.running.try_lock() {
            Ok(_guard) => {
                let mut report = self.run_once(yaml).await?;
                while self.pending.swap(false, Ordering::SeqCst) {
                    let yaml = self.latest_yaml.lock().await.clone();
                    report = self.run_once(&yaml).await?;
                }
                Ok(report)
            }
            Err(_) => {
                self.pending.store(true, Ordering::SeqCst);
                Ok(SweepReport { namespaces_swept: 0, coalesced: true })
            }
        }
    }

    async fn run_once(&self, yaml: &str) -> Result<SweepReport, PrunerError> {
        let start = Instant::now();
        match self.policy.load(yaml, self.clock.as_ref()) {
            Ok(()) => self.reporter.configuration_reload("global_config"),
            Err(err) => {
                self.reporter.configuration_error("global_config");
                return Err(err);
            }
        }
        let loaded_at = self.policy.loaded_at();

        let namespaces = self.list_namespaces().await?;
        let worker_count = self.policy.worker_count().max(1);

        stream::iter(namespaces.clone())
            .for_each_concurrent(worker_count, |namespace| {
                let pipeline_adapter = Arc::clone(&self.pipeline_adapter);
                let task_adapter = Arc::clone(&self.task_adapter);
                let policy = Arc::clone(&self.policy);
                let clock = Arc::clone(&self.clock);
                let reporter = Arc::clone(&self.reporter);
                let cancel = self.cancel.clone();
                async move {
                    sweep_namespace(&namespace, pipeline_adapter.as_ref(), &policy, clock.as_ref(), reporter.as_ref(), loaded_at, &cancel).await;
                    sweep_namespace(&namespace, task_adapter.as_ref(), &policy, clock.as_ref(), reporter.as_ref(), loaded_at, &cancel).await;
                }
            })
            .await;

        self.reporter.garbage_collection_duration(start.elapsed(), namespaces.len());
        Ok(SweepReport { namespaces_swept: namespaces.len(), coalesced: false })
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, PrunerError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = tokio::select! {
            _ = self.cancel.cancelled() => return Err(PrunerError::Cancelled),
            result = api.list(&ListParams::default()) => result,
        }
        .map_err(PrunerError::from_api_error)?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .filter(|name| is_swept(name))
            .collect())
    }
}

async fn sweep_namespace(
    namespace: &str,
    adapter: &dyn RunAdapter,
    policy: &PolicyStore,
    clock: &dyn Clock,
    reporter: &dyn Reporter,
    loaded_at: chrono::DateTime<chrono::Utc>,
    cancel: &CancellationToken,
) {
    let runs = match adapter.list(namespace, None, cancel).await {
        Ok(runs) => runs,
        Err(PrunerError::Cancelled) => return,
        Err(err) => {
            reporter.resource_error(namespace, adapter.kind(), err.reason());
            warn!(namespace, kind = adapter.kind().as_str(), error = %err, "sweep: failed to list Runs");
            return;
        }
    };
    reporter.active_resources(namespace, adapter.kind(), runs.len() as i64);

    for run in runs.into_iter().filter(|r| r.is_completed()) {
        if cancel.is_cancelled() {
            return;
        }
        if let Ok(Some(checked_at)) = crate::annotations::read_time(&run.annotations, HISTORY_CHECKED_AT) {
            if checked_at < loaded_at {
                match adapter
                    .patch_annotations(&run.namespace, &run.name, &[HISTORY_CHECKED_AT], &Default::default(), cancel)
                    .await
                {
                    Ok(()) => {}
                    Err(PrunerError::Cancelled) => return,
                    Err(err) => {
                        reporter.resource_error(namespace, adapter.kind(), err.reason());
                        continue;
                    }
                }
            }
        }

        match history::process(adapter, policy, clock, reporter, &run, cancel).await {
            Ok(_) => {}
            Err(PrunerError::Cancelled) => return,
            Err(err) => {
                reporter.resource_error(namespace, adapter.kind(), err.reason());
                warn!(namespace, name = run.name.as_str(), error = %err, "sweep: history limiter failed");
                continue;
            }
        }
        if let Err(err) = ttl::process(adapter, policy, clock, reporter, &run, cancel).await {
            match err {
                PrunerError::Cancelled => return,
                _ if !err.is_retryable() => {
                    reporter.resource_error(namespace, adapter.kind(), err.reason());
                    warn!(namespace, name = run.name.as_str(), error = %err, "sweep: ttl engine failed");
                }
                _ => {}
            }
        }
    }
}
