//! Resource Adapter: a uniform view over PipelineRun/TaskRun plus the
//! two concrete `kube::Api`-backed implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use json_patch::{AddOperation, PatchOperation, RemoveOperation};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::crd::{PipelineRun, RunStatus, TaskRun};
use crate::error::{is_not_found, PrunerError};
use crate::policy::RunKind;

const PIPELINE_RUN_OWNER_KIND: &str = "PipelineRun";

/// Outcome of a delete call, distinguishing an actual deletion from a 404
/// treated as success so the reporter can tell the two apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyGone,
}

/// Adapter-level, kind-erased view of a PipelineRun or TaskRun.
#[derive(Debug, Clone)]
pub struct Run {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner_kinds: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
}

impl Run {
    fn succeeded_condition(&self) -> Option<&Condition> {
        self.status
            .conditions
            .as_ref()?
            .iter()
            .find(|c| c.type_ == "Succeeded")
    }

    /// Completed if completion time is set, or a terminal (non-Unknown)
    /// condition exists.
    pub fn is_completed(&self) -> bool {
        self.status.completion_time.is_some()
            || self
                .succeeded_condition()
                .is_some_and(|c| c.status != "Unknown")
    }

    pub fn is_successful(&self) -> bool {
        self.succeeded_condition().is_some_and(|c| c.status == "True")
    }

    /// Completion time, falling back to the succeeded condition's
    /// last-transition time when the status field itself is unset.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        if let Some(t) = &self.status.completion_time {
            return Some(t.0);
        }
        let condition = self.succeeded_condition()?;
        if condition.status != "Unknown" {
            Some(condition.last_transition_time.0)
        } else {
            None
        }
    }

    /// A TaskRun owned by a PipelineRun is pruned only through its owner's
    /// deletion, never directly.
    pub fn owned_by_pipeline_run(&self) -> bool {
        self.owner_kinds.iter().any(|k| k == PIPELINE_RUN_OWNER_KIND)
    }
}

fn owner_kinds(meta: &kube::core::ObjectMeta) -> Vec<String> {
    meta.owner_references
        .as_ref()
        .map(|refs| refs.iter().map(|r| r.kind.clone()).collect())
        .unwrap_or_default()
}

impl From<PipelineRun> for Run {
    fn from(pr: PipelineRun) -> Run {
        from_pipeline_run(pr)
    }
}

impl From<TaskRun> for Run {
    fn from(tr: TaskRun) -> Run {
        from_task_run(tr)
    }
}

fn from_pipeline_run(pr: PipelineRun) -> Run {
    let owner_kinds = owner_kinds(&pr.metadata);
    Run {
        namespace: pr.metadata.namespace.unwrap_or_default(),
        name: pr.metadata.name.unwrap_or_default(),
        labels: pr.metadata.labels.unwrap_or_default().into_iter().collect(),
        annotations: pr.metadata.annotations.unwrap_or_default().into_iter().collect(),
        owner_kinds,
        created_at: pr.metadata.creation_timestamp.map(|t| t.0),
        status: pr.status.unwrap_or_default(),
    }
}

fn from_task_run(tr: TaskRun) -> Run {
    let owner_kinds = owner_kinds(&tr.metadata);
    Run {
        namespace: tr.metadata.namespace.unwrap_or_default(),
        name: tr.metadata.name.unwrap_or_default(),
        labels: tr.metadata.labels.unwrap_or_default().into_iter().collect(),
        annotations: tr.metadata.annotations.unwrap_or_default().into_iter().collect(),
        owner_kinds,
        created_at: tr.metadata.creation_timestamp.map(|t| t.0),
        status: tr.status.unwrap_or_default(),
    }
}

/// Escape a literal annotation key for use as a JSON Pointer path segment.
/// `~` must escape before `/` per RFC 6901.
pub fn escape_json_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// One small capability interface per Run kind. Every call takes a
/// cancellation token: each is a suspension point against the cluster, and a
/// cancelled token aborts the in-flight call rather than waiting it out.
#[async_trait]
pub trait RunAdapter: Send + Sync {
    fn kind(&self) -> RunKind;

    fn family_label_key(&self) -> &'static str {
        self.kind().family_label_key()
    }

    async fn list(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Run>, PrunerError>;

    async fn get(&self, namespace: &str, name: &str, cancel: &CancellationToken) -> Result<Option<Run>, PrunerError>;

    async fn delete(&self, namespace: &str, name: &str, cancel: &CancellationToken) -> Result<DeleteOutcome, PrunerError>;

    /// Apply a JSON-Patch of annotation removals followed by additions.
    /// A 404 is treated as success.
    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        removals: &[&str],
        additions: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(), PrunerError>;
}

/// Race a cluster call against cancellation. A cancelled token wins
/// immediately and the in-flight call is dropped rather than awaited out.
async fn run_cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, kube::Error>>,
) -> Result<Result<T, kube::Error>, PrunerError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(PrunerError::Cancelled),
        result = fut => Ok(result),
    }
}

fn annotation_patch(removals: &[&str], additions: &BTreeMap<String, String>) -> json_patch::Patch {
    let mut ops = Vec::with_capacity(removals.len() + additions.len());
    for key in removals {
        ops.push(PatchOperation::Remove(RemoveOperation {
            path: format!("/metadata/annotations/{}", escape_json_pointer(key)).parse().expect("valid pointer"),
        }));
    }
    for (key, value) in additions {
        ops.push(PatchOperation::Add(AddOperation {
            path: format!("/metadata/annotations/{}", escape_json_pointer(key)).parse().expect("valid pointer"),
            value: serde_json::Value::String(value.clone()),
        }));
    }
    json_patch::Patch(ops)
}

pub struct PipelineRunAdapter {
    client: Client,
}

impl PipelineRunAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<PipelineRun> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl RunAdapter for PipelineRunAdapter {
    fn kind(&self) -> RunKind {
        RunKind::PipelineRun
    }

    async fn list(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Run>, PrunerError> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = run_cancellable(cancel, self.api(namespace).list(&params))
            .await?
            .map_err(PrunerError::from_api_error)?;
        Ok(list.items.into_iter().map(from_pipeline_run).collect())
    }

    async fn get(&self, namespace: &str, name: &str, cancel: &CancellationToken) -> Result<Option<Run>, PrunerError> {
        match run_cancellable(cancel, self.api(namespace).get_opt(name)).await? {
            Ok(opt) => Ok(opt.map(from_pipeline_run)),
            Err(err) => Err(PrunerError::from_api_error(err)),
        }
    }

    async fn delete(&self, namespace: &str, name: &str, cancel: &CancellationToken) -> Result<DeleteOutcome, PrunerError> {
        match run_cancellable(cancel, self.api(namespace).delete(name, &DeleteParams::default())).await? {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(err) if is_not_found(&err) => Ok(DeleteOutcome::AlreadyGone),
            Err(err) => Err(PrunerError::from_api_error(err)),
        }
    }

    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        removals: &[&str],
        additions: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(), PrunerError> {
        let patch = annotation_patch(removals, additions);
        match run_cancellable(cancel, self.api(namespace).patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))).await? {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(PrunerError::from_api_error(err)),
        }
    }
}

pub struct TaskRunAdapter {
    client: Client,
}

impl TaskRunAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<TaskRun> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl RunAdapter for TaskRunAdapter {
    fn kind(&self) -> RunKind {
        RunKind::TaskRun
    }

    async fn list(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Run>, PrunerError> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = run_cancellable(cancel, self.api(namespace).list(&params))
            .await?
            .map_err(PrunerError::from_api_error)?;
        Ok(list.items.into_iter().map(from_task_run).collect())
    }

    async fn get(&self, namespace: &str, name: &str, cancel: &CancellationToken) -> Result<Option<Run>, PrunerError> {
        match run_cancellable(cancel, self.api(namespace).get_opt(name)).await? {
            Ok(opt) => Ok(opt.map(from_task_run)),
            Err(err) => Err(PrunerError::from_api_error(err)),
        }
    }

    async fn delete(&self, namespace: &str, name: &str, cancel: &CancellationToken) -> Result<DeleteOutcome, PrunerError> {
        match run_cancellable(cancel, self.api(namespace).delete(name, &DeleteParams::default())).await? {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(err) if is_not_found(&err) => Ok(DeleteOutcome::AlreadyGone),
            Err(err) => Err(PrunerError::from_api_error(err)),
        }
    }

    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        removals: &[&str],
        additions: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(), PrunerError> {
        let patch = annotation_patch(removals, additions);
        match run_cancellable(cancel, self.api(namespace).patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))).await? {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(PrunerError::from_api_error(err)),
        }
    }
}
