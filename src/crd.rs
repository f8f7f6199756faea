use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= RUN STATUS ============================= */

/// Status fields shared by PipelineRun and TaskRun that the pruner cares about.
///
/// This is a minimal, from-scratch view of Tekton's actual status shape —
/// not a vendored client — sufficient for completion-time and condition checks.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

/* ============================= PIPELINERUN ============================= */

/// A completed or in-flight Tekton PipelineRun.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "tekton.dev",
    version = "v1",
    kind = "PipelineRun",
    plural = "pipelineruns",
    status = "RunStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_ref: Option<PipelineRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRef {
    pub name: String,
}

/* ============================= TASKRUN ============================= */

/// A completed or in-flight Tekton TaskRun.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "tekton.dev",
    version = "v1",
    kind = "TaskRun",
    plural = "taskruns",
    status = "RunStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<TaskRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub name: String,
}

/* ============================= NAMESPACE OVERRIDE CRD ============================= */

/// Per-resource override entry, as it appears under `namespaces.<ns>.pipelineRuns[]`
/// or `namespaces.<ns>.taskRuns[]` in the configuration document, and under
/// `spec.pipelines[]`/`spec.tasks[]` on a `PrunerConfig`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePolicyEntry {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforced_config_level: Option<EnforcedConfigLevel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_history_limit: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_history_limit: Option<i64>,
}

/// A cap on which precedence tier may override a resolved value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EnforcedConfigLevel {
    Global,
    Namespace,
    #[default]
    Resource,
}

/// PrunerConfig mirrors one `namespaces[<ns>]` entry of the configuration document
/// as a namespaced custom resource, using the `pipelines:`/`tasks:` aliases.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "pruner.tekton.dev",
    version = "v1alpha1",
    kind = "PrunerConfig",
    plural = "prunerconfigs",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PrunerConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforced_config_level: Option<EnforcedConfigLevel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_history_limit: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_history_limit: Option<i64>,

    #[serde(rename = "pipelines", default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline_runs: Vec<ResourcePolicyEntry>,

    #[serde(rename = "tasks", default, skip_serializing_if = "Vec::is_empty")]
    pub task_runs: Vec<ResourcePolicyEntry>,
}

/* ============================= TESTS ============================= */
