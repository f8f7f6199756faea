//! Policy Store: the layered configuration-document + per-namespace
//! override lookup behind a single `RwLock`.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::clock::Clock;
use crate::crd::{EnforcedConfigLevel, PrunerConfigSpec, ResourcePolicyEntry};
use crate::error::PrunerError;

/// Distinguishes PipelineRun from TaskRun wherever policy lookups or family
/// grouping need to pick the right document bucket / label key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunKind {
    PipelineRun,
    TaskRun,
}

impl RunKind {
    /// The owner-kind label that gives the family key used for history grouping.
    pub fn family_label_key(self) -> &'static str {
        match self {
            RunKind::PipelineRun => "tekton.dev/pipeline",
            RunKind::TaskRun => "tekton.dev/task",
        }
    }

    /// Lowercase label used in metrics and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::PipelineRun => "pipelinerun",
            RunKind::TaskRun => "taskrun",
        }
    }
}

/// A single resolvable policy field: ttl, successfulHistoryLimit, or failedHistoryLimit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Ttl,
    SuccessfulHistoryLimit,
    FailedHistoryLimit,
}

fn entry_field(entry: &ResourcePolicyEntry, field: Field) -> Option<i64> {
    match field {
        Field::Ttl => entry.ttl_seconds_after_finished,
        Field::SuccessfulHistoryLimit => entry.successful_history_limit,
        Field::FailedHistoryLimit => entry.failed_history_limit,
    }
}

/// The global configuration document: a YAML-shaped map with root
/// defaults and a `namespaces` tree.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    #[serde(default)]
    pub enforced_config_level: Option<EnforcedConfigLevel>,
    #[serde(default)]
    pub ttl_seconds_after_finished: Option<i64>,
    #[serde(default)]
    pub successful_history_limit: Option<i64>,
    #[serde(default)]
    pub failed_history_limit: Option<i64>,
    #[serde(default)]
    pub worker_count: Option<usize>,
    #[serde(default)]
    pub namespaces: HashMap<String, NamespaceDocument>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceDocument {
    #[serde(default)]
    pub enforced_config_level: Option<EnforcedConfigLevel>,
    #[serde(default)]
    pub ttl_seconds_after_finished: Option<i64>,
    #[serde(default)]
    pub successful_history_limit: Option<i64>,
    #[serde(default)]
    pub failed_history_limit: Option<i64>,
    #[serde(default)]
    pub pipeline_runs: Vec<ResourcePolicyEntry>,
    #[serde(default)]
    pub task_runs: Vec<ResourcePolicyEntry>,
}

impl NamespaceDocument {
    fn resources(&self, kind: RunKind) -> &[ResourcePolicyEntry] {
        match kind {
            RunKind::PipelineRun => &self.pipeline_runs,
            RunKind::TaskRun => &self.task_runs,
        }
    }
}

impl PrunerConfigSpec {
    fn resources(&self, kind: RunKind) -> &[ResourcePolicyEntry] {
        match kind {
            RunKind::PipelineRun => &self.pipeline_runs,
            RunKind::TaskRun => &self.task_runs,
        }
    }
}

struct StoreInner {
    document: PolicyDocument,
    namespace_overrides: HashMap<String, PrunerConfigSpec>,
    loaded_at: DateTime<Utc>,
}

/// Thread-safe holder for the effective policy tree: a reader-writer lock,
/// written only on config reload or namespace delete.
pub struct PolicyStore {
    inner: RwLock<StoreInner>,
}

impl PolicyStore {
    pub fn new(clock: &dyn Clock) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                document: PolicyDocument::default(),
                namespace_overrides: HashMap::new(),
                loaded_at: clock.now(),
            }),
        }
    }

    /// Replace the global document wholesale. Malformed YAML leaves the
    /// previous document untouched.
    pub fn load(&self, yaml: &str, clock: &dyn Clock) -> Result<(), PrunerError> {
        let document: PolicyDocument = serde_yaml::from_str(yaml)?;
        let mut guard = self.inner.write().expect("policy store lock poisoned");
        guard.document = document;
        guard.loaded_at = clock.now();
        Ok(())
    }

    /// Install or replace the per-namespace override CR for `namespace`.
    pub fn set_namespace_override(&self, namespace: &str, spec: PrunerConfigSpec) {
        let mut guard = self.inner.write().expect("policy store lock poisoned");
        guard.namespace_overrides.insert(namespace.to_string(), spec);
    }

    /// Clear a namespace's override CR and its entries under the global
    /// document's `namespaces` tree.
    pub fn remove_namespace(&self, namespace: &str) {
        let mut guard = self.inner.write().expect("policy store lock poisoned");
        guard.namespace_overrides.remove(namespace);
        guard.document.namespaces.remove(namespace);
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.inner.read().expect("policy store lock poisoned").loaded_at
    }

    pub fn worker_count(&self) -> usize {
        self.inner
            .read()
            .expect("policy store lock poisoned")
            .document
            .worker_count
            .unwrap_or(5)
    }

    /// Resolve `enforcedConfigLevel` via its fixed 6-step precedence order.
    pub fn enforced_config_level(&self, namespace: &str, kind: RunKind, name: &str) -> EnforcedConfigLevel {
        let guard = self.inner.read().expect("policy store lock poisoned");
        let ns_doc = guard.document.namespaces.get(namespace);
        let global_resource = ns_doc
            .and_then(|d| d.resources(kind).iter().find(|e| e.name == name))
            .and_then(|e| e.enforced_config_level);
        let global_ns_root = ns_doc.and_then(|d| d.enforced_config_level);
        let global_root = guard.document.enforced_config_level;
        let cr = guard.namespace_overrides.get(namespace);
        let ns_resource = cr
            .and_then(|c| c.resources(kind).iter().find(|e| e.name == name))
            .and_then(|e| e.enforced_config_level);
        let ns_root = cr.and_then(|c| c.enforced_config_level);

        global_resource
            .or(global_ns_root)
            .or(global_root)
            .or(ns_resource)
            .or(ns_root)
            .unwrap_or_default()
    }

    /// Resolve one field, honouring the `enforcedConfigLevel` cap and the
    /// Run's own annotation value (precedence tier ⓐ, supplied by the caller
    /// since the store never reads the Run object itself).
    pub fn resolve(
        &self,
        namespace: &str,
        kind: RunKind,
        name: &str,
        field: Field,
        annotation_override: Option<i64>,
    ) -> Option<i64> {
        let level = self.enforced_config_level(namespace, kind, name);
        if level == EnforcedConfigLevel::Resource {
            if let Some(v) = annotation_override {
                return Some(v);
            }
        }
        self.resolve_document(namespace, kind, name, field, level)
    }

    fn resolve_document(
        &self,
        namespace: &str,
        kind: RunKind,
        name: &str,
        field: Field,
        level: EnforcedConfigLevel,
    ) -> Option<i64> {
        let guard = self.inner.read().expect("policy store lock poisoned");
        let ns_doc = guard.document.namespaces.get(namespace);
        let global_ns_resource = ns_doc
            .and_then(|d| d.resources(kind).iter().find(|e| e.name == name))
            .and_then(|e| entry_field(e, field));
        let global_ns_root = ns_doc.and_then(|d| match field {
            Field::Ttl => d.ttl_seconds_after_finished,
            Field::SuccessfulHistoryLimit => d.successful_history_limit,
            Field::FailedHistoryLimit => d.failed_history_limit,
        });
        let global_root = match field {
            Field::Ttl => guard.document.ttl_seconds_after_finished,
            Field::SuccessfulHistoryLimit => guard.document.successful_history_limit,
            Field::FailedHistoryLimit => guard.document.failed_history_limit,
        };

        if level == EnforcedConfigLevel::Global {
            return global_ns_root.or(global_root);
        }

        let cr = guard.namespace_overrides.get(namespace);
        let ns_resource = cr
            .and_then(|c| c.resources(kind).iter().find(|e| e.name == name))
            .and_then(|e| entry_field(e, field));
        let ns_root = cr.and_then(|c| match field {
            Field::Ttl => c.ttl_seconds_after_finished,
            Field::SuccessfulHistoryLimit => c.successful_history_limit,
            Field::FailedHistoryLimit => c.failed_history_limit,
        });

        ns_resource
            .or(ns_root)
            .or(global_ns_resource)
            .or(global_ns_root)
            .or(global_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::TimeZone;

    fn store() -> (PolicyStore, FixedClock) {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let store = PolicyStore::new(&clock);
        (store, clock)
    }

    #[test]
    fn test_scenario_resource_ttl_beats_namespace_default() {
        let (store, clock) = store();
        let yaml = "ttlSecondsAfterFinished: 300\nnamespaces:\n  ns-1:\n    ttlSecondsAfterFinished: 120\n";
        store.load(yaml, &clock).unwrap();
        let v = store.resolve("ns-1", RunKind::PipelineRun, "pr-a", Field::Ttl, Some(60));
        assert_eq!(v, Some(60));
    }

    #[test]
    fn test_scenario_enforced_global_pin_ignores_annotation() {
        let (store, clock) = store();
        let yaml = "enforcedConfigLevel: global\nttlSecondsAfterFinished: 600\n";
        store.load(yaml, &clock).unwrap();
        let v = store.resolve("ns-1", RunKind::PipelineRun, "pr-a", Field::Ttl, Some(10));
        assert_eq!(v, Some(600));
    }

    #[test]
    fn test_unlimited_value_passes_through_as_negative_one() {
        let (store, clock) = store();
        let yaml = "successfulHistoryLimit: -1\n";
        store.load(yaml, &clock).unwrap();
        let v = store.resolve(
            "ns-1",
            RunKind::TaskRun,
            "tr-a",
            Field::SuccessfulHistoryLimit,
            None,
        );
        assert_eq!(v, Some(-1));
    }

    #[test]
    fn test_missing_field_resolves_to_none() {
        let (store, clock) = store();
        store.load("", &clock).unwrap();
        let v = store.resolve("ns-1", RunKind::PipelineRun, "pr-a", Field::Ttl, None);
        assert_eq!(v, None);
    }

    #[test]
    fn test_resolution_is_a_pure_function_of_inputs() {
        let (store, clock) = store();
        let yaml = "ttlSecondsAfterFinished: 60\nnamespaces:\n  ns-1:\n    pipelineRuns:\n      - name: pr-a\n        ttlSecondsAfterFinished: 10\n";
        store.load(yaml, &clock).unwrap();
        for _ in 0..5 {
            let v = store.resolve("ns-1", RunKind::PipelineRun, "pr-a", Field::Ttl, None);
            assert_eq!(v, Some(10));
        }
    }

    #[test]
    fn test_malformed_yaml_retains_previous_document() {
        let (store, clock) = store();
        store.load("ttlSecondsAfterFinished: 60\n", &clock).unwrap();
        let err = store.load("not: valid: yaml: [", &clock);
        assert!(err.is_err());
        let v = store.resolve("ns-1", RunKind::PipelineRun, "pr-a", Field::Ttl, None);
        assert_eq!(v, Some(60));
    }

    #[test]
    fn test_remove_namespace_clears_overrides_and_document_entries() {
        let (store, clock) = store();
        store
            .load("namespaces:\n  ns-1:\n    ttlSecondsAfterFinished: 30\n", &clock)
            .unwrap();
        store.set_namespace_override(
            "ns-1",
            PrunerConfigSpec {
                ttl_seconds_after_finished: Some(99),
                ..Default::default()
            },
        );
        assert_eq!(
            store.resolve("ns-1", RunKind::PipelineRun, "pr-a", Field::Ttl, None),
            Some(99)
        );
        store.remove_namespace("ns-1");
        assert_eq!(
            store.resolve("ns-1", RunKind::PipelineRun, "pr-a", Field::Ttl, None),
            None
        );
    }

    #[test]
    fn test_namespace_cap_allows_namespace_cr_but_not_annotation() {
        let (store, clock) = store();
        store
            .load("enforcedConfigLevel: namespace\n", &clock)
            .unwrap();
        store.set_namespace_override(
            "ns-1",
            PrunerConfigSpec {
                ttl_seconds_after_finished: Some(45),
                ..Default::default()
            },
        );
        let v = store.resolve("ns-1", RunKind::PipelineRun, "pr-a", Field::Ttl, Some(5));
        assert_eq!(v, Some(45));
    }

    #[test]
    fn test_worker_count_defaults_to_five() {
        let (store, clock) = store();
        store.load("", &clock).unwrap();
        assert_eq!(store.worker_count(), 5);
    }

    #[test]
    fn test_worker_count_honors_document() {
        let (store, clock) = store();
        store.load("workerCount: 8\n", &clock).unwrap();
        assert_eq!(store.worker_count(), 8);
    }

    #[test]
    fn test_family_label_keys() {
        assert_eq!(RunKind::PipelineRun.family_label_key(), "tekton.dev/pipeline");
        assert_eq!(RunKind::TaskRun.family_label_key(), "tekton.dev/task");
    }

    #[test]
    fn test_twelve_row_fixture_round_trip() {
        let (store, clock) = store();
        let yaml = "\
ttlSecondsAfterFinished: 300
successfulHistoryLimit: 5
failedHistoryLimit: 5
namespaces:
  ns-1:
    ttlSecondsAfterFinished: 120
    pipelineRuns:
      - name: pr-a
        ttlSecondsAfterFinished: 60
        successfulHistoryLimit: 2
    taskRuns:
      - name: tr-a
        failedHistoryLimit: 1
  ns-2:
    successfulHistoryLimit: 3
";
        store.load(yaml, &clock).unwrap();

        let cases = [
            ("ns-1", RunKind::PipelineRun, "pr-a", Field::Ttl, Some(60)),
            ("ns-1", RunKind::PipelineRun, "pr-a", Field::SuccessfulHistoryLimit, Some(2)),
            ("ns-1", RunKind::PipelineRun, "pr-a", Field::FailedHistoryLimit, Some(5)),
            ("ns-1", RunKind::PipelineRun, "pr-b", Field::Ttl, Some(120)),
            ("ns-1", RunKind::TaskRun, "tr-a", Field::FailedHistoryLimit, Some(1)),
            ("ns-1", RunKind::TaskRun, "tr-a", Field::Ttl, Some(120)),
            ("ns-1", RunKind::TaskRun, "tr-b", Field::SuccessfulHistoryLimit, Some(5)),
            ("ns-2", RunKind::PipelineRun, "pr-z", Field::SuccessfulHistoryLimit, Some(3)),
            ("ns-2", RunKind::PipelineRun, "pr-z", Field::Ttl, Some(300)),
            ("ns-3", RunKind::PipelineRun, "pr-z", Field::Ttl, Some(300)),
            ("ns-3", RunKind::TaskRun, "tr-z", Field::FailedHistoryLimit, Some(5)),
            ("ns-3", RunKind::TaskRun, "tr-z", Field::SuccessfulHistoryLimit, Some(5)),
        ];
        for (ns, kind, name, field, expected) in cases {
            assert_eq!(store.resolve(ns, kind, name, field, None), expected, "{ns}/{name}");
        }
    }
}
