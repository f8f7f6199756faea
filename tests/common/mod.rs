use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

use tekton_pruner_gc::crd::RunStatus;
use tekton_pruner_gc::error::PrunerError;
use tekton_pruner_gc::policy::RunKind;
use tekton_pruner_gc::resource::{DeleteOutcome, Run, RunAdapter};
use tokio_util::sync::CancellationToken;

fn succeeded_condition(successful: bool, at: DateTime<Utc>) -> Condition {
    Condition {
        type_: "Succeeded".to_string(),
        status: if successful { "True".to_string() } else { "False".to_string() },
        last_transition_time: Time(at),
        reason: String::new(),
        message: String::new(),
        observed_generation: None,
    }
}

/// Build a completed Run fixture: `completed_at` drives both the
/// `Succeeded` condition's transition time and `completion_time`.
pub fn make_run(namespace: &str, name: &str, family_key: &str, family_value: &str, completed_at: DateTime<Utc>, successful: bool) -> Run {
    let mut labels = BTreeMap::new();
    labels.insert(family_key.to_string(), family_value.to_string());
    Run {
        namespace: namespace.to_string(),
        name: name.to_string(),
        labels,
        annotations: BTreeMap::new(),
        owner_kinds: vec![],
        created_at: Some(completed_at),
        status: RunStatus {
            start_time: None,
            completion_time: Some(Time(completed_at)),
            conditions: Some(vec![succeeded_condition(successful, completed_at)]),
        },
    }
}

/// An in-memory `RunAdapter`, keyed by `(namespace, name)`, recording every
/// delete and annotation patch for assertion.
pub struct InMemoryAdapter {
    kind: RunKind,
    runs: Mutex<HashMap<(String, String), Run>>,
    deleted: Mutex<Vec<String>>,
    patched: Mutex<Vec<String>>,
}

impl InMemoryAdapter {
    pub fn new(kind: RunKind, runs: Vec<Run>) -> Self {
        let runs = runs.into_iter().map(|r| ((r.namespace.clone(), r.name.clone()), r)).collect();
        Self {
            kind,
            runs: Mutex::new(runs),
            deleted: Mutex::new(Vec::new()),
            patched: Mutex::new(Vec::new()),
        }
    }

    pub fn deleted_names(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn patched_names(&self) -> Vec<String> {
        self.patched.lock().unwrap().clone()
    }

    pub fn get_run(&self, namespace: &str, name: &str) -> Option<Run> {
        self.runs.lock().unwrap().get(&(namespace.to_string(), name.to_string())).cloned()
    }
}

#[async_trait]
impl RunAdapter for InMemoryAdapter {
    fn kind(&self) -> RunKind {
        self.kind
    }

    async fn list(&self, namespace: &str, label_selector: Option<&str>, _cancel: &CancellationToken) -> Result<Vec<Run>, PrunerError> {
        let runs = self.runs.lock().unwrap();
        let filtered = runs.values().filter(|r| r.namespace == namespace).filter(|r| match label_selector {
            None => true,
            Some(selector) => {
                let Some((key, value)) = selector.split_once('=') else { return true };
                r.labels.get(key).map(|v| v.as_str()) == Some(value)
            }
        });
        Ok(filtered.cloned().collect())
    }

    async fn get(&self, namespace: &str, name: &str, _cancel: &CancellationToken) -> Result<Option<Run>, PrunerError> {
        Ok(self.get_run(namespace, name))
    }

    async fn delete(&self, namespace: &str, name: &str, _cancel: &CancellationToken) -> Result<DeleteOutcome, PrunerError> {
        let existed = self.runs.lock().unwrap().remove(&(namespace.to_string(), name.to_string())).is_some();
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(if existed { DeleteOutcome::Deleted } else { DeleteOutcome::AlreadyGone })
    }

    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        removals: &[&str],
        additions: &BTreeMap<String, String>,
        _cancel: &CancellationToken,
    ) -> Result<(), PrunerError> {
        let mut runs = self.runs.lock().unwrap();
        if let Some(run) = runs.get_mut(&(namespace.to_string(), name.to_string())) {
            for key in removals {
                run.annotations.remove(*key);
            }
            for (key, value) in additions {
                run.annotations.insert(key.clone(), value.clone());
            }
        }
        self.patched.lock().unwrap().push(name.to_string());
        Ok(())
    }
}
