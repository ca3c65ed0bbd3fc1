mod action;

use crate::{
    k8s::{
        self, annotations, labels::Map, policy::PolicyDefinition, Deployment, DeploymentSpec,
        LabelSelector, Labels, Pod, ResourceExt, Selector,
    },
    repository::Repository,
};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};

/// An in-memory cluster that applies patches and records every write.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    deployments: BTreeMap<(String, String), Deployment>,
    pods: BTreeMap<(String, String), Pod>,
    patches: Vec<(String, String, json_patch::Patch)>,
    updates: Vec<Deployment>,
    deleted_pods: Vec<(String, String)>,
    failures: usize,
}

// === impl FakeCluster ===

impl FakeCluster {
    pub fn add_deployment(&self, deployment: Deployment) {
        let key = (deployment.namespace().unwrap(), deployment.name_any());
        self.state.lock().deployments.insert(key, deployment);
    }

    pub fn add_pod(&self, pod: Pod) {
        let key = (pod.namespace().unwrap(), pod.name_any());
        self.state.lock().pods.insert(key, pod);
    }

    pub fn deployment(&self, ns: &str, name: &str) -> Deployment {
        self.state
            .lock()
            .deployments
            .get(&(ns.to_string(), name.to_string()))
            .cloned()
            .expect("deployment must exist")
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.state.lock().pods.values().map(|p| p.name_any()).collect()
    }

    pub fn patched(&self) -> Vec<String> {
        self.state
            .lock()
            .patches
            .iter()
            .map(|(ns, name, _)| format!("{ns}/{name}"))
            .collect()
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.state
            .lock()
            .deleted_pods
            .iter()
            .map(|(ns, name)| format!("{ns}/{name}"))
            .collect()
    }

    pub fn updated(&self) -> Vec<Deployment> {
        self.state.lock().updates.clone()
    }

    pub fn clear_history(&self) {
        let mut state = self.state.lock();
        state.patches.clear();
        state.updates.clear();
        state.deleted_pods.clear();
    }

    /// Fails the next `n` calls of any kind.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().failures = n;
    }

    fn check_failure(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.failures > 0 {
            state.failures -= 1;
            bail!("injected failure");
        }
        Ok(())
    }
}

fn in_scope(meta: &k8s::ObjectMeta, ns: Option<&str>, selector: &Selector) -> bool {
    ns.map_or(true, |ns| meta.namespace.as_deref() == Some(ns))
        && selector.matches(&Labels::from(meta.labels.clone()))
}

#[async_trait::async_trait]
impl Repository for FakeCluster {
    async fn list_deployments(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<Deployment>> {
        self.check_failure()?;
        Ok(self
            .state
            .lock()
            .deployments
            .values()
            .filter(|d| in_scope(&d.metadata, namespace, selector))
            .cloned()
            .collect())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        self.check_failure()?;
        match self
            .state
            .lock()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
        {
            Some(d) => Ok(d.clone()),
            None => bail!("deployment {namespace}/{name} not found"),
        }
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<()> {
        self.check_failure()?;
        let mut state = self.state.lock();
        let key = (namespace.to_string(), name.to_string());
        let Some(current) = state.deployments.get(&key) else {
            bail!("deployment {namespace}/{name} not found");
        };
        let mut doc = serde_json::to_value(current)?;
        json_patch::patch(&mut doc, &patch.0)?;
        state.deployments.insert(key, serde_json::from_value(doc)?);
        state
            .patches
            .push((namespace.to_string(), name.to_string(), patch));
        Ok(())
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.check_failure()?;
        let mut state = self.state.lock();
        let key = (deployment.namespace().unwrap(), deployment.name_any());
        if !state.deployments.contains_key(&key) {
            bail!("deployment {}/{} not found", key.0, key.1);
        }
        state.deployments.insert(key, deployment.clone());
        state.updates.push(deployment.clone());
        Ok(())
    }

    async fn list_pods(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<Pod>> {
        self.check_failure()?;
        Ok(self
            .state
            .lock()
            .pods
            .values()
            .filter(|p| in_scope(&p.metadata, namespace, selector))
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.check_failure()?;
        let mut state = self.state.lock();
        state
            .pods
            .remove(&(namespace.to_string(), name.to_string()));
        state
            .deleted_pods
            .push((namespace.to_string(), name.to_string()));
        Ok(())
    }
}

pub fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .finish(),
    )
}

pub fn labels<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Map {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A deployment labelled with, and selecting pods by, `pod_labels`.
pub fn mk_deployment(ns: &str, name: &str, pod_labels: Map) -> Deployment {
    Deployment {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels: Some(pod_labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(2),
            selector: LabelSelector {
                match_labels: Some(pod_labels),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn mk_pod(ns: &str, name: &str, pod_labels: Map) -> Pod {
    Pod {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels: Some(pod_labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn mk_injected_pod(ns: &str, name: &str, pod_labels: Map) -> Pod {
    let mut pod = mk_pod(ns, name, pod_labels);
    pod.metadata.annotations = Some(labels([(annotations::STATUS, annotations::STATUS_INJECTED)]));
    pod
}

pub fn mk_policy(ns: &str, name: &str, spec: serde_json::Value) -> PolicyDefinition {
    let mut policy = PolicyDefinition::new(
        name,
        serde_json::from_value(spec).expect("policy spec must parse"),
    );
    policy.metadata.namespace = Some(ns.to_string());
    policy.metadata.resource_version = Some("1".to_string());
    policy
}
