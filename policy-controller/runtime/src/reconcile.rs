//! Applies policies to the deployments they select.
//!
//! When a policy is applied, every selected deployment that is not yet
//! annotated is patched and its pods that lack the sidecar are deleted so that
//! they are recreated through the admission webhook. When a policy is deleted, the annotations are
//! removed and injected pods are deleted so that they come back without the
//! sidecar.

use crate::{
    core::workload,
    index::{ObjectKey, PolicyState, SharedIndex},
    k8s::{annotations, policy::PolicyDefinition, Deployment, Pod, ResourceExt, Selector},
    queue::Queue,
    repository::Repository,
};
use anyhow::Result;
use std::future::Future;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Failed keys are retried this many times before they are dropped.
pub const MAX_REQUEUES: u32 = 5;

pub struct Reconciler<R> {
    repo: R,
    index: SharedIndex,
    queue: Queue<ObjectKey>,
}

// === impl Reconciler ===

impl<R: Repository> Reconciler<R> {
    pub fn new(repo: R, index: SharedIndex, queue: Queue<ObjectKey>) -> Self {
        Self { repo, index, queue }
    }

    /// Processes queued policies until `shutdown` completes. A policy that is
    /// being processed when shutdown begins is finished first.
    pub async fn run(self, shutdown: impl Future + Send) {
        tokio::pin!(shutdown);
        loop {
            let key = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                key = self.queue.next() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            self.process(key.clone())
                .instrument(info_span!("policy", %key))
                .await;
        }
        self.queue.shutdown();
        info!("Reconciler stopped");
    }

    /// Reconciles a key taken from the queue and decides whether it is
    /// retried.
    pub async fn process(&self, key: ObjectKey) {
        match self.reconcile(&key).await {
            Ok(()) => self.queue.forget(&key),
            Err(error) => {
                let requeues = self.queue.requeues(&key);
                if requeues < MAX_REQUEUES {
                    warn!(%error, requeues, "Failed to reconcile policy; retrying");
                    self.queue.add_rate_limited(key.clone());
                } else {
                    error!(%error, "Failed to reconcile policy; dropping");
                    self.queue.forget(&key);
                    self.index.write().forget_deleted(&key);
                }
            }
        }
        self.queue.done(&key);
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let state = self.index.read().get(key);
        match state {
            Some(PolicyState::Live(policy)) => self.apply(&policy).await,
            Some(PolicyState::Deleted(policy)) => {
                self.cleanup(&policy).await?;
                self.index.write().forget_deleted(key);
                Ok(())
            }
            None => {
                debug!("Policy no longer exists");
                Ok(())
            }
        }
    }

    async fn apply(&self, policy: &PolicyDefinition) -> Result<()> {
        let spec = &policy.spec;
        let selector = spec.selector();
        let desired = spec.annotations();
        info!(%selector, "Applying policy");

        for ns in spec.namespaces() {
            let deployments = self.repo.list_deployments(Some(ns), selector).await?;
            debug!(namespace = %ns, deployments = deployments.len(), "Selected deployments");
            for deployment in deployments {
                let name = deployment.name_any();
                let Some(patch) = workload::annotate(&deployment.metadata, &desired) else {
                    debug!(namespace = %ns, deployment = %name, "Deployment already annotated");
                    continue;
                };
                self.repo.patch_deployment(ns, &name, patch).await?;
                info!(namespace = %ns, deployment = %name, "Annotated deployment");

                self.delete_pods(ns, &deployment, |pod| !is_injected(pod))
                    .await?;
            }
        }
        Ok(())
    }

    async fn cleanup(&self, policy: &PolicyDefinition) -> Result<()> {
        let spec = &policy.spec;
        let selector = spec.selector();
        info!(%selector, "Removing policy");

        for ns in spec.namespaces() {
            let deployments = self.repo.list_deployments(Some(ns), selector).await?;
            for deployment in deployments {
                let name = deployment.name_any();
                if let Some(patch) = workload::strip(&deployment.metadata) {
                    self.repo.patch_deployment(ns, &name, patch).await?;
                    info!(namespace = %ns, deployment = %name, "Removed policy annotations");
                }

                // Pods whose template asks for the sidecar would get it back.
                if template_requests_injection(&deployment) {
                    continue;
                }
                self.delete_pods(ns, &deployment, is_injected).await?;
            }
        }
        Ok(())
    }

    async fn delete_pods(
        &self,
        ns: &str,
        deployment: &Deployment,
        select: impl Fn(&Pod) -> bool,
    ) -> Result<()> {
        let Some(spec) = deployment.spec.as_ref() else {
            return Ok(());
        };
        let selector = Selector::from(&spec.selector);
        if selector.is_empty() {
            warn!(
                namespace = %ns,
                deployment = %deployment.name_any(),
                "Deployment has an empty pod selector"
            );
            return Ok(());
        }

        for pod in self.repo.list_pods(Some(ns), &selector).await? {
            if !select(&pod) {
                continue;
            }
            let name = pod.name_any();
            self.repo.delete_pod(ns, &name).await?;
            info!(namespace = %ns, pod = %name, "Deleted pod");
        }
        Ok(())
    }
}

fn is_injected(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .map(annotations::is_injected)
        .unwrap_or(false)
}

fn template_requests_injection(deployment: &Deployment) -> bool {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.annotations.as_ref())
        .map(annotations::requests_injection)
        .unwrap_or(false)
}
